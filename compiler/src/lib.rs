// opgen — CUDA Fortran kernel generation for unstructured-mesh parallel loops
//
// Library root. One module per generation pass plus the shared models.

pub mod body;
pub mod codegen;
pub mod config;
pub mod descriptor;
pub mod diag;
pub mod dim;
pub mod emit;
pub mod host;
pub mod id;
pub mod kernel;
pub mod layout;
pub mod lexer;
pub mod pass;
pub mod pipeline;
pub mod reduction;
