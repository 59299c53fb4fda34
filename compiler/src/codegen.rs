// codegen.rs — Module assembly for one parallel loop
//
// Stitches the synthesized sections into a single CUDA Fortran module:
// provenance header, module preamble and shared state, the SoA addressing
// macro (only when some body access is stride-rewritten), then the
// reduction routines, the device body, the kernel and the host stub.
//
// Preconditions: every section was rendered from the same descriptor and
//                layout.
// Postconditions: `GeneratedModule::text` ends with `END MODULE`.
// Failure modes: none.
// Side effects: none.

use crate::body::SoaRewrite;
use crate::descriptor::KernelDescriptor;
use crate::emit::Emitter;
use crate::host;
use crate::layout::{LoopLayout, Realisation};
use crate::pipeline::Provenance;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedModule {
    /// Fortran module name (`<NAME>_MODULE`).
    pub name: String,
    pub file_name: String,
    pub text: String,
}

/// Rendered pieces that go after `CONTAINS`, in emission order.
#[derive(Debug, Clone, Copy)]
pub struct Sections<'a> {
    pub reductions: &'a str,
    pub device_body: &'a str,
    pub kernel: &'a str,
    pub host: &'a str,
}

const MODULE_USES: [&str; 6] = [
    "OP2_CONSTANTS",
    "OP2_FORTRAN_DECLARATIONS",
    "OP2_FORTRAN_RT_SUPPORT",
    "ISO_C_BINDING",
    "CUDAFOR",
    "CUDACONFIGURATIONPARAMS",
];

pub const SOA_MACRO: &str = "#define OP2_SOA(var,dim,stride) var((dim-1)*stride+1)";

pub fn module_name(desc: &KernelDescriptor) -> String {
    format!("{}_MODULE", desc.name.to_uppercase())
}

pub fn file_name(desc: &KernelDescriptor) -> String {
    format!("{}_kernel.CUF", desc.name)
}

/// Body formals the device body addresses with strides, with their stride.
pub fn soa_rewrites(layout: &LoopLayout) -> Vec<SoaRewrite> {
    layout
        .args
        .iter()
        .filter(|a| a.realisation == Realisation::StrideRewrite)
        .filter_map(|a| {
            a.stride.as_ref().map(|stride| SoaRewrite {
                formal: a.index,
                stride: stride.clone(),
            })
        })
        .collect()
}

// ── Assembly ────────────────────────────────────────────────────────────────

pub fn assemble(
    desc: &KernelDescriptor,
    layout: &LoopLayout,
    sections: Sections<'_>,
    provenance: &Provenance,
) -> GeneratedModule {
    let name = module_name(desc);
    let mut e = Emitter::new();

    e.comment(format!(
        "Generated by opgen {} for loop {}",
        provenance.compiler_version, desc.name
    ));
    e.comment(format!("descriptor sha256 {}", provenance.descriptor_fingerprint_hex()));
    e.comment(format!("body sha256 {}", provenance.body_hash_hex()));
    e.blank();

    e.line(format!("MODULE {}", name));
    for u in MODULE_USES {
        e.line(format!("USE {}", u));
    }
    e.blank();
    host::emit_module_state(&mut e, desc, layout);
    e.blank();
    if !soa_rewrites(layout).is_empty() {
        e.raw(SOA_MACRO);
        e.blank();
    }
    e.line("CONTAINS");
    e.blank();

    for section in [sections.reductions, sections.device_body, sections.kernel, sections.host] {
        if section.trim().is_empty() {
            continue;
        }
        e.raw(section);
        e.blank();
    }
    e.line(format!("END MODULE {}", name));

    GeneratedModule {
        name,
        file_name: file_name(desc),
        text: e.finish(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
