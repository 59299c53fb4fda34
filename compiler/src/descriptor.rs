// descriptor.rs — Per-loop argument model
//
// The front end describes each parallel loop once: its iteration set, the
// ordered arguments with their access pattern, and any indirection through
// connectivity maps. Descriptors are read-only to every generation pass.
//
// Preconditions: none.
// Postconditions: `validate` accepts only descriptors every later pass can
//                 render without further checks on kinds and access modes.
// Failure modes: invalid access/kind/type combinations, zero dimensions and
//                empty loops produce error diagnostics.
// Side effects: none.

use serde::{Deserialize, Serialize};

use crate::diag::{codes, Diagnostic};
use crate::dim::Dim;

// ── Access and kind ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Access {
    Read,
    Write,
    Rw,
    Inc,
    Min,
    Max,
}

impl Access {
    /// Global accumulators combined across elements by a commutative operator.
    pub fn reduction_op(self) -> Option<ReductionOp> {
        match self {
            Access::Inc => Some(ReductionOp::Sum),
            Access::Min => Some(ReductionOp::Min),
            Access::Max => Some(ReductionOp::Max),
            Access::Read | Access::Write | Access::Rw => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "READ",
            Access::Write => "WRITE",
            Access::Rw => "RW",
            Access::Inc => "INC",
            Access::Min => "MIN",
            Access::Max => "MAX",
        }
    }
}

/// Operator applied by the block-level and host-side reductions. The device
/// routines receive it as a runtime code instead of being duplicated per operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionOp {
    Sum,
    Min,
    Max,
}

impl ReductionOp {
    pub fn code(self) -> u32 {
        match self {
            ReductionOp::Sum => 0,
            ReductionOp::Min => 1,
            ReductionOp::Max => 2,
        }
    }
}

/// Connectivity used by an indirect argument: the map and the column read
/// for each element (0-based).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapRef {
    pub map: String,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum ArgKind {
    /// Indexed by the current element.
    Direct,
    /// Loop-invariant value or accumulator.
    Global,
    /// Indexed through a map.
    Indirect(MapRef),
}

// ── Data types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "real(8)", alias = "REAL(kind=8)", alias = "double")]
    Real8,
    #[serde(rename = "real(4)", alias = "REAL(kind=4)", alias = "float")]
    Real4,
    #[serde(rename = "integer(4)", alias = "INTEGER(kind=4)", alias = "int")]
    Int4,
    #[serde(rename = "logical", alias = "LOGICAL")]
    Logical,
}

impl DataType {
    pub fn fortran(self) -> &'static str {
        match self {
            DataType::Real8 => "REAL(kind=8)",
            DataType::Real4 => "REAL(kind=4)",
            DataType::Int4 => "INTEGER(kind=4)",
            DataType::Logical => "LOGICAL",
        }
    }

    /// Suffix of the block reduction routines for this type; `None` when
    /// the type cannot be reduced.
    pub fn reduction_suffix(self) -> Option<&'static str> {
        match self {
            DataType::Real8 => Some("Float8"),
            DataType::Real4 => Some("Float4"),
            DataType::Int4 => Some("Int4"),
            DataType::Logical => None,
        }
    }

    /// Cross-rank combinator provided by the runtime.
    pub fn mpi_reduce(self) -> &'static str {
        match self {
            DataType::Real8 => "op_mpi_reduce_double",
            DataType::Real4 => "op_mpi_reduce_float",
            DataType::Int4 => "op_mpi_reduce_int",
            DataType::Logical => "op_mpi_reduce_bool",
        }
    }

    pub fn zero(self) -> &'static str {
        match self {
            DataType::Real8 => "0.0_8",
            DataType::Real4 => "0.0_4",
            DataType::Int4 => "0",
            DataType::Logical => ".FALSE.",
        }
    }
}

// ── Descriptors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentDescriptor {
    /// Dataset (or global variable) name. Indirect arguments sharing a
    /// dataset and map form one group.
    pub dataset: String,
    #[serde(flatten)]
    pub kind: ArgKind,
    pub access: Access,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub dim: Dim,
    /// Column-major storage across the whole set.
    #[serde(default, rename = "soa")]
    pub structure_of_arrays: bool,
    /// Gated at run time by a bit in the caller's flag word.
    #[serde(default)]
    pub optional: bool,
}

impl ArgumentDescriptor {
    pub fn is_direct(&self) -> bool {
        matches!(self.kind, ArgKind::Direct)
    }

    pub fn is_global(&self) -> bool {
        matches!(self.kind, ArgKind::Global)
    }

    pub fn map_ref(&self) -> Option<&MapRef> {
        match &self.kind {
            ArgKind::Indirect(m) => Some(m),
            _ => None,
        }
    }

    /// Indirect argument with a raceable write pattern.
    pub fn is_indirect_update(&self) -> bool {
        self.map_ref().is_some() && matches!(self.access, Access::Inc | Access::Rw)
    }

    /// Global argument combined across blocks.
    pub fn reduction_op(&self) -> Option<ReductionOp> {
        if self.is_global() {
            self.access.reduction_op()
        } else {
            None
        }
    }

    /// The per-element body sees this argument through stride addressing.
    /// Never applies to `INC` indirect arguments (they accumulate into a
    /// contiguous local) or to globals.
    pub fn effective_soa(&self) -> bool {
        self.structure_of_arrays
            && !self.is_global()
            && !(self.map_ref().is_some() && self.access == Access::Inc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub name: String,
    /// Iteration set identity.
    pub set: String,
    pub args: Vec<ArgumentDescriptor>,
    /// The plan offers within-block element reordering.
    #[serde(default)]
    pub reorder: bool,
}

/// One distinct (dataset, map) pair used by indirect arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndirectDataset {
    pub dataset: String,
    pub map: String,
    /// Index of the first argument using this pair.
    pub representative: usize,
}

impl KernelDescriptor {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Parse a descriptor file. Malformed JSON, including a bad dimension
    /// expression, is E0004.
    pub fn parse(text: &str) -> Result<Self, Diagnostic> {
        Self::from_json(text).map_err(|e| {
            Diagnostic::error(codes::E0004, "<descriptor>", e.to_string())
                .with_hint("dimensions are positive integers or expressions over named constants")
        })
    }

    /// Compact JSON with fields in declaration order; stable across runs.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_indirect(&self) -> bool {
        self.args.iter().any(|a| a.map_ref().is_some())
    }

    /// Distinct indirect (dataset, map) pairs in first-seen order.
    pub fn indirect_datasets(&self) -> Vec<IndirectDataset> {
        let mut out: Vec<IndirectDataset> = Vec::new();
        for (i, arg) in self.args.iter().enumerate() {
            if let Some(m) = arg.map_ref() {
                if !out
                    .iter()
                    .any(|d| d.dataset == arg.dataset && d.map == m.map)
                {
                    out.push(IndirectDataset {
                        dataset: arg.dataset.clone(),
                        map: m.map.clone(),
                        representative: i,
                    });
                }
            }
        }
        out
    }

    /// Check kind/access/type combinations the synthesizers rely on.
    pub fn validate(&self) -> Result<(), Diagnostic> {
        if self.name.trim().is_empty() {
            return Err(Diagnostic::error(codes::E0011, "<unnamed>", "loop has no name"));
        }
        if self.args.is_empty() {
            return Err(Diagnostic::error(
                codes::E0011,
                &self.name,
                "loop has no arguments",
            ));
        }
        for (i, arg) in self.args.iter().enumerate() {
            if arg.dim.fixed() == Some(0) {
                return Err(Diagnostic::error(codes::E0010, &self.name, "dimension is zero")
                    .with_arg(i));
            }
            match (&arg.kind, arg.access) {
                (ArgKind::Global, Access::Rw) => {
                    return Err(invalid_access(&self.name, i, arg)
                        .with_hint("globals are READ, WRITE, INC, MIN or MAX"));
                }
                (ArgKind::Direct | ArgKind::Indirect(_), Access::Min | Access::Max) => {
                    return Err(invalid_access(&self.name, i, arg)
                        .with_hint("MIN and MAX are global reductions"));
                }
                _ => {}
            }
            // LOGICAL has no arithmetic, so no argument kind may accumulate it.
            let accumulates = matches!(arg.access, Access::Inc | Access::Min | Access::Max);
            if accumulates && arg.data_type == DataType::Logical {
                return Err(Diagnostic::error(
                    codes::E0007,
                    &self.name,
                    format!(
                        "{} reduction is not defined for {}",
                        arg.access.as_str(),
                        arg.data_type.fortran()
                    ),
                )
                .with_arg(i));
            }
        }
        Ok(())
    }
}

fn invalid_access(loop_name: &str, i: usize, arg: &ArgumentDescriptor) -> Diagnostic {
    let kind = match arg.kind {
        ArgKind::Direct => "direct",
        ArgKind::Global => "global",
        ArgKind::Indirect(_) => "indirect",
    };
    Diagnostic::error(
        codes::E0007,
        loop_name,
        format!("{} access is not allowed on a {} argument", arg.access.as_str(), kind),
    )
    .with_arg(i)
}
