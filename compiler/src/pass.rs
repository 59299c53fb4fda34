// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the generator's passes, their dependency edges, and the
// artifacts they produce. The session uses this to run the minimal pass
// subset for each `--emit` target (a layout needs neither kernel nor host
// text).

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Validate,
    Plan,
    RewriteBody,
    Reductions,
    Kernel,
    HostStub,
    Assemble,
}

/// Machine-readable artifact identifiers. Each maps to a field of
/// `LoopArtifacts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Body,         // KernelBody
    Layout,       // LoopLayout
    DeviceBody,   // String
    ReductionSrc, // String
    KernelSrc,    // String
    HostSrc,      // String
    Module,       // GeneratedModule
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a generation pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[],
            outputs: &[ArtifactId::Body],
            invalidation_key: "descriptor + body text",
            invariants: "access/kind/type combinations legal, body spans well-formed",
        },
        PassId::Plan => PassDescriptor {
            name: "plan",
            inputs: &[PassId::Validate],
            outputs: &[ArtifactId::Layout],
            invalidation_key: "descriptor + options + body calls",
            invariants: "every argument realised exactly once, ids in argument order",
        },
        PassId::RewriteBody => PassDescriptor {
            name: "rewrite_body",
            inputs: &[PassId::Plan],
            outputs: &[ArtifactId::DeviceBody],
            invalidation_key: "body + layout",
            invariants: "stride-addressed formals rank-reduced once, all uses in macro form",
        },
        PassId::Reductions => PassDescriptor {
            name: "reductions",
            inputs: &[PassId::Plan],
            outputs: &[ArtifactId::ReductionSrc],
            invalidation_key: "layout reductions",
            invariants: "one routine per needed (type, rank)",
        },
        PassId::Kernel => PassDescriptor {
            name: "kernel",
            inputs: &[PassId::Plan],
            outputs: &[ArtifactId::KernelSrc],
            invalidation_key: "descriptor + layout + options",
            invariants: "indirect writes only between their colour's barriers",
        },
        PassId::HostStub => PassDescriptor {
            name: "host_stub",
            inputs: &[PassId::Kernel],
            outputs: &[ArtifactId::HostSrc],
            invalidation_key: "descriptor + layout + options + kernel index",
            invariants: "launch matches kernel formals, combine after device sync",
        },
        PassId::Assemble => PassDescriptor {
            name: "assemble",
            inputs: &[
                PassId::RewriteBody,
                PassId::Reductions,
                PassId::Kernel,
                PassId::HostStub,
            ],
            outputs: &[ArtifactId::Module],
            invalidation_key: "all section texts + provenance",
            invariants: "one module per loop",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 7] = [
    PassId::Validate,
    PassId::Plan,
    PassId::RewriteBody,
    PassId::Reductions,
    PassId::Kernel,
    PassId::HostStub,
    PassId::Assemble,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
