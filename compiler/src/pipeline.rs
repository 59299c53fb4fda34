// pipeline.rs — Generation session and pass orchestration
//
// A `Session` is the per-run context: generator options, the loop names
// already generated and the next kernel index for timing registration.
// Each loop runs the minimal set of passes for the requested terminal
// pass and collects the artifacts into `LoopArtifacts`.
//
// Preconditions: none.
// Postconditions: on success the loop name is recorded and the kernel index
//                 advanced; on failure the session is unchanged.
// Failure modes: the first error diagnostic of any pass stops the loop.
// Side effects: debug logging of per-pass timing.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use crate::body::{self, KernelBody};
use crate::codegen::{self, GeneratedModule, Sections};
use crate::config::GenOptions;
use crate::descriptor::KernelDescriptor;
use crate::diag::{codes, Diagnostic};
use crate::emit::Emitter;
use crate::host;
use crate::kernel;
use crate::layout::{self, LoopLayout};
use crate::pass::{descriptor, required_passes, PassId};
use crate::reduction;

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata stamped on every generated module.
///
/// `descriptor_fingerprint`: SHA-256 of `KernelDescriptor::canonical_json()`.
/// `body_hash`: SHA-256 of the raw body text (empty text when absent).
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub descriptor_fingerprint: [u8; 32],
    pub body_hash: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn descriptor_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.descriptor_fingerprint)
    }

    pub fn body_hash_hex(&self) -> String {
        bytes_to_hex(&self.body_hash)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self, loop_name: &str) -> String {
        format!(
            "{{\n  \"loop\": \"{}\",\n  \"descriptor_fingerprint\": \"{}\",\n  \"body_hash\": \"{}\",\n  \"compiler_version\": \"{}\"\n}}\n",
            loop_name,
            self.descriptor_fingerprint_hex(),
            self.body_hash_hex(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(text: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from a descriptor and its body text.
///
/// The fingerprint uses the compact canonical JSON so formatting of the
/// input file does not change it.
pub fn compute_provenance(desc: &KernelDescriptor, body_text: &str) -> Provenance {
    Provenance {
        descriptor_fingerprint: sha256(&desc.canonical_json()),
        body_hash: sha256(body_text),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Artifacts ──────────────────────────────────────────────────────────────

/// Everything produced for one loop. Fields are populated for the passes
/// that ran; the rest stay `None`.
#[derive(Debug, Clone)]
pub struct LoopArtifacts {
    pub loop_name: String,
    /// Index passed to `setKernelTime`, 0-based in generation order.
    pub kernel_index: u32,
    pub provenance: Provenance,
    pub body: Option<KernelBody>,
    pub layout: Option<LoopLayout>,
    pub device_body: Option<String>,
    pub reductions: Option<String>,
    pub kernel: Option<String>,
    pub host: Option<String>,
    pub module: Option<GeneratedModule>,
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Generation of one loop failed.
#[derive(Debug, Clone)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
    pub diagnostic: Diagnostic,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in pass {})", self.diagnostic, descriptor(self.failing_pass).name)
    }
}

impl std::error::Error for PipelineError {}

fn finish_pass<T>(
    pass_id: PassId,
    loop_name: &str,
    started: Instant,
    result: Result<T, Diagnostic>,
) -> Result<T, PipelineError> {
    let elapsed: Duration = started.elapsed();
    log::debug!(
        "opgen: {} {} complete, {:.1}ms",
        loop_name,
        descriptor(pass_id).name,
        elapsed.as_secs_f64() * 1000.0
    );
    result.map_err(|diagnostic| PipelineError {
        failing_pass: pass_id,
        diagnostic,
    })
}

// ── Session ────────────────────────────────────────────────────────────────

/// Per-run generation context.
#[derive(Debug, Default)]
pub struct Session {
    options: GenOptions,
    /// Lower-cased names; Fortran identifiers are case-insensitive.
    seen: HashSet<String>,
    next_kernel: u32,
}

impl Session {
    pub fn new(options: GenOptions) -> Self {
        Session {
            options,
            seen: HashSet::new(),
            next_kernel: 0,
        }
    }

    pub fn options(&self) -> &GenOptions {
        &self.options
    }

    /// Number of loops generated so far.
    pub fn generated(&self) -> u32 {
        self.next_kernel
    }

    /// Run the passes needed for `terminal` on one loop.
    ///
    /// Preconditions: none (the descriptor is validated here).
    /// Postconditions: artifacts for all passes in `required_passes(terminal)`
    ///   are populated.
    /// Failure modes: E0009 for a repeated loop name, E0012 when the body
    ///   is needed and absent, plus every pass's own diagnostics.
    /// Side effects: records the loop name and consumes a kernel index on
    ///   success.
    pub fn generate(
        &mut self,
        desc: &KernelDescriptor,
        body_text: Option<&str>,
        terminal: PassId,
    ) -> Result<LoopArtifacts, PipelineError> {
        let key = desc.name.to_lowercase();
        if self.seen.contains(&key) {
            return Err(PipelineError {
                failing_pass: PassId::Validate,
                diagnostic: Diagnostic::error(
                    codes::E0009,
                    &desc.name,
                    "loop was already generated in this session",
                ),
            });
        }

        let kernel_index = self.next_kernel;
        let mut out = LoopArtifacts {
            loop_name: desc.name.clone(),
            kernel_index,
            provenance: compute_provenance(desc, body_text.unwrap_or("")),
            body: None,
            layout: None,
            device_body: None,
            reductions: None,
            kernel: None,
            host: None,
            module: None,
        };

        for pass_id in required_passes(terminal) {
            let t = Instant::now();
            match pass_id {
                PassId::Validate => {
                    let result = validate(desc, body_text);
                    out.body = finish_pass(pass_id, &desc.name, t, result)?;
                }
                PassId::Plan => {
                    // Without a body the layout assumes a self-contained one.
                    let calls = out.body.as_ref().is_some_and(|b| b.calls_routines);
                    let result = layout::plan(desc, &self.options, calls);
                    out.layout = Some(finish_pass(pass_id, &desc.name, t, result)?);
                }
                PassId::RewriteBody => {
                    let result = match (&out.body, &out.layout) {
                        (Some(b), Some(l)) => b.rewrite_for_device(
                            &desc.name,
                            &kernel::body_name(desc),
                            &codegen::soa_rewrites(l),
                        ),
                        _ => Err(missing_body(desc)),
                    };
                    out.device_body = Some(finish_pass(pass_id, &desc.name, t, result)?);
                }
                PassId::Reductions => {
                    let text = out.layout.as_ref().map(|l| {
                        let mut e = Emitter::new();
                        reduction::emit_routines(&mut e, l);
                        e.finish()
                    });
                    out.reductions = finish_pass(pass_id, &desc.name, t, Ok(text))?;
                }
                PassId::Kernel => {
                    let text = out.layout.as_ref().map(|l| {
                        let mut e = Emitter::new();
                        kernel::emit_kernel(&mut e, desc, l, &self.options);
                        e.finish()
                    });
                    out.kernel = finish_pass(pass_id, &desc.name, t, Ok(text))?;
                }
                PassId::HostStub => {
                    let text = out.layout.as_ref().map(|l| {
                        let mut e = Emitter::new();
                        host::emit_host(&mut e, desc, l, &self.options, kernel_index);
                        e.finish()
                    });
                    out.host = finish_pass(pass_id, &desc.name, t, Ok(text))?;
                }
                PassId::Assemble => {
                    let module = out.layout.as_ref().map(|l| {
                        let sections = Sections {
                            reductions: out.reductions.as_deref().unwrap_or(""),
                            device_body: out.device_body.as_deref().unwrap_or(""),
                            kernel: out.kernel.as_deref().unwrap_or(""),
                            host: out.host.as_deref().unwrap_or(""),
                        };
                        codegen::assemble(desc, l, sections, &out.provenance)
                    });
                    out.module = finish_pass(pass_id, &desc.name, t, Ok(module))?;
                }
            }
        }

        self.seen.insert(key);
        self.next_kernel += 1;
        Ok(out)
    }
}

fn validate(desc: &KernelDescriptor, body_text: Option<&str>) -> Result<Option<KernelBody>, Diagnostic> {
    desc.validate()?;
    let Some(text) = body_text else {
        return Ok(None);
    };
    let body = body::scan(&desc.name, text)?;
    body.check(&desc.name, desc.args.len())?;
    Ok(Some(body))
}

fn missing_body(desc: &KernelDescriptor) -> Diagnostic {
    Diagnostic::error(codes::E0012, &desc.name, "no kernel body was supplied")
        .with_hint(format!("provide {}.inc in the body directory", desc.name))
}

// ── Tests ──────────────────────────────────────────────────────────────────
