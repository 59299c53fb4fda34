// config.rs — Generator options
//
// Tunables that shape generated code without changing its semantics:
// which symbolic dimensions are global constants visible to device code,
// the width of the optional-argument flag word, reduction chunking, and
// the fixed grid sizes used for direct loops.
//
// Preconditions: none.
// Postconditions: `GenOptions::default()` reproduces the stock runtime's policy.
// Failure modes: `from_json_file` reports unreadable or malformed files.
// Side effects: `from_json_file` reads one file.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenOptions {
    /// Identifiers that device code can see as module constants. A symbolic
    /// dimension built only from these is rendered verbatim instead of being
    /// passed as a runtime parameter. Compared case-insensitively.
    pub global_constants: Vec<String>,
    /// Number of usable bits in the optional-argument flag word.
    pub optional_flag_bits: u32,
    /// Components reduced per call for vector reductions (bounds shared memory).
    pub reduction_chunk: u32,
    /// Grid size for direct loops.
    pub direct_blocks: u32,
    /// Grid size for direct loops that need the unknown-size reduction scratch.
    pub scratch_blocks: u32,
}

impl Default for GenOptions {
    fn default() -> Self {
        GenOptions {
            global_constants: vec!["NPDE".into(), "DNTQMU".into(), "DNFCROW".into()],
            optional_flag_bits: 32,
            reduction_chunk: 8,
            direct_blocks: 600,
            scratch_blocks: 100,
        }
    }
}

impl GenOptions {
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
    }

    /// Whether `name` is one of the configured global constants.
    pub fn is_global_constant(&self, name: &str) -> bool {
        self.global_constants
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
    }
}
