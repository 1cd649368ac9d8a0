// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node-local knobs the agreement core consumes. Everything else the node
/// is configured with lives with the orchestrating binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Size target in bytes for the local protocol trace file. The trace
    /// rotates once it passes this size; 0 disables tracing entirely.
    pub cadaver_size_target: u64,

    /// Base path of the protocol trace; `.cdv` and `.cdv.archive` are
    /// appended. Tracing is also disabled when unset.
    pub cadaver_path: Option<PathBuf>,

    /// Emit per-round block assembly metrics.
    pub enable_assemble_stats: bool,
}
