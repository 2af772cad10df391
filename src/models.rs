//! Shared data types passed between the cache, the runner and the HTTP layer.

use std::collections::BTreeMap;

/// Output files collected from one run, keyed by requested output name.
///
/// Contents are opaque to the gateway. A `BTreeMap` keeps iteration
/// order stable so responses are deterministic.
pub type OutputFiles = BTreeMap<String, Vec<u8>>;

/// Total payload size of a set of output files.
pub fn total_bytes(outputs: &OutputFiles) -> usize {
    outputs.values().map(Vec::len).sum()
}
