//! Load-mode resolution
//!
//! `stream` and `full` are used as requested. `auto` probes the locator size:
//! strictly below `FULL_LOAD_THRESHOLD_BYTES` resolves to `full`, anything at
//! or above it to `stream`. A failed probe, an unsupported response or a
//! missing size all fall back to `stream`; the caller never sees the failure.

use crate::transport::Transport;
use mixdeck_common::LoadMode;

/// Resources smaller than this are decoded into memory in `auto` mode
pub const FULL_LOAD_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Concrete mode for a probed size
pub fn mode_for_size(size: Option<u64>) -> LoadMode {
    match size {
        Some(bytes) if bytes < FULL_LOAD_THRESHOLD_BYTES => LoadMode::Full,
        _ => LoadMode::Stream,
    }
}

/// Resolve `requested` into `Stream` or `Full`
pub async fn resolve_load_mode(
    transport: &dyn Transport,
    locator: &str,
    requested: LoadMode,
    silent: bool,
) -> LoadMode {
    if requested != LoadMode::Auto {
        return requested;
    }

    match transport.probe_size(locator).await {
        Ok(size) => {
            let mode = mode_for_size(size);
            diag!(silent, debug, "Auto load mode for {}: size={:?} -> {}", locator, size, mode);
            mode
        }
        Err(e) => {
            diag!(silent, warn, "Size probe failed for {}, streaming instead: {}", locator, e);
            LoadMode::Stream
        }
    }
}
