// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::sync::OnceLock;

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs the process-wide subscriber once. Returns whether this crate's
/// subscriber is active; a host application's subscriber wins silently.
pub fn init_tracing() -> bool {
    *INSTALLED.get_or_init(|| match spiral_config::tracing::init_tracing() {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "tracing subscriber not installed");
            false
        }
    })
}

/// Flushes the optional Chrome trace. Call before the process exits.
pub fn shutdown() {
    spiral_config::tracing::flush_chrome_trace();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialisation_is_idempotent() {
        let first = init_tracing();
        assert_eq!(init_tracing(), first);
        shutdown();
    }
}
