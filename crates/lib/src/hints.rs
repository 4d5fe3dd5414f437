//! Non-fatal advisory channel.
//!
//! Fatal conditions abort a build through error returns. Observations about
//! suboptimal configuration (a redundant `chdir`, say) go through this
//! capability instead and never stop a build. Components receive the sink at
//! construction so callers can swap in their own.

use tracing::info;

/// Sink for non-fatal advisories.
pub trait Hints: Send + Sync {
    /// Report an advisory together with a pointer into the documentation.
    fn hint(&self, message: &str, documentation: &str);
}

/// Default sink: routes advisories through `tracing` at info level.
pub struct LogHints;

impl Hints for LogHints {
    fn hint(&self, message: &str, documentation: &str) {
        info!(target: "kiln::hint", documentation, "{}", message);
    }
}
