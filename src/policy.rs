//! Result-handling policies, made explicit at the call site.
//!
//! Critical-path calls (pull, trip start/end, stop transitions) stay plain
//! `Result` and bubble with `?`. Best-effort calls (push-phase records,
//! location pings, heartbeats) go through [`best_effort`], which logs the
//! failure and swallows it so the caller's flow is never interrupted.

use tracing::warn;

/// Runs a best-effort outcome to ground: the value on success, a warn-level
/// log entry on failure. The returned error is the already-logged message,
/// safe to record or discard; it must not be propagated as a failure.
pub fn best_effort<T>(what: &str, result: anyhow::Result<T>) -> Result<T, String> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            let msg = format!("{:#}", e);
            warn!("{} failed (best-effort): {}", what, msg);
            Err(msg)
        }
    }
}
