//! Lifecycle of long-running services.

/// A service driven by its host through three lifecycle hooks.
///
/// All hooks return immediately. Work they trigger runs in the background on the current tokio
/// runtime, so they must be called from within one.
pub trait Service: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Starts background work. Calling it on a started service has no effect.
    fn start(&self);

    /// Cancels background work. A stopped service cannot be restarted.
    fn stop(&self);

    /// Called once the host finished loading the project.
    fn loaded(&self) {}
}
