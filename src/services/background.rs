use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackgroundTaskId(pub u64);

pub type ExpirationHandler = Box<dyn FnOnce() + Send + 'static>;

/// Grants bounded extra run time while the host app is suspended.
pub trait BackgroundTaskProvider: Send + Sync {
    /// `on_expire` fires at most once, when the granted time runs out.
    fn begin(&self, name: &str, on_expire: ExpirationHandler) -> BackgroundTaskId;
    fn end(&self, id: BackgroundTaskId);

    /// Keeps the device from idling (screen lock) while long work runs.
    fn set_idle_prevention(&self, _enabled: bool) {}
}

/// Holds a background task and an idle-prevention hold for its lifetime.
/// Both are released exactly once, when the guard is dropped.
pub struct BackgroundTaskGuard {
    provider: Arc<dyn BackgroundTaskProvider>,
    id: BackgroundTaskId,
}

impl BackgroundTaskGuard {
    pub fn acquire(
        provider: Arc<dyn BackgroundTaskProvider>,
        name: &str,
        on_expire: ExpirationHandler,
    ) -> Self {
        let id = provider.begin(name, on_expire);
        provider.set_idle_prevention(true);
        debug!("Background task {:?} ({}) started", id, name);
        Self { provider, id }
    }

    pub fn id(&self) -> BackgroundTaskId {
        self.id
    }
}

impl Drop for BackgroundTaskGuard {
    fn drop(&mut self) {
        self.provider.set_idle_prevention(false);
        self.provider.end(self.id);
        debug!("Background task {:?} ended", self.id);
    }
}

/// Provider for hosts that never suspend the process (desktop, CLI).
#[derive(Default)]
pub struct NoSuspension {
    next_id: AtomicU64,
}

impl BackgroundTaskProvider for NoSuspension {
    fn begin(&self, _name: &str, _on_expire: ExpirationHandler) -> BackgroundTaskId {
        BackgroundTaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn end(&self, _id: BackgroundTaskId) {}
}
