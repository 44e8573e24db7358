/// Connectivity as known by the host. Generation short-circuits with
/// `NetworkUnavailable` when this reports offline.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Used when the host has no connectivity signal; every call is attempted.
pub struct AssumeOnline;

impl NetworkMonitor for AssumeOnline {
    fn is_online(&self) -> bool {
        true
    }
}
