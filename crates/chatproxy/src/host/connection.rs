//! Host-side handle to a worker connection.

use std::sync::Mutex;

use crate::bridge::protocol::ConnectionId;

/// What the transport needs to (re)create the worker-side connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectSpec {
    pub service_id: String,
    pub options: serde_json::Value,
}

impl ConnectSpec {
    pub fn new(service_id: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            service_id: service_id.into(),
            options,
        }
    }
}

#[derive(Debug, Default)]
struct Binding {
    current: Option<ConnectionId>,
    last: Option<ConnectionId>,
}

/// Local object bound to a worker-side connection id.
///
/// Unbinding keeps the last id as the target so a handle without a
/// [`ConnectSpec`] keeps addressing it.
#[derive(Debug, Default)]
pub struct ConnectionHandle {
    binding: Mutex<Binding>,
    spec: Option<ConnectSpec>,
    /// Serializes reconnects so concurrent senders bind at most once.
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spec(spec: ConnectSpec) -> Self {
        Self {
            spec: Some(spec),
            ..Self::default()
        }
    }

    pub fn spec(&self) -> Option<&ConnectSpec> {
        self.spec.as_ref()
    }

    /// Bind to a worker connection.
    ///
    /// # Panics
    ///
    /// Panics if the handle is already bound.
    pub fn bind(&self, id: ConnectionId) {
        let mut binding = self.lock();
        assert!(
            binding.current.is_none(),
            "connection handle is already bound to {:?}",
            binding.current
        );
        binding.current = Some(id);
        binding.last = Some(id);
    }

    /// Mark the handle disconnected. Returns the id it was bound to.
    pub fn unbind(&self) -> Option<ConnectionId> {
        self.lock().current.take()
    }

    /// Unbind only if still bound to `id`. A concurrent sender may already
    /// have replaced a stale binding; that newer binding stays.
    pub fn unbind_if(&self, id: ConnectionId) -> bool {
        let mut binding = self.lock();
        if binding.current == Some(id) {
            binding.current = None;
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.lock().current
    }

    /// Id to put on the wire: the bound id, else the last one bound.
    pub fn target(&self) -> Option<ConnectionId> {
        let binding = self.lock();
        binding.current.or(binding.last)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Binding> {
        // Binding has no invariants a panic could break.
        self.binding.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_unbind_toggles_connected() {
        let handle = ConnectionHandle::new();
        let id = ConnectionId::new();
        assert!(!handle.is_connected());
        assert_eq!(handle.target(), None);

        handle.bind(id);
        assert!(handle.is_connected());
        assert_eq!(handle.connection_id(), Some(id));

        assert_eq!(handle.unbind(), Some(id));
        assert!(!handle.is_connected());
        assert_eq!(handle.target(), Some(id));

        let next = ConnectionId::new();
        handle.bind(next);
        assert_eq!(handle.target(), Some(next));
    }

    #[test]
    fn unbind_if_keeps_newer_binding() {
        let handle = ConnectionHandle::new();
        let stale = ConnectionId::new();
        let fresh = ConnectionId::new();
        handle.bind(stale);
        assert!(handle.unbind_if(stale));
        handle.bind(fresh);

        assert!(!handle.unbind_if(stale));
        assert_eq!(handle.connection_id(), Some(fresh));
        assert!(handle.unbind_if(fresh));
        assert!(!handle.is_connected());
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn double_bind_panics() {
        let handle = ConnectionHandle::new();
        handle.bind(ConnectionId::new());
        handle.bind(ConnectionId::new());
    }
}
