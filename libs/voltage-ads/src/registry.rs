//! Notification registry
//!
//! Maps stable subscription ids to their address, declared type and callback,
//! and the transport-side handle currently armed for each one. Lookups from
//! the dispatcher hold the lock only long enough to clone the target.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

use crate::types::{NotificationCallback, NotificationHandle, ProtocolType, SubscriptionId};

/// A registered notification subscription
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub address: String,
    pub value_type: ProtocolType,
    pub callback: NotificationCallback,
    /// Handle on the current connection; `None` while waiting to be re-armed
    pub transport_handle: Option<NotificationHandle>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("value_type", &self.value_type)
            .field("transport_handle", &self.transport_handle)
            .finish_non_exhaustive()
    }
}

/// Everything the dispatcher needs to deliver one sample
#[derive(Clone)]
pub struct DispatchTarget {
    pub id: SubscriptionId,
    pub address: String,
    pub value_type: ProtocolType,
    pub callback: NotificationCallback,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    by_id: HashMap<SubscriptionId, Subscription>,
    by_handle: HashMap<NotificationHandle, SubscriptionId>,
}

/// Thread-safe subscription table
#[derive(Default)]
pub struct NotificationRegistry {
    inner: Mutex<RegistryInner>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next stable id
    pub fn allocate_id(&self) -> SubscriptionId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        SubscriptionId(inner.next_id)
    }

    /// Record a subscription armed under `handle`
    pub fn insert(
        &self,
        id: SubscriptionId,
        address: &str,
        value_type: ProtocolType,
        callback: NotificationCallback,
        handle: NotificationHandle,
    ) {
        let mut inner = self.inner.lock();
        inner.by_handle.insert(handle, id);
        inner.by_id.insert(
            id,
            Subscription {
                id,
                address: address.to_string(),
                value_type,
                callback,
                transport_handle: Some(handle),
            },
        );
    }

    /// Remove one subscription, returning it
    pub fn remove(&self, id: SubscriptionId) -> Option<Subscription> {
        let mut inner = self.inner.lock();
        let sub = inner.by_id.remove(&id)?;
        if let Some(handle) = sub.transport_handle {
            inner.by_handle.remove(&handle);
        }
        Some(sub)
    }

    /// Remove every subscription
    pub fn drain(&self) -> Vec<Subscription> {
        let mut inner = self.inner.lock();
        inner.by_handle.clear();
        inner.by_id.drain().map(|(_, sub)| sub).collect()
    }

    /// Resolve a transport handle to its delivery target
    pub fn lookup(&self, handle: NotificationHandle) -> Option<DispatchTarget> {
        let inner = self.inner.lock();
        let id = inner.by_handle.get(&handle)?;
        inner.by_id.get(id).map(|sub| DispatchTarget {
            id: sub.id,
            address: sub.address.clone(),
            value_type: sub.value_type,
            callback: sub.callback.clone(),
        })
    }

    /// Forget all transport handles, keeping the subscriptions for re-arming
    ///
    /// Returns the handles that were armed so the caller can delete them on
    /// the old connection.
    pub fn detach_all(&self) -> Vec<NotificationHandle> {
        let mut inner = self.inner.lock();
        inner.by_handle.clear();
        inner
            .by_id
            .values_mut()
            .filter_map(|sub| sub.transport_handle.take())
            .collect()
    }

    /// Subscriptions currently waiting for a transport handle
    pub fn pending(&self) -> Vec<(SubscriptionId, String, ProtocolType)> {
        let inner = self.inner.lock();
        let mut pending: Vec<_> = inner
            .by_id
            .values()
            .filter(|sub| sub.transport_handle.is_none())
            .map(|sub| (sub.id, sub.address.clone(), sub.value_type))
            .collect();
        pending.sort_by_key(|(id, _, _)| *id);
        pending
    }

    /// Arm a pending subscription under a new handle
    ///
    /// Returns false if the subscription was removed in the meantime.
    pub fn attach(&self, id: SubscriptionId, handle: NotificationHandle) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(sub) = inner.by_id.get_mut(&id) else {
            return false;
        };
        if let Some(old) = sub.transport_handle.replace(handle) {
            inner.by_handle.remove(&old);
        }
        inner.by_handle.insert(handle, id);
        true
    }

    /// Registered and holding a handle on the current connection
    pub fn is_armed(&self, id: SubscriptionId) -> bool {
        self.inner
            .lock()
            .by_id
            .get(&id)
            .is_some_and(|sub| sub.transport_handle.is_some())
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.inner.lock().by_id.contains_key(&id)
    }

    /// Number of registered subscriptions
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscriptions armed on the current connection
    pub fn armed(&self) -> usize {
        self.inner.lock().by_handle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlcValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop() -> NotificationCallback {
        Arc::new(|_: &str, _: &PlcValue| {})
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = NotificationRegistry::new();
        let id = registry.allocate_id();
        registry.insert(id, "MAIN.bRun", ProtocolType::Bool, noop(), 42);

        let target = registry.lookup(42).unwrap();
        assert_eq!(target.id, id);
        assert_eq!(target.address, "MAIN.bRun");
        assert_eq!(target.value_type, ProtocolType::Bool);
        assert!(registry.lookup(43).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = NotificationRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_multiple_handles_per_address() {
        let registry = NotificationRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        registry.insert(a, "GVL.rTemp", ProtocolType::Real, noop(), 1);
        registry.insert(b, "GVL.rTemp", ProtocolType::Real, noop(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(1).unwrap().id, a);
        assert_eq!(registry.lookup(2).unwrap().id, b);
    }

    #[test]
    fn test_detach_then_reattach_keeps_ids() {
        let registry = NotificationRegistry::new();
        let id = registry.allocate_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let cb: NotificationCallback = Arc::new(move |_: &str, _: &PlcValue| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry.insert(id, "GVL.nCount", ProtocolType::Dint, cb, 5);

        let detached = registry.detach_all();
        assert_eq!(detached, vec![5]);
        assert!(registry.lookup(5).is_none());
        assert_eq!(registry.armed(), 0);
        assert_eq!(registry.pending(), vec![(id, "GVL.nCount".to_string(), ProtocolType::Dint)]);

        assert!(!registry.is_armed(id));
        assert!(registry.contains(id));

        assert!(registry.attach(id, 77));
        assert!(registry.is_armed(id));
        let target = registry.lookup(77).unwrap();
        assert_eq!(target.id, id);
        (target.callback)("GVL.nCount", &PlcValue::Integer(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn test_attach_removed_subscription() {
        let registry = NotificationRegistry::new();
        let id = registry.allocate_id();
        registry.insert(id, "A", ProtocolType::Bool, noop(), 1);
        registry.detach_all();
        registry.remove(id);
        assert!(!registry.attach(id, 2));
        assert!(registry.lookup(2).is_none());
    }

    #[test]
    fn test_remove_and_drain() {
        let registry = NotificationRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        registry.insert(a, "A", ProtocolType::Bool, noop(), 1);
        registry.insert(b, "B", ProtocolType::Int, noop(), 2);

        let removed = registry.remove(a).unwrap();
        assert_eq!(removed.transport_handle, Some(1));
        assert!(registry.lookup(1).is_none());

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.lookup(2).is_none());
    }
}
