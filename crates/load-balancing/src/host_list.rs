//! Round-robin collection of replicas.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::host::Host;

/// The replicas reads may be sent to.
///
/// The set is held behind an `Arc` and replaced wholesale, so a caller that
/// is iterating an old set never sees a partially updated one.
#[derive(Debug, Default)]
pub struct HostList {
    current: RwLock<Arc<HostSet>>,
}

#[derive(Debug, Default)]
struct HostSet {
    hosts: Vec<Arc<Host>>,
    cursor: AtomicUsize,
}

impl HostList {
    /// Creates a list from `hosts`.
    pub fn new(hosts: Vec<Arc<Host>>) -> Self {
        Self {
            current: RwLock::new(Arc::new(HostSet {
                hosts,
                cursor: AtomicUsize::new(0),
            })),
        }
    }

    /// Returns the next online host after the last one returned.
    ///
    /// Returns `None` when the list is empty or every host is offline.
    pub async fn next(&self) -> Option<Arc<Host>> {
        let set = self.current.read().clone();
        let len = set.hosts.len();

        for _ in 0..len {
            let index = set.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let host = &set.hosts[index];
            if host.online().await {
                return Some(host.clone());
            }
        }

        None
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.current.read().hosts.len()
    }

    /// Returns true if there are no hosts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses of all hosts, in list order.
    pub fn host_names(&self) -> Vec<String> {
        self.current
            .read()
            .hosts
            .iter()
            .map(|h| h.address().to_string())
            .collect()
    }

    /// The current hosts.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.current.read().hosts.clone()
    }

    /// Atomically replaces the hosts, returning the previous ones.
    pub fn replace(&self, hosts: Vec<Arc<Host>>) -> Vec<Arc<Host>> {
        let new_set = Arc::new(HostSet {
            hosts,
            cursor: AtomicUsize::new(0),
        });
        let old = std::mem::replace(&mut *self.current.write(), new_set);
        old.hosts.clone()
    }
}
