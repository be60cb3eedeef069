//! In-memory exclusion sources feeding the address filter updater.
//!
//! Each source owns a `watch` channel so the updater is woken exactly when the source
//! changes. Mutations that leave the list unchanged do not notify subscribers.

use log::debug;
use tokio::sync::watch;

/// Broadcasters to skip for the rest of this session, typically ones that failed to relay a
/// transaction. Cleared when the user starts over.
pub struct SessionSkiplist {
    addresses: watch::Sender<Vec<String>>,
}

impl Default for SessionSkiplist {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSkiplist {
    pub fn new() -> Self {
        let (addresses, _) = watch::channel(Vec::new());
        Self { addresses }
    }

    pub fn add(&self, railgun_address: &str) {
        self.addresses.send_if_modified(|addresses| {
            if addresses.iter().any(|a| a == railgun_address) {
                return false;
            }
            debug!("skipping broadcaster for this session: {railgun_address}");
            addresses.push(railgun_address.to_string());
            true
        });
    }

    pub fn reset(&self) {
        self.addresses.send_if_modified(|addresses| {
            let changed = !addresses.is_empty();
            addresses.clear();
            changed
        });
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.addresses.subscribe()
    }
}

/// Blocklist delivered by the operator through remote config.
pub struct RemoteBlocklist {
    addresses: watch::Sender<Vec<String>>,
}

impl Default for RemoteBlocklist {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RemoteBlocklist {
    pub fn new(initial: Vec<String>) -> Self {
        let (addresses, _) = watch::channel(initial);
        Self { addresses }
    }

    /// Replaces the list, notifying subscribers only if it differs from the current one.
    pub fn replace(&self, new_addresses: Vec<String>) {
        self.addresses.send_if_modified(|addresses| {
            if *addresses == new_addresses {
                return false;
            }
            debug!("remote blocklist updated: {} entries", new_addresses.len());
            *addresses = new_addresses;
            true
        });
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.addresses.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skiplist_add_and_reset() {
        let skiplist = SessionSkiplist::new();
        let mut rx = skiplist.subscribe();

        skiplist.add("0zkA");
        skiplist.add("0zkA");
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), vec!["0zkA".to_string()]);

        skiplist.reset();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_empty());

        // resetting an empty list is not a change
        skiplist.reset();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_remote_blocklist_replace_notifies_on_change_only() {
        let remote = RemoteBlocklist::new(vec!["0zkA".to_string()]);
        let mut rx = remote.subscribe();

        remote.replace(vec!["0zkA".to_string()]);
        assert!(!rx.has_changed().unwrap());

        remote.replace(vec!["0zkB".to_string()]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), vec!["0zkB".to_string()]);
        assert_eq!(remote.addresses(), vec!["0zkB".to_string()]);
    }
}
