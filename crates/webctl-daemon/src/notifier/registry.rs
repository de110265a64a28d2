//! Notifier maps keyed by (descriptor, kind).

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, error};

use super::{Descriptor, Dispatch, NotifierCallback, NotifierKind, SocketNotifier};
use crate::sync::lock;

struct Entry {
    notifier: SocketNotifier,
    generation: u64,
    /// A delivery was posted to the owning session and has not run yet.
    in_flight: bool,
}

#[derive(Default)]
struct Maps {
    read: HashMap<Descriptor, Entry>,
    write: HashMap<Descriptor, Entry>,
    exception: HashMap<Descriptor, Entry>,
    /// Bumped on every add and remove.
    version: u64,
}

impl Maps {
    fn map(&self, kind: NotifierKind) -> &HashMap<Descriptor, Entry> {
        match kind {
            NotifierKind::Read => &self.read,
            NotifierKind::Write => &self.write,
            NotifierKind::Exception => &self.exception,
        }
    }

    fn map_mut(&mut self, kind: NotifierKind) -> &mut HashMap<Descriptor, Entry> {
        match kind {
            NotifierKind::Read => &mut self.read,
            NotifierKind::Write => &mut self.write,
            NotifierKind::Exception => &mut self.exception,
        }
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.read
            .values()
            .chain(self.write.values())
            .chain(self.exception.values())
    }
}

/// Snapshot of a registered notifier, taken under the notifier lock.
#[derive(Clone)]
pub struct Registered {
    pub callback: NotifierCallback,
    pub session_id: Option<String>,
    pub generation: u64,
}

/// Registry of socket notifiers.
///
/// The maps sit behind their own lock. Callbacks never run while it is held,
/// so a callback may add or remove notifiers, including its own.
#[derive(Default)]
pub struct NotifierRegistry {
    maps: Mutex<Maps>,
    changed: Notify,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notifier, replacing any entry for the same pair.
    ///
    /// Returns the generation assigned to the new entry.
    pub fn add(&self, notifier: SocketNotifier) -> u64 {
        let descriptor = notifier.descriptor();
        let kind = notifier.kind();
        let generation = {
            let mut maps = lock(&self.maps);
            maps.version += 1;
            let generation = maps.version;
            maps.map_mut(kind).insert(
                descriptor,
                Entry {
                    notifier,
                    generation,
                    in_flight: false,
                },
            );
            generation
        };
        debug!(descriptor, %kind, generation, "Socket notifier added");
        self.changed.notify_one();
        generation
    }

    /// Remove the entry for a pair. Returns whether one was registered.
    pub fn remove(&self, descriptor: Descriptor, kind: NotifierKind) -> bool {
        let removed = {
            let mut maps = lock(&self.maps);
            let removed = maps.map_mut(kind).remove(&descriptor).is_some();
            if removed {
                maps.version += 1;
            }
            removed
        };
        if removed {
            debug!(descriptor, %kind, "Socket notifier removed");
            self.changed.notify_one();
        }
        removed
    }

    /// Remove the entry only if it still carries `generation`.
    pub fn remove_if_generation(
        &self,
        descriptor: Descriptor,
        kind: NotifierKind,
        generation: u64,
    ) -> bool {
        let removed = {
            let mut maps = lock(&self.maps);
            let map = maps.map_mut(kind);
            let current = map
                .get(&descriptor)
                .is_some_and(|e| e.generation == generation);
            if current {
                map.remove(&descriptor);
                maps.version += 1;
            }
            current
        };
        if removed {
            debug!(descriptor, %kind, generation, "Socket notifier removed");
            self.changed.notify_one();
        }
        removed
    }

    pub fn lookup(&self, descriptor: Descriptor, kind: NotifierKind) -> Option<Registered> {
        let maps = lock(&self.maps);
        maps.map(kind).get(&descriptor).map(|e| Registered {
            callback: e.notifier.callback(),
            session_id: e.notifier.session_id().map(String::from),
            generation: e.generation,
        })
    }

    /// Whether the pair is still registered with `generation`.
    pub fn is_current(&self, descriptor: Descriptor, kind: NotifierKind, generation: u64) -> bool {
        lock(&self.maps)
            .map(kind)
            .get(&descriptor)
            .is_some_and(|e| e.generation == generation)
    }

    /// Invoke the callback registered for a pair, with the lock released.
    ///
    /// A panicking callback is contained and its entry removed.
    pub fn select(&self, descriptor: Descriptor, kind: NotifierKind) -> Dispatch {
        let Some(registered) = self.lookup(descriptor, kind) else {
            return Dispatch::NotRegistered;
        };

        let callback = registered.callback;
        if catch_unwind(AssertUnwindSafe(|| callback(descriptor, kind))).is_err() {
            error!(descriptor, %kind, "Socket notifier callback panicked");
            self.remove_if_generation(descriptor, kind, registered.generation);
        }

        if self.is_current(descriptor, kind, registered.generation) {
            Dispatch::Delivered
        } else {
            Dispatch::Stale
        }
    }

    /// Mark a posted delivery as pending. Returns `false` if one already is,
    /// or if the entry no longer carries `generation`.
    pub fn begin_delivery(
        &self,
        descriptor: Descriptor,
        kind: NotifierKind,
        generation: u64,
    ) -> bool {
        let mut maps = lock(&self.maps);
        match maps.map_mut(kind).get_mut(&descriptor) {
            Some(e) if e.generation == generation && !e.in_flight => {
                e.in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Clear a pending delivery so the descriptor is polled again.
    pub fn end_delivery(&self, descriptor: Descriptor, kind: NotifierKind, generation: u64) {
        let cleared = {
            let mut maps = lock(&self.maps);
            match maps.map_mut(kind).get_mut(&descriptor) {
                Some(e) if e.generation == generation && e.in_flight => {
                    e.in_flight = false;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.changed.notify_one();
        }
    }

    /// Counter bumped by every registration change.
    pub fn version(&self) -> u64 {
        lock(&self.maps).version
    }

    /// Wait for the next registration change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Snapshot of the descriptors the run loop polls.
    #[cfg(unix)]
    pub fn poll_set(&self) -> super::PollSet {
        let maps = lock(&self.maps);
        let sources = maps
            .entries()
            .filter(|e| !e.in_flight)
            .filter_map(|e| {
                e.notifier
                    .source()
                    .map(|src| (e.notifier.descriptor(), e.notifier.kind(), src))
            })
            .collect();
        super::PollSet::new(maps.version, sources)
    }

    pub fn len(&self) -> usize {
        lock(&self.maps).entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        {
            let mut maps = lock(&self.maps);
            maps.read.clear();
            maps.write.clear();
            maps.exception.clear();
            maps.version += 1;
        }
        self.changed.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn(Descriptor, NotifierKind) + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn select_unregistered() {
        let registry = NotifierRegistry::new();
        assert_eq!(registry.select(3, NotifierKind::Read), Dispatch::NotRegistered);
    }

    #[test]
    fn select_invokes_callback() {
        let registry = NotifierRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.add(SocketNotifier::new(3, NotifierKind::Read, counting(&calls)));

        assert_eq!(registry.select(3, NotifierKind::Read), Dispatch::Delivered);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Kinds are independent maps.
        assert_eq!(registry.select(3, NotifierKind::Write), Dispatch::NotRegistered);
    }

    #[test]
    fn add_then_remove_never_fires() {
        let registry = NotifierRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.add(SocketNotifier::new(4, NotifierKind::Write, counting(&calls)));
        assert!(registry.remove(4, NotifierKind::Write));
        assert!(!registry.remove(4, NotifierKind::Write));

        assert_eq!(registry.select(4, NotifierKind::Write), Dispatch::NotRegistered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn self_removal_is_stale() {
        let registry = Arc::new(NotifierRegistry::new());
        let inner = Arc::clone(&registry);
        registry.add(SocketNotifier::new(5, NotifierKind::Read, move |d, k| {
            inner.remove(d, k);
        }));

        assert_eq!(registry.select(5, NotifierKind::Read), Dispatch::Stale);
        assert!(registry.is_empty());
    }

    #[test]
    fn replacement_is_stale() {
        let registry = Arc::new(NotifierRegistry::new());
        let inner = Arc::clone(&registry);
        registry.add(SocketNotifier::new(6, NotifierKind::Read, move |d, k| {
            inner.add(SocketNotifier::new(d, k, |_, _| {}));
        }));

        assert_eq!(registry.select(6, NotifierKind::Read), Dispatch::Stale);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn generations_distinguish_replacements() {
        let registry = NotifierRegistry::new();
        let first = registry.add(SocketNotifier::new(7, NotifierKind::Exception, |_, _| {}));
        let second = registry.add(SocketNotifier::new(7, NotifierKind::Exception, |_, _| {}));
        assert_ne!(first, second);
        assert!(!registry.remove_if_generation(7, NotifierKind::Exception, first));
        assert!(registry.is_current(7, NotifierKind::Exception, second));
        assert!(registry.remove_if_generation(7, NotifierKind::Exception, second));
    }

    #[test]
    fn panicking_callback_is_removed() {
        let registry = NotifierRegistry::new();
        registry.add(SocketNotifier::new(8, NotifierKind::Read, |_, _| panic!("boom")));
        assert_eq!(registry.select(8, NotifierKind::Read), Dispatch::Stale);
        assert!(registry.is_empty());
    }

    #[test]
    fn one_pending_delivery_per_entry() {
        let registry = NotifierRegistry::new();
        let generation = registry.add(SocketNotifier::new(11, NotifierKind::Read, |_, _| {}));
        assert!(registry.begin_delivery(11, NotifierKind::Read, generation));
        assert!(!registry.begin_delivery(11, NotifierKind::Read, generation));
        registry.end_delivery(11, NotifierKind::Read, generation);
        assert!(registry.begin_delivery(11, NotifierKind::Read, generation));
        assert!(!registry.begin_delivery(11, NotifierKind::Read, generation + 1));
    }

    #[test]
    fn version_tracks_changes() {
        let registry = NotifierRegistry::new();
        let v0 = registry.version();
        registry.add(SocketNotifier::new(9, NotifierKind::Read, |_, _| {}));
        let v1 = registry.version();
        assert!(v1 > v0);
        registry.remove(10, NotifierKind::Read);
        assert_eq!(registry.version(), v1);
    }
}
