use crate::menu::ClickCallback;
use once_cell::sync::Lazy;
use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// Identity of a native callback target: the address of the record or slot that
/// native code hands back to the trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrampolineKey(usize);

impl TrampolineKey {
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> usize {
        self.0
    }
}

impl fmt::LowerHex for TrampolineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Heap slot whose address serves as a trampoline key for libraries that take
/// an opaque `data` pointer instead of handing back a record.
#[derive(Debug)]
pub struct CallbackSlot(NonNull<u8>);

impl CallbackSlot {
    pub fn new() -> Self {
        Self(NonNull::from(Box::leak(Box::new(0u8))))
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr().cast()
    }

    pub fn key(&self) -> TrampolineKey {
        TrampolineKey::from_ptr(self.as_ptr())
    }
}

impl Default for CallbackSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.0.as_ptr())) };
    }
}

unsafe impl Send for CallbackSlot {}

/// One launch of a runtime. Every start gets a fresh id so an abandoned loop
/// thread can only ever release its own generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation {
    pub instance: InstanceId,
    pub seq: u64,
}

/// Everything one installed menu/tray generation needs to stay valid: closures
/// keyed by trampoline key plus the allocations native code points into.
#[derive(Default)]
pub struct RetainedSet {
    callbacks: Vec<(TrampolineKey, ClickCallback)>,
    keepalive: Vec<Box<dyn Any + Send>>,
}

impl RetainedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: TrampolineKey, callback: ClickCallback) {
        self.callbacks.push((key, callback));
    }

    pub fn keep<T: Send + 'static>(&mut self, value: T) {
        self.keepalive.push(Box::new(value));
    }

    pub fn keys(&self) -> impl Iterator<Item = TrampolineKey> + '_ {
        self.callbacks.iter().map(|(k, _)| *k)
    }

    pub fn merge(&mut self, other: RetainedSet) {
        self.callbacks.extend(other.callbacks);
        self.keepalive.extend(other.keepalive);
    }
}

impl fmt::Debug for RetainedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetainedSet")
            .field("callbacks", &self.callbacks.len())
            .field("keepalive", &self.keepalive.len())
            .finish()
    }
}

/// Process-wide owner of every closure and record native code can reach.
#[derive(Default)]
pub struct CallbackRetentionTable {
    callbacks: RwLock<HashMap<TrampolineKey, ClickCallback>>,
    sets: Mutex<HashMap<Generation, RetainedSet>>,
}

impl CallbackRetentionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&self, generation: Generation, set: RetainedSet) {
        {
            let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
            for (key, callback) in &set.callbacks {
                callbacks.insert(*key, callback.clone());
            }
        }
        let previous = self
            .sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(generation, set);
        if previous.is_some() {
            log::warn!("Generation {:?} retained twice", generation);
        }
    }

    /// Drops one generation. Returns false when it was not retained.
    pub fn release(&self, generation: Generation) -> bool {
        let removed = self
            .sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&generation);
        match removed {
            Some(set) => {
                self.forget(&set);
                drop(set);
                true
            }
            None => false,
        }
    }

    /// Drops every generation of one launch. Returns how many were released.
    pub fn release_instance(&self, instance: InstanceId) -> usize {
        let removed: Vec<RetainedSet> = {
            let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
            let generations: Vec<Generation> =
                sets.keys().filter(|g| g.instance == instance).copied().collect();
            generations.iter().filter_map(|g| sets.remove(g)).collect()
        };
        for set in &removed {
            self.forget(set);
        }
        removed.len()
    }

    pub fn resolve(&self, key: TrampolineKey) -> Option<ClickCallback> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    pub fn contains(&self, key: TrampolineKey) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    pub fn generations(&self, instance: InstanceId) -> Vec<Generation> {
        let sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut generations: Vec<Generation> =
            sets.keys().filter(|g| g.instance == instance).copied().collect();
        generations.sort_by_key(|g| g.seq);
        generations
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn forget(&self, set: &RetainedSet) {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        for (key, callback) in &set.callbacks {
            // Only remove the entry if it still belongs to this set; an address can be
            // reused by a later generation once the old allocation is gone.
            if callbacks.get(key).is_some_and(|c| std::sync::Arc::ptr_eq(c, callback)) {
                callbacks.remove(key);
            }
        }
    }
}

static GLOBAL: Lazy<CallbackRetentionTable> = Lazy::new(CallbackRetentionTable::new);

pub fn global() -> &'static CallbackRetentionTable {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counter_callback(hits: &Arc<AtomicUsize>) -> ClickCallback {
        let hits = hits.clone();
        Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn retain_then_resolve() {
        let table = CallbackRetentionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let generation = Generation { instance: InstanceId::next(), seq: 0 };
        let mut set = RetainedSet::new();
        set.register(TrampolineKey::from_addr(0x1000), counter_callback(&hits));

        table.retain(generation, set);
        (table.resolve(TrampolineKey::from_addr(0x1000)).unwrap())();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(table.resolve(TrampolineKey::from_addr(0x2000)).is_none());
    }

    #[test]
    fn release_drops_keepalive_and_keys() {
        let table = CallbackRetentionTable::new();
        let marker = Arc::new(());
        let generation = Generation { instance: InstanceId::next(), seq: 0 };
        let mut set = RetainedSet::new();
        set.register(TrampolineKey::from_addr(0x10), Arc::new(|| {}));
        set.keep(marker.clone());

        table.retain(generation, set);
        assert_eq!(Arc::strong_count(&marker), 2);

        assert!(table.release(generation));
        assert!(!table.release(generation));
        assert_eq!(Arc::strong_count(&marker), 1);
        assert!(!table.contains(TrampolineKey::from_addr(0x10)));
    }

    #[test]
    fn reused_key_survives_release_of_older_generation() {
        let table = CallbackRetentionTable::new();
        let instance = InstanceId::next();
        let old = Generation { instance, seq: 0 };
        let new = Generation { instance, seq: 1 };
        let key = TrampolineKey::from_addr(0x40);
        let mut first = RetainedSet::new();
        first.register(key, Arc::new(|| {}));
        let mut second = RetainedSet::new();
        second.register(key, Arc::new(|| {}));

        table.retain(old, first);
        table.retain(new, second);
        table.release(old);

        assert!(table.contains(key));
    }

    #[test]
    fn release_instance_leaves_other_instances() {
        let table = CallbackRetentionTable::new();
        let a = InstanceId::next();
        let b = InstanceId::next();
        let cases = [(a, 0, 0x100), (a, 1, 0x200), (b, 0, 0x300)];
        for (instance, seq, addr) in cases {
            let mut set = RetainedSet::new();
            set.register(TrampolineKey::from_addr(addr), Arc::new(|| {}));
            table.retain(Generation { instance, seq }, set);
        }

        let released = table.release_instance(a);

        assert_eq!(released, 2);
        assert!(table.generations(a).is_empty());
        assert_eq!(table.generations(b).len(), 1);
        assert!(table.contains(TrampolineKey::from_addr(0x300)));
        assert_eq!(table.callback_count(), 1);
    }
}
