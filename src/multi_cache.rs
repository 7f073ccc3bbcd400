//! LRU container keyed by stack id, with a shared, resizable capacity.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{TileError, TileResult};

type Subscriber = Box<dyn Fn(usize) + Send + Sync>;

struct PolicyInner {
    size: RwLock<usize>,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Capacity shared by several [`MultiCache`]s.
///
/// Resizing notifies every subscriber synchronously so that eviction
/// happens at resize time rather than on the next insert.
#[derive(Clone)]
pub struct CachePolicy {
    inner: Arc<PolicyInner>,
}

impl CachePolicy {
    pub fn new(size: usize) -> TileResult<Self> {
        Self::validate(size)?;
        Ok(Self {
            inner: Arc::new(PolicyInner {
                size: RwLock::new(size),
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    fn validate(size: usize) -> TileResult<()> {
        if size == 0 {
            return Err(TileError::Configuration(
                "cache size must be a positive integer".into(),
            ));
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        *self.inner.size.read()
    }

    pub fn set_size(&self, size: usize) -> TileResult<()> {
        Self::validate(size)?;
        *self.inner.size.write() = size;
        for subscriber in self.inner.subscribers.lock().iter() {
            subscriber(size);
        }
        Ok(())
    }

    /// Register a callback invoked with the new capacity on every resize.
    ///
    /// Callbacks run with the subscriber list locked and must not subscribe.
    pub fn subscribe(&self, f: impl Fn(usize) + Send + Sync + 'static) {
        self.inner.subscribers.lock().push(Box::new(f));
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy").field("size", &self.size()).finish()
    }
}

type EvictFn<K, V> = Box<dyn FnMut(&K, V) + Send>;

/// Insertion/touch ordered map from key to a per-key value, bounded by a
/// [`CachePolicy`].
///
/// The front of the map is the least recently used entry. Only `add` and
/// `touch` change recency; reads do not.
pub struct MultiCache<K, V> {
    entries: IndexMap<K, V>,
    policy: CachePolicy,
    on_evict: Option<EvictFn<K, V>>,
}

impl<K, V> MultiCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Default,
{
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: IndexMap::new(),
            policy,
            on_evict: None,
        }
    }

    /// Call `f` with every entry dropped by eviction.
    pub fn set_on_evict(&mut self, f: impl FnMut(&K, V) + Send + 'static) {
        self.on_evict = Some(Box::new(f));
    }

    /// Insert `uid` as most recently used with an empty value, then evict
    /// down to capacity.
    pub fn add(&mut self, uid: K) -> TileResult<()> {
        if self.entries.contains_key(&uid) {
            return Err(TileError::DuplicateKey(format!("{uid:?}")));
        }
        self.entries.insert(uid, V::default());
        self.enforce_capacity();
        Ok(())
    }

    /// Promote `uid` to most recently used. No-op for absent keys.
    pub fn touch(&mut self, uid: &K) {
        if let Some(index) = self.entries.get_index_of(uid) {
            let last = self.entries.len() - 1;
            self.entries.move_index(index, last);
        }
    }

    /// Evict least recently used entries until the map fits the policy.
    pub fn enforce_capacity(&mut self) {
        let capacity = self.policy.size();
        while self.entries.len() > capacity {
            let Some((key, value)) = self.entries.shift_remove_index(0) else {
                break;
            };
            if let Some(on_evict) = self.on_evict.as_mut() {
                on_evict(&key, value);
            }
        }
    }

    pub fn get(&self, uid: &K) -> Option<&V> {
        self.entries.get(uid)
    }

    pub fn get_mut(&mut self, uid: &K) -> Option<&mut V> {
        self.entries.get_mut(uid)
    }

    pub fn contains(&self, uid: &K) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }
}
