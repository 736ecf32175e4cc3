use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;

type Factory<K, V> = Box<dyn Fn(&K, &Pool<K, V>) -> V>;

struct Inner<K, V> {
    items: RefCell<IndexMap<K, V>>,
    factory: Factory<K, V>,
}

/// Lazily populated, insertion-ordered map of shared handles.
///
/// The factory runs the first time a key is requested and never again for
/// that key, unless the entry is explicitly removed. Clones share contents.
pub struct Pool<K, V> {
    inner: Rc<Inner<K, V>>,
}

impl<K, V> Clone for Pool<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Pool<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// The factory receives the key and the pool itself.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&K, &Pool<K, V>) -> V + 'static,
    {
        Self {
            inner: Rc::new(Inner {
                items: RefCell::new(IndexMap::new()),
                factory: Box::new(factory),
            }),
        }
    }

    /// Item for `key`, creating it on first use.
    pub fn get(&self, key: &K) -> V {
        if let Some(item) = self.inner.items.borrow().get(key) {
            return item.clone();
        }

        // No borrow held here: factories may consult the pool.
        let item = (self.inner.factory)(key, self);

        // A factory that re-entered for the same key already stored one.
        if let Some(existing) = self.inner.items.borrow().get(key) {
            return existing.clone();
        }

        self.insert(key.clone(), item.clone());
        item
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.items.borrow().contains_key(key)
    }

    /// Store `item` under `key`, replacing whatever was there. A replaced
    /// entry keeps its position.
    pub fn insert(&self, key: K, item: V) {
        self.inner.items.borrow_mut().insert(key, item);
    }

    /// Drop the entry for `key` so the next `get` rebuilds it.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.items.borrow_mut().shift_remove(key)
    }

    pub fn clear(&self) {
        self.inner.items.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in the order they were first created.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.inner
            .items
            .borrow()
            .iter()
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect()
    }
}

impl<K, V> Default for Pool<K, V>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + Default + 'static,
{
    fn default() -> Self {
        Self::new(|_, _| V::default())
    }
}
