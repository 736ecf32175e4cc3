use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::core::Value;
use crate::engine::{Dependency, Entry, Lifecycle, Progress, Task};
use crate::error::{LookupError, Rejection, SchedulerError};
use crate::pool::Pool;
use crate::promise::{Eventual, Promise, StepResult, Watcher, interpret, sync};
use crate::scheduler::SchedulerRef;

type Handler = dyn Fn(&str, &str, &Resource) -> Option<Value>;

/// A lookup handler: maps `(key, key_type, resource)` to a value, or `None`
/// when it can't tell (yet). Handlers compare by identity.
#[derive(Clone)]
pub struct Lookup(Rc<Handler>);

impl Lookup {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &Resource) -> Option<Value> + 'static,
    {
        Self(Rc::new(handler))
    }

    fn call(&self, key: &str, key_type: &str, resource: &Resource) -> Option<Value> {
        (self.0)(key, key_type, resource).filter(|value| !value.is_null())
    }

    fn ptr_eq(&self, other: &Lookup) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// What a key type remembers about a key.
#[derive(Clone)]
enum Cached {
    Found(Value),
    /// The lookup was given up on; asking again yields the same rejection
    /// until the key is resolved.
    Rejected(Promise),
}

#[derive(Default)]
struct KeyTable {
    handlers: RefCell<Vec<Lookup>>,
    cache: RefCell<HashMap<String, Cached>>,
}

impl KeyTable {
    fn cached(&self, key: &str) -> Option<Cached> {
        self.cache.borrow().get(key).cloned()
    }

    fn store(&self, key: String, entry: Cached) {
        self.cache.borrow_mut().insert(key, entry);
    }
}

/// Pending references are keyed by `(key_type, key)`, oldest first.
type PendingKey = (String, String);

struct PendingRef {
    id: u64,
    promise: Promise,
}

struct Inner {
    name: String,
    scheduler: SchedulerRef,
    life: Lifecycle,
    tables: Pool<String, Rc<KeyTable>>,
    pending: RefCell<IndexMap<PendingKey, PendingRef>>,
    next_id: Cell<u64>,
}

/// A namespace of externally-existing things, looked up by key.
///
/// Each key type has its own handlers and its own cache. A reference to a
/// key nobody can resolve yet becomes a pending promise; the resource stays
/// queued until every pending reference is resolved, either by a handler on
/// a later pass or through [`Resource::resolve`].
#[derive(Clone)]
pub struct Resource(Rc<Inner>);

impl Resource {
    pub(crate) fn new(name: &str, scheduler: SchedulerRef) -> Self {
        let resource = Self(Rc::new(Inner {
            name: name.to_string(),
            scheduler,
            life: Lifecycle::default(),
            tables: Pool::default(),
            pending: RefCell::new(IndexMap::new()),
            next_id: Cell::new(0),
        }));
        resource.schedule();
        resource
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Register `handler` for `key_type`. Adding the same handler twice is a
    /// no-op.
    pub fn add_lookup(&self, handler: &Lookup, key_type: &str) -> Resource {
        let table = self.table(key_type);
        let mut handlers = table.handlers.borrow_mut();
        if !handlers.iter().any(|h| h.ptr_eq(handler)) {
            handlers.push(handler.clone());
        }
        self.clone()
    }

    pub fn remove_lookup(&self, handler: &Lookup, key_type: &str) -> Resource {
        self.table(key_type)
            .handlers
            .borrow_mut()
            .retain(|h| !h.ptr_eq(handler));
        self.clone()
    }

    pub fn has_lookup(&self, handler: &Lookup, key_type: &str) -> bool {
        self.table(key_type)
            .handlers
            .borrow()
            .iter()
            .any(|h| h.ptr_eq(handler))
    }

    /// Synchronous probe: the cached value, else the first handler (in
    /// registration order) that knows the key. Hits are cached. A key whose
    /// lookup was rejected stays unknown until it is resolved.
    pub fn lookup(&self, key: &str, key_type: &str) -> Option<Value> {
        let table = self.table(key_type);
        match table.cached(key) {
            Some(Cached::Found(value)) => return Some(value),
            Some(Cached::Rejected(_)) => return None,
            None => {}
        }

        let handlers = table.handlers.borrow().clone();
        for handler in handlers {
            if let Some(value) = handler.call(key, key_type, self) {
                self.resolve(key_type, key, value.clone());
                return Some(value);
            }
        }

        None
    }

    /// Value for `key`, now or later.
    ///
    /// A string key resolves through the cache, then the handlers, and
    /// otherwise becomes a pending promise that keeps this resource queued.
    /// Asking again for the same pending or rejected key returns the same
    /// promise. Array keys map element by element, object keys field by field.
    pub fn reference(&self, key: impl Into<Value>, key_type: &str) -> Eventual {
        match key.into() {
            Value::String(key) => self.reference_one(key, key_type),
            Value::Array(keys) => interpret(StepResult::List(
                keys.into_iter()
                    .map(|key| self.reference(key, key_type).into())
                    .collect(),
            )),
            Value::Object(fields) => interpret(StepResult::Map(
                fields
                    .into_iter()
                    .map(|(name, key)| (name, self.reference(key, key_type).into()))
                    .collect(),
            )),
            other => self.reference_one(other.to_string(), key_type),
        }
    }

    fn reference_one(&self, key: String, key_type: &str) -> Eventual {
        if let Some(Cached::Rejected(promise)) = self.table(key_type).cached(&key) {
            return Eventual::Later(promise);
        }
        if let Some(value) = self.lookup(&key, key_type) {
            return Eventual::Now(value);
        }

        let slot = (key_type.to_string(), key);
        let existing = self.0.pending.borrow().get(&slot).map(|entry| entry.promise.clone());
        if let Some(promise) = existing {
            return Eventual::Later(promise);
        }

        let id = self.0.next_id.get();
        self.0.next_id.set(id + 1);

        let promise = Promise::with_watcher(Watcher::default());
        let owner = Rc::downgrade(&self.0);
        promise.on_settled(move |result| {
            mirror(&owner, id, result);
            Ok(())
        });

        self.0.pending.borrow_mut().insert(
            slot,
            PendingRef {
                id,
                promise: promise.clone(),
            },
        );
        self.schedule();

        Eventual::Later(promise)
    }

    /// Write `value` through to the cache and fulfil any pending reference.
    pub fn resolve(&self, key_type: &str, key: &str, value: Value) {
        tracing::trace!(resource = %self.0.name, key_type, key, "resolved");
        self.table(key_type)
            .store(key.to_string(), Cached::Found(value.clone()));

        let slot = (key_type.to_string(), key.to_string());
        let pending = self.0.pending.borrow_mut().shift_remove(&slot);
        if let Some(entry) = pending {
            entry.promise.resolve(value);
        }
    }

    pub fn resolve_many<I, K>(&self, key_type: &str, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (key, value) in values {
            self.resolve(key_type, key.as_ref(), value);
        }
    }

    /// Retry the handlers for every pending reference.
    ///
    /// [`Progress::Finished`] when nothing was pending, otherwise how many
    /// references got resolved.
    pub fn update_pending(&self) -> Progress {
        let outstanding: Vec<PendingKey> = self.0.pending.borrow().keys().cloned().collect();

        if outstanding.is_empty() {
            return Progress::Finished;
        }

        let resolved = outstanding
            .iter()
            .filter(|(key_type, key)| self.lookup(key, key_type).is_some())
            .count();
        Progress::Advanced(resolved)
    }

    /// Reject the oldest pending reference as not found, then drain the
    /// microtask queue. Returns whether there was anything to reject.
    ///
    /// The rejection is remembered: later references to the same key get the
    /// rejected promise until the key is resolved.
    pub fn cancel_pending(&self) -> Result<bool, SchedulerError> {
        let oldest = self.0.pending.borrow_mut().shift_remove_index(0);
        let Some(((key_type, key), entry)) = oldest else {
            return Ok(false);
        };

        self.table(&key_type)
            .store(key.clone(), Cached::Rejected(entry.promise.clone()));

        let reason = LookupError::NotFound {
            resource: self.0.name.clone(),
            key_type,
            key,
        };
        tracing::debug!("cancelling lookup: {reason}");
        entry.promise.reject(Rejection::from(reason));

        sync()?;
        Ok(true)
    }

    pub fn has_pending(&self) -> bool {
        !self.0.pending.borrow().is_empty()
    }

    /// This resource isn't ready until each of `tasks` has finished.
    pub fn is_produced_by<'a, I>(&self, tasks: I) -> Resource
    where
        I: IntoIterator<Item = &'a Task>,
    {
        for task in tasks {
            self.0.life.wait_for(Dependency::from(task));
        }
        self.clone()
    }

    pub fn ready(&self) -> bool {
        self.0.life.ready()
    }

    pub fn finished(&self) -> bool {
        self.0.life.attempted() && self.ready() && !self.has_pending()
    }

    /// Wait for producers, then keep retrying pending references for as
    /// long as that resolves something.
    pub fn run(&self) -> Result<Progress, SchedulerError> {
        self.0.life.begin();
        let mut progress = 0;

        while !self.finished() {
            if !self.ready() {
                self.schedule();
                return Ok(Progress::Advanced(progress));
            }

            let resolved = self.update_pending();
            sync()?;

            if resolved == Progress::Advanced(0) {
                self.schedule();
                return Ok(Progress::Advanced(progress));
            }
            progress += resolved.units();
        }

        Ok(Progress::Finished)
    }

    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.0.life
    }

    pub(crate) fn schedule(&self) {
        if self.0.life.is_scheduled() || self.finished() {
            return;
        }
        if let Some(scheduler) = self.0.scheduler.upgrade() {
            self.0.life.mark_scheduled();
            scheduler.enqueue(Entry::Resource(self.clone()));
        }
    }

    fn table(&self, key_type: &str) -> Rc<KeyTable> {
        self.0.tables.get(&key_type.to_string())
    }
}

// Keeps the tables in step with a pending promise settled from outside.
fn mirror(owner: &Weak<Inner>, id: u64, result: Result<Value, Rejection>) {
    let Some(inner) = owner.upgrade() else {
        return;
    };
    let resource = Resource(inner);

    let removed = {
        let mut pending = resource.0.pending.borrow_mut();
        pending
            .iter()
            .position(|(_, entry)| entry.id == id)
            .and_then(|index| pending.shift_remove_index(index))
    };
    if let Some(((key_type, key), entry)) = removed {
        let cached = match result {
            Ok(value) => Cached::Found(value),
            Err(_) => Cached::Rejected(entry.promise),
        };
        resource.table(&key_type).store(key, cached);
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.life.label(&self.0.name, f)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("name", &self.0.name).finish()
    }
}
