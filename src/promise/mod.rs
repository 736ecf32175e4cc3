//! Single-threaded promises with unhandled-rejection tracking.
//!
//! A [`Promise`] settles once and delivers its outcome to reactions through
//! the microtask queue (see [`sync`]). A promise may carry a [`Watcher`]: if it ends up
//! rejected without anyone ever chaining on it or inspecting it, the watcher
//! is told about the rejection. The default watcher re-raises the rejection
//! from the next queue drain, so forgotten async failures can't go silent.

mod coroutine;
mod queue;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

pub use crate::promise::coroutine::{Awaiting, Coroutine, spawn};
pub use crate::promise::queue::{later, queued, sync};

use crate::core::Value;
use crate::error::Rejection;

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Rejection),
}

type Reaction = Box<dyn FnOnce(Result<Value, Rejection>) -> Result<(), Rejection>>;

thread_local! {
    static DEFERRED_THROW: Watcher = Watcher::new(|reason| later(move || Err(reason)));
}

/// Handler told about rejections nobody observed.
///
/// Watchers compare by identity, which is what lets [`Promise::wrap_with`]
/// hand back an already-watched promise unchanged.
#[derive(Clone)]
pub struct Watcher(Rc<dyn Fn(Rejection)>);

impl Watcher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Rejection) + 'static,
    {
        Self(Rc::new(handler))
    }

    /// The per-thread default: re-raise from the next [`sync`].
    pub fn deferred_throw() -> Self {
        DEFERRED_THROW.with(Watcher::clone)
    }

    fn notify(&self, reason: Rejection) {
        (self.0)(reason)
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::deferred_throw()
    }
}

impl PartialEq for Watcher {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Watcher")
    }
}

struct Core {
    state: RefCell<PromiseState>,
    reactions: RefCell<Vec<Reaction>>,
    watcher: Option<Watcher>,
    checked: Cell<bool>,
}

/// Shared handle to an eventual value. Clones refer to the same promise.
#[derive(Clone)]
pub struct Promise(Rc<Core>);

impl Promise {
    fn build(state: PromiseState, watcher: Option<Watcher>) -> Self {
        Self(Rc::new(Core {
            state: RefCell::new(state),
            reactions: RefCell::new(Vec::new()),
            watcher,
            checked: Cell::new(false),
        }))
    }

    /// Pending and unwatched.
    pub fn new() -> Self {
        Self::build(PromiseState::Pending, None)
    }

    /// Pending, reporting unobserved rejection to `watcher`.
    pub fn with_watcher(watcher: Watcher) -> Self {
        Self::build(PromiseState::Pending, Some(watcher))
    }

    /// Already fulfilled, watched by default.
    pub fn value(value: Value) -> Self {
        Self::build(PromiseState::Fulfilled(value), Some(Watcher::default()))
    }

    /// Already rejected, watched by default. Unless something observes it
    /// before the next drain, the rejection is re-raised from [`sync`].
    pub fn error(reason: impl Into<Rejection>) -> Self {
        let promise = Self::with_watcher(Watcher::default());
        promise.settle(Err(reason.into()));
        promise
    }

    /// [`Promise::wrap_with`] using the default watcher.
    pub fn wrap(promise: &Promise) -> Self {
        Self::wrap_with(promise, Watcher::default())
    }

    /// A promise following `promise` and watched by `watcher`.
    ///
    /// Returns `promise` itself when it already carries the same watcher.
    /// Following a settled promise copies its outcome immediately.
    pub fn wrap_with(promise: &Promise, watcher: Watcher) -> Self {
        if promise.0.watcher.as_ref() == Some(&watcher) {
            return promise.clone();
        }

        let wrapped = Self::with_watcher(watcher);
        match promise.settled() {
            Some(result) => {
                promise.mark_checked();
                wrapped.settle(result);
            }
            None => {
                let target = wrapped.clone();
                promise.subscribe(move |result| {
                    target.settle(result);
                    Ok(())
                });
            }
        }
        wrapped
    }

    /// Fulfil; ignored if already settled.
    pub fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    /// Reject; ignored if already settled.
    pub fn reject(&self, reason: impl Into<Rejection>) {
        self.settle(Err(reason.into()));
    }

    /// Chain a continuation on fulfilment. Rejections pass through.
    pub fn then<F>(&self, on_fulfilled: F) -> Promise
    where
        F: FnOnce(Value) -> anyhow::Result<StepResult> + 'static,
    {
        let next = self.derive();
        let target = next.clone();
        self.subscribe(move |result| {
            match result {
                Ok(value) => target.adopt(call(move || on_fulfilled(value))),
                Err(reason) => target.settle(Err(reason)),
            }
            Ok(())
        });
        next
    }

    /// Chain a recovery on rejection. Values pass through.
    pub fn otherwise<F>(&self, on_rejected: F) -> Promise
    where
        F: FnOnce(Rejection) -> anyhow::Result<StepResult> + 'static,
    {
        let next = self.derive();
        let target = next.clone();
        self.subscribe(move |result| {
            match result {
                Ok(value) => target.settle(Ok(value)),
                Err(reason) => target.adopt(call(move || on_rejected(reason))),
            }
            Ok(())
        });
        next
    }

    /// Synchronous read: the value if fulfilled, `default` if still pending,
    /// the rejection as an error. Counts as observing the promise.
    pub fn now(&self, default: Value) -> Result<Value, Rejection> {
        self.mark_checked();
        match self.settled() {
            Some(result) => result,
            None => Ok(default),
        }
    }

    /// Snapshot of the state. Counts as observing the promise.
    pub fn inspect(&self) -> PromiseState {
        self.mark_checked();
        self.0.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.0.state.borrow(), PromiseState::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.0.state.borrow(), PromiseState::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.0.state.borrow(), PromiseState::Rejected(_))
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn settled(&self) -> Option<Result<Value, Rejection>> {
        match &*self.0.state.borrow() {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Ok(value.clone())),
            PromiseState::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    pub(crate) fn fulfilled(&self) -> Option<Value> {
        match &*self.0.state.borrow() {
            PromiseState::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn mark_checked(&self) {
        self.0.checked.set(true);
    }

    /// Register a reaction to settlement. The reaction always runs from the
    /// queue, never inline.
    pub(crate) fn subscribe<F>(&self, reaction: F)
    where
        F: FnOnce(Result<Value, Rejection>) -> Result<(), Rejection> + 'static,
    {
        self.mark_checked();
        self.on_settled(reaction);
    }

    /// Like `subscribe`, but bookkeeping only: the promise still counts as
    /// unobserved, so an unhandled rejection is still reported.
    pub(crate) fn on_settled<F>(&self, reaction: F)
    where
        F: FnOnce(Result<Value, Rejection>) -> Result<(), Rejection> + 'static,
    {
        match self.settled() {
            Some(result) => later(move || reaction(result)),
            None => self.0.reactions.borrow_mut().push(Box::new(reaction)),
        }
    }

    fn settle(&self, result: Result<Value, Rejection>) {
        {
            let mut state = self.0.state.borrow_mut();
            if !matches!(*state, PromiseState::Pending) {
                return;
            }
            *state = match &result {
                Ok(value) => PromiseState::Fulfilled(value.clone()),
                Err(reason) => PromiseState::Rejected(reason.clone()),
            };
        }

        let reactions = std::mem::take(&mut *self.0.reactions.borrow_mut());
        for reaction in reactions {
            let result = result.clone();
            later(move || reaction(result));
        }

        if let Err(reason) = result {
            self.watch_leaf(reason);
        }
    }

    // Runs after the reactions queued above, so anything chained by then has
    // already marked the promise as checked.
    fn watch_leaf(&self, reason: Rejection) {
        if let Some(watcher) = self.0.watcher.clone() {
            let core = self.0.clone();
            later(move || {
                if !core.checked.get() {
                    watcher.notify(reason);
                }
                Ok(())
            });
        }
    }

    fn derive(&self) -> Promise {
        Self::build(PromiseState::Pending, self.0.watcher.clone())
    }

    fn adopt(&self, eventual: Eventual) {
        match eventual {
            Eventual::Now(value) => self.settle(Ok(value)),
            Eventual::Later(promise) => {
                let target = self.clone();
                promise.subscribe(move |result| {
                    target.settle(result);
                    Ok(())
                });
            }
        }
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&*self.0.state.borrow()).finish()
    }
}

/// Anything a step or callback may hand back.
pub enum StepResult {
    Value(Value),
    Pending(Promise),
    Suspendable(Coroutine),
    /// Resolves to an array once every element has.
    List(Vec<StepResult>),
    /// Resolves to an object once every field has.
    Map(Vec<(String, StepResult)>),
}

impl StepResult {
    /// Completed with nothing to report.
    pub fn done() -> Self {
        StepResult::Value(Value::Null)
    }

    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + 'static,
    {
        StepResult::Suspendable(Coroutine::new(future))
    }

    /// Interpret, then read synchronously.
    pub fn now(self, default: Value) -> Result<Value, Rejection> {
        interpret(self).now(default)
    }
}

impl From<Value> for StepResult {
    fn from(value: Value) -> Self {
        StepResult::Value(value)
    }
}

impl From<Promise> for StepResult {
    fn from(promise: Promise) -> Self {
        StepResult::Pending(promise)
    }
}

impl From<Coroutine> for StepResult {
    fn from(coroutine: Coroutine) -> Self {
        StepResult::Suspendable(coroutine)
    }
}

impl From<Eventual> for StepResult {
    fn from(eventual: Eventual) -> Self {
        match eventual {
            Eventual::Now(value) => StepResult::Value(value),
            Eventual::Later(promise) => StepResult::Pending(promise),
        }
    }
}

impl fmt::Debug for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Value(value) => f.debug_tuple("Value").field(value).finish(),
            StepResult::Pending(promise) => f.debug_tuple("Pending").field(promise).finish(),
            StepResult::Suspendable(_) => f.write_str("Suspendable"),
            StepResult::List(items) => f.debug_tuple("List").field(items).finish(),
            StepResult::Map(fields) => f.debug_tuple("Map").field(fields).finish(),
        }
    }
}

/// A value available right away, or a watched promise of one.
#[derive(Debug, Clone)]
pub enum Eventual {
    Now(Value),
    Later(Promise),
}

impl Eventual {
    pub fn is_ready(&self) -> bool {
        matches!(self, Eventual::Now(_))
    }

    pub fn now(self, default: Value) -> Result<Value, Rejection> {
        match self {
            Eventual::Now(value) => Ok(value),
            Eventual::Later(promise) => promise.now(default),
        }
    }

    pub fn into_promise(self) -> Promise {
        match self {
            Eventual::Now(value) => Promise::value(value),
            Eventual::Later(promise) => promise,
        }
    }
}

/// Normalize a result into a value or a watched promise.
///
/// Fulfilled promises unwrap to their value, other promises get watched,
/// coroutines are spawned and containers are scanned element by element.
/// A container settles once all elements have, or rejects with the first
/// element that rejects.
pub fn interpret(result: impl Into<StepResult>) -> Eventual {
    match result.into() {
        StepResult::Value(value) => Eventual::Now(value),
        StepResult::Pending(promise) => match promise.fulfilled() {
            Some(value) => Eventual::Now(value),
            None => Eventual::Later(Promise::wrap(&promise)),
        },
        StepResult::Suspendable(coroutine) => spawn(coroutine),
        StepResult::List(items) => gather(Shape::List, items),
        StepResult::Map(fields) => {
            let (keys, items) = fields.into_iter().unzip();
            gather(Shape::Map(keys), items)
        }
    }
}

/// Run `f` and interpret its result; an error becomes a rejected promise.
pub fn call<F>(f: F) -> Eventual
where
    F: FnOnce() -> anyhow::Result<StepResult>,
{
    match f() {
        Ok(result) => interpret(result),
        Err(err) => Eventual::Later(Promise::error(err)),
    }
}

enum Shape {
    List,
    Map(Vec<String>),
}

impl Shape {
    fn assemble(&self, values: Vec<Value>) -> Value {
        match self {
            Shape::List => Value::Array(values),
            Shape::Map(keys) => Value::Object(keys.iter().cloned().zip(values).collect()),
        }
    }
}

fn gather(shape: Shape, items: Vec<StepResult>) -> Eventual {
    let parts: Vec<Eventual> = items.into_iter().map(interpret).collect();

    if parts.iter().all(Eventual::is_ready) {
        let values = parts
            .into_iter()
            .map(|part| match part {
                Eventual::Now(value) => value,
                Eventual::Later(_) => Value::Null,
            })
            .collect();
        return Eventual::Now(shape.assemble(values));
    }

    let aggregate = Promise::with_watcher(Watcher::default());
    let slots = Rc::new(RefCell::new(vec![Value::Null; parts.len()]));
    let remaining = Rc::new(Cell::new(0usize));
    let shape = Rc::new(shape);

    for (index, part) in parts.into_iter().enumerate() {
        match part {
            Eventual::Now(value) => slots.borrow_mut()[index] = value,
            Eventual::Later(promise) => {
                remaining.set(remaining.get() + 1);
                let aggregate = aggregate.clone();
                let slots = slots.clone();
                let remaining = remaining.clone();
                let shape = shape.clone();
                promise.subscribe(move |result| {
                    match result {
                        Ok(value) => {
                            slots.borrow_mut()[index] = value;
                            remaining.set(remaining.get() - 1);
                            if remaining.get() == 0 {
                                aggregate.resolve(shape.assemble(slots.take()));
                            }
                        }
                        Err(reason) => aggregate.reject(reason),
                    }
                    Ok(())
                });
            }
        }
    }

    Eventual::Later(aggregate)
}
