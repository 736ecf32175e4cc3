use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::IntoFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::core::Value;
use crate::error::Rejection;
use crate::promise::{Eventual, Promise, Watcher};

type Body = Pin<Box<dyn Future<Output = anyhow::Result<Value>>>>;

/// A suspendable computation: an `async` block that may await promises.
pub struct Coroutine(Body);

impl Coroutine {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + 'static,
    {
        Self(Box::pin(future))
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Coroutine")
    }
}

struct Routine {
    body: RefCell<Option<Body>>,
    woken: Cell<bool>,
    promise: Promise,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Routine>>> = const { RefCell::new(None) };
}

/// Start driving a coroutine.
///
/// The coroutine runs until it first waits on an unsettled promise, and is
/// resumed from the microtask queue when that promise settles. If it finishes
/// within this call its value comes back directly; otherwise the result is a
/// watched promise that settles with the coroutine.
pub fn spawn(coroutine: Coroutine) -> Eventual {
    let routine = Rc::new(Routine {
        body: RefCell::new(Some(coroutine.0)),
        woken: Cell::new(false),
        promise: Promise::with_watcher(Watcher::default()),
    });

    resume(&routine);

    match routine.promise.fulfilled() {
        Some(value) => Eventual::Now(value),
        None => Eventual::Later(routine.promise.clone()),
    }
}

fn resume(routine: &Rc<Routine>) {
    let Some(mut body) = routine.body.borrow_mut().take() else {
        // Already being polled further up the stack: poll again once that
        // returns instead of losing the wake-up.
        routine.woken.set(true);
        return;
    };

    let previous = CURRENT.with(|current| current.replace(Some(routine.clone())));
    let mut cx = Context::from_waker(Waker::noop());
    let poll = loop {
        routine.woken.set(false);
        match body.as_mut().poll(&mut cx) {
            Poll::Pending if routine.woken.get() => continue,
            poll => break poll,
        }
    };
    CURRENT.with(|current| *current.borrow_mut() = previous);

    match poll {
        Poll::Ready(Ok(value)) => routine.promise.resolve(value),
        Poll::Ready(Err(err)) => routine.promise.reject(err),
        Poll::Pending => *routine.body.borrow_mut() = Some(body),
    }
}

/// Future returned by awaiting a [`Promise`] or an [`Eventual`].
///
/// Resolves to the promise's value, or to its rejection so the coroutine can
/// catch it at the await point.
///
/// Resumption is driven by [`spawn`]. Awaiting a settled promise works from
/// anywhere, but a pending promise awaited outside a spawned coroutine (for
/// example under another executor) resolves to a rejection right away, since
/// nothing would ever resume it.
pub struct Awaiting {
    promise: Promise,
    registered: bool,
}

impl Future for Awaiting {
    type Output = Result<Value, Rejection>;

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.promise.settled() {
            self.promise.mark_checked();
            return Poll::Ready(result);
        }

        if !self.registered {
            let Some(routine) = CURRENT.with(|current| current.borrow().clone()) else {
                return Poll::Ready(Err(Rejection::msg(
                    "pending promise awaited outside of a spawned coroutine",
                )));
            };
            self.registered = true;
            self.promise.subscribe(move |_| {
                resume(&routine);
                Ok(())
            });
        }

        Poll::Pending
    }
}

impl IntoFuture for Promise {
    type Output = Result<Value, Rejection>;
    type IntoFuture = Awaiting;

    fn into_future(self) -> Self::IntoFuture {
        Awaiting {
            promise: self,
            registered: false,
        }
    }
}

impl IntoFuture for Eventual {
    type Output = Result<Value, Rejection>;
    type IntoFuture = Awaiting;

    fn into_future(self) -> Self::IntoFuture {
        self.into_promise().into_future()
    }
}
