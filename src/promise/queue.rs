//! Per-thread FIFO of deferred continuations.
//!
//! Promise reactions never run inline: settling a promise only enqueues them
//! here, and they run when something drains the queue with [`sync`].

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::error::Rejection;

type Microtask = Box<dyn FnOnce() -> Result<(), Rejection>>;

thread_local! {
    static QUEUE: RefCell<VecDeque<Microtask>> = const { RefCell::new(VecDeque::new()) };
}

/// Defer `task` until the next drain.
pub fn later<F>(task: F)
where
    F: FnOnce() -> Result<(), Rejection> + 'static,
{
    QUEUE.with(|queue| queue.borrow_mut().push_back(Box::new(task)));
}

/// Run queued continuations until the queue is empty, including any they
/// enqueue while running.
///
/// The first continuation that fails stops the drain and its error is
/// returned; whatever is still queued stays queued for the next drain.
pub fn sync() -> Result<(), Rejection> {
    // The borrow must end before the task runs, since tasks enqueue more work.
    while let Some(task) = QUEUE.with(|queue| queue.borrow_mut().pop_front()) {
        task()?;
    }
    Ok(())
}

/// Number of continuations waiting to run.
pub fn queued() -> usize {
    QUEUE.with(|queue| queue.borrow().len())
}
