mod resource;
mod task;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;

pub use crate::engine::resource::{Lookup, Resource};
pub use crate::engine::task::{Step, StepOutcome, Task};

use crate::error::SchedulerError;
use crate::promise::Promise;

/// What a single `run` of a schedulable entry achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing left to do.
    Finished,
    /// Still unfinished after completing this many units of work.
    Advanced(usize),
}

impl Progress {
    /// Contribution to a scheduler pass; finishing counts as one unit.
    pub fn units(self) -> usize {
        match self {
            Progress::Finished => 1,
            Progress::Advanced(n) => n,
        }
    }
}

/// Something an entry waits on before it is ready.
#[derive(Clone)]
pub enum Dependency {
    Task(Task),
    Resource(Resource),
    Promise(Promise),
}

impl Dependency {
    /// Tasks and resources must have finished; promises must have settled.
    pub fn finished(&self) -> bool {
        match self {
            Dependency::Task(task) => task.finished(),
            Dependency::Resource(resource) => resource.finished(),
            Dependency::Promise(promise) => !promise.is_pending(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Dependency::Task(task) => task.name().to_string(),
            Dependency::Resource(resource) => resource.name().to_string(),
            Dependency::Promise(_) => "pending result".to_string(),
        }
    }
}

impl From<&Task> for Dependency {
    fn from(task: &Task) -> Self {
        Dependency::Task(task.clone())
    }
}

impl From<&Resource> for Dependency {
    fn from(resource: &Resource) -> Self {
        Dependency::Resource(resource.clone())
    }
}

impl From<&Promise> for Dependency {
    fn from(promise: &Promise) -> Self {
        Dependency::Promise(promise.clone())
    }
}

impl From<Promise> for Dependency {
    fn from(promise: Promise) -> Self {
        Dependency::Promise(promise)
    }
}

/// Bookkeeping shared by tasks and resources.
#[derive(Default)]
pub(crate) struct Lifecycle {
    tries: Cell<usize>,
    scheduled: Cell<bool>,
    probing: Cell<bool>,
    depends_on: RefCell<VecDeque<Dependency>>,
    blocker: RefCell<Option<String>>,
}

impl Lifecycle {
    /// Start of a run: count the attempt and leave the queue.
    pub(crate) fn begin(&self) {
        self.scheduled.set(false);
        self.tries.set(self.tries.get() + 1);
    }

    pub(crate) fn attempted(&self) -> bool {
        self.tries.get() > 0
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    pub(crate) fn mark_scheduled(&self) {
        self.scheduled.set(true);
    }

    pub(crate) fn wait_for(&self, dependency: Dependency) {
        self.depends_on.borrow_mut().push_back(dependency);
    }

    /// Drop finished dependencies from the front, stopping at the first
    /// unfinished one and recording it as the blocker.
    ///
    /// A probe that comes back around to an entry already being probed
    /// answers "not ready", so dependency cycles stall instead of recursing.
    pub(crate) fn ready(&self) -> bool {
        if self.probing.replace(true) {
            return false;
        }

        let ready = loop {
            let front = self.depends_on.borrow().front().cloned();
            let Some(dependency) = front else {
                break true;
            };
            if !dependency.finished() {
                self.set_blocker(dependency.describe());
                break false;
            }
            self.depends_on.borrow_mut().pop_front();
            self.clear_blocker();
        };

        self.probing.set(false);
        ready
    }

    pub(crate) fn set_blocker(&self, blocker: String) {
        *self.blocker.borrow_mut() = Some(blocker);
    }

    pub(crate) fn clear_blocker(&self) {
        *self.blocker.borrow_mut() = None;
    }

    pub(crate) fn dependencies(&self) -> Vec<Dependency> {
        self.depends_on.borrow().iter().cloned().collect()
    }

    /// `name`, or `name (blocker)` while something is in the way.
    pub(crate) fn label(&self, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.blocker.borrow() {
            Some(blocker) => write!(f, "{name} ({blocker})"),
            None => f.write_str(name),
        }
    }
}

/// A schedulable unit sitting in the scheduler's queue.
#[derive(Clone)]
pub enum Entry {
    Task(Task),
    Resource(Resource),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::Task(task) => task.name(),
            Entry::Resource(resource) => resource.name(),
        }
    }

    pub fn run(&self) -> Result<Progress, SchedulerError> {
        match self {
            Entry::Task(task) => task.run(),
            Entry::Resource(resource) => resource.run(),
        }
    }

    pub fn finished(&self) -> bool {
        match self {
            Entry::Task(task) => task.finished(),
            Entry::Resource(resource) => resource.finished(),
        }
    }

    /// Whether this entry holds lookups that could be cancelled.
    pub(crate) fn has_pending(&self) -> bool {
        match self {
            Entry::Task(_) => false,
            Entry::Resource(resource) => resource.has_pending(),
        }
    }

    pub(crate) fn cancel_pending(&self) -> Result<bool, SchedulerError> {
        match self {
            Entry::Task(_) => Ok(false),
            Entry::Resource(resource) => resource.cancel_pending(),
        }
    }

    pub(crate) fn dependencies(&self) -> Vec<Dependency> {
        match self {
            Entry::Task(task) => task.lifecycle().dependencies(),
            Entry::Resource(resource) => resource.lifecycle().dependencies(),
        }
    }

    /// Whether `dependency` refers to this very entry.
    pub(crate) fn is(&self, dependency: &Dependency) -> bool {
        match (self, dependency) {
            (Entry::Task(a), Dependency::Task(b)) => a.ptr_eq(b),
            (Entry::Resource(a), Dependency::Resource(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Task(task) => fmt::Display::fmt(task, f),
            Entry::Resource(resource) => fmt::Display::fmt(resource, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_units() {
        assert_eq!(Progress::Finished.units(), 1);
        assert_eq!(Progress::Advanced(0).units(), 0);
        assert_eq!(Progress::Advanced(3).units(), 3);
    }

    #[test]
    fn test_promise_dependency_tracks_settlement() {
        let life = Lifecycle::default();
        let promise = Promise::new();
        life.wait_for(Dependency::from(&promise));

        assert!(!life.ready());
        assert_eq!(life.blocker.borrow().as_deref(), Some("pending result"));

        promise.resolve(serde_json::Value::Null);
        assert!(life.ready());
        assert!(life.blocker.borrow().is_none());
        assert!(life.dependencies().is_empty());
    }

    #[test]
    fn test_dependencies_resolve_in_order() {
        let life = Lifecycle::default();
        let first = Promise::new();
        let second = Promise::new();
        life.wait_for(Dependency::from(&first));
        life.wait_for(Dependency::from(&second));

        second.resolve(serde_json::Value::Null);
        assert!(!life.ready());
        assert_eq!(life.dependencies().len(), 2);

        first.resolve(serde_json::Value::Null);
        assert!(life.ready());
    }
}
