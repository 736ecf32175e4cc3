use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::core::Value;
use crate::engine::{Dependency, Entry, Lifecycle, Progress, Resource};
use crate::error::{SchedulerError, StepError};
use crate::promise::{Eventual, StepResult, interpret, sync};
use crate::scheduler::{Scheduler, SchedulerRef};

/// What a step hands back: a result to interpret, or why it stopped.
pub type StepOutcome = Result<StepResult, StepError>;

/// A unit of work. Receives the values of the task's declared reads, in
/// declaration order.
pub type Step = Box<dyn FnMut(&[Value]) -> StepOutcome>;

struct Inner {
    name: String,
    scheduler: SchedulerRef,
    life: Lifecycle,
    reads: RefCell<Option<Vec<String>>>,
    steps: RefCell<VecDeque<Step>>,
    in_flight: Cell<bool>,
}

/// A named, ordered list of steps.
///
/// Steps run one after another, each only once every earlier dependency has
/// settled. A step that reports [`StepError::Blocked`] stays at the front and
/// is retried on a later pass. Tasks that declare reads are skipped entirely
/// when none of those paths exist in the specification.
#[derive(Clone)]
pub struct Task(Rc<Inner>);

impl Task {
    pub(crate) fn new(name: &str, scheduler: SchedulerRef) -> Self {
        let task = Self(Rc::new(Inner {
            name: name.to_string(),
            scheduler,
            life: Lifecycle::default(),
            reads: RefCell::new(None),
            steps: RefCell::new(VecDeque::new()),
            in_flight: Cell::new(false),
        }));
        task.schedule();
        task
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Declare specification paths this task consumes.
    pub fn reads<I, S>(&self, paths: I) -> Task
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .reads
            .borrow_mut()
            .get_or_insert_with(Vec::new)
            .extend(paths.into_iter().map(Into::into));
        self.clone()
    }

    /// Append one step.
    pub fn step<F>(&self, step: F) -> Task
    where
        F: FnMut(&[Value]) -> StepOutcome + 'static,
    {
        self.steps([Box::new(step) as Step])
    }

    /// Append steps, in order, and make sure the task is queued.
    pub fn steps<I>(&self, steps: I) -> Task
    where
        I: IntoIterator<Item = Step>,
    {
        self.0.steps.borrow_mut().extend(steps);
        self.schedule();
        self.clone()
    }

    /// Hold further steps until `dependency` has finished or settled.
    pub fn depends_on(&self, dependency: impl Into<Dependency>) -> Task {
        self.0.life.wait_for(dependency.into());
        self.clone()
    }

    pub fn ready(&self) -> bool {
        self.0.life.ready()
    }

    /// True without declared reads, otherwise true if any of them exists.
    pub fn needed(&self) -> bool {
        let Some(scheduler) = self.0.scheduler.upgrade() else {
            return true;
        };
        match &*self.0.reads.borrow() {
            None => true,
            Some(paths) => paths.is_empty() || paths.iter().any(|path| scheduler.spec_has(path)),
        }
    }

    pub fn has_steps(&self) -> bool {
        self.0.in_flight.get() || !self.0.steps.borrow().is_empty()
    }

    pub fn finished(&self) -> bool {
        self.0.life.attempted() && ((self.ready() && !self.has_steps()) || !self.needed())
    }

    /// Execute steps until finished or until something is in the way.
    ///
    /// Returns [`Progress::Finished`] once done; otherwise re-queues itself
    /// and reports how many steps completed during this run.
    pub fn run(&self) -> Result<Progress, SchedulerError> {
        self.0.life.begin();
        let mut progress = 0;

        while !self.finished() {
            if self.ready() && self.run_next_step()? {
                progress += 1;
            } else {
                self.schedule();
                return Ok(Progress::Advanced(progress));
            }
        }

        Ok(Progress::Finished)
    }

    /// Mark this task as waiting on `resource` for the reason in `message`.
    ///
    /// Meant to be returned from a step. If the resource has already become
    /// ready the wait can never end, so that is reported as a failure.
    pub fn block_on(&self, resource: &Resource, message: impl fmt::Display) -> StepError {
        self.0.life.set_blocker(format!("{}: {message}", resource.name()));
        if resource.ready() {
            StepError::Failed(anyhow::anyhow!("{}: {message}", self.name()))
        } else {
            StepError::Blocked
        }
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
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
            scheduler.enqueue(Entry::Task(self.clone()));
        }
    }

    fn arguments(&self, scheduler: Option<&Scheduler>) -> Vec<Value> {
        let reads = self.0.reads.borrow();
        let Some(paths) = reads.as_ref() else {
            return Vec::new();
        };
        paths
            .iter()
            .map(|path| scheduler.map_or(Value::Null, |s| s.spec(path, Value::Null)))
            .collect()
    }

    fn run_next_step(&self) -> Result<bool, SchedulerError> {
        let scheduler = self.0.scheduler.upgrade();
        let arguments = self.arguments(scheduler.as_ref());
        let Some(mut step) = self.0.steps.borrow_mut().pop_front() else {
            return Ok(true);
        };

        tracing::trace!(task = %self.0.name, "running step");
        self.0.in_flight.set(true);
        let outcome = step(&arguments);
        self.0.in_flight.set(false);

        let advanced = match outcome {
            Ok(result) => {
                self.0.life.clear_blocker();
                if let Eventual::Later(promise) = interpret(result) {
                    if promise.is_pending() {
                        self.0.life.wait_for(Dependency::Promise(promise));
                    }
                }
                true
            }
            Err(StepError::Blocked) => {
                self.0.steps.borrow_mut().push_front(step);
                false
            }
            Err(StepError::Failed(source)) => {
                return Err(SchedulerError::Step {
                    task: self.0.name.clone(),
                    source,
                });
            }
        };

        sync()?;
        Ok(advanced)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.life.label(&self.0.name, f)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.0.name).finish()
    }
}
