mod diagnostics;

use std::cell::{Cell, RefCell};
use std::process::ExitCode;
use std::rc::{Rc, Weak};

pub use crate::scheduler::diagnostics::{Diagnostics, WaitGraph};

use crate::core::{Config, Specification, Value};
use crate::engine::{Entry, Resource, Task};
use crate::error::SchedulerError;
use crate::pool::Pool;
use crate::promise::{Eventual, sync};
use crate::utils::joined;

/// Outcome of [`Scheduler::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The queue drained; every entry finished.
    Completed,
    /// A restart was requested; the run stopped after the pass in progress.
    Restart,
    /// `run` was called while already running and did nothing.
    Busy,
}

impl RunStatus {
    /// Numeric exit status for this outcome.
    pub fn exit_status(self, config: &Config) -> u8 {
        match self {
            RunStatus::Restart => config.restart_status,
            RunStatus::Completed | RunStatus::Busy => 0,
        }
    }

    pub fn exit_code(self, config: &Config) -> ExitCode {
        ExitCode::from(self.exit_status(config))
    }
}

/// A task or resource, given either by name or as a handle.
pub enum Target<'a, T> {
    Name(&'a str),
    Handle(&'a T),
}

impl<'a, T> From<&'a str> for Target<'a, T> {
    fn from(name: &'a str) -> Self {
        Target::Name(name)
    }
}

impl<'a, T> From<&'a String> for Target<'a, T> {
    fn from(name: &'a String) -> Self {
        Target::Name(name)
    }
}

impl<'a> From<&'a Task> for Target<'a, Task> {
    fn from(task: &'a Task) -> Self {
        Target::Handle(task)
    }
}

impl<'a> From<&'a Resource> for Target<'a, Resource> {
    fn from(resource: &'a Resource) -> Self {
        Target::Handle(resource)
    }
}

pub(crate) struct Core {
    config: Config,
    tasks: Pool<String, Task>,
    resources: Pool<String, Resource>,
    spec: RefCell<Specification>,
    queue: RefCell<Vec<Entry>>,
    current: RefCell<Option<Entry>>,
    running: Cell<bool>,
    restart: Cell<bool>,
    diagnostics: RefCell<Diagnostics>,
}

/// Back-reference from tasks and resources to the scheduler that owns them.
#[derive(Clone)]
pub(crate) struct SchedulerRef(Weak<Core>);

impl SchedulerRef {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(Scheduler)
    }
}

/// Drives tasks and resources until the system converges.
///
/// Work happens in passes: each pass runs everything queued at its start,
/// in queue order. Entries that can't finish re-queue themselves. A pass in
/// which nothing moves is a deadlock; with deadlock breaking enabled, the
/// oldest unresolvable lookup is rejected and the run goes on, otherwise the
/// stalled entries are reported.
///
/// Tasks and resources live in separate namespaces and are created on first
/// mention.
#[derive(Clone)]
pub struct Scheduler(Rc<Core>);

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self(Rc::new_cyclic(|weak: &Weak<Core>| {
            let owner = SchedulerRef(weak.clone());
            let tasks = Pool::new({
                let owner = owner.clone();
                move |name: &String, _: &Pool<String, Task>| Task::new(name, owner.clone())
            });
            let resources = Pool::new(move |name: &String, _: &Pool<String, Resource>| {
                Resource::new(name, owner.clone())
            });

            Core {
                config,
                tasks,
                resources,
                spec: RefCell::new(Specification::default()),
                queue: RefCell::new(Vec::new()),
                current: RefCell::new(None),
                running: Cell::new(false),
                restart: Cell::new(false),
                diagnostics: RefCell::new(Diagnostics::default()),
            }
        }))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// The named task, created on first use, or the given handle.
    pub fn task<'a>(&self, target: impl Into<Target<'a, Task>>) -> Task {
        match target.into() {
            Target::Name(name) => self.0.tasks.get(&name.to_string()),
            Target::Handle(task) => task.clone(),
        }
    }

    /// Like [`Scheduler::task`], but a name must already be registered.
    pub fn require_task<'a>(&self, target: impl Into<Target<'a, Task>>) -> Result<Task, SchedulerError> {
        match target.into() {
            Target::Name(name) if !self.0.tasks.contains(&name.to_string()) => {
                Err(SchedulerError::UnknownTask(name.to_string()))
            }
            target => Ok(self.task(target)),
        }
    }

    /// The named resource, created on first use, or the given handle.
    pub fn resource<'a>(&self, target: impl Into<Target<'a, Resource>>) -> Resource {
        match target.into() {
            Target::Name(name) => self.0.resources.get(&name.to_string()),
            Target::Handle(resource) => resource.clone(),
        }
    }

    /// Like [`Scheduler::resource`], but a name must already be registered.
    pub fn require_resource<'a>(
        &self,
        target: impl Into<Target<'a, Resource>>,
    ) -> Result<Resource, SchedulerError> {
        match target.into() {
            Target::Name(name) if !self.0.resources.contains(&name.to_string()) => {
                Err(SchedulerError::UnknownResource(name.to_string()))
            }
            target => Ok(self.resource(target)),
        }
    }

    /// [`Resource::reference`] on an existing resource.
    pub fn reference<'a>(
        &self,
        resource: impl Into<Target<'a, Resource>>,
        key: impl Into<Value>,
        key_type: &str,
    ) -> Result<Eventual, SchedulerError> {
        Ok(self.require_resource(resource)?.reference(key, key_type))
    }

    /// Replace the specification without running anything.
    pub fn load(&self, spec: Value) {
        *self.0.spec.borrow_mut() = Specification::new(spec);
    }

    pub fn spec(&self, path: &str, default: Value) -> Value {
        self.0.spec.borrow().value(path, default)
    }

    pub fn spec_has(&self, path: &str) -> bool {
        self.0.spec.borrow().has(path)
    }

    /// The task whose step (or continuation) is executing right now.
    pub fn current_task(&self) -> Option<Task> {
        match &*self.0.current.borrow() {
            Some(Entry::Task(task)) => Some(task.clone()),
            _ => None,
        }
    }

    /// [`Scheduler::current_task`], for callers that need one.
    pub fn current(&self) -> Result<Task, SchedulerError> {
        self.current_task().ok_or(SchedulerError::NoCurrentTask)
    }

    /// Stop after the pass in progress and report [`RunStatus::Restart`].
    pub fn request_restart(&self) {
        tracing::info!("restart requested");
        self.0.restart.set(true);
    }

    /// Number of entries waiting for the next pass.
    pub fn queued(&self) -> usize {
        self.0.queue.borrow().len()
    }

    /// Counters from the most recent run.
    pub fn diagnostics(&self) -> Diagnostics {
        self.0.diagnostics.borrow().clone()
    }

    pub(crate) fn enqueue(&self, entry: Entry) {
        self.0.queue.borrow_mut().push(entry);
    }

    /// Converge on `spec`.
    pub fn run(&self, spec: Value) -> Result<RunStatus, SchedulerError> {
        if self.0.running.replace(true) {
            return Ok(RunStatus::Busy);
        }
        let _running = RunningGuard(&self.0.running);

        self.load(spec);
        self.0.restart.set(false);
        *self.0.diagnostics.borrow_mut() = Diagnostics::default();

        let span = tracing::info_span!("converge");
        let _enter = span.enter();

        sync()?;

        loop {
            let entries = std::mem::take(&mut *self.0.queue.borrow_mut());
            if entries.is_empty() {
                break;
            }

            let progress = self.pass(&entries)?;

            if self.0.restart.get() {
                tracing::info!("stopping for restart");
                return Ok(RunStatus::Restart);
            }

            if progress == 0 {
                if self.0.config.break_deadlocks && self.break_deadlock(&entries)? {
                    continue;
                }
                return Err(self.deadlocked(&entries));
            }
        }

        tracing::info!("Run complete!");
        Ok(RunStatus::Completed)
    }

    fn pass(&self, entries: &[Entry]) -> Result<usize, SchedulerError> {
        let mut progress = 0;

        for entry in entries {
            *self.0.current.borrow_mut() = Some(entry.clone());
            let result = entry.run();
            *self.0.current.borrow_mut() = None;
            progress += result?.units();
        }

        let mut diagnostics = self.0.diagnostics.borrow_mut();
        diagnostics.passes += 1;
        diagnostics.runs += entries.len();
        tracing::debug!(pass = diagnostics.passes, entries = entries.len(), progress, "pass complete");

        Ok(progress)
    }

    // First stalled resource in queue order gives up its oldest lookup.
    fn break_deadlock(&self, entries: &[Entry]) -> Result<bool, SchedulerError> {
        for entry in entries.iter().filter(|entry| entry.has_pending()) {
            if entry.cancel_pending()? {
                tracing::warn!("no progress; cancelled oldest lookup of {}", entry.name());
                self.0.diagnostics.borrow_mut().lookups_cancelled += 1;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn deadlocked(&self, entries: &[Entry]) -> SchedulerError {
        let graph = WaitGraph::build(entries);
        for cycle in graph.cycles() {
            tracing::error!("dependency cycle: {}", cycle.join(" -> "));
        }
        tracing::error!("stalled: {}", joined(entries));
        tracing::debug!("wait-for graph:\n{graph}");

        SchedulerError::Deadlock {
            entries: entries.iter().map(ToString::to_string).collect(),
        }
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::engine::Step;
    use crate::error::StepError;
    use crate::promise::{Promise, StepResult};

    fn logger() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Step + Clone) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let make = move |label: &str| -> Step {
            let sink = sink.clone();
            let label = label.to_string();
            Box::new(move |_: &[Value]| {
                sink.borrow_mut().push(label.clone());
                Ok(StepResult::done())
            })
        };
        (log, make)
    }

    #[test]
    fn test_names_resolve_to_same_handles() {
        let scheduler = Scheduler::new();
        let task = scheduler.task("demo");
        assert!(scheduler.task("demo").ptr_eq(&task));
        assert!(scheduler.task(&task).ptr_eq(&task));
        assert!(scheduler.task(&"demo".to_string()).ptr_eq(&task));

        let resource = scheduler.resource("demo");
        assert!(scheduler.resource(&resource).ptr_eq(&resource));
        assert_eq!(resource.name(), task.name());
    }

    #[test]
    fn test_required_names_must_exist() {
        let scheduler = Scheduler::new();
        assert_eq!(
            scheduler.require_task("nosuch").unwrap_err().to_string(),
            "Task 'nosuch' does not exist"
        );
        assert_eq!(
            scheduler.require_resource("@nosuch").unwrap_err().to_string(),
            "Resource '@nosuch' does not exist"
        );
        assert!(scheduler.reference("@nosuch", "x", "").is_err());

        scheduler.task("nosuch");
        assert!(scheduler.require_task("nosuch").is_ok());
        assert!(scheduler.require_resource("nosuch").is_err());
    }

    #[test]
    fn test_spec_accessors() {
        let scheduler = Scheduler::new();
        scheduler.load(json!({"foo": "bar", "baz": [1, 2, {"blue": 3}]}));
        assert!(scheduler.spec_has("foo"));
        assert!(scheduler.spec_has("/baz/2/blue"));
        assert!(!scheduler.spec_has("/baz/15"));
        assert_eq!(scheduler.spec("foo", Value::Null), json!("bar"));
        assert_eq!(scheduler.spec("missing", json!(0)), json!(0));
    }

    #[test]
    fn test_run_drains_earlier_microtasks_first() {
        let scheduler = Scheduler::new();
        let (log, make) = logger();
        let sink = log.clone();
        crate::promise::later(move || {
            sink.borrow_mut().push("queued".into());
            Ok(())
        });
        scheduler.task("demo").steps([make("step")]);

        assert_eq!(scheduler.run(json!({})).unwrap(), RunStatus::Completed);
        assert_eq!(*log.borrow(), vec!["queued", "step"]);
    }

    #[test]
    fn test_tasks_run_in_queue_order_with_new_tasks_last() {
        let scheduler = Scheduler::new();
        let (log, make) = logger();
        let (inner, spawner) = (make.clone(), scheduler.clone());

        scheduler.task("a").steps([make("a1")]);
        scheduler.task("b").step(move |_| {
            spawner.task("c").steps([inner("c1")]);
            Ok(StepResult::done())
        });
        scheduler.task("d").steps([make("d1")]);

        scheduler.run(json!({})).unwrap();
        assert_eq!(*log.borrow(), vec!["a1", "d1", "c1"]);
    }

    #[test]
    fn test_current_task_during_steps() {
        let scheduler = Scheduler::new();
        assert!(matches!(scheduler.current(), Err(SchedulerError::NoCurrentTask)));

        let seen = Rc::new(RefCell::new(None));
        let (sink, handle) = (seen.clone(), scheduler.clone());
        scheduler.task("demo").step(move |_| {
            *sink.borrow_mut() = handle.current_task().map(|task| task.name().to_string());
            Ok(StepResult::done())
        });

        scheduler.run(json!({})).unwrap();
        assert_eq!(seen.borrow().as_deref(), Some("demo"));
        assert!(scheduler.current_task().is_none());
    }

    #[test]
    fn test_reentrant_run_is_a_no_op() {
        let scheduler = Scheduler::new();
        let nested = Rc::new(Cell::new(None));
        let (sink, handle) = (nested.clone(), scheduler.clone());
        scheduler.task("demo").step(move |_| {
            sink.set(Some(handle.run(json!({}))?));
            Ok(StepResult::done())
        });

        assert_eq!(scheduler.run(json!({})).unwrap(), RunStatus::Completed);
        assert_eq!(nested.get(), Some(RunStatus::Busy));
    }

    #[test]
    fn test_restart_stops_after_current_pass() {
        let scheduler = Scheduler::new();
        let (log, make) = logger();
        let handle = scheduler.clone();

        scheduler
            .task("first")
            .step(move |_| {
                handle.request_restart();
                Ok(StepResult::done())
            })
            .steps([make("first-after")]);
        scheduler.task("second").steps([make("second")]);

        let gate = Promise::new();
        let returned = gate.clone();
        scheduler
            .task("third")
            .step(move |_| Ok(returned.clone().into()))
            .steps([make("third-after")]);

        let status = scheduler.run(json!({})).unwrap();
        assert_eq!(status, RunStatus::Restart);
        assert_eq!(*log.borrow(), vec!["first-after", "second"]);
        assert_eq!(status.exit_status(scheduler.config()), 75);
        assert_eq!(RunStatus::Completed.exit_status(scheduler.config()), 0);
    }

    #[test]
    fn test_deadlock_reports_stalled_entries() {
        let scheduler = Scheduler::new();
        let a = scheduler.task("A");
        let b = scheduler.task("B");
        a.depends_on(&b).step(|_| Ok(StepResult::done()));
        b.depends_on(&a).step(|_| Ok(StepResult::done()));

        let err = scheduler.run(json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Remaining tasks deadlocked; cannot proceed:\n\n\tA (B)\n\tB (A)\n"
        );
        assert_eq!(scheduler.diagnostics().passes, 1);
    }

    #[test]
    fn test_blocked_step_deadlock_names_blocker() {
        let scheduler = Scheduler::new();
        let producer = scheduler.task("producer");
        producer.step(|_| Err(StepError::Blocked));
        let resource = scheduler.resource("@foo").is_produced_by([&producer]);
        let waiter = scheduler.task("demo");
        let task = waiter.clone();
        task.step(move |_| Err(waiter.block_on(&resource, "spam")));

        let err = scheduler.run(json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Remaining tasks deadlocked; cannot proceed:\n\n\tproducer\n\t@foo (producer)\n\tdemo (@foo: spam)\n"
        );
    }

    #[test]
    fn test_deadlock_breaking_rejects_lookup() {
        let scheduler = Scheduler::new();
        let resource = scheduler.resource("@things");
        let outcome = Rc::new(RefCell::new(None));
        let sink = outcome.clone();

        scheduler.task("demo").step(move |_| {
            let resource = resource.clone();
            let sink = sink.clone();
            Ok(StepResult::spawn(async move {
                let found = resource.reference("missing", "").await;
                *sink.borrow_mut() = Some(found.map_err(|reason| reason.to_string()));
                Ok::<_, anyhow::Error>(Value::Null)
            }))
        });

        assert_eq!(scheduler.run(json!({})).unwrap(), RunStatus::Completed);
        assert_eq!(
            *outcome.borrow(),
            Some(Err("@things: 'missing' not found".to_string()))
        );
        assert_eq!(scheduler.diagnostics().lookups_cancelled, 1);
    }

    #[test]
    fn test_unhandled_cancellation_fails_run() {
        let scheduler = Scheduler::new();
        let resource = scheduler.resource("@things");
        scheduler.task("demo").step(move |_| {
            let resource = resource.clone();
            Ok(StepResult::spawn(async move {
                resource.reference("missing", "kind").await?;
                Ok::<_, anyhow::Error>(Value::Null)
            }))
        });

        let err = scheduler.run(json!({})).unwrap_err();
        assert_eq!(err.to_string(), "@things:kind 'missing' not found");
    }

    #[test]
    fn test_deadlock_breaking_can_be_disabled() {
        let scheduler = Scheduler::with_config(Config::default().with_deadlock_breaking(false));
        let resource = scheduler.resource("@things");
        scheduler
            .task("demo")
            .step(move |_| Ok(resource.reference("missing", "").into()));

        let err = scheduler.run(json!({})).unwrap_err();
        assert!(matches!(err, SchedulerError::Deadlock { .. }));
        assert_eq!(
            err.to_string(),
            "Remaining tasks deadlocked; cannot proceed:\n\n\t@things\n\tdemo (pending result)\n"
        );
    }

    #[test]
    fn test_async_step_with_external_resolution() {
        let scheduler = Scheduler::new();
        let numbers = scheduler.resource("@numbers");
        let product = Rc::new(Cell::new(0));

        let (resource, sink) = (numbers.clone(), product.clone());
        scheduler.task("multiply").reads(["x"]).step(move |args| {
            let x = args[0].as_i64().unwrap_or(0);
            let (resource, sink) = (resource.clone(), sink.clone());
            Ok(StepResult::spawn(async move {
                let k = resource.reference("k", "").await?;
                let result = k.as_i64().unwrap_or(0) * x;
                sink.set(result);
                Ok::<_, anyhow::Error>(json!(result))
            }))
        });
        scheduler.task("provide").step(move |_| {
            numbers.resolve("", "k", json!(3));
            Ok(StepResult::done())
        });

        assert_eq!(scheduler.run(json!({"x": 5})).unwrap(), RunStatus::Completed);
        assert_eq!(product.get(), 15);
        assert_eq!(scheduler.diagnostics().lookups_cancelled, 0);
    }

    #[test]
    fn test_unneeded_tasks_are_skipped() {
        let scheduler = Scheduler::new();
        let (log, make) = logger();
        scheduler.task("wanted").reads(["present"]).steps([make("wanted")]);
        scheduler.task("skipped").reads(["absent"]).steps([make("skipped")]);

        scheduler.run(json!({"present": true})).unwrap();
        assert_eq!(*log.borrow(), vec!["wanted"]);
    }
}
