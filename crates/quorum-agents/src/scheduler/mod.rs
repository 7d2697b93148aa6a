//! Task scheduling.
//!
//! One coordination task owns every admitted request, the fair ready queue and
//! the worker pool. Callers talk to it over a command channel; workers report
//! back through a `JoinSet`. Terminal task outcomes are published on the event
//! bus under the instrument's topic, and since only the coordinator publishes,
//! each topic has a single writer.

pub mod graph;
pub mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use quorum_models::{
    AgentInput, AgentVerdict, FailureKind, SchedulerConfig, Signal, Task, TaskReport, TaskState,
};
use quorum_store::ContextProvider;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{AgentError, OrchestratorError};
use crate::registry::AgentRegistry;
use crate::unit::AgentUnit;

pub use graph::{build_task_graph, TaskGraph};
pub use queue::FairQueue;

/// How a task ended, as seen by aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Signal(Signal),
    Missing { kind: FailureKind, reason: String },
}

/// Published once per task when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub request_id: Uuid,
    pub task_id: Uuid,
    pub instrument_id: String,
    pub capability: String,
    pub agent_id: Option<String>,
    pub outcome: TaskOutcome,
    pub attempts: u32,
    pub wait_ms: u64,
    pub elapsed_ms: u64,
}

impl TaskEvent {
    pub fn report(&self) -> TaskReport {
        let (state, failure, reason) = match &self.outcome {
            TaskOutcome::Signal(_) => (TaskState::Done, None, None),
            TaskOutcome::Missing { kind, reason } => {
                (kind.task_state(), Some(*kind), Some(reason.clone()))
            }
        };
        TaskReport {
            task_id: self.task_id,
            instrument_id: self.instrument_id.clone(),
            capability: self.capability.clone(),
            agent_id: self.agent_id.clone(),
            state,
            failure,
            reason,
            attempts: self.attempts,
            wait_ms: self.wait_ms,
            elapsed_ms: self.elapsed_ms,
        }
    }
}

enum Command {
    Submit {
        graph: TaskGraph,
        cancel: CancellationToken,
    },
    Cancel {
        request_id: Uuid,
    },
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    busy: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    /// Admit a validated graph. Cancelling `cancel` stops its running workers;
    /// use [`cancel`](Self::cancel) to also drop its queued tasks.
    pub fn submit(&self, graph: TaskGraph, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        self.commands
            .send(Command::Submit { graph, cancel })
            .map_err(|_| OrchestratorError::SchedulerStopped)
    }

    pub fn cancel(&self, request_id: Uuid) -> Result<(), OrchestratorError> {
        self.commands
            .send(Command::Cancel { request_id })
            .map_err(|_| OrchestratorError::SchedulerStopped)
    }

    /// Workers currently executing an agent.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }
}

struct WorkerJob {
    request_id: Uuid,
    task_id: Uuid,
    instrument_id: String,
    capability: String,
    unit: Arc<dyn AgentUnit>,
    context: Arc<dyn ContextProvider>,
    upstream: Vec<Signal>,
    budget: Duration,
    cancel: CancellationToken,
}

enum WorkerOutcome {
    Verdict(AgentVerdict),
    Failed(String),
    TimedOut(u64),
    Cancelled,
}

struct WorkerReport {
    request_id: Uuid,
    task_id: Uuid,
    outcome: WorkerOutcome,
    elapsed: Duration,
}

async fn invoke(job: &WorkerJob) -> Result<AgentVerdict, AgentError> {
    let context = job.context.get_context(&job.instrument_id).await?;
    let input = AgentInput {
        instrument_id: job.instrument_id.clone(),
        capability: job.capability.clone(),
        as_of: Utc::now(),
        context,
        upstream: job.upstream.clone(),
    };
    job.unit.execute(&input).await
}

async fn run_worker(job: WorkerJob) -> WorkerReport {
    let started = Instant::now();
    let outcome = tokio::select! {
        _ = job.cancel.cancelled() => WorkerOutcome::Cancelled,
        result = tokio::time::timeout(job.budget, invoke(&job)) => match result {
            Ok(Ok(verdict)) => WorkerOutcome::Verdict(verdict),
            Ok(Err(AgentError::Timeout(ms))) => WorkerOutcome::TimedOut(ms),
            Ok(Err(e)) => WorkerOutcome::Failed(e.to_string()),
            Err(_) => WorkerOutcome::TimedOut(job.budget.as_millis() as u64),
        },
    };
    WorkerReport {
        request_id: job.request_id,
        task_id: job.task_id,
        outcome,
        elapsed: started.elapsed(),
    }
}

struct TaskSlot {
    task: Task,
    waiting_on: usize,
    dependents: Vec<Uuid>,
    ready_since: Instant,
    wait_ms: u64,
    elapsed_ms: u64,
}

struct ActiveRequest {
    group_id: String,
    cancel: CancellationToken,
    order: Vec<Uuid>,
    tasks: HashMap<Uuid, TaskSlot>,
    /// Signals of completed tasks, handed to their dependents as upstream input.
    signals: HashMap<Uuid, Signal>,
    unfinished: usize,
    cancelled: bool,
}

enum Dispatch {
    Start(WorkerJob, String),
    Unavailable(String),
    Skip,
}

enum AfterReport {
    Retry {
        group: String,
        priority: u8,
        created_at: DateTime<Utc>,
    },
    Finish(TaskOutcome),
}

/// The coordination loop. Build with [`Scheduler::new`], then [`spawn`](Scheduler::spawn).
pub struct Scheduler {
    config: SchedulerConfig,
    signal_ttl_seconds: u64,
    registry: Arc<AgentRegistry>,
    context: Arc<dyn ContextProvider>,
    bus: Arc<EventBus<TaskEvent>>,
    queue: FairQueue,
    requests: HashMap<Uuid, ActiveRequest>,
    workers: JoinSet<WorkerReport>,
    in_flight: HashMap<tokio::task::Id, (Uuid, Uuid)>,
    busy: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<AgentRegistry>,
        context: Arc<dyn ContextProvider>,
        bus: Arc<EventBus<TaskEvent>>,
    ) -> Self {
        Self {
            queue: FairQueue::new(config.worker_pool_size),
            config,
            signal_ttl_seconds: 3_600,
            registry,
            context,
            bus,
            requests: HashMap::new(),
            workers: JoinSet::new(),
            in_flight: HashMap::new(),
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// ttl stamped on every signal this scheduler produces.
    pub fn with_signal_ttl(mut self, seconds: u64) -> Self {
        self.signal_ttl_seconds = seconds;
        self
    }

    /// Start the loop on the current runtime. It stops once `shutdown` fires and
    /// every admitted request has drained, or once every handle is dropped and
    /// nothing is left to run.
    pub fn spawn(self, shutdown: CancellationToken) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            commands: tx,
            busy: Arc::clone(&self.busy),
        };
        let join = tokio::spawn(self.run(rx, shutdown));
        (handle, join)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        info!(pool = self.config.worker_pool_size, "Scheduler started");
        let mut commands_open = true;
        let mut shutting_down = false;

        loop {
            self.dispatch();
            if !commands_open && self.requests.is_empty() && self.workers.is_empty() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled(), if !shutting_down => {
                    shutting_down = true;
                    commands.close();
                    let active: Vec<Uuid> = self.requests.keys().copied().collect();
                    info!(active = active.len(), "Scheduler shutting down");
                    for request_id in active {
                        self.cancel_request(request_id, "scheduler shutting down");
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Submit { graph, cancel }) => {
                        let request_id = graph.request_id;
                        self.admit(graph, cancel);
                        if shutting_down {
                            self.cancel_request(request_id, "scheduler shutting down");
                        }
                    }
                    Some(Command::Cancel { request_id }) => {
                        self.cancel_request(request_id, "request cancelled");
                    }
                    None => commands_open = false,
                },
                Some(joined) = self.workers.join_next_with_id(), if !self.workers.is_empty() => {
                    self.on_joined(joined);
                }
                else => break,
            }
        }
        info!("Scheduler stopped");
    }

    fn admit(&mut self, graph: TaskGraph, cancel: CancellationToken) {
        let request_id = graph.request_id;
        let group_id = graph.group_id.clone();
        self.queue
            .open_lane(&group_id, graph.tier, graph.max_concurrency, graph.tasks.len());

        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in &graph.tasks {
            for prerequisite in &task.depends_on {
                dependents.entry(*prerequisite).or_default().push(task.id);
            }
        }

        let now = Instant::now();
        let mut roots = Vec::new();
        let mut unavailable = Vec::new();
        let mut order = Vec::with_capacity(graph.tasks.len());
        let mut tasks = HashMap::with_capacity(graph.tasks.len());
        for task in graph.tasks {
            if task.candidate_agents.is_empty() {
                unavailable.push((task.id, task.capability.clone()));
            } else if task.depends_on.is_empty() {
                roots.push((task.id, task.priority, task.created_at));
            }
            order.push(task.id);
            tasks.insert(
                task.id,
                TaskSlot {
                    waiting_on: task.depends_on.len(),
                    dependents: dependents.remove(&task.id).unwrap_or_default(),
                    ready_since: now,
                    wait_ms: 0,
                    elapsed_ms: 0,
                    task,
                },
            );
        }

        info!(
            request = %request_id,
            group = %group_id,
            tier = ?graph.tier,
            tasks = order.len(),
            "Request admitted"
        );
        self.requests.insert(
            request_id,
            ActiveRequest {
                group_id: group_id.clone(),
                cancel,
                unfinished: order.len(),
                order,
                tasks,
                signals: HashMap::new(),
                cancelled: false,
            },
        );

        for (task_id, priority, created_at) in roots {
            self.queue
                .push(&group_id, request_id, task_id, priority, created_at);
        }
        for (task_id, capability) in unavailable {
            self.finish(
                request_id,
                task_id,
                TaskOutcome::Missing {
                    kind: FailureKind::CapabilityUnavailable,
                    reason: format!("no agent serves {capability}"),
                },
            );
        }
    }

    fn dispatch(&mut self) {
        while self.workers.len() < self.config.worker_pool_size.max(1) {
            let Some((group, entry)) = self.queue.pop() else {
                break;
            };
            match self.prepare(entry.request_id, entry.task_id) {
                Dispatch::Start(job, agent_id) => {
                    debug!(
                        request = %job.request_id,
                        task = %job.task_id,
                        instrument = %job.instrument_id,
                        capability = %job.capability,
                        agent = %agent_id,
                        budget_ms = job.budget.as_millis() as u64,
                        "Task dispatched"
                    );
                    let request_id = job.request_id;
                    let task_id = job.task_id;
                    self.queue.mark_running(&group);
                    let handle = self.workers.spawn(run_worker(job));
                    self.in_flight.insert(handle.id(), (request_id, task_id));
                    self.busy.store(self.workers.len(), Ordering::Relaxed);
                }
                Dispatch::Unavailable(reason) => self.finish(
                    entry.request_id,
                    entry.task_id,
                    TaskOutcome::Missing {
                        kind: FailureKind::CapabilityUnavailable,
                        reason,
                    },
                ),
                Dispatch::Skip => {}
            }
        }
    }

    /// Pick an agent for a ready task and mark it running. Health is checked
    /// here, not at graph construction, so agents disabled in between are
    /// skipped. Attempts rotate through the candidate list.
    fn prepare(&mut self, request_id: Uuid, task_id: Uuid) -> Dispatch {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return Dispatch::Skip;
        };
        if request.cancelled {
            return Dispatch::Skip;
        }
        let Some(slot) = request.tasks.get_mut(&task_id) else {
            return Dispatch::Skip;
        };
        if slot.task.state != TaskState::Queued {
            return Dispatch::Skip;
        }

        let candidates = &slot.task.candidate_agents;
        let start = slot.task.attempt as usize;
        let chosen = (0..candidates.len())
            .map(|k| &candidates[(start + k) % candidates.len()])
            .find_map(|id| self.registry.dispatchable(id));
        let Some((descriptor, unit)) = chosen else {
            return Dispatch::Unavailable(format!(
                "no dispatchable agent for {} among {:?}",
                slot.task.capability, slot.task.candidate_agents
            ));
        };

        let budget_ms = self.config.budget_ms(descriptor.latency_class);
        let now = Utc::now();
        slot.task.agent_id = Some(descriptor.id.clone());
        slot.task.attempt += 1;
        slot.task.state = TaskState::Running;
        slot.task.dispatched_at = Some(now);
        slot.task.deadline = Some(now + chrono::Duration::milliseconds(budget_ms as i64));
        slot.wait_ms = slot.ready_since.elapsed().as_millis() as u64;

        let upstream = slot
            .task
            .depends_on
            .iter()
            .filter_map(|id| request.signals.get(id).cloned())
            .collect();

        Dispatch::Start(
            WorkerJob {
                request_id,
                task_id,
                instrument_id: slot.task.instrument_id.clone(),
                capability: slot.task.capability.clone(),
                unit,
                context: Arc::clone(&self.context),
                upstream,
                budget: Duration::from_millis(budget_ms),
                cancel: request.cancel.child_token(),
            },
            descriptor.id,
        )
    }

    fn on_joined(&mut self, joined: Result<(tokio::task::Id, WorkerReport), JoinError>) {
        let report = match joined {
            Ok((id, report)) => {
                self.in_flight.remove(&id);
                report
            }
            Err(err) => {
                let Some((request_id, task_id)) = self.in_flight.remove(&err.id()) else {
                    return;
                };
                warn!(request = %request_id, task = %task_id, error = %err, "Worker panicked");
                WorkerReport {
                    request_id,
                    task_id,
                    outcome: WorkerOutcome::Failed(format!("worker panicked: {err}")),
                    elapsed: Duration::ZERO,
                }
            }
        };
        self.busy.store(self.workers.len(), Ordering::Relaxed);
        self.on_report(report);
    }

    fn on_report(&mut self, report: WorkerReport) {
        let max_attempts = self.config.max_attempts;
        let signal_ttl_seconds = self.signal_ttl_seconds;
        let next = {
            let Some(request) = self.requests.get_mut(&report.request_id) else {
                return;
            };
            self.queue.release(&request.group_id);
            let cancelled = request.cancelled;
            let group = request.group_id.clone();
            let Some(slot) = request.tasks.get_mut(&report.task_id) else {
                return;
            };
            slot.elapsed_ms = report.elapsed.as_millis() as u64;
            let task = &slot.task;

            let failure = match report.outcome {
                WorkerOutcome::Verdict(verdict) if verdict.confidence_in_range() => {
                    Ok(AfterReport::Finish(TaskOutcome::Signal(Signal {
                        instrument_id: task.instrument_id.clone(),
                        agent_id: task.agent_id.clone().unwrap_or_default(),
                        direction: verdict.direction,
                        confidence: verdict.confidence,
                        rationale: verdict.rationale,
                        produced_at: Utc::now(),
                        ttl_seconds: signal_ttl_seconds,
                    })))
                }
                WorkerOutcome::Verdict(verdict) => Err(format!(
                    "confidence {} outside [0, 1]",
                    verdict.confidence
                )),
                WorkerOutcome::Failed(message) => Err(message),
                WorkerOutcome::TimedOut(budget_ms) => Ok(AfterReport::Finish(TaskOutcome::Missing {
                    kind: FailureKind::TaskTimeout,
                    reason: format!("no answer within {budget_ms} ms"),
                })),
                WorkerOutcome::Cancelled => Ok(AfterReport::Finish(TaskOutcome::Missing {
                    kind: FailureKind::Cancelled,
                    reason: "request cancelled".to_string(),
                })),
            };

            match failure {
                Ok(next) => next,
                Err(message) if !cancelled && task.attempt < max_attempts => {
                    warn!(
                        request = %report.request_id,
                        task = %report.task_id,
                        agent = ?task.agent_id,
                        attempt = task.attempt,
                        error = %message,
                        "Agent failed, retrying"
                    );
                    let priority = task.priority;
                    let created_at = task.created_at;
                    slot.task.state = TaskState::Queued;
                    slot.ready_since = Instant::now();
                    AfterReport::Retry {
                        group,
                        priority,
                        created_at,
                    }
                }
                Err(message) => AfterReport::Finish(TaskOutcome::Missing {
                    kind: if cancelled {
                        FailureKind::Cancelled
                    } else {
                        FailureKind::AgentCrash
                    },
                    reason: message,
                }),
            }
        };

        match next {
            AfterReport::Retry {
                group,
                priority,
                created_at,
            } => {
                self.queue
                    .push(&group, report.request_id, report.task_id, priority, created_at);
            }
            AfterReport::Finish(outcome) => self.finish(report.request_id, report.task_id, outcome),
        }
    }

    /// Settle a task, release its dependents and publish its outcome. A
    /// prerequisite that failed still releases its dependents; they run with
    /// whatever upstream signals exist.
    fn finish(&mut self, request_id: Uuid, task_id: Uuid, outcome: TaskOutcome) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let Some(slot) = request.tasks.get_mut(&task_id) else {
            return;
        };
        if slot.task.state.is_terminal() {
            return;
        }
        slot.task.state = match &outcome {
            TaskOutcome::Signal(_) => TaskState::Done,
            TaskOutcome::Missing { kind, .. } => kind.task_state(),
        };

        let event = TaskEvent {
            request_id,
            task_id,
            instrument_id: slot.task.instrument_id.clone(),
            capability: slot.task.capability.clone(),
            agent_id: slot.task.agent_id.clone(),
            outcome,
            attempts: slot.task.attempt,
            wait_ms: slot.wait_ms,
            elapsed_ms: slot.elapsed_ms,
        };
        let dependents = slot.dependents.clone();
        if let TaskOutcome::Signal(signal) = &event.outcome {
            request.signals.insert(task_id, signal.clone());
        }
        request.unfinished -= 1;

        let mut released = Vec::new();
        for dependent in dependents {
            if let Some(slot) = request.tasks.get_mut(&dependent) {
                slot.waiting_on = slot.waiting_on.saturating_sub(1);
                if slot.waiting_on == 0 && slot.task.state == TaskState::Queued && !request.cancelled
                {
                    slot.ready_since = Instant::now();
                    released.push((dependent, slot.task.priority, slot.task.created_at));
                }
            }
        }
        let group = request.group_id.clone();
        let drained = request.unfinished == 0;

        self.queue.mark_terminal(&group);
        for (dependent, priority, created_at) in released {
            self.queue
                .push(&group, request_id, dependent, priority, created_at);
        }

        match &event.outcome {
            TaskOutcome::Signal(signal) => debug!(
                request = %request_id,
                instrument = %event.instrument_id,
                capability = %event.capability,
                direction = %signal.direction,
                confidence = %signal.confidence,
                "Task done"
            ),
            TaskOutcome::Missing { kind, reason } => warn!(
                request = %request_id,
                instrument = %event.instrument_id,
                capability = %event.capability,
                failure = ?kind,
                reason = %reason,
                "Task produced no signal"
            ),
        }
        let topic = event.instrument_id.clone();
        self.bus.publish(&topic, event);

        if drained {
            self.requests.remove(&request_id);
            info!(request = %request_id, "Request drained");
        }
    }

    fn cancel_request(&mut self, request_id: Uuid, reason: &str) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        if !request.cancelled {
            request.cancelled = true;
            request.cancel.cancel();
        }
        let queued: Vec<Uuid> = request
            .order
            .iter()
            .filter(|id| {
                request
                    .tasks
                    .get(*id)
                    .is_some_and(|slot| slot.task.state == TaskState::Queued)
            })
            .copied()
            .collect();
        self.queue.drain_request(request_id);
        info!(request = %request_id, queued = queued.len(), reason, "Cancelling request");

        for task_id in queued {
            self.finish(
                request_id,
                task_id,
                TaskOutcome::Missing {
                    kind: FailureKind::Cancelled,
                    reason: reason.to_string(),
                },
            );
        }
    }
}
