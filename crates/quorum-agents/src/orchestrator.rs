use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use quorum_models::{
    AggregatedSignal, AggregatorConfig, AnalysisRequest, AnalysisResult, QuorumConfig,
    RequestStatus, SchedulerConfig, Signal, TaskReport,
};
use quorum_store::{ContextProvider, SignalJournal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::SignalAggregator;
use crate::bus::{EventBus, Subscription};
use crate::error::OrchestratorError;
use crate::groups::TickerGroupManager;
use crate::registry::AgentRegistry;
use crate::scheduler::{build_task_graph, Scheduler, SchedulerHandle, TaskEvent, TaskOutcome};

struct RequestState {
    aggregator: SignalAggregator,
    reports: Vec<TaskReport>,
    settled: HashSet<Uuid>,
    total_tasks: usize,
    cancelled: bool,
    status: RequestStatus,
}

/// Book-keeping for one submitted request. Aggregation state sits behind a
/// single mutex so a reader never sees a half-applied update.
struct TrackedRequest {
    request_id: Uuid,
    group_id: String,
    instruments: Vec<String>,
    cancel: CancellationToken,
    state: Mutex<RequestState>,
    status: watch::Sender<RequestStatus>,
}

impl TrackedRequest {
    fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn all_settled(&self) -> bool {
        let state = self.lock();
        state.settled.len() >= state.total_tasks
    }

    fn set_status(&self, state: &mut RequestState, status: RequestStatus) {
        if state.status.is_finished() {
            return;
        }
        state.status = status;
        self.status.send_replace(status);
    }

    fn finished_status(state: &RequestState) -> RequestStatus {
        if state.cancelled {
            RequestStatus::Cancelled
        } else {
            RequestStatus::Completed
        }
    }

    fn apply(&self, event: &TaskEvent, journal: Option<&SignalJournal>) {
        let emitted = {
            let mut state = self.lock();
            if state.settled.insert(event.task_id) {
                state.reports.push(event.report());
            }
            state.aggregator.apply(event, Utc::now())
        };

        if let Some(journal) = journal {
            if let TaskOutcome::Signal(signal) = &event.outcome {
                record(journal.append_signal(Some(self.request_id), signal));
            }
            if let Some(aggregate) = &emitted {
                record(journal.append_aggregate(Some(self.request_id), aggregate));
            }
        }
    }

    fn on_deadline(&self, journal: Option<&SignalJournal>) {
        let emitted = self.lock().aggregator.on_deadline(Utc::now());
        if !emitted.is_empty() {
            info!(request = %self.request_id, partial = emitted.len(), "Aggregation deadline reached");
        }
        journal_aggregates(journal, self.request_id, &emitted);
    }

    /// Overall deadline: finalize every instrument with what is present and
    /// make the result available. Tasks still running may add later versions.
    fn force_finalize(&self, journal: Option<&SignalJournal>) {
        let emitted = {
            let mut state = self.lock();
            let emitted = state.aggregator.force_finalize(Utc::now());
            let status = Self::finished_status(&state);
            self.set_status(&mut state, status);
            emitted
        };
        if !emitted.is_empty() {
            warn!(
                request = %self.request_id,
                instruments = emitted.len(),
                "Request deadline reached, finalized with incomplete data"
            );
        }
        journal_aggregates(journal, self.request_id, &emitted);
    }

    fn complete(&self) {
        let mut state = self.lock();
        let status = Self::finished_status(&state);
        self.set_status(&mut state, status);
        info!(
            request = %self.request_id,
            group = %self.group_id,
            status = ?status,
            completeness = %state.aggregator.completeness(),
            "Request finished"
        );
    }

    fn snapshot(&self) -> AnalysisResult {
        let state = self.lock();
        let position = |instrument: &str| {
            self.instruments
                .iter()
                .position(|i| i == instrument)
                .unwrap_or(usize::MAX)
        };
        let mut tasks = state.reports.clone();
        tasks.sort_by(|a, b| {
            position(&a.instrument_id)
                .cmp(&position(&b.instrument_id))
                .then_with(|| a.capability.cmp(&b.capability))
        });
        AnalysisResult {
            request_id: self.request_id,
            group_id: self.group_id.clone(),
            status: state.status,
            completeness: state.aggregator.completeness(),
            aggregated_signals: state.aggregator.latest(),
            history: state.aggregator.history().to_vec(),
            tasks,
        }
    }
}

fn record(result: Result<i64, quorum_store::StoreError>) {
    if let Err(e) = result {
        warn!(error = %e, "Failed to journal signal");
    }
}

fn journal_aggregates(journal: Option<&SignalJournal>, request_id: Uuid, emitted: &[AggregatedSignal]) {
    if let Some(journal) = journal {
        for aggregate in emitted {
            record(journal.append_aggregate(Some(request_id), aggregate));
        }
    }
}

/// Folds a request's task events into its aggregation windows until every
/// task has settled, honoring the partial and overall deadlines on the way.
async fn run_aggregation(
    tracked: Arc<TrackedRequest>,
    mut events: Subscription<TaskEvent>,
    aggregation_deadline: Instant,
    overall_deadline: Instant,
    journal: Option<Arc<SignalJournal>>,
) {
    let mut partial_sent = false;
    let mut forced = false;

    while !tracked.all_settled() {
        tokio::select! {
            envelope = events.recv() => match envelope {
                Some(envelope) if envelope.payload.request_id == tracked.request_id => {
                    tracked.apply(&envelope.payload, journal.as_deref());
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::time::sleep_until(aggregation_deadline), if !partial_sent => {
                partial_sent = true;
                tracked.on_deadline(journal.as_deref());
            }
            _ = tokio::time::sleep_until(overall_deadline), if !forced => {
                forced = true;
                tracked.force_finalize(journal.as_deref());
            }
        }
    }
    tracked.complete();
}

/// Entry point for analysis requests: expands groups, builds task graphs,
/// hands them to the scheduler and aggregates what comes back.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    groups: Arc<TickerGroupManager>,
    bus: Arc<EventBus<TaskEvent>>,
    scheduler: SchedulerHandle,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    scheduler_config: SchedulerConfig,
    aggregator_config: AggregatorConfig,
    journal: Option<Arc<SignalJournal>>,
    requests: RwLock<HashMap<Uuid, Arc<TrackedRequest>>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Build the orchestrator and start its scheduler. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: &QuorumConfig,
        registry: Arc<AgentRegistry>,
        groups: Arc<TickerGroupManager>,
        context: Arc<dyn ContextProvider>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();
        let (scheduler, scheduler_task) = Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&registry),
            context,
            Arc::clone(&bus),
        )
        .with_signal_ttl(config.aggregator.signal_ttl_seconds)
        .spawn(shutdown.clone());

        Self {
            registry,
            groups,
            bus,
            scheduler,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            scheduler_config: config.scheduler.clone(),
            aggregator_config: config.aggregator.clone(),
            journal: None,
            requests: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Journal every signal and aggregate version.
    pub fn with_journal(mut self, journal: Arc<SignalJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn groups(&self) -> &Arc<TickerGroupManager> {
        &self.groups
    }

    /// Task outcomes as they settle, keyed by instrument.
    pub fn events(&self) -> &Arc<EventBus<TaskEvent>> {
        &self.bus
    }

    pub fn busy_workers(&self) -> usize {
        self.scheduler.busy_workers()
    }

    fn tracked(&self, request_id: Uuid) -> Result<Arc<TrackedRequest>, OrchestratorError> {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request_id)
            .cloned()
            .ok_or(OrchestratorError::RequestNotFound(request_id))
    }

    /// Submit an analysis request and return its id immediately.
    ///
    /// An invalid dependency graph rejects the request before any task is
    /// dispatched. Results are available through [`result`](Self::result) at
    /// any time, and [`wait`](Self::wait) resolves once the request finishes.
    pub fn submit(&self, request: AnalysisRequest) -> Result<Uuid, OrchestratorError> {
        let group = self.groups.get(&request.group_id)?;
        let request_id = Uuid::new_v4();
        let graph = build_task_graph(request_id, &group, &request, &self.registry, Utc::now())?;

        let plan = graph.plan();
        let total_tasks = graph.tasks.len();
        // Subscribe before the scheduler sees the graph so no outcome is missed.
        let events = self.bus.subscribe_many(&group.instrument_ids);
        let cancel = self.shutdown.child_token();
        let (status, _) = watch::channel(RequestStatus::Running);

        let tracked = Arc::new(TrackedRequest {
            request_id,
            group_id: group.id.clone(),
            instruments: group.instrument_ids.clone(),
            cancel: cancel.clone(),
            state: Mutex::new(RequestState {
                aggregator: SignalAggregator::new(self.aggregator_config.clone(), &plan),
                reports: Vec::with_capacity(total_tasks),
                settled: HashSet::with_capacity(total_tasks),
                total_tasks,
                cancelled: false,
                status: RequestStatus::Running,
            }),
            status,
        });
        self.requests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, Arc::clone(&tracked));

        let started = Instant::now();
        let aggregation_deadline =
            started + Duration::from_millis(self.aggregator_config.aggregation_deadline_ms);
        let overall_deadline = started
            + Duration::from_secs(
                group
                    .scheduling_policy
                    .request_deadline_seconds
                    .unwrap_or(self.scheduler_config.request_deadline_seconds),
            );
        tokio::spawn(run_aggregation(
            Arc::clone(&tracked),
            events,
            aggregation_deadline,
            overall_deadline,
            self.journal.clone(),
        ));

        if let Err(e) = self.scheduler.submit(graph, cancel) {
            tracked.cancel.cancel();
            let mut state = tracked.lock();
            state.cancelled = true;
            tracked.set_status(&mut state, RequestStatus::Cancelled);
            return Err(e);
        }

        info!(
            request = %request_id,
            group = %group.id,
            instruments = group.instrument_ids.len(),
            capabilities = ?request.capabilities,
            tasks = total_tasks,
            "Request submitted"
        );
        Ok(request_id)
    }

    /// Current state of a request: latest aggregate per instrument, every
    /// version emitted so far, and reports for settled tasks.
    pub fn result(&self, request_id: Uuid) -> Result<AnalysisResult, OrchestratorError> {
        Ok(self.tracked(request_id)?.snapshot())
    }

    /// Resolve once the request has completed or been cancelled.
    pub async fn wait(&self, request_id: Uuid) -> Result<AnalysisResult, OrchestratorError> {
        let tracked = self.tracked(request_id)?;
        let mut status = tracked.status.subscribe();
        status
            .wait_for(|s| s.is_finished())
            .await
            .map_err(|_| OrchestratorError::SchedulerStopped)?;
        Ok(tracked.snapshot())
    }

    /// Cancel a running request. Queued tasks are dropped, running tasks are
    /// told to stop, and aggregation finalizes with what already arrived. Other
    /// requests are unaffected. Cancelling a finished request is a no-op.
    pub fn cancel(&self, request_id: Uuid) -> Result<(), OrchestratorError> {
        let tracked = self.tracked(request_id)?;
        {
            let mut state = tracked.lock();
            if state.status.is_finished() {
                return Ok(());
            }
            state.cancelled = true;
        }
        tracked.cancel.cancel();
        info!(request = %request_id, group = %tracked.group_id, "Request cancelled");
        self.scheduler.cancel(request_id)
    }

    /// Cancel every running request for a group. Returns how many were cancelled.
    pub fn cancel_group(&self, group_id: &str) -> Result<usize, OrchestratorError> {
        let running: Vec<Uuid> = self
            .requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| t.group_id == group_id && !t.lock().status.is_finished())
            .map(|t| t.request_id)
            .collect();
        for request_id in &running {
            self.cancel(*request_id)?;
        }
        Ok(running.len())
    }

    /// Fold a signal delivered outside the scheduler (for example a correction
    /// from an agent) into a request's aggregate. Accepted only within the
    /// signal's ttl and only from an agent already assigned to the request.
    pub fn accept_late_signal(
        &self,
        request_id: Uuid,
        signal: Signal,
    ) -> Result<Option<AggregatedSignal>, OrchestratorError> {
        let tracked = self.tracked(request_id)?;
        let emitted = tracked.lock().aggregator.accept_late(signal.clone(), Utc::now());
        if let (Some(journal), Some(aggregate)) = (&self.journal, &emitted) {
            record(journal.append_signal(Some(request_id), &signal));
            record(journal.append_aggregate(Some(request_id), aggregate));
        }
        Ok(emitted)
    }

    /// Ids of requests that have not finished.
    pub fn active_requests(&self) -> Vec<Uuid> {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| !t.lock().status.is_finished())
            .map(|t| t.request_id)
            .collect()
    }

    /// Drop a finished request's results. Returns whether anything was removed.
    pub fn forget(&self, request_id: Uuid) -> bool {
        let mut requests = self.requests.write().unwrap_or_else(|e| e.into_inner());
        let finished = requests
            .get(&request_id)
            .is_some_and(|t| t.lock().status.is_finished());
        finished && requests.remove(&request_id).is_some()
    }

    /// Cancel everything in flight and wait for the scheduler to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .scheduler_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
