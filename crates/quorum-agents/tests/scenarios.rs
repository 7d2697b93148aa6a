//! End-to-end request scenarios.
//!
//! Each test registers scripted agents, submits a request through the
//! orchestrator and inspects the aggregated result, task reports and history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use quorum_agents::test_support::{IndicatorAgent, Script, ScriptedAgent};
use quorum_agents::{
    AgentRegistry, AgentUnit, GraphError, Orchestrator, OrchestratorError, TickerGroupManager,
};
use quorum_models::{
    AgentDescriptor, AgentVerdict, AggregationPhase, AnalysisRequest, ConflictFlag,
    ContributionOutcome, DependencyEdge, Direction, FailureKind, HealthStatus, LatencyClass,
    QuorumConfig, RequestStatus, SchedulingPolicy, Signal, TaskState, TickerGroup,
};
use quorum_models::store_schema::{key_patterns, CacheRow};
use quorum_store::{ContextProvider, ContextReader, EmptyContextProvider, SqliteCache};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn respond(direction: Direction, confidence: Decimal, delay_ms: u64) -> Script {
    Script::Respond {
        verdict: AgentVerdict::new(direction, confidence, "scripted"),
        delay: Duration::from_millis(delay_ms),
    }
}

struct Harness {
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(config: QuorumConfig) -> Self {
        Self::with_context(config, Arc::new(EmptyContextProvider))
    }

    fn with_context(config: QuorumConfig, context: Arc<dyn ContextProvider>) -> Self {
        let orchestrator = Orchestrator::new(
            &config,
            Arc::new(AgentRegistry::new()),
            Arc::new(TickerGroupManager::new()),
            context,
        );
        Self { orchestrator }
    }

    fn agent(&self, descriptor: AgentDescriptor, unit: Arc<dyn AgentUnit>) -> &Self {
        self.orchestrator.registry().register(descriptor, unit).unwrap();
        self
    }

    fn group(&self, group: TickerGroup) -> &Self {
        self.orchestrator.groups().create(group).unwrap();
        self
    }
}

fn fast(id: &str, capability: &str) -> AgentDescriptor {
    AgentDescriptor::new(id, &[capability], LatencyClass::Fast)
}

#[tokio::test]
async fn two_instruments_two_capabilities() {
    let mut config = QuorumConfig::default();
    config.scheduler.worker_pool_size = 2;
    config.aggregator.agent_weights.insert("tech".into(), dec!(1.0));
    config.aggregator.agent_weights.insert("fund".into(), dec!(1.5));

    let h = Harness::new(config);
    h.agent(
        fast("tech", "technical"),
        Arc::new(
            ScriptedAgent::responding("tech", Direction::Hold, dec!(0.5))
                .with_script("AAPL", respond(Direction::Buy, dec!(0.8), 50))
                .with_script("MSFT", respond(Direction::Sell, dec!(0.6), 0)),
        ),
    )
    .agent(
        fast("fund", "fundamental"),
        Arc::new(
            ScriptedAgent::responding("fund", Direction::Hold, dec!(0.5))
                .with_script("AAPL", respond(Direction::Hold, dec!(0.4), 200))
                .with_script("MSFT", respond(Direction::Sell, dec!(0.7), 0)),
        ),
    )
    .group(TickerGroup::new("megacap", &["AAPL", "MSFT"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("megacap", &["technical", "fundamental"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(result.status, RequestStatus::Completed);
    assert_eq!(result.completeness, dec!(1));
    assert_eq!(result.tasks.len(), 4);
    assert!(result.tasks.iter().all(|t| t.state == TaskState::Done));

    // buy: 0.8 x 1.0, hold: 0.4 x 1.5
    let aapl = result.signal_for("AAPL").unwrap();
    assert_eq!(aapl.consensus_direction, Some(Direction::Buy));
    assert!((aapl.consensus_confidence - dec!(0.8) / dec!(1.4)).abs() < dec!(0.0001));
    assert_eq!(aapl.phase, AggregationPhase::Finalized);
    assert!(aapl.conflict_flags.is_empty());

    let msft = result.signal_for("MSFT").unwrap();
    assert_eq!(msft.consensus_direction, Some(Direction::Sell));
    assert_eq!(msft.consensus_confidence, dec!(1));
    assert_eq!(msft.completeness, dec!(1));
    assert!(msft.conflict_flags.is_empty());

    // Group order, then capability.
    let order: Vec<(&str, &str)> = result
        .tasks
        .iter()
        .map(|t| (t.instrument_id.as_str(), t.capability.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("AAPL", "fundamental"),
            ("AAPL", "technical"),
            ("MSFT", "fundamental"),
            ("MSFT", "technical"),
        ]
    );

    // AAPL went through a partial version before the final one.
    let aapl_versions: Vec<_> = result
        .history
        .iter()
        .filter(|s| s.instrument_id == "AAPL")
        .collect();
    assert_eq!(aapl_versions.len(), 2);
    assert_eq!(aapl_versions[0].phase, AggregationPhase::PartiallyAggregated);
    assert_eq!(aapl_versions[0].version, 1);
    assert_eq!(aapl_versions[1].version, 2);
}

#[tokio::test]
async fn cancelling_one_request_leaves_others_untouched() {
    let h = Harness::new(QuorumConfig::default());
    h.agent(
        fast("tech", "technical"),
        Arc::new(
            ScriptedAgent::responding("tech", Direction::Buy, dec!(0.7))
                .with_script("AAPL", Script::Hang),
        ),
    )
    .group(TickerGroup::new("alpha", &["AAPL"]))
    .group(TickerGroup::new("beta", &["MSFT"]));

    let alpha = h
        .orchestrator
        .submit(AnalysisRequest::new("alpha", &["technical"]))
        .unwrap();
    let beta = h
        .orchestrator
        .submit(AnalysisRequest::new("beta", &["technical"]))
        .unwrap();
    h.orchestrator.cancel(alpha).unwrap();

    let alpha = h.orchestrator.wait(alpha).await.unwrap();
    let beta = h.orchestrator.wait(beta).await.unwrap();

    assert_eq!(alpha.status, RequestStatus::Cancelled);
    assert_eq!(alpha.tasks[0].failure, Some(FailureKind::Cancelled));
    assert_eq!(alpha.tasks[0].state, TaskState::Cancelled);
    assert_eq!(alpha.signal_for("AAPL").unwrap().consensus_direction, None);

    assert_eq!(beta.status, RequestStatus::Completed);
    assert_eq!(
        beta.signal_for("MSFT").unwrap().consensus_direction,
        Some(Direction::Buy)
    );

    // Cancelling a finished request is a no-op.
    h.orchestrator.cancel(beta.request_id).unwrap();
    assert_eq!(
        h.orchestrator.result(beta.request_id).unwrap().status,
        RequestStatus::Completed
    );
}

#[tokio::test]
async fn failures_on_one_instrument_leave_the_other_untouched() {
    let h = Harness::new(QuorumConfig::default());
    h.agent(
        fast("tech", "technical"),
        Arc::new(
            ScriptedAgent::responding("tech", Direction::Buy, dec!(0.8))
                .with_script("AAPL", Script::Fail("feed down".into())),
        ),
    )
    .agent(
        fast("fund", "fundamental"),
        Arc::new(
            ScriptedAgent::responding("fund", Direction::Buy, dec!(0.6))
                .with_script("AAPL", Script::Panic),
        ),
    )
    .agent(
        fast("news", "sentiment"),
        Arc::new(
            ScriptedAgent::responding("news", Direction::Hold, dec!(0.3))
                .with_script("AAPL", Script::TimedOut(5)),
        ),
    )
    .group(TickerGroup::new("megacap", &["AAPL", "MSFT"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new(
            "megacap",
            &["technical", "fundamental", "sentiment"],
        ))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(result.status, RequestStatus::Completed);
    assert!(result
        .tasks
        .iter()
        .filter(|t| t.instrument_id == "AAPL")
        .all(|t| t.state != TaskState::Done));
    let msft_tasks: Vec<_> = result
        .tasks
        .iter()
        .filter(|t| t.instrument_id == "MSFT")
        .collect();
    assert_eq!(msft_tasks.len(), 3);
    assert!(msft_tasks.iter().all(|t| t.state == TaskState::Done));

    let msft = result.signal_for("MSFT").unwrap();
    assert_eq!(msft.consensus_direction, Some(Direction::Buy));
    assert_eq!(msft.completeness, dec!(1));
    assert!(msft.conflict_flags.is_empty());

    let aapl = result.signal_for("AAPL").unwrap();
    assert_eq!(aapl.consensus_direction, None);
    assert!(aapl.completeness.is_zero());
    assert!(aapl.has_flag(ConflictFlag::NoData));
}

#[tokio::test]
async fn cancel_group_stops_only_that_group() {
    let h = Harness::new(QuorumConfig::default());
    h.agent(
        fast("tech", "technical"),
        Arc::new(ScriptedAgent::hanging("tech")),
    )
    .group(TickerGroup::new("alpha", &["AAPL", "NVDA"]))
    .group(TickerGroup::new("beta", &["MSFT"]));

    let a1 = h
        .orchestrator
        .submit(AnalysisRequest::new("alpha", &["technical"]))
        .unwrap();
    let a2 = h
        .orchestrator
        .submit(AnalysisRequest::new("alpha", &["technical"]))
        .unwrap();
    let b = h
        .orchestrator
        .submit(AnalysisRequest::new("beta", &["technical"]))
        .unwrap();

    assert_eq!(h.orchestrator.cancel_group("alpha").unwrap(), 2);
    assert_eq!(
        h.orchestrator.wait(a1).await.unwrap().status,
        RequestStatus::Cancelled
    );
    assert_eq!(
        h.orchestrator.wait(a2).await.unwrap().status,
        RequestStatus::Cancelled
    );
    assert_eq!(h.orchestrator.active_requests(), vec![b]);
    h.orchestrator.cancel(b).unwrap();
}

#[tokio::test]
async fn timed_out_agent_yields_partial_consensus() {
    let mut config = QuorumConfig::default();
    config.scheduler.fast_deadline_ms = 100;

    let h = Harness::new(config);
    h.agent(
        fast("tech", "technical"),
        Arc::new(ScriptedAgent::responding("tech", Direction::Buy, dec!(0.9))),
    )
    .agent(fast("fund", "fundamental"), Arc::new(ScriptedAgent::hanging("fund")))
    .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical", "fundamental"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(result.status, RequestStatus::Completed);
    assert_eq!(result.completeness, dec!(0.5));
    let aapl = result.signal_for("AAPL").unwrap();
    assert_eq!(aapl.consensus_direction, Some(Direction::Buy));
    assert!(aapl.has_flag(ConflictFlag::MissingAgents));

    let fundamental = result
        .tasks
        .iter()
        .find(|t| t.capability == "fundamental")
        .unwrap();
    assert_eq!(fundamental.state, TaskState::TimedOut);
    assert_eq!(fundamental.failure, Some(FailureKind::TaskTimeout));
    assert_eq!(fundamental.attempts, 1);
}

#[tokio::test]
async fn request_deadline_finalizes_with_what_arrived() {
    let mut config = QuorumConfig::default();
    config.scheduler.slow_deadline_ms = 5_000;

    let h = Harness::new(config);
    h.agent(
        fast("tech", "technical"),
        Arc::new(ScriptedAgent::responding("tech", Direction::Sell, dec!(0.6))),
    )
    .agent(
        AgentDescriptor::new("fund", &["fundamental"], LatencyClass::Slow),
        Arc::new(ScriptedAgent::hanging("fund")),
    )
    .group(
        TickerGroup::new("solo", &["AAPL"]).with_policy(SchedulingPolicy {
            request_deadline_seconds: Some(1),
            ..SchedulingPolicy::default()
        }),
    );

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical", "fundamental"]))
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(3), h.orchestrator.wait(id))
        .await
        .expect("request deadline should finish the request")
        .unwrap();

    assert_eq!(result.status, RequestStatus::Completed);
    let aapl = result.signal_for("AAPL").unwrap();
    assert_eq!(aapl.phase, AggregationPhase::Finalized);
    assert_eq!(aapl.consensus_direction, Some(Direction::Sell));
    let fundamental = aapl
        .contributing_signals
        .iter()
        .find(|c| c.capability == "fundamental")
        .unwrap();
    assert_eq!(
        fundamental.outcome,
        ContributionOutcome::Missing(FailureKind::AggregationIncomplete)
    );
    // The hanging task has not settled yet.
    assert_eq!(result.tasks.len(), 1);
}

#[tokio::test]
async fn aggregation_deadline_emits_partial_before_any_signal() {
    let mut config = QuorumConfig::default();
    config.aggregator.aggregation_deadline_ms = 50;

    let h = Harness::new(config);
    h.agent(
        fast("tech", "technical"),
        Arc::new(
            ScriptedAgent::responding("tech", Direction::Buy, dec!(0.7))
                .with_delay(Duration::from_millis(400)),
        ),
    )
    .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(result.history.len(), 2);
    let partial = &result.history[0];
    assert_eq!(partial.phase, AggregationPhase::PartiallyAggregated);
    assert_eq!(partial.consensus_direction, None);
    assert!(partial.has_flag(ConflictFlag::NoData));
    assert_eq!(partial.completeness, dec!(0));

    let last = &result.history[1];
    assert_eq!(last.version, 2);
    assert_eq!(last.phase, AggregationPhase::Finalized);
    assert_eq!(last.consensus_direction, Some(Direction::Buy));
}

#[tokio::test]
async fn late_signal_creates_new_version_within_ttl() {
    let h = Harness::new(QuorumConfig::default());
    h.agent(
        fast("tech", "technical"),
        Arc::new(ScriptedAgent::responding("tech", Direction::Buy, dec!(0.7))),
    )
    .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical"]))
        .unwrap();
    let first = h.orchestrator.wait(id).await.unwrap();
    let version = first.signal_for("AAPL").unwrap().version;

    let correction = Signal {
        instrument_id: "AAPL".to_string(),
        agent_id: "tech".to_string(),
        direction: Direction::Sell,
        confidence: dec!(0.9),
        rationale: "revised".to_string(),
        produced_at: Utc::now() + ChronoDuration::seconds(1),
        ttl_seconds: 600,
    };
    let updated = h
        .orchestrator
        .accept_late_signal(id, correction)
        .unwrap()
        .expect("live signal from an assigned agent is accepted");
    assert_eq!(updated.version, version + 1);
    assert_eq!(updated.consensus_direction, Some(Direction::Sell));
    assert_eq!(updated.phase, AggregationPhase::Finalized);

    let expired = Signal {
        instrument_id: "AAPL".to_string(),
        agent_id: "tech".to_string(),
        direction: Direction::Hold,
        confidence: dec!(0.5),
        rationale: "stale".to_string(),
        produced_at: Utc::now() - ChronoDuration::hours(2),
        ttl_seconds: 60,
    };
    assert!(h.orchestrator.accept_late_signal(id, expired).unwrap().is_none());

    let stranger = Signal {
        agent_id: "someone-else".to_string(),
        produced_at: Utc::now(),
        ..updated.contributing_signals[0].signal.clone().unwrap()
    };
    assert!(h.orchestrator.accept_late_signal(id, stranger).unwrap().is_none());

    let result = h.orchestrator.result(id).unwrap();
    assert_eq!(
        result.signal_for("AAPL").unwrap().consensus_direction,
        Some(Direction::Sell)
    );
}

#[tokio::test]
async fn evenly_split_votes_are_flagged() {
    let h = Harness::new(QuorumConfig::default());
    h.agent(
        fast("tech", "technical"),
        Arc::new(ScriptedAgent::responding("tech", Direction::Buy, dec!(0.5))),
    )
    .agent(
        fast("fund", "fundamental"),
        Arc::new(ScriptedAgent::responding("fund", Direction::Sell, dec!(0.5))),
    )
    .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical", "fundamental"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    let aapl = result.signal_for("AAPL").unwrap();
    assert!(aapl.has_flag(ConflictFlag::LowMarginConsensus));
    // Ties resolve toward the more conservative direction.
    assert_eq!(aapl.consensus_direction, Some(Direction::Sell));
    assert_eq!(aapl.consensus_confidence, dec!(0.5));
}

#[tokio::test]
async fn cyclic_dependencies_are_rejected_before_dispatch() {
    let h = Harness::new(QuorumConfig::default());
    let tech = Arc::new(ScriptedAgent::responding("tech", Direction::Buy, dec!(0.5)));
    let fund = Arc::new(ScriptedAgent::responding("fund", Direction::Buy, dec!(0.5)));
    h.agent(fast("tech", "technical"), tech.clone())
        .agent(fast("fund", "fundamental"), fund.clone())
        .group(TickerGroup::new("solo", &["AAPL"]));

    let request = AnalysisRequest::new("solo", &["technical", "fundamental"])
        .with_dependency(DependencyEdge::new("technical", "fundamental"))
        .with_dependency(DependencyEdge::new("fundamental", "technical"));
    let err = h.orchestrator.submit(request).unwrap_err();

    match err {
        OrchestratorError::InvalidGraph(GraphError::Cycle(stuck)) => {
            assert_eq!(stuck, vec!["fundamental".to_string(), "technical".to_string()]);
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tech.calls() + fund.calls(), 0);
    assert!(h.orchestrator.active_requests().is_empty());
}

#[tokio::test]
async fn dependents_receive_upstream_signals() {
    let h = Harness::new(QuorumConfig::default());
    let synthesis = Arc::new(ScriptedAgent::responding("synth", Direction::Buy, dec!(0.6)));
    h.agent(
        fast("tech", "technical"),
        Arc::new(ScriptedAgent::responding("tech", Direction::Buy, dec!(0.8))),
    )
    .agent(
        fast("fund", "fundamental"),
        Arc::new(ScriptedAgent::responding("fund", Direction::Hold, dec!(0.4))),
    )
    .agent(fast("synth", "synthesis"), synthesis.clone())
    .group(TickerGroup::new("solo", &["AAPL"]));

    let request = AnalysisRequest::new("solo", &["technical", "fundamental", "synthesis"])
        .with_dependency(DependencyEdge::new("synthesis", "*"));
    let id = h.orchestrator.submit(request).unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(result.completeness, dec!(1));
    let inputs = synthesis.inputs();
    assert_eq!(inputs.len(), 1);
    let mut upstream: Vec<&str> = inputs[0].upstream.iter().map(|s| s.agent_id.as_str()).collect();
    upstream.sort_unstable();
    assert_eq!(upstream, vec!["fund", "tech"]);
}

#[tokio::test]
async fn failed_prerequisite_still_releases_dependent() {
    let mut config = QuorumConfig::default();
    config.scheduler.max_attempts = 1;

    let h = Harness::new(config);
    let synthesis = Arc::new(ScriptedAgent::responding("synth", Direction::Hold, dec!(0.5)));
    h.agent(fast("tech", "technical"), Arc::new(ScriptedAgent::failing("tech")))
        .agent(fast("synth", "synthesis"), synthesis.clone())
        .group(TickerGroup::new("solo", &["AAPL"]));

    let request = AnalysisRequest::new("solo", &["technical", "synthesis"])
        .with_dependency(DependencyEdge::new("synthesis", "technical"));
    let id = h.orchestrator.submit(request).unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    let technical = result.tasks.iter().find(|t| t.capability == "technical").unwrap();
    assert_eq!(technical.failure, Some(FailureKind::AgentCrash));
    assert_eq!(technical.state, TaskState::Failed);
    assert_eq!(synthesis.calls(), 1);
    assert!(synthesis.inputs()[0].upstream.is_empty());
    assert_eq!(result.completeness, dec!(0.5));
}

#[tokio::test]
async fn failing_agent_fails_over_to_next_candidate() {
    let h = Harness::new(QuorumConfig::default());
    let primary = Arc::new(ScriptedAgent::failing("tech-a"));
    h.agent(fast("tech-a", "technical"), primary.clone())
        .agent(
            fast("tech-b", "technical"),
            Arc::new(ScriptedAgent::responding("tech-b", Direction::Buy, dec!(0.75))),
        )
        .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(primary.calls(), 1);
    let task = &result.tasks[0];
    assert_eq!(task.state, TaskState::Done);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.agent_id.as_deref(), Some("tech-b"));
    assert_eq!(result.completeness, dec!(1));
}

#[tokio::test]
async fn agent_side_timeout_is_reported_as_timeout_without_failover() {
    let h = Harness::new(QuorumConfig::default());
    let primary = Arc::new(ScriptedAgent::new("tech-a", Script::TimedOut(30_000)));
    let backup = Arc::new(ScriptedAgent::responding("tech-b", Direction::Buy, dec!(0.75)));
    h.agent(fast("tech-a", "technical"), primary.clone())
        .agent(fast("tech-b", "technical"), backup.clone())
        .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    let task = &result.tasks[0];
    assert_eq!(task.state, TaskState::TimedOut);
    assert_eq!(task.failure, Some(FailureKind::TaskTimeout));
    assert_eq!(task.attempts, 1);
    assert!(task.reason.as_deref().unwrap().contains("30000"));
    assert_eq!(primary.calls(), 1);
    assert_eq!(backup.calls(), 0);
    assert!(result.completeness.is_zero());
}

#[tokio::test]
async fn out_of_range_confidence_counts_as_failure() {
    let mut config = QuorumConfig::default();
    config.scheduler.max_attempts = 1;

    let h = Harness::new(config);
    h.agent(
        fast("tech", "technical"),
        Arc::new(ScriptedAgent::responding("tech", Direction::Buy, dec!(1.4))),
    )
    .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(result.tasks[0].failure, Some(FailureKind::AgentCrash));
    assert!(result.tasks[0].reason.as_deref().unwrap().contains("outside"));
    assert_eq!(result.signal_for("AAPL").unwrap().consensus_direction, None);
}

#[tokio::test]
async fn panicking_agent_is_reported_as_crash() {
    let mut config = QuorumConfig::default();
    config.scheduler.max_attempts = 1;

    let h = Harness::new(config);
    h.agent(fast("tech", "technical"), Arc::new(ScriptedAgent::panicking("tech")))
        .agent(
            fast("fund", "fundamental"),
            Arc::new(ScriptedAgent::responding("fund", Direction::Hold, dec!(0.6))),
        )
        .group(TickerGroup::new("solo", &["AAPL"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical", "fundamental"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    let technical = result.tasks.iter().find(|t| t.capability == "technical").unwrap();
    assert_eq!(technical.failure, Some(FailureKind::AgentCrash));
    assert_eq!(
        result.signal_for("AAPL").unwrap().consensus_direction,
        Some(Direction::Hold)
    );
}

#[tokio::test]
async fn disabled_agent_is_not_dispatched() {
    let h = Harness::new(QuorumConfig::default());
    let cheap = Arc::new(ScriptedAgent::responding("tech-cheap", Direction::Sell, dec!(0.5)));
    h.agent(fast("tech-cheap", "technical").with_cost(dec!(0.1)), cheap.clone())
        .agent(
            fast("tech-pricey", "technical").with_cost(dec!(2)),
            Arc::new(ScriptedAgent::responding("tech-pricey", Direction::Buy, dec!(0.5))),
        )
        .group(TickerGroup::new("solo", &["AAPL"]));
    h.orchestrator
        .registry()
        .report_health("tech-cheap", HealthStatus::Disabled)
        .unwrap();

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(cheap.calls(), 0);
    assert_eq!(result.tasks[0].agent_id.as_deref(), Some("tech-pricey"));

    // With every server disabled the capability is unavailable.
    h.orchestrator
        .registry()
        .report_health("tech-pricey", HealthStatus::Disabled)
        .unwrap();
    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("solo", &["technical"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();
    assert_eq!(result.tasks[0].failure, Some(FailureKind::CapabilityUnavailable));
    assert!(result
        .signal_for("AAPL")
        .unwrap()
        .has_flag(ConflictFlag::NoData));
}

#[tokio::test]
async fn small_group_is_not_starved_by_a_large_one() {
    let mut config = QuorumConfig::default();
    config.scheduler.worker_pool_size = 2;

    let h = Harness::new(config);
    h.agent(
        fast("tech", "technical"),
        Arc::new(
            ScriptedAgent::responding("tech", Direction::Buy, dec!(0.6))
                .with_delay(Duration::from_millis(100)),
        ),
    )
    .group(TickerGroup::new(
        "universe",
        &["A", "B", "C", "D", "E", "F", "G", "H"],
    ))
    .group(TickerGroup::new("focus", &["AAPL"]));

    let big = h
        .orchestrator
        .submit(AnalysisRequest::new("universe", &["technical"]))
        .unwrap();
    let small = h
        .orchestrator
        .submit(AnalysisRequest::new("focus", &["technical"]))
        .unwrap();

    let small_first = tokio::select! {
        _ = h.orchestrator.wait(small) => true,
        _ = h.orchestrator.wait(big) => false,
    };
    assert!(small_first, "the single-instrument group should finish first");

    let big = h.orchestrator.wait(big).await.unwrap();
    assert_eq!(big.completeness, dec!(1));
    assert!(h.orchestrator.busy_workers() <= 2);
}

/// Make rising close bars (uptrend).
fn make_rising_bars(start: f64, count: usize) -> String {
    let bars: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            let close = start + i as f64;
            serde_json::json!({
                "open": close - 0.5,
                "high": close + 0.5,
                "low": close - 1.0,
                "close": close,
                "volume": 10000.0,
            })
        })
        .collect();
    serde_json::to_string(&bars).unwrap()
}

fn cache_row(key: &str, category: &str, symbol: &str, value_json: &str) -> CacheRow {
    let now = Utc::now();
    CacheRow {
        key: key.to_string(),
        category: category.to_string(),
        value_json: value_json.to_string(),
        source: "test".to_string(),
        symbol: Some(symbol.to_string()),
        created_at: now.to_rfc3339(),
        expires_at: (now + ChronoDuration::hours(1)).to_rfc3339(),
        updated_at: now.to_rfc3339(),
    }
}

#[tokio::test]
async fn agents_read_market_context_from_the_cache() {
    let sqlite = SqliteCache::open_in_memory().unwrap();
    sqlite
        .insert(&cache_row(
            &key_patterns::indicator("rsi_14", "AAPL"),
            "indicator",
            "AAPL",
            r#"{"value": [45.0, 24.0]}"#,
        ))
        .unwrap();
    sqlite
        .insert(&cache_row(
            &key_patterns::bars("AAPL", "5m"),
            "market_data",
            "AAPL",
            &make_rising_bars(180.0, 6),
        ))
        .unwrap();
    sqlite
        .insert(&cache_row(
            &key_patterns::indicator("rsi_14", "TSLA"),
            "indicator",
            "TSLA",
            r#"{"value": [60.0, 82.0]}"#,
        ))
        .unwrap();
    let context = Arc::new(ContextReader::new(sqlite, 100, Duration::from_secs(60)));

    let h = Harness::with_context(QuorumConfig::default(), context);
    h.agent(fast("indicators", "technical"), Arc::new(IndicatorAgent::new("indicators")))
        .group(TickerGroup::new("pair", &["AAPL", "TSLA"]));

    let id = h
        .orchestrator
        .submit(AnalysisRequest::new("pair", &["technical"]))
        .unwrap();
    let result = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(
        result.signal_for("AAPL").unwrap().consensus_direction,
        Some(Direction::Buy)
    );
    assert_eq!(
        result.signal_for("TSLA").unwrap().consensus_direction,
        Some(Direction::Sell)
    );
}
