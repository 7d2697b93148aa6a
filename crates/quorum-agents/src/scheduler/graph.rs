use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use quorum_models::{
    AnalysisRequest, DependencyEdge, PriorityTier, Task, TaskState, TickerGroup, ALL_CAPABILITIES,
};
use uuid::Uuid;

use crate::error::GraphError;
use crate::registry::AgentRegistry;

/// The tasks of one request, validated and ready for admission.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub request_id: Uuid,
    pub group_id: String,
    pub tier: PriorityTier,
    pub max_concurrency: Option<usize>,
    /// Ordered by instrument (group order), then capability (request order).
    pub tasks: Vec<Task>,
}

impl TaskGraph {
    /// Each instrument with the capabilities requested for it, in task order.
    pub fn plan(&self) -> Vec<(String, Vec<String>)> {
        let mut plan: Vec<(String, Vec<String>)> = Vec::new();
        for task in &self.tasks {
            match plan.last_mut() {
                Some((instrument, caps)) if *instrument == task.instrument_id => {
                    caps.push(task.capability.clone())
                }
                _ => plan.push((task.instrument_id.clone(), vec![task.capability.clone()])),
            }
        }
        plan
    }

    pub fn task(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

/// capability -> prerequisite capabilities, for one instrument.
type CapabilityDeps = BTreeMap<String, BTreeSet<String>>;

fn edge_applies(edge: &DependencyEdge, instrument: &str) -> bool {
    edge.instrument_id.as_deref().map_or(true, |i| i == instrument)
}

fn validate_edge(
    edge: &DependencyEdge,
    requested: &HashSet<&str>,
    instruments: &HashSet<&str>,
) -> Result<(), GraphError> {
    if !requested.contains(edge.capability.as_str()) {
        return Err(GraphError::UnknownCapability(edge.capability.clone()));
    }
    if edge.requires != ALL_CAPABILITIES && !requested.contains(edge.requires.as_str()) {
        return Err(GraphError::UnknownCapability(edge.requires.clone()));
    }
    for instrument in [&edge.instrument_id, &edge.requires_instrument_id]
        .into_iter()
        .flatten()
    {
        if !instruments.contains(instrument.as_str()) {
            return Err(GraphError::UnknownInstrument(instrument.clone()));
        }
    }
    if edge.capability == edge.requires {
        return Err(GraphError::Cycle(vec![edge.capability.clone()]));
    }
    Ok(())
}

fn dependencies_for(
    instrument: &str,
    capabilities: &[String],
    edges: &[DependencyEdge],
) -> Result<CapabilityDeps, GraphError> {
    let mut deps: CapabilityDeps = capabilities
        .iter()
        .map(|c| (c.clone(), BTreeSet::new()))
        .collect();

    for edge in edges.iter().filter(|e| edge_applies(e, instrument)) {
        if let Some(required_on) = &edge.requires_instrument_id {
            if required_on != instrument {
                return Err(GraphError::CrossInstrument {
                    capability: edge.capability.clone(),
                    instrument: instrument.to_string(),
                    requires: edge.requires.clone(),
                    requires_instrument: required_on.clone(),
                });
            }
        }

        let prerequisites: Vec<&String> = if edge.requires == ALL_CAPABILITIES {
            capabilities.iter().filter(|c| **c != edge.capability).collect()
        } else {
            vec![&edge.requires]
        };
        if let Some(set) = deps.get_mut(&edge.capability) {
            set.extend(prerequisites.into_iter().cloned());
        }
    }

    check_acyclic(&deps)?;
    Ok(deps)
}

/// Kahn's algorithm. Whatever cannot be ordered sits on or behind a cycle.
fn check_acyclic(deps: &CapabilityDeps) -> Result<(), GraphError> {
    let mut remaining: HashMap<&str, usize> =
        deps.iter().map(|(c, reqs)| (c.as_str(), reqs.len())).collect();
    let mut ready: Vec<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(c, _)| *c)
        .collect();

    while let Some(done) = ready.pop() {
        remaining.remove(done);
        for (capability, reqs) in deps {
            if reqs.contains(done) {
                if let Some(n) = remaining.get_mut(capability.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(capability.as_str());
                    }
                }
            }
        }
    }

    if remaining.is_empty() {
        Ok(())
    } else {
        let mut stuck: Vec<String> = remaining.keys().map(|c| c.to_string()).collect();
        stuck.sort();
        Err(GraphError::Cycle(stuck))
    }
}

/// Expand a request into one task per (instrument, capability).
///
/// Rejects the whole request, before anything is dispatched, when an edge is
/// malformed, crosses instruments, or forms a cycle. A capability no agent
/// serves is not an error here: its tasks carry no candidates and fail with
/// `CapabilityUnavailable` on admission.
pub fn build_task_graph(
    request_id: Uuid,
    group: &TickerGroup,
    request: &AnalysisRequest,
    registry: &AgentRegistry,
    now: DateTime<Utc>,
) -> Result<TaskGraph, GraphError> {
    if request.capabilities.is_empty() {
        return Err(GraphError::NoCapabilities);
    }
    let mut requested = HashSet::new();
    for capability in &request.capabilities {
        if !requested.insert(capability.as_str()) {
            return Err(GraphError::DuplicateCapability(capability.clone()));
        }
    }
    let instruments: HashSet<&str> = group.instrument_ids.iter().map(String::as_str).collect();
    for edge in &request.dependencies {
        validate_edge(edge, &requested, &instruments)?;
    }

    let candidates: HashMap<&str, Vec<String>> = request
        .capabilities
        .iter()
        .map(|c| {
            let ids = registry.resolve(c).into_iter().map(|d| d.id).collect();
            (c.as_str(), ids)
        })
        .collect();

    let tier = request.priority_tier.unwrap_or(group.priority_tier);
    let mut tasks = Vec::with_capacity(group.instrument_ids.len() * request.capabilities.len());

    for instrument in &group.instrument_ids {
        let deps = dependencies_for(instrument, &request.capabilities, &request.dependencies)?;
        let ids: HashMap<&str, Uuid> = request
            .capabilities
            .iter()
            .map(|c| (c.as_str(), Uuid::new_v4()))
            .collect();

        for capability in &request.capabilities {
            let dependents = deps.values().filter(|reqs| reqs.contains(capability)).count();
            let depends_on = deps
                .get(capability)
                .map(|reqs| reqs.iter().filter_map(|r| ids.get(r.as_str()).copied()).collect())
                .unwrap_or_default();
            let candidate_agents = candidates
                .get(capability.as_str())
                .cloned()
                .unwrap_or_default();

            tasks.push(Task {
                id: ids[capability.as_str()],
                request_id,
                group_id: group.id.clone(),
                instrument_id: instrument.clone(),
                capability: capability.clone(),
                agent_id: None,
                candidate_agents,
                attempt: 0,
                priority: dependents.min(u8::MAX as usize) as u8,
                depends_on,
                created_at: now,
                dispatched_at: None,
                deadline: None,
                state: TaskState::Queued,
            });
        }
    }

    Ok(TaskGraph {
        request_id,
        group_id: group.id.clone(),
        tier,
        max_concurrency: group.scheduling_policy.max_concurrency,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedAgent;
    use quorum_models::{AgentDescriptor, Direction, LatencyClass};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn registry() -> AgentRegistry {
        let registry = AgentRegistry::new();
        for (id, capability) in [
            ("tech", "technical"),
            ("fund", "fundamental"),
            ("sent", "sentiment"),
        ] {
            registry
                .register(
                    AgentDescriptor::new(id, &[capability], LatencyClass::Fast),
                    Arc::new(ScriptedAgent::responding(id, Direction::Hold, dec!(0.5))),
                )
                .unwrap();
        }
        registry
    }

    fn group() -> TickerGroup {
        TickerGroup::new("g", &["AAPL", "MSFT"])
    }

    fn build(request: &AnalysisRequest) -> Result<TaskGraph, GraphError> {
        build_task_graph(Uuid::new_v4(), &group(), request, &registry(), Utc::now())
    }

    #[test]
    fn one_task_per_instrument_and_capability() {
        let graph = build(&AnalysisRequest::new("g", &["technical", "fundamental"])).unwrap();
        assert_eq!(graph.tasks.len(), 4);
        assert_eq!(
            graph.plan(),
            vec![
                ("AAPL".to_string(), vec!["technical".to_string(), "fundamental".to_string()]),
                ("MSFT".to_string(), vec!["technical".to_string(), "fundamental".to_string()]),
            ]
        );
        assert!(graph.tasks.iter().all(|t| t.state == TaskState::Queued));
        assert_eq!(graph.tasks[0].candidate_agents, vec!["tech"]);
    }

    #[test]
    fn dependencies_stay_within_instrument_and_boost_priority() {
        let request = AnalysisRequest::new("g", &["technical", "sentiment"])
            .with_dependency(DependencyEdge::new("sentiment", "technical"));
        let graph = build(&request).unwrap();

        for instrument in ["AAPL", "MSFT"] {
            let technical = graph
                .tasks
                .iter()
                .find(|t| t.instrument_id == instrument && t.capability == "technical")
                .unwrap();
            let sentiment = graph
                .tasks
                .iter()
                .find(|t| t.instrument_id == instrument && t.capability == "sentiment")
                .unwrap();
            assert_eq!(sentiment.depends_on, vec![technical.id]);
            assert_eq!(technical.priority, 1);
            assert_eq!(sentiment.priority, 0);
        }
    }

    #[test]
    fn wildcard_requires_every_other_capability() {
        let request = AnalysisRequest::new("g", &["technical", "fundamental", "sentiment"])
            .with_dependency(DependencyEdge::new("sentiment", ALL_CAPABILITIES));
        let graph = build(&request).unwrap();
        let sentiment = graph
            .tasks
            .iter()
            .find(|t| t.instrument_id == "AAPL" && t.capability == "sentiment")
            .unwrap();
        assert_eq!(sentiment.depends_on.len(), 2);
    }

    #[test]
    fn instrument_scoped_edge_applies_only_there() {
        let mut edge = DependencyEdge::new("sentiment", "technical");
        edge.instrument_id = Some("MSFT".to_string());
        let request = AnalysisRequest::new("g", &["technical", "sentiment"]).with_dependency(edge);
        let graph = build(&request).unwrap();

        let aapl = graph
            .tasks
            .iter()
            .find(|t| t.instrument_id == "AAPL" && t.capability == "sentiment")
            .unwrap();
        let msft = graph
            .tasks
            .iter()
            .find(|t| t.instrument_id == "MSFT" && t.capability == "sentiment")
            .unwrap();
        assert!(aapl.depends_on.is_empty());
        assert_eq!(msft.depends_on.len(), 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let request = AnalysisRequest::new("g", &["technical", "fundamental", "sentiment"])
            .with_dependency(DependencyEdge::new("technical", "fundamental"))
            .with_dependency(DependencyEdge::new("fundamental", "sentiment"))
            .with_dependency(DependencyEdge::new("sentiment", "technical"));
        assert_eq!(
            build(&request).unwrap_err(),
            GraphError::Cycle(vec![
                "fundamental".to_string(),
                "sentiment".to_string(),
                "technical".to_string()
            ])
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let request = AnalysisRequest::new("g", &["technical"])
            .with_dependency(DependencyEdge::new("technical", "technical"));
        assert!(matches!(build(&request), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn cross_instrument_edge_is_rejected() {
        let mut edge = DependencyEdge::new("sentiment", "technical");
        edge.instrument_id = Some("AAPL".to_string());
        edge.requires_instrument_id = Some("MSFT".to_string());
        let request = AnalysisRequest::new("g", &["technical", "sentiment"]).with_dependency(edge);
        assert!(matches!(
            build(&request),
            Err(GraphError::CrossInstrument { .. })
        ));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert_eq!(
            build(&AnalysisRequest::new("g", &[])).unwrap_err(),
            GraphError::NoCapabilities
        );
        assert_eq!(
            build(&AnalysisRequest::new("g", &["technical", "technical"])).unwrap_err(),
            GraphError::DuplicateCapability("technical".to_string())
        );
        let unknown = AnalysisRequest::new("g", &["technical"])
            .with_dependency(DependencyEdge::new("technical", "fundamental"));
        assert_eq!(
            build(&unknown).unwrap_err(),
            GraphError::UnknownCapability("fundamental".to_string())
        );
        let mut outside = DependencyEdge::new("sentiment", "technical");
        outside.instrument_id = Some("TSLA".to_string());
        let request = AnalysisRequest::new("g", &["technical", "sentiment"]).with_dependency(outside);
        assert_eq!(
            build(&request).unwrap_err(),
            GraphError::UnknownInstrument("TSLA".to_string())
        );
    }

    #[test]
    fn unserved_capability_yields_task_without_candidates() {
        let graph = build(&AnalysisRequest::new("g", &["alternative"])).unwrap();
        assert!(graph.tasks.iter().all(|t| t.candidate_agents.is_empty()));
    }

    #[test]
    fn request_tier_overrides_group_tier() {
        let request = AnalysisRequest::new("g", &["technical"]).with_tier(PriorityTier::Critical);
        assert_eq!(build(&request).unwrap().tier, PriorityTier::Critical);
        assert_eq!(
            build(&AnalysisRequest::new("g", &["technical"])).unwrap().tier,
            PriorityTier::Normal
        );
    }
}
