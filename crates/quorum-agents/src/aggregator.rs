use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use quorum_models::{
    AggregatedSignal, AggregationPhase, AggregatorConfig, ConflictFlag, Contribution,
    ContributionOutcome, Direction, FailureKind, Signal, SignalKey, WeightingScheme,
};
use rust_decimal::Decimal;
use tracing::debug;

use crate::scheduler::{TaskEvent, TaskOutcome};

/// Consensus over a set of contributions. Pure and deterministic: the same
/// contributions in any order give the same result.
///
/// Responded contributions whose signal has expired at `now` are rewritten to
/// `Missing(Expired)` and excluded from the vote.
pub fn aggregate(
    instrument_id: &str,
    mut contributions: Vec<Contribution>,
    config: &AggregatorConfig,
    phase: AggregationPhase,
    version: u32,
    now: DateTime<Utc>,
) -> AggregatedSignal {
    contributions.sort_by(|a, b| {
        a.capability
            .cmp(&b.capability)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });

    let mut flags = BTreeSet::new();
    let mut scores: BTreeMap<Direction, Decimal> = BTreeMap::new();
    let mut responded = 0u32;

    for contribution in &mut contributions {
        match contribution.outcome {
            ContributionOutcome::Responded => {
                let Some(signal) = contribution.signal.as_ref() else {
                    continue;
                };
                if !signal.is_live(now) {
                    contribution.outcome = ContributionOutcome::Missing(FailureKind::Expired);
                    flags.insert(ConflictFlag::StaleSignals);
                    continue;
                }
                let score = match config.weighting {
                    WeightingScheme::ConfidenceWeighted => signal.confidence * contribution.weight,
                    WeightingScheme::MajorityVote => contribution.weight,
                };
                *scores.entry(signal.direction).or_insert(Decimal::ZERO) += score;
                responded += 1;
            }
            ContributionOutcome::Missing(_) => {
                flags.insert(ConflictFlag::MissingAgents);
            }
            ContributionOutcome::Pending => {}
        }
    }

    let required = contributions.len() as u32;
    let completeness = if required == 0 {
        Decimal::ZERO
    } else {
        Decimal::from(responded) / Decimal::from(required)
    };

    let (consensus_direction, consensus_confidence) = if responded == 0 {
        flags.insert(ConflictFlag::NoData);
        (None, Decimal::ZERO)
    } else {
        let mut ranked: Vec<(Direction, Decimal)> = Direction::ALL
            .iter()
            .map(|d| (*d, scores.get(d).copied().unwrap_or(Decimal::ZERO)))
            .collect();
        ranked.sort_by(|(da, sa), (db, sb)| sb.cmp(sa).then_with(|| da.tie_rank().cmp(&db.tie_rank())));

        let (top_direction, top) = ranked[0];
        let runner_up = ranked[1].1;
        let total: Decimal = ranked.iter().map(|(_, s)| *s).sum();

        if top > Decimal::ZERO && top - runner_up < config.conflict_threshold * top {
            flags.insert(ConflictFlag::LowMarginConsensus);
        }
        let confidence = top.checked_div(total).unwrap_or(Decimal::ZERO);
        (Some(top_direction), confidence)
    };

    AggregatedSignal {
        instrument_id: instrument_id.to_string(),
        version,
        consensus_direction,
        consensus_confidence,
        completeness,
        phase,
        contributing_signals: contributions,
        conflict_flags: flags.into_iter().collect(),
        computed_at: now,
    }
}

#[derive(Debug, Clone)]
struct Slot {
    capability: String,
    agent_id: Option<String>,
    outcome: ContributionOutcome,
    signal: Option<Signal>,
}

/// Aggregation state for one instrument of one request: one slot per requested
/// capability.
#[derive(Debug, Clone)]
pub struct InstrumentWindow {
    instrument_id: String,
    slots: Vec<Slot>,
    seen: HashSet<SignalKey>,
    phase: AggregationPhase,
    version: u32,
    latest: Option<AggregatedSignal>,
}

impl InstrumentWindow {
    pub fn new(instrument_id: &str, capabilities: &[String]) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            slots: capabilities
                .iter()
                .map(|c| Slot {
                    capability: c.clone(),
                    agent_id: None,
                    outcome: ContributionOutcome::Pending,
                    signal: None,
                })
                .collect(),
            seen: HashSet::new(),
            phase: AggregationPhase::Awaiting,
            version: 0,
            latest: None,
        }
    }

    pub fn phase(&self) -> AggregationPhase {
        self.phase
    }

    pub fn latest(&self) -> Option<&AggregatedSignal> {
        self.latest.as_ref()
    }

    pub fn responded(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.outcome == ContributionOutcome::Responded)
            .count()
    }

    pub fn required(&self) -> usize {
        self.slots.len()
    }

    fn all_settled(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.outcome != ContributionOutcome::Pending)
    }

    fn advance_phase(&mut self) {
        if self.phase == AggregationPhase::Finalized {
            return;
        }
        self.phase = if self.all_settled() {
            AggregationPhase::Finalized
        } else {
            AggregationPhase::PartiallyAggregated
        };
    }

    fn recompute(&mut self, config: &AggregatorConfig, now: DateTime<Utc>) -> AggregatedSignal {
        let contributions = self
            .slots
            .iter()
            .map(|slot| Contribution {
                capability: slot.capability.clone(),
                agent_id: slot.agent_id.clone(),
                outcome: slot.outcome,
                weight: slot
                    .agent_id
                    .as_deref()
                    .map(|id| config.weight_for(id))
                    .unwrap_or(config.default_weight),
                signal: slot.signal.clone(),
            })
            .collect();
        self.version += 1;
        let result = aggregate(
            &self.instrument_id,
            contributions,
            config,
            self.phase,
            self.version,
            now,
        );
        debug!(
            instrument = %self.instrument_id,
            version = result.version,
            phase = ?result.phase,
            direction = ?result.consensus_direction,
            "Aggregate recomputed"
        );
        self.latest = Some(result.clone());
        result
    }

    /// Place a signal in `slot_index`. Returns false for duplicate deliveries and
    /// for signals older than the one already held for the same agent.
    fn place_signal(&mut self, slot_index: usize, signal: Signal) -> bool {
        if !self.seen.insert(signal.key()) {
            return false;
        }
        let slot = &mut self.slots[slot_index];
        if let Some(held) = &slot.signal {
            if held.agent_id == signal.agent_id && held.produced_at >= signal.produced_at {
                return false;
            }
        }
        slot.agent_id = Some(signal.agent_id.clone());
        slot.outcome = ContributionOutcome::Responded;
        slot.signal = Some(signal);
        true
    }

    /// Fold one task outcome into the window. Returns the new version when the
    /// aggregate changed.
    pub fn apply(
        &mut self,
        event: &TaskEvent,
        config: &AggregatorConfig,
        now: DateTime<Utc>,
    ) -> Option<AggregatedSignal> {
        let index = self
            .slots
            .iter()
            .position(|s| s.capability == event.capability)?;

        match &event.outcome {
            TaskOutcome::Signal(signal) => {
                if !self.place_signal(index, signal.clone()) {
                    return None;
                }
            }
            TaskOutcome::Missing { kind, .. } => {
                let slot = &mut self.slots[index];
                match slot.outcome {
                    ContributionOutcome::Responded => return None,
                    ContributionOutcome::Missing(current) if current == *kind => return None,
                    // Already force-finalized as incomplete; record the real
                    // cause without emitting a new version.
                    ContributionOutcome::Missing(FailureKind::AggregationIncomplete) => {
                        slot.outcome = ContributionOutcome::Missing(*kind);
                        slot.agent_id = event.agent_id.clone();
                        return None;
                    }
                    _ => {
                        slot.outcome = ContributionOutcome::Missing(*kind);
                        slot.agent_id = event.agent_id.clone();
                    }
                }
            }
        }

        self.advance_phase();
        Some(self.recompute(config, now))
    }

    /// The aggregation deadline passed. Emits a partial version only if nothing
    /// has been emitted yet.
    pub fn on_deadline(
        &mut self,
        config: &AggregatorConfig,
        now: DateTime<Utc>,
    ) -> Option<AggregatedSignal> {
        if self.phase != AggregationPhase::Awaiting {
            return None;
        }
        self.phase = AggregationPhase::PartiallyAggregated;
        Some(self.recompute(config, now))
    }

    /// Finalize with whatever is present; pending slots become
    /// `Missing(AggregationIncomplete)`.
    pub fn force_finalize(
        &mut self,
        config: &AggregatorConfig,
        now: DateTime<Utc>,
    ) -> Option<AggregatedSignal> {
        if self.phase == AggregationPhase::Finalized {
            return None;
        }
        for slot in &mut self.slots {
            if slot.outcome == ContributionOutcome::Pending {
                slot.outcome = ContributionOutcome::Missing(FailureKind::AggregationIncomplete);
            }
        }
        self.phase = AggregationPhase::Finalized;
        Some(self.recompute(config, now))
    }

    /// Fold in a signal that arrived after its task was settled. Accepted only
    /// while the signal is live, and only for an agent already assigned to a
    /// slot of this window.
    pub fn accept_late(
        &mut self,
        signal: Signal,
        config: &AggregatorConfig,
        now: DateTime<Utc>,
    ) -> Option<AggregatedSignal> {
        if !signal.is_live(now) {
            return None;
        }
        let index = self
            .slots
            .iter()
            .position(|s| s.agent_id.as_deref() == Some(signal.agent_id.as_str()))?;
        if !self.place_signal(index, signal) {
            return None;
        }
        self.advance_phase();
        Some(self.recompute(config, now))
    }
}

/// Aggregation state for every instrument of one request.
pub struct SignalAggregator {
    config: AggregatorConfig,
    order: Vec<String>,
    windows: BTreeMap<String, InstrumentWindow>,
    history: Vec<AggregatedSignal>,
}

impl SignalAggregator {
    /// `plan` lists each instrument with the capabilities requested for it, in
    /// the order results should be reported.
    pub fn new(config: AggregatorConfig, plan: &[(String, Vec<String>)]) -> Self {
        Self {
            config,
            order: plan.iter().map(|(instrument, _)| instrument.clone()).collect(),
            windows: plan
                .iter()
                .map(|(instrument, caps)| {
                    (instrument.clone(), InstrumentWindow::new(instrument, caps))
                })
                .collect(),
            history: Vec::new(),
        }
    }

    fn record(&mut self, emitted: Option<AggregatedSignal>) -> Option<AggregatedSignal> {
        if let Some(aggregate) = &emitted {
            self.history.push(aggregate.clone());
        }
        emitted
    }

    pub fn apply(&mut self, event: &TaskEvent, now: DateTime<Utc>) -> Option<AggregatedSignal> {
        let window = self.windows.get_mut(&event.instrument_id)?;
        let emitted = window.apply(event, &self.config, now);
        self.record(emitted)
    }

    pub fn on_deadline(&mut self, now: DateTime<Utc>) -> Vec<AggregatedSignal> {
        let mut emitted = Vec::new();
        for instrument in &self.order {
            if let Some(window) = self.windows.get_mut(instrument) {
                emitted.extend(window.on_deadline(&self.config, now));
            }
        }
        self.history.extend(emitted.iter().cloned());
        emitted
    }

    pub fn force_finalize(&mut self, now: DateTime<Utc>) -> Vec<AggregatedSignal> {
        let mut emitted = Vec::new();
        for instrument in &self.order {
            if let Some(window) = self.windows.get_mut(instrument) {
                emitted.extend(window.force_finalize(&self.config, now));
            }
        }
        self.history.extend(emitted.iter().cloned());
        emitted
    }

    pub fn accept_late(&mut self, signal: Signal, now: DateTime<Utc>) -> Option<AggregatedSignal> {
        let window = self.windows.get_mut(&signal.instrument_id)?;
        let emitted = window.accept_late(signal, &self.config, now);
        self.record(emitted)
    }

    /// Latest version per instrument, in plan order. Instruments with nothing
    /// emitted yet are omitted.
    pub fn latest(&self) -> Vec<AggregatedSignal> {
        self.order
            .iter()
            .filter_map(|i| self.windows.get(i).and_then(|w| w.latest().cloned()))
            .collect()
    }

    /// Every version emitted, oldest first.
    pub fn history(&self) -> &[AggregatedSignal] {
        &self.history
    }

    /// Responded slots over required slots across all instruments.
    pub fn completeness(&self) -> Decimal {
        let (responded, required) = self
            .windows
            .values()
            .fold((0usize, 0usize), |(r, q), w| (r + w.responded(), q + w.required()));
        if required == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(responded) / Decimal::from(required)
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.windows
            .values()
            .all(|w| w.phase() == AggregationPhase::Finalized)
    }
}
