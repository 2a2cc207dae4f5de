//! Segment planner and lazy expansion.
//!
//! A simulation's schedule is split into fixed-duration time buckets. Only
//! the first segment is enqueued at start; every later segment is expanded
//! when the job at the previous segment's last index finishes. Expansion is
//! guarded by a set-if-absent claim, so concurrent workers observing the same
//! completion expand a segment exactly once.

use serde::{Deserialize, Serialize};

use crate::{
    config::{RuntimeConfig, SimConfig},
    distribution,
    error::SimResult,
    event::SimEvent,
    kv::{keys, KvStore},
    queue::{JobPayload, NewJob, PrimaryJob, QueueName, ScenarioStamp},
    activity::LifecyclePhase,
    simulation::Simulation,
    store::SimStore,
    types::{RecordIndex, TimestampMs},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub ordinal:   u32,
    pub start:     TimestampMs,
    pub end:       TimestampMs,
    pub first_idx: RecordIndex,
    pub last_idx:  RecordIndex,
}

impl Segment {
    pub fn record_count(&self) -> u64 {
        self.last_idx - self.first_idx + 1
    }

    pub fn contains(&self, idx: RecordIndex) -> bool {
        (self.first_idx..=self.last_idx).contains(&idx)
    }
}

/// Partition a sorted timestamp array into time buckets of `bucket_ms`.
///
/// Empty buckets produce no segment. Ranges are contiguous, ascending and
/// together cover exactly [0, timestamps.len()).
pub fn plan(timestamps: &[TimestampMs], window_start: TimestampMs, window_end: TimestampMs, bucket_ms: i64) -> Vec<Segment> {
    let bucket_ms = bucket_ms.max(1);
    let mut segments: Vec<Segment> = Vec::new();
    let mut current: Option<(i64, usize)> = None; // (bucket, first index)

    let close = |segments: &mut Vec<Segment>, bucket: i64, first: usize, last: usize| {
        let start = window_start + bucket * bucket_ms;
        let end = (start + bucket_ms).min(window_end.max(start));
        segments.push(Segment {
            ordinal:   segments.len() as u32,
            start,
            end,
            first_idx: first as u64,
            last_idx:  last as u64,
        });
    };

    for (i, &t) in timestamps.iter().enumerate() {
        let bucket = (t - window_start).max(0) / bucket_ms;
        match current {
            Some((b, _)) if b == bucket => {}
            Some((b, first)) => {
                close(&mut segments, b, first, i - 1);
                current = Some((bucket, i));
            }
            None => current = Some((bucket, i)),
        }
    }
    if let Some((b, first)) = current {
        close(&mut segments, b, first, timestamps.len() - 1);
    }
    segments
}

/// Why an expansion request did not enqueue anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionOutcome {
    Expanded { jobs: usize },
    AlreadyClaimed,
    AlreadyExpanded,
    Aborted,
    NoSuchSegment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStatus {
    pub ordinal:   u32,
    pub start:     TimestampMs,
    pub end:       TimestampMs,
    pub first_idx: RecordIndex,
    pub last_idx:  RecordIndex,
    pub expanded:  bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReport {
    pub simulation_id: String,
    pub total_count:   u64,
    pub processed:     u64,
    pub segments:      Vec<SegmentStatus>,
}

pub struct SegmentPlanner<'a> {
    store:   &'a SimStore,
    runtime: &'a RuntimeConfig,
    config:  &'a SimConfig,
}

impl<'a> SegmentPlanner<'a> {
    pub fn new(store: &'a SimStore, config: &'a SimConfig) -> Self {
        Self { store, runtime: &config.runtime, config }
    }

    /// The schedule for a simulation: cached copy, or a deterministic rebuild.
    pub fn timestamps(&self, sim: &Simulation) -> SimResult<Vec<TimestampMs>> {
        let key = keys::timestamps(&sim.simulation_id);
        if let Some(cached) = self.store.get(&key)? {
            if let Ok(ts) = serde_json::from_str::<Vec<TimestampMs>>(&cached) {
                if ts.len() as u64 == sim.total_count {
                    return Ok(ts);
                }
            }
            log::warn!("Timestamp cache for {} unusable, recomputing", sim.simulation_id);
        }
        let ts = distribution::expand(sim.method, sim.total_count as usize, sim.window_start, sim.window_end);
        self.store.set(&key, &serde_json::to_string(&ts)?, Some(self.runtime.cache_ttl_ms))?;
        Ok(ts)
    }

    pub fn segments(&self, sim: &Simulation) -> SimResult<Vec<Segment>> {
        let key = keys::segments(&sim.simulation_id);
        if let Some(cached) = self.store.get(&key)? {
            if let Ok(segments) = serde_json::from_str::<Vec<Segment>>(&cached) {
                return Ok(segments);
            }
        }
        let ts = self.timestamps(sim)?;
        let segments = plan(&ts, sim.window_start, sim.window_end, self.runtime.segment_duration_ms);
        self.store.set(&key, &serde_json::to_string(&segments)?, Some(self.runtime.cache_ttl_ms))?;
        Ok(segments)
    }

    /// Expand the schedule and persist its segment plan. Returns the plan.
    pub fn plan_simulation(&self, sim: &Simulation) -> SimResult<Vec<Segment>> {
        // Fresh plan: never trust a cache left over from a previous attempt.
        self.store.del(&keys::timestamps(&sim.simulation_id))?;
        self.store.del(&keys::segments(&sim.simulation_id))?;
        self.segments(sim)
    }

    /// The segment whose last index is `idx`, if any.
    pub fn segment_ending_at(&self, sim: &Simulation, idx: RecordIndex) -> SimResult<Option<Segment>> {
        Ok(self.segments(sim)?.into_iter().find(|s| s.last_idx == idx))
    }

    /// Claim and expand segment `ordinal`, enqueueing one primary job per index.
    ///
    /// The claim is re-entrant for `claimant`, so a redelivered expansion job
    /// picks up its own stale claim. The jobs and the expanded marker commit
    /// together; on failure the claim is released and nothing is enqueued.
    pub fn expand(&self, sim: &Simulation, ordinal: u32, stamp: &ScenarioStamp, claimant: &str) -> SimResult<ExpansionOutcome> {
        let sim_id = &sim.simulation_id;
        let segments = self.segments(sim)?;
        let Some(segment) = segments.iter().find(|s| s.ordinal == ordinal) else {
            return Ok(ExpansionOutcome::NoSuchSegment);
        };

        if self.store.get(&keys::aborted(sim_id))?.is_some() {
            log::info!("Simulation {sim_id} aborted, not expanding segment {ordinal}");
            self.store.append_event(&SimEvent::SegmentExpansionSkipped {
                simulation_id: sim_id.clone(),
                ordinal,
                reason:        "aborted".into(),
            })?;
            return Ok(ExpansionOutcome::Aborted);
        }
        if self.store.get(&keys::segment_expanded(sim_id, ordinal))?.is_some() {
            return Ok(ExpansionOutcome::AlreadyExpanded);
        }
        let claim_key = keys::segment_claim(sim_id, ordinal);
        let claimed = self.store.set_nx(&claim_key, claimant, Some(self.runtime.segment_claim_ttl_ms))?
            || self.store.get(&claim_key)?.as_deref() == Some(claimant);
        if !claimed {
            log::debug!("Segment {ordinal} of {sim_id} already claimed");
            return Ok(ExpansionOutcome::AlreadyClaimed);
        }

        let jobs = match self.enqueue_segment(sim, segment, stamp) {
            Ok(jobs) => jobs,
            Err(e) => {
                log::warn!("Expansion of segment {ordinal} of {sim_id} failed: {e}");
                self.store.del(&claim_key)?;
                return Err(e);
            }
        };
        self.store.incr_by(&keys::metric(sim_id, "segments_expanded"), 1, None)?;
        self.store.append_event(&SimEvent::SegmentExpanded {
            simulation_id: sim_id.clone(),
            ordinal,
            first_idx: segment.first_idx,
            last_idx: segment.last_idx,
            jobs,
        })?;
        log::info!(
            "Expanded segment {ordinal} of {sim_id}: indices {}..={} ({jobs} jobs)",
            segment.first_idx,
            segment.last_idx
        );
        Ok(ExpansionOutcome::Expanded { jobs })
    }

    fn enqueue_segment(&self, sim: &Simulation, segment: &Segment, stamp: &ScenarioStamp) -> SimResult<usize> {
        let ts = self.timestamps(sim)?;
        let policy = self.config.policy_for(QueueName::Primary);
        let jobs: Vec<NewJob> = (segment.first_idx..=segment.last_idx)
            .map(|idx| {
                let scheduled_at = ts[idx as usize];
                NewJob {
                    queue:   QueueName::Primary,
                    payload: JobPayload::Primary(PrimaryJob {
                        simulation_id: sim.simulation_id.clone(),
                        record_index:  idx,
                        phase:         LifecyclePhase::ContactCreated,
                        scheduled_at,
                        scenario:      stamp.clone(),
                    }),
                    run_at:  scheduled_at,
                    policy:  policy.clone(),
                }
            })
            .collect();
        self.store.enqueue_batch_marked(
            &jobs,
            &keys::segment_expanded(&sim.simulation_id, segment.ordinal),
            self.runtime.cache_ttl_ms,
        )
    }

    pub fn report(&self, sim: &Simulation) -> SimResult<SegmentReport> {
        let segments = self
            .segments(sim)?
            .into_iter()
            .map(|s| {
                let expanded = self
                    .store
                    .get(&keys::segment_expanded(&sim.simulation_id, s.ordinal))?
                    .is_some();
                Ok(SegmentStatus {
                    ordinal: s.ordinal,
                    start: s.start,
                    end: s.end,
                    first_idx: s.first_idx,
                    last_idx: s.last_idx,
                    expanded,
                })
            })
            .collect::<SimResult<Vec<_>>>()?;
        let processed = self
            .store
            .get_i64(&keys::processed(&sim.simulation_id))?
            .map(|n| n.max(0) as u64)
            .unwrap_or(sim.processed_count);
        Ok(SegmentReport {
            simulation_id: sim.simulation_id.clone(),
            total_count: sim.total_count,
            processed,
            segments,
        })
    }
}
