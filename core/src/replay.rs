//! Operator-driven dead-letter replay.
//!
//! Live replays are always audited.
//! Two dedup tiers stand between a selection and the queue: a per-call set
//! (same entry twice in one batch) and a KV-backed recently-replayed set
//! (same entry across rapid repeated calls).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::{
    config::{RetryPolicy, SimConfig},
    dead_letter::DeadLetterEntry,
    error::{ErrorCategory, SimError, SimResult},
    event::SimEvent,
    kv::{keys, KvStore},
    queue::{JobPayload, JobQueue, NewJob, QueueName},
    rng::{simulation_seed, RecordRng, RngSlot},
    store::{DeadLetterFilter, ReplayAuditRecord, SimStore},
    types::{JobId, SimulationId, TimestampMs},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOrder {
    #[default]
    OldestFirst,
    NewestFirst,
    Random,
}

/// Which entries to consider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySelector {
    /// Entry ids or original job ids. Empty means every unreplayed entry.
    #[serde(default)]
    pub ids:        Vec<String>,
    #[serde(default)]
    pub categories: Vec<ErrorCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayOptions {
    pub actor:             String,
    #[serde(default)]
    pub dry_run:           bool,
    #[serde(default)]
    pub order:             ReplayOrder,
    #[serde(default)]
    pub limit:             Option<usize>,
    #[serde(default)]
    pub per_category_cap:  Option<usize>,
    /// Re-enqueue with the queue's full policy instead of one attempt.
    #[serde(default)]
    pub full_retry_policy: bool,
}

impl ReplayOptions {
    pub fn live(actor: &str) -> Self {
        Self {
            actor:             actor.to_string(),
            dry_run:           false,
            order:             ReplayOrder::OldestFirst,
            limit:             None,
            per_category_cap:  None,
            full_retry_policy: false,
        }
    }

    pub fn dry_run(actor: &str) -> Self {
        Self { dry_run: true, ..Self::live(actor) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayItemStatus {
    Replayed,
    WouldReplay,
    SkippedDuplicate,
    SkippedRecent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayItem {
    pub entry_id:   String,
    pub job_id:     JobId,
    pub queue:      QueueName,
    pub category:   ErrorCategory,
    pub status:     ReplayItemStatus,
    pub new_job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub batch_id:          String,
    pub simulation_id:     SimulationId,
    pub dry_run:           bool,
    pub selected:          usize,
    pub replayed:          usize,
    pub skipped_duplicate: usize,
    pub skipped_recent:    usize,
    pub not_found:         Vec<String>,
    pub items:             Vec<ReplayItem>,
}

pub struct ReplayController<'a> {
    store:  &'a SimStore,
    config: &'a SimConfig,
}

impl<'a> ReplayController<'a> {
    pub fn new(store: &'a SimStore, config: &'a SimConfig) -> Self {
        Self { store, config }
    }

    /// Fixed-window counter per operator. Errors once the window is used up.
    fn check_operator_limit(&self, actor: &str, now: TimestampMs) -> SimResult<()> {
        let replay = &self.config.runtime.replay;
        let window_ms = replay.operator_window_ms.max(1);
        let key = keys::replay_operator(actor, now.div_euclid(window_ms));
        let used = self.store.incr_by(&key, 1, Some(window_ms))?;
        if used > replay.max_replays_per_window as i64 {
            log::warn!("Replay by {actor} refused: {used} calls this window");
            return Err(SimError::ReplayRateLimited {
                actor: actor.to_string(),
                max:   replay.max_replays_per_window,
            });
        }
        Ok(())
    }

    fn candidates(
        &self,
        simulation_id: &str,
        selector: &ReplaySelector,
        not_found: &mut Vec<String>,
    ) -> SimResult<Vec<DeadLetterEntry>> {
        if selector.ids.is_empty() {
            return self.store.dead_letters(&DeadLetterFilter {
                simulation_id:    simulation_id.to_string(),
                categories:       selector.categories.clone(),
                include_replayed: false,
            });
        }
        let mut entries = Vec::new();
        for id in &selector.ids {
            match self.store.find_dead_letter(simulation_id, id)? {
                Some(entry) => {
                    if selector.categories.is_empty() || selector.categories.contains(&entry.category) {
                        entries.push(entry);
                    }
                }
                None => not_found.push(id.clone()),
            }
        }
        Ok(entries)
    }

    pub fn select(
        &self,
        simulation_id: &str,
        selector: &ReplaySelector,
        options: &ReplayOptions,
        batch_id: &str,
        not_found: &mut Vec<String>,
    ) -> SimResult<Vec<DeadLetterEntry>> {
        let mut entries = self.candidates(simulation_id, selector, not_found)?;
        match options.order {
            ReplayOrder::OldestFirst => entries.sort_by_key(|e| e.failed_at),
            ReplayOrder::NewestFirst => entries.sort_by_key(|e| std::cmp::Reverse(e.failed_at)),
            ReplayOrder::Random => {
                RecordRng::from_seed(simulation_seed(batch_id), 0, RngSlot::ReplayShuffle).shuffle(&mut entries)
            }
        }
        if let Some(cap) = options.per_category_cap {
            let mut taken: BTreeMap<ErrorCategory, usize> = BTreeMap::new();
            entries.retain(|e| {
                let n = taken.entry(e.category).or_insert(0);
                *n += 1;
                *n <= cap
            });
        }
        if let Some(limit) = options.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn replay(
        &self,
        simulation_id: &str,
        selector: &ReplaySelector,
        options: &ReplayOptions,
    ) -> SimResult<ReplayReport> {
        let now = self.store.clock().now_ms();
        self.check_operator_limit(&options.actor, now)?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut report = ReplayReport {
            batch_id:          batch_id.clone(),
            simulation_id:     simulation_id.to_string(),
            dry_run:           options.dry_run,
            selected:          0,
            replayed:          0,
            skipped_duplicate: 0,
            skipped_recent:    0,
            not_found:         Vec::new(),
            items:             Vec::new(),
        };
        let selection = self.select(simulation_id, selector, options, &batch_id, &mut report.not_found)?;
        report.selected = selection.len();

        let recent_ttl = self.config.runtime.replay.recent_ttl_ms;
        let mut seen: HashSet<String> = HashSet::new();
        for entry in selection {
            let recent_key = keys::replay_recent(&entry.entry_id);
            let mut new_job_id = None;
            let status = if !seen.insert(entry.entry_id.clone()) {
                ReplayItemStatus::SkippedDuplicate
            } else if options.dry_run {
                if self.store.get(&recent_key)?.is_some() {
                    ReplayItemStatus::SkippedRecent
                } else {
                    ReplayItemStatus::WouldReplay
                }
            } else if !self.store.set_nx(&recent_key, &batch_id, Some(recent_ttl))? {
                ReplayItemStatus::SkippedRecent
            } else {
                match self.resubmit(&entry, options.full_retry_policy, now) {
                    Ok(job_id) => {
                        new_job_id = Some(job_id);
                        ReplayItemStatus::Replayed
                    }
                    Err(e) => {
                        // Nothing was enqueued, so the entry is not recent.
                        self.store.del(&recent_key)?;
                        return Err(self.abandon(&report, selector, options, now, e));
                    }
                }
            };

            match status {
                ReplayItemStatus::Replayed | ReplayItemStatus::WouldReplay => report.replayed += 1,
                ReplayItemStatus::SkippedDuplicate => report.skipped_duplicate += 1,
                ReplayItemStatus::SkippedRecent => report.skipped_recent += 1,
            }
            let entry_id = entry.entry_id.clone();
            report.items.push(ReplayItem {
                entry_id: entry.entry_id,
                job_id: entry.job_id,
                queue: entry.origin_queue,
                category: entry.category,
                status,
                new_job_id,
            });
            if status == ReplayItemStatus::Replayed {
                if let Err(e) = self.store.mark_dead_letter_replayed(&entry_id, &batch_id, now) {
                    return Err(self.abandon(&report, selector, options, now, e));
                }
            }
        }

        if !options.dry_run {
            self.audit(&report, selector, options, now)?;
        }
        log::info!(
            "Replay {} for {simulation_id} by {}{}: selected {}, replayed {}, duplicate {}, recent {}",
            report.batch_id,
            options.actor,
            if options.dry_run { " (dry run)" } else { "" },
            report.selected,
            report.replayed,
            report.skipped_duplicate,
            report.skipped_recent
        );
        Ok(report)
    }

    /// Audit what a failed live batch already did, then hand back its error.
    fn abandon(
        &self,
        report: &ReplayReport,
        selector: &ReplaySelector,
        options: &ReplayOptions,
        now: TimestampMs,
        error: SimError,
    ) -> SimError {
        log::error!(
            "Replay {} for {} stopped after {} resubmission(s): {error}",
            report.batch_id,
            report.simulation_id,
            report.replayed
        );
        if let Err(e) = self.audit(report, selector, options, now) {
            log::error!("Audit of replay {} failed: {e}", report.batch_id);
        }
        error
    }

    fn resubmit(&self, entry: &DeadLetterEntry, full_policy: bool, now: TimestampMs) -> SimResult<JobId> {
        let payload: JobPayload = serde_json::from_value(entry.payload.clone())?;
        let policy = if full_policy {
            self.config.policy_for(entry.origin_queue)
        } else {
            RetryPolicy::single_attempt()
        };
        self.store.enqueue(&NewJob {
            queue: entry.origin_queue,
            payload,
            run_at: now,
            policy,
        })
    }

    fn audit(
        &self,
        report: &ReplayReport,
        selector: &ReplaySelector,
        options: &ReplayOptions,
        now: TimestampMs,
    ) -> SimResult<()> {
        let filters = serde_json::json!({
            "selector": selector,
            "order": options.order,
            "limit": options.limit,
            "per_category_cap": options.per_category_cap,
            "full_retry_policy": options.full_retry_policy,
        });
        self.store.insert_replay_audit(&ReplayAuditRecord {
            audit_id:          uuid::Uuid::new_v4().to_string(),
            batch_id:          report.batch_id.clone(),
            actor:             options.actor.clone(),
            simulation_id:     report.simulation_id.clone(),
            filters,
            selected:          report.selected,
            replayed:          report.replayed,
            skipped_duplicate: report.skipped_duplicate,
            skipped_recent:    report.skipped_recent,
            created_at:        now,
        })?;
        self.store.append_event(&SimEvent::ReplayExecuted {
            simulation_id:     report.simulation_id.clone(),
            batch_id:          report.batch_id.clone(),
            actor:             options.actor.clone(),
            replayed:          report.replayed,
            skipped_duplicate: report.skipped_duplicate,
            skipped_recent:    report.skipped_recent,
        })
    }
}
