use rusqlite::{params, OptionalExtension, Row};

use super::SimStore;
use crate::{
    distribution::DistributionMethod,
    error::{SimError, SimResult},
    simulation::{NewSimulation, Simulation, SimulationStatus},
    types::{OverrideVersion, TimestampMs},
};

const SIMULATION_COLUMNS: &str = "simulation_id, owner, scenario_id, method, requested_count,
     total_count, window_start, window_end, status, override_version, override_hash,
     processed_count, scenario_json, created_at, started_at, finished_at";

fn simulation_from_row(row: &Row<'_>) -> rusqlite::Result<Simulation> {
    let method: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(Simulation {
        simulation_id:    row.get(0)?,
        owner:            row.get(1)?,
        scenario_id:      row.get(2)?,
        method:           DistributionMethod::parse(&method).unwrap_or(DistributionMethod::Linear),
        requested_count:  row.get::<_, i64>(4)? as u64,
        total_count:      row.get::<_, i64>(5)? as u64,
        window_start:     row.get(6)?,
        window_end:       row.get(7)?,
        status:           SimulationStatus::parse(&status).unwrap_or(SimulationStatus::Failed),
        override_version: row.get::<_, i64>(9)? as u64,
        override_hash:    row.get(10)?,
        processed_count:  row.get::<_, i64>(11)? as u64,
        scenario_json:    row.get(12)?,
        created_at:       row.get(13)?,
        started_at:       row.get(14)?,
        finished_at:      row.get(15)?,
    })
}

impl SimStore {
    // ── Simulation ─────────────────────────────────────────────

    pub fn insert_simulation(&self, sim: &NewSimulation) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO simulation (
                simulation_id, owner, scenario_id, method, requested_count, total_count,
                window_start, window_end, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, 'QUEUED', ?8)",
            params![
                sim.simulation_id,
                sim.owner,
                sim.scenario_id,
                sim.method.as_str(),
                sim.requested_count as i64,
                sim.window_start,
                sim.window_end,
                self.now(),
            ],
        )?;
        Ok(())
    }

    pub fn find_simulation(&self, simulation_id: &str) -> SimResult<Option<Simulation>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {SIMULATION_COLUMNS} FROM simulation WHERE simulation_id = ?1");
        let sim = conn
            .query_row(&sql, [simulation_id], simulation_from_row)
            .optional()?;
        Ok(sim)
    }

    pub fn get_simulation(&self, simulation_id: &str) -> SimResult<Simulation> {
        self.find_simulation(simulation_id)?
            .ok_or_else(|| SimError::SimulationNotFound { id: simulation_id.to_string() })
    }

    /// QUEUED -> RUNNING, recording the effective count and scenario snapshot.
    /// Returns false if the row was not QUEUED any more.
    pub fn mark_simulation_running(
        &self,
        simulation_id: &str,
        total_count: u64,
        override_version: OverrideVersion,
        override_hash: &str,
        scenario_json: &str,
    ) -> SimResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE simulation
             SET status = 'RUNNING', total_count = ?2, override_version = ?3,
                 override_hash = ?4, scenario_json = ?5, started_at = ?6
             WHERE simulation_id = ?1 AND status = 'QUEUED'",
            params![
                simulation_id,
                total_count as i64,
                override_version as i64,
                override_hash,
                scenario_json,
                self.now(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Write through the processed count. Never moves the count backwards.
    pub fn record_processed_count(&self, simulation_id: &str, processed: u64) -> SimResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE simulation SET processed_count = MAX(processed_count, ?2)
             WHERE simulation_id = ?1",
            params![simulation_id, processed as i64],
        )?;
        Ok(())
    }

    /// RUNNING -> COMPLETED once processed reaches total. True only for the
    /// caller that made the transition.
    pub fn complete_simulation_if_done(&self, simulation_id: &str) -> SimResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE simulation SET status = 'COMPLETED', finished_at = ?2
             WHERE simulation_id = ?1 AND status = 'RUNNING'
               AND processed_count >= total_count",
            params![simulation_id, self.now()],
        )?;
        Ok(changed == 1)
    }

    /// Any non-terminal status -> ABORTED. False if already terminal.
    pub fn abort_simulation(&self, simulation_id: &str) -> SimResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE simulation SET status = 'ABORTED', finished_at = ?2
             WHERE simulation_id = ?1 AND status IN ('QUEUED', 'RUNNING')",
            params![simulation_id, self.now()],
        )?;
        Ok(changed == 1)
    }

    /// QUEUED or RUNNING -> FAILED. False if already terminal.
    pub fn mark_simulation_failed(&self, simulation_id: &str, at: TimestampMs) -> SimResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE simulation SET status = 'FAILED', finished_at = ?2
             WHERE simulation_id = ?1 AND status IN ('QUEUED', 'RUNNING')",
            params![simulation_id, at],
        )?;
        Ok(changed == 1)
    }
}
