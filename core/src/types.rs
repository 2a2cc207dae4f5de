//! Shared primitive types used across the entire engine.

/// Milliseconds since the Unix epoch. All schedule arithmetic uses this.
pub type TimestampMs = i64;

/// The canonical simulation identifier.
pub type SimulationId = String;

/// Zero-based position of a record inside a simulation's schedule.
pub type RecordIndex = u64;

/// A stable, unique identifier for a queued job.
pub type JobId = String;

/// Monotone marker of the scenario override a job was scheduled under.
pub type OverrideVersion = u64;

pub const MS_PER_MINUTE: i64 = 60_000;
pub const MS_PER_HOUR: i64 = 3_600_000;
pub const MS_PER_DAY: i64 = 86_400_000;
