//! Distribution expander: (method, count, window) -> sorted timestamps.
//!
//! Pure and deterministic. Segment recomputation after a cache loss must
//! reproduce the exact schedule, so nothing here may read the clock or an RNG.
//!
//! Every method maps evenly spaced quantiles u_i = (i + 0.5) / N through a
//! monotone shaping curve f: [0,1] -> [0,1], then scales into the window.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::types::TimestampMs;

const SKEW_EXPONENT: f64 = 0.6;
const SURGE_WEIGHT: f64 = 0.5;
/// Absorbs float error before flooring, so exact offsets like 18000 never
/// land on 17999.999....
const FLOOR_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMethod {
    Linear,
    FrontLoaded,
    BackLoaded,
    BellCurve,
    SurgeMid,
}

impl DistributionMethod {
    pub const ALL: [DistributionMethod; 5] = [
        Self::Linear,
        Self::FrontLoaded,
        Self::BackLoaded,
        Self::BellCurve,
        Self::SurgeMid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::FrontLoaded => "front_loaded",
            Self::BackLoaded => "back_loaded",
            Self::BellCurve => "bell_curve",
            Self::SurgeMid => "surge_mid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }

    /// The shaping curve. Monotone non-decreasing with f(0)=0, f(1)=1.
    fn shape(self, u: f64) -> f64 {
        match self {
            Self::Linear => u,
            Self::FrontLoaded => 1.0 - (1.0 - u).powf(SKEW_EXPONENT),
            Self::BackLoaded => u.powf(SKEW_EXPONENT),
            Self::BellCurve => bell_quantile(u),
            Self::SurgeMid => (1.0 - SURGE_WEIGHT) * u + SURGE_WEIGHT * bell_quantile(u),
        }
    }
}

/// Inverse CDF of the density sin(pi x) / 2 on [0,1].
fn bell_quantile(u: f64) -> f64 {
    (1.0 - 2.0 * u).clamp(-1.0, 1.0).acos() / PI
}

/// Expand `count` records over [start, end].
///
/// Returns exactly `count` timestamps, sorted ascending, each in [start, end].
/// A zero-width (or inverted) window collapses everything onto `start`.
pub fn expand(method: DistributionMethod, count: usize, start: TimestampMs, end: TimestampMs) -> Vec<TimestampMs> {
    if count == 0 {
        return Vec::new();
    }
    if end <= start {
        return vec![start; count];
    }

    let span = (end - start) as f64;
    let n = count as f64;
    let mut out: Vec<TimestampMs> = (0..count)
        .map(|i| {
            let u = (i as f64 + 0.5) / n;
            let offset = (span * method.shape(u) + FLOOR_EPSILON).floor() as i64;
            (start + offset).clamp(start, end)
        })
        .collect();
    out.sort_unstable();
    out
}
