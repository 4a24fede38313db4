//! Rollout plans and the traffic-split invariant.
//!
//! A [`TrafficSplit`] cannot exist unless its weights sum to 100, so every
//! strategy moves between valid splits by construction.

use crate::domain::RolloutPlanId;
use crate::errors::{CutoverError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Rolling,
    BlueGreen,
    Canary,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Rolling => "rolling",
            Strategy::BlueGreen => "blue_green",
            Strategy::Canary => "canary",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rolling" => Ok(Strategy::Rolling),
            "blue_green" | "blue-green" => Ok(Strategy::BlueGreen),
            "canary" => Ok(Strategy::Canary),
            other => Err(format!("unknown rollout strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    InProgress,
    Monitoring,
    Promoting,
    Completed,
    Aborting,
    Aborted,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::Pending => "pending",
            RolloutStatus::InProgress => "in_progress",
            RolloutStatus::Monitoring => "monitoring",
            RolloutStatus::Promoting => "promoting",
            RolloutStatus::Completed => "completed",
            RolloutStatus::Aborting => "aborting",
            RolloutStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutStatus::Completed | RolloutStatus::Aborted)
    }

    /// Allowed edges of the plan state machine.
    ///
    /// Ramping alternates PROMOTING and MONITORING; rolling and blue-green
    /// move straight from IN_PROGRESS to PROMOTING once health checks pass.
    pub fn can_transition(&self, to: RolloutStatus) -> bool {
        use RolloutStatus::*;
        match (self, to) {
            (Pending, InProgress) => true,
            (InProgress, Monitoring) => true,
            (Monitoring, Promoting) | (Promoting, Monitoring) => true,
            (Promoting, Completed) => true,
            (Aborting, Aborted) => true,
            (from, Aborting) => !from.is_terminal() && *from != Aborting,
            _ => false,
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        use RolloutStatus::*;
        [Pending, InProgress, Monitoring, Promoting, Completed, Aborting, Aborted]
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown rollout status '{s}'"))
    }
}

/// Weights of every live version of an application; always sums to 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, u8>", into = "BTreeMap<String, u8>")]
pub struct TrafficSplit(BTreeMap<String, u8>);

impl TrafficSplit {
    pub fn new(weights: BTreeMap<String, u8>) -> Result<Self> {
        if weights.is_empty() {
            return Err(CutoverError::validation_field(
                "traffic split needs at least one version",
                "weights",
            ));
        }
        let sum: u32 = weights.values().map(|w| u32::from(*w)).sum();
        if sum != 100 {
            return Err(CutoverError::validation_field(
                format!("traffic weights sum to {sum}, expected 100"),
                "weights",
            ));
        }
        Ok(Self(weights))
    }

    /// All traffic on one version
    pub fn single(version: &str) -> Self {
        Self(BTreeMap::from([(version.to_string(), 100)]))
    }

    /// Two live versions with `target_weight` on the target
    pub fn between(baseline: &str, target: &str, target_weight: u8) -> Result<Self> {
        if baseline == target {
            return Err(CutoverError::validation_field(
                "baseline and target versions must differ",
                "version",
            ));
        }
        if target_weight > 100 {
            return Err(CutoverError::validation_field(
                format!("weight {target_weight} exceeds 100"),
                "weight",
            ));
        }
        Self::new(BTreeMap::from([
            (baseline.to_string(), 100 - target_weight),
            (target.to_string(), target_weight),
        ]))
    }

    pub fn weight_of(&self, version: &str) -> u8 {
        self.0.get(version).copied().unwrap_or(0)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn total(&self) -> u32 {
        self.0.values().map(|w| u32::from(*w)).sum()
    }

    /// Version carrying the most traffic; ties resolve to the lowest name
    pub fn dominant(&self) -> &str {
        self.0
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(version, _)| version.as_str())
            .unwrap_or_default()
    }

    /// Drop a version that no longer receives traffic
    pub fn without(&self, version: &str) -> Result<Self> {
        if self.weight_of(version) != 0 {
            return Err(CutoverError::validation_field(
                format!("version '{version}' still receives traffic"),
                "weights",
            ));
        }
        let mut weights = self.0.clone();
        weights.remove(version);
        Self::new(weights)
    }
}

impl TryFrom<BTreeMap<String, u8>> for TrafficSplit {
    type Error = CutoverError;

    fn try_from(weights: BTreeMap<String, u8>) -> Result<Self> {
        Self::new(weights)
    }
}

impl From<TrafficSplit> for BTreeMap<String, u8> {
    fn from(split: TrafficSplit) -> Self {
        split.0
    }
}

impl fmt::Display for TrafficSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(v, w)| format!("{v}={w}%")).collect();
        f.write_str(&parts.join(","))
    }
}

/// Persisted rollout of one application version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub id: RolloutPlanId,
    pub application: String,
    pub environment: String,
    pub strategy: Strategy,
    pub target_version: String,
    pub baseline_version: String,
    pub current_weight_pct: u8,
    pub weights: TrafficSplit,
    /// Split in force before the rollout began; abort restores it
    pub previous_weights: TrafficSplit,
    pub metrics_window_secs: u64,
    pub abort_error_threshold: f64,
    pub abort_latency_threshold_ms: f64,
    pub ramp_steps: Vec<u8>,
    pub max_parallel: u32,
    pub min_healthy_time_secs: u64,
    pub status: RolloutStatus,
    pub abort_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RolloutPlan {
    /// Move to `to`, refusing edges the state machine does not have
    pub fn transition(&mut self, to: RolloutStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(CutoverError::conflict(
                format!(
                    "rollout of '{}' cannot move from {} to {}",
                    self.application, self.status, to
                ),
                "rollout_plan",
            ));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn apply_weights(&mut self, weights: TrafficSplit) {
        self.current_weight_pct = weights.weight_of(&self.target_version);
        self.weights = weights;
        self.updated_at = Utc::now();
    }
}

/// Scheduler job running one version of an application
pub fn version_job_id(application: &str, version: &str) -> String {
    format!("{application}-{version}")
}

/// Registry KV key holding an application's traffic split
pub fn traffic_key(application: &str) -> String {
    format!("cutover/traffic/{application}")
}

/// Cumulative count of replaced instances after each rolling batch
pub fn rolling_batches(total: u32, max_parallel: u32) -> Vec<u32> {
    let step = max_parallel.max(1);
    let mut batches = Vec::new();
    let mut done = 0;
    while done < total {
        done = (done + step).min(total);
        batches.push(done);
    }
    batches
}

/// Target weight proportional to the share of replaced instances
pub fn weight_for_share(replaced: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u64::from(replaced.min(total)) * 100 + u64::from(total) / 2) / u64::from(total);
    pct.min(100) as u8
}

/// Canary weights in the order they are applied
pub fn ramp_schedule(initial_weight: u8, ramp_steps: &[u8]) -> Vec<u8> {
    let mut schedule = vec![initial_weight.min(100)];
    for step in ramp_steps {
        let step = (*step).min(100);
        if schedule.last().is_some_and(|last| step > *last) {
            schedule.push(step);
        }
    }
    if schedule.last() != Some(&100) {
        schedule.push(100);
    }
    schedule
}

/// Observations for one canary evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSample {
    pub error_rate: Option<f64>,
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub metric: &'static str,
    pub observed: f64,
    pub threshold: f64,
}

/// First threshold the sample crosses. Missing or NaN values (no traffic yet)
/// never count as a breach.
pub fn evaluate(sample: MetricsSample, error_threshold: f64, latency_threshold_ms: f64) -> Option<Breach> {
    if let Some(rate) = sample.error_rate.filter(|v| v.is_finite()) {
        if rate > error_threshold {
            return Some(Breach { metric: "error_rate", observed: rate, threshold: error_threshold });
        }
    }
    if let Some(latency) = sample.latency_ms.filter(|v| v.is_finite()) {
        if latency > latency_threshold_ms {
            return Some(Breach {
                metric: "latency_p99_ms",
                observed: latency,
                threshold: latency_threshold_ms,
            });
        }
    }
    None
}
