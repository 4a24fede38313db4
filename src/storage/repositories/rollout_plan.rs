use crate::domain::{RolloutPlan, RolloutPlanId, RolloutStatus, Strategy, TrafficSplit};
use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::str::FromStr;

const SELECT_COLUMNS: &str = "SELECT id, application, environment, strategy, target_version, \
     baseline_version, current_weight_pct, weights, previous_weights, metrics_window_secs, \
     abort_error_threshold, abort_latency_threshold_ms, ramp_steps, max_parallel, \
     min_healthy_time_secs, status, abort_requested, last_error, created_at, updated_at \
     FROM rollout_plans";

#[derive(Debug, FromRow)]
struct RolloutPlanRow {
    id: String,
    application: String,
    environment: String,
    strategy: String,
    target_version: String,
    baseline_version: String,
    current_weight_pct: i64,
    weights: String,
    previous_weights: String,
    metrics_window_secs: i64,
    abort_error_threshold: f64,
    abort_latency_threshold_ms: f64,
    ramp_steps: String,
    max_parallel: i64,
    min_healthy_time_secs: i64,
    status: String,
    abort_requested: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode_json<T: serde::de::DeserializeOwned>(value: &str, what: &str, id: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| CutoverError::serialization(e, format!("Invalid {what} for rollout {id}")))
}

fn encode_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| CutoverError::serialization(e, format!("Failed to encode rollout {what}")))
}

impl TryFrom<RolloutPlanRow> for RolloutPlan {
    type Error = CutoverError;

    fn try_from(row: RolloutPlanRow) -> Result<Self> {
        let weights: TrafficSplit = decode_json(&row.weights, "weights", &row.id)?;
        let previous_weights: TrafficSplit =
            decode_json(&row.previous_weights, "previous weights", &row.id)?;
        let ramp_steps: Vec<u8> = decode_json(&row.ramp_steps, "ramp steps", &row.id)?;

        Ok(RolloutPlan {
            strategy: Strategy::from_str(&row.strategy).map_err(CutoverError::validation)?,
            status: RolloutStatus::from_str(&row.status).map_err(CutoverError::validation)?,
            id: RolloutPlanId::from_string(row.id),
            application: row.application,
            environment: row.environment,
            target_version: row.target_version,
            baseline_version: row.baseline_version,
            current_weight_pct: row.current_weight_pct.clamp(0, 100) as u8,
            weights,
            previous_weights,
            metrics_window_secs: row.metrics_window_secs.max(0) as u64,
            abort_error_threshold: row.abort_error_threshold,
            abort_latency_threshold_ms: row.abort_latency_threshold_ms,
            ramp_steps,
            max_parallel: row.max_parallel.max(1) as u32,
            min_healthy_time_secs: row.min_healthy_time_secs.max(0) as u64,
            abort_requested: row.abort_requested,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RolloutPlanRepository {
    pool: DbPool,
}

impl RolloutPlanRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, plan: &RolloutPlan) -> Result<()> {
        sqlx::query(
            "INSERT INTO rollout_plans (id, application, environment, strategy, target_version, baseline_version, \
             current_weight_pct, weights, previous_weights, metrics_window_secs, abort_error_threshold, \
             abort_latency_threshold_ms, ramp_steps, max_parallel, min_healthy_time_secs, status, \
             abort_requested, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&plan.id)
        .bind(&plan.application)
        .bind(&plan.environment)
        .bind(plan.strategy.as_str())
        .bind(&plan.target_version)
        .bind(&plan.baseline_version)
        .bind(i64::from(plan.current_weight_pct))
        .bind(encode_json(&plan.weights, "weights")?)
        .bind(encode_json(&plan.previous_weights, "previous weights")?)
        .bind(plan.metrics_window_secs as i64)
        .bind(plan.abort_error_threshold)
        .bind(plan.abort_latency_threshold_ms)
        .bind(encode_json(&plan.ramp_steps, "ramp steps")?)
        .bind(i64::from(plan.max_parallel))
        .bind(plan.min_healthy_time_secs as i64)
        .bind(plan.status.as_str())
        .bind(plan.abort_requested)
        .bind(plan.last_error.as_deref())
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to create rollout plan for '{}'", plan.application)))?;
        Ok(())
    }

    /// Persist progress. `abort_requested` is deliberately not written here
    /// so a concurrent abort request is never overwritten by the runner.
    pub async fn update(&self, plan: &RolloutPlan) -> Result<()> {
        sqlx::query(
            "UPDATE rollout_plans SET current_weight_pct = ?, weights = ?, status = ?, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(i64::from(plan.current_weight_pct))
        .bind(encode_json(&plan.weights, "weights")?)
        .bind(plan.status.as_str())
        .bind(plan.last_error.as_deref())
        .bind(plan.updated_at)
        .bind(&plan.id)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to update rollout plan {}", plan.id)))?;
        Ok(())
    }

    pub async fn get(&self, id: &RolloutPlanId) -> Result<RolloutPlan> {
        let row: Option<RolloutPlanRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to load rollout plan {id}")))?;

        row.map(RolloutPlan::try_from)
            .transpose()?
            .ok_or_else(|| CutoverError::not_found("rollout_plan", id.as_str()))
    }

    pub async fn latest_for_application(&self, application: &str) -> Result<Option<RolloutPlan>> {
        let row: Option<RolloutPlanRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE application = ? ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(application)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to load rollout for '{application}'")))?;

        row.map(RolloutPlan::try_from).transpose()
    }

    pub async fn request_abort(&self, id: &RolloutPlanId) -> Result<()> {
        sqlx::query("UPDATE rollout_plans SET abort_requested = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to request abort of rollout {id}")))?;
        Ok(())
    }

    pub async fn abort_requested(&self, id: &RolloutPlanId) -> Result<bool> {
        let flag: Option<(bool,)> =
            sqlx::query_as("SELECT abort_requested FROM rollout_plans WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CutoverError::database(e, "Failed to read abort flag"))?;

        Ok(flag.map(|(f,)| f).unwrap_or(false))
    }
}
