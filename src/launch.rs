//! Job launcher: a serialized run request in, a structured outcome out.
//!
//! Every failure a job can hit (unparseable request, invalid scenario,
//! a panic inside a strategy) comes back as a [`JobFailure`] instead of
//! taking the process down.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::config::{AreaConfig, ScenarioConfig, ScheduledEventConfig};
use crate::market::MarketType;
use crate::sim::kpi::KpiReport;
use crate::sim::scheduler::{RunReport, Scheduler};
use crate::strategy::join_errors;

/// A run request as received from a job queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    pub job_id: String,
    /// Preset name or an inline area tree; `None` runs the baseline preset.
    #[serde(default)]
    pub scenario: Option<JobScenario>,
    #[serde(default)]
    pub settings: JobSettings,
    /// Live events to inject at fixed ticks.
    #[serde(default)]
    pub events: Vec<ScheduledEventConfig>,
}

/// Scenario part of a [`JobRequest`].
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JobScenario {
    Preset(String),
    Grid(AreaConfig),
}

/// Overrides for the `[simulation]` section; unset fields keep the
/// scenario's values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobSettings {
    pub slot_length_minutes: Option<u64>,
    pub tick_length_seconds: Option<u64>,
    pub duration_hours: Option<u64>,
    pub market_type: Option<MarketType>,
    pub seed: Option<u64>,
    pub realtime_tick_ms: Option<u64>,
}

/// Stage at which a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request was not valid JSON or did not match [`JobRequest`].
    Parse,
    /// The scenario or settings failed validation.
    Config,
    /// The run panicked.
    Panic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub job_id: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Final outcome of a launched job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobReport {
    Completed {
        job_id: String,
        report: RunReport,
        kpi: KpiReport,
    },
    Failed(JobFailure),
}

impl JobReport {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } => job_id,
            Self::Failed(f) => &f.job_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

impl JobRequest {
    /// Resolves the scenario and applies the settings overrides and events.
    ///
    /// # Errors
    ///
    /// A `Config` failure if the preset name is unknown.
    pub fn to_scenario(&self) -> Result<ScenarioConfig, JobFailure> {
        let mut scenario = match &self.scenario {
            None => ScenarioConfig::baseline(),
            Some(JobScenario::Preset(name)) => ScenarioConfig::from_preset(name)
                .map_err(|e| self.failure(FailureKind::Config, e.to_string()))?,
            Some(JobScenario::Grid(grid)) => ScenarioConfig {
                grid: grid.clone(),
                ..ScenarioConfig::baseline()
            },
        };

        let s = &mut scenario.simulation;
        let o = &self.settings;
        if let Some(v) = o.slot_length_minutes {
            s.slot_length_minutes = v;
        }
        if let Some(v) = o.tick_length_seconds {
            s.tick_length_seconds = v;
        }
        if let Some(v) = o.duration_hours {
            s.duration_hours = v;
        }
        if let Some(v) = o.market_type {
            s.market_type = v;
        }
        if let Some(v) = o.seed {
            s.seed = v;
        }
        if o.realtime_tick_ms.is_some() {
            s.realtime_tick_ms = o.realtime_tick_ms;
        }
        scenario.events.extend(self.events.iter().cloned());
        Ok(scenario)
    }

    fn failure(&self, kind: FailureKind, message: String) -> JobFailure {
        JobFailure {
            job_id: self.job_id.clone(),
            kind,
            message,
        }
    }
}

/// Parses `text` as a [`JobRequest`] and runs it.
///
/// A request that does not parse is reported under its `job_id` if one can
/// be recovered, otherwise under `"unknown"`.
pub fn launch_json(text: &str) -> JobReport {
    match serde_json::from_str::<JobRequest>(text) {
        Ok(request) => launch(&request),
        Err(e) => {
            let job_id = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("job_id").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            error!(%job_id, error = %e, "cannot parse job request");
            JobReport::Failed(JobFailure {
                job_id,
                kind: FailureKind::Parse,
                message: e.to_string(),
            })
        }
    }
}

/// Runs `request` to completion.
pub fn launch(request: &JobRequest) -> JobReport {
    info!(job_id = %request.job_id, "starting job");
    run_guarded(&request.job_id, || {
        let scenario = request.to_scenario()?;
        let mut scheduler = Scheduler::from_scenario(&scenario)
            .map_err(|errors| request.failure(FailureKind::Config, join_errors(&errors)))?;
        let report = scheduler.run();
        let kpi = KpiReport::from_summaries(&scheduler.slot_summaries());
        Ok((report, kpi))
    })
}

/// Runs `job` and converts an error or a panic into a [`JobFailure`].
pub fn run_guarded<F>(job_id: &str, job: F) -> JobReport
where
    F: FnOnce() -> Result<(RunReport, KpiReport), JobFailure>,
{
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok((report, kpi))) => {
            info!(%job_id, trades = report.trade_count, "job completed");
            JobReport::Completed {
                job_id: job_id.to_string(),
                report,
                kpi,
            }
        }
        Ok(Err(failure)) => {
            error!(%job_id, kind = ?failure.kind, message = %failure.message, "job failed");
            JobReport::Failed(failure)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(%job_id, %message, "job panicked");
            JobReport::Failed(JobFailure {
                job_id: job_id.to_string(),
                kind: FailureKind::Panic,
                message,
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
