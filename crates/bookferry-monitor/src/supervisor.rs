//! The supervision loop: liveness, scaling, and fix application.
//!
//! Each tick runs the four steps in order: assess every worker, restart
//! stopped ones, adjust the fleet for disk pressure, then apply at most one
//! fix per stuck worker under cooldowns and the attempt cap. Fixes are
//! verified on a later tick so the loop never blocks waiting for a worker to
//! recover.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha1::{Digest, Sha1};
use sysinfo::System;
use tracing::{debug, error, info, warn};

use bookferry_app::paths::RunPaths;
use oracle_ox::{Advice, Diagnostics, FixKind, OracleClient};

use crate::diskio::{self, DiskPressure};
use crate::fixes::{FixExecutor, PatchSpec, RestartParams};
use crate::fleet::{FleetPolicy, FleetState, ScaleAction};
use crate::history::{FixAttempt, FixHistory, FixOutcome, FixType};
use crate::probe::{self, StuckDiagnosis, StuckThresholds, WorkerView};

/// Minimum confidence before a code recommendation is acted on.
const CODE_CONFIDENCE_FLOOR: f64 = 0.7;

/// Runtime settings for the supervisor, assembled from config and CLI.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub check_interval: Duration,
    pub thresholds: StuckThresholds,
    pub fleet: FleetPolicy,
    pub shard_count: u32,
    pub fix_cooldown: Duration,
    pub max_attempts: u32,
    pub attempt_window: chrono::Duration,
    pub verify_after: Duration,
    pub oracle_cache_ttl: Duration,
    pub disk_device: Option<String>,
    pub disk_sample: Duration,
    /// Source file whose catalog-iteration function is excerpted for the
    /// oracle when the log shows a repeating key range.
    pub snippet_source: Option<std::path::PathBuf>,
    pub dry_run: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            thresholds: StuckThresholds::default(),
            fleet: FleetPolicy::default(),
            shard_count: 8,
            fix_cooldown: Duration::from_secs(10 * 60),
            max_attempts: 3,
            attempt_window: chrono::Duration::minutes(60),
            verify_after: Duration::from_secs(2 * 60),
            oracle_cache_ttl: Duration::from_secs(15 * 60),
            disk_device: None,
            disk_sample: Duration::from_secs(1),
            snippet_source: None,
            dry_run: false,
        }
    }
}

/// A fix applied but not yet verified.
#[derive(Debug)]
struct PendingVerification {
    shard_id: u32,
    applied_at: Instant,
    root_cause: String,
    fix_type: FixType,
    params: Option<serde_json::Value>,
    diff: Option<String>,
    attempt_index: u32,
}

/// The concrete intervention chosen for one stuck worker.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedFix {
    Restart(RestartParams),
    Config(RestartParams),
    Code(PatchSpec),
    /// Disk-pressure root cause; handled by fleet scaling, not a worker fix.
    LeaveToFleet,
}

impl PlannedFix {
    fn fix_type(&self) -> FixType {
        match self {
            PlannedFix::Restart(_) => FixType::Restart,
            PlannedFix::Config(_) => FixType::Config,
            PlannedFix::Code(_) => FixType::Code,
            PlannedFix::LeaveToFleet => FixType::Restart,
        }
    }
}

pub struct Supervisor {
    paths: RunPaths,
    settings: SupervisorSettings,
    executor: FixExecutor,
    oracle: Option<OracleClient>,
    history: FixHistory,
    fleet: FleetState,
    oracle_cache: HashMap<(u32, String), (Instant, Advice)>,
    pending: Vec<PendingVerification>,
}

impl Supervisor {
    pub fn new(
        paths: RunPaths,
        settings: SupervisorSettings,
        executor: FixExecutor,
        oracle: Option<OracleClient>,
    ) -> Self {
        let history = FixHistory::open(paths.fix_history_file());
        Self {
            paths,
            settings,
            executor,
            oracle,
            history,
            fleet: FleetState::default(),
            oracle_cache: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Run forever at the configured cadence.
    pub async fn run(&mut self) {
        info!(
            interval_secs = self.settings.check_interval.as_secs(),
            dry_run = self.settings.dry_run,
            oracle = self.oracle.is_some(),
            "supervisor started"
        );
        let mut ticker = tokio::time::interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                error!(error = %err, "supervisor tick failed");
            }
        }
    }

    /// One pass over the fleet.
    pub async fn tick(&mut self) -> Result<(), crate::error::MonitorError> {
        let sys = System::new_all();
        let views = probe::survey_workers(&self.paths, &sys).await;
        let now = Utc::now();

        // Step A: stuck assessment for live workers.
        let mut stuck: Vec<StuckDiagnosis> = Vec::new();
        for view in views.iter().filter(|v| v.is_alive()) {
            if let Some(diagnosis) = probe::assess_stuck(view, &self.settings.thresholds, now) {
                warn!(
                    shard_id = diagnosis.shard_id,
                    minutes = diagnosis.minutes_stuck,
                    "worker is stuck"
                );
                stuck.push(diagnosis);
            }
        }

        // Resolve verification windows against the fresh assessment.
        self.resolve_verifications(&stuck)?;

        // Step B: progress files without a live process.
        for view in views.iter().filter(|v| !v.is_alive()) {
            self.restart_stopped(view).await?;
        }

        // Step C: fleet scaling from disk pressure.
        let pressure = self.sample_disk().await;
        let live_shards: Vec<u32> = views
            .iter()
            .filter(|v| v.is_alive())
            .map(|v| v.shard_id)
            .collect();
        let action = self.fleet.decide(
            &self.settings.fleet,
            pressure.as_ref(),
            &live_shards,
            self.settings.shard_count,
            !stuck.is_empty(),
            Instant::now(),
        );
        if let Some(action) = action {
            self.apply_scale_action(action, &views).await;
        }

        // Step D: per-worker fixes.
        let saturated = pressure.as_ref().is_some_and(DiskPressure::saturated);
        for diagnosis in &stuck {
            self.fix_worker(diagnosis, pressure.as_ref(), saturated)
                .await?;
        }

        Ok(())
    }

    async fn sample_disk(&self) -> Option<DiskPressure> {
        let device = match &self.settings.disk_device {
            Some(device) => device.clone(),
            None => diskio::busiest_device()?,
        };
        match diskio::sample_utilization(&device, self.settings.disk_sample).await {
            Ok(pressure) => Some(pressure),
            Err(err) => {
                debug!(error = %err, "disk utilization unavailable");
                None
            }
        }
    }

    async fn restart_stopped(&mut self, view: &WorkerView) -> Result<(), crate::error::MonitorError> {
        if self.in_cooldown(view.shard_id) || self.is_pending(view.shard_id) {
            return Ok(());
        }
        if self.paths.pause_flag(view.shard_id).exists() {
            debug!(shard_id = view.shard_id, "stopped worker is paused; leaving it");
            return Ok(());
        }
        let attempts =
            self.history
                .attempts_since_recovery(view.shard_id, self.settings.attempt_window, Utc::now());
        if attempts >= self.settings.max_attempts {
            self.escalate(view.shard_id, attempts)?;
            return Ok(());
        }

        warn!(shard_id = view.shard_id, "worker process is gone; restarting");
        match self.executor.restart(view.shard_id, RestartParams::default()).await {
            Ok(_) => self.pending.push(PendingVerification {
                shard_id: view.shard_id,
                applied_at: Instant::now(),
                root_cause: "worker process stopped".to_string(),
                fix_type: FixType::Restart,
                params: None,
                diff: None,
                attempt_index: attempts + 1,
            }),
            Err(err) => error!(shard_id = view.shard_id, error = %err, "restart failed"),
        }
        Ok(())
    }

    async fn apply_scale_action(&mut self, action: ScaleAction, views: &[WorkerView]) {
        match action {
            ScaleAction::Down { shard_id } => {
                if self.settings.dry_run {
                    info!(shard_id, "[dry-run] would kill worker for scale-down");
                    return;
                }
                let pid = views
                    .iter()
                    .find(|v| v.shard_id == shard_id)
                    .and_then(|v| v.pid);
                if let Some(pid) = pid {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;
                    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        error!(shard_id, pid, error = %err, "scale-down kill failed");
                    } else {
                        info!(shard_id, pid, "scale-down: sent SIGTERM");
                    }
                }
            }
            ScaleAction::Up { shard_id } => {
                match self.executor.restart(shard_id, RestartParams::default()).await {
                    Ok(_) => info!(shard_id, "scale-up: worker started"),
                    Err(err) => error!(shard_id, error = %err, "scale-up failed"),
                }
            }
        }
    }

    /// Step D for one stuck worker.
    async fn fix_worker(
        &mut self,
        diagnosis: &StuckDiagnosis,
        pressure: Option<&DiskPressure>,
        disk_saturated: bool,
    ) -> Result<(), crate::error::MonitorError> {
        let shard_id = diagnosis.shard_id;
        if self.is_pending(shard_id) || self.in_cooldown(shard_id) {
            debug!(shard_id, "fix suppressed by pending verification or cooldown");
            return Ok(());
        }
        if self.paths.pause_flag(shard_id).exists() {
            return Ok(());
        }

        let attempts = self.history.attempts_since_recovery(
            shard_id,
            self.settings.attempt_window,
            Utc::now(),
        );
        if attempts >= self.settings.max_attempts {
            self.escalate(shard_id, attempts)?;
            return Ok(());
        }

        // When the fallback rule already explains the stall, skip the oracle
        // entirely; scale-down is Step C's job.
        let advice = if disk_saturated {
            debug!(shard_id, "disk saturated; skipping oracle");
            None
        } else {
            self.consult_oracle(diagnosis, pressure).await
        };

        let root_cause = advice
            .as_ref()
            .map(|a| a.root_cause.clone())
            .unwrap_or_else(|| default_root_cause(diagnosis, disk_saturated));
        let recurring = self.history.is_recurring(shard_id, &root_cause);
        let planned = plan_fix(advice.as_ref(), recurring);

        if planned == PlannedFix::LeaveToFleet {
            info!(shard_id, "oracle attributes the stall to disk pressure; no worker fix");
            return Ok(());
        }

        info!(
            shard_id,
            fix = %planned.fix_type(),
            recurring,
            root_cause = %root_cause,
            "applying fix"
        );

        let fix_type = planned.fix_type();
        let (params_json, result) = match planned {
            PlannedFix::Restart(params) => (None, self.executor.restart(shard_id, params).await),
            PlannedFix::Config(params) => (
                Some(serde_json::json!({
                    "parallel_uploads": params.parallel_uploads,
                    "batch_size": params.batch_size,
                })),
                self.executor.restart(shard_id, params).await,
            ),
            PlannedFix::Code(patch) => (None, self.executor.code_fix(shard_id, &patch).await),
            PlannedFix::LeaveToFleet => unreachable!("handled above"),
        };

        match result {
            Ok(applied) => {
                self.pending.push(PendingVerification {
                    shard_id,
                    applied_at: Instant::now(),
                    root_cause,
                    fix_type,
                    params: params_json,
                    diff: applied.diff,
                    attempt_index: attempts + 1,
                });
            }
            Err(err) => {
                warn!(shard_id, error = %err, "fix application failed; falling back to restart");
                if self
                    .executor
                    .restart(shard_id, RestartParams::default())
                    .await
                    .is_ok()
                {
                    self.pending.push(PendingVerification {
                        shard_id,
                        applied_at: Instant::now(),
                        root_cause,
                        fix_type: FixType::Restart,
                        params: None,
                        diff: None,
                        attempt_index: attempts + 1,
                    });
                }
            }
        }
        Ok(())
    }

    /// Ask the oracle, with a per-(worker, signature) cache so repeated
    /// stalls do not burn requests.
    async fn consult_oracle(
        &mut self,
        diagnosis: &StuckDiagnosis,
        pressure: Option<&DiskPressure>,
    ) -> Option<Advice> {
        let oracle = self.oracle.as_ref()?;

        // A log looping over one key range implicates catalog iteration;
        // hand the oracle that function so a code recommendation has
        // something concrete to patch.
        let mut code_snippets = Vec::new();
        if probe::key_range_repeats(&diagnosis.log_excerpt) {
            if let Some(snippet) = self
                .settings
                .snippet_source
                .as_ref()
                .and_then(|path| extract_function_snippet(path, "fetch_batch"))
            {
                code_snippets.push(snippet);
            }
        }

        let diagnostics = Diagnostics {
            worker_id: diagnosis.shard_id,
            minutes_stuck: diagnosis.minutes_stuck,
            last_upload_at: diagnosis.last_upload_at.map(|t| t.to_rfc3339()),
            shard_key_range: diagnosis.key_range.clone(),
            error_patterns: diagnosis.error_patterns.clone(),
            disk_util_percent: pressure.map(|p| p.percent),
            log_excerpt: diagnosis.log_excerpt.clone(),
            code_snippets,
        };

        let signature = signature_hash(&diagnostics.error_signature());
        let key = (diagnosis.shard_id, signature);
        if let Some((at, advice)) = self.oracle_cache.get(&key) {
            if at.elapsed() < self.settings.oracle_cache_ttl {
                debug!(shard_id = diagnosis.shard_id, "oracle cache hit");
                return Some(advice.clone());
            }
        }

        match oracle.analyze(&diagnostics).await {
            Ok(advice) => {
                info!(
                    shard_id = diagnosis.shard_id,
                    root_cause = %advice.root_cause,
                    fix_type = ?advice.fix_type,
                    confidence = advice.confidence,
                    "oracle analysis"
                );
                self.oracle_cache
                    .insert(key, (Instant::now(), advice.clone()));
                Some(advice)
            }
            Err(err) => {
                warn!(error = %err, "oracle unavailable; defaulting to restart");
                None
            }
        }
    }

    fn resolve_verifications(
        &mut self,
        still_stuck: &[StuckDiagnosis],
    ) -> Result<(), crate::error::MonitorError> {
        let verify_after = self.settings.verify_after;
        let due: Vec<PendingVerification> = {
            let mut due = Vec::new();
            let mut keep = Vec::new();
            for pending in self.pending.drain(..) {
                if pending.applied_at.elapsed() >= verify_after {
                    due.push(pending);
                } else {
                    keep.push(pending);
                }
            }
            self.pending = keep;
            due
        };

        for pending in due {
            let recovered = !still_stuck
                .iter()
                .any(|diagnosis| diagnosis.shard_id == pending.shard_id);
            let outcome = if recovered {
                FixOutcome::VerifiedOk
            } else {
                FixOutcome::NotRecovered
            };
            info!(
                shard_id = pending.shard_id,
                outcome = %outcome,
                attempt = pending.attempt_index,
                "fix verification"
            );
            self.history.record(FixAttempt {
                worker_id: pending.shard_id,
                ts: Utc::now(),
                root_cause: pending.root_cause,
                fix_type: pending.fix_type,
                params: pending.params,
                diff: pending.diff,
                outcome,
                attempt_index: pending.attempt_index,
            })?;
        }
        Ok(())
    }

    /// Attempt cap reached: park the worker until an operator intervenes.
    fn escalate(&self, shard_id: u32, attempts: u32) -> Result<(), crate::error::MonitorError> {
        let flag = self.paths.pause_flag(shard_id);
        if flag.exists() {
            return Ok(());
        }
        error!(
            shard_id,
            attempts, "fix attempts exhausted; pausing worker for operator intervention"
        );
        if !self.settings.dry_run {
            std::fs::write(&flag, format!("paused after {attempts} failed fixes\n")).map_err(
                |source| crate::error::MonitorError::Io {
                    path: flag.clone(),
                    source,
                },
            )?;
        }
        Ok(())
    }

    fn is_pending(&self, shard_id: u32) -> bool {
        self.pending.iter().any(|p| p.shard_id == shard_id)
    }

    fn in_cooldown(&self, shard_id: u32) -> bool {
        let Some(last) = self.history.last_attempt_at(shard_id) else {
            return false;
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::MAX);
        elapsed < self.settings.fix_cooldown
    }
}

fn default_root_cause(diagnosis: &StuckDiagnosis, disk_saturated: bool) -> String {
    if disk_saturated {
        return "disk io saturation".to_string();
    }
    diagnosis
        .error_patterns
        .first()
        .cloned()
        .unwrap_or_else(|| format!("no uploads for {} minutes", diagnosis.minutes_stuck))
}

/// Turn advice (or its absence) into a concrete plan. Code recommendations
/// require recurrence and the confidence floor; everything doubtful becomes
/// a restart.
pub fn plan_fix(advice: Option<&Advice>, recurring: bool) -> PlannedFix {
    let Some(advice) = advice else {
        return PlannedFix::Restart(RestartParams::default());
    };

    match advice.fix_type {
        FixKind::Restart => PlannedFix::Restart(RestartParams::default()),
        FixKind::ScaleDown => PlannedFix::LeaveToFleet,
        FixKind::Config => {
            let params = advice
                .params
                .as_ref()
                .map(restart_params_from_json)
                .unwrap_or_default();
            PlannedFix::Config(params)
        }
        FixKind::Code => {
            if !recurring || advice.confidence < CODE_CONFIDENCE_FLOOR {
                return PlannedFix::Restart(RestartParams::default());
            }
            match advice
                .patch
                .as_ref()
                .and_then(|raw| serde_json::from_value::<PatchSpec>(raw.clone()).ok())
            {
                Some(patch) => PlannedFix::Code(patch),
                None => PlannedFix::Restart(RestartParams::default()),
            }
        }
    }
}

fn restart_params_from_json(value: &serde_json::Value) -> RestartParams {
    RestartParams {
        parallel_uploads: value
            .get("parallel_uploads")
            .and_then(|v| v.as_u64())
            .map(|v| v.clamp(1, 10) as usize),
        batch_size: value
            .get("batch_size")
            .and_then(|v| v.as_u64())
            .map(|v| v.max(1) as usize),
    }
}

fn signature_hash(signature: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(signature.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pull the named `fn` item out of a source file, bounded to keep the
/// prompt small.
fn extract_function_snippet(
    path: &std::path::Path,
    name: &str,
) -> Option<oracle_ox::CodeSnippet> {
    const MAX_SNIPPET_LINES: usize = 80;

    let source = std::fs::read_to_string(path).ok()?;
    let needle = format!("fn {name}");
    let start = source.find(&needle)?;
    let line_start = source[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);

    let mut depth = 0i64;
    let mut entered = false;
    let mut lines = Vec::new();
    for line in source[line_start..].lines().take(MAX_SNIPPET_LINES) {
        lines.push(line);
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    entered = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if entered && depth <= 0 {
            break;
        }
    }

    Some(oracle_ox::CodeSnippet {
        name: name.to_string(),
        source: lines.join("\n"),
    })
}
