use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ControllerConfig;

use super::captcha::{extract_challenge_parameters, AntiCaptchaClient, CaptchaBridge, CaptchaSolver};
use super::clock::{Clock, SystemClock};
use super::error::{ControllerError, ControllerResult};
use super::error_handler::{
    AutomationTelemetry, ErrorClassification, FailureContext, RemediationAction, RunContext,
};
use super::executor::{ActionExecutor, PendingAction};
use super::metrics::ControllerMetrics;
use super::proxy_pool::{
    HttpProbe, LocalProxyList, ProxyPool, ProxyProbe, ProxyRecord, ProxySource, RemoteProxySource,
};
use super::rate_budget::{ActionBudget, Admission, DenyReason, RateBudget};
use super::retry::{RetryClassifier, RetryFailure};
use super::session_guard::{SessionGuard, SessionInvalid};
use super::store::{
    load_typed, save_typed, PersistenceStore, BUDGET_KEY, PENDING_KEY, PROCESSED_KEY,
    PROXY_BLACKLIST_KEY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub action_id: String,
    pub category: String,
    pub target: String,
    pub status: ProcessedStatus,
    pub detail: Option<String>,
    pub proxy: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    QueueDrained,
    ActionLimitReached { limit: usize },
    OutsideOperatingHours { hour: u32, window: [u32; 2] },
    CoolingDown { remaining_secs: u64 },
    RateLimited { category: String, cooldown_secs: u64 },
    DetectionPressure { score: f64, cooldown_secs: u64 },
    Fatal { error: String },
}

impl StopReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StopReason::Fatal { .. })
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::QueueDrained => write!(f, "queue drained"),
            StopReason::ActionLimitReached { limit } => {
                write!(f, "per-run action limit of {limit} reached")
            }
            StopReason::OutsideOperatingHours { hour, window } => write!(
                f,
                "hour {hour} outside operating window {}-{}",
                window[0], window[1]
            ),
            StopReason::CoolingDown { remaining_secs } => {
                write!(f, "cooling down for another {remaining_secs}s")
            }
            StopReason::RateLimited {
                category,
                cooldown_secs,
            } => write!(
                f,
                "rate limited on {category}, cooling down {cooldown_secs}s"
            ),
            StopReason::DetectionPressure {
                score,
                cooldown_secs,
            } => write!(
                f,
                "detection score {score:.2} over threshold, cooling down {cooldown_secs}s"
            ),
            StopReason::Fatal { error } => write!(f, "fatal: {error}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub remaining: usize,
    pub stop_reason: StopReason,
    pub metrics: ControllerMetrics,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PreviewDecision {
    Admit,
    Defer { reason: String },
    Stop { reason: String },
    BeyondRunLimit,
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewEntry {
    pub action_id: String,
    pub category: String,
    pub target: String,
    pub decision: PreviewDecision,
}

/// External collaborators the orchestrator drives.
pub struct Collaborators {
    pub executor: Arc<dyn ActionExecutor>,
    pub store: Arc<dyn PersistenceStore>,
    pub clock: Arc<dyn Clock>,
    pub probe: Arc<dyn ProxyProbe>,
    pub proxy_sources: Vec<Arc<dyn ProxySource>>,
    pub captcha_solver: Option<Arc<dyn CaptchaSolver>>,
    pub telemetry: Option<Arc<AutomationTelemetry>>,
}

impl Collaborators {
    /// Production wiring: system clock, HTTP probe, configured proxy sources,
    /// the solver API when captcha solving is enabled and telemetry when
    /// observability is on.
    pub fn from_config(
        config: &ControllerConfig,
        executor: Arc<dyn ActionExecutor>,
        store: Arc<dyn PersistenceStore>,
    ) -> ControllerResult<Self> {
        let probe: Arc<dyn ProxyProbe> = Arc::new(HttpProbe::new(
            config.proxy.probe_url.clone(),
            config.proxy.probe_timeout(),
        ));
        let captcha_solver = if config.captcha.enabled {
            let client: Arc<dyn CaptchaSolver> =
                Arc::new(AntiCaptchaClient::from_config(&config.captcha)?);
            Some(client)
        } else {
            None
        };
        let telemetry = if config.observability.enabled {
            let telemetry = AutomationTelemetry::new(
                config.resolve_path(&config.observability.failure_log),
                config.resolve_path(&config.observability.metrics_db),
            )?;
            Some(Arc::new(telemetry))
        } else {
            None
        };
        Ok(Self {
            executor,
            store,
            clock: Arc::new(SystemClock),
            probe,
            proxy_sources: proxy_sources(config)?,
            captcha_solver,
            telemetry,
        })
    }
}

/// Remote listing first, local file second.
pub fn proxy_sources(config: &ControllerConfig) -> ControllerResult<Vec<Arc<dyn ProxySource>>> {
    let mut sources: Vec<Arc<dyn ProxySource>> = Vec::new();
    if let Some(url) = config.proxy.api_url.as_deref().filter(|u| !u.trim().is_empty()) {
        sources.push(Arc::new(RemoteProxySource::new(
            url,
            config.proxy.api_token.clone(),
            config.proxy.probe_timeout(),
        )?));
    }
    if let Some(path) = config.proxy.list_path.as_deref().filter(|p| !p.trim().is_empty()) {
        sources.push(Arc::new(LocalProxyList::new(config.resolve_path(path))));
    }
    Ok(sources)
}

enum StepOutcome {
    Completed {
        detail: Option<String>,
        proxy: Option<String>,
    },
    Failed {
        detail: String,
        proxy: Option<String>,
    },
    Skipped { reason: String },
    Deferred(DenyReason),
    Stop(StopReason),
}

/// Drives the bounded action loop over the pending queue.
pub struct Orchestrator {
    max_actions_per_run: usize,
    max_cooldown_wait: Duration,
    proxy_enabled: bool,
    budget: RateBudget,
    proxies: ProxyPool,
    proxy_sources: Vec<Arc<dyn ProxySource>>,
    session: SessionGuard,
    retry: RetryClassifier,
    captcha: Option<CaptchaBridge>,
    challenge_page_url: String,
    executor: Arc<dyn ActionExecutor>,
    store: Arc<dyn PersistenceStore>,
    telemetry: Option<Arc<AutomationTelemetry>>,
    clock: Arc<dyn Clock>,
    active_proxy: Option<ProxyRecord>,
    session_verified: bool,
    metrics: ControllerMetrics,
}

impl Orchestrator {
    pub fn new(config: &ControllerConfig, parts: Collaborators) -> Self {
        let clock = parts.clock;
        let budget = RateBudget::new(
            config.limits.clone(),
            config.schedule.clone(),
            config.pacing.clone(),
            Arc::clone(&clock),
        );
        let (proxies, session, retry) = match config.pacing.rng_seed {
            Some(seed) => (
                ProxyPool::with_seed(
                    config.proxy.clone(),
                    parts.probe,
                    Arc::clone(&clock),
                    seed.wrapping_add(1),
                ),
                SessionGuard::with_seed(
                    config.session.clone(),
                    Arc::clone(&clock),
                    seed.wrapping_add(2),
                ),
                RetryClassifier::with_seed(
                    config.retry.clone(),
                    Arc::clone(&clock),
                    seed.wrapping_add(3),
                ),
            ),
            None => (
                ProxyPool::new(config.proxy.clone(), parts.probe, Arc::clone(&clock)),
                SessionGuard::new(config.session.clone(), Arc::clone(&clock)),
                RetryClassifier::new(config.retry.clone(), Arc::clone(&clock)),
            ),
        };
        let captcha = match (&parts.captcha_solver, config.captcha.enabled) {
            (Some(solver), true) => Some(CaptchaBridge::new(
                &config.captcha,
                Arc::clone(solver),
                Arc::clone(&clock),
            )),
            _ => None,
        };
        Self {
            max_actions_per_run: config.orchestrator.max_actions_per_run,
            max_cooldown_wait: Duration::from_secs(config.orchestrator.max_cooldown_wait_seconds),
            proxy_enabled: config.proxy.enabled,
            budget,
            proxies,
            proxy_sources: parts.proxy_sources,
            session,
            retry,
            captcha,
            challenge_page_url: format!("https://{}/", config.session.target_domain),
            executor: parts.executor,
            store: parts.store,
            telemetry: parts.telemetry,
            clock,
            active_proxy: None,
            session_verified: false,
            metrics: ControllerMetrics::default(),
        }
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Load persisted budgets and the proxy blacklist.
    pub async fn restore_state(&mut self) -> ControllerResult<()> {
        let budgets: Vec<ActionBudget> = load_typed(self.store.as_ref(), BUDGET_KEY).await?;
        self.budget.restore(budgets);
        let blacklist: Vec<String> =
            load_typed(self.store.as_ref(), PROXY_BLACKLIST_KEY).await?;
        self.proxies.restore_blacklist(blacklist);
        self.budget.reset_if_window_elapsed();
        Ok(())
    }

    async fn persist_state(&self) -> ControllerResult<()> {
        save_typed(self.store.as_ref(), BUDGET_KEY, &self.budget.snapshot()).await?;
        save_typed(
            self.store.as_ref(),
            PROXY_BLACKLIST_KEY,
            &self.proxies.blacklisted_identities(),
        )
        .await?;
        // Cookies are only written back once this run has seen a valid session.
        if self.session_verified {
            let cookies = self.executor.get_cookies().await?;
            self.session.persist(&cookies, self.store.as_ref()).await?;
        }
        Ok(())
    }

    /// Admission decision for every pending action, as a run would see them
    /// right now. Nothing is executed or persisted.
    pub async fn preview(&mut self) -> ControllerResult<Vec<PreviewEntry>> {
        self.restore_state().await?;
        let pending: Vec<PendingAction> = load_typed(self.store.as_ref(), PENDING_KEY).await?;
        let mut shadow = self.budget.clone();
        let mut admitted = 0usize;
        let mut stopped: Option<String> = None;
        let mut entries = Vec::with_capacity(pending.len());

        for action in pending {
            let decision = if let Some(reason) = invalid_reason(&action) {
                PreviewDecision::Invalid { reason }
            } else if let Some(reason) = &stopped {
                PreviewDecision::Stop {
                    reason: reason.clone(),
                }
            } else if admitted >= self.max_actions_per_run {
                PreviewDecision::BeyondRunLimit
            } else {
                match shadow.try_admit(&action.category) {
                    Admission::Admitted => {
                        shadow.record_success(&action.category);
                        admitted += 1;
                        PreviewDecision::Admit
                    }
                    Admission::Denied(reason) if reason.is_quota() => PreviewDecision::Defer {
                        reason: reason.to_string(),
                    },
                    Admission::Denied(reason) => {
                        let reason = reason.to_string();
                        stopped = Some(reason.clone());
                        PreviewDecision::Stop { reason }
                    }
                }
            };
            entries.push(PreviewEntry {
                action_id: action.id,
                category: action.category,
                target: action.target,
                decision,
            });
        }
        Ok(entries)
    }

    pub async fn run(&mut self) -> ControllerResult<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = self.clock.now();
        self.metrics = ControllerMetrics::default();
        self.session_verified = false;
        self.restore_state().await?;

        if let Some(session) = self.session.load_persisted(self.store.as_ref()).await? {
            let cookies: Vec<_> = session.cookies.into_values().collect();
            self.executor.set_cookies(&cookies).await?;
        }
        if self.proxy_enabled {
            let loaded = self.proxies.load(&self.proxy_sources).await;
            if loaded == 0 {
                warn!("proxy rotation enabled but no usable proxies were loaded");
            }
        }

        let pending: Vec<PendingAction> = load_typed(self.store.as_ref(), PENDING_KEY).await?;
        let mut remaining = pending.clone();
        info!(
            run_id = %run_id,
            pending = pending.len(),
            limit = self.max_actions_per_run,
            "controller run starting"
        );

        let mut attempted = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        let mut deferred = 0usize;
        let mut stop_reason = StopReason::QueueDrained;

        for action in &pending {
            if attempted >= self.max_actions_per_run {
                stop_reason = StopReason::ActionLimitReached {
                    limit: self.max_actions_per_run,
                };
                break;
            }
            let outcome = match self.step(action, &mut attempted).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(action_id = %action.id, error = %err, "fatal failure, stopping run");
                    stop_reason = StopReason::Fatal {
                        error: err.to_string(),
                    };
                    break;
                }
            };
            let (status, detail, proxy) = match outcome {
                StepOutcome::Completed { detail, proxy } => {
                    succeeded += 1;
                    (ProcessedStatus::Done, detail, proxy)
                }
                StepOutcome::Failed { detail, proxy } => {
                    failed += 1;
                    (ProcessedStatus::Failed, Some(detail), proxy)
                }
                StepOutcome::Skipped { reason } => {
                    skipped += 1;
                    self.metrics.record_skip();
                    (ProcessedStatus::Skipped, Some(reason), None)
                }
                StepOutcome::Deferred(reason) => {
                    deferred += 1;
                    debug!(action_id = %action.id, %reason, "action deferred");
                    continue;
                }
                StepOutcome::Stop(reason) => {
                    stop_reason = reason;
                    break;
                }
            };
            let record = ProcessedRecord {
                action_id: action.id.clone(),
                category: action.category.clone(),
                target: action.target.clone(),
                status,
                detail,
                proxy,
                processed_at: self.clock.now(),
            };
            if let Err(err) = self.record_processed(record, &mut remaining).await {
                error!(action_id = %action.id, error = %err, "failed to persist outcome");
                stop_reason = StopReason::Fatal {
                    error: err.to_string(),
                };
                break;
            }
        }

        if let Err(err) = self.persist_state().await {
            if stop_reason.is_fatal() {
                error!(error = %err, "partial progress could not be fully persisted");
            } else {
                error!(error = %err, "state persistence failed");
                stop_reason = StopReason::Fatal {
                    error: err.to_string(),
                };
            }
        }

        let finished_at = self.clock.now();
        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            attempted,
            succeeded,
            failed,
            skipped,
            deferred,
            remaining: remaining.len(),
            stop_reason,
            metrics: self.metrics.clone(),
            duration_ms: (finished_at - started_at).num_milliseconds(),
        };
        self.record_run(&report);
        info!(
            run_id = %report.run_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            remaining = report.remaining,
            stop_reason = %report.stop_reason,
            "controller run finished"
        );
        Ok(report)
    }

    async fn step(
        &mut self,
        action: &PendingAction,
        attempted: &mut usize,
    ) -> ControllerResult<StepOutcome> {
        if let Some(reason) = invalid_reason(action) {
            warn!(action_id = %action.id, %reason, "skipping malformed action");
            return Ok(StepOutcome::Skipped { reason });
        }

        if let Some(stop) = self.admit(&action.category).await? {
            return Ok(stop);
        }
        *attempted += 1;
        self.metrics.record_attempt();

        let delay = self.budget.compute_delay();
        self.metrics
            .record_pacing(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        debug!(action_id = %action.id, delay_ms = delay.as_millis() as u64, "pacing before action");
        self.clock.sleep(delay).await;

        if let Some(stop) = self.ensure_session(&action.category).await? {
            return Ok(StepOutcome::Stop(stop));
        }

        if self.proxy_enabled
            && (self.active_proxy.is_none() || self.session.should_rotate_identity())
        {
            let reason = if self.active_proxy.is_none() {
                "no active identity"
            } else {
                "rotation due"
            };
            self.rotate_identity(reason).await?;
        }

        let executor = Arc::clone(&self.executor);
        let label = format!("{}:{}", action.category, action.id);
        let result = self
            .retry
            .with_retry(&label, |_| executor.perform_action(action))
            .await;

        match result {
            Ok(outcome) => {
                self.budget.record_success(&action.category);
                if let Some(identity) = self.active_identity() {
                    self.proxies.mark_success(&identity);
                }
                self.metrics.record_success(outcome.attempts);
                if outcome.result.signal.fired() {
                    self.session
                        .register_detection(&outcome.result.signal.indicators);
                    self.metrics.record_detection();
                }
                info!(
                    action_id = %action.id,
                    category = %action.category,
                    attempts = outcome.attempts,
                    "action completed"
                );
                Ok(StepOutcome::Completed {
                    detail: outcome.result.detail,
                    proxy: self.active_identity(),
                })
            }
            Err(failure) => self.handle_failure(action, failure).await,
        }
    }

    /// `Ok(None)` when admitted, `Ok(Some(outcome))` when the action has to
    /// wait for a later run.
    async fn admit(&mut self, category: &str) -> ControllerResult<Option<StepOutcome>> {
        loop {
            self.budget.reset_if_window_elapsed();
            match self.budget.try_admit(category) {
                Admission::Admitted => return Ok(None),
                Admission::Denied(reason) if reason.is_quota() => {
                    return Ok(Some(StepOutcome::Deferred(reason)))
                }
                Admission::Denied(DenyReason::OutsideOperatingHours { hour, window }) => {
                    info!(hour, ?window, "outside operating hours");
                    return Ok(Some(StepOutcome::Stop(StopReason::OutsideOperatingHours {
                        hour,
                        window,
                    })));
                }
                Admission::Denied(DenyReason::CoolingDown { remaining }) => {
                    if remaining > self.max_cooldown_wait {
                        info!(remaining_secs = remaining.as_secs(), "cool-down active");
                        return Ok(Some(StepOutcome::Stop(StopReason::CoolingDown {
                            remaining_secs: remaining.as_secs(),
                        })));
                    }
                    info!(remaining_secs = remaining.as_secs(), "waiting out cool-down");
                    self.clock.sleep(remaining).await;
                }
                Admission::Denied(reason) => {
                    return Ok(Some(StepOutcome::Deferred(reason)));
                }
            }
        }
    }

    /// `Ok(Some(stop))` when detection pressure rules out acting at all;
    /// a fresh login would not lower it.
    async fn ensure_session(&mut self, category: &str) -> ControllerResult<Option<StopReason>> {
        let cookies = self.executor.get_cookies().await?;
        let signal = self.executor.inspect_page().await?;
        if signal.fired() {
            self.metrics.record_detection();
        }
        if self.session.is_valid(&cookies, &signal) {
            if !signal.fired() {
                self.session.decay_detection();
            }
            self.session_verified = true;
            return Ok(None);
        }
        if let Err(SessionInvalid::DetectionPressure { score }) = self.session.check() {
            return Ok(Some(self.detection_stop(category, score)));
        }

        info!("session invalid, re-authenticating");
        self.metrics.record_reauthentication();
        self.executor
            .reauthenticate()
            .await
            .map_err(|err| ControllerError::AuthenticationLost(err.to_string()))?;
        let cookies = self.executor.get_cookies().await?;
        self.session.establish(&cookies);
        match self.session.check() {
            Ok(()) => {}
            Err(SessionInvalid::DetectionPressure { score }) => {
                return Ok(Some(self.detection_stop(category, score)));
            }
            Err(reason) => {
                return Err(ControllerError::AuthenticationLost(format!(
                    "session still invalid after re-authentication: {reason}"
                )));
            }
        }
        self.session.persist(&cookies, self.store.as_ref()).await?;
        self.session_verified = true;
        Ok(None)
    }

    fn detection_stop(&mut self, category: &str, score: f64) -> StopReason {
        let cooldown = self.budget.on_detection_signal(category);
        warn!(
            score,
            cooldown_secs = cooldown.as_secs(),
            "detection pressure, ending run"
        );
        StopReason::DetectionPressure {
            score,
            cooldown_secs: cooldown.as_secs(),
        }
    }

    async fn rotate_identity(&mut self, reason: &str) -> ControllerResult<()> {
        let record = match self.proxies.select().await {
            Ok(record) => record,
            Err(err) if self.active_proxy.is_some() => {
                warn!(error = %err, "rotation failed, keeping current identity");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.executor.use_identity(Some(&record)).await?;
        let identity = record.identity();
        self.session.mark_rotated();
        self.metrics.record_proxy_rotation();
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_proxy_rotation(&identity, reason)?;
        }
        info!(identity = %identity, reason, "network identity rotated");
        self.active_proxy = Some(record);
        Ok(())
    }

    async fn handle_failure(
        &mut self,
        action: &PendingAction,
        failure: RetryFailure,
    ) -> ControllerResult<StepOutcome> {
        let proxy = self.active_identity();
        match failure.classification {
            ErrorClassification::RateLimited => {
                let cooldown = self.budget.on_detection_signal(&action.category);
                self.session
                    .record_classification(ErrorClassification::RateLimited);
                self.metrics.record_detection();
                self.metrics.record_failure(failure.attempts);
                self.record_failure(
                    action,
                    &failure,
                    proxy,
                    RemediationAction::BackoffEscalated {
                        cooldown_secs: cooldown.as_secs(),
                    },
                )?;
                self.try_captcha().await?;
                Ok(StepOutcome::Stop(StopReason::RateLimited {
                    category: action.category.clone(),
                    cooldown_secs: cooldown.as_secs(),
                }))
            }
            ErrorClassification::Silent | ErrorClassification::Transient => {
                self.metrics.record_failure(failure.attempts);
                let remediation = match &proxy {
                    Some(identity) => {
                        self.burn_identity(identity);
                        RemediationAction::IdentityRotated {
                            identity: Some(identity.clone()),
                        }
                    }
                    None => RemediationAction::Skipped,
                };
                self.record_failure(action, &failure, proxy.clone(), remediation)?;
                Ok(StepOutcome::Failed {
                    detail: failure.error.to_string(),
                    proxy,
                })
            }
            ErrorClassification::Fatal => {
                self.metrics.record_failure(failure.attempts);
                if failure.escalated || failure.error.is_network() {
                    if let Some(identity) = &proxy {
                        self.burn_identity(identity);
                    }
                }
                self.record_failure(action, &failure, proxy, RemediationAction::Abort)?;
                Err(failure.into_error())
            }
        }
    }

    /// Penalize the identity a failure ran through and drop it, so the next
    /// action selects a fresh one.
    fn burn_identity(&mut self, identity: &str) {
        if self.proxies.mark_failure(identity) {
            self.metrics.record_blacklisted();
        }
        self.active_proxy = None;
    }

    /// Solve a challenge left on the page after a rate-limit signal. An
    /// unsolved challenge is fatal.
    async fn try_captcha(&mut self) -> ControllerResult<()> {
        let Some(bridge) = &self.captcha else {
            return Ok(());
        };
        let content = self.executor.page_content().await?;
        if extract_challenge_parameters(&content).is_none() {
            return Ok(());
        }
        let result = bridge
            .solve(
                &content,
                &self.challenge_page_url,
                self.active_proxy.as_ref(),
                self.executor.as_ref(),
            )
            .await;
        self.metrics.record_captcha(result.is_ok());
        result
    }

    fn record_failure(
        &self,
        action: &PendingAction,
        failure: &RetryFailure,
        proxy: Option<String>,
        remediation: RemediationAction,
    ) -> ControllerResult<()> {
        let Some(telemetry) = &self.telemetry else {
            return Ok(());
        };
        telemetry.record_failure(&FailureContext {
            timestamp: self.clock.now(),
            action_id: action.id.clone(),
            category: action.category.clone(),
            classification: failure.classification,
            error_message: failure.error.to_string(),
            attempt: failure.attempts,
            proxy,
            action: remediation,
        })?;
        Ok(())
    }

    fn record_run(&self, report: &RunReport) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let context = RunContext {
            timestamp: report.finished_at,
            run_id: report.run_id.clone(),
            attempted: report.attempted as u64,
            succeeded: report.succeeded as u64,
            failed: report.failed as u64,
            skipped: report.skipped as u64,
            detections: report.metrics.detections,
            proxy_rotations: report.metrics.proxy_rotations,
            stop_reason: report.stop_reason.to_string(),
            duration_ms: report.duration_ms,
        };
        if let Err(err) = telemetry.record_run(&context) {
            warn!(error = %err, "failed to record run telemetry");
        }
    }

    async fn record_processed(
        &self,
        record: ProcessedRecord,
        remaining: &mut Vec<PendingAction>,
    ) -> ControllerResult<()> {
        self.store
            .append(PROCESSED_KEY, serde_json::to_value(&record)?)
            .await?;
        remaining.retain(|pending| pending.id != record.action_id);
        save_typed(self.store.as_ref(), PENDING_KEY, remaining).await?;
        Ok(())
    }

    fn active_identity(&self) -> Option<String> {
        self.active_proxy.as_ref().map(ProxyRecord::identity)
    }
}

fn invalid_reason(action: &PendingAction) -> Option<String> {
    if action.id.trim().is_empty() {
        Some("missing action id".to_string())
    } else if action.category.trim().is_empty() {
        Some("missing category".to_string())
    } else if action.target.trim().is_empty() {
        Some("missing target".to_string())
    } else {
        None
    }
}
