use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const PROXY_TOKEN_ENV: &str = "OUTREACH_PROXY_TOKEN";
pub const CAPTCHA_KEY_ENV: &str = "OUTREACH_CAPTCHA_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ControllerConfig {
    pub limits: LimitsSection,
    pub schedule: ScheduleSection,
    pub pacing: PacingSection,
    pub retry: RetrySection,
    pub proxy: ProxySection,
    pub session: SessionSection,
    pub captcha: CaptchaSection,
    pub orchestrator: OrchestratorSection,
    pub observability: ObservabilitySection,
}

impl ControllerConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.orchestrator.state_dir).join(path)
        }
    }

    /// Credentials may come from the environment instead of the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(PROXY_TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.proxy.api_token = Some(token);
            }
        }
        if let Ok(key) = std::env::var(CAPTCHA_KEY_ENV) {
            if !key.trim().is_empty() {
                self.captcha.api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.daily_limit == 0 {
            return Err(ConfigError::invalid("limits.daily_limit", "must be > 0"));
        }
        if self.limits.weekly_limit < self.limits.daily_limit {
            return Err(ConfigError::invalid(
                "limits.weekly_limit",
                "must be >= limits.daily_limit",
            ));
        }
        let [start, end] = self.schedule.operating_hours;
        if start > 24 || end > 24 {
            return Err(ConfigError::invalid(
                "schedule.operating_hours",
                format!("hours must be within 0..=24, got [{start}, {end}]"),
            ));
        }
        if self.pacing.min_delay_seconds < 0.0
            || self.pacing.max_delay_seconds < self.pacing.min_delay_seconds
        {
            return Err(ConfigError::invalid(
                "pacing",
                "expected 0 <= min_delay_seconds <= max_delay_seconds",
            ));
        }
        if self.pacing.backoff_cap < 1.0 {
            return Err(ConfigError::invalid("pacing.backoff_cap", "must be >= 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be > 0"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::invalid(
                "retry.jitter_fraction",
                "must be within [0, 1)",
            ));
        }
        if self.proxy.failure_decrement <= self.proxy.success_increment {
            return Err(ConfigError::invalid(
                "proxy.failure_decrement",
                "must be larger than proxy.success_increment",
            ));
        }
        if self.proxy.top_k == 0 {
            return Err(ConfigError::invalid("proxy.top_k", "must be > 0"));
        }
        if self.proxy.enabled && self.proxy.api_url.is_none() && self.proxy.list_path.is_none()
        {
            return Err(ConfigError::invalid(
                "proxy",
                "enabled without api_url or list_path",
            ));
        }
        if self.session.target_domain.trim().is_empty() {
            return Err(ConfigError::invalid("session.target_domain", "is empty"));
        }
        if self.session.essential_cookies.is_empty() {
            return Err(ConfigError::invalid(
                "session.essential_cookies",
                "at least one cookie name is required",
            ));
        }
        if self.captcha.enabled && self.captcha.api_key.is_none() {
            return Err(ConfigError::invalid(
                "captcha.api_key",
                format!("captcha enabled without api_key (or {CAPTCHA_KEY_ENV})"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub daily_limit: u32,
    pub weekly_limit: u32,
    pub categories: HashMap<String, CategoryLimits>,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            daily_limit: 15,
            weekly_limit: 100,
            categories: HashMap::new(),
        }
    }
}

impl LimitsSection {
    pub fn limits_for(&self, category: &str) -> (u32, u32) {
        match self.categories.get(category) {
            Some(limits) => (
                limits.daily_limit.unwrap_or(self.daily_limit),
                limits.weekly_limit.unwrap_or(self.weekly_limit),
            ),
            None => (self.daily_limit, self.weekly_limit),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryLimits {
    pub daily_limit: Option<u32>,
    pub weekly_limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    /// `[start, end)` in local hours. `start > end` wraps past midnight,
    /// `start == end` means always open.
    pub operating_hours: [u32; 2],
    pub utc_offset_minutes: i32,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            operating_hours: [9, 18],
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub delay_ceiling_seconds: f64,
    pub backoff_cap: f64,
    pub base_cooldown_minutes: u64,
    pub detection_free_window_hours: u64,
    pub rng_seed: Option<u64>,
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            min_delay_seconds: 30.0,
            max_delay_seconds: 90.0,
            delay_ceiling_seconds: 900.0,
            backoff_cap: 8.0,
            base_cooldown_minutes: 60,
            detection_free_window_hours: 24,
            rng_seed: None,
        }
    }
}

impl PacingSection {
    pub fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.base_cooldown_minutes * 60)
    }

    pub fn detection_free_window(&self) -> Duration {
        Duration::from_secs(self.detection_free_window_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub enabled: bool,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub list_path: Option<String>,
    pub probe_url: String,
    pub probe_timeout_seconds: u64,
    pub freshness_seconds: u64,
    pub top_k: usize,
    pub max_selection_attempts: usize,
    pub validation_concurrency: usize,
    pub success_increment: f64,
    pub failure_decrement: f64,
    pub blacklist_threshold: f64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: None,
            api_token: None,
            list_path: None,
            probe_url: "https://www.example.com/".to_string(),
            probe_timeout_seconds: 10,
            freshness_seconds: 300,
            top_k: 3,
            max_selection_attempts: 3,
            validation_concurrency: 5,
            success_increment: 0.05,
            failure_decrement: 0.2,
            blacklist_threshold: 0.2,
        }
    }
}

impl ProxySection {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub target_domain: String,
    pub essential_cookies: Vec<String>,
    pub ttl_hours: u64,
    pub detection_threshold: f64,
    pub urgency_threshold: f64,
    pub detection_increment: f64,
    pub detection_decay: f64,
    pub rotation_interval_minutes: u64,
    pub rotation_jitter_minutes: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            target_domain: "www.example.com".to_string(),
            essential_cookies: vec!["session_token".to_string()],
            ttl_hours: 24 * 7,
            detection_threshold: 3.0,
            urgency_threshold: 2.0,
            detection_increment: 1.0,
            detection_decay: 0.25,
            rotation_interval_minutes: 60,
            rotation_jitter_minutes: 15,
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaSection {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: Option<String>,
    pub website_url: Option<String>,
    pub poll_interval_seconds: u64,
    pub max_polls: u32,
    pub deadline_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for CaptchaSection {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://api.anti-captcha.com".to_string(),
            api_key: None,
            website_url: None,
            poll_interval_seconds: 5,
            max_polls: 24,
            deadline_seconds: 180,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_actions_per_run: usize,
    pub max_cooldown_wait_seconds: u64,
    pub state_dir: String,
    pub executor_program: String,
    pub executor_args: Vec<String>,
    pub executor_timeout_seconds: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_actions_per_run: 15,
            max_cooldown_wait_seconds: 0,
            state_dir: "state".to_string(),
            executor_program: "outreach-agent".to_string(),
            executor_args: Vec::new(),
            executor_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub enabled: bool,
    pub failure_log: String,
    pub metrics_db: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_log: "failures.jsonl".to_string(),
            metrics_db: "metrics.sqlite".to_string(),
        }
    }
}

pub fn load_controller_config<P: AsRef<Path>>(path: P) -> Result<ControllerConfig> {
    let mut config: ControllerConfig = load_toml(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
