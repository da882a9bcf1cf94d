use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::CaptchaSection;

use super::clock::{to_chrono, Clock};
use super::error::{ControllerError, ControllerResult};
use super::executor::ActionExecutor;
use super::proxy_pool::ProxyRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    FunCaptcha,
    RecaptchaV2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeParameters {
    pub kind: ChallengeKind,
    pub public_key: String,
    pub subdomain: Option<String>,
}

struct ChallengePattern {
    kind: ChallengeKind,
    regex: Regex,
}

/// Embedding conventions, most specific first. `key` is mandatory, `sub`
/// optional.
const CHALLENGE_PATTERNS: &[(ChallengeKind, &str)] = &[
    (
        ChallengeKind::FunCaptcha,
        r"(?i)https?://(?P<sub>[a-z0-9.-]*arkoselabs\.com)/v2/(?P<key>[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    ),
    (
        ChallengeKind::FunCaptcha,
        r#"(?i)data-pkey\s*=\s*["'](?P<key>[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})["']"#,
    ),
    (
        ChallengeKind::FunCaptcha,
        r"(?i)[?&#]pk=(?P<key>[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    ),
    (
        ChallengeKind::RecaptchaV2,
        r#"(?i)data-sitekey\s*=\s*["'](?P<key>[A-Za-z0-9_-]{40})["']"#,
    ),
];

const SERVICE_URL_PATTERN: &str = r"(?i)surl=https?(?:%3A%2F%2F|://)(?P<sub>[a-z0-9.-]+)";

fn challenge_patterns() -> &'static [ChallengePattern] {
    static PATTERNS: OnceLock<Vec<ChallengePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CHALLENGE_PATTERNS
            .iter()
            .filter_map(|(kind, pattern)| {
                Regex::new(pattern).ok().map(|regex| ChallengePattern {
                    kind: *kind,
                    regex,
                })
            })
            .collect()
    })
}

fn service_url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(SERVICE_URL_PATTERN).ok())
        .as_ref()
}

pub fn extract_challenge_parameters(page_content: &str) -> Option<ChallengeParameters> {
    for pattern in challenge_patterns() {
        let Some(captures) = pattern.regex.captures(page_content) else {
            continue;
        };
        let Some(key) = captures.name("key") else {
            continue;
        };
        let subdomain = captures
            .name("sub")
            .map(|m| m.as_str().to_ascii_lowercase())
            .or_else(|| {
                if pattern.kind != ChallengeKind::FunCaptcha {
                    return None;
                }
                service_url_pattern()
                    .and_then(|regex| regex.captures(page_content))
                    .and_then(|c| c.name("sub").map(|m| m.as_str().to_ascii_lowercase()))
            });
        return Some(ChallengeParameters {
            kind: pattern.kind,
            public_key: key.as_str().to_ascii_uppercase(),
            subdomain,
        });
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaStatus {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaTask {
    pub id: String,
    pub kind: ChallengeKind,
    pub status: CaptchaStatus,
    pub solution: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverPoll {
    Processing,
    Ready(String),
    Failed(String),
}

/// External challenge-solving service.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn create_task(
        &self,
        params: &ChallengeParameters,
        website_url: &str,
        proxy: Option<&ProxyRecord>,
    ) -> ControllerResult<String>;

    async fn get_result(&self, task_id: &str) -> ControllerResult<SolverPoll>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<ApiSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSolution {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    g_recaptcha_response: Option<String>,
}

impl ApiResponse {
    fn error_message(&self) -> Option<String> {
        if self.error_id == 0 {
            return None;
        }
        Some(
            self.error_description
                .clone()
                .or_else(|| self.error_code.clone())
                .unwrap_or_else(|| format!("solver error {}", self.error_id)),
        )
    }
}

/// Client for the `createTask` / `getTaskResult` JSON API.
pub struct AntiCaptchaClient {
    client: reqwest::Client,
    api_url: String,
    client_key: String,
}

impl AntiCaptchaClient {
    pub fn new(
        api_url: impl Into<String>,
        client_key: impl Into<String>,
        timeout: Duration,
    ) -> ControllerResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_key: client_key.into(),
        })
    }

    pub fn from_config(config: &CaptchaSection) -> ControllerResult<Self> {
        let key = config
            .api_key
            .clone()
            .ok_or_else(|| ControllerError::Configuration("captcha.api_key is not set".into()))?;
        Self::new(
            config.api_url.clone(),
            key,
            Duration::from_secs(config.request_timeout_seconds),
        )
    }

    async fn post(&self, method: &str, body: Value) -> ControllerResult<ApiResponse> {
        let response = self
            .client
            .post(format!("{}/{method}", self.api_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

fn task_body(
    params: &ChallengeParameters,
    website_url: &str,
    proxy: Option<&ProxyRecord>,
) -> Value {
    let mut task = Map::new();
    let base = match params.kind {
        ChallengeKind::FunCaptcha => {
            task.insert("websitePublicKey".into(), json!(params.public_key));
            if let Some(subdomain) = &params.subdomain {
                task.insert("funcaptchaApiJSSubdomain".into(), json!(subdomain));
            }
            "FunCaptchaTask"
        }
        ChallengeKind::RecaptchaV2 => {
            task.insert("websiteKey".into(), json!(params.public_key));
            "RecaptchaV2Task"
        }
    };
    task.insert("websiteURL".into(), json!(website_url));
    let kind = match proxy {
        Some(record) => {
            task.insert("proxyType".into(), json!("http"));
            task.insert("proxyAddress".into(), json!(record.address));
            task.insert("proxyPort".into(), json!(record.port));
            if let Some(credentials) = &record.credentials {
                task.insert("proxyLogin".into(), json!(credentials.username));
                task.insert("proxyPassword".into(), json!(credentials.password));
            }
            base.to_string()
        }
        None => format!("{base}Proxyless"),
    };
    task.insert("type".into(), json!(kind));
    Value::Object(task)
}

#[async_trait]
impl CaptchaSolver for AntiCaptchaClient {
    async fn create_task(
        &self,
        params: &ChallengeParameters,
        website_url: &str,
        proxy: Option<&ProxyRecord>,
    ) -> ControllerResult<String> {
        let body = json!({
            "clientKey": self.client_key,
            "task": task_body(params, website_url, proxy),
        });
        let response = self.post("createTask", body).await?;
        if let Some(message) = response.error_message() {
            return Err(ControllerError::CaptchaUnsolved(message));
        }
        match response.task_id {
            Some(Value::String(id)) => Ok(id),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(ControllerError::CaptchaUnsolved(
                "solver accepted the task without an id".into(),
            )),
        }
    }

    async fn get_result(&self, task_id: &str) -> ControllerResult<SolverPoll> {
        let id = task_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(task_id));
        let response = self
            .post(
                "getTaskResult",
                json!({ "clientKey": self.client_key, "taskId": id }),
            )
            .await?;
        if let Some(message) = response.error_message() {
            return Ok(SolverPoll::Failed(message));
        }
        match response.status.as_deref() {
            Some("ready") => {
                let token = response
                    .solution
                    .and_then(|s| s.token.or(s.g_recaptcha_response))
                    .filter(|token| !token.is_empty());
                Ok(match token {
                    Some(token) => SolverPoll::Ready(token),
                    None => SolverPoll::Failed("ready without a token".into()),
                })
            }
            _ => Ok(SolverPoll::Processing),
        }
    }
}

/// Resolves interactive challenges through an external solver.
pub struct CaptchaBridge {
    solver: Arc<dyn CaptchaSolver>,
    clock: Arc<dyn Clock>,
    website_url: Option<String>,
    poll_interval: Duration,
    max_polls: u32,
    deadline: Duration,
}

impl CaptchaBridge {
    pub fn new(config: &CaptchaSection, solver: Arc<dyn CaptchaSolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            solver,
            clock,
            website_url: config.website_url.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            max_polls: config.max_polls.max(1),
            deadline: Duration::from_secs(config.deadline_seconds),
        }
    }

    pub async fn submit(
        &self,
        params: &ChallengeParameters,
        website_url: &str,
        proxy: Option<&ProxyRecord>,
    ) -> ControllerResult<CaptchaTask> {
        let id = self.solver.create_task(params, website_url, proxy).await?;
        let submitted_at = self.clock.now();
        info!(
            task_id = %id,
            kind = ?params.kind,
            proxy = proxy.map(|p| p.identity()).as_deref(),
            "captcha task submitted"
        );
        Ok(CaptchaTask {
            id,
            kind: params.kind,
            status: CaptchaStatus::Pending,
            solution: None,
            submitted_at,
            deadline: submitted_at + to_chrono(self.deadline),
        })
    }

    pub async fn poll_once(&self, task: &mut CaptchaTask) -> ControllerResult<CaptchaStatus> {
        match self.solver.get_result(&task.id).await? {
            SolverPoll::Processing => {}
            SolverPoll::Ready(token) => {
                task.status = CaptchaStatus::Ready;
                task.solution = Some(token);
            }
            SolverPoll::Failed(reason) => {
                warn!(task_id = %task.id, %reason, "captcha task failed");
                task.status = CaptchaStatus::Failed;
            }
        }
        Ok(task.status)
    }

    /// Fixed-interval polling bounded by `max_polls` and the task deadline.
    pub async fn poll(&self, task: &mut CaptchaTask) -> ControllerResult<String> {
        for attempt in 1..=self.max_polls {
            self.clock.sleep(self.poll_interval).await;
            if self.clock.now() > task.deadline {
                break;
            }
            let status = self.poll_once(task).await?;
            debug!(task_id = %task.id, attempt, ?status, "captcha poll");
            match status {
                CaptchaStatus::Pending => continue,
                CaptchaStatus::Ready => {
                    if let Some(token) = task.solution.clone() {
                        return Ok(token);
                    }
                    break;
                }
                CaptchaStatus::Failed => break,
            }
        }
        task.status = CaptchaStatus::Failed;
        Err(ControllerError::CaptchaUnsolved(format!(
            "task {} produced no solution",
            task.id
        )))
    }

    pub async fn apply(&self, token: &str, executor: &dyn ActionExecutor) -> ControllerResult<()> {
        executor.inject_captcha_solution(token).await
    }

    pub async fn solve(
        &self,
        page_content: &str,
        page_url: &str,
        proxy: Option<&ProxyRecord>,
        executor: &dyn ActionExecutor,
    ) -> ControllerResult<()> {
        let params = extract_challenge_parameters(page_content).ok_or_else(|| {
            ControllerError::CaptchaUnsolved("no recognizable challenge on the page".into())
        })?;
        let website_url = self.website_url.as_deref().unwrap_or(page_url);
        let mut task = self.submit(&params, website_url, proxy).await?;
        let token = self.poll(&mut task).await?;
        self.apply(&token, executor).await?;
        info!(task_id = %task.id, "captcha solution applied");
        Ok(())
    }
}
