use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::OrchestratorSection;

use super::error::{ControllerError, ControllerResult};
use super::proxy_pool::ProxyRecord;
use super::session_guard::{Cookie, PageSignal};

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: String,
    pub category: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl PendingAction {
    pub fn new(
        id: impl Into<String>,
        category: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            target: target.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub signal: PageSignal,
}

/// Drives the automation target. Failures are reported as errors whose
/// message carries the raw signal so the retry classifier can judge them.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn perform_action(&self, action: &PendingAction) -> ControllerResult<ActionOutcome>;

    async fn inspect_page(&self) -> ControllerResult<PageSignal>;

    async fn page_content(&self) -> ControllerResult<String>;

    async fn get_cookies(&self) -> ControllerResult<Vec<Cookie>>;

    async fn set_cookies(&self, cookies: &[Cookie]) -> ControllerResult<()>;

    async fn reauthenticate(&self) -> ControllerResult<()>;

    async fn use_identity(&self, proxy: Option<&ProxyRecord>) -> ControllerResult<()>;

    async fn inject_captcha_solution(&self, token: &str) -> ControllerResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String], input: &[u8])
        -> std::io::Result<CommandOutput>;
}

pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        input: &[u8],
    ) -> std::io::Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ScriptReply {
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Bridges to an external automation program. Every call spawns
/// `program [args..] <verb>`, writes a JSON request to stdin and expects
/// `{"ok": bool, "data": .., "error": ".."}` on stdout.
pub struct ScriptActionExecutor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl ScriptActionExecutor {
    pub fn new(config: &OrchestratorSection) -> ControllerResult<Self> {
        if config.executor_program.trim().is_empty() {
            return Err(ControllerError::Configuration(
                "orchestrator.executor_program is not set".into(),
            ));
        }
        Ok(Self {
            program: PathBuf::from(&config.executor_program),
            args: config.executor_args.clone(),
            timeout: Duration::from_secs(config.executor_timeout_seconds.max(1)),
            runner: Arc::new(SystemCommandRunner),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    async fn call<T: DeserializeOwned>(&self, verb: &str, request: Value) -> ControllerResult<T> {
        let mut args = self.args.clone();
        args.push(verb.to_string());
        let input = serde_json::to_vec(&request)?;
        debug!(program = %self.program.display(), verb, "invoking executor");

        let output =
            tokio::time::timeout(self.timeout, self.runner.run(&self.program, &args, &input))
                .await??;

        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Err(ControllerError::Executor(format!(
                "{verb} exited with {:?} without a reply: {}",
                output.code,
                output.stderr.trim()
            )));
        }
        let reply: ScriptReply = serde_json::from_str(stdout).map_err(|err| {
            ControllerError::Executor(format!("{verb} produced a malformed reply: {err}"))
        })?;
        if !reply.ok {
            let message = reply
                .error
                .unwrap_or_else(|| format!("{verb} reported failure"));
            return Err(ControllerError::Action(message));
        }
        serde_json::from_value(reply.data).map_err(|err| {
            ControllerError::Executor(format!("{verb} returned unexpected data: {err}"))
        })
    }
}

#[async_trait]
impl ActionExecutor for ScriptActionExecutor {
    async fn perform_action(&self, action: &PendingAction) -> ControllerResult<ActionOutcome> {
        self.call("perform", serde_json::to_value(action)?).await
    }

    async fn inspect_page(&self) -> ControllerResult<PageSignal> {
        self.call("inspect", Value::Null).await
    }

    async fn page_content(&self) -> ControllerResult<String> {
        self.call("content", Value::Null).await
    }

    async fn get_cookies(&self) -> ControllerResult<Vec<Cookie>> {
        self.call("get-cookies", Value::Null).await
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> ControllerResult<()> {
        self.call("set-cookies", json!({ "cookies": cookies })).await
    }

    async fn reauthenticate(&self) -> ControllerResult<()> {
        self.call("reauthenticate", Value::Null).await
    }

    async fn use_identity(&self, proxy: Option<&ProxyRecord>) -> ControllerResult<()> {
        let request = match proxy {
            Some(record) => json!({ "identity": record.identity(), "proxy": record.uri()? }),
            None => json!({ "identity": null, "proxy": null }),
        };
        self.call("use-identity", request).await
    }

    async fn inject_captcha_solution(&self, token: &str) -> ControllerResult<()> {
        self.call("inject-captcha", json!({ "token": token })).await
    }
}
