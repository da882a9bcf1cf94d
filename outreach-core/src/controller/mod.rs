mod captcha;
mod clock;
mod error;
mod error_handler;
mod executor;
mod metrics;
mod orchestrator;
mod proxy_pool;
mod rate_budget;
mod retry;
mod session_guard;
mod store;

pub use captcha::{
    extract_challenge_parameters, AntiCaptchaClient, CaptchaBridge, CaptchaSolver, CaptchaStatus,
    CaptchaTask, ChallengeKind, ChallengeParameters, SolverPoll,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ControllerError, ControllerResult};
pub use error_handler::{
    AutomationTelemetry, ErrorCategorizer, ErrorClassification, FailureContext, RemediationAction,
    RunContext, TelemetryError,
};
pub use executor::{
    ActionExecutor, ActionOutcome, CommandOutput, CommandRunner, PendingAction,
    ScriptActionExecutor, SystemCommandRunner,
};
pub use metrics::ControllerMetrics;
pub use orchestrator::{
    proxy_sources, Collaborators, Orchestrator, PreviewDecision, PreviewEntry, ProcessedRecord,
    ProcessedStatus, RunReport, StopReason,
};
pub use proxy_pool::{
    HttpProbe, LocalProxyList, ProxyCredentials, ProxyHealthReport, ProxyPool, ProxyProbe,
    ProxyRecord, ProxySource, RemoteProxySource,
};
pub use rate_budget::{
    multiplier_for, ActionBudget, Admission, BudgetState, DenyReason, RateBudget,
};
pub use retry::{RetryClassifier, RetryFailure, RetryOutcome};
pub use session_guard::{Cookie, PageSignal, Session, SessionGuard, SessionInvalid};
pub use store::{
    load_typed, save_typed, JsonFileStore, MemoryStore, PersistenceStore, BUDGET_KEY,
    PENDING_KEY, PROCESSED_KEY, PROXY_BLACKLIST_KEY, SESSION_KEY,
};
