pub mod config;
pub mod controller;
pub mod error;

pub use config::{
    load_controller_config, CaptchaSection, CategoryLimits, ControllerConfig, LimitsSection,
    ObservabilitySection, OrchestratorSection, PacingSection, ProxySection, RetrySection,
    ScheduleSection, SessionSection, CAPTCHA_KEY_ENV, PROXY_TOKEN_ENV,
};
pub use error::{ConfigError, Result};
