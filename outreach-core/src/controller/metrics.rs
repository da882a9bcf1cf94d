use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerMetrics {
    pub actions_attempted: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    pub actions_skipped: u64,
    pub retries: u64,
    pub detections: u64,
    pub proxy_rotations: u64,
    pub proxies_blacklisted: u64,
    pub captcha_attempts: u64,
    pub captcha_solved: u64,
    pub reauthentications: u64,
    pub paced_ms: u64,
}

impl ControllerMetrics {
    pub fn record_attempt(&mut self) {
        self.actions_attempted = self.actions_attempted.saturating_add(1);
    }

    pub fn record_success(&mut self, attempts: usize) {
        self.actions_succeeded = self.actions_succeeded.saturating_add(1);
        self.record_retries(attempts);
    }

    pub fn record_failure(&mut self, attempts: usize) {
        self.actions_failed = self.actions_failed.saturating_add(1);
        self.record_retries(attempts);
    }

    fn record_retries(&mut self, attempts: usize) {
        let retries = attempts.saturating_sub(1) as u64;
        self.retries = self.retries.saturating_add(retries);
    }

    pub fn record_skip(&mut self) {
        self.actions_skipped = self.actions_skipped.saturating_add(1);
    }

    pub fn record_detection(&mut self) {
        self.detections = self.detections.saturating_add(1);
    }

    pub fn record_proxy_rotation(&mut self) {
        self.proxy_rotations = self.proxy_rotations.saturating_add(1);
    }

    pub fn record_blacklisted(&mut self) {
        self.proxies_blacklisted = self.proxies_blacklisted.saturating_add(1);
    }

    pub fn record_captcha(&mut self, solved: bool) {
        self.captcha_attempts = self.captcha_attempts.saturating_add(1);
        if solved {
            self.captcha_solved = self.captcha_solved.saturating_add(1);
        }
    }

    pub fn record_reauthentication(&mut self) {
        self.reauthentications = self.reauthentications.saturating_add(1);
    }

    pub fn record_pacing(&mut self, millis: u64) {
        self.paced_ms = self.paced_ms.saturating_add(millis);
    }

    /// Percentage of attempted actions that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.actions_attempted == 0 {
            0.0
        } else {
            (self.actions_succeeded as f64 / self.actions_attempted as f64) * 100.0
        }
    }
}
