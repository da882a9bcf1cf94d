use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of wall-clock time and the single place the controller suspends.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly and
/// keeps a log of every requested suspension.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = instant;
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut guard) = self.sleeps.lock() {
            guard.push(duration);
        }
        self.advance(duration);
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
