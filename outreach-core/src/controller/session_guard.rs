use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SessionSection;

use super::clock::{to_chrono, Clock};
use super::error::{ControllerError, ControllerResult};
use super::error_handler::ErrorClassification;
use super::store::{load_typed, save_typed, PersistenceStore, SESSION_KEY};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            expires: None,
            secure: true,
            http_only: true,
        }
    }

    pub fn expiring(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(at) if at <= now)
    }

    /// `true` when a cookie for this domain would be sent to `target`.
    pub fn matches_domain(&self, target: &str) -> bool {
        let domain = normalize_domain(&self.domain);
        let target = normalize_domain(target);
        if domain.is_empty() {
            return false;
        }
        domain == target
            || target.ends_with(&format!(".{domain}"))
            || domain.ends_with(&format!(".{target}"))
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("domain", &self.domain)
            .field("expires", &self.expires)
            .finish()
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Detection indicators reported by the action executor after inspecting
/// the page (verification prompts, security notices and the like).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSignal {
    #[serde(default)]
    pub indicators: Vec<String>,
}

impl PageSignal {
    pub fn clear() -> Self {
        Self::default()
    }

    pub fn with<I, S>(indicators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            indicators: indicators.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fired(&self) -> bool {
        !self.indicators.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub cookies: BTreeMap<String, Cookie>,
    pub essential_cookie_names: BTreeSet<String>,
    pub established_at: Option<DateTime<Utc>>,
    pub detection_score: f64,
    pub last_rotation_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SessionInvalid {
    MissingCookie { name: String },
    ExpiredCookie { name: String },
    ForeignDomain { name: String, domain: String },
    NotEstablished,
    TtlExceeded { age_secs: i64 },
    DetectionPressure { score: f64 },
}

impl fmt::Display for SessionInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionInvalid::MissingCookie { name } => write!(f, "essential cookie {name} missing"),
            SessionInvalid::ExpiredCookie { name } => write!(f, "essential cookie {name} expired"),
            SessionInvalid::ForeignDomain { name, domain } => {
                write!(f, "essential cookie {name} scoped to foreign domain {domain}")
            }
            SessionInvalid::NotEstablished => write!(f, "session not established"),
            SessionInvalid::TtlExceeded { age_secs } => {
                write!(f, "session age {age_secs}s exceeds ttl")
            }
            SessionInvalid::DetectionPressure { score } => {
                write!(f, "detection score {score:.2} over threshold")
            }
        }
    }
}

/// Persisted form of the session: one record under the `session` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SessionRecord {
    established_at: Option<DateTime<Utc>>,
    cookies: Vec<Cookie>,
}

pub struct SessionGuard {
    config: SessionSection,
    session: Session,
    next_rotation_jitter: Duration,
    clock: Arc<dyn Clock>,
    rng: ChaCha8Rng,
}

impl SessionGuard {
    pub fn new(config: SessionSection, clock: Arc<dyn Clock>) -> Self {
        Self::with_rng(config, clock, ChaCha8Rng::from_entropy())
    }

    pub fn with_seed(config: SessionSection, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::with_rng(config, clock, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(config: SessionSection, clock: Arc<dyn Clock>, mut rng: ChaCha8Rng) -> Self {
        let essential_cookie_names = config.essential_cookies.iter().cloned().collect();
        let next_rotation_jitter = draw_jitter(&mut rng, config.rotation_jitter_minutes);
        Self {
            session: Session {
                cookies: BTreeMap::new(),
                essential_cookie_names,
                established_at: None,
                detection_score: 0.0,
                last_rotation_at: None,
            },
            config,
            next_rotation_jitter,
            clock,
            rng,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn detection_score(&self) -> f64 {
        self.session.detection_score
    }

    fn essential_live<'a>(&self, cookies: &'a [Cookie], now: DateTime<Utc>) -> Vec<&'a Cookie> {
        cookies
            .iter()
            .filter(|cookie| self.session.essential_cookie_names.contains(&cookie.name))
            .filter(|cookie| !cookie.is_expired(now))
            .filter(|cookie| cookie.matches_domain(&self.config.target_domain))
            .collect()
    }

    /// Rebuild the session from the store, dropping expired cookies.
    pub async fn load_persisted(
        &mut self,
        store: &dyn PersistenceStore,
    ) -> ControllerResult<Option<Session>> {
        let now = self.clock.now();
        let records: Vec<SessionRecord> = load_typed(store, SESSION_KEY).await?;
        let Some(record) = records.into_iter().last() else {
            return Ok(None);
        };
        let cookies: BTreeMap<String, Cookie> = record
            .cookies
            .into_iter()
            .filter(|cookie| !cookie.is_expired(now))
            .map(|cookie| (cookie.name.clone(), cookie))
            .collect();
        if cookies.is_empty() {
            info!("persisted session only held expired cookies");
            return Ok(None);
        }
        self.session.cookies = cookies;
        self.session.established_at = record.established_at.or(Some(now));
        debug!(cookies = self.session.cookies.len(), "session restored from store");
        Ok(Some(self.session.clone()))
    }

    /// Replace the tracked cookies with the executor's live jar and start the
    /// TTL clock if this is the first time the session looks authenticated.
    fn absorb(&mut self, live: &[Cookie]) {
        self.session.cookies = live
            .iter()
            .map(|cookie| (cookie.name.clone(), cookie.clone()))
            .collect();
        if self.session.established_at.is_none()
            && self
                .session
                .essential_cookie_names
                .iter()
                .all(|name| self.session.cookies.contains_key(name))
        {
            self.session.established_at = Some(self.clock.now());
        }
    }

    /// Mark a fresh login: the TTL restarts now.
    pub fn establish(&mut self, live: &[Cookie]) {
        self.session.established_at = None;
        self.absorb(live);
        info!(cookies = live.len(), "session established");
    }

    pub fn check(&self) -> Result<(), SessionInvalid> {
        let now = self.clock.now();
        for name in &self.session.essential_cookie_names {
            let Some(cookie) = self.session.cookies.get(name) else {
                return Err(SessionInvalid::MissingCookie { name: name.clone() });
            };
            if cookie.is_expired(now) {
                return Err(SessionInvalid::ExpiredCookie { name: name.clone() });
            }
            if !cookie.matches_domain(&self.config.target_domain) {
                return Err(SessionInvalid::ForeignDomain {
                    name: name.clone(),
                    domain: cookie.domain.clone(),
                });
            }
        }
        let Some(established_at) = self.session.established_at else {
            return Err(SessionInvalid::NotEstablished);
        };
        let age = now - established_at;
        if age >= to_chrono(self.config.ttl()) {
            return Err(SessionInvalid::TtlExceeded {
                age_secs: age.num_seconds(),
            });
        }
        if self.session.detection_score >= self.config.detection_threshold {
            return Err(SessionInvalid::DetectionPressure {
                score: self.session.detection_score,
            });
        }
        Ok(())
    }

    pub fn is_valid(&mut self, live: &[Cookie], signal: &PageSignal) -> bool {
        if signal.fired() {
            self.register_detection(&signal.indicators);
        }
        self.absorb(live);
        match self.check() {
            Ok(()) => true,
            Err(reason) => {
                info!(%reason, "session invalid");
                false
            }
        }
    }

    /// Save the essential, unexpired, target-scoped cookies. Losing all of
    /// them means authentication is gone.
    pub async fn persist(
        &self,
        live: &[Cookie],
        store: &dyn PersistenceStore,
    ) -> ControllerResult<usize> {
        let now = self.clock.now();
        let mut kept: BTreeMap<String, Cookie> = BTreeMap::new();
        for cookie in self.essential_live(live, now) {
            kept.insert(cookie.name.clone(), cookie.clone());
        }
        if kept.is_empty() {
            return Err(ControllerError::AuthenticationLost(format!(
                "none of {:?} survived filtering for {}",
                self.session.essential_cookie_names, self.config.target_domain
            )));
        }
        let record = SessionRecord {
            established_at: self.session.established_at.or(Some(now)),
            cookies: kept.into_values().collect(),
        };
        let count = record.cookies.len();
        save_typed(store, SESSION_KEY, &[record]).await?;
        debug!(cookies = count, "session persisted");
        Ok(count)
    }

    pub fn register_detection(&mut self, indicators: &[String]) {
        self.session.detection_score += self.config.detection_increment;
        warn!(
            ?indicators,
            score = self.session.detection_score,
            "detection indicator observed"
        );
    }

    /// Detection feedback from the retry classifier.
    pub fn record_classification(&mut self, classification: ErrorClassification) {
        if classification == ErrorClassification::RateLimited {
            self.register_detection(&["rate_limited".to_string()]);
        }
    }

    pub fn decay_detection(&mut self) {
        let decayed = (self.session.detection_score - self.config.detection_decay).max(0.0);
        self.session.detection_score = decayed;
    }

    pub fn should_rotate_identity(&self) -> bool {
        if self.session.detection_score > self.config.urgency_threshold {
            return true;
        }
        match self.session.last_rotation_at {
            None => true,
            Some(at) => {
                let interval = Duration::from_secs(self.config.rotation_interval_minutes * 60)
                    + self.next_rotation_jitter;
                self.clock.now() - at >= to_chrono(interval)
            }
        }
    }

    pub fn mark_rotated(&mut self) {
        self.session.last_rotation_at = Some(self.clock.now());
        self.next_rotation_jitter = draw_jitter(&mut self.rng, self.config.rotation_jitter_minutes);
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session", &self.session)
            .field("next_rotation_jitter", &self.next_rotation_jitter)
            .finish()
    }
}

fn draw_jitter(rng: &mut ChaCha8Rng, jitter_minutes: u64) -> Duration {
    if jitter_minutes == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rng.gen_range(0..=jitter_minutes * 60))
}
