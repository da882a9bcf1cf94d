use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{LimitsSection, PacingSection, ScheduleSection};

use super::clock::{to_chrono, Clock};

/// Number of uniform draws averaged per pacing delay.
const DELAY_SAMPLES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionBudget {
    pub category: String,
    pub daily_count: u32,
    pub weekly_count: u32,
    pub daily_limit: u32,
    pub weekly_limit: u32,
    pub day_anchor: NaiveDate,
    pub week_anchor: NaiveDate,
    pub consecutive_detections: u32,
    pub backoff_multiplier: f64,
    pub last_detection_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl ActionBudget {
    pub fn new(
        category: impl Into<String>,
        daily_limit: u32,
        weekly_limit: u32,
        today: NaiveDate,
    ) -> Self {
        Self {
            category: category.into(),
            daily_count: 0,
            weekly_count: 0,
            daily_limit,
            weekly_limit,
            day_anchor: today,
            week_anchor: week_start(today),
            consecutive_detections: 0,
            backoff_multiplier: 1.0,
            last_detection_at: None,
            cooldown_until: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Denied(DenyReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    DailyQuotaExhausted { count: u32, limit: u32 },
    WeeklyQuotaExhausted { count: u32, limit: u32 },
    OutsideOperatingHours { hour: u32, window: [u32; 2] },
    CoolingDown { remaining: Duration },
}

impl DenyReason {
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            DenyReason::DailyQuotaExhausted { .. } | DenyReason::WeeklyQuotaExhausted { .. }
        )
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::DailyQuotaExhausted { count, limit } => {
                write!(f, "daily quota exhausted ({count}/{limit})")
            }
            DenyReason::WeeklyQuotaExhausted { count, limit } => {
                write!(f, "weekly quota exhausted ({count}/{limit})")
            }
            DenyReason::OutsideOperatingHours { hour, window } => write!(
                f,
                "hour {hour} outside operating window {}-{}",
                window[0], window[1]
            ),
            DenyReason::CoolingDown { remaining } => {
                write!(f, "cooling down for another {}s", remaining.as_secs())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BudgetState {
    Normal,
    Backoff { detections: u32 },
    Cooldown { until: DateTime<Utc> },
}

/// Quota, pacing and cool-down bookkeeping for every action category.
#[derive(Clone)]
pub struct RateBudget {
    limits: LimitsSection,
    schedule: ScheduleSection,
    pacing: PacingSection,
    offset: FixedOffset,
    budgets: HashMap<String, ActionBudget>,
    clock: Arc<dyn Clock>,
    rng: ChaCha8Rng,
}

impl RateBudget {
    pub fn new(
        limits: LimitsSection,
        schedule: ScheduleSection,
        pacing: PacingSection,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let offset = FixedOffset::east_opt(schedule.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let rng = match pacing.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            limits,
            schedule,
            pacing,
            offset,
            budgets: HashMap::new(),
            clock,
            rng,
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.offset).date_naive()
    }

    fn fresh_budget(&self, category: &str, today: NaiveDate) -> ActionBudget {
        let (daily, weekly) = self.limits.limits_for(category);
        ActionBudget::new(category, daily, weekly, today)
    }

    fn budget_mut(&mut self, category: &str) -> &mut ActionBudget {
        let fresh = self.fresh_budget(category, self.today());
        self.budgets.entry(category.to_string()).or_insert(fresh)
    }

    pub fn budget(&self, category: &str) -> ActionBudget {
        self.budgets
            .get(category)
            .cloned()
            .unwrap_or_else(|| self.fresh_budget(category, self.today()))
    }

    /// Decide whether `category` may act right now. Never mutates state.
    pub fn try_admit(&self, category: &str) -> Admission {
        let now = self.clock.now();
        let local = now.with_timezone(&self.offset);
        let today = local.date_naive();

        if let Some(until) = self.active_cooldown(now) {
            let remaining = (until - now).to_std().unwrap_or_default();
            return Admission::Denied(DenyReason::CoolingDown { remaining });
        }

        let hour = local.hour();
        if !within_operating_hours(hour, self.schedule.operating_hours) {
            return Admission::Denied(DenyReason::OutsideOperatingHours {
                hour,
                window: self.schedule.operating_hours,
            });
        }

        let budget = self.budget(category);
        // Counts left over from an earlier window are not binding even if the
        // reset has not run yet.
        let daily_count = if budget.day_anchor < today {
            0
        } else {
            budget.daily_count
        };
        let weekly_count = if budget.week_anchor < week_start(today) {
            0
        } else {
            budget.weekly_count
        };
        if daily_count >= budget.daily_limit {
            return Admission::Denied(DenyReason::DailyQuotaExhausted {
                count: daily_count,
                limit: budget.daily_limit,
            });
        }
        if weekly_count >= budget.weekly_limit {
            return Admission::Denied(DenyReason::WeeklyQuotaExhausted {
                count: weekly_count,
                limit: budget.weekly_limit,
            });
        }
        Admission::Admitted
    }

    /// Detection pressure is account-wide: a cool-down scheduled for one
    /// category blocks all of them.
    fn active_cooldown(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.budgets
            .values()
            .filter_map(|budget| budget.cooldown_until)
            .filter(|until| *until > now)
            .max()
    }

    pub fn current_multiplier(&self) -> f64 {
        self.budgets
            .values()
            .map(|budget| budget.backoff_multiplier)
            .fold(1.0, f64::max)
    }

    pub fn compute_delay(&mut self) -> Duration {
        let lower = self.pacing.min_delay_seconds.max(0.0);
        let upper = self.pacing.max_delay_seconds.max(lower);
        let sample = if upper > lower {
            let total: f64 = (0..DELAY_SAMPLES)
                .map(|_| self.rng.gen_range(lower..=upper))
                .sum();
            total / f64::from(DELAY_SAMPLES)
        } else {
            lower
        };
        let multiplier = self.current_multiplier();
        let ceiling = self.pacing.delay_ceiling_seconds.max(0.0);
        let seconds = (sample * multiplier).clamp(0.0, ceiling);
        debug!(base = sample, multiplier, seconds, "computed pacing delay");
        Duration::from_secs_f64(seconds)
    }

    pub fn record_success(&mut self, category: &str) {
        let budget = self.budget_mut(category);
        budget.daily_count = budget.daily_count.saturating_add(1);
        budget.weekly_count = budget.weekly_count.saturating_add(1);
        debug!(
            category,
            daily = budget.daily_count,
            weekly = budget.weekly_count,
            "action counted against budget"
        );
    }

    /// Escalate after the remote side flagged us. Returns the scheduled cool-down.
    pub fn on_detection_signal(&mut self, category: &str) -> Duration {
        let now = self.clock.now();
        let cap = self.pacing.backoff_cap;
        let base = self.pacing.base_cooldown();
        let budget = self.budget_mut(category);
        budget.consecutive_detections = budget.consecutive_detections.saturating_add(1);
        budget.backoff_multiplier = multiplier_for(budget.consecutive_detections, cap);
        let cooldown = base.mul_f64(budget.backoff_multiplier);
        budget.cooldown_until = Some(now + to_chrono(cooldown));
        budget.last_detection_at = Some(now);
        warn!(
            category,
            detections = budget.consecutive_detections,
            multiplier = budget.backoff_multiplier,
            cooldown_secs = cooldown.as_secs(),
            "detection signal, escalating backoff"
        );
        cooldown
    }

    pub fn reset_if_window_elapsed(&mut self) {
        let now = self.clock.now();
        let today = now.with_timezone(&self.offset).date_naive();
        let this_week = week_start(today);
        let cap = self.pacing.backoff_cap;
        let window = to_chrono(self.pacing.detection_free_window());

        for budget in self.budgets.values_mut() {
            if today > budget.day_anchor {
                info!(category = %budget.category, previous = budget.daily_count, "daily budget reset");
                budget.daily_count = 0;
                budget.day_anchor = today;
            }
            if this_week > budget.week_anchor {
                info!(category = %budget.category, previous = budget.weekly_count, "weekly budget reset");
                budget.weekly_count = 0;
                budget.week_anchor = this_week;
                budget.consecutive_detections /= 2;
                budget.backoff_multiplier = multiplier_for(budget.consecutive_detections, cap);
            }
            if budget.consecutive_detections > 0 {
                if let Some(last) = budget.last_detection_at {
                    if now - last >= window {
                        budget.consecutive_detections -= 1;
                        budget.backoff_multiplier =
                            multiplier_for(budget.consecutive_detections, cap);
                        budget.last_detection_at = Some(now);
                        debug!(
                            category = %budget.category,
                            detections = budget.consecutive_detections,
                            multiplier = budget.backoff_multiplier,
                            "detection-free window elapsed, backoff decayed"
                        );
                    }
                }
            }
            if matches!(budget.cooldown_until, Some(until) if until <= now) {
                budget.cooldown_until = None;
            }
        }
    }

    pub fn state(&self, category: &str) -> BudgetState {
        let now = self.clock.now();
        if let Some(until) = self.active_cooldown(now) {
            return BudgetState::Cooldown { until };
        }
        match self.budgets.get(category) {
            Some(budget) if budget.consecutive_detections > 0 => BudgetState::Backoff {
                detections: budget.consecutive_detections,
            },
            _ => BudgetState::Normal,
        }
    }

    pub fn snapshot(&self) -> Vec<ActionBudget> {
        let mut budgets: Vec<_> = self.budgets.values().cloned().collect();
        budgets.sort_by(|a, b| a.category.cmp(&b.category));
        budgets
    }

    /// Load persisted budgets. Limits always follow the current configuration.
    pub fn restore(&mut self, budgets: Vec<ActionBudget>) {
        for mut budget in budgets {
            let (daily, weekly) = self.limits.limits_for(&budget.category);
            budget.daily_limit = daily;
            budget.weekly_limit = weekly;
            self.budgets.insert(budget.category.clone(), budget);
        }
    }
}

impl fmt::Debug for RateBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateBudget")
            .field("offset", &self.offset)
            .field("operating_hours", &self.schedule.operating_hours)
            .field("budgets", &self.budgets)
            .finish()
    }
}

pub fn multiplier_for(detections: u32, cap: f64) -> f64 {
    if detections == 0 {
        return 1.0;
    }
    let exponent = (detections - 1).min(62) as i32;
    2f64.powi(exponent).min(cap).max(1.0)
}

fn within_operating_hours(hour: u32, window: [u32; 2]) -> bool {
    let [start, end] = window;
    if start == end {
        true
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::clock::ManualClock;
    use chrono::TimeZone;

    fn monday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn budget_with(daily: u32, clock: Arc<ManualClock>) -> RateBudget {
        RateBudget::new(
            LimitsSection {
                daily_limit: daily,
                weekly_limit: 100,
                ..LimitsSection::default()
            },
            ScheduleSection {
                operating_hours: [9, 18],
                utc_offset_minutes: 0,
            },
            PacingSection {
                min_delay_seconds: 10.0,
                max_delay_seconds: 20.0,
                delay_ceiling_seconds: 100.0,
                backoff_cap: 8.0,
                base_cooldown_minutes: 60,
                detection_free_window_hours: 24,
                rng_seed: Some(7),
            },
            clock,
        )
    }

    #[test]
    fn sixteenth_admission_is_denied_by_daily_quota() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, clock);
        for _ in 0..15 {
            budget.reset_if_window_elapsed();
            assert_eq!(budget.try_admit("connect"), Admission::Admitted);
            budget.record_success("connect");
        }
        budget.reset_if_window_elapsed();
        assert_eq!(
            budget.try_admit("connect"),
            Admission::Denied(DenyReason::DailyQuotaExhausted {
                count: 15,
                limit: 15
            })
        );
        assert!(budget.try_admit("message").is_admitted());
    }

    #[test]
    fn multiplier_follows_power_of_two_up_to_cap() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, clock);
        let mut observed = Vec::new();
        for _ in 0..10 {
            budget.on_detection_signal("connect");
            observed.push(budget.budget("connect").backoff_multiplier);
        }
        assert_eq!(observed[0], 1.0);
        assert_eq!(observed[1], 2.0);
        assert_eq!(observed[2], 4.0);
        assert_eq!(observed[3], 8.0);
        assert_eq!(observed[9], 8.0);
        assert_eq!(multiplier_for(0, 8.0), 1.0);
    }

    #[test]
    fn detections_force_cooldown_until_it_elapses() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, Arc::clone(&clock));
        for _ in 0..3 {
            budget.on_detection_signal("connect");
        }
        // Third detection: multiplier 4, so a four hour cool-down.
        match budget.try_admit("connect") {
            Admission::Denied(DenyReason::CoolingDown { remaining }) => {
                assert_eq!(remaining, Duration::from_secs(4 * 3600));
            }
            other => panic!("expected cool-down denial, got {other:?}"),
        }
        assert!(!budget.try_admit("message").is_admitted());
        assert!(matches!(budget.state("connect"), BudgetState::Cooldown { .. }));

        clock.advance(Duration::from_secs(4 * 3600 - 1));
        assert!(!budget.try_admit("connect").is_admitted());
        clock.advance(Duration::from_secs(1));
        // 14:00, still inside operating hours.
        assert_eq!(budget.try_admit("connect"), Admission::Admitted);
        assert_eq!(budget.state("connect"), BudgetState::Backoff { detections: 3 });
    }

    #[test]
    fn denial_has_no_side_effects() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(1, clock);
        budget.record_success("connect");
        let before = budget.snapshot();
        for _ in 0..5 {
            assert!(!budget.try_admit("connect").is_admitted());
        }
        assert_eq!(budget.snapshot(), before);
    }

    #[test]
    fn daily_count_resets_once_per_calendar_day() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, Arc::clone(&clock));
        budget.record_success("connect");
        budget.record_success("connect");

        clock.advance(Duration::from_secs(24 * 3600));
        budget.reset_if_window_elapsed();
        assert_eq!(budget.budget("connect").daily_count, 0);
        assert_eq!(budget.budget("connect").weekly_count, 2);

        budget.record_success("connect");
        clock.advance(Duration::from_secs(3600));
        budget.reset_if_window_elapsed();
        budget.reset_if_window_elapsed();
        assert_eq!(budget.budget("connect").daily_count, 1);
    }

    #[test]
    fn weekly_reset_halves_consecutive_detections() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, Arc::clone(&clock));
        budget.record_success("connect");
        for _ in 0..4 {
            budget.on_detection_signal("connect");
        }
        // Next Monday: the detection-free window has also elapsed once.
        clock.advance(Duration::from_secs(7 * 24 * 3600));
        budget.reset_if_window_elapsed();
        let snapshot = budget.budget("connect");
        assert_eq!(snapshot.weekly_count, 0);
        assert_eq!(snapshot.consecutive_detections, 1);
        assert_eq!(snapshot.backoff_multiplier, 1.0);
        assert_eq!(snapshot.cooldown_until, None);
    }

    #[test]
    fn multiplier_decays_only_after_detection_free_window() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, Arc::clone(&clock));
        budget.on_detection_signal("connect");
        budget.on_detection_signal("connect");
        assert_eq!(budget.current_multiplier(), 2.0);

        clock.advance(Duration::from_secs(23 * 3600));
        budget.reset_if_window_elapsed();
        assert_eq!(budget.current_multiplier(), 2.0);

        clock.advance(Duration::from_secs(3600));
        budget.reset_if_window_elapsed();
        assert_eq!(budget.current_multiplier(), 1.0);
        assert_eq!(budget.budget("connect").consecutive_detections, 1);
    }

    #[test]
    fn outside_operating_hours_is_denied() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 4, 20, 30, 0).unwrap(),
        ));
        let budget = budget_with(15, clock);
        assert_eq!(
            budget.try_admit("connect"),
            Admission::Denied(DenyReason::OutsideOperatingHours {
                hour: 20,
                window: [9, 18]
            })
        );
        assert!(within_operating_hours(23, [22, 6]));
        assert!(within_operating_hours(3, [22, 6]));
        assert!(!within_operating_hours(12, [22, 6]));
        assert!(within_operating_hours(12, [0, 0]));
    }

    #[test]
    fn delay_stays_within_bounds_and_scales_with_backoff() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, clock);
        for _ in 0..200 {
            let delay = budget.compute_delay().as_secs_f64();
            assert!((10.0..=20.0).contains(&delay), "delay {delay} out of range");
        }
        for _ in 0..4 {
            budget.on_detection_signal("connect");
        }
        for _ in 0..200 {
            let delay = budget.compute_delay().as_secs_f64();
            assert!((80.0..=100.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn seeded_delays_are_reproducible() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut first = budget_with(15, Arc::clone(&clock));
        let mut second = budget_with(15, clock);
        let a: Vec<_> = (0..5).map(|_| first.compute_delay()).collect();
        let b: Vec<_> = (0..5).map(|_| second.compute_delay()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn restore_applies_current_limits() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let mut budget = budget_with(15, clock);
        let mut persisted = ActionBudget::new("connect", 100, 500, monday_morning().date_naive());
        persisted.daily_count = 15;
        budget.restore(vec![persisted]);
        let restored = budget.budget("connect");
        assert_eq!(restored.daily_limit, 15);
        assert_eq!(restored.weekly_limit, 100);
        assert!(!budget.try_admit("connect").is_admitted());
    }
}
