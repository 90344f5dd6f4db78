//! Caller behavior profiling.
//!
//! Every caller accumulates an exponential-moving-average profile of its
//! normal traffic: request rate, payload volume, endpoint set, active
//! hours, and request spacing. Requests are scored against the profile and
//! sufficiently anomalous callers get throttled even while the system as a
//! whole is healthy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use relay_config::BehaviorTuning;
use relay_core::{CallerId, RouteId};
use relay_resilience::Clock;

use crate::decision::{AssessmentSource, LevelAssessment, ThrottleLevel};

/// Profile rates are folded per minute of activity.
const PROFILE_WINDOW: Duration = Duration::from_secs(60);

/// Endpoint sets are capped; callers touching more routes than this keep
/// scoring novel on the overflow.
const MAX_TRACKED_ENDPOINTS: usize = 256;

#[derive(Debug)]
struct CallerProfile {
    observations: u64,
    windows_folded: u64,
    window_start: Instant,
    window_count: u64,
    window_bytes: u64,
    /// Requests per active minute.
    rate_ema: f64,
    /// Payload bytes per active minute.
    volume_ema: f64,
    /// Fraction of requests hitting a route the caller had never used.
    novelty_ema: f64,
    /// Fraction of requests arriving under a second after the previous one.
    subsecond_ema: f64,
    endpoints: HashSet<String>,
    hour_counts: [u64; 24],
    last_request: Option<Instant>,
}

impl CallerProfile {
    fn new(now: Instant) -> Self {
        Self {
            observations: 0,
            windows_folded: 0,
            window_start: now,
            window_count: 0,
            window_bytes: 0,
            rate_ema: 0.0,
            volume_ema: 0.0,
            novelty_ema: 0.0,
            subsecond_ema: 0.0,
            endpoints: HashSet::new(),
            hour_counts: [0; 24],
            last_request: None,
        }
    }

    /// Folds the active minute into the EMAs once it completes. Idle
    /// minutes are skipped rather than folded as zeros, so the profile
    /// describes the caller's behavior while active.
    fn roll(&mut self, now: Instant, alpha: f64) {
        if now.saturating_duration_since(self.window_start) < PROFILE_WINDOW {
            return;
        }
        if self.window_count > 0 {
            self.rate_ema = ema(self.rate_ema, self.window_count as f64, alpha, self.windows_folded);
            self.volume_ema = ema(self.volume_ema, self.window_bytes as f64, alpha, self.windows_folded);
            self.windows_folded += 1;
        }
        self.window_count = 0;
        self.window_bytes = 0;
        self.window_start = now;
    }
}

/// Seeds the EMA with the first sample instead of decaying up from zero.
fn ema(current: f64, sample: f64, alpha: f64, folded: u64) -> f64 {
    if folded == 0 {
        sample
    } else {
        current + alpha * (sample - current)
    }
}

/// Per-caller profiles with anomaly scoring.
#[derive(Debug)]
pub struct BehaviorTracker {
    clock: Arc<dyn Clock>,
    profiles: DashMap<CallerId, CallerProfile>,
}

impl BehaviorTracker {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            profiles: DashMap::new(),
        }
    }

    /// Feeds one admitted request into the caller's profile.
    pub fn record(
        &self,
        caller: &CallerId,
        route: &RouteId,
        payload_bytes: u64,
        hour: u8,
        tuning: &BehaviorTuning,
    ) {
        let now = self.clock.now();
        let alpha = tuning.ema_alpha.clamp(0.0, 1.0);
        let mut profile = self
            .profiles
            .entry(caller.clone())
            .or_insert_with(|| CallerProfile::new(now));
        profile.roll(now, alpha);

        profile.window_count += 1;
        profile.window_bytes += payload_bytes;
        profile.hour_counts[usize::from(hour.min(23))] += 1;

        let novel = !profile.endpoints.contains(route.as_str());
        profile.novelty_ema += alpha * (f64::from(u8::from(novel)) - profile.novelty_ema);
        if novel && profile.endpoints.len() < MAX_TRACKED_ENDPOINTS {
            profile.endpoints.insert(route.as_str().to_owned());
        }

        if let Some(last) = profile.last_request {
            let fast = now.saturating_duration_since(last) < Duration::from_secs(1);
            profile.subsecond_ema += alpha * (f64::from(u8::from(fast)) - profile.subsecond_ema);
        }
        profile.last_request = Some(now);
        profile.observations += 1;
    }

    /// Scores the caller against its own profile. Returns `None` until the
    /// profile has enough history to be meaningful.
    #[must_use]
    pub fn assess(
        &self,
        caller: &CallerId,
        hour: u8,
        tuning: &BehaviorTuning,
    ) -> Option<LevelAssessment> {
        let now = self.clock.now();
        let mut profile = self.profiles.get_mut(caller)?;
        profile.roll(now, tuning.ema_alpha.clamp(0.0, 1.0));

        if profile.observations < tuning.min_observations || profile.windows_folded == 0 {
            return None;
        }

        let score = anomaly_score(&profile, now, hour, tuning);
        let level = if score >= tuning.emergency_score {
            ThrottleLevel::Emergency
        } else if score >= tuning.heavy_score {
            ThrottleLevel::Heavy
        } else if score >= tuning.moderate_score {
            ThrottleLevel::Moderate
        } else if score >= tuning.light_score {
            ThrottleLevel::Light
        } else {
            ThrottleLevel::None
        };

        let mut assessment = LevelAssessment::new(
            level,
            AssessmentSource::Behavior,
            format!("caller anomaly score {score:.2}"),
        );
        if level == ThrottleLevel::None {
            assessment.source = AssessmentSource::Clear;
        }
        Some(assessment)
    }

    /// Drops profiles idle for longer than `idle_for`.
    pub fn prune(&self, idle_for: Duration) {
        let now = self.clock.now();
        self.profiles.retain(|_, profile| {
            profile
                .last_request
                .is_some_and(|last| now.saturating_duration_since(last) < idle_for)
        });
    }

    /// Number of callers currently profiled.
    #[must_use]
    pub fn profiled_callers(&self) -> usize {
        self.profiles.len()
    }
}

/// Weighted blend of the five anomaly components, each in `[0, 1]`.
fn anomaly_score(profile: &CallerProfile, now: Instant, hour: u8, tuning: &BehaviorTuning) -> f64 {
    let rate = multiplier_component(
        projected_per_window(profile.window_count, profile.window_start, now),
        profile.rate_ema,
        tuning.rate_multiplier,
    );
    let volume = multiplier_component(
        projected_per_window(profile.window_bytes, profile.window_start, now),
        profile.volume_ema,
        tuning.volume_multiplier,
    );
    let novelty = profile.novelty_ema.clamp(0.0, 1.0);
    let hours = off_hours_component(&profile.hour_counts, hour);
    let spacing = profile.subsecond_ema.clamp(0.0, 1.0);

    let total_weight = tuning.rate_weight
        + tuning.volume_weight
        + tuning.endpoint_weight
        + tuning.hours_weight
        + tuning.spacing_weight;
    if total_weight <= 0.0 {
        return 0.0;
    }

    let weighted = rate * tuning.rate_weight
        + volume * tuning.volume_weight
        + novelty * tuning.endpoint_weight
        + hours * tuning.hours_weight
        + spacing * tuning.spacing_weight;
    (weighted / total_weight).clamp(0.0, 1.0)
}

/// Scales the open window's count up to a full-window pace. Very young
/// windows are floored at one second so a single fresh request does not
/// explode the projection.
fn projected_per_window(count: u64, window_start: Instant, now: Instant) -> f64 {
    let elapsed = now
        .saturating_duration_since(window_start)
        .as_secs_f64()
        .max(1.0);
    count as f64 * (PROFILE_WINDOW.as_secs_f64() / elapsed)
}

/// Ramps from 0.0 at the profile pace to 1.0 at `saturation` times it.
fn multiplier_component(projected: f64, typical: f64, saturation: f64) -> f64 {
    if typical <= 0.0 {
        return 0.0;
    }
    let multiplier = projected / typical;
    if saturation <= 1.0 {
        return if multiplier > 1.0 { 1.0 } else { 0.0 };
    }
    ((multiplier - 1.0) / (saturation - 1.0)).clamp(0.0, 1.0)
}

/// 0.0 when the current hour carries at least an average share of the
/// caller's traffic, ramping to 1.0 for hours the caller never uses.
fn off_hours_component(hour_counts: &[u64; 24], hour: u8) -> f64 {
    let total: u64 = hour_counts.iter().sum();
    let active_hours = hour_counts.iter().filter(|&&c| c > 0).count();
    if total == 0 || active_hours == 0 {
        return 0.0;
    }
    let mean_share = total as f64 / active_hours as f64;
    let current = hour_counts[usize::from(hour.min(23))] as f64;
    (1.0 - current / mean_share).clamp(0.0, 1.0)
}
