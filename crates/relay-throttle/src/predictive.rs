//! Usage-history based throttling.
//!
//! Keeps a rolling bucketed request history per scope, classifies the
//! traffic pattern from its coefficient of variation, and projects
//! near-term load. Projections well above the scope's typical load impose
//! throttling before the system actually degrades.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use relay_config::PredictiveTuning;
use relay_resilience::Clock;

use crate::decision::{AssessmentSource, LevelAssessment, ScopeKey, ThrottleLevel};

/// Peak hours are hours whose share of traffic exceeds the mean hourly
/// share by this ratio.
const PEAK_HOUR_RATIO: f64 = 1.25;

/// Traffic shape classified from request-count variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficPattern {
    /// High variance, isolated surges.
    Spiky,
    /// Clustered bursts with quiet gaps.
    Burst,
    /// Slow drift up or down.
    Gradual,
    /// Steady rate.
    Consistent,
    /// Not enough history to classify.
    Unknown,
}

impl TrafficPattern {
    fn as_str(self) -> &'static str {
        match self {
            Self::Spiky => "spiky",
            Self::Burst => "burst",
            Self::Gradual => "gradual",
            Self::Consistent => "consistent",
            Self::Unknown => "unknown",
        }
    }
}

/// What the tracker concluded for one scope.
#[derive(Debug, Clone)]
pub struct PredictiveOutcome {
    /// Level assessment derived from the load projection.
    pub assessment: LevelAssessment,
    /// Classified traffic shape.
    pub pattern: TrafficPattern,
    /// Recent load over typical load, before projection weighting. 1.0
    /// when history is insufficient. Feeds `usage_spike` rule triggers.
    pub spike_multiplier: f64,
}

impl PredictiveOutcome {
    fn unknown() -> Self {
        Self {
            assessment: LevelAssessment::clear(),
            pattern: TrafficPattern::Unknown,
            spike_multiplier: 1.0,
        }
    }
}

#[derive(Debug)]
struct ScopeHistory {
    bucket_start: Instant,
    bucket_count: u64,
    completed: VecDeque<f64>,
    hourly_counts: [u64; 24],
    smoothed_trend: Option<f64>,
}

impl ScopeHistory {
    fn new(now: Instant) -> Self {
        Self {
            bucket_start: now,
            bucket_count: 0,
            completed: VecDeque::new(),
            hourly_counts: [0; 24],
            smoothed_trend: None,
        }
    }

    /// Closes buckets the clock has moved past. A gap longer than the whole
    /// window discards the history instead of replaying empty buckets.
    fn roll(&mut self, now: Instant, tuning: &PredictiveTuning) {
        let bucket = tuning.bucket_length;
        if bucket.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.bucket_start);
        if elapsed < bucket {
            return;
        }
        if elapsed >= bucket * tuning.history_window.max(1) as u32 {
            self.completed.clear();
            self.bucket_count = 0;
            self.bucket_start = now;
            self.smoothed_trend = None;
            return;
        }
        let mut remaining = elapsed;
        while remaining >= bucket {
            self.completed.push_back(self.bucket_count as f64);
            while self.completed.len() > tuning.history_window {
                self.completed.pop_front();
            }
            self.bucket_count = 0;
            self.bucket_start += bucket;
            remaining -= bucket;
        }
    }
}

/// Rolling per-scope usage histories with load projection.
#[derive(Debug)]
pub struct PredictiveTracker {
    clock: Arc<dyn Clock>,
    histories: DashMap<ScopeKey, ScopeHistory>,
}

impl PredictiveTracker {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            histories: DashMap::new(),
        }
    }

    /// Counts one admitted request against the scope.
    pub fn record(&self, scope: &ScopeKey, hour: u8, tuning: &PredictiveTuning) {
        let now = self.clock.now();
        let mut history = self
            .histories
            .entry(scope.clone())
            .or_insert_with(|| ScopeHistory::new(now));
        history.roll(now, tuning);
        history.bucket_count += 1;
        history.hourly_counts[usize::from(hour.min(23))] += 1;
    }

    /// Projects near-term load for the scope and derives a level from the
    /// projection-over-typical ratio.
    #[must_use]
    pub fn assess(&self, scope: &ScopeKey, hour: u8, tuning: &PredictiveTuning) -> PredictiveOutcome {
        let now = self.clock.now();
        let Some(mut history) = self.histories.get_mut(scope) else {
            return PredictiveOutcome::unknown();
        };
        history.roll(now, tuning);

        if history.completed.len() < tuning.min_buckets.max(2) {
            return PredictiveOutcome::unknown();
        }

        let buckets: Vec<f64> = history.completed.iter().copied().collect();
        let typical = mean(&buckets);
        if typical <= 0.0 {
            return PredictiveOutcome::unknown();
        }

        let cv = std_dev(&buckets, typical) / typical;
        let pattern = classify(cv, tuning);

        // Trend from recent-vs-earlier halves, smoothed across assessments
        // so one odd bucket does not whip the projection around.
        let half = buckets.len() / 2;
        let earlier = mean(&buckets[..half]);
        let recent = mean(&buckets[half..]);
        let raw_trend = if earlier > 0.0 { recent / earlier } else { 1.0 };
        let alpha = tuning.trend_smoothing.clamp(0.0, 1.0);
        let trend = match history.smoothed_trend {
            Some(prev) => prev + alpha * (raw_trend - prev),
            None => raw_trend,
        };
        history.smoothed_trend = Some(trend);

        let spike_multiplier = recent / typical;
        let projection = recent * trend * pattern_factor(pattern, tuning) * peak_weight(&history, hour, tuning);
        let ratio = projection / typical;

        let level = if ratio > tuning.moderate_projection {
            ThrottleLevel::Moderate
        } else if ratio > tuning.light_projection {
            ThrottleLevel::Light
        } else {
            ThrottleLevel::None
        };

        let assessment = if level == ThrottleLevel::None {
            LevelAssessment::clear()
        } else {
            LevelAssessment::new(
                level,
                AssessmentSource::Predictive,
                format!("projected load {ratio:.2}x typical ({} traffic)", pattern.as_str()),
            )
        };
        PredictiveOutcome {
            assessment,
            pattern,
            spike_multiplier,
        }
    }

    /// Drops histories that decayed to nothing. Called from the janitor.
    pub fn prune(&self, tuning: &PredictiveTuning) {
        let now = self.clock.now();
        self.histories.retain(|_, history| {
            history.roll(now, tuning);
            history.bucket_count > 0 || !history.completed.is_empty()
        });
    }

    /// Number of scopes currently tracked.
    #[must_use]
    pub fn tracked_scopes(&self) -> usize {
        self.histories.len()
    }
}

fn classify(cv: f64, tuning: &PredictiveTuning) -> TrafficPattern {
    if cv >= tuning.spiky_cv {
        TrafficPattern::Spiky
    } else if cv >= tuning.burst_cv {
        TrafficPattern::Burst
    } else if cv >= tuning.gradual_cv {
        TrafficPattern::Gradual
    } else {
        TrafficPattern::Consistent
    }
}

fn pattern_factor(pattern: TrafficPattern, tuning: &PredictiveTuning) -> f64 {
    match pattern {
        TrafficPattern::Spiky => tuning.spiky_factor,
        TrafficPattern::Burst => tuning.burst_factor,
        TrafficPattern::Gradual => tuning.gradual_factor,
        TrafficPattern::Consistent | TrafficPattern::Unknown => 1.0,
    }
}

fn peak_weight(history: &ScopeHistory, hour: u8, tuning: &PredictiveTuning) -> f64 {
    let total: u64 = history.hourly_counts.iter().sum();
    let active_hours = history.hourly_counts.iter().filter(|&&c| c > 0).count();
    if total == 0 || active_hours < 2 {
        return 1.0;
    }
    let mean_hourly = total as f64 / active_hours as f64;
    let current = history.hourly_counts[usize::from(hour.min(23))] as f64;
    if current >= mean_hourly * PEAK_HOUR_RATIO {
        tuning.peak_hour_weight
    } else {
        1.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
