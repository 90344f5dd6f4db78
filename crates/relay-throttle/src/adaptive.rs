//! Load-adaptive throttling.
//!
//! Folds the latest system metrics into a single performance score in
//! `[0, 1]` and maps score bands to throttle levels. Without fresh metrics
//! the assessor stands down entirely rather than guessing.

use relay_config::AdaptiveTuning;

use crate::decision::{AssessmentSource, LevelAssessment, ThrottleLevel};
use crate::metrics::SystemMetrics;

/// Scores system health and derives a throttle level from it.
#[derive(Debug, Clone)]
pub struct AdaptiveAssessor {
    tuning: AdaptiveTuning,
}

impl AdaptiveAssessor {
    #[must_use]
    pub fn new(tuning: AdaptiveTuning) -> Self {
        Self { tuning }
    }

    /// Assesses the current metrics. Returns `None` when metrics are absent
    /// or older than the configured staleness bound, which callers treat as
    /// "no adaptive opinion".
    #[must_use]
    pub fn assess(&self, metrics: Option<&SystemMetrics>) -> Option<LevelAssessment> {
        let metrics = metrics?;
        if metrics.age > self.tuning.staleness {
            return None;
        }

        let score = self.performance_score(metrics);
        let level = self.level_for(score);
        let mut assessment = LevelAssessment::new(
            level,
            AssessmentSource::Adaptive,
            format!("performance score {score:.2}"),
        );
        if level == ThrottleLevel::None {
            assessment.source = AssessmentSource::Clear;
        }
        Some(assessment)
    }

    /// Weighted health score; 1.0 is a fully healthy system.
    #[must_use]
    pub fn performance_score(&self, metrics: &SystemMetrics) -> f64 {
        let t = &self.tuning;

        // Each component is normalized so 1.0 means "at or better than
        // baseline" and degrades toward 0.0 from there.
        let response_time = ratio_score(
            metrics.baseline_response_time.as_secs_f64(),
            metrics.avg_response_time.as_secs_f64(),
        );
        let throughput = ratio_score(metrics.requests_per_second, metrics.baseline_throughput);
        let errors = (1.0 - metrics.error_rate).clamp(0.0, 1.0);
        let utilization = (1.0 - metrics.resource_utilization).clamp(0.0, 1.0);

        let total_weight = t.response_time_weight
            + t.throughput_weight
            + t.error_rate_weight
            + t.utilization_weight;
        if total_weight <= 0.0 {
            return 1.0;
        }

        let weighted = response_time * t.response_time_weight
            + throughput * t.throughput_weight
            + errors * t.error_rate_weight
            + utilization * t.utilization_weight;
        (weighted / total_weight).clamp(0.0, 1.0)
    }

    fn level_for(&self, score: f64) -> ThrottleLevel {
        let t = &self.tuning;
        if score <= t.emergency_score {
            ThrottleLevel::Emergency
        } else if score <= t.heavy_score {
            ThrottleLevel::Heavy
        } else if score <= t.moderate_score {
            ThrottleLevel::Moderate
        } else if score <= t.light_score {
            ThrottleLevel::Light
        } else {
            ThrottleLevel::None
        }
    }
}

/// `good / actual` capped at 1.0, with zero denominators treated as healthy.
fn ratio_score(good: f64, actual: f64) -> f64 {
    if actual <= 0.0 || good <= 0.0 {
        return 1.0;
    }
    (good / actual).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assessor() -> AdaptiveAssessor {
        AdaptiveAssessor::new(AdaptiveTuning::default())
    }

    #[test]
    fn healthy_metrics_stay_clear() {
        let out = assessor().assess(Some(&SystemMetrics::healthy()));
        let assessment = out.expect("fresh metrics produce an assessment");
        assert_eq!(assessment.level, ThrottleLevel::None);
    }

    #[test]
    fn degraded_metrics_raise_the_level() {
        let mut metrics = SystemMetrics::healthy();
        metrics.avg_response_time = Duration::from_secs(2);
        metrics.error_rate = 0.4;
        metrics.resource_utilization = 0.95;
        metrics.requests_per_second = 5.0;

        let assessment = assessor().assess(Some(&metrics)).expect("assessment");
        assert!(assessment.level >= ThrottleLevel::Heavy, "got {:?}", assessment.level);
    }

    #[test]
    fn saturated_system_hits_emergency() {
        let mut metrics = SystemMetrics::healthy();
        metrics.avg_response_time = Duration::from_secs(10);
        metrics.error_rate = 0.9;
        metrics.resource_utilization = 1.0;
        metrics.requests_per_second = 0.5;

        let assessment = assessor().assess(Some(&metrics)).expect("assessment");
        assert_eq!(assessment.level, ThrottleLevel::Emergency);
    }

    #[test]
    fn stale_metrics_stand_down() {
        let mut metrics = SystemMetrics::healthy();
        metrics.resource_utilization = 1.0;
        metrics.age = Duration::from_secs(120);
        assert!(assessor().assess(Some(&metrics)).is_none());
    }

    #[test]
    fn missing_metrics_stand_down() {
        assert!(assessor().assess(None).is_none());
    }

    #[test]
    fn score_is_bounded() {
        let mut metrics = SystemMetrics::healthy();
        metrics.error_rate = 5.0;
        metrics.resource_utilization = 3.0;
        let score = assessor().performance_score(&metrics);
        assert!((0.0..=1.0).contains(&score));
    }
}
