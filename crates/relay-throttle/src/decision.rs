//! Throttle levels, scope keys, and decisions.

use std::time::Duration;

use serde::Serialize;

use relay_config::QuotaScope;
use relay_core::{CallerId, RouteId, TenantId};

/// Escalating throttling levels with their fixed rejection rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    /// No throttling.
    None,
    /// Reject about a quarter of traffic.
    Light,
    /// Reject about half.
    Moderate,
    /// Reject about three quarters.
    Heavy,
    /// Reject almost everything.
    Emergency,
}

impl ThrottleLevel {
    /// Fraction of traffic rejected at this level.
    #[must_use]
    pub fn rejection_rate(self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Light => 0.25,
            Self::Moderate => 0.5,
            Self::Heavy => 0.75,
            Self::Emergency => 0.9,
        }
    }

    /// Back-off suggestion attached to rejections at this level.
    #[must_use]
    pub fn suggested_retry_after(self) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Light => Duration::from_secs(5),
            Self::Moderate => Duration::from_secs(15),
            Self::Heavy => Duration::from_secs(30),
            Self::Emergency => Duration::from_secs(60),
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Heavy => "heavy",
            Self::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<relay_config::ThrottleLevelConfig> for ThrottleLevel {
    fn from(value: relay_config::ThrottleLevelConfig) -> Self {
        match value {
            relay_config::ThrottleLevelConfig::Light => Self::Light,
            relay_config::ThrottleLevelConfig::Moderate => Self::Moderate,
            relay_config::ThrottleLevelConfig::Heavy => Self::Heavy,
            relay_config::ThrottleLevelConfig::Emergency => Self::Emergency,
        }
    }
}

/// A concrete scope instance, e.g. `user:svc-billing`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScopeKey {
    /// Scope kind.
    pub kind: QuotaScope,
    /// Scope value; empty for the global scope.
    pub value: String,
}

impl ScopeKey {
    /// The global scope.
    #[must_use]
    pub fn global() -> Self {
        Self {
            kind: QuotaScope::Global,
            value: String::new(),
        }
    }

    /// Scope of one caller.
    #[must_use]
    pub fn user(caller: &CallerId) -> Self {
        Self {
            kind: QuotaScope::User,
            value: caller.as_str().to_owned(),
        }
    }

    /// Scope of one tenant.
    #[must_use]
    pub fn organization(tenant: &TenantId) -> Self {
        Self {
            kind: QuotaScope::Organization,
            value: tenant.as_str().to_owned(),
        }
    }

    /// Scope of one route.
    #[must_use]
    pub fn endpoint(route: &RouteId) -> Self {
        Self {
            kind: QuotaScope::Endpoint,
            value: route.as_str().to_owned(),
        }
    }

    /// Canonical `kind:value` form used in counters, caches, and messages.
    #[must_use]
    pub fn key(&self) -> String {
        if self.value.is_empty() {
            self.kind.as_str().to_owned()
        } else {
            format!("{}:{}", self.kind.as_str(), self.value)
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Which strategy produced a level assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentSource {
    /// No strategy saw a reason to throttle.
    Clear,
    /// A static rule matched.
    Rule,
    /// Current system load.
    Adaptive,
    /// Projected near-future load.
    Predictive,
    /// Caller behavior anomaly.
    Behavior,
}

/// The cacheable part of a throttling decision: the level imposed on a
/// scope and why. The per-request admission coin flip is applied on top of
/// this at evaluation time, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct LevelAssessment {
    /// Imposed level.
    pub level: ThrottleLevel,
    /// Strategy that imposed it.
    pub source: AssessmentSource,
    /// Human-readable explanation.
    pub reason: String,
    /// Static rule ids that contributed.
    pub rule_ids: Vec<String>,
    /// Back-off suggestion for rejections under this assessment.
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
}

impl LevelAssessment {
    /// An assessment imposing nothing.
    #[must_use]
    pub fn clear() -> Self {
        Self {
            level: ThrottleLevel::None,
            source: AssessmentSource::Clear,
            reason: String::new(),
            rule_ids: Vec::new(),
            retry_after: Duration::ZERO,
        }
    }

    /// Creates an assessment at `level` from `source`.
    #[must_use]
    pub fn new(level: ThrottleLevel, source: AssessmentSource, reason: impl Into<String>) -> Self {
        Self {
            level,
            source,
            reason: reason.into(),
            rule_ids: Vec::new(),
            retry_after: level.suggested_retry_after(),
        }
    }

    /// Keeps the more restrictive of two assessments: the higher rejection
    /// rate wins, ties go to the longer retry suggestion. Rule ids from
    /// both sides are preserved.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let mut rule_ids = self.rule_ids.clone();
        for id in &other.rule_ids {
            if !rule_ids.contains(id) {
                rule_ids.push(id.clone());
            }
        }

        let self_rate = self.level.rejection_rate();
        let other_rate = other.level.rejection_rate();
        let mut winner = if other_rate > self_rate
            || (other_rate == self_rate && other.retry_after > self.retry_after)
        {
            other
        } else {
            self
        };
        winner.rule_ids = rule_ids;
        winner
    }
}

/// Point-in-time standing against the tightest applicable quota, surfaced
/// through the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStanding {
    /// Scope the quota is keyed by.
    pub scope: String,
    /// Window limit.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Time until the window resets.
    #[serde(with = "humantime_serde")]
    pub reset_after: Duration,
}

/// Outcome of admission control for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleDecision {
    /// Whether the request proceeds.
    pub allowed: bool,
    /// Level in force on the most restrictive scope.
    pub level: ThrottleLevel,
    /// Fraction of traffic currently rejected.
    pub reduction_rate: f64,
    /// Why the request was rejected or throttled; empty when clear.
    pub reason: String,
    /// Static rule ids that contributed.
    pub rule_ids: Vec<String>,
    /// Back-off suggestion; `None` for admitted requests.
    #[serde(with = "humantime_serde::option")]
    pub retry_after: Option<Duration>,
    /// Standing against the tightest quota, when any quota applies.
    pub quota: Option<QuotaStanding>,
}

impl ThrottleDecision {
    /// An unconditional admission.
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            level: ThrottleLevel::None,
            reduction_rate: 0.0,
            reason: String::new(),
            rule_ids: Vec::new(),
            retry_after: None,
            quota: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order_by_severity() {
        assert!(ThrottleLevel::None < ThrottleLevel::Light);
        assert!(ThrottleLevel::Light < ThrottleLevel::Moderate);
        assert!(ThrottleLevel::Moderate < ThrottleLevel::Heavy);
        assert!(ThrottleLevel::Heavy < ThrottleLevel::Emergency);
    }

    #[test]
    fn rejection_rates_are_fixed() {
        assert_eq!(ThrottleLevel::None.rejection_rate(), 0.0);
        assert_eq!(ThrottleLevel::Light.rejection_rate(), 0.25);
        assert_eq!(ThrottleLevel::Moderate.rejection_rate(), 0.5);
        assert_eq!(ThrottleLevel::Heavy.rejection_rate(), 0.75);
        assert_eq!(ThrottleLevel::Emergency.rejection_rate(), 0.9);
    }

    #[test]
    fn merge_keeps_most_restrictive() {
        let light = LevelAssessment::new(ThrottleLevel::Light, AssessmentSource::Adaptive, "a");
        let heavy = LevelAssessment::new(ThrottleLevel::Heavy, AssessmentSource::Behavior, "b");
        let merged = light.merge(heavy);
        assert_eq!(merged.level, ThrottleLevel::Heavy);
        assert_eq!(merged.source, AssessmentSource::Behavior);
    }

    #[test]
    fn merge_tie_prefers_longer_retry() {
        let mut a = LevelAssessment::new(ThrottleLevel::Moderate, AssessmentSource::Rule, "a");
        a.retry_after = Duration::from_secs(10);
        a.rule_ids = vec!["r1".to_owned()];
        let mut b = LevelAssessment::new(ThrottleLevel::Moderate, AssessmentSource::Adaptive, "b");
        b.retry_after = Duration::from_secs(60);

        let merged = a.merge(b);
        assert_eq!(merged.retry_after, Duration::from_secs(60));
        assert_eq!(merged.source, AssessmentSource::Adaptive);
        // Contributing rule ids survive even when the other side wins.
        assert_eq!(merged.rule_ids, vec!["r1".to_owned()]);
    }

    #[test]
    fn scope_keys_render_canonically() {
        assert_eq!(ScopeKey::global().key(), "global");
        assert_eq!(ScopeKey::user(&CallerId::new("alice")).key(), "user:alice");
        assert_eq!(
            ScopeKey::endpoint(&RouteId::new("llm-chat")).key(),
            "endpoint:llm-chat"
        );
    }
}
