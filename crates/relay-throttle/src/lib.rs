//! # Relay Throttle
//!
//! Admission control for the API relay gateway:
//! - Fixed-window quotas per scope (global, organization, caller, endpoint)
//! - Adaptive throttling from a live system metrics feed
//! - Predictive throttling from per-scope usage history
//! - Behavioral throttling from per-caller anomaly profiles
//! - Statically configured throttling rules
//!
//! Each strategy produces a [`LevelAssessment`]; the engine merges them,
//! keeps the most restrictive, and applies the level's rejection rate as a
//! per-request coin flip. Assessments are cached briefly per scope; quota
//! counters and the coin flip never are.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adaptive;
pub mod behavior;
pub mod decision;
pub mod engine;
pub mod metrics;
pub mod predictive;
pub mod quota;
pub mod rules;

pub use adaptive::AdaptiveAssessor;
pub use behavior::BehaviorTracker;
pub use decision::{
    AssessmentSource, LevelAssessment, QuotaStanding, ScopeKey, ThrottleDecision, ThrottleLevel,
};
pub use engine::{ThrottleContext, ThrottleEngine, ThrottleStats};
pub use metrics::{MetricsFeed, NullMetricsFeed, SharedMetricsFeed, SystemMetrics};
pub use predictive::{PredictiveOutcome, PredictiveTracker, TrafficPattern};
pub use quota::{QuotaCharge, QuotaTracker};
pub use rules::RuleSet;
