//! Static throttling rule evaluation.

use tracing::debug;

use relay_config::{ThrottleRuleConfig, ThrottleTrigger};

use crate::decision::{AssessmentSource, LevelAssessment, ScopeKey};
use crate::metrics::SystemMetrics;

/// Inputs a rule evaluation runs against.
#[derive(Debug, Clone, Default)]
pub struct RuleInputs {
    /// Latest system metrics, when available.
    pub metrics: Option<SystemMetrics>,
    /// Current scope load over its typical load, from the predictive
    /// tracker. 1.0 means normal.
    pub spike_multiplier: f64,
    /// Current UTC hour, 0..=23.
    pub hour: u8,
}

/// An ordered set of enabled rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    // Sorted by descending priority at construction.
    rules: Vec<ThrottleRuleConfig>,
}

impl RuleSet {
    /// Builds a set from configured rules, dropping disabled ones and
    /// ordering by descending priority.
    #[must_use]
    pub fn new(configured: &[ThrottleRuleConfig]) -> Self {
        let mut rules: Vec<ThrottleRuleConfig> = configured
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// Number of active rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates the set against one scope. The highest-priority rule that
    /// triggers wins; lower-priority rules are not consulted further.
    #[must_use]
    pub fn evaluate(&self, scope: &ScopeKey, inputs: &RuleInputs) -> LevelAssessment {
        for rule in &self.rules {
            if !applies_to_scope(rule, scope) || !within_active_hours(rule, inputs.hour) {
                continue;
            }
            if triggers(rule, inputs) {
                debug!(rule = %rule.id, scope = %scope, "throttle rule matched");
                let mut assessment = LevelAssessment::new(
                    rule.level.into(),
                    AssessmentSource::Rule,
                    format!("rule {} ({:?})", rule.id, rule.trigger),
                );
                assessment.retry_after = rule.retry_after;
                assessment.rule_ids = vec![rule.id.clone()];
                return assessment;
            }
        }
        LevelAssessment::clear()
    }
}

fn applies_to_scope(rule: &ThrottleRuleConfig, scope: &ScopeKey) -> bool {
    match rule.scope {
        None => true,
        Some(kind) => {
            kind == scope.kind
                && rule
                    .scope_value
                    .as_ref()
                    .map_or(true, |v| v == &scope.value)
        }
    }
}

fn within_active_hours(rule: &ThrottleRuleConfig, hour: u8) -> bool {
    match rule.active_hours {
        None => true,
        // Ranges may wrap midnight, e.g. (22, 6).
        Some((start, end)) => {
            if start <= end {
                (start..end).contains(&hour)
            } else {
                hour >= start || hour < end
            }
        }
    }
}

fn triggers(rule: &ThrottleRuleConfig, inputs: &RuleInputs) -> bool {
    match rule.trigger {
        ThrottleTrigger::HighLoad => inputs
            .metrics
            .as_ref()
            .is_some_and(|m| m.resource_utilization >= rule.threshold),
        ThrottleTrigger::UsageSpike => inputs.spike_multiplier >= rule.threshold,
        ThrottleTrigger::CostThreshold => inputs
            .metrics
            .as_ref()
            .and_then(|m| m.cost_rate)
            .is_some_and(|cost| cost >= rule.threshold),
        ThrottleTrigger::PerformanceDegradation => inputs
            .metrics
            .as_ref()
            .is_some_and(|m| m.avg_response_time.as_millis() as f64 >= rule.threshold),
        ThrottleTrigger::TimeBased => true,
    }
}
