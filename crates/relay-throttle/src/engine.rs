//! The admission control engine.
//!
//! One [`ThrottleEngine`] instance serves the whole gateway. Per request it
//! walks the scope chain (global, organization, caller, endpoint), merges
//! the level assessments of every enabled strategy plus the static rules,
//! applies the resulting rejection rate as a coin flip, and finally charges
//! the applicable fixed-window quotas. Level assessments are cached briefly
//! per scope; quota counters and the coin flip never are.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use relay_config::{QuotaConfig, QuotaScope, ThrottleSettings};
use relay_core::{CallerId, RouteId, TenantId};
use relay_resilience::{Clock, SystemClock};

use crate::adaptive::AdaptiveAssessor;
use crate::behavior::BehaviorTracker;
use crate::decision::{LevelAssessment, QuotaStanding, ScopeKey, ThrottleDecision};
use crate::metrics::MetricsFeed;
use crate::predictive::PredictiveTracker;
use crate::quota::{QuotaCharge, QuotaTracker};
use crate::rules::{RuleInputs, RuleSet};

/// Caller profiles idle for this long are dropped during maintenance.
const PROFILE_IDLE_CUTOFF: Duration = Duration::from_secs(3_600);

/// Upper bound used when pruning quota windows.
const QUOTA_PRUNE_HORIZON: Duration = Duration::from_secs(3_600);

/// Everything admission control needs to know about one request.
#[derive(Debug, Clone)]
pub struct ThrottleContext<'a> {
    /// Authenticated caller.
    pub caller: &'a CallerId,
    /// Caller's tenant, when known.
    pub tenant: Option<&'a TenantId>,
    /// Matched route.
    pub route: &'a RouteId,
    /// Request payload size in bytes.
    pub payload_bytes: u64,
    /// Quotas configured on the matched route. These shadow the default
    /// quotas of the same scope kind.
    pub route_quotas: &'a [QuotaConfig],
}

/// Point-in-time engine internals, served by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStats {
    /// Quota windows currently open.
    pub active_quota_windows: usize,
    /// Scopes with usage history.
    pub tracked_scopes: usize,
    /// Callers with a behavior profile.
    pub profiled_callers: usize,
    /// Cached level assessments.
    pub cached_assessments: usize,
    /// Enabled static rules.
    pub active_rules: usize,
}

#[derive(Debug)]
struct EngineState {
    settings: ThrottleSettings,
    rules: RuleSet,
}

#[derive(Debug, Clone)]
struct CachedAssessment {
    computed_at: Instant,
    assessment: LevelAssessment,
}

/// Combines static quotas with adaptive, predictive, and behavioral
/// throttling into a single per-request admission decision.
#[derive(Debug)]
pub struct ThrottleEngine {
    clock: Arc<dyn Clock>,
    feed: Arc<dyn MetricsFeed>,
    state: ArcSwap<EngineState>,
    quotas: QuotaTracker,
    predictive: PredictiveTracker,
    behavior: BehaviorTracker,
    assessments: DashMap<ScopeKey, CachedAssessment>,
}

impl ThrottleEngine {
    /// Creates an engine on the system clock.
    #[must_use]
    pub fn new(settings: ThrottleSettings, feed: Arc<dyn MetricsFeed>) -> Self {
        Self::with_clock(settings, feed, Arc::new(SystemClock))
    }

    /// Creates an engine reading time from `clock`.
    #[must_use]
    pub fn with_clock(
        settings: ThrottleSettings,
        feed: Arc<dyn MetricsFeed>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rules = RuleSet::new(&settings.rules);
        Self {
            clock: clock.clone(),
            feed,
            state: ArcSwap::from_pointee(EngineState { settings, rules }),
            quotas: QuotaTracker::new(clock.clone()),
            predictive: PredictiveTracker::new(clock.clone()),
            behavior: BehaviorTracker::new(clock),
            assessments: DashMap::new(),
        }
    }

    /// Swaps in new settings. Quota counters and usage histories survive;
    /// cached assessments are discarded since their levels may no longer
    /// follow from the new rules and tuning.
    pub fn update(&self, settings: ThrottleSettings) {
        let rules = RuleSet::new(&settings.rules);
        let active_rules = rules.len();
        self.state.store(Arc::new(EngineState { settings, rules }));
        self.assessments.clear();
        info!(active_rules, "throttle settings replaced");
    }

    /// Full admission decision over the request's scope chain.
    #[must_use]
    pub fn evaluate(&self, ctx: &ThrottleContext<'_>) -> ThrottleDecision {
        self.evaluate_at(ctx, current_utc_hour(), &mut rand::thread_rng())
    }

    /// [`Self::evaluate`] with the hour and randomness supplied, so tests
    /// can pin both.
    #[must_use]
    pub fn evaluate_at<R: Rng>(
        &self,
        ctx: &ThrottleContext<'_>,
        hour: u8,
        rng: &mut R,
    ) -> ThrottleDecision {
        let scopes = scope_chain(ctx);
        self.run(ctx, &scopes, hour, rng)
    }

    /// Admission decision for a single scope, ignoring the rest of the
    /// chain. Quotas of other scope kinds are not charged.
    #[must_use]
    pub fn decide(&self, scope: &ScopeKey, ctx: &ThrottleContext<'_>) -> ThrottleDecision {
        let scopes = [scope.clone()];
        self.run(ctx, &scopes, current_utc_hour(), &mut rand::thread_rng())
    }

    fn run<R: Rng>(
        &self,
        ctx: &ThrottleContext<'_>,
        scopes: &[ScopeKey],
        hour: u8,
        rng: &mut R,
    ) -> ThrottleDecision {
        let state = self.state.load();
        if !state.settings.enabled {
            return ThrottleDecision::allowed();
        }

        let mut merged = LevelAssessment::clear();
        for scope in scopes {
            merged = merged.merge(self.assessment_for(scope, hour, &state));
        }

        // Probabilistic shedding runs before quota charging so a shed
        // request does not consume the caller's window budget.
        let rate = merged.level.rejection_rate();
        if rate > 0.0 && rng.gen::<f64>() < rate {
            debug!(
                caller = %ctx.caller,
                route = %ctx.route,
                level = ?merged.level,
                %rate,
                "request shed"
            );
            return ThrottleDecision {
                allowed: false,
                level: merged.level,
                reduction_rate: rate,
                reason: merged.reason,
                rule_ids: merged.rule_ids,
                retry_after: Some(merged.retry_after),
                quota: None,
            };
        }

        let mut tightest: Option<QuotaStanding> = None;
        for (key, quota) in applicable_quotas(ctx, &state.settings, scopes) {
            match self.quotas.charge(&key, quota.limit, quota.window) {
                QuotaCharge::Admitted(standing) => {
                    let tighter = tightest
                        .as_ref()
                        .map_or(true, |current| standing.remaining < current.remaining);
                    if tighter {
                        tightest = Some(standing);
                    }
                }
                QuotaCharge::Exhausted { standing } => {
                    debug!(
                        caller = %ctx.caller,
                        route = %ctx.route,
                        scope = %standing.scope,
                        limit = standing.limit,
                        "quota exhausted"
                    );
                    return ThrottleDecision {
                        allowed: false,
                        level: merged.level,
                        reduction_rate: rate,
                        reason: format!("quota exhausted for {}", standing.scope),
                        rule_ids: merged.rule_ids,
                        retry_after: Some(standing.reset_after),
                        quota: Some(standing),
                    };
                }
            }
        }

        self.record_admission(ctx, scopes, hour, &state);

        ThrottleDecision {
            allowed: true,
            level: merged.level,
            reduction_rate: rate,
            reason: merged.reason,
            rule_ids: merged.rule_ids,
            retry_after: None,
            quota: tightest,
        }
    }

    /// Cached per-scope level assessment, recomputed after the TTL.
    fn assessment_for(&self, scope: &ScopeKey, hour: u8, state: &EngineState) -> LevelAssessment {
        let now = self.clock.now();
        let ttl = state.settings.decision_cache_ttl;
        if let Some(cached) = self.assessments.get(scope) {
            if now.saturating_duration_since(cached.computed_at) < ttl {
                return cached.assessment.clone();
            }
        }

        let assessment = self.compute_assessment(scope, hour, state);
        self.assessments.insert(
            scope.clone(),
            CachedAssessment {
                computed_at: now,
                assessment: assessment.clone(),
            },
        );
        assessment
    }

    fn compute_assessment(&self, scope: &ScopeKey, hour: u8, state: &EngineState) -> LevelAssessment {
        let tuning = &state.settings.tuning;
        let metrics = self.feed.current();
        let mut merged = LevelAssessment::clear();

        // The adaptive view is system-wide; it contributes through the
        // global scope so the chain merge picks it up exactly once.
        if state.settings.adaptive_enabled && scope.kind == QuotaScope::Global {
            let assessor = AdaptiveAssessor::new(tuning.adaptive.clone());
            if let Some(assessment) = assessor.assess(metrics.as_ref()) {
                merged = merged.merge(assessment);
            }
        }

        let mut spike_multiplier = 1.0;
        if state.settings.predictive_enabled {
            let outcome = self.predictive.assess(scope, hour, &tuning.predictive);
            spike_multiplier = outcome.spike_multiplier;
            merged = merged.merge(outcome.assessment);
        }

        if state.settings.behavior_enabled && scope.kind == QuotaScope::User {
            let caller = CallerId::new(scope.value.clone());
            if let Some(assessment) = self.behavior.assess(&caller, hour, &tuning.behavior) {
                merged = merged.merge(assessment);
            }
        }

        let inputs = RuleInputs {
            metrics,
            spike_multiplier,
            hour,
        };
        merged.merge(state.rules.evaluate(scope, &inputs))
    }

    /// Feeds trackers with an admitted request. Rejected requests do not
    /// shape usage histories or caller profiles.
    fn record_admission(
        &self,
        ctx: &ThrottleContext<'_>,
        scopes: &[ScopeKey],
        hour: u8,
        state: &EngineState,
    ) {
        let tuning = &state.settings.tuning;
        if state.settings.predictive_enabled {
            for scope in scopes {
                self.predictive.record(scope, hour, &tuning.predictive);
            }
        }
        if state.settings.behavior_enabled && scopes.iter().any(|s| s.kind == QuotaScope::User) {
            self.behavior
                .record(ctx.caller, ctx.route, ctx.payload_bytes, hour, &tuning.behavior);
        }
    }

    /// Periodic cleanup of idle counters, histories, and expired cached
    /// assessments. Driven by the gateway's maintenance task.
    pub fn maintain(&self) {
        let state = self.state.load();
        let now = self.clock.now();
        let ttl = state.settings.decision_cache_ttl;

        self.quotas.prune(QUOTA_PRUNE_HORIZON);
        self.predictive.prune(&state.settings.tuning.predictive);
        self.behavior.prune(PROFILE_IDLE_CUTOFF);
        self.assessments
            .retain(|_, cached| now.saturating_duration_since(cached.computed_at) < ttl);
    }

    /// Engine internals for observability endpoints.
    #[must_use]
    pub fn stats(&self) -> ThrottleStats {
        let state = self.state.load();
        ThrottleStats {
            active_quota_windows: self.quotas.active_windows(),
            tracked_scopes: self.predictive.tracked_scopes(),
            profiled_callers: self.behavior.profiled_callers(),
            cached_assessments: self.assessments.len(),
            active_rules: state.rules.len(),
        }
    }
}

/// Scope chain for a request: global, then organization when the tenant is
/// known, then caller, then endpoint.
fn scope_chain(ctx: &ThrottleContext<'_>) -> Vec<ScopeKey> {
    let mut scopes = Vec::with_capacity(4);
    scopes.push(ScopeKey::global());
    if let Some(tenant) = ctx.tenant {
        scopes.push(ScopeKey::organization(tenant));
    }
    scopes.push(ScopeKey::user(ctx.caller));
    scopes.push(ScopeKey::endpoint(ctx.route));
    scopes
}

/// Quotas to charge for this request, as `(counter key, config)` pairs in
/// chain order. Route-level quotas shadow default quotas of the same scope
/// kind and are counted per route.
fn applicable_quotas(
    ctx: &ThrottleContext<'_>,
    settings: &ThrottleSettings,
    scopes: &[ScopeKey],
) -> Vec<(String, QuotaConfig)> {
    let kinds: HashSet<QuotaScope> = scopes.iter().map(|s| s.kind).collect();
    let shadowed: HashSet<QuotaScope> = ctx.route_quotas.iter().map(|q| q.scope).collect();

    let mut out = Vec::new();
    for quota in &settings.default_quotas {
        if !kinds.contains(&quota.scope) || shadowed.contains(&quota.scope) {
            continue;
        }
        if let Some(scope) = scope_key_for(quota.scope, ctx) {
            out.push((scope.key(), quota.clone()));
        }
    }
    for quota in ctx.route_quotas {
        if !kinds.contains(&quota.scope) {
            continue;
        }
        if let Some(key) = route_quota_key(quota.scope, ctx) {
            out.push((key, quota.clone()));
        }
    }
    out.sort_by_key(|(_, quota)| kind_rank(quota.scope));
    out
}

/// `None` when the request lacks the data to key this scope, e.g. an
/// organization quota for a caller with no tenant.
fn scope_key_for(kind: QuotaScope, ctx: &ThrottleContext<'_>) -> Option<ScopeKey> {
    match kind {
        QuotaScope::Global => Some(ScopeKey::global()),
        QuotaScope::User => Some(ScopeKey::user(ctx.caller)),
        QuotaScope::Organization => ctx.tenant.map(ScopeKey::organization),
        QuotaScope::Endpoint => Some(ScopeKey::endpoint(ctx.route)),
    }
}

/// Route-level quotas count per route: a per-user quota on route R limits
/// each user's traffic to R, not across the gateway.
fn route_quota_key(kind: QuotaScope, ctx: &ThrottleContext<'_>) -> Option<String> {
    let endpoint = ScopeKey::endpoint(ctx.route);
    if kind == QuotaScope::Endpoint {
        return Some(endpoint.key());
    }
    scope_key_for(kind, ctx).map(|scope| format!("{}|{}", endpoint.key(), scope.key()))
}

const fn kind_rank(kind: QuotaScope) -> u8 {
    match kind {
        QuotaScope::Global => 0,
        QuotaScope::Organization => 1,
        QuotaScope::User => 2,
        QuotaScope::Endpoint => 3,
    }
}

fn current_utc_hour() -> u8 {
    use chrono::Timelike;
    chrono::Utc::now().hour() as u8
}
