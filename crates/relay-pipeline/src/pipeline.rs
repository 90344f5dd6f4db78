//! Staged request pipeline.
//!
//! A relayed call passes through route matching, throttle admission, the
//! per-route concurrency ceiling, cache lookup, the circuit breaker gate,
//! and finally the upstream transport with retry. Stages that reject
//! produce typed [`RelayError`]s; the HTTP layer maps those onto status
//! codes and advisory headers.
//!
//! Configuration is split in two lifetimes. The snapshot (route table,
//! credentials, parsed config) is rebuilt wholesale on reload and swapped
//! atomically; requests in flight finish on the snapshot they started
//! with. The engines (breakers, throttle state, cache, queues) live as
//! long as the pipeline and are updated in place, so breaker states and
//! quota windows survive a reload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use relay_cache::{
    cache_key, CachedResponse, InvalidationEvent, InvalidationManager, InvalidationWorker,
    ResponseCache,
};
use relay_config::{EndpointRoute, GatewayConfig, RecoveryConfig, RetryStrategy, RouteBreakerConfig};
use relay_core::{
    CacheStatus, ProxyRequest, ProxyResponse, RelayError, RelayResult, RouteId, UsageSample,
};
use relay_resilience::{
    BackoffStrategy, BreakerRegistry, CircuitBreakerConfig, Clock, ConcurrencyLimiter,
    RecoveryStrategy, RetryPolicy, SystemClock,
};
use relay_routing::{CompiledRoute, RouteTable};
use relay_telemetry::StatsRecorder;
use relay_throttle::{MetricsFeed, ThrottleContext, ThrottleEngine};

use crate::credentials::CredentialStore;
use crate::error::PipelineError;
use crate::headers::{prepare_upstream_headers, sanitize_response_headers};
use crate::transport::{TransportError, UpstreamCall, UpstreamTransport};
use crate::usage::{UsagePump, UsageReporter, UsageSink};

/// State rebuilt from scratch on every configuration (re)load.
#[derive(Debug)]
struct PipelineSnapshot {
    config: Arc<GatewayConfig>,
    routes: RouteTable,
    credentials: CredentialStore,
}

/// Background tasks the host must spawn alongside the pipeline.
#[derive(Debug)]
pub struct PipelineWorkers {
    /// Drains the cache invalidation queue.
    pub invalidation: InvalidationWorker,
    /// Drains the usage sample queue.
    pub usage: UsagePump,
}

/// The relay pipeline and the engines it carries.
#[derive(Debug)]
pub struct Pipeline {
    state: ArcSwap<PipelineSnapshot>,
    transport: Arc<dyn UpstreamTransport>,
    breakers: Arc<BreakerRegistry>,
    limiters: DashMap<RouteId, Arc<ConcurrencyLimiter>>,
    throttle: Arc<ThrottleEngine>,
    cache: Arc<ResponseCache>,
    invalidation: InvalidationManager,
    usage: UsageReporter,
    stats: Arc<StatsRecorder>,
}

impl Pipeline {
    /// Builds a pipeline on the system clock.
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn UpstreamTransport>,
        feed: Arc<dyn MetricsFeed>,
        sink: Arc<dyn UsageSink>,
    ) -> Result<(Self, PipelineWorkers), PipelineError> {
        Self::with_clock(config, transport, feed, sink, Arc::new(SystemClock))
    }

    /// Builds a pipeline reading time from `clock`. The cache, breakers,
    /// and throttle engine all share it, so tests can drive TTLs, quota
    /// windows, and breaker cool-downs from one place.
    pub fn with_clock(
        config: GatewayConfig,
        transport: Arc<dyn UpstreamTransport>,
        feed: Arc<dyn MetricsFeed>,
        sink: Arc<dyn UsageSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, PipelineWorkers), PipelineError> {
        config.validate()?;
        let routes = RouteTable::build(&config.routes)?;
        let credentials = CredentialStore::from_config(&config.credentials);

        let cache = Arc::new(ResponseCache::with_clock(&config.cache, clock.clone()));
        let (invalidation, invalidation_worker) =
            InvalidationManager::channel(&config.invalidation, cache.clone());
        let (usage, usage_pump) = UsageReporter::channel(&config.usage, sink);

        let breakers = Arc::new(BreakerRegistry::new(clock.clone()));
        breakers.sync(&breaker_targets(&config.routes));

        let throttle = Arc::new(ThrottleEngine::with_clock(
            config.throttle.clone(),
            feed,
            clock,
        ));

        info!(routes = routes.len(), "pipeline built");
        let snapshot = PipelineSnapshot {
            routes,
            credentials,
            config: Arc::new(config),
        };
        let pipeline = Self {
            state: ArcSwap::from_pointee(snapshot),
            transport,
            breakers,
            limiters: DashMap::new(),
            throttle,
            cache,
            invalidation,
            usage,
            stats: Arc::new(StatsRecorder::new()),
        };
        let workers = PipelineWorkers {
            invalidation: invalidation_worker,
            usage: usage_pump,
        };
        Ok((pipeline, workers))
    }

    /// Swaps in a new configuration.
    ///
    /// A configuration that fails validation or route compilation is
    /// rejected whole and the previous snapshot keeps serving. Breaker
    /// states and quota windows carry over for routes whose settings did
    /// not change; cache capacity and queue sizes are fixed at startup.
    pub fn reload(&self, config: GatewayConfig) -> Result<(), PipelineError> {
        config.validate()?;
        let routes = RouteTable::build(&config.routes)?;
        let credentials = CredentialStore::from_config(&config.credentials);

        self.breakers.sync(&breaker_targets(&config.routes));
        self.throttle.update(config.throttle.clone());
        self.invalidation.update_rules(config.invalidation.rules.clone());
        self.limiters.retain(|route, limiter| {
            config
                .routes
                .iter()
                .any(|def| def.id == route.as_str() && def.max_concurrent_requests == Some(limiter.limit()))
        });

        info!(routes = routes.len(), "pipeline configuration swapped");
        self.state.store(Arc::new(PipelineSnapshot {
            routes,
            credentials,
            config: Arc::new(config),
        }));
        // Rules keyed on config.reloaded can flush regions whose policies
        // may have changed.
        self.invalidation
            .publish(InvalidationEvent::new("config.reloaded"));
        Ok(())
    }

    /// Relays one request end to end.
    #[instrument(skip_all, fields(request = %request.id, method = %request.method, path = %request.path, caller = %request.caller))]
    pub async fn handle(&self, request: ProxyRequest) -> RelayResult<ProxyResponse> {
        let started = Instant::now();
        let snapshot = self.state.load_full();

        let Some(route) = snapshot.routes.select(&request.method, &request.path) else {
            debug!("no route matched");
            let err = RelayError::route_not_found(request.method.as_str(), request.path.clone());
            self.stats.record_failure(None, &err);
            return Err(err);
        };

        let result = self.relay(&snapshot, route, &request).await;
        self.account(route.id(), &request, &result, started.elapsed());
        result
    }

    async fn relay(
        &self,
        snapshot: &PipelineSnapshot,
        route: &CompiledRoute,
        request: &ProxyRequest,
    ) -> RelayResult<ProxyResponse> {
        let def = route.definition();

        let decision = self.throttle.evaluate(&ThrottleContext {
            caller: &request.caller,
            tenant: request.tenant.as_ref(),
            route: route.id(),
            payload_bytes: request.body.len() as u64,
            route_quotas: &def.rate_limits,
        });
        if !decision.allowed {
            debug!(
                route = %route.id(),
                level = decision.level.as_str(),
                reason = %decision.reason,
                "request throttled"
            );
            let retry_after = decision.retry_after.unwrap_or(Duration::from_secs(1));
            let err = match decision.quota {
                Some(standing) => {
                    RelayError::rate_limited(standing.scope, retry_after, decision.reason)
                        .with_quota_limit(standing.limit)
                }
                None => RelayError::rate_limited("gateway", retry_after, decision.reason),
            };
            return Err(err);
        }

        // Released on drop, on every exit path below.
        let _permit = match def.max_concurrent_requests {
            Some(limit) => Some(self.limiter_for(route.id(), limit).try_acquire()?),
            None => None,
        };

        let cache_key = cache_key_for(snapshot, route, request);
        if let Some(key) = &cache_key {
            if let Some(found) = self.cache.lookup(key) {
                debug!(route = %route.id(), "served from cache");
                return Ok(found.to_proxy_response());
            }
        }

        let response = self.call_upstream(snapshot, route, request).await?;

        match cache_key {
            Some(key) => {
                // Only plain 2xx answers are worth replaying; redirects and
                // client errors go back to the upstream every time.
                if response.status.is_success() {
                    self.cache.store(
                        key,
                        route.id(),
                        &request.path,
                        CachedResponse {
                            status: response.status,
                            headers: response.headers.clone(),
                            body: response.body.clone(),
                        },
                        def.cache.ttl,
                        &def.cache.tags,
                    );
                }
                Ok(response)
            }
            None => Ok(response.bypass()),
        }
    }

    async fn call_upstream(
        &self,
        snapshot: &PipelineSnapshot,
        route: &CompiledRoute,
        request: &ProxyRequest,
    ) -> RelayResult<ProxyResponse> {
        let def = route.definition();

        let breaker = def
            .breaker
            .enabled
            .then(|| self.breakers.ensure(route.id().clone(), breaker_config(&def.breaker)));

        let credential = match &def.credential {
            Some(name) => match snapshot.credentials.get(name) {
                Some(secret) => Some(secret),
                None => {
                    warn!(route = %route.id(), credential = %name, "configured credential is missing");
                    return Err(RelayError::no_healthy_credential(route.id().clone()));
                }
            },
            None => None,
        };

        let headers = prepare_upstream_headers(&request.headers, def, credential)?;
        let url = upstream_url(def, request);
        let policy = retry_policy(def);
        let idempotent = request.is_idempotent();

        let mut completed: u32 = 0;
        let mut last_err: Option<RelayError> = None;

        loop {
            if let Some(breaker) = &breaker {
                if let Err(rejection) = breaker.try_acquire() {
                    // The breaker opened between attempts; the failure that
                    // tripped it is the better answer for this caller.
                    return Err(last_err.unwrap_or(rejection));
                }
            }

            completed += 1;
            let attempt_started = Instant::now();
            let outcome = self
                .transport
                .send(UpstreamCall {
                    method: request.method.clone(),
                    url: url.clone(),
                    headers: headers.clone(),
                    body: request.body.clone(),
                    timeout: def.timeout,
                })
                .await;
            let attempt_latency = attempt_started.elapsed();

            let err = match outcome {
                Ok(reply) if reply.status.is_server_error() => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure(attempt_latency);
                    }
                    RelayError::upstream_error(route.id().clone(), reply.status)
                }
                Ok(reply) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success(attempt_latency);
                    }
                    let mut headers = reply.headers;
                    sanitize_response_headers(&mut headers);
                    debug!(
                        route = %route.id(),
                        status = reply.status.as_u16(),
                        attempt = completed,
                        "upstream answered"
                    );
                    return Ok(ProxyResponse::upstream(
                        reply.status,
                        headers,
                        reply.body,
                        attempt_latency,
                    ));
                }
                Err(transport_err) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure(attempt_latency);
                    }
                    transport_failure(route.id(), def.timeout, transport_err)
                }
            };

            warn!(route = %route.id(), attempt = completed, error = %err, "upstream attempt failed");

            let retry = err
                .failure_class()
                .is_some_and(|class| policy.should_retry(completed, idempotent, class));
            if !retry {
                return Err(err);
            }
            last_err = Some(err);

            let delay = policy.delay_for_retry(completed);
            debug!(route = %route.id(), retry = completed, delay = ?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
        }
    }

    /// Records the outcome in the stats counters and, for transactions that
    /// reached (or meaningfully tried to reach) the upstream, queues a
    /// usage sample. Admission rejections only touch the counters.
    fn account(
        &self,
        route: &RouteId,
        request: &ProxyRequest,
        result: &RelayResult<ProxyResponse>,
        latency: Duration,
    ) {
        match result {
            Ok(response) => {
                self.stats.record_response(route, response);
                let sample = UsageSample::success(
                    request.id.clone(),
                    route.clone(),
                    request.caller.clone(),
                    response.status.as_u16(),
                    latency,
                    response.cache == CacheStatus::Hit,
                )
                .with_tenant(request.tenant.clone());
                self.usage.publish(sample);
            }
            Err(err) => {
                self.stats.record_failure(Some(route), err);
                if let Some(class) = err.failure_class() {
                    let status = match err {
                        RelayError::UpstreamError { status, .. } => Some(status.as_u16()),
                        _ => None,
                    };
                    let sample = UsageSample::failure(
                        request.id.clone(),
                        route.clone(),
                        request.caller.clone(),
                        class,
                        status,
                        latency,
                    )
                    .with_tenant(request.tenant.clone());
                    self.usage.publish(sample);
                }
            }
        }
    }

    fn limiter_for(&self, route: &RouteId, limit: u32) -> Arc<ConcurrencyLimiter> {
        if let Some(existing) = self.limiters.get(route) {
            if existing.limit() == limit {
                return Arc::clone(existing.value());
            }
        }
        let limiter = Arc::new(ConcurrencyLimiter::new(route.clone(), limit));
        self.limiters.insert(route.clone(), Arc::clone(&limiter));
        limiter
    }

    /// Periodic housekeeping for the shared engines; spawn on its own task.
    pub async fn maintenance_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.throttle.maintain();
        }
    }

    /// Configuration snapshot currently serving.
    #[must_use]
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.state.load().config.clone()
    }

    /// Number of routes in the serving snapshot.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.state.load().routes.len()
    }

    /// The response cache, for admin invalidation and the sweeper task.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// The breaker registry, for the admin surface.
    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// The throttle engine, for stats reporting.
    #[must_use]
    pub fn throttle(&self) -> &ThrottleEngine {
        &self.throttle
    }

    /// Publishing side of the invalidation queue.
    #[must_use]
    pub fn invalidation(&self) -> &InvalidationManager {
        &self.invalidation
    }

    /// Usage reporter, exposing the dropped-sample counter.
    #[must_use]
    pub fn usage(&self) -> &UsageReporter {
        &self.usage
    }

    /// Request counters since startup.
    #[must_use]
    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }
}

fn cache_key_for(
    snapshot: &PipelineSnapshot,
    route: &CompiledRoute,
    request: &ProxyRequest,
) -> Option<String> {
    let policy = &route.definition().cache;
    let eligible = snapshot.config.cache.enabled
        && policy.enabled
        && policy
            .methods
            .iter()
            .any(|method| method.eq_ignore_ascii_case(request.method.as_str()));
    eligible.then(|| cache_key(route.id(), request, &policy.vary_headers))
}

fn upstream_url(route: &EndpointRoute, request: &ProxyRequest) -> String {
    let base = route.upstream_base_url.trim_end_matches('/');
    format!("{base}{}", request.path_and_query())
}

fn transport_failure(route: &RouteId, timeout: Duration, err: TransportError) -> RelayError {
    match err {
        TransportError::Timeout => RelayError::upstream_timeout(route.clone(), timeout),
        TransportError::Connect(detail) | TransportError::Other(detail) => {
            RelayError::upstream_unavailable(route.clone(), detail)
        }
    }
}

fn breaker_targets(routes: &[EndpointRoute]) -> Vec<(RouteId, CircuitBreakerConfig)> {
    routes
        .iter()
        .filter(|route| route.breaker.enabled)
        .map(|route| (RouteId::new(&route.id), breaker_config(&route.breaker)))
        .collect()
}

fn breaker_config(config: &RouteBreakerConfig) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: config.failure_threshold,
        success_threshold: config.success_threshold,
        failure_rate_threshold: config.failure_rate_threshold,
        min_samples: config.min_samples,
        avg_latency_threshold: config.avg_latency_threshold,
        window_size: config.window_size,
        half_open_max_probes: config.half_open_max_probes,
        recovery: recovery_strategy(&config.recovery),
    }
}

fn recovery_strategy(config: &RecoveryConfig) -> RecoveryStrategy {
    match config {
        RecoveryConfig::Immediate => RecoveryStrategy::Immediate,
        RecoveryConfig::FixedTimeout { timeout } => {
            RecoveryStrategy::FixedTimeout { timeout: *timeout }
        }
        RecoveryConfig::ExponentialBackoff {
            min_timeout,
            max_timeout,
            multiplier,
        } => RecoveryStrategy::ExponentialBackoff {
            min_timeout: *min_timeout,
            max_timeout: *max_timeout,
            multiplier: *multiplier,
        },
        RecoveryConfig::Adaptive {
            min_timeout,
            health_threshold,
        } => RecoveryStrategy::Adaptive {
            min_timeout: *min_timeout,
            health_threshold: *health_threshold,
        },
    }
}

fn retry_policy(route: &EndpointRoute) -> RetryPolicy {
    RetryPolicy {
        max_retries: route.max_retries,
        strategy: match route.retry_backoff.strategy {
            RetryStrategy::Fixed => BackoffStrategy::Fixed,
            RetryStrategy::Exponential => BackoffStrategy::Exponential,
        },
        base_delay: route.retry_backoff.base_delay,
        max_delay: route.retry_backoff.max_delay,
        multiplier: route.retry_backoff.multiplier,
        jitter: route.retry_backoff.jitter,
    }
}
