//! Event-driven cache invalidation.
//!
//! Producers publish [`InvalidationEvent`]s onto a bounded queue; a single
//! worker drains the queue in batches and applies whatever configured rules
//! match each event. Publishing never blocks the request path: when the
//! queue is full the event is dropped and counted, on the theory that a
//! stale cache entry expires on its own anyway.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_config::{InvalidationRuleConfig, InvalidationSettings};
use relay_core::RouteId;

use crate::store::ResponseCache;

/// Something happened that may make cached responses stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Event kind matched against rule triggers, e.g. `credential.rotated`.
    pub kind: String,
    /// Identifier substituted for `{resource}` in rule tags and patterns.
    #[serde(default)]
    pub resource: Option<String>,
}

impl InvalidationEvent {
    /// Creates an event with no resource identifier.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            resource: None,
        }
    }

    /// Attaches the resource identifier referenced by templated rules.
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Publishing half of the invalidation queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InvalidationManager {
    tx: mpsc::Sender<InvalidationEvent>,
    rules: Arc<ArcSwap<Vec<InvalidationRuleConfig>>>,
    dropped: Arc<AtomicU64>,
}

impl InvalidationManager {
    /// Builds the manager/worker pair around a bounded queue sized from
    /// `settings`. The worker must be driven on a task via
    /// [`InvalidationWorker::run`].
    #[must_use]
    pub fn channel(
        settings: &InvalidationSettings,
        cache: Arc<ResponseCache>,
    ) -> (Self, InvalidationWorker) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let rules = Arc::new(ArcSwap::from_pointee(settings.rules.clone()));
        let manager = Self {
            tx,
            rules: Arc::clone(&rules),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let worker = InvalidationWorker {
            rx,
            cache,
            rules,
            batch_size: settings.batch_size.max(1),
        };
        (manager, worker)
    }

    /// Queues an event for the worker. Returns `false` when the queue is
    /// full or the worker is gone; the event is then dropped and counted.
    pub fn publish(&self, event: InvalidationEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "invalidation event dropped");
                false
            }
        }
    }

    /// Swaps in a new rule set; queued and future events see it.
    pub fn update_rules(&self, rules: Vec<InvalidationRuleConfig>) {
        let count = rules.len();
        self.rules.store(Arc::new(rules));
        info!(rules = count, "invalidation rules updated");
    }

    /// Events dropped because the queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consuming half of the invalidation queue.
#[derive(Debug)]
pub struct InvalidationWorker {
    rx: mpsc::Receiver<InvalidationEvent>,
    cache: Arc<ResponseCache>,
    rules: Arc<ArcSwap<Vec<InvalidationRuleConfig>>>,
    batch_size: usize,
}

impl InvalidationWorker {
    /// Drains the queue until every manager clone is dropped. Events are
    /// pulled in batches so a burst of rotations is applied in one pass.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let mut batch = Vec::with_capacity(self.batch_size);
            batch.push(event);
            while batch.len() < self.batch_size {
                match self.rx.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }
            for event in &batch {
                self.apply(event);
            }
        }
        debug!("invalidation worker stopped");
    }

    fn apply(&self, event: &InvalidationEvent) {
        let rules = self.rules.load();
        let mut matched = 0_usize;
        let mut removed = 0_usize;

        for rule in rules.iter().filter(|r| r.enabled && r.trigger == event.kind) {
            matched += 1;
            if rule.flush_all {
                removed += self.cache.invalidate_all();
                continue;
            }
            for tag in &rule.tags {
                match resolve_template(tag, event.resource.as_deref()) {
                    Some(tag) => removed += self.cache.invalidate_tag(&tag),
                    None => warn!(
                        rule = %rule.id,
                        kind = %event.kind,
                        "templated tag skipped, event carries no resource"
                    ),
                }
            }
            if let Some(pattern) = &rule.pattern {
                match resolve_template(pattern, event.resource.as_deref()) {
                    Some(pattern) => match self.cache.invalidate_pattern(&pattern) {
                        Ok(count) => removed += count,
                        Err(err) => {
                            warn!(rule = %rule.id, error = %err, "invalidation pattern rejected");
                        }
                    },
                    None => warn!(
                        rule = %rule.id,
                        kind = %event.kind,
                        "templated pattern skipped, event carries no resource"
                    ),
                }
            }
            if let Some(route) = &rule.route {
                removed += self.cache.invalidate_route(&RouteId::new(route.as_str()));
            }
        }

        if matched > 0 {
            info!(kind = %event.kind, matched, removed, "invalidation event applied");
        } else {
            debug!(kind = %event.kind, "invalidation event matched no rules");
        }
    }
}

/// Substitutes `{resource}` in a rule template. Returns `None` when the
/// template needs a resource the event does not carry.
fn resolve_template(template: &str, resource: Option<&str>) -> Option<String> {
    if template.contains("{resource}") {
        resource.map(|r| template.replace("{resource}", r))
    } else {
        Some(template.to_owned())
    }
}
