//! Asynchronous usage reporting.
//!
//! Samples are queued on the request path and drained by a pump task, so a
//! slow sink never adds latency to a relayed call. The queue is bounded;
//! when it is full the sample is dropped and counted, mirroring how cache
//! invalidation events are handled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use relay_config::UsageSettings;
use relay_core::UsageSample;

/// Destination for completed-transaction samples.
#[async_trait]
pub trait UsageSink: Send + Sync + fmt::Debug {
    /// Records one sample. Delivery failures are the sink's concern; the
    /// pump does not retry.
    async fn record(&self, sample: &UsageSample);
}

/// Sink writing each sample as one structured log line under the
/// `relay_usage` target, which log routing can split into its own stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUsageSink;

#[async_trait]
impl UsageSink for LogUsageSink {
    async fn record(&self, sample: &UsageSample) {
        match serde_json::to_string(sample) {
            Ok(line) => info!(target: "relay_usage", "{line}"),
            Err(err) => warn!(error = %err, "usage sample not serializable"),
        }
    }
}

/// Publishing half of the usage queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct UsageReporter {
    tx: mpsc::Sender<UsageSample>,
    dropped: Arc<AtomicU64>,
}

impl UsageReporter {
    /// Builds the reporter/pump pair around a bounded queue sized from
    /// `settings`. The pump must be driven on a task via [`UsagePump::run`].
    #[must_use]
    pub fn channel(settings: &UsageSettings, sink: Arc<dyn UsageSink>) -> (Self, UsagePump) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            UsagePump { rx, sink },
        )
    }

    /// Queues a sample. Returns `false` when the queue is full or the pump
    /// is gone; the sample is then dropped and counted.
    pub fn publish(&self, sample: UsageSample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "usage sample dropped");
                false
            }
        }
    }

    /// Samples dropped because the queue was full.
    #[must_use]
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consuming half of the usage queue.
#[derive(Debug)]
pub struct UsagePump {
    rx: mpsc::Receiver<UsageSample>,
    sink: Arc<dyn UsageSink>,
}

impl UsagePump {
    /// Drains the queue until every reporter clone is dropped.
    pub async fn run(mut self) {
        while let Some(sample) = self.rx.recv().await {
            self.sink.record(&sample).await;
        }
        info!("usage pump stopped");
    }
}
