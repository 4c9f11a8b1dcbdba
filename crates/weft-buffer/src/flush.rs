//! Periodic background flush of the result buffer.

use crate::buffer::ResultBuffer;
use crate::sink::ResultSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle for the periodic flush loop; dropping it does not stop the loop,
/// call [`PeriodicFlush::stop`].
pub struct PeriodicFlush {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PeriodicFlush {
    /// Spawn a loop that checks the sink's connectivity hint every `interval`
    /// and flushes when it reports connected. Per-iteration errors are logged
    /// and do not end the loop.
    pub fn start(
        buffer: Arc<ResultBuffer>,
        sink: Arc<dyn ResultSink>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            tracing::info!(
                event = "weft.buffer.periodic_flush_started",
                interval_s = interval.as_secs(),
                "periodic flush loop started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    return;
                }

                if sink.is_connected().await {
                    if let Err(err) = buffer.flush(sink.as_ref()).await {
                        tracing::warn!(
                            event = "weft.buffer.periodic_flush_error",
                            error = %err,
                            "periodic flush pass failed"
                        );
                    }
                } else {
                    tracing::debug!(
                        event = "weft.buffer.periodic_flush_skipped",
                        "sink not connected; skipping flush"
                    );
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        });

        Self { shutdown_tx, join }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
        tracing::info!(
            event = "weft.buffer.periodic_flush_stopped",
            "periodic flush loop stopped"
        );
    }
}
