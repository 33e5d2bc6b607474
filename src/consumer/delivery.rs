//! Consumer delivery loop

use super::handler::HandlerSlot;
use crate::broker::{GroupConnection, GroupStreams};
use crate::shutdown::ShutdownState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters maintained by the delivery loop
#[derive(Debug, Default)]
pub struct DeliveryStats {
    handled: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    rebalances: AtomicU64,
}

impl DeliveryStats {
    /// Messages passed to the handler
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Messages dropped because no handler was registered
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Errors reported on the error stream
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Rebalance notifications received
    pub fn rebalances(&self) -> u64 {
        self.rebalances.load(Ordering::Relaxed)
    }
}

pub(super) struct DeliveryLoop {
    pub group: String,
    pub connection: Box<dyn GroupConnection>,
    pub streams: GroupStreams,
    pub handler: Arc<HandlerSlot>,
    pub stats: Arc<DeliveryStats>,
    pub token: CancellationToken,
    pub state: Arc<ShutdownState>,
}

impl DeliveryLoop {
    /// Service errors, notifications and messages until shutdown
    pub(super) async fn run(self) {
        let DeliveryLoop {
            group,
            connection,
            streams,
            handler,
            stats,
            token,
            state,
        } = self;
        let GroupStreams {
            mut errors,
            mut notifications,
            mut messages,
        } = streams;
        let mut errors_open = true;
        let mut notifications_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                err = errors.recv(), if errors_open => match err {
                    Some(err) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        error!(group = %group, "Consumer returned error: {}", err);
                    }
                    None => errors_open = false,
                },
                notification = notifications.recv(), if notifications_open => match notification {
                    Some(notification) => {
                        stats.rebalances.fetch_add(1, Ordering::Relaxed);
                        info!(group = %group, "Rebalanced: {}", notification);
                    }
                    None => notifications_open = false,
                },
                message = messages.recv() => {
                    let Some(message) = message else {
                        warn!(group = %group, "Message stream closed by broker client");
                        break;
                    };
                    debug!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "Consumed message"
                    );

                    match handler.get() {
                        Some(handler) => {
                            handler.handle(&message).await;
                            stats.handled.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            stats.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                topic = %message.topic,
                                partition = message.partition,
                                offset = message.offset,
                                "No message handler registered, dropping message"
                            );
                        }
                    }
                }
            }
        }

        state.begin_shutdown();
        info!(group = %group, "Closing message queue consumer...");
        connection.close();
        state.complete_shutdown();
        info!(group = %group, "Message queue consumer was closed");
    }
}
