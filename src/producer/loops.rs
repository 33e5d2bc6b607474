//! Enqueue and delivery event loops of the producer

use crate::broker::{DeliveryStreams, OutboundMessage, ProducerConnection};
use crate::codec::display_payload;
use crate::shutdown::ShutdownState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolves once `grace` has passed after the token fired
async fn drain_deadline(token: CancellationToken, grace: Duration) {
    token.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Forward queued messages to the broker connection until shutdown.
///
/// Shutdown does not interrupt a hand-off in progress. Messages already
/// accepted by `put` keep flowing to the connection until the queue is empty
/// or the grace period after the signal runs out; only then is the rest
/// dropped and counted.
pub(super) async fn enqueue_loop(
    mut queue: mpsc::Receiver<OutboundMessage>,
    connection: Arc<dyn ProducerConnection>,
    token: CancellationToken,
    state: Arc<ShutdownState>,
    grace: Duration,
) {
    let deadline = drain_deadline(token.clone(), grace);
    tokio::pin!(deadline);
    let mut dropped = 0u64;

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => {
                    debug!("Producer queue closed, all senders dropped");
                    break;
                }
            },
        };

        if !forward(connection.as_ref(), message, &mut deadline).await {
            dropped += 1;
            break;
        }
    }

    state.begin_shutdown();
    info!("Closing message queue producer...");

    // Refuse new messages and hand over what was already accepted
    queue.close();
    if dropped == 0 {
        let mut forwarded = 0usize;
        while let Some(message) = queue.recv().await {
            if !forward(connection.as_ref(), message, &mut deadline).await {
                dropped += 1;
                break;
            }
            forwarded += 1;
        }
        if forwarded > 0 {
            debug!(forwarded, "Drained queued messages before closing");
        }
    }
    while queue.try_recv().is_ok() {
        dropped += 1;
    }

    if dropped > 0 {
        warn!(dropped, grace = ?grace, "Grace period expired, queued messages dropped");
        state.record_dropped(dropped);
    }

    connection.async_close();
    state.complete_shutdown();
    info!("Message queue producer was closed");
}

/// Hand one message to the connection. Returns `false` if the deadline won.
async fn forward<D>(
    connection: &dyn ProducerConnection,
    message: OutboundMessage,
    deadline: &mut std::pin::Pin<&mut D>,
) -> bool
where
    D: std::future::Future<Output = ()>,
{
    let topic = message.topic.clone();
    tokio::select! {
        result = connection.dispatch(message) => {
            if let Err(e) = result {
                error!(topic = %topic, "Failed to hand message to broker client: {}", e);
            }
            true
        }
        _ = deadline.as_mut() => {
            warn!(topic = %topic, "Grace period expired while dispatching");
            false
        }
    }
}

/// Log broker acknowledgements and failures until shutdown
pub(super) async fn event_loop(streams: DeliveryStreams, token: CancellationToken) {
    let DeliveryStreams {
        mut successes,
        mut errors,
    } = streams;
    let mut successes_open = true;
    let mut errors_open = true;

    while successes_open || errors_open {
        tokio::select! {
            _ = token.cancelled() => break,
            report = successes.recv(), if successes_open => match report {
                Some(report) => info!(
                    topic = %report.topic,
                    partition = report.partition,
                    offset = report.offset,
                    payload = %display_payload(&report.payload),
                    "Message delivered"
                ),
                None => successes_open = false,
            },
            failure = errors.recv(), if errors_open => match failure {
                Some(failure) => error!(
                    topic = %failure.topic,
                    payload = %display_payload(&failure.payload),
                    "Message delivery failed: {}",
                    failure.error
                ),
                None => errors_open = false,
            },
        }
    }

    debug!("Producer event loop stopped");
}
