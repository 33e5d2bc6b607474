//! Message handler trait and adapters

use crate::broker::InboundMessage;
use crate::codec;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Trait for handling consumed messages
///
/// The delivery loop awaits `handle` before taking the next message, so a
/// slow handler slows consumption. A panic inside `handle` ends the loop.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a single message
    async fn handle(&self, message: &InboundMessage);

    /// Get handler name for logs
    fn name(&self) -> &str {
        "MessageHandler"
    }
}

/// Adapter for a plain `Fn(&[u8])` closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure over the raw payload as a [`MessageHandler`]
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    async fn handle(&self, message: &InboundMessage) {
        (self.f)(&message.payload[..]);
    }

    fn name(&self) -> &str {
        "FnHandler"
    }
}

/// Adapter that decodes the JSON payload before calling the closure.
///
/// Payloads that fail to decode are logged and skipped.
pub struct JsonHandler<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

/// Wrap a closure over a decoded value as a [`MessageHandler`]
pub fn json_handler<T, F>(f: F) -> JsonHandler<T, F>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    JsonHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<T, F> MessageHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    async fn handle(&self, message: &InboundMessage) {
        match codec::decode::<T>(&message.payload) {
            Ok(value) => (self.f)(value),
            Err(e) => warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Skipping undecodable message: {}",
                e
            ),
        }
    }

    fn name(&self) -> &str {
        "JsonHandler"
    }
}

/// Holds the single registered handler
#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl HandlerSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot holding `handler`
    pub fn with(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler: RwLock::new(Some(handler)),
        }
    }

    /// Set the handler. Fails if one is already set.
    pub fn set(&self, handler: Arc<dyn MessageHandler>) -> QueueResult<()> {
        let mut slot = self.handler.write();
        if slot.is_some() {
            return Err(QueueError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Current handler, if any
    pub fn get(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().clone()
    }

    /// Whether a handler is present
    pub fn is_set(&self) -> bool {
        self.handler.read().is_some()
    }
}
