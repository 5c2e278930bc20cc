//! Bus consumers for the two task queues.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Dispatcher, FeedbackMessage, InboundTask};
use crate::bus::{Acknowledgement, Envelope, MessageHandler};

/// Consumes `tasks.inbound`.
pub struct InboundHandler {
    dispatcher: Arc<Dispatcher>,
}

impl InboundHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle(&self, envelope: &Envelope) -> Acknowledgement {
        let inbound: InboundTask = match serde_json::from_value(envelope.body.clone()) {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::error!("Malformed inbound message {}: {}", envelope.id, err);
                return Acknowledgement::Nack;
            }
        };

        match self.dispatcher.process_request(inbound).await {
            Ok(()) => Acknowledgement::Ack,
            Err(err) => {
                tracing::error!("Inbound message {} not processed: {}", envelope.id, err);
                Acknowledgement::Nack
            }
        }
    }
}

/// Consumes `tasks.feedback`.
pub struct FeedbackHandler {
    dispatcher: Arc<Dispatcher>,
}

impl FeedbackHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageHandler for FeedbackHandler {
    async fn handle(&self, envelope: &Envelope) -> Acknowledgement {
        let feedback: FeedbackMessage = match serde_json::from_value(envelope.body.clone()) {
            Ok(feedback) => feedback,
            Err(err) => {
                tracing::error!("Malformed feedback message {}: {}", envelope.id, err);
                return Acknowledgement::Nack;
            }
        };

        match self.dispatcher.apply_feedback(&feedback).await {
            Ok(()) => Acknowledgement::Ack,
            Err(err) => {
                tracing::error!(
                    "Feedback for task {} not applied: {}",
                    feedback.task_id,
                    err
                );
                Acknowledgement::Nack
            }
        }
    }
}
