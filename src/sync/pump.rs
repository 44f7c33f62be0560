//! Forwards outgoing change messages onto a batch stream

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};

use super::message::ChangeMessage;
use super::outgoing::OutgoingChangeProcessor;
use crate::error::ShardResult;
use crate::stream::{BatchSender, TransactionId};

pub struct ChangePump {
    receiver: Mutex<UnboundedReceiver<ChangeMessage>>,
    sender: Arc<dyn BatchSender<ChangeMessage>>,
}

impl ChangePump {
    /// Subscribe to `source` and forward into `sender`
    pub fn new(
        source: &OutgoingChangeProcessor,
        sender: Arc<dyn BatchSender<ChangeMessage>>,
    ) -> Self {
        Self {
            receiver: Mutex::new(source.subscribe()),
            sender,
        }
    }

    pub fn sender(&self) -> &Arc<dyn BatchSender<ChangeMessage>> {
        &self.sender
    }

    /// Send every message emitted so far as one batch; returns how many
    pub async fn pump_available(&self) -> ShardResult<usize> {
        let mut pending = Vec::new();
        {
            let mut receiver = self.receiver.lock().await;
            while let Ok(message) = receiver.try_recv() {
                pending.push(message);
            }
        }
        let count = pending.len();
        if count > 0 {
            self.sender.send_batch(pending).await?;
            self.sender.flush().await?;
            debug!("Forwarded {} change messages", count);
        }
        Ok(count)
    }

    /// Forward everything emitted so far inside one transaction
    pub async fn forward_in_transaction(
        &self,
        transaction: Option<TransactionId>,
    ) -> ShardResult<TransactionId> {
        let id = transaction.unwrap_or_default();
        self.sender.start_transaction(id).await?;
        self.pump_available().await?;
        self.sender.end_transaction(id).await?;
        Ok(id)
    }

    /// Forward messages as they arrive until shutdown or the source is dropped
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> ShardResult<()> {
        info!("Change pump started");
        let mut receiver = self.receiver.lock().await;
        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(message) = message else {
                        info!("Change source dropped, stopping pump");
                        break;
                    };
                    let mut batch = vec![message];
                    while let Ok(next) = receiver.try_recv() {
                        batch.push(next);
                    }
                    if let Err(e) = self.sender.send_batch(batch).await {
                        error!("Change pump failed to send: {}", e);
                        return Err(e);
                    }
                    self.sender.flush().await?;
                }

                _ = &mut shutdown => {
                    info!("Change pump shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}
