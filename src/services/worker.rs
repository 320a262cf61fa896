//! Long-lived bus consumer.
//!
//! Pulls process-asset jobs with the configured prefetch, runs each through
//! the ingestor, and settles the delivery from the structured outcome:
//! success acks, a retryable failure requeues, an exhausted retry budget is
//! dead-lettered (or dropped when no DLQ is configured). Shutdown is
//! cooperative; the in-flight delivery always settles before the loop exits.

use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::RabbitConfig;
use crate::db::AssetStore;
use crate::error::Result;
use crate::services::bus::{self, DeadLetterMessage, ProcessMessage, Publisher};
use crate::services::ingest::{Ingestor, ProcessOutcome};

/// How a delivery is settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// Settlement decision for a processing outcome.
pub fn dispose(outcome: &ProcessOutcome, dlq_configured: bool) -> Disposition {
    if outcome.success {
        Disposition::Ack
    } else if outcome.exceeded_retries {
        if dlq_configured {
            Disposition::DeadLetter
        } else {
            Disposition::Ack
        }
    } else {
        Disposition::Requeue
    }
}

pub struct Worker {
    ingestor: Arc<Ingestor>,
    db: AssetStore,
    publisher: Arc<Publisher>,
    config: RabbitConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        ingestor: Arc<Ingestor>,
        db: AssetStore,
        publisher: Arc<Publisher>,
        config: RabbitConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ingestor,
            db,
            publisher,
            config,
            shutdown_rx,
        }
    }

    /// Consume until shutdown. Transport errors on the stream bubble out;
    /// the process supervisor restarts the worker.
    pub async fn run(&mut self) -> Result<()> {
        let (_connection, mut consumer) = bus::create_consumer(&self.config).await?;
        info!(queue = %self.config.queue, "worker consuming");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("shutdown signal received, stopping consumer");
                        break;
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            if let Err(e) = self.handle_delivery(delivery).await {
                                error!(error = %e, "failed to settle delivery");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "consumer transport error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        let message: ProcessMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable job payload, requeueing");
                delivery.nack(requeue()).await?;
                return Ok(());
            }
        };

        let outcome = match self
            .ingestor
            .process_asset(
                &self.db,
                message.asset_id,
                self.config.retry_max,
                message.temp_file_path.as_deref(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(asset_id = message.asset_id, error = %e, "dispatch failed, requeueing");
                delivery.nack(requeue()).await?;
                return Ok(());
            }
        };

        match dispose(&outcome, self.config.dlq.is_some()) {
            Disposition::Ack => {
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Disposition::Requeue => {
                warn!(
                    asset_id = message.asset_id,
                    attempts = outcome.attempts,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "processing failed, requeueing"
                );
                delivery.nack(requeue()).await?;
            }
            Disposition::DeadLetter => {
                let dead = DeadLetterMessage {
                    asset_id: message.asset_id,
                    error: outcome
                        .error
                        .unwrap_or_else(|| "unknown error".to_string()),
                    attempts: outcome.attempts,
                    failed_at: Utc::now(),
                };
                match self.publisher.publish_dead_letter(&dead).await {
                    Ok(()) => info!(asset_id = message.asset_id, "job dead-lettered"),
                    Err(e) => {
                        // Retries are exhausted either way; dropping beats an
                        // endless redelivery loop.
                        error!(asset_id = message.asset_id, error = %e, "dead-letter publish failed, dropping job");
                    }
                }
                delivery.ack(BasicAckOptions::default()).await?;
            }
        }
        Ok(())
    }
}

fn requeue() -> BasicNackOptions {
    BasicNackOptions {
        requeue: true,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool, exceeded: bool) -> ProcessOutcome {
        ProcessOutcome {
            success,
            exceeded_retries: exceeded,
            error: (!success).then(|| "boom".to_string()),
            attempts: if exceeded { 3 } else { 1 },
        }
    }

    #[test]
    fn success_acks() {
        assert_eq!(dispose(&outcome(true, false), true), Disposition::Ack);
        assert_eq!(dispose(&outcome(true, false), false), Disposition::Ack);
    }

    #[test]
    fn retryable_failure_requeues() {
        assert_eq!(dispose(&outcome(false, false), true), Disposition::Requeue);
        assert_eq!(dispose(&outcome(false, false), false), Disposition::Requeue);
    }

    #[test]
    fn exhausted_failure_dead_letters_when_configured() {
        assert_eq!(
            dispose(&outcome(false, true), true),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn exhausted_failure_drops_without_dlq() {
        assert_eq!(dispose(&outcome(false, true), false), Disposition::Ack);
    }
}
