//! Uevent Listener
//!
//! One task reads and decodes messages and feeds a bounded queue; a fixed
//! pool of workers drains the queue and runs the registered handler. Events
//! for different devices are handled concurrently with no ordering between
//! them.

use super::decoder;
use super::event::UEvent;
use super::socket::MessageSource;
use crate::config::ListenerConfig;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Handler
// =============================================================================

/// Consumer of decoded block-device events
#[async_trait]
pub trait UeventHandler: Send + Sync + 'static {
    /// Handle one event to completion
    async fn handle(&self, event: UEvent) -> Result<()>;
}

// =============================================================================
// Listener
// =============================================================================

/// Reads uevents from a message source and dispatches them to workers
pub struct Listener<S> {
    source: S,
    config: ListenerConfig,
}

impl<S: MessageSource> Listener<S> {
    /// Create a new listener
    pub fn new(source: S, config: ListenerConfig) -> Self {
        Self { source, config }
    }

    /// Run until `token` is cancelled or the source fails
    ///
    /// Non-block-device messages are skipped; any other decode error stops
    /// the listener and is returned. Events already queued when the read
    /// loop fails are still handled; cancellation drops them. Workers are
    /// always joined and the source dropped before returning.
    pub async fn run<H: UeventHandler>(
        mut self,
        token: CancellationToken,
        handler: Arc<H>,
    ) -> Result<()> {
        let threadiness = self.config.threadiness.max(1);
        let (tx, rx) = mpsc::channel::<UEvent>(self.config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for id in 0..threadiness {
            workers.spawn(worker_loop(
                id,
                rx.clone(),
                handler.clone(),
                token.clone(),
            ));
        }
        info!("Uevent listener started with {} workers", threadiness);

        let result = self.read_loop(&token, &tx).await;

        // closing the queue lets the workers drain it and exit
        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("uevent worker terminated abnormally: {}", e);
            }
        }

        match &result {
            Ok(()) => info!("Uevent listener stopped"),
            Err(e) => error!("Uevent listener failed: {}", e),
        }
        result
    }

    async fn read_loop(&mut self, token: &CancellationToken, tx: &mpsc::Sender<UEvent>) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                msg = self.source.next_message() => msg?,
            };

            let event = match decoder::decode(&msg) {
                Ok(event) => event,
                Err(Error::NonBlockDevice { subsystem }) => {
                    debug!(subsystem = %subsystem, "skipping non-block uevent");
                    continue;
                }
                Err(e) => return Err(e),
            };

            metrics::record_uevent(event.action.as_str());
            debug!(device = %event.name(), action = %event.action, "uevent received");

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                sent = tx.send(event) => {
                    if sent.is_err() {
                        return Err(Error::Internal("uevent queue closed".into()));
                    }
                }
            }
        }
    }
}

async fn worker_loop<H: UeventHandler>(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<UEvent>>>,
    handler: Arc<H>,
    token: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                event = rx.recv() => event,
            }
        };
        let Some(event) = next else { break };

        let device = event.name().to_string();
        let action = event.action;
        if let Err(e) = handler.handle(event).await {
            match e.action() {
                ErrorAction::NoRequeue => {
                    error!(worker = id, device = %device, action = %action, "uevent needs attention: {}", e)
                }
                _ => warn!(worker = id, device = %device, action = %action, "failed to handle uevent: {}", e),
            }
        }
    }
    debug!(worker = id, "uevent worker exiting");
}
