//! Online dispatch worker.
//!
//! The only task that performs network I/O. It takes envelopes from the
//! [`DispatchQueue`] one at a time, sends them, and hands the outcome to the
//! envelope's callback. It never retries; retry decisions belong to the
//! callback.

use crate::envelope::{AttemptResult, DeliveryStatus, RequestEnvelope};
use crate::error::TransportError;
use crate::features::StaticFeatures;
use crate::queue::DispatchQueue;
use crate::transport::Transport;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Single consumer of the online queue.
pub struct OnlineWorker {
    queue: Arc<DispatchQueue>,
    transport: Arc<dyn Transport>,
    features: Arc<RwLock<StaticFeatures>>,
}

impl OnlineWorker {
    pub fn new(
        queue: Arc<DispatchQueue>,
        transport: Arc<dyn Transport>,
        features: Arc<RwLock<StaticFeatures>>,
    ) -> Self {
        Self {
            queue,
            transport,
            features,
        }
    }

    /// Spawn the drain loop. It exits once the queue is closed.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Online dispatch worker started");
            while let Some(envelope) = self.queue.next().await {
                self.dispatch(envelope).await;
            }
            debug!("Online dispatch worker stopped");
        })
    }

    async fn dispatch(&self, envelope: RequestEnvelope) {
        let priority = envelope.priority();
        let (url, params, callback) = envelope.into_parts();
        let params = self.features.read().merge_into(&params);

        let redacted = Value::Object(curio_observability::redact_params(&params));
        debug!(url = %url, priority = ?priority, params = %redacted, "Dispatching request");

        let result = match self.transport.send(&url, &params).await {
            Ok(response) => AttemptResult::new(DeliveryStatus::Http(response.status), response.body),
            Err(TransportError::NoNetwork) => AttemptResult::new(DeliveryStatus::NoNetwork, None),
            Err(error) => {
                warn!(url = %url, error = %error, "Request failed before reaching the server");
                AttemptResult::new(DeliveryStatus::TransportFailure(error.to_string()), None)
            }
        };

        debug!(url = %url, status = %result.status, "Request completed");

        if let Some(callback) = callback {
            callback.on_result(&result);
        }
    }
}
