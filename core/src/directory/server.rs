//! Directory runner: binds a [`DirectoryService`] to a transport

use super::service::DirectoryService;
use crate::message::{decode_envelope, encode_envelope};
use crate::topic::{self, any_user};
use crate::transport::{Delivery, DeliveryReceiver, Transport, TransportError};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Request channels the directory listens on
pub const REQUEST_ACTIONS: [&str; 5] = [
    topic::REGISTER,
    topic::GET_ADDRESS,
    topic::GET_ADDRESS_ONLY,
    topic::SEND_MESSAGE,
    topic::DISCONNECT,
];

pub struct DirectoryServer {
    service: Arc<DirectoryService>,
}

impl DirectoryServer {
    pub fn new(service: Arc<DirectoryService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<DirectoryService> {
        &self.service
    }

    /// Subscribe to every request channel and process deliveries one at a
    /// time until `shutdown` fires or the inbound stream ends.
    ///
    /// A closed inbound stream means the transport went away and is
    /// reported as [`TransportError::Closed`].
    pub async fn run(
        &self,
        transport: Arc<dyn Transport>,
        mut inbound: DeliveryReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        for action in REQUEST_ACTIONS {
            transport.subscribe(&any_user(action)).await?;
        }
        info!("Directory online ({} channels)", REQUEST_ACTIONS.len());

        loop {
            tokio::select! {
                delivery = inbound.recv() => match delivery {
                    Some(delivery) => self.process(transport.as_ref(), delivery).await,
                    None => {
                        warn!("Transport closed; directory stopping");
                        return Err(TransportError::Closed);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for action in REQUEST_ACTIONS {
            let _ = transport.unsubscribe(&any_user(action)).await;
        }
        info!("Directory stopped");
        Ok(())
    }

    /// Decode, dispatch and publish the replies for one delivery.
    ///
    /// Bad input is logged and dropped; publish failures are logged and the
    /// loop keeps going.
    pub async fn process(&self, transport: &dyn Transport, delivery: Delivery) {
        let envelope = match decode_envelope(&delivery.topic, &delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message on {}: {}", delivery.topic, e);
                self.service.record_malformed();
                return;
            }
        };
        debug!("{} on {}", envelope.kind(), delivery.topic);

        for reply in self.service.handle(envelope) {
            let (topic, payload) = match encode_envelope(&reply) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("Could not encode {} reply: {}", reply.kind(), e);
                    continue;
                }
            };
            if let Err(e) = transport.publish(&topic, payload).await {
                warn!("Publish to {} failed: {}", topic, e);
            }
        }
    }
}
