use tonic::transport::Channel;

use crate::comm::{Message, MASTER_KEY};
use crate::error::Result;
use crate::proto::comm_exchange_client::CommExchangeClient;
use crate::proto::{BindRequest, Envelope, PollRequest, PublishRequest};

/// A live link to the exchange, bound to one receive queue.
///
/// Workers bind the queue for their own id and address the master via
/// [`MASTER_KEY`]; the master binds [`MASTER_KEY`] and addresses workers by
/// id. The supervisor owns reconnection; any error returned here simply
/// downgrades the caller to "disconnected".
pub struct CommConnection {
    client: CommExchangeClient<Channel>,
    own_key: String,
}

impl CommConnection {
    /// Connect to the exchange and bind the queue for `own_key`.
    pub async fn connect(endpoint: &str, own_key: &str) -> Result<Self> {
        let mut client = CommExchangeClient::connect(endpoint.to_string()).await?;
        client
            .bind(BindRequest {
                routing_key: own_key.to_string(),
            })
            .await?;
        tracing::debug!(endpoint, routing_key = own_key, "Exchange queue bound");
        Ok(Self {
            client,
            own_key: own_key.to_string(),
        })
    }

    /// Master-side connection: binds the fixed `master` queue.
    pub async fn connect_master(endpoint: &str) -> Result<Self> {
        Self::connect(endpoint, MASTER_KEY).await
    }

    pub fn own_key(&self) -> &str {
        &self.own_key
    }

    /// Publish `msg` to the queue bound to `to`. Every message carries this
    /// connection's key as `reply_to`.
    pub async fn send(&mut self, to: &str, msg: &Message) -> Result<()> {
        tracing::debug!(from = %self.own_key, to, tag = msg.tag(), "Sending message");
        let response = self
            .client
            .publish(PublishRequest {
                envelope: Some(Envelope {
                    routing_key: to.to_string(),
                    reply_to: self.own_key.clone(),
                    body: msg.to_wire(),
                }),
            })
            .await?;
        if !response.into_inner().accepted {
            // Tolerated: protocol steps are idempotent and re-synced via
            // STATUS_CHECK / ALIVE_REQUEST.
            tracing::warn!(to, tag = msg.tag(), "Message dropped by exchange");
        }
        Ok(())
    }

    /// Non-blocking poll of this connection's queue. Returns the sender's key
    /// and the decoded message, or `None` when the queue is empty. Malformed
    /// envelopes are logged, dropped, and the next envelope is polled.
    pub async fn recv(&mut self) -> Result<Option<(String, Message)>> {
        loop {
            let response = self
                .client
                .poll(PollRequest {
                    routing_key: self.own_key.clone(),
                })
                .await?;
            let Some(envelope) = response.into_inner().envelope else {
                return Ok(None);
            };
            match Message::from_wire(&envelope.body) {
                Ok(msg) => {
                    tracing::debug!(from = %envelope.reply_to, tag = msg.tag(), "Received message");
                    return Ok(Some((envelope.reply_to, msg)));
                }
                Err(e) => {
                    tracing::warn!(
                        from = %envelope.reply_to,
                        body = %envelope.body,
                        error = %e,
                        "Dropping malformed message"
                    );
                }
            }
        }
    }
}
