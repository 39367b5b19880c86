use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::proto::comm_exchange_server::{CommExchange, CommExchangeServer};
use crate::proto::{
    BindRequest, BindResponse, Envelope, PollRequest, PollResponse, PublishRequest,
    PublishResponse,
};

/// Backstop against a stalled consumer; the protocol never queues more than a
/// handful of envelopes in normal operation.
const MAX_QUEUE_DEPTH: usize = 10_000;

/// Direct-exchange state: one FIFO queue per bound routing key.
#[derive(Debug, Clone, Default)]
struct ExchangeState {
    queues: Arc<RwLock<HashMap<String, VecDeque<Envelope>>>>,
}

/// gRPC service implementing the exchange. Popping an envelope acknowledges
/// it; there is no redelivery.
#[derive(Debug, Default)]
struct ExchangeService {
    state: ExchangeState,
}

#[tonic::async_trait]
impl CommExchange for ExchangeService {
    async fn bind(
        &self,
        request: Request<BindRequest>,
    ) -> Result<Response<BindResponse>, Status> {
        let key = request.into_inner().routing_key;
        if key.is_empty() {
            return Err(Status::invalid_argument("routing key must not be empty"));
        }
        let mut queues = self.state.queues.write().await;
        queues.entry(key.clone()).or_default();
        tracing::debug!(routing_key = %key, "Queue bound");
        Ok(Response::new(BindResponse {}))
    }

    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> Result<Response<PublishResponse>, Status> {
        let envelope = request
            .into_inner()
            .envelope
            .ok_or_else(|| Status::invalid_argument("missing envelope"))?;

        let mut queues = self.state.queues.write().await;
        let accepted = match queues.get_mut(&envelope.routing_key) {
            Some(queue) if queue.len() >= MAX_QUEUE_DEPTH => {
                tracing::warn!(
                    routing_key = %envelope.routing_key,
                    depth = queue.len(),
                    "Queue full, dropping envelope"
                );
                false
            }
            Some(queue) => {
                queue.push_back(envelope);
                true
            }
            None => {
                tracing::debug!(
                    routing_key = %envelope.routing_key,
                    reply_to = %envelope.reply_to,
                    "No queue bound, dropping envelope"
                );
                false
            }
        };
        Ok(Response::new(PublishResponse { accepted }))
    }

    async fn poll(
        &self,
        request: Request<PollRequest>,
    ) -> Result<Response<PollResponse>, Status> {
        let key = request.into_inner().routing_key;
        let mut queues = self.state.queues.write().await;
        let envelope = queues.get_mut(&key).and_then(|q| q.pop_front());
        Ok(Response::new(PollResponse { envelope }))
    }
}

/// The exchange endpoint, hosted by the master process.
pub struct ExchangeServer {
    addr: SocketAddr,
}

impl ExchangeServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting message exchange");
        Server::builder()
            .add_service(CommExchangeServer::new(ExchangeService::default()))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
