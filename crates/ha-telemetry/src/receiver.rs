//! gRPC endpoint accepting the router's telemetry dial-out stream.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::Stream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use ha_common::{DisconnectReason, VrrpEvent};

use crate::decode::{self, PayloadError, VRRP_ENCODING_PATH};
use crate::proto::mdt_dialout::g_rpc_mdt_dialout_server::{GRpcMdtDialout, GRpcMdtDialoutServer};
use crate::proto::mdt_dialout::MdtDialoutArgs;

/// Keepalive ping interval on the dial-out connection. Short, to detect
/// loss of the peer quickly and reset session state.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for a keepalive ack before treating the connection
/// as lost.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on the remembered unexpected encoding paths, to cap memory if a
/// peer streams many distinct paths.
const MAX_REMEMBERED_PATHS: usize = 10;

/// Callbacks invoked by the telemetry endpoint.
///
/// Events from one stream are delivered from a single task in wire order,
/// and none are delivered after `on_disconnect` returns. Implementations
/// must not block.
pub trait TelemetryHandler: Send + Sync + 'static {
    /// A dial-out stream was accepted.
    fn on_connect(&self, peer: &str);

    /// One VRRP role observation, in wire order.
    fn handle_event(&self, event: VrrpEvent);

    /// The active stream ended.
    fn on_disconnect(&self, reason: DisconnectReason);
}

/// Errors from the telemetry endpoint.
#[derive(Debug, Error)]
pub enum TelemetryServerError {
    #[error("failed to bind telemetry listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("telemetry server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// The telemetry dial-out server.
///
/// Binding and serving are split so that a bind failure can be reported
/// during initialization, before the app commits to running.
pub struct TelemetryServer {
    listener: TcpListener,
    service: DialoutService,
}

impl TelemetryServer {
    /// Bind the listener. The handler is not invoked until [`Self::serve`].
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn TelemetryHandler>,
    ) -> Result<Self, TelemetryServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service: DialoutService::new(handler),
        })
    }

    /// The bound address, useful when binding to an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr, TelemetryServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve dial-out streams until the process exits.
    ///
    /// The transport is plaintext; the surrounding network fabric is
    /// expected to provide confidentiality.
    pub async fn serve(self) -> Result<(), TelemetryServerError> {
        let addr = self.local_addr()?;
        info!(%addr, "Listening for telemetry dial-out");
        Server::builder()
            .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
            .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
            .add_service(GRpcMdtDialoutServer::new(self.service))
            .serve_with_incoming(TcpListenerStream::new(self.listener))
            .await?;
        Ok(())
    }
}

/// Owns the single-stream slot for the lifetime of one dial-out stream.
///
/// Delivers `on_disconnect` exactly once and releases the slot, whether the
/// stream ends normally or the handler future is dropped by a severed
/// connection.
struct StreamGuard {
    flag: Arc<AtomicBool>,
    handler: Arc<dyn TelemetryHandler>,
    peer: String,
    done: bool,
}

impl StreamGuard {
    fn try_acquire(
        flag: &Arc<AtomicBool>,
        handler: Arc<dyn TelemetryHandler>,
        peer: String,
    ) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            flag: Arc::clone(flag),
            handler,
            peer,
            done: false,
        })
    }

    fn finish(mut self, reason: DisconnectReason) {
        self.complete(reason);
    }

    fn complete(&mut self, reason: DisconnectReason) {
        if self.done {
            return;
        }
        self.done = true;
        match reason {
            DisconnectReason::ClosedByPeer => {
                info!(peer = %self.peer, "Connection closed by gRPC peer");
            }
            DisconnectReason::TransportLost => {
                info!(peer = %self.peer, "Connection lost with gRPC peer");
            }
        }
        self.handler.on_disconnect(reason);
        self.flag.store(false, Ordering::Release);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.complete(DisconnectReason::TransportLost);
    }
}

#[derive(Clone)]
struct DialoutService {
    handler: Arc<dyn TelemetryHandler>,
    stream_active: Arc<AtomicBool>,
    unexpected_paths: Arc<Mutex<VecDeque<String>>>,
}

impl DialoutService {
    fn new(handler: Arc<dyn TelemetryHandler>) -> Self {
        Self {
            handler,
            stream_active: Arc::new(AtomicBool::new(false)),
            unexpected_paths: Arc::new(Mutex::new(VecDeque::with_capacity(
                MAX_REMEMBERED_PATHS,
            ))),
        }
    }

    /// Consume the request stream, delivering observations as they arrive.
    async fn process_stream(
        &self,
        mut stream: Streaming<MdtDialoutArgs>,
        peer: &str,
    ) -> DisconnectReason {
        loop {
            match stream.message().await {
                Ok(Some(msg)) => self.handle_msg(&msg),
                Ok(None) => return DisconnectReason::ClosedByPeer,
                Err(status) => {
                    debug!(peer = %peer, error = %status, "Telemetry stream error");
                    return DisconnectReason::TransportLost;
                }
            }
        }
    }

    /// Handle one dial-out message.
    fn handle_msg(&self, msg: &MdtDialoutArgs) {
        let telemetry = match decode::parse_payload(&msg.data) {
            Ok(telemetry) => telemetry,
            Err(PayloadError::Json) => {
                warn!(
                    "Ignoring message with JSON payload, \
                     only self-describing-gpb encoding is supported"
                );
                return;
            }
            Err(err) => {
                error!(req_id = msg.req_id, error = %err, "Failed to decode telemetry message");
                return;
            }
        };

        if telemetry.encoding_path == VRRP_ENCODING_PATH {
            if telemetry.data_gpbkv.is_empty() {
                warn!(
                    path = %telemetry.encoding_path,
                    "Ignoring telemetry message without gpbkv data, \
                     only self-describing-gpb encoding is supported"
                );
                return;
            }
            for event in decode::vrrp_events(&telemetry) {
                self.handler.handle_event(event);
            }
        } else {
            self.note_unexpected_path(&telemetry.encoding_path);
        }
    }

    /// Log an unexpected path once; remember it so repeats stay quiet.
    fn note_unexpected_path(&self, path: &str) {
        let mut seen = self
            .unexpected_paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if seen.iter().any(|p| p == path) {
            return;
        }
        warn!(
            path = %path,
            "Received unexpected telemetry message \
             (subsequent messages on this path will be silently dropped)"
        );
        if seen.len() == MAX_REMEMBERED_PATHS {
            seen.pop_front();
        }
        seen.push_back(path.to_string());
    }
}

#[tonic::async_trait]
impl GRpcMdtDialout for DialoutService {
    type MdtDialoutStream =
        Pin<Box<dyn Stream<Item = Result<MdtDialoutArgs, Status>> + Send + 'static>>;

    async fn mdt_dialout(
        &self,
        request: Request<Streaming<MdtDialoutArgs>>,
    ) -> Result<Response<Self::MdtDialoutStream>, Status> {
        let peer = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        // Only the paired router instance is expected to dial out; a
        // second concurrent stream is refused rather than interleaved.
        let Some(guard) = StreamGuard::try_acquire(
            &self.stream_active,
            Arc::clone(&self.handler),
            peer.clone(),
        ) else {
            warn!(peer = %peer, "Refusing telemetry stream, another stream is already active");
            return Err(Status::resource_exhausted(
                "a telemetry stream is already active",
            ));
        };

        info!(peer = %peer, "Connection established with gRPC peer");
        self.handler.on_connect(&peer);

        // Process in-line: the RPC does not complete until the peer's
        // stream ends, matching dial-out semantics. Nothing is ever sent
        // in the response direction.
        let reason = self.process_stream(request.into_inner(), &peer).await;
        guard.finish(reason);

        Ok(Response::new(Box::pin(tokio_stream::empty())))
    }
}
