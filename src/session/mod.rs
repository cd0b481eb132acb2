use crate::correlator::{CommandOutcome, Correlator, RequestSink};
use crate::model::{ConnectionState, Intent, LinkStatus, RecordingState};
use crate::protocol::{self, Inbound, RequestType};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub command_timeout: Duration,
    /// How long a session may sit in `Identifying` before it is dropped.
    pub identify_timeout: Duration,
    pub sync_record_status: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            identify_timeout: Duration::from_secs(5),
            sync_record_status: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRejected {
    NotReady(ConnectionState),
    ChannelClosed,
}

impl fmt::Display for CommandRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady(state) => write!(f, "connection is {state}, not ready"),
            Self::ChannelClosed => write!(f, "connection writer is gone"),
        }
    }
}

impl std::error::Error for CommandRejected {}

#[derive(Debug)]
pub enum TransportError {
    Connect(WsError),
    ConnectTimeout(Duration),
    IdentifyTimeout(Duration),
    Io(WsError),
    ClosedByPeer { code: Option<u16>, reason: String },
    StreamEnded,
    Superseded,
    InvalidState(ConnectionState),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(err) => write!(f, "connect failed: {err}"),
            Self::ConnectTimeout(limit) => write!(f, "connect timed out after {limit:?}"),
            Self::IdentifyTimeout(limit) => {
                write!(f, "server did not confirm identify within {limit:?}")
            }
            Self::Io(err) => write!(f, "websocket error: {err}"),
            Self::ClosedByPeer { code, reason } => match code {
                Some(code) => write!(f, "server closed the connection ({code}): {reason}"),
                None => write!(f, "server closed the connection"),
            },
            Self::StreamEnded => write!(f, "connection ended without a close frame"),
            Self::Superseded => write!(f, "session replaced by a newer one"),
            Self::InvalidState(state) => write!(f, "session cannot open from state {state}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect(err) | Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Write half of the current connection.
struct Wire {
    connection: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl RequestSink for Wire {
    fn send_request(
        &mut self,
        request_type: RequestType,
        correlation_id: &str,
    ) -> Result<(), CommandRejected> {
        if self.connection != ConnectionState::Ready {
            return Err(CommandRejected::NotReady(self.connection));
        }
        let outbound = self.outbound.as_ref().ok_or(CommandRejected::ChannelClosed)?;
        outbound
            .send(Message::Text(protocol::encode_request(
                request_type,
                correlation_id,
            )))
            .map_err(|_| CommandRejected::ChannelClosed)?;
        tracing::debug!(request_type = %request_type, request_id = correlation_id, "request sent");
        Ok(())
    }
}

struct Inner {
    epoch: u64,
    reached_ready: bool,
    wire: Wire,
    correlator: Correlator,
}

impl Inner {
    fn status(&self) -> LinkStatus {
        LinkStatus {
            connection: self.wire.connection,
            recording: self.correlator.recording(),
            pending: self.correlator.pending().map(|p| p.intent),
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<LinkStatus>,
    options: LinkOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.status_tx.send_replace(inner.status());
    }
}

/// Handle to the recording service link, shared by the connection task and
/// the controller. Connection state, recording state and the pending command
/// all sit behind one lock.
#[derive(Clone)]
pub struct ObsLink {
    shared: Arc<Shared>,
}

impl ObsLink {
    pub fn new(options: LinkOptions) -> Self {
        let inner = Inner {
            epoch: 0,
            reached_ready: false,
            wire: Wire {
                connection: ConnectionState::Disconnected,
                outbound: None,
            },
            correlator: Correlator::new(options.command_timeout),
        };
        let (status_tx, _) = watch::channel(inner.status());
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                status_tx,
                options,
            }),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.lock().status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().wire.connection
    }

    pub fn recording_state(&self) -> RecordingState {
        self.shared.lock().correlator.recording()
    }

    pub fn request_start(&self) -> CommandOutcome {
        self.request(Intent::Start)
    }

    pub fn request_stop(&self) -> CommandOutcome {
        self.request(Intent::Stop)
    }

    fn request(&self, intent: Intent) -> CommandOutcome {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        let outcome = match intent {
            Intent::Start => inner.correlator.request_start(&mut inner.wire, now),
            Intent::Stop => inner.correlator.request_stop(&mut inner.wire, now),
        };
        self.shared.publish(inner);
        outcome
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Waits until `predicate` holds for the published status, up to `limit`.
    pub async fn wait_for<F>(&self, limit: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&LinkStatus) -> bool,
    {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(|status| predicate(status))).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Starts a new connection attempt. Any previous session is superseded and
    /// the recording state is forgotten, since the server may have changed it.
    pub fn new_session(&self) -> Session {
        let mut inner = self.shared.lock();
        inner.epoch += 1;
        inner.reached_ready = false;
        inner.wire.outbound = None;
        inner.wire.connection = ConnectionState::Disconnected;
        inner.correlator.reset();
        self.shared.publish(&inner);
        Session {
            shared: self.shared.clone(),
            epoch: inner.epoch,
        }
    }

    /// Asks the current connection to close gracefully. Returns false when
    /// there is no open connection.
    pub fn close(&self) -> bool {
        let inner = self.shared.lock();
        let Some(outbound) = inner.wire.outbound.as_ref() else {
            return false;
        };
        outbound
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "shutdown".into(),
            })))
            .is_ok()
    }
}

/// One connection to the recording service, from connect to close.
pub struct Session {
    shared: Arc<Shared>,
    epoch: u64,
}

impl Session {
    pub fn state(&self) -> ConnectionState {
        let inner = self.shared.lock();
        if inner.epoch != self.epoch {
            return ConnectionState::Closed;
        }
        inner.wire.connection
    }

    pub fn reached_ready(&self) -> bool {
        let inner = self.shared.lock();
        inner.epoch == self.epoch && inner.reached_ready
    }

    /// Connects to `url` and runs the connection until it closes.
    /// `Ok` means the close was requested locally.
    pub async fn open(&self, url: &str, connect_timeout: Duration) -> Result<(), TransportError> {
        self.transition(ConnectionState::Disconnected, ConnectionState::Connecting)?;
        tracing::info!(url, "connecting to obs websocket");

        let ws = match tokio::time::timeout(connect_timeout, connect_async(url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                let err = TransportError::Connect(err);
                self.mark_closed(&err.to_string());
                return Err(err);
            }
            Err(_) => {
                let err = TransportError::ConnectTimeout(connect_timeout);
                self.mark_closed(&err.to_string());
                return Err(err);
            }
        };

        self.run(ws).await
    }

    /// Drives an already open websocket: identifies, then pumps outbound
    /// requests and inbound frames until either side closes.
    pub async fn run<S>(&self, ws: S) -> Result<(), TransportError>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.attach(tx)?;

        let identify_timeout = self.shared.options.identify_timeout;
        let handshake = tokio::time::sleep(identify_timeout);
        tokio::pin!(handshake);

        let result = loop {
            let identifying = self.state() == ConnectionState::Identifying;
            tokio::select! {
                _ = &mut handshake, if identifying => {
                    break Err(TransportError::IdentifyTimeout(identify_timeout));
                }
                outgoing = rx.recv() => match outgoing {
                    Some(Message::Close(frame)) => {
                        let _ = sink.send(Message::Close(frame)).await;
                        break Ok(());
                    }
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            break Err(TransportError::Io(err));
                        }
                    }
                    None => break Err(TransportError::Superseded),
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        break Err(TransportError::ClosedByPeer {
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(TransportError::Io(err)),
                    None => break Err(TransportError::StreamEnded),
                },
            }
        };

        match &result {
            Ok(()) => self.mark_closed("closed locally"),
            Err(err) => self.mark_closed(&err.to_string()),
        }
        result
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), TransportError> {
        let mut inner = self.shared.lock();
        if inner.epoch != self.epoch {
            return Err(TransportError::Superseded);
        }
        if inner.wire.connection != from {
            return Err(TransportError::InvalidState(inner.wire.connection));
        }
        inner.wire.connection = to;
        self.shared.publish(&inner);
        Ok(())
    }

    /// Transport is open: queue the identify frame and wait for confirmation.
    fn attach(&self, tx: mpsc::UnboundedSender<Message>) -> Result<(), TransportError> {
        let mut inner = self.shared.lock();
        if inner.epoch != self.epoch {
            return Err(TransportError::Superseded);
        }
        match inner.wire.connection {
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
            other => return Err(TransportError::InvalidState(other)),
        }
        // The receiver is held by the caller, so this cannot fail.
        let _ = tx.send(Message::Text(protocol::encode_identify()));
        inner.wire.outbound = Some(tx);
        inner.wire.connection = ConnectionState::Identifying;
        tracing::debug!("transport open, identify sent");
        self.shared.publish(&inner);
        Ok(())
    }

    fn handle_text(&self, text: &str) {
        let inbound = match protocol::decode(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::warn!(error = %err, "discarding malformed frame");
                return;
            }
        };

        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if inner.epoch != self.epoch {
            return;
        }

        match inbound {
            Inbound::Hello(hello) => {
                if hello.authentication.is_some() {
                    tracing::warn!(
                        "obs websocket requires authentication, which is not supported; \
                         disable it in obs or expect the identify to be rejected"
                    );
                } else {
                    tracing::debug!(
                        version = ?hello.obs_web_socket_version,
                        rpc_version = hello.rpc_version,
                        "server hello"
                    );
                }
            }
            Inbound::Identified(identified) => {
                if inner.wire.connection != ConnectionState::Identifying {
                    tracing::warn!(state = %inner.wire.connection, "unexpected identified frame");
                    return;
                }
                inner.wire.connection = ConnectionState::Ready;
                inner.reached_ready = true;
                tracing::info!(
                    rpc_version = ?identified.negotiated_rpc_version,
                    "identified, obs websocket ready"
                );
                if self.shared.options.sync_record_status {
                    if let CommandOutcome::Rejected(err) =
                        inner.correlator.probe_status(&mut inner.wire)
                    {
                        tracing::warn!(error = %err, "record status query not sent");
                    }
                }
            }
            Inbound::RequestResponse(response) => {
                tracing::debug!(
                    request_type = ?response.request_type,
                    request_id = %response.request_id,
                    code = ?response.status_code(),
                    "request response"
                );
                match inner.correlator.on_response(&response) {
                    Some(RecordingState::Recording) => {
                        tracing::info!(request_id = %response.request_id, "obs recording started")
                    }
                    Some(RecordingState::Idle) => {
                        tracing::info!(request_id = %response.request_id, "obs recording stopped")
                    }
                    None => {}
                }
            }
            Inbound::Other { op } => tracing::debug!(op, "ignoring frame"),
        }
        self.shared.publish(inner);
    }

    fn mark_closed(&self, reason: &str) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if inner.epoch != self.epoch || inner.wire.connection == ConnectionState::Closed {
            return;
        }
        inner.wire.connection = ConnectionState::Closed;
        inner.wire.outbound = None;
        inner.correlator.discard_pending(reason);
        tracing::info!(reason, "obs connection closed");
        self.shared.publish(inner);
    }
}
