//! In-process stand-in for the obs websocket server, speaking the real
//! websocket framing over an in-memory duplex pipe.

use crate::session::{LinkOptions, ObsLink, TransportError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Clone)]
pub struct FakeObsBehaviour {
    /// Answer identify with identified.
    pub identify: bool,
    /// Answer requests with responses.
    pub ack_requests: bool,
    /// Whether the fake output is already recording.
    pub recording: bool,
}

impl Default for FakeObsBehaviour {
    fn default() -> Self {
        Self {
            identify: true,
            ack_requests: true,
            recording: false,
        }
    }
}

enum Control {
    Raw(String),
    Close(u16, String),
}

#[derive(Default)]
struct Log {
    frames: Vec<Value>,
}

pub struct FakeObs {
    log: Arc<Mutex<Log>>,
    acks: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl FakeObs {
    pub fn received_ops(&self) -> Vec<u64> {
        self.log
            .lock()
            .unwrap()
            .frames
            .iter()
            .filter_map(|f| f["op"].as_u64())
            .collect()
    }

    pub fn identify_rpc_version(&self) -> Option<u64> {
        self.log
            .lock()
            .unwrap()
            .frames
            .iter()
            .find(|f| f["op"] == 1)
            .and_then(|f| f["d"]["rpcVersion"].as_u64())
    }

    /// `(requestType, requestId)` of every request received, in order.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.log
            .lock()
            .unwrap()
            .frames
            .iter()
            .filter(|f| f["op"] == 6)
            .map(|f| {
                (
                    f["d"]["requestType"].as_str().unwrap_or_default().to_string(),
                    f["d"]["requestId"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    pub fn requests_of(&self, request_type: &str) -> usize {
        self.requests()
            .iter()
            .filter(|(kind, _)| kind == request_type)
            .count()
    }

    pub async fn wait_for_requests(&self, request_type: &str, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if self.requests_of(request_type) >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn set_acks(&self, enabled: bool) {
        self.acks.store(enabled, Ordering::SeqCst);
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.control.send(Control::Raw(text.to_string()));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.control.send(Control::Close(code, reason.to_string()));
    }

    /// Drops the server end without a close handshake.
    pub fn drop_connection(&self) {
        self.task.abort();
    }
}

pub async fn ws_pair() -> (
    WebSocketStream<DuplexStream>,
    WebSocketStream<DuplexStream>,
) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::join!(
        WebSocketStream::from_raw_socket(client_io, Role::Client, None),
        WebSocketStream::from_raw_socket(server_io, Role::Server, None),
    )
}

pub fn spawn_fake_obs<S>(mut server: WebSocketStream<S>, behaviour: FakeObsBehaviour) -> FakeObs
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let log = Arc::new(Mutex::new(Log::default()));
    let acks = Arc::new(AtomicBool::new(behaviour.ack_requests));
    let (control, mut control_rx) = mpsc::unbounded_channel();

    let task_log = log.clone();
    let task_acks = acks.clone();
    let task = tokio::spawn(async move {
        let mut recording = behaviour.recording;
        loop {
            tokio::select! {
                cmd = control_rx.recv() => match cmd {
                    Some(Control::Raw(text)) => {
                        let _ = server.send(Message::Text(text)).await;
                    }
                    Some(Control::Close(code, reason)) => {
                        let _ = server
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        let _ = server.next().await;
                        break;
                    }
                    None => break,
                },
                incoming = server.next() => {
                    let Some(Ok(Message::Text(text))) = incoming else {
                        break;
                    };
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    task_log.lock().unwrap().frames.push(frame.clone());
                    let reply = match frame["op"].as_u64() {
                        Some(1) if behaviour.identify => {
                            Some(json!({ "op": 2, "d": { "negotiatedRpcVersion": 1 } }))
                        }
                        Some(6) if task_acks.load(Ordering::SeqCst) => {
                            Some(respond(&frame["d"], &mut recording))
                        }
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let _ = server.send(Message::Text(reply.to_string())).await;
                    }
                }
            }
        }
    });

    FakeObs {
        log,
        acks,
        control,
        task,
    }
}

fn respond(request: &Value, recording: &mut bool) -> Value {
    let request_type = request["requestType"].as_str().unwrap_or_default();
    let (result, code, data) = match request_type {
        "StartRecording" if *recording => (false, 500, None),
        "StartRecording" => {
            *recording = true;
            (true, 100, None)
        }
        "StopRecording" if !*recording => (false, 501, None),
        "StopRecording" => {
            *recording = false;
            (true, 100, Some(json!({ "outputPath": "/tmp/call.mkv" })))
        }
        "GetRecordStatus" => (true, 100, Some(json!({ "outputActive": *recording }))),
        _ => (false, 204, None),
    };
    let mut d = json!({
        "requestType": request_type,
        "requestId": request["requestId"],
        "requestStatus": { "result": result, "code": code },
    });
    if let Some(data) = data {
        d["responseData"] = data;
    }
    json!({ "op": 7, "d": d })
}

/// Runs a new session of `link` against a fresh fake server.
pub async fn attach_fake_obs(
    link: &ObsLink,
    behaviour: FakeObsBehaviour,
) -> (FakeObs, JoinHandle<Result<(), TransportError>>) {
    let (client, server) = ws_pair().await;
    let fake = spawn_fake_obs(server, behaviour);
    let session = link.new_session();
    let task = tokio::spawn(async move { session.run(client).await });
    (fake, task)
}

/// A link whose session has completed the handshake with a fake server.
pub async fn connected_link(
    options: LinkOptions,
    behaviour: FakeObsBehaviour,
) -> (
    ObsLink,
    FakeObs,
    JoinHandle<Result<(), TransportError>>,
) {
    let link = ObsLink::new(options);
    let (fake, task) = attach_fake_obs(&link, behaviour).await;
    let ready = link
        .wait_for(Duration::from_secs(2), |s| {
            s.connection == crate::model::ConnectionState::Ready
        })
        .await;
    assert!(ready, "fake obs never identified");
    (link, fake, task)
}
