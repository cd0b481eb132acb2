use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub const RPC_VERSION: u32 = 1;

/// Request status code sent when starting an output that already runs.
pub const STATUS_OUTPUT_RUNNING: u16 = 500;
/// Request status code sent when stopping an output that is not running.
pub const STATUS_OUTPUT_NOT_RUNNING: u16 = 501;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Hello = 0,
    Identify = 1,
    Identified = 2,
    Event = 5,
    Request = 6,
    RequestResponse = 7,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0 => Some(Self::Hello),
            1 => Some(Self::Identify),
            2 => Some(Self::Identified),
            5 => Some(Self::Event),
            6 => Some(Self::Request),
            7 => Some(Self::RequestResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    StartRecording,
    StopRecording,
    GetRecordStatus,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartRecording => "StartRecording",
            Self::StopRecording => "StopRecording",
            Self::GetRecordStatus => "GetRecordStatus",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawFrame {
    op: u8,
    #[serde(default)]
    d: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub obs_web_socket_version: Option<String>,
    pub rpc_version: u32,
    #[serde(default)]
    pub authentication: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    #[serde(default)]
    pub negotiated_rpc_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub result: bool,
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    #[serde(default)]
    pub request_type: Option<String>,
    pub request_id: String,
    #[serde(default)]
    pub request_status: Option<RequestStatus>,
    #[serde(default)]
    pub response_data: Option<Value>,
}

impl RequestResponse {
    /// Missing status is treated as success; older servers omit it.
    pub fn succeeded(&self) -> bool {
        self.request_status.as_ref().map_or(true, |s| s.result)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.request_status.as_ref().map(|s| s.code)
    }

    pub fn output_active(&self) -> Option<bool> {
        self.response_data
            .as_ref()?
            .get("outputActive")?
            .as_bool()
    }
}

/// Server-to-client frames the client acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Hello(Hello),
    Identified(Identified),
    RequestResponse(RequestResponse),
    Other { op: u8 },
}

#[derive(Debug)]
pub enum ProtocolError {
    Json(serde_json::Error),
    MissingData { op: u8 },
    UnexpectedPayload { op: u8, source: serde_json::Error },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(err) => write!(f, "frame is not valid json: {err}"),
            Self::MissingData { op } => write!(f, "op {op} frame has no data"),
            Self::UnexpectedPayload { op, source } => {
                write!(f, "op {op} payload decode failed: {source}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::UnexpectedPayload { source, .. } => Some(source),
            Self::MissingData { .. } => None,
        }
    }
}

pub fn encode_identify() -> String {
    json!({
        "op": OpCode::Identify as u8,
        "d": { "rpcVersion": RPC_VERSION },
    })
    .to_string()
}

pub fn encode_request(request_type: RequestType, request_id: &str) -> String {
    json!({
        "op": OpCode::Request as u8,
        "d": {
            "requestType": request_type,
            "requestId": request_id,
            "requestData": {},
        },
    })
    .to_string()
}

pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let frame: RawFrame = serde_json::from_str(text).map_err(ProtocolError::Json)?;
    let op = frame.op;
    match OpCode::from_u8(op) {
        Some(OpCode::Hello) => decode_data(op, frame.d).map(Inbound::Hello),
        Some(OpCode::Identified) => {
            // Identified with no body still completes the handshake.
            let data = frame.d.unwrap_or_else(|| json!({}));
            decode_data(op, Some(data)).map(Inbound::Identified)
        }
        Some(OpCode::RequestResponse) => decode_data(op, frame.d).map(Inbound::RequestResponse),
        _ => Ok(Inbound::Other { op }),
    }
}

fn decode_data<T: for<'de> Deserialize<'de>>(
    op: u8,
    data: Option<Value>,
) -> Result<T, ProtocolError> {
    let data = data.ok_or(ProtocolError::MissingData { op })?;
    serde_json::from_value(data).map_err(|source| ProtocolError::UnexpectedPayload { op, source })
}
