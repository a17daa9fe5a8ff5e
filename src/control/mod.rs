//! Control plane
//!
//! Wire protocol for the persistent operator channel: one UTF-8 JSON message
//! per WebSocket frame, commands in, events out. The server lives in
//! [`server`].

mod server;

pub use server::{ControlContext, ControlServer};

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::engine::EngineSnapshot;
use crate::surface::Size;

/// WebSocket close code for rejected authentication (application range).
pub const AUTH_REJECT_CLOSE_CODE: u16 = 4001;

/// One inbound frame: `{id?, type, payload?}`.
#[derive(Debug, Deserialize)]
pub struct CommandFrame {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct AuthPayload {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPayload {
    pub template_html: String,
    pub template_css: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, rename = "isOGraf")]
    pub is_ograf: bool,
    pub ograf_manifest: Option<serde_json::Value>,
    pub template_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct VariablesPayload {
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Cut,
    Mix,
}

#[derive(Debug, Deserialize, Default)]
pub struct TakePayload {
    pub transition: Option<Transition>,
    /// Mix duration in milliseconds.
    pub duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TestSignalPayload {
    pub pattern: String,
    pub alpha: Option<f64>,
}

/// A decoded operator command.
#[derive(Debug)]
pub enum Command {
    Auth(AuthPayload),
    Load(Box<LoadPayload>),
    Update(VariablesPayload),
    UpdatePgm(VariablesPayload),
    Play,
    Stop,
    Take(TakePayload),
    Clear,
    Freeze,
    Next,
    TestSignal(TestSignalPayload),
    Status,
    GetInfo,
    SetOutput(serde_json::Value),
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown command type '{0}'")]
    UnknownType(String),

    #[error("invalid payload for '{kind}': {detail}")]
    Payload { kind: String, detail: String },
}

impl Command {
    /// Decode the typed command out of a raw frame's `type` + `payload`.
    pub fn parse(kind: &str, payload: serde_json::Value) -> Result<Self, ProtocolError> {
        fn required<T: DeserializeOwned>(
            kind: &str,
            payload: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(payload).map_err(|err| ProtocolError::Payload {
                kind: kind.to_string(),
                detail: err.to_string(),
            })
        }
        fn optional<T: DeserializeOwned + Default>(
            kind: &str,
            payload: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            if payload.is_null() {
                Ok(T::default())
            } else {
                required(kind, payload)
            }
        }

        match kind {
            "auth" => Ok(Command::Auth(optional(kind, payload)?)),
            "load" => Ok(Command::Load(Box::new(required(kind, payload)?))),
            "update" => Ok(Command::Update(optional(kind, payload)?)),
            "updatePgm" => Ok(Command::UpdatePgm(optional(kind, payload)?)),
            "play" => Ok(Command::Play),
            "stop" => Ok(Command::Stop),
            "take" => Ok(Command::Take(optional(kind, payload)?)),
            "clear" => Ok(Command::Clear),
            "freeze" => Ok(Command::Freeze),
            "next" => Ok(Command::Next),
            "testSignal" => Ok(Command::TestSignal(required(kind, payload)?)),
            "status" => Ok(Command::Status),
            "getInfo" => Ok(Command::GetInfo),
            "setOutput" => Ok(Command::SetOutput(payload)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Outbound events: `{type, payload}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    State(EngineSnapshot),
    FrameUpdate {
        fps: f64,
        dropped: u64,
    },
    Info(InfoPayload),
    Ack {
        id: String,
        success: bool,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoPayload {
    pub version: String,
    pub resolution: Size,
    pub frame_rate: f64,
    /// Names of the sinks that survived startup.
    pub hardware: Vec<String>,
}

/// Out-of-band notices the server raises towards the wiring layer.
#[derive(Debug, Clone)]
pub enum ServerNotice {
    ClientConnected { total_clients: usize },
    ClientDisconnected { total_clients: usize },
    /// Advisory `setOutput` payload, forwarded untouched.
    SetOutput(serde_json::Value),
}
