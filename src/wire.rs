//! JSON envelopes exchanged over a [`FrameTransport`](crate::transport::FrameTransport).
//!
//! Many calls and channels share one connection; every envelope carries the
//! call or channel id it belongs to.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PortError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    RpcCall {
        call_id: u64,
        endpoint: String,
        parameter: Value,
    },
    #[serde(rename_all = "camelCase")]
    ChannelCreate {
        channel_id: u64,
        endpoint: String,
        creation_parameter: Value,
    },
    #[serde(rename_all = "camelCase")]
    ChannelSend { channel_id: u64, message: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RpcResult { call_id: u64, result: Value },
    #[serde(rename_all = "camelCase")]
    RpcError { call_id: u64, error: WireError },
    #[serde(rename_all = "camelCase")]
    ChannelSend { channel_id: u64, message: Value },
    #[serde(rename_all = "camelCase")]
    ChannelClose { channel_id: u64 },
    #[serde(rename_all = "camelCase")]
    ChannelError { channel_id: u64, error: WireError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireErrorKind {
    Validation,
    Sequencing,
    Backend,
    UnknownEndpoint,
    Protocol,
    Internal,
}

impl fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireErrorKind::Validation => "validation",
            WireErrorKind::Sequencing => "sequencing",
            WireErrorKind::Backend => "backend",
            WireErrorKind::UnknownEndpoint => "unknown endpoint",
            WireErrorKind::Protocol => "protocol",
            WireErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Structured failure record; every error crossing the wire takes this form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub endpoint: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl WireError {
    pub fn protocol(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Protocol,
            endpoint: endpoint.into(),
            message: message.into(),
            path: None,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error on {}", self.kind, self.endpoint)?;
        if let Some(path) = &self.path {
            write!(f, " at {path}")?;
        }
        write!(f, ": {}", self.message)
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, PortError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, PortError> {
    Ok(serde_json::from_slice(frame)?)
}
