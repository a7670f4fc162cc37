use std::fmt;

use thiserror::Error;

use crate::kv_config::ConfigMergeError;
use crate::schema::Direction;
use crate::session::SequencingViolation;
use crate::wire::{WireError, WireErrorKind};

/// Which declared shape of an endpoint a value was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    CreationParameter,
    Parameter,
    Returns,
    Packet,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subject::CreationParameter => "creation parameter",
            Subject::Parameter => "parameter",
            Subject::Returns => "return value",
            Subject::Packet => "packet",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Schema violation on {endpoint} ({direction} {subject}) at {path}: {message}")]
pub struct SchemaViolation {
    pub endpoint: String,
    pub direction: Direction,
    pub subject: Subject,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Endpoint {name} is already registered on this interface")]
pub struct DuplicateEndpointError {
    pub name: String,
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error(transparent)]
    Validation(#[from] SchemaViolation),

    #[error("Sequencing violation on {endpoint}: {violation}")]
    Sequencing {
        endpoint: String,
        violation: SequencingViolation,
    },

    #[error(transparent)]
    DuplicateEndpoint(#[from] DuplicateEndpointError),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Endpoint {name} is not a {expected} endpoint")]
    EndpointKindMismatch {
        name: String,
        expected: &'static str,
    },

    #[error("Config merge error: {0}")]
    ConfigMerge(#[from] ConfigMergeError),

    #[error("Backend error on {endpoint}: {message}")]
    Backend { endpoint: String, message: String },

    #[error("Remote error: {0}")]
    Remote(WireError),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl PortError {
    pub fn sequencing(endpoint: impl Into<String>, violation: SequencingViolation) -> Self {
        PortError::Sequencing {
            endpoint: endpoint.into(),
            violation,
        }
    }

    /// Renders the error as the structured record sent to the peer.
    pub fn to_wire(&self, endpoint: &str) -> WireError {
        match self {
            PortError::Validation(violation) => WireError {
                kind: WireErrorKind::Validation,
                endpoint: violation.endpoint.clone(),
                message: violation.message.clone(),
                path: Some(violation.path.clone()),
            },
            PortError::ConfigMerge(err) => WireError {
                kind: WireErrorKind::Validation,
                endpoint: endpoint.to_string(),
                message: err.to_string(),
                path: Some(err.path()),
            },
            PortError::Sequencing { endpoint, violation } => WireError {
                kind: WireErrorKind::Sequencing,
                endpoint: endpoint.clone(),
                message: violation.to_string(),
                path: None,
            },
            PortError::Backend { endpoint, message } => WireError {
                kind: WireErrorKind::Backend,
                endpoint: endpoint.clone(),
                message: message.clone(),
                path: None,
            },
            PortError::UnknownEndpoint(name) => WireError {
                kind: WireErrorKind::UnknownEndpoint,
                endpoint: name.clone(),
                message: self.to_string(),
                path: None,
            },
            PortError::EndpointKindMismatch { name, .. } => {
                WireError::protocol(name.clone(), self.to_string())
            }
            PortError::Remote(wire) => wire.clone(),
            other => WireError {
                kind: WireErrorKind::Internal,
                endpoint: endpoint.to_string(),
                message: other.to_string(),
                path: None,
            },
        }
    }

    /// Kind of the wire error this value carries or would be rendered as.
    pub fn wire_kind(&self) -> WireErrorKind {
        self.to_wire("").kind
    }
}
