//! Client/backend contract for serving large language models: endpoint
//! registry, cancellable streaming prediction sessions and the
//! request/response calls around them.

use std::time::Duration;

pub mod backend;
pub mod client;
pub mod config;
mod connection;
pub mod endpoint;
pub mod errors;
mod handler;
pub mod interface;
pub mod kv_config;
pub mod packets;
pub mod preset;
pub mod schema;
pub mod server;
pub mod session;
pub mod streaming;
pub mod transport;
pub mod types;
pub mod wire;

pub use backend::{llm_backend_server, BackendError, GenerationRequest, LlmBackend, PredictionRequest};
pub use client::{BackendClient, Channel, ChannelOutcome, PredictionResult};
pub use config::PortConfig;
pub use endpoint::{ChannelEndpoint, EndpointDescriptor, EndpointKind, RpcEndpoint};
pub use errors::{DuplicateEndpointError, PortError, SchemaViolation, Subject};
pub use interface::{create_base_model_interface, create_llm_backend_interface, BackendInterface};
pub use kv_config::{KvConfig, KvConfigStack};
pub use packets::{
    ChannelToServerPacket, GenerateToClientPacket, GeneratorCreationParameter,
    PredictCreationParameter, PredictToClientPacket,
};
pub use server::{BackendServer, SessionSink};
pub use session::{PredictionSession, SequencingViolation, SessionOutcome, SessionPhase};
pub use transport::{memory_pair, FrameTransport, FramedTransport, MemoryTransport};
pub use wire::{WireError, WireErrorKind};

#[cfg(not(test))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
