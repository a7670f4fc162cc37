//! The immutable endpoint catalogue shared by client and server.

use serde_json::Value;
use tracing::debug;

use crate::endpoint::{
    ApplyPromptTemplate, ChannelEndpoint, CountTokens, EndpointDescriptor, EndpointKind,
    GenerateWithGenerator, GetLoadConfig, GetModelInfo, ListLoaded, Predict, PreloadDraftModel,
    RpcEndpoint, Tokenize, UnloadModel,
};
use crate::errors::{DuplicateEndpointError, PortError, SchemaViolation, Subject};
use crate::schema::{self, Direction, FieldError, PacketUnion};

/// Ordered, read-only set of endpoints. Every registration consumes the
/// interface and returns a new one, so a partially built value never escapes
/// the builder chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendInterface {
    endpoints: Vec<EndpointDescriptor>,
}

impl BackendInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(
        mut self,
        descriptor: EndpointDescriptor,
    ) -> Result<Self, DuplicateEndpointError> {
        if self.contains(descriptor.name()) {
            return Err(DuplicateEndpointError {
                name: descriptor.name().to_string(),
            });
        }
        self.endpoints.push(descriptor);
        Ok(self)
    }

    pub fn add_rpc_endpoint<E: RpcEndpoint>(self) -> Result<Self, DuplicateEndpointError> {
        self.add_endpoint(EndpointDescriptor::rpc::<E>())
    }

    pub fn add_channel_endpoint<E: ChannelEndpoint>(self) -> Result<Self, DuplicateEndpointError> {
        self.add_endpoint(EndpointDescriptor::channel::<E>())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    /// Endpoints in registration order.
    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|e| e.name())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn lookup(&self, name: &str) -> Result<&EndpointDescriptor, PortError> {
        self.get(name)
            .ok_or_else(|| PortError::UnknownEndpoint(name.to_string()))
    }

    /// Closed set of packet shapes legal on `endpoint` in `direction`.
    pub fn packet_union(&self, endpoint: &str, direction: Direction) -> Result<&PacketUnion, PortError> {
        self.lookup(endpoint)?
            .packet_union(direction)
            .ok_or_else(|| PortError::EndpointKindMismatch {
                name: endpoint.to_string(),
                expected: "channel",
            })
    }

    /// Validates a call parameter or channel creation parameter.
    pub fn validate_creation(&self, endpoint: &str, value: &Value) -> Result<(), PortError> {
        let descriptor = self.lookup(endpoint)?;
        let subject = match descriptor.kind() {
            EndpointKind::Rpc { .. } => Subject::Parameter,
            EndpointKind::Channel { .. } => Subject::CreationParameter,
        };
        schema::validate(descriptor.creation_shape(), value)
            .map_err(|err| violation(endpoint, Direction::ToServer, subject, err))?;
        Ok(())
    }

    pub fn validate_returns(&self, endpoint: &str, value: &Value) -> Result<(), PortError> {
        let shape = self
            .lookup(endpoint)?
            .returns_shape()
            .ok_or_else(|| PortError::EndpointKindMismatch {
                name: endpoint.to_string(),
                expected: "rpc",
            })?;
        schema::validate(shape, value)
            .map_err(|err| violation(endpoint, Direction::ToClient, Subject::Returns, err))?;
        Ok(())
    }

    pub fn validate_packet(
        &self,
        endpoint: &str,
        direction: Direction,
        value: &Value,
    ) -> Result<(), PortError> {
        self.packet_union(endpoint, direction)?
            .validate(value)
            .map_err(|err| violation(endpoint, direction, Subject::Packet, err))?;
        Ok(())
    }
}

fn violation(endpoint: &str, direction: Direction, subject: Subject, err: FieldError) -> PortError {
    debug!(endpoint, %direction, path = %err.path, "rejected value: {}", err.message);
    PortError::Validation(SchemaViolation {
        endpoint: endpoint.to_string(),
        direction,
        subject,
        path: err.path,
        message: err.message,
    })
}

/// Model-introspection endpoints common to every model domain.
pub fn create_base_model_interface() -> Result<BackendInterface, DuplicateEndpointError> {
    BackendInterface::new()
        .add_rpc_endpoint::<ListLoaded>()?
        .add_rpc_endpoint::<GetModelInfo>()?
        .add_rpc_endpoint::<GetLoadConfig>()?
        .add_rpc_endpoint::<UnloadModel>()
}

/// The base interface extended with the LLM prediction endpoints.
pub fn create_llm_backend_interface() -> Result<BackendInterface, DuplicateEndpointError> {
    create_base_model_interface()?
        .add_channel_endpoint::<Predict>()?
        .add_channel_endpoint::<GenerateWithGenerator>()?
        .add_rpc_endpoint::<ApplyPromptTemplate>()?
        .add_rpc_endpoint::<Tokenize>()?
        .add_rpc_endpoint::<CountTokens>()?
        .add_rpc_endpoint::<PreloadDraftModel>()
}
