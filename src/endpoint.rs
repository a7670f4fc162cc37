//! Endpoint descriptors: the name plus the shapes exchanged on it.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::kv_config::KvConfig;
use crate::packets::{
    ApplyPromptTemplateParameter, ApplyPromptTemplateResult, ChannelToServerPacket,
    CountTokensResult, DescribedUnion, GenerateToClientPacket, GeneratorCreationParameter,
    ListLoadedParameter, PredictCreationParameter, PredictToClientPacket,
    PreloadDraftModelParameter, SpecifierParameter, TokenizeParameter, TokenizeResult,
    UnloadModelParameter,
};
use crate::schema::{Direction, PacketUnion, Shape};
use crate::session::{ServerBoundPacket, SessionPacket};
use crate::types::{Described, LlmInstanceInfo};

/// Single parameter in, single result out.
pub trait RpcEndpoint: Send + Sync + 'static {
    const NAME: &'static str;
    type Parameter: Described + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Returns: Described + Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Creation parameter followed by two independently typed packet streams.
pub trait ChannelEndpoint: Send + Sync + 'static {
    const NAME: &'static str;
    type CreationParameter: Described + Serialize + DeserializeOwned + Send + Sync + 'static;
    type ToClientPacket: SessionPacket + DescribedUnion;
    type ToServerPacket: ServerBoundPacket + DescribedUnion;
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointKind {
    Rpc {
        parameter: Shape,
        returns: Shape,
    },
    Channel {
        creation_parameter: Shape,
        to_client: PacketUnion,
        to_server: PacketUnion,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDescriptor {
    name: String,
    kind: EndpointKind,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn rpc<E: RpcEndpoint>() -> Self {
        Self::new(
            E::NAME,
            EndpointKind::Rpc {
                parameter: E::Parameter::shape(),
                returns: E::Returns::shape(),
            },
        )
    }

    pub fn channel<E: ChannelEndpoint>() -> Self {
        Self::new(
            E::NAME,
            EndpointKind::Channel {
                creation_parameter: E::CreationParameter::shape(),
                to_client: E::ToClientPacket::union(),
                to_server: E::ToServerPacket::union(),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    pub fn is_channel(&self) -> bool {
        matches!(self.kind, EndpointKind::Channel { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EndpointKind::Rpc { .. } => "rpc",
            EndpointKind::Channel { .. } => "channel",
        }
    }

    /// Shape validated before the exchange begins: the call parameter or the
    /// channel creation parameter.
    pub fn creation_shape(&self) -> &Shape {
        match &self.kind {
            EndpointKind::Rpc { parameter, .. } => parameter,
            EndpointKind::Channel {
                creation_parameter, ..
            } => creation_parameter,
        }
    }

    pub fn returns_shape(&self) -> Option<&Shape> {
        match &self.kind {
            EndpointKind::Rpc { returns, .. } => Some(returns),
            EndpointKind::Channel { .. } => None,
        }
    }

    pub fn packet_union(&self, direction: Direction) -> Option<&PacketUnion> {
        match (&self.kind, direction) {
            (EndpointKind::Channel { to_client, .. }, Direction::ToClient) => Some(to_client),
            (EndpointKind::Channel { to_server, .. }, Direction::ToServer) => Some(to_server),
            (EndpointKind::Rpc { .. }, _) => None,
        }
    }
}

macro_rules! rpc_endpoint {
    ($(#[$meta:meta])* $marker:ident, $name:literal, $parameter:ty => $returns:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $marker;

        impl RpcEndpoint for $marker {
            const NAME: &'static str = $name;
            type Parameter = $parameter;
            type Returns = $returns;
        }
    };
}

/// Streaming prediction against a loaded model.
#[derive(Debug, Clone, Copy, Default)]
pub struct Predict;

impl ChannelEndpoint for Predict {
    const NAME: &'static str = "predict";
    type CreationParameter = PredictCreationParameter;
    type ToClientPacket = PredictToClientPacket;
    type ToServerPacket = ChannelToServerPacket;
}

/// Streaming generation driven by a generator plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateWithGenerator;

impl ChannelEndpoint for GenerateWithGenerator {
    const NAME: &'static str = "generateWithGenerator";
    type CreationParameter = GeneratorCreationParameter;
    type ToClientPacket = GenerateToClientPacket;
    type ToServerPacket = ChannelToServerPacket;
}

rpc_endpoint!(
    ApplyPromptTemplate,
    "applyPromptTemplate",
    ApplyPromptTemplateParameter => ApplyPromptTemplateResult
);
rpc_endpoint!(Tokenize, "tokenize", TokenizeParameter => TokenizeResult);
rpc_endpoint!(CountTokens, "countTokens", TokenizeParameter => CountTokensResult);
rpc_endpoint!(
    /// Acknowledged once the backend accepts the preload, not when it completes.
    PreloadDraftModel,
    "preloadDraftModel",
    PreloadDraftModelParameter => ()
);
rpc_endpoint!(ListLoaded, "listLoaded", ListLoadedParameter => Vec<LlmInstanceInfo>);
rpc_endpoint!(
    GetModelInfo,
    "getModelInfo",
    SpecifierParameter => Option<LlmInstanceInfo>
);
rpc_endpoint!(GetLoadConfig, "getLoadConfig", SpecifierParameter => KvConfig);
rpc_endpoint!(UnloadModel, "unloadModel", UnloadModelParameter => ());
