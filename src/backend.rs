//! Backend seam: the operations an inference engine provides, and the
//! wiring that serves them over the LLM backend interface.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::PortConfig;
use crate::endpoint::{
    ApplyPromptTemplate, CountTokens, GenerateWithGenerator, GetLoadConfig, GetModelInfo,
    ListLoaded, Predict, PreloadDraftModel, Tokenize, UnloadModel,
};
use crate::errors::{PortError, SchemaViolation, Subject};
use crate::interface::create_llm_backend_interface;
use crate::kv_config::{self, KvConfig, KvConfigStack};
use crate::packets::{
    ApplyPromptTemplateResult, CountTokensResult, GenerateToClientPacket,
    GeneratorCreationParameter, PredictCreationParameter, PredictToClientPacket, TokenizeResult,
};
use crate::preset::{find_preset, Preset};
use crate::schema::{Direction, FieldError};
use crate::server::{BackendServer, SessionSink};
use crate::types::{
    ApplyPromptTemplateOpts, ChatHistoryData, LlmInstanceInfo, LlmTool, ModelSpecifier,
    PredictionStats,
};

pub const SERVER_SESSION_LAYER: &str = "serverSession";
pub const PRESET_LAYER: &str = "preset";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No loaded model matches {0}")]
    ModelNotFound(String),

    #[error("Model {0} was unloaded")]
    ModelUnloaded(String),

    #[error("Unknown generator plugin {0}")]
    PluginNotFound(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error(transparent)]
    Port(#[from] PortError),
}

impl BackendError {
    pub fn into_port_error(self, endpoint: &str) -> PortError {
        match self {
            BackendError::Port(e) => e,
            other => PortError::Backend {
                endpoint: endpoint.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// A prediction after model resolution and config layering.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub model: LlmInstanceInfo,
    pub history: ChatHistoryData,
    pub config: KvConfig,
    pub load_config: KvConfig,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub plugin_identifier: String,
    pub plugin_config: KvConfig,
    pub tools: Vec<LlmTool>,
    pub working_directory_path: Option<String>,
    pub history: ChatHistoryData,
}

/// The inference engine behind the interface. Model loading, tokenization
/// and template rendering all live on the other side of this trait.
///
/// `predict` and `generate_with_generator` stream through the sink and stop
/// as soon as a send fails; the terminal packet is sent by the caller.
#[async_trait]
pub trait LlmBackend: Send + Sync + 'static {
    async fn list_loaded(&self) -> Result<Vec<LlmInstanceInfo>, BackendError>;

    async fn resolve_model(
        &self,
        specifier: &ModelSpecifier,
    ) -> Result<LlmInstanceInfo, BackendError> {
        self.list_loaded()
            .await?
            .into_iter()
            .find(|model| model.matches(specifier))
            .ok_or_else(|| BackendError::ModelNotFound(describe(specifier)))
    }

    async fn load_config(&self, _model: &LlmInstanceInfo) -> Result<KvConfig, BackendError> {
        Ok(KvConfig::new())
    }

    /// Lowest-precedence prediction settings.
    fn prediction_defaults(&self) -> KvConfig {
        KvConfig::new()
    }

    /// Settings applied to every session unless the client opts out.
    fn server_session_config(&self) -> KvConfig {
        KvConfig::new()
    }

    fn presets(&self) -> Vec<Preset> {
        Vec::new()
    }

    async fn predict(
        &self,
        request: PredictionRequest,
        sink: &SessionSink<PredictToClientPacket>,
    ) -> Result<PredictionStats, BackendError>;

    async fn generate_with_generator(
        &self,
        _request: GenerationRequest,
        _sink: &SessionSink<GenerateToClientPacket>,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("generateWithGenerator"))
    }

    async fn apply_prompt_template(
        &self,
        model: &LlmInstanceInfo,
        history: &ChatHistoryData,
        config: &KvConfig,
        opts: &ApplyPromptTemplateOpts,
    ) -> Result<String, BackendError>;

    async fn tokenize(&self, model: &LlmInstanceInfo, input: &str)
        -> Result<Vec<u32>, BackendError>;

    async fn count_tokens(&self, model: &LlmInstanceInfo, input: &str) -> Result<u64, BackendError> {
        Ok(self.tokenize(model, input).await?.len() as u64)
    }

    /// Returns once the backend has accepted the preload.
    async fn preload_draft_model(
        &self,
        model: &LlmInstanceInfo,
        draft_model_key: &str,
    ) -> Result<(), BackendError>;

    async fn unload_model(&self, identifier: &str) -> Result<(), BackendError>;
}

fn describe(specifier: &ModelSpecifier) -> String {
    match specifier {
        ModelSpecifier::InstanceReference { instance_reference } => instance_reference.clone(),
        ModelSpecifier::Query { query } => query
            .identifier
            .clone()
            .or_else(|| query.path.clone())
            .unwrap_or_else(|| "any model".to_string()),
    }
}

fn creation_violation(
    endpoint: &str,
    subject: Subject,
    path: impl Into<String>,
    message: impl Into<String>,
) -> PortError {
    PortError::Validation(SchemaViolation {
        endpoint: endpoint.to_string(),
        direction: Direction::ToServer,
        subject,
        path: path.into(),
        message: message.into(),
    })
}

fn check_history(endpoint: &str, subject: Subject, history: &ChatHistoryData) -> Result<(), PortError> {
    history
        .check_well_formed()
        .map_err(|FieldError { path, message }| {
            creation_violation(endpoint, subject, format!("history.{path}"), message)
        })
}

fn check_stack(
    endpoint: &str,
    subject: Subject,
    field: &str,
    stack: &KvConfigStack,
) -> Result<(), PortError> {
    kv_config::merge(stack).map(|_| ()).map_err(|err| {
        creation_violation(endpoint, subject, format!("{field}.{}", err.path()), err.to_string())
    })
}

/// Assembles the effective stack, lowest precedence first: server session
/// config, preset, then the client's own layers.
fn layered_stack(
    client_stack: &KvConfigStack,
    server_session: Option<KvConfig>,
    preset: Option<&Preset>,
) -> KvConfigStack {
    let mut stack = KvConfigStack::new();
    if let Some(config) = server_session {
        stack.push_layer(SERVER_SESSION_LAYER, config);
    }
    if let Some(preset) = preset {
        stack.push_layer(PRESET_LAYER, preset.config.clone());
    }
    stack.layers.extend(client_stack.layers.iter().cloned());
    stack
}

fn resolve_prediction_config<B: LlmBackend + ?Sized>(
    backend: &B,
    endpoint: &str,
    subject: Subject,
    client_stack: &KvConfigStack,
    fuzzy_preset_identifier: Option<&str>,
    ignore_server_session_config: bool,
) -> Result<KvConfig, PortError> {
    check_stack(endpoint, subject, "predictionConfigStack", client_stack)?;

    let presets = backend.presets();
    let preset = match fuzzy_preset_identifier {
        Some(query) => Some(find_preset(&presets, query).ok_or_else(|| {
            creation_violation(
                endpoint,
                subject,
                "fuzzyPresetIdentifier",
                format!("no preset matches {query:?}"),
            )
        })?),
        None => None,
    };
    let server_session = (!ignore_server_session_config).then(|| backend.server_session_config());

    let stack = layered_stack(client_stack, server_session, preset);
    Ok(kv_config::merge_with_defaults(
        &backend.prediction_defaults(),
        &stack,
    )?)
}

/// An unresolvable specifier is a bad parameter, reported at `field`.
async fn resolve_model<B: LlmBackend + ?Sized>(
    backend: &B,
    endpoint: &str,
    subject: Subject,
    field: &str,
    specifier: &ModelSpecifier,
) -> Result<LlmInstanceInfo, PortError> {
    backend.resolve_model(specifier).await.map_err(|e| match e {
        BackendError::ModelNotFound(_) => {
            creation_violation(endpoint, subject, field, e.to_string())
        }
        other => other.into_port_error(endpoint),
    })
}

async fn run_predict<B: LlmBackend + ?Sized>(
    backend: &B,
    parameter: PredictCreationParameter,
    sink: SessionSink<PredictToClientPacket>,
) -> Result<(), PortError> {
    const ENDPOINT: &str = "predict";
    check_history(ENDPOINT, Subject::CreationParameter, &parameter.history)?;
    let config = resolve_prediction_config(
        backend,
        ENDPOINT,
        Subject::CreationParameter,
        &parameter.prediction_config_stack,
        parameter.fuzzy_preset_identifier.as_deref(),
        parameter.ignore_server_session_config.unwrap_or(false),
    )?;

    let model = resolve_model(
        backend,
        ENDPOINT,
        Subject::CreationParameter,
        "modelSpecifier",
        &parameter.model_specifier,
    ).await?;
    let load_config = backend
        .load_config(&model)
        .await
        .map_err(|e| e.into_port_error(ENDPOINT))?;
    debug!(
        channel_id = sink.channel_id(),
        model = %model.identifier,
        "prediction accepted"
    );

    let request = PredictionRequest {
        model: model.clone(),
        history: parameter.history,
        config: config.clone(),
        load_config: load_config.clone(),
    };
    let stats = backend
        .predict(request, &sink)
        .await
        .map_err(|e| e.into_port_error(ENDPOINT))?;

    sink.send(PredictToClientPacket::Success {
        stats,
        model_info: model,
        load_model_config: load_config,
        prediction_config: config,
    })
    .await
}

async fn run_generator<B: LlmBackend + ?Sized>(
    backend: &B,
    parameter: GeneratorCreationParameter,
    sink: SessionSink<GenerateToClientPacket>,
) -> Result<(), PortError> {
    const ENDPOINT: &str = "generateWithGenerator";
    check_history(ENDPOINT, Subject::CreationParameter, &parameter.history)?;
    check_stack(
        ENDPOINT,
        Subject::CreationParameter,
        "pluginConfigStack",
        &parameter.plugin_config_stack,
    )?;
    let plugin_config = kv_config::merge(&parameter.plugin_config_stack)?;

    let request = GenerationRequest {
        plugin_identifier: parameter.plugin_identifier,
        plugin_config,
        tools: parameter.tools,
        working_directory_path: parameter.working_directory_path,
        history: parameter.history,
    };
    backend
        .generate_with_generator(request, &sink)
        .await
        .map_err(|e| e.into_port_error(ENDPOINT))?;

    sink.send(GenerateToClientPacket::Success).await
}

/// Builds a server for the full LLM backend interface with every endpoint
/// handled by `backend`.
pub async fn llm_backend_server<B: LlmBackend>(
    backend: Arc<B>,
    config: PortConfig,
) -> Result<BackendServer, PortError> {
    let server = BackendServer::new(create_llm_backend_interface()?, config);

    let b = backend.clone();
    server
        .register_channel::<Predict, _, _>(move |parameter, sink| {
            let backend = b.clone();
            async move { run_predict(backend.as_ref(), parameter, sink).await }
        })
        .await?;

    let b = backend.clone();
    server
        .register_channel::<GenerateWithGenerator, _, _>(move |parameter, sink| {
            let backend = b.clone();
            async move { run_generator(backend.as_ref(), parameter, sink).await }
        })
        .await?;

    let b = backend.clone();
    server
        .register_rpc::<ApplyPromptTemplate, _, _>(move |parameter| {
            let backend = b.clone();
            async move {
                const ENDPOINT: &str = "applyPromptTemplate";
                check_history(ENDPOINT, Subject::Parameter, &parameter.history)?;
                let config = resolve_prediction_config(
                    backend.as_ref(),
                    ENDPOINT,
                    Subject::Parameter,
                    &parameter.prediction_config_stack,
                    None,
                    false,
                )?;
                let model = resolve_model(
                    backend.as_ref(),
                    ENDPOINT,
                    Subject::Parameter,
                    "specifier",
                    &parameter.specifier,
                )
                .await?;
                let formatted = backend
                    .apply_prompt_template(&model, &parameter.history, &config, &parameter.opts)
                    .await
                    .map_err(|e| e.into_port_error(ENDPOINT))?;
                Ok(ApplyPromptTemplateResult { formatted })
            }
        })
        .await?;

    let b = backend.clone();
    server
        .register_rpc::<Tokenize, _, _>(move |parameter| {
            let backend = b.clone();
            async move {
                let model = resolve_model(
                    backend.as_ref(),
                    "tokenize",
                    Subject::Parameter,
                    "specifier",
                    &parameter.specifier,
                )
                .await?;
                let tokens = backend
                    .tokenize(&model, &parameter.input_string)
                    .await
                    .map_err(|e| e.into_port_error("tokenize"))?;
                Ok(TokenizeResult { tokens })
            }
        })
        .await?;

    let b = backend.clone();
    server
        .register_rpc::<CountTokens, _, _>(move |parameter| {
            let backend = b.clone();
            async move {
                let model = resolve_model(
                    backend.as_ref(),
                    "countTokens",
                    Subject::Parameter,
                    "specifier",
                    &parameter.specifier,
                )
                .await?;
                let token_count = backend
                    .count_tokens(&model, &parameter.input_string)
                    .await
                    .map_err(|e| e.into_port_error("countTokens"))?;
                Ok(CountTokensResult { token_count })
            }
        })
        .await?;

    let b = backend.clone();
    server
        .register_rpc::<PreloadDraftModel, _, _>(move |parameter| {
            let backend = b.clone();
            async move {
                let model = resolve_model(
                    backend.as_ref(),
                    "preloadDraftModel",
                    Subject::Parameter,
                    "specifier",
                    &parameter.specifier,
                )
                .await?;
                backend
                    .preload_draft_model(&model, &parameter.draft_model_key)
                    .await
                    .map_err(|e| e.into_port_error("preloadDraftModel"))
            }
        })
        .await?;

    let b = backend.clone();
    server
        .register_rpc::<ListLoaded, _, _>(move |_| {
            let backend = b.clone();
            async move {
                backend
                    .list_loaded()
                    .await
                    .map_err(|e| e.into_port_error("listLoaded"))
            }
        })
        .await?;

    let b = backend.clone();
    server
        .register_rpc::<GetModelInfo, _, _>(move |parameter| {
            let backend = b.clone();
            async move {
                match backend.resolve_model(&parameter.specifier).await {
                    Ok(model) => Ok(Some(model)),
                    Err(BackendError::ModelNotFound(_)) => Ok(None),
                    Err(e) => Err(e.into_port_error("getModelInfo")),
                }
            }
        })
        .await?;

    let b = backend.clone();
    server
        .register_rpc::<GetLoadConfig, _, _>(move |parameter| {
            let backend = b.clone();
            async move {
                let model = resolve_model(
                    backend.as_ref(),
                    "getLoadConfig",
                    Subject::Parameter,
                    "specifier",
                    &parameter.specifier,
                )
                .await?;
                backend
                    .load_config(&model)
                    .await
                    .map_err(|e| e.into_port_error("getLoadConfig"))
            }
        })
        .await?;

    let b = backend;
    server
        .register_rpc::<UnloadModel, _, _>(move |parameter| {
            let backend = b.clone();
            async move {
                backend
                    .unload_model(&parameter.identifier)
                    .await
                    .map_err(|e| e.into_port_error("unloadModel"))
            }
        })
        .await?;

    Ok(server)
}
