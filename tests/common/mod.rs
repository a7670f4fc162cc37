#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use llmport::backend::{BackendError, GenerationRequest, LlmBackend, PredictionRequest};
use llmport::packets::{GenerateToClientPacket, PredictToClientPacket};
use llmport::preset::Preset;
use llmport::types::{
    ApplyPromptTemplateOpts, ChatHistoryData, ChatRole, LlmInstanceInfo, PredictionStats,
    StopReason, ToolCallRequest,
};
use llmport::{
    create_llm_backend_interface, llm_backend_server, memory_pair, BackendClient, KvConfig,
    PortConfig, PortError, SessionSink,
};
use tokio::task::JoinHandle;

pub const MODEL_KEY: &str = "qwen2.5-7b-instruct";
pub const MODEL_ID: &str = "qwen";

/// One step a scripted prediction takes before the caller sends `success`.
#[derive(Debug, Clone)]
pub enum Step {
    Progress(f64),
    Text(&'static str),
    ToolCallStart,
    ToolCallEnd(ToolCallRequest),
    ToolCallFailed,
    Sleep(Duration),
    Fail(&'static str),
}

/// In-process stand-in for an inference engine.
pub struct ScriptedBackend {
    pub models: Vec<LlmInstanceInfo>,
    pub script: Vec<Step>,
    pub defaults: KvConfig,
    pub session_config: KvConfig,
    pub presets: Vec<Preset>,
    pub load_config: KvConfig,
    pub last_request: Mutex<Option<PredictionRequest>>,
    pub last_sink: Mutex<Option<SessionSink<PredictToClientPacket>>>,
    pub preloaded: Mutex<Vec<String>>,
    pub unloaded: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            models: vec![LlmInstanceInfo::new(MODEL_KEY, MODEL_ID)],
            script,
            defaults: KvConfig::new(),
            session_config: KvConfig::new(),
            presets: Vec::new(),
            load_config: KvConfig::new(),
            last_request: Mutex::new(None),
            last_sink: Mutex::new(None),
            preloaded: Mutex::new(Vec::new()),
            unloaded: Mutex::new(Vec::new()),
        }
    }

    pub fn hello() -> Self {
        Self::new(vec![
            Step::Progress(1.0),
            Step::Text("Hi"),
            Step::Text(" there"),
        ])
    }

    pub fn last_request(&self) -> Option<PredictionRequest> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn last_sink(&self) -> Option<SessionSink<PredictToClientPacket>> {
        self.last_sink.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn list_loaded(&self) -> Result<Vec<LlmInstanceInfo>, BackendError> {
        Ok(self.models.clone())
    }

    async fn load_config(&self, _model: &LlmInstanceInfo) -> Result<KvConfig, BackendError> {
        Ok(self.load_config.clone())
    }

    fn prediction_defaults(&self) -> KvConfig {
        self.defaults.clone()
    }

    fn server_session_config(&self) -> KvConfig {
        self.session_config.clone()
    }

    fn presets(&self) -> Vec<Preset> {
        self.presets.clone()
    }

    async fn predict(
        &self,
        request: PredictionRequest,
        sink: &SessionSink<PredictToClientPacket>,
    ) -> Result<PredictionStats, BackendError> {
        *self.last_request.lock().unwrap() = Some(request);
        *self.last_sink.lock().unwrap() = Some(sink.clone());

        let mut predicted = 0;
        let mut stop_reason = StopReason::EosFound;
        for step in &self.script {
            match step {
                Step::Progress(progress) => sink.progress(*progress).await?,
                Step::Text(text) => {
                    predicted += 1;
                    sink.text(*text).await?
                }
                Step::ToolCallStart => sink.tool_call_start().await?,
                Step::ToolCallEnd(request) => {
                    stop_reason = StopReason::ToolCalls;
                    sink.tool_call_end(request.clone()).await?
                }
                Step::ToolCallFailed => sink.tool_call_failed().await?,
                Step::Sleep(duration) => tokio::time::sleep(*duration).await,
                Step::Fail(reason) => return Err(BackendError::Generation(reason.to_string())),
            }
        }
        Ok(PredictionStats::new(stop_reason).with_token_counts(1, predicted))
    }

    async fn generate_with_generator(
        &self,
        request: GenerationRequest,
        sink: &SessionSink<GenerateToClientPacket>,
    ) -> Result<(), BackendError> {
        if request.plugin_identifier != "echo" {
            return Err(BackendError::PluginNotFound(request.plugin_identifier));
        }
        let last = request
            .history
            .messages
            .iter()
            .rev()
            .find(|message| message.role == ChatRole::User)
            .map(|message| message.text_content())
            .unwrap_or_default();
        for word in last.split_inclusive(' ') {
            sink.text(word).await?;
        }
        Ok(())
    }

    async fn apply_prompt_template(
        &self,
        _model: &LlmInstanceInfo,
        history: &ChatHistoryData,
        _config: &KvConfig,
        opts: &ApplyPromptTemplateOpts,
    ) -> Result<String, BackendError> {
        let mut formatted = String::new();
        if opts.omit_bos_token != Some(true) {
            formatted.push_str("<s>");
        }
        for message in &history.messages {
            formatted.push_str(&format!("<{:?}>{}", message.role, message.text_content()));
        }
        Ok(formatted)
    }

    async fn tokenize(&self, _model: &LlmInstanceInfo, input: &str) -> Result<Vec<u32>, BackendError> {
        Ok(input.bytes().map(u32::from).collect())
    }

    async fn preload_draft_model(
        &self,
        _model: &LlmInstanceInfo,
        draft_model_key: &str,
    ) -> Result<(), BackendError> {
        if draft_model_key.is_empty() {
            return Err(BackendError::ModelNotFound("draft model".to_string()));
        }
        self.preloaded.lock().unwrap().push(draft_model_key.to_string());
        Ok(())
    }

    async fn unload_model(&self, identifier: &str) -> Result<(), BackendError> {
        if !self.models.iter().any(|model| model.identifier == identifier) {
            return Err(BackendError::ModelNotFound(identifier.to_string()));
        }
        self.unloaded.lock().unwrap().push(identifier.to_string());
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serves `backend` over an in-memory transport and connects a client to it.
pub async fn connect(
    backend: Arc<ScriptedBackend>,
    config: PortConfig,
) -> (BackendClient, JoinHandle<Result<(), PortError>>) {
    init_tracing();
    let server = llm_backend_server(backend, config.clone())
        .await
        .expect("server wiring");
    let (client_side, server_side) = memory_pair();
    let handle = tokio::spawn(async move { server.serve(server_side).await });
    let client = BackendClient::connect(
        client_side,
        create_llm_backend_interface().expect("interface"),
        config,
    );
    (client, handle)
}
