//! Creation parameters, packet unions and call payloads of every endpoint.

use serde::{Deserialize, Serialize};

use crate::kv_config::{KvConfig, KvConfigStack};
use crate::schema::{Field, PacketUnion, Shape, Variant};
use crate::session::{ServerBoundPacket, SessionEvent, SessionPacket};
use crate::types::{
    ApplyPromptTemplateOpts, ChatHistoryData, Described, LlmInstanceInfo, LlmTool,
    ModelSpecifier, PredictionFragment, PredictionStats, TokenLogprob, ToolCallRequest,
};

/// Packet enums that map onto a `type`-discriminated union.
pub trait DescribedUnion {
    fn union() -> PacketUnion;
}

/// Constructors shared by the to-client unions of both streaming endpoints.
pub trait StreamingPacket: SessionPacket + DescribedUnion {
    fn fragment(fragment: PredictionFragment) -> Self;
    fn prompt_processing_progress(progress: f64) -> Self;
    fn tool_call_generation_start() -> Self;
    fn tool_call_generation_end(tool_call_request: ToolCallRequest) -> Self;
    fn tool_call_generation_failed() -> Self;
}

fn streaming_union(fragment: Vec<Field>, success: Variant) -> PacketUnion {
    PacketUnion::new(vec![
        Variant::new("fragment", fragment),
        Variant::new(
            "promptProcessingProgress",
            vec![Field::required("progress", Shape::Number)],
        ),
        Variant::unit("toolCallGenerationStart"),
        Variant::new(
            "toolCallGenerationEnd",
            vec![Field::required("toolCallRequest", ToolCallRequest::shape())],
        ),
        Variant::unit("toolCallGenerationFailed"),
        success,
    ])
}

// ---------------------------------------------------------------------------
// predict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictCreationParameter {
    pub model_specifier: ModelSpecifier,
    pub history: ChatHistoryData,
    pub prediction_config_stack: KvConfigStack,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuzzy_preset_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_server_session_config: Option<bool>,
}

impl PredictCreationParameter {
    pub fn new(model_specifier: ModelSpecifier, history: ChatHistoryData) -> Self {
        Self {
            model_specifier,
            history,
            prediction_config_stack: KvConfigStack::new(),
            fuzzy_preset_identifier: None,
            ignore_server_session_config: None,
        }
    }

    pub fn with_config_stack(mut self, stack: KvConfigStack) -> Self {
        self.prediction_config_stack = stack;
        self
    }

    pub fn with_preset(mut self, identifier: impl Into<String>) -> Self {
        self.fuzzy_preset_identifier = Some(identifier.into());
        self
    }

    pub fn ignoring_server_session_config(mut self) -> Self {
        self.ignore_server_session_config = Some(true);
        self
    }
}

impl Described for PredictCreationParameter {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("modelSpecifier", ModelSpecifier::shape()),
            Field::required("history", ChatHistoryData::shape()),
            Field::required("predictionConfigStack", KvConfigStack::shape()),
            Field::optional("fuzzyPresetIdentifier", Shape::String),
            Field::optional("ignoreServerSessionConfig", Shape::Boolean),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PredictToClientPacket {
    Fragment {
        fragment: PredictionFragment,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        logprobs: Option<Vec<Vec<TokenLogprob>>>,
    },
    PromptProcessingProgress {
        progress: f64,
    },
    ToolCallGenerationStart,
    #[serde(rename_all = "camelCase")]
    ToolCallGenerationEnd {
        tool_call_request: ToolCallRequest,
    },
    ToolCallGenerationFailed,
    /// Authoritative record of what produced the output.
    #[serde(rename_all = "camelCase")]
    Success {
        stats: PredictionStats,
        model_info: LlmInstanceInfo,
        load_model_config: KvConfig,
        prediction_config: KvConfig,
    },
}

impl SessionPacket for PredictToClientPacket {
    fn event(&self) -> SessionEvent<'_> {
        match self {
            PredictToClientPacket::Fragment { fragment, .. } => SessionEvent::Fragment(fragment),
            PredictToClientPacket::PromptProcessingProgress { progress } => {
                SessionEvent::PromptProcessingProgress(*progress)
            }
            PredictToClientPacket::ToolCallGenerationStart => SessionEvent::ToolCallGenerationStart,
            PredictToClientPacket::ToolCallGenerationEnd { tool_call_request } => {
                SessionEvent::ToolCallGenerationEnd(tool_call_request)
            }
            PredictToClientPacket::ToolCallGenerationFailed => {
                SessionEvent::ToolCallGenerationFailed
            }
            PredictToClientPacket::Success { .. } => SessionEvent::Success,
        }
    }
}

impl StreamingPacket for PredictToClientPacket {
    fn fragment(fragment: PredictionFragment) -> Self {
        PredictToClientPacket::Fragment {
            fragment,
            logprobs: None,
        }
    }

    fn prompt_processing_progress(progress: f64) -> Self {
        PredictToClientPacket::PromptProcessingProgress { progress }
    }

    fn tool_call_generation_start() -> Self {
        PredictToClientPacket::ToolCallGenerationStart
    }

    fn tool_call_generation_end(tool_call_request: ToolCallRequest) -> Self {
        PredictToClientPacket::ToolCallGenerationEnd { tool_call_request }
    }

    fn tool_call_generation_failed() -> Self {
        PredictToClientPacket::ToolCallGenerationFailed
    }
}

impl DescribedUnion for PredictToClientPacket {
    fn union() -> PacketUnion {
        streaming_union(
            vec![
                Field::required("fragment", PredictionFragment::shape()),
                Field::optional(
                    "logprobs",
                    Shape::array(Shape::array(TokenLogprob::shape())),
                ),
            ],
            Variant::new(
                "success",
                vec![
                    Field::required("stats", PredictionStats::shape()),
                    Field::required("modelInfo", LlmInstanceInfo::shape()),
                    Field::required("loadModelConfig", KvConfig::shape()),
                    Field::required("predictionConfig", KvConfig::shape()),
                ],
            ),
        )
    }
}

/// The only client→server packet of both streaming endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelToServerPacket {
    Cancel,
}

impl ServerBoundPacket for ChannelToServerPacket {
    fn cancel() -> Self {
        ChannelToServerPacket::Cancel
    }

    fn is_cancel(&self) -> bool {
        matches!(self, ChannelToServerPacket::Cancel)
    }
}

impl DescribedUnion for ChannelToServerPacket {
    fn union() -> PacketUnion {
        PacketUnion::new(vec![Variant::unit("cancel")])
    }
}

// ---------------------------------------------------------------------------
// generateWithGenerator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorCreationParameter {
    pub plugin_identifier: String,
    pub plugin_config_stack: KvConfigStack,
    pub tools: Vec<LlmTool>,
    /// Sent as an explicit `null` when absent.
    pub working_directory_path: Option<String>,
    pub history: ChatHistoryData,
}

impl GeneratorCreationParameter {
    pub fn new(plugin_identifier: impl Into<String>, history: ChatHistoryData) -> Self {
        Self {
            plugin_identifier: plugin_identifier.into(),
            plugin_config_stack: KvConfigStack::new(),
            tools: Vec::new(),
            working_directory_path: None,
            history,
        }
    }

    pub fn with_tools(mut self, tools: Vec<LlmTool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_working_directory(mut self, path: impl Into<String>) -> Self {
        self.working_directory_path = Some(path.into());
        self
    }
}

impl Described for GeneratorCreationParameter {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("pluginIdentifier", Shape::String),
            Field::required("pluginConfigStack", KvConfigStack::shape()),
            Field::required("tools", Shape::array(LlmTool::shape())),
            Field::required("workingDirectoryPath", Shape::nullable(Shape::String)),
            Field::required("history", ChatHistoryData::shape()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GenerateToClientPacket {
    Fragment {
        fragment: PredictionFragment,
    },
    PromptProcessingProgress {
        progress: f64,
    },
    ToolCallGenerationStart,
    #[serde(rename_all = "camelCase")]
    ToolCallGenerationEnd {
        tool_call_request: ToolCallRequest,
    },
    ToolCallGenerationFailed,
    Success,
}

impl SessionPacket for GenerateToClientPacket {
    fn event(&self) -> SessionEvent<'_> {
        match self {
            GenerateToClientPacket::Fragment { fragment } => SessionEvent::Fragment(fragment),
            GenerateToClientPacket::PromptProcessingProgress { progress } => {
                SessionEvent::PromptProcessingProgress(*progress)
            }
            GenerateToClientPacket::ToolCallGenerationStart => {
                SessionEvent::ToolCallGenerationStart
            }
            GenerateToClientPacket::ToolCallGenerationEnd { tool_call_request } => {
                SessionEvent::ToolCallGenerationEnd(tool_call_request)
            }
            GenerateToClientPacket::ToolCallGenerationFailed => {
                SessionEvent::ToolCallGenerationFailed
            }
            GenerateToClientPacket::Success => SessionEvent::Success,
        }
    }
}

impl StreamingPacket for GenerateToClientPacket {
    fn fragment(fragment: PredictionFragment) -> Self {
        GenerateToClientPacket::Fragment { fragment }
    }

    fn prompt_processing_progress(progress: f64) -> Self {
        GenerateToClientPacket::PromptProcessingProgress { progress }
    }

    fn tool_call_generation_start() -> Self {
        GenerateToClientPacket::ToolCallGenerationStart
    }

    fn tool_call_generation_end(tool_call_request: ToolCallRequest) -> Self {
        GenerateToClientPacket::ToolCallGenerationEnd { tool_call_request }
    }

    fn tool_call_generation_failed() -> Self {
        GenerateToClientPacket::ToolCallGenerationFailed
    }
}

impl DescribedUnion for GenerateToClientPacket {
    fn union() -> PacketUnion {
        streaming_union(
            vec![Field::required("fragment", PredictionFragment::shape())],
            Variant::unit("success"),
        )
    }
}

macro_rules! described_union {
    ($($packet:ty),* $(,)?) => {
        $(
            impl Described for $packet {
                fn shape() -> Shape {
                    Shape::Union(<$packet as DescribedUnion>::union())
                }
            }
        )*
    };
}

described_union!(
    PredictToClientPacket,
    GenerateToClientPacket,
    ChannelToServerPacket
);

// ---------------------------------------------------------------------------
// request/response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPromptTemplateParameter {
    pub specifier: ModelSpecifier,
    pub history: ChatHistoryData,
    pub prediction_config_stack: KvConfigStack,
    pub opts: ApplyPromptTemplateOpts,
}

impl Described for ApplyPromptTemplateParameter {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("specifier", ModelSpecifier::shape()),
            Field::required("history", ChatHistoryData::shape()),
            Field::required("predictionConfigStack", KvConfigStack::shape()),
            Field::required("opts", ApplyPromptTemplateOpts::shape()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyPromptTemplateResult {
    pub formatted: String,
}

impl Described for ApplyPromptTemplateResult {
    fn shape() -> Shape {
        Shape::object(vec![Field::required("formatted", Shape::String)])
    }
}

/// Parameter shared by `tokenize` and `countTokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenizeParameter {
    pub specifier: ModelSpecifier,
    pub input_string: String,
}

impl TokenizeParameter {
    pub fn new(specifier: ModelSpecifier, input_string: impl Into<String>) -> Self {
        Self {
            specifier,
            input_string: input_string.into(),
        }
    }
}

impl Described for TokenizeParameter {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("specifier", ModelSpecifier::shape()),
            Field::required("inputString", Shape::String),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizeResult {
    pub tokens: Vec<u32>,
}

impl Described for TokenizeResult {
    fn shape() -> Shape {
        Shape::object(vec![Field::required("tokens", Shape::array(Shape::U32))])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountTokensResult {
    pub token_count: u64,
}

impl Described for CountTokensResult {
    fn shape() -> Shape {
        Shape::object(vec![Field::required("tokenCount", Shape::U64)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadDraftModelParameter {
    pub specifier: ModelSpecifier,
    pub draft_model_key: String,
}

impl Described for PreloadDraftModelParameter {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("specifier", ModelSpecifier::shape()),
            Field::required("draftModelKey", Shape::String),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListLoadedParameter {}

impl Described for ListLoadedParameter {
    fn shape() -> Shape {
        Shape::object(Vec::new())
    }
}

/// Parameter of the introspection calls addressed at one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecifierParameter {
    pub specifier: ModelSpecifier,
}

impl Described for SpecifierParameter {
    fn shape() -> Shape {
        Shape::object(vec![Field::required("specifier", ModelSpecifier::shape())])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadModelParameter {
    pub identifier: String,
}

impl Described for UnloadModelParameter {
    fn shape() -> Shape {
        Shape::object(vec![Field::required("identifier", Shape::String)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate;
    use crate::types::StopReason;
    use serde_json::json;

    fn success() -> PredictToClientPacket {
        PredictToClientPacket::Success {
            stats: PredictionStats::new(StopReason::EosFound),
            model_info: LlmInstanceInfo::new("qwen2.5-7b", "qwen"),
            load_model_config: KvConfig::new(),
            prediction_config: KvConfig::new().with("temperature", 0.7),
        }
    }

    #[test]
    fn predict_packets_match_union() {
        let union = PredictToClientPacket::union();
        let packets = vec![
            PredictToClientPacket::prompt_processing_progress(0.5),
            PredictToClientPacket::fragment(PredictionFragment::text("Hi")),
            PredictToClientPacket::Fragment {
                fragment: PredictionFragment::text("!"),
                logprobs: Some(vec![vec![TokenLogprob {
                    text: "!".to_string(),
                    logprob: -0.1,
                }]]),
            },
            PredictToClientPacket::tool_call_generation_start(),
            PredictToClientPacket::tool_call_generation_end(ToolCallRequest::function("lookup")),
            PredictToClientPacket::tool_call_generation_failed(),
            success(),
        ];
        for packet in packets {
            let value = serde_json::to_value(&packet).unwrap();
            assert!(union.validate(&value).is_ok(), "{value}");
        }
    }

    #[test]
    fn unit_packets_are_bare_type_objects() {
        assert_eq!(
            serde_json::to_value(PredictToClientPacket::ToolCallGenerationStart).unwrap(),
            json!({"type": "toolCallGenerationStart"})
        );
        assert_eq!(
            serde_json::to_value(ChannelToServerPacket::Cancel).unwrap(),
            json!({"type": "cancel"})
        );
        assert_eq!(
            serde_json::to_value(GenerateToClientPacket::Success).unwrap(),
            json!({"type": "success"})
        );
    }

    #[test]
    fn generator_success_carries_no_payload_but_predict_does() {
        let err = PredictToClientPacket::union()
            .validate(&json!({"type": "success"}))
            .unwrap_err();
        assert_eq!(err.path, "stats");
        assert!(GenerateToClientPacket::union()
            .validate(&json!({"type": "success"}))
            .is_ok());
    }

    #[test]
    fn generator_fragments_do_not_declare_logprobs() {
        let union = GenerateToClientPacket::union();
        let fragment = union.variant("fragment").unwrap();
        assert!(fragment.fields.iter().all(|f| f.name != "logprobs"));
    }

    #[test]
    fn tool_call_end_requires_request() {
        let err = PredictToClientPacket::union()
            .validate(&json!({"type": "toolCallGenerationEnd"}))
            .unwrap_err();
        assert_eq!(err.path, "toolCallRequest");
    }

    #[test]
    fn working_directory_is_sent_as_null() {
        let param = GeneratorCreationParameter::new(
            "lmstudio/rag",
            ChatHistoryData::from_user_messages(["hi"]),
        );
        let value = serde_json::to_value(&param).unwrap();
        assert_eq!(value["workingDirectoryPath"], serde_json::Value::Null);
        assert!(validate(&GeneratorCreationParameter::shape(), &value).is_ok());
    }

    #[test]
    fn predict_creation_parameter_wire_form() {
        let param = PredictCreationParameter::new(
            ModelSpecifier::identifier("qwen"),
            ChatHistoryData::from_user_messages(["Hello"]),
        )
        .with_preset("creative");
        let value = serde_json::to_value(&param).unwrap();
        assert_eq!(value["fuzzyPresetIdentifier"], json!("creative"));
        assert!(value.get("ignoreServerSessionConfig").is_none());
        assert!(validate(&PredictCreationParameter::shape(), &value).is_ok());
    }

    #[test]
    fn packet_events_follow_variants() {
        let end = PredictToClientPacket::tool_call_generation_end(ToolCallRequest::function("f"));
        assert_eq!(end.event().packet_type(), "toolCallGenerationEnd");
        assert!(success().event().is_terminal());
        assert!(!GenerateToClientPacket::fragment(PredictionFragment::text("x"))
            .event()
            .is_terminal());
    }

    #[test]
    fn rpc_payload_shapes() {
        assert!(validate(&TokenizeResult::shape(), &json!({"tokens": []})).is_ok());
        assert!(validate(&CountTokensResult::shape(), &json!({"tokenCount": 0})).is_ok());
        assert!(validate(&CountTokensResult::shape(), &json!({"tokenCount": 0.5})).is_err());
        assert!(validate(&<()>::shape(), &serde_json::to_value(()).unwrap()).is_ok());
        assert!(validate(&ListLoadedParameter::shape(), &json!({})).is_ok());
        assert!(validate(
            &<Option<LlmInstanceInfo>>::shape(),
            &serde_json::Value::Null
        )
        .is_ok());
    }
}
