use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::{Field, FieldError, PacketUnion, Shape, Variant};

/// Implemented by every type that travels on the wire, tying it to the
/// declarative shape the registry validates against.
pub trait Described {
    fn shape() -> Shape;
}

impl<T: Described> Described for Vec<T> {
    fn shape() -> Shape {
        Shape::array(T::shape())
    }
}

impl<T: Described> Described for Option<T> {
    fn shape() -> Shape {
        Shape::nullable(T::shape())
    }
}

impl Described for () {
    fn shape() -> Shape {
        Shape::Void
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<bool>,
}

impl Described for ModelQuery {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::optional("identifier", Shape::String),
            Field::optional("path", Shape::String),
            Field::optional("vision", Shape::Boolean),
        ])
    }
}

/// Selects a loaded model instance; resolution happens in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ModelSpecifier {
    Query {
        query: ModelQuery,
    },
    #[serde(rename_all = "camelCase")]
    InstanceReference {
        instance_reference: String,
    },
}

impl ModelSpecifier {
    pub fn identifier(identifier: impl Into<String>) -> Self {
        ModelSpecifier::Query {
            query: ModelQuery {
                identifier: Some(identifier.into()),
                ..ModelQuery::default()
            },
        }
    }

    pub fn instance(reference: impl Into<String>) -> Self {
        ModelSpecifier::InstanceReference {
            instance_reference: reference.into(),
        }
    }
}

impl Described for ModelSpecifier {
    fn shape() -> Shape {
        Shape::Union(PacketUnion::new(vec![
            Variant::new("query", vec![Field::required("query", ModelQuery::shape())]),
            Variant::new(
                "instanceReference",
                vec![Field::required("instanceReference", Shape::String)],
            ),
        ]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Assistant,
    User,
    System,
    Tool,
}

const CHAT_ROLES: &[&str] = &["assistant", "user", "system", "tool"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatMessagePart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        name: String,
        identifier: String,
        size_bytes: u64,
        file_type: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallRequest {
        tool_call_request: ToolCallRequest,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallResult {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },
}

impl ChatMessagePart {
    fn type_name(&self) -> &'static str {
        match self {
            ChatMessagePart::Text { .. } => "text",
            ChatMessagePart::File { .. } => "file",
            ChatMessagePart::ToolCallRequest { .. } => "toolCallRequest",
            ChatMessagePart::ToolCallResult { .. } => "toolCallResult",
        }
    }
}

impl Described for ChatMessagePart {
    fn shape() -> Shape {
        Shape::Union(PacketUnion::new(vec![
            Variant::new("text", vec![Field::required("text", Shape::String)]),
            Variant::new(
                "file",
                vec![
                    Field::required("name", Shape::String),
                    Field::required("identifier", Shape::String),
                    Field::required("sizeBytes", Shape::U64),
                    Field::required("fileType", Shape::String),
                ],
            ),
            Variant::new(
                "toolCallRequest",
                vec![Field::required("toolCallRequest", ToolCallRequest::shape())],
            ),
            Variant::new(
                "toolCallResult",
                vec![
                    Field::required("content", Shape::String),
                    Field::optional("toolCallId", Shape::String),
                ],
            ),
        ]))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageData {
    pub role: ChatRole,
    pub content: Vec<ChatMessagePart>,
}

impl ChatMessageData {
    pub fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ChatMessagePart::Text { text: text.into() }],
        }
    }

    /// Concatenated text parts of the message.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ChatMessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Described for ChatMessageData {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("role", Shape::Enum(CHAT_ROLES)),
            Field::required("content", Shape::array(ChatMessagePart::shape())),
        ])
    }
}

/// Ordered conversation turns handed to a session. Never mutated by the protocol.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatHistoryData {
    pub messages: Vec<ChatMessageData>,
}

impl ChatHistoryData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_user_messages<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            messages: messages
                .into_iter()
                .map(|text| ChatMessageData::text(ChatRole::User, text))
                .collect(),
        }
    }

    pub fn with_message(mut self, message: ChatMessageData) -> Self {
        self.messages.push(message);
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Checks role/part combinations the shape alone cannot express.
    pub fn check_well_formed(&self) -> Result<(), FieldError> {
        for (m, message) in self.messages.iter().enumerate() {
            for (p, part) in message.content.iter().enumerate() {
                let allowed = match (message.role, part) {
                    (ChatRole::Tool, ChatMessagePart::ToolCallResult { .. }) => true,
                    (ChatRole::Tool, _) => false,
                    (_, ChatMessagePart::ToolCallResult { .. }) => false,
                    (ChatRole::Assistant, ChatMessagePart::ToolCallRequest { .. }) => true,
                    (_, ChatMessagePart::ToolCallRequest { .. }) => false,
                    _ => true,
                };
                if !allowed {
                    return Err(FieldError::new(
                        format!("messages[{m}].content[{p}]"),
                        format!(
                            "{} part is not allowed in a {:?} message",
                            part.type_name(),
                            message.role
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Described for ChatHistoryData {
    fn shape() -> Shape {
        Shape::object(vec![Field::required(
            "messages",
            Shape::array(ChatMessageData::shape()),
        )])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallKind {
    #[default]
    Function,
}

/// A structured request to invoke an external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(rename = "type")]
    pub kind: ToolCallKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

impl ToolCallRequest {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            kind: ToolCallKind::Function,
            id: None,
            name: name.into(),
            arguments: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

impl Described for ToolCallRequest {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("type", Shape::Literal("function")),
            Field::optional("id", Shape::String),
            Field::required("name", Shape::String),
            Field::optional("arguments", Shape::record(Shape::Any)),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmTool {
    #[serde(rename = "type")]
    pub kind: ToolCallKind,
    pub function: LlmToolFunction,
}

impl LlmTool {
    pub fn function(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: ToolCallKind::Function,
            function: LlmToolFunction {
                name: name.into(),
                description: Some(description.into()),
                parameters: None,
            },
        }
    }
}

impl Described for LlmTool {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("type", Shape::Literal("function")),
            Field::required(
                "function",
                Shape::object(vec![
                    Field::required("name", Shape::String),
                    Field::optional("description", Shape::String),
                    Field::optional("parameters", Shape::record(Shape::Any)),
                ]),
            ),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasoningType {
    #[default]
    None,
    Reasoning,
    ReasoningStartTag,
    ReasoningEndTag,
}

const REASONING_TYPES: &[&str] = &["none", "reasoning", "reasoningStartTag", "reasoningEndTag"];

/// Incremental unit of generated text. Apply in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionFragment {
    pub content: String,
    pub tokens_count: u32,
    pub contains_drafted: bool,
    pub reasoning_type: ReasoningType,
}

impl PredictionFragment {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tokens_count: 1,
            contains_drafted: false,
            reasoning_type: ReasoningType::None,
        }
    }

    pub fn with_tokens_count(mut self, tokens_count: u32) -> Self {
        self.tokens_count = tokens_count;
        self
    }

    pub fn with_reasoning_type(mut self, reasoning_type: ReasoningType) -> Self {
        self.reasoning_type = reasoning_type;
        self
    }

    pub fn drafted(mut self) -> Self {
        self.contains_drafted = true;
        self
    }
}

impl Described for PredictionFragment {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("content", Shape::String),
            Field::required("tokensCount", Shape::U32),
            Field::required("containsDrafted", Shape::Boolean),
            Field::required("reasoningType", Shape::Enum(REASONING_TYPES)),
        ])
    }
}

/// One candidate at a token position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub text: String,
    pub logprob: f64,
}

impl Described for TokenLogprob {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("text", Shape::String),
            Field::required("logprob", Shape::Number),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    UserStopped,
    ModelUnloaded,
    Failed,
    EosFound,
    StopStringFound,
    ToolCalls,
    MaxPredictedTokensReached,
    ContextLengthReached,
}

const STOP_REASONS: &[&str] = &[
    "userStopped",
    "modelUnloaded",
    "failed",
    "eosFound",
    "stopStringFound",
    "toolCalls",
    "maxPredictedTokensReached",
    "contextLengthReached",
];

/// Terminal metrics, only ever attached to a success packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionStats {
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_tokens_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_draft_model_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_draft_tokens_count: Option<u64>,
}

impl PredictionStats {
    pub fn new(stop_reason: StopReason) -> Self {
        Self {
            stop_reason,
            tokens_per_second: None,
            time_to_first_token_sec: None,
            prompt_tokens_count: None,
            predicted_tokens_count: None,
            total_tokens_count: None,
            used_draft_model_key: None,
            accepted_draft_tokens_count: None,
        }
    }

    pub fn with_token_counts(mut self, prompt: u64, predicted: u64) -> Self {
        self.prompt_tokens_count = Some(prompt);
        self.predicted_tokens_count = Some(predicted);
        self.total_tokens_count = Some(prompt + predicted);
        self
    }

    pub fn with_timing(mut self, tokens_per_second: f64, time_to_first_token_sec: f64) -> Self {
        self.tokens_per_second = Some(tokens_per_second);
        self.time_to_first_token_sec = Some(time_to_first_token_sec);
        self
    }
}

impl Described for PredictionStats {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("stopReason", Shape::Enum(STOP_REASONS)),
            Field::optional("tokensPerSecond", Shape::Number),
            Field::optional("timeToFirstTokenSec", Shape::Number),
            Field::optional("promptTokensCount", Shape::U64),
            Field::optional("predictedTokensCount", Shape::U64),
            Field::optional("totalTokensCount", Shape::U64),
            Field::optional("usedDraftModelKey", Shape::String),
            Field::optional("acceptedDraftTokensCount", Shape::U64),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Llm,
}

/// Description of a loaded LLM instance as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmInstanceInfo {
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub model_key: String,
    pub format: String,
    pub display_name: String,
    pub path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub identifier: String,
    pub instance_reference: String,
    pub vision: bool,
    pub trained_for_tool_use: bool,
    pub max_context_length: u64,
    pub context_length: u64,
}

impl LlmInstanceInfo {
    pub fn new(model_key: impl Into<String>, identifier: impl Into<String>) -> Self {
        let model_key = model_key.into();
        let identifier = identifier.into();
        Self {
            kind: ModelKind::Llm,
            display_name: model_key.clone(),
            path: model_key.clone(),
            model_key,
            format: "gguf".to_string(),
            size_bytes: 0,
            architecture: None,
            instance_reference: format!("{identifier}-instance"),
            identifier,
            vision: false,
            trained_for_tool_use: false,
            max_context_length: 4096,
            context_length: 4096,
        }
    }

    /// Whether the specifier selects this instance.
    pub fn matches(&self, specifier: &ModelSpecifier) -> bool {
        match specifier {
            ModelSpecifier::InstanceReference { instance_reference } => {
                &self.instance_reference == instance_reference
            }
            ModelSpecifier::Query { query } => {
                query
                    .identifier
                    .as_ref()
                    .map_or(true, |id| id == &self.identifier || id == &self.model_key)
                    && query.path.as_ref().map_or(true, |path| path == &self.path)
                    && query.vision.map_or(true, |vision| vision == self.vision)
            }
        }
    }
}

impl Described for LlmInstanceInfo {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::required("type", Shape::Literal("llm")),
            Field::required("modelKey", Shape::String),
            Field::required("format", Shape::String),
            Field::required("displayName", Shape::String),
            Field::required("path", Shape::String),
            Field::required("sizeBytes", Shape::U64),
            Field::optional("architecture", Shape::String),
            Field::required("identifier", Shape::String),
            Field::required("instanceReference", Shape::String),
            Field::required("vision", Shape::Boolean),
            Field::required("trainedForToolUse", Shape::Boolean),
            Field::required("maxContextLength", Shape::U64),
            Field::required("contextLength", Shape::U64),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPromptTemplateOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit_bos_token: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit_eos_token: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_definitions: Option<Vec<LlmTool>>,
}

impl Described for ApplyPromptTemplateOpts {
    fn shape() -> Shape {
        Shape::object(vec![
            Field::optional("omitBosToken", Shape::Boolean),
            Field::optional("omitEosToken", Shape::Boolean),
            Field::optional("toolDefinitions", Shape::array(LlmTool::shape())),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate;
    use serde_json::json;

    fn conforms<T: Described + Serialize>(value: &T) {
        let json = serde_json::to_value(value).unwrap();
        if let Err(err) = validate(&T::shape(), &json) {
            panic!("{json} does not match its shape: {err:?}");
        }
    }

    #[test]
    fn serialized_values_match_their_shapes() {
        conforms(&ModelSpecifier::identifier("qwen"));
        conforms(&ModelSpecifier::instance("abc"));
        conforms(&ChatHistoryData::from_user_messages(["Hello"]));
        conforms(
            &ToolCallRequest::function("lookup")
                .with_id("call-1")
                .with_arguments(json!({"q": "rust"}).as_object().unwrap().clone()),
        );
        conforms(&PredictionFragment::text("Hi").drafted());
        conforms(&PredictionStats::new(StopReason::EosFound).with_token_counts(3, 2));
        conforms(&LlmInstanceInfo::new("qwen2.5-7b", "qwen"));
        conforms(&LlmTool::function("lookup", "Looks things up"));
        conforms(&ApplyPromptTemplateOpts::default());
        conforms(&TokenLogprob {
            text: "Hi".to_string(),
            logprob: -0.25,
        });
    }

    #[test]
    fn model_specifier_wire_form() {
        assert_eq!(
            serde_json::to_value(ModelSpecifier::instance("ref-1")).unwrap(),
            json!({"type": "instanceReference", "instanceReference": "ref-1"})
        );
        assert_eq!(
            serde_json::to_value(ModelSpecifier::identifier("qwen")).unwrap(),
            json!({"type": "query", "query": {"identifier": "qwen"}})
        );
    }

    #[test]
    fn instance_matching_by_identifier_and_reference() {
        let info = LlmInstanceInfo::new("qwen2.5-7b", "qwen");
        assert!(info.matches(&ModelSpecifier::identifier("qwen")));
        assert!(info.matches(&ModelSpecifier::identifier("qwen2.5-7b")));
        assert!(info.matches(&ModelSpecifier::instance("qwen-instance")));
        assert!(!info.matches(&ModelSpecifier::identifier("llama")));
    }

    #[test]
    fn tool_results_only_in_tool_messages() {
        let history = ChatHistoryData::new().with_message(ChatMessageData {
            role: ChatRole::User,
            content: vec![ChatMessagePart::ToolCallResult {
                content: "42".to_string(),
                tool_call_id: None,
            }],
        });
        let err = history.check_well_formed().unwrap_err();
        assert_eq!(err.path, "messages[0].content[0]");
    }

    #[test]
    fn tool_call_requests_only_from_assistant() {
        let ok = ChatHistoryData::from_user_messages(["What is 6*7?"])
            .with_message(ChatMessageData {
                role: ChatRole::Assistant,
                content: vec![ChatMessagePart::ToolCallRequest {
                    tool_call_request: ToolCallRequest::function("multiply"),
                }],
            })
            .with_message(ChatMessageData {
                role: ChatRole::Tool,
                content: vec![ChatMessagePart::ToolCallResult {
                    content: "42".to_string(),
                    tool_call_id: Some("call-1".to_string()),
                }],
            });
        assert!(ok.check_well_formed().is_ok());

        let bad = ChatHistoryData::new().with_message(ChatMessageData {
            role: ChatRole::System,
            content: vec![ChatMessagePart::ToolCallRequest {
                tool_call_request: ToolCallRequest::function("multiply"),
            }],
        });
        assert!(bad.check_well_formed().is_err());
    }

    #[test]
    fn text_content_skips_non_text_parts() {
        let message = ChatMessageData {
            role: ChatRole::User,
            content: vec![
                ChatMessagePart::Text {
                    text: "see ".to_string(),
                },
                ChatMessagePart::File {
                    name: "a.png".to_string(),
                    identifier: "f1".to_string(),
                    size_bytes: 10,
                    file_type: "image".to_string(),
                },
                ChatMessagePart::Text {
                    text: "this".to_string(),
                },
            ],
        };
        assert_eq!(message.text_content(), "see this");
    }
}
