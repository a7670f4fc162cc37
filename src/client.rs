//! Typed client for a backend interface.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::config::PortConfig;
use crate::connection::{ChannelEvent, Connection};
use crate::endpoint::{
    ApplyPromptTemplate, ChannelEndpoint, CountTokens, GenerateWithGenerator, GetLoadConfig,
    GetModelInfo, ListLoaded, Predict, PreloadDraftModel, RpcEndpoint, Tokenize, UnloadModel,
};
use crate::errors::PortError;
use crate::interface::BackendInterface;
use crate::kv_config::{KvConfig, KvConfigStack};
use crate::packets::{
    ApplyPromptTemplateParameter, GeneratorCreationParameter, ListLoadedParameter,
    PredictCreationParameter, PredictToClientPacket, PreloadDraftModelParameter,
    SpecifierParameter, TokenizeParameter, UnloadModelParameter,
};
use crate::schema::Direction;
use crate::session::{PredictionSession, ServerBoundPacket, SessionOutcome, SessionPacket};
use crate::streaming::{IdleWatchdog, Watched};
use crate::transport::FrameTransport;
use crate::types::{
    ApplyPromptTemplateOpts, ChatHistoryData, LlmInstanceInfo, ModelSpecifier,
    PredictionFragment, PredictionStats, ToolCallRequest,
};
use crate::wire::ClientMessage;

pub struct BackendClient {
    interface: Arc<BackendInterface>,
    config: PortConfig,
    connection: Connection,
}

impl BackendClient {
    /// Starts driving `transport`. Must be called inside a Tokio runtime.
    pub fn connect<T: FrameTransport>(
        transport: T,
        interface: BackendInterface,
        config: PortConfig,
    ) -> Self {
        Self {
            interface: Arc::new(interface),
            config,
            connection: Connection::spawn(transport),
        }
    }

    pub fn interface(&self) -> &BackendInterface {
        &self.interface
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    fn expect_kind(&self, name: &str, channel: bool) -> Result<(), PortError> {
        match self.interface.get(name) {
            None => Err(PortError::UnknownEndpoint(name.to_string())),
            Some(descriptor) if descriptor.is_channel() != channel => {
                Err(PortError::EndpointKindMismatch {
                    name: name.to_string(),
                    expected: if channel { "channel" } else { "rpc" },
                })
            }
            Some(_) => Ok(()),
        }
    }

    /// Validates the parameter, performs the call and validates the result.
    /// Fails with [`PortError::Timeout`] past the configured RPC timeout.
    pub async fn call<E: RpcEndpoint>(&self, parameter: &E::Parameter) -> Result<E::Returns, PortError> {
        self.expect_kind(E::NAME, false)?;
        let value = serde_json::to_value(parameter)?;
        self.interface.validate_creation(E::NAME, &value)?;

        let result = match tokio::time::timeout(
            self.config.rpc_timeout(),
            self.connection.call(E::NAME, value),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                debug!(endpoint = E::NAME, "call timed out");
                return Err(PortError::Timeout);
            }
        };

        self.interface.validate_returns(E::NAME, &result)?;
        Ok(serde_json::from_value(result)?)
    }

    /// Validates the creation parameter and opens a channel. A creation the
    /// server refuses surfaces as the channel's first error.
    pub async fn open_channel<E: ChannelEndpoint>(
        &self,
        creation_parameter: &E::CreationParameter,
    ) -> Result<Channel<E>, PortError> {
        self.expect_kind(E::NAME, true)?;
        let value = serde_json::to_value(creation_parameter)?;
        self.interface.validate_creation(E::NAME, &value)?;

        let (id, events) = self.connection.open_channel(E::NAME, value).await?;
        Ok(Channel::new(
            id,
            self.interface.clone(),
            self.connection.outbound(),
            events,
            &self.config,
        ))
    }

    pub async fn predict(
        &self,
        creation_parameter: &PredictCreationParameter,
    ) -> Result<Channel<Predict>, PortError> {
        self.open_channel::<Predict>(creation_parameter).await
    }

    pub async fn generate_with_generator(
        &self,
        creation_parameter: &GeneratorCreationParameter,
    ) -> Result<Channel<GenerateWithGenerator>, PortError> {
        self.open_channel::<GenerateWithGenerator>(creation_parameter)
            .await
    }

    pub async fn apply_prompt_template(
        &self,
        specifier: ModelSpecifier,
        history: ChatHistoryData,
        prediction_config_stack: KvConfigStack,
        opts: ApplyPromptTemplateOpts,
    ) -> Result<String, PortError> {
        let parameter = ApplyPromptTemplateParameter {
            specifier,
            history,
            prediction_config_stack,
            opts,
        };
        Ok(self.call::<ApplyPromptTemplate>(&parameter).await?.formatted)
    }

    pub async fn tokenize(
        &self,
        specifier: ModelSpecifier,
        input: impl Into<String>,
    ) -> Result<Vec<u32>, PortError> {
        let parameter = TokenizeParameter::new(specifier, input);
        Ok(self.call::<Tokenize>(&parameter).await?.tokens)
    }

    pub async fn count_tokens(
        &self,
        specifier: ModelSpecifier,
        input: impl Into<String>,
    ) -> Result<u64, PortError> {
        let parameter = TokenizeParameter::new(specifier, input);
        Ok(self.call::<CountTokens>(&parameter).await?.token_count)
    }

    pub async fn preload_draft_model(
        &self,
        specifier: ModelSpecifier,
        draft_model_key: impl Into<String>,
    ) -> Result<(), PortError> {
        let parameter = PreloadDraftModelParameter {
            specifier,
            draft_model_key: draft_model_key.into(),
        };
        self.call::<PreloadDraftModel>(&parameter).await
    }

    pub async fn list_loaded(&self) -> Result<Vec<LlmInstanceInfo>, PortError> {
        self.call::<ListLoaded>(&ListLoadedParameter {}).await
    }

    pub async fn get_model_info(
        &self,
        specifier: ModelSpecifier,
    ) -> Result<Option<LlmInstanceInfo>, PortError> {
        self.call::<GetModelInfo>(&SpecifierParameter { specifier })
            .await
    }

    pub async fn get_load_config(&self, specifier: ModelSpecifier) -> Result<KvConfig, PortError> {
        self.call::<GetLoadConfig>(&SpecifierParameter { specifier })
            .await
    }

    pub async fn unload_model(&self, identifier: impl Into<String>) -> Result<(), PortError> {
        let parameter = UnloadModelParameter {
            identifier: identifier.into(),
        };
        self.call::<UnloadModel>(&parameter).await
    }
}

/// Client end of one streaming session.
///
/// Every received packet is validated and applied to a local
/// [`PredictionSession`]; a packet the session rejects ends the channel with
/// an error. Dropping an unfinished channel cancels it.
pub struct Channel<E: ChannelEndpoint> {
    id: u64,
    interface: Arc<BackendInterface>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: Pin<Box<IdleWatchdog<UnboundedReceiverStream<ChannelEvent>>>>,
    session: PredictionSession,
    cancel_sent: bool,
    finished: bool,
    _endpoint: PhantomData<fn() -> E>,
}

impl<E: ChannelEndpoint> Channel<E> {
    fn new(
        id: u64,
        interface: Arc<BackendInterface>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        config: &PortConfig,
    ) -> Self {
        Self {
            id,
            interface,
            outbound,
            events: Box::pin(IdleWatchdog::new(
                UnboundedReceiverStream::new(events),
                config.inactivity_timeout(),
            )),
            session: PredictionSession::new(id),
            cancel_sent: false,
            finished: false,
            _endpoint: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Local projection: reconstructed text and last known phase.
    pub fn session(&self) -> &PredictionSession {
        &self.session
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.session.outcome()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Asks the server to stop. Idempotent; packets already in flight are
    /// still delivered and applied.
    pub fn cancel(&mut self) -> Result<(), PortError> {
        if self.finished || self.cancel_sent {
            return Ok(());
        }
        let message = serde_json::to_value(E::ToServerPacket::cancel())?;
        self.outbound
            .send(ClientMessage::ChannelSend {
                channel_id: self.id,
                message,
            })
            .map_err(|_| PortError::ConnectionClosed)?;
        self.cancel_sent = true;
        self.session.request_cancel();
        debug!(channel_id = self.id, endpoint = E::NAME, "cancel sent");
        Ok(())
    }

    /// Next packet, `None` once the channel closed cleanly.
    pub async fn next(&mut self) -> Option<Result<E::ToClientPacket, PortError>> {
        if self.finished {
            return None;
        }

        loop {
            let event = match self.events.next().await {
                Some(Watched::Item(event)) => event,
                Some(Watched::Idle) => {
                    if self.cancel_sent {
                        warn!(channel_id = self.id, endpoint = E::NAME, "no close after cancel");
                        return Some(Err(self.abort("timed out waiting for close", PortError::Timeout)));
                    }
                    warn!(channel_id = self.id, endpoint = E::NAME, "channel idle, cancelling");
                    if let Err(e) = self.cancel() {
                        return Some(Err(self.abort("cancel failed", e)));
                    }
                    continue;
                }
                None => ChannelEvent::Disconnected,
            };

            return match event {
                ChannelEvent::Packet(value) => match self.accept(value) {
                    Ok(packet) => Some(Ok(packet)),
                    Err(e) => {
                        let _ = self.cancel();
                        Some(Err(self.abort("rejected packet", e)))
                    }
                },
                ChannelEvent::Closed => {
                    self.finished = true;
                    match self.session.close() {
                        Ok(outcome) => {
                            debug!(channel_id = self.id, endpoint = E::NAME, %outcome, "channel closed");
                            None
                        }
                        Err(violation) => Some(Err(PortError::sequencing(E::NAME, violation))),
                    }
                }
                ChannelEvent::Failed(error) => {
                    debug!(channel_id = self.id, endpoint = E::NAME, "channel failed: {}", error);
                    let message = error.message.clone();
                    Some(Err(self.abort(&message, PortError::Remote(error))))
                }
                ChannelEvent::Disconnected => {
                    Some(Err(self.abort("connection closed", PortError::ConnectionClosed)))
                }
            };
        }
    }

    fn accept(&mut self, value: serde_json::Value) -> Result<E::ToClientPacket, PortError> {
        self.interface
            .validate_packet(E::NAME, Direction::ToClient, &value)?;
        let packet: E::ToClientPacket = serde_json::from_value(value)?;
        self.session
            .observe(packet.event())
            .map_err(|violation| PortError::sequencing(E::NAME, violation))?;
        Ok(packet)
    }

    fn abort(&mut self, reason: &str, error: PortError) -> PortError {
        self.finished = true;
        self.session.fail(reason);
        error
    }

    /// Drains the channel and folds it into a [`ChannelOutcome`].
    pub async fn collect(mut self) -> Result<ChannelOutcome<E::ToClientPacket>, PortError> {
        let mut terminal = None;
        while let Some(packet) = self.next().await {
            let packet = packet?;
            if packet.event().is_terminal() {
                terminal = Some(packet);
            }
        }

        Ok(ChannelOutcome {
            content: self.session.text(),
            fragments: self.session.fragments().to_vec(),
            tool_call_requests: self.session.tool_call_requests().to_vec(),
            terminal,
            cancelled: self.session.outcome() == Some(SessionOutcome::Cancelled),
        })
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<E::ToClientPacket, PortError>> {
        async_stream::stream! {
            let mut channel = self;
            while let Some(item) = channel.next().await {
                yield item;
            }
        }
    }
}

impl<E: ChannelEndpoint> Drop for Channel<E> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.cancel();
        }
    }
}

/// Everything a finished channel delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOutcome<P> {
    /// Fragments concatenated in emission order.
    pub content: String,
    pub fragments: Vec<PredictionFragment>,
    pub tool_call_requests: Vec<ToolCallRequest>,
    /// The `success` packet, absent when the session was cancelled.
    pub terminal: Option<P>,
    pub cancelled: bool,
}

impl<P> ChannelOutcome<P> {
    pub fn succeeded(&self) -> bool {
        self.terminal.is_some()
    }
}

/// The `predict` success record together with the reconstructed text.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub content: String,
    pub stats: PredictionStats,
    pub model_info: LlmInstanceInfo,
    pub load_model_config: KvConfig,
    pub prediction_config: KvConfig,
    pub tool_call_requests: Vec<ToolCallRequest>,
}

impl ChannelOutcome<PredictToClientPacket> {
    /// `None` when the prediction ended without `success`.
    pub fn into_prediction_result(self) -> Option<PredictionResult> {
        match self.terminal {
            Some(PredictToClientPacket::Success {
                stats,
                model_info,
                load_model_config,
                prediction_config,
            }) => Some(PredictionResult {
                content: self.content,
                stats,
                model_info,
                load_model_config,
                prediction_config,
                tool_call_requests: self.tool_call_requests,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{create_base_model_interface, create_llm_backend_interface};
    use crate::transport::{memory_pair, MemoryTransport};
    use crate::wire::{self, ServerMessage};
    use serde_json::json;
    use std::time::Duration;

    fn client(config: PortConfig) -> (BackendClient, MemoryTransport) {
        let (client_side, server) = memory_pair();
        let client = BackendClient::connect(
            client_side,
            create_llm_backend_interface().unwrap(),
            config,
        );
        (client, server)
    }

    fn predict_parameter() -> PredictCreationParameter {
        PredictCreationParameter::new(
            ModelSpecifier::identifier("qwen"),
            ChatHistoryData::from_user_messages(["Hello"]),
        )
    }

    async fn send(server: &mut MemoryTransport, message: ServerMessage) {
        server
            .send_frame(wire::encode(&message).unwrap())
            .await
            .unwrap();
    }

    async fn receive(server: &mut MemoryTransport) -> ClientMessage {
        let frame = server.receive_frame().await.unwrap().unwrap();
        wire::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn undeclared_endpoints_are_rejected_locally() {
        let (client_side, mut server) = memory_pair();
        let client = BackendClient::connect(
            client_side,
            create_base_model_interface().unwrap(),
            PortConfig::new(),
        );
        let parameter = TokenizeParameter::new(ModelSpecifier::identifier("qwen"), "x");
        assert!(matches!(
            client.call::<Tokenize>(&parameter).await,
            Err(PortError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            client.predict(&predict_parameter()).await,
            Err(PortError::UnknownEndpoint(_))
        ));

        drop(client);
        assert!(server.receive_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn channel_reconstructs_text_and_applies_session_rules() {
        let (client, mut server) = client(PortConfig::new());
        let mut channel = client.predict(&predict_parameter()).await.unwrap();

        let ClientMessage::ChannelCreate { channel_id, .. } = receive(&mut server).await else {
            panic!("expected channel creation");
        };
        for message in [
            json!({"type": "promptProcessingProgress", "progress": 1.0}),
            json!({"type": "fragment", "fragment": {"content": "Hi", "tokensCount": 1, "containsDrafted": false, "reasoningType": "none"}}),
            json!({"type": "toolCallGenerationEnd", "toolCallRequest": {"type": "function", "name": "f"}}),
        ] {
            send(&mut server, ServerMessage::ChannelSend { channel_id, message }).await;
        }

        assert!(matches!(
            channel.next().await,
            Some(Ok(PredictToClientPacket::PromptProcessingProgress { .. }))
        ));
        assert!(matches!(
            channel.next().await,
            Some(Ok(PredictToClientPacket::Fragment { .. }))
        ));
        assert_eq!(channel.session().text(), "Hi");

        let err = channel.next().await.unwrap().unwrap_err();
        assert!(matches!(err, PortError::Sequencing { .. }));
        assert!(channel.next().await.is_none());
        assert_eq!(channel.outcome(), Some(SessionOutcome::Failed));

        // the violation cancels the server side
        assert!(matches!(
            receive(&mut server).await,
            ClientMessage::ChannelSend { message, .. } if message == json!({"type": "cancel"})
        ));
    }

    #[tokio::test]
    async fn cancel_is_sent_once_and_close_means_cancelled() {
        let (client, mut server) = client(PortConfig::new());
        let mut channel = client.predict(&predict_parameter()).await.unwrap();
        let ClientMessage::ChannelCreate { channel_id, .. } = receive(&mut server).await else {
            panic!("expected channel creation");
        };

        channel.cancel().unwrap();
        channel.cancel().unwrap();
        assert!(matches!(receive(&mut server).await, ClientMessage::ChannelSend { .. }));

        send(&mut server, ServerMessage::ChannelClose { channel_id }).await;
        let outcome = channel.collect().await.unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.terminal.is_none());
        assert!(outcome.into_prediction_result().is_none());

        // nothing else was sent for the channel
        drop(client);
        assert!(server.receive_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_without_terminal_is_a_violation() {
        let (client, mut server) = client(PortConfig::new());
        let mut channel = client.predict(&predict_parameter()).await.unwrap();
        let ClientMessage::ChannelCreate { channel_id, .. } = receive(&mut server).await else {
            panic!("expected channel creation");
        };
        send(&mut server, ServerMessage::ChannelClose { channel_id }).await;
        assert!(matches!(
            channel.next().await,
            Some(Err(PortError::Sequencing { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_channel_is_cancelled_then_times_out() {
        let (client, mut server) = client(
            PortConfig::new().with_inactivity_timeout(Duration::from_millis(200)),
        );
        let mut channel = client.predict(&predict_parameter()).await.unwrap();
        receive(&mut server).await;

        let result = channel.next().await;
        assert!(matches!(result, Some(Err(PortError::Timeout))));
        assert!(matches!(
            receive(&mut server).await,
            ClientMessage::ChannelSend { message, .. } if message == json!({"type": "cancel"})
        ));
        assert_eq!(channel.outcome(), Some(SessionOutcome::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_time_out() {
        let (client, mut server) = client(PortConfig::new().with_rpc_timeout(Duration::from_millis(50)));
        let call = client.tokenize(ModelSpecifier::identifier("qwen"), "abc");
        let (result, _) = tokio::join!(call, receive(&mut server));
        assert!(matches!(result, Err(PortError::Timeout)));
    }

    #[tokio::test]
    async fn results_are_validated() {
        let (client, mut server) = client(PortConfig::new());
        let call = client.count_tokens(ModelSpecifier::identifier("qwen"), "abc");
        let answer = async {
            let ClientMessage::RpcCall { call_id, .. } = receive(&mut server).await else {
                panic!("expected a call");
            };
            send(
                &mut server,
                ServerMessage::RpcResult {
                    call_id,
                    result: json!({"tokenCount": "three"}),
                },
            )
            .await;
        };
        let (result, _) = tokio::join!(call, answer);
        match result {
            Err(PortError::Validation(v)) => assert_eq!(v.path, "tokenCount"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    async fn answer_with(server: &mut MemoryTransport, result: serde_json::Value) {
        let ClientMessage::RpcCall { call_id, .. } = receive(server).await else {
            panic!("expected a call");
        };
        send(server, ServerMessage::RpcResult { call_id, result }).await;
    }

    #[tokio::test]
    async fn fractional_counts_fail_validation_not_decoding() {
        let (client, mut server) = client(PortConfig::new());
        let call = client.count_tokens(ModelSpecifier::identifier("qwen"), "abc");
        let (result, _) = tokio::join!(call, answer_with(&mut server, json!({"tokenCount": 3.0})));
        match result {
            Err(PortError::Validation(v)) => assert_eq!(v.path, "tokenCount"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn token_ids_must_fit_the_typed_result() {
        let (client, mut server) = client(PortConfig::new());
        for (bad, path) in [
            (json!([1, -1]), "tokens[1]"),
            (json!([1.5]), "tokens[0]"),
            (json!([4294967296u64]), "tokens[0]"),
        ] {
            let call = client.tokenize(ModelSpecifier::identifier("qwen"), "abc");
            let (result, _) = tokio::join!(call, answer_with(&mut server, json!({ "tokens": bad })));
            match result {
                Err(PortError::Validation(v)) => assert_eq!(v.path, path),
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }
}
