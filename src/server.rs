//! Server side of the contract: a handler registry and the loop that serves
//! one connection.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::endpoint::{ChannelEndpoint, RpcEndpoint};
use crate::errors::PortError;
use crate::handler::{
    is_cancel_packet, ChannelContext, ChannelHandler, ChannelHandlerFn, RpcHandlerFn,
};
use crate::interface::BackendInterface;
use crate::packets::{PredictToClientPacket, StreamingPacket};
use crate::schema::Direction;
use crate::session::{PredictionSession, SessionOutcome, SessionPacket, SessionPhase};
use crate::transport::FrameTransport;
use crate::types::{PredictionFragment, TokenLogprob, ToolCallRequest};
use crate::wire::{self, ClientMessage, ServerMessage, WireError, WireErrorKind};

#[derive(Clone)]
pub struct BackendServer {
    interface: Arc<BackendInterface>,
    config: PortConfig,
    rpc_handlers: Arc<RwLock<HashMap<String, RpcHandlerFn>>>,
    channel_handlers: Arc<RwLock<HashMap<String, ChannelHandler>>>,
}

struct OpenChannel {
    endpoint: String,
    cancel: CancellationToken,
    is_cancel: fn(&Value) -> bool,
}

impl BackendServer {
    pub fn new(interface: BackendInterface, config: PortConfig) -> Self {
        Self {
            interface: Arc::new(interface),
            config,
            rpc_handlers: Arc::new(RwLock::new(HashMap::new())),
            channel_handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn interface(&self) -> &BackendInterface {
        &self.interface
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    fn expect_kind(&self, name: &str, channel: bool) -> Result<(), PortError> {
        let descriptor = self
            .interface
            .get(name)
            .ok_or_else(|| PortError::UnknownEndpoint(name.to_string()))?;
        if descriptor.is_channel() != channel {
            return Err(PortError::EndpointKindMismatch {
                name: name.to_string(),
                expected: if channel { "channel" } else { "rpc" },
            });
        }
        Ok(())
    }

    /// Registers the handler of a request/response endpoint declared by the
    /// interface. A later registration for the same endpoint replaces the
    /// earlier one.
    pub async fn register_rpc<E, F, Fut>(&self, handler: F) -> Result<(), PortError>
    where
        E: RpcEndpoint,
        F: Fn(E::Parameter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E::Returns, PortError>> + Send + 'static,
    {
        self.expect_kind(E::NAME, false)?;

        let handler = Arc::new(handler);
        let erased: RpcHandlerFn = Arc::new(move |params: Value| {
            let handler = handler.clone();
            Box::pin(async move {
                let request: E::Parameter = serde_json::from_value(params)?;
                let response = handler(request).await?;
                Ok(serde_json::to_value(&response)?)
            })
        });

        let mut handlers = self.rpc_handlers.write().await;
        handlers.insert(E::NAME.to_string(), erased);
        Ok(())
    }

    /// Registers the handler of a channel endpoint. The handler owns the
    /// session through its [`SessionSink`] and must end it with a terminal
    /// packet unless it is cancelled first.
    pub async fn register_channel<E, F, Fut>(&self, handler: F) -> Result<(), PortError>
    where
        E: ChannelEndpoint,
        F: Fn(E::CreationParameter, SessionSink<E::ToClientPacket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PortError>> + Send + 'static,
    {
        self.expect_kind(E::NAME, true)?;

        let handler = Arc::new(handler);
        let run: ChannelHandlerFn = Arc::new(move |context: ChannelContext| {
            let handler = handler.clone();
            Box::pin(run_channel::<E, F, Fut>(handler, context))
        });

        let mut handlers = self.channel_handlers.write().await;
        handlers.insert(
            E::NAME.to_string(),
            ChannelHandler {
                run,
                is_cancel: is_cancel_packet::<E::ToServerPacket>,
            },
        );
        Ok(())
    }

    /// Serves one connection until the peer closes it. Open channels are
    /// cancelled when the transport goes away.
    pub async fn serve<T: FrameTransport>(&self, mut transport: T) -> Result<(), PortError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut channels: HashMap<u64, OpenChannel> = HashMap::new();

        let result = loop {
            tokio::select! {
                frame = transport.receive_frame() => {
                    match frame {
                        Ok(Some(frame)) => {
                            self.dispatch(&frame, &outbound_tx, &mut channels).await;
                        }
                        Ok(None) => {
                            debug!("transport closed by peer");
                            break Ok(());
                        }
                        Err(e) => {
                            warn!("transport error: {}", e);
                            break Err(e);
                        }
                    }
                }
                Some(message) = outbound_rx.recv() => {
                    if !forward_allowed(&message, &mut channels) {
                        continue;
                    }
                    let frame = match wire::encode(&message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("failed to encode outbound message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = transport.send_frame(frame).await {
                        warn!("failed to send frame: {}", e);
                        break Err(e);
                    }
                }
            }
        };

        for (channel_id, channel) in channels.drain() {
            debug!(channel_id, endpoint = %channel.endpoint, "cancelling channel on disconnect");
            channel.cancel.cancel();
        }
        result
    }

    async fn dispatch(
        &self,
        frame: &[u8],
        outbound: &mpsc::UnboundedSender<ServerMessage>,
        channels: &mut HashMap<u64, OpenChannel>,
    ) {
        let message: ClientMessage = match wire::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        };

        match message {
            ClientMessage::RpcCall {
                call_id,
                endpoint,
                parameter,
            } => {
                let handler = self.rpc_handlers.read().await.get(&endpoint).cloned();
                let interface = self.interface.clone();
                let validate_outgoing = self.config.validate_outgoing();
                let outbound = outbound.clone();
                let kind_check = self.expect_kind(&endpoint, false);

                tokio::spawn(async move {
                    let result = async {
                        kind_check?;
                        interface.validate_creation(&endpoint, &parameter)?;
                        let handler = handler.ok_or_else(|| {
                            PortError::InternalError(format!("No handler registered for {endpoint}"))
                        })?;
                        let value = handler(parameter).await?;
                        if validate_outgoing {
                            interface.validate_returns(&endpoint, &value)?;
                        }
                        Ok::<_, PortError>(value)
                    }
                    .await;

                    let response = match result {
                        Ok(result) => ServerMessage::RpcResult { call_id, result },
                        Err(e) => {
                            debug!(call_id, endpoint = %endpoint, "call failed: {}", e);
                            ServerMessage::RpcError {
                                call_id,
                                error: e.to_wire(&endpoint),
                            }
                        }
                    };
                    let _ = outbound.send(response);
                });
            }

            ClientMessage::ChannelCreate {
                channel_id,
                endpoint,
                creation_parameter,
            } => {
                if let Some(existing) = channels.get(&channel_id) {
                    warn!(channel_id, "channel id reused while still open");
                    existing.cancel.cancel();
                    let _ = outbound.send(ServerMessage::ChannelError {
                        channel_id,
                        error: WireError::protocol(
                            endpoint,
                            format!("Channel {channel_id} is already open"),
                        ),
                    });
                    return;
                }

                let handler = self.channel_handlers.read().await.get(&endpoint).cloned();
                let cancel = CancellationToken::new();
                // Tracked before acceptance so a refusal passes the forward filter once.
                channels.insert(
                    channel_id,
                    OpenChannel {
                        endpoint: endpoint.clone(),
                        cancel: cancel.clone(),
                        is_cancel: handler
                            .as_ref()
                            .map_or(never_cancel as fn(&Value) -> bool, |h| h.is_cancel),
                    },
                );

                let accepted = self
                    .expect_kind(&endpoint, true)
                    .and_then(|_| self.interface.validate_creation(&endpoint, &creation_parameter))
                    .and_then(|_| {
                        handler.ok_or_else(|| {
                            PortError::InternalError(format!("No handler registered for {endpoint}"))
                        })
                    });

                let handler = match accepted {
                    Ok(handler) => handler,
                    Err(e) => {
                        info!(channel_id, endpoint = %endpoint, "channel refused: {}", e);
                        let _ = outbound.send(ServerMessage::ChannelError {
                            channel_id,
                            error: e.to_wire(&endpoint),
                        });
                        return;
                    }
                };
                debug!(channel_id, endpoint = %endpoint, "channel opened");

                let context = ChannelContext {
                    channel_id,
                    creation_parameter,
                    outbound: outbound.clone(),
                    cancel,
                    interface: self.interface.clone(),
                    validate_outgoing: self.config.validate_outgoing(),
                };
                tokio::spawn((handler.run)(context));
            }

            ClientMessage::ChannelSend {
                channel_id,
                message,
            } => {
                let Some(channel) = channels.get(&channel_id) else {
                    // Cancel racing a close: the session is already gone.
                    debug!(channel_id, "message for closed channel ignored");
                    return;
                };

                if let Err(e) =
                    self.interface
                        .validate_packet(&channel.endpoint, Direction::ToServer, &message)
                {
                    warn!(channel_id, endpoint = %channel.endpoint, "invalid client packet: {}", e);
                    let error = e.to_wire(&channel.endpoint);
                    channel.cancel.cancel();
                    let _ = outbound.send(ServerMessage::ChannelError { channel_id, error });
                    return;
                }

                if (channel.is_cancel)(&message) {
                    if !channel.cancel.is_cancelled() {
                        info!(channel_id, endpoint = %channel.endpoint, "cancel observed");
                    }
                    channel.cancel.cancel();
                }
            }
        }
    }
}

fn never_cancel(_: &Value) -> bool {
    false
}

/// Lets at most one closing message through per channel and drops anything
/// sent for a channel after it closed.
fn forward_allowed(message: &ServerMessage, channels: &mut HashMap<u64, OpenChannel>) -> bool {
    match message {
        ServerMessage::RpcResult { .. } | ServerMessage::RpcError { .. } => true,
        ServerMessage::ChannelSend { channel_id, .. } => channels.contains_key(channel_id),
        ServerMessage::ChannelClose { channel_id }
        | ServerMessage::ChannelError { channel_id, .. } => channels.remove(channel_id).is_some(),
    }
}

async fn run_channel<E, F, Fut>(handler: Arc<F>, context: ChannelContext)
where
    E: ChannelEndpoint,
    F: Fn(E::CreationParameter, SessionSink<E::ToClientPacket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PortError>> + Send + 'static,
{
    let channel_id = context.channel_id;
    let outbound = context.outbound.clone();
    let cancel = context.cancel.clone();

    let parameter: E::CreationParameter = match serde_json::from_value(context.creation_parameter)
    {
        Ok(parameter) => parameter,
        Err(e) => {
            let error = PortError::from(e).to_wire(E::NAME);
            let _ = outbound.send(ServerMessage::ChannelError { channel_id, error });
            return;
        }
    };

    let sink = SessionSink::<E::ToClientPacket>::new(
        E::NAME,
        channel_id,
        context.outbound,
        context.cancel,
        context.interface,
        context.validate_outgoing,
    );

    let result = tokio::select! {
        result = handler(parameter, sink.clone()) => Some(result),
        _ = cancel.cancelled() => None,
    };

    let error = match result {
        None | Some(Ok(())) | Some(Err(PortError::Cancelled)) => None,
        Some(Err(e)) => Some(e),
    };

    let mut session = sink.session.lock().await;
    let closing = match (session.phase(), error) {
        (SessionPhase::Terminated(SessionOutcome::Success), error) => {
            if let Some(e) = error {
                warn!(channel_id, endpoint = E::NAME, "handler failed after success: {}", e);
            }
            debug!(channel_id, endpoint = E::NAME, "session completed");
            ServerMessage::ChannelClose { channel_id }
        }
        (SessionPhase::Terminated(SessionOutcome::Failed), error) => {
            let error = error.map(|e| e.to_wire(E::NAME)).unwrap_or_else(|| WireError {
                kind: WireErrorKind::Sequencing,
                endpoint: E::NAME.to_string(),
                message: session.failure().unwrap_or("session failed").to_string(),
                path: None,
            });
            ServerMessage::ChannelError { channel_id, error }
        }
        (phase, Some(e)) => {
            if phase == SessionPhase::Created {
                info!(channel_id, endpoint = E::NAME, "channel refused: {}", e);
            } else {
                warn!(channel_id, endpoint = E::NAME, "session failed: {}", e);
            }
            session.fail(e.to_string());
            ServerMessage::ChannelError {
                channel_id,
                error: e.to_wire(E::NAME),
            }
        }
        (_, None) if cancel.is_cancelled() => {
            session.cancel();
            debug!(channel_id, endpoint = E::NAME, "session cancelled");
            ServerMessage::ChannelClose { channel_id }
        }
        (SessionPhase::Terminated(SessionOutcome::Cancelled), None) => {
            ServerMessage::ChannelClose { channel_id }
        }
        (_, None) => {
            let error = match session.close() {
                Ok(_) => None,
                Err(violation) => Some(PortError::sequencing(E::NAME, violation)),
            };
            match error {
                Some(e) => {
                    warn!(channel_id, endpoint = E::NAME, "{}", e);
                    ServerMessage::ChannelError {
                        channel_id,
                        error: e.to_wire(E::NAME),
                    }
                }
                None => ServerMessage::ChannelClose { channel_id },
            }
        }
    };
    let _ = outbound.send(closing);
}

/// Server-side handle on one streaming session. Every packet goes through
/// the session state machine before it reaches the wire; a rejected packet
/// fails the session.
pub struct SessionSink<P> {
    endpoint: &'static str,
    channel_id: u64,
    session: Arc<Mutex<PredictionSession>>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
    interface: Arc<BackendInterface>,
    validate_outgoing: bool,
    _packet: PhantomData<fn(P)>,
}

impl<P> Clone for SessionSink<P> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint,
            channel_id: self.channel_id,
            session: self.session.clone(),
            outbound: self.outbound.clone(),
            cancel: self.cancel.clone(),
            interface: self.interface.clone(),
            validate_outgoing: self.validate_outgoing,
            _packet: PhantomData,
        }
    }
}

impl<P: SessionPacket> SessionSink<P> {
    fn new(
        endpoint: &'static str,
        channel_id: u64,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        cancel: CancellationToken,
        interface: Arc<BackendInterface>,
        validate_outgoing: bool,
    ) -> Self {
        Self {
            endpoint,
            channel_id,
            session: Arc::new(Mutex::new(PredictionSession::new(channel_id))),
            outbound,
            cancel,
            interface,
            validate_outgoing,
            _packet: PhantomData,
        }
    }

    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the client has cancelled the session.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Copy of the session as it stands.
    pub async fn snapshot(&self) -> PredictionSession {
        self.session.lock().await.clone()
    }

    /// Emits one packet. Fails with [`PortError::Cancelled`] once the client
    /// has cancelled, and with a sequencing error when the session does not
    /// permit the packet in its current phase.
    pub async fn send(&self, packet: P) -> Result<(), PortError> {
        if self.cancel.is_cancelled() {
            return Err(PortError::Cancelled);
        }

        let value = serde_json::to_value(&packet)?;
        let mut session = self.session.lock().await;

        if self.validate_outgoing {
            if let Err(e) =
                self.interface
                    .validate_packet(self.endpoint, Direction::ToClient, &value)
            {
                warn!(channel_id = self.channel_id, endpoint = self.endpoint, "{}", e);
                session.fail(e.to_string());
                return Err(e);
            }
        }

        if let Err(violation) = session.observe(packet.event()) {
            warn!(
                channel_id = self.channel_id,
                endpoint = self.endpoint,
                "sequencing violation: {}",
                violation
            );
            session.fail(violation.to_string());
            return Err(PortError::sequencing(self.endpoint, violation));
        }

        self.outbound
            .send(ServerMessage::ChannelSend {
                channel_id: self.channel_id,
                message: value,
            })
            .map_err(|_| PortError::ConnectionClosed)
    }
}

impl<P: StreamingPacket> SessionSink<P> {
    pub async fn fragment(&self, fragment: PredictionFragment) -> Result<(), PortError> {
        self.send(P::fragment(fragment)).await
    }

    pub async fn text(&self, content: impl Into<String>) -> Result<(), PortError> {
        self.fragment(PredictionFragment::text(content)).await
    }

    pub async fn progress(&self, progress: f64) -> Result<(), PortError> {
        self.send(P::prompt_processing_progress(progress)).await
    }

    pub async fn tool_call_start(&self) -> Result<(), PortError> {
        self.send(P::tool_call_generation_start()).await
    }

    pub async fn tool_call_end(&self, request: ToolCallRequest) -> Result<(), PortError> {
        self.send(P::tool_call_generation_end(request)).await
    }

    pub async fn tool_call_failed(&self) -> Result<(), PortError> {
        self.send(P::tool_call_generation_failed()).await
    }
}

impl SessionSink<PredictToClientPacket> {
    pub async fn fragment_with_logprobs(
        &self,
        fragment: PredictionFragment,
        logprobs: Vec<Vec<TokenLogprob>>,
    ) -> Result<(), PortError> {
        self.send(PredictToClientPacket::Fragment {
            fragment,
            logprobs: Some(logprobs),
        })
        .await
    }
}
