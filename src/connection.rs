//! Client-side multiplexing of calls and channels over one transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::PortError;
use crate::transport::FrameTransport;
use crate::wire::{self, ClientMessage, ServerMessage, WireError};

/// What a channel's receiver sees, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChannelEvent {
    Packet(Value),
    Closed,
    Failed(WireError),
    Disconnected,
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, WireError>>>>>;
type OpenChannels = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>>>;

pub(crate) struct Connection {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingCalls,
    channels: OpenChannels,
    next_id: AtomicU64,
    driver: JoinHandle<()>,
}

impl Connection {
    /// Spawns the task that owns `transport`. Must be called inside a Tokio runtime.
    pub fn spawn<T: FrameTransport>(transport: T) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let channels: OpenChannels = Arc::new(Mutex::new(HashMap::new()));

        let driver = tokio::spawn(drive(
            transport,
            outbound_rx,
            pending.clone(),
            channels.clone(),
        ));

        Self {
            outbound: outbound_tx,
            pending,
            channels,
            next_id: AtomicU64::new(1),
            driver,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.driver.is_finished()
    }

    /// Sends one call and waits for its answer. The caller applies the timeout.
    pub async fn call(&self, endpoint: &str, parameter: Value) -> Result<Value, PortError> {
        let call_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id, tx);

        let message = ClientMessage::RpcCall {
            call_id,
            endpoint: endpoint.to_string(),
            parameter,
        };
        if self.outbound.send(message).is_err() {
            self.pending.lock().await.remove(&call_id);
            return Err(PortError::ConnectionClosed);
        }

        let guard = PendingGuard {
            pending: self.pending.clone(),
            call_id,
        };
        let result = rx.await;
        drop(guard);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(PortError::Remote(error)),
            Err(_) => Err(PortError::ConnectionClosed),
        }
    }

    pub async fn open_channel(
        &self,
        endpoint: &str,
        creation_parameter: Value,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ChannelEvent>), PortError> {
        let channel_id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().await.insert(channel_id, tx);

        let message = ClientMessage::ChannelCreate {
            channel_id,
            endpoint: endpoint.to_string(),
            creation_parameter,
        };
        if self.outbound.send(message).is_err() {
            self.channels.lock().await.remove(&channel_id);
            return Err(PortError::ConnectionClosed);
        }
        debug!(channel_id, endpoint, "channel requested");
        Ok((channel_id, rx))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// Removes a pending call whose caller stopped waiting (timeout, drop).
struct PendingGuard {
    pending: PendingCalls,
    call_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let pending = self.pending.clone();
        let call_id = self.call_id;
        if let Ok(mut pending) = pending.try_lock() {
            pending.remove(&call_id);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pending.lock().await.remove(&call_id);
            });
        }
    }
}

async fn drive<T: FrameTransport>(
    mut transport: T,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pending: PendingCalls,
    channels: OpenChannels,
) {
    loop {
        tokio::select! {
            frame = transport.receive_frame() => {
                match frame {
                    Ok(Some(frame)) => route(&frame, &pending, &channels).await,
                    Ok(None) => {
                        debug!("server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("transport error: {}", e);
                        break;
                    }
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                let frame = match wire::encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("failed to encode outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = transport.send_frame(frame).await {
                    warn!("failed to send frame: {}", e);
                    break;
                }
            }
        }
    }

    // Closed first so no call can register after the sweep below.
    outbound.close();
    // Dropping the senders fails every waiting call with ConnectionClosed.
    pending.lock().await.clear();
    for (_, channel) in channels.lock().await.drain() {
        let _ = channel.send(ChannelEvent::Disconnected);
    }
}

async fn route(frame: &[u8], pending: &PendingCalls, channels: &OpenChannels) {
    let message: ServerMessage = match wire::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping undecodable frame: {}", e);
            return;
        }
    };

    match message {
        ServerMessage::RpcResult { call_id, result } => {
            if let Some(tx) = pending.lock().await.remove(&call_id) {
                let _ = tx.send(Ok(result));
            }
        }
        ServerMessage::RpcError { call_id, error } => {
            if let Some(tx) = pending.lock().await.remove(&call_id) {
                let _ = tx.send(Err(error));
            }
        }
        ServerMessage::ChannelSend {
            channel_id,
            message,
        } => {
            if let Some(tx) = channels.lock().await.get(&channel_id) {
                let _ = tx.send(ChannelEvent::Packet(message));
            }
        }
        ServerMessage::ChannelClose { channel_id } => {
            if let Some(tx) = channels.lock().await.remove(&channel_id) {
                let _ = tx.send(ChannelEvent::Closed);
            }
        }
        ServerMessage::ChannelError { channel_id, error } => {
            if let Some(tx) = channels.lock().await.remove(&channel_id) {
                let _ = tx.send(ChannelEvent::Failed(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory_pair, MemoryTransport};
    use crate::wire::WireErrorKind;
    use serde_json::json;

    async fn next_client_message(server: &mut MemoryTransport) -> ClientMessage {
        let frame = server.receive_frame().await.unwrap().unwrap();
        wire::decode(&frame).unwrap()
    }

    async fn reply(server: &mut MemoryTransport, message: ServerMessage) {
        server
            .send_frame(wire::encode(&message).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn calls_are_matched_by_id() {
        let (client_side, mut server) = memory_pair();
        let connection = Arc::new(Connection::spawn(client_side));

        let caller = connection.clone();
        let call = tokio::spawn(async move { caller.call("tokenize", json!({})).await });

        let ClientMessage::RpcCall { call_id, endpoint, .. } = next_client_message(&mut server).await
        else {
            panic!("expected a call");
        };
        assert_eq!(endpoint, "tokenize");
        reply(
            &mut server,
            ServerMessage::RpcResult {
                call_id,
                result: json!({"tokens": [1]}),
            },
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"tokens": [1]}));
        assert!(connection.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn remote_errors_surface_as_remote() {
        let (client_side, mut server) = memory_pair();
        let connection = Arc::new(Connection::spawn(client_side));

        let caller = connection.clone();
        let call = tokio::spawn(async move { caller.call("countTokens", json!({})).await });

        let ClientMessage::RpcCall { call_id, .. } = next_client_message(&mut server).await else {
            panic!("expected a call");
        };
        reply(
            &mut server,
            ServerMessage::RpcError {
                call_id,
                error: WireError {
                    kind: WireErrorKind::Backend,
                    endpoint: "countTokens".to_string(),
                    message: "model unloaded".to_string(),
                    path: None,
                },
            },
        )
        .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, PortError::Remote(e) if e.kind == WireErrorKind::Backend));
    }

    #[tokio::test]
    async fn channel_events_arrive_in_order() {
        let (client_side, mut server) = memory_pair();
        let connection = Connection::spawn(client_side);
        let (channel_id, mut events) = connection.open_channel("predict", json!({})).await.unwrap();

        assert!(matches!(
            next_client_message(&mut server).await,
            ClientMessage::ChannelCreate { channel_id: id, .. } if id == channel_id
        ));
        for n in 0..3 {
            reply(
                &mut server,
                ServerMessage::ChannelSend {
                    channel_id,
                    message: json!({"n": n}),
                },
            )
            .await;
        }
        reply(&mut server, ServerMessage::ChannelClose { channel_id }).await;

        for n in 0..3 {
            assert_eq!(events.recv().await, Some(ChannelEvent::Packet(json!({"n": n}))));
        }
        assert_eq!(events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn disconnect_fails_calls_and_channels() {
        let (client_side, mut server) = memory_pair();
        let connection = Arc::new(Connection::spawn(client_side));
        let (_, mut events) = connection.open_channel("predict", json!({})).await.unwrap();

        let caller = connection.clone();
        let call = tokio::spawn(async move { caller.call("listLoaded", json!({})).await });

        next_client_message(&mut server).await;
        next_client_message(&mut server).await;
        drop(server);

        assert!(matches!(
            call.await.unwrap(),
            Err(PortError::ConnectionClosed)
        ));
        assert_eq!(events.recv().await, Some(ChannelEvent::Disconnected));
    }
}
