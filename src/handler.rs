use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::PortError;
use crate::interface::BackendInterface;
use crate::session::ServerBoundPacket;
use crate::wire::ServerMessage;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

// Type-erased request/response handler: validated parameter in, result out.
pub(crate) type RpcHandlerFn = Arc<dyn Fn(Value) -> BoxFuture<Result<Value, PortError>> + Send + Sync>;

// Type-erased channel handler. The future owns the whole session and sends
// the closing message itself.
pub(crate) type ChannelHandlerFn = Arc<dyn Fn(ChannelContext) -> BoxFuture<()> + Send + Sync>;

/// Everything a channel task needs from the serve loop.
pub(crate) struct ChannelContext {
    pub channel_id: u64,
    pub creation_parameter: Value,
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
    pub cancel: CancellationToken,
    pub interface: Arc<BackendInterface>,
    pub validate_outgoing: bool,
}

#[derive(Clone)]
pub(crate) struct ChannelHandler {
    pub run: ChannelHandlerFn,
    pub is_cancel: fn(&Value) -> bool,
}

pub(crate) fn is_cancel_packet<P: ServerBoundPacket>(value: &Value) -> bool {
    serde_json::from_value::<P>(value.clone())
        .map(|packet| packet.is_cancel())
        .unwrap_or(false)
}
