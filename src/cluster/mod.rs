//! # Cluster RPC.
//!
//! The same call/cast surface as the in-process fabric, carried across
//! processes over NATS pub/sub. Every frame on the wire is
//! `[8-byte big-endian tag][JSON body]`; the body is a [`ReqEnvelope`] or an
//! [`AckEnvelope`], whose `data` field nests an inner frame of the actual
//! request or reply.
//!
//! Message types crossing the wire (and the envelopes, which the transport
//! pre-registers) must be [`register`]ed on every participating instance.
//!
//! A process usually holds one bridge, initialized once via [`init`] and
//! addressed through the module-level facade; [`NatsRpc::connect`] remains
//! available for tests and multi-bridge setups.

mod codec;
mod envelope;
mod nats;
mod subject;

pub use codec::{marshal, marshal_message, register, unmarshal};
pub use envelope::{AckEnvelope, ReqEnvelope};
pub use nats::NatsRpc;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;

use crate::app::App;
use crate::error::{ClusterError, RpcError};
use crate::message::Message;
use crate::rpc::RetInfo;

static GLOBAL: OnceLock<Arc<NatsRpc>> = OnceLock::new();

/// Initializes the process-global bridge; one-shot.
pub async fn init(addr: &str, kind: i64, idx: i64) -> Result<(), ClusterError> {
    if GLOBAL.get().is_some() {
        return Err(ClusterError::AlreadyInitialized);
    }
    let rpc = NatsRpc::connect(addr, kind, idx, App::global()).await?;
    GLOBAL.set(rpc).map_err(|_| ClusterError::AlreadyInitialized)
}

/// The process-global bridge, if initialized.
pub fn global() -> Option<Arc<NatsRpc>> {
    GLOBAL.get().cloned()
}

/// Sync call through the global bridge.
pub async fn call<M: Message + Serialize>(kind: i64, idx: i64, module: &str, message: M) -> RetInfo {
    match GLOBAL.get() {
        Some(rpc) => rpc.call(kind, idx, module, message).await,
        None => RetInfo::from_err(RpcError::Transport("cluster rpc not initialized".to_string())),
    }
}

/// Sync call with a deadline through the global bridge.
pub async fn call_with_timeout<M: Message + Serialize>(
    deadline: Duration,
    kind: i64,
    idx: i64,
    module: &str,
    message: M,
) -> RetInfo {
    match GLOBAL.get() {
        Some(rpc) => rpc.call_with_timeout(deadline, kind, idx, module, message).await,
        None => RetInfo::from_err(RpcError::Transport("cluster rpc not initialized".to_string())),
    }
}

/// Async call through the global bridge.
pub async fn async_call<M, F>(
    kind: i64,
    idx: i64,
    module: &str,
    message: M,
    callback: F,
) -> Result<(), ClusterError>
where
    M: Message + Serialize,
    F: FnOnce(RetInfo) + Send + 'static,
{
    match GLOBAL.get() {
        Some(rpc) => rpc.async_call(kind, idx, module, message, callback).await,
        None => Err(ClusterError::NotInitialized),
    }
}

/// Fire-and-forget through the global bridge.
pub async fn cast<M: Message + Serialize>(kind: i64, idx: i64, module: &str, message: M) {
    match GLOBAL.get() {
        Some(rpc) => rpc.cast(kind, idx, module, message).await,
        None => tracing::warn!("cluster cast before init dropped"),
    }
}
