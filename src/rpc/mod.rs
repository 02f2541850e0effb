//! # Channel-based in-process RPC.
//!
//! A [`Server`] is a registry of handlers keyed by message tag plus a bounded
//! inbound queue; a [`Client`] issues synchronous, asynchronous and
//! fire-and-forget calls against any server. Both ends are glued to a module
//! by its skeleton loop, which is the only place handlers and callbacks run.
//!
//! ```text
//!   client.call ──► server queue ──► skeleton ──► handler ──► ci.ret
//!        ▲                                                      │
//!        └────────────────── reply channel ◄────────────────────┘
//! ```
//!
//! ## Rules
//! - A handler answers its [`CallInfo`] at most once; extra answers are
//!   logged and discarded.
//! - A `CallInfo` dropped unanswered answers its caller with an error from
//!   its drop guard, so callers are never silently leaked.
//! - Queue-full and timeout conditions are returned to the caller, never
//!   swallowed.

mod call;
mod client;
mod server;

pub use call::{CallInfo, Callback, Handler, RetInfo};
pub use client::Client;
pub use server::{Server, ServerHandle};

use std::time::Duration;

use tokio::sync::oneshot;

use crate::message::Payload;

/// One-off synchronous call against a server handle.
///
/// Creates a private reply slot, enqueues blocking (bounded by
/// `enqueue_timeout`) and waits for exactly one reply. This is the shared
/// path under [`Client::call`] and the cluster receive side.
pub(crate) async fn call_server(
    server: &ServerHandle,
    payload: Payload,
    enqueue_timeout: Duration,
) -> RetInfo {
    let (tx, rx) = oneshot::channel();
    let ci = CallInfo::sync(payload, tx);
    if let Err(e) = server.push(ci, enqueue_timeout).await {
        return RetInfo::from_err(e);
    }
    match rx.await {
        Ok(ri) => ri,
        Err(_) => RetInfo::from_err(crate::error::RpcError::DroppedReply),
    }
}

/// One-off fire-and-forget cast against a server handle.
pub(crate) fn cast_server(
    server: &ServerHandle,
    payload: Payload,
) -> Result<(), crate::error::RpcError> {
    server.try_push(CallInfo::cast(payload))
}
