//! # Error types used by the chassis runtime.
//!
//! This module defines the error enums surfaced by the framework:
//!
//! - [`RpcError`] errors raised by the channel RPC fabric (and reconstructed
//!   from cluster ACKs).
//! - [`TimerError`] errors raised by the timer manager.
//! - [`ClusterError`] errors raised by the cluster RPC transport.
//! - [`LifecycleError`] errors raised by the module lifecycle.
//!
//! All types provide `as_label` for logs/metrics.

use thiserror::Error;

/// Boxed error returned by module `init` hooks.
pub type ModuleError = Box<dyn std::error::Error + Send + Sync>;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// # Errors produced by the channel RPC fabric.
///
/// Addressing errors (`ServerClosed`, `ClientClosed`, `ServerNil`) are checked
/// before a call is enqueued; backpressure errors (`EnqueueFull`,
/// `CallTimeout`) surface when the target queue refuses the call.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Target server has been closed.
    #[error("rpc: server closed")]
    ServerClosed,

    /// The calling client has been closed.
    #[error("rpc: client closed")]
    ClientClosed,

    /// The module name did not resolve to a server.
    #[error("rpc: server is nil")]
    ServerNil,

    /// The message produced tag 0 (no identity).
    #[error("rpc: invalid message type")]
    InvalidMessageType,

    /// Two distinct message types mapped to the same tag on one server.
    #[error("rpc: tag {tag} already registered")]
    DuplicateTag {
        /// The colliding tag.
        tag: u32,
    },

    /// No handler was registered for the message tag.
    #[error("rpc: tag {tag} not registered")]
    HandlerNotRegistered {
        /// The unresolved tag.
        tag: u32,
    },

    /// Non-blocking enqueue hit a full queue.
    #[error("rpc: server queue full")]
    EnqueueFull,

    /// Blocking enqueue did not succeed within the enqueue deadline.
    #[error("rpc: call enqueue timed out")]
    CallTimeout,

    /// No reply arrived within the caller-supplied deadline.
    #[error("rpc: reply timed out")]
    ReplyTimeout,

    /// The handler panicked before answering.
    #[error("rpc: handler panicked: {0}")]
    HandlerPanic(String),

    /// The call was dropped without an answer.
    #[error("rpc: call dropped without reply")]
    DroppedReply,

    /// Application-level error set by a handler via `ret_with_error`.
    #[error("{0}")]
    Handler(String),

    /// Error string reconstructed from a cluster ACK (type identity is lost
    /// across the wire).
    #[error("{0}")]
    Remote(String),

    /// Transport-level failure while issuing a cluster call.
    #[error("rpc: transport: {0}")]
    Transport(String),
}

impl RpcError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RpcError::ServerClosed => "rpc_server_closed",
            RpcError::ClientClosed => "rpc_client_closed",
            RpcError::ServerNil => "rpc_server_nil",
            RpcError::InvalidMessageType => "rpc_invalid_message_type",
            RpcError::DuplicateTag { .. } => "rpc_duplicate_tag",
            RpcError::HandlerNotRegistered { .. } => "rpc_handler_not_registered",
            RpcError::EnqueueFull => "rpc_enqueue_full",
            RpcError::CallTimeout => "rpc_call_timeout",
            RpcError::ReplyTimeout => "rpc_reply_timeout",
            RpcError::HandlerPanic(_) => "rpc_handler_panic",
            RpcError::DroppedReply => "rpc_dropped_reply",
            RpcError::Handler(_) => "rpc_handler_error",
            RpcError::Remote(_) => "rpc_remote_error",
            RpcError::Transport(_) => "rpc_transport_error",
        }
    }
}

/// # Errors produced by the timer manager.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// No managed timer exists under the given id.
    #[error("timer {id} not found")]
    NotFound {
        /// The missing timer id.
        id: i64,
    },

    /// Rejected accelerate/delay/create arguments.
    #[error("timer: invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the arguments.
        reason: String,
    },
}

impl TimerError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            TimerError::NotFound { .. } => "timer_not_found",
            TimerError::InvalidArgument { .. } => "timer_invalid_argument",
        }
    }
}

/// # Errors produced by the cluster RPC transport.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Rejected `init` parameters (empty address, non-positive kind/index).
    #[error("cluster: invalid config: {0}")]
    InvalidConfig(String),

    /// The global bridge was initialized twice.
    #[error("cluster: already initialized")]
    AlreadyInitialized,

    /// The global bridge has not been initialized.
    #[error("cluster: not initialized")]
    NotInitialized,

    /// Initial connection to the broker failed.
    #[error("cluster: connect failed: {0}")]
    Connect(String),

    /// Subscribing to a subject failed.
    #[error("cluster: subscribe failed: {0}")]
    Subscribe(String),

    /// Publishing a frame failed.
    #[error("cluster: publish failed: {0}")]
    Publish(String),

    /// A frame could not be encoded.
    #[error("cluster: encode failed: {0}")]
    Encode(String),

    /// A frame could not be decoded.
    #[error("cluster: decode failed: {0}")]
    Decode(String),

    /// The wire tag is not in the message registry.
    #[error("cluster: tag {tag} not registered")]
    NotRegistered {
        /// The unknown wire tag.
        tag: u64,
    },
}

impl ClusterError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ClusterError::InvalidConfig(_) => "cluster_invalid_config",
            ClusterError::AlreadyInitialized => "cluster_already_initialized",
            ClusterError::NotInitialized => "cluster_not_initialized",
            ClusterError::Connect(_) => "cluster_connect",
            ClusterError::Subscribe(_) => "cluster_subscribe",
            ClusterError::Publish(_) => "cluster_publish",
            ClusterError::Encode(_) => "cluster_encode",
            ClusterError::Decode(_) => "cluster_decode",
            ClusterError::NotRegistered { .. } => "cluster_not_registered",
        }
    }
}

/// # Errors produced by the module lifecycle.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// `start` was called while the app was not in the idle state.
    #[error("application is already running")]
    AlreadyRunning,

    /// No modules were provided to start.
    #[error("no modules provided to start")]
    NoModules,

    /// A module's `init` hook failed; startup is aborted.
    #[error("module '{name}' init failed: {source}")]
    InitFailed {
        /// Name of the failing module.
        name: String,
        /// The error returned by `init`.
        #[source]
        source: ModuleError,
    },
}

impl LifecycleError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            LifecycleError::AlreadyRunning => "app_already_running",
            LifecycleError::NoModules => "app_no_modules",
            LifecycleError::InitFailed { .. } => "app_init_failed",
        }
    }
}
