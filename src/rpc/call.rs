//! # In-flight calls and their replies.
//!
//! [`CallInfo`] is one request traveling to a server; [`RetInfo`] is the
//! single reply traveling back. The reply route differs by call style:
//! a private oneshot for sync calls, the client's shared async-reply queue
//! for async calls, nothing for casts.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::error::RpcError;
use crate::message::{Message, Payload};

/// Callback invoked on the caller's skeleton loop for an async call.
pub type Callback = Box<dyn FnOnce(RetInfo) + Send + 'static>;

/// Handler registered on a server for one message tag.
pub type Handler = Box<dyn Fn(CallInfo) + Send + Sync + 'static>;

enum ReplyTo {
    Sync(oneshot::Sender<RetInfo>),
    Async {
        tx: mpsc::Sender<RetInfo>,
        callback: Callback,
    },
}

/// One in-flight request.
///
/// Handlers receive the `CallInfo` by value and answer it with [`ret`] or
/// [`ret_with_error`]. Moving it out of the handler defers the answer; the
/// caller keeps waiting until the `CallInfo` is answered or dropped.
///
/// [`ret`]: CallInfo::ret
/// [`ret_with_error`]: CallInfo::ret_with_error
pub struct CallInfo {
    tag: u32,
    request: Option<Payload>,
    reply: Option<ReplyTo>,
    answered: bool,
}

impl CallInfo {
    pub(crate) fn sync(request: Payload, reply: oneshot::Sender<RetInfo>) -> Self {
        Self {
            tag: request.tag(),
            request: Some(request),
            reply: Some(ReplyTo::Sync(reply)),
            answered: false,
        }
    }

    pub(crate) fn with_callback(
        request: Payload,
        tx: mpsc::Sender<RetInfo>,
        callback: Callback,
    ) -> Self {
        Self {
            tag: request.tag(),
            request: Some(request),
            reply: Some(ReplyTo::Async { tx, callback }),
            answered: false,
        }
    }

    pub(crate) fn cast(request: Payload) -> Self {
        Self {
            tag: request.tag(),
            request: Some(request),
            reply: None,
            answered: false,
        }
    }

    /// Tag of the request message.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Borrows the request payload (`None` once taken).
    pub fn request(&self) -> Option<&Payload> {
        self.request.as_ref()
    }

    /// Borrows the request downcast to its concrete type.
    pub fn request_as<T: 'static>(&self) -> Option<&T> {
        self.request.as_ref().and_then(Payload::downcast_ref)
    }

    /// Takes the request payload out, e.g. to downcast by value.
    pub fn take_request(&mut self) -> Option<Payload> {
        self.request.take()
    }

    /// Answers the call with a result message.
    pub fn ret<M: Message>(&mut self, ack: M) {
        self.deliver(RetInfo::ok(Some(Payload::new(ack))));
    }

    /// Answers the call with an optional pre-erased payload (`None` = void).
    pub fn ret_payload(&mut self, ack: Option<Payload>) {
        self.deliver(RetInfo::ok(ack));
    }

    /// Answers the call with an error (and optionally a partial result).
    pub fn ret_with_error(&mut self, ack: Option<Payload>, err: RpcError) {
        self.deliver(RetInfo {
            ack,
            err: Some(err),
            callback: None,
        });
    }

    fn deliver(&mut self, mut ri: RetInfo) {
        if self.answered {
            tracing::warn!(tag = self.tag, "rpc call cannot be answered twice");
            return;
        }
        self.answered = true;

        let Some(reply) = self.reply.take() else {
            // cast: any result is discarded
            return;
        };
        match reply {
            ReplyTo::Sync(tx) => {
                if tx.send(ri).is_err() {
                    tracing::debug!(tag = self.tag, "rpc caller gone before reply");
                }
            }
            ReplyTo::Async { tx, callback } => {
                ri.callback = Some(callback);
                if tx.try_send(ri).is_err() {
                    tracing::warn!(
                        tag = self.tag,
                        "async reply queue full or closed, reply dropped"
                    );
                }
            }
        }
    }
}

impl Drop for CallInfo {
    /// Unanswered calls answer their caller on drop: with a panic error when
    /// dropped during a handler unwind, otherwise with [`RpcError::DroppedReply`].
    fn drop(&mut self) {
        if self.answered || self.reply.is_none() {
            return;
        }
        let err = if std::thread::panicking() {
            RpcError::HandlerPanic(format!("handler for tag {} panicked", self.tag))
        } else {
            RpcError::DroppedReply
        };
        self.deliver(RetInfo::from_err(err));
    }
}

impl fmt::Debug for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInfo")
            .field("tag", &self.tag)
            .field("answered", &self.answered)
            .finish()
    }
}

/// One reply.
///
/// Either `ack` is set (possibly `None` for void) or `err` is set.
pub struct RetInfo {
    /// Result payload; `None` for void results and errors.
    pub ack: Option<Payload>,
    /// Error, if the call failed.
    pub err: Option<RpcError>,
    pub(crate) callback: Option<Callback>,
}

impl RetInfo {
    /// Successful reply.
    pub fn ok(ack: Option<Payload>) -> Self {
        Self {
            ack,
            err: None,
            callback: None,
        }
    }

    /// Failed reply.
    pub fn from_err(err: RpcError) -> Self {
        Self {
            ack: None,
            err: Some(err),
            callback: None,
        }
    }

    /// Tag of the result payload; 0 on error or void.
    pub fn tag(&self) -> u32 {
        if self.err.is_some() {
            return 0;
        }
        self.ack.as_ref().map_or(0, Payload::tag)
    }

    /// Whether the reply carries an error.
    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    /// Splits the reply into a result.
    pub fn into_result(self) -> Result<Option<Payload>, RpcError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.ack),
        }
    }

    pub(crate) fn take_callback(&mut self) -> Option<Callback> {
        self.callback.take()
    }
}

impl fmt::Debug for RetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetInfo")
            .field("tag", &self.tag())
            .field("err", &self.err)
            .finish()
    }
}
