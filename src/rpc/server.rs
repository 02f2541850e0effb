//! # ChanRPC server.
//!
//! A [`Server`] holds the tag→handler table and the receiving half of the
//! bounded inbound queue; it is owned by its module's skeleton, which drains
//! the queue and executes handlers on the module task. A [`ServerHandle`] is
//! the cheap-clone producer side handed out through the lifecycle registry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{panic_message, RpcError};
use crate::message::Message;
use crate::rpc::call::{CallInfo, Handler};

/// Handler registry plus the consuming half of the inbound call queue.
pub struct Server {
    handlers: HashMap<u32, Handler>,
    rx: mpsc::Receiver<CallInfo>,
    handle: ServerHandle,
}

impl Server {
    /// Creates a server with a bounded inbound queue.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            handlers: HashMap::new(),
            rx,
            handle: ServerHandle {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Returns the producer handle published through the registry.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Registers a handler for the prototype's message tag.
    ///
    /// Handlers are registered during module init only. Rejects tag 0 and
    /// duplicate tags.
    pub fn register<M, F>(&mut self, prototype: M, handler: F) -> Result<(), RpcError>
    where
        M: Message,
        F: Fn(CallInfo) + Send + Sync + 'static,
    {
        let tag = prototype.message_tag();
        if tag == 0 {
            return Err(RpcError::InvalidMessageType);
        }
        if self.handlers.contains_key(&tag) {
            return Err(RpcError::DuplicateTag { tag });
        }
        tracing::info!(tag, type_name = std::any::type_name::<M>(), "rpc handler registered");
        self.handlers.insert(tag, Box::new(handler));
        Ok(())
    }

    /// Receives the next inbound call; `None` when the queue is closed.
    pub(crate) async fn recv(&mut self) -> Option<CallInfo> {
        self.rx.recv().await
    }

    /// Resolves and runs the handler for one call.
    ///
    /// A missing handler answers the caller with `HandlerNotRegistered`. A
    /// panicking handler is contained here; the unanswered call's drop guard
    /// answers the caller with the panic error.
    pub fn exec(&self, mut ci: CallInfo) {
        let tag = ci.tag();
        let Some(handler) = self.handlers.get(&tag) else {
            tracing::warn!(tag, "rpc call for unregistered tag");
            ci.ret_with_error(None, RpcError::HandlerNotRegistered { tag });
            return;
        };
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(ci))) {
            tracing::error!(tag, "rpc handler panicked: {}", panic_message(&payload));
        }
    }

    /// Whether the server has been closed.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Closes the server: refuses new calls, then drains the inbound queue
    /// answering each pending call with `ServerClosed`.
    ///
    /// One-shot; a second close is a warn-level no-op.
    pub fn close(&mut self) {
        if self.handle.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!("rpc server already closed");
            return;
        }
        self.rx.close();
        while let Ok(mut ci) = self.rx.try_recv() {
            ci.ret_with_error(None, RpcError::ServerClosed);
        }
    }
}

/// Cheap-clone producer handle of one server's inbound queue.
///
/// This is what the lifecycle registry publishes for a module name; clients
/// and the cluster bridge enqueue through it.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<CallInfo>,
    closed: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Whether the owning server has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls currently waiting in the inbound queue.
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    /// Blocking enqueue bounded by `enqueue_timeout`.
    pub(crate) async fn push(
        &self,
        ci: CallInfo,
        enqueue_timeout: Duration,
    ) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ServerClosed);
        }
        match tokio::time::timeout(enqueue_timeout, self.tx.send(ci)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_send)) => Err(RpcError::ServerClosed),
            Err(_elapsed) => {
                tracing::warn!("rpc enqueue blocked past deadline");
                Err(RpcError::CallTimeout)
            }
        }
    }

    /// Non-blocking enqueue; fails fast on a full queue.
    pub(crate) fn try_push(&self, ci: CallInfo) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ServerClosed);
        }
        match self.tx.try_send(ci) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("rpc server queue full");
                Err(RpcError::EnqueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RpcError::ServerClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{type_tag, Payload};
    use crate::rpc::RetInfo;
    use tokio::sync::oneshot;

    struct Echo {
        v: i32,
    }
    impl Message for Echo {}

    struct EchoAck {
        v: i32,
    }
    impl Message for EchoAck {}

    struct Other;
    impl Message for Other {}

    struct SameTag;
    impl Message for SameTag {
        fn message_tag(&self) -> u32 {
            type_tag::<Echo>()
        }
    }

    fn sync_call<M: Message>(m: M) -> (CallInfo, oneshot::Receiver<RetInfo>) {
        let (tx, rx) = oneshot::channel();
        (CallInfo::sync(Payload::new(m), tx), rx)
    }

    #[tokio::test]
    async fn exec_dispatches_by_tag() {
        let mut server = Server::new(16);
        server
            .register(Echo { v: 0 }, |mut ci| {
                let v = ci.request_as::<Echo>().map(|e| e.v).unwrap_or(-1);
                ci.ret(EchoAck { v: v * 2 });
            })
            .expect("register");

        let (ci, rx) = sync_call(Echo { v: 10 });
        server.exec(ci);
        let ack = rx.await.expect("reply").into_result().expect("ok");
        assert_eq!(ack.and_then(|p| p.downcast::<EchoAck>().ok()).map(|a| a.v), Some(20));
    }

    #[tokio::test]
    async fn duplicate_tag_is_rejected() {
        let mut server = Server::new(16);
        server.register(Echo { v: 0 }, |_| {}).expect("first");
        let err = server.register(SameTag, |_| {}).expect_err("colliding tag");
        assert_eq!(err, RpcError::DuplicateTag { tag: type_tag::<Echo>() });
    }

    #[tokio::test]
    async fn unregistered_tag_answers_error() {
        let server = Server::new(16);
        let (ci, rx) = sync_call(Other);
        server.exec(ci);
        let err = rx.await.expect("reply").into_result().expect_err("err");
        assert_eq!(err, RpcError::HandlerNotRegistered { tag: type_tag::<Other>() });
    }

    #[tokio::test]
    async fn handler_panic_answers_error() {
        let mut server = Server::new(16);
        server
            .register(Echo { v: 0 }, |_ci| panic!("boom"))
            .expect("register");
        let (ci, rx) = sync_call(Echo { v: 1 });
        server.exec(ci);
        let err = rx.await.expect("reply").into_result().expect_err("err");
        assert!(matches!(err, RpcError::HandlerPanic(_)));
    }

    #[tokio::test]
    async fn close_drains_pending_calls() {
        let mut server = Server::new(16);
        let handle = server.handle();
        let (ci, rx1) = sync_call(Other);
        handle.try_push(ci).expect("enqueue");
        let (ci, rx2) = sync_call(Other);
        handle.try_push(ci).expect("enqueue");

        server.close();

        for rx in [rx1, rx2] {
            let err = rx.await.expect("drained").into_result().expect_err("err");
            assert_eq!(err, RpcError::ServerClosed);
        }
        assert!(handle.is_closed());
        assert_eq!(handle.try_push(CallInfo::cast(Payload::new(Other))), Err(RpcError::ServerClosed));
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let server = Server::new(1);
        let handle = server.handle();
        handle.try_push(CallInfo::cast(Payload::new(Other))).expect("fits");
        let err = handle.try_push(CallInfo::cast(Payload::new(Other)));
        assert_eq!(err, Err(RpcError::EnqueueFull));
        assert_eq!(handle.queue_len(), 1);
    }
}
