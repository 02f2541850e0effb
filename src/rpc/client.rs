//! # ChanRPC client.
//!
//! A [`Client`] issues calls against any server handle. Sync calls get a
//! private one-slot reply channel; async calls share the client's bounded
//! async-reply queue, and their callbacks run on the owning skeleton loop —
//! never on the server's task.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::config::Config;
use crate::error::{panic_message, RpcError};
use crate::message::{Message, Payload};
use crate::rpc::call::{CallInfo, RetInfo};
use crate::rpc::server::ServerHandle;

/// Issues sync/async/cast calls and tracks pending async replies.
pub struct Client {
    async_tx: mpsc::Sender<RetInfo>,
    async_rx: mpsc::Receiver<RetInfo>,
    pending: AtomicI64,
    closed: AtomicBool,
    enqueue_timeout: Duration,
    drain_timeout: Duration,
}

impl Client {
    /// Creates a client with the configured async-reply queue and deadlines.
    pub fn new(cfg: &Config) -> Self {
        let (async_tx, async_rx) = mpsc::channel(cfg.async_reply_queue);
        Self {
            async_tx,
            async_rx,
            pending: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            enqueue_timeout: cfg.enqueue_timeout,
            drain_timeout: cfg.client_drain,
        }
    }

    /// Whether the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of async calls awaiting their reply.
    pub fn pending_count(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether no async replies are outstanding.
    pub fn idle(&self) -> bool {
        self.pending_count() == 0
    }

    fn check(&self, server: &ServerHandle, tag: u32) -> Result<(), RpcError> {
        if server.is_closed() {
            return Err(RpcError::ServerClosed);
        }
        if self.is_closed() {
            return Err(RpcError::ClientClosed);
        }
        if tag == 0 {
            return Err(RpcError::InvalidMessageType);
        }
        Ok(())
    }

    /// Synchronous call: blocks (bounded) on enqueue, then waits for exactly
    /// one reply. No outer deadline — callers layer their own if needed.
    pub async fn call<M: Message>(&self, server: &ServerHandle, request: M) -> RetInfo {
        let payload = Payload::new(request);
        if let Err(e) = self.check(server, payload.tag()) {
            tracing::warn!(tag = payload.tag(), error = e.as_label(), "rpc sync call refused");
            return RetInfo::from_err(e);
        }
        crate::rpc::call_server(server, payload, self.enqueue_timeout).await
    }

    /// Asynchronous call: non-blocking enqueue; the reply arrives on this
    /// client's async-reply queue and `callback` runs on the skeleton loop.
    pub fn async_call<M, F>(
        &self,
        server: &ServerHandle,
        request: M,
        callback: F,
    ) -> Result<(), RpcError>
    where
        M: Message,
        F: FnOnce(RetInfo) + Send + 'static,
    {
        let payload = Payload::new(request);
        let tag = payload.tag();
        if let Err(e) = self.check(server, tag) {
            tracing::warn!(tag, error = e.as_label(), "rpc async call refused");
            return Err(e);
        }
        let ci = CallInfo::with_callback(payload, self.async_tx.clone(), Box::new(callback));
        server.try_push(ci)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Fire-and-forget: non-blocking enqueue, no reply channel. Any `ret` the
    /// handler performs is discarded.
    pub fn cast<M: Message>(&self, server: &ServerHandle, request: M) -> Result<(), RpcError> {
        let payload = Payload::new(request);
        let tag = payload.tag();
        if let Err(e) = self.check(server, tag) {
            tracing::warn!(tag, error = e.as_label(), "rpc cast refused");
            return Err(e);
        }
        server.try_push(CallInfo::cast(payload))
    }

    /// Receives the next async reply; `None` when the queue is closed.
    pub(crate) async fn recv_reply(&mut self) -> Option<RetInfo> {
        self.async_rx.recv().await
    }

    /// Balances the pending count and runs the reply's callback, containing
    /// panics.
    pub(crate) fn dispatch_callback(&self, mut ri: RetInfo) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        let Some(cb) = ri.take_callback() else {
            tracing::warn!(tag = ri.tag(), "async reply without callback");
            return;
        };
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(move || cb(ri))) {
            tracing::error!("rpc callback panicked: {}", panic_message(&*payload));
        }
    }

    /// Closes the client, draining outstanding async replies.
    ///
    /// Drains until the pending count reaches 0 or the drain budget elapses,
    /// in which case the count is forced to zero with a warning.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!("rpc client already closed");
            return;
        }
        let pending = self.pending_count();
        tracing::info!(pending, "closing rpc client");
        if pending == 0 {
            return;
        }

        let deadline = Instant::now() + self.drain_timeout;
        while self.pending_count() > 0 {
            match timeout_at(deadline, self.async_rx.recv()).await {
                Ok(Some(ri)) => self.dispatch_callback(ri),
                Ok(None) => break,
                Err(_elapsed) => {
                    tracing::warn!(
                        remaining = self.pending_count(),
                        "rpc client close timed out, forcing pending count to zero"
                    );
                    self.pending.store(0, Ordering::SeqCst);
                    break;
                }
            }
        }
        tracing::info!("rpc client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Server;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Echo {
        v: i32,
    }
    impl Message for Echo {}

    struct EchoAck {
        v: i32,
    }
    impl Message for EchoAck {}

    fn echo_server() -> Server {
        let mut server = Server::new(64);
        server
            .register(Echo { v: 0 }, |mut ci| {
                let v = ci.request_as::<Echo>().map(|e| e.v).unwrap_or(0);
                ci.ret(EchoAck { v: v * 2 });
            })
            .expect("register");
        server
    }

    #[tokio::test]
    async fn sync_call_round_trip() {
        let mut server = echo_server();
        let handle = server.handle();
        let client = Client::new(&Config::default());

        let driver = tokio::spawn(async move {
            while let Some(ci) = server.recv().await {
                server.exec(ci);
            }
        });

        let ri = client.call(&handle, Echo { v: 10 }).await;
        let ack = ri.into_result().expect("ok");
        assert_eq!(ack.and_then(|p| p.downcast::<EchoAck>().ok()).map(|a| a.v), Some(20));
        driver.abort();
    }

    #[tokio::test]
    async fn async_call_balances_pending_count() {
        let mut server = echo_server();
        let handle = server.handle();
        let mut client = Client::new(&Config::default());

        let order = Arc::new(AtomicUsize::new(0));
        for expected in [1usize, 2] {
            let order = Arc::clone(&order);
            client
                .async_call(&handle, Echo { v: expected as i32 }, move |ri| {
                    assert!(!ri.is_err());
                    // callbacks run serially in issue order
                    assert_eq!(order.fetch_add(1, Ordering::SeqCst) + 1, expected);
                })
                .expect("async call");
        }
        assert_eq!(client.pending_count(), 2);

        // drive the server: both calls execute and answer into the async queue
        for _ in 0..2 {
            let ci = server.recv().await.expect("call");
            server.exec(ci);
        }

        // callbacks run serially on this side, pending goes 2 -> 1 -> 0
        for remaining in [1i64, 0] {
            let ri = client.recv_reply().await.expect("reply");
            client.dispatch_callback(ri);
            assert_eq!(client.pending_count(), remaining);
        }
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_client_refuses_calls() {
        let server = echo_server();
        let handle = server.handle();
        let mut client = Client::new(&Config::default());
        client.close().await;

        let ri = client.call(&handle, Echo { v: 1 }).await;
        assert_eq!(ri.into_result().expect_err("refused"), RpcError::ClientClosed);
        let err = client.async_call(&handle, Echo { v: 1 }, |_| {});
        assert_eq!(err, Err(RpcError::ClientClosed));
        assert_eq!(client.cast(&handle, Echo { v: 1 }), Err(RpcError::ClientClosed));
    }

    #[tokio::test]
    async fn call_against_closed_server_fails_fast() {
        let mut server = echo_server();
        let handle = server.handle();
        server.close();

        let client = Client::new(&Config::default());
        let ri = client.call(&handle, Echo { v: 1 }).await;
        assert_eq!(ri.into_result().expect_err("closed"), RpcError::ServerClosed);
    }

    #[tokio::test]
    async fn close_forces_pending_to_zero_after_drain_budget() {
        let server = echo_server();
        let handle = server.handle();
        let mut cfg = Config::default();
        cfg.client_drain = Duration::from_millis(50);
        let mut client = Client::new(&cfg);

        // enqueue a call whose reply never arrives (server not driven)
        client
            .async_call(&handle, Echo { v: 1 }, |_| panic!("never runs"))
            .expect("async call");
        assert_eq!(client.pending_count(), 1);

        client.close().await;
        assert_eq!(client.pending_count(), 0);
    }
}
