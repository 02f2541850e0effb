//! # Per-module event loop.
//!
//! A [`Skeleton`] fuses a module's three work sources — inbound RPC calls,
//! async-call replies and timer fires — into one cooperative task:
//!
//! ```text
//! loop {
//!     select! {
//!         ctx.cancelled  => teardown, exit
//!         async reply    => client callback
//!         inbound call   => server handler
//!         timer fire     => kind handler
//!     }
//! }
//! ```
//!
//! The loop is the only place user handlers and callbacks execute, so state
//! inside one module needs no locking. Teardown order: stop the timer
//! dispatcher, close the server, then close (and drain) the client.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::error::{RpcError, TimerError};
use crate::message::Message;
use crate::rpc::{CallInfo, Client, RetInfo, Server, ServerHandle};
use crate::timer::{AdjustMode, Dispatcher, ManagedTimer, RawTimer, TimerMgr};

/// Server, client and timer manager bound to one module task.
pub struct Skeleton {
    name: String,
    app: App,
    server: Server,
    client: Client,
    timers: Arc<TimerMgr>,
    dispatcher: Option<Dispatcher>,
    fire_rx: mpsc::Receiver<RawTimer>,
}

impl Skeleton {
    /// Creates a skeleton resolving call targets through the default app.
    pub fn new(name: &str) -> Self {
        Self::with_app(name, App::global())
    }

    /// Creates a skeleton bound to a specific app registry.
    pub fn with_app(name: &str, app: App) -> Self {
        let cfg = app.config().clone();
        let (dispatcher, handle, fire_rx) = Dispatcher::new(cfg.timer_queue);
        Self {
            name: name.to_string(),
            server: Server::new(cfg.rpc_queue),
            client: Client::new(&cfg),
            timers: TimerMgr::new(handle),
            dispatcher: Some(dispatcher),
            fire_rx,
            app,
        }
    }

    /// The module name this skeleton serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer handle of this module's server, for the lifecycle registry.
    pub fn server_handle(&self) -> ServerHandle {
        self.server.handle()
    }

    /// Shared handle to this module's timer manager.
    pub fn timer_mgr(&self) -> Arc<TimerMgr> {
        Arc::clone(&self.timers)
    }

    /// Registers an RPC handler; module-init time only.
    pub fn register<M, F>(&mut self, prototype: M, handler: F) -> Result<(), RpcError>
    where
        M: Message,
        F: Fn(CallInfo) + Send + Sync + 'static,
    {
        self.server.register(prototype, handler)
    }

    /// Binds a handler to a timer kind.
    pub fn register_timer_kind<F>(&self, kind: &str, handler: F)
    where
        F: Fn(i64, &HashMap<String, String>) + Send + Sync + 'static,
    {
        self.timers.register_kind(kind, handler);
    }

    /// One-shot timer on this module.
    pub fn new_timer(
        &self,
        dur_ms: i64,
        kind: &str,
        metadata: HashMap<String, String>,
    ) -> Result<i64, TimerError> {
        self.timers.new_timer(dur_ms, kind, metadata)
    }

    /// Periodic timer on this module; `id == 0` allocates a fresh id.
    pub fn new_ticker(
        &self,
        id: i64,
        dur_ms: i64,
        kind: &str,
        metadata: HashMap<String, String>,
    ) -> Result<i64, TimerError> {
        self.timers.new_ticker(id, dur_ms, kind, metadata)
    }

    /// Shortens a timer's remaining time.
    pub fn accelerate_timer(&self, id: i64, mode: AdjustMode, value: i64) -> Result<(), TimerError> {
        self.timers.accelerate(id, mode, value)
    }

    /// Extends a timer's remaining time.
    pub fn delay_timer(&self, id: i64, mode: AdjustMode, value: i64) -> Result<(), TimerError> {
        self.timers.delay(id, mode, value)
    }

    /// Cancels a timer.
    pub fn cancel_timer(&self, id: i64) {
        self.timers.cancel(id);
    }

    /// Snapshot of a managed timer.
    pub fn timer(&self, id: i64) -> Option<ManagedTimer> {
        self.timers.get(id)
    }

    /// Snapshot of any timer of the given kind.
    pub fn timer_by_kind(&self, kind: &str) -> Option<ManagedTimer> {
        self.timers.get_by_kind(kind)
    }

    /// Synchronous call to another module by name.
    pub async fn call<M: Message>(&self, module: &str, request: M) -> RetInfo {
        match self.app.server(module) {
            Some(server) => self.client.call(&server, request).await,
            None => {
                tracing::warn!(module, "sync call to unknown module");
                RetInfo::from_err(RpcError::ServerNil)
            }
        }
    }

    /// Async call to another module; the callback runs on this skeleton loop.
    pub fn async_call<M, F>(&self, module: &str, request: M, callback: F) -> Result<(), RpcError>
    where
        M: Message,
        F: FnOnce(RetInfo) + Send + 'static,
    {
        match self.app.server(module) {
            Some(server) => self.client.async_call(&server, request, callback),
            None => {
                tracing::warn!(module, "async call to unknown module");
                Err(RpcError::ServerNil)
            }
        }
    }

    /// Fire-and-forget to another module.
    pub fn cast<M: Message>(&self, module: &str, request: M) -> Result<(), RpcError> {
        match self.app.server(module) {
            Some(server) => self.client.cast(&server, request),
            None => {
                tracing::warn!(module, "cast to unknown module");
                Err(RpcError::ServerNil)
            }
        }
    }

    /// Runs the event loop until the context is cancelled.
    ///
    /// Usually the whole body of a module's `start`.
    pub async fn run(&mut self, ctx: CancellationToken) {
        match self.dispatcher.take() {
            Some(dispatcher) => {
                tokio::spawn(dispatcher.run());
            }
            None => tracing::warn!(module = %self.name, "skeleton event loop started twice"),
        }

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                Some(ri) = self.client.recv_reply() => self.client.dispatch_callback(ri),
                Some(ci) = self.server.recv() => self.server.exec(ci),
                Some(t) = self.fire_rx.recv() => t.fire(),
                else => break,
            }
        }

        self.teardown().await;
        tracing::info!("{} stopped", self.name);
    }

    async fn teardown(&mut self) {
        self.timers.stop();
        self.server.close();
        self.client.close().await;
    }
}
