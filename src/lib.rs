//! # chassis
//!
//! **Chassis** is an in-process backend service chassis: it binds a module
//! lifecycle manager, a channel-based RPC fabric, a hierarchical timing-wheel
//! timer service and a NATS cluster RPC bridge into one runtime. Every
//! long-running module is built from a common skeleton that fuses its three
//! work sources — RPC calls, async replies and timer fires — into a single
//! cooperative task.
//!
//! ## Features
//!
//! | Area           | Description                                                  | Key types / traits                    |
//! |----------------|--------------------------------------------------------------|---------------------------------------|
//! | **Lifecycle**  | Priority-ordered init/start/stop, dynamic modules, signals.  | [`App`], [`Module`]                    |
//! | **RPC**        | Sync/async/cast calls over bounded channels.                 | [`Server`], [`Client`], [`CallInfo`]   |
//! | **Timers**     | Timing-wheel dispatcher, named kinds, accelerate/delay.      | [`TimerMgr`], [`AdjustMode`]           |
//! | **Skeleton**   | Per-module event loop gluing the three together.             | [`Skeleton`]                           |
//! | **Cluster**    | The same call surface across processes over NATS.            | [`cluster`], [`NatsRpc`]               |
//! | **Errors**     | Typed sentinels for addressing, backpressure and transport.  | [`RpcError`], [`TimerError`]           |
//!
//! ```no_run
//! use async_trait::async_trait;
//! use chassis::{app, CallInfo, Message, Module, ServerHandle, Skeleton};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo { v: i32 }
//! impl Message for Echo {}
//! struct EchoAck { v: i32 }
//! impl Message for EchoAck {}
//!
//! struct Worker { skeleton: Skeleton }
//!
//! #[async_trait]
//! impl Module for Worker {
//!     fn name(&self) -> &str { "worker" }
//!
//!     fn server(&self) -> Option<ServerHandle> {
//!         Some(self.skeleton.server_handle())
//!     }
//!
//!     async fn init(&mut self) -> Result<(), chassis::ModuleError> {
//!         self.skeleton.register(Echo { v: 0 }, |mut ci: CallInfo| {
//!             let v = ci.request_as::<Echo>().map(|e| e.v).unwrap_or(0);
//!             ci.ret(EchoAck { v: v * 2 });
//!         })?;
//!         Ok(())
//!     }
//!
//!     async fn start(&mut self, ctx: CancellationToken) {
//!         self.skeleton.run(ctx).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let worker = Worker { skeleton: Skeleton::new("worker") };
//!     app::run(vec![Box::new(worker)]).await;
//! }
//! ```
//!
//! ---

pub mod app;
pub mod cluster;
pub mod rpc;
pub mod timer;

mod backoff;
mod config;
mod error;
mod idgen;
mod logging;
mod message;
mod signal;
mod skeleton;

// ---- Public re-exports ----

pub use app::{App, AppState, Module};
pub use backoff::BackoffStrategy;
pub use config::Config;
pub use error::{ClusterError, LifecycleError, ModuleError, RpcError, TimerError};
pub use idgen::{id_seconds, id_sequence, next_id, IdGenerator};
pub use logging::LogConfig;
pub use message::{bkdr_hash, type_tag, Message, Payload};
pub use rpc::{CallInfo, Callback, Client, Handler, RetInfo, Server, ServerHandle};
pub use signal::wait_for_shutdown_signal;
pub use skeleton::Skeleton;
pub use timer::{AdjustMode, ManagedTimer, TimerMgr, PCT_BASE};

pub use cluster::NatsRpc;
