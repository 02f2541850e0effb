//! # Module abstraction.
//!
//! A [`Module`] is a named, prioritized unit of the application: initialized
//! once, started once as a long-running task, destroyed once. Most modules
//! own a [`Skeleton`](crate::Skeleton) and implement `start` by running its
//! event loop.
//!
//! ## Rules
//! - `init` is where RPC handlers and timer kinds are registered.
//! - `start` **must** watch its [`CancellationToken`] and return promptly on
//!   cancellation; that is the only shutdown signal a module gets.
//! - A panic in a static module's `start` terminates the process with exit
//!   code 255; dynamic module panics are contained.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ModuleError;
use crate::rpc::ServerHandle;

/// A lifecycle-managed unit of the application.
#[async_trait]
pub trait Module: Send + 'static {
    /// Stable, unique module name; the RPC address of the module.
    fn name(&self) -> &str;

    /// Startup order weight: lower starts earlier, shuts down later.
    /// Ties are broken by name.
    fn priority(&self) -> u32 {
        0
    }

    /// Producer handle of the module's RPC server, if it has one.
    ///
    /// Published in the lifecycle registry under [`name`](Module::name).
    fn server(&self) -> Option<ServerHandle> {
        None
    }

    /// One-time initialization before any module starts.
    ///
    /// An error aborts application startup.
    async fn init(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Long-running body; returns when `ctx` is cancelled.
    async fn start(&mut self, ctx: CancellationToken);

    /// One-time teardown after the module task has exited.
    fn destroy(&mut self) {}
}
