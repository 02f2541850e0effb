//! # Global runtime configuration.
//!
//! [`Config`] centralizes the framework's bounds: queue capacities for the
//! RPC and timer channels, the blocking-enqueue deadline, the async client
//! drain budget, and the per-module shutdown wait.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use chassis::Config;
//!
//! let mut cfg = Config::default();
//! cfg.rpc_queue = 512;
//! cfg.module_stop_timeout = Duration::from_secs(60);
//!
//! assert_eq!(cfg.rpc_queue, 512);
//! ```

use std::time::Duration;

/// Global configuration for the runtime.
///
/// Controls channel capacities and the deadlines applied on enqueue, client
/// drain and module shutdown.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of each server's inbound call queue.
    pub rpc_queue: usize,
    /// Capacity of each client's shared async-reply queue.
    pub async_reply_queue: usize,
    /// Capacity of the timer dispatcher's op and fire queues.
    pub timer_queue: usize,
    /// Deadline for a blocking enqueue onto a full server queue.
    pub enqueue_timeout: Duration,
    /// Budget for draining outstanding async replies on client close.
    pub client_drain: Duration,
    /// Maximum wait for a module task to exit during shutdown.
    pub module_stop_timeout: Duration,
}

impl Default for Config {
    /// Provides the stock bounds:
    /// - `rpc_queue = 10_000`
    /// - `async_reply_queue = 10_000`
    /// - `timer_queue = 10_000`
    /// - `enqueue_timeout = 5s`
    /// - `client_drain = 5s`
    /// - `module_stop_timeout = 30min`
    fn default() -> Self {
        Self {
            rpc_queue: 10_000,
            async_reply_queue: 10_000,
            timer_queue: 10_000,
            enqueue_timeout: Duration::from_secs(5),
            client_drain: Duration::from_secs(5),
            module_stop_timeout: Duration::from_secs(30 * 60),
        }
    }
}
