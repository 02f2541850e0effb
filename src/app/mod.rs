//! # Module lifecycle.
//!
//! An [`App`] owns the set of modules, drives their `init → start → destroy`
//! transitions and publishes the name → server lookup used by clients and the
//! cluster bridge.
//!
//! ```text
//!  NONE ──start──► INIT ──spawned──► RUN ──signal/stop──► STOP ──► NONE
//! ```
//!
//! ## Rules
//! - Static modules start in `(priority asc, name asc)` order and shut down
//!   in exactly the reverse order.
//! - Dynamic modules may be added and removed while running; they are removed
//!   first on shutdown.
//! - A static module task panic exits the process with code 255; dynamic
//!   panics are contained.

mod module;

pub use module::Module;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{panic_message, LifecycleError};
use crate::rpc::ServerHandle;
use crate::signal;

/// Application lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    /// Not started, or fully stopped.
    None,
    /// Initializing modules.
    Init,
    /// Modules running.
    Run,
    /// Shutting down.
    Stop,
}

const STATE_NONE: i32 = 0;
const STATE_INIT: i32 = 1;
const STATE_RUN: i32 = 2;
const STATE_STOP: i32 = 3;

fn state_from(raw: i32) -> AppState {
    match raw {
        STATE_INIT => AppState::Init,
        STATE_RUN => AppState::Run,
        STATE_STOP => AppState::Stop,
        _ => AppState::None,
    }
}

struct ModuleSlot {
    name: String,
    server: Option<ServerHandle>,
    cancel: CancellationToken,
    join: Option<JoinHandle<Box<dyn Module>>>,
}

struct AppInner {
    config: Config,
    pending: Mutex<Vec<Box<dyn Module>>>,
    statics: RwLock<Vec<ModuleSlot>>,
    dynamics: DashMap<String, ModuleSlot>,
    state: AtomicI32,
}

/// Cheap-clone handle to the module lifecycle.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

static DEFAULT: LazyLock<App> = LazyLock::new(App::new);

impl App {
    /// Creates an isolated app with default bounds.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an isolated app with explicit bounds.
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(AppInner {
                config,
                pending: Mutex::new(Vec::new()),
                statics: RwLock::new(Vec::new()),
                dynamics: DashMap::new(),
                state: AtomicI32::new(STATE_NONE),
            }),
        }
    }

    /// The process-wide default app.
    pub fn global() -> App {
        DEFAULT.clone()
    }

    /// The bounds this app was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AppState {
        state_from(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: i32) {
        self.inner.state.store(state, Ordering::SeqCst);
    }

    /// Queues modules for the next `start`/`run`.
    ///
    /// Refused once the app has left the idle state.
    pub fn register(&self, modules: Vec<Box<dyn Module>>) -> Result<(), LifecycleError> {
        if self.state() != AppState::None {
            return Err(LifecycleError::AlreadyRunning);
        }
        self.inner.pending.lock().unwrap().extend(modules);
        Ok(())
    }

    /// Initializes and starts every registered module plus `modules`.
    ///
    /// Modules are sorted stably by `(priority asc, name asc)`, initialized
    /// in that order (the first failure aborts startup) and then spawned.
    pub async fn start(&self, modules: Vec<Box<dyn Module>>) -> Result<(), LifecycleError> {
        if self
            .inner
            .state
            .compare_exchange(STATE_NONE, STATE_INIT, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::error!(state = ?self.state(), "application cannot start twice");
            return Err(LifecycleError::AlreadyRunning);
        }

        let mut mods: Vec<Box<dyn Module>> = self.inner.pending.lock().unwrap().drain(..).collect();
        mods.extend(modules);
        if mods.is_empty() {
            tracing::warn!("no modules provided to start");
            self.set_state(STATE_NONE);
            return Err(LifecycleError::NoModules);
        }

        sort_modules(&mut mods);

        tracing::info!(count = mods.len(), "application starting");
        for m in &mods {
            tracing::info!("module startup order {} (priority: {})", m.name(), m.priority());
        }

        let mut initialized = Vec::with_capacity(mods.len());
        for mut m in mods {
            if let Err(e) = m.init().await {
                tracing::error!("module {} initialization failed: {e}", m.name());
                return Err(LifecycleError::InitFailed {
                    name: m.name().to_string(),
                    source: e,
                });
            }
            initialized.push(m);
        }

        // publish the registry before any module task can run, so lookups
        // from a module's first iteration already resolve
        let mut slots = Vec::with_capacity(initialized.len());
        let mut to_spawn = Vec::with_capacity(initialized.len());
        for m in initialized {
            let cancel = CancellationToken::new();
            slots.push(ModuleSlot {
                name: m.name().to_string(),
                server: m.server(),
                cancel: cancel.clone(),
                join: None,
            });
            to_spawn.push((m, cancel));
        }
        *self.inner.statics.write().unwrap() = slots;
        for (index, (m, cancel)) in to_spawn.into_iter().enumerate() {
            let join = tokio::spawn(drive(m, cancel, false));
            self.inner.statics.write().unwrap()[index].join = Some(join);
        }

        self.set_state(STATE_RUN);
        tracing::info!("application started successfully");
        Ok(())
    }

    /// Starts the modules, then blocks until SIGINT/SIGTERM and shuts down.
    ///
    /// SIGHUP is logged and ignored.
    pub async fn run(&self, modules: Vec<Box<dyn Module>>) {
        if let Err(e) = self.start(modules).await {
            tracing::error!("application failed to start: {e}");
            return;
        }
        if let Err(e) = signal::wait_for_shutdown_signal().await {
            tracing::error!("signal listener failed: {e}");
        }
        self.stop().await;
    }

    /// Shuts everything down: dynamic modules first, then static modules in
    /// reverse startup order.
    pub async fn stop(&self) {
        if self.state() == AppState::Stop {
            tracing::warn!("application already stopping");
            return;
        }
        self.set_state(STATE_STOP);
        tracing::info!("application shutdown initiated");

        self.remove_all_dynamic().await;

        let mut slots: Vec<ModuleSlot> = {
            let mut statics = self.inner.statics.write().unwrap();
            statics.drain(..).collect()
        };
        for slot in slots.iter_mut().rev() {
            self.shutdown_module(slot).await;
        }

        self.set_state(STATE_NONE);
        tracing::info!("application shutdown complete");
    }

    async fn shutdown_module(&self, slot: &mut ModuleSlot) {
        tracing::info!("signaling module {} shutdown", slot.name);
        slot.cancel.cancel();

        let Some(mut join) = slot.join.take() else {
            return;
        };
        match tokio::time::timeout(self.inner.config.module_stop_timeout, &mut join).await {
            Ok(Ok(module)) => {
                tracing::info!("module {} task exited", slot.name);
                destroy_module(module);
            }
            Ok(Err(e)) => {
                tracing::error!("module {} task failed: {e}", slot.name);
            }
            Err(_elapsed) => {
                tracing::error!("module {} shutdown timeout", slot.name);
                // destroy still runs, whenever the stuck task finally exits
                tokio::spawn(async move {
                    if let Ok(module) = join.await {
                        destroy_module(module);
                    }
                });
            }
        }
        tracing::info!("module {} shutdown complete", slot.name);
    }

    /// Adds modules while running; the batch is sorted by the startup key,
    /// initialized, then spawned.
    pub async fn add_dynamic(&self, modules: Vec<Box<dyn Module>>) -> Result<(), LifecycleError> {
        let mut mods = modules;
        sort_modules(&mut mods);

        for mut m in mods {
            if let Err(e) = m.init().await {
                tracing::error!("module {} init error {e}", m.name());
                return Err(LifecycleError::InitFailed {
                    name: m.name().to_string(),
                    source: e,
                });
            }
            let name = m.name().to_string();
            let cancel = CancellationToken::new();
            let slot = ModuleSlot {
                name: name.clone(),
                server: m.server(),
                cancel: cancel.clone(),
                join: None,
            };
            if let Some(old) = self.inner.dynamics.insert(name.clone(), slot) {
                tracing::warn!("dynamic module {} replaced while running", old.name);
            }
            let join = tokio::spawn(drive(m, cancel, true));
            if let Some(mut entry) = self.inner.dynamics.get_mut(&name) {
                entry.join = Some(join);
            }
        }
        Ok(())
    }

    /// Removes a dynamic module: cancel, wait, destroy, delete.
    pub async fn remove_dynamic(&self, name: &str) -> bool {
        let Some((_, mut slot)) = self.inner.dynamics.remove(name) else {
            return false;
        };
        slot.cancel.cancel();
        if let Some(join) = slot.join.take() {
            match join.await {
                Ok(module) => destroy_module(module),
                Err(e) => tracing::error!("dynamic module {name} task failed: {e}"),
            }
        }
        true
    }

    async fn remove_all_dynamic(&self) {
        let names: Vec<String> = self.inner.dynamics.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove_dynamic(&name).await;
        }
    }

    /// Names of the dynamic modules currently running.
    pub fn dynamic_modules(&self) -> Vec<String> {
        self.inner.dynamics.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolves a module name to its RPC server handle.
    pub fn server(&self, name: &str) -> Option<ServerHandle> {
        {
            let statics = self.inner.statics.read().unwrap();
            for slot in statics.iter() {
                if slot.name == name {
                    return slot.server.clone();
                }
            }
        }
        self.inner.dynamics.get(name).and_then(|slot| slot.server.clone())
    }

    /// Consistent snapshot of module names and their RPC queue depths.
    pub fn stats(&self) -> String {
        let mut out = String::new();
        {
            let statics = self.inner.statics.read().unwrap();
            for slot in statics.iter() {
                append_stats(&mut out, "static", slot);
            }
        }
        for entry in self.inner.dynamics.iter() {
            append_stats(&mut out, "dynamic", entry.value());
        }
        out
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

fn append_stats(out: &mut String, kind: &str, slot: &ModuleSlot) {
    match &slot.server {
        Some(server) => out.push_str(&format!(
            "{kind}: {}, rpc_queue_length: {}\n",
            slot.name,
            server.queue_len()
        )),
        None => out.push_str(&format!("{kind}: {}, rpc_queue_length: N/A\n", slot.name)),
    }
}

fn sort_modules(mods: &mut [Box<dyn Module>]) {
    mods.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.name().cmp(b.name()))
    });
}

/// Runs one module's `start`, containing panics.
///
/// A static module panic is fatal: the process exits with code 255. The
/// module object is returned so `destroy` can run on the shutdown path.
async fn drive(
    mut module: Box<dyn Module>,
    ctx: CancellationToken,
    dynamic: bool,
) -> Box<dyn Module> {
    let name = module.name().to_string();
    tracing::info!("started module {name}");
    match AssertUnwindSafe(module.start(ctx)).catch_unwind().await {
        Ok(()) => tracing::info!("module {name} stopped"),
        Err(payload) => {
            tracing::error!("module {name} panicked: {}", panic_message(&*payload));
            if !dynamic {
                tracing::error!("static module failure is fatal, exiting");
                std::process::exit(255);
            }
        }
    }
    module
}

fn destroy_module(mut module: Box<dyn Module>) {
    let name = module.name().to_string();
    tracing::info!("destroying module {name}");
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| module.destroy())) {
        tracing::error!("module {name} destroy panicked: {}", panic_message(&*payload));
    }
}

/// Queues modules on the default app.
pub fn register(modules: Vec<Box<dyn Module>>) -> Result<(), LifecycleError> {
    App::global().register(modules)
}

/// Runs the default app until a termination signal arrives.
pub async fn run(modules: Vec<Box<dyn Module>>) {
    App::global().run(modules).await;
}

/// Resolves a module name on the default app.
pub fn server(name: &str) -> Option<ServerHandle> {
    App::global().server(name)
}

/// Stats snapshot of the default app.
pub fn stats() -> String {
    App::global().stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use async_trait::async_trait;

    struct Probe {
        name: &'static str,
        priority: u32,
        log: Arc<Mutex<Vec<String>>>,
        fail_init: bool,
    }

    impl Probe {
        fn boxed(
            name: &'static str,
            priority: u32,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn Module> {
            Box::new(Self {
                name,
                priority,
                log: Arc::clone(log),
                fail_init: false,
            })
        }

        fn record(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{event}:{}", self.name));
        }
    }

    #[async_trait]
    impl Module for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        async fn init(&mut self) -> Result<(), ModuleError> {
            if self.fail_init {
                return Err("probe init failure".into());
            }
            self.record("init");
            Ok(())
        }

        async fn start(&mut self, ctx: CancellationToken) {
            self.record("start");
            ctx.cancelled().await;
        }

        fn destroy(&mut self) {
            self.record("destroy");
        }
    }

    fn events(log: &Arc<Mutex<Vec<String>>>, prefix: &str) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn init_order_follows_priority_then_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App::new();
        app.start(vec![
            Probe::boxed("zeta", 1, &log),
            Probe::boxed("alpha", 2, &log),
            Probe::boxed("beta", 1, &log),
        ])
        .await
        .expect("start");

        assert_eq!(events(&log, "init"), vec!["init:beta", "init:zeta", "init:alpha"]);
        assert_eq!(app.state(), AppState::Run);
        app.stop().await;
    }

    #[tokio::test]
    async fn destroy_runs_in_reverse_startup_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App::new();
        app.start(vec![
            Probe::boxed("first", 0, &log),
            Probe::boxed("second", 1, &log),
            Probe::boxed("third", 2, &log),
        ])
        .await
        .expect("start");

        app.stop().await;

        assert_eq!(
            events(&log, "destroy"),
            vec!["destroy:third", "destroy:second", "destroy:first"]
        );
        assert_eq!(app.state(), AppState::None);
    }

    #[tokio::test]
    async fn init_failure_aborts_startup() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App::new();
        let failing = Box::new(Probe {
            name: "broken",
            priority: 1,
            log: Arc::clone(&log),
            fail_init: true,
        });

        let err = app
            .start(vec![
                Probe::boxed("early", 0, &log),
                failing,
                Probe::boxed("late", 2, &log),
            ])
            .await
            .expect_err("init fails");
        assert!(matches!(err, LifecycleError::InitFailed { ref name, .. } if name == "broken"));

        // modules after the failing one were never initialized
        assert_eq!(events(&log, "init"), vec!["init:early"]);
        assert!(events(&log, "start").is_empty());
    }

    #[tokio::test]
    async fn double_start_is_refused() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App::new();
        app.start(vec![Probe::boxed("only", 0, &log)]).await.expect("start");
        let err = app.start(vec![Probe::boxed("again", 0, &log)]).await;
        assert!(matches!(err, Err(LifecycleError::AlreadyRunning)));
        app.stop().await;
    }

    #[tokio::test]
    async fn dynamic_modules_add_and_remove() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App::new();
        app.start(vec![Probe::boxed("core", 0, &log)]).await.expect("start");

        app.add_dynamic(vec![Probe::boxed("plugin", 5, &log)])
            .await
            .expect("add");
        assert_eq!(app.dynamic_modules(), vec!["plugin".to_string()]);

        // removal waits for the task and destroys
        assert!(app.remove_dynamic("plugin").await);
        assert!(app.dynamic_modules().is_empty());
        assert!(events(&log, "destroy").contains(&"destroy:plugin".to_string()));
        assert!(!app.remove_dynamic("plugin").await);

        app.stop().await;
    }

    #[tokio::test]
    async fn stats_lists_every_module() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App::new();
        app.start(vec![Probe::boxed("core", 0, &log)]).await.expect("start");
        app.add_dynamic(vec![Probe::boxed("extra", 1, &log)])
            .await
            .expect("add");

        let stats = app.stats();
        assert!(stats.contains("static: core"));
        assert!(stats.contains("dynamic: extra"));

        app.stop().await;
    }

    #[tokio::test]
    async fn register_then_start_uses_pending_modules() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App::new();
        app.register(vec![Probe::boxed("queued", 0, &log)]).expect("register");
        app.start(Vec::new()).await.expect("start");
        assert_eq!(events(&log, "init"), vec!["init:queued"]);
        app.stop().await;

        let err = app.register(vec![Probe::boxed("late", 0, &log)]);
        assert!(err.is_ok(), "registry reopens after full stop");
    }
}
