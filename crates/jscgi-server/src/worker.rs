//! Worker process
//!
//! A worker owns one script runtime, one dispatcher and one listener on the
//! shared address. It reports its bound address to the supervisor with a
//! single `LISTENING <addr>` line on stdout, then serves until a fatal error.

use std::io::Write;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use jscgi_common::{Config, Result};
use tokio::net::TcpListener;

use crate::dispatch::{App, BootHook, Dispatcher};
use crate::executor::ScriptExecutor;
use crate::http_server::{bind_listener, HttpServer};
use crate::runtime::{RuntimeEvents, ScriptRuntime};

/// Prefix of the control line a worker prints once it is listening.
pub const LISTENING_PREFIX: &str = "LISTENING ";

pub fn listening_line(addr: SocketAddr) -> String {
    format!("{}{}", LISTENING_PREFIX, addr)
}

/// Parses a control line printed by [`BoundWorker::announce`].
pub fn parse_listening_line(line: &str) -> Option<SocketAddr> {
    line.trim().strip_prefix(LISTENING_PREFIX)?.trim().parse().ok()
}

pub struct Worker {
    config: Arc<Config>,
    boot_hook: Option<BootHook>,
}

impl Worker {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            boot_hook: None,
        }
    }

    /// Sets the hook that configures the [`App`] before the worker listens.
    pub fn with_boot_hook(mut self, hook: impl FnOnce(&mut App) + 'static) -> Self {
        self.boot_hook = Some(Box::new(hook));
        self
    }

    /// Builds the runtime and binds the listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(self) -> Result<BoundWorker> {
        let (runtime, events) = ScriptRuntime::new(self.config.watch_required)?;

        let mut app = App::with_runtime(runtime.clone(), self.config.default_timeout());
        if let Some(hook) = self.boot_hook {
            hook(&mut app);
            tracing::debug!("Boot hook installed {} middleware", app.middleware_count());
        }

        let executor = ScriptExecutor::new(runtime.clone(), self.config.default_timeout());
        let dispatcher = Rc::new(Dispatcher::new(app, &self.config, executor));

        let listener = bind_listener(self.config.listen_addr())?;
        let local_addr = listener.local_addr()?;

        Ok(BoundWorker {
            listener,
            local_addr,
            server: HttpServer::new(dispatcher),
            runtime,
            events,
        })
    }
}

/// A worker whose listener is bound but not yet serving.
pub struct BoundWorker {
    listener: TcpListener,
    local_addr: SocketAddr,
    server: HttpServer,
    runtime: Rc<ScriptRuntime>,
    events: RuntimeEvents,
}

impl BoundWorker {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tells the supervisor where this worker listens.
    pub fn announce(&self) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", listening_line(self.local_addr))?;
        stdout.flush()?;
        Ok(())
    }

    /// Serves requests until a fatal error.
    ///
    /// Must be polled inside a `LocalSet`. The listener is closed when this
    /// returns.
    pub async fn run(self) -> Result<()> {
        let BoundWorker {
            listener,
            local_addr,
            server,
            runtime,
            events,
        } = self;

        tracing::info!("Worker listening on {}", local_addr);

        tokio::select! {
            result = server.serve(listener) => {
                if let Err(err) = &result {
                    tracing::error!("Listener on {} failed: {}", local_addr, err);
                }
                result
            }
            fatal = runtime.drive(events) => {
                tracing::error!("{}. Killing process", fatal);
                Err(fatal)
            }
        }
    }
}

/// Convenience for the common case: bind, announce and serve.
pub async fn run_worker(config: Arc<Config>, boot_hook: Option<BootHook>) -> Result<()> {
    let bound = Worker { config, boot_hook }.bind()?;
    bound.announce()?;
    bound.run().await
}
