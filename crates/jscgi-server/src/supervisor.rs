//! Worker pool supervisor
//!
//! The supervisor starts the configured number of worker processes and keeps
//! the pool at that size: whenever a worker exits, for whatever reason, one
//! replacement is spawned right away.
//!
//! # Limitations
//!
//! Respawning is unconditional. There is no backoff and no crash-loop
//! detection, so a worker that dies on startup is restarted as fast as the OS
//! can fork.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use jscgi_common::config::WORKER_CONFIG_ENV;
use jscgi_common::{CgiError, Config, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::worker::parse_listening_line;

/// Environment variable carrying a worker's pool identifier.
pub const WORKER_ID_ENV: &str = "JSCGI_WORKER_ID";

pub type WorkerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet listening
    Starting,
    /// Announced its listen address
    Listening(SocketAddr),
    /// Exited; a replacement is being spawned
    Disconnected,
}

/// Snapshot of one pool member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
}

/// Starts worker processes.
///
/// A launched child must have its stdout piped; the supervisor reads the
/// worker's `LISTENING <addr>` line from it.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, id: WorkerId) -> io::Result<Child>;
}

/// Launches workers by re-executing a binary with the `worker` subcommand.
pub struct ExeLauncher {
    program: PathBuf,
    config_json: String,
}

impl ExeLauncher {
    pub fn new(program: impl Into<PathBuf>, config: &Config) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            config_json: config.to_json()?,
        })
    }

    /// Launcher for the currently running executable.
    pub fn current_exe(config: &Config) -> Result<Self> {
        Self::new(std::env::current_exe()?, config)
    }
}

impl WorkerLauncher for ExeLauncher {
    fn launch(&self, id: WorkerId) -> io::Result<Child> {
        Command::new(&self.program)
            .arg("worker")
            .env(WORKER_CONFIG_ENV, &self.config_json)
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

#[derive(Debug)]
enum WorkerEvent {
    Listening(WorkerId, SocketAddr),
    Exited(WorkerId, io::Result<ExitStatus>),
}

pub struct Supervisor<L> {
    config: Arc<Config>,
    launcher: L,
    next_id: WorkerId,
    workers: BTreeMap<WorkerId, WorkerProcess>,
    monitors: JoinSet<()>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    snapshot: watch::Sender<Vec<WorkerProcess>>,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(config: Arc<Config>, launcher: L) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            config,
            launcher,
            next_id: 0,
            workers: BTreeMap::new(),
            monitors: JoinSet::new(),
            events_tx,
            events_rx,
            snapshot,
        }
    }

    /// Watches the pool. The snapshot is republished on every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<WorkerProcess>> {
        self.snapshot.subscribe()
    }

    /// Runs the pool until ctrl-c.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Runs the pool until `shutdown` resolves. Workers are killed on return.
    ///
    /// # Errors
    ///
    /// Returns [`CgiError::Fork`] if the first worker cannot be started.
    /// Later spawn failures are only logged.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Starting {} workers", self.config.workers);

        self.spawn()?;
        for _ in 1..self.config.workers {
            if let Err(e) = self.spawn() {
                tracing::error!("{}", e);
            }
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.next_event() => self.handle_event(event),
            }
        }

        tracing::info!("Shutting down {} workers", self.workers.len());
        self.monitors.shutdown().await;
        Ok(())
    }

    /// Waits for the next worker event, reaping finished monitors meanwhile.
    async fn next_event(&mut self) -> Option<WorkerEvent> {
        loop {
            tokio::select! {
                biased;
                Some(joined) = self.monitors.join_next(), if !self.monitors.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Worker monitor panicked: {}", e);
                        }
                    }
                }
                event = self.events_rx.recv() => return event,
            }
        }
    }

    fn spawn(&mut self) -> Result<WorkerId> {
        let id = self.next_id;
        self.next_id += 1;

        let mut child = self
            .launcher
            .launch(id)
            .map_err(|e| CgiError::Fork(e.to_string()))?;
        let pid = child.id();
        let stdout = child.stdout.take();

        self.monitors.spawn(monitor(id, child, stdout, self.events_tx.clone()));
        self.workers.insert(
            id,
            WorkerProcess {
                id,
                pid,
                state: WorkerState::Starting,
            },
        );
        self.publish();

        tracing::debug!("Spawned worker {} (pid {:?})", id, pid);
        Ok(id)
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Listening(id, addr) => {
                if let Some(worker) = self.workers.get_mut(&id) {
                    worker.state = WorkerState::Listening(addr);
                }
                self.publish();
                tracing::info!("A worker is now connected to {}", addr);
            }
            WorkerEvent::Exited(id, status) => {
                let pid = self.workers.get(&id).and_then(|worker| worker.pid);
                match status {
                    Ok(status) => tracing::warn!(
                        "Worker {} (pid {:?}) disconnected with {}. Spawning a new one",
                        id,
                        pid,
                        status
                    ),
                    Err(e) => tracing::warn!(
                        "Worker {} (pid {:?}) was lost: {}. Spawning a new one",
                        id,
                        pid,
                        e
                    ),
                }

                if let Some(worker) = self.workers.get_mut(&id) {
                    worker.state = WorkerState::Disconnected;
                }
                self.publish();
                self.workers.remove(&id);

                if let Err(e) = self.spawn() {
                    tracing::error!("{}", e);
                    self.publish();
                }
            }
        }
    }

    fn publish(&self) {
        self.snapshot
            .send_replace(self.workers.values().cloned().collect());
    }
}

/// Follows one child: forwards its `LISTENING` line, then waits for exit.
async fn monitor(
    id: WorkerId,
    mut child: Child,
    stdout: Option<ChildStdout>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_listening_line(&line) {
                Some(addr) => {
                    let _ = events.send(WorkerEvent::Listening(id, addr));
                }
                None => tracing::debug!("worker {}: {}", id, line),
            }
        }
    }

    let status = child.wait().await;
    let _ = events.send(WorkerEvent::Exited(id, status));
}
