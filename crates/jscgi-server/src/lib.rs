//! jscgi Server
//!
//! This crate provides the worker pool and the request pipeline for running
//! JavaScript files as per-request handlers with the Boa JavaScript engine.

pub mod access;
pub mod dispatch;
pub mod executor;
pub mod http_server;
pub mod module_cache;
pub mod resolver;
pub mod runtime;
pub mod supervisor;
pub mod use_file;
pub mod watcher;
pub mod worker;

pub use dispatch::{App, BootHook, Middleware};
pub use executor::{ExecutionState, RequestContext, ScriptExecutor, ScriptRequest};
pub use runtime::ScriptRuntime;
pub use supervisor::{ExeLauncher, Supervisor, WorkerLauncher, WorkerProcess, WorkerState};
pub use use_file::{use_file_hook, ScriptMiddleware};
pub use worker::{run_worker, BoundWorker, Worker};
