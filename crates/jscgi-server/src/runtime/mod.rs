//! Boa-backed script runtime for a worker process.

pub mod context;
pub mod modules;
pub mod timers;

mod app_object;
mod bindings;
mod conversions;
mod http_objects;
mod job_executor;


pub use app_object::Route;
pub use context::{RuntimeEvents, ScriptRuntime};
pub use modules::{resolve_module, ModuleLoader};
