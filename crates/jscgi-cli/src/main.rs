//! # jscgi CLI Entry Point
//!
//! Main binary for the jscgi process manager.
//!
//! ## Usage
//!
//! ```bash
//! # Start a pool with the defaults (or ./js-cgi.config if present)
//! jscgi serve
//!
//! # Four workers on port 8080, reloading modules when they change
//! jscgi serve -p 8080 -w 4 --watch
//!
//! # Explicit config file, overridden by flags
//! jscgi serve -c /etc/js-cgi.json --timeout 5000
//!
//! # Mount the handlers exported by a middleware script in every worker
//! jscgi serve --use /etc/jscgi/use.js
//! ```
//!
//! `jscgi worker` is started by `jscgi serve` and is not meant to be run by
//! hand: it reads its configuration from the environment.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use argh::FromArgs;
use jscgi_common::Config;
use jscgi_server::supervisor::WORKER_ID_ENV;
use jscgi_server::{use_file_hook, ExeLauncher, Supervisor};

#[derive(FromArgs)]
/// jscgi - run JavaScript files as CGI-style request handlers
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Worker(WorkerArgs),
}

/// Arguments for starting the supervisor.
///
/// Every flag overrides the matching key of the config file, which in turn
/// overrides the built-in defaults.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start the worker pool
struct ServeArgs {
    /// path to a JSON config file (default: ./js-cgi.config when present)
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// address to listen on
    #[argh(option)]
    host: Option<IpAddr>,

    /// port to listen on
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// number of worker processes
    #[argh(option, short = 'w')]
    workers: Option<usize>,

    /// default script timeout in milliseconds; 0 or less disables it
    #[argh(option, short = 't')]
    timeout: Option<i64>,

    /// document root used when the proxy sends no path_translated header
    #[argh(option, short = 'd', long = "document-root")]
    document_root: Option<String>,

    /// accept requests from any address, not only loopback
    #[argh(switch, long = "allow-remote")]
    allow_remote: bool,

    /// reload required modules when their files change
    #[argh(switch)]
    watch: bool,

    /// file that receives every log line
    #[argh(option, long = "output-log")]
    output_log: Option<String>,

    /// file that receives warnings and errors
    #[argh(option, long = "error-log")]
    error_log: Option<String>,

    /// middleware script every worker loads at boot (default: use.js next to the executable)
    #[argh(option, long = "use")]
    use_file: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
/// run a single worker (started by `jscgi serve`)
struct WorkerArgs {}

impl ServeArgs {
    /// Builds the effective configuration: defaults, then file, then flags.
    fn into_config(self) -> Result<Config> {
        let mut config = Config::discover(self.config.as_deref().map(Path::new))?;

        if let Some(host) = self.host {
            config = config.with_host(host);
        }
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout_ms(timeout);
        }
        if let Some(root) = self.document_root {
            config = config.with_document_root(root);
        }
        if self.allow_remote {
            config = config.with_localhost_only(false);
        }
        if self.watch {
            config = config.with_watch(true);
        }
        if let Some(path) = self.output_log {
            config = config.with_output_log(path);
        }
        if let Some(path) = self.error_log {
            config = config.with_error_log(path);
        }
        if let Some(path) = self.use_file {
            config = config.with_use_file(path);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();
    let supervising = matches!(cli.command, Commands::Serve(_));

    let (config, role) = match cli.command {
        Commands::Serve(args) => (args.into_config()?, "supervisor".to_string()),
        Commands::Worker(WorkerArgs {}) => {
            let id = std::env::var(WORKER_ID_ENV).unwrap_or_else(|_| "?".into());
            (jscgi_cli::worker_config_from_env()?, format!("worker-{}", id))
        }
    };
    let config = Arc::new(config);

    jscgi_cli::init_logging(&config)?;

    // Every task runs on this thread, so the span stays current for all of them
    let span = jscgi_cli::process_span(&role);
    let _entered = span.enter();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if supervising {
        runtime.block_on(serve(config))
    } else {
        let hook = use_file_hook(config.use_file.clone());
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, jscgi_server::run_worker(config, Some(hook)))?;
        Ok(())
    }
}

async fn serve(config: Arc<Config>) -> Result<()> {
    tracing::info!(
        "Starting jscgi on {} with {} workers",
        config.listen_addr(),
        config.workers
    );
    if config.localhost_only {
        tracing::info!("Only accepting requests from localhost");
    }
    match config.default_timeout() {
        Some(timeout) => tracing::info!("Default script timeout: {}ms", timeout.as_millis()),
        None => tracing::info!("Script timeouts disabled"),
    }

    let launcher = ExeLauncher::current_exe(&config)?;
    Supervisor::new(config, launcher).run().await?;

    tracing::info!("Supervisor stopped");
    Ok(())
}
