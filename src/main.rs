//! vmdap - Debug Adapter Protocol server for VM service runtimes.
//!
//! Speaks DAP over stdio by default, or over TCP with `--listen`.

use anyhow::Context;
use clap::Parser;
use log::warn;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use vmdap::config::AdapterConfig;
use vmdap::dap::tracer::FileTracer;
use vmdap::log::LOGGER_SWITCHER;
use vmdap::server;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:4711. DAP is served over stdio when absent.
    #[clap(long)]
    listen: Option<String>,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,

    /// Optional log file for adapter diagnostics (no output to stdout).
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    trace_dap: bool,

    /// Path to a config file, `~/.config/vmdap/config.toml` is used by default.
    #[clap(long, env = "VMDAP_CONFIG")]
    config: Option<String>,

    /// Runtime executable, overrides the config file.
    #[clap(long)]
    runtime: Option<String>,

    /// Service proxy executable, overrides the config file.
    #[clap(long)]
    proxy_command: Option<PathBuf>,
}

fn init_logger(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    let logger = builder.build();
    let filter = logger.filter();
    LOGGER_SWITCHER.switch(logger, filter);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger(args.log_file.as_ref())?;

    let mut config = AdapterConfig::from_file(args.config.as_deref()).unwrap_or_default();
    if let Some(runtime) = args.runtime {
        config.runtime = runtime;
    }
    if args.proxy_command.is_some() {
        config.proxy_command = args.proxy_command;
    }

    let tracer = match (&args.log_file, args.trace_dap) {
        (Some(path), true) => Some(FileTracer::new(path)?),
        (None, true) => {
            warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
            None
        }
        (_, false) => None,
    };

    match args.listen {
        Some(listen) => {
            let addr: SocketAddr = listen.parse().context("Invalid listen address")?;
            server::listen(addr, args.oneshot, config, tracer).await
        }
        None => server::run_session(tokio::io::stdin(), tokio::io::stdout(), &config, tracer).await,
    }
}
