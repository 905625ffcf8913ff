mod api;
mod config;
mod events;
mod host;
mod io;
mod logging;
mod rpc;
mod session;
mod sync;

#[cfg(test)]
mod test_utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api::{ApiError, BytePosition, NvimApi};
use clap::Parser;
use config::{MirrorConfig, resolve_nvim_path};
use host::{HostSurface, MemorySurface};
use logging::{LogConfig, init_logging};
use session::{Mirror, MirrorError};
use sync::{CursorState, SelectionRange};
use tracing::{info, warn};

/// Mirror a text buffer through a headless Neovim and report the result
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the nvim executable (overrides MIRROR_NVIM_PATH env var)
    #[arg(long, value_name = "PATH")]
    nvim_path: Option<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides MIRROR_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Initial text of the host surface
    #[arg(long, conflicts_with = "file")]
    text: Option<String>,

    /// Read the initial text from a file
    #[arg(long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Keys to send, in Neovim key notation; repeat for several batches
    #[arg(long = "keys", value_name = "KEYS")]
    keys: Vec<String>,

    /// Milliseconds without remote events after which a batch is settled
    #[arg(long, value_name = "MS", default_value_t = 200)]
    settle_ms: u64,

    /// Load init.lua or init.vim from the nvim-mirror config directory
    #[arg(long)]
    use_config: bool,

    /// Fail remote calls that take longer than this many seconds
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Vimscript expression to evaluate once the keys are applied; repeatable
    #[arg(long = "eval", value_name = "EXPR")]
    eval: Vec<String>,

    /// Lua chunk to run once the keys are applied; repeatable
    #[arg(long = "lua", value_name = "CODE")]
    lua: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, serde::Serialize)]
struct Report {
    text: String,
    selection: SelectionRange,
    cursor: Option<CursorState>,
    remote: Option<RemoteSnapshot>,
}

/// Final state as the editor itself sees it
#[derive(Debug, serde::Serialize)]
struct RemoteSnapshot {
    mode: String,
    buffer_name: String,
    cursor: BytePosition,
    evaluated: Vec<Evaluation>,
}

#[derive(Debug, PartialEq, serde::Serialize)]
struct Evaluation {
    source: String,
    result: String,
}

fn build_config(args: &Args) -> Result<MirrorConfig, config::ConfigError> {
    let mut builder = MirrorConfig::builder()
        .nvim_path(resolve_nvim_path(args.nvim_path.clone()))
        .discover_startup_file(args.use_config)
        .stderr_handler(|line| warn!("nvim: {}", line));
    if let Some(secs) = args.timeout_secs {
        builder = builder.request_timeout(Duration::from_secs(secs));
    }
    builder.build()
}

/// Focus the surface, send every key batch and collect the final state
async fn run(
    mirror: &mut Mirror,
    surface: &MemorySurface,
    args: &Args,
    text: &str,
) -> Result<Report, MirrorError> {
    let settle = Duration::from_millis(args.settle_ms);

    mirror.focus("nvim-mirror://cli", text).await?;
    mirror.pump(settle).await?;

    for keys in &args.keys {
        if !mirror.handle_keystroke(keys).await? {
            warn!("Keys not accepted: {:?}", keys);
        }
        let applied = mirror.pump(settle).await?;
        info!("Applied {} events after {:?}", applied, keys);
    }

    let remote = match mirror.api() {
        Some(api) => Some(inspect(api, args).await?),
        None => None,
    };
    Ok(Report {
        text: surface.text(),
        selection: surface.selection(),
        cursor: mirror.cursor_state(),
        remote,
    })
}

/// Query mode, buffer, cursor and the requested expressions from the editor
async fn inspect(api: &NvimApi, args: &Args) -> Result<RemoteSnapshot, ApiError> {
    let mode = api.get_mode().await?.mode;
    let buffer = api.get_current_buf().await?;
    let buffer_name = api.buf_get_name(buffer).await?;
    let window = api.get_current_win().await?;
    let cursor = api.win_get_cursor(window).await?;

    let mut evaluated = Vec::with_capacity(args.eval.len() + args.lua.len());
    for expression in &args.eval {
        let value = api.eval(expression).await?;
        evaluated.push(Evaluation {
            source: expression.clone(),
            result: value.to_string(),
        });
    }
    for chunk in &args.lua {
        let value = api.exec_lua(chunk, vec![]).await?;
        evaluated.push(Evaluation {
            source: chunk.clone(),
            result: value.to_string(),
        });
    }

    Ok(RemoteSnapshot {
        mode,
        buffer_name,
        cursor,
        evaluated,
    })
}

fn print_report(report: &Report, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", report.text);
    let SelectionRange { start, end } = report.selection;
    eprintln!(
        "selection: {}:{} - {}:{}",
        start.line, start.col, end.line, end.col
    );
    if let Some(remote) = &report.remote {
        eprintln!("mode: {}", remote.mode);
        eprintln!(
            "editor cursor: {}:{} in {}",
            remote.cursor.line, remote.cursor.byte, remote.buffer_name
        );
        for evaluation in &remote.evaluated {
            eprintln!("{} => {}", evaluation.source, evaluation.result);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let text = match (&args.text, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => String::new(),
    };

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    info!("Using nvim: {}", config.nvim_path);

    let surface = Arc::new(MemorySurface::new(text.clone()));
    let mut mirror = Mirror::new(config, Arc::clone(&surface) as Arc<dyn HostSurface>);
    mirror.start().await?;

    let outcome = run(&mut mirror, &surface, &args, &text).await;
    mirror.stop().await;

    print_report(&outcome?, args.json)?;
    Ok(())
}
