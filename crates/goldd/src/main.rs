use std::ffi::OsStr;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use gold_config::{GoldConfig, config_path, ensure_workspace_config, validate_config};
use goldd::Backends;
use goldd::cli::{Cli, Commands, LogFormat, ServeArgs};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Human => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.json().with_current_span(false).init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(&workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "config warning: {}", warning.message);
    }

    let backends = Backends::open(&workspace, &config)?;
    let mut out = std::io::stdout();
    match cli.command {
        None => serve(&workspace, &config, &backends, &ServeArgs::default()),
        Some(Commands::Serve(args)) => serve(&workspace, &config, &backends, &args),
        Some(Commands::ByBlame(args)) => goldd::run_by_blame(&backends, &args.corpus, &mut out),
        Some(Commands::Log(args)) => goldd::run_log(&backends, &args, &mut out),
        Some(Commands::Undo(args)) => goldd::run_undo(&backends, &args, &mut out),
    }
}

fn serve(workspace: &Path, config: &GoldConfig, backends: &Backends, args: &ServeArgs) -> Result<()> {
    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| config.server.bind.clone());
    let app = gold_web::router(backends.app_state(config));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        tracing::info!(
            addr = %bind,
            workspace = %workspace.display(),
            "gold server listening"
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server exited with error")
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
