mod cli;
mod commands;
mod config;
mod error;

use std::process;

use clap::Parser;
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::{CommandExecutor, DownloadArgs, UploadArgs};
use crate::config::AppConfig;
use crate::error::{AppError, Result};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        let code = match e {
            AppError::Transfer(ref err) if err.is_cancelled() => 130,
            _ => 1,
        };
        process::exit(code);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let config = AppConfig::load(args.config.as_deref())?;

    let executor = match args.proxy {
        Some(proxy) => CommandExecutor::new_with_proxy(
            config,
            proxy,
            args.proxy_type,
            args.proxy_username,
            args.proxy_password,
        ),
        None => CommandExecutor::new(config),
    };

    match args.command {
        Commands::Upload {
            file,
            title,
            cookie,
            concurrency,
            max_retries,
            preupload_url,
        } => {
            executor
                .upload(UploadArgs {
                    file,
                    title,
                    cookie,
                    concurrency,
                    max_retries,
                    preupload_url,
                })
                .await
        }
        Commands::Download {
            url,
            output,
            headers,
            params,
            max_retries,
            stall_timeout,
        } => {
            executor
                .download(DownloadArgs {
                    url,
                    output,
                    headers,
                    params,
                    max_retries,
                    stall_timeout,
                })
                .await
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
