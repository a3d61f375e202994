mod alerts;
mod cli;
mod commander;
mod commands;
mod config;
mod device;
mod error;
mod fileserver;
mod inference;
mod mqtt;
mod ports;
mod process;
mod protocol;
mod recorder;
mod streams;
mod supervisor;

use std::path::PathBuf;

use anyhow::{Context, anyhow};
use chrono::Local;
use env_logger::Env;
use log::info;

use cli::{Cli, Mode};
use config::{Configuration, log_overrides, parse_configuration};
use fileserver::FileServer;
use ports::parse_port_list;
use streams::{FileSaveStream, RtspRelay, Stream};
use supervisor::Supervisor;

/// Runs a GStreamer worker on a blocking thread until it ends or Ctrl+C
/// (SIGINT from the supervisor) asks it to finish.
async fn run_stream(stream: impl Stream + Send + 'static) -> anyhow::Result<()> {
    let (interrupt_tx, interrupt_rx) = crossbeam::channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })?;

    tokio::task::spawn_blocking(move || stream.stream(&interrupt_rx))
        .await?
        .map_err(|e| anyhow!(e))
}

fn filesave_stream(
    configuration: &Configuration,
    output: Option<PathBuf>,
    udp_port: Option<u16>,
) -> anyhow::Result<FileSaveStream> {
    let section = &configuration.maskcam;
    let output = output.unwrap_or_else(|| {
        section
            .fileserver_hdd_dir
            .join(Local::now().format("%Y%m%d_%H%M%S.mp4").to_string())
    });
    let udp_port = match udp_port {
        Some(port) => port,
        None => *parse_port_list(&section.udp_ports_filesave)?
            .first()
            .context("udp-ports-filesave is empty")?,
    };
    Ok(FileSaveStream::new(section, output, udp_port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Cli::init();
    log_overrides();
    let configuration = parse_configuration(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    match args.command.unwrap_or(Mode::Run { uri: None }) {
        Mode::Run { uri } => {
            let input = match uri {
                Some(uri) => uri,
                None => {
                    info!(
                        "Using input from config file: {}",
                        configuration.maskcam.default_input
                    );
                    configuration.maskcam.default_input.clone()
                }
            };
            Supervisor::new(configuration, &args.config, &input)?
                .run()
                .await?;
        }
        Mode::Filesave { output, udp_port } => {
            run_stream(filesave_stream(&configuration, output, udp_port)?).await?;
        }
        Mode::Streaming => {
            run_stream(RtspRelay::new(&configuration.maskcam)).await?;
        }
        Mode::Fileserver { dir } => {
            let dir = dir.unwrap_or_else(|| configuration.maskcam.fileserver_hdd_dir.clone());
            FileServer::new(dir, configuration.maskcam.fileserver_port)
                .run()
                .await?;
        }
        Mode::Commander => {
            commander::run(&configuration).await?;
        }
    }
    Ok(())
}
