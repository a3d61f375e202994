//! The inference worker: an external detection pipeline launched by the
//! supervisor. It reports back through line-delimited JSON on stdout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

use crate::config::MaskcamSection;
use crate::process::{P_INFERENCE, WorkerSpec};
use crate::protocol::Statistics;

pub const USBCAM_PROTOCOL: &str = "v4l2://";
pub const RASPICAM_PROTOCOL: &str = "argus://";

/// Reports waiting for the supervisor; there should be at most one unless
/// the supervisor loop is blocked.
pub const STATS_QUEUE_CAPACITY: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    UsbCamera,
    RaspiCamera,
    File,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with(USBCAM_PROTOCOL) {
            SourceKind::UsbCamera
        } else if uri.starts_with(RASPICAM_PROTOCOL) {
            SourceKind::RaspiCamera
        } else {
            SourceKind::File
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, SourceKind::UsbCamera | SourceKind::RaspiCamera)
    }
}

/// Output file for a file input: `output_<basename>` in the working directory.
pub fn output_filename(input: &str) -> String {
    let basename = input.rsplit('/').next().unwrap_or(input);
    format!("output_{}", basename)
}

/// One line of the inference worker's stdout protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InferenceEvent {
    /// The pipeline is producing frames.
    Ready,
    Statistics(Statistics),
}

/// Everything needed to (re)start the inference worker.
#[derive(Debug, Clone)]
pub struct InferenceLaunch {
    pub command: Vec<String>,
    pub input: String,
    pub output: Option<String>,
    pub udp_ports: Vec<u16>,
    pub statistics_period: u64,
    pub config_path: String,
}

impl InferenceLaunch {
    pub fn new(
        section: &MaskcamSection,
        input: &str,
        filesave_ports: &[u16],
        config_path: &str,
    ) -> Self {
        let output = if SourceKind::from_uri(input).is_live() {
            None
        } else {
            Some(output_filename(input))
        };
        let mut udp_ports = vec![section.udp_port_streaming];
        udp_ports.extend_from_slice(filesave_ports);
        Self {
            command: section
                .inference_command
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            input: input.to_string(),
            output,
            udp_ports,
            statistics_period: section.statistics_period,
            config_path: config_path.to_string(),
        }
    }

    pub fn udp_clients(&self) -> String {
        self.udp_ports
            .iter()
            .map(|port| format!("127.0.0.1:{}", port))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn worker_spec(&self) -> WorkerSpec {
        let (program, extra) = match self.command.split_first() {
            Some((program, extra)) => (program.as_str(), extra),
            None => ("maskcam-inference", &[][..]),
        };
        let mut spec = WorkerSpec::new(P_INFERENCE, program)
            .args(extra)
            .args(["--input", self.input.as_str()]);
        if let Some(output) = &self.output {
            spec = spec.args(["--output", output.as_str()]);
        }
        spec.args([
            "--udp-clients".to_string(),
            self.udp_clients(),
            "--statistics-period".to_string(),
            self.statistics_period.to_string(),
            "--config".to_string(),
            self.config_path.clone(),
        ])
        .capture_stdout()
    }
}

/// Statistics flowing from the inference worker to the supervisor, plus the
/// readiness flag raised once the pipeline is up.
pub struct InferenceFeed {
    tx: Sender<Statistics>,
    rx: Receiver<Statistics>,
    ready: Arc<AtomicBool>,
}

impl InferenceFeed {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(STATS_QUEUE_CAPACITY);
        Self {
            tx,
            rx,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn try_next(&mut self) -> Option<Statistics> {
        self.rx.try_recv().ok()
    }

    /// Handles one line as if the worker had printed it.
    #[cfg(test)]
    pub fn feed_line(&self, line: &str) {
        handle_line(line, &self.tx, &self.ready);
    }

    /// Reads the worker's stdout in the background until it closes.
    pub fn attach(&self, stdout: ChildStdout) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        let ready = self.ready.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => handle_line(&line, &tx, &ready),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read inference output: {}", e);
                        break;
                    }
                }
            }
            debug!("Inference output closed");
        })
    }
}

fn handle_line(line: &str, tx: &Sender<Statistics>, ready: &AtomicBool) {
    match serde_json::from_str::<InferenceEvent>(line) {
        Ok(InferenceEvent::Ready) => {
            if !ready.swap(true, Ordering::SeqCst) {
                info!("Inference pipeline is ready");
            }
        }
        Ok(InferenceEvent::Statistics(statistics)) => match tx.try_send(statistics) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Statistics queue is full, report dropped"),
            Err(TrySendError::Closed(_)) => {}
        },
        Err(_) => debug!(target: "inference", "{}", line),
    }
}
