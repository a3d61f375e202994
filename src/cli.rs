use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(version, about = "Mask detection camera supervisor", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Mode>,
}

#[derive(Subcommand)]
pub enum Mode {
    /// Run the full system: inference, MQTT, recordings and servers.
    Run {
        /// Video source, `v4l2://`, `argus://` or a file URI.
        uri: Option<String>,
    },
    /// Record the RTP stream from a UDP port into an MP4 file.
    Filesave {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        udp_port: Option<u16>,
    },
    /// Serve the inference output over RTSP.
    Streaming,
    /// Serve the saved videos over HTTP.
    Fileserver { dir: Option<PathBuf> },
    /// Interactive MQTT console to send commands to a device.
    Commander,
}

impl Cli {
    /// Initialization function for the Cli object.
    /// Useful for decoupling any other modules using this
    /// object from the `clap` crate
    pub fn init() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::parse_from(["maskcam"]);
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_filesave_arguments() {
        let cli = Cli::parse_from([
            "maskcam",
            "--config",
            "other.ini",
            "filesave",
            "--output",
            "/dev/shm/a.mp4",
            "--udp-port",
            "5402",
        ]);
        assert_eq!(cli.config, "other.ini");
        match cli.command {
            Some(Mode::Filesave { output, udp_port }) => {
                assert_eq!(output, Some(PathBuf::from("/dev/shm/a.mp4")));
                assert_eq!(udp_port, Some(5402));
            }
            _ => panic!("expected filesave"),
        }
    }
}
