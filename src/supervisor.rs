//! The supervisor: starts the worker processes, relays statistics and alerts
//! over MQTT, runs remote commands and rotates the file-save recordings.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{Local, TimeDelta};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;

use crate::alerts::AlertThresholds;
use crate::commands::{COMMAND_QUEUE_CAPACITY, CommandReceiver, CommandSender, command_queue};
use crate::config::Configuration;
use crate::device::{device_address, device_address_or_label, format_elapsed, list_saved_files, streaming_address};
use crate::error::Result;
use crate::inference::{InferenceFeed, InferenceLaunch, SourceKind};
use crate::mqtt::{Delivery, LinkEvent, MqttLink, MqttSettings};
use crate::process::{
    P_FILESERVER, P_INFERENCE, P_STREAMING, ProcessTable, TERMINATE_TIMEOUT, Worker, WorkerSpec,
};
use crate::protocol::{
    Command, CommandMessage, DeviceStatus, FileList, Hello, StatisticsReport, TOPIC_ALERTS,
    TOPIC_COMMANDS, TOPIC_DEVICE_STATUS, TOPIC_FILES, TOPIC_HELLO, TOPIC_STATISTICS,
};
use crate::recorder::{ActiveRecording, FileSaveRing, Retirement};

/// Idle wait between two iterations of the main loop.
const LOOP_PERIOD: Duration = Duration::from_millis(100);

pub struct Supervisor {
    configuration: Configuration,
    config_path: String,
    exe: PathBuf,
    source: SourceKind,
    launch: InferenceLaunch,
    device_id: String,
    processes: ProcessTable,
    inference: Option<Worker>,
    streaming: Option<Worker>,
    fileserver: Option<Worker>,
    fileserver_enabled: bool,
    ring: FileSaveRing<Worker>,
    feed: InferenceFeed,
    alerts: AlertThresholds,
    commands: CommandSender,
    pending_commands: CommandReceiver,
    inference_restart_after: Option<TimeDelta>,
    restart_requested: bool,
    mqtt: Option<MqttLink>,
    link_events: Option<Receiver<LinkEvent>>,
    interrupt: watch::Receiver<bool>,
    stop: bool,
}

impl Supervisor {
    pub fn new(configuration: Configuration, config_path: &str, input: &str) -> Result<Self> {
        let section = &configuration.maskcam;
        let source = SourceKind::from_uri(input);
        let ring = FileSaveRing::from_section(section)?;
        let launch = InferenceLaunch::new(section, input, &ring.all_ports(), config_path);
        let fileserver_enabled = source.is_live() && section.fileserver_enabled;
        let inference_restart_after = if source.is_live() && section.timeout_inference_restart > 0 {
            Some(TimeDelta::seconds(section.timeout_inference_restart as i64))
        } else {
            None
        };
        let (commands, pending_commands) = command_queue(COMMAND_QUEUE_CAPACITY);

        let device_id = configuration.mqtt.device_name().unwrap_or_default().to_string();
        let (mqtt, link_events) = if source.is_live() {
            match mqtt_settings(&configuration) {
                Some(settings) => {
                    info!("Device name: {}", settings.client_id);
                    let (link, events) = MqttLink::connect(settings);
                    (Some(link), Some(events))
                }
                None => {
                    warn!(
                        "MQTT is DISABLED since MQTT_BROKER_IP or MQTT_DEVICE_NAME are not defined"
                    );
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let (interrupt_tx, interrupt) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Ctrl+C pressed. Interrupting all processes...");
                    let _ = interrupt_tx.send(true);
                }
                Err(e) => {
                    error!("Unable to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        });

        Ok(Self {
            alerts: AlertThresholds::from(section),
            exe: std::env::current_exe()?,
            config_path: config_path.to_string(),
            source,
            launch,
            device_id,
            processes: ProcessTable::default(),
            inference: None,
            streaming: None,
            fileserver: None,
            fileserver_enabled,
            ring,
            feed: InferenceFeed::new(),
            commands,
            pending_commands,
            inference_restart_after,
            restart_requested: false,
            mqtt,
            link_events,
            interrupt,
            stop: false,
            configuration,
        })
    }

    /// Runs until Ctrl+C or until the inference worker dies, then stops
    /// every worker.
    pub async fn run(mut self) -> Result<()> {
        let result = self.supervise().await;
        if let Err(e) = &result {
            error!("Supervisor stopped on error: {}", e);
        }
        self.shutdown().await;
        result
    }

    async fn supervise(&mut self) -> Result<()> {
        info!("Press Ctrl+C to stop all processes");

        if self.fileserver_enabled {
            self.start_fileserver();
        }
        if self.configuration.maskcam.streaming_start_default {
            info!("Starting streaming (streaming-start-default is set)");
            self.commands.push(Command::StreamingStart);
        }
        self.start_inference()?;

        while !self.should_stop() {
            self.handle_statistics();

            // Recordings need the inference pipeline to be feeding the UDP ports
            if self.feed.is_ready() && self.fileserver_enabled && self.source.is_live() {
                self.handle_file_saving().await;
            }

            self.handle_link_events();

            match self.pending_commands.try_next() {
                Some(command) => self.process_command(command).await,
                None => self.wait_tick().await,
            }

            if !check_alive(&mut self.inference, &mut self.processes) {
                error!("Inference process is not running, stopping");
                self.stop = true;
            }
            self.check_inference_timeout();
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop || *self.interrupt.borrow()
    }

    async fn wait_tick(&mut self) {
        tokio::select! {
            changed = self.interrupt.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(LOOP_PERIOD).await;
                }
            }
            _ = tokio::time::sleep(LOOP_PERIOD) => {}
        }
    }

    fn handle_statistics(&mut self) {
        while let Some(statistics) = self.feed.try_next() {
            if !self.source.is_live() {
                continue;
            }
            let alert = self.alerts.is_alert(&statistics);
            if alert {
                self.ring.flag_keep_all();
            }
            let topic = if alert { TOPIC_ALERTS } else { TOPIC_STATISTICS };
            let report = StatisticsReport {
                device_id: &self.device_id,
                statistics,
            };
            self.publish(topic, &report, Delivery::Enqueue);
        }
    }

    async fn handle_file_saving(&mut self) {
        let now = Local::now();
        for active in self.ring.take_expired(now) {
            self.finish_recording(active).await;
        }

        match self.ring.next_due(now) {
            Ok(Some(recording)) => {
                let spec = self.own_worker(&recording.name).args([
                    OsString::from("filesave"),
                    OsString::from("--output"),
                    recording.path.clone().into_os_string(),
                    OsString::from("--udp-port"),
                    OsString::from(recording.udp_port.to_string()),
                ]);
                match Worker::spawn(spec, &mut self.processes) {
                    Ok(worker) => {
                        self.ring.activate(recording, worker);
                        debug!("Free file-save ports: {}", self.ring.free_ports());
                    }
                    Err(e) => {
                        error!("{}", e);
                        self.ring.abandon(recording);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => error!("Cannot start a new video file: {}", e),
        }
    }

    async fn finish_recording(&mut self, active: ActiveRecording<Worker>) {
        let ActiveRecording { recording, worker } = active;
        if let Err(e) = worker
            .terminate(TERMINATE_TIMEOUT, &mut self.processes, true)
            .await
        {
            error!("Failed to stop {}: {}", recording.name, e);
        }
        match self.ring.retire(recording) {
            Ok(Retirement::Kept(_)) => self.send_file_list(),
            Ok(Retirement::Discarded) => {}
            Err(e) => error!("Failed to retire video file: {}", e),
        }
    }

    fn handle_link_events(&mut self) {
        let Some(events) = self.link_events.as_mut() else {
            return;
        };
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        for event in received {
            match event {
                LinkEvent::Connected => {
                    self.say_hello();
                    self.send_file_list();
                }
                LinkEvent::Message { topic, payload } if topic == TOPIC_COMMANDS => {
                    if let Some(command) = parse_command(&payload, &self.device_id) {
                        self.commands.push(command);
                    }
                }
                LinkEvent::Message { topic, .. } => debug!("Ignoring message on topic {}", topic),
            }
        }
    }

    async fn process_command(&mut self, command: Command) {
        info!("Processing command: {}", command);
        match command {
            Command::StreamingStart => {
                if !check_alive(&mut self.streaming, &mut self.processes) {
                    self.start_streaming();
                }
            }
            Command::StreamingStop => {
                if let Some(worker) = self.streaming.take() {
                    self.stop_worker(worker).await;
                }
            }
            Command::InferenceRestart => {
                if let Some(worker) = self.inference.take() {
                    self.stop_worker(worker).await;
                }
                if let Err(e) = self.start_inference() {
                    error!("Failed to restart inference: {}", e);
                }
                self.restart_requested = false;
            }
            Command::FileserverRestart => {
                if let Some(worker) = self.fileserver.take() {
                    self.stop_worker(worker).await;
                }
                self.start_fileserver();
                self.fileserver_enabled = true;
            }
            Command::SaveFile => {
                self.ring.flag_keep_all();
            }
            Command::StatusRequest => {}
        }
        self.send_device_status();
    }

    fn check_inference_timeout(&mut self) {
        let Some(limit) = self.inference_restart_after else {
            return;
        };
        if self.restart_requested {
            return;
        }
        if let Some(runtime) = self.processes.runtime(P_INFERENCE, Local::now()) {
            if runtime > limit {
                info!(
                    "Restarting inference due to timeout-inference-restart (inference runtime: {})",
                    format_elapsed(Some(runtime))
                );
                self.restart_requested = self.commands.push(Command::InferenceRestart);
            }
        }
    }

    /// A worker running a subcommand of this executable.
    fn own_worker(&self, name: &str) -> WorkerSpec {
        WorkerSpec::new(name, self.exe.clone())
            .arg("--config")
            .arg(&self.config_path)
    }

    fn start_inference(&mut self) -> Result<()> {
        let mut worker = Worker::spawn(self.launch.worker_spec(), &mut self.processes)?;
        if let Some(stdout) = worker.take_stdout() {
            self.feed.attach(stdout);
        }
        self.inference = Some(worker);
        Ok(())
    }

    fn start_streaming(&mut self) {
        let spec = self.own_worker(P_STREAMING).arg("streaming");
        match Worker::spawn(spec, &mut self.processes) {
            Ok(worker) => self.streaming = Some(worker),
            Err(e) => error!("{}", e),
        }
    }

    fn start_fileserver(&mut self) {
        let spec = self
            .own_worker(P_FILESERVER)
            .arg("fileserver")
            .arg(self.configuration.maskcam.fileserver_hdd_dir.clone());
        match Worker::spawn(spec, &mut self.processes) {
            Ok(worker) => self.fileserver = Some(worker),
            Err(e) => error!("{}", e),
        }
    }

    async fn stop_worker(&mut self, worker: Worker) {
        let name = worker.name().to_string();
        if let Err(e) = worker
            .terminate(TERMINATE_TIMEOUT, &mut self.processes, false)
            .await
        {
            error!("Failed to stop {}: {}", name, e);
        }
    }

    fn publish<T: Serialize>(&self, topic: &str, message: &T, delivery: Delivery) {
        match &self.mqtt {
            Some(link) => {
                link.send(topic, message, delivery);
            }
            None => debug!("MQTT not connected. Skipping message to topic: {}", topic),
        }
    }

    fn say_hello(&self) {
        let hello = Hello {
            device_id: &self.device_id,
            description: &self.configuration.mqtt.mqtt_device_description,
        };
        // Sent again on every connection
        self.publish(TOPIC_HELLO, &hello, Delivery::Discard);
    }

    fn send_file_list(&self) {
        let section = &self.configuration.maskcam;
        let file_list = FileList {
            device_id: &self.device_id,
            file_server: format!(
                "http://{}:{}",
                device_address_or_label(section),
                section.fileserver_port
            ),
            file_list: list_saved_files(&section.fileserver_hdd_dir),
        };
        self.publish(TOPIC_FILES, &file_list, Delivery::Discard);
    }

    fn send_device_status(&mut self) {
        check_alive(&mut self.streaming, &mut self.processes);
        check_alive(&mut self.fileserver, &mut self.processes);
        let status = self.device_status();
        // Only the latest status is interesting
        self.publish(TOPIC_DEVICE_STATUS, &status, Delivery::Discard);
    }

    fn device_status(&self) -> DeviceStatus<'_> {
        let now = Local::now();
        let section = &self.configuration.maskcam;
        let streaming = if self.processes.is_running(P_STREAMING) {
            streaming_address(
                device_address_or_label(section),
                section.streaming_port,
                &section.streaming_path,
            )
        } else {
            "N/A".to_string()
        };
        let (kept, total) = self.ring.keep_summary();
        DeviceStatus {
            device_id: &self.device_id,
            inference_runtime: format_elapsed(self.processes.runtime(P_INFERENCE, now)),
            fileserver_runtime: format_elapsed(self.processes.runtime(P_FILESERVER, now)),
            streaming_address: streaming,
            device_address: device_address(section).map(str::to_string),
            save_current_files: format!("{}/{}", kept, total),
            time: now.format("%H:%M:%S").to_string(),
        }
    }

    /// Stops every worker, keeping or deleting the recordings in progress
    /// according to their flags. Each step runs even if a previous one failed.
    async fn shutdown(&mut self) {
        for active in self.ring.take_all() {
            self.finish_recording(active).await;
        }
        let workers = [
            self.inference.take(),
            self.fileserver.take(),
            self.streaming.take(),
        ];
        for worker in workers.into_iter().flatten() {
            self.stop_worker(worker).await;
        }
    }
}

fn mqtt_settings(configuration: &Configuration) -> Option<MqttSettings> {
    let broker_ip = configuration.mqtt.broker_ip()?;
    let device_name = configuration.mqtt.device_name()?;
    Some(MqttSettings {
        client_id: device_name.to_string(),
        broker_ip: broker_ip.to_string(),
        broker_port: configuration.mqtt.mqtt_broker_port,
        subscribe_to: vec![TOPIC_COMMANDS.to_string()],
    })
}

/// Liveness of the worker in `slot`. A dead worker is removed and marked
/// ended in the table.
fn check_alive(slot: &mut Option<Worker>, processes: &mut ProcessTable) -> bool {
    let Some(worker) = slot else {
        return false;
    };
    if worker.is_alive() {
        return true;
    }
    if let Some(ran) = processes.ended(worker.name(), Local::now(), false) {
        warn!("Process {} ended after {}", worker.name(), format_elapsed(Some(ran)));
    }
    *slot = None;
    false
}

/// Extracts the command of a `commands` message addressed to `device_id`.
fn parse_command(payload: &[u8], device_id: &str) -> Option<Command> {
    let message: CommandMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed command message: {}", e);
            return None;
        }
    };
    if message.device_id != device_id {
        return None;
    }
    match message.command.parse::<Command>() {
        Ok(command) => Some(command),
        Err(_) => {
            error!("Command not recognized: {}", message.command);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_parse_command() {
        let payload = br#"{"device_id": "cam-1", "command": "streaming_start"}"#;
        assert_eq!(parse_command(payload, "cam-1"), Some(Command::StreamingStart));
        assert_eq!(parse_command(payload, "cam-2"), None);
        assert_eq!(
            parse_command(br#"{"device_id": "cam-1", "command": "reboot"}"#, "cam-1"),
            None
        );
        assert_eq!(parse_command(b"not json", "cam-1"), None);
    }

    /// Writes an executable script standing in for the inference pipeline.
    fn fake_inference(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("fake-inference.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn configuration(dir: &TempDir, inference_command: String) -> Configuration {
        let mut configuration = Configuration::default();
        configuration.maskcam.inference_command = inference_command;
        configuration.maskcam.fileserver_enabled = false;
        configuration.maskcam.fileserver_ram_dir = dir.path().join("ram");
        configuration.maskcam.fileserver_hdd_dir = dir.path().join("hdd");
        configuration
    }

    #[tokio::test]
    async fn test_run_ends_when_inference_exits() {
        let dir = tempfile::tempdir().unwrap();
        let command = fake_inference(&dir, r#"echo '{"event":"ready"}'; sleep 0.3"#);
        let supervisor =
            Supervisor::new(configuration(&dir, command), "maskcam_config.ini", "file:///tmp/in.mp4")
                .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), supervisor.run()).await;
        assert!(result.expect("supervisor did not stop").is_ok());
    }

    #[tokio::test]
    async fn test_start_fails_without_inference_command() {
        let dir = tempfile::tempdir().unwrap();
        let configuration = configuration(&dir, "/nonexistent/inference".to_string());
        let supervisor =
            Supervisor::new(configuration, "maskcam_config.ini", "v4l2:///dev/video0").unwrap();

        assert!(supervisor.run().await.is_err());
    }

    #[tokio::test]
    async fn test_status_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut configuration = configuration(&dir, "true".to_string());
        configuration.maskcam.device_address = "10.1.1.5".to_string();
        let supervisor =
            Supervisor::new(configuration, "maskcam_config.ini", "v4l2:///dev/video0").unwrap();

        let status = supervisor.device_status();
        assert_eq!(status.inference_runtime, "N/A");
        assert_eq!(status.streaming_address, "N/A");
        assert_eq!(status.device_address.as_deref(), Some("10.1.1.5"));
        assert_eq!(status.save_current_files, "0/0");
    }

    #[tokio::test]
    async fn test_save_file_command_answers_with_status() {
        let dir = tempfile::tempdir().unwrap();
        let command = fake_inference(&dir, "sleep 5");
        let mut supervisor =
            Supervisor::new(configuration(&dir, command), "maskcam_config.ini", "argus://0")
                .unwrap();
        supervisor.start_inference().unwrap();

        supervisor.process_command(Command::SaveFile).await;
        assert!(supervisor.processes.is_running(P_INFERENCE));
        assert_ne!(supervisor.device_status().inference_runtime, "N/A");

        supervisor.shutdown().await;
        assert!(!supervisor.processes.is_running(P_INFERENCE));
    }

    /// Reserves the next recording and starts a stand-in worker for it.
    fn start_recording(supervisor: &mut Supervisor) -> String {
        let recording = supervisor.ring.next_due(Local::now()).unwrap().unwrap();
        let name = recording.name.clone();
        let spec = WorkerSpec::new(name.as_str(), "sleep").arg("30");
        let worker = Worker::spawn(spec, &mut supervisor.processes).unwrap();
        supervisor.ring.activate(recording, worker);
        name
    }

    #[tokio::test]
    async fn test_alert_flags_current_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(
            configuration(&dir, "true".to_string()),
            "maskcam_config.ini",
            "v4l2:///dev/video0",
        )
        .unwrap();
        start_recording(&mut supervisor);

        supervisor.feed.feed_line(
            r#"{"event":"statistics","people_total":2,"people_with_mask":2,"people_without_mask":0}"#,
        );
        supervisor.handle_statistics();
        assert_eq!(supervisor.ring.keep_summary(), (0, 1));

        // Over alert-max-total-people
        supervisor.feed.feed_line(
            r#"{"event":"statistics","people_total":20,"people_with_mask":20,"people_without_mask":0}"#,
        );
        supervisor.handle_statistics();
        assert_eq!(supervisor.ring.keep_summary(), (1, 1));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_commands_for_this_device_are_queued() {
        let dir = tempfile::tempdir().unwrap();
        let mut configuration = configuration(&dir, "true".to_string());
        configuration.mqtt.mqtt_device_name = "cam-1".to_string();
        let mut supervisor =
            Supervisor::new(configuration, "maskcam_config.ini", "v4l2:///dev/video0").unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        supervisor.link_events = Some(rx);

        let message = |device_id: &str, command: &str| LinkEvent::Message {
            topic: TOPIC_COMMANDS.to_string(),
            payload: serde_json::to_vec(&CommandMessage {
                device_id: device_id.to_string(),
                command: command.to_string(),
            })
            .unwrap(),
        };
        tx.send(LinkEvent::Connected).await.unwrap();
        tx.send(message("cam-2", "save_file")).await.unwrap();
        tx.send(message("cam-1", "streaming_stop")).await.unwrap();
        tx.send(message("cam-1", "reboot")).await.unwrap();
        tx.send(LinkEvent::Message {
            topic: TOPIC_HELLO.to_string(),
            payload: b"{}".to_vec(),
        })
        .await
        .unwrap();

        supervisor.handle_link_events();
        assert_eq!(
            supervisor.pending_commands.try_next(),
            Some(Command::StreamingStop)
        );
        assert_eq!(supervisor.pending_commands.try_next(), None);
    }

    #[tokio::test]
    async fn test_inference_timeout_queues_a_single_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut configuration = configuration(&dir, "true".to_string());
        configuration.maskcam.timeout_inference_restart = 1;
        let mut supervisor =
            Supervisor::new(configuration, "maskcam_config.ini", "v4l2:///dev/video0").unwrap();
        supervisor
            .processes
            .started(P_INFERENCE, Local::now() - TimeDelta::seconds(5));

        supervisor.check_inference_timeout();
        supervisor.check_inference_timeout();
        assert!(supervisor.restart_requested);
        assert_eq!(supervisor.pending_commands.pending(), 1);
        assert_eq!(
            supervisor.pending_commands.try_next(),
            Some(Command::InferenceRestart)
        );

        // Still waiting for the restart to be processed
        supervisor.check_inference_timeout();
        assert_eq!(supervisor.pending_commands.pending(), 0);
    }

    #[tokio::test]
    async fn test_no_inference_restart_for_file_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut configuration = configuration(&dir, "true".to_string());
        configuration.maskcam.timeout_inference_restart = 1;
        let mut supervisor =
            Supervisor::new(configuration, "maskcam_config.ini", "file:///tmp/in.mp4").unwrap();
        supervisor
            .processes
            .started(P_INFERENCE, Local::now() - TimeDelta::seconds(5));

        supervisor.check_inference_timeout();
        assert_eq!(supervisor.pending_commands.pending(), 0);
    }

    #[tokio::test]
    async fn test_finished_recording_releases_port_and_forgets_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(
            configuration(&dir, "true".to_string()),
            "maskcam_config.ini",
            "v4l2:///dev/video0",
        )
        .unwrap();
        let total = supervisor.ring.all_ports().len();
        let name = start_recording(&mut supervisor);
        assert!(supervisor.processes.is_running(&name));
        assert_eq!(supervisor.ring.free_ports(), total - 1);

        for active in supervisor.ring.take_all() {
            supervisor.finish_recording(active).await;
        }
        assert_eq!(supervisor.ring.free_ports(), total);
        assert!(supervisor.processes.get(&name).is_none());

        // Nothing left to finish on shutdown
        supervisor.shutdown().await;
        assert_eq!(supervisor.ring.free_ports(), total);
    }
}
