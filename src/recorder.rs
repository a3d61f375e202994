//! Ring file-save: overlapping video chunks recorded to RAM, of which only
//! the flagged ones are kept on disk.
//!
//! A new recording starts every `period`; each one is stopped once it is
//! `duration` old. With `duration > period` consecutive chunks overlap, so an
//! event is always fully contained in at least one kept file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeDelta};
use log::{info, warn};

use crate::config::MaskcamSection;
use crate::error::Result;
use crate::ports::{UdpPortPool, parse_port_list};
use crate::process::P_FILESAVE_PREFIX;

#[derive(Debug, Clone)]
pub struct RingSettings {
    pub period: TimeDelta,
    pub duration: TimeDelta,
    pub ram_dir: PathBuf,
    pub hdd_dir: PathBuf,
    pub force_save: bool,
}

impl From<&MaskcamSection> for RingSettings {
    fn from(section: &MaskcamSection) -> Self {
        Self {
            period: TimeDelta::seconds(section.fileserver_video_period as i64),
            duration: TimeDelta::seconds(section.fileserver_video_duration as i64),
            ram_dir: section.fileserver_ram_dir.clone(),
            hdd_dir: section.fileserver_hdd_dir.clone(),
            force_save: section.fileserver_force_save,
        }
    }
}

/// One video chunk, from its start until it is retired.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub number: u64,
    pub name: String,
    pub filename: String,
    pub path: PathBuf,
    pub started: DateTime<Local>,
    pub udp_port: u16,
    pub keep: bool,
}

/// A recording together with the worker writing it.
#[derive(Debug)]
pub struct ActiveRecording<W> {
    pub recording: Recording,
    pub worker: W,
}

/// Where a retired recording ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Retirement {
    Kept(PathBuf),
    Discarded,
}

#[derive(Debug)]
pub struct FileSaveRing<W> {
    settings: RingSettings,
    ports: UdpPortPool,
    active: Vec<ActiveRecording<W>>,
    last_number: u64,
    /// Set once a start was refused for lack of ports, until one is freed.
    starved: bool,
}

impl<W> FileSaveRing<W> {
    pub fn new(settings: RingSettings, ports: UdpPortPool) -> Self {
        Self {
            settings,
            ports,
            active: Vec::new(),
            last_number: 0,
            starved: false,
        }
    }

    pub fn from_section(section: &MaskcamSection) -> Result<Self> {
        let ports = UdpPortPool::new(parse_port_list(&section.udp_ports_filesave)?);
        Ok(Self::new(RingSettings::from(section), ports))
    }

    /// Removes and returns every recording that reached its duration. Their
    /// workers must be stopped before the recordings are `retire`d.
    pub fn take_expired(&mut self, now: DateTime<Local>) -> Vec<ActiveRecording<W>> {
        let duration = self.settings.duration;
        let (expired, active): (Vec<_>, Vec<_>) = self
            .active
            .drain(..)
            .partition(|active| now - active.recording.started >= duration);
        self.active = active;
        expired
    }

    /// Removes every recording, e.g. on shutdown.
    pub fn take_all(&mut self) -> Vec<ActiveRecording<W>> {
        self.active.drain(..).collect()
    }

    /// Reserves the next recording when no active one started less than
    /// `period` ago.
    ///
    /// Running out of ports is reported once; later calls return `None`
    /// until a port is released.
    pub fn next_due(&mut self, now: DateTime<Local>) -> Result<Option<Recording>> {
        let latest_start = self.active.iter().map(|a| a.recording.started).max();
        if let Some(latest) = latest_start {
            if now - latest < self.settings.period {
                return Ok(None);
            }
        }
        if self.starved {
            return Ok(None);
        }
        info!(
            "Time to start a new video file (latest started at: {})",
            latest_start
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "N/A".to_string())
        );

        let udp_port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                self.starved = true;
                return Err(e);
            }
        };
        let number = self.last_number + 1;
        let filename = format!("{}_{}.mp4", now.format("%Y%m%d_%H%M%S"), number);
        Ok(Some(Recording {
            number,
            name: format!("{}{}", P_FILESAVE_PREFIX, number),
            path: self.settings.ram_dir.join(&filename),
            filename,
            started: now,
            udp_port,
            keep: false,
        }))
    }

    /// Tracks a recording reserved by `next_due` whose worker is running.
    pub fn activate(&mut self, recording: Recording, worker: W) {
        self.last_number = recording.number;
        self.active.push(ActiveRecording { recording, worker });
    }

    /// Gives back the port of a reserved recording whose worker failed to
    /// start. The next tick will try again.
    pub fn abandon(&mut self, recording: Recording) {
        self.release_port(recording.udp_port);
    }

    fn release_port(&mut self, port: u16) {
        if self.ports.release(port) {
            self.starved = false;
        }
    }

    /// Releases the port of a stopped recording and keeps its file on disk
    /// when flagged (or when every file is kept), deleting it otherwise.
    pub fn retire(&mut self, recording: Recording) -> Result<Retirement> {
        self.release_port(recording.udp_port);

        if recording.keep || self.settings.force_save {
            let destination = self.settings.hdd_dir.join(&recording.filename);
            info!("Force file saving: {}", self.settings.force_save);
            fs::create_dir_all(&self.settings.hdd_dir)?;
            move_file(&recording.path, &destination)?;
            info!("Permanent video file created: {}", destination.display());
            Ok(Retirement::Kept(destination))
        } else {
            info!("Removing RAM video file: {}", recording.path.display());
            match fs::remove_file(&recording.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Video file was never written: {}", recording.path.display());
                }
                Err(e) => return Err(e.into()),
            }
            Ok(Retirement::Discarded)
        }
    }

    /// Flags every recording in progress to be kept. Returns how many.
    pub fn flag_keep_all(&mut self) -> usize {
        info!("Request to save current video files");
        for active in &mut self.active {
            info!("Set flag to keep: {}", active.recording.filename);
            active.recording.keep = true;
        }
        self.active.len()
    }

    /// `(kept, total)` over the recordings in progress.
    pub fn keep_summary(&self) -> (usize, usize) {
        let kept = self.active.iter().filter(|a| a.recording.keep).count();
        (kept, self.active.len())
    }

    pub fn free_ports(&self) -> usize {
        self.ports.available()
    }

    /// Every file-save port, used by the inference pipeline as UDP clients.
    pub fn all_ports(&self) -> Vec<u16> {
        self.ports.all().collect()
    }
}

/// Moves a file, falling back to copy + remove across filesystems
/// (RAM disk to persistent storage).
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
