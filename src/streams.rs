use std::path::PathBuf;
use std::str::FromStr;
use std::thread;

use crossbeam::channel::Receiver;
use gstreamer::{MessageView, Pipeline, glib, prelude::*};
use gstreamer_rtsp_server::prelude::*;
use log::{debug, error, info, warn};

use crate::config::{Codec, MaskcamSection};
use crate::device::{device_address_or_label, streaming_address};

/// Kernel receive buffer for the RTP sockets, large enough for key frames.
const UDP_BUFFER_SIZE: i32 = 524288;

/// Interface for the GStreamer workers.
pub trait Stream {
    /// Runs the stream until it finishes or a message arrives on
    /// `interrupt`, in which case it is shut down cleanly.
    fn stream(&self, interrupt: &Receiver<()>) -> Result<(), String>;
}

/// RTP caps of the stream sent by the inference pipeline.
fn rtp_caps(codec: Codec, clock_rate: u32) -> String {
    format!(
        "application/x-rtp,media=video,encoding-name=(string){},clock-rate={},payload=96",
        codec.encoding_name(),
        clock_rate
    )
}

/// Records the RTP stream received on a UDP port into an MP4 file.
pub struct FileSaveStream {
    pub output: PathBuf,
    pub udp_port: u16,
    pub codec: Codec,
    pub clock_rate: u32,
}

impl FileSaveStream {
    pub fn new(section: &MaskcamSection, output: PathBuf, udp_port: u16) -> Self {
        Self {
            output,
            udp_port,
            codec: section.codec,
            clock_rate: section.streaming_clock_rate,
        }
    }
}

impl Stream for FileSaveStream {
    fn stream(&self, interrupt: &Receiver<()>) -> Result<(), String> {
        info!(
            "Creating file-saving pipeline UDP(port:{})->File({})",
            self.udp_port,
            self.output.display()
        );

        gstreamer::init().map_err(|e| e.to_string())?;
        let pipeline = self
            ._setup_gstreamer_pipeline()
            .map_err(|bool_error| bool_error.message.to_string())?;

        let result = self._iter_on_bus(&pipeline, interrupt);
        debug!("File-saver main loop ending");
        result
    }
}

impl FileSaveStream {
    fn _iter_on_bus(&self, pipeline: &Pipeline, interrupt: &Receiver<()>) -> Result<(), String> {
        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| format!("Unable to start pipeline: {}", e))?;
        info!("Playing: file-saving pipeline UDP->File");

        let bus = pipeline
            .bus()
            .ok_or_else(|| "Pipeline without bus".to_string())?;
        let mut eos_sent = false;
        let result = loop {
            if !eos_sent && interrupt.try_recv().is_ok() {
                info!("Interruption received. Sending EOS to generate video file.");
                if !pipeline.send_event(gstreamer::event::Eos::new()) {
                    warn!("Pipeline did not accept EOS");
                }
                eos_sent = true;
            }

            let Some(msg) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(50)) else {
                continue;
            };
            match msg.view() {
                MessageView::Eos(_) => {
                    info!("File saved: {}", self.output.display());
                    break Ok(());
                }
                MessageView::Warning(warning) => {
                    warn!("{}: {:?}", warning.error(), warning.debug());
                }
                MessageView::Error(err) => {
                    break Err(format!("Error: {:?}", err.error().message()));
                }
                _ => (),
            }
        };

        pipeline
            .set_state(gstreamer::State::Null)
            .map_err(|e| format!("Unable to stop pipeline: {}", e))?;
        result
    }

    fn _setup_gstreamer_pipeline(&self) -> Result<Pipeline, glib::BoolError> {
        let caps = gstreamer::Caps::from_str(&rtp_caps(self.codec, self.clock_rate))?;
        let (depay_name, parse_name) = self.codec.depay_elements();

        let pipeline = Pipeline::default();
        let udpsrc = gstreamer::ElementFactory::make("udpsrc")
            .property("port", self.udp_port as i32)
            .property("buffer-size", UDP_BUFFER_SIZE)
            .property("caps", &caps)
            .build()?;
        // The default (slave) mode acts as a live source and lags behind
        let jitterbuffer = gstreamer::ElementFactory::make("rtpjitterbuffer")
            .property_from_str("mode", "synced")
            .build()?;
        let depay = gstreamer::ElementFactory::make(depay_name).build()?;
        let parse = gstreamer::ElementFactory::make(parse_name).build()?;
        let mux = gstreamer::ElementFactory::make("qtmux").build()?;
        let filesink = gstreamer::ElementFactory::make("filesink")
            .property("location", self.output.to_string_lossy().as_ref())
            .build()?;

        pipeline.add_many([&udpsrc, &jitterbuffer, &depay, &parse, &mux, &filesink])?;
        gstreamer::Element::link_many([&udpsrc, &jitterbuffer, &depay, &parse, &mux, &filesink])?;

        Ok(pipeline)
    }
}

/// Serves the RTP stream received on a UDP port over RTSP.
pub struct RtspRelay {
    pub udp_port: u16,
    pub codec: Codec,
    pub clock_rate: u32,
    pub rtsp_port: u16,
    pub rtsp_path: String,
    pub host: String,
}

impl RtspRelay {
    pub fn new(section: &MaskcamSection) -> Self {
        Self {
            udp_port: section.udp_port_streaming,
            codec: section.codec,
            clock_rate: section.streaming_clock_rate,
            rtsp_port: section.streaming_port,
            rtsp_path: section.streaming_path.clone(),
            host: device_address_or_label(section).to_string(),
        }
    }

    /// Launch description of the media served to RTSP clients.
    pub fn launch_line(&self) -> String {
        format!(
            "( udpsrc name=pay0 port={} buffer-size={} caps=\"{}\" )",
            self.udp_port,
            UDP_BUFFER_SIZE,
            rtp_caps(self.codec, self.clock_rate)
        )
    }
}

impl Stream for RtspRelay {
    fn stream(&self, interrupt: &Receiver<()>) -> Result<(), String> {
        gstreamer::init().map_err(|e| e.to_string())?;
        info!("Codec: {}", self.codec);

        let main_loop = glib::MainLoop::new(None, false);
        let server = gstreamer_rtsp_server::RTSPServer::new();
        server.set_service(&self.rtsp_port.to_string());

        let mounts = server
            .mount_points()
            .ok_or_else(|| "RTSP server without mount points".to_string())?;
        let factory = gstreamer_rtsp_server::RTSPMediaFactory::new();
        factory.set_launch(&self.launch_line());
        factory.set_shared(true);
        mounts.add_factory(&self.rtsp_path, factory);

        let _source = server
            .attach(None)
            .map_err(|bool_error| bool_error.message.to_string())?;
        info!(
            "Streaming at {}",
            streaming_address(&self.host, self.rtsp_port, &self.rtsp_path)
        );

        let quit = main_loop.clone();
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            if interrupt.recv().is_err() {
                error!("Interrupt channel closed");
            }
            quit.quit();
        });

        main_loop.run();
        info!("Ending streaming");
        Ok(())
    }
}
