//! Video decoding through an ffmpeg child process.

use std::path::Path;
use std::time::Duration;

use ffmpeg_sidecar::child::FfmpegChild;
use ffmpeg_sidecar::command::FfmpegCommand;
use ffmpeg_sidecar::event::{FfmpegEvent, LogLevel};
use ffmpeg_sidecar::iter::FfmpegIterator;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Decoded frame in packed RGB24.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// Presentation time since the start of playback.
    pub timestamp: Duration,
}

/// Input video stream metadata.
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
}

#[derive(Default, Debug, Copy, Clone)]
pub struct DecoderOptions {
    /// Downscale frames to this width before sampling.
    pub sample_width: Option<u32>,
    /// Restart the video when it ends.
    pub looping: bool,
}

impl DecoderOptions {
    /// Video filter passed to ffmpeg.
    fn filter(&self) -> Option<String> {
        // Area averaging turns each sample point into the mean of its region.
        self.sample_width.map(|width| format!("scale={}:-2:flags=area", width.max(2)))
    }
}

/// Streaming decoder handing out RGB frames.
pub struct VideoDecoder {
    child: FfmpegChild,
    events: FfmpegIterator,
    state: DecodeState,
}

impl VideoDecoder {
    pub fn open(path: &Path, options: DecoderOptions) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::VideoNotFound(path.to_path_buf()));
        }

        debug!(path = %path.display(), ?options, "Spawning ffmpeg");

        let mut child = ffmpeg_command(path, options).spawn().map_err(|err| {
            Error::Decode(format!("unable to start ffmpeg: {} (is ffmpeg installed?)", err))
        })?;
        let events = child.iter().map_err(|err| Error::Decode(err.to_string()))?;

        Ok(Self { child, events, state: DecodeState::default() })
    }

    /// Input stream metadata, once ffmpeg has reported it.
    pub fn info(&self) -> Option<VideoInfo> {
        self.state.info
    }

    /// Block until the next frame is decoded.
    ///
    /// Returns `None` once the video has ended.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.state.next_frame((&mut self.events).map(DecoderEvent::from))
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        // Stop ffmpeg when playback is interrupted early.
        if let Err(err) = self.child.kill() {
            debug!("Unable to stop ffmpeg: {}", err);
        }
        let _ = self.child.wait();
    }
}

/// Build the ffmpeg invocation decoding `path` to raw RGB24 on stdout.
fn ffmpeg_command(path: &Path, options: DecoderOptions) -> FfmpegCommand {
    let mut command = FfmpegCommand::new();
    command.hide_banner();

    if options.looping {
        command.args(["-stream_loop", "-1"]);
    }

    command.input(path).arg("-an");

    if let Some(filter) = options.filter() {
        command.args(["-vf", filter.as_str()]);
    }

    command.rawvideo();

    command
}

/// The parts of ffmpeg's output the decoder reacts to.
#[derive(Debug)]
enum DecoderEvent {
    Stream(VideoInfo),
    Frame(Frame),
    Fatal(String),
    Error(String),
    Other,
}

impl From<FfmpegEvent> for DecoderEvent {
    fn from(event: FfmpegEvent) -> Self {
        match event {
            FfmpegEvent::ParsedInputStream(stream) => match stream.video_data() {
                Some(video) => DecoderEvent::Stream(VideoInfo {
                    width: video.width,
                    height: video.height,
                    fps: video.fps,
                }),
                None => DecoderEvent::Other,
            },
            FfmpegEvent::OutputFrame(frame) => DecoderEvent::Frame(Frame {
                width: frame.width,
                height: frame.height,
                data: frame.data,
                timestamp: Duration::from_secs_f32(frame.timestamp.max(0.)),
            }),
            FfmpegEvent::Log(LogLevel::Fatal, message) => DecoderEvent::Fatal(message),
            FfmpegEvent::Log(LogLevel::Error, message) | FfmpegEvent::Error(message) => {
                DecoderEvent::Error(message)
            },
            _ => DecoderEvent::Other,
        }
    }
}

/// Progress of a decoder across its event stream.
#[derive(Default, Debug)]
struct DecodeState {
    info: Option<VideoInfo>,
    frames: u64,
    last_error: Option<String>,
}

impl DecodeState {
    /// Consume events up to the next frame.
    fn next_frame<I>(&mut self, events: I) -> Result<Option<Frame>>
    where
        I: Iterator<Item = DecoderEvent>,
    {
        for event in events {
            match event {
                DecoderEvent::Stream(info) if self.info.is_none() => {
                    info!("Video: {}x{} at {:.2} FPS", info.width, info.height, info.fps);
                    self.info = Some(info);
                },
                DecoderEvent::Frame(frame) => {
                    self.frames += 1;
                    return Ok(Some(frame));
                },
                DecoderEvent::Fatal(message) => return Err(Error::Decode(message)),
                DecoderEvent::Error(message) => {
                    warn!("ffmpeg: {}", message);
                    self.last_error = Some(message);
                },
                DecoderEvent::Stream(_) | DecoderEvent::Other => (),
            }
        }

        if self.frames == 0 {
            let reason = self.last_error.take().unwrap_or_else(|| "no video frames".into());
            return Err(Error::Decode(reason));
        }

        debug!(frames = self.frames, "Video ended");

        Ok(None)
    }
}
