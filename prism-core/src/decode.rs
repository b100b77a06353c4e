//! FFmpeg-backed H.264 decoding with hardware fallback.
//!
//! One [`MediaDecoder`] per stream. Decoder selection tries the platform's
//! stateful hardware decoders first (when configured to), then falls back to
//! libavcodec's software decoder with slice- and frame-parallel threading.
//! Hardware failures are counted per frame; after
//! `max_decode_attempts` consecutive failures the hardware context is torn
//! down and the same stream continues in software from the next keyframe.
//!
//! The worker thread drives this module through the [`FrameSource`] trait so
//! the hand-off protocol can be tested without media files.

use std::path::Path;
use std::sync::Once;

use ffmpeg_next as ffmpeg;
use serde::Serialize;
use thiserror::Error;

use crate::copy::copy_plane;
use crate::pool::FrameSlot;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot open {source}: {reason}")]
    CannotOpen { source: String, reason: String },
    #[error("no video track in {source}")]
    NoVideoTrack { source: String },
    #[error("codec unsupported in {source}: {reason}")]
    CodecUnsupported { source: String, reason: String },
    #[error("decode fatal: {0}")]
    Fatal(String),
}

/// Outcome of one `next_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The slot holds a complete YUV420 frame with valid strides.
    Frame,
    /// No output this call, decoder is healthy; call again.
    Retry,
    /// End of stream; no further frames will come.
    Eof,
    /// The source changed dimensions past the slot's allocation. The caller
    /// must grow the pool and call again with a large-enough slot; the
    /// decoded frame is parked here in the meantime.
    NeedsRealloc { width: u32, height: u32 },
}

/// Failure counters a source accumulates while decoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceCounters {
    pub hw_failures: u64,
    pub fallbacks: u64,
}

/// Per-frame producer driven by the decode worker.
pub trait FrameSource: Send {
    fn next_frame(&mut self, slot: &mut FrameSlot) -> Result<DecodeStatus, DecodeError>;

    /// Native dimensions as reported at open.
    fn dimensions(&self) -> (u32, u32);

    fn counters(&self) -> SourceCounters {
        SourceCounters::default()
    }
}

// ============================================================================
// Stream lifecycle state machine
// ============================================================================

/// Decoder lifecycle. `Playing` is the steady state; a transparent trip back
/// through `Draining` (decoder buffered, no output yet) is permitted and not
/// externally observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamPhase {
    Opening,
    Draining,
    Playing,
    Ended,
    Broken,
}

impl StreamPhase {
    /// Advance on a decode outcome. Terminal phases absorb everything.
    pub fn on_status(self, status: DecodeStatus) -> StreamPhase {
        match self {
            StreamPhase::Ended | StreamPhase::Broken => self,
            StreamPhase::Opening => StreamPhase::Opening,
            StreamPhase::Draining | StreamPhase::Playing => match status {
                DecodeStatus::Frame => StreamPhase::Playing,
                DecodeStatus::Retry | DecodeStatus::NeedsRealloc { .. } => self,
                DecodeStatus::Eof => StreamPhase::Ended,
            },
        }
    }

    pub fn on_open_ok(self) -> StreamPhase {
        debug_assert_eq!(self, StreamPhase::Opening);
        StreamPhase::Draining
    }

    pub fn on_fatal(self) -> StreamPhase {
        StreamPhase::Broken
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamPhase::Ended | StreamPhase::Broken)
    }
}

// ============================================================================
// Backend selection
// ============================================================================

/// Stateful hardware H.264 decoders found on the boards we ship to, in
/// preference order.
const HW_DECODER_NAMES: &[&str] = &["h264_v4l2m2m", "h264_rkmpp", "h264_mmal"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Backend {
    Hardware { name: String },
    Software { threads: usize },
}

impl Backend {
    pub fn is_hardware(&self) -> bool {
        matches!(self, Backend::Hardware { .. })
    }
}

/// What a stream ended up decoding with, for the shutdown report.
#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub backend: Backend,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Stream time base as (numerator, denominator); PTS values in frame
    /// slots are expressed in these units.
    pub time_base: (i32, i32),
}

fn ffmpeg_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            tracing::error!("ffmpeg init failed: {e}");
        }
    });
}

fn software_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Build and open a decoder for the stream's parameters.
fn open_decoder(
    parameters: ffmpeg::codec::Parameters,
    backend: &Backend,
) -> Result<ffmpeg::decoder::Video, ffmpeg::Error> {
    let mut context = ffmpeg::codec::context::Context::from_parameters(parameters)?;

    match backend {
        Backend::Hardware { name } => {
            let codec = ffmpeg::codec::decoder::find_by_name(name)
                .ok_or(ffmpeg::Error::DecoderNotFound)?;
            context.decoder().open_as(codec)?.video()
        }
        Backend::Software { threads } => {
            // Both threading bits: libavcodec picks whichever of slice/frame
            // parallelism the bitstream allows.
            unsafe {
                let raw = context.as_mut_ptr();
                (*raw).thread_count = *threads as libc::c_int;
                (*raw).thread_type = ffmpeg::sys::FF_THREAD_FRAME | ffmpeg::sys::FF_THREAD_SLICE;
            }
            context.decoder().video()
        }
    }
}

/// Consecutive-failure gate for the hardware decode path.
#[derive(Debug)]
struct FallbackCounter {
    threshold: u32,
    streak: u32,
    total: u64,
}

impl FallbackCounter {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            streak: 0,
            total: 0,
        }
    }

    /// Returns true when the failure streak has reached the threshold.
    fn record_failure(&mut self) -> bool {
        self.streak += 1;
        self.total += 1;
        self.streak >= self.threshold
    }

    fn record_success(&mut self) {
        self.streak = 0;
    }

    fn reset_streak(&mut self) {
        self.streak = 0;
    }
}

// ============================================================================
// Media decoder
// ============================================================================

pub struct MediaDecoder {
    source: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    parameters: ffmpeg::codec::Parameters,
    codec_name: String,
    time_base: (i32, i32),
    backend: Backend,
    hw_gate: FallbackCounter,
    fallbacks: u64,
    /// Set while waiting for the first keyframe after a fallback.
    waiting_for_key: bool,
    sent_eof: bool,
    /// Reused decode target; one AVFrame for the life of the stream.
    frame: ffmpeg::frame::Video,
    /// True while `frame` holds a decoded picture the last slot was too
    /// small for.
    parked: bool,
    width: u32,
    height: u32,
    frames_out: u64,
}

impl MediaDecoder {
    /// Open a media source and prepare its decoder.
    pub fn open(
        source: &Path,
        prefer_hardware: bool,
        max_hw_failures: u32,
    ) -> Result<Self, DecodeError> {
        ffmpeg_init();
        let source_str = source.display().to_string();

        let input = ffmpeg::format::input(&source).map_err(|e| DecodeError::CannotOpen {
            source: source_str.clone(),
            reason: e.to_string(),
        })?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| DecodeError::NoVideoTrack {
                source: source_str.clone(),
            })?;
        let stream_index = stream.index();
        let parameters = stream.parameters();
        let codec_name = format!("{:?}", parameters.id());
        let tb = stream.time_base();
        let time_base = (tb.numerator(), tb.denominator());

        let (decoder, backend) = Self::select_backend(
            parameters.clone(),
            prefer_hardware,
            &source_str,
        )?;

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(DecodeError::CodecUnsupported {
                source: source_str,
                reason: "stream reports zero dimensions".into(),
            });
        }

        tracing::info!(
            source = %source_str,
            codec = %codec_name,
            ?backend,
            width,
            height,
            "stream opened"
        );

        Ok(Self {
            source: source_str,
            input,
            stream_index,
            decoder,
            parameters,
            codec_name,
            time_base,
            backend,
            hw_gate: FallbackCounter::new(max_hw_failures),
            fallbacks: 0,
            waiting_for_key: false,
            sent_eof: false,
            frame: ffmpeg::frame::Video::empty(),
            parked: false,
            width,
            height,
            frames_out: 0,
        })
    }

    fn select_backend(
        parameters: ffmpeg::codec::Parameters,
        prefer_hardware: bool,
        source: &str,
    ) -> Result<(ffmpeg::decoder::Video, Backend), DecodeError> {
        if prefer_hardware {
            for name in HW_DECODER_NAMES {
                let backend = Backend::Hardware {
                    name: (*name).to_string(),
                };
                match open_decoder(parameters.clone(), &backend) {
                    Ok(decoder) => return Ok((decoder, backend)),
                    Err(e) => {
                        tracing::debug!(decoder = *name, "hardware decoder unavailable: {e}")
                    }
                }
            }
            tracing::warn!(source, "no hardware decoder available, using software");
        }

        let backend = Backend::Software {
            threads: software_threads(),
        };
        let decoder =
            open_decoder(parameters, &backend).map_err(|e| DecodeError::CodecUnsupported {
                source: source.to_string(),
                reason: e.to_string(),
            })?;
        Ok((decoder, backend))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn hw_failures(&self) -> u64 {
        self.hw_gate.total
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    pub fn report(&self) -> BackendReport {
        BackendReport {
            backend: self.backend.clone(),
            codec: self.codec_name.clone(),
            width: self.width,
            height: self.height,
            time_base: self.time_base,
        }
    }

    /// Tear down the hardware context and continue in software on the same
    /// stream, picking up at the next keyframe.
    fn fall_back_to_software(&mut self) -> Result<(), DecodeError> {
        let backend = Backend::Software {
            threads: software_threads(),
        };
        let decoder = open_decoder(self.parameters.clone(), &backend).map_err(|e| {
            DecodeError::Fatal(format!("software reinit after hardware failure: {e}"))
        })?;
        tracing::warn!(
            source = %self.source,
            failures = self.hw_gate.total,
            "hardware decode abandoned, software fallback active"
        );
        self.decoder = decoder;
        self.backend = backend;
        self.fallbacks += 1;
        self.hw_gate.reset_streak();
        self.waiting_for_key = true;
        Ok(())
    }

    /// Feed one demuxed packet, skipping to a keyframe after fallback.
    /// Returns false when the container is exhausted.
    fn feed_packet(&mut self) -> Result<bool, DecodeError> {
        loop {
            let packet = {
                let mut packets = self.input.packets();
                loop {
                    match packets.next() {
                        Some((stream, packet)) => {
                            if stream.index() == self.stream_index {
                                break Some(packet);
                            }
                        }
                        None => break None,
                    }
                }
            };
            let Some(packet) = packet else {
                if !self.sent_eof {
                    self.sent_eof = true;
                    let _ = self.decoder.send_eof();
                }
                return Ok(false);
            };
            if self.waiting_for_key {
                if !packet.is_key() {
                    continue;
                }
                self.waiting_for_key = false;
            }
            return match self.decoder.send_packet(&packet) {
                Ok(()) => Ok(true),
                Err(e) => self.on_decode_error(e).map(|_| true),
            };
        }
    }

    /// Hardware errors are counted and eventually downgrade the backend;
    /// software errors are fatal.
    fn on_decode_error(&mut self, e: ffmpeg::Error) -> Result<(), DecodeError> {
        if self.backend.is_hardware() {
            let tripped = self.hw_gate.record_failure();
            tracing::warn!(
                source = %self.source,
                streak = self.hw_gate.streak,
                "hardware decode error: {e}"
            );
            if tripped {
                self.fall_back_to_software()?;
            }
            Ok(())
        } else {
            Err(DecodeError::Fatal(e.to_string()))
        }
    }

    fn copy_current_to_slot(&mut self, slot: &mut FrameSlot) {
        let width = self.frame.width() as usize;
        let height = self.frame.height() as usize;
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);

        let mut strides = [0usize; 3];
        for (i, (w, h)) in [
            (width, height),
            (chroma_w, chroma_h),
            (chroma_w, chroma_h),
        ]
        .into_iter()
        .enumerate()
        {
            let src_stride = self.frame.stride(i);
            let src = self.frame.data(i);
            let plane = slot.plane_mut(i);
            let dst_stride = plane.stride();
            copy_plane(plane.as_mut_slice(), dst_stride, src, src_stride, w, h);
            strides[i] = dst_stride;
        }

        slot.geometry.width = self.frame.width();
        slot.geometry.height = self.frame.height();
        slot.geometry.strides = strides;
        slot.pts = self.frame.timestamp().unwrap_or(self.frames_out as i64);
        self.frames_out += 1;
    }

    fn check_current_format(&self) -> Result<(), DecodeError> {
        match self.frame.format() {
            ffmpeg::format::Pixel::YUV420P | ffmpeg::format::Pixel::YUVJ420P => Ok(()),
            other => Err(DecodeError::Fatal(format!(
                "unsupported pixel format {other:?}, need planar YUV420"
            ))),
        }
    }
}

impl FrameSource for MediaDecoder {
    fn next_frame(&mut self, slot: &mut FrameSlot) -> Result<DecodeStatus, DecodeError> {
        // A frame parked by an undersized slot goes out first.
        if self.parked {
            let (width, height) = (self.frame.width(), self.frame.height());
            if !slot.fits(width, height) {
                return Ok(DecodeStatus::NeedsRealloc { width, height });
            }
            self.parked = false;
            self.copy_current_to_slot(slot);
            return Ok(DecodeStatus::Frame);
        }

        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => {
                self.check_current_format()?;
                self.hw_gate.record_success();
                let (width, height) = (self.frame.width(), self.frame.height());
                if width != self.width || height != self.height {
                    tracing::info!(
                        source = %self.source,
                        from = %format!("{}x{}", self.width, self.height),
                        to = %format!("{width}x{height}"),
                        "mid-stream resolution change"
                    );
                    self.width = width;
                    self.height = height;
                }
                if !slot.fits(width, height) {
                    self.parked = true;
                    return Ok(DecodeStatus::NeedsRealloc { width, height });
                }
                self.copy_current_to_slot(slot);
                Ok(DecodeStatus::Frame)
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                // Decoder wants input before it can emit.
                self.feed_packet()?;
                Ok(DecodeStatus::Retry)
            }
            Err(ffmpeg::Error::Eof) => Ok(DecodeStatus::Eof),
            Err(e) => {
                self.on_decode_error(e)?;
                Ok(DecodeStatus::Retry)
            }
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn counters(&self) -> SourceCounters {
        SourceCounters {
            hw_failures: self.hw_gate.total,
            fallbacks: self.fallbacks,
        }
    }
}

impl Drop for MediaDecoder {
    fn drop(&mut self) {
        tracing::debug!(source = %self.source, frames = self.frames_out, "decoder closed");
    }
}
