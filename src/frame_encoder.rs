//! FrameEncoder: the muxer/codec worker thread that turns readback RGBA frames into the output
//! MP4.
//!
//! Mirrors the decode side's `ffmpeg-next` usage in `resource.rs`, run in reverse: an RGBA8
//! frame is scaled to YUV420P and fed to an H.264 encoder, one context per `Engine::play` run,
//! on a dedicated worker thread so the render thread never blocks on codec latency — only on the
//! bounded queue filling up, which is a frame-drop, not a stall.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{error, warn};

use crate::error::EngineError;

const QUEUE_CAPACITY: usize = 1000;

enum EncoderMessage {
    Frame { rgba: Vec<u8>, pts: i64 },
    Stop,
}

/// Output parameters an `Engine::play` run opens the encoder with.
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub m_bit_rate: f64,
    pub output_path: String,
}

/// Producer-side handle held by the render thread. `push_frame` never blocks: a full queue
/// drops the frame and reports `EngineError::EncoderQueueFull`; a poisoned worker (after a fatal
/// codec error) rejects every subsequent push with `EngineError::EncoderFatal`.
pub struct FrameEncoder {
    tx: Sender<EncoderMessage>,
    worker: Option<JoinHandle<()>>,
    poisoned: Arc<AtomicBool>,
    next_pts: i64,
}

impl FrameEncoder {
    /// Opens the muxer/codec and starts the worker thread.
    pub fn start(config: EncoderConfig) -> Result<Self, EngineError> {
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let poisoned = Arc::new(AtomicBool::new(false));
        let worker_poisoned = poisoned.clone();

        let worker = std::thread::Builder::new()
            .name("frame-encoder".to_string())
            .spawn(move || run_worker(config, rx, worker_poisoned))
            .map_err(|e| EngineError::EncoderFatal(format!("failed to spawn encoder thread: {e}")))?;

        Ok(FrameEncoder { tx, worker: Some(worker), poisoned, next_pts: 0 })
    }

    /// Pushes one RGBA8, row-major frame at the next sequential presentation timestamp.
    /// Non-blocking: returns `false` (and logs) if the queue is full or the worker has died.
    pub fn push_frame(&mut self, rgba: Vec<u8>, timestamp_ms: f64) -> bool {
        if self.poisoned.load(Ordering::Acquire) {
            error!("encoder worker is dead, dropping frame at t={timestamp_ms}ms");
            return false;
        }

        let pts = self.next_pts;
        match self.tx.try_send(EncoderMessage::Frame { rgba, pts }) {
            Ok(()) => {
                self.next_pts += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("{}", EngineError::EncoderQueueFull { timestamp_ms });
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("encoder worker channel disconnected, dropping frame at t={timestamp_ms}ms");
                false
            }
        }
    }

    /// Drains the queue, flushes the codec, closes the container, and joins the worker thread.
    pub fn stop(mut self) {
        let _ = self.tx.send(EncoderMessage::Stop);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(config: EncoderConfig, rx: Receiver<EncoderMessage>, poisoned: Arc<AtomicBool>) {
    if let Err(e) = encode_loop(&config, &rx) {
        error!("{}", EngineError::EncoderFatal(format!("{e:#}")));
        poisoned.store(true, Ordering::Release);
        // Drain whatever is left so the producer's bounded `send` (if any is ever added) never
        // deadlocks against a dead consumer; `push_frame` itself is already non-blocking.
        for msg in rx.try_iter() {
            if matches!(msg, EncoderMessage::Stop) {
                break;
            }
        }
    }
}

fn encode_loop(config: &EncoderConfig, rx: &Receiver<EncoderMessage>) -> anyhow::Result<()> {
    ffmpeg_next::init().context("initialising ffmpeg")?;

    let mut octx = ffmpeg_next::format::output(&config.output_path)
        .with_context(|| format!("opening output '{}'", config.output_path))?;

    let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::H264)
        .context("no H.264 encoder registered in this ffmpeg build")?;
    let mut stream = octx.add_stream(codec).context("adding video stream")?;
    let stream_index = stream.index();

    let mut encoder = ffmpeg_next::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .context("opening video encoder context")?;
    encoder.set_width(config.width);
    encoder.set_height(config.height);
    encoder.set_format(ffmpeg_next::format::Pixel::YUV420P);
    encoder.set_time_base(ffmpeg_next::Rational(1, config.fps as i32));
    encoder.set_frame_rate(Some(ffmpeg_next::Rational(config.fps as i32, 1)));
    // mBitRate is Mbit/s on the wire.
    encoder.set_bit_rate((config.m_bit_rate * 1_000_000.0) as usize);
    encoder.set_gop(10);
    encoder.set_max_b_frames(0);
    if octx.format().flags().contains(ffmpeg_next::format::Flags::GLOBAL_HEADER) {
        encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
    }

    let mut opts = ffmpeg_next::Dictionary::new();
    opts.set("preset", "ultrafast");
    let mut opened = encoder.open_as_with(codec, opts).context("opening H.264 encoder")?;
    stream.set_parameters(&opened);
    let stream_time_base = stream.time_base();

    octx.write_header().context("writing container header")?;

    let mut scaler = ffmpeg_next::software::scaling::Context::get(
        ffmpeg_next::format::Pixel::RGBA,
        config.width,
        config.height,
        ffmpeg_next::format::Pixel::YUV420P,
        config.width,
        config.height,
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )
    .context("building YUV420P scaling context")?;

    let encoder_time_base = opened.time_base();

    loop {
        match rx.recv() {
            Ok(EncoderMessage::Frame { rgba, pts }) => {
                encode_one_frame(&mut opened, &mut scaler, config, &rgba, pts, encoder_time_base, stream_time_base, stream_index, &mut octx)?;
            }
            Ok(EncoderMessage::Stop) | Err(_) => break,
        }
    }

    opened.send_eof().context("flushing encoder")?;
    drain_packets(&mut opened, encoder_time_base, stream_time_base, stream_index, &mut octx)?;
    octx.write_trailer().context("writing container trailer")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_one_frame(
    encoder: &mut ffmpeg_next::encoder::Video,
    scaler: &mut ffmpeg_next::software::scaling::Context,
    config: &EncoderConfig,
    rgba: &[u8],
    pts: i64,
    encoder_time_base: ffmpeg_next::Rational,
    stream_time_base: ffmpeg_next::Rational,
    stream_index: usize,
    octx: &mut ffmpeg_next::format::context::Output,
) -> anyhow::Result<()> {
    let mut rgba_frame = ffmpeg_next::frame::Video::new(ffmpeg_next::format::Pixel::RGBA, config.width, config.height);
    let stride = rgba_frame.stride(0);
    let row_bytes = (config.width * 4) as usize;
    let data = rgba_frame.data_mut(0);
    for row in 0..config.height as usize {
        data[row * stride..row * stride + row_bytes].copy_from_slice(&rgba[row * row_bytes..(row + 1) * row_bytes]);
    }

    let mut yuv_frame = ffmpeg_next::frame::Video::empty();
    scaler.run(&rgba_frame, &mut yuv_frame).context("scaling RGBA frame to YUV420P")?;
    yuv_frame.set_pts(Some(pts));

    encoder.send_frame(&yuv_frame).context("sending frame to encoder")?;
    drain_packets(encoder, encoder_time_base, stream_time_base, stream_index, octx)
}

fn drain_packets(
    encoder: &mut ffmpeg_next::encoder::Video,
    encoder_time_base: ffmpeg_next::Rational,
    stream_time_base: ffmpeg_next::Rational,
    stream_index: usize,
    octx: &mut ffmpeg_next::format::context::Output,
) -> anyhow::Result<()> {
    let mut packet = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet.write_interleaved(octx).context("writing encoded packet")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_frame_after_drop_reports_failure_not_a_panic() {
        // A worker that fails to open its output path (here: an unwritable directory) poisons
        // itself instead of the render thread observing a panic.
        let config = EncoderConfig {
            width: 64,
            height: 64,
            fps: 30,
            m_bit_rate: 1.0,
            output_path: "/nonexistent/dir/out.mp4".to_string(),
        };
        let mut encoder = FrameEncoder::start(config).expect("spawning the worker thread itself cannot fail");
        // Give the worker a moment to hit its open() failure and poison itself.
        std::thread::sleep(std::time::Duration::from_millis(100));
        let pushed = encoder.push_frame(vec![0u8; 64 * 64 * 4], 0.0);
        assert!(!pushed);
        encoder.stop();
    }
}
