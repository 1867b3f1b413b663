//! Real-time capture export through a piped ffmpeg process.
//!
//! The render loop is paced against the wall clock at the composition rate
//! and runs one loop plus a short overshoot, so the captured file always
//! contains a complete cycle. Transparent compositions go to VP9/WebM with
//! alpha; opaque ones to H.264/MP4. The system `ffmpeg` binary is used
//! deliberately, avoiding native FFmpeg dev header/lib requirements.

use std::{
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
    time::{Duration, Instant},
};

use crate::{
    assets::AssetStore,
    clock::resolve_loop_duration_ms,
    composite::flatten_to_opaque_rgba8,
    compositor::{Compositor, VideoSampling},
    error::{EncodeError, FramixError, FramixResult},
    export::{effective_settings, ensure_parent_dir, flatten_color},
    model::{Background, ExportOptions, Project},
    pixmap::Pixmap,
    progress::{percent_of, ExportProgress, ExportStage, ProgressCallback, ProgressSink},
};

/// Extra wall time captured past the loop end, so the last frame of the
/// cycle is never clipped by encoder latency.
pub const CAPTURE_OVERSHOOT_MS: f64 = 100.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureContainer {
    Mp4,
    Webm,
}

impl CaptureContainer {
    /// Alpha needs a codec that carries it; H.264/MP4 cannot.
    pub fn for_transparency(transparent: bool) -> Self {
        if transparent {
            CaptureContainer::Webm
        } else {
            CaptureContainer::Mp4
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CaptureContainer::Mp4 => "mp4",
            CaptureContainer::Webm => "webm",
        }
    }

    pub fn video_codec(self) -> &'static str {
        match self {
            CaptureContainer::Mp4 => "libx264",
            CaptureContainer::Webm => "libvpx-vp9",
        }
    }

    fn pix_fmt(self) -> &'static str {
        match self {
            CaptureContainer::Mp4 => "yuv420p",
            CaptureContainer::Webm => "yuva420p",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub out_path: PathBuf,
    pub container: CaptureContainer,
    pub overwrite: bool,
}

impl CaptureConfig {
    pub fn validate(&self) -> FramixResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FramixError::validation(
                "capture width/height must be non-zero",
            ));
        }
        if !self.width.is_multiple_of(2) || !self.height.is_multiple_of(2) {
            // Both target pixel formats are chroma subsampled.
            return Err(FramixError::validation(
                "capture width/height must be even (required for 4:2:0 output)",
            ));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(FramixError::validation("capture fps must be finite and > 0"));
        }
        Ok(())
    }
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Whether this ffmpeg build ships the named encoder. `ffmpeg -h encoder=x`
/// exits zero even for unknown names, so the output text is checked too.
pub fn is_encoder_available(name: &str) -> bool {
    let Ok(out) = Command::new("ffmpeg")
        .args(["-hide_banner", "-h", &format!("encoder={name}")])
        .output()
    else {
        return false;
    };
    out.status.success() && String::from_utf8_lossy(&out.stdout).contains(&format!("Encoder {name}"))
}

/// A running capture: frames in over stdin, container out at `out_path`.
/// Dropping without a successful [`CaptureEncoder::finish`] kills the
/// encoder and removes the partial file.
pub struct CaptureEncoder {
    cfg: CaptureConfig,
    bg_rgba: [u8; 4],
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    scratch: Vec<u8>,
    finished: bool,
}

impl CaptureEncoder {
    pub fn new(cfg: CaptureConfig, bg_rgba: [u8; 4]) -> FramixResult<Self> {
        cfg.validate()?;
        ensure_parent_dir(&cfg.out_path)?;

        if !cfg.overwrite && cfg.out_path.exists() {
            return Err(FramixError::validation(format!(
                "output file '{}' already exists",
                cfg.out_path.display()
            )));
        }

        if !is_ffmpeg_on_path() {
            return Err(EncodeError::NoContext(
                "ffmpeg is required for capture export, but was not found on PATH".into(),
            )
            .into());
        }

        // Probed before anything is spawned or written, so a missing codec
        // fails clean with no partial output.
        let codec = cfg.container.video_codec();
        if !is_encoder_available(codec) {
            return Err(EncodeError::UnsupportedCodec(format!(
                "{codec} (needed for .{} output) is not available in this ffmpeg build",
                cfg.container.extension()
            ))
            .into());
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        if cfg.overwrite {
            cmd.arg("-y");
        } else {
            cmd.arg("-n");
        }

        cmd.args([
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
            &format!("{}x{}", cfg.width, cfg.height),
            "-r",
            &format!("{}", cfg.fps),
            "-i",
            "pipe:0",
            "-an",
        ]);
        cmd.args([
            "-c:v",
            cfg.container.video_codec(),
            "-pix_fmt",
            cfg.container.pix_fmt(),
        ]);
        match cfg.container {
            CaptureContainer::Mp4 => {
                cmd.args(["-movflags", "+faststart"]);
            }
            CaptureContainer::Webm => {
                cmd.args(["-b:v", "0", "-crf", "32"]);
            }
        }
        cmd.arg(&cfg.out_path);

        let mut child = cmd.spawn().map_err(|e| {
            FramixError::Other(anyhow::anyhow!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            EncodeError::NoContext("failed to open ffmpeg stdin (unexpected)".into())
        })?;

        Ok(Self {
            scratch: vec![0u8; (cfg.width * cfg.height * 4) as usize],
            cfg,
            bg_rgba,
            child: Some(child),
            stdin: Some(stdin),
            finished: false,
        })
    }

    pub fn encode_frame(&mut self, frame: &Pixmap) -> FramixResult<()> {
        if frame.width() != self.cfg.width || frame.height() != self.cfg.height {
            return Err(FramixError::validation(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width(),
                frame.height(),
                self.cfg.width,
                self.cfg.height
            )));
        }

        match self.cfg.container {
            CaptureContainer::Mp4 => {
                flatten_to_opaque_rgba8(&mut self.scratch, frame.data(), self.bg_rgba)?;
            }
            CaptureContainer::Webm => {
                // Rawvideo rgba input is straight alpha by convention.
                self.scratch.copy_from_slice(&frame.to_straight_rgba8());
            }
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EncodeError::NoContext("capture encoder is already finalized".into()).into());
        };

        use std::io::Write as _;
        stdin.write_all(&self.scratch).map_err(|e| {
            FramixError::Other(anyhow::anyhow!("failed to write frame to ffmpeg stdin: {e}"))
        })?;

        Ok(())
    }

    pub fn finish(mut self) -> FramixResult<()> {
        drop(self.stdin.take());

        let Some(child) = self.child.take() else {
            return Err(EncodeError::NoContext("capture encoder already waited".into()).into());
        };
        let output = child.wait_with_output().map_err(|e| {
            FramixError::Other(anyhow::anyhow!("failed to wait for ffmpeg to finish: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Early return leaves the drop guard armed, which discards the
            // corrupt container.
            return Err(EncodeError::SerializationFailed(format!(
                "ffmpeg exited with status {}: {}",
                output.status,
                stderr.trim()
            ))
            .into());
        }

        self.finished = true;
        Ok(())
    }
}

impl Drop for CaptureEncoder {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_file(&self.cfg.out_path);
        tracing::warn!(
            out = %self.cfg.out_path.display(),
            "capture did not complete, removed partial output"
        );
    }
}

/// Resolve the capture output path: extension is dictated by the container.
fn with_container_extension(out_path: &Path, container: CaptureContainer) -> PathBuf {
    let wanted = container.extension();
    let current = out_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if current.as_deref() == Some(wanted) {
        return out_path.to_path_buf();
    }
    let mut out = out_path.to_path_buf();
    out.set_extension(wanted);
    tracing::info!(
        requested = %out_path.display(),
        actual = %out.display(),
        "capture container requires a different extension"
    );
    out
}

/// Capture one full loop (plus overshoot) of the composition in real time.
///
/// The render loop is wall-clock paced: frame `i` is written at its timeline
/// slot but not before its wall slot, so the run takes about
/// `loop + overshoot` of real time. Returns the path actually written, which
/// may differ from `out_path` in extension.
#[tracing::instrument(skip(project, assets, compositor, options, progress))]
pub fn export_capture(
    project: &Project,
    assets: &AssetStore,
    compositor: &mut Compositor,
    out_path: &Path,
    options: &ExportOptions,
    progress: Option<ProgressCallback>,
) -> FramixResult<PathBuf> {
    let sink = ProgressSink::new(progress);
    let result = capture_to_path(project, assets, compositor, out_path, options, &sink);
    if let Err(err) = &result {
        sink.failed(err.to_string());
    }
    result
}

fn capture_to_path(
    project: &Project,
    assets: &AssetStore,
    compositor: &mut Compositor,
    out_path: &Path,
    options: &ExportOptions,
    sink: &ProgressSink,
) -> FramixResult<PathBuf> {
    project.validate()?;
    let settings = effective_settings(&project.settings, options);
    let transparent = settings.background == Background::Transparent;
    let container = CaptureContainer::for_transparency(transparent);
    let out = with_container_extension(out_path, container);

    let loop_ms = resolve_loop_duration_ms(&settings, &project.layers, assets);
    if !loop_ms.is_finite() || loop_ms <= 0.0 {
        return Err(FramixError::validation("capture loop duration must be > 0"));
    }
    let total_ms = loop_ms + CAPTURE_OVERSHOOT_MS;
    let interval_ms = 1000.0 / settings.fps;
    let frame_count = ((total_ms / 1000.0 * settings.fps).ceil() as u64).max(1);

    sink.stage(
        ExportStage::Preparing,
        0,
        format!(
            "capturing {frame_count} frames (~{:.1}s) to {}",
            total_ms / 1000.0,
            out.display()
        ),
    );

    let cfg = CaptureConfig {
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
        out_path: out.clone(),
        container,
        overwrite: true,
    };
    let mut encoder = CaptureEncoder::new(cfg, flatten_color(&settings))?;

    let started = Instant::now();
    for i in 0..frame_count {
        let slot_ms = i as f64 * interval_ms;
        // Pace against the wall clock; if rendering fell behind, catch up
        // without sleeping.
        let slot = Duration::from_secs_f64(slot_ms / 1000.0);
        if let Some(wait) = slot.checked_sub(started.elapsed()) {
            std::thread::sleep(wait);
        }

        let time_ms = slot_ms.rem_euclid(loop_ms);
        let frame = compositor.render_frame(
            &settings,
            &project.layers,
            assets,
            time_ms,
            VideoSampling::Blocking,
        )?;
        encoder.encode_frame(&frame)?;

        let done = i + 1;
        sink.emit(ExportProgress {
            stage: ExportStage::Rendering,
            // Held below 100 until the container is finalized.
            percent: percent_of(done, frame_count).min(99),
            message: format!("captured frame {done}/{frame_count}"),
            frames_done: done,
            total_frames: frame_count,
        });
    }
    compositor.finish();

    sink.stage(ExportStage::Encoding, 99, "finalizing container");
    encoder.finish()?;
    sink.complete(format!("wrote {}", out.display()));
    Ok(out)
}
