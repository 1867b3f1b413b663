//! Video sources decoded through ffmpeg sidecar processes.
//!
//! Seeking is asynchronous: each open source owns a worker thread that
//! decodes one frame per request, with at most one request in flight. The
//! compositor samples through [`VideoHandle`], either blocking (export) or
//! latest-wins (interactive preview).

use std::{
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{FramixError, FramixResult, TimeoutError},
    model::VideoAsset,
    pixmap::Pixmap,
};

/// Upper bound a blocking sample waits for the worker.
pub const SEEK_TIMEOUT_MS: u64 = 1000;

/// Assumed source rate when the container does not declare one.
const FALLBACK_SOURCE_FPS: f64 = 30.0;

/// Identity of an opened video source: where it lives and how fast it plays.
/// Probe-derived size and duration live on [`VideoAsset`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoSourceInfo {
    pub path: PathBuf,
    pub fps_num: u32,
    pub fps_den: u32,
}

impl VideoSourceInfo {
    pub fn new(path: impl Into<PathBuf>, fps_num: u32, fps_den: u32) -> Self {
        Self {
            path: path.into(),
            fps_num,
            fps_den,
        }
    }

    pub fn source_fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            f64::from(self.fps_num) / f64::from(self.fps_den)
        }
    }

    /// Nominal time between source frames. Doubles as the tolerance for
    /// deciding whether a cached frame still answers a seek.
    pub fn frame_interval_ms(&self) -> f64 {
        let fps = self.source_fps();
        if fps > 0.0 {
            1000.0 / fps
        } else {
            1000.0 / FALLBACK_SOURCE_FPS
        }
    }
}

/// Raw probe result before duration validation.
#[derive(Clone, Debug)]
pub struct ProbedVideo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub duration_ms: f64,
}

/// Probe and validate a video file into a normalized asset.
pub fn open_video(source_path: &Path) -> FramixResult<VideoAsset> {
    let probed = probe_video(source_path)?;
    VideoAsset::new(
        probed.width,
        probed.height,
        probed.duration_ms,
        VideoSourceInfo::new(source_path, probed.fps_num, probed.fps_den),
    )
}

#[cfg(feature = "media-ffmpeg")]
pub fn probe_video(source_path: &Path) -> FramixResult<ProbedVideo> {
    #[derive(serde::Deserialize)]
    struct ProbeStream {
        codec_type: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        r_frame_rate: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ProbeOut {
        streams: Vec<ProbeStream>,
        format: Option<ProbeFormat>,
    }

    let out = std::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(source_path)
        .output()
        .map_err(|e| FramixError::Other(anyhow::anyhow!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(crate::error::DecodeError::UnsupportedFormat(format!(
            "ffprobe failed for '{}': {}",
            source_path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        ))
        .into());
    }

    let parsed: ProbeOut = serde_json::from_slice(&out.stdout)
        .map_err(|e| FramixError::Other(anyhow::anyhow!("ffprobe json parse failed: {e}")))?;
    let video_stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| {
            crate::error::DecodeError::UnsupportedFormat(format!(
                "no video stream in '{}'",
                source_path.display()
            ))
        })?;
    let width = video_stream.width.ok_or_else(|| {
        crate::error::DecodeError::UnsupportedFormat("missing video width from ffprobe".into())
    })?;
    let height = video_stream.height.ok_or_else(|| {
        crate::error::DecodeError::UnsupportedFormat("missing video height from ffprobe".into())
    })?;

    let (fps_num, fps_den) = parse_ff_ratio(video_stream.r_frame_rate.as_deref().unwrap_or("0/1"))
        .unwrap_or((0, 1));
    let duration_ms = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .and_then(|s| s.parse::<f64>().ok())
        .map(|sec| sec * 1000.0)
        .unwrap_or(0.0);

    Ok(ProbedVideo {
        width,
        height,
        fps_num,
        fps_den,
        duration_ms,
    })
}

#[cfg(not(feature = "media-ffmpeg"))]
pub fn probe_video(_source_path: &Path) -> FramixResult<ProbedVideo> {
    Err(FramixError::validation(
        "video assets require the 'media-ffmpeg' feature",
    ))
}

#[cfg(feature = "media-ffmpeg")]
fn decode_frame_pixmap(
    path: &Path,
    width: u32,
    height: u32,
    time_ms: f64,
) -> FramixResult<Pixmap> {
    let time_sec = time_ms / 1000.0;
    let out = std::process::Command::new("ffmpeg")
        .args(["-v", "error", "-ss", &format!("{time_sec:.9}")])
        .arg("-i")
        .arg(path)
        .args([
            "-frames:v",
            "1",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "pipe:1",
        ])
        .output()
        .map_err(|e| {
            FramixError::Other(anyhow::anyhow!("failed to run ffmpeg for video seek: {e}"))
        })?;

    if !out.status.success() {
        return Err(FramixError::Other(anyhow::anyhow!(
            "ffmpeg seek failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let expected_len = width as usize * height as usize * 4;
    if expected_len == 0 {
        return Err(FramixError::validation(
            "decoded video frame size is zero (invalid source dimensions)",
        ));
    }
    if out.stdout.len() < expected_len {
        return Err(FramixError::Other(anyhow::anyhow!(
            "ffmpeg returned {} bytes for '{}', expected {expected_len}",
            out.stdout.len(),
            path.display()
        )));
    }

    let mut rgba = out.stdout[..expected_len].to_vec();
    crate::pixmap::premultiply_rgba8_in_place(&mut rgba);
    Pixmap::from_premul_rgba8(width, height, rgba)
}

#[cfg(not(feature = "media-ffmpeg"))]
fn decode_frame_pixmap(
    _path: &Path,
    _width: u32,
    _height: u32,
    _time_ms: f64,
) -> FramixResult<Pixmap> {
    Err(FramixError::validation(
        "video assets require the 'media-ffmpeg' feature",
    ))
}

#[cfg(feature = "media-ffmpeg")]
fn parse_ff_ratio(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.split('/');
    let a = parts.next()?.parse::<u32>().ok()?;
    let b = parts.next()?.parse::<u32>().ok()?;
    if b == 0 {
        return None;
    }
    Some((a, b))
}

struct SeekRequest {
    seq: u64,
    time_ms: f64,
}

struct SeekResponse {
    seq: u64,
    time_ms: f64,
    result: FramixResult<Pixmap>,
}

struct CachedFrame {
    time_ms: f64,
    pixmap: Pixmap,
}

/// Exclusive seek access to one opened video source.
///
/// Single-writer by construction: the handle is not clonable, and borrowing
/// one from [`VideoPool`] moves it out of the pool, so two renderers can
/// never push interleaved seeks at the same worker.
pub struct VideoHandle {
    path: PathBuf,
    duration_ms: f64,
    tolerance_ms: f64,
    request_tx: Option<mpsc::Sender<SeekRequest>>,
    response_rx: mpsc::Receiver<SeekResponse>,
    worker: Option<thread::JoinHandle<()>>,
    last: Option<CachedFrame>,
    in_flight: Option<u64>,
    next_seq: u64,
}

impl VideoHandle {
    pub fn spawn(asset: &VideoAsset) -> FramixResult<Self> {
        let (request_tx, request_rx) = mpsc::channel::<SeekRequest>();
        let (response_tx, response_rx) = mpsc::channel::<SeekResponse>();

        let path = asset.source.path.clone();
        let (width, height) = (asset.width, asset.height);
        let worker_path = path.clone();
        let worker = thread::Builder::new()
            .name("framix-video-seek".into())
            .spawn(move || {
                while let Ok(req) = request_rx.recv() {
                    let result = decode_frame_pixmap(&worker_path, width, height, req.time_ms);
                    let resp = SeekResponse {
                        seq: req.seq,
                        time_ms: req.time_ms,
                        result,
                    };
                    if response_tx.send(resp).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| {
                FramixError::Other(anyhow::anyhow!("failed to spawn video seek worker: {e}"))
            })?;

        Ok(Self {
            path,
            duration_ms: asset.duration_ms,
            tolerance_ms: asset.source.frame_interval_ms(),
            request_tx: Some(request_tx),
            response_rx,
            worker: Some(worker),
            last: None,
            in_flight: None,
            next_seq: 0,
        })
    }

    /// Pool key: the source path this handle serves.
    pub fn source_key(&self) -> String {
        self.path.display().to_string()
    }

    /// Wait for the frame at `time_ms`, at most [`SEEK_TIMEOUT_MS`].
    pub fn sample_blocking(&mut self, time_ms: f64) -> FramixResult<&Pixmap> {
        self.sample_blocking_with_timeout(time_ms, Duration::from_millis(SEEK_TIMEOUT_MS))
    }

    pub fn sample_blocking_with_timeout(
        &mut self,
        time_ms: f64,
        timeout: Duration,
    ) -> FramixResult<&Pixmap> {
        let target = self.wrap_time(time_ms);
        self.drain_responses()?;

        let started = Instant::now();
        while !self.cached_matches(target) {
            if self.in_flight.is_none() {
                self.send_request(target)?;
            }
            let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                return Err(TimeoutError::SeekTimeout {
                    waited_ms: timeout.as_millis() as u64,
                }
                .into());
            };
            match self.response_rx.recv_timeout(remaining) {
                Ok(resp) => self.take_response(resp)?,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(TimeoutError::SeekTimeout {
                        waited_ms: timeout.as_millis() as u64,
                    }
                    .into());
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(FramixError::Other(anyhow::anyhow!(
                        "video seek worker exited for '{}'",
                        self.path.display()
                    )));
                }
            }
        }

        match &self.last {
            Some(cached) => Ok(&cached.pixmap),
            None => Err(FramixError::no_surface(format!(
                "no decoded frame for '{}'",
                self.path.display()
            ))),
        }
    }

    /// Non-blocking sample: returns the freshest decoded frame (possibly
    /// stale) and schedules a seek toward `time_ms` if the cache misses.
    /// `None` until the first frame arrives.
    pub fn sample_latest(&mut self, time_ms: f64) -> Option<&Pixmap> {
        let target = self.wrap_time(time_ms);
        self.poll();
        if !self.cached_matches(target) && self.in_flight.is_none() {
            if let Err(err) = self.send_request(target) {
                tracing::warn!(source = %self.path.display(), error = %err, "video seek request failed");
            }
        }
        self.last.as_ref().map(|c| &c.pixmap)
    }

    /// Absorb any completed seeks without blocking. Failed seeks are logged
    /// and the previous good frame is kept.
    pub fn poll(&mut self) {
        if let Err(err) = self.drain_responses() {
            tracing::warn!(source = %self.path.display(), error = %err, "video seek failed");
        }
    }

    /// Prepare a handle coming back out of the pool: settle any response the
    /// previous borrower left behind. The frame cache stays, it belongs to
    /// the same source.
    pub fn reset(&mut self) {
        self.poll();
    }

    fn drain_responses(&mut self) -> FramixResult<()> {
        let mut first_err = None;
        while let Ok(resp) = self.response_rx.try_recv() {
            if let Err(err) = self.take_response(resp) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_response(&mut self, resp: SeekResponse) -> FramixResult<()> {
        if self.in_flight != Some(resp.seq) {
            // Stale answer from a seek that was superseded.
            return Ok(());
        }
        self.in_flight = None;
        match resp.result {
            Ok(pixmap) => {
                self.last = Some(CachedFrame {
                    time_ms: resp.time_ms,
                    pixmap,
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn send_request(&mut self, time_ms: f64) -> FramixResult<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let tx = self.request_tx.as_ref().ok_or_else(|| {
            FramixError::Other(anyhow::anyhow!("video seek worker already shut down"))
        })?;
        tx.send(SeekRequest { seq, time_ms }).map_err(|_| {
            FramixError::Other(anyhow::anyhow!(
                "video seek worker exited for '{}'",
                self.path.display()
            ))
        })?;
        self.in_flight = Some(seq);
        Ok(())
    }

    fn cached_matches(&self, target_ms: f64) -> bool {
        self.last
            .as_ref()
            .is_some_and(|c| (c.time_ms - target_ms).abs() <= self.tolerance_ms)
    }

    // Seek targets wrap at the clip's own duration, so a composition loop
    // longer than the clip replays it instead of freezing on the last frame.
    // The tail stays one frame interval short, where ffmpeg can emit nothing.
    fn wrap_time(&self, time_ms: f64) -> f64 {
        let wrapped = if self.duration_ms > 0.0 {
            time_ms.rem_euclid(self.duration_ms)
        } else {
            0.0
        };
        wrapped.min((self.duration_ms - self.tolerance_ms).max(0.0))
    }
}

impl Drop for VideoHandle {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.request_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VideoPoolOpts {
    /// Maximum idle handles retained; the least recently released is evicted
    /// first.
    pub max_handles: usize,
}

impl Default for VideoPoolOpts {
    fn default() -> Self {
        Self { max_handles: 4 }
    }
}

#[derive(Debug, Default, Clone)]
pub struct VideoPoolStats {
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
}

/// Bounded reuse of seek workers across renders, keyed by source path.
///
/// `borrow` moves the handle out, so a held handle is never shared; `release`
/// puts it back for the next render of the same source.
pub struct VideoPool {
    opts: VideoPoolOpts,
    stats: VideoPoolStats,
    // Small and path-keyed; scan order doubles as LRU order.
    idle: Vec<(String, VideoHandle)>,
}

impl VideoPool {
    pub fn new(opts: VideoPoolOpts) -> Self {
        Self {
            opts,
            stats: VideoPoolStats::default(),
            idle: Vec::new(),
        }
    }

    pub fn stats(&self) -> VideoPoolStats {
        self.stats.clone()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn borrow(&mut self, asset: &VideoAsset) -> FramixResult<VideoHandle> {
        let key = asset.source.path.display().to_string();
        if let Some(pos) = self.idle.iter().position(|(k, _)| *k == key) {
            let (_, mut handle) = self.idle.remove(pos);
            handle.reset();
            self.stats.reused = self.stats.reused.saturating_add(1);
            return Ok(handle);
        }
        self.stats.created = self.stats.created.saturating_add(1);
        VideoHandle::spawn(asset)
    }

    pub fn release(&mut self, handle: VideoHandle) {
        let key = handle.source_key();
        self.idle.push((key, handle));
        while self.idle.len() > self.opts.max_handles.max(1) {
            // Dropping the handle shuts its worker down.
            self.idle.remove(0);
            self.stats.evicted = self.stats.evicted.saturating_add(1);
        }
    }
}

impl Default for VideoPool {
    fn default() -> Self {
        Self::new(VideoPoolOpts::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_asset(path: &str) -> VideoAsset {
        VideoAsset::new(4, 4, 2000.0, VideoSourceInfo::new(path, 25, 1)).unwrap()
    }

    #[test]
    fn frame_interval_follows_declared_rate() {
        let info = VideoSourceInfo::new("a.mp4", 25, 1);
        assert!((info.frame_interval_ms() - 40.0).abs() < 1e-9);

        let unknown = VideoSourceInfo::new("a.mp4", 0, 1);
        assert!((unknown.frame_interval_ms() - 1000.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn seek_targets_wrap_past_the_clip_duration() {
        // 2000ms clip at 25fps: one loop past 500ms lands back on 500ms.
        let handle = VideoHandle::spawn(&fake_asset("clip.mp4")).unwrap();
        assert!((handle.wrap_time(2500.0) - 500.0).abs() < 1e-9);
        assert!((handle.wrap_time(-500.0) - 1500.0).abs() < 1e-9);
        assert_eq!(handle.wrap_time(2000.0), 0.0);
        // Inside the loop the tail is still held one frame interval short.
        assert!((handle.wrap_time(1990.0) - 1960.0).abs() < 1e-9);
    }

    #[test]
    fn pool_reuses_matching_idle_handles() {
        let mut pool = VideoPool::default();
        let asset = fake_asset("clip.mp4");

        let h = pool.borrow(&asset).unwrap();
        pool.release(h);
        assert_eq!(pool.idle_len(), 1);

        let _h = pool.borrow(&asset).unwrap();
        assert_eq!(pool.idle_len(), 0);

        let st = pool.stats();
        assert_eq!(st.created, 1);
        assert_eq!(st.reused, 1);
    }

    #[test]
    fn pool_evicts_least_recently_released() {
        let mut pool = VideoPool::new(VideoPoolOpts { max_handles: 2 });
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            let h = pool.borrow(&fake_asset(name)).unwrap();
            pool.release(h);
        }
        assert_eq!(pool.idle_len(), 2);
        assert_eq!(pool.stats().evicted, 1);
        // a.mp4 was evicted, so borrowing it spawns fresh.
        let _ = pool.borrow(&fake_asset("a.mp4")).unwrap();
        assert_eq!(pool.stats().created, 4);
    }

    #[test]
    fn borrowing_moves_the_handle_out() {
        let mut pool = VideoPool::default();
        let asset = fake_asset("clip.mp4");
        let h = pool.borrow(&asset).unwrap();
        // While held, the pool has nothing to hand out for this source.
        assert_eq!(pool.idle_len(), 0);
        pool.release(h);
        assert_eq!(pool.idle_len(), 1);
    }

    #[cfg(not(feature = "media-ffmpeg"))]
    #[test]
    fn blocking_sample_surfaces_worker_errors() {
        let mut handle = VideoHandle::spawn(&fake_asset("missing.mp4")).unwrap();
        let res = handle.sample_blocking_with_timeout(0.0, Duration::from_millis(500));
        assert!(res.is_err());
    }

    #[test]
    fn latest_sample_is_none_before_first_decode() {
        let mut handle = VideoHandle::spawn(&fake_asset("missing.mp4")).unwrap();
        assert!(handle.sample_latest(0.0).is_none());
    }
}
