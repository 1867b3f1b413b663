/// Progress callback for export runs.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    Preparing,
    Rendering,
    Encoding,
    Complete,
    Failed,
}

/// One progress report. `percent` is 0..=100 and never decreases within a
/// single export run.
#[derive(Debug, Clone)]
pub struct ExportProgress {
    pub stage: ExportStage,
    pub percent: u8,
    pub message: String,
    pub frames_done: u64,
    pub total_frames: u64,
}

/// Wraps the optional callback so exporters report unconditionally; every
/// report is also mirrored to the debug log.
pub struct ProgressSink {
    callback: Option<ProgressCallback>,
}

impl ProgressSink {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self { callback }
    }

    pub fn none() -> Self {
        Self { callback: None }
    }

    pub fn emit(&self, progress: ExportProgress) {
        tracing::debug!(
            stage = ?progress.stage,
            percent = progress.percent,
            frames_done = progress.frames_done,
            total_frames = progress.total_frames,
            message = %progress.message,
            "export progress"
        );
        if let Some(cb) = &self.callback {
            cb(progress);
        }
    }

    pub fn stage(&self, stage: ExportStage, percent: u8, message: impl Into<String>) {
        self.emit(ExportProgress {
            stage,
            percent: percent.min(100),
            message: message.into(),
            frames_done: 0,
            total_frames: 0,
        });
    }

    /// Per-frame heartbeat. Held below 100 so finalization stages stay
    /// monotone; only [`ProgressSink::complete`] reports 100.
    pub fn rendering(&self, frames_done: u64, total_frames: u64) {
        self.emit(ExportProgress {
            stage: ExportStage::Rendering,
            percent: percent_of(frames_done, total_frames).min(99),
            message: format!("rendering frame {frames_done}/{total_frames}"),
            frames_done,
            total_frames,
        });
    }

    pub fn complete(&self, message: impl Into<String>) {
        self.stage(ExportStage::Complete, 100, message);
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.stage(ExportStage::Failed, 100, message);
    }
}

pub(crate) fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn percent_of_is_bounded() {
        assert_eq!(percent_of(0, 0), 0);
        assert_eq!(percent_of(5, 0), 0);
        assert_eq!(percent_of(0, 10), 0);
        assert_eq!(percent_of(5, 10), 50);
        assert_eq!(percent_of(10, 10), 100);
        assert_eq!(percent_of(15, 10), 100);
    }

    #[test]
    fn sink_forwards_reports_in_order() {
        let seen: Arc<Mutex<Vec<(ExportStage, u8)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let sink = ProgressSink::new(Some(Box::new(move |p| {
            seen2.lock().unwrap().push((p.stage, p.percent));
        })));

        sink.stage(ExportStage::Preparing, 0, "probing inputs");
        sink.rendering(1, 2);
        sink.rendering(2, 2);
        sink.complete("done");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (ExportStage::Preparing, 0),
                (ExportStage::Rendering, 50),
                (ExportStage::Rendering, 99),
                (ExportStage::Complete, 100),
            ]
        );
    }

    #[test]
    fn sink_without_callback_is_silent() {
        let sink = ProgressSink::none();
        sink.rendering(1, 10);
        sink.complete("done");
    }
}
