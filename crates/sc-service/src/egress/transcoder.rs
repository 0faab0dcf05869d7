//! Transcoding engine seam and the `ffmpeg` implementation.

use super::{MANIFEST_FILE_NAME, SEGMENT_FILE_PATTERN};
use crate::config::EgressConfig;
use crate::errors::ScError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of a transcoder's lifecycle event channel.
pub const TRANSCODER_EVENT_CAPACITY: usize = 8;

/// What to transcode and where to write it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    /// Session description of the incoming RTP stream.
    pub sdp: String,
    /// Directory receiving the manifest and segments.
    pub output_dir: PathBuf,
    pub segment_seconds: u32,
    /// Segments kept in the playlist; older ones are deleted.
    pub list_size: u32,
}

impl TranscodeJob {
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE_NAME)
    }

    #[must_use]
    pub fn segment_pattern(&self) -> PathBuf {
        self.output_dir.join(SEGMENT_FILE_PATTERN)
    }
}

/// Lifecycle signals of a running transcoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderEvent {
    Started,
    Error(String),
    /// The process exited cleanly without being asked to.
    Ended,
}

/// Stop control of a spawned transcoder.
pub struct TranscoderProcess {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TranscoderProcess {
    /// Wrap a supervising task that exits once `stop` fires (or is dropped).
    #[must_use]
    pub fn new(stop: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Stop the transcoder and wait until it no longer writes output.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(target: "sc.egress", error = %e, "Transcoder supervisor task failed");
        }
    }
}

/// A spawned transcoder: its event stream plus its stop control.
pub struct TranscoderHandle {
    pub events: mpsc::Receiver<TranscoderEvent>,
    pub process: TranscoderProcess,
}

/// External transcoding engine.
#[async_trait::async_trait]
pub trait Transcoder: Send + Sync {
    /// Launch a transcoder for `job`.
    ///
    /// # Errors
    ///
    /// `ScError::Transcoder` if the process cannot be started.
    async fn spawn(&self, job: TranscodeJob) -> Result<TranscoderHandle, ScError>;
}

/// Transcoder running the `ffmpeg` binary.
///
/// Reads RTP described by an SDP file, encodes H.264 and muxes a rolling
/// HLS playlist. `Started` is emitted once the process is running;
/// a non-zero exit is reported as `Error`. The SDP file is removed once
/// the process has exited.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
    stop_grace: Duration,
    sdp_path: PathBuf,
}

impl FfmpegTranscoder {
    #[must_use]
    pub fn new(ffmpeg_path: impl Into<PathBuf>, stop_grace: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            stop_grace,
            sdp_path: Self::default_sdp_path(),
        }
    }

    /// Write the SDP to `sdp_path` instead of the temp directory.
    #[must_use]
    pub fn with_sdp_path(mut self, sdp_path: impl Into<PathBuf>) -> Self {
        self.sdp_path = sdp_path.into();
        self
    }

    #[must_use]
    pub fn from_config(config: &EgressConfig) -> Self {
        Self::new(config.ffmpeg_path.clone(), config.stop_grace)
    }

    /// Default location of this process's egress SDP.
    #[must_use]
    pub fn default_sdp_path() -> PathBuf {
        std::env::temp_dir().join(format!("sc-egress-{}.sdp", std::process::id()))
    }

    #[must_use]
    pub fn sdp_path(&self) -> &Path {
        &self.sdp_path
    }
}

/// Command line for transcoding the stream described by `sdp_path`.
#[must_use]
pub fn ffmpeg_args(sdp_path: &Path, job: &TranscodeJob) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-protocol_whitelist",
        "file,udp,rtp",
        "-i",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(sdp_path.as_os_str().to_owned());

    for arg in [
        "-an",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-tune",
        "zerolatency",
        "-f",
        "hls",
    ] {
        args.push(OsString::from(arg));
    }
    args.push("-hls_time".into());
    args.push(job.segment_seconds.to_string().into());
    args.push("-hls_list_size".into());
    args.push(job.list_size.to_string().into());
    args.push("-hls_flags".into());
    args.push("delete_segments".into());
    args.push("-hls_segment_filename".into());
    args.push(job.segment_pattern().into_os_string());
    args.push("-y".into());
    args.push(job.manifest_path().into_os_string());
    args
}

#[async_trait::async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, job: TranscodeJob) -> Result<TranscoderHandle, ScError> {
        tokio::fs::create_dir_all(&job.output_dir)
            .await
            .map_err(|e| {
                ScError::Transcoder(format!(
                    "cannot create output directory {}: {e}",
                    job.output_dir.display()
                ))
            })?;

        let sdp_path = self.sdp_path.clone();
        tokio::fs::write(&sdp_path, job.sdp.as_bytes())
            .await
            .map_err(|e| {
                ScError::Transcoder(format!("cannot write {}: {e}", sdp_path.display()))
            })?;

        let spawned = Command::new(&self.ffmpeg_path)
            .args(ffmpeg_args(&sdp_path, &job))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                remove_sdp(&sdp_path).await;
                return Err(ScError::Transcoder(format!(
                    "failed to spawn {}: {e}",
                    self.ffmpeg_path.display()
                )));
            }
        };

        info!(
            target: "sc.egress",
            pid = child.id().unwrap_or_default(),
            manifest = %job.manifest_path().display(),
            "Transcoder started"
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        let (event_tx, events) = mpsc::channel(TRANSCODER_EVENT_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        // Fresh channel, cannot be full
        let _ = event_tx.try_send(TranscoderEvent::Started);
        let task = tokio::spawn(supervise(
            child,
            event_tx,
            stop_rx,
            self.stop_grace,
            sdp_path,
        ));

        Ok(TranscoderHandle {
            events,
            process: TranscoderProcess::new(stop_tx, task),
        })
    }
}

/// Wait for the process to exit or to be told to stop, then remove its SDP.
async fn supervise(
    mut child: Child,
    events: mpsc::Sender<TranscoderEvent>,
    stop: oneshot::Receiver<()>,
    grace: Duration,
    sdp_path: PathBuf,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop => None,
    };

    let Some(status) = exited else {
        shut_down(&mut child, grace).await;
        remove_sdp(&sdp_path).await;
        return;
    };
    remove_sdp(&sdp_path).await;

    let event = match status {
        Ok(status) if status.success() => TranscoderEvent::Ended,
        Ok(status) => TranscoderEvent::Error(format!("transcoder exited with {status}")),
        Err(e) => TranscoderEvent::Error(format!("failed to wait for transcoder: {e}")),
    };
    let _ = events.send(event).await;
}

/// Ask `ffmpeg` to finish the playlist (`q` on stdin), then kill it after `grace`.
async fn shut_down(child: &mut Child, grace: Duration) {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"q").await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(target: "sc.egress", "Transcoder exited after quit request"),
        Err(_) => {
            warn!(
                target: "sc.egress",
                grace_ms = grace.as_millis(),
                "Transcoder ignored quit request, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(target: "sc.egress", error = %e, "Failed to kill transcoder");
            }
        }
    }
}

async fn remove_sdp(sdp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(sdp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(target: "sc.egress", path = %sdp_path.display(), error = %e, "Failed to remove SDP file");
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "sc.egress.ffmpeg", "{line}");
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn job(output_dir: &Path) -> TranscodeJob {
        TranscodeJob {
            sdp: "v=0\r\n".to_string(),
            output_dir: output_dir.to_path_buf(),
            segment_seconds: 2,
            list_size: 3,
        }
    }

    fn position(args: &[OsString], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("missing {flag}"))
    }

    #[test]
    fn test_ffmpeg_args_hls_output() {
        let job = job(Path::new("/srv/hls"));
        let args = ffmpeg_args(Path::new("/tmp/in.sdp"), &job);

        let hls_time = position(&args, "-hls_time");
        assert_eq!(args[hls_time + 1], "2");
        let list_size = position(&args, "-hls_list_size");
        assert_eq!(args[list_size + 1], "3");
        let flags = position(&args, "-hls_flags");
        assert_eq!(args[flags + 1], "delete_segments");
        assert_eq!(
            args.last().unwrap(),
            &OsString::from("/srv/hls/stream.m3u8")
        );
    }

    #[test]
    fn test_ffmpeg_args_read_sdp_over_rtp() {
        let args = ffmpeg_args(Path::new("/tmp/in.sdp"), &job(Path::new("/srv/hls")));

        let whitelist = position(&args, "-protocol_whitelist");
        assert_eq!(args[whitelist + 1], "file,udp,rtp");
        let input = position(&args, "-i");
        assert_eq!(args[input + 1], "/tmp/in.sdp");
        let codec = position(&args, "-c:v");
        assert_eq!(args[codec + 1], "libx264");
        let tune = position(&args, "-tune");
        assert_eq!(args[tune + 1], "zerolatency");
    }

    fn transcoder_in(binary: &str, dir: &Path) -> FfmpegTranscoder {
        FfmpegTranscoder::new(binary, Duration::from_millis(100)).with_sdp_path(dir.join("in.sdp"))
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails_and_removes_sdp() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = transcoder_in("/nonexistent/ffmpeg-binary", dir.path());

        let result = transcoder.spawn(job(dir.path())).await;

        assert!(matches!(result, Err(ScError::Transcoder(_))));
        assert!(!transcoder.sdp_path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = transcoder_in("false", dir.path());

        let mut handle = transcoder.spawn(job(dir.path())).await.unwrap();

        assert_eq!(handle.events.recv().await, Some(TranscoderEvent::Started));
        assert!(matches!(
            handle.events.recv().await,
            Some(TranscoderEvent::Error(_))
        ));
        assert!(!transcoder.sdp_path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_reports_end_and_removes_sdp() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = transcoder_in("true", dir.path());

        let mut handle = transcoder.spawn(job(dir.path())).await.unwrap();

        assert_eq!(handle.events.recv().await, Some(TranscoderEvent::Started));
        assert_eq!(handle.events.recv().await, Some(TranscoderEvent::Ended));
        // Removed before the exit is reported
        assert!(!transcoder.sdp_path().exists());
        handle.process.stop().await;
    }

    #[test]
    fn test_default_sdp_path_is_per_process() {
        let path = FfmpegTranscoder::default_sdp_path();
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path
            .to_string_lossy()
            .contains(&std::process::id().to_string()));
    }
}
