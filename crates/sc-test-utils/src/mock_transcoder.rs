//! Scripted transcoder for egress tests.
//!
//! `MockTranscoder` records every job it is asked to run. By default each
//! spawn reports `Started` straight away and writes a small manifest into
//! the job's output directory, so "the manifest becomes reachable" can be
//! checked on disk. Tests drive the rest of the lifecycle with
//! [`MockTranscoder::emit`].

use parking_lot::Mutex;
use sc_service::egress::transcoder::TRANSCODER_EVENT_CAPACITY;
use sc_service::egress::{TranscodeJob, Transcoder, TranscoderEvent, TranscoderHandle, TranscoderProcess};
use sc_service::errors::ScError;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Playlist written on spawn when manifests are enabled.
const PLACEHOLDER_MANIFEST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n";

struct TranscoderState {
    jobs: Vec<TranscodeJob>,
    auto_start: bool,
    write_manifest: bool,
    fail_next: VecDeque<String>,
    fail_always: Option<String>,
    current: Option<mpsc::Sender<TranscoderEvent>>,
    running: usize,
    stops: usize,
}

/// Scriptable `Transcoder` double.
#[derive(Clone)]
pub struct MockTranscoder {
    state: Arc<Mutex<TranscoderState>>,
}

impl Default for MockTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTranscoder {
    /// Reports `Started` on spawn and writes a manifest.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TranscoderState {
                jobs: Vec::new(),
                auto_start: true,
                write_manifest: true,
                fail_next: VecDeque::new(),
                fail_always: None,
                current: None,
                running: 0,
                stops: 0,
            })),
        }
    }

    /// Leave new processes in `starting` until a test emits `Started`.
    #[must_use]
    pub fn without_auto_start(self) -> Self {
        self.state.lock().auto_start = false;
        self
    }

    #[must_use]
    pub fn without_manifest(self) -> Self {
        self.state.lock().write_manifest = false;
        self
    }

    /// Refuse the next spawn.
    pub fn fail_next_spawn(&self, reason: &str) {
        self.state.lock().fail_next.push_back(reason.to_string());
    }

    /// Refuse every spawn until [`allow_spawn`](Self::allow_spawn).
    pub fn fail_every_spawn(&self, reason: &str) {
        self.state.lock().fail_always = Some(reason.to_string());
    }

    pub fn allow_spawn(&self) {
        let mut state = self.state.lock();
        state.fail_next.clear();
        state.fail_always = None;
    }

    /// Send `event` from the most recently spawned process.
    ///
    /// Returns false if nothing listens any more.
    pub fn emit(&self, event: TranscoderEvent) -> bool {
        let sender = self.state.lock().current.clone();
        sender.is_some_and(|tx| tx.try_send(event).is_ok())
    }

    /// Jobs passed to `spawn`, successful or not.
    #[must_use]
    pub fn jobs(&self) -> Vec<TranscodeJob> {
        self.state.lock().jobs.clone()
    }

    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Processes spawned and not yet stopped.
    #[must_use]
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Processes stopped through their `TranscoderProcess`.
    #[must_use]
    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }
}

#[async_trait::async_trait]
impl Transcoder for MockTranscoder {
    async fn spawn(&self, job: TranscodeJob) -> Result<TranscoderHandle, ScError> {
        let (failure, auto_start, write_manifest) = {
            let mut state = self.state.lock();
            state.jobs.push(job.clone());
            let queued = state.fail_next.pop_front();
            let failure = queued.or_else(|| state.fail_always.clone());
            (failure, state.auto_start, state.write_manifest)
        };
        if let Some(reason) = failure {
            return Err(ScError::Transcoder(reason));
        }

        if write_manifest {
            tokio::fs::create_dir_all(&job.output_dir)
                .await
                .map_err(|e| ScError::Transcoder(e.to_string()))?;
            tokio::fs::write(job.manifest_path(), PLACEHOLDER_MANIFEST)
                .await
                .map_err(|e| ScError::Transcoder(e.to_string()))?;
        }

        let (events_tx, events) = mpsc::channel(TRANSCODER_EVENT_CAPACITY);
        if auto_start {
            let _ = events_tx.try_send(TranscoderEvent::Started);
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            let _ = stop_rx.await;
            let mut state = state.lock();
            state.running = state.running.saturating_sub(1);
            state.stops += 1;
        });

        {
            let mut state = self.state.lock();
            state.current = Some(events_tx);
            state.running += 1;
        }

        Ok(TranscoderHandle {
            events,
            process: TranscoderProcess::new(stop_tx, task),
        })
    }
}
