//! Verify stage: polls the remote store until every copied file is visible.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::AppConfig;
use crate::core::models::{RunId, StageMessage, VerifyEvent};
use crate::core::remote::ExistenceChecker;
use crate::logging::LogThrottle;

pub type NoticeReceiver = mpsc::UnboundedReceiver<StageMessage<String>>;
pub type VerifyEventSender = mpsc::UnboundedSender<StageMessage<VerifyEvent>>;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const CHECK_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifierSettings {
    pub poll_interval: Duration,
    pub check_timeout: Duration,
    /// Per-file give-up time. `None` polls until the file shows up.
    pub file_timeout: Option<Duration>,
}

impl From<&AppConfig> for VerifierSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            check_timeout: config.check_timeout(),
            file_timeout: config.verify_timeout(),
        }
    }
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifierSummary {
    pub files_verified: u64,
    pub files_timed_out: u64,
    pub checks: u64,
    /// Checks that neither confirmed nor ruled out visibility
    pub check_errors: u64,
}

#[derive(Debug)]
struct PendingEntry {
    since: Instant,
    misses: u32,
}

/// Files notified by the copier and not yet seen remotely.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: BTreeMap<String, PendingEntry>,
}

impl PendingSet {
    /// Returns false if the path was already pending.
    pub fn insert(&mut self, path: String) -> bool {
        if self.entries.contains_key(&path) {
            return false;
        }
        self.entries.insert(
            path,
            PendingEntry {
                since: Instant::now(),
                misses: 0,
            },
        );
        true
    }

    /// Returns true only for the call that actually removed the path.
    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn record_miss(&mut self, path: &str) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.misses += 1;
        }
    }

    fn pending_for(&self, path: &str) -> Option<Duration> {
        self.entries.get(path).map(|e| e.since.elapsed())
    }

    fn misses(&self, path: &str) -> u32 {
        self.entries.get(path).map_or(0, |e| e.misses)
    }
}

pub struct Verifier {
    checker: Arc<dyn ExistenceChecker>,
    bucket: String,
    run_id: RunId,
    settings: VerifierSettings,
}

impl Verifier {
    pub fn new(
        checker: Arc<dyn ExistenceChecker>,
        bucket: impl Into<String>,
        run_id: RunId,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            checker,
            bucket: bucket.into(),
            run_id,
            settings,
        }
    }

    /// Run until the copier has sent `Done` and the pending set is empty, then
    /// send `Done` on `events`.
    pub async fn run(self, mut notices: NoticeReceiver, events: VerifyEventSender) -> VerifierSummary {
        let span = info_span!("verifier", run_id = %self.run_id, bucket = %self.bucket);

        async {
            let mut pending = PendingSet::default();
            let mut copier_done = false;
            let mut summary = VerifierSummary::default();
            let progress = LogThrottle::new(PROGRESS_LOG_INTERVAL);
            let check_errors = LogThrottle::new(CHECK_ERROR_LOG_INTERVAL);

            loop {
                loop {
                    match notices.try_recv() {
                        Ok(msg) => accept(msg, &mut pending, &mut copier_done),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            mark_disconnected(&mut copier_done);
                            break;
                        }
                    }
                }

                if pending.is_empty() {
                    if copier_done {
                        break;
                    }
                    // Nothing to poll: wait for the copier instead of spinning.
                    match notices.recv().await {
                        Some(msg) => accept(msg, &mut pending, &mut copier_done),
                        None => mark_disconnected(&mut copier_done),
                    }
                    continue;
                }

                self.poll_pending(&mut pending, &events, &mut summary, &check_errors)
                    .await;

                if pending.is_empty() {
                    continue;
                }

                if progress.should_log() {
                    info!(
                        pending = pending.len(),
                        verified = summary.files_verified,
                        copier_done,
                        "Waiting for remote visibility"
                    );
                }

                sleep(self.settings.poll_interval).await;
            }

            info!(
                files_verified = summary.files_verified,
                files_timed_out = summary.files_timed_out,
                checks = summary.checks,
                check_errors = summary.check_errors,
                "Verification done"
            );
            let _ = events.send(StageMessage::Done);
            summary
        }
        .instrument(span)
        .await
    }

    /// Check every pending path once.
    async fn poll_pending(
        &self,
        pending: &mut PendingSet,
        events: &VerifyEventSender,
        summary: &mut VerifierSummary,
        error_throttle: &LogThrottle,
    ) {
        for path in pending.paths() {
            let key = self.run_id.object_key(&path);
            summary.checks += 1;

            let outcome = timeout(
                self.settings.check_timeout,
                self.checker.exists(&self.bucket, &key),
            )
            .await;

            match outcome {
                Ok(Ok(true)) => {
                    let verified_at = Utc::now();
                    if pending.remove(&path) {
                        summary.files_verified += 1;
                        debug!(file = %path, "File visible remotely");
                        let _ = events.send(StageMessage::Event(VerifyEvent::Verified {
                            path,
                            verified_at,
                        }));
                    }
                    continue;
                }
                Ok(Ok(false)) => pending.record_miss(&path),
                Ok(Err(e)) => {
                    summary.check_errors += 1;
                    if error_throttle.should_log() {
                        warn!(file = %path, error = %e, "Existence check failed, will retry");
                    }
                }
                Err(_) => {
                    summary.check_errors += 1;
                    if error_throttle.should_log() {
                        warn!(
                            file = %path,
                            timeout_ms = self.settings.check_timeout.as_millis() as u64,
                            "Existence check timed out, will retry"
                        );
                    }
                }
            }

            if let Some(limit) = self.settings.file_timeout {
                let waited = pending.pending_for(&path).unwrap_or_default();
                if waited >= limit {
                    let misses = pending.misses(&path);
                    if pending.remove(&path) {
                        summary.files_timed_out += 1;
                        warn!(
                            file = %path,
                            waited_secs = waited.as_secs(),
                            misses,
                            "File never became visible, giving up"
                        );
                        let _ = events.send(StageMessage::Event(VerifyEvent::TimedOut {
                            path,
                            gave_up_at: Utc::now(),
                        }));
                    }
                }
            }
        }
    }
}

fn accept(msg: StageMessage<String>, pending: &mut PendingSet, copier_done: &mut bool) {
    match msg {
        StageMessage::Event(path) => {
            if !pending.insert(path.clone()) {
                debug!(file = %path, "Duplicate verification notice ignored");
            }
        }
        StageMessage::Done => {
            debug!(pending = pending.len(), "Copier finished sending files");
            *copier_done = true;
        }
    }
}

fn mark_disconnected(copier_done: &mut bool) {
    if !*copier_done {
        error!("Copier channel closed without a completion marker, treating as done");
        *copier_done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::CheckError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Reports a key missing for its first `misses` checks, then visible.
    struct EventuallyVisible {
        misses: u32,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl EventuallyVisible {
        fn new(misses: u32) -> Self {
            Self {
                misses,
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls_for(&self, key: &str) -> u32 {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ExistenceChecker for EventuallyVisible {
        async fn exists(&self, _bucket: &str, key: &str) -> Result<bool, CheckError> {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(key.to_string()).or_default();
            *count += 1;
            Ok(*count > self.misses)
        }
    }

    /// Errors for the first `failures` checks, then visible.
    struct FlakyChecker {
        failures: u32,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ExistenceChecker for FlakyChecker {
        async fn exists(&self, _bucket: &str, key: &str) -> Result<bool, CheckError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures {
                return Err(CheckError::Remote {
                    key: key.to_string(),
                    status: Some(503),
                    message: "service unavailable".into(),
                });
            }
            Ok(true)
        }
    }

    struct NeverVisible;

    #[async_trait]
    impl ExistenceChecker for NeverVisible {
        async fn exists(&self, _bucket: &str, _key: &str) -> Result<bool, CheckError> {
            Ok(false)
        }
    }

    fn fast_settings() -> VerifierSettings {
        VerifierSettings {
            poll_interval: Duration::from_millis(5),
            check_timeout: Duration::from_secs(1),
            file_timeout: None,
        }
    }

    async fn collect(
        mut rx: mpsc::UnboundedReceiver<StageMessage<VerifyEvent>>,
    ) -> (Vec<VerifyEvent>, usize) {
        let mut events = Vec::new();
        let mut dones = 0;
        while let Some(msg) = rx.recv().await {
            match msg {
                StageMessage::Event(e) => events.push(e),
                StageMessage::Done => dones += 1,
            }
        }
        (events, dones)
    }

    #[test]
    fn test_pending_set_removes_exactly_once() {
        let mut set = PendingSet::default();
        assert!(set.insert("a".into()));
        assert!(!set.insert("a".into()));
        assert_eq!(set.len(), 1);
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_verified_after_negative_polls() {
        let run_id = RunId::new();
        let checker = Arc::new(EventuallyVisible::new(2));
        let verifier = Verifier::new(checker.clone(), "bucket", run_id, fast_settings());

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        notice_tx.send(StageMessage::Event("file.txt".into())).unwrap();
        notice_tx.send(StageMessage::Done).unwrap();

        let summary = verifier.run(notice_rx, event_tx).await;
        let (events, dones) = collect(event_rx).await;

        assert_eq!(dones, 1);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], VerifyEvent::Verified { path, .. } if path == "file.txt"));
        assert_eq!(checker.calls_for(&run_id.object_key("file.txt")), 3);
        assert_eq!(summary.files_verified, 1);
        assert_eq!(summary.checks, 3);
    }

    #[tokio::test]
    async fn test_waits_for_copier_done_even_when_set_empty() {
        let verifier = Verifier::new(
            Arc::new(EventuallyVisible::new(0)),
            "bucket",
            RunId::new(),
            fast_settings(),
        );
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(verifier.run(notice_rx, event_tx));

        notice_tx.send(StageMessage::Event("a".into())).unwrap();
        let first = event_rx.recv().await.unwrap();
        assert!(matches!(first, StageMessage::Event(VerifyEvent::Verified { .. })));

        // Set is empty now, but the copier has not finished.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        notice_tx.send(StageMessage::Event("b".into())).unwrap();
        notice_tx.send(StageMessage::Done).unwrap();

        let summary = handle.await.unwrap();
        assert_eq!(summary.files_verified, 2);
        let (rest, dones) = collect(event_rx).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(dones, 1);
    }

    #[tokio::test]
    async fn test_empty_run_terminates() {
        let verifier = Verifier::new(Arc::new(NeverVisible), "bucket", RunId::new(), fast_settings());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        notice_tx.send(StageMessage::Done).unwrap();

        let summary = verifier.run(notice_rx, event_tx).await;
        assert_eq!(summary, VerifierSummary::default());
        let (events, dones) = collect(event_rx).await;
        assert!(events.is_empty());
        assert_eq!(dones, 1);
    }

    #[tokio::test]
    async fn test_check_errors_are_retried_not_treated_as_missing() {
        let checker = Arc::new(FlakyChecker {
            failures: 3,
            calls: Mutex::new(0),
        });
        let verifier = Verifier::new(checker, "bucket", RunId::new(), fast_settings());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        notice_tx.send(StageMessage::Event("x".into())).unwrap();
        notice_tx.send(StageMessage::Done).unwrap();

        let summary = verifier.run(notice_rx, event_tx).await;
        assert_eq!(summary.check_errors, 3);
        assert_eq!(summary.files_verified, 1);

        let (events, _) = collect(event_rx).await;
        assert!(matches!(&events[..], [VerifyEvent::Verified { .. }]));
    }

    #[tokio::test]
    async fn test_file_timeout_gives_up() {
        let settings = VerifierSettings {
            file_timeout: Some(Duration::from_millis(40)),
            ..fast_settings()
        };
        let verifier = Verifier::new(Arc::new(NeverVisible), "bucket", RunId::new(), settings);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        notice_tx.send(StageMessage::Event("lost".into())).unwrap();
        notice_tx.send(StageMessage::Done).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), verifier.run(notice_rx, event_tx))
            .await
            .expect("verifier should give up");

        assert_eq!(summary.files_timed_out, 1);
        assert_eq!(summary.files_verified, 0);
        let (events, dones) = collect(event_rx).await;
        assert!(matches!(&events[..], [VerifyEvent::TimedOut { path, .. }] if path == "lost"));
        assert_eq!(dones, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_without_done_does_not_hang() {
        let verifier = Verifier::new(
            Arc::new(EventuallyVisible::new(1)),
            "bucket",
            RunId::new(),
            fast_settings(),
        );
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        notice_tx.send(StageMessage::Event("a".into())).unwrap();
        drop(notice_tx);

        let summary = tokio::time::timeout(Duration::from_secs(5), verifier.run(notice_rx, event_tx))
            .await
            .expect("verifier should finish");
        assert_eq!(summary.files_verified, 1);
        let (_, dones) = collect(event_rx).await;
        assert_eq!(dones, 1);
    }
}
