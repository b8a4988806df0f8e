//! Report stage: joins the copy and verify event streams into one record per
//! file and decides when the run is over.

use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::models::{CopyEvent, FileRecord, RunId, StageMessage, VerifyEvent};
use crate::core::report::Report;

pub type CopyEventReceiver = mpsc::UnboundedReceiver<StageMessage<CopyEvent>>;
pub type VerifyEventReceiver = mpsc::UnboundedReceiver<StageMessage<VerifyEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// At least one stage has not sent `Done` yet
    Waiting,
    Done,
}

enum Incoming {
    Copy(Option<StageMessage<CopyEvent>>),
    Verify(Option<StageMessage<VerifyEvent>>),
}

pub struct ReportAggregator {
    run_id: RunId,
    verify_enabled: bool,
    started_at: Instant,
    records: BTreeMap<String, FileRecord>,
    copy_done: bool,
    verify_done: bool,
}

impl ReportAggregator {
    /// With verification disabled the verify side starts out complete.
    pub fn new(run_id: RunId, verify_enabled: bool, started_at: Instant) -> Self {
        Self {
            run_id,
            verify_enabled,
            started_at,
            records: BTreeMap::new(),
            copy_done: false,
            verify_done: !verify_enabled,
        }
    }

    pub fn state(&self) -> AggregatorState {
        if self.copy_done && self.verify_done {
            AggregatorState::Done
        } else {
            AggregatorState::Waiting
        }
    }

    pub fn handle_copy(&mut self, msg: StageMessage<CopyEvent>) {
        match msg {
            StageMessage::Event(event) => {
                self.records
                    .entry(event.path().to_string())
                    .or_default()
                    .apply_copy(&event);
            }
            StageMessage::Done => {
                info!(files = self.records.len(), "Upload DONE");
                self.copy_done = true;
            }
        }
    }

    pub fn handle_verify(&mut self, msg: StageMessage<VerifyEvent>) {
        match msg {
            StageMessage::Event(event) => {
                self.records
                    .entry(event.path().to_string())
                    .or_default()
                    .apply_verify(&event);
            }
            StageMessage::Done => {
                info!("Verify DONE");
                self.verify_done = true;
            }
        }
    }

    /// Drain both streams until each stage has finished, then build the report.
    ///
    /// `verified` is ignored when verification is disabled.
    pub async fn run(
        mut self,
        mut copied: CopyEventReceiver,
        verified: Option<VerifyEventReceiver>,
    ) -> Report {
        let span = info_span!("aggregator", run_id = %self.run_id);

        async {
            let mut verified = if self.verify_enabled { verified } else { None };
            if verified.is_none() && !self.verify_done {
                warn!("Verification enabled without a verify channel, not waiting for it");
                self.verify_done = true;
            }

            while self.state() == AggregatorState::Waiting {
                let incoming = tokio::select! {
                    msg = copied.recv(), if !self.copy_done => Incoming::Copy(msg),
                    msg = recv_verified(&mut verified), if !self.verify_done => Incoming::Verify(msg),
                    else => break,
                };

                match incoming {
                    Incoming::Copy(Some(msg)) => self.handle_copy(msg),
                    Incoming::Copy(None) => {
                        warn!("Copy channel closed without a completion marker");
                        self.copy_done = true;
                    }
                    Incoming::Verify(Some(msg)) => self.handle_verify(msg),
                    Incoming::Verify(None) => {
                        warn!("Verify channel closed without a completion marker");
                        self.verify_done = true;
                    }
                }
            }

            self.finish()
        }
        .instrument(span)
        .await
    }

    /// Compute latencies and totals. Called once both stages are done.
    pub fn finish(mut self) -> Report {
        let mut total_bytes = 0u64;
        let mut negative_latencies = 0;

        for (path, record) in self.records.iter_mut() {
            if let Some(latency) = record.compute_latency() {
                if latency < 0.0 {
                    negative_latencies += 1;
                    warn!(file = %path, latency_ms = latency, "Negative latency: verified before copy completed");
                }
            }
            if record.is_copied() {
                total_bytes += record.size;
            }
        }

        let elapsed = self.started_at.elapsed();
        debug!(
            records = self.records.len(),
            total_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Aggregation finished"
        );

        Report {
            run_id: self.run_id,
            verify_enabled: self.verify_enabled,
            records: self.records,
            total_bytes,
            elapsed,
            negative_latencies,
        }
    }
}

async fn recv_verified(rx: &mut Option<VerifyEventReceiver>) -> Option<StageMessage<VerifyEvent>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn copied(path: &str, size: u64) -> StageMessage<CopyEvent> {
        StageMessage::Event(CopyEvent::Copied {
            path: path.into(),
            size,
            copied_at: Utc::now(),
        })
    }

    fn verified(path: &str) -> StageMessage<VerifyEvent> {
        StageMessage::Event(VerifyEvent::Verified {
            path: path.into(),
            verified_at: Utc::now(),
        })
    }

    #[test]
    fn test_state_machine_requires_both_flags() {
        let mut agg = ReportAggregator::new(RunId::new(), true, Instant::now());
        assert_eq!(agg.state(), AggregatorState::Waiting);

        agg.handle_verify(StageMessage::Done);
        assert_eq!(agg.state(), AggregatorState::Waiting);

        agg.handle_copy(StageMessage::Done);
        assert_eq!(agg.state(), AggregatorState::Done);
    }

    #[test]
    fn test_verify_disabled_starts_with_verify_done() {
        let mut agg = ReportAggregator::new(RunId::new(), false, Instant::now());
        agg.handle_copy(StageMessage::Done);
        assert_eq!(agg.state(), AggregatorState::Done);
    }

    #[test]
    fn test_verified_before_copied_merges_into_one_record() {
        let mut agg = ReportAggregator::new(RunId::new(), true, Instant::now());
        let copy_time = Utc::now();

        agg.handle_verify(StageMessage::Event(VerifyEvent::Verified {
            path: "a".into(),
            verified_at: copy_time + ChronoDuration::milliseconds(250),
        }));
        agg.handle_copy(StageMessage::Event(CopyEvent::Copied {
            path: "a".into(),
            size: 42,
            copied_at: copy_time,
        }));

        let report = agg.finish();
        assert_eq!(report.records.len(), 1);
        let record = &report.records["a"];
        assert_eq!(record.size, 42);
        assert_eq!(record.latency_ms, Some(250.0));
        assert_eq!(report.total_bytes, 42);
        assert_eq!(report.negative_latencies, 0);
    }

    #[test]
    fn test_negative_latency_is_flagged() {
        let mut agg = ReportAggregator::new(RunId::new(), true, Instant::now());
        let now = Utc::now();
        agg.handle_copy(StageMessage::Event(CopyEvent::Copied {
            path: "a".into(),
            size: 1,
            copied_at: now,
        }));
        agg.handle_verify(StageMessage::Event(VerifyEvent::Verified {
            path: "a".into(),
            verified_at: now - ChronoDuration::milliseconds(5),
        }));

        let report = agg.finish();
        assert_eq!(report.negative_latencies, 1);
    }

    #[test]
    fn test_total_bytes_ignores_failed_copies() {
        let mut agg = ReportAggregator::new(RunId::new(), false, Instant::now());
        agg.handle_copy(copied("a", 10));
        agg.handle_copy(StageMessage::Event(CopyEvent::Failed {
            path: "b".into(),
            error: "denied".into(),
        }));

        let report = agg.finish();
        assert_eq!(report.total_bytes, 10);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.file_count(), 1);
    }

    #[tokio::test]
    async fn test_run_tolerates_interleaved_streams() {
        let agg = ReportAggregator::new(RunId::new(), true, Instant::now());
        let (copy_tx, copy_rx) = mpsc::unbounded_channel();
        let (verify_tx, verify_rx) = mpsc::unbounded_channel();

        // The verify stream finishes before any copy event arrives.
        verify_tx.send(verified("b")).unwrap();
        verify_tx.send(verified("a")).unwrap();
        verify_tx.send(StageMessage::Done).unwrap();

        let handle = tokio::spawn(agg.run(copy_rx, Some(verify_rx)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        copy_tx.send(copied("a", 10)).unwrap();
        copy_tx.send(copied("b", 20)).unwrap();
        copy_tx.send(StageMessage::Done).unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.total_bytes, 30);
        assert!(report.records.values().all(|r| r.verified_at.is_some()));
    }

    #[tokio::test]
    async fn test_run_without_verification_ignores_verify_channel() {
        let agg = ReportAggregator::new(RunId::new(), false, Instant::now());
        let (copy_tx, copy_rx) = mpsc::unbounded_channel();
        let (_verify_tx, verify_rx) = mpsc::unbounded_channel::<StageMessage<VerifyEvent>>();

        copy_tx.send(copied("x", 5)).unwrap();
        copy_tx.send(StageMessage::Done).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), agg.run(copy_rx, Some(verify_rx)))
            .await
            .expect("aggregator should not wait on the verify channel");
        assert_eq!(report.total_bytes, 5);
        assert!(report.records["x"].latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_run_finishes_when_senders_drop() {
        let agg = ReportAggregator::new(RunId::new(), true, Instant::now());
        let (copy_tx, copy_rx) = mpsc::unbounded_channel();
        let (verify_tx, verify_rx) = mpsc::unbounded_channel();
        copy_tx.send(copied("a", 1)).unwrap();
        drop(copy_tx);
        drop(verify_tx);

        let report = tokio::time::timeout(Duration::from_secs(5), agg.run(copy_rx, Some(verify_rx)))
            .await
            .expect("aggregator should not hang");
        assert_eq!(report.total_bytes, 1);
    }
}
