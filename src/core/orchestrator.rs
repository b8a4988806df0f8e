//! Wires the copy, verify and report stages together for one run.

use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::aggregator::ReportAggregator;
use crate::core::copier::{Copier, CopierSummary};
use crate::core::copy_engine::{CopyEngine, NativeCopyEngine};
use crate::core::remote::{ExistenceChecker, create_checker};
use crate::core::report::{Report, Summary};
use crate::core::verifier::{Verifier, VerifierSettings, VerifierSummary};

/// What to copy and where the copies should show up remotely.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bucket: String,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: Report,
    pub summary: Summary,
    pub copier: CopierSummary,
    /// `None` when verification was disabled
    pub verifier: Option<VerifierSummary>,
}

pub struct Orchestrator {
    ctx: AppContext,
    engine: Arc<dyn CopyEngine>,
    checker: Option<Arc<dyn ExistenceChecker>>,
}

impl Orchestrator {
    /// Production wiring: native copies and the configured remote checker.
    pub async fn new(ctx: AppContext) -> Result<Self> {
        let engine = Arc::new(NativeCopyEngine {
            sync_files: ctx.config.sync_files,
            preserve_timestamps: ctx.config.preserve_timestamps,
        });
        let checker = if ctx.config.verify {
            Some(create_checker(&ctx.config).await?)
        } else {
            None
        };
        Ok(Self {
            ctx,
            engine,
            checker,
        })
    }

    pub fn with_components(
        ctx: AppContext,
        engine: Arc<dyn CopyEngine>,
        checker: Option<Arc<dyn ExistenceChecker>>,
    ) -> Self {
        Self {
            ctx,
            engine,
            checker,
        }
    }

    /// Run the copy, verify and report stages to completion, then write the
    /// report to the configured output path.
    ///
    /// On failure the report file is removed if this run created it; an
    /// existing report from an earlier run is left as it was.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let output = &self.ctx.config.output;
        if self.checker.is_none() && self.ctx.config.verify {
            return Err(anyhow!("verification enabled but no existence checker"));
        }

        // Fail before copying anything if the report cannot be written later.
        let existed = tokio::fs::try_exists(output).await.unwrap_or(false);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(output)
            .await
            .with_context(|| format!("Cannot open report file {}", output.display()))?;

        let result = self.run_stages(request).await;
        if result.is_err() && !existed {
            if let Err(e) = tokio::fs::remove_file(output).await {
                warn!(path = %output.display(), error = %e, "Failed to remove empty report file");
            }
        }
        result
    }

    async fn run_stages(&self, request: RunRequest) -> Result<RunOutcome> {
        let config = &self.ctx.config;
        let run_id = self.ctx.run_id;
        let verify_enabled = config.verify;
        let checker = if verify_enabled {
            self.checker.clone()
        } else {
            None
        };

        info!(
            run_id = %run_id,
            source = %request.source.display(),
            destination = %request.destination.display(),
            bucket = %request.bucket,
            max_concurrent_copies = config.max_concurrent_copies,
            verify = verify_enabled,
            "Starting run"
        );

        let (copy_tx, copy_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = if verify_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (verify_tx, verify_rx) = if verify_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let aggregator = ReportAggregator::new(run_id, verify_enabled, self.ctx.started_at);
        let aggregator_handle = tokio::spawn(aggregator.run(copy_rx, verify_rx));

        let verifier_handle = match (checker, notice_rx, verify_tx) {
            (Some(checker), Some(notice_rx), Some(verify_tx)) => {
                let verifier = Verifier::new(
                    checker,
                    request.bucket.clone(),
                    run_id,
                    VerifierSettings::from(&**config),
                );
                Some(tokio::spawn(verifier.run(notice_rx, verify_tx)))
            }
            _ => None,
        };

        let copier = Copier::new(self.engine.clone(), run_id, config.max_concurrent_copies);
        let source = request.source.clone();
        let destination = request.destination.clone();
        let copier_handle =
            tokio::spawn(async move { copier.run(&source, &destination, notice_tx, copy_tx).await });

        let report = aggregator_handle.await.context("Report aggregator panicked")?;
        let copier_summary = copier_handle.await.context("Copier panicked")??;
        let verifier_summary = match verifier_handle {
            Some(handle) => Some(handle.await.context("Verifier panicked")?),
            None => None,
        };

        if report.negative_latencies > 0 {
            warn!(
                count = report.negative_latencies,
                "Some files were seen remotely before their copy completed"
            );
        }
        for (path, err) in report.failed_copies() {
            error!(file = %path, error = %err, "Copy failed");
        }

        report
            .write_csv(&config.output)
            .with_context(|| format!("Failed to write report to {}", config.output.display()))?;
        info!(path = %config.output.display(), "Report written");

        let summary = report.summary();
        Ok(RunOutcome {
            report,
            summary,
            copier: copier_summary,
            verifier: verifier_summary,
        })
    }
}
