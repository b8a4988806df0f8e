pub mod aggregator;
pub mod copier;
pub mod copy_engine;
pub mod models;
pub mod orchestrator;
pub mod remote;
pub mod report;
pub mod verifier;

pub use aggregator::{AggregatorState, ReportAggregator};
pub use copier::{Copier, CopierSummary};
pub use copy_engine::{CopyEngine, CopyError, NativeCopyEngine};
pub use models::{CopyEvent, FileRecord, RunId, StageMessage, VerifyEvent};
pub use orchestrator::{Orchestrator, RunOutcome, RunRequest};
pub use remote::{CheckError, ExistenceChecker, LocalMirrorChecker, S3Checker, create_checker};
pub use report::{ParsedReport, Report, ReportRow, Summary, read_report};
pub use verifier::{PendingSet, Verifier, VerifierSettings, VerifierSummary};
