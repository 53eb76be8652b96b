//! Grading core: runs untrusted submissions in a sandbox, compares their
//! output with hidden fixtures and decides how many points they earn.
//!
//! Nothing in this crate persists submissions; callers store what
//! [`service::GradingService`] hands back.

pub mod error;
pub mod evaluator;
pub mod executor;
pub mod languages;
pub mod ledger;
pub mod pool;
pub mod sandbox;
pub mod scoring;
pub mod service;

pub use error::{GradeError, LedgerError};
pub use executor::Grader;
pub use languages::LanguageConfigManager;
pub use ledger::{MemoryLedger, RedisLedger, SubmissionLedger};
pub use pool::GradingPool;
pub use sandbox::{ExecutionOutcome, Sandbox, SandboxBackend, SandboxSettings};
pub use scoring::ScoringPolicy;
pub use service::GradingService;
