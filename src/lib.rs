//! Statement level code coverage for SQL Server modules.
//!
//! A run starts an Extended Events trace on the measured database, lets a
//! workload execute, reads back which statements started, and maps those
//! events onto statement spans cut from each procedure, function and
//! trigger definition. See [`engine::CodeCoverage`] for the entry point.

pub mod config;
pub mod correlate;
pub mod coverage;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod runner;
pub mod segment;
pub mod trace;
pub mod types;

pub use config::{ConnectionConfig, CoverageConfig, TraceScope};
pub use coverage::{CoverageResult, CoverageStats, ObjectCoverage};
pub use diagnostics::{Diagnostic, DiagnosticSink, Outcome, Severity, Stage};
pub use engine::{CodeCoverage, CodeCoverageBuilder};
pub use types::{ObjectKind, StatementSpan};
