use crate::correlate::{CorrelationSummary, SegmentedObject};
use crate::diagnostics::Diagnostic;
use crate::types::{ObjectKind, StatementSpan};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CoverageStats {
    pub hits: usize,
    pub total: usize,
    pub percentage: f64,
}

impl CoverageStats {
    pub fn new(hits: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        };
        CoverageStats {
            hits,
            total,
            percentage,
        }
    }

    fn of(spans: &[StatementSpan]) -> Self {
        Self::new(spans.iter().filter(|s| s.executed).count(), spans.len())
    }
}

impl fmt::Display for CoverageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({:.1}%)", self.hits, self.total, self.percentage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectCoverage {
    pub object_id: i64,
    pub name: String,
    pub kind: ObjectKind,
    pub spans: Vec<StatementSpan>,
    pub stats: CoverageStats,
}

impl ObjectCoverage {
    pub fn uncovered(&self) -> impl Iterator<Item = &StatementSpan> {
        self.spans.iter().filter(|s| !s.executed)
    }
}

/// Outcome of one coverage run. Built once and never modified; the engine
/// shares it behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageResult {
    pub database: String,
    /// Keyed by schema qualified name
    pub objects: BTreeMap<String, ObjectCoverage>,
    pub overall: CoverageStats,
    pub correlation: CorrelationSummary,
    pub diagnostics: Vec<Diagnostic>,
}

impl CoverageResult {
    pub fn empty(database: impl Into<String>) -> Self {
        CoverageResult {
            database: database.into(),
            ..CoverageResult::default()
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }

    /// Looks up by qualified name, falling back to a unique bare-name match.
    pub fn object(&self, name: &str) -> Option<&ObjectCoverage> {
        if let Some(found) = self.objects.get(name) {
            return Some(found);
        }
        let mut matches = self
            .objects
            .values()
            .filter(|o| crate::types::bare_name(&o.name).eq_ignore_ascii_case(name));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}

/// Reduces correlated objects to the final result. Objects without spans are
/// listed with 0/0 but left out of the overall figures.
pub fn aggregate(
    database: impl Into<String>,
    objects: Vec<SegmentedObject>,
    correlation: CorrelationSummary,
    diagnostics: Vec<Diagnostic>,
) -> CoverageResult {
    let mut hits = 0;
    let mut total = 0;
    let objects: BTreeMap<String, ObjectCoverage> = objects
        .into_iter()
        .map(|o| {
            let stats = CoverageStats::of(&o.spans);
            hits += stats.hits;
            total += stats.total;
            (
                o.source.name.clone(),
                ObjectCoverage {
                    object_id: o.source.object_id,
                    name: o.source.name,
                    kind: o.source.kind,
                    spans: o.spans,
                    stats,
                },
            )
        })
        .collect();

    CoverageResult {
        database: database.into(),
        objects,
        overall: CoverageStats::new(hits, total),
        correlation,
        diagnostics,
    }
}
