//! Maps trace events back onto statement spans.

use crate::diagnostics::{Diagnostic, Outcome, Stage};
use crate::types::{SourceObject, StatementSpan, TraceEvent};

use log::debug;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// One object's source together with the spans cut from exactly that text.
#[derive(Debug, Clone)]
pub struct SegmentedObject {
    pub source: SourceObject,
    pub spans: Vec<StatementSpan>,
    pub text_len: usize,
}

impl SegmentedObject {
    pub fn new(source: SourceObject, spans: Vec<StatementSpan>) -> Self {
        let text_len = source.utf16_len();
        SegmentedObject {
            source,
            spans,
            text_len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmapped {
    NegativeOffset,
    BeforeFirstStatement,
    PastEndOfSource,
}

impl fmt::Display for Unmapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Unmapped::NegativeOffset => "negative offset",
                Unmapped::BeforeFirstStatement => "offset precedes the first statement",
                Unmapped::PastEndOfSource => "offset lies past the end of the source",
            }
        )
    }
}

/// What happened to a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    Hit { ordinal: usize },
    /// The event's object was never segmented (system, excluded, dynamic SQL).
    Discarded,
    Unmapped(Unmapped),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationSummary {
    pub events: usize,
    pub matched: usize,
    pub discarded: usize,
    pub unmapped: usize,
}

pub struct EventCorrelator {
    objects: Vec<SegmentedObject>,
    by_id: HashMap<i64, usize>,
    summary: CorrelationSummary,
    warned: HashSet<(i64, i64)>,
    diagnostics: Vec<Diagnostic>,
}

impl EventCorrelator {
    /// Only objects that produced spans can receive events.
    pub fn new(objects: Vec<SegmentedObject>) -> Self {
        let by_id = objects
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.spans.is_empty())
            .map(|(i, o)| (o.source.object_id, i))
            .collect();
        EventCorrelator {
            objects,
            by_id,
            summary: CorrelationSummary::default(),
            warned: HashSet::new(),
            diagnostics: vec![],
        }
    }

    pub fn apply(&mut self, event: &TraceEvent) -> Mapping {
        self.summary.events += 1;
        let Some(&index) = self.by_id.get(&event.object_id) else {
            self.summary.discarded += 1;
            return Mapping::Discarded;
        };
        let object = &mut self.objects[index];

        match locate(object, event) {
            Ok(i) => {
                let span = &mut object.spans[i];
                span.executed = true;
                self.summary.matched += 1;
                Mapping::Hit {
                    ordinal: span.ordinal,
                }
            }
            Err(reason) => {
                self.summary.unmapped += 1;
                if self
                    .warned
                    .insert((event.object_id, event.statement_start_offset))
                {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            Stage::Correlation,
                            format!(
                                "event at offset {} not mapped: {}",
                                event.statement_start_offset, reason
                            ),
                        )
                        .for_object(object.source.name.clone()),
                    );
                }
                Mapping::Unmapped(reason)
            }
        }
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a TraceEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn objects(&self) -> &[SegmentedObject] {
        &self.objects
    }

    pub fn summary(&self) -> CorrelationSummary {
        self.summary
    }

    pub fn finish(self) -> (Vec<SegmentedObject>, Outcome<CorrelationSummary>) {
        debug!(
            "Correlated {} events: {} matched, {} discarded, {} unmapped",
            self.summary.events, self.summary.matched, self.summary.discarded, self.summary.unmapped
        );
        (
            self.objects,
            Outcome::with(self.summary, self.diagnostics),
        )
    }
}

/// Index of the span the event belongs to. `spans` is ordered and disjoint.
fn locate(object: &SegmentedObject, event: &TraceEvent) -> Result<usize, Unmapped> {
    let offset = usize::try_from(event.statement_start_offset).map_err(|_| Unmapped::NegativeOffset)?;
    if offset >= object.text_len {
        return Err(Unmapped::PastEndOfSource);
    }
    let spans = &object.spans;
    // first span starting after the offset
    let next = spans.partition_point(|s| s.start_offset <= offset);
    if next == 0 {
        return Err(Unmapped::BeforeFirstStatement);
    }
    let preceding = next - 1;
    if spans[preceding].contains(offset) {
        return Ok(preceding);
    }
    // In a gap between spans. If the reported statement runs into the next
    // span, the server's start offset included leading text we absorbed.
    match (spans.get(next), event.statement_end_offset) {
        (Some(following), Some(end)) if end > following.start_offset as i64 => Ok(next),
        _ => Ok(preceding),
    }
}
