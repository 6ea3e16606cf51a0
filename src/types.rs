use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Procedure,
    Function,
    Trigger,
}

impl ObjectKind {
    /// Maps a `sys.objects.type` code onto the kinds we measure.
    pub fn from_type_code(code: &str) -> Option<Self> {
        match code.trim() {
            "P" => Some(ObjectKind::Procedure),
            "FN" | "IF" | "TF" => Some(ObjectKind::Function),
            "TR" => Some(ObjectKind::Trigger),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ObjectKind::Procedure => "procedure",
                ObjectKind::Function => "function",
                ObjectKind::Trigger => "trigger",
            }
        )
    }
}

/// A module as listed by the gateway, before its text has been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_id: i64,
    /// Schema qualified, e.g. `dbo.Proc1`
    pub name: String,
    pub kind: ObjectKind,
}

pub(crate) fn bare_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObject {
    pub object_id: i64,
    pub name: String,
    pub kind: ObjectKind,
    pub text: String,
}

impl SourceObject {
    pub fn new(object: ObjectRef, text: String) -> Self {
        SourceObject {
            object_id: object.object_id,
            name: object.name,
            kind: object.kind,
            text,
        }
    }

    /// Length of the text in UTF-16 code units, the unit every offset uses.
    pub fn utf16_len(&self) -> usize {
        self.text.encode_utf16().count()
    }
}

/// One measurable statement. Offsets are UTF-16 code units into the fetched
/// definition, `[start_offset, end_offset)`; lines are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementSpan {
    pub ordinal: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub start_line: u32,
    pub end_line: u32,
    pub executed: bool,
}

impl StatementSpan {
    pub fn contains(&self, offset: usize) -> bool {
        self.start_offset <= offset && offset < self.end_offset
    }
}

/// Event row as the server hands it back. Offsets are byte offsets into the
/// `nvarchar` definition, `offset_end == -1` marks "until end of module".
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawEvent {
    pub object_id: i64,
    pub offset: i64,
    #[serde(default)]
    pub offset_end: Option<i64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub object_id: i64,
    /// UTF-16 code units; may be negative when the server reported garbage
    pub statement_start_offset: i64,
    pub statement_end_offset: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    pub fn from_raw(raw: &RawEvent) -> Result<Self, chrono::ParseError> {
        let timestamp = DateTime::parse_from_rfc3339(raw.timestamp.trim())?.with_timezone(&Utc);
        Ok(TraceEvent {
            object_id: raw.object_id,
            statement_start_offset: byte_to_utf16(raw.offset),
            statement_end_offset: raw.offset_end.filter(|o| *o >= 0).map(byte_to_utf16),
            timestamp,
        })
    }
}

fn byte_to_utf16(offset: i64) -> i64 {
    if offset < 0 {
        offset
    } else {
        offset / 2
    }
}
