//! Trace records and the JSON-lines trace codec.
//!
//! A trace is a sequence of definition records (clock, locations, regions)
//! followed by per-location event records in timestamp order, one JSON object
//! per line. The same shape, with a `counters` annotation added to events and
//! synthetic wait states interleaved, is what the writer emits.

use std::fmt;
use std::io::{BufRead, Write};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use casita_types::{AttributeList, FunctionKind, RecordKind, RegionId, StreamId, StreamKind};

// ── Records ─────────────────────────────────────────────────────

/// Static definition records, delivered before any event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Definition {
    ClockProperties {
        ticks_per_second: u64,
    },
    Location {
        id: StreamId,
        name: CompactString,
        kind: StreamKind,
        /// Analyzer rank that owns this location.
        rank: u32,
    },
    Region {
        id: RegionId,
        name: CompactString,
        role: FunctionKind,
    },
}

/// One event record of a location.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub location: StreamId,
    pub time: u64,
    pub kind: RecordKind,
    pub region: RegionId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: AttributeList,
}

/// One line of a trace file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Record {
    Definition(Definition),
    Event(TraceEvent),
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TraceError {
    Io(std::io::Error),
    Json { line: usize, message: String },
    OutOfOrder { time: u64, previous: u64 },
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Json { line, message } => write!(f, "line {line}: {message}"),
            Self::OutOfOrder { time, previous } => {
                write!(f, "annotated event at {time} after {previous}")
            }
        }
    }
}

impl std::error::Error for TraceError {}

impl From<std::io::Error> for TraceError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

// ── Reading ─────────────────────────────────────────────────────

/// Receiver of a trace's records, in file order.
pub trait TraceSink {
    fn definition(&mut self, definition: &Definition);
    fn event(&mut self, event: &TraceEvent);
}

/// Parse a JSON-lines trace. Blank lines are allowed and skipped.
pub fn read_records(reader: impl BufRead) -> Result<Vec<Record>, TraceError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|err| TraceError::Json {
            line: index + 1,
            message: err.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Feed parsed records to a sink, definitions and events alike.
pub fn deliver(records: &[Record], sink: &mut impl TraceSink) {
    for record in records {
        match record {
            Record::Definition(definition) => sink.definition(definition),
            Record::Event(event) => sink.event(event),
        }
    }
}

// ── Writing ─────────────────────────────────────────────────────

/// An event enriched with analysis counters; `synthetic` marks wait-state
/// records the analyzer inserted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnnotatedEvent {
    pub location: StreamId,
    pub time: u64,
    pub kind: RecordKind,
    pub region: RegionId,
    pub name: CompactString,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counters: Vec<(CompactString, u64)>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "snake_case")]
enum AnnotatedRecord<'a> {
    Definition(&'a Definition),
    Event(&'a AnnotatedEvent),
}

/// Write an annotated trace: definitions first, then events, which must be in
/// nondecreasing timestamp order.
pub fn write_annotated(
    mut writer: impl Write,
    definitions: &[Definition],
    events: &[AnnotatedEvent],
) -> Result<(), TraceError> {
    for definition in definitions {
        serde_json::to_writer(&mut writer, &AnnotatedRecord::Definition(definition))
            .map_err(io_from_json)?;
        writer.write_all(b"\n")?;
    }
    let mut previous = 0u64;
    for event in events {
        if event.time < previous {
            return Err(TraceError::OutOfOrder {
                time: event.time,
                previous,
            });
        }
        previous = event.time;
        serde_json::to_writer(&mut writer, &AnnotatedRecord::Event(event))
            .map_err(io_from_json)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn io_from_json(err: serde_json::Error) -> TraceError {
    TraceError::Io(std::io::Error::other(err))
}
