//! Buffering of alert candidates into match groups and writing them out.
//!
//! Candidates are grouped by rule, log type, dedup key and error flag. When
//! the estimated buffered size passes the threshold the largest group is
//! written to the sink; [`MatchBuffer::flush`] writes everything. A group
//! stays buffered until its write succeeds.

mod alert;


use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::engine::EngineResult;

pub use self::alert::{AlertInfo, AlertMerger, AlertRecord};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const KEY_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutputError>;

/// Candidates with equal keys end up in the same output file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputGroupingKey {
    pub rule_id: String,
    pub log_type: String,
    pub dedup: String,
    pub is_rule_error: bool,
}

impl OutputGroupingKey {
    pub fn of(result: &EngineResult) -> Self {
        Self {
            rule_id: result.rule_id.clone(),
            log_type: result.log_type.clone(),
            dedup: result.dedup.clone(),
            is_rule_error: result.is_error(),
        }
    }

    /// Table name for the log type: lower case, dots replaced by underscores.
    pub fn table_name(&self) -> String {
        self.log_type.to_lowercase().replace('.', "_")
    }

    /// Stable SHA-256 of `rule_id:dedup`, with `:error` appended for rule errors.
    pub fn alert_group(&self) -> String {
        let mut key = format!("{}:{}", self.rule_id, self.dedup);
        if self.is_rule_error {
            key.push_str(":error");
        }
        let digest = Sha256::digest(key.as_bytes());
        format!("{digest:x}")
    }
}

/// Buffered candidates sharing one grouping key.
#[derive(Debug, Clone)]
pub struct MatchGroup {
    pub key: OutputGroupingKey,
    pub alert_group: String,
    pub matches: Vec<EngineResult>,
    pub size_in_bytes: usize,
}

impl MatchGroup {
    fn new(key: OutputGroupingKey) -> Self {
        Self {
            alert_group: key.alert_group(),
            key,
            matches: Vec::new(),
            size_in_bytes: 0,
        }
    }

    /// First candidate seen. Version, dedup period and generated fields of
    /// the group are taken from it.
    pub fn first(&self) -> Option<&EngineResult> {
        self.matches.first()
    }

    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    pub fn dedup_period_mins(&self) -> u32 {
        self.first().map_or(0, |r| r.dedup_period_mins)
    }

    /// Stored form of one candidate: the event with the common `p_` fields
    /// merged in. Event keys win over common fields.
    pub fn serialize_event(&self, result: &EngineResult, alert: &AlertInfo) -> Value {
        let mut fields = Map::new();
        fields.insert("p_rule_id".into(), json!(result.rule_id));
        fields.insert("p_alert_id".into(), json!(alert.alert_id));
        fields.insert("p_alert_group".into(), json!(self.alert_group));
        fields.insert("p_rule_tags".into(), json!(result.rule_tags));
        fields.insert("p_rule_reports".into(), json!(result.rule_reports));
        fields.insert(
            "p_alert_creation_time".into(),
            json!(alert.creation_time.format(DATE_FORMAT).to_string()),
        );
        fields.insert(
            "p_alert_update_time".into(),
            json!(alert.update_time.format(DATE_FORMAT).to_string()),
        );
        fields.insert("p_rule_error".into(), json!(result.error_message));
        fields.insert("p_alert_context".into(), json!(result.alert_context));
        if let Value::Object(event) = &result.event {
            for (k, v) in event {
                fields.insert(k.clone(), v.clone());
            }
        }
        Value::Object(fields)
    }
}

/// Destination for flushed match groups. `alert.update_time` is the time of
/// the write.
pub trait MatchSink {
    fn write_group(&mut self, group: &MatchGroup, alert: &AlertInfo) -> Result<()>;
}

/// Groups candidates and spills the largest group past a size threshold.
#[derive(Debug)]
pub struct MatchBuffer {
    groups: HashMap<OutputGroupingKey, MatchGroup>,
    bytes_in_memory: usize,
    max_bytes: usize,
    total_matches: usize,
    merger: AlertMerger,
}

impl MatchBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            groups: HashMap::new(),
            bytes_in_memory: 0,
            max_bytes,
            total_matches: 0,
            merger: AlertMerger::new(),
        }
    }

    /// Estimated size of the buffered candidates.
    pub fn bytes_in_memory(&self) -> usize {
        self.bytes_in_memory
    }

    /// Buffered candidates.
    pub fn total_matches(&self) -> usize {
        self.total_matches
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn alerts(&self) -> &AlertMerger {
        &self.merger
    }

    /// Buffer `result`, writing the largest group to `sink` when the
    /// threshold is exceeded.
    pub fn add(&mut self, result: EngineResult, sink: &mut dyn MatchSink) -> Result<()> {
        let size = estimate_size(&result);
        let key = OutputGroupingKey::of(&result);
        let group = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| MatchGroup::new(key));
        group.matches.push(result);
        group.size_in_bytes += size;
        self.bytes_in_memory += size;
        self.total_matches += 1;

        if self.bytes_in_memory > self.max_bytes {
            debug!(bytes = self.bytes_in_memory, max = self.max_bytes, "match buffer reached size threshold");
            let largest = self
                .groups
                .iter()
                .max_by_key(|(_, g)| g.size_in_bytes)
                .map(|(k, _)| k.clone());
            if let Some(key) = largest {
                self.write(&key, sink, Utc::now())?;
            }
        }
        Ok(())
    }

    /// Write every buffered group. On a failed write the unwritten groups
    /// stay buffered.
    pub fn flush(&mut self, sink: &mut dyn MatchSink) -> Result<()> {
        let now = Utc::now();
        let mut keys: Vec<_> = self.groups.keys().cloned().collect();
        keys.sort_by(|a, b| {
            (&a.rule_id, &a.dedup, a.is_rule_error, &a.log_type)
                .cmp(&(&b.rule_id, &b.dedup, b.is_rule_error, &b.log_type))
        });
        let (groups, matches) = (keys.len(), self.total_matches);
        for key in &keys {
            self.write(key, sink, now)?;
        }
        info!(groups, matches, "match buffer flushed");
        Ok(())
    }

    /// Write one group and drop it from the buffer once the sink accepted it.
    fn write(&mut self, key: &OutputGroupingKey, sink: &mut dyn MatchSink, now: DateTime<Utc>) -> Result<()> {
        let Some(group) = self.groups.get(key) else {
            return Ok(());
        };
        let record = self.merger.next(group, now);
        sink.write_group(group, &record.info())?;
        self.merger.commit(group, record);

        if let Some(group) = self.groups.remove(key) {
            self.bytes_in_memory -= group.size_in_bytes;
            self.total_matches -= group.match_count();
        }
        Ok(())
    }
}

/// Rough in-memory footprint of a candidate.
fn estimate_size(result: &EngineResult) -> usize {
    let optional = [
        &result.title,
        &result.description,
        &result.reference,
        &result.runbook,
        &result.alert_context,
        &result.error_message,
    ]
    .iter()
    .map(|field| field.as_ref().map_or(0, String::len))
    .sum::<usize>();
    std::mem::size_of::<EngineResult>()
        + result.event.to_string().len()
        + result.rule_id.len()
        + result.dedup.len()
        + optional
}

/// Writes each group as JSON lines under
/// `<dir>/<rules|rule_errors>/<table>/rule_id=<id>/<timestamp>-<n>.jsonl`.
#[derive(Debug)]
pub struct JsonLinesSink {
    dir: PathBuf,
    files_written: usize,
}

impl JsonLinesSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files_written: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files_written(&self) -> usize {
        self.files_written
    }

    fn path_for(&self, group: &MatchGroup, written_at: DateTime<Utc>) -> PathBuf {
        let kind = if group.key.is_rule_error { "rule_errors" } else { "rules" };
        self.dir
            .join(kind)
            .join(group.key.table_name())
            .join(format!("rule_id={}", group.key.rule_id))
            .join(format!("{}-{}.jsonl", written_at.format(KEY_DATE_FORMAT), self.files_written))
    }
}

impl MatchSink for JsonLinesSink {
    fn write_group(&mut self, group: &MatchGroup, alert: &AlertInfo) -> Result<()> {
        let path = self.path_for(group, alert.update_time);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = std::io::BufWriter::new(fs::File::create(&path)?);
        write_lines(&mut file, group, alert)?;
        file.flush()?;
        self.files_written += 1;
        info!(
            rule_id = %group.key.rule_id,
            matches = group.match_count(),
            path = %path.display(),
            "wrote match group"
        );
        Ok(())
    }
}

/// Writes every group as JSON lines to one writer, such as stdout.
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MatchSink for WriterSink<W> {
    fn write_group(&mut self, group: &MatchGroup, alert: &AlertInfo) -> Result<()> {
        write_lines(&mut self.writer, group, alert)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn write_lines(writer: &mut dyn Write, group: &MatchGroup, alert: &AlertInfo) -> Result<()> {
    for result in &group.matches {
        serde_json::to_writer(&mut *writer, &group.serialize_event(result, alert))?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}
