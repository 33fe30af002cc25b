//! In-memory alert merging.
//!
//! Each alert group keeps one open alert. Groups written within the dedup
//! period of the alert's creation are merged into it; once the period has
//! passed the next write opens a new alert with a fresh id.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::MatchGroup;

/// Alert fields stamped on every written event of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertInfo {
    pub alert_id: String,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// State of the open alert of one alert group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRecord {
    pub rule_id: String,
    pub rule_version: String,
    pub dedup: String,
    pub is_rule_error: bool,
    /// Alerts opened for this group so far, starting at 1.
    pub alert_count: u64,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub event_count: usize,
    pub log_types: BTreeSet<String>,
}

impl AlertRecord {
    /// SHA-256 of `rule_id:alert_count:dedup`, with `:error` appended for
    /// rule errors.
    pub fn alert_id(&self) -> String {
        let mut key = format!("{}:{}:{}", self.rule_id, self.alert_count, self.dedup);
        if self.is_rule_error {
            key.push_str(":error");
        }
        let digest = Sha256::digest(key.as_bytes());
        format!("{digest:x}")
    }

    pub fn info(&self) -> AlertInfo {
        AlertInfo {
            alert_id: self.alert_id(),
            creation_time: self.creation_time,
            update_time: self.update_time,
        }
    }
}

/// Open alerts keyed by alert group.
#[derive(Debug, Default)]
pub struct AlertMerger {
    alerts: HashMap<String, AlertRecord>,
}

impl AlertMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, alert_group: &str) -> Option<&AlertRecord> {
        self.alerts.get(alert_group)
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Merge `group` at `now` and return the alert it belongs to.
    pub fn merge(&mut self, group: &MatchGroup, now: DateTime<Utc>) -> AlertInfo {
        let record = self.next(group, now);
        let info = record.info();
        self.commit(group, record);
        info
    }

    /// State of the group's alert after writing `group` at `now`, without
    /// recording it.
    pub(crate) fn next(&self, group: &MatchGroup, now: DateTime<Utc>) -> AlertRecord {
        let period = Duration::minutes(i64::from(group.dedup_period_mins()));
        match self.alerts.get(&group.alert_group) {
            Some(open) if open.creation_time >= now - period => {
                let mut merged = open.clone();
                merged.update_time = now;
                merged.event_count += group.match_count();
                merged.log_types.insert(group.key.log_type.clone());
                merged
            }
            previous => AlertRecord {
                rule_id: group.key.rule_id.clone(),
                rule_version: group.first().map(|r| r.rule_version.clone()).unwrap_or_default(),
                dedup: group.key.dedup.clone(),
                is_rule_error: group.key.is_rule_error,
                alert_count: previous.map_or(1, |p| p.alert_count + 1),
                creation_time: now,
                update_time: now,
                event_count: group.match_count(),
                log_types: BTreeSet::from([group.key.log_type.clone()]),
            },
        }
    }

    pub(crate) fn commit(&mut self, group: &MatchGroup, record: AlertRecord) {
        debug!(
            rule_id = %record.rule_id,
            alert_count = record.alert_count,
            events = record.event_count,
            "alert updated"
        );
        self.alerts.insert(group.alert_group.clone(), record);
    }
}
