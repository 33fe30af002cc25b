//! Alert destinations and reference resolution.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DestinationError {
    #[error("Field \"{0}\" of type str is required field")]
    MissingField(&'static str),

    #[error("destination configuration must be a map")]
    NotAMap,
}

/// A configured delivery channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub output_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_for_severity: Option<Vec<String>>,
    #[serde(default)]
    pub output_config: Map<String, Value>,
}

impl Destination {
    /// Build from an outputs-catalog entry. Only `outputId` and
    /// `displayName` are required; malformed optional fields are dropped.
    pub fn from_value(config: &Value) -> Result<Self, DestinationError> {
        let map = config.as_object().ok_or(DestinationError::NotAMap)?;
        let required = |field: &'static str| {
            map.get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(DestinationError::MissingField(field))
        };
        let optional_str = |field: &str| map.get(field).and_then(Value::as_str).map(str::to_string);
        let optional_list = |field: &str| {
            map.get(field).and_then(Value::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        };

        Ok(Self {
            output_id: required("outputId")?,
            display_name: required("displayName")?,
            output_type: optional_str("outputType"),
            created_by: optional_str("createdBy"),
            creation_time: map.get("creationTime").cloned(),
            last_modified_by: optional_str("lastModifiedBy"),
            last_modified_time: map.get("lastModifiedTime").cloned(),
            alert_types: optional_list("alertTypes"),
            default_for_severity: optional_list("defaultForSeverity"),
            output_config: map
                .get("outputConfig")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// References that could not be resolved, in request order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid Destinations: {0:?}")]
pub struct InvalidDestinations(pub Vec<String>);

/// Lookup tables from destination id and display name.
#[derive(Debug, Clone, Default)]
pub struct DestinationIndex {
    by_id: BTreeMap<String, Destination>,
    by_name: BTreeMap<String, String>,
}

impl DestinationIndex {
    /// Index the given destinations. A repeated display name maps to the
    /// destination seen last.
    pub fn new(destinations: impl IntoIterator<Item = Destination>) -> Self {
        let mut index = Self::default();
        for destination in destinations {
            if let Some(previous) = index
                .by_name
                .insert(destination.display_name.clone(), destination.output_id.clone())
            {
                if previous != destination.output_id {
                    warn!(
                        display_name = %destination.display_name,
                        previous = %previous,
                        output_id = %destination.output_id,
                        "duplicate destination display name, keeping the last one"
                    );
                }
            }
            index.by_id.insert(destination.output_id.clone(), destination);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Destination> {
        self.by_id.get(id)
    }

    pub fn id_for_name(&self, display_name: &str) -> Option<&str> {
        self.by_name.get(display_name).map(String::as_str)
    }

    /// Resolve references left to right: direct id, then display name.
    ///
    /// Unknown references and references resolving to an id already
    /// resolved are invalid; any invalid reference fails the whole list.
    pub fn resolve<S: AsRef<str>>(&self, references: &[S]) -> Result<Vec<String>, InvalidDestinations> {
        let mut resolved = Vec::with_capacity(references.len());
        let mut seen = HashSet::new();
        let mut invalid = Vec::new();

        for reference in references {
            let reference = reference.as_ref();
            let id = if self.by_id.contains_key(reference) {
                Some(reference)
            } else {
                self.id_for_name(reference)
            };
            match id {
                Some(id) if seen.insert(id.to_string()) => resolved.push(id.to_string()),
                _ => invalid.push(reference.to_string()),
            }
        }

        if invalid.is_empty() {
            Ok(resolved)
        } else {
            Err(InvalidDestinations(invalid))
        }
    }
}
