//! # Partition Projection Compiler
//!
//! Derives the partition-projection parameters and table schema for a
//! partitioned dataset whose storage layout is fixed and known up front, so
//! partitions are computed at query time instead of discovered by a crawler.
//!
//! Every partition key carries a [`ProjectionRule`]:
//!
//! - `enum`: an explicit, non-empty value set, optionally checked against a
//!   known vocabulary
//! - `integer`: an inclusive `[min, max]` range, optionally zero-padded to a
//!   fixed digit width that must be wide enough for `max`
//!
//! The storage location template must contain exactly one `${key}`
//! placeholder per partition key, in declaration order.
//!
//! Emitted parameters (bit-exact):
//!
//! ```text
//! projection.enabled          = true
//! projection.<k>.type         = enum | integer
//! projection.<k>.values       = v1,v2,...
//! projection.<k>.range        = <min>,<max>
//! projection.<k>.digits       = <n>
//! storage.location.template   = s3://<bucket>/<template>
//! ```

pub mod layout;
pub mod schema;

pub use schema::{Column, DataType, StorageFormat};

use crate::error::{ProvisionError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("placeholder regex is valid"));

/// Known value sets an enum projection can be checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Vocabulary {
    AwsRegions,
}

impl Vocabulary {
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Vocabulary::AwsRegions => layout::AWS_REGIONS.contains(&value),
        }
    }
}

/// How the values of a partition key are enumerated at query time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ProjectionRule {
    Enum {
        values: Vec<String>,
        #[serde(default)]
        vocabulary: Option<Vocabulary>,
    },
    IntegerRange {
        min: u32,
        max: u32,
        #[serde(default)]
        digits: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKey {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub comment: Option<String>,
    pub projection: ProjectionRule,
}

impl PartitionKey {
    /// String-typed partition key
    #[must_use]
    pub fn new(name: impl Into<String>, projection: ProjectionRule) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::String,
            comment: None,
            projection,
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    fn as_column(&self) -> Column {
        Column {
            name: self.name.clone(),
            data_type: self.data_type.clone(),
            comment: self.comment.clone(),
        }
    }
}

/// Everything needed to compile a projected table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub columns: Vec<Column>,
    pub partition_keys: Vec<PartitionKey>,
    /// Static object prefix of the data, relative to the bucket root
    pub location_prefix: String,
    /// Location template relative to the bucket root
    pub location_template: String,
    pub format: StorageFormat,
    /// Overrides the format's default classification
    #[serde(default)]
    pub classification: Option<String>,
}

/// Output of [`compile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTable {
    definition: TableDefinition,
    parameters: BTreeMap<String, String>,
}

impl CompiledTable {
    #[must_use]
    pub fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Table parameters for a table stored in `bucket`
    #[must_use]
    pub fn parameters(&self, bucket: &str) -> BTreeMap<String, String> {
        let mut parameters = self.parameters.clone();
        parameters.insert(
            "storage.location.template".to_string(),
            format!("s3://{bucket}/{}", self.definition.location_template),
        );
        parameters
    }

    /// `s3://<bucket>/<prefix>`
    #[must_use]
    pub fn location(&self, bucket: &str) -> String {
        format!("s3://{bucket}/{}", self.definition.location_prefix)
    }

    /// Glue `StorageDescriptor.Columns`
    #[must_use]
    pub fn columns(&self) -> Vec<serde_json::Value> {
        self.definition.columns.iter().map(Column::to_glue).collect()
    }

    /// Glue `PartitionKeys`
    #[must_use]
    pub fn partition_keys(&self) -> Vec<serde_json::Value> {
        self.definition
            .partition_keys
            .iter()
            .map(|k| k.as_column().to_glue())
            .collect()
    }
}

/// Validate a table definition and derive its projection parameters
///
/// Pure: no cloud call is made, and identical definitions compile to
/// identical parameter sets.
pub fn compile(def: &TableDefinition) -> Result<CompiledTable> {
    let invalid = |reason: String| ProvisionError::InvalidProjectionSpec {
        table: def.name.clone(),
        reason,
    };

    if def.partition_keys.is_empty() {
        return Err(invalid("a projected table needs at least one partition key".to_string()));
    }
    let partition_columns: Vec<Column> = def.partition_keys.iter().map(PartitionKey::as_column).collect();
    schema::validate_columns(&def.name, def.columns.iter().chain(&partition_columns))?;

    let mut parameters = BTreeMap::new();
    parameters.insert("projection.enabled".to_string(), "true".to_string());
    parameters.insert(
        "classification".to_string(),
        def.classification
            .clone()
            .unwrap_or_else(|| def.format.classification().to_string()),
    );

    for key in &def.partition_keys {
        let prefix = format!("projection.{}", key.name);
        match &key.projection {
            ProjectionRule::Enum { values, vocabulary } => {
                check_enum(&key.name, values, *vocabulary).map_err(invalid)?;
                parameters.insert(format!("{prefix}.type"), "enum".to_string());
                parameters.insert(format!("{prefix}.values"), values.join(","));
            }
            ProjectionRule::IntegerRange { min, max, digits } => {
                check_range(&key.name, *min, *max, *digits).map_err(invalid)?;
                let width = digits.unwrap_or(0) as usize;
                parameters.insert(format!("{prefix}.type"), "integer".to_string());
                parameters.insert(format!("{prefix}.range"), format!("{min:0width$},{max:0width$}"));
                if let Some(digits) = digits {
                    parameters.insert(format!("{prefix}.digits"), digits.to_string());
                }
            }
        }
    }

    check_template(def).map_err(invalid)?;
    debug!(table = %def.name, parameters = parameters.len(), "Compiled partition projection");

    Ok(CompiledTable {
        definition: def.clone(),
        parameters,
    })
}

fn check_enum(key: &str, values: &[String], vocabulary: Option<Vocabulary>) -> std::result::Result<(), String> {
    if values.is_empty() {
        return Err(format!("enum key '{key}' has no values"));
    }
    let mut seen = HashSet::new();
    for value in values {
        if value.is_empty() || value.contains(',') {
            return Err(format!("enum key '{key}' has invalid value '{value}'"));
        }
        if !seen.insert(value.as_str()) {
            return Err(format!("enum key '{key}' repeats value '{value}'"));
        }
        if let Some(vocabulary) = vocabulary {
            if !vocabulary.contains(value) {
                return Err(format!("enum key '{key}': '{value}' is not a known {vocabulary:?} value"));
            }
        }
    }
    Ok(())
}

fn check_range(key: &str, min: u32, max: u32, digits: Option<u32>) -> std::result::Result<(), String> {
    if min > max {
        return Err(format!("integer key '{key}' has min {min} greater than max {max}"));
    }
    if let Some(digits) = digits {
        let needed = max.to_string().len() as u32;
        if digits < needed {
            return Err(format!(
                "integer key '{key}' needs at least {needed} digits for max {max}, got {digits}"
            ));
        }
    }
    Ok(())
}

fn check_template(def: &TableDefinition) -> std::result::Result<(), String> {
    let template = &def.location_template;
    let placeholders: Vec<&str> = PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let keys: Vec<&str> = def.partition_keys.iter().map(|k| k.name.as_str()).collect();
    if placeholders != keys {
        return Err(format!(
            "template placeholders [{}] do not match partition keys [{}]",
            placeholders.join(", "),
            keys.join(", ")
        ));
    }
    if PLACEHOLDER.replace_all(template, "").contains("${") {
        return Err(format!("template '{template}' has an unterminated placeholder"));
    }
    if template.starts_with('/') || template.contains("://") {
        return Err(format!("template '{template}' must be relative to the bucket root"));
    }
    if !template.starts_with(&def.location_prefix) {
        return Err(format!(
            "template '{template}' does not start with the table prefix '{}'",
            def.location_prefix
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(keys: Vec<PartitionKey>, template: &str) -> TableDefinition {
        TableDefinition {
            name: "events".to_string(),
            description: None,
            columns: vec![Column::string("eventid")],
            partition_keys: keys,
            location_prefix: "logs/".to_string(),
            location_template: template.to_string(),
            format: StorageFormat::Json,
            classification: None,
        }
    }

    fn int(name: &str, min: u32, max: u32, digits: Option<u32>) -> PartitionKey {
        PartitionKey::new(name, ProjectionRule::IntegerRange { min, max, digits })
    }

    #[test]
    fn ranges_are_zero_padded_to_the_digit_width() {
        let compiled = compile(&definition(vec![int("day", 1, 31, Some(2))], "logs/${day}")).unwrap();
        let params = compiled.parameters("bucket");
        assert_eq!(params["projection.day.range"], "01,31");
        assert_eq!(params["projection.day.digits"], "2");
        assert_eq!(params["storage.location.template"], "s3://bucket/logs/${day}");
        assert_eq!(params["classification"], "json");
    }

    #[test]
    fn narrow_digit_widths_are_rejected() {
        let err = compile(&definition(vec![int("year", 2025, 2030, Some(2))], "logs/${year}")).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidProjectionSpec { .. }));
        assert!(compile(&definition(vec![int("day", 1, 100, Some(2))], "logs/${day}")).is_err());
        assert!(compile(&definition(vec![int("day", 1, 99, Some(2))], "logs/${day}")).is_ok());
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        assert!(compile(&definition(vec![int("day", 31, 1, None)], "logs/${day}")).is_err());
        assert!(compile(&definition(vec![int("day", 7, 7, None)], "logs/${day}")).is_ok());
    }

    #[test]
    fn template_must_match_keys_in_order() {
        let keys = || vec![int("month", 1, 12, Some(2)), int("day", 1, 31, Some(2))];
        assert!(compile(&definition(keys(), "logs/${month}/${day}")).is_ok());
        assert!(compile(&definition(keys(), "logs/${day}/${month}")).is_err());
        assert!(compile(&definition(keys(), "logs/${month}")).is_err());
        assert!(compile(&definition(keys(), "logs/${month}/${day}/${hour}")).is_err());
        assert!(compile(&definition(keys(), "logs/${month}/${day")).is_err());
        assert!(compile(&definition(keys(), "other/${month}/${day}")).is_err());
    }

    #[test]
    fn enum_values_are_validated() {
        let region = |values: &[&str]| {
            PartitionKey::new(
                "region",
                ProjectionRule::Enum {
                    values: values.iter().map(|v| v.to_string()).collect(),
                    vocabulary: Some(Vocabulary::AwsRegions),
                },
            )
        };
        assert!(compile(&definition(vec![region(&[])], "logs/${region}")).is_err());
        assert!(compile(&definition(vec![region(&["us-east-1", "us-east-1"])], "logs/${region}")).is_err());
        assert!(compile(&definition(vec![region(&["mars-north-1"])], "logs/${region}")).is_err());
        let ok = compile(&definition(vec![region(&["us-east-1", "us-west-2"])], "logs/${region}")).unwrap();
        assert_eq!(ok.parameters("b")["projection.region.values"], "us-east-1,us-west-2");
    }

    #[test]
    fn partition_names_cannot_shadow_columns() {
        let def = definition(vec![int("eventid", 1, 2, None)], "logs/${eventid}");
        assert!(compile(&def).is_err());
    }

    #[test]
    fn compilation_is_deterministic() {
        let def = layout::cloudtrail_table(
            "cloudtrail_logs",
            "123456789012",
            vec!["us-east-1".to_string()],
            (2025, 2030),
        );
        assert_eq!(compile(&def).unwrap(), compile(&def).unwrap());
    }
}
