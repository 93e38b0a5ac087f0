//! # Table Schema
//!
//! Column and type definitions rendered as Glue/Hive type strings. Nested
//! structs and arrays are kept as declared; nothing is flattened.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Glue column type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    String,
    Boolean,
    Int,
    BigInt,
    Double,
    Timestamp,
    Struct(Vec<Column>),
    Array(Box<DataType>),
    Map(Box<DataType>, Box<DataType>),
}

impl DataType {
    #[must_use]
    pub fn structure(fields: Vec<Column>) -> Self {
        DataType::Struct(fields)
    }

    #[must_use]
    pub fn array(element: DataType) -> Self {
        DataType::Array(Box::new(element))
    }

    /// Reject duplicate or empty field names at any nesting level
    fn validate(&self, path: &str) -> std::result::Result<(), String> {
        match self {
            DataType::Struct(fields) => {
                if fields.is_empty() {
                    return Err(format!("struct '{path}' has no fields"));
                }
                check_unique(fields.iter().map(|f| f.name.as_str()), path)?;
                for field in fields {
                    field
                        .data_type
                        .validate(&format!("{path}.{}", field.name))?;
                }
                Ok(())
            }
            DataType::Array(element) => element.validate(path),
            DataType::Map(key, value) => {
                key.validate(path)?;
                value.validate(path)
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::String => f.write_str("string"),
            DataType::Boolean => f.write_str("boolean"),
            DataType::Int => f.write_str("int"),
            DataType::BigInt => f.write_str("bigint"),
            DataType::Double => f.write_str("double"),
            DataType::Timestamp => f.write_str("timestamp"),
            DataType::Struct(fields) => {
                f.write_str("struct<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", field.name, field.data_type)?;
                }
                f.write_str(">")
            }
            DataType::Array(element) => write!(f, "array<{element}>"),
            DataType::Map(key, value) => write!(f, "map<{key},{value}>"),
        }
    }
}

/// Named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            comment: None,
        }
    }

    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, DataType::String)
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Glue `Column` object
    #[must_use]
    pub fn to_glue(&self) -> serde_json::Value {
        let mut column = serde_json::json!({
            "Name": self.name,
            "Type": self.data_type.to_string(),
        });
        if let Some(comment) = &self.comment {
            column["Comment"] = serde_json::json!(comment);
        }
        column
    }
}

/// Validate a table's top-level names together with every nested type
pub(crate) fn validate_columns<'a>(
    table: &str,
    columns: impl IntoIterator<Item = &'a Column>,
) -> Result<()> {
    let columns: Vec<&Column> = columns.into_iter().collect();
    let invalid = |reason: String| ProvisionError::InvalidProjectionSpec {
        table: table.to_string(),
        reason,
    };
    check_unique(columns.iter().map(|c| c.name.as_str()), table).map_err(invalid)?;
    for column in columns {
        column.data_type.validate(&column.name).map_err(invalid)?;
    }
    Ok(())
}

/// Glue lower-cases names, so uniqueness is case-insensitive
fn check_unique<'a>(names: impl Iterator<Item = &'a str>, path: &str) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(format!("'{path}' contains an empty name"));
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(format!("'{name}' is declared more than once in '{path}'"));
        }
    }
    Ok(())
}

/// On-disk format of the table's objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageFormat {
    CloudTrail,
    Json,
    Parquet,
}

const HIVE_IGNORE_KEY_TEXT: &str = "org.apache.hadoop.hive.ql.io.HiveIgnoreKeyTextOutputFormat";

impl StorageFormat {
    #[must_use]
    pub fn input_format(&self) -> &'static str {
        match self {
            StorageFormat::CloudTrail => "com.amazon.emr.cloudtrail.CloudTrailInputFormat",
            StorageFormat::Json => "org.apache.hadoop.mapred.TextInputFormat",
            StorageFormat::Parquet => "org.apache.hadoop.hive.ql.io.parquet.MapredParquetInputFormat",
        }
    }

    #[must_use]
    pub fn output_format(&self) -> &'static str {
        match self {
            StorageFormat::CloudTrail | StorageFormat::Json => HIVE_IGNORE_KEY_TEXT,
            StorageFormat::Parquet => "org.apache.hadoop.hive.ql.io.parquet.MapredParquetOutputFormat",
        }
    }

    #[must_use]
    pub fn serialization_library(&self) -> &'static str {
        match self {
            StorageFormat::CloudTrail => "com.amazon.emr.hive.serde.CloudTrailSerde",
            StorageFormat::Json => "org.openx.data.jsonserde.JsonSerDe",
            StorageFormat::Parquet => "org.apache.hadoop.hive.ql.io.parquet.serde.ParquetHiveSerDe",
        }
    }

    /// Default `classification` table parameter
    #[must_use]
    pub fn classification(&self) -> &'static str {
        match self {
            StorageFormat::CloudTrail => "cloudtrail",
            StorageFormat::Json => "json",
            StorageFormat::Parquet => "parquet",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_types_render_as_hive_strings() {
        let resources = DataType::array(DataType::structure(vec![
            Column::string("ARN"),
            Column::string("accountId"),
            Column::string("type"),
        ]));
        assert_eq!(
            resources.to_string(),
            "array<struct<ARN:string,accountId:string,type:string>>"
        );

        let map = DataType::Map(Box::new(DataType::String), Box::new(DataType::BigInt));
        assert_eq!(map.to_string(), "map<string,bigint>");
    }

    #[test]
    fn duplicate_names_are_case_insensitive() {
        let columns = vec![Column::string("eventName"), Column::string("eventname")];
        let err = validate_columns("t", &columns).unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let nested = vec![Column::new(
            "identity",
            DataType::structure(vec![Column::string("arn"), Column::string("ARN")]),
        )];
        assert!(validate_columns("t", &nested).is_err());
    }

    #[test]
    fn comments_are_emitted_only_when_set() {
        let plain = Column::string("eventid").to_glue();
        assert!(plain.get("Comment").is_none());
        let commented = Column::string("eventid").with_comment("GUID").to_glue();
        assert_eq!(commented["Comment"], serde_json::json!("GUID"));
    }
}
