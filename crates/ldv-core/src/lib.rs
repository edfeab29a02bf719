//! Core domain model for LDV: column schema, records, merged datasets.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ldv-core";

/// Synthetic column appended to every record, holding the name of the input
/// file that contributed the row.
pub const SOURCE_COLUMN: &str = "source";

/// Fixed, ordered set of expected input columns. The persisted output order
/// is this list with [`SOURCE_COLUMN`] appended last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub columns: Vec<String>,
}

impl ColumnSchema {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    /// Expected input columns, without the synthetic source column.
    pub fn expected(&self) -> &[String] {
        &self.columns
    }

    /// Full output column order: expected columns plus [`SOURCE_COLUMN`].
    pub fn output_columns(&self) -> Vec<String> {
        let mut out = self.columns.clone();
        out.push(SOURCE_COLUMN.to_string());
        out
    }

    /// Number of columns in the output order.
    pub fn output_len(&self) -> usize {
        self.columns.len() + 1
    }
}

impl Default for ColumnSchema {
    fn default() -> Self {
        Self::new(
            [
                "lead_id",
                "created_time",
                "created_date",
                "ad_id",
                "campaign_id",
                "account_id",
                "form_id",
                "form_name",
                "test_lead",
                "first_name",
                "last_name",
                "email",
                "phone",
                "country_region",
                "lead_type",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        )
    }
}

/// One normalized row: string values aligned 1:1 with the output column
/// order. Absent values are empty strings, never a null marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub values: Vec<String>,
}

impl Record {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
}

/// Records from all successfully normalized input files, concatenated in
/// file-discovery order. Owned by a single pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedDataset {
    pub records: Vec<Record>,
}

impl MergedDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn extend(&mut self, records: Vec<Record>) {
        self.records.extend(records);
    }
}

/// Which decode succeeded for an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => f.write_str("utf-8"),
            Self::Latin1 => f.write_str("latin-1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_columns_append_source_last() {
        let schema = ColumnSchema::new(vec!["a".into(), "b".into()]);
        assert_eq!(schema.output_columns(), vec!["a", "b", SOURCE_COLUMN]);
        assert_eq!(schema.output_len(), 3);
    }

    #[test]
    fn default_schema_carries_lead_export_columns() {
        let schema = ColumnSchema::default();
        assert_eq!(schema.expected().len(), 15);
        assert_eq!(schema.expected()[0], "lead_id");
        assert_eq!(schema.expected()[14], "lead_type");
        assert!(!schema.expected().iter().any(|c| c == SOURCE_COLUMN));
    }

    #[test]
    fn text_encoding_display_matches_wire_names() {
        assert_eq!(TextEncoding::Utf8.to_string(), "utf-8");
        assert_eq!(TextEncoding::Latin1.to_string(), "latin-1");
    }
}
