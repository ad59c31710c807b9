//! Series schemas: typed columns with a sort-key subset.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Column data types supported by the frame codec.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int,
    Float,
    Timestamp,
    Str,
    Bytes,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub dtype: DType,
    #[serde(default)]
    pub index: bool,
}

impl ColumnDef {
    pub fn index(name: &str, dtype: DType) -> Self {
        ColumnDef {
            name: name.to_string(),
            dtype,
            index: true,
        }
    }

    pub fn value(name: &str, dtype: DType) -> Self {
        ColumnDef {
            name: name.to_string(),
            dtype,
            index: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    /// Regular columnar series.
    Table,
    /// Two column (key, meta) layout used by registry and collection
    /// index series.
    Kv,
}

impl Default for SchemaKind {
    fn default() -> Self {
        SchemaKind::Table
    }
}

/// Ordered column list; compared structurally for sync compatibility.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDef>,
    #[serde(default)]
    kind: SchemaKind,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self, Error> {
        Self::with_kind(columns, SchemaKind::Table)
    }

    fn with_kind(columns: Vec<ColumnDef>, kind: SchemaKind) -> Result<Self, Error> {
        if !columns.iter().any(|col| col.index) {
            bail!("schema needs at least one index column");
        }
        for (i, col) in columns.iter().enumerate() {
            if col.name.is_empty() {
                bail!("empty column name");
            }
            if columns[..i].iter().any(|other| other.name == col.name) {
                bail!("duplicated column name '{}'", col.name);
            }
        }
        Ok(Schema { columns, kind })
    }

    /// The registry layout: `label` (index) mapping to opaque `meta`
    /// bytes.
    pub fn kv() -> Self {
        Schema {
            columns: vec![
                ColumnDef::index("label", DType::Str),
                ColumnDef::value("meta", DType::Bytes),
            ],
            kind: SchemaKind::Kv,
        }
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Positions of the index (sort key) columns, in declaration order.
    pub fn index_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, col)| col.index)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn dump(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn loads(data: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(data)?)
    }
}

#[test]
fn test_schema_dump_roundtrip() {
    let schema = Schema::new(vec![
        ColumnDef::index("timestamp", DType::Timestamp),
        ColumnDef::value("value", DType::Float),
    ])
    .unwrap();

    let copy = Schema::loads(&schema.dump().unwrap()).unwrap();
    assert_eq!(schema, copy);
    assert_eq!(copy.index_positions(), vec![0]);
}

#[test]
fn test_schema_validation() {
    assert!(Schema::new(vec![ColumnDef::value("value", DType::Float)]).is_err());
    assert!(Schema::new(vec![
        ColumnDef::index("a", DType::Int),
        ColumnDef::value("a", DType::Int),
    ])
    .is_err());
    assert_eq!(Schema::kv(), Schema::kv());
}
