//! Table schemas and in-memory row frames exchanged with the catalog.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            primary_key: false,
            nullable: true,
        }
    }

    pub fn primary_key(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            primary_key: true,
            nullable: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn primary_keys(&self) -> Vec<String> {
        self.primary_schema().into_iter().map(|c| c.name).collect()
    }

    /// Primary-key columns with their types, in declaration order.
    pub fn primary_schema(&self) -> Vec<Column> {
        self.columns.iter().filter(|c| c.primary_key).cloned().collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Rows of JSON cells sharing one column list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a frame from named columns of equal length.
    pub fn from_columns(columns: Vec<(String, Vec<Value>)>) -> Result<Self, StoreError> {
        let len = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        if let Some((name, values)) = columns.iter().find(|(_, v)| v.len() != len) {
            return Err(StoreError::SchemaMismatch {
                table: "<frame>".to_string(),
                message: format!("column `{name}` has {} values, expected {len}", values.len()),
            });
        }

        let names = columns.iter().map(|(n, _)| n.clone()).collect();
        let mut rows = vec![Vec::with_capacity(columns.len()); len];
        for (_, values) in columns {
            for (row, value) in rows.iter_mut().zip(values) {
                row.push(value);
            }
        }
        Ok(Self { columns: names, rows })
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), StoreError> {
        if row.len() != self.columns.len() {
            return Err(StoreError::SchemaMismatch {
                table: "<frame>".to_string(),
                message: format!("row has {} cells, expected {}", row.len(), self.columns.len()),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn index_of(&self, name: &str) -> Result<usize, StoreError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| StoreError::ColumnNotFound {
                column: name.to_string(),
                context: "frame".to_string(),
            })
    }

    /// Values of one column, in row order.
    pub fn column(&self, name: &str) -> Result<Vec<Value>, StoreError> {
        let idx = self.index_of(name)?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// A new frame restricted to `names`, in that order.
    pub fn project(&self, names: &[String]) -> Result<Frame, StoreError> {
        let indices = names
            .iter()
            .map(|n| self.index_of(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Frame {
            columns: names.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        })
    }

    /// Append (or replace) a column positionally.
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<Value>) -> Result<Frame, StoreError> {
        let name = name.into();
        if values.len() != self.rows.len() {
            return Err(StoreError::SchemaMismatch {
                table: "<frame>".to_string(),
                message: format!(
                    "column `{name}` has {} values for {} rows",
                    values.len(),
                    self.rows.len()
                ),
            });
        }

        match self.columns.iter().position(|c| *c == name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name);
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(self)
    }

    /// Consecutive sub-frames of at most `size` rows.
    pub fn chunks(&self, size: usize) -> Vec<Frame> {
        self.rows
            .chunks(size.max(1))
            .map(|rows| Frame {
                columns: self.columns.clone(),
                rows: rows.to_vec(),
            })
            .collect()
    }

    /// Rows at `indices`, in the order given.
    pub fn select(&self, indices: &[usize]) -> Frame {
        Frame {
            columns: self.columns.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// Serialized content of every row; changes whenever any cell changes.
    pub fn row_versions(&self) -> Result<Vec<String>, StoreError> {
        self.rows
            .iter()
            .map(|row| Ok::<_, StoreError>(serde_json::to_string(row)?))
            .collect()
    }

    /// Canonical key of every row: the JSON array of its primary-key values.
    pub fn row_keys(&self, primary_keys: &[String]) -> Result<Vec<String>, StoreError> {
        let indices = primary_keys
            .iter()
            .map(|n| self.index_of(n))
            .collect::<Result<Vec<_>, _>>()?;
        self.rows
            .iter()
            .map(|row| {
                let key: Vec<&Value> = indices.iter().map(|&i| &row[i]).collect();
                Ok::<_, StoreError>(serde_json::to_string(&key)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Frame {
        Frame::from_columns(vec![
            ("image_id".to_string(), vec![json!("a"), json!("b"), json!("c")]),
            (
                "image_url".to_string(),
                vec![json!("http://x/a"), json!("http://x/b"), json!("http://x/c")],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn primary_schema_keeps_declaration_order() {
        let schema = TableSchema::new(vec![
            Column::primary_key("shard", ColumnType::Integer),
            Column::new("image_url", ColumnType::String),
            Column::primary_key("image_id", ColumnType::String),
        ]);
        assert_eq!(schema.primary_keys(), vec!["shard", "image_id"]);
        assert_eq!(schema.primary_schema()[0].ty, ColumnType::Integer);
    }

    #[test]
    fn project_and_with_column() {
        let frame = sample();
        let out = frame
            .project(&["image_id".to_string()])
            .unwrap()
            .with_column("details", vec![json!({}), json!({}), json!({"adult": 1})])
            .unwrap();
        assert_eq!(out.columns(), ["image_id", "details"]);
        assert_eq!(out.rows()[2], vec![json!("c"), json!({"adult": 1})]);
    }

    #[test]
    fn with_column_rejects_length_mismatch() {
        let err = sample().with_column("details", vec![json!({})]).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[test]
    fn chunks_cover_all_rows_in_order() {
        let chunks = sample().chunks(2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].column("image_id").unwrap(), vec![json!("c")]);
    }

    #[test]
    fn row_keys_are_json_arrays() {
        let keys = sample().row_keys(&["image_id".to_string()]).unwrap();
        assert_eq!(keys, vec![r#"["a"]"#, r#"["b"]"#, r#"["c"]"#]);
    }

    #[test]
    fn select_and_versions() {
        let frame = sample();
        let picked = frame.select(&[2, 0]);
        assert_eq!(picked.column("image_id").unwrap(), vec![json!("c"), json!("a")]);

        let versions = frame.row_versions().unwrap();
        assert_eq!(versions[0], r#"["a","http://x/a"]"#);
    }

    #[test]
    fn unknown_column_is_reported() {
        let err = sample().column("missing").unwrap_err();
        assert!(matches!(err, StoreError::ColumnNotFound { column, .. } if column == "missing"));
    }
}
