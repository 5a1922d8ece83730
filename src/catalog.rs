//! Tracked table storage consumed by pipeline steps.
//!
//! Rows are keyed by the canonical JSON of their primary-key values. Each
//! step also keeps a map of input row key to the input version it last
//! processed, which drives change detection in the executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::table::{Frame, TableSchema};

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_table(&self, name: &str) -> Result<TableSchema, StoreError>;

    /// Return the existing schema, or create the table when `create` is set.
    /// An existing table with a different schema is a mismatch.
    async fn create_or_get_table(
        &self,
        name: &str,
        schema: TableSchema,
        create: bool,
    ) -> Result<TableSchema, StoreError>;

    async fn read(&self, name: &str) -> Result<Frame, StoreError>;

    /// Upsert rows by primary key.
    async fn store_chunk(&self, name: &str, frame: &Frame) -> Result<(), StoreError>;

    async fn delete_keys(&self, name: &str, keys: &[String]) -> Result<(), StoreError>;

    async fn processed(&self, step: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn mark_processed(&self, step: &str, entries: Vec<(String, String)>) -> Result<(), StoreError>;

    async fn forget_processed(&self, step: &str, keys: &[String]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredTable {
    schema: TableSchema,
    rows: BTreeMap<String, Vec<Value>>,
}

impl StoredTable {
    fn to_frame(&self, table: &str) -> Result<Frame, StoreError> {
        let mut frame = Frame::new(self.schema.column_names());
        for (key, row) in &self.rows {
            if row.len() != frame.columns().len() {
                return Err(StoreError::SchemaMismatch {
                    table: table.to_string(),
                    message: format!(
                        "row {key} has {} cells, expected {}",
                        row.len(),
                        frame.columns().len()
                    ),
                });
            }
            frame.push_row(row.clone())?;
        }
        Ok(frame)
    }

    fn upsert(&mut self, table: &str, frame: &Frame) -> Result<(), StoreError> {
        let primary_keys = self.schema.primary_keys();
        for column in frame.columns() {
            if self.schema.column(column).is_none() {
                return Err(StoreError::ColumnNotFound {
                    column: column.clone(),
                    context: format!("table `{table}`"),
                });
            }
        }

        let positions: Vec<Option<usize>> = self
            .schema
            .columns
            .iter()
            .map(|c| frame.columns().iter().position(|f| *f == c.name))
            .collect();
        for (column, position) in self.schema.columns.iter().zip(&positions) {
            if position.is_none() && !column.nullable {
                return Err(StoreError::SchemaMismatch {
                    table: table.to_string(),
                    message: format!("missing non-nullable column `{}`", column.name),
                });
            }
        }

        let keys = frame.row_keys(&primary_keys)?;
        for (key, row) in keys.into_iter().zip(frame.rows()) {
            let stored = positions
                .iter()
                .map(|p| p.map(|i| row[i].clone()).unwrap_or(Value::Null))
                .collect();
            self.rows.insert(key, stored);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    tables: BTreeMap<String, StoredTable>,
    steps: BTreeMap<String, BTreeMap<String, String>>,
}

impl CatalogState {
    fn table(&self, name: &str) -> Result<&StoredTable, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut StoredTable, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn create_or_get(&mut self, name: &str, schema: TableSchema, create: bool) -> Result<TableSchema, StoreError> {
        validate_name(name)?;
        if let Some(existing) = self.tables.get(name) {
            if existing.schema != schema {
                return Err(StoreError::SchemaMismatch {
                    table: name.to_string(),
                    message: format!(
                        "existing columns {:?}, requested {:?}",
                        existing.schema.column_names(),
                        schema.column_names()
                    ),
                });
            }
            return Ok(existing.schema.clone());
        }
        if !create {
            return Err(StoreError::TableNotFound(name.to_string()));
        }
        tracing::info!(table = name, columns = ?schema.column_names(), "Creating table");
        self.tables.insert(
            name.to_string(),
            StoredTable {
                schema: schema.clone(),
                rows: BTreeMap::new(),
            },
        );
        Ok(schema)
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(StoreError::InvalidTableName(name.to_string()));
    }
    Ok(())
}

/// Process-local catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get_table(&self, name: &str) -> Result<TableSchema, StoreError> {
        Ok(self.state.lock().await.table(name)?.schema.clone())
    }

    async fn create_or_get_table(
        &self,
        name: &str,
        schema: TableSchema,
        create: bool,
    ) -> Result<TableSchema, StoreError> {
        self.state.lock().await.create_or_get(name, schema, create)
    }

    async fn read(&self, name: &str) -> Result<Frame, StoreError> {
        self.state.lock().await.table(name)?.to_frame(name)
    }

    async fn store_chunk(&self, name: &str, frame: &Frame) -> Result<(), StoreError> {
        self.state.lock().await.table_mut(name)?.upsert(name, frame)
    }

    async fn delete_keys(&self, name: &str, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let table = state.table_mut(name)?;
        for key in keys {
            table.rows.remove(key);
        }
        Ok(())
    }

    async fn processed(&self, step: &str) -> Result<HashMap<String, String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .get(step)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn mark_processed(&self, step: &str, entries: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.steps.entry(step.to_string()).or_default().extend(entries);
        Ok(())
    }

    async fn forget_processed(&self, step: &str, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(meta) = state.steps.get_mut(step) {
            for key in keys {
                meta.remove(key);
            }
        }
        Ok(())
    }
}

/// Catalog persisted as JSON documents under a directory:
/// `tables/<name>.json` for data and `steps/<name>.json` for step metadata.
#[derive(Debug)]
pub struct FileCatalog {
    root: PathBuf,
    state: Mutex<CatalogState>,
}

impl FileCatalog {
    #[tracing::instrument]
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        let mut state = CatalogState::default();
        for dir in ["tables", "steps"] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|source| StoreError::Io { path, source })?;
        }

        for (name, table) in load_documents::<StoredTable>(&root.join("tables")).await? {
            state.tables.insert(name, table);
        }
        for (name, meta) in load_documents::<BTreeMap<String, String>>(&root.join("steps")).await? {
            state.steps.insert(name, meta);
        }
        tracing::debug!(tables = state.tables.len(), steps = state.steps.len(), "Opened file catalog");

        Ok(Self {
            root: root.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    async fn persist_table(&self, name: &str, table: &StoredTable) -> Result<(), StoreError> {
        write_document(&self.root.join("tables"), name, table).await
    }

    async fn persist_step(&self, step: &str, meta: &BTreeMap<String, String>) -> Result<(), StoreError> {
        write_document(&self.root.join("steps"), step, meta).await
    }
}

async fn load_documents<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<(String, T)>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut documents = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|source| StoreError::Io { path: path.clone(), source })?;
        documents.push((name, serde_json::from_slice(&raw)?));
    }
    Ok(documents)
}

async fn write_document<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<(), StoreError> {
    validate_name(name)?;
    let path = dir.join(format!("{name}.json"));
    let tmp = dir.join(format!(".{name}.json.tmp"));
    let raw = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, raw)
        .await
        .map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|source| StoreError::Io { path, source })
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn get_table(&self, name: &str) -> Result<TableSchema, StoreError> {
        Ok(self.state.lock().await.table(name)?.schema.clone())
    }

    async fn create_or_get_table(
        &self,
        name: &str,
        schema: TableSchema,
        create: bool,
    ) -> Result<TableSchema, StoreError> {
        let mut state = self.state.lock().await;
        let existed = state.tables.contains_key(name);
        let schema = state.create_or_get(name, schema, create)?;
        if !existed {
            self.persist_table(name, state.table(name)?).await?;
        }
        Ok(schema)
    }

    async fn read(&self, name: &str) -> Result<Frame, StoreError> {
        self.state.lock().await.table(name)?.to_frame(name)
    }

    async fn store_chunk(&self, name: &str, frame: &Frame) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut table = state.table(name)?.clone();
        table.upsert(name, frame)?;
        self.persist_table(name, &table).await?;
        state.tables.insert(name.to_string(), table);
        Ok(())
    }

    async fn delete_keys(&self, name: &str, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut table = state.table(name)?.clone();
        for key in keys {
            table.rows.remove(key);
        }
        self.persist_table(name, &table).await?;
        state.tables.insert(name.to_string(), table);
        Ok(())
    }

    async fn processed(&self, step: &str) -> Result<HashMap<String, String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .get(step)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn mark_processed(&self, step: &str, entries: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut meta = state.steps.get(step).cloned().unwrap_or_default();
        meta.extend(entries);
        self.persist_step(step, &meta).await?;
        state.steps.insert(step.to_string(), meta);
        Ok(())
    }

    async fn forget_processed(&self, step: &str, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(mut meta) = state.steps.get(step).cloned() else {
            return Ok(());
        };
        for key in keys {
            meta.remove(key);
        }
        self.persist_step(step, &meta).await?;
        state.steps.insert(step.to_string(), meta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnType};
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::primary_key("image_id", ColumnType::String),
            Column::new("image_url", ColumnType::String).not_null(),
        ])
    }

    fn frame(rows: &[(&str, &str)]) -> Frame {
        Frame::from_columns(vec![
            ("image_id".to_string(), rows.iter().map(|(id, _)| json!(id)).collect()),
            ("image_url".to_string(), rows.iter().map(|(_, url)| json!(url)).collect()),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn store_chunk_upserts_by_primary_key() {
        let catalog = MemoryCatalog::new();
        catalog.create_or_get_table("input", schema(), true).await.unwrap();
        catalog
            .store_chunk("input", &frame(&[("a", "u1"), ("b", "u2")]))
            .await
            .unwrap();
        catalog.store_chunk("input", &frame(&[("a", "u3")])).await.unwrap();

        let data = catalog.read("input").await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.column("image_url").unwrap(), vec![json!("u3"), json!("u2")]);
    }

    #[tokio::test]
    async fn existing_table_with_other_schema_is_rejected() {
        let catalog = MemoryCatalog::new();
        catalog.create_or_get_table("input", schema(), true).await.unwrap();
        let other = TableSchema::new(vec![Column::primary_key("id", ColumnType::Integer)]);
        let err = catalog.create_or_get_table("input", other, true).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_table_without_create_is_not_found() {
        let catalog = MemoryCatalog::new();
        let err = catalog.create_or_get_table("output", schema(), false).await.unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(name) if name == "output"));
    }

    #[tokio::test]
    async fn missing_non_nullable_column_is_rejected() {
        let catalog = MemoryCatalog::new();
        catalog.create_or_get_table("input", schema(), true).await.unwrap();
        let only_ids = frame(&[("a", "u1")]).project(&["image_id".to_string()]).unwrap();
        let err = catalog.store_chunk("input", &only_ids).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn file_catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = FileCatalog::open(dir.path()).await.unwrap();
            catalog.create_or_get_table("input", schema(), true).await.unwrap();
            catalog.store_chunk("input", &frame(&[("a", "u1")])).await.unwrap();
            catalog
                .mark_processed("step", vec![(r#"["a"]"#.to_string(), "v1".to_string())])
                .await
                .unwrap();
        }

        let reopened = FileCatalog::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get_table("input").await.unwrap(), schema());
        assert_eq!(reopened.read("input").await.unwrap().len(), 1);
        assert_eq!(
            reopened.processed("step").await.unwrap().get(r#"["a"]"#),
            Some(&"v1".to_string())
        );
    }

    #[tokio::test]
    async fn malformed_stored_row_is_a_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let catalog = FileCatalog::open(dir.path()).await.unwrap();
            catalog.create_or_get_table("input", schema(), true).await.unwrap();
            catalog
                .store_chunk("input", &frame(&[("a", "u1"), ("b", "u2")]))
                .await
                .unwrap();
        }

        let path = dir.path().join("tables").join("input.json");
        let mut document: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        document["rows"][r#"["b"]"#] = json!(["b"]);
        std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

        let reopened = FileCatalog::open(dir.path()).await.unwrap();
        let err = reopened.read("input").await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { ref table, .. } if table == "input"));
    }

    #[tokio::test]
    async fn table_names_cannot_escape_the_root() {
        let catalog = MemoryCatalog::new();
        let err = catalog
            .create_or_get_table("../etc", schema(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTableName(_)));
    }
}
