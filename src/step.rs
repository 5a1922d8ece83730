//! Pipeline step classifying images through a moderation provider.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::engine::ProviderFactory;
use crate::error::StoreError;
use crate::executor::{BatchTransform, ChunkTransform, ExecutorConfig};
use crate::google_vision::GoogleVisionConfig;
use crate::table::{Column, ColumnType, Frame, TableSchema};
use crate::types::ImageReference;
use crate::yandex_vision::YandexVisionConfig;

pub const DEFAULT_IMAGE_FIELD: &str = "image_url";
pub const DEFAULT_DETAILS_FIELD: &str = "details";

pub struct ImageClassificationStep {
    input: String,
    output: String,
    provider: Arc<dyn ProviderFactory>,
    image_field: String,
    details_field: String,
    step_name: String,
    create_table: bool,
    executor_config: ExecutorConfig,
    labels: Vec<(String, String)>,
}

impl ImageClassificationStep {
    pub fn new(input: impl Into<String>, output: impl Into<String>, provider: Arc<dyn ProviderFactory>) -> Self {
        let step_name = format!("image_classification_{}", provider.name());
        Self {
            input: input.into(),
            output: output.into(),
            provider,
            image_field: DEFAULT_IMAGE_FIELD.to_string(),
            details_field: DEFAULT_DETAILS_FIELD.to_string(),
            step_name,
            create_table: true,
            executor_config: ExecutorConfig::default(),
            labels: Vec::new(),
        }
    }

    pub fn google(input: impl Into<String>, output: impl Into<String>, config: GoogleVisionConfig) -> Self {
        Self::new(input, output, Arc::new(config))
    }

    pub fn yandex(input: impl Into<String>, output: impl Into<String>, config: YandexVisionConfig) -> Self {
        Self::new(input, output, Arc::new(config))
    }

    pub fn with_image_field(mut self, field: impl Into<String>) -> Self {
        self.image_field = field.into();
        self
    }

    pub fn with_details_field(mut self, field: impl Into<String>) -> Self {
        self.details_field = field.into();
        self
    }

    pub fn with_step_name(mut self, name: impl Into<String>) -> Self {
        self.step_name = name.into();
        self
    }

    pub fn with_create_table(mut self, create: bool) -> Self {
        self.create_table = create;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn with_labels(mut self, labels: Vec<(String, String)>) -> Self {
        self.labels = labels;
        self
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Output columns: the input's primary keys verbatim plus one JSON column.
    pub fn output_schema(&self, input: &TableSchema) -> Result<TableSchema, StoreError> {
        let mut columns = input.primary_schema();
        if columns.is_empty() {
            return Err(StoreError::SchemaMismatch {
                table: self.input.clone(),
                message: "input table has no primary key".to_string(),
            });
        }
        if columns.iter().any(|c| c.name == self.details_field) {
            return Err(StoreError::SchemaMismatch {
                table: self.output.clone(),
                message: format!("details field `{}` collides with a primary key", self.details_field),
            });
        }
        columns.push(Column::new(self.details_field.clone(), ColumnType::Json));
        Ok(TableSchema::new(columns))
    }

    /// Resolve the input schema, register the output table and return the
    /// executor unit for this step.
    #[tracing::instrument(skip(self, catalog), fields(step = %self.step_name, provider = self.provider.name()))]
    pub async fn build_compute(&self, catalog: &dyn Catalog) -> Result<BatchTransform> {
        let input_schema = catalog
            .get_table(&self.input)
            .await
            .with_context(|| format!("step `{}`: cannot resolve input table", self.step_name))?;

        if input_schema.column(&self.image_field).is_none() {
            return Err(StoreError::ColumnNotFound {
                column: self.image_field.clone(),
                context: format!("table `{}`", self.input),
            })
            .with_context(|| format!("step `{}`", self.step_name));
        }

        let output_schema = self.output_schema(&input_schema)?;
        catalog
            .create_or_get_table(&self.output, output_schema, self.create_table)
            .await
            .with_context(|| format!("step `{}`: cannot register output table", self.step_name))?;

        let primary_keys = input_schema.primary_keys();
        tracing::info!(
            input = %self.input,
            output = %self.output,
            primary_keys = ?primary_keys,
            chunk_size = self.provider.max_batch_size(),
            "Step built"
        );

        let func = Arc::new(ModerationTransform {
            provider: self.provider.clone(),
            primary_keys: primary_keys.clone(),
            image_field: self.image_field.clone(),
            details_field: self.details_field.clone(),
        });

        Ok(BatchTransform::new(
            self.step_name.clone(),
            self.input.clone(),
            self.output.clone(),
            primary_keys,
            self.provider.max_batch_size(),
            func,
        )
        .with_labels(self.labels.clone())
        .with_executor_config(self.executor_config.clone()))
    }
}

/// Per-chunk transform: builds a fresh provider client, classifies the whole
/// chunk in one call and lines records up with the primary keys.
struct ModerationTransform {
    provider: Arc<dyn ProviderFactory>,
    primary_keys: Vec<String>,
    image_field: String,
    details_field: String,
}

#[async_trait]
impl ChunkTransform for ModerationTransform {
    async fn transform(&self, input: Frame) -> Result<Frame> {
        let client = self.provider.build()?;

        let output = input.project(&self.primary_keys)?;
        let images = input
            .column(&self.image_field)?
            .into_iter()
            .map(|value| image_reference(&self.image_field, value))
            .collect::<Result<Vec<_>>>()?;

        let records = client.moderate_batch(&images).await?;
        let details = records.iter().map(|r| r.to_json()).collect();
        Ok(output.with_column(self.details_field.clone(), details)?)
    }
}

fn image_reference(field: &str, value: Value) -> Result<ImageReference> {
    match value {
        Value::String(reference) => Ok(reference),
        other => anyhow::bail!("column `{field}` must hold text, got {other}"),
    }
}
