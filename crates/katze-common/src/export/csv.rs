use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::info;

use super::{DatasetExporter, ExportError, ExportSummary};
use crate::db::QueueStorageError;
use crate::queue::ApplicationRecord;

pub const APPLICATIONS_DATASET_FILE: &str = "adoption_applications.csv";

const HEADERS: &[&str] = &[
    "id",
    "created_at",
    "status",
    "cat_id",
    "cat_name",
    "cat_breed",
    "cat_age",
    "applicant_id",
    "applicant_name",
    "applicant_email",
    "applicant_phone",
    "home_type",
    "living_space_size",
    "has_nets",
    "has_other_pets",
    "other_pets_details",
    "has_children",
    "children_ages",
    "pet_experience",
    "sterilization_agreement",
    "time_availability",
    "financial_capacity",
    "motivation",
    "emergency_plan",
    "ai_score",
    "ai_feedback",
    "ai_flags",
    "ai_evaluated_at",
    "ai_error",
    "rescuer_name",
    "rescuer_email",
];

#[derive(Clone, Copy)]
enum Answer {
    Text,
    Flag,
}

/// Form answers flattened into the dataset, in column order.
const ANSWER_COLUMNS: &[(&str, Answer)] = &[
    ("home_type", Answer::Text),
    ("living_space_size", Answer::Text),
    ("has_nets", Answer::Flag),
    ("has_other_pets", Answer::Flag),
    ("other_pets_details", Answer::Text),
    ("has_children", Answer::Flag),
    ("children_ages", Answer::Text),
    ("pet_experience", Answer::Text),
    ("sterilization_agreement", Answer::Text),
    ("time_availability", Answer::Text),
    ("financial_capacity", Answer::Text),
    ("motivation", Answer::Text),
    ("emergency_plan", Answer::Text),
];

/// One application joined with its cat, applicant and rescuer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationExportRow {
    pub id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub status: String,
    pub cat_id: Option<i64>,
    pub cat_name: Option<String>,
    pub cat_breed: Option<String>,
    pub cat_age: Option<String>,
    pub applicant_id: Option<i64>,
    pub applicant_name: Option<String>,
    pub applicant_email: Option<String>,
    pub applicant_phone: Option<String>,
    pub form_responses: Value,
    pub ai_score: Option<i32>,
    pub ai_feedback: Option<String>,
    pub ai_flags: Option<Vec<String>>,
    pub ai_evaluated_at: Option<DateTime<Utc>>,
    pub ai_error: Option<String>,
    pub rescuer_name: Option<String>,
    pub rescuer_email: Option<String>,
}

impl ApplicationExportRow {
    pub fn from_record(record: ApplicationRecord) -> Self {
        Self {
            id: record.id,
            created_at: Some(record.created_at),
            status: record.status.as_str().to_string(),
            form_responses: record.form_responses,
            ai_score: record.ai_score,
            ai_feedback: record.ai_feedback,
            ai_flags: record.ai_flags,
            ai_evaluated_at: record.ai_evaluated_at,
            ai_error: record.ai_error,
            ..Default::default()
        }
    }

    fn answer_text(&self, key: &str) -> String {
        match self.form_responses.get(key) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    fn answer_flag(&self, key: &str) -> String {
        let flag = self
            .form_responses
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        flag.to_string()
    }

    fn cells(&self) -> Vec<String> {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        let number = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();
        let timestamp = |value: Option<DateTime<Utc>>| {
            value
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default()
        };

        let mut cells = vec![
            self.id.to_string(),
            timestamp(self.created_at),
            self.status.clone(),
            number(self.cat_id),
            text(&self.cat_name),
            self.cat_breed.clone().unwrap_or_else(|| "Mestizo".to_string()),
            text(&self.cat_age),
            number(self.applicant_id),
            text(&self.applicant_name),
            text(&self.applicant_email),
            text(&self.applicant_phone),
        ];

        cells.extend(ANSWER_COLUMNS.iter().map(|(key, kind)| match kind {
            Answer::Text => self.answer_text(key),
            Answer::Flag => self.answer_flag(key),
        }));

        cells.extend([
            self.ai_score.map(|s| s.to_string()).unwrap_or_default(),
            text(&self.ai_feedback),
            self.ai_flags
                .as_ref()
                .map(|flags| flags.join("; "))
                .unwrap_or_default(),
            timestamp(self.ai_evaluated_at),
            text(&self.ai_error),
            text(&self.rescuer_name),
            text(&self.rescuer_email),
        ]);
        cells
    }
}

/// Quote a field when it contains a comma, quote, or line break.
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_line(fields: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    fields
        .into_iter()
        .map(|field| escape_field(field.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Empty input renders an empty document, matching the previous dataset behaviour.
pub fn render_applications_csv(rows: &[ApplicationExportRow]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(render_line(HEADERS));
    lines.extend(rows.iter().map(|row| render_line(row.cells())));
    lines.join("\n")
}

/// Where export rows come from.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Newest first.
    async fn application_rows(&self) -> Result<Vec<ApplicationExportRow>, QueueStorageError>;
}

pub struct CsvDatasetExporter {
    source: Arc<dyn DatasetSource>,
    output_dir: PathBuf,
}

impl CsvDatasetExporter {
    pub fn new(source: Arc<dyn DatasetSource>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(APPLICATIONS_DATASET_FILE)
    }
}

async fn write_atomically(dir: &Path, target: &Path, contents: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(".{APPLICATIONS_DATASET_FILE}.tmp"));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, target).await
}

#[async_trait]
impl DatasetExporter for CsvDatasetExporter {
    async fn refresh(&self) -> Result<ExportSummary, ExportError> {
        let rows = self.source.application_rows().await?;
        let csv = render_applications_csv(&rows);
        let target = self.output_path();
        write_atomically(&self.output_dir, &target, &csv).await?;

        info!(
            rows = rows.len(),
            bytes = csv.len(),
            path = %target.display(),
            "applications dataset refreshed"
        );
        Ok(ExportSummary {
            rows: rows.len(),
            bytes: csv.len(),
        })
    }
}
