//! Source document loading.
//!
//! Plain text is read as UTF-8 (invalid sequences replaced). PDFs go
//! through `pdf-extract` on the blocking pool. CSV files become one
//! paragraph per row, each value prefixed by its column header, so the
//! chunker keeps rows together. Other formats are rejected by request
//! validation before they reach this module.

use std::path::Path;

use crate::models::{EMBEDDING_TYPE_CSV, EMBEDDING_TYPE_PDF, EMBEDDING_TYPE_TEXT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Text,
    Pdf,
    Csv,
}

impl SourceFormat {
    pub fn from_embedding_type(embedding_type: &str) -> Result<Self, ExtractError> {
        match embedding_type {
            EMBEDDING_TYPE_TEXT => Ok(SourceFormat::Text),
            EMBEDDING_TYPE_PDF => Ok(SourceFormat::Pdf),
            EMBEDDING_TYPE_CSV => Ok(SourceFormat::Csv),
            other => Err(ExtractError::Unsupported(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported document type: {0}")]
    Unsupported(String),

    #[error("cannot read {path}: {error}")]
    Read {
        path: String,
        #[source]
        error: std::io::Error,
    },

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("CSV parsing failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("document contains no text")]
    Empty,
}

/// Loads the text of the document at `path`.
pub async fn load_document(path: &Path, format: SourceFormat) -> Result<String, ExtractError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|error| ExtractError::Read {
            path: path.display().to_string(),
            error,
        })?;

    let text = match format {
        SourceFormat::Text => String::from_utf8_lossy(&bytes).into_owned(),
        SourceFormat::Pdf => tokio::task::spawn_blocking(move || extract_pdf(&bytes))
            .await
            .map_err(|e| ExtractError::Pdf(e.to_string()))??,
        SourceFormat::Csv => extract_csv(&bytes)?,
    };

    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    tracing::debug!(path = %path.display(), chars = text.len(), ?format, "loaded document");
    Ok(text)
}

pub fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Renders each data row as `header value header value ...`. The first
/// record is the header row; short rows are tolerated.
pub fn extract_csv(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.replace('"', ""))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| format!("{} {}", header, value.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" ");
        if !row.trim().is_empty() {
            rows.push(row);
        }
    }
    Ok(rows.join("\n\n"))
}
