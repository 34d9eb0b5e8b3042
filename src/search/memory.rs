//! In-process search backend.
//!
//! Holds indexed documents in memory and ranks a document's chunks by
//! cosine similarity to the query vector. Useful for tests and for running
//! the pipeline without a search cluster.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use super::{
    DocumentCatalog, DocumentFilter, DocumentIndexer, DocumentNotFound, DocumentSummary,
    IndexedDocument, VectorSearch, CHUNK_SEPARATOR,
};
use crate::embedding::cosine_similarity;
use crate::error::Cancelled;

struct MemoryIndex {
    dims: usize,
    documents: HashMap<String, IndexedDocument>,
}

#[derive(Default)]
pub struct MemorySearch {
    indices: RwLock<HashMap<String, MemoryIndex>>,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `document` under a caller-chosen ID, creating the index if
    /// needed.
    pub fn insert(&self, index: &str, document_id: &str, document: IndexedDocument) {
        let dims = document
            .doc_chunks
            .first()
            .map(|c| c.vector.len())
            .unwrap_or_default();
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        indices
            .entry(index.to_string())
            .or_insert_with(|| MemoryIndex {
                dims,
                documents: HashMap::new(),
            })
            .documents
            .insert(document_id.to_string(), document);
    }

    pub fn document(&self, index: &str, document_id: &str) -> Option<IndexedDocument> {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        indices.get(index)?.documents.get(document_id).cloned()
    }

    pub fn len(&self, index: &str) -> usize {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        indices.get(index).map(|i| i.documents.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }
}

#[async_trait]
impl VectorSearch for MemorySearch {
    async fn search_document_chunks(
        &self,
        cancel: &CancellationToken,
        index_id: &str,
        document_id: &str,
        vector: &[f32],
        max_results: usize,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        let Some(document) = indices
            .get(index_id)
            .and_then(|index| index.documents.get(document_id))
        else {
            return Err(DocumentNotFound {
                index_id: index_id.to_string(),
                document_id: document_id.to_string(),
            }
            .into());
        };

        let mut scored: Vec<(f32, &str)> = document
            .doc_chunks
            .iter()
            .map(|c| (cosine_similarity(vector, &c.vector), c.text_chunk.as_str()))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(max_results)
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join(CHUNK_SEPARATOR))
    }
}

#[async_trait]
impl DocumentIndexer for MemorySearch {
    async fn ensure_index(&self, index: &str, dims: usize) -> Result<bool> {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        if indices.contains_key(index) {
            return Ok(false);
        }
        indices.insert(
            index.to_string(),
            MemoryIndex {
                dims,
                documents: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn index_document(
        &self,
        cancel: &CancellationToken,
        index: &str,
        document: &IndexedDocument,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        let Some(target) = indices.get_mut(index) else {
            bail!("index '{}' does not exist", index);
        };
        if let Some(bad) = document
            .doc_chunks
            .iter()
            .find(|c| c.vector.len() != target.dims)
        {
            bail!(
                "chunk vector has {} dimensions, index '{}' expects {}",
                bad.vector.len(),
                index,
                target.dims
            );
        }
        let id = uuid::Uuid::new_v4().to_string();
        target.documents.insert(id.clone(), document.clone());
        Ok(id)
    }
}

#[async_trait]
impl DocumentCatalog for MemorySearch {
    async fn find_documents(
        &self,
        cancel: &CancellationToken,
        index: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<DocumentSummary>> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let from = parse_bound(&filter.date_from, false)?;
        let to = parse_bound(&filter.date_to, true)?;

        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        let Some(target) = indices.get(index) else {
            bail!("index '{}' does not exist", index);
        };

        let mut found: Vec<(usize, DocumentSummary)> = Vec::new();
        for (id, doc) in &target.documents {
            let mut score = 0;
            let mut matched = true;
            for (query, field) in [
                (&filter.title, &doc.title),
                (&filter.meta_text_desc, &doc.meta_text_desc),
                (&filter.meta_key_words, &doc.meta_key_words),
            ] {
                if query.trim().is_empty() {
                    continue;
                }
                let hits = term_hits(query, field);
                matched &= hits > 0;
                score += hits;
            }
            if from.is_some() || to.is_some() {
                let stamp = DateTime::parse_from_rfc3339(&doc.timestamp)
                    .map(|t| t.with_timezone(&Utc))
                    .ok();
                matched &= match stamp {
                    Some(t) => from.map_or(true, |f| t >= f) && to.map_or(true, |u| t <= u),
                    None => false,
                };
            }
            if matched {
                found.push((
                    score,
                    DocumentSummary {
                        id: id.clone(),
                        title: doc.title.clone(),
                        meta_text_desc: doc.meta_text_desc.clone(),
                        meta_key_words: doc.meta_key_words.clone(),
                        source_location: doc.source_location.clone(),
                        timestamp: doc.timestamp.clone(),
                    },
                ));
            }
        }

        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(found
            .into_iter()
            .take(filter.size())
            .map(|(_, summary)| summary)
            .collect())
    }
}

/// Query terms (case-insensitive) that occur as words of `field`.
fn term_hits(query: &str, field: &str) -> usize {
    let words: Vec<String> = field
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| words.contains(&t.to_lowercase()))
        .count()
}

/// A date bound as an instant. A bare date covers the whole day.
fn parse_bound(raw: &str, end_of_day: bool) -> Result<Option<DateTime<Utc>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(t.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date bound '{}'", raw))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time.map(|t| t.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::DocumentChunk;

    fn doc(chunks: &[(&str, [f32; 2])]) -> IndexedDocument {
        IndexedDocument {
            title: "t".into(),
            meta_text_desc: String::new(),
            meta_key_words: String::new(),
            source_location: String::new(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            doc_chunks: chunks
                .iter()
                .map(|(text, v)| DocumentChunk {
                    text_chunk: text.to_string(),
                    vector: v.to_vec(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn ranks_by_similarity_and_limits() {
        let search = MemorySearch::new();
        search.insert(
            "idx1",
            "doc1",
            doc(&[("far", [0.0, 1.0]), ("near", [1.0, 0.0]), ("mid", [1.0, 1.0])]),
        );
        let token = CancellationToken::new();
        let text = search
            .search_document_chunks(&token, "idx1", "doc1", &[1.0, 0.0], 2)
            .await
            .unwrap();
        assert_eq!(text, "near\n\nmid");
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let search = MemorySearch::new();
        search.insert("idx1", "doc1", doc(&[("x", [1.0, 0.0])]));
        let err = search
            .search_document_chunks(&CancellationToken::new(), "idx1", "nope", &[1.0, 0.0], 5)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<DocumentNotFound>().is_some());
    }

    #[tokio::test]
    async fn indexing_checks_dimensions() {
        let search = MemorySearch::new();
        assert!(search.ensure_index("idx1", 3).await.unwrap());
        assert!(!search.ensure_index("idx1", 3).await.unwrap());
        let err = search
            .index_document(&CancellationToken::new(), "idx1", &doc(&[("x", [1.0, 0.0])]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expects 3"));
        assert!(search.is_empty("idx1"));
    }

    fn described(title: &str, keywords: &str, timestamp: &str) -> IndexedDocument {
        IndexedDocument {
            title: title.into(),
            meta_key_words: keywords.into(),
            timestamp: timestamp.into(),
            ..doc(&[("x", [1.0, 0.0])])
        }
    }

    #[tokio::test]
    async fn finds_documents_by_fields() {
        let search = MemorySearch::new();
        for (id, title, keywords, timestamp) in [
            ("hb", "Employee Handbook", "onboarding, laptop", "2026-02-01T09:00:00Z"),
            ("pol", "Travel policy", "travel", "2026-03-15T09:00:00Z"),
            ("old", "Old handbook", "archive", "2025-06-01T09:00:00Z"),
        ] {
            search.insert("idx1", id, described(title, keywords, timestamp));
        }
        let token = CancellationToken::new();

        let by_title = search
            .find_documents(&token, "idx1", &DocumentFilter {
                title: "handbook".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = by_title.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["hb", "old"]);

        let narrowed = search
            .find_documents(&token, "idx1", &DocumentFilter {
                title: "handbook".into(),
                meta_key_words: "LAPTOP".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].id, "hb");
        assert_eq!(narrowed[0].title, "Employee Handbook");

        let dated = search
            .find_documents(&token, "idx1", &DocumentFilter {
                date_from: "2026-01-01".into(),
                date_to: "2026-02-01".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(dated.len(), 1);
        assert_eq!(dated[0].id, "hb");

        let everything = search
            .find_documents(&token, "idx1", &DocumentFilter {
                size: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn lookup_rejects_bad_dates_and_unknown_indices() {
        let search = MemorySearch::new();
        search.insert("idx1", "doc1", doc(&[("x", [1.0, 0.0])]));
        let token = CancellationToken::new();
        let bad = DocumentFilter {
            date_from: "last tuesday".into(),
            ..Default::default()
        };
        assert!(search.find_documents(&token, "idx1", &bad).await.is_err());
        assert!(search
            .find_documents(&token, "nope", &DocumentFilter::default())
            .await
            .is_err());
    }
}
