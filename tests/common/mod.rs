//! Fakes shared by the integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use docquery::app::{App, AppSettings, Services};
use docquery::completion::Completer;
use docquery::embedding::Embedder;
use docquery::models::{
    CompletionOptions, EmbeddingOptions, InferenceRecord, QueryRequest, QuestionRecord,
    StoredInference,
};
use docquery::pipeline::{PipelineSettings, QueryPipeline, QueryServices};
use docquery::progress::{Channel, EventSink, PipelineEvent, RequestEvents, ResponseEvent};
use docquery::prompt::PromptRegistry;
use docquery::search::memory::MemorySearch;
use docquery::search::{DocumentChunk, IndexedDocument, VectorSearch};
use docquery::store::QuestionStore;

#[derive(Default)]
pub struct Sink {
    pub events: Mutex<Vec<PipelineEvent>>,
}

impl EventSink for Sink {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Sink {
    pub fn progress(&self) -> Vec<u8> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Progress { event, .. } => Some(event.progress),
                _ => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<ResponseEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Response { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_is_response(&self) -> bool {
        matches!(
            self.events.lock().unwrap().last(),
            Some(PipelineEvent::Response { .. })
        )
    }
}

/// Texts mentioning "alpha" point one way, everything else the other.
#[derive(Default)]
pub struct FakeEmbedder {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Option<String>,
    pub cancel_after_first: Option<CancellationToken>,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(
        &self,
        _cancel: &CancellationToken,
        _options: &EmbeddingOptions,
        text: &str,
    ) -> Result<Vec<f32>> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(text.to_string());
            calls.len() == 1
        };
        if let Some(needle) = &self.fail_on {
            if text.contains(needle.as_str()) {
                bail!("embedding executable crashed");
            }
        }
        if first {
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
        }
        Ok(if text.to_lowercase().contains("alpha") {
            vec![1.0, 0.0]
        } else {
            vec![0.0, 1.0]
        })
    }
}

impl FakeEmbedder {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub struct CountingSearch {
    pub inner: Arc<MemorySearch>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl VectorSearch for CountingSearch {
    async fn search_document_chunks(
        &self,
        cancel: &CancellationToken,
        index_id: &str,
        document_id: &str,
        vector: &[f32],
        max_results: usize,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .search_document_chunks(cancel, index_id, document_id, vector, max_results)
            .await
    }
}

pub enum Reply {
    Text(String),
    Fail,
    Panic,
    WaitForCancel,
}

pub struct FakeCompleter {
    pub reply: Reply,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeCompleter {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Completer for FakeCompleter {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        _options: &CompletionOptions,
        prompt: &str,
    ) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match &self.reply {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail => Err(anyhow!("model exited with status 1")),
            Reply::Panic => panic!("completer exploded"),
            Reply::WaitForCancel => {
                cancel.cancelled().await;
                Err(docquery::error::ProcessError::Cancelled.into())
            }
        }
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub questions: Mutex<Vec<QuestionRecord>>,
    pub inferences: Mutex<Vec<InferenceRecord>>,
    pub fail: bool,
}

#[async_trait]
impl QuestionStore for FakeStore {
    async fn save_question(&self, record: &QuestionRecord) -> Result<String> {
        if self.fail {
            bail!("database is locked");
        }
        self.questions.lock().unwrap().push(record.clone());
        Ok("q-1".to_string())
    }

    async fn save_inference(&self, record: &InferenceRecord) -> Result<String> {
        if self.fail {
            bail!("database is locked");
        }
        self.inferences.lock().unwrap().push(record.clone());
        Ok("i-1".to_string())
    }

    async fn recent_inferences(&self, limit: i64) -> Result<Vec<StoredInference>> {
        let inferences = self.inferences.lock().unwrap();
        Ok(inferences
            .iter()
            .enumerate()
            .rev()
            .take(limit.max(0) as usize)
            .map(|(i, r)| StoredInference {
                id: format!("i-{}", i + 1),
                question: r.question.clone(),
                response: r.response.clone(),
                prompt_type: r.prompt_type.clone(),
                completion_args: r.completion_args.clone(),
                created_at: chrono::Utc::now(),
                processing_time_ms: r.processing_time_ms,
            })
            .collect())
    }
}

// ============ Harness ============

pub struct Harness {
    pub memory: Arc<MemorySearch>,
    pub search: Arc<CountingSearch>,
    pub embedder: Arc<FakeEmbedder>,
    pub completer: Arc<FakeCompleter>,
    pub store: Arc<FakeStore>,
    pub sink: Arc<Sink>,
}

pub fn chunk(text: &str, vector: [f32; 2]) -> DocumentChunk {
    DocumentChunk {
        text_chunk: text.to_string(),
        vector: vector.to_vec(),
    }
}

pub fn harness_with(embedder: FakeEmbedder, completer: FakeCompleter, store: FakeStore) -> Harness {
    let memory = Arc::new(MemorySearch::new());
    memory.insert(
        "idx1",
        "doc1",
        IndexedDocument {
            title: "Letters".into(),
            meta_text_desc: String::new(),
            meta_key_words: String::new(),
            source_location: "/tmp/letters.txt".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            doc_chunks: vec![
                chunk("alpha is the first letter", [1.0, 0.0]),
                chunk("beta is the second letter", [0.5, 0.5]),
                chunk("gamma is unrelated", [0.0, 1.0]),
            ],
        },
    );
    Harness {
        search: Arc::new(CountingSearch {
            inner: memory.clone(),
            calls: AtomicUsize::new(0),
        }),
        memory,
        embedder: Arc::new(embedder),
        completer: Arc::new(completer),
        store: Arc::new(store),
        sink: Arc::new(Sink::default()),
    }
}

pub fn harness() -> Harness {
    harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::Text("Alpha is the first letter.".into())),
        FakeStore::default(),
    )
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        max_results: 2,
        persistence_timeout: Duration::from_secs(1),
    }
}

impl Harness {
    pub fn query_pipeline(&self) -> QueryPipeline {
        QueryPipeline::new(
            QueryServices {
                embedder: self.embedder.clone(),
                search: self.search.clone(),
                completer: self.completer.clone(),
                store: self.store.clone(),
                prompts: Arc::new(PromptRegistry::default()),
            },
            settings(),
        )
    }

    pub fn events(&self, channel: Channel) -> RequestEvents {
        RequestEvents::new(self.sink.clone(), channel, "r-1")
    }

    pub fn app(&self) -> App {
        App::new(
            Services {
                embedder: self.embedder.clone(),
                search: self.search.clone(),
                indexer: self.memory.clone(),
                catalog: self.memory.clone(),
                completer: self.completer.clone(),
                store: self.store.clone(),
                prompts: Arc::new(PromptRegistry::default()),
            },
            AppSettings {
                pipeline: settings(),
                default_index: "idx1".into(),
                embedding_dims: 2,
                chunk_tokens: 8,
                chunk_overlap: 0,
            },
            self.sink.clone(),
        )
    }

    pub fn search_calls(&self) -> usize {
        self.search.calls.load(Ordering::SeqCst)
    }
}

pub fn query() -> QueryRequest {
    QueryRequest {
        request_id: "r-1".into(),
        index_id: "idx1".into(),
        document_id: "doc1".into(),
        embedding_prompt: "What is alpha?".into(),
        document_prompt: "Explain alpha.".into(),
        prompt_type: "llama".into(),
        search_keywords: vec!["alpha".into(), "beta".into()],
        ..Default::default()
    }
}

pub fn assert_non_decreasing(progress: &[u8]) {
    for pair in progress.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {:?}", progress);
    }
}

