mod common;

use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{
    assert_non_decreasing, harness, harness_with, query, FakeCompleter, FakeEmbedder, FakeStore,
    Reply,
};
use docquery::error::{ErrorCode, PipelineError};
use docquery::inference::InferencePipeline;
use docquery::ingest::IngestPipeline;
use docquery::models::{CompletionRequest, DocumentAddRequest, QueryRequest};
use docquery::pipeline::Outcome;
use docquery::progress::{Channel, RequestEvents};
use docquery::prompt::PromptRegistry;

// ============ Query pipeline ============

#[tokio::test]
async fn answers_a_grounded_question() {
    let h = harness();
    let outcome = h
        .query_pipeline()
        .run(&query(), &CancellationToken::new(), &h.events(Channel::QueryDocument))
        .await;

    assert_eq!(
        outcome,
        Outcome::Success {
            text: "Alpha is the first letter.".into()
        }
    );

    let progress = h.sink.progress();
    assert_non_decreasing(&progress);
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));

    let responses = h.sink.responses();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].success);
    assert!(!responses[0].result.is_empty());
    assert!(h.sink.last_is_response());

    assert_eq!(
        *h.embedder.calls.lock().unwrap(),
        vec!["alpha beta".to_string(), "What is alpha?".to_string()]
    );
    assert_eq!(h.search_calls(), 2);

    let prompts = h.completer.prompts.lock().unwrap();
    assert_eq!(
        prompts[0],
        "[INST] Explain alpha.\n\nContext: alpha is the first letter\n\nbeta is the second letter\n\n [/INST]"
    );

    let saved = h.store.questions.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].document_id, "doc1");
    assert_eq!(saved[0].keywords, vec!["alpha", "beta"]);
    assert_eq!(saved[0].response, "Alpha is the first letter.");
    assert_eq!(saved[0].prompt_type, "llama");
}

#[tokio::test]
async fn stored_question_keeps_the_prompt_type_used() {
    let h = harness();
    for (requested, stored) in [("ChatML ", "chatml"), ("no-such-type", "llama"), ("", "llama")] {
        let request = QueryRequest {
            prompt_type: requested.into(),
            ..query()
        };
        let outcome = h
            .query_pipeline()
            .run(&request, &CancellationToken::new(), &h.events(Channel::QueryDocument))
            .await;
        assert!(outcome.is_success(), "{:?}", outcome);
        let saved = h.store.questions.lock().unwrap();
        assert_eq!(saved.last().unwrap().prompt_type, stored, "requested {:?}", requested);
    }
}

#[tokio::test]
async fn missing_document_fails_at_search() {
    let h = harness();
    let request = QueryRequest {
        document_id: "nope".into(),
        ..query()
    };
    let outcome = h
        .query_pipeline()
        .run(&request, &CancellationToken::new(), &h.events(Channel::QueryDocument))
        .await;

    assert_eq!(outcome.code(), Some(ErrorCode::SearchFailed));
    let responses = h.sink.responses();
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].success);
    let message = responses[0].error.as_deref().unwrap();
    assert!(message.contains("keyword search"), "{}", message);
    assert!(message.contains("document with ID nope not found"), "{}", message);
    assert!(h.sink.progress().iter().all(|p| *p < 100));

    assert_eq!(h.search_calls(), 1);
    assert_eq!(h.completer.call_count(), 0);
    assert!(h.store.questions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_between_embeddings_stops_before_search() {
    let token = CancellationToken::new();
    let h = harness_with(
        FakeEmbedder {
            cancel_after_first: Some(token.clone()),
            ..Default::default()
        },
        FakeCompleter::new(Reply::Text("unused".into())),
        FakeStore::default(),
    );
    let outcome = h
        .query_pipeline()
        .run(&query(), &token, &h.events(Channel::QueryDocument))
        .await;

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(h.embedder.call_count(), 1);
    assert_eq!(h.search_calls(), 0);
    assert_eq!(h.completer.call_count(), 0);

    let responses = h.sink.responses();
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].success);
    assert_eq!(responses[0].code, Some(ErrorCode::Cancelled));
    assert_eq!(
        responses[0].error.as_deref(),
        Some("Operation cancelled by user")
    );
}

#[tokio::test]
async fn already_cancelled_makes_no_calls() {
    let h = harness();
    let token = CancellationToken::new();
    token.cancel();
    let outcome = h
        .query_pipeline()
        .run(&query(), &token, &h.events(Channel::QueryDocument))
        .await;

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(h.embedder.call_count(), 0);
    assert_eq!(h.search_calls(), 0);
    assert_eq!(h.completer.call_count(), 0);
    assert!(h.store.questions.lock().unwrap().is_empty());
    assert_eq!(h.sink.responses().len(), 1);
}

#[tokio::test]
async fn validation_comes_before_cancellation() {
    let h = harness();
    let token = CancellationToken::new();
    token.cancel();
    let request = QueryRequest {
        document_id: String::new(),
        ..query()
    };
    let outcome = h
        .query_pipeline()
        .run(&request, &token, &h.events(Channel::QueryDocument))
        .await;

    assert_eq!(outcome.code(), Some(ErrorCode::Validation));
    let responses = h.sink.responses();
    assert_eq!(responses.len(), 1);
    assert!(responses[0]
        .error
        .as_deref()
        .unwrap()
        .contains("documentId"));
    assert_eq!(h.embedder.call_count(), 0);
}

#[tokio::test]
async fn cancel_during_generation() {
    let h = harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::WaitForCancel),
        FakeStore::default(),
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let outcome = h
        .query_pipeline()
        .run(&query(), &token, &h.events(Channel::QueryDocument))
        .await;

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(h.completer.call_count(), 1);
    assert!(h.store.questions.lock().unwrap().is_empty());
    assert_eq!(h.sink.responses().len(), 1);
}

#[tokio::test]
async fn completion_failure_is_generation_failed() {
    let h = harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::Fail),
        FakeStore::default(),
    );
    let outcome = h
        .query_pipeline()
        .run(&query(), &CancellationToken::new(), &h.events(Channel::QueryDocument))
        .await;

    assert_eq!(outcome.code(), Some(ErrorCode::GenerationFailed));
    assert!(h.store.questions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn embedding_failure_names_the_step() {
    let h = harness_with(
        FakeEmbedder {
            fail_on: Some("What is".into()),
            ..Default::default()
        },
        FakeCompleter::new(Reply::Text("unused".into())),
        FakeStore::default(),
    );
    let outcome = h
        .query_pipeline()
        .run(&query(), &CancellationToken::new(), &h.events(Channel::QueryDocument))
        .await;

    match outcome {
        Outcome::Failed { code, message } => {
            assert_eq!(code, ErrorCode::EmbeddingFailed);
            assert!(message.starts_with("prompt embedding failed"), "{}", message);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.search_calls(), 0);
}

#[tokio::test]
async fn persistence_failure_still_succeeds() {
    let h = harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::Text("Alpha.".into())),
        FakeStore {
            fail: true,
            ..Default::default()
        },
    );
    let outcome = h
        .query_pipeline()
        .run(&query(), &CancellationToken::new(), &h.events(Channel::QueryDocument))
        .await;

    assert!(outcome.is_success());
    assert_eq!(h.sink.progress().last(), Some(&100));
    assert!(h.sink.responses()[0].success);
}

#[tokio::test]
async fn generated_text_mentioning_errors_is_a_success() {
    let h = harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::Text(
            "error: none. The Error function is defined as erf(x).".into(),
        )),
        FakeStore::default(),
    );
    let outcome = h
        .query_pipeline()
        .run(&query(), &CancellationToken::new(), &h.events(Channel::QueryDocument))
        .await;

    assert!(outcome.is_success());
    let responses = h.sink.responses();
    assert!(responses[0].success);
    assert!(responses[0].error.is_none());
}

// ============ Dispatch ============

#[tokio::test]
async fn panic_becomes_one_internal_failure() {
    let h = harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::Panic),
        FakeStore::default(),
    );
    let app = h.app();
    let ticket = app.dispatch_query(query());
    assert_eq!(ticket.operation_id, "r-1");

    let outcome = ticket.wait().await;
    assert_eq!(outcome.code(), Some(ErrorCode::Internal));

    let responses = h.sink.responses();
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].success);
    assert!(responses[0]
        .error
        .as_deref()
        .unwrap()
        .contains("completer exploded"));
    assert!(app.active_operations().is_empty());
}

#[tokio::test]
async fn malformed_payload_is_rejected_with_one_response() {
    let h = harness();
    let app = h.app();
    let result = app.submit_query(json!({
        "requestId": "r-9",
        "searchKeywords": "not-a-list"
    }));

    assert!(matches!(result, Err(PipelineError::Validation(_))));
    let responses = h.sink.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].request_id, "r-9");
    assert_eq!(responses[0].code, Some(ErrorCode::Validation));
    assert_eq!(h.embedder.call_count(), 0);
}

#[tokio::test]
async fn cancel_by_operation_id() {
    let h = harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::WaitForCancel),
        FakeStore::default(),
    );
    let app = h.app();
    let ticket = app
        .submit_query(serde_json::to_value(query()).unwrap())
        .unwrap();

    for _ in 0..100 {
        if h.completer.call_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(app.active_operations(), vec!["r-1".to_string()]);
    assert!(app.cancel("r-1"));
    assert!(!app.cancel("someone-else"));

    assert_eq!(ticket.wait().await, Outcome::Cancelled);
    assert!(app.active_operations().is_empty());
}

#[tokio::test]
async fn empty_request_id_gets_a_generated_operation_id() {
    let h = harness();
    let app = h.app();
    let ticket = app.dispatch_query(QueryRequest {
        request_id: String::new(),
        ..query()
    });
    assert_eq!(ticket.request_id, "");
    assert_eq!(ticket.operation_id.len(), 36);
    assert!(ticket.wait().await.is_success());
}

// ============ Inference ============

#[tokio::test]
async fn plain_completion_is_formatted_and_saved() {
    let h = harness_with(
        FakeEmbedder::default(),
        FakeCompleter::new(Reply::Text("Hello!".into())),
        FakeStore::default(),
    );
    let pipeline = InferencePipeline::new(
        h.completer.clone(),
        h.store.clone(),
        Arc::new(PromptRegistry::default()),
        Duration::from_secs(1),
    );
    let request = CompletionRequest {
        request_id: "r-1".into(),
        prompt_text: "Say hello".into(),
        prompt_type: "chatml".into(),
        ..Default::default()
    };
    let outcome = pipeline
        .run(
            &request,
            &CancellationToken::new(),
            &h.events(Channel::InferenceCompletion),
        )
        .await;

    assert_eq!(
        outcome,
        Outcome::Success {
            text: "Hello!".into()
        }
    );
    assert_eq!(
        h.completer.prompts.lock().unwrap()[0],
        "<|im_start|>user\nSay hello<|im_end|>\n<|im_start|>assistant\n"
    );
    let saved = h.store.inferences.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].question, "Say hello");
    assert_eq!(saved[0].prompt_type, "chatml");
    assert_eq!(h.sink.progress().last(), Some(&100));
}

#[tokio::test]
async fn empty_completion_prompt_is_invalid() {
    let h = harness();
    let pipeline = InferencePipeline::new(
        h.completer.clone(),
        h.store.clone(),
        Arc::new(PromptRegistry::default()),
        Duration::from_secs(1),
    );
    let outcome = pipeline
        .run(
            &CompletionRequest::default(),
            &CancellationToken::new(),
            &h.events(Channel::InferenceCompletion),
        )
        .await;
    assert_eq!(outcome.code(), Some(ErrorCode::Validation));
    assert_eq!(h.completer.call_count(), 0);
}

// ============ Ingestion ============

fn source_file(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn add_request(path: &std::path::Path) -> DocumentAddRequest {
    DocumentAddRequest {
        request_id: "r-1".into(),
        index_name: "letters".into(),
        title: "Letters".into(),
        source_location: path.display().to_string(),
        embedding_type: "text".into(),
        chunk_size: Some(8),
        ..Default::default()
    }
}

#[tokio::test]
async fn ingests_text_and_skips_repeated_chunks() {
    let h = harness();
    let file = source_file(
        "Alpha is the first letter.\n\nBeta is the second.\n\nAlpha is the first letter.",
    );
    let pipeline = IngestPipeline::new(h.embedder.clone(), h.memory.clone(), "idx1", 2, 256);

    let outcome = pipeline
        .run(
            &add_request(file.path()),
            &CancellationToken::new(),
            &h.events(Channel::AddDocument),
        )
        .await;

    let Outcome::Success { text: document_id } = outcome else {
        panic!("ingestion failed: {:?}", outcome);
    };
    let stored = h.memory.document("letters", &document_id).unwrap();
    assert_eq!(stored.title, "Letters");
    assert_eq!(stored.doc_chunks.len(), 2);
    assert_eq!(stored.doc_chunks[0].vector, vec![1.0, 0.0]);
    assert_eq!(h.embedder.call_count(), 2);

    let progress = h.sink.progress();
    assert_non_decreasing(&progress);
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn ingestion_skips_chunks_that_fail_to_embed() {
    let h = harness_with(
        FakeEmbedder {
            fail_on: Some("Beta".into()),
            ..Default::default()
        },
        FakeCompleter::new(Reply::Text("unused".into())),
        FakeStore::default(),
    );
    let file = source_file("Alpha is the first letter.\n\nBeta is the second.");
    let pipeline = IngestPipeline::new(h.embedder.clone(), h.memory.clone(), "idx1", 2, 256);

    let outcome = pipeline
        .run(
            &add_request(file.path()),
            &CancellationToken::new(),
            &h.events(Channel::AddDocument),
        )
        .await;

    let Outcome::Success { text: document_id } = outcome else {
        panic!("ingestion failed: {:?}", outcome);
    };
    let stored = h.memory.document("letters", &document_id).unwrap();
    assert_eq!(stored.doc_chunks.len(), 1);
    assert_eq!(stored.doc_chunks[0].text_chunk, "Alpha is the first letter.");
}

#[tokio::test]
async fn ingestion_fails_when_nothing_embeds() {
    let h = harness_with(
        FakeEmbedder {
            fail_on: Some("letter".into()),
            ..Default::default()
        },
        FakeCompleter::new(Reply::Text("unused".into())),
        FakeStore::default(),
    );
    let file = source_file("Alpha is the first letter.");
    let pipeline = IngestPipeline::new(h.embedder.clone(), h.memory.clone(), "idx1", 2, 256);

    let outcome = pipeline
        .run(
            &add_request(file.path()),
            &CancellationToken::new(),
            &h.events(Channel::AddDocument),
        )
        .await;

    assert_eq!(outcome.code(), Some(ErrorCode::EmbeddingFailed));
    assert!(h.memory.is_empty("letters"));
}

#[tokio::test]
async fn ingestion_rejects_unknown_types_and_missing_files() {
    let h = harness();
    let pipeline = IngestPipeline::new(h.embedder.clone(), h.memory.clone(), "idx1", 2, 256);

    let docx = DocumentAddRequest {
        embedding_type: "docx".into(),
        ..add_request(std::path::Path::new("/tmp/x.docx"))
    };
    let outcome = pipeline
        .run(&docx, &CancellationToken::new(), &h.events(Channel::AddDocument))
        .await;
    assert_eq!(outcome.code(), Some(ErrorCode::Validation));

    let missing = add_request(std::path::Path::new("/nonexistent/dq/letters.txt"));
    let outcome = pipeline
        .run(
            &missing,
            &CancellationToken::new(),
            &RequestEvents::new(h.sink.clone(), Channel::AddDocument, "r-2"),
        )
        .await;
    assert_eq!(outcome.code(), Some(ErrorCode::Validation));
    assert_eq!(h.embedder.call_count(), 0);
}

#[tokio::test]
async fn ingests_csv_rows_with_headers() {
    let h = harness();
    let file = source_file("letter,meaning\nalpha,first\nbeta,second\n");
    let pipeline = IngestPipeline::new(h.embedder.clone(), h.memory.clone(), "idx1", 2, 256);
    let request = DocumentAddRequest {
        embedding_type: "csv".into(),
        ..add_request(file.path())
    };

    let outcome = pipeline
        .run(&request, &CancellationToken::new(), &h.events(Channel::AddDocument))
        .await;

    let Outcome::Success { text: document_id } = outcome else {
        panic!("ingestion failed: {:?}", outcome);
    };
    let stored = h.memory.document("letters", &document_id).unwrap();
    let texts: Vec<&str> = stored
        .doc_chunks
        .iter()
        .map(|c| c.text_chunk.as_str())
        .collect();
    assert_eq!(
        texts,
        vec!["letter alpha meaning first", "letter beta meaning second"]
    );
}

#[tokio::test]
async fn chunk_overlap_repeats_the_previous_tail() {
    let h = harness();
    let words: Vec<String> = (0..12).map(|i| format!("alpha{:02}", i)).collect();
    let file = source_file(&words.join(" "));
    let pipeline = IngestPipeline::new(h.embedder.clone(), h.memory.clone(), "idx1", 2, 256)
        .with_overlap(3);

    let outcome = pipeline
        .run(
            &add_request(file.path()),
            &CancellationToken::new(),
            &h.events(Channel::AddDocument),
        )
        .await;

    let Outcome::Success { text: document_id } = outcome else {
        panic!("ingestion failed: {:?}", outcome);
    };
    let stored = h.memory.document("letters", &document_id).unwrap();
    assert!(stored.doc_chunks.len() > 1);
    let first_tail = stored.doc_chunks[0].text_chunk.rsplit(' ').next().unwrap();
    assert!(stored.doc_chunks[1].text_chunk.starts_with(first_tail));
}
