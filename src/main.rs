//! # docquery CLI (`dq`)
//!
//! Ask questions about one document at a time. `dq` embeds the question,
//! pulls the closest chunks of the target document from Elasticsearch, and
//! has a local model answer from that context.
//!
//! ## Usage
//!
//! ```bash
//! dq --config ./config/dq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dq init` | Create the SQLite database and the default search index |
//! | `dq serve` | Start the HTTP event server |
//! | `dq query` | Ask a question about one document |
//! | `dq complete` | Run a plain completion without retrieval |
//! | `dq add` | Chunk, embed and index a text, PDF or CSV file |
//! | `dq history` | Show recent questions and answers (`--inference` for completions) |
//! | `dq documents` | Find documents by title, description, keywords or date |
//! | `dq indices` | List search indices |
//!
//! ## Examples
//!
//! ```bash
//! dq add --title "Handbook" ./handbook.pdf --type pdf
//! dq query --document 3f2a... --keyword alpha --keyword beta \
//!     --question "What is alpha?"
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use docquery::app::{App, Ticket};
use docquery::config::{self, Config};
use docquery::migrate;
use docquery::models::{CompletionOptions, CompletionRequest, DocumentAddRequest, QueryRequest};
use docquery::pipeline::Outcome;
use docquery::progress::{EventSink, ProgressMode};
use docquery::search::{DocumentCatalog, DocumentFilter, DocumentIndexer, ElasticsearchClient};
use docquery::store::{QuestionStore, SqliteStore};
use tokio_util::sync::CancellationToken;

/// docquery: grounded answers from your own documents.
#[derive(Parser)]
#[command(
    name = "dq",
    about = "docquery: grounded answers from your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dq.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// More logging (-v info, -vv debug, -vvv trace). `DQ_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and the default search index.
    ///
    /// Safe to run more than once.
    Init {
        /// Do not contact the search backend.
        #[arg(long)]
        skip_index: bool,
    },

    /// Start the HTTP event server on `[server].bind`.
    Serve,

    /// Ask a question about one document.
    Query {
        /// Target document ID.
        #[arg(long)]
        document: String,

        /// Search index; defaults to `[search].default_index`.
        #[arg(long)]
        index: Option<String>,

        /// Search keyword (repeatable).
        #[arg(long = "keyword", short = 'k', required = true)]
        keywords: Vec<String>,

        /// Question used to retrieve context.
        #[arg(long)]
        question: String,

        /// Instruction given to the model; defaults to the question.
        #[arg(long)]
        instruction: Option<String>,

        #[arg(long, default_value = "")]
        prompt_type: String,

        #[arg(long)]
        temperature: Option<f32>,

        /// Maximum tokens to generate.
        #[arg(long)]
        predict: Option<i32>,

        /// Print the full response event as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run a plain completion without retrieval.
    Complete {
        prompt: String,

        #[arg(long, default_value = "")]
        prompt_type: String,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        predict: Option<i32>,

        #[arg(long)]
        json: bool,
    },

    /// Chunk, embed and index a document.
    Add {
        /// Path to the source file.
        path: PathBuf,

        #[arg(long)]
        title: String,

        /// `text`, `pdf` or `csv`.
        #[arg(long = "type", default_value = "text")]
        embedding_type: String,

        #[arg(long)]
        index: Option<String>,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "")]
        keywords: String,

        /// Chunk size in tokens; defaults to `[chunking].max_tokens`.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Tokens repeated between chunks; defaults to `[chunking].overlap_tokens`.
        #[arg(long)]
        chunk_overlap: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show recent questions and answers.
    History {
        /// Only questions about this document.
        #[arg(long, conflicts_with = "inference")]
        document: Option<String>,

        /// Show plain completions instead of document questions.
        #[arg(long)]
        inference: bool,

        #[arg(long, default_value = "10")]
        limit: i64,

        #[arg(long)]
        json: bool,
    },

    /// Find documents by title, description, keywords or import date.
    Documents {
        #[arg(long, default_value = "")]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "")]
        keywords: String,

        /// Imported on or after (RFC 3339 or `YYYY-MM-DD`).
        #[arg(long, default_value = "")]
        from: String,

        /// Imported on or before (RFC 3339 or `YYYY-MM-DD`).
        #[arg(long, default_value = "")]
        to: String,

        #[arg(long)]
        index: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// List search indices.
    Indices {
        #[arg(default_value = "*")]
        pattern: String,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DQ_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init { skip_index } => {
            migrate::run_migrations(&cfg.db).await?;
            println!("Database initialized at {}.", cfg.db.path.display());
            if !skip_index {
                let client = ElasticsearchClient::new(&cfg.search)?;
                let created = client
                    .ensure_index(&cfg.search.default_index, cfg.embedding.dims)
                    .await?;
                if created {
                    println!("Created index {}.", cfg.search.default_index);
                } else {
                    println!("Index {} already exists.", cfg.search.default_index);
                }
            }
        }
        Commands::Serve => {
            docquery::server::run_server(&cfg).await?;
        }
        Commands::Query {
            document,
            index,
            keywords,
            question,
            instruction,
            prompt_type,
            temperature,
            predict,
            json,
        } => {
            let app = build_app(&cfg, progress.sink()).await?;
            let request = QueryRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                index_id: index.unwrap_or_else(|| cfg.search.default_index.clone()),
                document_id: document,
                document_prompt: instruction.unwrap_or_else(|| question.clone()),
                embedding_prompt: question,
                prompt_type,
                search_keywords: keywords,
                completion_args: CompletionOptions {
                    temperature,
                    predict,
                    ..Default::default()
                },
                ..Default::default()
            };
            let started = Instant::now();
            let ticket = app.dispatch_query(request);
            report(&app, ticket, started, json).await?;
        }
        Commands::Complete {
            prompt,
            prompt_type,
            temperature,
            predict,
            json,
        } => {
            let app = build_app(&cfg, progress.sink()).await?;
            let request = CompletionRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                prompt_text: prompt,
                prompt_type,
                completion_args: CompletionOptions {
                    temperature,
                    predict,
                    ..Default::default()
                },
            };
            let started = Instant::now();
            let ticket = app.dispatch_completion(request);
            report(&app, ticket, started, json).await?;
        }
        Commands::Add {
            path,
            title,
            embedding_type,
            index,
            description,
            keywords,
            chunk_size,
            chunk_overlap,
            json,
        } => {
            let app = build_app(&cfg, progress.sink()).await?;
            let source = std::fs::canonicalize(&path).unwrap_or(path);
            let request = DocumentAddRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                index_name: index.unwrap_or_default(),
                title,
                meta_text_desc: description,
                meta_key_words: keywords,
                source_location: source.display().to_string(),
                embedding_type,
                chunk_size,
                chunk_overlap,
                ..Default::default()
            };
            let started = Instant::now();
            let ticket = app.dispatch_document(request);
            report(&app, ticket, started, json).await?;
        }
        Commands::History {
            inference: true,
            limit,
            json,
            ..
        } => {
            let store = SqliteStore::open(&cfg.db).await?;
            let inferences = QuestionStore::recent_inferences(&store, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&inferences)?);
            } else if inferences.is_empty() {
                println!("No completions yet.");
            } else {
                for record in &inferences {
                    println!(
                        "{}  {}  ({} ms)",
                        record.created_at.format("%Y-%m-%d %H:%M:%S"),
                        record.prompt_type,
                        record.processing_time_ms
                    );
                    println!("  Q: {}", record.question);
                    println!("  A: {}", record.response.replace('\n', "\n     "));
                }
            }
        }
        Commands::History {
            document,
            limit,
            json,
            ..
        } => {
            let store = SqliteStore::open(&cfg.db).await?;
            let questions = QuestionStore::recent_questions(
                &store,
                document.as_deref(),
                limit,
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&questions)?);
            } else if questions.is_empty() {
                println!("No questions yet.");
            } else {
                for q in &questions {
                    println!(
                        "{}  {}  ({} ms)",
                        q.created_at.format("%Y-%m-%d %H:%M:%S"),
                        q.document_id,
                        q.processing_time_ms
                    );
                    println!("  Q: {}", q.embed_prompt);
                    println!("  A: {}", q.response.replace('\n', "\n     "));
                }
            }
        }
        Commands::Documents {
            title,
            description,
            keywords,
            from,
            to,
            index,
            limit,
            json,
        } => {
            let client = ElasticsearchClient::new(&cfg.search)?;
            let filter = DocumentFilter {
                title,
                meta_text_desc: description,
                meta_key_words: keywords,
                date_from: from,
                date_to: to,
                size: limit,
            };
            let index = index.unwrap_or_else(|| cfg.search.default_index.clone());
            let documents = client
                .find_documents(&CancellationToken::new(), &index, &filter)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&documents)?);
            } else if documents.is_empty() {
                println!("No matching documents.");
            } else {
                for doc in &documents {
                    println!("{}  {}  {}", doc.id, doc.timestamp, doc.title);
                    if !doc.source_location.is_empty() {
                        println!("  {}", doc.source_location);
                    }
                }
            }
        }
        Commands::Indices { pattern } => {
            let client = ElasticsearchClient::new(&cfg.search)?;
            for name in client.list_indices(&pattern).await? {
                println!("{}", name);
            }
        }
    }

    Ok(())
}

async fn build_app(cfg: &Config, sink: Arc<dyn EventSink>) -> anyhow::Result<App> {
    App::from_config(cfg, sink).await
}

/// Waits for the run, cancelling it on Ctrl-C, and prints the result.
async fn report(app: &App, ticket: Ticket, started: Instant, json: bool) -> anyhow::Result<()> {
    let request_id = ticket.request_id.clone();
    let operation_id = ticket.operation_id.clone();
    let wait = ticket.wait();
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            app.cancel(&operation_id);
            wait.await
        }
    };

    if json {
        let response = outcome.to_response(&request_id, started.elapsed());
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    match outcome {
        Outcome::Success { text } => {
            if !json {
                println!("{}", text);
            }
            Ok(())
        }
        Outcome::Cancelled => bail!("{}", docquery::pipeline::CANCELLED_MESSAGE),
        Outcome::Failed { code, message } => bail!("{} ({})", message, code),
    }
}
