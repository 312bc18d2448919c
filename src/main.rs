//! PDF Dispatch
//!
//! Command line front end. `worker` is the child side of process isolation;
//! the other subcommands run one-off queries through a dispatcher.

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pdf_dispatch::engine::{self, DocumentSource};
use pdf_dispatch::references::DocumentRef;
use pdf_dispatch::protocol::{BookmarkNode, MetadataTag, PageSelector, Permissions};
use pdf_dispatch::worker::{self, Session};
use pdf_dispatch::{requests, Dispatcher, PoolConfig};

#[derive(Parser)]
#[command(name = "pdf-dispatch", version, about = "Concurrent dispatch over a native PDF engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the worker protocol on stdin/stdout
    Worker,
    /// Print document information as JSON
    Info {
        file: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Print the text of one page
    Text {
        file: PathBuf,
        /// Zero-based page index
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Serialize)]
struct DocumentInfo {
    page_count: usize,
    file_version: Option<u32>,
    permissions: Permissions,
    metadata: Vec<(MetadataTag, String)>,
    bookmarks: Vec<BookmarkNode>,
}

fn main() -> anyhow::Result<()> {
    // stdout carries worker replies, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdf_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Command::Worker => run_worker(),
        Command::Info { file, password } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(info(file, password))
        }
        Command::Text {
            file,
            page,
            password,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(text(file, page, password))
        }
    }
}

fn run_worker() -> anyhow::Result<()> {
    let engine = engine::default_factory()
        .create()
        .map_err(|failure| anyhow::anyhow!(failure))
        .context("Failed to start native engine")?;
    let mut session = Session::new(engine);

    let stdin = io::stdin();
    let stdout = io::stdout();
    worker::serve(&mut session, stdin.lock(), stdout.lock())?;
    Ok(())
}

fn dispatcher() -> anyhow::Result<Dispatcher> {
    let config = PoolConfig::from_env().context("Invalid PDF_POOL_* configuration")?;
    tracing::debug!(?config, "pool configuration");
    Ok(Dispatcher::new(config)?)
}

async fn info(file: PathBuf, password: Option<String>) -> anyhow::Result<()> {
    let dispatcher = dispatcher()?;
    let open = requests::OpenDocument {
        source: DocumentSource::from_path(&file),
        password,
    };
    let result = dispatcher
        .with_document(open, |dispatcher, document| {
            describe(dispatcher, document).boxed()
        })
        .await;
    dispatcher.shutdown().await;

    let info = result.with_context(|| format!("Failed to read {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn describe(dispatcher: &Dispatcher, document: DocumentRef) -> anyhow::Result<DocumentInfo> {
    let page_count = dispatcher
        .call(requests::GetPageCount { document })
        .await?
        .page_count;
    let file_version = dispatcher
        .call(requests::GetFileVersion { document })
        .await?
        .file_version;
    let permissions = dispatcher
        .call(requests::GetDocPermissions { document })
        .await?
        .permissions;

    let mut metadata = Vec::new();
    for tag in MetadataTag::ALL {
        let value = dispatcher
            .call(requests::GetMetadata { document, tag })
            .await?
            .value;
        if !value.is_empty() {
            metadata.push((tag, value));
        }
    }

    let bookmarks = dispatcher
        .call(requests::GetBookmarks { document })
        .await?
        .bookmarks;

    Ok(DocumentInfo {
        page_count,
        file_version,
        permissions,
        metadata,
        bookmarks,
    })
}

async fn text(file: PathBuf, page: usize, password: Option<String>) -> anyhow::Result<()> {
    let dispatcher = dispatcher()?;
    let open = requests::OpenDocument {
        source: DocumentSource::from_path(&file),
        password,
    };
    let result = dispatcher
        .with_document(open, |dispatcher, document| {
            async move {
                let text = dispatcher
                    .call(requests::GetPageText {
                        page: PageSelector::by_index(document, page),
                    })
                    .await
                    .with_context(|| format!("Failed to read page {page}"))?
                    .text;
                Ok::<_, anyhow::Error>(text)
            }
            .boxed()
        })
        .await;
    dispatcher.shutdown().await;

    let text = result.with_context(|| format!("Failed to read {}", file.display()))?;
    println!("{text}");
    Ok(())
}
