use std::ffi::OsStr;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use pagemend_core::{DocumentService, EditSession};
use pagemend_render::{PdfiumPageDecoder, RenderPipeline};
use pagemend_shell::{EditorShell, Intent, PageView};

mod http;

use http::HttpDocumentService;

const DEFAULT_SERVER: &str = "http://localhost:8000/api/v1/pdf";

#[derive(Debug, Parser)]
#[command(
    name = "pagemend",
    version,
    about = "search-and-replace PDF editor over a document service"
)]
struct Args {
    /// Base URL of the document service
    #[arg(long)]
    server: Option<String>,

    /// Hand document bytes to a platform viewer instead of decoding pages
    #[arg(long)]
    embedded: bool,

    /// Document to upload on startup
    file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server: Option<String>,
    mode: Option<ConfiguredMode>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConfiguredMode {
    Decoded,
    Embedded,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pagemend", "pagemend")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&project_dirs)?;

    let server = args
        .server
        .clone()
        .or_else(|| config.server.clone())
        .unwrap_or_else(|| DEFAULT_SERVER.to_owned());
    let service: Arc<dyn DocumentService> = Arc::new(
        HttpDocumentService::new(&server)
            .with_context(|| format!("invalid server URL {server}"))?,
    );

    let embedded = args.embedded || matches!(config.mode, Some(ConfiguredMode::Embedded));
    let pipeline = if embedded {
        RenderPipeline::embedded(Arc::clone(&service))
    } else {
        match PdfiumPageDecoder::new() {
            Ok(decoder) => RenderPipeline::decoded(Arc::clone(&service), Arc::new(decoder)),
            Err(err) => {
                warn!(%err, "pdfium unavailable, falling back to the embedded viewer");
                RenderPipeline::embedded(Arc::clone(&service))
            }
        }
    };

    let session = Arc::new(EditSession::new(Arc::clone(&service)));
    let mut shell = EditorShell::new(session, Arc::new(pipeline));

    if let Some(path) = &args.file {
        open_document(&mut shell, path.clone()).await?;
        shell.settle().await;
        print_status(&shell);
    }

    println!("pagemend connected to {server} — type `help` for commands");
    loop {
        shell.pump();
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = read_line().await? else {
            break;
        };
        let Some(command) = parse_command(&line) else {
            if !line.trim().is_empty() {
                println!("unrecognized command, type `help`");
            }
            continue;
        };
        match command {
            CliCommand::Quit => break,
            CliCommand::Help => print_help(),
            CliCommand::Status => {
                shell.settle().await;
                print_status(&shell);
            }
            CliCommand::Open(path) => {
                if let Err(err) = open_document(&mut shell, path).await {
                    println!("error: {err:#}");
                    continue;
                }
                shell.settle().await;
                print_status(&shell);
            }
            other => {
                shell.handle_intent(intent_for(other)).await;
                shell.settle().await;
                print_status(&shell);
            }
        }
    }

    Ok(())
}

async fn open_document(shell: &mut EditorShell, path: PathBuf) -> Result<()> {
    let bytes = fs::read(&path).with_context(|| format!("failed to read {path:?}"))?;
    let filename = path
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("document.pdf")
        .to_owned();
    shell.handle_intent(Intent::Upload { bytes, filename }).await;
    Ok(())
}

/// Commands accepted at the prompt, in one-word-plus-rest form.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Open(PathBuf),
    Search(String),
    Select(usize),
    Text(String),
    Replace,
    Page(u32),
    ZoomIn,
    ZoomOut,
    ZoomReset,
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Option<CliCommand> {
    let line = line.trim();
    let (word, rest) = line
        .split_once(char::is_whitespace)
        .map(|(word, rest)| (word, rest.trim()))
        .unwrap_or((line, ""));

    match (word, rest) {
        ("open", path) if !path.is_empty() => Some(CliCommand::Open(PathBuf::from(path))),
        // A blank query is forwarded so the session's own gate answers.
        ("search", query) => Some(CliCommand::Search(query.to_owned())),
        ("select", index) => index.parse().ok().map(CliCommand::Select),
        ("text", text) => Some(CliCommand::Text(text.to_owned())),
        ("replace", "") => Some(CliCommand::Replace),
        ("page", number) => number.parse().ok().map(CliCommand::Page),
        ("zoom", "in") => Some(CliCommand::ZoomIn),
        ("zoom", "out") => Some(CliCommand::ZoomOut),
        ("zoom", "reset") => Some(CliCommand::ZoomReset),
        ("status", "") => Some(CliCommand::Status),
        ("help", "") => Some(CliCommand::Help),
        ("quit" | "exit", "") => Some(CliCommand::Quit),
        _ => None,
    }
}

fn intent_for(command: CliCommand) -> Intent {
    match command {
        CliCommand::Search(query) => Intent::Search { query },
        CliCommand::Select(index) => Intent::Select { index },
        CliCommand::Text(text) => Intent::SetReplacementText { text },
        CliCommand::Replace => Intent::Replace,
        CliCommand::Page(page_number) => Intent::SetPage { page_number },
        CliCommand::ZoomIn => Intent::ZoomIn,
        CliCommand::ZoomOut => Intent::ZoomOut,
        CliCommand::ZoomReset => Intent::ResetZoom,
        CliCommand::Open(_) | CliCommand::Status | CliCommand::Help | CliCommand::Quit => {
            unreachable!("handled before intent mapping")
        }
    }
}

/// Blocking stdin read off the runtime's worker threads, so render
/// tasks keep making progress while the prompt waits.
async fn read_line() -> Result<Option<String>> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(line)),
            Err(err) => Err(err),
        }
    })
    .await
    .context("stdin reader task failed")?
    .context("failed to read from stdin")
}

fn print_status(shell: &EditorShell) {
    if let Some(message) = shell.status() {
        println!("error: {message}");
    }

    let state = shell.session_state();
    let Some(handle) = &state.handle else {
        println!("no document loaded");
        return;
    };
    println!(
        "document {handle} {} — page {} — zoom {}",
        state.content_version, state.page_number, shell.zoom()
    );

    if shell.embedded_document().is_some() {
        println!("current bytes handed to the embedded viewer");
    }
    for (index, page) in shell.pages().iter().enumerate() {
        match page {
            PageView::Pending => println!("  page {}: rendering...", index + 1),
            PageView::Rendered(surface) => {
                println!("  page {}: {}x{}", index + 1, surface.width, surface.height)
            }
            PageView::Placeholder { detail } => {
                println!("  page {}: render failed ({detail})", index + 1)
            }
        }
    }

    if !state.hits.is_empty() {
        println!("{} match(es) on page {}:", state.hits.len(), state.page_number);
        for hit in &state.hits {
            let marker = if state.selection == Some(hit.index) {
                '>'
            } else {
                ' '
            };
            println!(" {marker} [{}] {}", hit.index, hit.span_text);
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  open <path>       upload a document and render it");
    println!("  search <query>    find the query on the current page");
    println!("  select <index>    pick a hit from the last search");
    println!("  text <text>       set the replacement text");
    println!("  replace           apply the replacement to the selected hit");
    println!("  page <number>     switch the page searches run against");
    println!("  zoom in|out|reset adjust the zoom factor");
    println!("  status            show session and page state");
    println!("  quit              exit");
}

fn load_config(project_dirs: &ProjectDirs) -> Result<FileConfig> {
    let path = project_dirs.config_dir().join("pagemend.toml");
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("failed to read {path:?}"))?;
    toml::from_str(&raw).with_context(|| format!("malformed config at {path:?}"))
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagemend.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
