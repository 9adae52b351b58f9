use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use sparchive::app::App;
use sparchive::archive::MANIFEST_ENTRY;
use sparchive::config::ConfigLoader;
use sparchive::domain::DatasetId;
use sparchive::error::SparchiveError;
use sparchive::library::ImportOutcome;
use sparchive::output::{HumanOutput, JsonOutput, OutputMode};
use sparchive::progress::ProgressEvent;
use sparchive::worker::BrowseQuery;

#[derive(Parser)]
#[command(name = "sparchive")]
#[command(about = "Offline library for packaged research datasets")]
#[command(version, author)]
struct Cli {
    /// Path to sparchive.json
    #[arg(long, global = true, env = "SPARCHIVE_CONFIG")]
    config: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search the remote catalogue")]
    Browse(BrowseArgs),
    #[command(about = "Fetch a dataset and package it into the library")]
    Package(PackageArgs),
    #[command(about = "Manage the local library")]
    Library(LibraryArgs),
    #[command(about = "Show the manifest of an archive")]
    Manifest { archive: PathBuf },
    #[command(about = "Print the file tree of an archive")]
    Tree { archive: PathBuf },
    #[command(about = "Show one file from an archive")]
    Show { archive: PathBuf, internal: String },
    #[command(about = "Copy one file out of an archive")]
    Extract {
        archive: PathBuf,
        internal: String,
        dest: PathBuf,
    },
}

#[derive(Args)]
struct BrowseArgs {
    #[arg(default_value = "")]
    query: String,

    #[arg(long, default_value_t = 1)]
    page: u32,

    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Args)]
struct PackageArgs {
    id: String,

    /// Accept the download size prompt without asking
    #[arg(long, conflicts_with = "no")]
    yes: bool,

    /// Decline the download size prompt without asking
    #[arg(long)]
    no: bool,
}

impl PackageArgs {
    fn preset_decision(&self) -> Option<bool> {
        match (self.yes, self.no) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(Args)]
struct LibraryArgs {
    #[command(subcommand)]
    command: LibraryCommand,
}

#[derive(Subcommand)]
enum LibraryCommand {
    #[command(about = "List library entries, newest first")]
    List,
    #[command(about = "Remove an entry and its archive")]
    Delete { id: String },
    #[command(about = "Import an existing archive file")]
    Import { path: PathBuf },
    #[command(about = "Print the archive path of an entry")]
    Locate { id: String },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SparchiveError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SparchiveError) -> u8 {
    match error {
        SparchiveError::DatasetNotFound(_)
        | SparchiveError::DatasetExists(_)
        | SparchiveError::EntryNotFound(_) => 2,
        SparchiveError::WorkerSpawn(_)
        | SparchiveError::WorkerProtocol(_)
        | SparchiveError::WorkerReported(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async {
        let app = App::new(&config);
        let result = run_command(&app, cli.command, output_mode).await;
        app.shutdown().await;
        result
    })
}

async fn run_command(app: &App, command: Commands, output_mode: OutputMode) -> miette::Result<()> {
    match command {
        Commands::Browse(args) => run_browse(app, args, output_mode).await,
        Commands::Package(args) => run_package(app, args, output_mode).await,
        Commands::Library(args) => run_library(app, args.command, output_mode).await,
        Commands::Manifest { archive } => {
            let manifest = load_manifest(app, archive).await?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&manifest).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_manifest(&manifest).into_diagnostic(),
            }
        }
        Commands::Tree { archive } => {
            let manifest = load_manifest(app, archive).await?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&manifest.file_tree).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_tree(&manifest).into_diagnostic(),
            }
        }
        Commands::Show { archive, internal } => {
            let content = app
                .get_file_content(archive, internal.clone())
                .await
                .ok_or(SparchiveError::EntryNotFound(internal))?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&content).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_content(&content).into_diagnostic(),
            }
        }
        Commands::Extract {
            archive,
            internal,
            dest,
        } => {
            let outcome = app.extract_file(archive, internal, dest.clone()).await;
            if output_mode == OutputMode::Json {
                JsonOutput::print(&outcome).into_diagnostic()?;
            }
            if !outcome.success {
                return Err(SparchiveError::ArchiveIo(outcome.error.unwrap_or_default()).into());
            }
            if output_mode == OutputMode::Human {
                println!("extracted to {}", dest.display());
            }
            Ok(())
        }
    }
}

async fn load_manifest(app: &App, archive: PathBuf) -> miette::Result<sparchive::domain::Manifest> {
    let display = archive.display().to_string();
    app.get_manifest(archive).await.ok_or_else(|| {
        SparchiveError::ArchiveCorrupt(format!("{MANIFEST_ENTRY} missing or unreadable in {display}"))
            .into()
    })
}

async fn run_browse(app: &App, args: BrowseArgs, output_mode: OutputMode) -> miette::Result<()> {
    let query = BrowseQuery {
        query: args.query,
        page: args.page,
        limit: args.limit,
    };
    let results = app.browse(&query).await?;
    match output_mode {
        OutputMode::Json => JsonOutput::print(&results).into_diagnostic(),
        OutputMode::Human => HumanOutput::print_browse(&results).into_diagnostic(),
    }
}

async fn run_package(app: &App, args: PackageArgs, output_mode: OutputMode) -> miette::Result<()> {
    let id: DatasetId = args.id.parse()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = app.subscribe_progress(Arc::new(tx));
    let handle = app.start_package(&id).await;

    while let Some(update) = rx.recv().await {
        if update.job != handle {
            continue;
        }
        match output_mode {
            OutputMode::Json => JsonOutput::print_line(&update).into_diagnostic()?,
            OutputMode::Human => HumanOutput::print_progress(&update),
        }

        match update.event {
            ProgressEvent::ConfirmDownload { .. } => {
                let confirmed = match args.preset_decision() {
                    Some(confirmed) => confirmed,
                    None => prompt_confirmation().await?,
                };
                app.confirm_package(confirmed).await;
            }
            ProgressEvent::Done { .. } => return Ok(()),
            ProgressEvent::Exists { message } => {
                return Err(SparchiveError::DatasetExists(message).into());
            }
            ProgressEvent::Error {
                message,
                fatal: true,
            } => return Err(SparchiveError::WorkerReported(message).into()),
            ProgressEvent::Error { fatal: false, .. } => {}
            ProgressEvent::Starting { .. } | ProgressEvent::Progress { .. } => {}
        }
    }
    Ok(())
}

async fn prompt_confirmation() -> miette::Result<bool> {
    let answer = tokio::task::spawn_blocking(|| -> io::Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "Proceed with download? [y/N] ")?;
        stderr.flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .into_diagnostic()?
    .into_diagnostic()?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn run_library(
    app: &App,
    command: LibraryCommand,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match command {
        LibraryCommand::List => {
            let entries = app.get_library().await;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&entries).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_library(&entries).into_diagnostic(),
            }
        }
        LibraryCommand::Delete { id } => {
            let id: DatasetId = id.parse()?;
            if !app.get_library().await.iter().any(|entry| entry.id == id) {
                return Err(SparchiveError::DatasetNotFound(id.to_string()).into());
            }
            let entries = app.delete_dataset(id).await;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&entries).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_library(&entries).into_diagnostic(),
            }
        }
        LibraryCommand::Import { path } => {
            let outcome = app.import_archive(path).await;
            if output_mode == OutputMode::Json {
                JsonOutput::print(&outcome).into_diagnostic()?;
            }
            match outcome {
                ImportOutcome::Success { message, .. } => {
                    if output_mode == OutputMode::Human {
                        println!("{message}");
                    }
                    Ok(())
                }
                ImportOutcome::Exists { message } => {
                    Err(SparchiveError::DatasetExists(message).into())
                }
                ImportOutcome::Error { message } => {
                    Err(SparchiveError::ArchiveCorrupt(message).into())
                }
            }
        }
        LibraryCommand::Locate { id } => {
            let id: DatasetId = id.parse()?;
            let path = app.open_location(&id).await?;
            match output_mode {
                OutputMode::Json => {
                    JsonOutput::print(&serde_json::json!({ "id": id, "path": path })).into_diagnostic()
                }
                OutputMode::Human => {
                    println!("{path}");
                    Ok(())
                }
            }
        }
    }
}
