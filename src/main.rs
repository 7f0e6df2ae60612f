use clap::{Parser, Subcommand};
use engram::config::{self, Settings};
use engram::{db, hooks, importer, queries};
use std::io::Write as _;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "engram", version, about = "Archive and search AI coding session transcripts")]
struct Cli {
    /// Custom database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Projects directory holding the session logs
    #[arg(long, global = true)]
    projects_dir: Option<PathBuf>,

    /// Import only this project (by directory name); with --search, filter
    /// results to matching project names
    #[arg(long)]
    project: Option<String>,

    /// Search the archive instead of importing
    #[arg(long)]
    search: Option<String>,

    /// Result limit for --search and --recent
    #[arg(long, default_value_t = 20)]
    limit: u32,

    /// Show database statistics
    #[arg(long)]
    stats: bool,

    /// List recent conversations as Markdown
    #[arg(long)]
    recent: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Hook entry points: read one JSON object on stdin, write one on stdout
    Hook {
        #[command(subcommand)]
        event: HookEvent,
    },
}

#[derive(Subcommand)]
enum HookEvent {
    /// Inject prior-session context on SessionStart
    SessionStart,
    /// Incrementally sync the stopped session after each turn
    Stop,
}

fn main() {
    let cli = Cli::parse();
    let settings = config::load_settings(None);

    let is_hook = matches!(cli.command, Some(Commands::Hook { .. }));
    let _log_guard = init_tracing(&settings, is_hook);

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| settings.resolved_db_path());
    let projects_dir = cli
        .projects_dir
        .clone()
        .unwrap_or_else(config::default_projects_dir);

    match cli.command {
        Some(Commands::Hook { event }) => {
            let input = hooks::read_input(&mut std::io::stdin().lock());
            let output = match event {
                HookEvent::SessionStart => hooks::context::run(&settings, &db_path, input),
                HookEvent::Stop => hooks::sync::run(&settings, &db_path, &projects_dir, input),
            };
            // The hook contract is exit code zero no matter what; even a
            // closed stdout must not turn into a panicking failure.
            let _ = writeln!(std::io::stdout(), "{output}");
        }
        None => {
            if let Some(query) = cli.search.clone() {
                run_search(&db_path, &query, cli.project.as_deref(), cli.limit);
            } else if cli.stats {
                run_stats(&db_path);
            } else if cli.recent {
                run_recent(&db_path, cli.project.as_deref(), cli.limit);
            } else {
                run_import(&cli, &settings, db_path, projects_dir);
            }
        }
    }
}

/// CLI runs log to stderr; hook runs log to the memory log file when enabled
/// and stay silent otherwise, since hooks must never print to stderr.
fn init_tracing(
    settings: &Settings,
    is_hook: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if is_hook {
        if !settings.logging_enabled {
            return None;
        }
        let log_path = config::default_log_path();
        let dir = log_path.parent()?.to_path_buf();
        if std::fs::create_dir_all(&dir).is_err() {
            return None;
        }
        let file_name = log_path.file_name()?.to_os_string();
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return Some(guard);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    None
}

fn run_import(cli: &Cli, settings: &Settings, db_path: PathBuf, projects_dir: PathBuf) {
    match importer::run_import(importer::ImportConfig {
        db_path,
        projects_dir,
        project: cli.project.clone(),
        exclude_projects: settings.exclude_projects.clone(),
    }) {
        Ok(report) => print!("{report}"),
        Err(e) => {
            eprintln!("import failed: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run_search(db_path: &std::path::Path, query: &str, project: Option<&str>, limit: u32) {
    let result = db::open(db_path)
        .and_then(|conn| queries::search(&conn, query, project, limit));
    match result {
        Ok(hits) => print!("{}", queries::render_search_results(&hits)),
        Err(e) => {
            eprintln!("search failed: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run_recent(db_path: &std::path::Path, project: Option<&str>, limit: u32) {
    let result = db::open(db_path)
        .and_then(|conn| queries::recent_sessions(&conn, limit, project));
    match result {
        Ok(sessions) => print!("{}", queries::render_recent(&sessions)),
        Err(e) => {
            eprintln!("recent failed: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run_stats(db_path: &std::path::Path) {
    let result = db::open(db_path).and_then(|conn| queries::render_stats(&conn, db_path));
    match result {
        Ok(out) => print!("{out}"),
        Err(e) => {
            eprintln!("stats failed: {e:#}");
            std::process::exit(1);
        }
    }
}
