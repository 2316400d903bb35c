use clap::{Parser, Subcommand};
use devcore::router;
use devcore::shell::builtins::Stream;
use devcore::{message, preview};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// `devcore` is normally driven over stdio by the UI process (`serve`, the
/// default when no subcommand is given); the direct subcommands exist for
/// scripting and for exercising a single subsystem without a UI attached.
#[derive(Parser)]
#[command(name = "devcore", about = "Mobile IDE backend core: router, package manager, script runner, preview server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the line-delimited JSON message loop over stdio (spec.md §4.J).
    Serve {
        #[arg(long)]
        datadir: Option<PathBuf>,
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Runs one `exec`-style command line directly against the CLI surface
    /// of spec.md §6 (shell builtins, `node`, `npx`, `npm` subcommands).
    Exec {
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Starts the developer-preview server for a project directory and
    /// prints the assigned port.
    PreviewServe {
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run_serve(datadir: Option<PathBuf>, project: Option<PathBuf>) -> i32 {
    let datadir = datadir
        .or_else(|| dirs::data_dir().map(|d| d.join("devcore")))
        .unwrap_or_else(|| PathBuf::from(".devcore"));
    let projects_dir = project.unwrap_or_else(|| datadir.join("projects").join("default"));
    let _ = std::fs::create_dir_all(&projects_dir);

    match message::run_message_loop(datadir, projects_dir).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "message loop terminated");
            1
        }
    }
}

async fn run_exec(cwd: PathBuf, command: Vec<String>) -> i32 {
    let Some((head, rest)) = command.split_first() else {
        eprintln!("devcore exec: missing command");
        return 1;
    };
    let emit = |stream: Stream, text: &str| match stream {
        Stream::Stdout => print!("{text}"),
        Stream::Stderr => eprint!("{text}"),
    };
    match router::dispatch_cli(head, rest, &cwd, emit, CancellationToken::new()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("devcore exec: {e}");
            1
        }
    }
}

fn run_preview_serve(project: PathBuf) -> i32 {
    match preview::PreviewServer::start(project, CancellationToken::new()) {
        Ok(server) => {
            println!("preview server listening on http://127.0.0.1:{}", server.port);
            loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        }
        Err(e) => {
            eprintln!("failed to start preview server: {e}");
            1
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        None => run_serve(None, None).await,
        Some(Commands::Serve { datadir, project }) => run_serve(datadir, project).await,
        Some(Commands::Exec { cwd, command }) => run_exec(cwd, command).await,
        Some(Commands::PreviewServe { project }) => run_preview_serve(project),
    };

    std::process::exit(exit_code);
}
