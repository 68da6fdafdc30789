use clap::{Parser, Subcommand};
use lib::orchestrator::{CycleEvent, Orchestrator, OrchestratorError, Services};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// How long a running cycle gets to wind down when the CLI exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "perch")]
#[command(about = "Perch CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config.json and an empty history file.
    Init {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Interactive chat. Responses stream as they arrive; /history, /clear and /exit are available.
    Chat {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Send a single message, print the streamed response and exit.
    Ask {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Message text (words are joined with spaces).
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Print saved conversation history, oldest first.
    History {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Remove every saved entry instead of printing.
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("perch {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config }) => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Ask { config, message }) => {
            if let Err(e) = run_ask(config, message.join(" ")).await {
                log::error!("ask failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::History { config, clear }) => {
            if let Err(e) = run_history(config, clear) {
                log::error!("history failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let report = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", report.config_dir.display());
    println!("history file: {}", report.history_path.display());
    Ok(())
}

/// Load config and build an orchestrator on the current runtime. Fails fast without an API key.
fn start(config_path: Option<PathBuf>) -> anyhow::Result<Orchestrator> {
    let (config, path) = lib::config::load_config(config_path)?;
    let services = Services::from_config(&config, &path)?;
    log::info!(
        "using model {} with history at {}",
        services.model,
        services.history.path().display()
    );
    Ok(Orchestrator::new(services, tokio::runtime::Handle::current()))
}

async fn run_chat(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut orchestrator = start(config_path)?;
    let mut events = orchestrator.listen();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/history") {
            match orchestrator.load_history() {
                Ok(entries) => print_history(&entries),
                Err(e) => eprintln!("history error: {}", e),
            }
            continue;
        }
        if input.eq_ignore_ascii_case("/clear") {
            match orchestrator.clear_history() {
                Ok(()) => println!("history cleared"),
                Err(e) => eprintln!("history error: {}", e),
            }
            continue;
        }

        if let Err(e) = converse(&mut orchestrator, &mut events, input).await {
            eprintln!("chat error: {}", e);
        }
    }

    orchestrator.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn run_ask(config_path: Option<PathBuf>, message: String) -> anyhow::Result<()> {
    let mut orchestrator = start(config_path)?;
    let mut events = orchestrator.listen();
    let result = converse(&mut orchestrator, &mut events, &message).await;
    orchestrator.shutdown(SHUTDOWN_GRACE).await;
    result
}

fn run_history(config_path: Option<PathBuf>, clear: bool) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let store = lib::history::HistoryStore::open(lib::config::resolve_history_path(&config, &path))?;
    if clear {
        store.clear()?;
        println!("history cleared");
    } else {
        print_history(&store.load()?);
    }
    Ok(())
}

/// Send one message and print its events until the cycle finishes. Errors if the cycle failed.
async fn converse(
    orchestrator: &mut Orchestrator,
    events: &mut UnboundedReceiver<CycleEvent>,
    message: &str,
) -> anyhow::Result<()> {
    match orchestrator.send_message(message) {
        Ok(()) => {}
        Err(OrchestratorError::EmptyMessage) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    let mut stdout = io::stdout();
    let mut printed = 0usize;
    let mut failure = None;
    while let Some(event) = events.recv().await {
        match event {
            CycleEvent::ResponseUpdated(text) => {
                // Text only grows, so print the new suffix.
                if let Some(new) = text.get(printed..) {
                    write!(stdout, "{}", new)?;
                    stdout.flush()?;
                    printed = text.len();
                }
            }
            CycleEvent::ResponseComplete(_) => {
                if printed > 0 {
                    writeln!(stdout)?;
                }
            }
            CycleEvent::ToolOutput { tool, output } => {
                writeln!(stdout, "[{}]", tool)?;
                write!(stdout, "{}", output)?;
                if !output.ends_with('\n') {
                    writeln!(stdout)?;
                }
            }
            CycleEvent::ScreenshotQueued => {
                writeln!(stdout, "(screenshot captured; it will be sent with your next message)")?;
            }
            CycleEvent::Failed(e) => failure = Some(e),
            CycleEvent::HistoryFailed(e) => eprintln!("warning: response not saved to history: {}", e),
            CycleEvent::Finished(_) => break,
        }
    }
    orchestrator.wait_idle().await;
    match failure {
        Some(e) => anyhow::bail!("{}", e),
        None => Ok(()),
    }
}

fn print_history(entries: &[lib::history::ConversationEntry]) {
    if entries.is_empty() {
        println!("(no history)");
        return;
    }
    for entry in entries {
        println!("[{}]", entry.timestamp);
        println!("> {}", entry.message);
        println!("< {}", entry.response.trim_end());
        println!();
    }
}
