//! # Math Mentor CLI (`mentor`)
//!
//! ## Usage
//!
//! ```bash
//! mentor --config ./config/mentor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mentor ask "<text>"` | Solve one typed question |
//! | `mentor image <path>` | Read a problem from an image, confirm it, solve it |
//! | `mentor audio <path>` | Transcribe a spoken problem, confirm it, solve it |
//! | `mentor chat` | Interactive session with feedback |
//! | `mentor memory list` | Show verified solutions |
//! | `mentor memory rebuild` | Re-embed the memory index from the entry file |
//! | `mentor knowledge build` | Chunk and embed the knowledge corpus |
//! | `mentor serve` | Start the HTTP API |
//!
//! Set `RUST_LOG=math_mentor=debug` to see stage-level logs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use math_mentor::config::{self, Config};
use math_mentor::pipeline::{Feedback, Orchestrator, TurnOutcome};
use math_mentor::server;
use math_mentor::session::Session;

const DEFAULT_CONFIG: &str = "./config/mentor.toml";

/// Math Mentor: a step-by-step math tutor with verified-solution memory.
#[derive(Parser)]
#[command(name = "mentor", version, about = "Step-by-step math tutor with a semantic memory of verified solutions")]
struct Cli {
    /// Path to configuration file (TOML). Defaults to `./config/mentor.toml`
    /// when present, built-in defaults otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a typed question.
    Ask {
        /// The question, e.g. "What is 2+2?"
        text: String,
    },

    /// Extract a problem from an image (PNG, JPEG, GIF, WebP).
    Image {
        path: PathBuf,

        /// Accept the extracted text without prompting.
        #[arg(long)]
        yes: bool,
    },

    /// Transcribe a spoken problem (MP3, WAV, M4A, ...).
    Audio {
        path: PathBuf,

        #[arg(long)]
        yes: bool,
    },

    /// Interactive session.
    ///
    /// Type a question, or use /image <path>, /audio <path>, /accurate,
    /// /inaccurate, /quit.
    Chat,

    /// Inspect or rebuild the verified-solution memory.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage the knowledge corpus index.
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum MemoryAction {
    List,
    Rebuild,
}

#[derive(Subcommand)]
enum KnowledgeAction {
    Build,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "math_mentor=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Memory { action } => {
            let orchestrator = Orchestrator::from_config(&cfg)?;
            match action {
                MemoryAction::List => {
                    let entries = orchestrator.memory().entries()?;
                    if entries.is_empty() {
                        println!("No verified solutions yet.");
                    }
                    for (i, e) in entries.iter().enumerate() {
                        println!("{:>3}. [{}] {}", i + 1, e.topic, e.problem);
                    }
                }
                MemoryAction::Rebuild => {
                    let n = orchestrator.memory().rebuild().await?;
                    println!("Rebuilt memory index ({} entries).", n);
                }
            }
        }
        Commands::Knowledge {
            action: KnowledgeAction::Build,
        } => {
            let orchestrator = Orchestrator::from_config(&cfg)?;
            let n = orchestrator.knowledge().build().await?;
            println!("Indexed {} knowledge chunks.", n);
        }
        Commands::Ask { text } => {
            let orchestrator = Orchestrator::from_config(&cfg)?;
            let mut session = Session::new();
            let outcome = orchestrator.submit_text(&mut session, &text).await?;
            print_outcome(&outcome);
        }
        Commands::Image { path, yes } => {
            let orchestrator = Orchestrator::from_config(&cfg)?;
            let bytes = read_file(&path)?;
            let mut session = Session::new();
            let mut input = stdin_lines();
            let text = orchestrator.begin_image(&mut session, bytes).await?;
            confirm_and_solve(&orchestrator, &mut session, &mut input, &text, yes).await?;
        }
        Commands::Audio { path, yes } => {
            let orchestrator = Orchestrator::from_config(&cfg)?;
            let bytes = read_file(&path)?;
            let mut session = Session::new();
            let mut input = stdin_lines();
            let text = orchestrator
                .begin_audio(&mut session, bytes, &file_name(&path))
                .await?;
            confirm_and_solve(&orchestrator, &mut session, &mut input, &text, yes).await?;
        }
        Commands::Chat => {
            let orchestrator = Orchestrator::from_config(&cfg)?;
            run_chat(&orchestrator).await?;
        }
    }

    Ok(())
}

type Input = Lines<BufReader<Stdin>>;

fn stdin_lines() -> Input {
    BufReader::new(tokio::io::stdin()).lines()
}

async fn prompt(input: &mut Input, label: &str) -> Result<Option<String>> {
    let mut out = tokio::io::stdout();
    out.write_all(label.as_bytes()).await?;
    out.flush().await?;
    Ok(input.next_line().await?)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Show the extracted text and wait for the human: Enter accepts it, any
/// other text replaces it, `/cancel` drops it.
async fn confirm_and_solve(
    orchestrator: &Orchestrator,
    session: &mut Session,
    input: &mut Input,
    extracted: &str,
    yes: bool,
) -> Result<Option<TurnOutcome>> {
    println!("\nExtracted text:\n  {}\n", extracted);
    if !yes {
        let reply = prompt(input, "Press Enter to confirm, type a correction, or /cancel: ").await?;
        match reply.as_deref().map(str::trim) {
            None | Some("/cancel") => {
                orchestrator.cancel_pending(session)?;
                println!("Cancelled.");
                return Ok(None);
            }
            Some("") => {}
            Some(edited) => orchestrator.edit_pending(session, edited)?,
        }
    }
    let outcome = orchestrator.confirm_pending(session).await?;
    print_outcome(&outcome);
    Ok(Some(outcome))
}

fn print_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Done {
            recalled,
            confidence,
            evaluation_skipped,
            solution,
            ..
        } => {
            println!("\n{}\n", solution);
            if *recalled {
                println!("(recalled from verified memory)");
            } else if *evaluation_skipped {
                println!("Verifier confidence: {}% (evaluation skipped)", confidence);
            } else {
                println!("Verifier confidence: {}%", confidence);
            }
        }
        TurnOutcome::Blocked => println!("{}", math_mentor::pipeline::BLOCK_MESSAGE),
        TurnOutcome::ClarificationNeeded { question } => println!("{}", question),
        TurnOutcome::Error { message } => println!("{}", message),
    }
}

async fn run_chat(orchestrator: &Orchestrator) -> Result<()> {
    let mut session = Session::new();
    let mut input = stdin_lines();
    let mut last_solution: Option<usize> = None;

    println!("Math Mentor. Ask a question, or /image <path>, /audio <path>, /accurate, /inaccurate, /quit.");

    while let Some(line) = prompt(&mut input, "\n> ").await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) | ("/exit", _) => break,
            ("/accurate", _) | ("/inaccurate", _) => {
                let feedback = if line.starts_with("/accurate") {
                    Feedback::Accurate
                } else {
                    Feedback::Inaccurate
                };
                give_feedback(orchestrator, &mut session, last_solution, feedback).await
            }
            ("/image", path) | ("/audio", path) => {
                let path = Path::new(path.trim());
                let is_image = line.starts_with("/image");
                match read_file(path) {
                    Ok(bytes) => {
                        let extracted = if is_image {
                            orchestrator.begin_image(&mut session, bytes).await
                        } else {
                            orchestrator
                                .begin_audio(&mut session, bytes, &file_name(path))
                                .await
                        };
                        match extracted {
                            Ok(text) => confirm_and_solve(orchestrator, &mut session, &mut input, &text, false)
                                .await
                                .map(|o| {
                                    if let Some(TurnOutcome::Done { turn, .. }) = o {
                                        last_solution = Some(turn);
                                    }
                                }),
                            Err(e) => Err(e.into()),
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            _ => orchestrator
                .submit_text(&mut session, line)
                .await
                .map(|outcome| {
                    print_outcome(&outcome);
                    if let TurnOutcome::Done { turn, .. } = outcome {
                        last_solution = Some(turn);
                    }
                })
                .map_err(Into::into),
        };

        if let Err(e) = result {
            println!("Error: {:#}", e);
        }
    }

    Ok(())
}

async fn give_feedback(
    orchestrator: &Orchestrator,
    session: &mut Session,
    turn: Option<usize>,
    feedback: Feedback,
) -> Result<()> {
    let Some(turn) = turn else {
        bail!("no solution to give feedback on yet");
    };
    orchestrator.feedback(session, turn, feedback).await?;
    match feedback {
        Feedback::Accurate => println!("Saved to memory."),
        Feedback::Inaccurate => println!("Flagged for review."),
    }
    Ok(())
}
