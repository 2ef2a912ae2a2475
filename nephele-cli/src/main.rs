//! Nephele CLI - ask the routing agent about API docs and the weather

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use nephele_core::config::{NepheleConfig, StoreBackend};
use nephele_core::conversation::{
    ConversationStore, InMemoryConversationStore, JsonlConversationStore, new_session_id,
};
use nephele_core::workflow::{AnswerResult, Orchestrator};

#[derive(Parser)]
#[command(name = "nephele")]
#[command(about = "Conversational agent for API documentation and live weather", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        /// Session ID; a fresh one is generated when omitted
        #[arg(short, long)]
        session: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// The question
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Interactive conversation
    Chat {
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Show stored turns for a session
    History {
        #[arg(short, long)]
        session: String,

        /// Most recent turns to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Summarise a session into long-term memory
    Summarize {
        #[arg(short, long)]
        session: String,
    },
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("nephele {}", env!("CARGO_PKG_VERSION"));
        println!("nephele-core {}", nephele_core::VERSION);
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => NepheleConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NepheleConfig::load().context("failed to load config")?,
    };

    match cli.command {
        Commands::Ask {
            session,
            json,
            question,
        } => {
            let orchestrator = Orchestrator::from_config(&config).await?;
            let session = session.unwrap_or_else(new_session_id);
            let result = orchestrator.handle_query(&session, &question.join(" ")).await;
            orchestrator.flush(&session).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_answer(&result);
            }
        }
        Commands::Chat { session } => {
            let orchestrator = Orchestrator::from_config(&config).await?;
            let session = session.unwrap_or_else(new_session_id);
            chat(&orchestrator, &session).await?;
            orchestrator.flush(&session).await;
        }
        Commands::History { session, limit } => {
            let store = open_store(&config).await?;
            let turns = store.history(&session, limit).await?;
            if turns.is_empty() {
                println!("No history for session {}", session);
            }
            for turn in turns {
                println!("[{}] ({})", turn.timestamp.format("%Y-%m-%d %H:%M:%S"), turn.route);
                println!("> {}", turn.query);
                println!("{}\n", turn.answer);
            }
        }
        Commands::Summarize { session } => {
            let orchestrator = Orchestrator::from_config(&config).await?;
            let summary = orchestrator.summarize_session(&session).await?;
            println!("{}", summary);
        }
        Commands::Version => {}
    }

    Ok(())
}

async fn chat(orchestrator: &Orchestrator, session: &str) -> Result<()> {
    tracing::debug!(session, "starting chat");
    println!("Session {} (type 'exit' to quit, '/summary' to summarise)", session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "exit" | "quit" => break,
            "/summary" => match orchestrator.summarize_session(session).await {
                Ok(summary) => println!("{}\n", summary),
                Err(e) => eprintln!("Could not summarise: {}\n", e),
            },
            query => {
                let result = orchestrator.handle_query(session, query).await;
                print_answer(&result);
                println!();
            }
        }
    }

    Ok(())
}

fn print_answer(result: &AnswerResult) {
    println!("{}", result.text);
    for caveat in result.caveats() {
        println!("{}", caveat);
    }
}

async fn open_store(config: &NepheleConfig) -> Result<Arc<dyn ConversationStore>> {
    Ok(match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryConversationStore::new()),
        StoreBackend::Jsonl => Arc::new(JsonlConversationStore::open(&config.store.dir).await?),
    })
}
