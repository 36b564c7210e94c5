use anyhow::Result;
use clap::{Parser, Subcommand};

use rapport::cli::{events, ingest, requeue, serve, status, sweep, topic};
use rapport::config::Config;
use rapport::logging::init_logging;
use rapport::store::Database;

#[derive(Parser)]
#[command(name = "rapport")]
#[command(about = "Conversation event pipeline and friendship state tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "rapport.yaml")]
    config: String,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue consumer and fallback scheduler until Ctrl-C
    Serve,

    /// Ingest a conversation event payload
    Ingest {
        /// JSON file, or '-' for stdin
        source: String,
    },

    /// Run one fallback sweep over due events
    Sweep {
        /// Maximum events to process
        #[arg(short, long)]
        batch: Option<usize>,
    },

    /// Show a user's relationship state
    Status {
        user_id: String,
    },

    /// Show one event's processing state
    Event {
        conversation_id: String,
    },

    /// List events
    Events {
        /// Filter by status (pending, processing, processed, failed, skipped)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Agent to topic mappings
    Topic {
        #[command(subcommand)]
        command: TopicCommands,
    },

    /// Make a waiting event due now and republish it
    Requeue {
        conversation_id: String,
    },
}

#[derive(Subcommand)]
enum TopicCommands {
    /// Map an agent to a topic
    Set {
        agent_id: String,
        topic_id: String,
        /// Only at this level (L1, L2, L3)
        #[arg(long)]
        level: Option<String>,
    },
    /// Remove a mapping
    Remove {
        agent_id: String,
        #[arg(long)]
        level: Option<String>,
    },
    /// List all mappings
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config
    let (config, load_error) = match Config::load(&cli.config) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    init_logging(&config.logging.level, cli.verbose);
    if let Some(e) = load_error {
        tracing::warn!(error = %e, "failed to load config, using defaults");
    }

    // Initialize store
    let db = Database::open(&config.database_path())?;

    match cli.command {
        Commands::Serve => {
            serve::run(&config, db)?;
        }
        Commands::Ingest { source } => {
            ingest::run(&config, db, &source)?;
        }
        Commands::Sweep { batch } => {
            sweep::run(&config, db, batch)?;
        }
        Commands::Status { user_id } => {
            status::run(&db, &user_id)?;
        }
        Commands::Event { conversation_id } => {
            events::show(&db, &conversation_id)?;
        }
        Commands::Events { status, limit } => {
            events::list(&db, status, limit)?;
        }
        Commands::Topic { command } => match command {
            TopicCommands::Set {
                agent_id,
                topic_id,
                level,
            } => {
                topic::set(&db, &agent_id, &topic_id, level)?;
            }
            TopicCommands::Remove { agent_id, level } => {
                topic::remove(&db, &agent_id, level)?;
            }
            TopicCommands::List => {
                topic::list(&db)?;
            }
        },
        Commands::Requeue { conversation_id } => {
            requeue::run(&config, db, &conversation_id)?;
        }
    }

    Ok(())
}
