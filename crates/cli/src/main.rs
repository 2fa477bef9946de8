//! Quill CLI: the main entry point.
//!
//! Commands:
//! - `init`: Write the default config and storage directories
//! - `chat`: Send one message and stream the reply
//! - `show`: Decrypt and print a stored conversation
//! - `list`: List stored conversations

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "quill",
    about = "Quill — private chat with your documents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and storage
    Init,

    /// Send a message and stream the reply (Ctrl+C cancels)
    Chat {
        /// The message to send
        #[arg(short, long)]
        message: String,

        /// Attach a file as context (repeatable)
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Override the provider
        #[arg(long)]
        provider: Option<String>,

        /// Override the model
        #[arg(long)]
        model: Option<String>,

        /// Include related past conversations as context
        #[arg(long)]
        history: bool,

        /// Keep the partial reply if the turn is cancelled
        #[arg(long)]
        save_partial: bool,
    },

    /// Print a stored conversation
    Show {
        /// Conversation id
        id: String,
    },

    /// List stored conversations
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Chat {
            message,
            files,
            conversation,
            provider,
            model,
            history,
            save_partial,
        } => {
            commands::chat::run(commands::chat::ChatArgs {
                message,
                files,
                conversation,
                provider,
                model,
                history,
                save_partial,
            })
            .await?
        }
        Commands::Show { id } => commands::show::run(&id).await?,
        Commands::List => commands::list::run().await?,
    }

    Ok(())
}
