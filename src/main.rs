//! # Ragdock CLI (`ragdock`)
//!
//! Commands for database initialization, user management, cache
//! administration, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! ragdock --config ./config/ragdock.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragdock init` | Create the SQLite database and run schema migrations |
//! | `ragdock serve` | Start the HTTP API server |
//! | `ragdock user add <username>` | Create a user (`--role admin` for the admin surface) |
//! | `ragdock cache stats` | Show semantic cache counters |
//! | `ragdock cache clear` | Drop every cache entry |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ragdock::cache::{cache_stats, clear_cache};
use ragdock::config::load_config;
use ragdock::migrate::run_migrations;
use ragdock::server::run_server;
use ragdock::{db, store};

/// Ragdock — a retrieval-augmented chat backend over a SQLite corpus.
#[derive(Parser)]
#[command(
    name = "ragdock",
    about = "Ragdock — a retrieval-augmented chat backend over a SQLite corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragdock.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Start the HTTP API server.
    Serve,

    /// User management.
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Semantic cache administration.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user. The printed id is the value of the `x-user-id` header.
    Add {
        username: String,

        /// Role: `user` or `admin`.
        #[arg(long, default_value = "user")]
        role: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show entry count, threshold, and TTL.
    Stats,
    /// Remove every cached response.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db).await?;
            run_migrations(&pool).await?;
            println!("Database initialized at {}", config.db.path.display());
        }

        Commands::Serve => {
            run_server(&config).await?;
        }

        Commands::User { command } => {
            let pool = db::connect(&config.db).await?;
            run_migrations(&pool).await?;
            match command {
                UserCommands::Add { username, role } => {
                    if role != "user" && role != "admin" {
                        anyhow::bail!("role must be 'user' or 'admin', got '{}'", role);
                    }
                    if store::get_user_by_username(&pool, &username)
                        .await?
                        .is_some()
                    {
                        anyhow::bail!("user '{}' already exists", username);
                    }
                    let user = store::create_user(&pool, &username, &role).await?;
                    println!("Created {} '{}' with id {}", user.role, user.username, user.id);
                }
            }
        }

        Commands::Cache { command } => {
            let pool = db::connect(&config.db).await?;
            run_migrations(&pool).await?;
            match command {
                CacheCommands::Stats => {
                    let stats = cache_stats(&pool, &config.cache).await?;
                    println!("Entries:   {}", stats.total_entries);
                    println!("Threshold: {}", stats.similarity_threshold);
                    println!("TTL:       {}s", stats.ttl_seconds);
                }
                CacheCommands::Clear => {
                    let removed = clear_cache(&pool).await?;
                    println!("Removed {} cache entries", removed);
                }
            }
        }
    }

    Ok(())
}
