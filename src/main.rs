use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use streamrig::actions::{ActionStore, HandlerRegistry};
use streamrig::commands;
use streamrig::config::Config;
use streamrig::daemon::Engine;
use streamrig::variables::VariableStore;
use streamrig::vault::VaultStore;

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "streamrig",
    version,
    about = "Automation rule engine for streaming platforms"
)]
struct Cli {
    /// Config file path (default: ~/.streamrig/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the automation daemon in the foreground
    Run,
    /// Manage actions
    Action {
        #[command(subcommand)]
        command: ActionCommands,
    },
    /// Manage variables
    Var {
        #[command(subcommand)]
        command: VarCommands,
    },
    /// Manage vault secrets
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ActionCommands {
    /// Create an action from a JSON definition
    Add {
        /// Inline JSON definition
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,
        /// Path to a JSON definition file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List actions
    List {
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Show one action as JSON
    Show { id: String },
    /// Delete an action
    Rm { id: String },
    /// Enable an action
    Enable { id: String },
    /// Disable an action
    Disable { id: String },
}

#[derive(Debug, Subcommand)]
enum VarCommands {
    /// Set a variable (value parsed as JSON when possible)
    Set { name: String, value: String },
    /// Print a variable
    Get { name: String },
    /// List all variables
    List,
}

#[derive(Debug, Subcommand)]
enum VaultCommands {
    /// Store a secret
    Set { name: String, value: String },
    /// List secret names (never values)
    Ls,
    /// Remove a secret
    Rm { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config)?;

    match cli.command {
        Commands::Run => {
            let engine = Engine::assemble(config).await?;
            engine.run().await
        }
        Commands::Action { command } => {
            let store = ActionStore::open(
                &config.actions_db_path(),
                Arc::new(HandlerRegistry::builtin()),
            )?;
            match command {
                ActionCommands::Add { json, file } => {
                    let definition = match (json, file) {
                        (Some(json), _) => json,
                        (None, Some(path)) => std::fs::read_to_string(path)?,
                        (None, None) => {
                            anyhow::bail!("provide a definition via --json or --file")
                        }
                    };
                    commands::action_add(&store, &definition).await
                }
                ActionCommands::List { group, enabled } => {
                    commands::action_list(&store, group, enabled).await
                }
                ActionCommands::Show { id } => commands::action_show(&store, &id).await,
                ActionCommands::Rm { id } => commands::action_rm(&store, &id).await,
                ActionCommands::Enable { id } => {
                    commands::action_set_enabled(&store, &id, true).await
                }
                ActionCommands::Disable { id } => {
                    commands::action_set_enabled(&store, &id, false).await
                }
            }
        }
        Commands::Var { command } => {
            let variables = VariableStore::open(&config.variables_db_path())?;
            match command {
                VarCommands::Set { name, value } => {
                    commands::var_set(&variables, &name, &value).await
                }
                VarCommands::Get { name } => commands::var_get(&variables, &name).await,
                VarCommands::List => commands::var_list(&variables).await,
            }
        }
        Commands::Vault { command } => {
            let vault = VaultStore::open(&config.vault_dir())?;
            match command {
                VaultCommands::Set { name, value } => commands::vault_set(&vault, &name, value),
                VaultCommands::Ls => commands::vault_ls(&vault),
                VaultCommands::Rm { name } => commands::vault_rm(&vault, &name),
            }
        }
    }
}
