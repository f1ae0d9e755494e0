//! Configuration types and constants for the devlife binaries.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::clock::Millis;

/// Background sweep cadence: two minutes.
pub const SYNC_INTERVAL_SECS: u64 = 120;
/// `updated_after` used when a collection holds no records yet.
pub const EPOCH_FLOOR: Millis = 0;
pub const DB_FILE_NAME: &str = "devlife.db";
pub const HTTP_TIMEOUT_SECS: u64 = 15;
/// Salt for deriving the vault key from the passphrase.
pub const VAULT_SALT: &[u8] = b"devlife-vault-salt-v1";

/// Offline-first projects, finances, tasks and API-key vault.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "devlife", version, about)]
pub struct Cli {
    /// Data directory holding the local database [env: DEVLIFE_HOME] [default: ~/.devlife]
    #[arg(long, short = 'd', global = true)]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the remote backend [env: DEVLIFE_REMOTE_URL]
    #[arg(long, short = 'r', global = true)]
    pub remote_url: Option<String>,

    /// Signed-in principal used to scope remote rows [env: DEVLIFE_PRINCIPAL]
    #[arg(long, short = 'p', global = true)]
    pub principal: Option<String>,

    /// Seconds between background sweeps [env: DEVLIFE_SYNC_INTERVAL_SECS] [default: 120]
    #[arg(long, global = true)]
    pub sync_interval: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record counts and pending sync work
    Status,
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Manage finance entries
    #[command(subcommand)]
    Finance(FinanceCommand),
    /// Manage API keys (needs DEVLIFE_VAULT_PASSPHRASE)
    #[command(subcommand)]
    Vault(VaultCommand),
    /// Soft-delete a record
    Delete {
        /// projects, finances, tasks or vault
        collection: String,
        id: String,
    },
    /// Run one sync sweep against the remote backend
    Sync,
    /// Keep syncing in the background until Ctrl-C
    Watch,
    /// Wipe every local record, as on sign-out
    Reset,
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    Add {
        name: String,
        #[arg(long, default_value = "Planning")]
        status: String,
        #[arg(long, default_value_t = 0)]
        progress: u32,
        /// YYYY-MM-DD
        #[arg(long)]
        deadline: Option<String>,
        #[arg(long)]
        github_url: Option<String>,
        #[arg(long)]
        live_url: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Add {
        title: String,
        #[arg(long, default_value = "Medium")]
        priority: String,
        /// YYYY-MM-DD
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// None, Daily or Weekly
        #[arg(long, default_value = "None")]
        repeat: String,
    },
    /// Mark a task completed
    Done { id: String },
    /// Push a task's reminder forward
    Snooze {
        id: String,
        #[arg(long, default_value_t = 10)]
        minutes: u64,
    },
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        /// active, completed, overdue or all
        #[arg(long, default_value = "all")]
        status: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum FinanceCommand {
    Add {
        /// income, expense, loan, repayment, business_delivery, business_payment
        kind: String,
        amount: f64,
        #[arg(long, default_value = "")]
        client: String,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    List {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        /// all, profit, business_balance or a single entry type
        #[arg(long, default_value = "all")]
        view: String,
    },
    Stats {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum VaultCommand {
    Add {
        service: String,
        secret: String,
        #[arg(long)]
        expiry: Option<String>,
        #[arg(long)]
        project_id: Option<String>,
    },
    Reveal { id: String },
    List,
}

pub struct Config {
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub principal: Option<String>,
    pub vault_passphrase: Option<String>,
    pub sync_interval: Duration,
}

impl Config {
    pub fn from_cli_and_env(cli: &Cli) -> Self {
        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DEVLIFE_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".devlife"))
                    .unwrap_or_else(|_| PathBuf::from(".devlife"))
            });

        let remote_url = cli
            .remote_url
            .clone()
            .or_else(|| std::env::var("DEVLIFE_REMOTE_URL").ok());

        let principal = cli
            .principal
            .clone()
            .or_else(|| std::env::var("DEVLIFE_PRINCIPAL").ok())
            .filter(|p| !p.is_empty());

        let vault_passphrase = std::env::var("DEVLIFE_VAULT_PASSPHRASE").ok();

        let interval_secs = cli
            .sync_interval
            .or_else(|| {
                std::env::var("DEVLIFE_SYNC_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(SYNC_INTERVAL_SECS)
            .max(1);

        Self {
            data_dir,
            remote_url,
            principal,
            vault_passphrase,
            sync_interval: Duration::from_secs(interval_secs),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}
