//! devlife: command-line front end over the local store.
//!
//! Every command works offline against the database in the data directory.
//! `sync` and `watch` additionally talk to the configured remote backend.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use devlife::auth::SessionAuth;
use devlife::clock::{iso_date, now_millis};
use devlife::config::{
    Cli, Command, Config, FinanceCommand, ProjectCommand, TaskCommand, VaultCommand,
    HTTP_TIMEOUT_SECS, VAULT_SALT,
};
use devlife::crypto::ChaChaCipher;
use devlife::kv::SqliteKv;
use devlife::model::{
    Collection, FinanceEntry, FinanceKind, Patch, Priority, Project, ProjectStatus, RepeatRule,
    Task, VaultEntry,
};
use devlife::remote::HttpRemoteStore;
use devlife::store::{LocalStore, Origin};
use devlife::summary::{self, FinanceFilter, ProjectFilter, TaskFilter};
use devlife::sync::{SyncEngine, SyncOutcome};
use devlife::vault;

type CliResult = Result<(), Box<dyn Error>>;

#[tokio::main]
async fn main() {
    devlife::logging::init();
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(&cli);

    if let Err(e) = run(cli.command, &config).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command, config: &Config) -> CliResult {
    let kv = SqliteKv::open(&config.db_path())?;
    let store = Arc::new(LocalStore::open(kv));

    match command {
        Command::Status => status(&store),
        Command::Project(cmd) => project(&store, cmd),
        Command::Task(cmd) => task(&store, cmd),
        Command::Finance(cmd) => finance(&store, cmd),
        Command::Vault(cmd) => vault_command(&store, config, cmd),
        Command::Delete { collection, id } => {
            let collection: Collection = collection.parse()?;
            if store.delete(collection, &id)? {
                println!("deleted {collection} {id}");
            } else {
                println!("no {collection} record with id {id}");
            }
            Ok(())
        }
        Command::Sync => sync_once(store, config).await,
        Command::Watch => watch(store, config).await,
        Command::Reset => {
            store.clear()?;
            println!("local data wiped");
            Ok(())
        }
    }
}

fn today() -> String {
    iso_date(now_millis())
}

fn status(store: &LocalStore) -> CliResult {
    let state = store.state();
    let board = summary::dashboard(&state, &today());
    println!(
        "projects: {} ({} active)",
        state.projects.len(),
        board.active_projects
    );
    println!(
        "tasks: {} ({} due today, {} high priority, {} overdue)",
        state.tasks.len(),
        board.tasks_due_today,
        board.high_priority_open,
        board.overdue_tasks
    );
    println!(
        "finances: {} entries, profit {:.2}",
        state.finances.len(),
        board.finances.profit
    );
    println!("vault: {} keys", state.vault.len());
    println!("pending sync: {}", store.pending_count());
    for reminder in summary::due_reminders(&state.tasks, now_millis()) {
        println!("reminder due: {} ({})", reminder.title, reminder.meta.id);
    }
    Ok(())
}

fn project(store: &LocalStore, cmd: ProjectCommand) -> CliResult {
    match cmd {
        ProjectCommand::Add {
            name,
            status,
            progress,
            deadline,
            github_url,
            live_url,
            notes,
        } => {
            let mut patch = Patch::with_new_id()
                .set("name", name)
                .set("status", status.parse::<ProjectStatus>()?)
                .set("progress", progress);
            for (field, value) in [
                ("deadline", deadline),
                ("github_url", github_url),
                ("live_url", live_url),
                ("notes", notes),
            ] {
                if let Some(value) = value {
                    patch = patch.set(field, value);
                }
            }
            let project: Project = store.upsert(patch, Origin::Local)?;
            println!("added project {}", project.meta.id);
        }
        ProjectCommand::List { search, status } => {
            let filter = ProjectFilter {
                search: search.unwrap_or_default(),
                status: status.map(|s| s.parse()).transpose()?,
            };
            let projects = store.list::<Project>();
            for p in summary::filter_projects(&projects, &filter) {
                println!(
                    "{}  {:<24} {:?} {:>3}%  {}",
                    p.meta.id, p.name, p.status, p.progress, p.deadline
                );
            }
        }
    }
    Ok(())
}

fn task(store: &LocalStore, cmd: TaskCommand) -> CliResult {
    match cmd {
        TaskCommand::Add {
            title,
            priority,
            due,
            description,
            repeat,
        } => {
            let patch = Patch::with_new_id()
                .set("title", title)
                .set("priority", priority.parse::<Priority>()?)
                .set("due_date", due.unwrap_or_else(today))
                .set("description", description.unwrap_or_default())
                .set("repeat_type", repeat.parse::<RepeatRule>()?);
            let task: Task = store.upsert(patch, Origin::Local)?;
            println!("added task {}", task.meta.id);
        }
        TaskCommand::Done { id } => match summary::toggle_task(store, &id)? {
            Some(task) if task.completed => println!("completed {}", task.title),
            Some(task) => println!("reopened {}", task.title),
            None => println!("no task with id {id}"),
        },
        TaskCommand::Snooze { id, minutes } => {
            match summary::snooze_task(store, &id, minutes, now_millis())? {
                Some(task) => println!("snoozed {} for {minutes} minute(s)", task.title),
                None => println!("no task with id {id}"),
            }
        }
        TaskCommand::List {
            search,
            priority,
            status,
        } => {
            let filter = TaskFilter {
                search: search.unwrap_or_default(),
                priority: priority.map(|p| p.parse()).transpose()?,
                status: status.parse()?,
            };
            let today = today();
            let tasks = store.list::<Task>();
            for t in summary::filter_tasks(&tasks, &filter, &today) {
                let mark = if t.completed {
                    "x"
                } else if summary::is_overdue(t, &today) {
                    "!"
                } else {
                    " "
                };
                println!(
                    "[{mark}] {}  {:<32} {:?}  {}",
                    t.meta.id, t.title, t.priority, t.due_date
                );
            }
        }
    }
    Ok(())
}

fn finance(store: &LocalStore, cmd: FinanceCommand) -> CliResult {
    match cmd {
        FinanceCommand::Add {
            kind,
            amount,
            client,
            date,
            notes,
        } => {
            let mut patch = Patch::with_new_id()
                .set("type", kind.parse::<FinanceKind>()?)
                .set("amount", amount)
                .set("client_name", client)
                .set("date", date.unwrap_or_else(today));
            if let Some(notes) = notes {
                patch = patch.set("notes", notes);
            }
            let entry: FinanceEntry = store.upsert(patch, Origin::Local)?;
            println!("added finance entry {}", entry.meta.id);
        }
        FinanceCommand::List { from, to, view } => {
            let filter = FinanceFilter {
                from,
                to,
                view: view.parse()?,
            };
            let entries = store.list::<FinanceEntry>();
            for e in summary::filter_finances(&entries, &filter) {
                println!(
                    "{}  {}  {:?}  {:>12.2}  {}",
                    e.meta.id, e.date, e.kind, e.amount, e.client_name
                );
            }
        }
        FinanceCommand::Stats { from, to } => {
            let filter = FinanceFilter {
                from,
                to,
                ..Default::default()
            };
            let entries = store.list::<FinanceEntry>();
            let in_range: Vec<FinanceEntry> = summary::filter_finances(&entries, &filter)
                .into_iter()
                .cloned()
                .collect();
            let stats = summary::finance_stats(&in_range);
            println!("revenue:      {:.2}", stats.revenue);
            println!("expenses:     {:.2}", stats.expenses);
            println!("profit:       {:.2}", stats.profit);
            println!("loan balance: {:.2}", stats.loan_balance);
            println!("receivables:  {:.2}", stats.receivables);
        }
    }
    Ok(())
}

fn cipher(config: &Config) -> Result<ChaChaCipher, Box<dyn Error>> {
    let passphrase = config
        .vault_passphrase
        .as_deref()
        .ok_or("DEVLIFE_VAULT_PASSPHRASE is not set")?;
    Ok(ChaChaCipher::from_passphrase(passphrase, VAULT_SALT)?)
}

fn vault_command(store: &LocalStore, config: &Config, cmd: VaultCommand) -> CliResult {
    match cmd {
        VaultCommand::Add {
            service,
            secret,
            expiry,
            project_id,
        } => {
            let cipher = cipher(config)?;
            let mut patch = vault::seal_entry(&cipher, &service, &secret, expiry.as_deref())?;
            if let Some(project_id) = project_id {
                patch = patch.set("project_id", project_id);
            }
            let entry: VaultEntry = store.upsert(patch, Origin::Local)?;
            println!("stored key for {} as {}", entry.service_name, entry.meta.id);
        }
        VaultCommand::Reveal { id } => {
            let cipher = cipher(config)?;
            let entry = store
                .get::<VaultEntry>(&id)
                .ok_or_else(|| format!("no vault entry with id {id}"))?;
            println!("{}", vault::reveal(&cipher, &entry)?);
        }
        VaultCommand::List => {
            for entry in store.list::<VaultEntry>() {
                println!(
                    "{}  {:<24} expires {}",
                    entry.meta.id, entry.service_name, entry.expiry_date
                );
            }
        }
    }
    Ok(())
}

fn engine(
    store: Arc<LocalStore>,
    config: &Config,
) -> Result<SyncEngine<HttpRemoteStore, SessionAuth>, Box<dyn Error>> {
    let url = config
        .remote_url
        .as_deref()
        .ok_or("no remote configured (--remote-url or DEVLIFE_REMOTE_URL)")?;
    let remote = HttpRemoteStore::new(url, Duration::from_secs(HTTP_TIMEOUT_SECS));
    let auth = SessionAuth::new(config.principal.clone());
    Ok(SyncEngine::new(store, remote, auth))
}

fn print_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Skipped(reason) => println!("sync skipped: {reason:?}"),
        SyncOutcome::Completed(report) => {
            println!(
                "sync done: pushed {}, pulled {}",
                report.pushed(),
                report.pulled()
            );
            for (collection, error) in report.failures() {
                println!("  {collection}: {error}");
            }
        }
    }
}

async fn sync_once(store: Arc<LocalStore>, config: &Config) -> CliResult {
    let engine = engine(Arc::clone(&store), config)?;
    let outcome = engine.sync_all().await;
    print_outcome(&outcome);
    println!("pending sync: {}", store.pending_count());
    Ok(())
}

async fn watch(store: Arc<LocalStore>, config: &Config) -> CliResult {
    let engine = Arc::new(engine(store, config)?);
    let handle = engine
        .start(config.sync_interval)
        .ok_or("background sync already running")?;
    let mut outcomes = handle.outcomes();
    println!(
        "syncing every {}s, Ctrl-C to stop",
        config.sync_interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = outcomes.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = outcomes.borrow_and_update().clone();
                if let Some(outcome) = latest {
                    print_outcome(&outcome);
                }
            }
        }
    }
    handle.shutdown().await;
    Ok(())
}
