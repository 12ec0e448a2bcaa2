mod api;
mod github;
mod plans;
mod roster;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};

use crate::api::{ProxyServer, ProxyServerConfig};
use crate::github::GitHubClient;
use crate::plans::PlansIndexConfig;
use crate::roster::classify::classify;
use crate::roster::entry::finalize_entry;
use crate::roster::model::{self, RespawnTime, Roster, TimeRecord};

#[derive(Parser, Debug)]
#[command(
    name = "respawnboard",
    version,
    about = "Respawn roster editor backed by a GitHub-hosted JSON file"
)]
struct Cli {
    /// Roster file: a local path, or a repository path with --remote.
    #[arg(long, default_value = "public/data.json")]
    data: String,

    /// Edit the copy in the configured GitHub repository instead of a
    /// local file (GH_TOKEN / GH_OWNER / GH_REPO environment).
    #[arg(long)]
    remote: bool,

    /// Commit message for remote saves.
    #[arg(long, short)]
    message: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Show the roster ordered by how soon each entry respawns
    Show,
    /// List entries in stored order with their saved time values
    List,
    /// Rename the entry at INDEX (1-based, stored order)
    Rename { index: usize, name: String },
    /// Set the respawn time at INDEX from digit input; omit DIGITS to clear
    Time { index: usize, digits: Option<String> },
    /// Insert a new entry at the end, or after --after INDEX
    Add {
        name: Option<String>,
        #[arg(long)]
        after: Option<usize>,
    },
    /// Delete the entry at INDEX
    Remove { index: usize },
    /// Move the entry at FROM so it ends up at position TO
    Move { from: usize, to: usize },
    /// Sort entries alphabetically by name
    Sort,
    /// Run the save/read proxy in front of the GitHub Contents API
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
    /// Build the plans JSON index from a folder of Markdown documents
    PlansIndex {
        #[arg(long, default_value = "site/plans")]
        plans_dir: PathBuf,
        #[arg(long, default_value = "public/planshub/index.json")]
        out: PathBuf,
        #[arg(long, default_value = "unassigned")]
        owner: String,
    },
}

enum Store {
    Local(PathBuf),
    Remote { client: GitHubClient, path: String },
}

impl Store {
    fn open(cli: &Cli) -> Result<Self> {
        if cli.remote {
            let client = GitHubClient::from_env().context("remote mode needs GitHub settings")?;
            Ok(Store::Remote {
                client,
                path: cli.data.clone(),
            })
        } else {
            Ok(Store::Local(PathBuf::from(&cli.data)))
        }
    }

    fn load(&self) -> Result<Roster> {
        match self {
            Store::Local(path) => model::load_roster_file(path),
            Store::Remote { client, path } => {
                let content = client
                    .read(path)
                    .with_context(|| format!("failed to load {path}"))?;
                model::parse_roster_text(&content)
            }
        }
    }

    fn save(&self, roster: &mut Roster, message: Option<&str>, now: NaiveDateTime) -> Result<()> {
        // Bare clocks get their date here, with one now sample for the
        // whole roster; dated entries keep the date they already carry.
        roster.resolve_for_save(now);
        match self {
            Store::Local(path) => model::save_roster_file(path, roster),
            Store::Remote { client, path } => {
                let default_message = format!("chore: update {path}");
                let message = message.unwrap_or(&default_message);
                let outcome = client
                    .save(path, &roster.to_pretty_json(), message)
                    .with_context(|| format!("failed to save {path}"))?;
                match outcome.commit {
                    Some(commit) => println!("saved {} ({commit})", outcome.path),
                    None => println!("saved {}", outcome.path),
                }
                Ok(())
            }
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        CliCommand::Show => show(&cli),
        CliCommand::List => list(&cli),
        CliCommand::Rename { index, name } => edit(&cli, |roster| {
            let position = storage_index(roster, *index)?;
            roster.rename(position, name);
            println!("renamed entry {index} to {name:?}");
            Ok(())
        }),
        CliCommand::Time { index, digits } => edit(&cli, |roster| {
            let position = storage_index(roster, *index)?;
            let time = finalize_entry(digits.as_deref().unwrap_or(""));
            roster.set_time(position, time);
            match time {
                RespawnTime::Clock(clock) => println!("entry {index} respawns at {clock}"),
                _ => println!("cleared respawn time for entry {index}"),
            }
            Ok(())
        }),
        CliCommand::Add { name, after } => edit(&cli, |roster| {
            let after = match after {
                Some(index) => Some(storage_index(roster, *index)?),
                None => None,
            };
            let at = roster.insert_after(after, name.as_deref().unwrap_or(""));
            println!("added entry at position {}", at + 1);
            Ok(())
        }),
        CliCommand::Remove { index } => edit(&cli, |roster| {
            let position = storage_index(roster, *index)?;
            match roster.remove_at(position) {
                Some(record) => println!("removed {:?}", record.name),
                None => bail!("no entry at index {index}"),
            }
            Ok(())
        }),
        CliCommand::Move { from, to } => edit(&cli, |roster| {
            let from_position = storage_index(roster, *from)?;
            let to_position = storage_index(roster, *to)?;
            roster.move_record(from_position, to_position);
            println!("moved entry {from} to position {to}");
            Ok(())
        }),
        CliCommand::Sort => edit(&cli, |roster| {
            roster.sort_by_name();
            println!("sorted {} entries by name", roster.len());
            Ok(())
        }),
        CliCommand::Serve { bind, port } => serve(bind, *port),
        CliCommand::PlansIndex {
            plans_dir,
            out,
            owner,
        } => {
            let config = PlansIndexConfig {
                plans_dir: plans_dir.clone(),
                out_file: out.clone(),
                default_owner: owner.clone(),
            };
            let count = plans::build_plans_index(&config, Utc::now())?;
            println!("wrote {} ({count} plans)", out.display());
            Ok(())
        }
    }
}

fn show(cli: &Cli) -> Result<()> {
    let store = Store::open(cli)?;
    let roster = store.load()?;
    let now = Local::now().naive_local();
    let result = classify(roster.records(), now);

    if roster.is_empty() {
        println!("(empty roster)");
    }
    for (line, &position) in result.order.iter().enumerate() {
        let record = &roster.records()[position];
        let time = match &record.time {
            RespawnTime::None => "-".to_string(),
            RespawnTime::Clock(clock) => clock.to_string(),
            RespawnTime::Absolute(at) => at.clock.to_string(),
        };
        println!(
            "{:>3}  {:<24} {:>6}  {}",
            line + 1,
            display_name(record),
            time,
            result.statuses[position]
        );
    }

    if let Store::Remote { client, path } = &store {
        match client.last_commit_time(path) {
            Ok(Some(date)) => println!("last updated: {date}"),
            Ok(None) => println!("last update time unknown"),
            Err(err) => eprintln!("warning: could not read last update time: {err}"),
        }
    }
    Ok(())
}

fn list(cli: &Cli) -> Result<()> {
    let store = Store::open(cli)?;
    let roster = store.load()?;
    for (index, record) in roster.records().iter().enumerate() {
        let time = match &record.time {
            RespawnTime::None => String::new(),
            RespawnTime::Clock(clock) => clock.hhmm(),
            RespawnTime::Absolute(at) => at.wire(),
        };
        println!("{:>3}  {:<24} {}", index + 1, display_name(record), time);
    }
    Ok(())
}

fn display_name(record: &TimeRecord) -> &str {
    if record.name.is_empty() {
        "-"
    } else {
        &record.name
    }
}

fn edit(cli: &Cli, apply: impl FnOnce(&mut Roster) -> Result<()>) -> Result<()> {
    let store = Store::open(cli)?;
    let mut roster = store.load()?;
    apply(&mut roster)?;
    store.save(
        &mut roster,
        cli.message.as_deref(),
        Local::now().naive_local(),
    )
}

/// Commands address entries by the 1-based position `list` prints.
fn storage_index(roster: &Roster, index: usize) -> Result<usize> {
    if index == 0 || index > roster.len() {
        bail!("no entry at index {index} (roster has {} entries)", roster.len());
    }
    Ok(index - 1)
}

fn serve(bind: &str, port: u16) -> Result<()> {
    let presence = github::env_presence();
    if !presence.token_present {
        eprintln!("warning: GH_TOKEN is not set; saves through the proxy will fail");
    }

    let server = ProxyServer::start(ProxyServerConfig {
        bind_addr: bind.to_string(),
        port,
    })?;
    match server.local_addr() {
        Some(addr) => println!("proxy listening on http://{addr}"),
        None => println!("proxy listening on {bind}:{port}"),
    }
    server.wait();
    Ok(())
}
