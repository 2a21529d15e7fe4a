//! Command line interface for querying relays, publishing signed records and
//! managing the stored remote signing session.

use std::{collections::BTreeMap, fs, io::Write};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use encli::{
    config::Settings,
    discovery::{self, Announcements},
    CredentialStore, Event, FileCredentialStore, Filter,
};
use tracing::info;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "encli",
    author,
    version,
    about = "Nostr relay client and remote signing session",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Query relays and print matching records, one JSON object per line.
    Fetch {
        /// Relay to query; repeatable. Defaults to `RELAYS`.
        #[arg(long = "relay")]
        relays: Vec<String>,
        #[arg(long = "kind")]
        kinds: Vec<u32>,
        #[arg(long = "author")]
        authors: Vec<String>,
        /// Single-letter tag constraint as `NAME=VALUE`; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Verify signed record files and publish them.
    Publish {
        /// Relay to publish to; repeatable. Defaults to `RELAYS`.
        #[arg(long = "relay")]
        relays: Vec<String>,
        /// Paths to JSON record files.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// List recent service announcements with a valid signature, newest per
    /// author.
    Services {
        /// Relay to search; repeatable. Defaults to `SEARCH_RELAY`.
        #[arg(long = "relay")]
        relays: Vec<String>,
        #[arg(long, value_enum, default_value_t = Family::Enclave)]
        family: Family,
        /// Only announcements tagging this service key.
        #[arg(long)]
        pubkey: Option<String>,
    },
    /// Forget the stored remote signing session.
    Logout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Family {
    Enclave,
    Keycrux,
    Container,
}

impl Family {
    fn announcements(self) -> Announcements {
        match self {
            Family::Enclave => Announcements::enclaves(),
            Family::Keycrux => Announcements::keycrux(),
            Family::Container => Announcements::containers(),
        }
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    execute(cli.command, &cfg, out).await
}

async fn execute(command: Commands, cfg: &Settings, out: &mut impl Write) -> anyhow::Result<()> {
    match command {
        Commands::Fetch {
            relays,
            kinds,
            authors,
            tags,
            since,
            limit,
        } => {
            let filter = build_filter(kinds, authors, &tags, since, limit)?;
            let relays = or_configured(relays, cfg);
            for ev in cfg.fanout_query().fetch(&filter, &relays).await? {
                writeln!(out, "{}", serde_json::to_string(&ev)?)?;
            }
        }
        Commands::Publish { relays, files } => {
            // Check every file before anything goes out.
            let mut events = Vec::with_capacity(files.len());
            for f in &files {
                let data = fs::read_to_string(f).with_context(|| format!("reading {f}"))?;
                let ev: Event = serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
                if !ev.has_valid_shape() {
                    bail!("invalid record in {f}");
                }
                ev.verify().with_context(|| format!("invalid record in {f}"))?;
                events.push(ev);
            }
            let relays = or_configured(relays, cfg);
            let query = cfg.fanout_query();
            for ev in events {
                let accepted = query.publish(&ev, &relays).await?;
                writeln!(out, "{} accepted by {accepted}/{} relays", ev.id, relays.len())?;
            }
        }
        Commands::Services {
            relays,
            family,
            pubkey,
        } => {
            let relays = if relays.is_empty() {
                cfg.discovery_relays()
            } else {
                relays
            };
            let signed = |ev: &Event| ev.verify().is_ok();
            let found = discovery::fetch_services(
                &cfg.fanout_query(),
                &family.announcements(),
                pubkey.as_deref(),
                &relays,
                &signed,
            )
            .await?;
            for ev in found {
                writeln!(out, "{}", serde_json::to_string(&ev)?)?;
            }
        }
        Commands::Logout => {
            let store = FileCredentialStore::new(cfg.credentials_file.clone());
            store.clear()?;
            info!(path = %store.path().display(), "logged out");
        }
    }
    Ok(())
}

fn or_configured(relays: Vec<String>, cfg: &Settings) -> Vec<String> {
    if relays.is_empty() {
        cfg.relays.clone()
    } else {
        relays
    }
}

fn build_filter(
    kinds: Vec<u32>,
    authors: Vec<String>,
    tags: &[String],
    since: Option<u64>,
    limit: Option<u32>,
) -> anyhow::Result<Filter> {
    let mut filter = Filter::new();
    if !kinds.is_empty() {
        filter = filter.kinds(kinds);
    }
    if !authors.is_empty() {
        filter = filter.authors(authors);
    }
    let mut grouped: BTreeMap<char, Vec<String>> = BTreeMap::new();
    for t in tags {
        let (name, value) = parse_tag(t)?;
        grouped.entry(name).or_default().push(value);
    }
    for (name, values) in grouped {
        filter = filter.tag(name, values);
    }
    if let Some(since) = since {
        filter = filter.since(since);
    }
    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }
    Ok(filter)
}

/// Parse `NAME=VALUE` where `NAME` is a single letter.
fn parse_tag(arg: &str) -> anyhow::Result<(char, String)> {
    let Some((name, value)) = arg.split_once('=') else {
        bail!("tag must look like NAME=VALUE: {arg}");
    };
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok((c, value.to_string())),
        _ => bail!("tag name must be a single letter: {arg}"),
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli, &mut std::io::stdout().lock()).await
}
