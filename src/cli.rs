//! Command-line surface: argument parsing, event rendering, and dispatch.
//!
//! Two output modes share one event stream. Human mode prints progress to
//! stderr and results to stdout; `--json` serializes every status event as
//! one JSON object per line on stdout, which is also the format the
//! events carry between processes.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use threadtap_core::capture::TapSummary;
use threadtap_core::load_config;
use threadtap_core::service::ThreadtapService;
use threadtap_events::{EventSink, StatusEvent};

/// Capture request templates from observed traffic, replay them to collect
/// discussion threads, and chat over the results.
#[derive(Debug, Parser)]
#[command(name = "threadtap", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "threadtap.toml")]
    pub config: PathBuf,

    /// Path to the JSON state file.
    #[arg(long, global = true, default_value = "threadtap-state.json")]
    pub state: PathBuf,

    /// Emit one JSON event per line instead of human-readable output.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show captured templates, session status, and run flags.
    Status,
    /// Read an NDJSON observation tap and build request templates from it.
    Ingest {
        /// Tap file to ingest.
        #[arg(long)]
        tap: PathBuf,
    },
    /// Replay the captured templates to collect every thread matching a
    /// query.
    Search {
        /// Search query.
        query: String,
        /// Tap file to ingest before searching.
        #[arg(long)]
        tap: Option<PathBuf>,
    },
    /// Send one message to the configured model backend.
    Chat {
        /// The message.
        message: String,
        /// Tap file to ingest before chatting.
        #[arg(long)]
        tap: Option<PathBuf>,
    },
    /// Drop the conversation history, keeping collected search results.
    Clear,
    /// Print the effective agent instructions.
    Instructions,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let mut service = ThreadtapService::new(config, &cli.state)?;
    let mut sink = event_sink(cli.json);

    match cli.command {
        Command::Status => print_status(&service, cli.json),
        Command::Ingest { tap } => {
            let summary = ingest_from(&mut service, &tap)?;
            print_tap_summary(&summary, cli.json);
            print_status(&service, cli.json);
        }
        Command::Search { query, tap } => {
            if let Some(tap) = tap {
                let summary = ingest_from(&mut service, &tap)?;
                print_tap_summary(&summary, cli.json);
            }
            service.run_search(&query, sink.as_mut()).await?;
        }
        Command::Chat { message, tap } => {
            if let Some(tap) = tap {
                let summary = ingest_from(&mut service, &tap)?;
                print_tap_summary(&summary, cli.json);
            }
            service.chat(&message, sink.as_mut()).await?;
        }
        Command::Clear => {
            service.clear_conversation();
            if !cli.json {
                println!("conversation cleared");
            }
        }
        Command::Instructions => println!("{}", service.instructions()),
    }
    Ok(())
}

fn ingest_from(service: &mut ThreadtapService, tap: &Path) -> Result<TapSummary> {
    let file =
        File::open(tap).with_context(|| format!("opening tap file {}", tap.display()))?;
    let summary = service.ingest_reader(BufReader::new(file))?;
    Ok(summary)
}

fn print_tap_summary(summary: &TapSummary, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "type": "tap.ingested",
                "published": summary.published,
                "filtered": summary.filtered,
                "skipped": summary.skipped,
            })
        );
    } else {
        eprintln!(
            "ingested tap: {} observations published, {} filtered, {} skipped",
            summary.published, summary.filtered, summary.skipped
        );
    }
}

fn print_status(service: &ThreadtapService, json: bool) {
    let status = service.status();
    if json {
        let mut value = serde_json::to_value(status).unwrap_or_default();
        if let Some(object) = value.as_object_mut() {
            object.insert("type".to_string(), "status".into());
            object.insert("can_search".to_string(), status.can_search().into());
        }
        println!("{value}");
        return;
    }
    let mark = |present: bool| if present { "captured" } else { "missing" };
    println!("search template: {}", mark(status.search_template));
    println!("detail template: {}", mark(status.detail_template));
    println!(
        "session header:  {}",
        if status.session_seen { "seen" } else { "not seen" }
    );
    if status.replay_active {
        println!("search run:      active");
    }
    if status.agent_active {
        println!("chat turn:       active");
    }
    if status.can_search() {
        println!("ready to search");
    } else {
        println!("not ready; ingest a tap with both request kinds first");
    }
}

fn event_sink(json: bool) -> Box<dyn EventSink> {
    if json {
        Box::new(JsonLineSink)
    } else {
        Box::new(HumanSink)
    }
}

/// One serialized event per line, for machine consumers.
struct JsonLineSink;

impl EventSink for JsonLineSink {
    fn emit(&mut self, event: &StatusEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "unserializable event dropped"),
        }
    }
}

/// Progress on stderr, results and reply text on stdout.
struct HumanSink;

impl EventSink for HumanSink {
    fn emit(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::SearchStarted(query) => {
                eprintln!("searching \"{}\"...", query.query);
            }
            StatusEvent::SearchProgress(progress) | StatusEvent::ToolProgress(progress) => {
                if progress.error_count > 0 {
                    eprintln!(
                        "  fetched {}/{} ({} failed)",
                        progress.current, progress.total, progress.error_count
                    );
                } else {
                    eprintln!("  fetched {}/{}", progress.current, progress.total);
                }
            }
            StatusEvent::SearchCompleted(summary) => {
                println!(
                    "collected {} threads, {} comments ({} items failed)",
                    summary.threads, summary.comments, summary.errors
                );
            }
            StatusEvent::ChatDelta(delta) => {
                print!("{}", delta.text);
                std::io::stdout().flush().ok();
            }
            StatusEvent::ChatCompleted => println!(),
            StatusEvent::ToolStarted(query) => {
                eprintln!("[searching \"{}\"]", query.query);
            }
            StatusEvent::ToolCompleted(summary) => {
                eprintln!(
                    "  [{} threads, {} comments collected]",
                    summary.threads, summary.comments
                );
            }
            // Failures propagate as errors and are reported once at exit.
            StatusEvent::RunFailed(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn search_takes_a_query_and_optional_tap() {
        let cli = Cli::try_parse_from([
            "threadtap", "search", "plumber", "--tap", "obs.ndjson", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Search { query, tap } => {
                assert_eq!(query, "plumber");
                assert_eq!(tap.as_deref(), Some(Path::new("obs.ndjson")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_paths_have_defaults_and_overrides() {
        let cli = Cli::try_parse_from(["threadtap", "status"]).unwrap();
        assert_eq!(cli.config, Path::new("threadtap.toml"));
        assert_eq!(cli.state, Path::new("threadtap-state.json"));
        assert!(!cli.json);

        let cli = Cli::try_parse_from([
            "threadtap",
            "--config",
            "alt.toml",
            "--state",
            "alt-state.json",
            "chat",
            "hello",
        ])
        .unwrap();
        assert_eq!(cli.config, Path::new("alt.toml"));
        assert_eq!(cli.state, Path::new("alt-state.json"));
        assert!(matches!(cli.command, Command::Chat { ref message, .. } if message == "hello"));
    }

    #[tokio::test]
    async fn status_runs_against_a_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "threadtap",
            "--config",
            dir.path().join("threadtap.toml").to_str().unwrap(),
            "--state",
            dir.path().join("state.json").to_str().unwrap(),
            "--json",
            "status",
        ])
        .unwrap();
        run(cli).await.unwrap();
    }
}
