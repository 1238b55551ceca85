// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "foreman",
    version,
    about = "Observation and governance control plane for hosted agent sessions",
    long_about = "Foreman watches a fleet of agent sessions through the host's event \
                  stream, mints idempotent punch records into PostgreSQL, kills \
                  runaway sessions, and dispatches bounded recovery sessions. The \
                  validate subcommands gate task completion on punch cards."
)]
pub struct Cli {
    /// Path to an explicit config file (merged over discovered configs).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). Logs go to stderr.
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingest daemon: catch up, stream events, govern sessions.
    ///
    /// Exits non-zero only when the store or the agent host is unreachable
    /// at startup; after that, disconnects are survived with reconnect
    /// backoff.
    Start,

    /// Validate a task against a punch card.
    ///
    /// Exit code 0 on pass, 1 on fail, so workflow steps can gate on it
    /// directly.
    Validate {
        /// Task (session) id to validate.
        #[arg(long)]
        task: String,
        /// Card id whose requirement rows to evaluate.
        #[arg(long)]
        card: String,
        /// Print the result as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Check the file-mutation count of a task against a range.
    Adherence {
        #[arg(long)]
        task: String,
        /// Minimum acceptable mutating tool calls.
        #[arg(long)]
        min: u64,
        /// Maximum acceptable mutating tool calls.
        #[arg(long)]
        max: u64,
    },

    /// Validate every recorded child of a task against a card.
    VerifySubtasks {
        #[arg(long)]
        task: String,
        /// Card id applied to each child.
        #[arg(long)]
        card: String,
        #[arg(long)]
        json: bool,
    },

    /// Recover parent/child edges from spawn punches.
    ///
    /// Normally the daemon keeps these in sync; this is the manual repair
    /// path after importing punches from elsewhere.
    SyncChildren,

    /// Show a progress snapshot of one live session, straight from the host.
    Status {
        /// Session id to snapshot.
        #[arg(long)]
        session: String,
        #[arg(long)]
        json: bool,
    },

    /// Print the merged effective configuration and exit.
    ShowConfig,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
