// law_logger - Signed log shipping to Azure Log Analytics
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use law_logger::client::WorkspaceLogger;
use law_logger::config::{LoggerConfig, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MILLIS};
use law_logger::event::severity;
use law_logger::metrics::{LoggerMetrics, Outcome};
use serde_json::Value;
use std::error::Error;
use std::io;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_SEVERITY: i64 = severity::INFO;

#[derive(Debug, Parser)]
#[clap(name = "law_log", version = clap::crate_version!())]
struct LawLogApplication {
    /// ID of the Log Analytics workspace to send events to
    #[clap(long, env = "LAWID")]
    workspace_id: String,

    /// Primary or secondary shared key of the workspace, base64 encoded
    #[clap(long, env = "LAWKEY", hide_env_values = true)]
    shared_key: String,

    /// Custom log table to write events to, without the "_CL" suffix. May not contain '-'
    #[clap(long)]
    table: String,

    /// Severity of events sent, 10 (debug), 20 (info), 30 (warning), 40 (error), or 50 (critical).
    /// Ignored when events are read as JSON.
    #[clap(long, default_value_t = DEFAULT_SEVERITY)]
    severity: i64,

    /// Message of a single event to send. If not set, each non-empty line of standard input
    /// is sent as a separate event
    #[clap(long)]
    message: Option<String>,

    /// Treat each event as a JSON object with a string "message" and an integer "severity"
    #[clap(long)]
    json: bool,

    /// Retry requests that fail with a retryable status this many times before giving up
    #[clap(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Wait `backoff_factor * 2^(retry - 1)` seconds between retries
    #[clap(long, default_value_t = DEFAULT_BACKOFF_FACTOR)]
    backoff_factor: f64,

    /// Timeout for each request to the Log Analytics API, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = LawLogApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .with_writer(io::stderr)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    if opts.table.contains('-') {
        tracing::warn!(message = "table name contains '-' and will be rejected", table = %opts.table);
    }

    let config = LoggerConfig::new(opts.workspace_id.clone(), opts.shared_key.clone(), opts.table.clone())
        .with_max_retries(opts.max_retries)
        .with_backoff_factor(opts.backoff_factor)
        .with_timeout(Duration::from_millis(opts.timeout_millis));

    let metrics = LoggerMetrics::default();
    let logger = WorkspaceLogger::new(config)
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize logger", error = %e);
            process::exit(1)
        })
        .with_metrics(metrics.clone());

    let mut unparsable = 0u64;
    if let Some(message) = opts.message.as_deref() {
        if send(&logger, message, &opts).await.is_err() {
            unparsable += 1;
        }
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if send(&logger, line, &opts).await.is_err() {
                unparsable += 1;
            }
        }
    }

    let sent = metrics.events(Outcome::Success);
    let failed = unparsable
        + [
            Outcome::Validation,
            Outcome::RetriesExhausted,
            Outcome::Response,
            Outcome::InvalidKey,
            Outcome::Transport,
        ]
        .iter()
        .map(|o| metrics.events(*o))
        .sum::<u64>();

    tracing::info!(
        message = "finished sending events",
        table = %opts.table,
        sent = sent,
        failed = failed,
        signature_refreshes = metrics.signature_refreshes(),
    );

    if failed > 0 {
        process::exit(1)
    }

    Ok(())
}

/// Send a single event, returning an error only if the event could not be parsed
/// as JSON. Errors sending the event are logged and counted by the logger metrics.
async fn send(logger: &WorkspaceLogger, line: &str, opts: &LawLogApplication) -> Result<(), serde_json::Error> {
    let res = if opts.json {
        match serde_json::from_str::<Value>(line) {
            Ok(v) => logger.log_value(&v).await,
            Err(e) => {
                tracing::error!(message = "unable to parse event as JSON", error = %e);
                return Err(e);
            }
        }
    } else {
        logger.log(line, opts.severity).await
    };

    if let Err(e) = res {
        tracing::error!(message = "failed to send log event", error = %e);
    }

    Ok(())
}
