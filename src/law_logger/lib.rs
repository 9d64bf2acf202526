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

//! Signed log shipping to Azure Log Analytics
//!
//! ## Features
//!
//! `law_logger` writes structured log events from scheduled data jobs to a custom table in a
//! [Log Analytics workspace] using the [HTTP Data Collector API]. Each event is a single row
//! with two columns.
//!
//! * `message` - Free form text, always a string.
//! * `severity` - Integer severity, `10` debug, `20` info, `30` warning, `40` error, `50` critical.
//!
//! Requests are signed with the shared key of the workspace. Requests that get a retryable
//! status (`503` by default) are retried with exponential backoff, and requests rejected with
//! the occasional bogus "invalid signature" response are signed again and resent.
//!
//! [Log Analytics workspace]: https://learn.microsoft.com/en-us/azure/azure-monitor/logs/log-analytics-workspace-overview
//! [HTTP Data Collector API]: https://learn.microsoft.com/en-us/azure/azure-monitor/logs/data-collector-api
//!
//! ## Build
//!
//! `law_logger` is a Rust library and program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Library
//!
//! Jobs create a single logger at startup and call `log` for each event. Any error returned
//! should be treated as fatal to the current job run.
//!
//! ```no_run
//! use law_logger::client::WorkspaceLogger;
//! use law_logger::config::LoggerConfig;
//! use law_logger::event::severity;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggerConfig::from_env("GetActualTenMinSynopticData")?.with_max_retries(5);
//! let logger = WorkspaceLogger::new(config)?;
//! logger.log("fetched 144 files", severity::INFO).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Command line
//!
//! The `law_log` program sends a single event or one event per line of standard input. The
//! workspace ID and shared key are read from the `LAWID` and `LAWKEY` environment variables
//! when not given as flags.
//!
//! ```text
//! export LAWID=... LAWKEY=...
//! ./law_log --table KNWToSQL --severity 40 --message 'unable to parse KNW file'
//! cat events.jsonl | ./law_log --table KNWToSQL --json
//! ```
//!

pub mod client;
pub mod config;
pub mod event;
pub mod metrics;
pub mod signature;
pub mod transport;
