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

use std::collections::BTreeSet;
use std::env;
use std::error;
use std::fmt;
use std::time::Duration;

pub const ENV_WORKSPACE_ID: &str = "LAWID";
pub const ENV_SHARED_KEY: &str = "LAWKEY";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.0;
pub const DEFAULT_RETRYABLE_STATUS: u16 = 503;
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(var) => write!(f, "missing environment variable {}", var),
        }
    }
}

impl error::Error for ConfigError {}

/// Settings for a single `WorkspaceLogger`.
///
/// Each config owns its own set of retryable status codes. Values are set once
/// with the `with_*` methods and never change after the logger is created.
#[derive(Clone, PartialEq)]
pub struct LoggerConfig {
    pub(crate) workspace_id: String,
    pub(crate) shared_key: String,
    pub(crate) log_table_name: String,
    pub(crate) max_retries: u32,
    pub(crate) backoff_factor: f64,
    pub(crate) retryable_status_codes: BTreeSet<u16>,
    pub(crate) timeout: Duration,
}

// The shared key is never printed
impl fmt::Debug for LoggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerConfig")
            .field("workspace_id", &self.workspace_id)
            .field("shared_key", &"<redacted>")
            .field("log_table_name", &self.log_table_name)
            .field("max_retries", &self.max_retries)
            .field("backoff_factor", &self.backoff_factor)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LoggerConfig {
    /// Create a new config with default retry settings.
    ///
    /// `log_table_name` is the custom table events are written to. The backend appends
    /// `_CL` to it and does not accept `-` in the name.
    pub fn new<S1, S2, S3>(workspace_id: S1, shared_key: S2, log_table_name: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        LoggerConfig {
            workspace_id: workspace_id.into(),
            shared_key: shared_key.into(),
            log_table_name: log_table_name.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retryable_status_codes: BTreeSet::from([DEFAULT_RETRYABLE_STATUS]),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MILLIS),
        }
    }

    /// Create a new config using the workspace ID and shared key from the `LAWID` and
    /// `LAWKEY` environment variables.
    pub fn from_env<S: Into<String>>(log_table_name: S) -> Result<Self, ConfigError> {
        let workspace_id = env::var(ENV_WORKSPACE_ID).map_err(|_| ConfigError::Missing(ENV_WORKSPACE_ID))?;
        let shared_key = env::var(ENV_SHARED_KEY).map_err(|_| ConfigError::Missing(ENV_SHARED_KEY))?;
        Ok(Self::new(workspace_id, shared_key, log_table_name))
    }

    /// Number of times a request is retried after a retryable status before giving up.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Factor for the exponential wait between retries, `factor * 2^(retry - 1)` seconds.
    /// Negative values are treated as zero.
    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor.max(0.0);
        self
    }

    pub fn with_retryable_status_codes<I: IntoIterator<Item = u16>>(mut self, codes: I) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn log_table_name(&self) -> &str {
        &self.log_table_name
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn retryable_status_codes(&self) -> &BTreeSet<u16> {
        &self.retryable_status_codes
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Data Collector API endpoint for this workspace.
    pub fn endpoint(&self) -> String {
        format!(
            "https://{}.ods.opinsights.azure.com/api/logs?api-version=2016-04-01",
            self.workspace_id
        )
    }
}

#[cfg(test)]
mod test {
    use super::LoggerConfig;
    use std::collections::BTreeSet;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = LoggerConfig::new("ws", "a2V5", "Jobs");

        assert_eq!(3, config.max_retries());
        assert_eq!(1.0, config.backoff_factor());
        assert_eq!(&BTreeSet::from([503]), config.retryable_status_codes());
        assert_eq!(Duration::from_millis(5000), config.timeout());
    }

    #[test]
    fn test_retryable_status_codes_not_shared() {
        let first = LoggerConfig::new("ws", "a2V5", "Jobs").with_retryable_status_codes([429, 503]);
        let second = LoggerConfig::new("ws", "a2V5", "Jobs");

        assert_eq!(&BTreeSet::from([429, 503]), first.retryable_status_codes());
        assert_eq!(&BTreeSet::from([503]), second.retryable_status_codes());
    }

    #[test]
    fn test_negative_backoff_factor() {
        let config = LoggerConfig::new("ws", "a2V5", "Jobs").with_backoff_factor(-2.0);
        assert_eq!(0.0, config.backoff_factor());
    }

    #[test]
    fn test_debug_hides_shared_key() {
        let config = LoggerConfig::new("ws", "c2VjcmV0", "Jobs");
        let out = format!("{:?}", config);

        assert!(!out.contains("c2VjcmV0"));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn test_endpoint() {
        let config = LoggerConfig::new("Test_workspace_id", "a2V5", "Jobs");
        assert_eq!(
            "https://Test_workspace_id.ods.opinsights.azure.com/api/logs?api-version=2016-04-01",
            config.endpoint()
        );
    }
}
