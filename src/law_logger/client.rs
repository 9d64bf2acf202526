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

use crate::config::LoggerConfig;
use crate::event::LogEvent;
use crate::metrics::{LoggerMetrics, Outcome};
use crate::signature::{self, CONTENT_TYPE_JSON};
use crate::transport::{
    HttpSend, RawResponse, ReqwestSender, RetryPolicy, RetryingTransport, SignedRequest, TransportError,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::error;
use std::fmt;

/// Text of the 403 response the backend sometimes returns for a perfectly good signature.
///
/// Matching on response text is fragile: if the backend ever changes the wording the
/// request will fail with `LogError::Response` instead of being signed again.
pub const INVALID_SIGNATURE_TEXT: &str = "An invalid signature was specified in the Authorization header";

/// Most times a single event is signed again after an invalid signature response.
pub const MAX_SIGNATURE_REFRESHES: u32 = 5;

#[derive(Debug)]
pub enum LogError {
    Validation(String),
    RetriesExhausted {
        retries: u32,
        status: StatusCode,
        url: String,
        headers: Vec<(&'static str, String)>,
    },
    Response {
        status: StatusCode,
        url: String,
        body: String,
        headers: Vec<(String, String)>,
    },
    InvalidSharedKey(base64::DecodeError),
    Transport(reqwest::Error),
}

impl LogError {
    fn outcome(&self) -> Outcome {
        match self {
            Self::Validation(_) => Outcome::Validation,
            Self::RetriesExhausted { .. } => Outcome::RetriesExhausted,
            Self::Response { .. } => Outcome::Response,
            Self::InvalidSharedKey(_) => Outcome::InvalidKey,
            Self::Transport(_) => Outcome::Transport,
        }
    }
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "{}", msg),
            Self::RetriesExhausted {
                retries,
                status,
                url,
                headers,
            } => write!(
                f,
                "Still no successful request after {} requests.\nURL: {}\n\
                 MSG: too many {} error responses\nHEADERS: {}",
                retries,
                url,
                status.as_u16(),
                header_list(headers.iter().map(|(k, v)| (*k, v.as_str())))
            ),
            Self::Response {
                status,
                url,
                body,
                headers,
            } => write!(
                f,
                "Unexpected response with code {}\nURL: {}\nBODY: {}\nHEADERS: {}",
                status.as_u16(),
                url,
                body,
                header_list(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            ),
            Self::InvalidSharedKey(e) => write!(f, "invalid shared key: {}", e),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for LogError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::InvalidSharedKey(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Render headers like `{'Log-Type': 'Jobs', 'x-ms-date': '...'}`.
///
/// The signature in an `Authorization` header is replaced so that error messages can
/// be logged safely.
fn header_list<'a, I>(headers: I) -> String
where
    I: Iterator<Item = (&'a str, &'a str)>,
{
    let pairs: Vec<String> = headers
        .map(|(k, v)| {
            if k.eq_ignore_ascii_case("authorization") {
                format!("'{}': '{}'", k, redact_authorization(v))
            } else {
                format!("'{}': '{}'", k, v)
            }
        })
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

/// `SharedKey {workspace_id}:{signature}` becomes `SharedKey {workspace_id}:<redacted>`.
fn redact_authorization(value: &str) -> String {
    match value.rsplit_once(':') {
        Some((prefix, _)) => format!("{}:<redacted>", prefix),
        None => "<redacted>".to_owned(),
    }
}

/// Source of the current time used to date and sign requests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Client for writing events to a custom table of a Log Analytics workspace.
///
/// Every event is sent as a signed `POST` to the HTTP Data Collector API. Retryable
/// statuses are retried by the transport with exponential backoff. Invalid signature
/// responses, which the backend returns now and then for valid requests, cause the
/// request to be dated and signed again.
///
/// A logger holds no state that changes between calls so it can be shared by many
/// tasks, and its HTTP connection pool is released when it's dropped.
#[derive(Debug)]
pub struct WorkspaceLogger<S = ReqwestSender, C = SystemClock> {
    config: LoggerConfig,
    endpoint: String,
    transport: RetryingTransport<S>,
    clock: C,
    metrics: Option<LoggerMetrics>,
}

impl WorkspaceLogger {
    /// Create a new logger that sends requests with its own `reqwest::Client`.
    pub fn new(config: LoggerConfig) -> Result<Self, LogError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(LogError::Transport)?;
        Ok(Self::with_sender(config, ReqwestSender::new(client), SystemClock))
    }
}

impl<S, C> WorkspaceLogger<S, C>
where
    S: HttpSend,
    C: Clock,
{
    pub fn with_sender(config: LoggerConfig, sender: S, clock: C) -> Self {
        let policy = RetryPolicy::from_config(&config);
        WorkspaceLogger {
            endpoint: config.endpoint(),
            transport: RetryingTransport::new(sender, policy),
            config,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: LoggerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn sender(&self) -> &S {
        self.transport.sender()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Write a single event with the given message and severity.
    ///
    /// See `event::severity` for conventional severity values.
    pub async fn log(&self, message: &str, severity: i64) -> Result<(), LogError> {
        self.log_event(&LogEvent::new(message, severity)).await
    }

    /// Write a single event from loosely typed input.
    ///
    /// `value` must be an object with a string `message` and an integer `severity`,
    /// otherwise `LogError::Validation` is returned and nothing is sent.
    pub async fn log_value(&self, value: &Value) -> Result<(), LogError> {
        match LogEvent::from_value(value) {
            Ok(event) => self.log_event(&event).await,
            Err(msg) => {
                let err = LogError::Validation(msg);
                self.record(&Err(&err));
                Err(err)
            }
        }
    }

    pub async fn log_event(&self, event: &LogEvent) -> Result<(), LogError> {
        let res = self.dispatch(event).await;
        self.record(&res.as_ref().map(|_| ()));
        res
    }

    async fn dispatch(&self, event: &LogEvent) -> Result<(), LogError> {
        let body = event.to_body().map_err(|e| LogError::Validation(e.to_string()))?;
        let mut refreshes = 0;

        loop {
            // Signed as late as possible since the backend rejects requests with stale dates
            let request = self.sign(&body)?;
            tracing::debug!(
                message = "sending log event",
                url = %request.url,
                date = %request.date,
                table = %self.config.log_table_name,
                num_bytes = body.len(),
            );

            let res = self.transport.execute(&request).await.map_err(|e| match e {
                TransportError::RetriesExhausted {
                    retries,
                    status,
                    url,
                    headers,
                } => LogError::RetriesExhausted {
                    retries,
                    status,
                    url,
                    headers,
                },
                TransportError::Http(e) => LogError::Transport(e),
            })?;

            if res.status == StatusCode::OK {
                tracing::debug!(message = "log event accepted", table = %self.config.log_table_name);
                return Ok(());
            }

            if is_invalid_signature(&res) && refreshes < MAX_SIGNATURE_REFRESHES {
                refreshes += 1;
                if let Some(m) = &self.metrics {
                    m.signature_refresh();
                }

                tracing::warn!(message = "invalid signature response, signing request again", refresh = refreshes);
                continue;
            }

            return Err(LogError::Response {
                status: res.status,
                url: res.url,
                body: res.body,
                headers: res.headers,
            });
        }
    }

    fn sign(&self, body: &str) -> Result<SignedRequest, LogError> {
        let date = signature::format_date(self.clock.now());
        let signature = signature::build_signature(&self.config.shared_key, body.len(), &date)
            .map_err(LogError::InvalidSharedKey)?;

        let headers = vec![
            (
                "Authorization",
                format!("SharedKey {}:{}", self.config.workspace_id, signature),
            ),
            ("Content-Type", CONTENT_TYPE_JSON.to_owned()),
            ("Log-Type", self.config.log_table_name.clone()),
            ("x-ms-date", date.clone()),
        ];

        Ok(SignedRequest {
            method: Method::POST,
            url: self.endpoint.clone(),
            body: body.to_owned(),
            signature,
            date,
            headers,
        })
    }

    fn record(&self, res: &Result<(), &LogError>) {
        if let Some(m) = &self.metrics {
            match res {
                Ok(_) => m.event(Outcome::Success),
                Err(e) => m.event(e.outcome()),
            }
        }
    }
}

fn is_invalid_signature(res: &RawResponse) -> bool {
    res.status == StatusCode::FORBIDDEN && res.body.contains(INVALID_SIGNATURE_TEXT)
}
