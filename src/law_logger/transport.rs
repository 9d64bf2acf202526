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
use reqwest::{Client, Method, StatusCode};
use std::collections::BTreeSet;
use std::error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Longest wait between retries, whether computed from the backoff factor or
/// requested by the server.
pub const BACKOFF_MAX: Duration = Duration::from_secs(120);

/// Statuses for which a `Retry-After` header from the server takes precedence over
/// the computed backoff.
const RETRY_AFTER_STATUSES: [u16; 3] = [413, 429, 503];

/// A single fully built request, including its signature and the date it was signed at.
///
/// A new one is built for every attempt by the logger. The transport may send the
/// same request more than once when retrying a retryable status.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub url: String,
    pub body: String,
    pub signature: String,
    pub date: String,
    pub headers: Vec<(&'static str, String)>,
}

impl SignedRequest {
    /// Value of the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Delay requested by the server via a `Retry-After` header given in seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Sends a single request over the wire, without any retries.
pub trait HttpSend: Send + Sync {
    fn send(&self, request: &SignedRequest) -> impl Future<Output = Result<RawResponse, reqwest::Error>> + Send;
}

#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: Client,
}

impl ReqwestSender {
    pub fn new(client: Client) -> Self {
        ReqwestSender { client }
    }
}

impl HttpSend for ReqwestSender {
    async fn send(&self, request: &SignedRequest) -> Result<RawResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .body(request.body.clone());
        for (name, value) in request.headers.iter() {
            builder = builder.header(*name, value.as_str());
        }

        let res = builder.send().await?;
        let status = res.status();
        let url = res.url().to_string();
        let headers = res
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_owned(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body = res.text().await?;

        Ok(RawResponse {
            status,
            url,
            body,
            headers,
        })
    }
}

#[derive(Debug)]
pub enum TransportError {
    Http(reqwest::Error),
    RetriesExhausted {
        retries: u32,
        status: StatusCode,
        url: String,
        headers: Vec<(&'static str, String)>,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "{}", e),
            Self::RetriesExhausted { retries, status, url, .. } => {
                write!(f, "status {} for {} after {} retries", status, url, retries)
            }
        }
    }
}

impl error::Error for TransportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

/// When and how long to wait before sending a request again.
///
/// Only `POST` requests are retried. A request is sent at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_factor: f64,
    statuses: BTreeSet<u16>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: f64, statuses: BTreeSet<u16>) -> Self {
        RetryPolicy {
            max_retries,
            backoff_factor: backoff_factor.max(0.0),
            statuses,
        }
    }

    pub fn from_config(config: &LoggerConfig) -> Self {
        Self::new(
            config.max_retries,
            config.backoff_factor,
            config.retryable_status_codes.clone(),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_retryable(&self, method: &Method, status: StatusCode) -> bool {
        *method == Method::POST && self.statuses.contains(&status.as_u16())
    }

    /// Computed wait before retry number `retry`, starting at 1.
    ///
    /// The first retry happens immediately, after that the wait is
    /// `backoff_factor * 2^(retry - 1)` seconds up to `BACKOFF_MAX`.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }

        let exp = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.backoff_factor * 2f64.powi(exp);
        Duration::from_secs_f64(secs.min(BACKOFF_MAX.as_secs_f64()))
    }

    fn wait(&self, retry: u32, res: &RawResponse) -> Duration {
        if RETRY_AFTER_STATUSES.contains(&res.status.as_u16()) {
            if let Some(d) = res.retry_after() {
                return d.min(BACKOFF_MAX);
            }
        }

        self.backoff(retry)
    }
}

/// Sends requests and transparently retries retryable statuses and connection
/// failures according to a `RetryPolicy`.
///
/// The transport knows nothing about signatures: retried requests are sent again
/// exactly as they were built.
#[derive(Debug)]
pub struct RetryingTransport<S> {
    sender: S,
    policy: RetryPolicy,
}

impl<S: HttpSend> RetryingTransport<S> {
    pub fn new(sender: S, policy: RetryPolicy) -> Self {
        RetryingTransport { sender, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub async fn execute(&self, request: &SignedRequest) -> Result<RawResponse, TransportError> {
        let mut retries = 0;

        loop {
            let wait = match self.sender.send(request).await {
                Ok(res) if self.policy.is_retryable(&request.method, res.status) => {
                    if retries >= self.policy.max_retries() {
                        return Err(TransportError::RetriesExhausted {
                            retries: self.policy.max_retries(),
                            status: res.status,
                            url: request.url.clone(),
                            headers: request.headers.clone(),
                        });
                    }

                    retries += 1;
                    let wait = self.policy.wait(retries, &res);
                    tracing::warn!(
                        message = "retrying request after retryable status",
                        status = %res.status,
                        retry = retries,
                        wait_ms = wait.as_millis() as u64,
                    );
                    wait
                }
                Ok(res) => return Ok(res),
                Err(e) if is_transient(&e) && retries < self.policy.max_retries() => {
                    retries += 1;
                    let wait = self.policy.backoff(retries);
                    tracing::warn!(
                        message = "retrying request after connection failure",
                        error = %e,
                        retry = retries,
                        wait_ms = wait.as_millis() as u64,
                    );
                    wait
                }
                Err(e) => return Err(TransportError::Http(e)),
            };

            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout()
}

#[cfg(test)]
mod test {
    use super::{HttpSend, RawResponse, RetryPolicy, RetryingTransport, SignedRequest, TransportError, BACKOFF_MAX};
    use reqwest::{Method, StatusCode};
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Scripted {
        responses: Mutex<VecDeque<(u16, Vec<(String, String)>)>>,
        sent_at: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Self {
            Self::with_headers(statuses.iter().map(|s| (*s, Vec::new())).collect())
        }

        fn with_headers(responses: Vec<(u16, Vec<(String, String)>)>) -> Self {
            Scripted {
                responses: Mutex::new(responses.into_iter().collect()),
                sent_at: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> usize {
            self.sent_at.lock().unwrap().len()
        }

        /// Time waited before each retry.
        fn waits(&self) -> Vec<Duration> {
            let sent_at = self.sent_at.lock().unwrap();
            sent_at.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    impl HttpSend for Scripted {
        async fn send(&self, request: &SignedRequest) -> Result<RawResponse, reqwest::Error> {
            self.sent_at.lock().unwrap().push(Instant::now());
            let (status, headers) = self.responses.lock().unwrap().pop_front().expect("unexpected request");

            Ok(RawResponse {
                status: StatusCode::from_u16(status).unwrap(),
                url: request.url.clone(),
                body: String::new(),
                headers,
            })
        }
    }

    fn request(method: Method) -> SignedRequest {
        SignedRequest {
            method,
            url: "https://ws.ods.opinsights.azure.com/api/logs?api-version=2016-04-01".to_owned(),
            body: "{}".to_owned(),
            signature: "sig".to_owned(),
            date: "Wed, 01 Jan 2020 00:00:00 GMT".to_owned(),
            headers: vec![("Log-Type", "Jobs".to_owned())],
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, 0.0, BTreeSet::from([503]))
    }

    fn assert_waited(expected: Duration, actual: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(10),
            "expected wait of {:?}, got {:?}",
            expected,
            actual
        );
    }

    #[test]
    fn test_backoff() {
        let policy = RetryPolicy::new(10, 0.5, BTreeSet::from([503]));

        assert_eq!(Duration::ZERO, policy.backoff(1));
        assert_eq!(Duration::from_secs(1), policy.backoff(2));
        assert_eq!(Duration::from_secs(2), policy.backoff(3));
        assert_eq!(Duration::from_secs(4), policy.backoff(4));
        assert_eq!(BACKOFF_MAX, policy.backoff(30));
    }

    #[test]
    fn test_is_retryable_post_only() {
        let policy = policy(3);

        assert!(policy.is_retryable(&Method::POST, StatusCode::SERVICE_UNAVAILABLE));
        assert!(!policy.is_retryable(&Method::GET, StatusCode::SERVICE_UNAVAILABLE));
        assert!(!policy.is_retryable(&Method::POST, StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_retry_after_header() {
        let policy = RetryPolicy::new(3, 10.0, BTreeSet::from([503, 500]));
        let mut res = RawResponse {
            status: StatusCode::SERVICE_UNAVAILABLE,
            url: String::new(),
            body: String::new(),
            headers: vec![("Retry-After".to_owned(), "7".to_owned())],
        };

        assert_eq!(Duration::from_secs(7), policy.wait(2, &res));

        res.status = StatusCode::INTERNAL_SERVER_ERROR;
        assert_eq!(Duration::from_secs(20), policy.wait(2, &res));
    }

    #[test]
    fn test_retry_after_header_capped() {
        let policy = policy(3);
        let res = RawResponse {
            status: StatusCode::SERVICE_UNAVAILABLE,
            url: String::new(),
            body: String::new(),
            headers: vec![("Retry-After".to_owned(), "86400".to_owned())],
        };

        assert_eq!(BACKOFF_MAX, policy.wait(1, &res));
    }

    #[tokio::test]
    async fn test_execute_retries_then_succeeds() {
        let transport = RetryingTransport::new(Scripted::new(&[503, 503, 503, 200]), policy(3));
        let res = transport.execute(&request(Method::POST)).await.unwrap();

        assert_eq!(StatusCode::OK, res.status);
        assert_eq!(4, transport.sender().sent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_waits_between_retries() {
        let policy = RetryPolicy::new(3, 1.0, BTreeSet::from([503]));
        let transport = RetryingTransport::new(Scripted::new(&[503, 503, 503, 200]), policy);
        let res = transport.execute(&request(Method::POST)).await.unwrap();

        assert_eq!(StatusCode::OK, res.status);
        assert_eq!(3, transport.policy().max_retries());

        let waits = transport.sender().waits();
        assert_eq!(3, waits.len());
        assert_waited(Duration::ZERO, waits[0]);
        assert_waited(Duration::from_secs(2), waits[1]);
        assert_waited(Duration::from_secs(4), waits[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_long_retry_after_is_capped() {
        let transport = RetryingTransport::new(
            Scripted::with_headers(vec![
                (503, vec![("Retry-After".to_owned(), "86400".to_owned())]),
                (200, Vec::new()),
            ]),
            policy(3),
        );

        let res = tokio::time::timeout(
            BACKOFF_MAX + Duration::from_secs(1),
            transport.execute(&request(Method::POST)),
        )
        .await
        .expect("retry should not wait longer than the maximum backoff")
        .unwrap();

        assert_eq!(StatusCode::OK, res.status);
        let waits = transport.sender().waits();
        assert_eq!(1, waits.len());
        assert_waited(BACKOFF_MAX, waits[0]);
    }

    #[tokio::test]
    async fn test_execute_retries_exhausted() {
        let transport = RetryingTransport::new(Scripted::new(&[503, 503, 503, 503]), policy(3));
        let err = transport.execute(&request(Method::POST)).await.unwrap_err();

        assert!(matches!(
            err,
            TransportError::RetriesExhausted { retries: 3, status, .. } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(4, transport.sender().sent());
    }

    #[tokio::test]
    async fn test_execute_zero_retries() {
        let transport = RetryingTransport::new(Scripted::new(&[503]), policy(0));
        let err = transport.execute(&request(Method::POST)).await.unwrap_err();

        assert!(matches!(err, TransportError::RetriesExhausted { retries: 0, .. }));
        assert_eq!(1, transport.sender().sent());
    }

    #[tokio::test]
    async fn test_execute_non_retryable_status_returned() {
        let transport = RetryingTransport::new(Scripted::new(&[503, 404]), policy(3));
        let res = transport.execute(&request(Method::POST)).await.unwrap();

        assert_eq!(StatusCode::NOT_FOUND, res.status);
        assert_eq!(2, transport.sender().sent());
    }

    #[tokio::test]
    async fn test_execute_other_methods_not_retried() {
        let transport = RetryingTransport::new(Scripted::new(&[503]), policy(3));
        let res = transport.execute(&request(Method::GET)).await.unwrap();

        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, res.status);
        assert_eq!(1, transport.sender().sent());
    }
}
