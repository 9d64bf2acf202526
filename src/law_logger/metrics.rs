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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::fmt::{self, Write};

/// How a call to log a single event ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Validation,
    RetriesExhausted,
    Response,
    InvalidKey,
    Transport,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Validation => "validation",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Response => "response",
            Self::InvalidKey => "invalid_key",
            Self::Transport => "transport",
        }
    }
}

impl EncodeLabelValue for Outcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        encoder.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: Outcome,
}

/// Holder for metrics about events sent by a `WorkspaceLogger`.
///
/// Metrics are registered upon call to `LoggerMetrics::new()`. Clones share the same
/// underlying counters so a single instance can be handed to several loggers.
#[derive(Clone, Debug, Default)]
pub struct LoggerMetrics {
    events: Family<OutcomeLabels, Counter>,
    signature_refreshes: Counter,
}

impl LoggerMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let metrics = Self::default();

        reg.register("law_events", "Log events by outcome", metrics.events.clone());
        reg.register(
            "law_signature_refreshes",
            "Requests signed again after an invalid signature response",
            metrics.signature_refreshes.clone(),
        );

        metrics
    }

    pub fn event(&self, outcome: Outcome) {
        self.events.get_or_create(&OutcomeLabels { outcome }).inc();
    }

    pub fn signature_refresh(&self) {
        self.signature_refreshes.inc();
    }

    pub fn events(&self, outcome: Outcome) -> u64 {
        self.events.get_or_create(&OutcomeLabels { outcome }).get()
    }

    pub fn signature_refreshes(&self) -> u64 {
        self.signature_refreshes.get()
    }
}

#[cfg(test)]
mod test {
    use super::{LoggerMetrics, Outcome};
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;

    #[test]
    fn test_counts_shared_between_clones() {
        let mut reg = Registry::default();
        let metrics = LoggerMetrics::new(&mut reg);
        let other = metrics.clone();

        metrics.event(Outcome::Success);
        other.event(Outcome::Success);
        other.event(Outcome::Response);
        other.signature_refresh();

        assert_eq!(2, metrics.events(Outcome::Success));
        assert_eq!(1, metrics.events(Outcome::Response));
        assert_eq!(0, metrics.events(Outcome::Transport));
        assert_eq!(1, metrics.signature_refreshes());
    }

    #[test]
    fn test_encoded_names() {
        let mut reg = Registry::default();
        let metrics = LoggerMetrics::new(&mut reg);
        metrics.event(Outcome::RetriesExhausted);

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert!(buf.contains("law_events_total{outcome=\"retries_exhausted\"} 1"));
        assert!(buf.contains("law_signature_refreshes_total 0"));
    }
}
