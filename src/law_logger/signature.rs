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

//! Shared key signatures for the HTTP Data Collector API.
//!
//! The backend rebuilds the same string to sign from the request it receives and
//! compares signatures, so the layout of [`string_to_sign`] must not change.

use base64::engine::general_purpose::STANDARD;
use base64::{DecodeError, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const RESOURCE_PATH: &str = "/api/logs";

const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a time the way the `x-ms-date` header expects, e.g. `Mon, 04 Apr 2016 08:00:00 GMT`.
pub fn format_date(now: DateTime<Utc>) -> String {
    now.format(DATE_FORMAT).to_string()
}

pub fn string_to_sign(content_length: usize, date: &str) -> String {
    format!(
        "POST\n{}\n{}\nx-ms-date:{}\n{}",
        content_length, CONTENT_TYPE_JSON, date, RESOURCE_PATH
    )
}

/// Compute the base64 encoded HMAC-SHA256 signature of a request body with `content_length`
/// bytes sent at `date`, keyed with the base64 encoded `shared_key` of the workspace.
///
/// # Errors
///
/// If the shared key is not valid base64.
pub fn build_signature(shared_key: &str, content_length: usize, date: &str) -> Result<String, DecodeError> {
    let key = STANDARD.decode(shared_key)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).expect("HMAC accepts keys of any length");
    mac.update(string_to_sign(content_length, date).as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod test {
    use super::{build_signature, format_date, string_to_sign};
    use chrono::{TimeZone, Utc};

    // base64 of "test_key"
    const KEY: &str = "dGVzdF9rZXk=";
    const DATE: &str = "Wed, 01 Jan 2020 00:00:00 GMT";

    #[test]
    fn test_format_date() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(DATE, format_date(now));

        let now = Utc.with_ymd_and_hms(2016, 4, 4, 8, 5, 9).unwrap();
        assert_eq!("Mon, 04 Apr 2016 08:05:09 GMT", format_date(now));
    }

    #[test]
    fn test_string_to_sign() {
        assert_eq!(
            "POST\n41\napplication/json\nx-ms-date:Wed, 01 Jan 2020 00:00:00 GMT\n/api/logs",
            string_to_sign(41, DATE)
        );
    }

    #[test]
    fn test_build_signature_known_value() {
        let sig = build_signature(KEY, 41, DATE).unwrap();
        assert_eq!("uQpjMeDCANQ1c5AtVJNOqY6ypzjh07BIbh/CF2OyAAA=", sig);
    }

    #[test]
    fn test_build_signature_depends_on_length() {
        let sig = build_signature(KEY, 38, DATE).unwrap();
        assert_eq!("E0o0rAqUx+h9Lhv3ggcC2ebTqsQA5TveVb4EqqZZZLs=", sig);
    }

    #[test]
    fn test_build_signature_deterministic() {
        let first = build_signature(KEY, 41, DATE).unwrap();
        let second = build_signature(KEY, 41, DATE).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_build_signature_bad_key() {
        assert!(build_signature("not base64!", 41, DATE).is_err());
    }
}
