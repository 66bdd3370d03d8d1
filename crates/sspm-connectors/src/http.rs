//! Shared HTTP plumbing for vendor clients.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use sspm_sync::Canceled;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn client() -> Result<Client> {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("building http client failed")
}

/// Decode a response body after checking the status.
pub(crate) async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("upstream returned {status}: {body}"));
    }
    resp.json::<T>().await.context("decoding response failed")
}

/// `Retry-After` in seconds, when present and sane.
pub(crate) fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Whether a status is worth a rate-limit retry.
pub(crate) fn is_throttle_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

/// Sleep for a retry backoff on a cancellable timer.
pub(crate) async fn backoff_sleep(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Canceled.into()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Extract the `after` cursor from an RFC 5988 `Link` header with
/// `rel="next"` (Okta-style pagination).
pub(crate) fn next_cursor_from_link(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(reqwest::header::LINK) {
        let Ok(raw) = value.to_str() else { continue };
        for part in raw.split(',') {
            if !part.contains(r#"rel="next""#) {
                continue;
            }
            let url = part.split(';').next()?.trim().trim_matches(['<', '>']);
            let parsed = reqwest::Url::parse(url).ok()?;
            for (k, v) in parsed.query_pairs() {
                if k == "after" {
                    return Some(v.into_owned());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, LINK, RETRY_AFTER};

    #[test]
    fn parses_next_cursor_from_link_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://acme.okta.com/api/v1/users?limit=200>; rel="self", <https://acme.okta.com/api/v1/users?after=00u123&limit=200>; rel="next""#,
            ),
        );
        assert_eq!(next_cursor_from_link(&headers).as_deref(), Some("00u123"));
    }

    #[test]
    fn missing_next_link_means_last_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://acme.okta.com/api/v1/users?limit=200>; rel="self""#,
            ),
        );
        assert_eq!(next_cursor_from_link(&headers), None);
        assert_eq!(next_cursor_from_link(&HeaderMap::new()), None);
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        assert_eq!(retry_after_secs(&headers), Some(17));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after_secs(&headers), None);
    }

    #[test]
    fn throttle_statuses() {
        assert!(is_throttle_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_throttle_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_throttle_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_throttle_status(StatusCode::BAD_REQUEST));
        assert!(!is_throttle_status(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
