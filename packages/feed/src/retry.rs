//! HTTP retry helpers for transient feed errors.
//!
//! All feed requests go through [`send_json`] instead of calling
//! `reqwest::RequestBuilder::send()` directly, so every request gets
//! automatic retry with capped exponential backoff for transient failures
//! (timeouts, connection resets, server errors, rate limiting).

use std::time::Duration;

use crate::FeedError;

/// Maximum number of retry attempts for transient HTTP errors.
const MAX_RETRIES: u32 = 3;

/// Backoff delays between attempts: 250ms, 1s, 4s.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];

/// Sends an HTTP request, retrying transient failures, and returns the
/// response together with its status.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`] (builders are consumed by `.send()`).
///
/// # Retry behaviour
///
/// Retries up to [`MAX_RETRIES`] times on:
/// - Connection errors and timeouts
/// - HTTP 429 (Too Many Requests)
/// - HTTP 5xx — except 503, which the crime feed uses to signal "too many
///   results, split the polygon" and is returned to the caller untouched
///
/// HTTP 404 (no data published for the month) is likewise passed through.
/// Other 4xx statuses are permanent and fail immediately.
///
/// # Errors
///
/// Returns [`FeedError`] if the request still fails after all retries or a
/// permanent client error is returned.
pub async fn send<F>(build_request: F) -> Result<reqwest::Response, FeedError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_error: Option<FeedError> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = RETRY_DELAYS[(attempt - 1) as usize];
            log::warn!("  retry {attempt}/{MAX_RETRIES} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < MAX_RETRIES {
                    log::warn!("  transient error: {e}");
                    last_error = Some(FeedError::Http(e));
                    continue;
                }
                return Err(FeedError::Http(e));
            }
            Ok(response) => {
                let status = response.status();

                // Feed-specific pass-throughs: 503 means "split the
                // polygon", 404 means "no data for this month".
                if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
                    || status == reqwest::StatusCode::NOT_FOUND
                {
                    return Ok(response);
                }

                if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    if attempt < MAX_RETRIES {
                        log::warn!("  HTTP {status}, retrying");
                        last_error = Some(FeedError::Upstream {
                            message: format!("HTTP {status}"),
                        });
                        continue;
                    }
                    return Err(FeedError::Upstream {
                        message: format!("HTTP {status} after {MAX_RETRIES} retries"),
                    });
                }

                if status.is_client_error() {
                    return Err(FeedError::Upstream {
                        message: format!("HTTP {status}"),
                    });
                }

                return Ok(response);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| FeedError::Upstream {
        message: "request failed after all retries".to_string(),
    }))
}

/// Sends an HTTP request and parses the response body as JSON.
///
/// Returns `None` for the pass-through statuses (503, 404) so the caller
/// can react to them; `Some(value)` otherwise.
///
/// # Errors
///
/// Returns [`FeedError`] if the request fails after retries or the body is
/// not valid JSON.
pub async fn send_json<F>(
    build_request: F,
) -> Result<(reqwest::StatusCode, Option<serde_json::Value>), FeedError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let response = send(&build_request).await?;
    let status = response.status();

    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        || status == reqwest::StatusCode::NOT_FOUND
    {
        return Ok((status, None));
    }

    let value = response.json().await.map_err(FeedError::Http)?;
    Ok((status, Some(value)))
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}
