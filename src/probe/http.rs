//! HTTP and JSON API checks.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::Value;

use super::{elapsed_ms, CheckOutcome, Diagnostics, LatencyLimits, ProbeError};

/// User agent sent with every check request.
pub const USER_AGENT: &str = concat!("vantage-collector/", env!("CARGO_PKG_VERSION"));

fn build_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))
}

fn request_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Network(e.to_string())
    }
}

/// Fetch `url` and read the whole body. Returns the status code and body.
async fn fetch(url: &str, timeout: Duration) -> Result<(StatusCode, Vec<u8>), ProbeError> {
    let client = build_client(timeout)?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(e, timeout))?;

    let status = response.status();

    // Read the full body to measure complete transfer time
    let body = response
        .bytes()
        .await
        .map_err(|e| request_error(e, timeout))?;

    Ok((status, body.to_vec()))
}

/// Check an HTTP endpoint.
///
/// 2xx/3xx are OK unless slow; 4xx and 5xx are WARN; transport failures
/// are hard failures.
pub async fn check_http(url: &str, timeout: Duration, limits: LatencyLimits) -> CheckOutcome {
    let start = Instant::now();
    let result = fetch(url, timeout).await;
    let latency_ms = elapsed_ms(start);

    let (status, _body) = match result {
        Ok(r) => r,
        Err(e) => return CheckOutcome::from_error(latency_ms, Diagnostics::new(), &e),
    };

    let mut meta = Diagnostics::new();
    meta.insert("http_status".into(), Value::from(status.as_u16()));

    if status.is_server_error() {
        return CheckOutcome::degraded(latency_ms, meta, "http_5xx");
    }
    if status.is_client_error() {
        return CheckOutcome::degraded(latency_ms, meta, "http_4xx");
    }

    limits.grade(latency_ms, meta, "slow_http")
}

/// Check a JSON endpoint.
///
/// Requires HTTP 200, a parseable JSON body and, when `expect_key` is set,
/// that key at the top level of a JSON object. Any of those missing is
/// WARN; transport failures are hard failures.
pub async fn check_json_api(
    url: &str,
    expect_key: Option<&str>,
    timeout: Duration,
    limits: LatencyLimits,
) -> CheckOutcome {
    let start = Instant::now();
    let result = fetch(url, timeout).await;
    let latency_ms = elapsed_ms(start);

    let (status, body) = match result {
        Ok(r) => r,
        Err(e) => return CheckOutcome::from_error(latency_ms, Diagnostics::new(), &e),
    };

    let mut meta = Diagnostics::new();
    meta.insert("http_status".into(), Value::from(status.as_u16()));

    if status != StatusCode::OK {
        return CheckOutcome::degraded(latency_ms, meta, format!("http_{}", status.as_u16()));
    }

    let data: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            meta.insert("error".into(), Value::String("json_decode_failed".into()));
            return CheckOutcome::degraded(latency_ms, meta, "json_decode_failed");
        }
    };

    if let Some(key) = expect_key {
        let has_key = data.as_object().is_some_and(|obj| obj.contains_key(key));
        meta.insert("has_key".into(), Value::Bool(has_key));
        if !has_key {
            meta.insert("error".into(), Value::String(format!("missing_key:{}", key)));
            return CheckOutcome::degraded(latency_ms, meta, "missing_key");
        }
    }

    limits.grade(latency_ms, meta, "slow_json_api")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Status;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LIMITS: LatencyLimits = LatencyLimits {
        warn_ms: 8000,
        very_slow_ms: 20000,
    };

    /// Serve a single canned HTTP response on a local port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/health", addr)
    }

    /// Accept connections but never answer.
    async fn serve_silence() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_http_ok() {
        let url = serve_once("200 OK", "{}").await;
        let outcome = check_http(&url, Duration::from_secs(5), LIMITS).await;
        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.meta["http_status"], 200);
    }

    #[tokio::test]
    async fn test_http_server_error_is_warn() {
        let url = serve_once("503 Service Unavailable", "").await;
        let outcome = check_http(&url, Duration::from_secs(5), LIMITS).await;
        assert_eq!(outcome.status, Status::Warn);
        assert!(!outcome.hard_down);
        assert_eq!(outcome.meta["reason"], "http_5xx");
    }

    #[tokio::test]
    async fn test_http_client_error_is_warn() {
        let url = serve_once("404 Not Found", "").await;
        let outcome = check_http(&url, Duration::from_secs(5), LIMITS).await;
        assert_eq!(outcome.status, Status::Warn);
        assert_eq!(outcome.meta["reason"], "http_4xx");
    }

    #[tokio::test]
    async fn test_http_slow_is_warn_never_crit() {
        let url = serve_once("200 OK", "{}").await;
        let zero = LatencyLimits {
            warn_ms: 0,
            very_slow_ms: 0,
        };
        let outcome = check_http(&url, Duration::from_secs(5), zero).await;
        assert_eq!(outcome.status, Status::Warn);
        assert_eq!(outcome.meta["reason"], "slow_http");
        assert_eq!(outcome.meta["slow_level"], "very");
    }

    #[tokio::test]
    async fn test_http_invalid_address_is_hard_failure() {
        let outcome =
            check_http("http://256.256.256.256", Duration::from_millis(100), LIMITS).await;
        assert_eq!(outcome.status, Status::Crit);
        assert!(outcome.hard_down);
    }

    #[tokio::test]
    async fn test_json_api_ok_with_key() {
        let url = serve_once("200 OK", r#"{"status": "up"}"#).await;
        let outcome = check_json_api(&url, Some("status"), Duration::from_secs(5), LIMITS).await;
        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.meta["has_key"], true);
    }

    #[tokio::test]
    async fn test_json_api_missing_key_is_warn() {
        let url = serve_once("200 OK", r#"{"state": "up"}"#).await;
        let outcome = check_json_api(&url, Some("status"), Duration::from_secs(5), LIMITS).await;
        assert_eq!(outcome.status, Status::Warn);
        assert!(!outcome.hard_down);
        assert_eq!(outcome.meta["error"], "missing_key:status");
        assert_eq!(outcome.meta["has_key"], false);
    }

    #[tokio::test]
    async fn test_json_api_bad_json_is_warn() {
        let url = serve_once("200 OK", "<html>").await;
        let outcome = check_json_api(&url, None, Duration::from_secs(5), LIMITS).await;
        assert_eq!(outcome.status, Status::Warn);
        assert_eq!(outcome.meta["error"], "json_decode_failed");
    }

    #[tokio::test]
    async fn test_json_api_non_200_is_warn() {
        let url = serve_once("201 Created", "{}").await;
        let outcome = check_json_api(&url, None, Duration::from_secs(5), LIMITS).await;
        assert_eq!(outcome.status, Status::Warn);
        assert_eq!(outcome.meta["reason"], "http_201");
    }

    #[tokio::test]
    async fn test_json_api_timeout_is_hard_failure() {
        let url = serve_silence().await;
        let outcome = check_json_api(&url, None, Duration::from_millis(200), LIMITS).await;
        assert_eq!(outcome.status, Status::Crit);
        assert!(outcome.hard_down);
        assert_eq!(outcome.meta["error"], "timeout");
    }
}
