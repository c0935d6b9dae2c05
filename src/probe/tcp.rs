//! TCP connect check.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::{elapsed_ms, CheckOutcome, Diagnostics, LatencyLimits, ProbeError};

/// Open a TCP connection to `host:port` within `timeout`.
pub async fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<(), ProbeError> {
    let connect = TcpStream::connect((host, port));

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("TCP connection failed: {}", e)))?;

    Ok(())
}

/// Check that `host:port` accepts connections.
pub async fn check_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    limits: LatencyLimits,
) -> CheckOutcome {
    let start = Instant::now();
    let result = tcp_connect(host, port, timeout).await;
    let latency_ms = elapsed_ms(start);

    match result {
        Ok(()) => limits.grade(latency_ms, Diagnostics::new(), "slow_tcp"),
        Err(e) => CheckOutcome::from_error(latency_ms, Diagnostics::new(), &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Status;
    use tokio::net::TcpListener;

    const LIMITS: LatencyLimits = LatencyLimits {
        warn_ms: 1500,
        very_slow_ms: 4000,
    };

    #[tokio::test]
    async fn test_tcp_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = check_tcp("127.0.0.1", port, Duration::from_secs(2), LIMITS).await;
        assert_eq!(outcome.status, Status::Ok);
        assert!(!outcome.hard_down);
    }

    #[tokio::test]
    async fn test_tcp_closed_port_is_hard_failure() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let outcome = check_tcp("127.0.0.1", port, Duration::from_secs(2), LIMITS).await;
        assert_eq!(outcome.status, Status::Crit);
        assert!(outcome.hard_down);
        assert!(outcome.meta["error"]
            .as_str()
            .unwrap()
            .contains("TCP connection failed"));
    }
}
