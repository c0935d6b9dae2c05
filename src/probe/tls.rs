//! TLS certificate expiry check.
//!
//! Performs a verified handshake on a blocking socket, then reads the
//! leaf certificate's `notAfter`.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use serde_json::Value;

use super::{elapsed_ms, grade_cert_expiry, CheckOutcome, Diagnostics, ProbeError, Status};

const SECONDS_PER_DAY: i64 = 86_400;

/// What the check learned from the leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub not_after: DateTime<Utc>,
    pub subject: String,
}

impl CertInfo {
    /// Whole days until expiry, rounded down (negative once expired).
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now)
            .num_seconds()
            .div_euclid(SECONDS_PER_DAY)
    }
}

/// Check the certificate served on `host:port`.
///
/// Connect or handshake failures (including an expired or untrusted chain)
/// are hard failures. A valid certificate is graded by days to expiry.
pub async fn check_ssl_cert(host: &str, port: u16, timeout: Duration) -> CheckOutcome {
    let host_owned = host.to_string();

    let start = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        fetch_peer_certificate(&host_owned, port, timeout).and_then(|der| parse_certificate(&der))
    })
    .await
    .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))
    .and_then(|r| r);
    let latency_ms = elapsed_ms(start);

    match result {
        Ok(info) => grade_certificate(&info, Utc::now(), latency_ms),
        Err(e) => CheckOutcome::from_error(latency_ms, Diagnostics::new(), &e),
    }
}

/// Grade a parsed certificate against the expiry bands.
///
/// A nearly-expired certificate is CRIT but not a hard failure: the
/// endpoint answered, so the streak store does not count it as down.
pub fn grade_certificate(info: &CertInfo, now: DateTime<Utc>, latency_ms: u64) -> CheckOutcome {
    let days_left = info.days_left(now);

    let mut meta = Diagnostics::new();
    meta.insert("not_after".into(), Value::String(info.not_after.to_rfc3339()));
    meta.insert("days_left".into(), Value::from(days_left));
    meta.insert("subject".into(), Value::String(info.subject.clone()));

    match grade_cert_expiry(days_left) {
        Status::Ok => CheckOutcome::ok(latency_ms, meta),
        Status::Warn => CheckOutcome::degraded(latency_ms, meta, "cert_expiring"),
        Status::Crit => {
            meta.insert("reason".into(), Value::String("cert_expiring_critical".into()));
            CheckOutcome {
                status: Status::Crit,
                latency_ms,
                hard_down: false,
                meta,
            }
        }
    }
}

fn tls_config() -> Result<Arc<ClientConfig>, ProbeError> {
    static CONFIG: OnceLock<Result<Arc<ClientConfig>, String>> = OnceLock::new();

    CONFIG
        .get_or_init(|| {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map(|builder| {
                    Arc::new(
                        builder
                            .with_root_certificates(roots)
                            .with_no_client_auth(),
                    )
                })
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(ProbeError::Tls)
}

fn io_error(e: std::io::Error, timeout: Duration, what: &str) -> ProbeError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            ProbeError::Timeout(timeout)
        }
        _ => ProbeError::Tls(format!("{}: {}", what, e)),
    }
}

/// Connect to the first reachable address of `host:port`.
fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProbeError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(sock) => return Ok(sock),
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) if e.kind() == std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
        Some(e) => ProbeError::Network(format!("TCP connection failed: {}", e)),
        None => ProbeError::Network(format!("No addresses found for {}", host)),
    })
}

/// Complete a verified handshake and return the leaf certificate (DER).
fn fetch_peer_certificate(host: &str, port: u16, timeout: Duration) -> Result<Vec<u8>, ProbeError> {
    let config = tls_config()?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::Config(format!("invalid server name {}: {}", host, e)))?;

    let mut sock = connect(host, port, timeout)?;
    sock.set_read_timeout(Some(timeout))
        .map_err(|e| io_error(e, timeout, "failed to set timeout"))?;
    sock.set_write_timeout(Some(timeout))
        .map_err(|e| io_error(e, timeout, "failed to set timeout"))?;

    let mut conn = ClientConnection::new(config, server_name)
        .map_err(|e| ProbeError::Tls(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    while conn.is_handshaking() {
        if Instant::now() >= deadline {
            return Err(ProbeError::Timeout(timeout));
        }
        conn.complete_io(&mut sock)
            .map_err(|e| io_error(e, timeout, "handshake failed"))?;
    }

    conn.peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| cert.as_ref().to_vec())
        .ok_or_else(|| ProbeError::Tls("server sent no certificate".to_string()))
}

fn parse_certificate(der: &[u8]) -> Result<CertInfo, ProbeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ProbeError::Tls(format!("unparseable certificate: {}", e)))?;

    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| ProbeError::Tls("certificate notAfter out of range".to_string()))?;

    Ok(CertInfo {
        not_after,
        subject: cert.subject().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::io::Write;
    use std::net::TcpListener;

    fn cert_expiring_in(now: DateTime<Utc>, days: i64) -> CertInfo {
        CertInfo {
            not_after: now + ChronoDuration::days(days) + ChronoDuration::hours(1),
            subject: "CN=example.com".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_days_left_rounds_down() {
        let info = CertInfo {
            not_after: now() + ChronoDuration::hours(47),
            subject: String::new(),
        };
        assert_eq!(info.days_left(now()), 1);

        let expired = CertInfo {
            not_after: now() - ChronoDuration::hours(1),
            subject: String::new(),
        };
        assert_eq!(expired.days_left(now()), -1);
    }

    #[test]
    fn test_cert_45_days_is_ok() {
        let outcome = grade_certificate(&cert_expiring_in(now(), 45), now(), 30);
        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.meta["days_left"], 45);
    }

    #[test]
    fn test_cert_10_days_is_warn() {
        let outcome = grade_certificate(&cert_expiring_in(now(), 10), now(), 30);
        assert_eq!(outcome.status, Status::Warn);
        assert_eq!(outcome.meta["reason"], "cert_expiring");
    }

    #[test]
    fn test_cert_3_days_is_crit_without_hard_down() {
        let outcome = grade_certificate(&cert_expiring_in(now(), 3), now(), 30);
        assert_eq!(outcome.status, Status::Crit);
        assert!(!outcome.hard_down);
        assert!(!outcome.meta.contains_key("hard_down"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_hard_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let outcome = check_ssl_cert("127.0.0.1", port, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, Status::Crit);
        assert!(outcome.hard_down);
    }

    #[tokio::test]
    async fn test_non_tls_server_is_hard_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut sock, _)) = listener.accept() {
                let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n");
            }
        });

        let outcome = check_ssl_cert("localhost", port, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, Status::Crit);
        assert!(outcome.hard_down);
        assert!(outcome.meta.contains_key("error"));
    }
}
