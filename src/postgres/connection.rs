// ABOUTME: TLS connector setup for pooled PostgreSQL connections
// ABOUTME: Classifies driver failures into operator-friendly hints

use crate::config::{DbConfig, SslMode};
use crate::error::DbError;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;

/// Build the TLS connector matching the configured sslmode
pub fn make_tls(config: &DbConfig) -> Result<MakeTlsConnector, DbError> {
    let verify = config.ssl_mode.verifies_certificates();
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(!verify)
        .danger_accept_invalid_hostnames(config.ssl_mode != SslMode::VerifyFull)
        .build()?;
    Ok(MakeTlsConnector::new(connector))
}

/// Map a driver error message to a short explanation of the likely cause
pub fn connection_hint(error_msg: &str) -> &'static str {
    if error_msg.contains("password authentication failed") {
        "Authentication failed: invalid username or password"
    } else if error_msg.contains("database") && error_msg.contains("does not exist") {
        "Database does not exist: create it first or check the database name"
    } else if error_msg.contains("Connection refused") || error_msg.contains("could not connect")
    {
        "Connection refused: check host/port and that the server is running"
    } else if error_msg.contains("timeout") || error_msg.contains("timed out") {
        "Connection timeout: the server did not respond in time"
    } else if error_msg.contains("SSL") || error_msg.contains("TLS") {
        "TLS/SSL error: verify the sslmode setting"
    } else if error_msg.contains("no pg_hba.conf entry") {
        "Access denied: no pg_hba.conf entry for this host"
    } else {
        "Failed to connect to database"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_hint_classification() {
        assert!(connection_hint("FATAL: password authentication failed for user \"x\"")
            .starts_with("Authentication failed"));
        assert!(connection_hint("FATAL: database \"nope\" does not exist")
            .starts_with("Database does not exist"));
        assert!(connection_hint("Connection refused (os error 111)")
            .starts_with("Connection refused"));
        assert!(connection_hint("no pg_hba.conf entry for host").starts_with("Access denied"));
        assert_eq!(connection_hint("something else"), "Failed to connect to database");
    }

    #[test]
    fn test_make_tls_for_every_mode() {
        for mode in [
            SslMode::Disable,
            SslMode::Prefer,
            SslMode::Require,
            SslMode::VerifyCa,
            SslMode::VerifyFull,
        ] {
            let config = DbConfig {
                ssl_mode: mode,
                ..DbConfig::default()
            };
            assert!(make_tls(&config).is_ok());
        }
    }
}
