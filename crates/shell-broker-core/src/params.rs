//! Validated connect and resize parameters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::BrokerError;

/// Secret passed to the remote host. Never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl From<String> for Credential {
    fn from(secret: String) -> Self {
        Self(secret)
    }
}

/// How the caller authenticates against the remote host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    Password,
}

/// Remote host, port and user. Immutable once a session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Terminal size in character cells. Both dimensions are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    /// # Errors
    /// `InvalidGeometry` if either dimension is zero.
    pub const fn new(cols: u16, rows: u16) -> Result<Self, BrokerError> {
        if cols == 0 || rows == 0 {
            return Err(BrokerError::InvalidGeometry { cols, rows });
        }
        Ok(Self { cols, rows })
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// A validated connect request.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub target: ConnectTarget,
    pub credential: Credential,
    pub auth_method: AuthMethod,
    /// Initial pty size; the configured default when absent.
    pub geometry: Option<Geometry>,
}

impl ConnectParams {
    /// Trim and validate raw connect fields.
    ///
    /// # Errors
    /// `InvalidParams` naming the first offending field.
    pub fn validate(
        host: &str,
        port: Option<i64>,
        username: &str,
        credential: Credential,
        auth_method: AuthMethod,
    ) -> Result<Self, BrokerError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(invalid("Missing required field: host"));
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(invalid("Invalid host format"));
        }

        let port = port.ok_or_else(|| invalid("Missing required field: port"))?;
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| invalid("Port must be between 1 and 65535"))?;

        let username = username.trim();
        if username.is_empty() {
            return Err(invalid("Missing required field: username"));
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid("Invalid username format"));
        }

        Ok(Self {
            target: ConnectTarget {
                host: host.to_string(),
                port,
                username: username.to_string(),
            },
            credential,
            auth_method,
            geometry: None,
        })
    }

    /// Set the initial pty size.
    #[must_use]
    pub const fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

fn invalid(message: &str) -> BrokerError {
    BrokerError::InvalidParams(message.to_string())
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn check(host: &str, port: i64, username: &str) -> Result<ConnectParams, BrokerError> {
        ConnectParams::validate(
            host,
            Some(port),
            username,
            Credential::new("p"),
            AuthMethod::Password,
        )
    }

    #[test]
    fn test_valid_params_are_trimmed() {
        let params = assert_ok!(check("  example.com ", 22, " deploy_user "));
        assert_eq!(params.target.host, "example.com");
        assert_eq!(params.target.port, 22);
        assert_eq!(params.target.username, "deploy_user");
        assert_eq!(params.target.to_string(), "deploy_user@example.com:22");
    }

    #[test]
    fn test_ipv4_host_is_accepted() {
        assert_ok!(check("192.168.1.10", 2222, "u"));
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            check("", 22, "u").unwrap_err(),
            BrokerError::InvalidParams("Missing required field: host".into())
        );
        assert_eq!(
            check("h", 22, "   ").unwrap_err(),
            BrokerError::InvalidParams("Missing required field: username".into())
        );
        assert_eq!(
            ConnectParams::validate("h", None, "u", Credential::default(), AuthMethod::Password)
                .unwrap_err(),
            BrokerError::InvalidParams("Missing required field: port".into())
        );
    }

    #[test]
    fn test_port_range() {
        assert_err!(check("h", 0, "u"));
        assert_err!(check("h", -1, "u"));
        assert_err!(check("h", 65536, "u"));
        assert_ok!(check("h", 65535, "u"));
        assert_ok!(check("h", 1, "u"));
    }

    #[test]
    fn test_rejects_shell_metacharacters() {
        assert_err!(check("host;rm -rf", 22, "u"));
        assert_err!(check("h", 22, "root$(id)"));
    }

    #[test]
    fn test_character_classes() {
        assert_ok!(check("db-1.internal.example", 22, "svc_deploy.v2-a"));
        assert_err!(check("host_name", 22, "u"));
        assert_err!(check("h", 22, "user@h"));
        assert_err!(check("hóst", 22, "u"));
        assert_err!(check("h", 22, "us er"));
    }

    #[test]
    fn test_geometry_must_be_positive() {
        assert_eq!(
            Geometry::new(0, 24).unwrap_err(),
            BrokerError::InvalidGeometry { cols: 0, rows: 24 }
        );
        assert_err!(Geometry::new(80, 0));
        assert_eq!(assert_ok!(Geometry::new(120, 40)).cols, 120);
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("hunter2");
        assert!(!format!("{cred:?}").contains("hunter2"));
        assert_eq!(cred.expose_secret(), "hunter2");
    }
}
