//! Connection identity, credentials, and per-connection preferences.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 8964;
const MAX_SERVICE_NAME_LEN: usize = 10;
const MAX_USER_NAME_LEN: usize = 30;
const FORBIDDEN_CHARS: &[char] = &['\n', '\t', ',', ';', ':'];

/// Server endpoint plus account. Compared field by field.
///
/// Deserialization goes through [`Identity::new`], so every value is
/// validated and carries a concrete port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "IdentityFields")]
pub struct Identity {
    host: String,
    port: u16,
    service: String,
    user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
}

impl Identity {
    /// Validates and builds an identity. Port 0 selects [`DEFAULT_PORT`].
    pub fn new(
        host: impl Into<String>,
        port: u16,
        service: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<Self> {
        let host = host.into();
        let service = service.into();
        let user = user.into();
        if host.is_empty() {
            return Err(Error::Validation("host must not be empty".to_string()));
        }
        validate_name("service name", &service, MAX_SERVICE_NAME_LEN)?;
        validate_name("user name", &user, MAX_USER_NAME_LEN)?;
        Ok(Self {
            host,
            port: if port == 0 { DEFAULT_PORT } else { port },
            service,
            user,
            public_key: None,
        })
    }

    /// Attach the server's public key (PEM or base64, opaque to this crate).
    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }
}

#[derive(Deserialize)]
struct IdentityFields {
    host: String,
    #[serde(default)]
    port: u16,
    service: String,
    user: String,
    #[serde(default)]
    public_key: Option<String>,
}

impl TryFrom<IdentityFields> for Identity {
    type Error = Error;

    fn try_from(raw: IdentityFields) -> Result<Self> {
        let identity = Identity::new(raw.host, raw.port, raw.service, raw.user)?;
        Ok(match raw.public_key {
            Some(key) => identity.with_public_key(key),
            None => identity,
        })
    }
}

/// `host:port:service:user`, for logs only.
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.host, self.port, self.service, self.user)
    }
}

fn validate_name(label: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{label} must not be empty")));
    }
    if value.chars().count() > max_len {
        return Err(Error::Validation(format!(
            "{label} is too long (max {max_len} characters)"
        )));
    }
    if let Some(c) = value.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(Error::Validation(format!(
            "{label} should not contain {c:?}"
        )));
    }
    Ok(())
}

/// Credential paired with an [`Identity`]. Never serialized, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Per-connection delivery preferences negotiated with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPreferences {
    /// The user wants push notifications while offline.
    pub subscribe: bool,
    /// When false the server treats this client as offline.
    pub visible: bool,
    /// `<= 0` means never compress.
    pub compress_threshold: i32,
    /// `< 0` means always send the full message.
    pub digest_threshold: i32,
    /// Header fields forwarded alongside a digest.
    pub digest_fields: Vec<String>,
}

impl Default for ConnectionPreferences {
    fn default() -> Self {
        Self {
            subscribe: true,
            visible: true,
            compress_threshold: 1024,
            digest_threshold: -1,
            digest_fields: Vec::new(),
        }
    }
}

impl ConnectionPreferences {
    /// Whether moving from `self` to `other` requires a `config` call.
    ///
    /// Two negative thresholds are equivalent. Digest fields compare in order.
    pub fn needs_reconfig(&self, other: &ConnectionPreferences) -> bool {
        threshold_differs(self.compress_threshold, other.compress_threshold)
            || threshold_differs(self.digest_threshold, other.digest_threshold)
            || self.digest_fields != other.digest_fields
    }

    /// Desired push subscription state: invisible clients are unsubscribed.
    pub fn wants_push(&self) -> bool {
        self.subscribe && self.visible
    }
}

fn threshold_differs(a: i32, b: i32) -> bool {
    !(a < 0 && b < 0) && a != b
}

/// Non-secret half of a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub identity: Identity,
    #[serde(default)]
    pub prefs: ConnectionPreferences,
}

impl ConnectionInfo {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            prefs: ConnectionPreferences::default(),
        }
    }

    pub fn with_prefs(mut self, prefs: ConnectionPreferences) -> Self {
        self.prefs = prefs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("srv", 8964, "chat", "alice").unwrap()
    }

    #[test]
    fn rejects_long_or_delimited_names() {
        assert!(matches!(
            Identity::new("srv", 1, "a-very-long-service", "u"),
            Err(Error::Validation(_))
        ));
        assert!(Identity::new("srv", 1, "chat", "x".repeat(31)).is_err());
        assert!(Identity::new("srv", 1, "chat", "x".repeat(30)).is_ok());
        for bad in ["a:b", "a,b", "a;b", "a\tb", "a\nb"] {
            assert!(Identity::new("srv", 1, "chat", bad).is_err(), "{bad:?}");
            assert!(Identity::new("srv", 1, bad, "alice").is_err(), "{bad:?}");
        }
        assert!(Identity::new("", 1, "chat", "alice").is_err());
    }

    #[test]
    fn zero_port_means_default() {
        let id = Identity::new("srv", 0, "chat", "alice").unwrap();
        assert_eq!(id.port(), DEFAULT_PORT);
    }

    #[test]
    fn equality_is_exact_not_suffix() {
        let a = alice();
        let b = Identity::new("srv", 8964, "chat", "xalice").unwrap();
        let c = Identity::new("my-srv", 8964, "chat", "alice").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, alice());
        assert_ne!(a, alice().with_public_key("key"));
    }

    #[test]
    fn deserialized_identity_is_normalized() {
        let id: Identity = serde_json::from_str(
            r#"{"host": "srv", "port": 0, "service": "chat", "user": "alice"}"#,
        )
        .unwrap();
        assert_eq!(id.port(), DEFAULT_PORT);
        assert_eq!(id, alice());

        let keyed: Identity = serde_json::from_str(
            r#"{"host": "srv", "service": "chat", "user": "alice", "public_key": "pk"}"#,
        )
        .unwrap();
        assert_eq!(keyed.public_key(), Some("pk"));
        assert_eq!(keyed.port(), DEFAULT_PORT);
    }

    #[test]
    fn deserialization_rejects_invalid_names() {
        let err = serde_json::from_str::<Identity>(
            r#"{"host": "srv", "port": 1, "service": "chat", "user": "a:b"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("user name"));
    }

    #[test]
    fn display_is_colon_separated() {
        assert_eq!(alice().to_string(), "srv:8964:chat:alice");
    }

    #[test]
    fn token_debug_is_redacted() {
        let t = Token::new("hunter2");
        assert_eq!(format!("{t:?}"), "Token(***)");
        assert_eq!(t.expose(), "hunter2");
    }

    #[test]
    fn reconfig_treats_negative_thresholds_as_equal() {
        let a = ConnectionPreferences {
            digest_threshold: -1,
            ..Default::default()
        };
        let b = ConnectionPreferences {
            digest_threshold: -50,
            ..Default::default()
        };
        assert!(!a.needs_reconfig(&b));

        let c = ConnectionPreferences {
            digest_threshold: 4096,
            ..Default::default()
        };
        assert!(a.needs_reconfig(&c));
    }

    #[test]
    fn reconfig_ignores_visibility() {
        let a = ConnectionPreferences::default();
        let b = ConnectionPreferences {
            visible: false,
            subscribe: false,
            ..Default::default()
        };
        assert!(!a.needs_reconfig(&b));
    }

    #[test]
    fn reconfig_digest_fields_are_order_sensitive() {
        let a = ConnectionPreferences {
            digest_fields: vec!["title".into(), "sender".into()],
            ..Default::default()
        };
        let b = ConnectionPreferences {
            digest_fields: vec!["sender".into(), "title".into()],
            ..Default::default()
        };
        assert!(a.needs_reconfig(&b));
        assert!(!a.needs_reconfig(&a.clone()));
    }

    #[test]
    fn invisible_client_does_not_want_push() {
        let prefs = ConnectionPreferences {
            visible: false,
            ..Default::default()
        };
        assert!(!prefs.wants_push());
        assert!(ConnectionPreferences::default().wants_push());
    }

    #[test]
    fn info_deserializes_with_default_prefs() {
        let json = r#"{"identity":{"host":"srv","port":8964,"service":"chat","user":"alice"}}"#;
        let info: ConnectionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.identity, alice());
        assert_eq!(info.prefs, ConnectionPreferences::default());
    }
}
