//! Client configuration.
//!
//! A [`Config`] is the structured form of a connection's parameters. It can
//! be built with the consuming setters or parsed from the server's native
//! `key=value` connection string syntax:
//!
//! ```text
//! host=localhost port=5432 dbname=app user=alice password='s3cret pass'
//! ```
//!
//! Values may be single-quoted; inside a value a backslash escapes the next
//! character. [`Config::to_connection_string`] produces the same syntax, so
//! a config survives a round-trip through text.

use std::fmt;
use std::time::Duration;

use fenrir_codec::SessionParams;
use tokio::runtime::Handle;

use crate::error::{Error, Result};

/// Default server port.
pub const DEFAULT_PORT: u16 = 5432;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default `application_name` reported to the server.
pub const DEFAULT_APPLICATION_NAME: &str = "fenrir";

/// Default client encoding.
pub const DEFAULT_CLIENT_ENCODING: &str = "UTF8";

/// Connection configuration.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future releases without breaking semver. Use [`Config::default()`]
/// or [`Config::from_connection_string()`] to construct instances.
#[derive(Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 5432).
    pub port: u16,

    /// Database name; the server defaults it to the user name.
    pub database: Option<String>,

    /// Role to log in as; defaults to the operating system user.
    pub user: Option<String>,

    /// Password, sent only if the server asks for one.
    pub password: Option<String>,

    /// Bound on TCP connect plus startup. Zero waits indefinitely.
    pub connect_timeout: Duration,

    /// Client identifier shown in `pg_stat_activity`.
    pub application_name: String,

    /// Character encoding the server should use for this session.
    pub client_encoding: String,

    /// Extra server options sent at startup (`-c key=value ...`).
    pub options: Option<String>,

    /// Runtime used by async operations. Without one, every `async_*`
    /// method fails with [`Error::NotConfigured`].
    pub runtime: Option<Handle>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: None,
            user: None,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            client_encoding: DEFAULT_CLIENT_ENCODING.to_string(),
            options: None,
            runtime: None,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value` connection string.
    ///
    /// Recognized keys: `host` (or `hostaddr`), `port`, `dbname`, `user`,
    /// `password`, `connect_timeout` (seconds), `application_name`,
    /// `client_encoding`, `sslmode`, and `options`. Unknown keys are
    /// ignored. Since TLS is not provided, an `sslmode` that requires it is
    /// rejected rather than silently downgraded.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in parse_pairs(conn_str)? {
            match key.as_str() {
                "host" | "hostaddr" => config.host = value,
                "port" => {
                    config.port = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid port: {value}")))?;
                }
                "dbname" => config.database = Some(value),
                "user" => config.user = Some(value),
                "password" => config.password = Some(value),
                "connect_timeout" => {
                    let secs: i64 = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid connect_timeout: {value}")))?;
                    // Zero or negative waits forever; one second is raised to two.
                    config.connect_timeout = match secs {
                        i64::MIN..=0 => Duration::ZERO,
                        1 => Duration::from_secs(2),
                        n => Duration::from_secs(n.unsigned_abs()),
                    };
                }
                "application_name" => config.application_name = value,
                "client_encoding" => config.client_encoding = value,
                "options" => config.options = Some(value),
                "sslmode" => match value.as_str() {
                    "disable" | "allow" | "prefer" => {}
                    "require" | "verify-ca" | "verify-full" => {
                        return Err(Error::Config(format!(
                            "sslmode={value} requires TLS, which this client does not provide"
                        )));
                    }
                    other => return Err(Error::Config(format!("invalid sslmode: {other}"))),
                },
                _ => {
                    // Ignore unknown options for forward compatibility
                    tracing::debug!(
                        key = key.as_str(),
                        "ignoring unknown connection string option"
                    );
                }
            }
        }

        Ok(config)
    }

    /// Serialize to a `key=value` connection string.
    ///
    /// The password is included verbatim; use the `Display` impl for
    /// anything that may be logged.
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        self.render(false)
    }

    fn render(&self, mask_password: bool) -> String {
        let mut parts = vec![
            format!("host={}", quote(&self.host)),
            format!("port={}", self.port),
        ];
        if let Some(database) = &self.database {
            parts.push(format!("dbname={}", quote(database)));
        }
        if let Some(user) = &self.user {
            parts.push(format!("user={}", quote(user)));
        }
        if let Some(password) = &self.password {
            if mask_password {
                parts.push("password=********".to_string());
            } else {
                parts.push(format!("password={}", quote(password)));
            }
        }
        parts.push(format!("connect_timeout={}", self.connect_timeout.as_secs()));
        parts.push(format!("application_name={}", quote(&self.application_name)));
        parts.push(format!("client_encoding={}", quote(&self.client_encoding)));
        if let Some(options) = &self.options {
            parts.push(format!("options={}", quote(options)));
        }
        parts.join(" ")
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be greater than 0".into()));
        }
        if self.client_encoding.is_empty() {
            return Err(Error::Config("client_encoding must not be empty".into()));
        }
        if !is_utf8_encoding(&self.client_encoding) {
            return Err(Error::Config(format!(
                "client_encoding {} is not supported, results are decoded as UTF8",
                self.client_encoding
            )));
        }
        Ok(())
    }

    /// The user name that will be sent at startup.
    #[must_use]
    pub fn effective_user(&self) -> String {
        self.user.clone().unwrap_or_else(default_user)
    }

    /// Parameters for the session layer.
    #[must_use]
    pub fn to_session_params(&self) -> SessionParams {
        SessionParams {
            host: self.host.clone(),
            port: self.port,
            user: self.effective_user(),
            database: self.database.clone(),
            password: self.password.clone(),
            connect_timeout: self.connect_timeout,
            application_name: Some(self.application_name.clone()).filter(|s| !s.is_empty()),
            client_encoding: Some(self.client_encoding.clone()),
            options: self.options.clone(),
        }
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the user name.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the client encoding.
    #[must_use]
    pub fn client_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.client_encoding = encoding.into();
        self
    }

    /// Set extra server options.
    #[must_use]
    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Attach a runtime, enabling async operations.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("connect_timeout", &self.connect_timeout)
            .field("application_name", &self.application_name)
            .field("client_encoding", &self.client_encoding)
            .field("options", &self.options)
            .field("async", &self.runtime.is_some())
            .finish()
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "postgres".to_string())
}

// The server accepts any spelling of the name, ignoring case and separators.
fn is_utf8_encoding(name: &str) -> bool {
    let normalized: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    matches!(normalized.as_str(), "UTF8" | "UNICODE")
}

// Quote a value when it would not survive unquoted.
fn quote(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

fn parse_pairs(conn_str: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = conn_str.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(Error::Config(format!(
                "missing \"=\" after \"{key}\" in connection string"
            )));
        }
        if key.is_empty() {
            return Err(Error::Config("missing key before \"=\" in connection string".into()));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => break,
                    },
                    Some(c) => value.push(c),
                    None => {
                        return Err(Error::Config(
                            "unterminated quoted string in connection string".into(),
                        ));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.application_name, "fenrir");
        assert_eq!(config.client_encoding, "UTF8");
        assert!(config.runtime.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_string_parsing() {
        let config = Config::from_connection_string(
            "host=db.internal port=6432 dbname=app user=alice password=secret connect_timeout=5",
        )
        .unwrap();

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6432);
        assert_eq!(config.database.as_deref(), Some("app"));
        assert_eq!(config.user.as_deref(), Some("alice"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_connection_string_quoting_and_escapes() {
        let config = Config::from_connection_string(
            r"password='it\'s a secret' application_name = 'my app' options=-c\ search_path=x",
        )
        .unwrap();

        assert_eq!(config.password.as_deref(), Some("it's a secret"));
        assert_eq!(config.application_name, "my app");
        assert_eq!(config.options.as_deref(), Some("-c search_path=x"));
    }

    #[test]
    fn test_connection_string_empty_quoted_value() {
        let config = Config::from_connection_string("password='' host=h").unwrap();
        assert_eq!(config.password.as_deref(), Some(""));
        assert_eq!(config.host, "h");
    }

    #[test]
    fn test_connect_timeout_edge_values() {
        let zero = Config::from_connection_string("connect_timeout=0").unwrap();
        assert_eq!(zero.connect_timeout, Duration::ZERO);
        let one = Config::from_connection_string("connect_timeout=1").unwrap();
        assert_eq!(one.connect_timeout, Duration::from_secs(2));
        assert!(Config::from_connection_string("connect_timeout=soon").is_err());
    }

    #[test]
    fn test_connection_string_errors() {
        assert!(Config::from_connection_string("host").is_err());
        assert!(Config::from_connection_string("=value").is_err());
        assert!(Config::from_connection_string("password='open").is_err());
        assert!(Config::from_connection_string("port=99999").is_err());
    }

    #[test]
    fn test_sslmode_requiring_tls_rejected() {
        assert!(Config::from_connection_string("sslmode=disable").is_ok());
        assert!(Config::from_connection_string("sslmode=prefer").is_ok());
        assert!(matches!(
            Config::from_connection_string("sslmode=require"),
            Err(Error::Config(_))
        ));
        assert!(Config::from_connection_string("sslmode=sometimes").is_err());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = Config::from_connection_string("host=h target_session_attrs=any").unwrap();
        assert_eq!(config.host, "h");
    }

    #[test]
    fn test_to_connection_string_round_trip() {
        let config = Config::new()
            .host("db")
            .port(5433)
            .database("app")
            .user("bob")
            .password("p@ss 'word'")
            .application_name("");

        let text = config.to_connection_string();
        assert!(text.contains(r"password='p@ss \'word\''"));
        assert!(text.contains("application_name=''"));

        let parsed = Config::from_connection_string(&text).unwrap();
        assert_eq!(parsed.host, "db");
        assert_eq!(parsed.port, 5433);
        assert_eq!(parsed.password.as_deref(), Some("p@ss 'word'"));
        assert_eq!(parsed.application_name, "");
    }

    #[test]
    fn test_display_masks_password() {
        let config = Config::new().user("bob").password("hunter2");
        let shown = config.to_string();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("password=********"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_session_params() {
        let config = Config::new().user("carol").database("db").application_name("");
        let params = config.to_session_params();
        assert_eq!(params.user, "carol");
        assert_eq!(params.database.as_deref(), Some("db"));
        assert_eq!(params.application_name, None);
        assert_eq!(params.client_encoding.as_deref(), Some("UTF8"));
    }

    #[test]
    fn test_validate() {
        assert!(Config::new().host("").validate().is_err());
        assert!(Config::new().port(0).validate().is_err());
    }

    #[test]
    fn test_validate_client_encoding() {
        for name in ["UTF8", "utf8", "UTF-8", "utf_8", "Unicode"] {
            assert!(Config::new().client_encoding(name).validate().is_ok(), "{name}");
        }
        for name in ["LATIN1", "SQL_ASCII", "WIN1252", ""] {
            assert!(
                matches!(
                    Config::new().client_encoding(name).validate(),
                    Err(Error::Config(_))
                ),
                "{name}"
            );
        }
    }
}
