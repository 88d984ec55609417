//! SOCKS5 proxy settings for IMAP endpoints.
//!
//! ```
//! use email_mirror::Socks5Proxy;
//!
//! let direct = Socks5Proxy::new("proxy.example.com", 1080);
//! let authed = Socks5Proxy::with_auth("proxy.example.com", 1080, "mirror", "hunter2");
//! assert!(!direct.requires_auth());
//! assert!(!authed.to_string().contains("hunter2"));
//! ```

use secrecy::{ExposeSecret, SecretString};

/// SOCKS5 proxy an endpoint connects through.
#[derive(Debug, Clone)]
pub struct Socks5Proxy {
    /// Proxy hostname or IP address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Optional username/password authentication.
    pub auth: Option<ProxyAuth>,
}

/// Username/password for a SOCKS5 proxy.
#[derive(Clone)]
pub struct ProxyAuth {
    /// Username.
    pub username: String,
    password: SecretString,
}

impl ProxyAuth {
    /// Creates credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Returns the password for the SOCKS handshake.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl std::fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Socks5Proxy {
    /// Proxy without authentication.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
        }
    }

    /// Proxy with username/password authentication.
    #[must_use]
    pub fn with_auth(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            auth: Some(ProxyAuth::new(username, password)),
        }
    }

    /// Returns `true` if the proxy requires authentication.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        self.auth.is_some()
    }
}

impl std::fmt::Display for Socks5Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.auth {
            Some(auth) => write!(
                f,
                "socks5://{}:***@{}:{}",
                auth.username, self.host, self.port
            ),
            None => write!(f, "socks5://{}:{}", self.host, self.port),
        }
    }
}
