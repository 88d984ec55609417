//! Connection settings for one IMAP account.

use crate::error::{Error, Result};
use crate::proxy::Socks5Proxy;
use email_address::EmailAddress;
use secrecy::{ExposeSecret, SecretString};

/// Where and how to log in to one account's IMAP server.
///
/// Create using [`ImapEndpoint::builder()`]. The password is held as a
/// [`SecretString`] and never printed.
#[derive(Clone)]
pub struct ImapEndpoint {
    email: EmailAddress,
    password: SecretString,
    /// IMAP server hostname.
    pub host: String,
    /// IMAP server port (default: 993 for IMAPS).
    pub port: u16,
    /// Optional SOCKS5 proxy.
    pub proxy: Option<Socks5Proxy>,
}

impl std::fmt::Debug for ImapEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapEndpoint")
            .field("email", &self.email.as_str())
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl ImapEndpoint {
    /// Creates a new endpoint builder.
    ///
    /// # Example
    ///
    /// ```
    /// use email_mirror::ImapEndpoint;
    ///
    /// let endpoint = ImapEndpoint::builder()
    ///     .email("user@example.com")
    ///     .password("app-password")
    ///     .host("imap.example.com")
    ///     .build()
    ///     .expect("valid endpoint");
    /// assert_eq!(endpoint.server_address(), "imap.example.com:993");
    /// ```
    #[must_use]
    pub fn builder() -> ImapEndpointBuilder {
        ImapEndpointBuilder::default()
    }

    /// Returns the login address.
    #[must_use]
    pub fn email(&self) -> &str {
        self.email.as_str()
    }

    /// Returns the password for authentication.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns `"host:port"`.
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn validate_email(email: &str) -> Result<EmailAddress> {
    EmailAddress::parse_with_options(email, email_address::Options::default()).map_err(|_| {
        Error::InvalidEmailFormat {
            email: email.to_string(),
        }
    })
}

/// Builder for [`ImapEndpoint`].
#[derive(Debug, Default)]
pub struct ImapEndpointBuilder {
    email: Option<String>,
    password: Option<SecretString>,
    host: Option<String>,
    port: Option<u16>,
    proxy: Option<Socks5Proxy>,
}

impl ImapEndpointBuilder {
    /// Sets the login address (required).
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the password (required).
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Sets the server hostname (required).
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Routes the connection through a SOCKS5 proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: Socks5Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Builds the endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing, the address is
    /// malformed or the port is zero.
    pub fn build(self) -> Result<ImapEndpoint> {
        let email_raw = self.email.ok_or_else(|| Error::InvalidConfig {
            message: "email is required".into(),
        })?;
        let email = validate_email(&email_raw)?;

        let password = self.password.ok_or_else(|| Error::InvalidConfig {
            message: "password is required".into(),
        })?;
        if password.expose_secret().is_empty() {
            return Err(Error::InvalidConfig {
                message: "password cannot be empty".into(),
            });
        }

        let host = self
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                message: "host is required".into(),
            })?;

        let port = self.port.unwrap_or(993);
        if port == 0 {
            return Err(Error::InvalidConfig {
                message: "port cannot be 0".into(),
            });
        }

        Ok(ImapEndpoint {
            email,
            password,
            host,
            port,
            proxy: self.proxy,
        })
    }
}
