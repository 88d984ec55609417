//! TLS transport to an IMAP endpoint, direct or through SOCKS5.

use super::endpoint::ImapEndpoint;
use crate::error::{Error, Result};
use crate::proxy::Socks5Proxy;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};
use webpki_roots::TLS_SERVER_ROOTS;

pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Opens a TLS stream to `endpoint`, bounded by `limit` end to end.
#[instrument(
    name = "connection::open",
    skip_all,
    fields(
        target_addr = %endpoint.server_address(),
        proxy_enabled = endpoint.proxy.is_some()
    )
)]
pub(crate) async fn open_tls(
    endpoint: &ImapEndpoint,
    connector: &TlsConnector,
    limit: Duration,
) -> Result<TlsStream> {
    let target = endpoint.server_address();
    tokio::time::timeout(limit, handshake(endpoint, connector, &target))
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: target.clone(),
            timeout: limit,
        })?
}

async fn handshake(
    endpoint: &ImapEndpoint,
    connector: &TlsConnector,
    target: &str,
) -> Result<TlsStream> {
    let server_name = server_name(&endpoint.host)?;
    let tcp = match &endpoint.proxy {
        Some(proxy) => via_socks5(target, proxy).await?,
        None => TcpStream::connect(target)
            .await
            .map_err(|source| Error::TcpConnect {
                target: target.to_string(),
                source,
            })?,
    };

    debug!("Performing TLS handshake");
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|source| Error::TlsConnect {
            target: target.to_string(),
            source,
        })
}

/// TLS client configuration trusting the webpki root set.
pub(crate) fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

fn server_name(host: &str) -> Result<rustls::ServerName> {
    rustls::ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

#[instrument(
    name = "connection::socks5",
    skip_all,
    fields(proxy_host = %proxy.host, has_auth = proxy.requires_auth())
)]
async fn via_socks5(target: &str, proxy: &Socks5Proxy) -> Result<TcpStream> {
    debug!(proxy = %proxy, "Connecting via SOCKS5 proxy");
    let proxy_addr = (proxy.host.as_str(), proxy.port);

    let stream = match &proxy.auth {
        Some(auth) => {
            Socks5Stream::connect_with_password(
                proxy_addr,
                target,
                &auth.username,
                auth.password(),
            )
            .await
        }
        None => Socks5Stream::connect(proxy_addr, target).await,
    };

    stream
        .map(Socks5Stream::into_inner)
        .map_err(|source| Error::Socks5Connect {
            proxy_host: proxy.host.clone(),
            target: target.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_validation() {
        assert!(server_name("imap.example.com").is_ok());
        assert!(matches!(
            server_name(""),
            Err(Error::InvalidDnsName { .. })
        ));
    }
}
