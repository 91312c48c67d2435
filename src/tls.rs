//! TLS configuration shared by the WebSocket and HTTP clients.
//!
//! Builds a [`rustls::ClientConfig`] trusting the Mozilla root set from
//! `webpki-roots`, optionally extended with a PEM bundle for deployments
//! behind an intercepting proxy.

use std::path::Path;

use rustls::ClientConfig;

use crate::Result;

/// Builds a [`ClientConfig`] with the bundled roots plus any certificates
/// found in `extra_ca_pem`.
///
/// # Errors
///
/// Returns [`KlaxonError::Tls`](crate::KlaxonError::Tls) if the extra
/// bundle cannot be read or parsed.
pub fn build_tls_config(extra_ca_pem: Option<&Path>) -> Result<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = extra_ca_pem {
        let pem = std::fs::read(path).map_err(|e| {
            crate::KlaxonError::Tls(format!("failed to read {}: {e}", path.display()))
        })?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| crate::KlaxonError::Tls(format!("failed to parse CA PEM: {e}")))?;
        if certs.is_empty() {
            return Err(crate::KlaxonError::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        root_store.add_parsable_certificates(certs);
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

/// Builds a `reqwest` client using the given TLS configuration.
///
/// # Errors
///
/// Returns [`KlaxonError::Tls`](crate::KlaxonError::Tls) if the client
/// cannot be constructed.
pub fn http_client(tls_config: ClientConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .build()
        .map_err(|e| crate::KlaxonError::Tls(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_bundled_roots() {
        assert!(build_tls_config(None).is_ok());
    }

    #[test]
    fn rejects_missing_bundle() {
        let err = build_tls_config(Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn rejects_bundle_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "no certificates here\n").unwrap();
        let err = build_tls_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }
}
