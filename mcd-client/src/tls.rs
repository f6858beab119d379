//! Builders for the rustls client configuration used on TLS ports.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};

use crate::error::{ClientError, ClientResult};

/// Trusts exactly the given root certificates.
pub fn client_config_from_certs(
    certs: impl IntoIterator<Item = CertificateDer<'static>>,
) -> ClientResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }
    if roots.is_empty() {
        return Err(ClientError::InvalidArgument(
            "no trusted certificates".to_string(),
        ));
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Trusts every certificate in a PEM file.
pub fn client_config_from_pem_file(path: impl AsRef<Path>) -> ClientResult<Arc<ClientConfig>> {
    let path = path.as_ref();
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| ClientError::InvalidArgument(format!("{}: {e}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::InvalidArgument(format!("{}: {e}", path.display())))?;
    client_config_from_certs(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_set_is_rejected() {
        let err = client_config_from_certs(Vec::new()).unwrap_err();
        assert!(err.is_invalid_arguments());
    }

    #[test]
    fn missing_pem_file_is_rejected() {
        let err = client_config_from_pem_file("/nonexistent/mcd-ca.pem").unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn self_signed_root_is_accepted() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = client_config_from_certs(vec![CertificateDer::from(cert.cert)]);
        assert!(config.is_ok());
    }
}
