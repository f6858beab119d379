use thiserror::Error;

#[derive(Debug, Error)]
pub enum MockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("ssl listener requested without a server certificate")]
    MissingTlsConfig,

    #[error("port descriptor error: {0}")]
    Descriptor(#[from] mcd_common::DescriptorError),
}
