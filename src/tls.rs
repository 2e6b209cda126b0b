//! TLS context construction for IST endpoints.

use openssl::error::ErrorStack;
use openssl::ssl::{SslAcceptor, SslConnector, SslFiletype, SslMethod, SslVerifyMode};

use crate::config::TlsOptions;
use crate::error::IstError;

/// Protocol versions below this had a donor-side bug returning a null
/// certificate, so the listener verifies peer certificates only from this
/// version on.
pub(crate) const TLS_VERIFY_MIN_VERSION: u8 = 7;

pub(crate) fn acceptor(opts: &TlsOptions, version: u8) -> Result<SslAcceptor, IstError> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).map_err(tls_err)?;
    builder
        .set_certificate_chain_file(&opts.cert)
        .map_err(tls_err)?;
    builder
        .set_private_key_file(&opts.key, SslFiletype::PEM)
        .map_err(tls_err)?;
    if let Some(ca) = &opts.ca {
        builder.set_ca_file(ca).map_err(tls_err)?;
    }
    if version >= TLS_VERIFY_MIN_VERSION && opts.ca.is_some() {
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    } else {
        builder.set_verify(SslVerifyMode::NONE);
    }
    Ok(builder.build())
}

pub(crate) fn connector(opts: &TlsOptions) -> Result<SslConnector, IstError> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(tls_err)?;
    builder
        .set_certificate_chain_file(&opts.cert)
        .map_err(tls_err)?;
    builder
        .set_private_key_file(&opts.key, SslFiletype::PEM)
        .map_err(tls_err)?;
    match &opts.ca {
        Some(ca) => builder.set_ca_file(ca).map_err(tls_err)?,
        None => builder.set_verify(SslVerifyMode::NONE),
    }
    Ok(builder.build())
}

pub(crate) fn tls_err(err: ErrorStack) -> IstError {
    IstError::Tls(err.to_string())
}
