//! Minimal X.509 introspection: enough to pick the wrap algorithm for a
//! recipient certificate and to match a certificate against a lock.

use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ecc,
}

#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub kind: KeyKind,
    /// Full SubjectPublicKeyInfo DER.
    pub spki_der: Vec<u8>,
    /// SEC1 point for EC keys, empty for RSA.
    pub ec_point: Vec<u8>,
}

pub fn parse(der: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::format(format!("bad certificate: {e}")))?;
    let spki = cert.public_key();
    let spki_der = spki.raw.to_vec();
    match spki
        .parsed()
        .map_err(|e| Error::format(format!("bad subject public key: {e}")))?
    {
        PublicKey::RSA(_) => Ok(CertificateInfo {
            kind: KeyKind::Rsa,
            spki_der,
            ec_point: Vec::new(),
        }),
        PublicKey::EC(point) => Ok(CertificateInfo {
            kind: KeyKind::Ecc,
            spki_der,
            ec_point: point.data().to_vec(),
        }),
        _ => Err(Error::NotSupported(
            "certificate key is neither RSA nor EC".into(),
        )),
    }
}

/// RSA public key of a certificate, for wrapping towards it.
pub fn rsa_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    let info = parse(der)?;
    if info.kind != KeyKind::Rsa {
        return Err(Error::invalid("certificate does not hold an RSA key"));
    }
    RsaPublicKey::from_public_key_der(&info.spki_der)
        .map_err(|_| Error::format("unparseable RSA public key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_rejected() {
        assert!(parse(b"not a certificate").is_err());
    }
}
