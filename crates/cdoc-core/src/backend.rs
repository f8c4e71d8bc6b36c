//! Pluggable key-access and key-server capabilities.
//!
//! The container pipeline never touches private keys or network sockets
//! directly; everything goes through these traits. The `label` argument is
//! the recipient label of the lock being processed, letting an
//! implementation route to the right stored key (PKCS#11 slot, prompt,
//! in-memory map). Default method bodies return `NotImplemented`, except
//! [`CryptoBackend::extract_hkdf`] which is derived from
//! [`CryptoBackend::get_secret`].

use std::collections::HashMap;

use rsa::RsaPrivateKey;
use zeroize::Zeroizing;

use crate::crypto;
use crate::derivation;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

pub trait CryptoBackend {
    /// Decrypt an RSA-wrapped FMK (CDoc1, PKCS#1 v1.5) or KEK (CDoc2,
    /// OAEP-SHA-256).
    fn decrypt_rsa(&self, _ct: &[u8], _oaep: bool, _label: &str) -> Result<Zeroizing<Vec<u8>>> {
        Err(Error::NotImplemented("decrypt_rsa"))
    }

    /// ECDH against `peer_key` followed by ConcatKDF, in one call so the
    /// shared secret never leaves the backend.
    fn derive_concat_kdf(
        &self,
        _peer_key: &[u8],
        _digest_uri: &str,
        _algorithm_id: &[u8],
        _party_u_info: &[u8],
        _party_v_info: &[u8],
        _key_len: usize,
        _label: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        Err(Error::NotImplemented("derive_concat_kdf"))
    }

    /// ECDH against `peer_key` followed by HKDF-Extract with `salt`;
    /// returns the CDoc2 KEK premaster.
    fn derive_hmac_extract(
        &self,
        _peer_key: &[u8],
        _salt: &[u8],
        _label: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        Err(Error::NotImplemented("derive_hmac_extract"))
    }

    /// Symmetric/password KEK. `kdf_iter` of zero means a pre-shared key;
    /// otherwise the secret is a password stretched with PBKDF2 first.
    fn extract_hkdf(
        &self,
        salt: &[u8],
        pw_salt: &[u8],
        kdf_iter: u32,
        label: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let secret = self.get_secret(label)?;
        let key = if kdf_iter > 0 {
            crypto::pbkdf2_hmac_sha256(&secret, pw_salt, kdf_iter, derivation::KEY_LEN)
        } else {
            secret
        };
        derivation::kek_from_secret(&key, salt, label)
    }

    /// The stored password or pre-shared key for `label`.
    fn get_secret(&self, _label: &str) -> Result<Zeroizing<Vec<u8>>> {
        Err(Error::NotImplemented("get_secret"))
    }

    /// Raw signature over `digest`, used for key-server TLS client auth.
    fn sign(&self, _alg: HashAlgorithm, _digest: &[u8], _label: &str) -> Result<Vec<u8>> {
        Err(Error::NotImplemented("sign"))
    }
}

/// Key-server transport. The HTTP implementation lives outside the core;
/// transport failures are retriable by the caller.
pub trait NetworkBackend {
    /// Fetch capsule key material by `(keyserver_id, transaction_id)`.
    fn fetch_key(&self, _keyserver_id: &str, _transaction_id: &str) -> Result<Vec<u8>> {
        Err(Error::NotImplemented("fetch_key"))
    }

    /// Register capsule key material for a recipient; returns the
    /// transaction id recorded in the lock.
    fn send_key(
        &self,
        _keyserver_id: &str,
        _rcpt_key: &[u8],
        _key_material: &[u8],
        _rsa: bool,
    ) -> Result<String> {
        Err(Error::NotImplemented("send_key"))
    }

    fn get_client_tls_certificate(&self) -> Result<Vec<u8>> {
        Err(Error::NotImplemented("get_client_tls_certificate"))
    }

    /// Certificates pinning the server end of the mutual-TLS channel.
    fn get_peer_tls_certificates(&self) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    fn sign_tls(&self, _alg: HashAlgorithm, _digest: &[u8]) -> Result<Vec<u8>> {
        Err(Error::NotImplemented("sign_tls"))
    }
}

/// Software key store holding labelled secrets and private keys in memory.
///
/// Serves the CLI and the test suite; anything hardware-backed implements
/// [`CryptoBackend`] outside the core.
#[derive(Default)]
pub struct SoftKeyBackend {
    secrets: HashMap<String, Zeroizing<Vec<u8>>>,
    rsa_keys: HashMap<String, RsaPrivateKey>,
    ec_keys: HashMap<String, p384::SecretKey>,
}

impl SoftKeyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, label: impl Into<String>, secret: &[u8]) -> Self {
        self.secrets
            .insert(label.into(), Zeroizing::new(secret.to_vec()));
        self
    }

    pub fn with_rsa_key(mut self, label: impl Into<String>, key: RsaPrivateKey) -> Self {
        self.rsa_keys.insert(label.into(), key);
        self
    }

    pub fn with_ec_key(mut self, label: impl Into<String>, key: p384::SecretKey) -> Self {
        self.ec_keys.insert(label.into(), key);
        self
    }

    /// RSA private key from PKCS#8 DER.
    pub fn with_rsa_key_der(self, label: impl Into<String>, der: &[u8]) -> Result<Self> {
        use rsa::pkcs8::DecodePrivateKey;
        let key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|_| Error::invalid("unparseable PKCS#8 RSA key"))?;
        Ok(self.with_rsa_key(label, key))
    }

    /// P-384 private key from its raw scalar bytes.
    pub fn with_ec_key_bytes(self, label: impl Into<String>, scalar: &[u8]) -> Result<Self> {
        let key = p384::SecretKey::from_slice(scalar)
            .map_err(|_| Error::invalid("bad P-384 private key"))?;
        Ok(self.with_ec_key(label, key))
    }

    fn rsa_key(&self, label: &str) -> Result<&RsaPrivateKey> {
        self.rsa_keys
            .get(label)
            .ok_or_else(|| Error::Backend(format!("no RSA key for label {label:?}")))
    }

    fn ec_key(&self, label: &str) -> Result<&p384::SecretKey> {
        self.ec_keys
            .get(label)
            .ok_or_else(|| Error::Backend(format!("no EC key for label {label:?}")))
    }
}

impl CryptoBackend for SoftKeyBackend {
    fn decrypt_rsa(&self, ct: &[u8], oaep: bool, label: &str) -> Result<Zeroizing<Vec<u8>>> {
        crypto::rsa_decrypt(self.rsa_key(label)?, ct, oaep)
    }

    fn derive_concat_kdf(
        &self,
        peer_key: &[u8],
        digest_uri: &str,
        algorithm_id: &[u8],
        party_u_info: &[u8],
        party_v_info: &[u8],
        key_len: usize,
        label: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let shared = crypto::ecdh_p384(self.ec_key(label)?, peer_key)?;
        crypto::concat_kdf(
            &shared,
            digest_uri,
            algorithm_id,
            party_u_info,
            party_v_info,
            key_len,
        )
    }

    fn derive_hmac_extract(
        &self,
        peer_key: &[u8],
        salt: &[u8],
        label: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let shared = crypto::ecdh_p384(self.ec_key(label)?, peer_key)?;
        Ok(crypto::hkdf_extract(salt, &shared))
    }

    fn get_secret(&self, label: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.secrets
            .get(label)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("no secret for label {label:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_extract_hkdf_runs_on_get_secret() {
        let be = SoftKeyBackend::new().with_secret("k", &[0u8; 32]);
        let salt = [1u8; 32];
        let kek = be.extract_hkdf(&salt, &[], 0, "k").unwrap();
        assert_eq!(kek.len(), 32);
        // Password path stretches first, so it must differ.
        let kek_pw = be.extract_hkdf(&salt, &[2u8; 32], 1_000, "k").unwrap();
        assert_ne!(kek, kek_pw);
    }

    #[test]
    fn unknown_labels_error() {
        let be = SoftKeyBackend::new();
        assert!(be.get_secret("missing").is_err());
        assert!(be.decrypt_rsa(&[], true, "missing").is_err());
    }

    struct Nothing;
    impl CryptoBackend for Nothing {}

    #[test]
    fn defaults_are_not_implemented() {
        assert!(matches!(
            Nothing.decrypt_rsa(&[], false, "x"),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(
            Nothing.extract_hkdf(&[], &[], 0, "x"),
            Err(Error::NotImplemented(_))
        ));
    }
}
