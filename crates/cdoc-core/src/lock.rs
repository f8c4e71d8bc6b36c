//! Recipient locks.
//!
//! A [`Lock`] is the on-disk recipient descriptor plus the wrapped file
//! master key: the one datum both the reader and the writer consume. The
//! per-form parameters live in the [`LockKind`] variant; construction is
//! total, so a lock cannot exist without its mandatory fields.

use crate::certificate;
use crate::error::{Error, Result};

/// How many PBKDF2 rounds a writer must at least apply.
pub const MIN_KDF_ITER: u32 = 100_000;

#[derive(Debug, Clone)]
pub struct Lock {
    /// UTF-8 recipient label. Producers keep it unique per container;
    /// readers must not rely on that.
    pub label: String,
    pub encrypted_fmk: Vec<u8>,
    pub kind: LockKind,
}

#[derive(Debug, Clone)]
pub enum LockKind {
    /// CDoc1, FMK encrypted directly with RSA PKCS#1 v1.5.
    Cdoc1Rsa {
        certificate: Vec<u8>,
        method: String,
    },
    /// CDoc1, ECDH + ConcatKDF + AES-KeyWrap.
    Cdoc1Ecc {
        certificate: Vec<u8>,
        /// Sender's ephemeral public point (SEC1).
        eph_public_key: Vec<u8>,
        algorithm_id: Vec<u8>,
        party_u_info: Vec<u8>,
        party_v_info: Vec<u8>,
        /// Digest method URI for the ConcatKDF.
        concat_digest: String,
        /// Key wrap method URI (kw-aes128/192/256).
        method: String,
    },
    /// CDoc2, RSA-OAEP transported KEK.
    PublicKeyRsa {
        /// Recipient public key (SubjectPublicKeyInfo DER).
        rcpt_key: Vec<u8>,
        encrypted_kek: Vec<u8>,
    },
    /// CDoc2, ECDH P-384 derived KEK.
    PublicKeyEcc {
        /// Recipient public key (SEC1 point on P-384).
        rcpt_key: Vec<u8>,
        /// Sender's ephemeral public key (SEC1).
        sender_key: Vec<u8>,
    },
    /// CDoc2, key material held by a key server.
    Server {
        rcpt_key: Vec<u8>,
        rsa: bool,
        keyserver_id: String,
        transaction_id: String,
    },
    /// CDoc2, pre-shared 32-byte key.
    Symmetric { salt: Vec<u8> },
    /// CDoc2, password stretched with PBKDF2-HMAC-SHA-256.
    Password {
        salt: Vec<u8>,
        pw_salt: Vec<u8>,
        kdf_iter: u32,
    },
}

impl Lock {
    pub fn is_cdoc1(&self) -> bool {
        matches!(self.kind, LockKind::Cdoc1Rsa { .. } | LockKind::Cdoc1Ecc { .. })
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self.kind, LockKind::Symmetric { .. } | LockKind::Password { .. })
    }

    pub fn is_rsa(&self) -> bool {
        match &self.kind {
            LockKind::Cdoc1Rsa { .. } | LockKind::PublicKeyRsa { .. } => true,
            LockKind::Server { rsa, .. } => *rsa,
            _ => false,
        }
    }

    /// Whether this lock addresses the holder of `cert_der`.
    ///
    /// CDoc1 locks embed the certificate and are compared byte-wise; CDoc2
    /// locks are compared on the public key.
    pub fn matches_certificate(&self, cert_der: &[u8]) -> bool {
        match &self.kind {
            LockKind::Cdoc1Rsa { certificate, .. }
            | LockKind::Cdoc1Ecc { certificate, .. } => certificate == cert_der,
            LockKind::PublicKeyRsa { rcpt_key, .. } => certificate::parse(cert_der)
                .map(|c| c.spki_der == *rcpt_key)
                .unwrap_or(false),
            LockKind::PublicKeyEcc { rcpt_key, .. } => certificate::parse(cert_der)
                .map(|c| c.ec_point == *rcpt_key)
                .unwrap_or(false),
            LockKind::Server { rcpt_key, rsa, .. } => certificate::parse(cert_der)
                .map(|c| {
                    if *rsa {
                        c.spki_der == *rcpt_key
                    } else {
                        c.ec_point == *rcpt_key
                    }
                })
                .unwrap_or(false),
            LockKind::Symmetric { .. } | LockKind::Password { .. } => false,
        }
    }
}

/// Writer-side recipient descriptor; turned into a [`Lock`] when the FMK is
/// wrapped.
#[derive(Debug, Clone)]
pub enum Recipient {
    Certificate {
        label: String,
        cert_der: Vec<u8>,
    },
    /// Raw P-384 public key (SEC1 point).
    EccPublicKey {
        label: String,
        public_key: Vec<u8>,
    },
    /// Raw RSA public key (SubjectPublicKeyInfo DER).
    RsaPublicKey {
        label: String,
        public_key_der: Vec<u8>,
    },
    Server {
        label: String,
        public_key: Vec<u8>,
        rsa: bool,
        keyserver_id: String,
    },
    /// Pre-shared key looked up from the crypto backend by label.
    Symmetric { label: String },
    /// Password looked up from the crypto backend by label.
    Password { label: String, kdf_iter: u32 },
}

impl Recipient {
    pub fn make_certificate(label: impl Into<String>, cert_der: Vec<u8>) -> Self {
        Recipient::Certificate { label: label.into(), cert_der }
    }

    pub fn make_ecc_key(label: impl Into<String>, public_key: Vec<u8>) -> Self {
        Recipient::EccPublicKey { label: label.into(), public_key }
    }

    pub fn make_rsa_key(label: impl Into<String>, public_key_der: Vec<u8>) -> Self {
        Recipient::RsaPublicKey { label: label.into(), public_key_der }
    }

    pub fn make_server(
        label: impl Into<String>,
        public_key: Vec<u8>,
        rsa: bool,
        keyserver_id: impl Into<String>,
    ) -> Self {
        Recipient::Server {
            label: label.into(),
            public_key,
            rsa,
            keyserver_id: keyserver_id.into(),
        }
    }

    pub fn make_symmetric(label: impl Into<String>) -> Self {
        Recipient::Symmetric { label: label.into() }
    }

    pub fn make_password(label: impl Into<String>, kdf_iter: u32) -> Self {
        Recipient::Password { label: label.into(), kdf_iter }
    }

    pub fn label(&self) -> &str {
        match self {
            Recipient::Certificate { label, .. }
            | Recipient::EccPublicKey { label, .. }
            | Recipient::RsaPublicKey { label, .. }
            | Recipient::Server { label, .. }
            | Recipient::Symmetric { label }
            | Recipient::Password { label, .. } => label,
        }
    }

    /// Writer-side validation, run before any key material is produced.
    pub fn validate(&self) -> Result<()> {
        if self.label().is_empty() {
            return Err(Error::invalid("recipient label must not be empty"));
        }
        if let Recipient::Password { kdf_iter, .. } = self {
            if *kdf_iter < MIN_KDF_ITER {
                return Err(Error::invalid(format!(
                    "kdf_iter {kdf_iter} below the {MIN_KDF_ITER} floor"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_floor_enforced() {
        assert!(Recipient::make_password("p", 50_000).validate().is_err());
        assert!(Recipient::make_password("p", 100_000).validate().is_ok());
        assert!(Recipient::make_symmetric("").validate().is_err());
    }

    #[test]
    fn lock_classification() {
        let sym = Lock {
            label: "s".into(),
            encrypted_fmk: vec![0; 32],
            kind: LockKind::Symmetric { salt: vec![0; 32] },
        };
        assert!(sym.is_symmetric());
        assert!(!sym.is_cdoc1());
        assert!(!sym.matches_certificate(b"whatever"));
    }
}
