//! CDoc1: the legacy XML-Enc container. One encrypted payload per
//! document; multiple files travel inside an embedded DDOC bundle.

mod ddoc;
mod reader;
mod writer;

pub use reader::Cdoc1Reader;
pub use writer::{Cdoc1FileWriter, Cdoc1Writer};

use crate::error::{Error, Result};

pub const XMLENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const XMLENC11_NS: &str = "http://www.w3.org/2009/xmlenc11#";
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const DSIG11_NS: &str = "http://www.w3.org/2009/xmldsig11#";

pub const AES128CBC_MTH: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
pub const AES192CBC_MTH: &str = "http://www.w3.org/2001/04/xmlenc#aes192-cbc";
pub const AES256CBC_MTH: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";
pub const AES128GCM_MTH: &str = "http://www.w3.org/2009/xmlenc11#aes128-gcm";
pub const AES192GCM_MTH: &str = "http://www.w3.org/2009/xmlenc11#aes192-gcm";
pub const AES256GCM_MTH: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";

pub const KWAES128_MTH: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes128";
pub const KWAES192_MTH: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes192";
pub const KWAES256_MTH: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes256";

pub const RSA_MTH: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";
pub const AGREEMENT_MTH: &str = "http://www.w3.org/2009/xmlenc11#ECDH-ES";
pub const CONCAT_KDF_MTH: &str = "http://www.w3.org/2009/xmlenc11#ConcatKDF";

pub const MIME_DDOC: &str = "http://www.sk.ee/DigiDoc/v1.3.0/digidoc.xsd";
pub const MIME_DDOC_OLD: &str = "http://www.sk.ee/DigiDoc/1.3.0/digidoc.xsd";
pub const MIME_ZLIB: &str =
    "http://www.isi.edu/in-noes/iana/assignments/media-types/application/zip";

/// AlgorithmID bound into the ConcatKDF.
pub const DOCUMENT_FORMAT: &str = "ENCDOC-XML|1.1";

/// Payload cipher selection for the writer; the reader accepts the whole
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl EncryptionMethod {
    pub fn uri(self) -> &'static str {
        match self {
            EncryptionMethod::Aes128Cbc => AES128CBC_MTH,
            EncryptionMethod::Aes192Cbc => AES192CBC_MTH,
            EncryptionMethod::Aes256Cbc => AES256CBC_MTH,
            EncryptionMethod::Aes128Gcm => AES128GCM_MTH,
            EncryptionMethod::Aes192Gcm => AES192GCM_MTH,
            EncryptionMethod::Aes256Gcm => AES256GCM_MTH,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            AES128CBC_MTH => Some(EncryptionMethod::Aes128Cbc),
            AES192CBC_MTH => Some(EncryptionMethod::Aes192Cbc),
            AES256CBC_MTH => Some(EncryptionMethod::Aes256Cbc),
            AES128GCM_MTH => Some(EncryptionMethod::Aes128Gcm),
            AES192GCM_MTH => Some(EncryptionMethod::Aes192Gcm),
            AES256GCM_MTH => Some(EncryptionMethod::Aes256Gcm),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            EncryptionMethod::Aes128Cbc | EncryptionMethod::Aes128Gcm => 16,
            EncryptionMethod::Aes192Cbc | EncryptionMethod::Aes192Gcm => 24,
            EncryptionMethod::Aes256Cbc | EncryptionMethod::Aes256Gcm => 32,
        }
    }

    pub fn is_gcm(self) -> bool {
        matches!(
            self,
            EncryptionMethod::Aes128Gcm
                | EncryptionMethod::Aes192Gcm
                | EncryptionMethod::Aes256Gcm
        )
    }
}

/// KEK length for an accepted key-wrap method URI.
pub(crate) fn kw_key_len(uri: &str) -> Result<usize> {
    match uri {
        KWAES128_MTH => Ok(16),
        KWAES192_MTH => Ok(24),
        KWAES256_MTH => Ok(32),
        other => Err(Error::crypto(format!("unknown key wrap method {other}"))),
    }
}

/// Decrypt a payload `CipherValue`: the IV travels in front of the
/// ciphertext, GCM additionally carries its tag at the end.
pub(crate) fn decrypt_payload(
    method: EncryptionMethod,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    use crate::crypto;
    if key.len() != method.key_len() {
        return Err(Error::crypto("transport key length does not match method"));
    }
    if method.is_gcm() {
        if data.len() < crypto::GCM_IV_LEN + crypto::GCM_TAG_LEN {
            return Err(Error::crypto("ciphertext too short"));
        }
        let (iv, ct) = data.split_at(crypto::GCM_IV_LEN);
        crypto::aes_gcm_decrypt(key, iv, &[], ct)
    } else {
        if data.len() < crypto::CBC_IV_LEN * 2 {
            return Err(Error::crypto("ciphertext too short"));
        }
        let (iv, ct) = data.split_at(crypto::CBC_IV_LEN);
        crypto::aes_cbc_decrypt(key, iv, ct)
    }
}

pub(crate) fn encrypt_payload(
    method: EncryptionMethod,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    use crate::crypto;
    if method.is_gcm() {
        let mut iv = [0u8; crypto::GCM_IV_LEN];
        crypto::random_bytes(&mut iv);
        let ct = crypto::aes_gcm_encrypt(key, &iv, &[], data)?;
        let mut out = iv.to_vec();
        out.extend_from_slice(&ct);
        Ok(out)
    } else {
        let mut iv = [0u8; crypto::CBC_IV_LEN];
        crypto::random_bytes(&mut iv);
        let ct = crypto::aes_cbc_encrypt(key, &iv, data)?;
        let mut out = iv.to_vec();
        out.extend_from_slice(&ct);
        Ok(out)
    }
}
