//! CDoc2 key schedule.
//!
//! A container holds one 32-byte file master key (FMK). Every other key is
//! derived from it with HKDF-SHA-256 under fixed domain separation strings,
//! and the FMK itself is wrapped per recipient with a KEK derived here.

use zeroize::Zeroizing;

use crate::crypto;
use crate::error::Result;

pub const KEY_LEN: usize = 32;

/// Info string for the content encryption key.
pub const CEK_INFO: &[u8] = b"CDOC20cek";
/// Info string for the header HMAC key.
pub const HMAC_INFO: &[u8] = b"CDOC20hmac";
/// HKDF-Extract salt for the ECDH premaster.
pub const KEK_PREMASTER_SALT: &[u8] = b"CDOC20kekpremaster";
/// Prefix of every KEK expand info string.
pub const KEK_INFO: &[u8] = b"CDOC20kek";
/// AAD prefix for the payload AEAD.
pub const PAYLOAD_AAD: &[u8] = b"CDOC20payload";
/// Wire name of the FMK wrap method, bound into the KEK info.
pub const FMK_METHOD_XOR: &[u8] = b"XOR";

pub type Fmk = Zeroizing<Vec<u8>>;

pub fn generate_fmk() -> Fmk {
    let mut fmk = Zeroizing::new(vec![0u8; KEY_LEN]);
    crypto::random_bytes(&mut fmk);
    fmk
}

pub fn derive_cek(fmk: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    crypto::hkdf_expand(fmk, CEK_INFO, KEY_LEN)
}

pub fn derive_hhk(fmk: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    crypto::hkdf_expand(fmk, HMAC_INFO, KEY_LEN)
}

/// Expand info for a public-key KEK: `"CDOC20kek" ∥ "XOR" ∥ rcpt ∥ sender`.
pub fn kek_info_pk(rcpt_key: &[u8], sender_key: &[u8]) -> Vec<u8> {
    let mut info = Vec::with_capacity(KEK_INFO.len() + 3 + rcpt_key.len() + sender_key.len());
    info.extend_from_slice(KEK_INFO);
    info.extend_from_slice(FMK_METHOD_XOR);
    info.extend_from_slice(rcpt_key);
    info.extend_from_slice(sender_key);
    info
}

/// Expand info for a symmetric or password KEK: `"CDOC20kek" ∥ "XOR" ∥ label`.
pub fn kek_info_label(label: &str) -> Vec<u8> {
    let mut info = Vec::with_capacity(KEK_INFO.len() + 3 + label.len());
    info.extend_from_slice(KEK_INFO);
    info.extend_from_slice(FMK_METHOD_XOR);
    info.extend_from_slice(label.as_bytes());
    info
}

/// ECC KEK from an ECDH premaster (already HKDF-extracted).
pub fn kek_from_premaster(
    premaster: &[u8],
    rcpt_key: &[u8],
    sender_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    crypto::hkdf_expand(premaster, &kek_info_pk(rcpt_key, sender_key), KEY_LEN)
}

/// Symmetric/password KEK from the already-stretched key material.
pub fn kek_from_secret(key: &[u8], salt: &[u8], label: &str) -> Result<Zeroizing<Vec<u8>>> {
    let prk = crypto::hkdf_extract(salt, key);
    crypto::hkdf_expand(&prk, &kek_info_label(label), KEY_LEN)
}
