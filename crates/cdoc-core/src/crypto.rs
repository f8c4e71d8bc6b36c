//! Primitive operations backing both container formats.
//!
//! Everything here is a pure function over byte buffers (plus the streaming
//! [`ChaChaStream`] object); no I/O, no retained state beyond the result.
//! Failures never produce partial output.

use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use aes_kw::Kek;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20::cipher::{KeyIvInit as _, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p384::elliptic_curve::sec1::ToEncodedPoint;
use poly1305::universal_hash::{KeyInit as _, UniversalHash};
use poly1305::Poly1305;
use rand::RngCore;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

type Aes192Gcm = AesGcm<Aes192, aes_gcm::aead::consts::U12>;
type HmacSha256 = Hmac<Sha256>;

pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const CBC_IV_LEN: usize = 16;
pub const CHACHA_NONCE_LEN: usize = 12;
pub const CHACHA_TAG_LEN: usize = 16;

/// Fill `buf` from the operating system RNG.
pub fn random_bytes(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}

pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != CBC_IV_LEN {
        return Err(Error::crypto("AES-CBC IV must be 16 bytes"));
    }
    let out = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| Error::crypto("bad AES key"))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| Error::crypto("bad AES key"))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::crypto("bad AES key"))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        n => return Err(Error::crypto(format!("unsupported AES key length {n}"))),
    };
    Ok(out)
}

pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != CBC_IV_LEN {
        return Err(Error::crypto("AES-CBC IV must be 16 bytes"));
    }
    let out = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| Error::crypto("bad AES key"))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| Error::crypto("bad AES key"))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::crypto("bad AES key"))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        n => return Err(Error::crypto(format!("unsupported AES key length {n}"))),
    };
    out.map_err(|_| Error::crypto("AES-CBC padding check failed"))
}

/// AES-GCM seal; returns ciphertext with the 16-byte tag appended.
pub fn aes_gcm_encrypt(key: &[u8], iv: &[u8], aad: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != GCM_IV_LEN {
        return Err(Error::crypto("AES-GCM IV must be 12 bytes"));
    }
    let nonce = GenericArray::from_slice(iv);
    let payload = Payload { msg: data, aad };
    let out = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::crypto("bad AES key"))?
            .encrypt(nonce, payload),
        24 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| Error::crypto("bad AES key"))?
            .encrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::crypto("bad AES key"))?
            .encrypt(nonce, payload),
        n => return Err(Error::crypto(format!("unsupported AES key length {n}"))),
    };
    out.map_err(|_| Error::crypto("AES-GCM seal failed"))
}

/// AES-GCM open; `data` is ciphertext with the tag appended.
pub fn aes_gcm_decrypt(key: &[u8], iv: &[u8], aad: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != GCM_IV_LEN {
        return Err(Error::crypto("AES-GCM IV must be 12 bytes"));
    }
    if data.len() < GCM_TAG_LEN {
        return Err(Error::crypto("AES-GCM ciphertext shorter than tag"));
    }
    let nonce = GenericArray::from_slice(iv);
    let payload = Payload { msg: data, aad };
    let out = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::crypto("bad AES key"))?
            .decrypt(nonce, payload),
        24 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| Error::crypto("bad AES key"))?
            .decrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::crypto("bad AES key"))?
            .decrypt(nonce, payload),
        n => return Err(Error::crypto(format!("unsupported AES key length {n}"))),
    };
    out.map_err(|_| Error::crypto("AES-GCM tag check failed"))
}

/// RFC 3394 key wrap; falls back to the RFC 5649 padded variant when the
/// input is not a multiple of 8 bytes.
pub fn aes_kw_wrap(kek: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let padded = data.len() % 8 != 0 || data.len() < 16;
    macro_rules! wrap_with {
        ($alg:ty) => {{
            let cipher = Kek::<$alg>::new(GenericArray::from_slice(kek));
            if padded {
                let mut out = vec![0u8; (data.len() + 7) / 8 * 8 + 8];
                cipher
                    .wrap_with_padding(data, &mut out)
                    .map_err(|_| Error::crypto("AES-KW wrap failed"))?;
                out
            } else {
                let mut out = vec![0u8; data.len() + 8];
                cipher
                    .wrap(data, &mut out)
                    .map_err(|_| Error::crypto("AES-KW wrap failed"))?;
                out
            }
        }};
    }
    let out = match kek.len() {
        16 => wrap_with!(Aes128),
        24 => wrap_with!(Aes192),
        32 => wrap_with!(Aes256),
        n => return Err(Error::crypto(format!("unsupported KEK length {n}"))),
    };
    Ok(out)
}

pub fn aes_kw_unwrap(kek: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < 16 || data.len() % 8 != 0 {
        return Err(Error::crypto("bad AES-KW ciphertext length"));
    }
    macro_rules! unwrap_with {
        ($alg:ty) => {{
            let cipher = Kek::<$alg>::new(GenericArray::from_slice(kek));
            let mut out = vec![0u8; data.len() - 8];
            cipher
                .unwrap(data, &mut out)
                .map_err(|_| Error::crypto("AES-KW unwrap failed"))?;
            out
        }};
    }
    let out = match kek.len() {
        16 => unwrap_with!(Aes128),
        24 => unwrap_with!(Aes192),
        32 => unwrap_with!(Aes256),
        n => return Err(Error::crypto(format!("unsupported KEK length {n}"))),
    };
    Ok(Zeroizing::new(out))
}

pub fn rsa_decrypt(key: &RsaPrivateKey, ct: &[u8], oaep: bool) -> Result<Zeroizing<Vec<u8>>> {
    let pt = if oaep {
        key.decrypt(Oaep::new::<Sha256>(), ct)
    } else {
        key.decrypt(Pkcs1v15Encrypt, ct)
    };
    pt.map(Zeroizing::new)
        .map_err(|_| Error::crypto("RSA decrypt failed"))
}

pub fn rsa_encrypt(key: &RsaPublicKey, pt: &[u8], oaep: bool) -> Result<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;
    let ct = if oaep {
        key.encrypt(&mut rng, Oaep::new::<Sha256>(), pt)
    } else {
        key.encrypt(&mut rng, Pkcs1v15Encrypt, pt)
    };
    ct.map_err(|_| Error::crypto("RSA encrypt failed"))
}

/// ECDH over P-384. `peer` is an SEC1 encoded point; any other curve (or a
/// bad point) is rejected.
pub fn ecdh_p384(key: &p384::SecretKey, peer: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let pk = p384::PublicKey::from_sec1_bytes(peer)
        .map_err(|_| Error::crypto("peer key is not a valid P-384 point"))?;
    let shared = p384::ecdh::diffie_hellman(key.to_nonzero_scalar(), pk.as_affine());
    Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
}

/// Generate an ephemeral P-384 key pair; returns the secret and the
/// uncompressed SEC1 encoding of the public point.
pub fn generate_p384() -> (p384::SecretKey, Vec<u8>) {
    let sk = p384::SecretKey::random(&mut rand::rngs::OsRng);
    let pk = sk.public_key().to_encoded_point(false).as_bytes().to_vec();
    (sk, pk)
}

/// Generate an RSA key pair; returns the private key and the public
/// SubjectPublicKeyInfo DER.
pub fn generate_rsa(bits: usize) -> Result<(RsaPrivateKey, Vec<u8>)> {
    use rsa::pkcs8::EncodePublicKey;
    let sk = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
        .map_err(|_| Error::crypto("RSA key generation failed"))?;
    let spki = RsaPublicKey::from(&sk)
        .to_public_key_der()
        .map_err(|_| Error::crypto("RSA public key encoding failed"))?
        .as_bytes()
        .to_vec();
    Ok((sk, spki))
}

pub const SHA256_MTH: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const SHA384_MTH: &str = "http://www.w3.org/2001/04/xmlenc#sha384";
pub const SHA512_MTH: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

fn concat_kdf_digest<D: Digest>(
    z: &[u8],
    algorithm_id: &[u8],
    party_u: &[u8],
    party_v: &[u8],
    out_len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(out_len));
    let mut counter: u32 = 1;
    while out.len() < out_len {
        let mut d = D::new();
        d.update(counter.to_be_bytes());
        d.update(z);
        d.update(algorithm_id);
        d.update(party_u);
        d.update(party_v);
        let block = d.finalize();
        let take = (out_len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        counter += 1;
    }
    out
}

/// Single-step KDF of NIST SP 800-56A §5.8.1; the hash is selected by the
/// XML-Enc digest method URI.
pub fn concat_kdf(
    z: &[u8],
    digest_uri: &str,
    algorithm_id: &[u8],
    party_u: &[u8],
    party_v: &[u8],
    out_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    match digest_uri {
        SHA256_MTH => Ok(concat_kdf_digest::<Sha256>(z, algorithm_id, party_u, party_v, out_len)),
        SHA384_MTH => Ok(concat_kdf_digest::<Sha384>(z, algorithm_id, party_u, party_v, out_len)),
        SHA512_MTH => Ok(concat_kdf_digest::<Sha512>(z, algorithm_id, party_u, party_v, out_len)),
        other => Err(Error::crypto(format!("unknown ConcatKDF digest {other}"))),
    }
}

pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> Zeroizing<Vec<u8>> {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    Zeroizing::new(prk.to_vec())
}

pub fn hkdf_expand(prk: &[u8], info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let hk =
        Hkdf::<Sha256>::from_prk(prk).map_err(|_| Error::crypto("HKDF PRK too short"))?;
    let mut out = Zeroizing::new(vec![0u8; len]);
    hk.expand(info, &mut out)
        .map_err(|_| Error::crypto("HKDF expand length invalid"))?;
    Ok(out)
}

pub fn pbkdf2_hmac_sha256(pw: &[u8], salt: &[u8], iter: u32, len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    let _ = pbkdf2::pbkdf2::<Hmac<Sha256>>(pw, salt, iter, &mut out);
    out
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| Error::crypto("bad HMAC key"))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| Error::crypto("bad HMAC key"))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

/// Byte-wise XOR of equal-length buffers. No early return on any input.
pub fn xor(a: &[u8], b: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if a.len() != b.len() {
        return Err(Error::crypto("XOR operands differ in length"));
    }
    let mut out = Zeroizing::new(vec![0u8; a.len()]);
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    Ok(out)
}

/// Streaming ChaCha20-Poly1305 (RFC 8439).
///
/// The one-shot AEAD crates cannot authenticate a payload that is larger
/// than memory; this object feeds the Poly1305 accumulator block by block
/// while the ChaCha20 keystream is applied, so both directions can run over
/// chunked streams. AAD must be supplied before the first data update.
pub struct ChaChaStream {
    cipher: ChaCha20,
    mac: Poly1305,
    aad_len: u64,
    ct_len: u64,
    buf: [u8; 16],
    buf_len: usize,
    aad_done: bool,
}

impl ChaChaStream {
    pub fn new(key: &[u8], nonce: &[u8]) -> Result<Self> {
        let mut cipher = ChaCha20::new_from_slices(key, nonce)
            .map_err(|_| Error::crypto("bad ChaCha20 key or nonce length"))?;
        // Keystream block 0 keys the MAC; payload starts at block 1.
        let mut poly_key = Zeroizing::new([0u8; 32]);
        cipher.apply_keystream(&mut poly_key[..]);
        cipher.seek(64u64);
        let mac = Poly1305::new_from_slice(&poly_key[..])
            .map_err(|_| Error::crypto("bad Poly1305 key"))?;
        Ok(ChaChaStream {
            cipher,
            mac,
            aad_len: 0,
            ct_len: 0,
            buf: [0u8; 16],
            buf_len: 0,
            aad_done: false,
        })
    }

    fn mac_update(&mut self, mut data: &[u8]) {
        if self.buf_len > 0 {
            let take = (16 - self.buf_len).min(data.len());
            self.buf[self.buf_len..self.buf_len + take].copy_from_slice(&data[..take]);
            self.buf_len += take;
            data = &data[take..];
            if self.buf_len == 16 {
                self.mac.update_padded(&self.buf);
                self.buf_len = 0;
            }
        }
        let full = data.len() - data.len() % 16;
        if full > 0 {
            self.mac.update_padded(&data[..full]);
        }
        let rem = &data[full..];
        self.buf[..rem.len()].copy_from_slice(rem);
        self.buf_len = rem.len();
    }

    // Zero-pads the pending partial block, closing the current MAC segment.
    fn mac_pad(&mut self) {
        if self.buf_len > 0 {
            for b in &mut self.buf[self.buf_len..] {
                *b = 0;
            }
            self.mac.update_padded(&self.buf);
            self.buf_len = 0;
        }
    }

    pub fn update_aad(&mut self, aad: &[u8]) -> Result<()> {
        if self.aad_done {
            return Err(Error::Workflow("AAD after payload data"));
        }
        self.mac_update(aad);
        self.aad_len += aad.len() as u64;
        Ok(())
    }

    fn close_aad(&mut self) {
        if !self.aad_done {
            self.mac_pad();
            self.aad_done = true;
        }
    }

    /// Encrypt `data` in place; the MAC runs over the resulting ciphertext.
    pub fn encrypt_update(&mut self, data: &mut [u8]) {
        self.close_aad();
        self.cipher.apply_keystream(data);
        self.mac_update(data);
        self.ct_len += data.len() as u64;
    }

    /// Decrypt `data` in place; the MAC runs over the incoming ciphertext.
    pub fn decrypt_update(&mut self, data: &mut [u8]) {
        self.close_aad();
        self.mac_update(data);
        self.cipher.apply_keystream(data);
        self.ct_len += data.len() as u64;
    }

    pub fn finalize_tag(mut self) -> [u8; CHACHA_TAG_LEN] {
        self.close_aad();
        self.mac_pad();
        let mut lens = [0u8; 16];
        lens[..8].copy_from_slice(&self.aad_len.to_le_bytes());
        lens[8..].copy_from_slice(&self.ct_len.to_le_bytes());
        self.mac.update_padded(&lens);
        let tag = self.mac.finalize();
        let mut out = [0u8; CHACHA_TAG_LEN];
        out.copy_from_slice(&tag[..]);
        out
    }

    /// Constant-time tag verification; consumes the stream.
    pub fn verify_tag(self, tag: &[u8]) -> Result<()> {
        if tag.len() != CHACHA_TAG_LEN {
            return Err(Error::crypto("bad Poly1305 tag length"));
        }
        let computed = self.finalize_tag();
        if bool::from(computed[..].ct_eq(tag)) {
            Ok(())
        } else {
            Err(Error::crypto("payload tag does not match"))
        }
    }
}
