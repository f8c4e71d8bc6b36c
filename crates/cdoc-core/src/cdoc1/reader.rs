use std::collections::HashMap;
use std::io::Read;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use log::{debug, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::backend::CryptoBackend;
use crate::cdoc1::{
    self, ddoc, EncryptionMethod, MIME_DDOC, MIME_DDOC_OLD, MIME_ZLIB, RSA_MTH,
};
use crate::crypto;
use crate::derivation::Fmk;
use crate::error::{Error, Result};
use crate::io::{FileInfo, MultiDataConsumer};
use crate::lock::{Lock, LockKind};
use crate::stream::ZSource;
use crate::CdocReader;

/// Original file metadata harvested from `orig_file` properties:
/// `name|size|mime|id`.
#[derive(Debug, Clone)]
pub struct OrigFile {
    pub name: String,
    pub size: String,
    pub mime: String,
    pub id: String,
}

// One EncryptedKey block while it is being assembled.
#[derive(Default)]
struct PendingKey {
    recipient: String,
    key_name: String,
    method: String,
    concat_digest: String,
    certificate: Vec<u8>,
    key_material: Vec<u8>,
    cipher: Vec<u8>,
    algorithm_id: Vec<u8>,
    party_u_info: Vec<u8>,
    party_v_info: Vec<u8>,
}

/// Streaming-parse reader for CDoc1 documents.
///
/// The XML is walked once up front: recipient keys, encryption properties
/// and the payload cipher value are collected, after which decryption is a
/// pure push operation. The pull entry points are not available for this
/// format.
pub struct Cdoc1Reader<'a> {
    crypto: &'a dyn CryptoBackend,
    mime: String,
    method: String,
    locks: Vec<Lock>,
    files: Vec<OrigFile>,
    properties: HashMap<String, String>,
    payload: Vec<u8>,
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|err| Error::format(format!("bad XML attribute: {err}")))?;
        if a.key.local_name().as_ref() == name {
            return Ok(Some(a.unescape_value().map_err(Error::from)?.into_owned()));
        }
    }
    Ok(None)
}

// ConcatKDF parameters are hex with a spurious leading zero octet.
fn hex_param(s: &str) -> Result<Vec<u8>> {
    let mut v = hex::decode(s.trim())
        .map_err(|_| Error::format("ConcatKDF parameter is not valid hex"))?;
    if v.first() == Some(&0) {
        v.remove(0);
    }
    Ok(v)
}

fn decode_b64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    B64.decode(compact.as_bytes())
        .map_err(|_| Error::format("element content is not valid base64"))
}

impl<'a> Cdoc1Reader<'a> {
    pub fn new(mut src: impl Read, crypto: &'a dyn CryptoBackend) -> Result<Self> {
        let mut data = Vec::new();
        src.read_to_end(&mut data)?;
        let mut this = Cdoc1Reader {
            crypto,
            mime: String::new(),
            method: String::new(),
            locks: Vec::new(),
            files: Vec::new(),
            properties: HashMap::new(),
            payload: Vec::new(),
        };
        this.parse(&data)?;
        debug!(
            "CDoc1 document: method {}, {} lock(s)",
            this.method,
            this.locks.len()
        );
        Ok(this)
    }

    fn parse(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = Reader::from_reader(data);
        let mut buf = Vec::new();
        let mut key: Option<PendingKey> = None;
        let mut keyinfo_depth: i32 = 0;
        // Element whose text content is being collected, with its buffer.
        let mut capture: Option<(Vec<u8>, String)> = None;
        let mut property_name: Option<String> = None;
        let mut seen_encrypted_data = false;

        loop {
            let event = reader.read_event_into(&mut buf)?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let empty = matches!(event, Event::Empty(_));
                    let local = e.local_name().as_ref().to_vec();
                    match local.as_slice() {
                        b"EncryptedData" => {
                            seen_encrypted_data = true;
                            if let Some(m) = attr(e, b"MimeType")? {
                                self.mime = m;
                            }
                        }
                        b"KeyInfo" => {
                            if !empty {
                                keyinfo_depth += 1;
                            }
                        }
                        b"EncryptionMethod" => {
                            let alg = attr(e, b"Algorithm")?.unwrap_or_default();
                            match key.as_mut() {
                                Some(k) => k.method = alg,
                                None => self.method = alg,
                            }
                        }
                        b"EncryptedKey" => {
                            let mut k = PendingKey::default();
                            k.recipient = attr(e, b"Recipient")?.unwrap_or_default();
                            key = Some(k);
                        }
                        b"ConcatKDFParams" => {
                            if let Some(k) = key.as_mut() {
                                k.algorithm_id =
                                    hex_param(&attr(e, b"AlgorithmID")?.unwrap_or_default())?;
                                k.party_u_info =
                                    hex_param(&attr(e, b"PartyUInfo")?.unwrap_or_default())?;
                                k.party_v_info =
                                    hex_param(&attr(e, b"PartyVInfo")?.unwrap_or_default())?;
                            }
                        }
                        b"DigestMethod" => {
                            if let Some(k) = key.as_mut() {
                                k.concat_digest =
                                    attr(e, b"Algorithm")?.unwrap_or_default();
                            }
                        }
                        b"EncryptionProperty" => {
                            property_name = attr(e, b"Name")?;
                            if !empty {
                                capture = Some((local.clone(), String::new()));
                            }
                        }
                        b"KeyName" | b"PublicKey" | b"X509Certificate" => {
                            if !empty {
                                capture = Some((local.clone(), String::new()));
                            }
                        }
                        b"CipherValue" => {
                            // The payload CipherValue is the one outside
                            // KeyInfo; the ones inside belong to keys.
                            if !empty && (key.is_some() || keyinfo_depth == 0) {
                                capture = Some((local.clone(), String::new()));
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(ref t) => {
                    if let Some((_, text)) = capture.as_mut() {
                        text.push_str(&t.unescape()?);
                    }
                }
                Event::End(ref e) => {
                    let local = e.local_name().as_ref().to_vec();
                    if capture.as_ref().map(|(n, _)| n == &local).unwrap_or(false) {
                        let (_, text) = capture.take().unwrap();
                        self.finish_capture(&local, text, &mut key, &mut property_name)?;
                    }
                    match local.as_slice() {
                        b"KeyInfo" => keyinfo_depth -= 1,
                        b"EncryptedKey" => {
                            if let Some(k) = key.take() {
                                self.finish_key(k);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        if !seen_encrypted_data {
            return Err(Error::format("no EncryptedData element"));
        }
        Ok(())
    }

    fn finish_capture(
        &mut self,
        element: &[u8],
        text: String,
        key: &mut Option<PendingKey>,
        property_name: &mut Option<String>,
    ) -> Result<()> {
        match element {
            b"KeyName" => {
                if let Some(k) = key.as_mut() {
                    k.key_name = text;
                }
            }
            b"PublicKey" => {
                if let Some(k) = key.as_mut() {
                    k.key_material = decode_b64(&text)?;
                }
            }
            b"X509Certificate" => {
                if let Some(k) = key.as_mut() {
                    k.certificate = decode_b64(&text)?;
                }
            }
            b"CipherValue" => match key.as_mut() {
                Some(k) => k.cipher = decode_b64(&text)?,
                None => self.payload = decode_b64(&text)?,
            },
            b"EncryptionProperty" => {
                let name = property_name.take().unwrap_or_default();
                if name == "orig_file" {
                    let mut it = text.split('|');
                    self.files.push(OrigFile {
                        name: it.next().unwrap_or_default().to_string(),
                        size: it.next().unwrap_or_default().to_string(),
                        mime: it.next().unwrap_or_default().to_string(),
                        id: it.next().unwrap_or_default().to_string(),
                    });
                } else if !name.is_empty() {
                    self.properties.insert(name, text);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_key(&mut self, k: PendingKey) {
        // Recipient attribute is the label; KeyName is accepted as a
        // fallback but never required.
        let label = if k.recipient.is_empty() { k.key_name.clone() } else { k.recipient.clone() };
        let kind = if !k.key_material.is_empty() {
            LockKind::Cdoc1Ecc {
                certificate: k.certificate,
                eph_public_key: k.key_material,
                algorithm_id: k.algorithm_id,
                party_u_info: k.party_u_info,
                party_v_info: k.party_v_info,
                concat_digest: k.concat_digest,
                method: k.method,
            }
        } else {
            LockKind::Cdoc1Rsa { certificate: k.certificate, method: k.method }
        };
        self.locks.push(Lock { label, encrypted_fmk: k.cipher, kind });
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn original_files(&self) -> &[OrigFile] {
        &self.files
    }
}

impl<'a> CdocReader for Cdoc1Reader<'a> {
    fn version(&self) -> u32 {
        1
    }

    fn locks(&self) -> &[Lock] {
        &self.locks
    }

    fn lock_for_cert(&self, cert_der: &[u8]) -> Option<&Lock> {
        if EncryptionMethod::from_uri(&self.method).is_none() {
            return None;
        }
        self.locks.iter().find(|l| {
            if !l.matches_certificate(cert_der) || l.encrypted_fmk.is_empty() {
                return false;
            }
            match &l.kind {
                LockKind::Cdoc1Rsa { method, .. } => method == RSA_MTH,
                LockKind::Cdoc1Ecc { method, eph_public_key, .. } => {
                    !eph_public_key.is_empty() && cdoc1::kw_key_len(method).is_ok()
                }
                _ => false,
            }
        })
    }

    fn get_fmk(&mut self, lock: &Lock) -> Result<Fmk> {
        match &lock.kind {
            LockKind::Cdoc1Rsa { method, .. } => {
                if method != RSA_MTH {
                    return Err(Error::NotSupported(format!(
                        "unknown key encryption method {method}"
                    )));
                }
                self.crypto.decrypt_rsa(&lock.encrypted_fmk, false, &lock.label)
            }
            LockKind::Cdoc1Ecc {
                eph_public_key,
                algorithm_id,
                party_u_info,
                party_v_info,
                concat_digest,
                method,
                ..
            } => {
                let kek_len = cdoc1::kw_key_len(method)?;
                let kek = self.crypto.derive_concat_kdf(
                    eph_public_key,
                    concat_digest,
                    algorithm_id,
                    party_u_info,
                    party_v_info,
                    kek_len,
                    &lock.label,
                )?;
                crypto::aes_kw_unwrap(&kek, &lock.encrypted_fmk)
            }
            _ => Err(Error::invalid("not a CDoc1 lock")),
        }
    }

    fn decrypt(&mut self, fmk: &[u8], consumer: &mut dyn MultiDataConsumer) -> Result<()> {
        let method = EncryptionMethod::from_uri(&self.method).ok_or_else(|| {
            Error::NotSupported(format!("unknown encryption method {}", self.method))
        })?;
        if self.payload.is_empty() {
            return Err(Error::format("document has no payload CipherValue"));
        }
        let mut data = cdoc1::decrypt_payload(method, fmk, &self.payload)?;
        let mut mime = self.mime.clone();

        if mime == MIME_ZLIB {
            let mut inflated = Vec::new();
            let mut z = ZSource::new(&data[..]);
            z.read_to_end(&mut inflated)
                .map_err(|e| Error::InputStream(format!("payload inflate: {e}")))?;
            data = inflated;
            mime = self
                .properties
                .get("OriginalMimeType")
                .cloned()
                .unwrap_or_default();
        }

        if mime == MIME_DDOC || mime == MIME_DDOC_OLD {
            debug!("CDoc1 payload is a DDOC bundle");
            return ddoc::parse(&data, consumer);
        }

        let name = self
            .properties
            .get("Filename")
            .cloned()
            .or_else(|| self.files.first().map(|f| f.name.clone()))
            .unwrap_or_else(|| {
                warn!("no Filename property, falling back to a generic name");
                "document.bin".to_string()
            });
        consumer.open(&name, data.len() as i64)?;
        consumer.write_data(&data)?;
        consumer.close()?;
        Ok(())
    }

    fn begin_decryption(&mut self, _fmk: &[u8]) -> Result<()> {
        Err(Error::NotImplemented("CDoc1 pull decryption"))
    }

    fn next_file(&mut self) -> Result<Option<FileInfo>> {
        Err(Error::NotImplemented("CDoc1 pull decryption"))
    }

    fn read_data(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotImplemented("CDoc1 pull decryption"))
    }

    fn finish_decryption(&mut self) -> Result<()> {
        Err(Error::NotImplemented("CDoc1 pull decryption"))
    }
}
