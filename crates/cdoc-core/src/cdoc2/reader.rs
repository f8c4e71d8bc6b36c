use std::io::{Read, Seek, SeekFrom};

use log::{debug, warn};

use crate::backend::{CryptoBackend, NetworkBackend};
use crate::cdoc2::{header, payload_aad, HMAC_LEN, LABEL, MAX_HEADER_LEN, NONCE_LEN};
use crate::crypto::{self, ChaChaStream};
use crate::derivation::{self, Fmk};
use crate::error::{Error, Result};
use crate::io::{FileInfo, MultiDataConsumer};
use crate::lock::{Lock, LockKind};
use crate::stream::{CipherSource, TaggedSource, ZSource};
use crate::tar::TarSource;
use crate::CdocReader;

type Pipeline<R> = TarSource<ZSource<CipherSource<TaggedSource<R>>>>;

/// Pull/push reader for CDoc2 containers.
///
/// Construction parses and verifies the header; [`CdocReader::get_fmk`]
/// authenticates it against a candidate FMK before the key is released;
/// decryption streams `TaggedSource → CipherSource → ZSource → TarSource`.
pub struct Cdoc2Reader<'a, R: Read + Seek> {
    crypto: &'a dyn CryptoBackend,
    network: Option<&'a dyn NetworkBackend>,
    locks: Vec<Lock>,
    header_data: Vec<u8>,
    header_hmac: [u8; HMAC_LEN],
    nonce_pos: u64,
    src: Option<R>,
    pipeline: Option<Pipeline<R>>,
    /// Set when the payload carried bytes past the deflate stream end.
    extra_data: bool,
}

impl<'a, R: Read + Seek> Cdoc2Reader<'a, R> {
    pub fn new(
        mut src: R,
        crypto: &'a dyn CryptoBackend,
        network: Option<&'a dyn NetworkBackend>,
    ) -> Result<Self> {
        let mut label = [0u8; LABEL.len()];
        src.read_exact(&mut label)
            .map_err(|_| Error::format("truncated CDoc2 label"))?;
        if label != LABEL {
            return Err(Error::format("bad CDoc2 label"));
        }
        let mut len_buf = [0u8; 4];
        src.read_exact(&mut len_buf)
            .map_err(|_| Error::format("truncated CDoc2 header length"))?;
        let header_len = u32::from_be_bytes(len_buf) as usize;
        if header_len > MAX_HEADER_LEN {
            return Err(Error::format(format!("header too large: {header_len}")));
        }
        let mut header_data = vec![0u8; header_len];
        src.read_exact(&mut header_data)
            .map_err(|_| Error::format("truncated CDoc2 header"))?;
        let mut header_hmac = [0u8; HMAC_LEN];
        src.read_exact(&mut header_hmac)
            .map_err(|_| Error::format("truncated CDoc2 header HMAC"))?;

        let locks = header::parse(&header_data)?;
        debug!("CDoc2 header: {} usable lock(s)", locks.len());

        let nonce_pos = (LABEL.len() + 4 + header_len + HMAC_LEN) as u64;
        Ok(Cdoc2Reader {
            crypto,
            network,
            locks,
            header_data,
            header_hmac,
            nonce_pos,
            src: Some(src),
            pipeline: None,
            extra_data: false,
        })
    }

    pub fn has_extra_data(&self) -> bool {
        self.extra_data
    }

    fn derive_kek(&self, lock: &Lock) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        match &lock.kind {
            LockKind::Symmetric { salt } => {
                self.crypto.extract_hkdf(salt, &[], 0, &lock.label)
            }
            LockKind::Password { salt, pw_salt, kdf_iter } => {
                self.crypto.extract_hkdf(salt, pw_salt, *kdf_iter, &lock.label)
            }
            LockKind::PublicKeyEcc { rcpt_key, sender_key } => {
                let premaster = self.crypto.derive_hmac_extract(
                    sender_key,
                    derivation::KEK_PREMASTER_SALT,
                    &lock.label,
                )?;
                derivation::kek_from_premaster(&premaster, rcpt_key, sender_key)
            }
            LockKind::PublicKeyRsa { encrypted_kek, .. } => {
                self.crypto.decrypt_rsa(encrypted_kek, true, &lock.label)
            }
            LockKind::Server { rcpt_key, rsa, keyserver_id, transaction_id } => {
                let network = self
                    .network
                    .ok_or(Error::NotImplemented("network backend"))?;
                let key_material = network.fetch_key(keyserver_id, transaction_id)?;
                if *rsa {
                    self.crypto.decrypt_rsa(&key_material, true, &lock.label)
                } else {
                    let premaster = self.crypto.derive_hmac_extract(
                        &key_material,
                        derivation::KEK_PREMASTER_SALT,
                        &lock.label,
                    )?;
                    derivation::kek_from_premaster(&premaster, rcpt_key, &key_material)
                }
            }
            LockKind::Cdoc1Rsa { .. } | LockKind::Cdoc1Ecc { .. } => {
                Err(Error::invalid("not a CDoc2 lock"))
            }
        }
    }

    // Returns the source to its pre-payload state, tearing down a pipeline
    // that was left mid-stream.
    fn reclaim_source(&mut self) -> Result<R> {
        if let Some(tar) = self.pipeline.take() {
            let (tagged, _) = tar.into_inner().into_inner().into_parts();
            self.src = Some(tagged.into_inner());
        }
        self.src.take().ok_or(Error::Workflow("reader has no source"))
    }
}

impl<'a, R: Read + Seek> CdocReader for Cdoc2Reader<'a, R> {
    fn version(&self) -> u32 {
        2
    }

    fn locks(&self) -> &[Lock] {
        &self.locks
    }

    fn lock_for_cert(&self, cert_der: &[u8]) -> Option<&Lock> {
        // Header order; labels are not a key.
        self.locks.iter().find(|l| l.matches_certificate(cert_der))
    }

    fn get_fmk(&mut self, lock: &Lock) -> Result<Fmk> {
        let kek = self.derive_kek(lock)?;
        let fmk = crypto::xor(&lock.encrypted_fmk, &kek)?;
        let hhk = derivation::derive_hhk(&fmk)?;
        if !crypto::hmac_sha256_verify(&hhk, &self.header_data, &self.header_hmac)? {
            return Err(Error::HashMismatch);
        }
        Ok(fmk)
    }

    fn begin_decryption(&mut self, fmk: &[u8]) -> Result<()> {
        let mut src = self.reclaim_source()?;
        src.seek(SeekFrom::Start(self.nonce_pos))?;
        let mut nonce = [0u8; NONCE_LEN];
        src.read_exact(&mut nonce)
            .map_err(|_| Error::format("truncated payload nonce"))?;

        let cek = derivation::derive_cek(fmk)?;
        let mut cipher = ChaChaStream::new(&cek, &nonce)?;
        cipher.update_aad(&payload_aad(&self.header_data, &self.header_hmac))?;

        self.extra_data = false;
        self.pipeline = Some(TarSource::new(ZSource::new(CipherSource::new(
            TaggedSource::new(src),
            cipher,
        ))));
        Ok(())
    }

    fn next_file(&mut self) -> Result<Option<FileInfo>> {
        match self.pipeline.as_mut() {
            Some(tar) => tar.next(),
            None => Err(Error::Workflow("next_file before begin_decryption")),
        }
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.pipeline.as_mut() {
            Some(tar) => Ok(tar.read(buf)?),
            None => Err(Error::Workflow("read before begin_decryption")),
        }
    }

    fn finish_decryption(&mut self) -> Result<()> {
        let tar = self
            .pipeline
            .take()
            .ok_or(Error::Workflow("finish before begin_decryption"))?;
        let mut z = tar.into_inner();
        // Pull the deflate stream to its end so every ciphertext byte the
        // inflater buffered is accounted for.
        let mut sink = [0u8; 4096];
        loop {
            match z.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::InputStream(format!("payload inflate: {e}"))),
            }
        }
        let total_in = z.total_in();
        let mut cs = z.into_inner();
        cs.drain()?;
        if cs.total_read() > total_in {
            warn!("container carries payload data past the content end");
            self.extra_data = true;
        }
        let (tagged, cipher) = cs.into_parts();
        let tag = tagged.tag()?;
        self.src = Some(tagged.into_inner());
        cipher
            .ok_or_else(|| Error::crypto("cipher state lost"))?
            .verify_tag(&tag)?;
        Ok(())
    }

    fn decrypt(&mut self, fmk: &[u8], consumer: &mut dyn MultiDataConsumer) -> Result<()> {
        self.begin_decryption(fmk)?;
        let mut buf = [0u8; 8192];
        while let Some(info) = self.next_file()? {
            consumer.open(&info.name, info.size)?;
            loop {
                let n = self.read_data(&mut buf)?;
                if n == 0 {
                    break;
                }
                consumer.write_data(&buf[..n])?;
            }
        }
        consumer.close()?;
        self.finish_decryption()
    }
}
