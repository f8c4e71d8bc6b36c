use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::backend::{CryptoBackend, NetworkBackend};
use crate::cdoc2::{header, payload_aad, LABEL, NONCE_LEN};
use crate::certificate::{self, KeyKind};
use crate::crypto::{self, ChaChaStream};
use crate::derivation::{self, Fmk};
use crate::error::{Error, Result};
use crate::lock::{Lock, LockKind, Recipient};
use crate::stream::{CipherConsumer, ZConsumer};
use crate::tar::TarConsumer;
use crate::CdocWriter;

enum State {
    Idle,
    Recipients,
    Payload,
    Finalized,
}

type Pipeline<W> = TarConsumer<ZConsumer<CipherConsumer<W>>>;

/// Streaming CDoc2 writer: `Idle → Recipients → Payload → Finalized`.
///
/// The header is serialized and locked the moment the first file is added
/// (or at finish for an empty container); recipients cannot change after
/// that. Out-of-order calls fail with a workflow error and leave the
/// writer untouched.
pub struct Cdoc2Writer<'a, W: Write> {
    crypto: &'a dyn CryptoBackend,
    network: Option<&'a dyn NetworkBackend>,
    out: Option<W>,
    pipeline: Option<Pipeline<W>>,
    state: State,
    fmk: Option<Fmk>,
    cek: Option<Zeroizing<Vec<u8>>>,
    hhk: Option<Zeroizing<Vec<u8>>>,
    locks: Vec<Lock>,
}

impl<'a, W: Write> Cdoc2Writer<'a, W> {
    pub fn new(
        out: W,
        crypto: &'a dyn CryptoBackend,
        network: Option<&'a dyn NetworkBackend>,
    ) -> Self {
        Cdoc2Writer {
            crypto,
            network,
            out: Some(out),
            pipeline: None,
            state: State::Idle,
            fmk: None,
            cek: None,
            hhk: None,
            locks: Vec::new(),
        }
    }

    /// The output sink, returned after `finish_encryption`.
    pub fn take_output(&mut self) -> Option<W> {
        self.out.take()
    }

    fn fmk(&self) -> Result<&Fmk> {
        self.fmk.as_ref().ok_or(Error::Workflow("begin_encryption first"))
    }

    fn wrap_ecc(&self, rcpt_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        // Reject anything that is not a P-384 point before deriving.
        p384::PublicKey::from_sec1_bytes(rcpt_key)
            .map_err(|_| Error::invalid("recipient key is not a valid P-384 point"))?;
        let (eph_sk, eph_pk) = crypto::generate_p384();
        let shared = crypto::ecdh_p384(&eph_sk, rcpt_key)?;
        let premaster = crypto::hkdf_extract(derivation::KEK_PREMASTER_SALT, &shared);
        let kek = derivation::kek_from_premaster(&premaster, rcpt_key, &eph_pk)?;
        let encrypted_fmk = crypto::xor(self.fmk()?, &kek)?.to_vec();
        Ok((rcpt_key.to_vec(), eph_pk, encrypted_fmk))
    }

    fn wrap_rsa(&self, spki_der: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        use rsa::pkcs8::DecodePublicKey;
        let pk = rsa::RsaPublicKey::from_public_key_der(spki_der)
            .map_err(|_| Error::invalid("unparseable RSA recipient key"))?;
        let mut kek = Zeroizing::new(vec![0u8; derivation::KEY_LEN]);
        crypto::random_bytes(&mut kek);
        let encrypted_kek = crypto::rsa_encrypt(&pk, &kek, true)?;
        let encrypted_fmk = crypto::xor(self.fmk()?, &kek)?.to_vec();
        Ok((encrypted_kek, encrypted_fmk))
    }

    fn wrap_recipient(&self, rcpt: &Recipient) -> Result<Lock> {
        rcpt.validate()?;
        let label = rcpt.label().to_string();
        let (encrypted_fmk, kind) = match rcpt {
            Recipient::Certificate { cert_der, .. } => {
                let info = certificate::parse(cert_der)?;
                match info.kind {
                    KeyKind::Ecc => {
                        let (rcpt_key, sender_key, enc) = self.wrap_ecc(&info.ec_point)?;
                        (enc, LockKind::PublicKeyEcc { rcpt_key, sender_key })
                    }
                    KeyKind::Rsa => {
                        let (encrypted_kek, enc) = self.wrap_rsa(&info.spki_der)?;
                        (
                            enc,
                            LockKind::PublicKeyRsa {
                                rcpt_key: info.spki_der,
                                encrypted_kek,
                            },
                        )
                    }
                }
            }
            Recipient::EccPublicKey { public_key, .. } => {
                let (rcpt_key, sender_key, enc) = self.wrap_ecc(public_key)?;
                (enc, LockKind::PublicKeyEcc { rcpt_key, sender_key })
            }
            Recipient::RsaPublicKey { public_key_der, .. } => {
                let (encrypted_kek, enc) = self.wrap_rsa(public_key_der)?;
                (
                    enc,
                    LockKind::PublicKeyRsa {
                        rcpt_key: public_key_der.clone(),
                        encrypted_kek,
                    },
                )
            }
            Recipient::Server { public_key, rsa, keyserver_id, .. } => {
                let network = self
                    .network
                    .ok_or(Error::NotImplemented("network backend"))?;
                if *rsa {
                    let (encrypted_kek, enc) = self.wrap_rsa(public_key)?;
                    let transaction_id =
                        network.send_key(keyserver_id, public_key, &encrypted_kek, true)?;
                    (
                        enc,
                        LockKind::Server {
                            rcpt_key: public_key.clone(),
                            rsa: true,
                            keyserver_id: keyserver_id.clone(),
                            transaction_id,
                        },
                    )
                } else {
                    let (rcpt_key, sender_key, enc) = self.wrap_ecc(public_key)?;
                    let transaction_id =
                        network.send_key(keyserver_id, &rcpt_key, &sender_key, false)?;
                    (
                        enc,
                        LockKind::Server {
                            rcpt_key,
                            rsa: false,
                            keyserver_id: keyserver_id.clone(),
                            transaction_id,
                        },
                    )
                }
            }
            Recipient::Symmetric { label } => {
                let mut salt = vec![0u8; derivation::KEY_LEN];
                crypto::random_bytes(&mut salt);
                let kek = self.crypto.extract_hkdf(&salt, &[], 0, label)?;
                let enc = crypto::xor(self.fmk()?, &kek)?.to_vec();
                (enc, LockKind::Symmetric { salt })
            }
            Recipient::Password { label, kdf_iter } => {
                let mut salt = vec![0u8; derivation::KEY_LEN];
                let mut pw_salt = vec![0u8; derivation::KEY_LEN];
                crypto::random_bytes(&mut salt);
                crypto::random_bytes(&mut pw_salt);
                let kek = self.crypto.extract_hkdf(&salt, &pw_salt, *kdf_iter, label)?;
                let enc = crypto::xor(self.fmk()?, &kek)?.to_vec();
                (
                    enc,
                    LockKind::Password {
                        salt,
                        pw_salt,
                        kdf_iter: *kdf_iter,
                    },
                )
            }
        };
        Ok(Lock { label, encrypted_fmk, kind })
    }

    // Serializes the header and opens the payload pipeline; recipients are
    // locked from here on.
    fn open_payload(&mut self) -> Result<()> {
        if self.locks.is_empty() {
            return Err(Error::invalid("no recipients added"));
        }
        let header_data = header::serialize(&self.locks)?;
        let hhk = self.hhk.as_ref().ok_or(Error::Workflow("begin_encryption first"))?;
        let hmac = crypto::hmac_sha256(hhk, &header_data)?;
        let mut nonce = [0u8; NONCE_LEN];
        crypto::random_bytes(&mut nonce);

        let cek = self.cek.as_ref().ok_or(Error::Workflow("begin_encryption first"))?;
        let mut cipher = ChaChaStream::new(cek, &nonce)?;
        cipher.update_aad(&payload_aad(&header_data, &hmac))?;

        let mut out = self.out.take().ok_or(Error::Workflow("writer already finished"))?;
        out.write_all(&LABEL)?;
        out.write_all(&(header_data.len() as u32).to_be_bytes())?;
        out.write_all(&header_data)?;
        out.write_all(&hmac)?;
        out.write_all(&nonce)?;

        debug!(
            "CDoc2 header locked: {} recipient(s), {} bytes",
            self.locks.len(),
            header_data.len()
        );
        self.pipeline = Some(TarConsumer::new(ZConsumer::new(CipherConsumer::new(
            out, cipher,
        ))));
        self.state = State::Payload;
        Ok(())
    }
}

impl<'a, W: Write> CdocWriter for Cdoc2Writer<'a, W> {
    fn begin_encryption(&mut self) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(Error::Workflow("encryption already started"));
        }
        let fmk = derivation::generate_fmk();
        self.cek = Some(derivation::derive_cek(&fmk)?);
        self.hhk = Some(derivation::derive_hhk(&fmk)?);
        self.fmk = Some(fmk);
        self.state = State::Recipients;
        Ok(())
    }

    fn add_recipient(&mut self, recipient: &Recipient) -> Result<()> {
        if !matches!(self.state, State::Recipients) {
            return Err(Error::Workflow("recipients must be added before payload"));
        }
        if self.locks.iter().any(|l| l.label == recipient.label()) {
            return Err(Error::invalid(format!(
                "duplicate recipient label {:?}",
                recipient.label()
            )));
        }
        let lock = self.wrap_recipient(recipient)?;
        self.locks.push(lock);
        Ok(())
    }

    fn add_file(&mut self, name: &str, size: i64) -> Result<()> {
        match self.state {
            State::Recipients => self.open_payload()?,
            State::Payload => {}
            _ => return Err(Error::Workflow("add_file outside encryption")),
        }
        self.pipeline
            .as_mut()
            .ok_or(Error::Workflow("payload pipeline missing"))?
            .add_file(name, size)
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        if !matches!(self.state, State::Payload) {
            return Err(Error::Workflow("write_data before add_file"));
        }
        self.pipeline
            .as_mut()
            .ok_or(Error::Workflow("payload pipeline missing"))?
            .write_data(data)
    }

    fn finish_encryption(&mut self) -> Result<()> {
        match self.state {
            // An empty container still carries a header and a TAR end
            // marker so it round-trips to zero entries.
            State::Recipients => self.open_payload()?,
            State::Payload => {}
            _ => return Err(Error::Workflow("finish outside encryption")),
        }
        let tar = self
            .pipeline
            .take()
            .ok_or(Error::Workflow("payload pipeline missing"))?;
        let zcons = tar.finish()?;
        let ccons = zcons.finish()?;
        let (mut out, tag) = ccons.finish()?;
        out.write_all(&tag)?;
        out.flush()?;
        self.out = Some(out);
        self.fmk = None;
        self.cek = None;
        self.hhk = None;
        self.state = State::Finalized;
        Ok(())
    }
}

/// CDoc2 writer targeting a filesystem path: streams into a temp file next
/// to the destination and renames on finish, so an aborted write never
/// leaves a partial container behind.
pub struct Cdoc2FileWriter<'a> {
    inner: Cdoc2Writer<'a, NamedTempFile>,
    dest: PathBuf,
}

impl<'a> Cdoc2FileWriter<'a> {
    pub fn create(
        dest: impl AsRef<Path>,
        crypto: &'a dyn CryptoBackend,
        network: Option<&'a dyn NetworkBackend>,
    ) -> Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        Ok(Cdoc2FileWriter {
            inner: Cdoc2Writer::new(tmp, crypto, network),
            dest,
        })
    }
}

impl CdocWriter for Cdoc2FileWriter<'_> {
    fn begin_encryption(&mut self) -> Result<()> {
        self.inner.begin_encryption()
    }

    fn add_recipient(&mut self, recipient: &Recipient) -> Result<()> {
        self.inner.add_recipient(recipient)
    }

    fn add_file(&mut self, name: &str, size: i64) -> Result<()> {
        self.inner.add_file(name, size)
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        self.inner.write_data(data)
    }

    fn finish_encryption(&mut self) -> Result<()> {
        self.inner.finish_encryption()?;
        let tmp = self
            .inner
            .take_output()
            .ok_or(Error::Workflow("writer already persisted"))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.dest).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
