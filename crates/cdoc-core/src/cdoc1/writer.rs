use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use log::debug;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::cdoc1::{
    self, ddoc, EncryptionMethod, AGREEMENT_MTH, CONCAT_KDF_MTH, DOCUMENT_FORMAT,
    DSIG11_NS, DSIG_NS, KWAES256_MTH, MIME_DDOC, RSA_MTH, XMLENC11_NS, XMLENC_NS,
};
use crate::certificate::{self, KeyKind};
use crate::crypto;
use crate::error::{Error, Result};
use crate::lock::Recipient;
use crate::CdocWriter;

enum State {
    Idle,
    Recipients,
    Payload,
    Finalized,
}

/// XML-Enc writer. Content is buffered until `finish_encryption`: the
/// document interleaves recipient keys, payload and properties, so nothing
/// can be flushed before the whole file set is known.
pub struct Cdoc1Writer<'a, W: Write> {
    out: Option<W>,
    method: EncryptionMethod,
    digest_uri: &'a str,
    recipients: Vec<(String, Vec<u8>)>,
    files: Vec<(String, Vec<u8>)>,
    declared: i64,
    state: State,
}

impl<'a, W: Write> Cdoc1Writer<'a, W> {
    pub fn new(out: W) -> Self {
        Cdoc1Writer {
            out: Some(out),
            method: EncryptionMethod::Aes256Cbc,
            digest_uri: crypto::SHA384_MTH,
            recipients: Vec::new(),
            files: Vec::new(),
            declared: 0,
            state: State::Idle,
        }
    }

    pub fn with_method(mut self, method: EncryptionMethod) -> Self {
        self.method = method;
        self
    }

    /// Digest used by the ConcatKDF for EC recipients.
    pub fn with_concat_digest(mut self, uri: &'a str) -> Self {
        self.digest_uri = uri;
        self
    }

    pub fn take_output(&mut self) -> Option<W> {
        self.out.take()
    }

    fn write_x509_data<O: Write>(w: &mut Writer<O>, cert: &[u8]) -> Result<()> {
        w.write_event(Event::Start(BytesStart::new("ds:X509Data")))?;
        w.write_event(Event::Start(BytesStart::new("ds:X509Certificate")))?;
        w.write_event(Event::Text(BytesText::new(&B64.encode(cert))))?;
        w.write_event(Event::End(BytesEnd::new("ds:X509Certificate")))?;
        w.write_event(Event::End(BytesEnd::new("ds:X509Data")))?;
        Ok(())
    }

    fn write_cipher_value<O: Write>(w: &mut Writer<O>, data: &[u8]) -> Result<()> {
        w.write_event(Event::Start(BytesStart::new("denc:CipherData")))?;
        w.write_event(Event::Start(BytesStart::new("denc:CipherValue")))?;
        w.write_event(Event::Text(BytesText::new(&B64.encode(data))))?;
        w.write_event(Event::End(BytesEnd::new("denc:CipherValue")))?;
        w.write_event(Event::End(BytesEnd::new("denc:CipherData")))?;
        Ok(())
    }

    fn write_rsa_key<O: Write>(
        w: &mut Writer<O>,
        label: &str,
        cert: &[u8],
        transport_key: &[u8],
    ) -> Result<()> {
        let pk = certificate::rsa_public_key(cert)?;
        let wrapped = crypto::rsa_encrypt(&pk, transport_key, false)?;

        let mut ek = BytesStart::new("denc:EncryptedKey");
        ek.push_attribute(("Recipient", label));
        w.write_event(Event::Start(ek))?;
        let mut em = BytesStart::new("denc:EncryptionMethod");
        em.push_attribute(("Algorithm", RSA_MTH));
        w.write_event(Event::Empty(em))?;
        w.write_event(Event::Start(BytesStart::new("ds:KeyInfo")))?;
        Self::write_x509_data(w, cert)?;
        w.write_event(Event::End(BytesEnd::new("ds:KeyInfo")))?;
        Self::write_cipher_value(w, &wrapped)?;
        w.write_event(Event::End(BytesEnd::new("denc:EncryptedKey")))?;
        Ok(())
    }

    fn write_ec_key<O: Write>(
        w: &mut Writer<O>,
        label: &str,
        cert: &[u8],
        ec_point: &[u8],
        digest_uri: &str,
        transport_key: &[u8],
    ) -> Result<()> {
        // Ephemeral agreement on the recipient curve; only P-384 is
        // supported by the crypto layer.
        let (eph_sk, eph_pk) = crypto::generate_p384();
        let shared = crypto::ecdh_p384(&eph_sk, ec_point)?;
        let algorithm_id = DOCUMENT_FORMAT.as_bytes();
        let kek = crypto::concat_kdf(&shared, digest_uri, algorithm_id, &eph_pk, cert, 32)?;
        let wrapped = crypto::aes_kw_wrap(&kek, transport_key)?;

        let hex_attr = |data: &[u8]| format!("00{}", hex::encode(data));

        let mut ek = BytesStart::new("denc:EncryptedKey");
        ek.push_attribute(("Recipient", label));
        w.write_event(Event::Start(ek))?;
        let mut em = BytesStart::new("denc:EncryptionMethod");
        em.push_attribute(("Algorithm", KWAES256_MTH));
        w.write_event(Event::Empty(em))?;

        w.write_event(Event::Start(BytesStart::new("ds:KeyInfo")))?;
        let mut am = BytesStart::new("xenc11:AgreementMethod");
        am.push_attribute(("xmlns:xenc11", XMLENC11_NS));
        am.push_attribute(("Algorithm", AGREEMENT_MTH));
        w.write_event(Event::Start(am))?;

        let mut kdm = BytesStart::new("xenc11:KeyDerivationMethod");
        kdm.push_attribute(("Algorithm", CONCAT_KDF_MTH));
        w.write_event(Event::Start(kdm))?;
        let mut params = BytesStart::new("xenc11:ConcatKDFParams");
        params.push_attribute(("AlgorithmID", hex_attr(algorithm_id).as_str()));
        params.push_attribute(("PartyUInfo", hex_attr(&eph_pk).as_str()));
        params.push_attribute(("PartyVInfo", hex_attr(cert).as_str()));
        w.write_event(Event::Start(params))?;
        let mut dm = BytesStart::new("ds:DigestMethod");
        dm.push_attribute(("Algorithm", digest_uri));
        w.write_event(Event::Empty(dm))?;
        w.write_event(Event::End(BytesEnd::new("xenc11:ConcatKDFParams")))?;
        w.write_event(Event::End(BytesEnd::new("xenc11:KeyDerivationMethod")))?;

        w.write_event(Event::Start(BytesStart::new("xenc11:OriginatorKeyInfo")))?;
        w.write_event(Event::Start(BytesStart::new("ds:KeyValue")))?;
        let mut ekv = BytesStart::new("dsig11:ECKeyValue");
        ekv.push_attribute(("xmlns:dsig11", DSIG11_NS));
        w.write_event(Event::Start(ekv))?;
        let mut curve = BytesStart::new("dsig11:NamedCurve");
        curve.push_attribute(("URI", "urn:oid:1.3.132.0.34"));
        w.write_event(Event::Empty(curve))?;
        w.write_event(Event::Start(BytesStart::new("dsig11:PublicKey")))?;
        w.write_event(Event::Text(BytesText::new(&B64.encode(&eph_pk))))?;
        w.write_event(Event::End(BytesEnd::new("dsig11:PublicKey")))?;
        w.write_event(Event::End(BytesEnd::new("dsig11:ECKeyValue")))?;
        w.write_event(Event::End(BytesEnd::new("ds:KeyValue")))?;
        w.write_event(Event::End(BytesEnd::new("xenc11:OriginatorKeyInfo")))?;

        w.write_event(Event::Start(BytesStart::new("xenc11:RecipientKeyInfo")))?;
        Self::write_x509_data(w, cert)?;
        w.write_event(Event::End(BytesEnd::new("xenc11:RecipientKeyInfo")))?;
        w.write_event(Event::End(BytesEnd::new("xenc11:AgreementMethod")))?;
        w.write_event(Event::End(BytesEnd::new("ds:KeyInfo")))?;

        Self::write_cipher_value(w, &wrapped)?;
        w.write_event(Event::End(BytesEnd::new("denc:EncryptedKey")))?;
        Ok(())
    }

    fn write_property<O: Write>(w: &mut Writer<O>, name: &str, value: &str) -> Result<()> {
        let mut ep = BytesStart::new("denc:EncryptionProperty");
        ep.push_attribute(("Name", name));
        w.write_event(Event::Start(ep))?;
        w.write_event(Event::Text(BytesText::new(value)))?;
        w.write_event(Event::End(BytesEnd::new("denc:EncryptionProperty")))?;
        Ok(())
    }

    fn build_document(&mut self) -> Result<Vec<u8>> {
        let transport_key = {
            let mut key = Zeroizing::new(vec![0u8; self.method.key_len()]);
            crypto::random_bytes(&mut key);
            key
        };
        let multi = self.files.len() > 1;
        let (payload, mime) = if multi {
            (ddoc::build(&self.files)?, MIME_DDOC.to_string())
        } else {
            let (_, data) = &self.files[0];
            (data.clone(), "application/octet-stream".to_string())
        };
        let cipher_value = cdoc1::encrypt_payload(self.method, &transport_key, &payload)?;

        let mut w = Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut root = BytesStart::new("denc:EncryptedData");
        root.push_attribute(("xmlns:denc", XMLENC_NS));
        root.push_attribute(("MimeType", mime.as_str()));
        w.write_event(Event::Start(root))?;

        let mut em = BytesStart::new("denc:EncryptionMethod");
        em.push_attribute(("Algorithm", self.method.uri()));
        w.write_event(Event::Empty(em))?;

        let mut ki = BytesStart::new("ds:KeyInfo");
        ki.push_attribute(("xmlns:ds", DSIG_NS));
        w.write_event(Event::Start(ki))?;
        for (label, cert) in &self.recipients {
            let info = certificate::parse(cert)?;
            match info.kind {
                KeyKind::Rsa => Self::write_rsa_key(&mut w, label, cert, &transport_key)?,
                KeyKind::Ecc => Self::write_ec_key(
                    &mut w,
                    label,
                    cert,
                    &info.ec_point,
                    self.digest_uri,
                    &transport_key,
                )?,
            }
        }
        w.write_event(Event::End(BytesEnd::new("ds:KeyInfo")))?;

        Self::write_cipher_value(&mut w, &cipher_value)?;

        w.write_event(Event::Start(BytesStart::new("denc:EncryptionProperties")))?;
        Self::write_property(&mut w, "DocumentFormat", DOCUMENT_FORMAT)?;
        Self::write_property(&mut w, "Filename", &self.files[0].0)?;
        for (i, (name, data)) in self.files.iter().enumerate() {
            let value = format!(
                "{name}|{size}|{mime}|D{i}",
                size = data.len(),
                mime = "application/octet-stream"
            );
            Self::write_property(&mut w, "orig_file", &value)?;
        }
        w.write_event(Event::End(BytesEnd::new("denc:EncryptionProperties")))?;
        w.write_event(Event::End(BytesEnd::new("denc:EncryptedData")))?;
        Ok(w.into_inner())
    }
}

impl<'a, W: Write> CdocWriter for Cdoc1Writer<'a, W> {
    fn begin_encryption(&mut self) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(Error::Workflow("encryption already started"));
        }
        self.state = State::Recipients;
        Ok(())
    }

    fn add_recipient(&mut self, recipient: &Recipient) -> Result<()> {
        if !matches!(self.state, State::Recipients) {
            return Err(Error::Workflow("recipients must be added before payload"));
        }
        recipient.validate()?;
        match recipient {
            Recipient::Certificate { label, cert_der } => {
                certificate::parse(cert_der)?;
                self.recipients.push((label.clone(), cert_der.clone()));
                Ok(())
            }
            _ => Err(Error::NotSupported(
                "CDoc1 supports certificate recipients only".into(),
            )),
        }
    }

    fn add_file(&mut self, name: &str, size: i64) -> Result<()> {
        match self.state {
            State::Recipients => {
                if self.recipients.is_empty() {
                    return Err(Error::invalid("no recipients added"));
                }
                self.state = State::Payload;
            }
            State::Payload => {}
            _ => return Err(Error::Workflow("add_file outside encryption")),
        }
        if let Some((_, data)) = self.files.last() {
            if (data.len() as i64) < self.declared {
                return Err(Error::Workflow("previous entry not fully written"));
            }
        }
        self.declared = size;
        self.files
            .push((name.to_string(), Vec::with_capacity(size.max(0) as usize)));
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        if !matches!(self.state, State::Payload) {
            return Err(Error::Workflow("write_data before add_file"));
        }
        let (_, buf) = self
            .files
            .last_mut()
            .ok_or(Error::Workflow("write_data before add_file"))?;
        if self.declared >= 0 && (buf.len() + data.len()) as i64 > self.declared {
            return Err(Error::invalid("more data than the entry declared"));
        }
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn finish_encryption(&mut self) -> Result<()> {
        if !matches!(self.state, State::Payload) {
            return Err(Error::Workflow("nothing to finish"));
        }
        let doc = self.build_document()?;
        let out = self.out.as_mut().ok_or(Error::Workflow("writer already finished"))?;
        out.write_all(&doc)?;
        out.flush()?;
        debug!("CDoc1 document written: {} file(s)", self.files.len());
        self.state = State::Finalized;
        Ok(())
    }
}

/// CDoc1 writer targeting a path, with the same temp-and-rename discipline
/// as the CDoc2 one.
pub struct Cdoc1FileWriter<'a> {
    inner: Cdoc1Writer<'a, NamedTempFile>,
    dest: PathBuf,
}

impl<'a> Cdoc1FileWriter<'a> {
    pub fn create(dest: impl AsRef<Path>) -> Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        Ok(Cdoc1FileWriter { inner: Cdoc1Writer::new(tmp), dest })
    }

    pub fn with_method(mut self, method: EncryptionMethod) -> Self {
        self.inner = self.inner.with_method(method);
        self
    }
}

impl CdocWriter for Cdoc1FileWriter<'_> {
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
