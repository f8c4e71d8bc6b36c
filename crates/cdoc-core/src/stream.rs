//! Composable byte-stream layers for the CDoc2 payload.
//!
//! Read composition: `file → TaggedSource → CipherSource → ZSource →
//! TarSource`; write runs the same stack in reverse. Each adapter owns its
//! inner layer by move, so dropping the outermost layer tears the stack
//! down outer-first.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::crypto::{ChaChaStream, CHACHA_TAG_LEN};
use crate::error::{Error, Result};

/// Withholds the trailing `CHACHA_TAG_LEN` bytes of the inner stream so an
/// in-band authentication tag never reaches the cipher.
pub struct TaggedSource<R: Read> {
    inner: R,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: Read> TaggedSource<R> {
    pub fn new(inner: R) -> Self {
        TaggedSource { inner, pending: Vec::with_capacity(4096), eof: false }
    }

    /// The withheld tag. Only meaningful after the stream returned EOF.
    pub fn tag(&self) -> Result<[u8; CHACHA_TAG_LEN]> {
        if !self.eof {
            return Err(Error::Workflow("tag requested before end of stream"));
        }
        if self.pending.len() != CHACHA_TAG_LEN {
            return Err(Error::format("payload truncated before the tag"));
        }
        let mut tag = [0u8; CHACHA_TAG_LEN];
        tag.copy_from_slice(&self.pending);
        Ok(tag)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for TaggedSource<R> {
    fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        // Read ahead so `pending` always retains at least the final 16
        // bytes; only the surplus is ever delivered.
        while !self.eof && self.pending.len() < dst.len() + CHACHA_TAG_LEN {
            let start = self.pending.len();
            self.pending.resize(start + dst.len().max(4096), 0);
            let n = match self.inner.read(&mut self.pending[start..]) {
                Ok(n) => n,
                Err(e) => {
                    self.pending.truncate(start);
                    return Err(e);
                }
            };
            self.pending.truncate(start + n);
            if n == 0 {
                self.eof = true;
            }
        }
        let deliverable = self.pending.len().saturating_sub(CHACHA_TAG_LEN);
        let n = deliverable.min(dst.len());
        dst[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Decrypting source: ciphertext is MACed and decrypted as it is pulled
/// through. The tag check happens separately against [`TaggedSource::tag`].
pub struct CipherSource<R: Read> {
    inner: R,
    cipher: Option<ChaChaStream>,
    /// Total ciphertext bytes pulled through the cipher.
    total: u64,
}

impl<R: Read> CipherSource<R> {
    pub fn new(inner: R, cipher: ChaChaStream) -> Self {
        CipherSource { inner, cipher: Some(cipher), total: 0 }
    }

    pub fn total_read(&self) -> u64 {
        self.total
    }

    pub fn into_parts(self) -> (R, Option<ChaChaStream>) {
        (self.inner, self.cipher)
    }

    /// Pull any remaining ciphertext through the cipher so the running MAC
    /// covers the whole payload; returns how many bytes were drained.
    pub fn drain(&mut self) -> Result<u64> {
        let mut buf = [0u8; 4096];
        let mut drained = 0u64;
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(drained);
            }
            drained += n as u64;
        }
    }
}

impl<R: Read> Read for CipherSource<R> {
    fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(dst)?;
        if n > 0 {
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.decrypt_update(&mut dst[..n]);
            }
            self.total += n as u64;
        }
        Ok(n)
    }
}

/// Encrypting consumer: plaintext is encrypted and MACed on the way to the
/// inner writer; `finish` hands back the writer and the cipher for the tag.
pub struct CipherConsumer<W: Write> {
    inner: W,
    cipher: ChaChaStream,
    buf: Vec<u8>,
}

impl<W: Write> CipherConsumer<W> {
    pub fn new(inner: W, cipher: ChaChaStream) -> Self {
        CipherConsumer { inner, cipher, buf: Vec::with_capacity(4096) }
    }

    pub fn finish(mut self) -> Result<(W, [u8; CHACHA_TAG_LEN])> {
        self.inner.flush()?;
        let tag = self.cipher.finalize_tag();
        Ok((self.inner, tag))
    }
}

impl<W: Write> Write for CipherConsumer<W> {
    fn write(&mut self, src: &[u8]) -> std::io::Result<usize> {
        self.buf.clear();
        self.buf.extend_from_slice(src);
        self.cipher.encrypt_update(&mut self.buf);
        self.inner.write_all(&self.buf)?;
        Ok(src.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Inflating source. Tracks whether the deflate stream ended and how much
/// compressed input it actually consumed, so the reader can flag trailing
/// garbage without failing.
pub struct ZSource<R: Read> {
    inner: ZlibDecoder<R>,
    eof: bool,
}

impl<R: Read> ZSource<R> {
    pub fn new(inner: R) -> Self {
        ZSource { inner: ZlibDecoder::new(inner), eof: false }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Compressed bytes consumed by the inflater.
    pub fn total_in(&self) -> u64 {
        self.inner.total_in()
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: Read> Read for ZSource<R> {
    fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(dst)?;
        if n == 0 && !dst.is_empty() {
            self.eof = true;
        }
        Ok(n)
    }
}

/// Deflating consumer.
pub struct ZConsumer<W: Write> {
    inner: ZlibEncoder<W>,
}

impl<W: Write> ZConsumer<W> {
    pub fn new(inner: W) -> Self {
        ZConsumer { inner: ZlibEncoder::new(inner, Compression::default()) }
    }

    pub fn finish(self) -> Result<W> {
        Ok(self.inner.finish()?)
    }
}

impl<W: Write> Write for ZConsumer<W> {
    fn write(&mut self, src: &[u8]) -> std::io::Result<usize> {
        self.inner.write(src)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
