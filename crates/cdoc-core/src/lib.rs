//! Readers and writers for the CDoc encrypted container formats.
//!
//! Two on-disk formats coexist: CDoc1, the legacy XML-Enc document, and
//! CDoc2, a binary container with a FlatBuffer header and a streamed
//! ChaCha20-Poly1305 payload. Both wrap one random file master key (FMK)
//! independently per recipient "lock" (certificate, raw public key,
//! password, pre-shared key, or a key-server reference), so any single
//! recipient can open the container.
//!
//! Private keys and network transports stay behind the
//! [`backend::CryptoBackend`] and [`backend::NetworkBackend`] traits; the
//! core is single-threaded and drives everything from the caller's thread.
//!
//! ```no_run
//! use cdoc_core::{create_writer, open_reader, CdocWriter, Recipient, SoftKeyBackend};
//!
//! # fn run() -> cdoc_core::Result<()> {
//! let backend = SoftKeyBackend::new().with_secret("backup", &[7u8; 32]);
//! let mut writer = create_writer(2, "notes.cdoc", &backend, None)?;
//! writer.begin_encryption()?;
//! writer.add_recipient(&Recipient::make_symmetric("backup"))?;
//! writer.add_file("notes.txt", 5)?;
//! writer.write_data(b"hello")?;
//! writer.finish_encryption()?;
//!
//! let mut reader = open_reader("notes.cdoc", &backend, None)?;
//! let lock = reader.locks()[0].clone();
//! let fmk = reader.get_fmk(&lock)?;
//! let mut out = cdoc_core::FileListConsumer::new(".");
//! reader.decrypt(&fmk, &mut out)?;
//! # Ok(()) }
//! ```

pub mod backend;
pub mod cdoc1;
pub mod cdoc2;
pub mod certificate;
pub mod crypto;
pub mod derivation;
pub mod error;
pub mod io;
pub mod lock;
pub mod stream;
pub mod tar;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub use backend::{CryptoBackend, HashAlgorithm, NetworkBackend, SoftKeyBackend};
pub use cdoc1::{Cdoc1FileWriter, Cdoc1Reader, Cdoc1Writer, EncryptionMethod};
pub use cdoc2::{Cdoc2FileWriter, Cdoc2Reader, Cdoc2Writer};
pub use derivation::Fmk;
pub use error::{Error, ErrorCode, Result};
pub use io::{
    FileInfo, FileListConsumer, FileListSource, MultiDataConsumer, MultiDataSource,
    VecConsumer, VecSource,
};
pub use lock::{Lock, LockKind, Recipient};

/// Decryption side of a container, independent of the on-disk format.
///
/// Locks are reported in header order and matched in header order; a label
/// is a producer-side convention, never a lookup key. CDoc1 implements only
/// the push path and answers `NotImplemented` on the pull entry points.
pub trait CdocReader {
    fn version(&self) -> u32;

    fn locks(&self) -> &[Lock];

    /// First lock (in header order) addressed to the holder of `cert_der`.
    fn lock_for_cert(&self, cert_der: &[u8]) -> Option<&Lock>;

    /// Recover the FMK through the given lock. For CDoc2 the header HMAC is
    /// re-verified under the candidate key and a mismatch is fatal.
    fn get_fmk(&mut self, lock: &Lock) -> Result<Fmk>;

    /// Push decryption: every file is delivered to `consumer`.
    fn decrypt(&mut self, fmk: &[u8], consumer: &mut dyn MultiDataConsumer) -> Result<()>;

    fn begin_decryption(&mut self, fmk: &[u8]) -> Result<()>;

    /// Advance to the next file; `None` at the end of the payload.
    fn next_file(&mut self) -> Result<Option<FileInfo>>;

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Verify the payload authentication tag and release the source.
    fn finish_decryption(&mut self) -> Result<()>;
}

/// Encryption side of a container.
pub trait CdocWriter {
    fn begin_encryption(&mut self) -> Result<()>;

    /// Wrap the FMK for one more recipient. Must precede the first
    /// `add_file`.
    fn add_recipient(&mut self, recipient: &Recipient) -> Result<()>;

    fn add_file(&mut self, name: &str, size: i64) -> Result<()>;

    fn write_data(&mut self, data: &[u8]) -> Result<usize>;

    fn finish_encryption(&mut self) -> Result<()>;

    /// Drive the push sequence over a whole multi-file source.
    fn encrypt(
        &mut self,
        src: &mut dyn MultiDataSource,
        recipients: &[Recipient],
    ) -> Result<()> {
        self.begin_encryption()?;
        for r in recipients {
            self.add_recipient(r)?;
        }
        let mut buf = [0u8; 8192];
        while let Some(info) = src.next()? {
            self.add_file(&info.name, info.size)?;
            loop {
                let n = src.read_data(&mut buf)?;
                if n == 0 {
                    break;
                }
                self.write_data(&buf[..n])?;
            }
        }
        self.finish_encryption()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Cdoc1,
    Cdoc2,
}

/// Decide the container format from the first bytes of a file.
///
/// `"CDOC" 0x02` selects CDoc2; anything that opens like an XML document
/// (`<?xml`, an `EncryptedData` root, BOM and leading whitespace allowed)
/// selects CDoc1. Everything else is `UnknownFormat` — never a crypto
/// error.
pub fn detect_format(head: &[u8]) -> Result<Format> {
    if head.len() >= 5 && &head[..4] == b"CDOC" && head[4] == 0x02 {
        return Ok(Format::Cdoc2);
    }
    let mut rest = head;
    if rest.starts_with(&[0xef, 0xbb, 0xbf]) {
        rest = &rest[3..];
    }
    while let Some((first, tail)) = rest.split_first() {
        if first.is_ascii_whitespace() {
            rest = tail;
        } else {
            break;
        }
    }
    if rest.starts_with(b"<?xml") {
        return Ok(Format::Cdoc1);
    }
    if rest.first() == Some(&b'<') {
        let name: Vec<u8> = rest[1..]
            .iter()
            .copied()
            .take_while(|b| !b.is_ascii_whitespace() && *b != b'>' && *b != b'/')
            .collect();
        if name == b"EncryptedData" || name.ends_with(b":EncryptedData") {
            return Ok(Format::Cdoc1);
        }
    }
    Err(Error::UnknownFormat)
}

/// Open a reader over any seekable source.
pub fn open_reader_source<'a, R>(
    mut src: R,
    crypto: &'a dyn CryptoBackend,
    network: Option<&'a dyn NetworkBackend>,
) -> Result<Box<dyn CdocReader + 'a>>
where
    R: Read + Seek + 'a,
{
    let mut head = [0u8; 64];
    let mut filled = 0;
    while filled < head.len() {
        let n = src.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let format = detect_format(&head[..filled])?;
    src.seek(SeekFrom::Start(0))?;
    match format {
        Format::Cdoc2 => Ok(Box::new(Cdoc2Reader::new(src, crypto, network)?)),
        Format::Cdoc1 => Ok(Box::new(Cdoc1Reader::new(src, crypto)?)),
    }
}

/// Open a reader over a container file.
pub fn open_reader<'a>(
    path: impl AsRef<Path>,
    crypto: &'a dyn CryptoBackend,
    network: Option<&'a dyn NetworkBackend>,
) -> Result<Box<dyn CdocReader + 'a>> {
    open_reader_source(File::open(path)?, crypto, network)
}

/// Create a file-backed writer for the requested container version. Output
/// goes to a temp file next to `path` and is renamed into place on finish;
/// dropping the writer earlier removes the temp file.
pub fn create_writer<'a>(
    version: u32,
    path: impl AsRef<Path>,
    crypto: &'a dyn CryptoBackend,
    network: Option<&'a dyn NetworkBackend>,
) -> Result<Box<dyn CdocWriter + 'a>> {
    match version {
        1 => Ok(Box::new(Cdoc1FileWriter::create(path)?)),
        2 => Ok(Box::new(Cdoc2FileWriter::create(path, crypto, network)?)),
        v => Err(Error::invalid(format!("unknown container version {v}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection() {
        assert_eq!(detect_format(b"CDOC\x02\x00rest").unwrap(), Format::Cdoc2);
        assert_eq!(
            detect_format(b"<?xml version=\"1.0\"?><x/>").unwrap(),
            Format::Cdoc1
        );
        assert_eq!(
            detect_format(b"<denc:EncryptedData xmlns:denc=\"x\">").unwrap(),
            Format::Cdoc1
        );
        assert_eq!(detect_format(b"  <EncryptedData>").unwrap(), Format::Cdoc1);
        assert!(matches!(
            detect_format(b"CDOC\x01rest"),
            Err(Error::UnknownFormat)
        ));
        assert!(matches!(detect_format(b"PK\x03\x04"), Err(Error::UnknownFormat)));
        assert!(matches!(detect_format(b""), Err(Error::UnknownFormat)));
        assert!(matches!(detect_format(b"<zip>"), Err(Error::UnknownFormat)));
    }
}
