//! DIGIDOC-XML 1.3 bundle: the multi-file wrapper CDoc1 embeds as its
//! payload. Only `EMBEDDED_BASE64` data files are produced or consumed.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};
use crate::io::MultiDataConsumer;

const DDOC_NS: &str = "http://www.sk.ee/DigiDoc/v1.3.0#";

/// Serialize files into a SignedDoc 1.3 document.
pub fn build(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut w = Writer::new(Vec::new());
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut root = BytesStart::new("SignedDoc");
    root.push_attribute(("format", "DIGIDOC-XML"));
    root.push_attribute(("version", "1.3"));
    root.push_attribute(("xmlns", DDOC_NS));
    w.write_event(Event::Start(root))?;
    for (i, (name, data)) in files.iter().enumerate() {
        let mut df = BytesStart::new("DataFile");
        df.push_attribute(("ContentType", "EMBEDDED_BASE64"));
        df.push_attribute(("Filename", name.as_str()));
        df.push_attribute(("Id", format!("D{i}").as_str()));
        df.push_attribute(("MimeType", "application/octet-stream"));
        df.push_attribute(("Size", data.len().to_string().as_str()));
        w.write_event(Event::Start(df))?;
        w.write_event(Event::Text(BytesText::new(&B64.encode(data))))?;
        w.write_event(Event::End(BytesEnd::new("DataFile")))?;
    }
    w.write_event(Event::End(BytesEnd::new("SignedDoc")))?;
    Ok(w.into_inner())
}

/// Parse a SignedDoc and push every data file to `consumer`.
pub fn parse(data: &[u8], consumer: &mut dyn MultiDataConsumer) -> Result<()> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut seen_root = false;
    let mut current: Option<(String, String)> = None; // (filename, base64 text)
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = e.local_name();
                if name.as_ref() == b"SignedDoc" {
                    seen_root = true;
                } else if name.as_ref() == b"DataFile" {
                    let mut filename = None;
                    for a in e.attributes() {
                        let a = a.map_err(|err| {
                            Error::format(format!("bad DDOC attribute: {err}"))
                        })?;
                        if a.key.local_name().as_ref() == b"Filename" {
                            filename = Some(
                                a.unescape_value()
                                    .map_err(Error::from)?
                                    .into_owned(),
                            );
                        }
                    }
                    let filename = filename
                        .ok_or_else(|| Error::format("DataFile without Filename"))?;
                    current = Some((filename, String::new()));
                }
            }
            Event::Text(t) => {
                if let Some((_, text)) = current.as_mut() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"DataFile" {
                    if let Some((filename, text)) = current.take() {
                        let compact: String =
                            text.chars().filter(|c| !c.is_whitespace()).collect();
                        let content = B64.decode(compact.as_bytes()).map_err(|_| {
                            Error::format("DataFile content is not valid base64")
                        })?;
                        consumer.open(&filename, content.len() as i64)?;
                        consumer.write_data(&content)?;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !seen_root {
        return Err(Error::format("not a DDOC document"));
    }
    consumer.close()?;
    Ok(())
}
