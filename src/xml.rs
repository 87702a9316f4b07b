//! The archive's XML document: one `<IMAGE>` element per image plus the
//! archive totals, stored UTF-16LE with a byte-order mark.
//!
//! The writer regenerates the document from the in-memory image list; the
//! parser recovers exactly what the writer put in (names and the opaque
//! per-image fragment), so an unchanged archive reproduces its document
//! byte for byte.

use std::io::Write;

use byteorder::{WriteBytesExt, LE};

use crate::io_utils::OutputFile;
use crate::records::ResourceEntry;
use crate::{Image, WimError, WimResult};

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn build_document(images: &[Image], total_bytes: u64) -> String {
    let mut doc = String::new();
    doc.push_str("<WIM>");
    doc.push_str(&format!("<TOTALBYTES>{total_bytes}</TOTALBYTES>"));
    for (i, image) in images.iter().enumerate() {
        doc.push_str(&format!("<IMAGE INDEX=\"{}\">", i + 1));
        doc.push_str(&format!("<NAME>{}</NAME>", escape(&image.name)));
        doc.push_str(&image.extra_xml);
        doc.push_str("</IMAGE>");
    }
    doc.push_str("</WIM>");
    doc
}

/// Writes the document at the current position and returns its entry.
/// `total_bytes` is the archive size up to the document itself.
pub(crate) fn write_xml<W: OutputFile>(
    out: &mut W,
    images: &[Image],
    total_bytes: u64,
) -> WimResult<ResourceEntry> {
    let offset = out.stream_position().map_err(WimError::Write)?;
    let doc = build_document(images, total_bytes);

    let mut bytes = Vec::with_capacity((doc.len() + 1) * 2);
    bytes.write_u16::<LE>(0xfeff).expect("vec write");
    for unit in doc.encode_utf16() {
        bytes.write_u16::<LE>(unit).expect("vec write");
    }
    out.write_all(&bytes).map_err(WimError::Write)?;

    let size = bytes.len() as u64;
    Ok(ResourceEntry {
        size_in_wim: size,
        flags: 0,
        offset,
        original_size: size,
    })
}

/// A parsed `<IMAGE>` element.
pub(crate) struct ParsedImage {
    pub name: String,
    pub extra_xml: String,
}

/// Decodes the document and recovers the per-image elements. Only the
/// structure this crate writes is understood; anything inside an image
/// element beyond its `<NAME>` is preserved opaquely.
pub(crate) fn parse_xml(bytes: &[u8]) -> WimResult<Vec<ParsedImage>> {
    if bytes.len() % 2 != 0 {
        return Err(WimError::InvalidParam("XML document has odd length"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let units = match units.first() {
        Some(&0xfeff) => &units[1..],
        _ => &units[..],
    };
    let doc = String::from_utf16(units)
        .map_err(|_| WimError::InvalidParam("XML document is not valid UTF-16"))?;

    let mut images = Vec::new();
    let mut rest = doc.as_str();
    while let Some(start) = rest.find("<IMAGE") {
        let body_start = match rest[start..].find('>') {
            Some(i) => start + i + 1,
            None => break,
        };
        let body_end = match rest[body_start..].find("</IMAGE>") {
            Some(i) => body_start + i,
            None => break,
        };
        let body = &rest[body_start..body_end];

        let (name, extra) = match (body.find("<NAME>"), body.find("</NAME>")) {
            (Some(ns), Some(ne)) if ns < ne => {
                let name = unescape(&body[ns + "<NAME>".len()..ne]);
                let mut extra = String::new();
                extra.push_str(&body[..ns]);
                extra.push_str(&body[ne + "</NAME>".len()..]);
                (name, extra)
            }
            _ => (String::new(), body.to_owned()),
        };
        images.push(ParsedImage {
            name,
            extra_xml: extra,
        });
        rest = &rest[body_end + "</IMAGE>".len()..];
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image(name: &str, extra: &str) -> Image {
        Image {
            name: name.to_owned(),
            stream: 0,
            extra_xml: extra.to_owned(),
        }
    }

    #[test]
    fn document_round_trips() {
        let images = vec![
            image("Base & <Layers>", ""),
            image("Second", "<DIRCOUNT>12</DIRCOUNT>"),
        ];
        let mut out = Cursor::new(Vec::new());
        let entry = write_xml(&mut out, &images, 4096).unwrap();
        let bytes = out.into_inner();
        assert_eq!(entry.size_in_wim as usize, bytes.len());

        let parsed = parse_xml(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "Base & <Layers>");
        assert_eq!(parsed[0].extra_xml, "");
        assert_eq!(parsed[1].name, "Second");
        assert_eq!(parsed[1].extra_xml, "<DIRCOUNT>12</DIRCOUNT>");
    }

    #[test]
    fn regeneration_is_byte_stable() {
        let images = vec![image("only", "<X>1</X>")];
        let mut first = Cursor::new(Vec::new());
        write_xml(&mut first, &images, 999).unwrap();

        let parsed = parse_xml(first.get_ref()).unwrap();
        let reparsed: Vec<Image> = parsed
            .into_iter()
            .map(|p| Image {
                name: p.name,
                stream: 0,
                extra_xml: p.extra_xml,
            })
            .collect();

        let mut second = Cursor::new(Vec::new());
        write_xml(&mut second, &reparsed, 999).unwrap();
        assert_eq!(first.into_inner(), second.into_inner());
    }

    #[test]
    fn empty_archive_has_no_images() {
        let mut out = Cursor::new(Vec::new());
        write_xml(&mut out, &[], 212).unwrap();
        let parsed = parse_xml(out.get_ref()).unwrap();
        assert!(parsed.is_empty());
    }
}
