//! Appends a signature to a PDF as an incremental update.
//!
//! Signing happens in two steps. [`prepare_signature`] copies the original
//! bytes, appends the new and rewritten objects with a zero filled
//! `/Contents` placeholder and patches the final `/ByteRange`. The caller
//! signs [`PreparedSignature::digest`], and [`PreparedSignature::finalize`]
//! writes the CMS blob into the placeholder. The length of the buffer never
//! changes after preparation, so the byte range stays correct.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::ops::Range;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::debug;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use regex::bytes::Regex;
use sha2::{Digest, Sha256};

use crate::appearance::{self, SignatureImage, FONT_RESOURCE, IMAGE_RESOURCE};
use crate::document::{decode_text_string, SignableDocument};
use crate::placement::Placement;
use crate::serialize;
use crate::{Error, Result};

/// Bytes reserved for the CMS blob when the caller does not say otherwise.
/// Enough for a SHA-256 RSA-4096 signature with a chain of a few
/// certificates.
pub const DEFAULT_PLACEHOLDER_SIZE: usize = 16384;

/// Written in place of the `/ByteRange` array until the final offsets are
/// known. Ten digits per offset cover any file below 10 GB.
const BYTE_RANGE_SLOT: &[u8] = b"[0 0000000000 0000000000 0000000000]";

lazy_static! {
    static ref STARTXREF: Regex = Regex::new(r"startxref\s+(\d+)\s+%%EOF").unwrap();
}

/// Everything shown or recorded about the signer, besides the CMS blob.
#[derive(Debug, Clone)]
pub struct SignatureAppearance<'a> {
    pub signer_name: &'a str,
    pub reason: &'a str,
    pub location: &'a str,
    pub signing_time: DateTime<Utc>,
    pub image: Option<&'a SignatureImage>,
    /// Bytes reserved for the CMS blob; the placeholder is twice as many hex
    /// digits.
    pub placeholder_size: usize,
}

/// Where the signature placeholder sits in the prepared buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderOffsets {
    /// The `<00...00>` hex string, delimiters included.
    pub contents: Range<usize>,
    /// The value written to `/ByteRange`.
    pub byte_range: [usize; 4],
}

/// A document with a signature placeholder, waiting for its CMS blob.
///
/// Consumed by [`finalize`](Self::finalize), so a placeholder can only be
/// filled once.
#[derive(Debug)]
pub struct PreparedSignature {
    buffer: Vec<u8>,
    offsets: PlaceholderOffsets,
    field_name: String,
}

impl PreparedSignature {
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn offsets(&self) -> &PlaceholderOffsets {
        &self.offsets
    }

    /// The field name actually used, which may have a counter appended.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// How many bytes of CMS the placeholder can take.
    pub fn reserved_size(&self) -> usize {
        (self.offsets.contents.len() - 2) / 2
    }

    /// The two byte ranges covered by the signature.
    pub fn signed_ranges(&self) -> [&[u8]; 2] {
        let [start, first_len, second_start, second_len] = self.offsets.byte_range;
        [
            &self.buffer[start..start + first_len],
            &self.buffer[second_start..second_start + second_len],
        ]
    }

    /// SHA-256 over the signed ranges, which is what the CMS signs.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for range in self.signed_ranges() {
            hasher.update(range);
        }
        hasher.finalize().into()
    }

    /// Writes the DER encoded CMS blob into the placeholder.
    pub fn finalize(mut self, cms: &[u8]) -> Result<Vec<u8>> {
        let reserved = self.reserved_size();
        if cms.len() > reserved {
            return Err(Error::SignatureTooLarge {
                needed: cms.len(),
                reserved,
            });
        }

        let Range { start, end } = self.offsets.contents;
        let [_, _, second_start, second_len] = self.offsets.byte_range;
        if self.buffer.get(start) != Some(&b'<')
            || self.buffer.get(end - 1) != Some(&b'>')
            || second_start + second_len != self.buffer.len()
        {
            return Err(Error::ByteRangeMismatch);
        }

        let prepared_len = self.buffer.len();
        let mut hex = Vec::with_capacity(cms.len() * 2);
        for byte in cms {
            write!(hex, "{byte:02X}")?;
        }
        // The rest of the placeholder stays zero.
        self.buffer[start + 1..start + 1 + hex.len()].copy_from_slice(&hex);

        if self.buffer.len() != prepared_len {
            return Err(Error::ByteRangeMismatch);
        }
        Ok(self.buffer)
    }
}

/// Builds the incremental update carrying a signature field on the page
/// chosen by `placement`.
///
/// `field_name` is made unique among the document's fields by appending
/// `_2`, `_3`, ... when taken.
pub fn prepare_signature(
    document: &SignableDocument,
    placement: &Placement,
    field_name: &str,
    appearance: &SignatureAppearance,
) -> Result<PreparedSignature> {
    let doc = document.doc();
    if doc.trailer.has(b"Encrypt") {
        return Err(Error::UnsupportedDocumentFormat);
    }

    let original = document.bytes();
    let prev_xref = previous_xref_offset(original)?;
    let catalog_id = doc.trailer.get(b"Root")?.as_reference()?;
    let mut catalog = doc.get_dictionary(catalog_id)?.clone();
    let page_id = document.page_id(placement.page_index)?;
    let mut page = doc.get_dictionary(page_id)?.clone();

    let old_size = doc
        .trailer
        .get(b"Size")
        .and_then(Object::as_i64)
        .map_or(0, |size| u32::try_from(size).unwrap_or(0));
    let mut ids = IdAllocator {
        next: doc.max_id.max(old_size.saturating_sub(1)) + 1,
    };

    // An inline AcroForm moves into its own object, which means the catalog
    // changes too.
    let (acro_form_id, mut acro_form, rewrite_catalog) = match catalog.get(b"AcroForm") {
        Ok(Object::Reference(id)) => (*id, doc.get_dictionary(*id)?.clone(), false),
        Ok(Object::Dictionary(inline)) => (ids.next(), inline.clone(), true),
        _ => (ids.next(), Dictionary::new(), true),
    };

    let mut fields = resolve_array(doc, acro_form.get(b"Fields").ok())?;
    let field_name = unique_field_name(doc, &fields, field_name);

    let sig_id = ids.next();
    let widget_id = ids.next();
    let ap_id = ids.next();
    let font_id = ids.next();
    let image_ids = appearance.image.map(|image| {
        let mask_id = image.has_alpha().then(|| ids.next());
        (ids.next(), mask_id)
    });

    fields.push(Object::Reference(widget_id));
    acro_form.set("Fields", fields);
    acro_form.set("SigFlags", 3);

    let mut annots = resolve_array(doc, page.get(b"Annots").ok())?;
    annots.push(Object::Reference(widget_id));
    page.set("Annots", annots);

    let rect = placement.rect();
    let widget = dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Sig",
        "T" => serialize::text_string(&field_name),
        "V" => sig_id,
        "Rect" => rect.iter().map(|&v| Object::Real(v)).collect::<Vec<_>>(),
        "F" => 4,
        "P" => page_id,
        "AP" => dictionary! { "N" => ap_id },
    };

    let lines = appearance::description_lines(
        appearance.signer_name,
        appearance.signing_time,
        appearance.reason,
        appearance.location,
    );
    let content = appearance::appearance_content(
        placement.width,
        placement.height,
        &lines,
        appearance.image,
    )?;
    let mut xobjects = Dictionary::new();
    if let Some((image_id, _)) = image_ids {
        xobjects.set(IMAGE_RESOURCE, image_id);
    }
    let ap_stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![0.into(), 0.into(), placement.width.into(), placement.height.into()],
            "Resources" => dictionary! {
                "Font" => dictionary! { FONT_RESOURCE => font_id },
                "XObject" => xobjects,
            },
        },
        content,
    );

    let mut buffer = Vec::with_capacity(original.len() + 2 * appearance.placeholder_size + 8192);
    buffer.extend_from_slice(original);
    if !matches!(original.last(), Some(b'\n' | b'\r')) {
        buffer.push(b'\n');
    }

    let mut xref = BTreeMap::new();

    // The signature dictionary is written by hand, to know where its
    // placeholders are.
    xref.insert(sig_id.0, (sig_id.1, buffer.len()));
    write!(
        buffer,
        "{} {} obj\n<</Type /Sig/Filter /Adobe.PPKLite/SubFilter /adbe.pkcs7.detached/ByteRange ",
        sig_id.0, sig_id.1
    )?;
    let byte_range_at = buffer.len();
    buffer.extend_from_slice(BYTE_RANGE_SLOT);
    buffer.extend_from_slice(b"/Contents ");
    let contents_start = buffer.len();
    buffer.push(b'<');
    buffer.resize(buffer.len() + 2 * appearance.placeholder_size, b'0');
    buffer.push(b'>');
    let contents_end = buffer.len();
    serialize::write_entries(&mut buffer, &signature_entries(appearance))?;
    buffer.extend_from_slice(b">>\nendobj\n");

    let mut objects: Vec<(ObjectId, Object)> = vec![
        (widget_id, Object::Dictionary(widget)),
        (ap_id, Object::Stream(ap_stream)),
        (font_id, Object::Dictionary(appearance::font_dictionary())),
    ];
    if let (Some(image), Some((image_id, mask_id))) = (appearance.image, image_ids) {
        let (mut image_stream, mask) = image.to_xobjects()?;
        if let (Some(mask), Some(mask_id)) = (mask, mask_id) {
            image_stream.dict.set("SMask", mask_id);
            objects.push((mask_id, Object::Stream(mask)));
        }
        objects.push((image_id, Object::Stream(image_stream)));
    }
    objects.push((page_id, Object::Dictionary(page)));
    objects.push((acro_form_id, Object::Dictionary(acro_form)));
    if rewrite_catalog {
        catalog.set("AcroForm", acro_form_id);
        objects.push((catalog_id, Object::Dictionary(catalog)));
    }

    for (id, object) in &objects {
        xref.insert(id.0, (id.1, buffer.len()));
        serialize::write_indirect(&mut buffer, *id, object)?;
    }

    let xref_offset = buffer.len();
    write_xref(&mut buffer, &xref)?;

    let mut trailer = dictionary! {
        "Size" => i64::from(ids.next.max(old_size)),
        "Root" => catalog_id,
        "Prev" => prev_xref as i64,
    };
    for key in [&b"Info"[..], &b"ID"[..]] {
        if let Ok(value) = doc.trailer.get(key) {
            trailer.set(key.to_vec(), value.clone());
        }
    }
    buffer.extend_from_slice(b"trailer\n");
    serialize::write_dictionary(&mut buffer, &trailer)?;
    write!(buffer, "\nstartxref\n{xref_offset}\n%%EOF\n")?;

    let byte_range = [
        0,
        contents_start,
        contents_end,
        buffer.len() - contents_end,
    ];
    let slot = byte_range_at..byte_range_at + BYTE_RANGE_SLOT.len();
    patch_byte_range(&mut buffer[slot], &byte_range)?;

    debug!(
        "prepared field {field_name:?}: contents at {contents_start}..{contents_end}, \
         byte range {byte_range:?}"
    );
    Ok(PreparedSignature {
        buffer,
        offsets: PlaceholderOffsets {
            contents: contents_start..contents_end,
            byte_range,
        },
        field_name,
    })
}

struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    fn next(&mut self) -> ObjectId {
        let id = (self.next, 0);
        self.next += 1;
        id
    }
}

/// `/Reason`, `/Location`, `/M` and `/Name` of the signature dictionary.
fn signature_entries(appearance: &SignatureAppearance) -> Dictionary {
    let mut entries = Dictionary::new();
    if !appearance.reason.is_empty() {
        entries.set("Reason", serialize::text_string(appearance.reason));
    }
    if !appearance.location.is_empty() {
        entries.set("Location", serialize::text_string(appearance.location));
    }
    entries.set(
        "M",
        Object::string_literal(
            appearance
                .signing_time
                .format("D:%Y%m%d%H%M%S+00'00'")
                .to_string(),
        ),
    );
    entries.set("Name", serialize::text_string(appearance.signer_name));
    entries
}

/// Offset of the last cross-reference section of the original file.
pub(crate) fn previous_xref_offset(bytes: &[u8]) -> Result<usize> {
    STARTXREF
        .captures_iter(bytes)
        .last()
        .and_then(|caps| std::str::from_utf8(&caps[1]).ok()?.parse().ok())
        .ok_or_else(|| Error::MalformedPdfStructure("no startxref marker found".to_string()))
}

/// Array value of a dictionary entry, with a reference to an array resolved.
fn resolve_array(doc: &Document, value: Option<&Object>) -> Result<Vec<Object>> {
    match value {
        None => Ok(Vec::new()),
        Some(value) => Ok(doc.dereference(value)?.1.as_array()?.clone()),
    }
}

fn unique_field_name(doc: &Document, fields: &[Object], wanted: &str) -> String {
    let taken: HashSet<String> = fields
        .iter()
        .filter_map(|field| doc.dereference(field).ok()?.1.as_dict().ok())
        .filter_map(|field| field.get(b"T").and_then(Object::as_str).ok())
        .map(decode_text_string)
        .collect();

    if !taken.contains(wanted) {
        return wanted.to_string();
    }
    (2..)
        .map(|n| format!("{wanted}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| wanted.to_string())
}

/// Classic cross-reference section, one subsection per run of consecutive
/// object numbers.
pub(crate) fn write_xref(
    buffer: &mut Vec<u8>,
    entries: &BTreeMap<u32, (u16, usize)>,
) -> Result<()> {
    buffer.extend_from_slice(b"xref\n0 1\n0000000000 65535 f \n");

    let mut run: Vec<(u32, u16, usize)> = Vec::new();
    for (&id, &(generation, offset)) in entries {
        if let Some(&(last, _, _)) = run.last() {
            if last + 1 != id {
                write_subsection(buffer, &run)?;
                run.clear();
            }
        }
        run.push((id, generation, offset));
    }
    if !run.is_empty() {
        write_subsection(buffer, &run)?;
    }
    Ok(())
}

fn write_subsection(buffer: &mut Vec<u8>, run: &[(u32, u16, usize)]) -> Result<()> {
    writeln!(buffer, "{} {}", run[0].0, run.len())?;
    for &(_, generation, offset) in run {
        // Entries are exactly 20 bytes, end of line included.
        write!(buffer, "{offset:010} {generation:05} n \n")?;
    }
    Ok(())
}

/// Writes the offsets into the fixed-width slot, padding with spaces
/// before the closing bracket.
fn patch_byte_range(slot: &mut [u8], byte_range: &[usize; 4]) -> Result<()> {
    let value = format!(
        "[{} {} {} {}",
        byte_range[0], byte_range[1], byte_range[2], byte_range[3]
    );
    if value.len() + 1 > slot.len() {
        return Err(Error::MalformedPdfStructure(
            "document too large for the byte range slot".to_string(),
        ));
    }
    slot.fill(b' ');
    slot[..value.len()].copy_from_slice(value.as_bytes());
    if let Some(last) = slot.last_mut() {
        *last = b']';
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement;
    use crate::test_support::{build_pdf, PageSpec};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn appearance(placeholder_size: usize) -> SignatureAppearance<'static> {
        SignatureAppearance {
            signer_name: "Jane Doe",
            reason: "Approved",
            location: "Sarajevo",
            signing_time: Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
            image: None,
            placeholder_size,
        }
    }

    fn prepare(pdf: &[u8], field_name: &str, placeholder_size: usize) -> PreparedSignature {
        let document = SignableDocument::parse(pdf).unwrap();
        let placement = placement::locate(&document).unwrap();
        prepare_signature(&document, &placement, field_name, &appearance(placeholder_size))
            .unwrap()
    }

    #[test]
    fn update_is_appended_after_the_original() {
        let pdf = build_pdf(&[PageSpec::text(&[("Invoice #42", 72.0, 700.0)])]);
        let prepared = prepare(&pdf, "digital_signature", 64);

        assert!(prepared.buffer().starts_with(&pdf));
        assert!(prepared.buffer().ends_with(b"%%EOF\n"));

        let offsets = prepared.offsets();
        let len = prepared.buffer().len();
        assert_eq!(offsets.contents.len(), 2 * 64 + 2);
        assert_eq!(
            offsets.byte_range,
            [0, offsets.contents.start, offsets.contents.end, len - offsets.contents.end]
        );
        assert_eq!(prepared.reserved_size(), 64);
    }

    #[test]
    fn prepared_document_parses_with_the_new_field() {
        let pdf = build_pdf(&[PageSpec::text(&[("Invoice #42", 72.0, 700.0)])]);
        let prepared = prepare(&pdf, "digital_signature", 64);

        let doc = Document::load_mem(prepared.buffer()).unwrap();
        let acro_form = doc
            .get_dict_in_dict(doc.catalog().unwrap(), b"AcroForm")
            .unwrap();
        assert_eq!(acro_form.get(b"SigFlags").unwrap().as_i64().unwrap(), 3);
        let fields = acro_form.get(b"Fields").unwrap().as_array().unwrap();
        assert_eq!(fields.len(), 1);

        let widget = doc.get_dictionary(fields[0].as_reference().unwrap()).unwrap();
        assert_eq!(widget.get(b"T").unwrap().as_str().unwrap(), b"digital_signature");
        let sig = doc.get_dictionary(widget.get(b"V").unwrap().as_reference().unwrap()).unwrap();
        assert_eq!(sig.get(b"Location").unwrap().as_str().unwrap(), b"Sarajevo");
        assert_eq!(sig.get(b"M").unwrap().as_str().unwrap(), b"D:20240501083000+00'00'");

        let byte_range: Vec<i64> = sig
            .get(b"ByteRange")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        let expected: Vec<i64> = prepared.offsets().byte_range.iter().map(|&v| v as i64).collect();
        assert_eq!(byte_range, expected);

        let page_id = *doc.get_pages().values().last().unwrap();
        let annots = doc.get_dictionary(page_id).unwrap().get(b"Annots").unwrap();
        assert_eq!(annots.as_array().unwrap().len(), 1);
    }

    #[test]
    fn digest_skips_the_placeholder() {
        let pdf = build_pdf(&[PageSpec::empty()]);
        let prepared = prepare(&pdf, "digital_signature", 32);

        let Range { start, end } = prepared.offsets().contents.clone();
        let mut covered = prepared.buffer()[..start].to_vec();
        covered.extend_from_slice(&prepared.buffer()[end..]);
        let expected: [u8; 32] = Sha256::digest(&covered).into();
        assert_eq!(prepared.digest(), expected);
    }

    #[test]
    fn finalize_fills_the_placeholder_in_place() {
        let pdf = build_pdf(&[PageSpec::empty()]);
        let prepared = prepare(&pdf, "digital_signature", 8);
        let contents = prepared.offsets().contents.clone();
        let len = prepared.buffer().len();

        let signed = prepared.finalize(&[0xAB, 0x01]).unwrap();
        assert_eq!(signed.len(), len);
        assert_eq!(&signed[contents], b"<AB01000000000000>");
    }

    #[test]
    fn finalize_rejects_oversized_blob() {
        let pdf = build_pdf(&[PageSpec::empty()]);
        let prepared = prepare(&pdf, "digital_signature", 4);

        match prepared.finalize(&[1, 2, 3, 4, 5]).unwrap_err() {
            Error::SignatureTooLarge { needed, reserved } => assert_eq!((needed, reserved), (5, 4)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn second_signature_gets_a_unique_field_name() {
        let pdf = build_pdf(&[PageSpec::text(&[("Contract", 72.0, 700.0)])]);
        let first = prepare(&pdf, "digital_signature", 16)
            .finalize(&[0x30, 0x00])
            .unwrap();
        let second = prepare(&first, "digital_signature", 16);

        assert_eq!(second.field_name(), "digital_signature_2");
        assert!(second.buffer().starts_with(&first));

        let doc = Document::load_mem(second.buffer()).unwrap();
        let acro_form = doc
            .get_dict_in_dict(doc.catalog().unwrap(), b"AcroForm")
            .unwrap();
        assert_eq!(acro_form.get(b"Fields").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn byte_range_slot_is_padded() {
        let mut slot = BYTE_RANGE_SLOT.to_vec();
        patch_byte_range(&mut slot, &[0, 1200, 34000, 5678]).unwrap();
        assert_eq!(slot.as_slice(), b"[0 1200 34000 5678                 ]".as_slice());
        assert_eq!(slot.len(), BYTE_RANGE_SLOT.len());
    }

    #[test]
    fn xref_subsections_follow_runs() {
        let mut entries = BTreeMap::new();
        entries.insert(3, (0, 100));
        entries.insert(9, (0, 200));
        entries.insert(10, (1, 300));
        let mut buffer = Vec::new();
        write_xref(&mut buffer, &entries).unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "xref\n0 1\n0000000000 65535 f \n\
             3 1\n0000000100 00000 n \n\
             9 2\n0000000200 00000 n \n0000000300 00001 n \n"
        );
    }
}
