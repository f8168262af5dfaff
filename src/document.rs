use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::{Error, Result};

/// Letter size, used when no page in the tree declares a MediaBox.
const DEFAULT_MEDIA_BOX: [f32; 4] = [0.0, 0.0, 612.0, 792.0];

/// How far a `%PDF-` header may be from the start of the file.
const HEADER_SEARCH_WINDOW: usize = 1024;

/// An unsigned (or already signed) PDF, parsed but never modified.
///
/// Signing always produces a new buffer, so the borrowed bytes stay valid
/// for any other holder.
pub struct SignableDocument<'a> {
    bytes: &'a [u8],
    doc: Document,
    pages: Vec<ObjectId>,
}

impl<'a> SignableDocument<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let doc = load_document(bytes)?;
        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if pages.is_empty() {
            return Err(Error::MalformedPdfStructure(
                "document has no pages".to_string(),
            ));
        }
        Ok(Self { bytes, doc, pages })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn last_page_index(&self) -> usize {
        self.pages.len() - 1
    }

    pub fn page_id(&self, page_index: usize) -> Result<ObjectId> {
        self.pages.get(page_index).copied().ok_or_else(|| {
            Error::MalformedPdfStructure(format!("page index {page_index} out of range"))
        })
    }

    /// The page's MediaBox as `[x0, y0, x1, y1]`, normalized so that
    /// `x0 <= x1` and `y0 <= y1`.
    pub fn media_box(&self, page_index: usize) -> Result<[f32; 4]> {
        let page = self.doc.get_dictionary(self.page_id(page_index)?)?;
        let Some(obj) = inherited(&self.doc, page, b"MediaBox") else {
            return Ok(DEFAULT_MEDIA_BOX);
        };
        let values = self
            .doc
            .dereference(obj)?
            .1
            .as_array()?
            .iter()
            .map(|v| self.doc.dereference(v).and_then(|(_, v)| v.as_float()))
            .collect::<lopdf::Result<Vec<f32>>>()?;
        let [x0, y0, x1, y1] = values[..] else {
            return Err(Error::MalformedPdfStructure(
                "MediaBox must have four numbers".to_string(),
            ));
        };
        Ok([x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)])
    }

    pub(crate) fn doc(&self) -> &Document {
        &self.doc
    }
}

/// Refuses anything that does not carry a `%PDF-` header near its start.
pub(crate) fn ensure_pdf_header(bytes: &[u8]) -> Result<()> {
    let window = &bytes[..bytes.len().min(HEADER_SEARCH_WINDOW)];
    if window.windows(5).any(|w| w == b"%PDF-") {
        Ok(())
    } else {
        Err(Error::UnsupportedDocumentFormat)
    }
}

pub(crate) fn load_document(bytes: &[u8]) -> Result<Document> {
    ensure_pdf_header(bytes)?;
    Ok(Document::load_mem(bytes)?)
}

/// Looks up a page attribute, walking up the page tree for the inheritable
/// ones (MediaBox, Resources, ...).
pub(crate) fn inherited<'d>(
    doc: &'d Document,
    page: &'d Dictionary,
    key: &[u8],
) -> Option<&'d Object> {
    let mut node = page;
    // Bounded walk, page trees with cycles exist in the wild.
    for _ in 0..64 {
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        node = node
            .get(b"Parent")
            .and_then(Object::as_reference)
            .and_then(|id| doc.get_dictionary(id))
            .ok()?;
    }
    None
}

/// Decodes a PDF text string, either UTF-16BE with a byte order mark or a
/// single byte encoding (read as Latin-1, which matches PDFDocEncoding for
/// printable characters).
pub(crate) fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}
