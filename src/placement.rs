//! Chooses where the visible signature goes on the last page.
//!
//! The last page's content stream is interpreted just enough to know where
//! text and images end up: a graphics state stack for the CTM and the text
//! matrices of `BT`/`ET` blocks. No font program is loaded, glyphs are
//! estimated at half an em wide. The box is put right-aligned with the
//! rightmost content, below the lowest content.

use lazy_static::lazy_static;
use log::debug;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};
use regex::Regex;
use serde::Serialize;

use crate::document::{inherited, SignableDocument};
use crate::{Error, Result};

pub const DEFAULT_WIDTH: f32 = 150.0;
pub const DEFAULT_HEIGHT: f32 = 50.0;

/// Space left between the lowest content and the top of the box.
const GAP: f32 = 10.0;
/// Coordinate used for whatever extent the scan did not see.
const FALLBACK_COORDINATE: f32 = 100.0;
const GLYPH_WIDTH: f32 = 0.5;
const DESCENT: f32 = -0.2;
const ASCENT: f32 = 0.8;
/// Form XObjects nested deeper than this are not looked into.
const MAX_FORM_DEPTH: usize = 8;

lazy_static! {
    static ref PAGE_NUMBER: Regex = Regex::new(r"^\d+(/\d+)?$").unwrap();
}

/// Where the signature widget goes, in default user space of the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Placement {
    pub page_index: usize,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Placement {
    /// `[llx, lly, urx, ury]`, as used by an annotation's `/Rect`.
    pub fn rect(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }
}

/// Places a box of the default size on the last page.
pub fn locate(document: &SignableDocument) -> Result<Placement> {
    locate_with_size(document, DEFAULT_WIDTH, DEFAULT_HEIGHT)
}

pub fn locate_with_size(
    document: &SignableDocument,
    width: f32,
    height: f32,
) -> Result<Placement> {
    let page_index = document.last_page_index();
    let page_id = document.page_id(page_index)?;
    let [x0, y0, x1, y1] = document.media_box(page_index)?;

    let (min_y, max_x) = match scan_page(document.doc(), page_id) {
        Ok(extent) => (
            extent.min_y.unwrap_or(FALLBACK_COORDINATE),
            extent.max_x.unwrap_or(FALLBACK_COORDINATE),
        ),
        Err(Error::PlacementNotFound) => {
            debug!("no content found on page {page_index}, using fallback position");
            (FALLBACK_COORDINATE, FALLBACK_COORDINATE)
        }
        Err(e) => return Err(e),
    };

    let width = width.min(x1 - x0);
    let height = height.min(y1 - y0);
    let x = (max_x - width).clamp(x0, x1 - width);
    let y = (min_y - (height + GAP)).clamp(y0, y1 - height);

    let placement = Placement {
        page_index,
        x,
        y,
        width,
        height,
    };
    debug!("content extent min_y={min_y} max_x={max_x}, placing signature at {placement:?}");
    Ok(placement)
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Extent {
    min_y: Option<f32>,
    max_x: Option<f32>,
}

impl Extent {
    fn add_point(&mut self, x: f32, y: f32) {
        self.min_y = Some(self.min_y.map_or(y, |v| v.min(y)));
        self.max_x = Some(self.max_x.map_or(x, |v| v.max(x)));
    }
}

/// Collects the extent of the page content. `PlacementNotFound` when the page
/// shows nothing that counts.
fn scan_page(doc: &Document, page_id: ObjectId) -> Result<Extent> {
    let page = doc.get_dictionary(page_id)?;
    let resources = inherited(doc, page, b"Resources").and_then(|r| as_dict(doc, r));

    let content = match doc
        .get_page_content(page_id)
        .and_then(|bytes| Content::decode(&bytes))
    {
        Ok(content) => content,
        Err(e) => {
            debug!("page content can not be decoded: {e}");
            return Err(Error::PlacementNotFound);
        }
    };

    let mut scanner = Scanner {
        doc,
        extent: Extent::default(),
    };
    scanner.run(&content.operations, resources, Matrix::IDENTITY, 0);

    match scanner.extent {
        Extent {
            min_y: None,
            max_x: None,
        } => Err(Error::PlacementNotFound),
        extent => Ok(extent),
    }
}

fn as_dict<'d>(doc: &'d Document, obj: &'d Object) -> Option<&'d Dictionary> {
    doc.dereference(obj).ok()?.1.as_dict().ok()
}

/// Affine transform `[a b c d e f]`, applied to row vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    fn translate(tx: f32, ty: f32) -> Self {
        Matrix {
            e: tx,
            f: ty,
            ..Self::IDENTITY
        }
    }

    fn from_operands(operands: &[Object]) -> Option<Self> {
        let [a, b, c, d, e, f] = numbers::<6>(operands)?;
        Some(Matrix { a, b, c, d, e, f })
    }

    /// `self` applied first, then `other`.
    fn then(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }
}

fn numbers<const N: usize>(operands: &[Object]) -> Option<[f32; N]> {
    if operands.len() < N {
        return None;
    }
    let mut values = [0.0; N];
    for (value, operand) in values.iter_mut().zip(&operands[operands.len() - N..]) {
        *value = operand.as_float().ok()?;
    }
    Some(values)
}

#[derive(Debug, Clone, Copy)]
struct TextState {
    font_size: f32,
    leading: f32,
    matrix: Matrix,
    line_matrix: Matrix,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            font_size: 0.0,
            leading: 0.0,
            matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
        }
    }
}

impl TextState {
    fn next_line(&mut self, tx: f32, ty: f32) {
        self.line_matrix = Matrix::translate(tx, ty).then(&self.line_matrix);
        self.matrix = self.line_matrix;
    }

    fn advance(&mut self, tx: f32) {
        self.matrix = Matrix::translate(tx, 0.0).then(&self.matrix);
    }
}

struct Scanner<'d> {
    doc: &'d Document,
    extent: Extent,
}

impl<'d> Scanner<'d> {
    fn run(
        &mut self,
        operations: &[Operation],
        resources: Option<&'d Dictionary>,
        base: Matrix,
        depth: usize,
    ) {
        let mut ctm = base;
        let mut stack = Vec::new();
        let mut text = TextState::default();

        for op in operations {
            let operands = op.operands.as_slice();
            match op.operator.as_str() {
                "q" => stack.push(ctm),
                "Q" => ctm = stack.pop().unwrap_or(base),
                "cm" => {
                    if let Some(m) = Matrix::from_operands(operands) {
                        ctm = m.then(&ctm);
                    }
                }
                "BT" => {
                    text.matrix = Matrix::IDENTITY;
                    text.line_matrix = Matrix::IDENTITY;
                }
                "Tf" => {
                    if let Some([size]) = numbers::<1>(operands) {
                        text.font_size = size;
                    }
                }
                "TL" => {
                    if let Some([leading]) = numbers::<1>(operands) {
                        text.leading = leading;
                    }
                }
                "Td" => {
                    if let Some([tx, ty]) = numbers::<2>(operands) {
                        text.next_line(tx, ty);
                    }
                }
                "TD" => {
                    if let Some([tx, ty]) = numbers::<2>(operands) {
                        text.leading = -ty;
                        text.next_line(tx, ty);
                    }
                }
                "Tm" => {
                    if let Some(m) = Matrix::from_operands(operands) {
                        text.matrix = m;
                        text.line_matrix = m;
                    }
                }
                "T*" => text.next_line(0.0, -text.leading),
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        self.show_text(&mut text, &ctm, bytes);
                    }
                }
                "'" => {
                    text.next_line(0.0, -text.leading);
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        self.show_text(&mut text, &ctm, bytes);
                    }
                }
                "\"" => {
                    text.next_line(0.0, -text.leading);
                    if let Some(Object::String(bytes, _)) = operands.get(2) {
                        self.show_text(&mut text, &ctm, bytes);
                    }
                }
                "TJ" => {
                    let Some(Object::Array(items)) = operands.first() else {
                        continue;
                    };
                    for item in items {
                        match item {
                            Object::String(bytes, _) => self.show_text(&mut text, &ctm, bytes),
                            other => {
                                if let Ok(adjust) = other.as_float() {
                                    text.advance(-adjust / 1000.0 * text.font_size);
                                }
                            }
                        }
                    }
                }
                "Do" => {
                    if let Some(Object::Name(name)) = operands.first() {
                        self.draw_xobject(name, resources, &ctm, depth);
                    }
                }
                _ => {}
            }
        }
    }

    fn show_text(&mut self, text: &mut TextState, ctm: &Matrix, bytes: &[u8]) {
        let glyphs = bytes.len() as f32;
        let width = glyphs * GLYPH_WIDTH * text.font_size;

        let decoded: String = bytes.iter().map(|&b| b as char).collect();
        let trimmed = decoded.trim();
        if !trimmed.is_empty() && !PAGE_NUMBER.is_match(trimmed) {
            let render = text.matrix.then(ctm);
            let bottom = DESCENT * text.font_size;
            let top = ASCENT * text.font_size;
            for (x, y) in [(0.0, bottom), (width, bottom), (0.0, top), (width, top)] {
                let (px, py) = render.apply(x, y);
                self.extent.add_point(px, py);
            }
        }

        text.advance(width);
    }

    fn draw_xobject(
        &mut self,
        name: &[u8],
        resources: Option<&'d Dictionary>,
        ctm: &Matrix,
        depth: usize,
    ) {
        let doc = self.doc;
        let Some(stream) = resources
            .and_then(|r| r.get(b"XObject").ok())
            .and_then(|x| as_dict(doc, x))
            .and_then(|x| x.get(name).ok())
            .and_then(|obj| doc.dereference(obj).ok())
            .and_then(|(_, obj)| obj.as_stream().ok())
        else {
            return;
        };

        match stream.dict.get(b"Subtype").and_then(Object::as_name) {
            Ok(b"Image") => {
                // The unit square of the image lands on the CTM.
                self.extent.add_point(ctm.e + ctm.a, ctm.f);
            }
            Ok(b"Form") if depth < MAX_FORM_DEPTH => {
                let form_matrix = stream
                    .dict
                    .get(b"Matrix")
                    .and_then(Object::as_array)
                    .ok()
                    .and_then(|m| Matrix::from_operands(m))
                    .unwrap_or(Matrix::IDENTITY);
                let form_resources = stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|r| as_dict(doc, r))
                    .or(resources);
                let bytes = stream
                    .decompressed_content()
                    .unwrap_or_else(|_| stream.content.clone());
                if let Ok(content) = Content::decode(&bytes) {
                    self.run(
                        &content.operations,
                        form_resources,
                        form_matrix.then(ctm),
                        depth + 1,
                    );
                }
            }
            _ => {}
        }
    }
}
