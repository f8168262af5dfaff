//! Visible part of a signature: the signer graphic and the description text,
//! drawn into a form XObject referenced by the widget's `/AP /N`.

use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Object, Stream};

use crate::{Error, Result};

/// Resource name of the description font inside the appearance stream.
pub(crate) const FONT_RESOURCE: &str = "F1";
/// Resource name of the signer graphic inside the appearance stream.
pub(crate) const IMAGE_RESOURCE: &str = "Im1";

const MARGIN: f32 = 2.0;
const MAX_FONT_SIZE: f32 = 7.0;
const MIN_FONT_SIZE: f32 = 2.0;
const LEADING: f32 = 1.2;
/// Helvetica glyphs average about half an em.
const GLYPH_WIDTH: f32 = 0.5;

/// Decoded handwritten signature graphic, as 8-bit RGB plus optional alpha.
#[derive(Clone)]
pub struct SignatureImage {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
    alpha: Option<Vec<u8>>,
}

impl std::fmt::Debug for SignatureImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("alpha", &self.alpha.is_some())
            .finish()
    }
}

impl SignatureImage {
    /// Decodes a PNG or JPEG file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| Error::SignatureImage(e.to_string()))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::SignatureImage("image is empty".to_string()));
        }

        let pixels = decoded.into_raw();
        let mut rgb = Vec::with_capacity(pixels.len() / 4 * 3);
        let mut alpha = Vec::with_capacity(pixels.len() / 4);
        for pixel in pixels.chunks_exact(4) {
            rgb.extend_from_slice(&pixel[..3]);
            alpha.push(pixel[3]);
        }
        let alpha = alpha.iter().any(|&a| a != u8::MAX).then_some(alpha);

        Ok(Self {
            width,
            height,
            rgb,
            alpha,
        })
    }

    /// Decodes base64 encoded image bytes.
    pub fn from_base64(data: &str) -> Result<Self> {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact)
            .map_err(|e| Error::SignatureImage(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Accepts `data:image/png;base64,...` as sent by browser signature
    /// pads, or bare base64.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let payload = match url.trim().strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or_else(|| {
                    Error::SignatureImage("data URL has no payload".to_string())
                })?;
                if !header.ends_with(";base64") {
                    return Err(Error::SignatureImage(
                        "data URL is not base64 encoded".to_string(),
                    ));
                }
                payload
            }
            None => url,
        };
        Self::from_base64(payload)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha.is_some()
    }

    /// Image XObject and, when the graphic is translucent, its soft mask.
    /// The caller links the mask through `/SMask` once it has an id.
    pub(crate) fn to_xobjects(&self) -> Result<(Stream, Option<Stream>)> {
        let image = image_stream(self.width, self.height, "DeviceRGB", &self.rgb)?;
        let mask = self
            .alpha
            .as_ref()
            .map(|alpha| image_stream(self.width, self.height, "DeviceGray", alpha))
            .transpose()?;
        Ok((image, mask))
    }
}

fn image_stream(width: u32, height: u32, color_space: &str, samples: &[u8]) -> Result<Stream> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(samples)?;
    let compressed = encoder.finish()?;

    let mut stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(width),
            "Height" => i64::from(height),
            "ColorSpace" => Object::Name(color_space.as_bytes().to_vec()),
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        compressed,
    );
    stream.allows_compression = false;
    Ok(stream)
}

/// Standard Type 1 Helvetica, which every viewer has built in.
pub(crate) fn font_dictionary() -> Dictionary {
    dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    }
}

/// The description shown next to the graphic. Empty reason and location are
/// left out.
pub(crate) fn description_lines(
    signer_name: &str,
    signing_time: DateTime<Utc>,
    reason: &str,
    location: &str,
) -> Vec<String> {
    let mut lines = vec![
        format!("Digitally signed by {signer_name}"),
        format!("Date: {}", signing_time.format("%Y.%m.%d %H:%M:%S UTC")),
    ];
    if !reason.trim().is_empty() {
        lines.push(format!("Reason: {}", reason.trim()));
    }
    if !location.trim().is_empty() {
        lines.push(format!("Location: {}", location.trim()));
    }
    lines
}

/// Content stream of the appearance form XObject, in its own coordinate
/// space `[0 0 width height]`.
///
/// With an image, the graphic takes the left half and the text the right
/// half; otherwise the text takes the whole box.
pub(crate) fn appearance_content(
    width: f32,
    height: f32,
    lines: &[String],
    image: Option<&SignatureImage>,
) -> Result<Vec<u8>> {
    let mut ops = vec![
        Operation::new("q", vec![]),
        Operation::new("g", vec![1.into()]),
        Operation::new(
            "re",
            vec![0.into(), 0.into(), width.into(), height.into()],
        ),
        Operation::new("f", vec![]),
    ];

    let mut text_x = MARGIN;
    if let Some(image) = image {
        let area_w = width / 2.0 - 2.0 * MARGIN;
        let area_h = height - 2.0 * MARGIN;
        let scale = (area_w / image.width as f32).min(area_h / image.height as f32);
        let draw_w = image.width as f32 * scale;
        let draw_h = image.height as f32 * scale;
        let x = MARGIN + (area_w - draw_w) / 2.0;
        let y = MARGIN + (area_h - draw_h) / 2.0;
        ops.extend([
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    draw_w.into(),
                    0.into(),
                    0.into(),
                    draw_h.into(),
                    x.into(),
                    y.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(IMAGE_RESOURCE.as_bytes().to_vec())]),
            Operation::new("Q", vec![]),
        ]);
        text_x = width / 2.0 + MARGIN;
    }

    let text_width = width - text_x - MARGIN;
    let size = font_size(lines, text_width, height - 2.0 * MARGIN);
    let leading = size * LEADING;
    ops.extend([
        Operation::new("BT", vec![]),
        Operation::new("g", vec![0.into()]),
        Operation::new(
            "Tf",
            vec![Object::Name(FONT_RESOURCE.as_bytes().to_vec()), size.into()],
        ),
        Operation::new("TL", vec![leading.into()]),
        Operation::new(
            "Td",
            vec![text_x.into(), (height - MARGIN - size).into()],
        ),
    ]);
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            ops.push(Operation::new("T*", vec![]));
        }
        ops.push(Operation::new(
            "Tj",
            vec![Object::string_literal(win_ansi(line))],
        ));
    }
    ops.push(Operation::new("ET", vec![]));
    ops.push(Operation::new("Q", vec![]));

    Ok(Content { operations: ops }.encode()?)
}

/// Largest size, up to the default, at which every line fits the text area.
fn font_size(lines: &[String], width: f32, height: f32) -> f32 {
    let longest = lines
        .iter()
        .map(|line| line.chars().count())
        .max()
        .unwrap_or(1)
        .max(1) as f32;
    let by_width = width / (longest * GLYPH_WIDTH);
    let by_height = height / (lines.len().max(1) as f32 * LEADING);
    by_width.min(by_height).clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
}

/// Maps text to WinAnsiEncoding. Latin-1 maps one to one; the Latin
/// Extended letters of the 0x80-0x9F block are translated and anything
/// else becomes `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\u{20}'..='\u{7E}' | '\u{A0}'..='\u{FF}' => c as u8,
            '€' => 0x80,
            'Š' => 0x8A,
            'Œ' => 0x8C,
            'Ž' => 0x8E,
            'š' => 0x9A,
            'œ' => 0x9C,
            'ž' => 0x9E,
            'Ÿ' => 0x9F,
            '–' => 0x96,
            '—' => 0x97,
            '‘' => 0x91,
            '’' => 0x92,
            '“' => 0x93,
            '”' => 0x94,
            _ => b'?',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::{ImageBuffer, ImageOutputFormat, Rgba};
    use std::io::Cursor;

    fn png(alpha: u8) -> Vec<u8> {
        let buffer = ImageBuffer::from_pixel(4, 2, Rgba([10u8, 20, 30, alpha]));
        let mut out = Cursor::new(Vec::new());
        buffer.write_to(&mut out, ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn decodes_data_url() {
        let url = format!("data:image/png;base64,{}", STANDARD.encode(png(255)));
        let image = SignatureImage::from_data_url(&url).unwrap();
        assert_eq!((image.width(), image.height()), (4, 2));
        assert!(!image.has_alpha());

        let (xobject, mask) = image.to_xobjects().unwrap();
        assert!(mask.is_none());
        assert_eq!(xobject.dict.get(b"Width").unwrap().as_i64().unwrap(), 4);
    }

    #[test]
    fn translucent_image_gets_a_soft_mask() {
        let image = SignatureImage::from_bytes(&png(128)).unwrap();
        assert!(image.has_alpha());
        let (_, mask) = image.to_xobjects().unwrap();
        let mask = mask.unwrap();
        assert_eq!(
            mask.dict.get(b"ColorSpace").unwrap().as_name().unwrap(),
            b"DeviceGray"
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            SignatureImage::from_data_url("data:image/png;base64,AAAA"),
            Err(Error::SignatureImage(_))
        ));
        assert!(matches!(
            SignatureImage::from_data_url("data:image/png,rawbytes"),
            Err(Error::SignatureImage(_))
        ));
        assert!(matches!(
            SignatureImage::from_base64("!!not base64!!"),
            Err(Error::SignatureImage(_))
        ));
    }

    #[test]
    fn description_skips_empty_fields() {
        let time = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        let lines = description_lines("Jane Doe", time, "Approved", "  ");
        assert_eq!(
            lines,
            [
                "Digitally signed by Jane Doe",
                "Date: 2024.03.09 14:05:00 UTC",
                "Reason: Approved",
            ]
        );
    }

    #[test]
    fn appearance_draws_text_and_image() {
        let image = SignatureImage::from_bytes(&png(255)).unwrap();
        let lines = vec!["Digitally signed by Željko".to_string()];
        let content = appearance_content(150.0, 50.0, &lines, Some(&image)).unwrap();
        let decoded = Content::decode(&content).unwrap();
        let operators: Vec<&str> = decoded
            .operations
            .iter()
            .map(|op| op.operator.as_str())
            .collect();
        assert!(operators.contains(&"Do"));
        assert!(operators.contains(&"Tj"));

        let shown = decoded
            .operations
            .iter()
            .find(|op| op.operator == "Tj")
            .unwrap();
        // Ž is 0x8E in WinAnsiEncoding.
        assert_eq!(shown.operands[0].as_str().unwrap()[20], 0x8E);
    }

    #[test]
    fn long_lines_shrink_the_font() {
        let short = font_size(&["abc".to_string()], 140.0, 46.0);
        let long = font_size(&["x".repeat(80)], 140.0, 46.0);
        assert_eq!(short, MAX_FONT_SIZE);
        assert!(long < short);
    }
}
