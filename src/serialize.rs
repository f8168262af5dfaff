//! Writes lopdf objects back to PDF syntax, for the incremental update.
//!
//! Dictionaries keep their insertion order, so the output is deterministic.

use std::io::{self, Write};

use lopdf::{Dictionary, Object, ObjectId, Stream, StringFormat};

pub(crate) fn write_object<W: Write>(w: &mut W, obj: &Object) -> io::Result<()> {
    match obj {
        Object::Null => write!(w, "null"),
        Object::Boolean(b) => write!(w, "{b}"),
        Object::Integer(i) => write!(w, "{i}"),
        Object::Real(r) => write_real(w, *r),
        Object::Name(name) => write_name(w, name),
        Object::String(data, StringFormat::Literal) => write_literal_string(w, data),
        Object::String(data, StringFormat::Hexadecimal) => write_hex_string(w, data),
        Object::Array(array) => {
            write!(w, "[")?;
            for (i, item) in array.iter().enumerate() {
                if i > 0 {
                    write!(w, " ")?;
                }
                write_object(w, item)?;
            }
            write!(w, "]")
        }
        Object::Dictionary(dict) => write_dictionary(w, dict),
        Object::Stream(stream) => write_stream(w, stream),
        Object::Reference((id, generation)) => write!(w, "{id} {generation} R"),
    }
}

/// Writes `N G obj ... endobj`, followed by a newline.
pub(crate) fn write_indirect<W: Write>(w: &mut W, id: ObjectId, obj: &Object) -> io::Result<()> {
    write!(w, "{} {} obj\n", id.0, id.1)?;
    write_object(w, obj)?;
    write!(w, "\nendobj\n")
}

pub(crate) fn write_dictionary<W: Write>(w: &mut W, dict: &Dictionary) -> io::Result<()> {
    write!(w, "<<")?;
    write_entries(w, dict)?;
    write!(w, ">>")
}

/// Key/value pairs of a dictionary, without the `<<` `>>` delimiters.
pub(crate) fn write_entries<W: Write>(w: &mut W, dict: &Dictionary) -> io::Result<()> {
    for (key, value) in dict.iter() {
        write_name(w, key)?;
        write!(w, " ")?;
        write_object(w, value)?;
    }
    Ok(())
}

fn write_stream<W: Write>(w: &mut W, stream: &Stream) -> io::Result<()> {
    let mut dict = stream.dict.clone();
    dict.set("Length", stream.content.len() as i64);
    write_dictionary(w, &dict)?;
    write!(w, "\nstream\n")?;
    w.write_all(&stream.content)?;
    write!(w, "\nendstream")
}

/// Reals are written with at most four decimals and no exponent.
fn write_real<W: Write>(w: &mut W, value: f32) -> io::Result<()> {
    if !value.is_finite() {
        return write!(w, "0");
    }
    let formatted = format!("{value:.4}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-" | "-0" => write!(w, "0"),
        _ => write!(w, "{trimmed}"),
    }
}

fn write_name<W: Write>(w: &mut W, name: &[u8]) -> io::Result<()> {
    write!(w, "/")?;
    for &byte in name {
        if is_regular(byte) {
            w.write_all(&[byte])?;
        } else {
            write!(w, "#{byte:02X}")?;
        }
    }
    Ok(())
}

/// Regular characters per PDF syntax: printable, not white-space, not a
/// delimiter, and not the `#` escape itself.
fn is_regular(byte: u8) -> bool {
    (b'!'..=b'~').contains(&byte)
        && !matches!(
            byte,
            b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%' | b'#'
        )
}

fn write_literal_string<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    write!(w, "(")?;
    w.write_all(&escape(data))?;
    write!(w, ")")
}

fn write_hex_string<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    write!(w, "<")?;
    for byte in data {
        write!(w, "{byte:02X}")?;
    }
    write!(w, ">")
}

/// Escapes the bytes of a literal string body.
pub(crate) fn escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len() + 8);
    for &byte in data {
        match byte {
            b'(' | b')' | b'\\' => escaped.extend_from_slice(&[b'\\', byte]),
            b'\n' => escaped.extend_from_slice(b"\\n"),
            b'\r' => escaped.extend_from_slice(b"\\r"),
            b'\t' => escaped.extend_from_slice(b"\\t"),
            _ => escaped.push(byte),
        }
    }
    escaped
}

/// Encodes a text string: plain ASCII as a literal, anything else as
/// UTF-16BE with a byte order mark.
pub(crate) fn text_string(text: &str) -> Object {
    if text.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        Object::String(text.as_bytes().to_vec(), StringFormat::Literal)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}
