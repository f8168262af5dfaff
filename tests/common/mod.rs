//! Fixtures shared by the integration tests, built the same way as the ones
//! the unit tests use.
#![allow(dead_code)]

#[path = "../../src/test_support.rs"]
mod test_support;

pub use test_support::{build_pdf, write_keystore, KeyKind, PageSpec};

pub const INVOICE_TEXT: &str = "Invoice #42";

/// Single page invoice with a page number in the footer.
pub fn invoice_pdf() -> Vec<u8> {
    build_pdf(&[PageSpec::text(&[
        (INVOICE_TEXT, 400.0, 700.0),
        ("1/1", 290.0, 30.0),
    ])])
}
