//! Finds the signature fields of a PDF and checks each embedded signature.
//!
//! A signature is reported valid when its byte range is well formed and
//! covers the file from the beginning up to an end of file marker, the
//! skipped range is exactly its `/Contents`, the digest of the covered bytes
//! matches the CMS message digest, and the CMS signature verifies with the
//! embedded signer certificate. The certificate chain is not checked for
//! trust or revocation.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use const_oid::db::rfc5911::{ID_MESSAGE_DIGEST, ID_SIGNED_DATA, ID_SIGNING_TIME};
use const_oid::db::rfc5912::{ID_SHA_256, ID_SHA_384, ID_SHA_512};
use const_oid::ObjectIdentifier;
use der::asn1::OctetString;
use der::{Decode, Encode};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use lopdf::xref::XrefEntry;
use lopdf::{Dictionary, Document, Object, ObjectId};
use regex::bytes::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use x509_cert::time::Time;

use crate::certificate_store::CertificateInfo;
use crate::document::{decode_text_string, load_document};
use crate::openssl::OpenSslVerifier;
use crate::Result;

/// Deepest `/Kids` nesting followed when collecting fields.
const MAX_FIELD_DEPTH: usize = 32;

/// Cryptographic check of a CMS blob, independent of the PDF structure.
pub trait Pkcs7Verifier {
    /// Describes the certificate of the (first) signer.
    fn signer(&self, pkcs7_der: &[u8]) -> Result<CertificateInfo>;

    /// Verifies the blob's signature over the concatenation of the two
    /// signed ranges.
    fn verify(&self, pkcs7_der: &[u8], signed_data: [&[u8]; 2]) -> Result<()>;
}

/// Outcome of checking one signature field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub field_name: String,
    /// Common name of the signer certificate.
    pub signer_name: Option<String>,
    pub signing_time: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub location: Option<String>,
    pub is_valid: bool,
    pub certificate_subject: Option<String>,
    pub byte_range: Option<[usize; 4]>,
    /// Whether the signature covers every byte of the file, i.e. nothing
    /// was appended after it.
    pub covers_whole_document: bool,
    /// Why the signature is not valid.
    pub error: Option<String>,
}

impl VerificationResult {
    fn new(field_name: String) -> Self {
        Self {
            field_name,
            signer_name: None,
            signing_time: None,
            reason: None,
            location: None,
            is_valid: false,
            certificate_subject: None,
            byte_range: None,
            covers_whole_document: false,
            error: None,
        }
    }

    fn coverage_end(&self) -> usize {
        self.byte_range
            .map_or(usize::MAX, |range| range[2].saturating_add(range[3]))
    }
}

#[derive(Error, Debug)]
enum FieldError {
    #[error("invalid signature object")]
    InvalidSignatureObject,
    #[error("file is not signed from the beginning")]
    WrongRangeStart,
    #[error("signature range does not end at the end of a PDF file")]
    WrongRangeEnd,
    #[error("invalid signature range")]
    InvalidRange,
    #[error("signature coverage skips over wrong sections of the document")]
    InvalidCoverage,
    #[error("cross-reference entry of the signature is inconsistent")]
    InternalConsistency,
    #[error("digest of the signed ranges does not match the signed message digest")]
    DigestMismatch,
    #[error("CMS signature does not verify")]
    SignatureInvalid,
    #[error("unsupported digest algorithm {0}")]
    UnsupportedDigest(ObjectIdentifier),
    #[error("PDF parsing error: {0}")]
    Parsing(#[from] lopdf::Error),
    #[error(transparent)]
    Backend(#[from] crate::Error),
}

impl From<FieldError> for crate::Error {
    fn from(e: FieldError) -> Self {
        match e {
            FieldError::Backend(inner) => inner,
            FieldError::UnsupportedDigest(oid) => {
                crate::Error::UnsupportedAlgorithm(format!("digest algorithm {oid}"))
            }
            other => crate::Error::CorruptSignatureField(other.to_string()),
        }
    }
}

type FieldResult<T> = std::result::Result<T, FieldError>;

/// A signed signature field: its fully qualified name and the field
/// dictionary holding `/V`.
pub(crate) struct SignatureField<'a> {
    name: String,
    dict: &'a Dictionary,
}

/// Verifies every signature of a document.
pub struct SignatureVerifier<V = OpenSslVerifier> {
    backend: V,
}

impl SignatureVerifier<OpenSslVerifier> {
    pub fn new() -> Result<Self> {
        Ok(Self::with_backend(OpenSslVerifier::new()?))
    }
}

impl<V: Pkcs7Verifier> SignatureVerifier<V> {
    pub fn with_backend(backend: V) -> Self {
        Self { backend }
    }

    /// One result per signed signature field, earliest revision first.
    ///
    /// Fails only when the input is not a PDF or can not be parsed; a
    /// broken signature is reported in its result instead.
    pub fn verify(&self, pdf_bytes: &[u8]) -> Result<Vec<VerificationResult>> {
        let doc = load_document(pdf_bytes)?;
        let fields = signature_fields(&doc)?;

        let mut results: Vec<VerificationResult> = fields
            .iter()
            .map(|field| self.check_field(pdf_bytes, &doc, field))
            .collect();
        results.sort_by_key(VerificationResult::coverage_end);

        info!(
            "verified {} signature(s), {} valid",
            results.len(),
            results.iter().filter(|r| r.is_valid).count()
        );
        Ok(results)
    }

    fn check_field(
        &self,
        pdf_bytes: &[u8],
        doc: &Document,
        field: &SignatureField,
    ) -> VerificationResult {
        let mut result = VerificationResult::new(field.name.clone());
        match self.inspect(pdf_bytes, doc, field.dict, &mut result) {
            Ok(()) => result.is_valid = true,
            Err(e) => {
                let e = crate::Error::from(e);
                warn!("signature {:?} is not valid: {e}", field.name);
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Fills `result` as far as the checks get.
    fn inspect(
        &self,
        pdf_bytes: &[u8],
        doc: &Document,
        field: &Dictionary,
        result: &mut VerificationResult,
    ) -> FieldResult<()> {
        let (Some(obj_id), Object::Dictionary(signature)) = doc.dereference(field.get(b"V")?)?
        else {
            // Signature object must be an indirect dictionary.
            return Err(FieldError::InvalidSignatureObject);
        };

        result.reason = text_entry(doc, signature, b"Reason");
        result.location = text_entry(doc, signature, b"Location");
        result.signing_time = text_entry(doc, signature, b"M").and_then(|m| parse_pdf_date(&m));

        let signed = process_signature(pdf_bytes, doc, obj_id, signature)?;
        result.byte_range = Some(signed.byte_range);
        result.covers_whole_document = signed.coverage_end() == pdf_bytes.len();

        let pkcs7 = trim_der(&signed.pkcs7_ber).unwrap_or(signed.pkcs7_ber.as_slice());
        let signer = self.backend.signer(pkcs7)?;
        result.signer_name = signer.common_name;
        result.certificate_subject = Some(signer.subject);

        let ranges = signed.ranges(pdf_bytes);
        match cms_details(pkcs7) {
            Some(details) => {
                if let Some(time) = details.signing_time {
                    result.signing_time = Some(time);
                }
                if let Some(expected) = details.message_digest {
                    if digest_ranges(&details.digest_algorithm, ranges)? != expected {
                        return Err(FieldError::DigestMismatch);
                    }
                }
            }
            None => debug!("signature is not plain DER, leaving the digest check to OpenSSL"),
        }

        self.backend
            .verify(pkcs7, ranges)
            .map_err(|_| FieldError::SignatureInvalid)
    }
}

/// Collects the signed signature fields of the AcroForm, following `/Kids`
/// with `/FT` inherited from the parents. Fields without a `/V` are unsigned
/// and left out.
pub(crate) fn signature_fields(doc: &Document) -> Result<Vec<SignatureField<'_>>> {
    let catalog = doc.catalog()?;
    let Some(acro_form) = catalog
        .get(b"AcroForm")
        .ok()
        .and_then(|obj| doc.dereference(obj).ok())
        .and_then(|(_, obj)| obj.as_dict().ok())
    else {
        return Ok(Vec::new());
    };
    let Ok(fields) = acro_form
        .get_deref(b"Fields", doc)
        .and_then(Object::as_array)
    else {
        return Ok(Vec::new());
    };

    let mut found = Vec::new();
    let mut visited = HashSet::new();
    for field in fields {
        collect_fields(doc, field, None, "", 0, &mut visited, &mut found);
    }
    Ok(found)
}

fn collect_fields<'a>(
    doc: &'a Document,
    node: &'a Object,
    inherited_type: Option<&'a [u8]>,
    parent_name: &str,
    depth: usize,
    visited: &mut HashSet<ObjectId>,
    found: &mut Vec<SignatureField<'a>>,
) {
    if depth > MAX_FIELD_DEPTH {
        return;
    }
    let Ok((id, node)) = doc.dereference(node) else {
        return;
    };
    if let Some(id) = id {
        if !visited.insert(id) {
            return;
        }
    }
    let Ok(dict) = node.as_dict() else {
        return;
    };

    let field_type = dict
        .get(b"FT")
        .and_then(Object::as_name)
        .ok()
        .or(inherited_type);
    let name = match dict.get(b"T").and_then(Object::as_str) {
        Ok(partial) if parent_name.is_empty() => decode_text_string(partial),
        Ok(partial) => format!("{parent_name}.{}", decode_text_string(partial)),
        Err(_) => parent_name.to_string(),
    };

    if field_type == Some(b"Sig".as_slice()) && dict.has(b"V") {
        found.push(SignatureField {
            name: name.clone(),
            dict,
        });
    }

    if let Ok(kids) = dict.get(b"Kids").and_then(Object::as_array) {
        for kid in kids {
            collect_fields(doc, kid, field_type, &name, depth + 1, visited, found);
        }
    }
}

fn text_entry(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    dict.get_deref(key, doc)
        .and_then(Object::as_str)
        .ok()
        .map(decode_text_string)
}

/// A signature whose byte range passed the structural checks.
struct SignedRange {
    byte_range: [usize; 4],
    pkcs7_ber: Vec<u8>,
}

impl SignedRange {
    fn coverage_end(&self) -> usize {
        self.byte_range[2] + self.byte_range[3]
    }

    fn ranges<'p>(&self, pdf_bytes: &'p [u8]) -> [&'p [u8]; 2] {
        let [start, first_len, second_start, second_len] = self.byte_range;
        [
            &pdf_bytes[start..start + first_len],
            &pdf_bytes[second_start..second_start + second_len],
        ]
    }
}

struct ExactArrayOrNone<T, const N: usize>(Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

fn process_signature(
    pdf_bytes: &[u8],
    doc: &Document,
    obj_id: ObjectId,
    signature: &Dictionary,
) -> FieldResult<SignedRange> {
    let signed_range = signature
        .get_deref(b"ByteRange", doc)?
        .as_array()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_i64()))
        .collect::<lopdf::Result<ExactArrayOrNone<i64, 4>>>()?
        .0
        .ok_or(FieldError::InvalidRange)?;

    // For soundness, we must ensure the signature covers the file since the
    // beginning.
    if signed_range[0] != 0 {
        return Err(FieldError::WrongRangeStart);
    }

    // Sanity check that the range is well formed and inside the document.
    if signed_range[1..].iter().any(|&range| range < 0) {
        return Err(FieldError::InvalidRange);
    }
    let signed_range_end = signed_range[2]
        .checked_add(signed_range[3])
        .ok_or(FieldError::InvalidRange)?;
    if signed_range[1] > signed_range[2] || signed_range_end > pdf_bytes.len() as i64 {
        return Err(FieldError::InvalidRange);
    }

    // The signature object must be inside the signed range.
    match doc.reference_table.get(obj_id.0) {
        Some(XrefEntry::Normal { offset, generation }) => {
            if *generation != obj_id.1 {
                return Err(FieldError::InternalConsistency);
            }
            if i64::from(*offset) >= signed_range[1] {
                return Err(FieldError::InvalidCoverage);
            }
        }
        Some(_) => return Err(FieldError::InvalidSignatureObject),
        None => return Err(FieldError::InternalConsistency),
    }

    // The /Contents field must match the bytes skipped in the signed range,
    // which must be hex encoded.
    let skipped_bytes =
        decode_pdf_hex_string(&pdf_bytes[signed_range[1] as usize..signed_range[2] as usize])
            .ok_or(FieldError::InvalidCoverage)?;
    let pkcs7_signature = signature.get_deref(b"Contents", doc)?.as_str()?;
    if pkcs7_signature != skipped_bytes {
        return Err(FieldError::InvalidCoverage);
    }

    // Tests if the signature range ends with the PDF end marker (%%EOF).
    if !pdf_ends_with_eof(&pdf_bytes[..signed_range_end as usize]) {
        return Err(FieldError::WrongRangeEnd);
    }

    Ok(SignedRange {
        byte_range: signed_range.map(|v| v as usize),
        pkcs7_ber: skipped_bytes,
    })
}

/// Decodes a PDF hex string, skipping whitespace.
/// Returns None if any character is not a valid hex digit.
fn decode_pdf_hex_string(hex_input: &[u8]) -> Option<Vec<u8>> {
    // First and last characters must be the delimiters '<' and '>'.
    if hex_input.first() != Some(&b'<') || hex_input.last() != Some(&b'>') {
        return None;
    }
    let hex_input = &hex_input[1..hex_input.len() - 1];

    let mut bytes = Vec::with_capacity(hex_input.len() / 2);
    let mut hex_iter = hex_input.iter().filter_map(|&b| {
        let c = b as char;
        if c.is_whitespace() {
            None
        } else {
            Some(c.to_digit(16))
        }
    });

    while let Some(first) = hex_iter.next() {
        let first = first? as u8;
        let second = hex_iter.next().unwrap_or(Some(0))? as u8;
        bytes.push(first << 4 | second);
    }

    Some(bytes)
}

lazy_static! {
    static ref EOF_REGEX: Regex =
        Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Tests if the PDF ends with the %%EOF marker.
fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}

/// The DER value at the start of `blob`, without the zero padding that fills
/// the rest of the placeholder. None for indefinite lengths (BER).
fn trim_der(blob: &[u8]) -> Option<&[u8]> {
    let first_len = *blob.get(1)?;
    let (header, len) = match first_len {
        0..=0x7F => (2, usize::from(first_len)),
        0x81..=0x84 => {
            let count = usize::from(first_len & 0x7F);
            let len = blob
                .get(2..2 + count)?
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            (2 + count, len)
        }
        _ => return None,
    };
    blob.get(..header.checked_add(len)?)
}

/// What the verifier needs from the first SignerInfo.
struct CmsDetails {
    digest_algorithm: ObjectIdentifier,
    message_digest: Option<Vec<u8>>,
    signing_time: Option<DateTime<Utc>>,
}

fn cms_details(der: &[u8]) -> Option<CmsDetails> {
    let content_info = ContentInfo::from_der(der).ok()?;
    if content_info.content_type != ID_SIGNED_DATA {
        return None;
    }
    let signed_data = SignedData::from_der(&content_info.content.to_der().ok()?).ok()?;
    let signer = signed_data.signer_infos.0.iter().next()?;

    let mut details = CmsDetails {
        digest_algorithm: signer.digest_alg.oid,
        message_digest: None,
        signing_time: None,
    };
    for attribute in signer.signed_attrs.iter().flat_map(|attrs| attrs.iter()) {
        let Some(value) = attribute.values.iter().next() else {
            continue;
        };
        let Ok(value) = value.to_der() else {
            continue;
        };
        if attribute.oid == ID_MESSAGE_DIGEST {
            details.message_digest = OctetString::from_der(&value)
                .ok()
                .map(|digest| digest.as_bytes().to_vec());
        } else if attribute.oid == ID_SIGNING_TIME {
            details.signing_time = Time::from_der(&value)
                .ok()
                .map(|time| DateTime::<Utc>::from(time.to_system_time()));
        }
    }
    Some(details)
}

fn digest_ranges(algorithm: &ObjectIdentifier, ranges: [&[u8]; 2]) -> FieldResult<Vec<u8>> {
    fn run<D: Digest>(ranges: [&[u8]; 2]) -> Vec<u8> {
        let mut hasher = D::new();
        for range in ranges {
            hasher.update(range);
        }
        hasher.finalize().to_vec()
    }

    if *algorithm == ID_SHA_256 {
        Ok(run::<Sha256>(ranges))
    } else if *algorithm == ID_SHA_384 {
        Ok(run::<Sha384>(ranges))
    } else if *algorithm == ID_SHA_512 {
        Ok(run::<Sha512>(ranges))
    } else {
        Err(FieldError::UnsupportedDigest(*algorithm))
    }
}

/// Parses a PDF date (`D:YYYYMMDDHHmmSSOHH'mm'`), where everything after
/// the year is optional.
fn parse_pdf_date(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim().strip_prefix("D:").unwrap_or(raw.trim());
    let digits_len = value.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len < 4 {
        return None;
    }
    let (digits, zone) = value.split_at(digits_len);
    let part = |range: std::ops::Range<usize>, default: u32| -> Option<u32> {
        match digits.get(range) {
            Some(v) => v.parse().ok(),
            None => Some(default),
        }
    };

    let date = NaiveDate::from_ymd_opt(digits[..4].parse().ok()?, part(4..6, 1)?, part(6..8, 1)?)?;
    let time = date.and_hms_opt(part(8..10, 0)?, part(10..12, 0)?, part(12..14, 0)?)?;

    let offset_seconds = match zone.as_bytes().first() {
        Some(sign @ (b'+' | b'-')) => {
            let numbers: String = zone[1..].chars().filter(char::is_ascii_digit).collect();
            let hours: i32 = numbers.get(..2)?.parse().ok()?;
            let minutes: i32 = numbers.get(2..4).map_or(Some(0), |m| m.parse().ok())?;
            let seconds = hours * 3600 + minutes * 60;
            if *sign == b'-' {
                -seconds
            } else {
                seconds
            }
        }
        _ => 0,
    };
    let offset = FixedOffset::east_opt(offset_seconds)?;
    Some(
        offset
            .from_local_datetime(&time)
            .single()?
            .with_timezone(&Utc),
    )
}
