//! Canonical RLP value codec.
//!
//! Consensus objects are lowered to an [`RlpValue`] tree and serialized with
//! the Ethereum RLP rules. Decoding is strict: non-minimal integer encodings
//! and trailing bytes are rejected, so every byte string has exactly one
//! accepted parse.

use rlp::{DecoderError, Rlp, RlpStream};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("rlp decode: {0}")]
    Decoder(#[from] DecoderError),

    #[error("trailing bytes after rlp payload")]
    TrailingBytes,

    #[error("expected byte string, found list")]
    ExpectedBytes,

    #[error("expected list, found byte string")]
    ExpectedList,

    #[error("non-canonical integer encoding")]
    NonCanonicalInteger,

    #[error("integer does not fit in 128 bits")]
    IntegerOverflow,

    #[error("invalid utf-8 in byte string")]
    InvalidUtf8,

    #[error("expected {expected} list items, found {found}")]
    WrongItemCount { expected: usize, found: usize },

    #[error("unknown variant tag {0}")]
    UnknownTag(u128),
}

/// A recursive RLP value: a byte string or a list of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RlpValue {
    Bytes(Vec<u8>),
    List(Vec<RlpValue>),
}

impl rlp::Encodable for RlpValue {
    fn rlp_append(&self, s: &mut RlpStream) {
        match self {
            RlpValue::Bytes(b) => {
                s.encoder().encode_value(b);
            }
            RlpValue::List(items) => {
                s.begin_list(items.len());
                for item in items {
                    s.append(item);
                }
            }
        }
    }
}

impl rlp::Decodable for RlpValue {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.is_list() {
            let mut items = Vec::with_capacity(rlp.item_count()?);
            for item in rlp.iter() {
                items.push(RlpValue::decode(&item)?);
            }
            Ok(RlpValue::List(items))
        } else {
            Ok(RlpValue::Bytes(rlp.data()?.to_vec()))
        }
    }
}

/// Encode a value tree to canonical RLP bytes.
pub fn rlp_encode(value: &RlpValue) -> Vec<u8> {
    rlp::encode(value).to_vec()
}

/// Decode canonical RLP bytes into a value tree.
///
/// The entire input must be consumed; trailing bytes are an error.
pub fn rlp_decode(bytes: &[u8]) -> Result<RlpValue, CodecError> {
    let rlp = Rlp::new(bytes);
    let info = rlp.payload_info()?;
    if info.header_len + info.value_len != bytes.len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(<RlpValue as rlp::Decodable>::decode(&rlp)?)
}

impl RlpValue {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        RlpValue::Bytes(b.into())
    }

    pub fn list(items: Vec<RlpValue>) -> Self {
        RlpValue::List(items)
    }

    pub fn str(s: &str) -> Self {
        RlpValue::Bytes(s.as_bytes().to_vec())
    }

    /// Unsigned integer as a minimal big-endian byte string (zero = empty).
    pub fn uint(v: u128) -> Self {
        RlpValue::Bytes(uint_to_be(v))
    }

    /// Signed integer: empty for zero, otherwise a sign byte (0x00 for
    /// positive, 0x01 for negative) followed by the minimal big-endian
    /// magnitude.
    pub fn int(v: i128) -> Self {
        if v == 0 {
            return RlpValue::Bytes(Vec::new());
        }
        let sign: u8 = if v < 0 { 1 } else { 0 };
        let magnitude = v.unsigned_abs();
        let mut out = vec![sign];
        out.extend_from_slice(&uint_to_be(magnitude));
        RlpValue::Bytes(out)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn as_bytes(&self) -> Result<&[u8], CodecError> {
        match self {
            RlpValue::Bytes(b) => Ok(b),
            RlpValue::List(_) => Err(CodecError::ExpectedBytes),
        }
    }

    pub fn as_list(&self) -> Result<&[RlpValue], CodecError> {
        match self {
            RlpValue::List(items) => Ok(items),
            RlpValue::Bytes(_) => Err(CodecError::ExpectedList),
        }
    }

    /// A list with exactly `n` items.
    pub fn as_list_of(&self, n: usize) -> Result<&[RlpValue], CodecError> {
        let items = self.as_list()?;
        if items.len() != n {
            return Err(CodecError::WrongItemCount {
                expected: n,
                found: items.len(),
            });
        }
        Ok(items)
    }

    pub fn as_str(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(self.as_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn as_uint(&self) -> Result<u128, CodecError> {
        let b = self.as_bytes()?;
        be_to_uint(b)
    }

    pub fn as_int(&self) -> Result<i128, CodecError> {
        let b = self.as_bytes()?;
        if b.is_empty() {
            return Ok(0);
        }
        let (sign, magnitude) = (b[0], &b[1..]);
        if sign > 1 {
            return Err(CodecError::NonCanonicalInteger);
        }
        let m = be_to_uint(magnitude)?;
        // Zero must be the empty string; a signed zero is non-canonical.
        if m == 0 {
            return Err(CodecError::NonCanonicalInteger);
        }
        if sign == 1 {
            if m > i128::MAX as u128 + 1 {
                return Err(CodecError::IntegerOverflow);
            }
            Ok((m as i128).wrapping_neg())
        } else {
            if m > i128::MAX as u128 {
                return Err(CodecError::IntegerOverflow);
            }
            Ok(m as i128)
        }
    }
}

fn uint_to_be(v: u128) -> Vec<u8> {
    let be = v.to_be_bytes();
    let first = be.iter().position(|&b| b != 0).unwrap_or(be.len());
    be[first..].to_vec()
}

fn be_to_uint(b: &[u8]) -> Result<u128, CodecError> {
    if b.len() > 16 {
        return Err(CodecError::IntegerOverflow);
    }
    // Minimal-length rule: no leading zero byte.
    if b.first() == Some(&0) {
        return Err(CodecError::NonCanonicalInteger);
    }
    let mut v: u128 = 0;
    for &byte in b {
        v = (v << 8) | byte as u128;
    }
    Ok(v)
}
