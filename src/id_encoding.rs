//! Canonical encoding of 32-byte public keys.
//!
//! Keys are rendered as z-base-32 (52 characters, no padding). Decoding also
//! accepts 64-character hex so keys copied from logs or identity files work.

use std::fmt;
use std::sync::OnceLock;

use data_encoding::{Encoding, Specification, HEXLOWER_PERMISSIVE};

const Z32_ALPHABET: &str = "ybndrfg8ejkmcpqxot1uwisza345h769";

/// Public key length in bytes.
pub const KEY_LEN: usize = 32;

/// Length of an encoded key in z-base-32.
pub const Z32_LEN: usize = 52;

/// Errors from decoding a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Input is neither 52-char z-base-32 nor 64-char hex.
    UnrecognizedFormat(usize),
    /// Input has the right length but invalid symbols.
    InvalidSymbols(String),
    /// Decoded to the wrong number of bytes.
    WrongLength(usize),
    /// The z-base-32 codec could not be built.
    Codec(String),
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedFormat(len) => {
                write!(f, "Unrecognized key format ({len} chars, expected {Z32_LEN} or 64)")
            }
            Self::InvalidSymbols(msg) => write!(f, "Invalid key: {msg}"),
            Self::WrongLength(len) => write!(f, "Key is {len} bytes, expected {KEY_LEN}"),
            Self::Codec(msg) => write!(f, "z-base-32 codec unavailable: {msg}"),
        }
    }
}

impl std::error::Error for IdError {}

fn z32() -> Result<&'static Encoding, IdError> {
    static Z32: OnceLock<Result<Encoding, String>> = OnceLock::new();
    Z32.get_or_init(|| {
        let mut spec = Specification::new();
        spec.symbols.push_str(Z32_ALPHABET);
        spec.encoding().map_err(|e| e.to_string())
    })
    .as_ref()
    .map_err(|e| IdError::Codec(e.clone()))
}

/// Encode a public key in its canonical form.
pub fn encode(key: &[u8; KEY_LEN]) -> Result<String, IdError> {
    Ok(z32()?.encode(key))
}

/// Decode a z-base-32 or hex key.
pub fn decode(input: &str) -> Result<[u8; KEY_LEN], IdError> {
    let input = input.trim();
    let bytes = match input.len() {
        Z32_LEN => z32()?.decode(input.as_bytes()),
        64 => HEXLOWER_PERMISSIVE.decode(input.as_bytes()),
        len => return Err(IdError::UnrecognizedFormat(len)),
    }
    .map_err(|e| IdError::InvalidSymbols(e.to_string()))?;

    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_wrong| IdError::WrongLength(bytes.len()))
}
