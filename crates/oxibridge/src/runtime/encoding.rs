//! Type encodings for block signatures.
//!
//! Every block the bridge creates carries a signature string in its
//! descriptor, in the same `@encode()` dialect native method signatures use.
//! A block signature lists the return type, then the block itself, then the
//! arguments:
//!
//! - `"i?i"` - int return, block, int argument
//! - `"v@?@"` - void return, block, object argument
//! - `"i12@?0i8"` - the same as `"i@?i"` with the frame offsets clang emits
//!
//! # Encoding Format
//!
//! - `v` void, `B` bool
//! - `c`/`C`, `s`/`S`, `i`/`I`, `l`/`L`, `q`/`Q` signed/unsigned integers
//! - `f` float, `d` double
//! - `@` object, `@?` block, `@"Name"` typed object
//! - `:` selector, `#` class, `*` C string, `?` unknown (the block itself)
//! - `^T` pointer to `T`
//! - `r n N o O R V` type qualifiers, ignored
//!
//! Decimal offsets after a type are skipped.

// Different encodings share a size; arms are kept separate for readability.
#![allow(clippy::match_same_arms)]

use crate::error::{Error, Result};

/// Block signature constants for common shapes.
pub mod signatures {
    /// `int (^)(int)`
    pub const INT_TO_INT: &str = "i?i";
    /// `void (^)(void)`
    pub const VOID: &str = "v?";
    /// `void (^)(id)`
    pub const OBJECT_TO_VOID: &str = "v@?@";
}

/// A parsed block signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignature {
    return_type: String,
    arg_types: Vec<String>,
}

impl BlockSignature {
    /// The return type encoding.
    #[must_use]
    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    /// Argument encodings, excluding the block itself.
    #[must_use]
    pub fn arg_types(&self) -> &[String] {
        &self.arg_types
    }

    /// Number of arguments, excluding the block itself.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }
}

/// Returns the size in bytes of a scalar type encoding character.
///
/// # Example
///
/// ```
/// use oxibridge::runtime::encoding::size_of_type;
///
/// assert_eq!(size_of_type('i'), Some(4));
/// assert_eq!(size_of_type('@'), Some(8));
/// assert_eq!(size_of_type('x'), None);
/// ```
#[must_use]
pub const fn size_of_type(type_char: char) -> Option<usize> {
    match type_char {
        'v' => Some(0),
        'B' | 'c' | 'C' => Some(1),
        's' | 'S' => Some(2),
        'i' | 'I' | 'f' => Some(4),
        'l' | 'L' | 'q' | 'Q' | 'd' => Some(8),
        '@' | ':' | '#' | '*' | '^' | '?' => Some(8),
        _ => None,
    }
}

const fn is_scalar(byte: u8) -> bool {
    size_of_type(byte as char).is_some() && byte != b'^' && byte != b'@'
}

const fn is_qualifier(byte: u8) -> bool {
    matches!(byte, b'r' | b'n' | b'N' | b'o' | b'O' | b'R' | b'V')
}

/// Returns the end of the type starting at `pos`.
fn read_type(bytes: &[u8], mut pos: usize) -> Result<usize> {
    while bytes.get(pos).is_some_and(|&b| is_qualifier(b)) {
        pos += 1;
    }
    match bytes.get(pos) {
        Some(b'^') => read_type(bytes, pos + 1),
        Some(b'@') => match bytes.get(pos + 1) {
            Some(b'?') => Ok(pos + 2),
            Some(b'"') => bytes[pos + 2..]
                .iter()
                .position(|&b| b == b'"')
                .map(|close| pos + 2 + close + 1)
                .ok_or(Error::InvalidEncoding),
            _ => Ok(pos + 1),
        },
        Some(&b) if is_scalar(b) => Ok(pos + 1),
        _ => Err(Error::InvalidEncoding),
    }
}

fn skip_offset(bytes: &[u8], mut pos: usize) -> usize {
    while bytes.get(pos).is_some_and(u8::is_ascii_digit) {
        pos += 1;
    }
    pos
}

/// Parses a block signature.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if the string is empty, contains an
/// unknown type, or does not name the block itself (`?` or `@?`) right
/// after the return type.
///
/// # Example
///
/// ```
/// use oxibridge::runtime::encoding::parse_block_signature;
///
/// let sig = parse_block_signature("i12@?0i8").unwrap();
/// assert_eq!(sig.return_type(), "i");
/// assert_eq!(sig.arg_types(), ["i"]);
/// ```
pub fn parse_block_signature(encoding: &str) -> Result<BlockSignature> {
    let bytes = encoding.as_bytes();
    let mut types = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let end = read_type(bytes, pos)?;
        types.push(&encoding[pos..end]);
        pos = skip_offset(bytes, end);
    }

    if types.len() < 2 || !matches!(types[1], "?" | "@?") {
        return Err(Error::InvalidEncoding);
    }

    Ok(BlockSignature {
        return_type: types[0].to_string(),
        arg_types: types[2..].iter().map(|t| (*t).to_string()).collect(),
    })
}

/// Validates a block signature.
///
/// # Errors
///
/// See [`parse_block_signature`].
///
/// # Example
///
/// ```
/// use oxibridge::runtime::encoding::validate_block_signature;
///
/// assert!(validate_block_signature("i?i").is_ok());
/// assert!(validate_block_signature("v@?@").is_ok());
/// assert!(validate_block_signature("v@:").is_err()); // a method, not a block
/// ```
pub fn validate_block_signature(encoding: &str) -> Result<()> {
    parse_block_signature(encoding).map(|_| ())
}
