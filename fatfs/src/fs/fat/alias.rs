//! File name checks and 8.3 short alias generation
//!
//! # Alias Format
//!
//! - Base name: 1-8 characters, space padded
//! - Extension: 0-3 characters, space padded
//! - Characters: uppercase; control characters and the FAT-illegal set are
//!   replaced with underscore
//!
//! # Generation Algorithm
//!
//! 1. Drop spaces
//! 2. Split at the last dot; a leading dot does not start an extension
//! 3. Drop the remaining dots from the base
//! 4. Translate each character, keep up to 8 base and 3 extension chars
//! 5. If anything was cut, or the plain alias collides with a sibling,
//!    append "~N" right after the base (shortening it to make room) and
//!    raise N until no sibling uses the alias

use alloc::vec::Vec;
use super::error::{FatError, Resource, Result};

/// Alias of the "." entry
pub const DOT_ALIAS: [u8; 11] = *b".          ";

/// Alias of the ".." entry
pub const DOTDOT_ALIAS: [u8; 11] = *b"..         ";

/// Longest file name, in bytes
pub const MAX_NAME_LENGTH: usize = 255;

/// Base name length
pub const MAX_8DOT3_BASE: usize = 8;

/// Extension length
pub const MAX_8DOT3_EXT: usize = 3;

/// Highest "~N" number tried
const MAX_TILDE_NUMBER: u32 = 99;

/// Characters a long file name may not contain
const ILLEGAL_NAME_CHARS: [char; 9] = ['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

/// Characters replaced in a short alias, as a bitmask over ASCII 0-127
const ILLEGAL_ALIAS_CHARS: [u32; 4] = [
    0xFFFF_FFFF, // 0-31: all control characters
    0xFC00_DC04, // 32-63: " * + , . / : ; < = > ?
    0x3800_0000, // 64-95: [ \ ]
    0x1000_0000, // 96-127: |
];

/// Check that a long file name may be stored on a FAT volume
pub fn check_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FatError::Validation("empty file name"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(FatError::Validation("file name longer than 255 bytes"));
    }
    if name.starts_with(' ') {
        return Err(FatError::Validation("file name starts with a space"));
    }
    if name.contains(&ILLEGAL_NAME_CHARS[..]) {
        return Err(FatError::Validation("illegal character in file name"));
    }
    Ok(())
}

#[inline]
fn is_legal_alias_char(ch: u8) -> bool {
    let idx = (ch / 32) as usize;
    idx < 4 && ILLEGAL_ALIAS_CHARS[idx] & (1 << (ch % 32)) == 0
}

/// Translate one long-name character into an alias byte
fn xlate(ch: char) -> u8 {
    if !ch.is_ascii() {
        return b'_';
    }
    let b = ch as u8;
    if is_legal_alias_char(b) {
        b.to_ascii_uppercase()
    } else {
        b'_'
    }
}

/// Translated base and extension of a long name
struct AliasParts {
    base: Vec<u8>,
    ext: Vec<u8>,
    /// Some of the long name does not survive in the alias
    lossy: bool,
}

fn split_name(name: &str) -> AliasParts {
    let chars: Vec<char> = name.chars().filter(|&c| c != ' ').collect();

    let dot = chars.iter().rposition(|&c| c == '.').filter(|&i| i > 0);
    let (base_chars, ext_chars) = match dot {
        Some(i) => (&chars[..i], &chars[i + 1..]),
        None => (&chars[..], &[][..]),
    };

    let base_dots = base_chars.iter().filter(|&&c| c == '.').count();
    let mut base: Vec<u8> = base_chars.iter().filter(|&&c| c != '.').map(|&c| xlate(c)).collect();
    let mut ext: Vec<u8> = ext_chars.iter().map(|&c| xlate(c)).collect();

    let mut lossy = base_dots > 0 || base.len() > MAX_8DOT3_BASE || ext.len() > MAX_8DOT3_EXT;
    if base.is_empty() {
        base.push(b'_');
        lossy = true;
    }
    base.truncate(MAX_8DOT3_BASE);
    ext.truncate(MAX_8DOT3_EXT);

    AliasParts { base, ext, lossy }
}

/// Assemble an alias, with a "~N" tail when `number` is given
fn compose(parts: &AliasParts, number: Option<u32>) -> [u8; 11] {
    let mut alias = [b' '; 11];
    alias[..parts.base.len()].copy_from_slice(&parts.base);

    if let Some(n) = number {
        let mut tail = [b'~', 0, 0];
        let tail_len = if n >= 10 {
            tail[1] = b'0' + (n / 10) as u8;
            tail[2] = b'0' + (n % 10) as u8;
            3
        } else {
            tail[1] = b'0' + n as u8;
            2
        };
        let pos = parts.base.len().min(MAX_8DOT3_BASE - tail_len);
        alias[pos..pos + tail_len].copy_from_slice(&tail[..tail_len]);
    }

    alias[MAX_8DOT3_BASE..MAX_8DOT3_BASE + parts.ext.len()].copy_from_slice(&parts.ext);
    alias
}

/// Generate the 8.3 alias for `name`, unique among `siblings`.
///
/// Fails with `ResourceExhausted(AliasNumbers)` once "~99" is taken.
pub fn make_short_alias(name: &str, siblings: &[[u8; 11]]) -> Result<[u8; 11]> {
    match name {
        "." => return Ok(DOT_ALIAS),
        ".." => return Ok(DOTDOT_ALIAS),
        _ => {}
    }

    let parts = split_name(name);
    if !parts.lossy {
        let plain = compose(&parts, None);
        if !siblings.contains(&plain) {
            return Ok(plain);
        }
    }

    for n in 1..=MAX_TILDE_NUMBER {
        let alias = compose(&parts, Some(n));
        if !siblings.contains(&alias) {
            return Ok(alias);
        }
    }

    log::warn!(target: "fatfs", "no free short alias for {:?}", name);
    Err(FatError::ResourceExhausted(Resource::AliasNumbers))
}
