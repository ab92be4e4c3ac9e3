//! Remote file-name rules.
//!
//! The service rejects a handful of characters outright and caps names at
//! 255 UTF-8 bytes and 256 characters. `validate` says whether a name would
//! be accepted; `clean` turns an arbitrary string into an acceptable one,
//! replacing bad characters and truncating on a character boundary while
//! keeping the extension. Cleaning any input yields a name that validates.

use thiserror::Error;

pub const MAX_NAME_BYTES: usize = 255;
pub const MAX_NAME_CHARS: usize = 256;

const FORBIDDEN: &[char] = &['"', '\\', '/', ':', '*', '?', '|', '>', '<'];

/// Substituted when cleaning leaves nothing usable.
const DEFAULT_NAME: &str = "untitled";

#[derive(Debug, Error, PartialEq)]
pub enum NameError {
    #[error("file name is empty or all whitespace")]
    Empty,
    #[error("file name exceeds {MAX_NAME_BYTES} bytes")]
    TooManyBytes,
    #[error("file name exceeds {MAX_NAME_CHARS} characters")]
    TooManyChars,
    #[error("file name contains forbidden character {0:?}")]
    ForbiddenChar(char),
    #[error("file name is not valid UTF-8")]
    InvalidUtf8,
}

pub fn validate(name: &str) -> Result<(), NameError> {
    if name.trim().is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(NameError::TooManyBytes);
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(NameError::TooManyChars);
    }
    if let Some(bad) = name.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(NameError::ForbiddenChar(bad));
    }
    Ok(())
}

/// Byte-level entry point for callers holding raw names.
pub fn validate_bytes(name: &[u8]) -> Result<(), NameError> {
    let name = std::str::from_utf8(name).map_err(|_| NameError::InvalidUtf8)?;
    validate(name)
}

/// Rewrites a name until it validates: forbidden characters become `_`,
/// whitespace is trimmed, oversize names are truncated in front of the
/// extension, and an unusable result falls back to a default.
pub fn clean(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        return DEFAULT_NAME.to_string();
    }
    truncate_keeping_extension(trimmed)
}

fn truncate_keeping_extension(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES && name.chars().count() <= MAX_NAME_CHARS {
        return name.to_string();
    }
    let (stem, extension) = match name.rfind('.') {
        // A leading dot is a hidden file, not an extension.
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    // An extension so long it cannot fit gets truncated away with the rest.
    let extension = if extension.len() >= MAX_NAME_BYTES / 2 {
        ""
    } else {
        extension
    };
    let stem_byte_budget = MAX_NAME_BYTES - extension.len();
    let stem_char_budget = MAX_NAME_CHARS - extension.chars().count();

    let mut out = String::with_capacity(stem_byte_budget);
    for (chars, c) in stem.chars().enumerate() {
        if chars + 1 > stem_char_budget || out.len() + c.len_utf8() > stem_byte_budget {
            break;
        }
        out.push(c);
    }
    let out = out.trim_end();
    if out.is_empty() {
        return DEFAULT_NAME.to_string();
    }
    format!("{out}{extension}")
}

/// Synthesises a name that is not in `taken`: the base itself, then
/// `base (n).ext` for n up to 999, then a timestamp suffix.
pub fn unique_name(base: &str, taken: &dyn Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let (stem, extension) = match base.rfind('.') {
        Some(dot) if dot > 0 => (&base[..dot], &base[dot..]),
        _ => (base, ""),
    };
    for n in 1..=999 {
        let candidate = clean(&format!("{stem} ({n}){extension}"));
        if !taken(&candidate) {
            return candidate;
        }
    }
    clean(&format!(
        "{stem} ({}){extension}",
        chrono::Utc::now().timestamp()
    ))
}
