//! Source charset handling.
//!
//! Authored sources arrive either as cp932 (Shift_JIS) or UTF-8, usually
//! without any marker. Reading mirrors the reference tool: honor a forced
//! charset when one decodes cleanly, otherwise try both and pick the decode
//! with the lower "suspicious codepoint" penalty.

use std::path::Path;

use encoding_rs::SHIFT_JIS;

/// The two charsets scene sources are authored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Charset {
    Cp932,
    Utf8,
}

/// Parses the user-facing charset names (`jis`, `sjis`, `cp932`, `utf8`, ...).
pub fn normalize_charset(name: &str) -> Option<Charset> {
    match name.trim().to_ascii_lowercase().as_str() {
        "jis" | "sjis" | "shift_jis" | "shift-jis" | "cp932" | "ms932" | "windows-932" | "windows932" => {
            Some(Charset::Cp932)
        }
        "utf8" | "utf-8" | "utf_8" | "utf8-sig" | "utf-8-sig" => Some(Charset::Utf8),
        _ => None,
    }
}

fn decode_utf8_strict(bytes: &[u8]) -> Option<String> {
    let body = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    std::str::from_utf8(body).ok().map(str::to_owned)
}

fn decode_cp932_strict(bytes: &[u8]) -> Option<String> {
    SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|c| c.into_owned())
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Penalty score used to break ties between a valid UTF-8 decode and a
/// valid cp932 decode of the same bytes: control characters, C1 range,
/// halfwidth katakana and private-use codepoints all suggest the wrong
/// charset was used.
fn decode_penalty(text: &str) -> u32 {
    let mut score = 0;
    for ch in text.chars() {
        let o = ch as u32;
        if o < 32 && ch != '\n' && ch != '\t' {
            score += 2;
        } else if (0x80..=0x9F).contains(&o) {
            score += 2;
        } else if (0xFF61..=0xFF9F).contains(&o) {
            score += 1;
        } else if (0xE000..=0xF8FF).contains(&o) {
            score += 2;
        }
    }
    score
}

/// Decodes source bytes to text with normalized newlines.
///
/// A forced charset wins when it decodes cleanly. Otherwise both charsets
/// are tried: a BOM forces UTF-8, a decode that round-trips into cp932 is
/// ambiguous and resolved by [`decode_penalty`], and a decode error on one
/// side resolves to the other.
pub fn decode_source(bytes: &[u8], forced: Option<Charset>) -> String {
    if let Some(cs) = forced {
        let decoded = match cs {
            Charset::Cp932 => decode_cp932_strict(bytes),
            Charset::Utf8 => decode_utf8_strict(bytes),
        };
        if let Some(t) = decoded {
            return normalize_newlines(&t);
        }
    }
    let t8 = decode_utf8_strict(bytes);
    let t9 = decode_cp932_strict(bytes);
    match (t8, t9) {
        (None, None) => String::from_utf8_lossy(bytes).into_owned(),
        (Some(t), None) | (None, Some(t)) => normalize_newlines(&t),
        (Some(t8), Some(t9)) => {
            if bytes.starts_with(b"\xef\xbb\xbf") {
                return normalize_newlines(&t8);
            }
            if encode_cp932(&t8).len() < t8.chars().count() {
                // Not representable in cp932: must have been UTF-8.
                return normalize_newlines(&t8);
            }
            if decode_penalty(&t8) <= decode_penalty(&t9) {
                normalize_newlines(&t8)
            } else {
                normalize_newlines(&t9)
            }
        }
    }
}

/// Encodes to cp932, silently dropping unmappable characters.
pub fn encode_cp932(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for ch in text.chars() {
        let s = ch.encode_utf8(&mut buf);
        let (enc, _, had_errors) = SHIFT_JIS.encode(s);
        if !had_errors {
            out.extend_from_slice(&enc);
        }
    }
    out
}

/// True for characters that occupy two bytes in cp932 ("zenkaku").
///
/// Identifier scanning treats these as letter characters. Characters cp932
/// cannot represent fall back to a block-range check.
pub fn is_zenkaku(ch: char) -> bool {
    if ch == '\0' || (ch as u32) < 0x80 {
        return false;
    }
    let mut buf = [0u8; 4];
    let s = ch.encode_utf8(&mut buf);
    let (enc, _, had_errors) = SHIFT_JIS.encode(s);
    if !had_errors {
        return enc.len() == 2;
    }
    let o = ch as u32;
    (0x1100..=0x115F).contains(&o)
        || (0x2E80..=0xA4CF).contains(&o)
        || (0xAC00..=0xD7A3).contains(&o)
        || (0xF900..=0xFAFF).contains(&o)
        || (0xFF00..=0xFF60).contains(&o)
        || (0x20000..=0x3FFFD).contains(&o)
}

fn contains_jp(text: &str) -> bool {
    text.chars().any(|ch| {
        let o = ch as u32;
        (0x3040..=0x30FF).contains(&o) || (0x4E00..=0x9FFF).contains(&o) || (0x3400..=0x4DBF).contains(&o)
    })
}

/// Guesses the project charset by probing source files.
///
/// UTF-8 wins as soon as one file carries a BOM or decodes as UTF-8 while
/// containing Japanese text; otherwise cp932 is assumed.
pub fn guess_charset_from_files<P: AsRef<Path>>(paths: &[P]) -> Charset {
    for p in paths {
        let Ok(bytes) = std::fs::read(p) else { continue };
        if bytes.starts_with(b"\xef\xbb\xbf") {
            return Charset::Utf8;
        }
        if let Ok(text) = std::str::from_utf8(&bytes)
            && contains_jp(text)
        {
            return Charset::Utf8;
        }
    }
    Charset::Cp932
}

/// Encodes text as UTF-16LE bytes.
pub fn encode_utf16le(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decodes UTF-16LE bytes, replacing malformed units.
pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Number of UTF-16 code units in `text`.
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_aliases() {
        assert_eq!(normalize_charset("Shift_JIS"), Some(Charset::Cp932));
        assert_eq!(normalize_charset("utf-8-sig"), Some(Charset::Utf8));
        assert_eq!(normalize_charset("latin1"), None);
    }

    #[test]
    fn bom_forces_utf8() {
        let mut bytes = b"\xef\xbb\xbf".to_vec();
        bytes.extend_from_slice("abc\r\ndef".as_bytes());
        assert_eq!(decode_source(&bytes, None), "abc\ndef");
    }

    #[test]
    fn cp932_text_decodes() {
        // "あ" in cp932 is 0x82 0xA0.
        let bytes = [0x82u8, 0xA0];
        assert_eq!(decode_source(&bytes, Some(Charset::Cp932)), "\u{3042}");
    }

    #[test]
    fn zenkaku_detection() {
        assert!(is_zenkaku('\u{3042}'));
        assert!(is_zenkaku('\u{ff21}'));
        assert!(!is_zenkaku('a'));
        assert!(!is_zenkaku('\u{ff71}')); // halfwidth katakana is 1 byte
    }

    #[test]
    fn utf16_roundtrip() {
        let s = "hi\u{3042}";
        assert_eq!(decode_utf16le(&encode_utf16le(s)), s);
        assert_eq!(utf16_len(s), 3);
    }
}
