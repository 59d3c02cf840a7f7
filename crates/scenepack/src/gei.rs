//! `Gameexe.ini` sanitizing and the `Gameexe.dat` envelope.
//!
//! The ini scanner strips comments and uppercases ASCII outside of double
//! quotes (the engine reads keys case-folded upward). The `.dat` is an
//! 8-byte `<i32 0, i32 mode>` header followed by
//! `LZSS(UTF-16LE(sanitized))` XORed with the baseline key, plus a second
//! XOR layer keyed on the exe secret when one is configured (`mode = 1`).

use crate::{
    codec::{lzss, xor::xor_cycle_inplace},
    error::ErrorCode,
    ia::StageError,
    keys::{EXE_ANGOU_A_IDX, EXE_ANGOU_B_IDX},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IniState {
    Normal,
    Double,
    DoubleEscape,
    LineComment,
    BlockComment,
}

/// Strips comments and folds lowercase ASCII upward, leaving quoted text
/// untouched.
pub fn sanitize_ini(input: &str) -> Result<String, StageError> {
    use IniState::*;
    let text: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut line = 1u32;
    let mut block_line = 1u32;
    let mut st = Normal;
    let mut i = 0;
    while i < text.len() {
        let c = text[i];
        let mut emit = c;
        if c == '\n' {
            match st {
                Double | DoubleEscape => {
                    return Err(StageError::new(ErrorCode::GeiParse, line).with_hint("newline in quotes"));
                }
                LineComment => st = Normal,
                _ => {}
            }
            line += 1;
        } else {
            match st {
                Double => {
                    if c == '\\' {
                        st = DoubleEscape;
                    }
                    if c == '"' {
                        st = Normal;
                    }
                }
                DoubleEscape => {
                    if c == '\\' || c == '"' {
                        st = Double;
                    } else {
                        return Err(StageError::new(ErrorCode::GeiParse, line).with_hint("invalid escape"));
                    }
                }
                LineComment => {
                    i += 1;
                    continue;
                }
                BlockComment => {
                    if c == '*' && text.get(i + 1) == Some(&'/') {
                        st = Normal;
                        i += 2;
                        continue;
                    }
                    i += 1;
                    continue;
                }
                Normal => {
                    if c == '"' {
                        st = Double;
                    } else if c == ';' {
                        st = LineComment;
                        i += 1;
                        continue;
                    } else if c == '/' && text.get(i + 1) == Some(&'/') {
                        st = LineComment;
                        i += 2;
                        continue;
                    } else if c == '/' && text.get(i + 1) == Some(&'*') {
                        block_line = line;
                        st = BlockComment;
                        i += 2;
                        continue;
                    } else if c.is_ascii_lowercase() {
                        emit = c.to_ascii_uppercase();
                    }
                }
            }
        }
        out.push(emit);
        i += 1;
    }
    match st {
        Double | DoubleEscape => Err(StageError::new(ErrorCode::GeiParse, line).with_hint("unclosed quote")),
        BlockComment => Err(StageError::new(ErrorCode::GeiParse, block_line).with_hint("unclosed comment")),
        _ => Ok(out),
    }
}

/// Both encodings of a `Gameexe.dat`: the baseline one and, when an exe
/// secret is active, the doubly-encrypted variant.
#[derive(Debug, Clone)]
pub struct GameexeDat {
    /// Mode 0: baseline XOR only.
    pub plain: Vec<u8>,
    /// Mode 1: baseline + exe XOR. Present iff a secret was supplied.
    pub keyed: Option<Vec<u8>>,
}

/// Encodes sanitized ini text.
pub fn encode_gameexe(sanitized: &str, base_key: &[u8], exe_el: Option<&[u8; 16]>, lzss_level: u32) -> GameexeDat {
    let payload = if sanitized.is_empty() {
        Vec::new()
    } else {
        let mut lz = lzss::pack_level(&crate::charset::encode_utf16le(sanitized), lzss_level);
        xor_cycle_inplace(&mut lz, base_key, 0);
        lz
    };
    let mut plain = Vec::with_capacity(8 + payload.len());
    plain.extend_from_slice(&0i32.to_le_bytes());
    plain.extend_from_slice(&0i32.to_le_bytes());
    plain.extend_from_slice(&payload);
    let keyed = exe_el.map(|el| {
        let mut keyed_payload = payload.clone();
        xor_cycle_inplace(&mut keyed_payload, el, 0);
        let mut out = Vec::with_capacity(8 + keyed_payload.len());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&keyed_payload);
        out
    });
    GameexeDat { plain, keyed }
}

/// Decodes a `Gameexe.dat` back to the sanitized ini text.
///
/// `exe_el` is required when the mode flag says the second layer was
/// applied; [`ErrorCode::AngouMissingKey`] is returned when it is absent.
pub fn decode_gameexe(dat: &[u8], base_key: &[u8], exe_el: Option<&[u8; 16]>) -> Result<String, ErrorCode> {
    if dat.len() < 8 {
        return Err(ErrorCode::LzssCorrupt);
    }
    let mode = i32::from_le_bytes(dat[4..8].try_into().unwrap());
    let mut payload = dat[8..].to_vec();
    if payload.is_empty() {
        return Ok(String::new());
    }
    if mode != 0 {
        let Some(el) = exe_el else {
            return Err(ErrorCode::AngouMissingKey);
        };
        xor_cycle_inplace(&mut payload, el, 0);
    }
    xor_cycle_inplace(&mut payload, base_key, 0);
    let raw = lzss::unpack(&payload).ok_or(ErrorCode::LzssCorrupt)?;
    Ok(crate::charset::decode_utf16le(&raw))
}

/// Renders the `EXE_ANGOU.h` companion header: the 16-byte key block laid
/// out through the two fixed permutations, CRLF line ends.
pub fn exe_angou_header(el: &[u8; 16]) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(18);
    for (i, &idx) in EXE_ANGOU_A_IDX.iter().enumerate() {
        lines.push(format!("#define\tKN_EXE_ANGOU_DATA{i:02}A\t0x{:02X}", el[idx]));
    }
    lines.push(String::new());
    for (i, &idx) in EXE_ANGOU_B_IDX.iter().enumerate() {
        lines.push(format!("#define\tKN_EXE_ANGOU_DATA{i:02}B\t0x{:02X}", el[idx]));
    }
    lines.push(String::new());
    lines.join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::angou::exe_angou_element, keys::GAMEEXE_DAT_ANGOU_CODE};
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_uppercases_and_strips_comments() {
        let out = sanitize_ini("#screen = 1 ; note\n#title.name = \"My Game\" // x\n").unwrap();
        assert_eq!(out, "#SCREEN = 1 \n#TITLE.NAME = \"My Game\" \n");
    }

    #[test]
    fn sanitize_errors() {
        assert!(sanitize_ini("\"abc\nd\"").is_err());
        assert!(sanitize_ini("/* x").is_err());
    }

    #[test]
    fn gameexe_roundtrip_mode0() {
        let ini = "#A = 1\n#B = \"text\"\n";
        let dat = encode_gameexe(ini, GAMEEXE_DAT_ANGOU_CODE, None, 17);
        assert!(dat.keyed.is_none());
        assert_eq!(&dat.plain[..8], &[0, 0, 0, 0, 0, 0, 0, 0]);
        let back = decode_gameexe(&dat.plain, GAMEEXE_DAT_ANGOU_CODE, None).unwrap();
        assert_eq!(back, ini);
    }

    #[test]
    fn gameexe_roundtrip_mode1() {
        let ini = "#KEYED = 1\n";
        let el = exe_angou_element(b"password");
        let dat = encode_gameexe(ini, GAMEEXE_DAT_ANGOU_CODE, Some(&el), 17);
        let keyed = dat.keyed.expect("keyed variant");
        assert_eq!(i32::from_le_bytes(keyed[4..8].try_into().unwrap()), 1);
        // Decoding without the key must fail; with it, roundtrips.
        assert_eq!(
            decode_gameexe(&keyed, GAMEEXE_DAT_ANGOU_CODE, None),
            Err(ErrorCode::AngouMissingKey)
        );
        let back = decode_gameexe(&keyed, GAMEEXE_DAT_ANGOU_CODE, Some(&el)).unwrap();
        assert_eq!(back, ini);
        // Both variants decode to the same text.
        assert_eq!(decode_gameexe(&dat.plain, GAMEEXE_DAT_ANGOU_CODE, None).unwrap(), ini);
    }

    #[test]
    fn empty_ini_encodes_to_bare_header() {
        let dat = encode_gameexe("", GAMEEXE_DAT_ANGOU_CODE, None, 17);
        assert_eq!(dat.plain.len(), 8);
        assert_eq!(decode_gameexe(&dat.plain, GAMEEXE_DAT_ANGOU_CODE, None).unwrap(), "");
    }

    #[test]
    fn angou_header_shape() {
        let el = exe_angou_element(b"password");
        let text = exe_angou_header(&el);
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines.len(), 18);
        assert!(lines[0].starts_with("#define\tKN_EXE_ANGOU_DATA00A\t0x"));
        assert!(lines[9].starts_with("#define\tKN_EXE_ANGOU_DATA00B\t0x"));
        assert_eq!(lines[8], "");
        assert_eq!(lines[17], "");
    }
}
