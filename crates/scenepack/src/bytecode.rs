//! The stack-machine instruction set and the byte stream builder.

use strum::{Display, IntoStaticStr};

/// Opcodes, one byte each. The numeric values are part of the archive
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Opcode {
    #[strum(serialize = "CD_NONE")]
    None = 0,
    #[strum(serialize = "CD_NL")]
    Nl = 1,
    #[strum(serialize = "CD_PUSH")]
    Push = 2,
    #[strum(serialize = "CD_POP")]
    Pop = 3,
    #[strum(serialize = "CD_COPY")]
    Copy = 4,
    #[strum(serialize = "CD_PROPERTY")]
    Property = 5,
    #[strum(serialize = "CD_COPY_ELM")]
    CopyElm = 6,
    #[strum(serialize = "CD_DEC_PROP")]
    DecProp = 7,
    #[strum(serialize = "CD_ELM_POINT")]
    ElmPoint = 8,
    #[strum(serialize = "CD_ARG")]
    Arg = 9,
    #[strum(serialize = "CD_GOTO")]
    Goto = 16,
    #[strum(serialize = "CD_GOTO_TRUE")]
    GotoTrue = 17,
    #[strum(serialize = "CD_GOTO_FALSE")]
    GotoFalse = 18,
    #[strum(serialize = "CD_GOSUB")]
    Gosub = 19,
    #[strum(serialize = "CD_GOSUBSTR")]
    GosubStr = 20,
    #[strum(serialize = "CD_RETURN")]
    Return = 21,
    #[strum(serialize = "CD_EOF")]
    Eof = 22,
    #[strum(serialize = "CD_ASSIGN")]
    Assign = 32,
    #[strum(serialize = "CD_OPERATE_1")]
    Operate1 = 33,
    #[strum(serialize = "CD_OPERATE_2")]
    Operate2 = 34,
    #[strum(serialize = "CD_COMMAND")]
    Command = 48,
    #[strum(serialize = "CD_TEXT")]
    Text = 49,
    #[strum(serialize = "CD_NAME")]
    Name = 50,
    #[strum(serialize = "CD_SEL_BLOCK_START")]
    SelBlockStart = 51,
    #[strum(serialize = "CD_SEL_BLOCK_END")]
    SelBlockEnd = 52,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Nl,
            2 => Self::Push,
            3 => Self::Pop,
            4 => Self::Copy,
            5 => Self::Property,
            6 => Self::CopyElm,
            7 => Self::DecProp,
            8 => Self::ElmPoint,
            9 => Self::Arg,
            16 => Self::Goto,
            17 => Self::GotoTrue,
            18 => Self::GotoFalse,
            19 => Self::Gosub,
            20 => Self::GosubStr,
            21 => Self::Return,
            22 => Self::Eof,
            32 => Self::Assign,
            33 => Self::Operate1,
            34 => Self::Operate2,
            48 => Self::Command,
            49 => Self::Text,
            50 => Self::Name,
            51 => Self::SelBlockStart,
            52 => Self::SelBlockEnd,
            _ => return None,
        })
    }
}

/// Growable little-endian byte stream for bytecode and section emission.
#[derive(Debug, Default, Clone)]
pub struct BinaryStream {
    buf: Vec<u8>,
}

impl BinaryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push_op(&mut self, op: Opcode) {
        self.buf.push(op as u8);
    }

    pub fn push_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn push_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn push_utf16(&mut self, s: &str) {
        for unit in s.encode_utf16() {
            self.push_u16(unit);
        }
    }

    pub fn write_i32_at(&mut self, ofs: usize, v: i32) {
        self.buf[ofs..ofs + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_roundtrip() {
        for op in [
            Opcode::None,
            Opcode::Nl,
            Opcode::Goto,
            Opcode::Return,
            Opcode::Eof,
            Opcode::Assign,
            Opcode::Command,
            Opcode::SelBlockEnd,
        ] {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(99), None);
        assert_eq!(Opcode::Command as u8, 48);
        assert_eq!(Opcode::Goto as u8, 16);
    }

    #[test]
    fn stream_emits_little_endian() {
        let mut s = BinaryStream::new();
        s.push_op(Opcode::Push);
        s.push_i32(-2);
        s.push_u16(0x1234);
        assert_eq!(s.as_bytes(), &[2, 0xFE, 0xFF, 0xFF, 0xFF, 0x34, 0x12]);
        s.write_i32_at(1, 7);
        assert_eq!(&s.as_bytes()[1..5], &[7, 0, 0, 0]);
    }
}
