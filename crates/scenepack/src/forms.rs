//! Semantic type tags ("forms") and element codes.
//!
//! Forms are a closed set with stable integer codes that appear verbatim
//! in the emitted bytecode. References pair with values through
//! [`Form::dereference`]; `intref` is the l-value of `int`, and so on.

use strum::{Display, IntoStaticStr};

/// A semantic type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[repr(i32)]
pub enum Form {
    Void = 0,
    Int = 2,
    IntList = 3,
    IntRef = 5,
    IntListRef = 6,
    Str = 7,
    StrList = 8,
    StrRef = 10,
    StrListRef = 11,
    Label = 13,
    Global = 25,
    Scene = 26,
    Call = 27,
    Mwnd = 30,
    List = 100,
    #[strum(serialize = "__args")]
    Args = 101,
    #[strum(serialize = "__argsref")]
    ArgsRef = 102,
    Object = 1310,
}

impl Form {
    /// The stable wire code.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Void,
            2 => Self::Int,
            3 => Self::IntList,
            5 => Self::IntRef,
            6 => Self::IntListRef,
            7 => Self::Str,
            8 => Self::StrList,
            10 => Self::StrRef,
            11 => Self::StrListRef,
            13 => Self::Label,
            25 => Self::Global,
            26 => Self::Scene,
            27 => Self::Call,
            30 => Self::Mwnd,
            100 => Self::List,
            101 => Self::Args,
            102 => Self::ArgsRef,
            1310 => Self::Object,
            _ => return None,
        })
    }

    /// Resolves any form name, including scope forms.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "void" => Self::Void,
            "int" => Self::Int,
            "intlist" => Self::IntList,
            "intref" => Self::IntRef,
            "intlistref" => Self::IntListRef,
            "str" => Self::Str,
            "strlist" => Self::StrList,
            "strref" => Self::StrRef,
            "strlistref" => Self::StrListRef,
            "label" => Self::Label,
            "global" => Self::Global,
            "scene" => Self::Scene,
            "call" => Self::Call,
            "mwnd" => Self::Mwnd,
            "list" => Self::List,
            "__args" => Self::Args,
            "__argsref" => Self::ArgsRef,
            "object" => Self::Object,
            _ => return None,
        })
    }

    /// Forms that may appear in a `property name: form` declaration.
    pub fn from_decl_name(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Self::Int),
            "str" => Some(Self::Str),
            "intlist" => Some(Self::IntList),
            "strlist" => Some(Self::StrList),
            _ => None,
        }
    }

    /// Value forms live on the stack directly; everything else is a
    /// reference or a scope.
    pub fn is_value(self) -> bool {
        matches!(self, Self::Void | Self::Int | Self::Str | Self::IntList | Self::StrList)
    }

    pub fn is_reference(self) -> bool {
        !self.is_value()
    }

    /// `intref -> int`, `strref -> str`, lists likewise; identity otherwise.
    pub fn dereference(self) -> Self {
        match self {
            Self::IntRef => Self::Int,
            Self::StrRef => Self::Str,
            Self::IntListRef => Self::IntList,
            Self::StrListRef => Self::StrList,
            other => other,
        }
    }

    /// The reference form of a value form, if it has one.
    pub fn reference(self) -> Self {
        match self {
            Self::Int => Self::IntRef,
            Self::Str => Self::StrRef,
            Self::IntList => Self::IntListRef,
            Self::StrList => Self::StrListRef,
            other => other,
        }
    }

    pub fn is_int_like(self) -> bool {
        matches!(self, Self::Int | Self::IntRef)
    }

    pub fn is_str_like(self) -> bool {
        matches!(self, Self::Str | Self::StrRef)
    }
}

/// Whether an element names storage or behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ElementKind {
    Property,
    Command,
}

/// Element code owners (the top byte of a packed element code).
pub const ELM_OWNER_SYSTEM: u8 = 0;
pub const ELM_OWNER_USER_PROP: u8 = 1;
pub const ELM_OWNER_USER_CMD: u8 = 2;
pub const ELM_OWNER_CALL_PROP: u8 = 3;

/// Packs `(owner << 24 | group << 16 | index)`.
pub fn create_elm_code(owner: u8, group: u8, index: u16) -> i32 {
    (i32::from(owner) << 24) | (i32::from(group) << 16) | i32::from(index)
}

/// The owner byte of a packed element code.
pub fn elm_owner(code: i32) -> u8 {
    ((code >> 24) & 0xFF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dereference_pairs() {
        assert_eq!(Form::IntRef.dereference(), Form::Int);
        assert_eq!(Form::StrListRef.dereference(), Form::StrList);
        assert_eq!(Form::Int.dereference(), Form::Int);
        assert_eq!(Form::Int.reference(), Form::IntRef);
    }

    #[test]
    fn elm_code_packing() {
        let code = create_elm_code(2, 1, 0x1234);
        assert_eq!(code, 0x0201_1234);
        assert_eq!(elm_owner(code), 2);
    }

    #[test]
    fn names_roundtrip() {
        for f in [Form::Int, Form::StrListRef, Form::Args, Form::Mwnd] {
            assert_eq!(Form::from_name(&f.to_string()), Some(f));
            assert_eq!(Form::from_code(f.code()), Some(f));
        }
    }
}
