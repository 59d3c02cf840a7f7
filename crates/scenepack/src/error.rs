//! Structured compile/link errors.
//!
//! Every failure in the toolchain is reported as a [`CompileError`]: an
//! error code plus the source position it was detected at. The driver
//! prints them as `CODE at FILE:LINE` on stderr and exits with status 1.

use std::fmt;

use strum::{Display, IntoStaticStr};

/// Result type alias for operations that can produce a compile error.
pub type CompileResult<T> = Result<T, CompileError>;

/// Every error kind the toolchain can report.
///
/// The variants are grouped by the stage that raises them. Uses strum
/// derives so the wire name is the SCREAMING_SNAKE_CASE variant name,
/// which is the form users grep for in build logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // --- character analyzer ---
    UnclosedQuote,
    UnclosedComment,
    IllegalEscape,
    NewlineInQuote,
    SingleQuoteLength,
    IfdefMismatch,
    IfdefOverflow,
    IncRegionMismatch,
    MacroLoop,
    MacroArg,

    // --- include analyzer ---
    IaMissingFile,
    IaDuplicateName,
    IaUnterminatedBlock,
    IaIllegalDirective,
    IaIllegalForm,

    // --- lexical analyzer ---
    LaIllegalChar,
    LaIllegalNumber,

    // --- syntactic analyzer ---
    SaSentenceIllegal,
    SaBlockIllegalSentence,
    SaBlockNoCloseBrace,
    SaLabelOverlapped,
    SaZLabelOverlapped,
    SaLabelNotExist,
    SaZLabel00NotExist,
    SaDefPropIllegalName,
    SaDefPropIllegalForm,
    SaDefPropNoCloseBracket,
    SaDefCmdIllegalName,
    SaDefCmdIllegalArg,
    SaDefCmdNoComma,
    SaDefCmdIllegalForm,
    SaDefCmdNoOpenBrace,
    SaDefCmdAlreadyDefined,
    SaDefCmdTypeNoMatch,
    SaDefCmdArgTypeNoMatch,
    SaDefCmdNotExist,
    SaGotoNoLabel,
    SaReturnIllegalExp,
    SaReturnNoCloseParen,
    SaIfNoOpenParen,
    SaIfIllegalCond,
    SaIfNoCloseParen,
    SaIfNoOpenBrace,
    SaIfIllegalBlock,
    SaIfNoCloseBrace,
    SaForNoOpenParen,
    SaForIllegalInit,
    SaForNoInitComma,
    SaForIllegalCond,
    SaForNoCondComma,
    SaForIllegalLoop,
    SaForNoCloseParen,
    SaForNoOpenBrace,
    SaForIllegalBlock,
    SaForNoCloseBrace,
    SaWhileNoOpenParen,
    SaWhileIllegalCond,
    SaWhileNoCloseParen,
    SaWhileNoOpenBrace,
    SaWhileIllegalBlock,
    SaWhileNoCloseBrace,
    SaSwitchNoOpenParen,
    SaSwitchIllegalCond,
    SaSwitchNoCloseParen,
    SaSwitchNoOpenBrace,
    SaSwitchIllegalCase,
    SaSwitchNoCloseBrace,
    SaCaseNoOpenParen,
    SaCaseIllegalValue,
    SaCaseNoCloseParen,
    SaDefaultRedefine,
    SaAssignIllegalRight,
    SaExpIllegal,
    SaExpListNoCloseBracket,
    SaSmpExpNoCloseParen,
    SaElementIllegalExp,
    SaElementNoClose,
    SaElementNoChild,
    SaArgListNoCloseParen,
    SaNameIllegalName,
    SaNameNoCloseSumi,

    // --- meaning analyzer ---
    MaElementUnknown,
    MaElementIsProperty,
    MaElementIllegalArray,
    MaIndexNotInt,
    MaPropertyOutOfCommand,
    MaDefPropNotInt,
    MaIfCondIsNotInt,
    MaForCondIsNotInt,
    MaWhileCondIsNotInt,
    MaCaseTypeMismatch,
    MaSelCannotUseInGoto,
    MaSelCannotUseInCond,
    MaSelCannotUseInArg,
    MaSelCannotUseInIndex,
    MaAssignTypeNoMatch,
    MaAssignLeftNeedReference,
    MaArgTypeNoMatch,
    MaExpTypeNoMatch,
    MaCmdNoNamedArgList,
    MaCmdIllegalNamedArg,

    // --- binary save ---
    BsIllegalDefaultArg,
    BsContinueNoLoop,
    BsBreakNoLoop,
    BsNeedReference,
    BsNeedValue,

    // --- linker ---
    LinkCmdNotDefined,
    LinkCmdMultiplyDefined,
    LinkMissingScene,

    // --- codecs (extract side) ---
    LzssCorrupt,
    Md5Mismatch,
    AngouMissingKey,
    AngouBadVersion,
    AngouTruncated,

    // --- gameexe ini ---
    GeiParse,

    // --- filesystem and everything else ---
    Io,
    UnkError,
}

/// A structured error with the source position it was detected at.
///
/// `file` is the basename of the offending input; `line` is 1-based.
/// `hint` carries extra context when one exists (an unresolved element
/// name, the underlying io message).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompileError {
    pub code: ErrorCode,
    pub file: String,
    pub line: u32,
    pub hint: Option<String>,
}

impl CompileError {
    pub fn new(code: ErrorCode, file: impl Into<String>, line: u32) -> Self {
        Self {
            code,
            file: file.into(),
            line,
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Wraps an io error with the path it occurred on.
    pub fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::new(ErrorCode::Io, path, 0).with_hint(err.to_string())
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(h) => write!(f, "{}({}) at {}:{}", self.code, h, self.file, self.line),
            None => write!(f, "{} at {}:{}", self.code, self.file, self.line),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_display_in_screaming_snake_case() {
        assert_eq!(ErrorCode::MaElementUnknown.to_string(), "MA_ELEMENT_UNKNOWN");
        assert_eq!(ErrorCode::BsBreakNoLoop.to_string(), "BS_BREAK_NO_LOOP");
    }

    #[test]
    fn display_includes_position_and_hint() {
        let err = CompileError::new(ErrorCode::SaGotoNoLabel, "title.ss", 12);
        assert_eq!(err.to_string(), "SA_GOTO_NO_LABEL at title.ss:12");
        let err = err.with_hint("bgm_stop");
        assert_eq!(err.to_string(), "SA_GOTO_NO_LABEL(bgm_stop) at title.ss:12");
    }
}
