//! Lexical analyzer: post-CA text to an atom stream.
//!
//! Atoms carry `(id, line, kind, opt, subopt)`. String literals intern
//! into `str_list` (duplicates kept, in source order: the binary string
//! table indexes by literal occurrence). Identifiers intern into
//! `unknown_list` with duplicates folded; `*name` labels get sequential
//! ids with forward references allowed.

use ahash::AHashMap;

use crate::{
    ca::{is_ident_char, is_ident_start},
    error::ErrorCode,
    ia::StageError,
};

/// Fixed per-scene z-label capacity; `*z0` .. `*z99`.
pub const Z_LABEL_CNT: usize = 100;

/// Atom kinds. `opt`/`subopt` payloads are kind-specific: interned string
/// id for `ValStr`, label id for `Label`, `(z_index, backing_label_id)`
/// for `ZLabel`, the operator code once SA has classified an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AtomKind {
    None,
    Eof,
    OpenBrace,
    CloseBrace,
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    OpenSumi,
    CloseSumi,
    Comma,
    Dot,
    Colon,
    Label,
    ZLabel,
    ValInt,
    ValStr,
    Unknown,
    // keywords
    Command,
    Property,
    Goto,
    Gosub,
    GosubStr,
    Return,
    If,
    ElseIf,
    Else,
    For,
    While,
    Continue,
    Break,
    Switch,
    Case,
    Default,
    // operators
    Assign,
    PlusAssign,
    MinusAssign,
    MultipleAssign,
    DivideAssign,
    PercentAssign,
    AndAssign,
    OrAssign,
    HatAssign,
    SlAssign,
    SrAssign,
    Sr3Assign,
    Plus,
    Minus,
    Tilde,
    Multiple,
    Divide,
    Percent,
    And,
    Or,
    Hat,
    LogicalAnd,
    LogicalOr,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Sl,
    Sr,
    Sr3,
}

/// The LA unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Atom {
    pub id: u32,
    pub line: u32,
    pub kind: AtomKind,
    pub opt: i32,
    pub subopt: i32,
}

impl Atom {
    pub fn none() -> Self {
        Self {
            id: 0,
            line: 0,
            kind: AtomKind::None,
            opt: 0,
            subopt: 0,
        }
    }
}

/// A label name with the line it was first seen on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LabelDecl {
    pub name: String,
    pub line: u32,
}

/// Everything LA produces for one scene.
#[derive(Debug, Clone, Default)]
pub struct LexOutput {
    pub atoms: Vec<Atom>,
    pub str_list: Vec<String>,
    pub unknown_list: Vec<String>,
    pub label_list: Vec<LabelDecl>,
}

impl LexOutput {
    pub fn unknown_name(&self, opt: i32) -> &str {
        self.unknown_list.get(opt as usize).map_or("", String::as_str)
    }

    /// Atom at `i`, or a `None`-kind placeholder past the end.
    pub fn atom(&self, i: usize) -> Atom {
        self.atoms.get(i).copied().unwrap_or_else(|| {
            let mut a = Atom::none();
            a.id = i as u32;
            a
        })
    }
}

struct Lexer<'a> {
    text: &'a [char],
    i: usize,
    line: u32,
    out: LexOutput,
    unknown_map: AHashMap<String, usize>,
    label_map: AHashMap<String, usize>,
}

fn keyword(word: &str) -> Option<AtomKind> {
    Some(match word {
        "command" => AtomKind::Command,
        "property" => AtomKind::Property,
        "goto" => AtomKind::Goto,
        "gosub" => AtomKind::Gosub,
        "gosubstr" => AtomKind::GosubStr,
        "return" => AtomKind::Return,
        "if" => AtomKind::If,
        "elseif" => AtomKind::ElseIf,
        "else" => AtomKind::Else,
        "for" => AtomKind::For,
        "while" => AtomKind::While,
        "continue" => AtomKind::Continue,
        "break" => AtomKind::Break,
        "switch" => AtomKind::Switch,
        "case" => AtomKind::Case,
        "default" => AtomKind::Default,
        _ => return None,
    })
}

impl<'a> Lexer<'a> {
    fn push(&mut self, kind: AtomKind, opt: i32, subopt: i32) {
        let atom = Atom {
            id: self.out.atoms.len() as u32,
            line: self.line,
            kind,
            opt,
            subopt,
        };
        self.out.atoms.push(atom);
    }

    fn intern_unknown(&mut self, name: &str) -> i32 {
        if let Some(&id) = self.unknown_map.get(name) {
            return id as i32;
        }
        let id = self.out.unknown_list.len();
        self.out.unknown_list.push(name.to_owned());
        self.unknown_map.insert(name.to_owned(), id);
        id as i32
    }

    fn intern_label(&mut self, name: &str) -> i32 {
        if let Some(&id) = self.label_map.get(name) {
            return id as i32;
        }
        let id = self.out.label_list.len();
        self.out.label_list.push(LabelDecl {
            name: name.to_owned(),
            line: self.line,
        });
        self.label_map.insert(name.to_owned(), id);
        id as i32
    }

    fn read_ident(&mut self) -> String {
        let mut word = String::new();
        while self.i < self.text.len() && is_ident_char(self.text[self.i]) {
            word.push(self.text[self.i]);
            self.i += 1;
        }
        word
    }

    fn read_string(&mut self) -> String {
        // Opening quote already consumed; CA guarantees termination and
        // valid escapes.
        let mut s = String::new();
        while self.i < self.text.len() {
            let c = self.text[self.i];
            self.i += 1;
            match c {
                '"' => break,
                '\\' => {
                    let e = self.text.get(self.i).copied().unwrap_or('"');
                    self.i += 1;
                    s.push(match e {
                        'n' => '\n',
                        other => other,
                    });
                }
                other => s.push(other),
            }
        }
        s
    }

    fn lex(mut self) -> Result<LexOutput, StageError> {
        while self.i < self.text.len() {
            let c = self.text[self.i];
            match c {
                ' ' | '\t' => self.i += 1,
                '\n' => {
                    self.line += 1;
                    self.i += 1;
                }
                '"' => {
                    self.i += 1;
                    let s = self.read_string();
                    let id = self.out.str_list.len() as i32;
                    self.out.str_list.push(s);
                    self.push(AtomKind::ValStr, id, 0);
                }
                '\'' => {
                    self.i += 1;
                    let c = self.text[self.i];
                    self.i += 1;
                    let value = if c == '\\' {
                        let e = self.text[self.i];
                        self.i += 1;
                        match e {
                            'n' => '\n',
                            other => other,
                        }
                    } else {
                        c
                    };
                    self.i += 1; // closing quote, validated by CA
                    self.push(AtomKind::ValInt, value as i32, 0);
                }
                '0'..='9' => {
                    let value = self.read_number()?;
                    self.push(AtomKind::ValInt, value, 0);
                }
                '*' => {
                    if self.text.get(self.i + 1).copied().is_some_and(is_ident_start) {
                        self.i += 1;
                        let name = self.read_ident();
                        if let Some(zi) = parse_z_index(&name) {
                            let backing = self.intern_label(&name);
                            self.push(AtomKind::ZLabel, zi as i32, backing);
                        } else {
                            let id = self.intern_label(&name);
                            self.push(AtomKind::Label, id, 0);
                        }
                    } else if self.text.get(self.i + 1) == Some(&'=') {
                        self.i += 2;
                        self.push(AtomKind::MultipleAssign, 0, 0);
                    } else {
                        self.i += 1;
                        self.push(AtomKind::Multiple, 0, 0);
                    }
                }
                _ if is_ident_start(c) => {
                    let word = self.read_ident();
                    match keyword(&word) {
                        Some(kind) => self.push(kind, 0, 0),
                        None => {
                            let id = self.intern_unknown(&word);
                            self.push(AtomKind::Unknown, id, 0);
                        }
                    }
                }
                _ => self.lex_operator(c)?,
            }
        }
        self.push(AtomKind::Eof, 0, 0);
        Ok(self.out)
    }

    fn read_number(&mut self) -> Result<i32, StageError> {
        let mut s = String::new();
        if self.text[self.i] == '0' && matches!(self.text.get(self.i + 1), Some('x' | 'X')) {
            self.i += 2;
            while self.i < self.text.len() && self.text[self.i].is_ascii_hexdigit() {
                s.push(self.text[self.i]);
                self.i += 1;
            }
            return u32::from_str_radix(&s, 16)
                .map(|v| v as i32)
                .map_err(|_| StageError::new(ErrorCode::LaIllegalNumber, self.line));
        }
        while self.i < self.text.len() && self.text[self.i].is_ascii_digit() {
            s.push(self.text[self.i]);
            self.i += 1;
        }
        s.parse::<i64>()
            .ok()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| StageError::new(ErrorCode::LaIllegalNumber, self.line))
    }

    fn lex_operator(&mut self, c: char) -> Result<(), StageError> {
        use AtomKind::*;
        let next = self.text.get(self.i + 1).copied();
        let next2 = self.text.get(self.i + 2).copied();
        let next3 = self.text.get(self.i + 3).copied();
        let (kind, len) = match c {
            '{' => (OpenBrace, 1),
            '}' => (CloseBrace, 1),
            '(' => (OpenParen, 1),
            ')' => (CloseParen, 1),
            '[' => (OpenBracket, 1),
            ']' => (CloseBracket, 1),
            '\u{3010}' => (OpenSumi, 1),
            '\u{3011}' => (CloseSumi, 1),
            ',' => (Comma, 1),
            '.' => (Dot, 1),
            ':' => (Colon, 1),
            '~' => (Tilde, 1),
            '=' if next == Some('=') => (Equal, 2),
            '=' => (Assign, 1),
            '!' if next == Some('=') => (NotEqual, 2),
            '+' if next == Some('=') => (PlusAssign, 2),
            '+' => (Plus, 1),
            '-' if next == Some('=') => (MinusAssign, 2),
            '-' => (Minus, 1),
            '/' if next == Some('=') => (DivideAssign, 2),
            '/' => (Divide, 1),
            '%' if next == Some('=') => (PercentAssign, 2),
            '%' => (Percent, 1),
            '&' if next == Some('&') => (LogicalAnd, 2),
            '&' if next == Some('=') => (AndAssign, 2),
            '&' => (And, 1),
            '|' if next == Some('|') => (LogicalOr, 2),
            '|' if next == Some('=') => (OrAssign, 2),
            '|' => (Or, 1),
            '^' if next == Some('=') => (HatAssign, 2),
            '^' => (Hat, 1),
            '>' if next == Some('>') && next2 == Some('>') && next3 == Some('=') => (Sr3Assign, 4),
            '>' if next == Some('>') && next2 == Some('>') => (Sr3, 3),
            '>' if next == Some('>') && next2 == Some('=') => (SrAssign, 3),
            '>' if next == Some('>') => (Sr, 2),
            '>' if next == Some('=') => (GreaterEqual, 2),
            '>' => (Greater, 1),
            '<' if next == Some('<') && next2 == Some('=') => (SlAssign, 3),
            '<' if next == Some('<') => (Sl, 2),
            '<' if next == Some('=') => (LessEqual, 2),
            '<' => (Less, 1),
            _ => {
                return Err(StageError::new(ErrorCode::LaIllegalChar, self.line).with_hint(c.to_string()));
            }
        };
        self.i += len;
        self.push(kind, 0, 0);
        Ok(())
    }
}

/// `z` + digits -> z-slot index, when inside the fixed capacity.
fn parse_z_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix('z')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let v: usize = digits.parse().ok()?;
    (v < Z_LABEL_CNT).then_some(v)
}

/// Tokenizes post-CA scene text.
pub fn analyze(text: &str) -> Result<LexOutput, StageError> {
    let chars: Vec<char> = text.chars().collect();
    let lexer = Lexer {
        text: &chars,
        i: 0,
        line: 1,
        out: LexOutput::default(),
        unknown_map: AHashMap::new(),
        label_map: AHashMap::new(),
    };
    lexer.lex()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<AtomKind> {
        analyze(text).unwrap().atoms.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn minimal_scene_tokens() {
        let out = analyze("\n*z0\n\"hi\"\n").unwrap();
        assert_eq!(out.atoms[0].kind, AtomKind::ZLabel);
        assert_eq!(out.atoms[0].opt, 0);
        assert_eq!(out.atoms[1].kind, AtomKind::ValStr);
        assert_eq!(out.str_list[out.atoms[1].opt as usize], "hi");
        assert_eq!(out.atoms[2].kind, AtomKind::Eof);
        assert_eq!(out.label_list[0].name, "z0");
    }

    #[test]
    fn labels_and_z_labels() {
        let out = analyze("*start *z12 *z999 goto *start\n").unwrap();
        assert_eq!(out.atoms[0].kind, AtomKind::Label);
        assert_eq!(out.atoms[1].kind, AtomKind::ZLabel);
        assert_eq!(out.atoms[1].opt, 12);
        // Past the z capacity it is an ordinary label.
        assert_eq!(out.atoms[2].kind, AtomKind::Label);
        // Forward/backward references share one id.
        assert_eq!(out.atoms[4].opt, out.atoms[0].opt);
        assert_eq!(out.label_list.len(), 3);
    }

    #[test]
    fn operator_maximal_munch() {
        use AtomKind::*;
        assert_eq!(kinds("a >>>= b"), vec![Unknown, Sr3Assign, Unknown, Eof]);
        assert_eq!(kinds("a >>> b"), vec![Unknown, Sr3, Unknown, Eof]);
        assert_eq!(kinds("a >>= b"), vec![Unknown, SrAssign, Unknown, Eof]);
        assert_eq!(kinds("a >= b"), vec![Unknown, GreaterEqual, Unknown, Eof]);
        assert_eq!(kinds("a && b || c"), vec![Unknown, LogicalAnd, Unknown, LogicalOr, Unknown, Eof]);
    }

    #[test]
    fn star_disambiguation() {
        use AtomKind::*;
        assert_eq!(kinds("a * b"), vec![Unknown, Multiple, Unknown, Eof]);
        assert_eq!(kinds("a *= b"), vec![Unknown, MultipleAssign, Unknown, Eof]);
        assert_eq!(kinds("goto *top"), vec![Goto, Label, Eof]);
    }

    #[test]
    fn literals() {
        let out = analyze("123 0x10 'a' '\\n' \"x\\\"y\"\n").unwrap();
        assert_eq!(out.atoms[0].opt, 123);
        assert_eq!(out.atoms[1].opt, 16);
        assert_eq!(out.atoms[2].opt, i32::from(b'a'));
        assert_eq!(out.atoms[3].opt, 10);
        assert_eq!(out.str_list[0], "x\"y");
    }

    #[test]
    fn duplicate_strings_are_kept_in_order() {
        let out = analyze("\"a\" \"b\" \"a\"\n").unwrap();
        assert_eq!(out.str_list, vec!["a", "b", "a"]);
        assert_eq!(out.atoms[2].opt, 2);
    }

    #[test]
    fn unknown_identifiers_deduplicate() {
        let out = analyze("foo bar foo\n").unwrap();
        assert_eq!(out.unknown_list, vec!["foo", "bar"]);
        assert_eq!(out.atoms[0].opt, out.atoms[2].opt);
    }

    #[test]
    fn speaker_name_brackets() {
        let out = analyze("\u{3010}\"narrator\"\u{3011}\n").unwrap();
        assert_eq!(out.atoms[0].kind, AtomKind::OpenSumi);
        assert_eq!(out.atoms[1].kind, AtomKind::ValStr);
        assert_eq!(out.atoms[2].kind, AtomKind::CloseSumi);
    }

    #[test]
    fn atom_ids_are_sequential() {
        let out = analyze("a = 1\n").unwrap();
        for (i, a) in out.atoms.iter().enumerate() {
            assert_eq!(a.id as usize, i);
        }
    }
}
