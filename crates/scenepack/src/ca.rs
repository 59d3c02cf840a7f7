//! Character analyzer: the three text passes that run before lexing.
//!
//! Pass 1 strips comments with a scanner state machine and lowers ASCII
//! uppercase outside quotes. Pass 2 resolves `#ifdef` conditionals against
//! the shared name set and carves out `#inc_start ... #inc_end` regions.
//! Pass 3 hoists scene-local declarations into the include analyzer and
//! expands the remaining text through the replace/macro machinery to a
//! fixed point.

use crate::{
    charset::is_zenkaku,
    error::ErrorCode,
    forms::Form,
    ia::{IncAnalyzer, IncData, ReplaceEngine, StageError},
};

pub fn is_ident_start(c: char) -> bool {
    c == '_' || c == '@' || c.is_ascii_alphabetic() || is_zenkaku(c)
}

pub fn is_ident_char(c: char) -> bool {
    c == '_' || c == '@' || c.is_ascii_alphanumeric() || is_zenkaku(c)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    SingleOpen,
    SingleEscape,
    SingleClose,
    Double,
    DoubleEscape,
    LineComment,
    BlockComment,
}

/// Pass 1: comment strip + case normalization.
///
/// Comments (`;`, `//`, `/* */`) disappear entirely; ASCII uppercase
/// becomes lowercase outside quotes; quote and escape errors are caught
/// here so later passes can assume well-formed literals.
pub fn normalize_pass(input: &str) -> Result<String, StageError> {
    use ScanState::*;
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
                SingleOpen | SingleEscape | SingleClose => {
                    return Err(StageError::new(ErrorCode::NewlineInQuote, line));
                }
                Double | DoubleEscape => {
                    return Err(StageError::new(ErrorCode::NewlineInQuote, line));
                }
                LineComment => st = Normal,
                _ => {}
            }
            line += 1;
        } else {
            match st {
                SingleOpen => {
                    if c == '\\' {
                        st = SingleEscape;
                    } else if c == '\'' {
                        return Err(StageError::new(ErrorCode::SingleQuoteLength, line));
                    } else {
                        st = SingleClose;
                    }
                }
                SingleEscape => {
                    if c == '\\' || c == '\'' || c == 'n' {
                        st = SingleClose;
                    } else {
                        return Err(StageError::new(ErrorCode::IllegalEscape, line));
                    }
                }
                SingleClose => {
                    if c == '\'' {
                        st = Normal;
                    } else {
                        return Err(StageError::new(ErrorCode::SingleQuoteLength, line));
                    }
                }
                Double => {
                    if c == '\\' {
                        st = DoubleEscape;
                    } else if c == '"' {
                        st = Normal;
                    }
                }
                DoubleEscape => {
                    if c == '\\' || c == '"' || c == 'n' {
                        st = Double;
                    } else {
                        return Err(StageError::new(ErrorCode::IllegalEscape, line));
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
                    if c == '\'' {
                        st = SingleOpen;
                    } else if c == '"' {
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
                        i += 1;
                        continue;
                    } else if c.is_ascii_uppercase() {
                        emit = c.to_ascii_lowercase();
                    }
                }
            }
        }
        out.push(emit);
        i += 1;
    }
    match st {
        SingleOpen | SingleEscape | SingleClose | Double | DoubleEscape => {
            Err(StageError::new(ErrorCode::UnclosedQuote, line))
        }
        BlockComment => Err(StageError::new(ErrorCode::UnclosedComment, block_line)),
        _ => Ok(out),
    }
}

fn match_str(text: &[char], i: usize, pat: &str) -> Option<usize> {
    let pat: Vec<char> = pat.chars().collect();
    if i + pat.len() <= text.len() && text[i..i + pat.len()] == pat[..] {
        Some(i + pat.len())
    } else {
        None
    }
}

fn scan_word(text: &[char], mut i: usize) -> (usize, String) {
    while i < text.len() && (text[i] == ' ' || text[i] == '\t') {
        i += 1;
    }
    let mut word = String::new();
    if i < text.len() && is_ident_start(text[i]) {
        word.push(text[i]);
        i += 1;
        while i < text.len() && is_ident_char(text[i]) {
            word.push(text[i]);
            i += 1;
        }
    }
    (i, word)
}

const IFDEF_DEPTH: usize = 16;

/// Pass 2: `#ifdef` resolution and `#inc_start` region extraction.
///
/// Returns `(scene_text, inc_text)`. Newlines are kept in the scene text
/// even inside suppressed regions so line numbers survive.
fn conditional_pass(input: &str, inc: &IncData) -> Result<(String, String), StageError> {
    use ScanState::*;
    let text: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut inc_out = String::new();
    let mut line = 1u32;
    let mut st = Normal;
    // Per level: 0 inactive, 1 taken, 2 skipping, 3 taken-done.
    let mut ifs = [0u8; IFDEF_DEPTH];
    let mut depth = 0usize;
    let mut in_inc = false;
    let mut i = 0;
    while i < text.len() {
        let c = text[i];
        if c == '\n' {
            match st {
                SingleOpen | SingleEscape | SingleClose | Double | DoubleEscape => {
                    return Err(StageError::new(ErrorCode::NewlineInQuote, line));
                }
                _ => {}
            }
            line += 1;
        } else {
            match st {
                SingleOpen => {
                    st = if c == '\\' { SingleEscape } else { SingleClose };
                }
                SingleEscape => st = SingleClose,
                SingleClose => {
                    if c == '\'' {
                        st = Normal;
                    }
                }
                Double => {
                    if c == '\\' {
                        st = DoubleEscape;
                    } else if c == '"' {
                        st = Normal;
                    }
                }
                DoubleEscape => st = Double,
                _ => {
                    if c == '\'' {
                        st = SingleOpen;
                    } else if c == '"' {
                        st = Double;
                    } else if let Some(j) = match_str(&text, i, "#ifdef") {
                        let (j2, word) = scan_word(&text, j);
                        if word.is_empty() {
                            return Err(StageError::new(ErrorCode::IfdefMismatch, line).with_hint("missing word after #ifdef"));
                        }
                        depth += 1;
                        if depth >= IFDEF_DEPTH {
                            return Err(StageError::new(ErrorCode::IfdefOverflow, line));
                        }
                        ifs[depth] = if inc.name_set.contains(&word) { 1 } else { 2 };
                        i = j2;
                        continue;
                    } else if let Some(j) = match_str(&text, i, "#elseifdef") {
                        if ifs[depth] == 0 {
                            return Err(StageError::new(ErrorCode::IfdefMismatch, line).with_hint("#elseifdef"));
                        }
                        let (j2, word) = scan_word(&text, j);
                        if word.is_empty() {
                            return Err(
                                StageError::new(ErrorCode::IfdefMismatch, line).with_hint("missing word after #elseifdef")
                            );
                        }
                        i = j2;
                        match ifs[depth] {
                            3 => {}
                            1 => ifs[depth] = 3,
                            _ => ifs[depth] = if inc.name_set.contains(&word) { 1 } else { 2 },
                        }
                        continue;
                    } else if let Some(j) = match_str(&text, i, "#else") {
                        if ifs[depth] == 0 {
                            return Err(StageError::new(ErrorCode::IfdefMismatch, line).with_hint("#else"));
                        }
                        i = j;
                        match ifs[depth] {
                            3 => {}
                            1 => ifs[depth] = 3,
                            _ => ifs[depth] = 1,
                        }
                        continue;
                    } else if let Some(j) = match_str(&text, i, "#endif") {
                        if ifs[depth] == 0 {
                            return Err(StageError::new(ErrorCode::IfdefMismatch, line).with_hint("#endif"));
                        }
                        depth -= 1;
                        i = j;
                        continue;
                    } else if let Some(j) = match_str(&text, i, "#inc_start") {
                        in_inc = true;
                        i = j;
                        continue;
                    } else if let Some(j) = match_str(&text, i, "#inc_end") {
                        if !in_inc {
                            return Err(StageError::new(ErrorCode::IncRegionMismatch, line).with_hint("#inc_end"));
                        }
                        in_inc = false;
                        i = j;
                        continue;
                    }
                }
            }
        }
        if c == '\n' {
            if in_inc {
                inc_out.push(c);
            }
            out.push(c);
        } else if ifs[depth] <= 1 {
            if in_inc {
                inc_out.push(c);
            } else {
                out.push(c);
            }
        }
        i += 1;
    }
    match st {
        SingleOpen | SingleEscape | SingleClose | Double | DoubleEscape => {
            return Err(StageError::new(ErrorCode::UnclosedQuote, line));
        }
        _ => {}
    }
    if in_inc {
        return Err(StageError::new(ErrorCode::IncRegionMismatch, line).with_hint("unclosed #inc_start"));
    }
    if depth > 0 {
        return Err(StageError::new(ErrorCode::IfdefMismatch, line).with_hint("unclosed #ifdef"));
    }
    Ok((out, inc_out))
}

const DECL_PREFIXES: [&str; 7] = [
    "#replace", "#define", "#define_s", "#macro", "#property", "#command", "#expand",
];

fn is_decl_line(line: &str) -> bool {
    let t = line.trim_start();
    !t.starts_with("##") && DECL_PREFIXES.iter().any(|p| t.starts_with(p))
}

/// Pass 3 helper: hoists scene-local declaration lines (with their brace
/// continuations) into a separate buffer, blanking them in place.
fn hoist_declarations(scene: &str) -> (String, String) {
    let mut lines: Vec<String> = scene.split('\n').map(str::to_owned).collect();
    let mut defs = String::new();
    let mut i = 0;
    while i < lines.len() {
        if !is_decl_line(&lines[i]) {
            i += 1;
            continue;
        }
        let opens_block = lines[i].trim_end().ends_with('{');
        defs.push_str(&lines[i]);
        defs.push('\n');
        lines[i].clear();
        i += 1;
        if opens_block {
            while i < lines.len() {
                let done = lines[i].trim() == "}";
                defs.push_str(&lines[i]);
                defs.push('\n');
                lines[i].clear();
                i += 1;
                if done {
                    break;
                }
            }
        }
    }
    (lines.join("\n"), defs)
}

/// Runs all three passes over one scene's source.
///
/// `inc` is the scene's private copy of the shared declaration table;
/// scene-local declarations land in its scene scope. Returns the fully
/// expanded executable text.
pub fn analyze_file(input: &str, inc: &mut IncData) -> Result<String, StageError> {
    let input = input.replace('\r', "");
    let normalized = normalize_pass(&input)?;
    let (scene, inc_region) = conditional_pass(&normalized, inc)?;
    if !inc_region.trim().is_empty() {
        let mut ia = IncAnalyzer::new(&inc_region, Form::Scene, inc);
        let pending = ia.step1().map_err(|e| e.with_hint_prefix("inc"))?;
        ia.step2(pending).map_err(|e| e.with_hint_prefix("inc"))?;
    }
    let (scene, defs) = hoist_declarations(&scene);
    if !defs.trim().is_empty() {
        let mut ia = IncAnalyzer::new(&defs, Form::Scene, inc);
        let pending = ia.step1()?;
        ia.step2(pending)?;
    }
    let mut engine = ReplaceEngine::new(&inc.replace_tree);
    engine.expand_text(&scene)
}

impl StageError {
    fn with_hint_prefix(mut self, prefix: &str) -> Self {
        self.hint = Some(match self.hint.take() {
            Some(h) => format!("{prefix}: {h}"),
            None => prefix.to_owned(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> Result<String, StageError> {
        let mut inc = IncData::new();
        analyze_file(text, &mut inc)
    }

    #[test]
    fn comments_and_case() {
        // Newlines survive even inside comments so line numbers hold.
        let out = normalize_pass("ABC ; tail\nx // y\na /* b\nc */ d\n").unwrap();
        assert_eq!(out, "abc \nx \na \n d\n");
    }

    #[test]
    fn quotes_keep_case_and_comment_chars() {
        let out = normalize_pass("\"ABC;//\" DEF\n").unwrap();
        assert_eq!(out, "\"ABC;//\" def\n");
    }

    #[test]
    fn quote_errors() {
        assert_eq!(normalize_pass("\"abc\n\"").unwrap_err().code, ErrorCode::NewlineInQuote);
        assert_eq!(normalize_pass("\"abc").unwrap_err().code, ErrorCode::UnclosedQuote);
        assert_eq!(normalize_pass("/* abc").unwrap_err().code, ErrorCode::UnclosedComment);
        assert_eq!(normalize_pass("'ab'").unwrap_err().code, ErrorCode::SingleQuoteLength);
        assert_eq!(normalize_pass("\"a\\q\"").unwrap_err().code, ErrorCode::IllegalEscape);
    }

    #[test]
    fn ifdef_selects_defined_branch() {
        let mut inc = IncData::new();
        inc.name_set.insert("jp".to_owned());
        let text = "#ifdef jp\nA\n#else\nB\n#endif\n";
        let normalized = normalize_pass(text).unwrap();
        let (scene, _) = conditional_pass(&normalized, &inc).unwrap();
        assert!(scene.contains('a'));
        assert!(!scene.contains('b'));
    }

    #[test]
    fn elseifdef_chain() {
        let mut inc = IncData::new();
        inc.name_set.insert("two".to_owned());
        let text = "#ifdef one\nA\n#elseifdef two\nB\n#else\nC\n#endif\n";
        let normalized = normalize_pass(text).unwrap();
        let (scene, _) = conditional_pass(&normalized, &inc).unwrap();
        assert!(!scene.contains('a'));
        assert!(scene.contains('b'));
        assert!(!scene.contains('c'));
    }

    #[test]
    fn unmatched_endif_is_an_error() {
        let mut inc = IncData::new();
        let err = conditional_pass("#endif\n", &inc).unwrap_err();
        assert_eq!(err.code, ErrorCode::IfdefMismatch);
        let err = conditional_pass("#ifdef x\n", &mut inc).unwrap_err();
        assert_eq!(err.code, ErrorCode::IfdefMismatch);
    }

    #[test]
    fn inc_region_feeds_declarations() {
        let text = "#inc_start\n#property hp: int\n#inc_end\n*z0\n";
        let mut inc = IncData::new();
        let out = analyze_file(text, &mut inc).unwrap();
        assert_eq!(inc.property_cnt, 1);
        // Scene-local declarations do not move the inc boundary.
        assert_eq!(inc.inc_property_cnt, 0);
        assert!(out.contains("*z0"));
    }

    #[test]
    fn scene_local_declarations_are_hoisted() {
        let text = "#property hp: int\n*z0\nhp = 1\n";
        let mut inc = IncData::new();
        let out = analyze_file(text, &mut inc).unwrap();
        assert_eq!(inc.property_cnt, 1);
        assert!(!out.contains("#property"));
        assert!(out.contains("hp = 1"));
    }

    #[test]
    fn replacement_applies_to_scene_text() {
        let text = "#replace hero \"Arle\"\nhero\n";
        let out = run(text).unwrap();
        assert!(out.contains("\"Arle\""));
    }

    #[test]
    fn preserved_line_count_through_suppression() {
        let mut inc = IncData::new();
        let text = "#ifdef nope\nxxx\n#endif\nrest\n";
        let normalized = normalize_pass(text).unwrap();
        let (scene, _) = conditional_pass(&normalized, &inc).unwrap();
        // Three newlines survive ahead of `rest`.
        assert_eq!(scene, "\n\n\nrest\n");
    }
}
