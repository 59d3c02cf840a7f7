//! Include analyzer: shared declaration tables built from `.inc` files.
//!
//! Runs in two phases. Step 1 parses one file's directives, registering
//! replace/define/macro rules immediately (later files see earlier rules)
//! and queueing property/command declarations. Step 2 merges the queued
//! declarations into the shared table, assigning ids and checking for
//! contradictions. The same analyzer handles scene-local declarations with
//! the scene scope as target.
//!
//! Directives: `#replace`, `#define`, `#define_s`, `#macro`, `#property`,
//! `#command`, `#expand`.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::{
    ca,
    elements::{ArgTemplate, Element, ElementOrigin, FormTable, OverloadMap},
    error::ErrorCode,
    forms::{ELM_OWNER_USER_CMD, ELM_OWNER_USER_PROP, ElementKind, Form, create_elm_code},
};

/// Expansion iterations (without progress) tolerated before `MACRO_LOOP`.
pub const EXPAND_STALL_CAP: u32 = 10_000;

/// A stage-local error: code + line, wrapped with the filename by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub code: ErrorCode,
    pub line: u32,
    pub hint: Option<String>,
}

impl StageError {
    pub fn new(code: ErrorCode, line: u32) -> Self {
        Self { code, line, hint: None }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// What to substitute when a registered name is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceKind {
    /// Substitute and continue scanning after the replacement.
    Replace,
    /// Substitute and re-scan the replacement.
    Define,
    /// Substitute the macro body after argument substitution.
    Macro,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroArg {
    pub name: String,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub kind: ReplaceKind,
    pub name: String,
    pub after: String,
    pub args: Vec<MacroArg>,
}

/// Prefix trie over replacement names. Search returns the longest
/// registered name starting at a position.
#[derive(Debug, Clone, Default)]
pub struct ReplaceTree {
    children: AHashMap<char, ReplaceTree>,
    leaf: Option<Arc<Replacement>>,
}

impl ReplaceTree {
    pub fn add(&mut self, rep: Arc<Replacement>) {
        let mut node = self;
        for ch in rep.name.chars() {
            node = node.children.entry(ch).or_default();
        }
        node.leaf = Some(rep);
    }

    pub fn search(&self, text: &[char], pos: usize) -> Option<Arc<Replacement>> {
        let mut node = self;
        let mut best = None;
        let mut i = pos;
        loop {
            if let Some(leaf) = &node.leaf {
                best = Some(leaf.clone());
            }
            if i >= text.len() {
                break;
            }
            match node.children.get(&text[i]) {
                Some(child) => {
                    node = child;
                    i += 1;
                }
                None => break,
            }
        }
        best
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.leaf.is_none()
    }
}

/// Nested macro invocations tolerated before the expansion is declared
/// non-terminating.
const MACRO_DEPTH_CAP: u32 = 64;

/// Runs the replace/define/macro machinery over character buffers.
pub struct ReplaceEngine<'a> {
    default_rt: &'a ReplaceTree,
    pub line: u32,
    depth: u32,
}

impl<'a> ReplaceEngine<'a> {
    pub fn new(default_rt: &'a ReplaceTree) -> Self {
        Self {
            default_rt,
            line: 1,
            depth: 0,
        }
    }

    /// One scan step at `pos`: applies the longest replacement registered
    /// in either tree, or advances one character. Returns the new position.
    fn std_replace(&mut self, text: &mut Vec<char>, pos: usize, added: &ReplaceTree) -> Result<usize, StageError> {
        let r1 = self.default_rt.search(text, pos);
        let r2 = if added.is_empty() { None } else { added.search(text, pos) };
        let rep = match (r1, r2) {
            (None, None) => return Ok(pos + 1),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (Some(a), Some(b)) => {
                if a.name > b.name {
                    a
                } else {
                    b
                }
            }
        };
        let name_len = rep.name.chars().count();
        match rep.kind {
            ReplaceKind::Replace => {
                let after: Vec<char> = rep.after.chars().collect();
                let after_len = after.len();
                text.splice(pos..pos + name_len, after);
                Ok(pos + after_len)
            }
            ReplaceKind::Define => {
                text.splice(pos..pos + name_len, rep.after.chars());
                Ok(pos)
            }
            ReplaceKind::Macro => {
                let (end, body) = self.expand_macro(text, pos + name_len, &rep, added)?;
                let body: Vec<char> = body.chars().collect();
                let body_len = body.len();
                text.splice(pos..end, body);
                Ok(pos + body_len)
            }
        }
    }

    /// Parses a macro's actual arguments at `p` and substitutes them into
    /// the body. Returns the end of the invocation and the expanded body.
    fn expand_macro(
        &mut self,
        text: &[char],
        mut p: usize,
        mac: &Replacement,
        added: &ReplaceTree,
    ) -> Result<(usize, String), StageError> {
        let mut actuals: Vec<String> = Vec::new();
        if p < text.len() && text[p] == '(' {
            p += 1;
            let mut depth = 0u32;
            let mut start = p;
            loop {
                if p >= text.len() {
                    return Err(StageError::new(ErrorCode::MacroArg, self.line)
                        .with_hint("reached end of file while parsing macro"));
                }
                match text[p] {
                    '\'' => {
                        p += 1;
                        while p < text.len() {
                            if text[p] == '\'' {
                                p += 1;
                                break;
                            }
                            p += if text[p] == '\\' { 2 } else { 1 };
                        }
                    }
                    '"' => {
                        p += 1;
                        while p < text.len() {
                            if text[p] == '"' {
                                p += 1;
                                break;
                            }
                            p += if text[p] == '\\' { 2 } else { 1 };
                        }
                    }
                    '(' => {
                        depth += 1;
                        p += 1;
                    }
                    ',' if depth == 0 => {
                        if start == p {
                            return Err(StageError::new(ErrorCode::MacroArg, self.line).with_hint("empty macro argument"));
                        }
                        actuals.push(text[start..p].iter().collect());
                        p += 1;
                        start = p;
                    }
                    ')' if depth == 0 => {
                        if start == p && actuals.is_empty() {
                            p += 1;
                        } else if start == p {
                            return Err(StageError::new(ErrorCode::MacroArg, self.line).with_hint("empty macro argument"));
                        } else {
                            actuals.push(text[start..p].iter().collect());
                            p += 1;
                        }
                        break;
                    }
                    ')' => {
                        depth -= 1;
                        p += 1;
                    }
                    _ => p += 1,
                }
            }
        }
        if mac.args.is_empty() && !actuals.is_empty() {
            return Err(StageError::new(ErrorCode::MacroArg, self.line)
                .with_hint("macro without parameters does not take arguments"));
        }
        if actuals.len() > mac.args.len() {
            return Err(StageError::new(ErrorCode::MacroArg, self.line).with_hint("too many macro arguments"));
        }
        self.depth += 1;
        if self.depth > MACRO_DEPTH_CAP {
            self.depth -= 1;
            return Err(StageError::new(ErrorCode::MacroLoop, self.line).with_hint(mac.name.clone()));
        }
        let body = self.substitute_macro_body(mac, &actuals, added);
        self.depth -= 1;
        Ok((p, body?))
    }

    fn substitute_macro_body(
        &mut self,
        mac: &Replacement,
        actuals: &[String],
        added: &ReplaceTree,
    ) -> Result<String, StageError> {
        let mut arg_tree = ReplaceTree::default();
        for (i, formal) in mac.args.iter().enumerate() {
            let after = match actuals.get(i) {
                Some(a) => a.clone(),
                None => match &formal.default {
                    Some(d) if !d.is_empty() => d.clone(),
                    _ => {
                        return Err(StageError::new(ErrorCode::MacroArg, self.line).with_hint("not enough macro arguments"));
                    }
                },
            };
            // Actual arguments are themselves expanded before substitution.
            let after = self.expand_fragment(&after, added)?;
            arg_tree.add(Arc::new(Replacement {
                kind: ReplaceKind::Replace,
                name: formal.name.clone(),
                after,
                args: Vec::new(),
            }));
        }
        self.expand_fragment(&mac.after, &arg_tree)
    }

    /// Expands a fragment to completion without line tracking.
    fn expand_fragment(&mut self, fragment: &str, added: &ReplaceTree) -> Result<String, StageError> {
        let mut text: Vec<char> = fragment.chars().collect();
        let mut pos = 0;
        let mut stall = 0u32;
        let mut rest_min = text.len() + 1;
        while pos < text.len() {
            pos = self.std_replace(&mut text, pos, added)?;
            let rest = text.len().saturating_sub(pos);
            if rest >= rest_min {
                stall += 1;
                if stall > EXPAND_STALL_CAP {
                    return Err(StageError::new(ErrorCode::MacroLoop, self.line));
                }
            } else {
                rest_min = rest;
                stall = 0;
            }
        }
        Ok(text.into_iter().collect())
    }

    /// Expands whole source text: tracks line numbers across newlines and
    /// enforces the stall cap.
    pub fn expand_text(&mut self, input: &str) -> Result<String, StageError> {
        let empty = ReplaceTree::default();
        let mut text: Vec<char> = input.chars().collect();
        let mut pos = 0;
        let mut stall = 0u32;
        let mut rest_min = text.len() + 1;
        self.line = 1;
        while pos < text.len() {
            if text[pos] == '\n' {
                self.line += 1;
                pos += 1;
            } else {
                pos = self.std_replace(&mut text, pos, &empty)?;
            }
            let rest = text.len().saturating_sub(pos);
            if rest >= rest_min {
                stall += 1;
                if stall > EXPAND_STALL_CAP {
                    return Err(StageError::new(ErrorCode::MacroLoop, self.line));
                }
            } else {
                rest_min = rest;
                stall = 0;
            }
        }
        Ok(text.into_iter().collect())
    }
}

/// An `.inc`-declared (or scene-local) property.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IncProperty {
    pub id: usize,
    pub name: String,
    pub form: Form,
    pub size: i32,
}

/// An `.inc`-declared (or scene-local) command signature.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IncCommand {
    pub id: usize,
    pub name: String,
    pub form: Form,
    pub args: Vec<ArgTemplate>,
    pub is_defined: bool,
}

/// The shared declaration table, built once and cloned per scene.
#[derive(Debug, Clone, Default)]
pub struct IncData {
    pub replace_tree: ReplaceTree,
    pub name_set: AHashSet<String>,
    pub property_list: Vec<IncProperty>,
    pub command_list: Vec<IncCommand>,
    pub property_cnt: usize,
    pub command_cnt: usize,
    /// Boundary between `.inc`-declared and scene-local properties.
    pub inc_property_cnt: usize,
    /// Boundary between `.inc`-declared and scene-local commands.
    pub inc_command_cnt: usize,
    pub form_table: FormTable,
}

impl IncData {
    pub fn new() -> Self {
        Self {
            form_table: FormTable::new_system(),
            ..Self::default()
        }
    }

    pub fn find_command(&self, name: &str) -> Option<&IncCommand> {
        self.command_list.iter().find(|c| c.name == name)
    }

    /// Registers a command declared or defined in source, adding it to the
    /// form table of `scope`. Returns the assigned id.
    pub fn push_command(&mut self, scope: Form, name: &str, form: Form, args: Vec<ArgTemplate>, is_defined: bool) -> usize {
        let id = self.command_cnt;
        self.command_cnt += 1;
        let mut overloads = OverloadMap::new();
        overloads.insert(0, args.clone());
        self.command_list.push(IncCommand {
            id,
            name: name.to_owned(),
            form,
            args,
            is_defined,
        });
        self.name_set.insert(name.to_owned());
        self.form_table.add(
            scope,
            Element {
                kind: ElementKind::Command,
                code: create_elm_code(ELM_OWNER_USER_CMD, 0, id as u16),
                name: name.to_owned(),
                form,
                size: 0,
                overloads,
                origin: ElementOrigin::User,
            },
        );
        id
    }

    fn push_property(&mut self, scope: Form, name: &str, form: Form, size: i32) -> usize {
        let id = self.property_cnt;
        self.property_cnt += 1;
        self.property_list.push(IncProperty {
            id,
            name: name.to_owned(),
            form,
            size,
        });
        self.name_set.insert(name.to_owned());
        self.form_table.add(
            scope,
            Element {
                kind: ElementKind::Property,
                code: create_elm_code(ELM_OWNER_USER_PROP, 0, id as u16),
                name: name.to_owned(),
                form,
                size,
                overloads: OverloadMap::new(),
                origin: ElementOrigin::User,
            },
        );
        id
    }
}

#[derive(Debug, Clone)]
struct PendingProp {
    name: String,
    form: Form,
    size: i32,
    line: u32,
}

#[derive(Debug, Clone)]
struct PendingCmd {
    name: String,
    form: Form,
    args: Vec<ArgTemplate>,
    line: u32,
}

/// Per-file provisional declarations produced by step 1.
#[derive(Debug, Clone, Default)]
pub struct ProvisionalDecls {
    props: Vec<PendingProp>,
    cmds: Vec<PendingCmd>,
}

/// Two-phase analyzer over one directive source.
pub struct IncAnalyzer<'a> {
    target_scope: Form,
    shared: &'a mut IncData,
    text: String,
}

impl<'a> IncAnalyzer<'a> {
    /// `target_scope` is [`Form::Global`] for `.inc` files and
    /// [`Form::Scene`] for scene-local declaration blocks.
    pub fn new(text: &str, target_scope: Form, shared: &'a mut IncData) -> Self {
        Self {
            target_scope,
            shared,
            text: text.to_owned(),
        }
    }

    /// Parses directives: rewrite rules take effect immediately, property
    /// and command declarations are queued for [`Self::step2`].
    pub fn step1(&mut self) -> Result<ProvisionalDecls, StageError> {
        let normalized = ca::normalize_pass(&self.text)?;
        let mut pending = ProvisionalDecls::default();
        self.parse_directives(&normalized, 1, 0, &mut pending)?;
        Ok(pending)
    }

    fn parse_directives(
        &mut self,
        text: &str,
        first_line: u32,
        depth: u32,
        pending: &mut ProvisionalDecls,
    ) -> Result<(), StageError> {
        if depth > 16 {
            return Err(StageError::new(ErrorCode::MacroLoop, first_line).with_hint("#expand recursion"));
        }
        let mut lines: Vec<(u32, String)> = Vec::new();
        for (i, l) in text.split('\n').enumerate() {
            lines.push((first_line + i as u32, l.to_owned()));
        }
        let mut idx = 0;
        while idx < lines.len() {
            let (line_no, raw) = lines[idx].clone();
            idx += 1;
            let line = raw.trim();
            if line.is_empty() || !line.starts_with('#') || line.starts_with("##") {
                continue;
            }
            let (directive, rest) = split_word(line);
            match directive {
                "#replace" | "#define" | "#define_s" => {
                    let (name, after) = split_word(rest);
                    if name.is_empty() {
                        return Err(StageError::new(ErrorCode::IaIllegalDirective, line_no).with_hint(directive));
                    }
                    let (kind, after) = match directive {
                        "#replace" => (ReplaceKind::Replace, after.to_owned()),
                        "#define" => (ReplaceKind::Define, after.to_owned()),
                        _ => (ReplaceKind::Define, format!("\"{after}\"")),
                    };
                    self.shared.name_set.insert(name.to_owned());
                    self.shared.replace_tree.add(Arc::new(Replacement {
                        kind,
                        name: name.to_owned(),
                        after,
                        args: Vec::new(),
                    }));
                }
                "#macro" => {
                    let (head, mut body) = split_macro_head(rest);
                    let (name, args) =
                        parse_macro_head(&head).ok_or_else(|| StageError::new(ErrorCode::IaIllegalDirective, line_no))?;
                    if body.trim_start().starts_with('{') {
                        // Brace-block macro: body runs until a lone `}`.
                        let mut collected = String::new();
                        let after_brace = body.trim_start()[1..].to_owned();
                        if !after_brace.trim().is_empty() {
                            collected.push_str(&after_brace);
                            collected.push('\n');
                        }
                        let mut closed = false;
                        while idx < lines.len() {
                            let (_, l) = lines[idx].clone();
                            idx += 1;
                            if l.trim() == "}" {
                                closed = true;
                                break;
                            }
                            collected.push_str(&l);
                            collected.push('\n');
                        }
                        if !closed {
                            return Err(StageError::new(ErrorCode::IaUnterminatedBlock, line_no).with_hint(name));
                        }
                        body = collected;
                    } else {
                        body = body.trim().to_owned();
                    }
                    self.shared.name_set.insert(name.clone());
                    self.shared.replace_tree.add(Arc::new(Replacement {
                        kind: ReplaceKind::Macro,
                        name,
                        after: body,
                        args,
                    }));
                }
                "#property" => {
                    let rest = self.expand_line(rest, line_no)?;
                    let decl = parse_property_decl(&rest)
                        .ok_or_else(|| StageError::new(ErrorCode::IaIllegalDirective, line_no).with_hint("#property"))?;
                    pending.props.push(PendingProp {
                        name: decl.0,
                        form: decl.1,
                        size: decl.2,
                        line: line_no,
                    });
                }
                "#command" => {
                    let rest = self.expand_line(rest, line_no)?;
                    let decl = parse_command_decl(&rest)
                        .ok_or_else(|| StageError::new(ErrorCode::IaIllegalDirective, line_no).with_hint("#command"))?;
                    pending.cmds.push(PendingCmd {
                        name: decl.0,
                        form: decl.1,
                        args: decl.2,
                        line: line_no,
                    });
                }
                "#expand" => {
                    let expanded = self.expand_line(rest, line_no)?;
                    self.parse_directives(&expanded, line_no, depth + 1, pending)?;
                }
                _ => {
                    return Err(StageError::new(ErrorCode::IaIllegalDirective, line_no).with_hint(directive));
                }
            }
        }
        Ok(())
    }

    fn expand_line(&mut self, text: &str, line_no: u32) -> Result<String, StageError> {
        let mut engine = ReplaceEngine::new(&self.shared.replace_tree);
        engine.line = line_no;
        let empty = ReplaceTree::default();
        engine.expand_fragment(text, &empty).map_err(|mut e| {
            e.line = line_no;
            e
        })
    }

    /// Merges the provisional declarations into the shared table.
    pub fn step2(&mut self, pending: ProvisionalDecls) -> Result<(), StageError> {
        for p in pending.props {
            if let Some(existing) = self.shared.property_list.iter().find(|x| x.name == p.name) {
                if existing.form != p.form || existing.size != p.size {
                    return Err(StageError::new(ErrorCode::IaDuplicateName, p.line).with_hint(p.name));
                }
                continue;
            }
            if self.shared.find_command(&p.name).is_some() {
                return Err(StageError::new(ErrorCode::IaDuplicateName, p.line).with_hint(p.name));
            }
            self.shared.push_property(self.target_scope, &p.name, p.form, p.size);
        }
        for c in pending.cmds {
            if let Some(existing) = self.shared.find_command(&c.name) {
                if existing.form != c.form || existing.args != c.args {
                    return Err(StageError::new(ErrorCode::IaDuplicateName, c.line).with_hint(c.name));
                }
                continue;
            }
            if self.shared.property_list.iter().any(|x| x.name == c.name) {
                return Err(StageError::new(ErrorCode::IaDuplicateName, c.line).with_hint(c.name));
            }
            self.shared.push_command(self.target_scope, &c.name, c.form, c.args, false);
        }
        if self.target_scope == Form::Global {
            self.shared.inc_property_cnt = self.shared.property_cnt;
            self.shared.inc_command_cnt = self.shared.command_cnt;
        }
        Ok(())
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(|c: char| c == ' ' || c == '\t') {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

/// Splits `name(args)` head from the body of a `#macro` line.
fn split_macro_head(s: &str) -> (String, String) {
    let s = s.trim_start();
    let mut depth = 0u32;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return (s[..=i].to_owned(), s[i + 1..].to_owned());
                }
            }
            ' ' | '\t' if depth == 0 => {
                return (s[..i].to_owned(), s[i..].to_owned());
            }
            _ => {}
        }
    }
    (s.to_owned(), String::new())
}

fn parse_macro_head(head: &str) -> Option<(String, Vec<MacroArg>)> {
    let head = head.trim();
    let Some(paren) = head.find('(') else {
        if head.is_empty() {
            return None;
        }
        return Some((head.to_owned(), Vec::new()));
    };
    let name = head[..paren].trim().to_owned();
    if name.is_empty() {
        return None;
    }
    let inner = head[paren + 1..].strip_suffix(')')?;
    let mut args = Vec::new();
    for piece in inner.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match piece.split_once('=') {
            Some((n, d)) => args.push(MacroArg {
                name: n.trim().to_owned(),
                default: Some(d.trim().to_owned()),
            }),
            None => args.push(MacroArg {
                name: piece.to_owned(),
                default: None,
            }),
        }
    }
    Some((name, args))
}

/// `name`, `name: form`, `name: form[size]`.
fn parse_property_decl(s: &str) -> Option<(String, Form, i32)> {
    let s = s.trim();
    let (name, rest) = match s.split_once(':') {
        Some((n, r)) => (n.trim(), r.trim()),
        None => (s, ""),
    };
    if name.is_empty() || !is_ident(name) {
        return None;
    }
    if rest.is_empty() {
        return Some((name.to_owned(), Form::Int, 0));
    }
    let (form_s, size) = match rest.split_once('[') {
        Some((f, tail)) => {
            let size_s = tail.strip_suffix(']')?;
            (f.trim(), size_s.trim().parse::<i32>().ok()?)
        }
        None => (rest, 0),
    };
    let form = Form::from_decl_name(form_s)?;
    Some((name.to_owned(), form, size))
}

/// `name`, `name(form, form?, form=N, __args)`, optional `: retform`.
fn parse_command_decl(s: &str) -> Option<(String, Form, Vec<ArgTemplate>)> {
    let s = s.trim();
    // The return form separator is a ':' outside the parameter parens.
    let mut split = None;
    let mut depth = 0u32;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                split = Some(i);
                break;
            }
            _ => {}
        }
    }
    let (head, ret) = match split {
        Some(i) => (s[..i].trim(), s[i + 1..].trim()),
        None => (s, ""),
    };
    let ret_form = if ret.is_empty() {
        Form::Int
    } else {
        Form::from_decl_name(ret).or_else(|| Form::from_name(ret))?
    };
    let (name, args) = match head.split_once('(') {
        None => (head, Vec::new()),
        Some((n, tail)) => {
            let inner = tail.strip_suffix(')')?;
            let mut args = Vec::new();
            for tok in inner.split(',') {
                let tok = tok.trim();
                if tok.is_empty() {
                    continue;
                }
                if tok == "__args" {
                    args.push(ArgTemplate::positional(Form::Args));
                    continue;
                }
                if tok == "__argsref" {
                    args.push(ArgTemplate::positional(Form::ArgsRef));
                    continue;
                }
                if let Some((f, d)) = tok.split_once('=') {
                    let form = Form::from_decl_name(f.trim())?;
                    let def_int = d.trim().parse::<i32>().ok()?;
                    args.push(ArgTemplate {
                        id: args.len() as i32,
                        name: String::new(),
                        form,
                        def_int,
                        def_str: String::new(),
                        def_exist: true,
                    });
                    continue;
                }
                let (f, defaulted) = match tok.strip_suffix('?') {
                    Some(base) => (base.trim(), true),
                    None => (tok, false),
                };
                let form = Form::from_decl_name(f).or_else(|| Form::from_name(f))?;
                args.push(ArgTemplate {
                    id: args.len() as i32,
                    name: String::new(),
                    form,
                    def_int: 0,
                    def_str: String::new(),
                    def_exist: defaulted,
                });
            }
            (n.trim(), args)
        }
    };
    if name.is_empty() || !is_ident(name) {
        return None;
    }
    Some((name.to_owned(), ret_form, args))
}

fn is_ident(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@' || crate::charset::is_zenkaku(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(text: &str) -> Result<IncData, StageError> {
        let mut data = IncData::new();
        let mut ia = IncAnalyzer::new(text, Form::Global, &mut data);
        let pending = ia.step1()?;
        ia.step2(pending)?;
        Ok(data)
    }

    #[test]
    fn replace_and_define_rules() {
        let data = build("#replace foo bar\n#define flagname\n").unwrap();
        assert!(data.name_set.contains("foo"));
        assert!(data.name_set.contains("flagname"));
        let text: Vec<char> = "foox".chars().collect();
        let rep = data.replace_tree.search(&text, 0).unwrap();
        assert_eq!(rep.after, "bar");
    }

    #[test]
    fn longest_name_wins() {
        let data = build("#replace ab X\n#replace abc Y\n").unwrap();
        let text: Vec<char> = "abcd".chars().collect();
        assert_eq!(data.replace_tree.search(&text, 0).unwrap().after, "Y");
    }

    #[test]
    fn property_and_command_declarations() {
        let data = build("#property hp: int\n#property names: strlist[64]\n#command heal(int, int?): int\n").unwrap();
        assert_eq!(data.property_cnt, 2);
        assert_eq!(data.inc_property_cnt, 2);
        assert_eq!(data.property_list[1].form, Form::StrList);
        assert_eq!(data.property_list[1].size, 64);
        let cmd = data.find_command("heal").unwrap();
        assert_eq!(cmd.args.len(), 2);
        assert!(cmd.args[1].def_exist);
        assert!(!cmd.is_defined);
        assert!(data.form_table.get(Form::Global, "heal").is_some());
    }

    #[test]
    fn duplicate_property_with_other_form_fails() {
        let err = build("#property hp: int\n#property hp: str\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::IaDuplicateName);
    }

    #[test]
    fn macro_expansion_with_defaults() {
        let data = build("#macro twice(x) x x\n").unwrap();
        let mut engine = ReplaceEngine::new(&data.replace_tree);
        let out = engine.expand_text("twice(ab)").unwrap();
        assert_eq!(out, "ab ab");
    }

    #[test]
    fn self_recursive_macro_hits_the_loop_cap() {
        let data = build("#macro boom() boom()\n").unwrap();
        let mut engine = ReplaceEngine::new(&data.replace_tree);
        let err = engine.expand_text("boom()").unwrap_err();
        assert_eq!(err.code, ErrorCode::MacroLoop);
    }

    #[test]
    fn expand_directive_generates_declarations() {
        let data = build("#macro decl2(a) #property a@0: int\n#expand decl2(hp)\n").unwrap();
        assert_eq!(data.property_list[0].name, "hp@0");
    }

    #[test]
    fn unterminated_macro_block() {
        let err = build("#macro big() {\nline one\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::IaUnterminatedBlock);
    }
}
