//! The element table: built-in engine elements plus everything declared by
//! `.inc` files and scene sources.
//!
//! Lookup is scoped: `call` (inside a command body), then `scene`, then
//! `global`. Object-like forms (`mwnd`, the list forms) have their own
//! buckets holding their members.

use std::collections::BTreeMap;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::forms::{ELM_OWNER_SYSTEM, ElementKind, Form, create_elm_code};

/// One slot of an overload's positional template (or of the named-argument
/// template under overload id `-1`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArgTemplate {
    pub id: i32,
    pub name: String,
    pub form: Form,
    pub def_int: i32,
    pub def_str: String,
    pub def_exist: bool,
}

impl ArgTemplate {
    pub fn positional(form: Form) -> Self {
        Self {
            id: 0,
            name: String::new(),
            form,
            def_int: 0,
            def_str: String::new(),
            def_exist: false,
        }
    }
}

/// Overload id -> positional template. Id `-1` is the named-argument
/// template; candidates are tried in ascending id order.
pub type OverloadMap = BTreeMap<i32, Vec<ArgTemplate>>;

/// Where an element came from; call-scope rebinding rules depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ElementOrigin {
    System,
    User,
    Call,
}

/// A named member of a parent form.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Element {
    pub kind: ElementKind,
    pub code: i32,
    pub name: String,
    pub form: Form,
    pub size: i32,
    pub overloads: OverloadMap,
    pub origin: ElementOrigin,
}

/// Parses the compact overload spec strings of the built-in table.
///
/// `"0:int,int;1:str"` declares two overloads; `"-1:0=time=int"` declares
/// the named template; `__args` / `__argsref` are the variadic sentinels.
/// A trailing `?` marks a defaulted slot (`int?` defaults to 0).
pub fn parse_arg_spec(spec: &str) -> OverloadMap {
    let mut map = OverloadMap::new();
    for seg in spec.split(';') {
        let seg = seg.trim();
        if seg.is_empty() {
            continue;
        }
        let Some((id_s, args_s)) = seg.split_once(':') else { continue };
        let Ok(list_id) = id_s.trim().parse::<i32>() else { continue };
        let mut list = Vec::new();
        for tok in args_s.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            if tok == "__args" {
                list.push(ArgTemplate::positional(Form::Args));
                continue;
            }
            if tok == "__argsref" {
                list.push(ArgTemplate::positional(Form::ArgsRef));
                continue;
            }
            let parts: Vec<&str> = tok.split('=').collect();
            let (id, name, form_s) = match parts.as_slice() {
                [id, name, form] => (id.parse::<i32>().unwrap_or(list.len() as i32), (*name).to_owned(), *form),
                [name, form] => (list.len() as i32, (*name).to_owned(), *form),
                _ => (list.len() as i32, String::new(), tok),
            };
            let (form_s, defaulted) = match form_s.strip_suffix('?') {
                Some(base) => (base, true),
                None => (form_s, false),
            };
            let form = Form::from_name(form_s).unwrap_or(Form::Int);
            list.push(ArgTemplate {
                id,
                name,
                form,
                def_int: 0,
                def_str: String::new(),
                def_exist: defaulted,
            });
        }
        map.insert(list_id, list);
    }
    map
}

// Built-in global element indexes (owner 0, group 0). The mwnd members use
// group 1 with the same index column.
pub const ELM_GLOBAL_CUR_CALL: i32 = 10;
pub const ELM_GLOBAL_MSG_BLOCK: i32 = 11;
pub const ELM_IDX_PRINT: u16 = 20;
pub const ELM_IDX_NL: u16 = 21;
pub const ELM_IDX_NLI: u16 = 22;
pub const ELM_IDX_RUBY: u16 = 23;
pub const ELM_IDX_SET_FACE: u16 = 24;
pub const ELM_IDX_SET_NAMAE: u16 = 25;
pub const ELM_IDX_KOE: u16 = 26;
pub const ELM_IDX_KOE_PLAY_WAIT: u16 = 27;
pub const ELM_IDX_KOE_PLAY_WAIT_KEY: u16 = 28;
pub const ELM_IDX_EXKOE: u16 = 29;
pub const ELM_IDX_SEL: u16 = 40;
pub const ELM_IDX_SEL_CANCEL: u16 = 41;
pub const ELM_IDX_SELMSG: u16 = 42;
pub const ELM_IDX_SELMSG_CANCEL: u16 = 43;
pub const ELM_IDX_SELBTN: u16 = 44;
pub const ELM_IDX_SELBTN_CANCEL: u16 = 45;
pub const ELM_IDX_SELBTN_START: u16 = 46;
pub const ELM_IDX_SEL_IMAGE: u16 = 47;

/// Pseudo element code of array indexing; never a real element.
pub const ELM_ARRAY: i32 = 0x00FF_0000;

const GROUP_GLOBAL: u8 = 0;
const GROUP_MWND: u8 = 1;

/// True when `(parent, code)` is one of the selection-producing commands;
/// those may only appear as whole statements.
pub fn is_sel_command(parent: Form, code: i32) -> bool {
    let owner = (code >> 24) & 0xFF;
    let group = ((code >> 16) & 0xFF) as u8;
    let idx = (code & 0xFFFF) as u16;
    if owner != i32::from(ELM_OWNER_SYSTEM) {
        return false;
    }
    let scope_ok = (parent == Form::Global && group == GROUP_GLOBAL) || (parent == Form::Mwnd && group == GROUP_MWND);
    scope_ok && (ELM_IDX_SEL..=ELM_IDX_SEL_IMAGE).contains(&idx)
}

/// Commands that must be preceded by the message-block priming sequence.
pub fn is_msg_command(parent: Form, code: i32) -> bool {
    let group = ((code >> 16) & 0xFF) as u8;
    let idx = (code & 0xFFFF) as u16;
    if (code >> 24) & 0xFF != i32::from(ELM_OWNER_SYSTEM) {
        return false;
    }
    let scope_ok = (parent == Form::Global && group == GROUP_GLOBAL) || (parent == Form::Mwnd && group == GROUP_MWND);
    scope_ok && (ELM_IDX_PRINT..=ELM_IDX_KOE).contains(&idx)
}

/// Commands that consume a read-flag slot.
pub fn is_read_flag_command(parent: Form, code: i32) -> bool {
    let group = ((code >> 16) & 0xFF) as u8;
    let idx = (code & 0xFFFF) as u16;
    if (code >> 24) & 0xFF != i32::from(ELM_OWNER_SYSTEM) {
        return false;
    }
    match (parent, group) {
        (Form::Global, GROUP_GLOBAL) => {
            idx == ELM_IDX_PRINT
                || (ELM_IDX_KOE..=ELM_IDX_KOE_PLAY_WAIT_KEY).contains(&idx)
                || (ELM_IDX_SEL..=ELM_IDX_SEL_IMAGE).contains(&idx)
        }
        (Form::Mwnd, GROUP_MWND) => {
            idx == ELM_IDX_PRINT
                || (ELM_IDX_KOE..=ELM_IDX_KOE_PLAY_WAIT_KEY).contains(&idx)
                || (ELM_IDX_SEL..=ELM_IDX_SELMSG_CANCEL).contains(&idx)
        }
        _ => false,
    }
}

/// Read-flag check when only the element code is at hand (the group bits
/// disambiguate the scope).
pub fn is_read_flag_code(code: i32) -> bool {
    is_read_flag_command(Form::Global, code) || is_read_flag_command(Form::Mwnd, code)
}

struct SystemDef {
    kind: ElementKind,
    parent: Form,
    ret: Form,
    name: &'static str,
    group: u8,
    index: u16,
    args: &'static str,
    size: i32,
}

const fn cmd(parent: Form, ret: Form, name: &'static str, group: u8, index: u16, args: &'static str) -> SystemDef {
    SystemDef {
        kind: ElementKind::Command,
        parent,
        ret,
        name,
        group,
        index,
        args,
        size: 0,
    }
}

const fn prop(parent: Form, form: Form, name: &'static str, group: u8, index: u16, size: i32) -> SystemDef {
    SystemDef {
        kind: ElementKind::Property,
        parent,
        ret: form,
        name,
        group,
        index,
        args: "",
        size,
    }
}

fn system_defs() -> Vec<SystemDef> {
    let g = Form::Global;
    let m = Form::Mwnd;
    let mut defs = vec![
        // message window members live both at global scope (the default
        // window) and on mwnd objects
        prop(g, Form::Mwnd, "mwnd", GROUP_GLOBAL, 60, 0),
        prop(g, Form::IntList, "f", GROUP_GLOBAL, 61, 10_000),
        prop(g, Form::StrList, "s", GROUP_GLOBAL, 62, 2_000),
        prop(g, Form::Int, "cnt", GROUP_GLOBAL, 63, 0),
        prop(Form::IntList, Form::Int, "array", 0xFF, 0, 0),
        prop(Form::StrList, Form::Str, "array", 0xFF, 0, 0),
    ];
    for (parent, group) in [(g, GROUP_GLOBAL), (m, GROUP_MWND)] {
        defs.extend([
            cmd(parent, Form::Void, "print", group, ELM_IDX_PRINT, "0:str"),
            cmd(parent, Form::Void, "nl", group, ELM_IDX_NL, "0:"),
            cmd(parent, Form::Void, "nli", group, ELM_IDX_NLI, "0:"),
            cmd(parent, Form::Void, "ruby", group, ELM_IDX_RUBY, "0:str"),
            cmd(parent, Form::Void, "set_face", group, ELM_IDX_SET_FACE, "0:str"),
            cmd(parent, Form::Void, "set_namae", group, ELM_IDX_SET_NAMAE, "0:str"),
            cmd(parent, Form::Void, "koe", group, ELM_IDX_KOE, "0:int;1:int,int"),
            cmd(parent, Form::Void, "koe_play_wait", group, ELM_IDX_KOE_PLAY_WAIT, "0:int"),
            cmd(parent, Form::Void, "koe_play_wait_key", group, ELM_IDX_KOE_PLAY_WAIT_KEY, "0:int"),
            cmd(parent, Form::Int, "sel", group, ELM_IDX_SEL, "0:list;-1:0=timeout=int"),
            cmd(parent, Form::Int, "sel_cancel", group, ELM_IDX_SEL_CANCEL, "0:list;-1:0=timeout=int"),
            cmd(parent, Form::Int, "selmsg", group, ELM_IDX_SELMSG, "0:list"),
            cmd(parent, Form::Int, "selmsg_cancel", group, ELM_IDX_SELMSG_CANCEL, "0:list"),
        ]);
    }
    defs.extend([
        cmd(g, Form::Void, "exkoe", GROUP_GLOBAL, ELM_IDX_EXKOE, "0:int;1:int,int"),
        cmd(g, Form::Int, "selbtn", GROUP_GLOBAL, ELM_IDX_SELBTN, "0:list"),
        cmd(g, Form::Int, "selbtn_cancel", GROUP_GLOBAL, ELM_IDX_SELBTN_CANCEL, "0:list"),
        cmd(g, Form::Void, "selbtn_start", GROUP_GLOBAL, ELM_IDX_SELBTN_START, "0:int"),
        cmd(g, Form::Int, "sel_image", GROUP_GLOBAL, ELM_IDX_SEL_IMAGE, "0:list"),
    ]);
    defs
}

/// The three-scope element table.
#[derive(Debug, Clone)]
pub struct FormTable {
    buckets: AHashMap<Form, IndexMap<String, Element>>,
    call_base: IndexMap<String, Element>,
}

impl Default for FormTable {
    fn default() -> Self {
        Self::new_system()
    }
}

impl FormTable {
    /// Builds the table pre-populated with the engine's built-in elements.
    pub fn new_system() -> Self {
        let mut table = Self {
            buckets: AHashMap::new(),
            call_base: IndexMap::new(),
        };
        for form in [
            Form::Call,
            Form::Scene,
            Form::Global,
            Form::Mwnd,
            Form::IntList,
            Form::StrList,
            Form::List,
            Form::Object,
        ] {
            table.buckets.entry(form).or_default();
        }
        for def in system_defs() {
            let code = if def.name == "array" {
                ELM_ARRAY
            } else {
                create_elm_code(ELM_OWNER_SYSTEM, def.group, def.index)
            };
            table.add(
                def.parent,
                Element {
                    kind: def.kind,
                    code,
                    name: def.name.to_owned(),
                    form: def.ret,
                    size: def.size,
                    overloads: parse_arg_spec(def.args),
                    origin: ElementOrigin::System,
                },
            );
        }
        table.call_base = table.buckets.get(&Form::Call).cloned().unwrap_or_default();
        table
    }

    /// Drops all call-scope bindings accumulated inside a command body.
    pub fn reset_call(&mut self) {
        self.buckets.insert(Form::Call, self.call_base.clone());
    }

    /// Adds an element to a bucket. Re-declaring a call-scope property
    /// keeps the first binding (legacy rule); everything else rebinds.
    pub fn add(&mut self, parent: Form, element: Element) {
        let bucket = self.buckets.entry(parent).or_default();
        if bucket.contains_key(&element.name)
            && parent == Form::Call
            && element.origin == ElementOrigin::Call
            && element.kind == ElementKind::Property
        {
            return;
        }
        bucket.insert(element.name.clone(), element);
    }

    pub fn get(&self, parent: Form, name: &str) -> Option<&Element> {
        self.buckets.get(&parent)?.get(name)
    }

    /// Finds an element by its packed code within one bucket. Used by the
    /// lowering stage to recover a command's argument templates.
    pub fn get_by_code(&self, parent: Form, code: i32) -> Option<&Element> {
        self.buckets.get(&parent)?.values().find(|e| e.code == code)
    }

    /// Unqualified lookup in call -> scene -> global order.
    pub fn find(&self, name: &str) -> Option<(&Element, Form)> {
        for scope in [Form::Call, Form::Scene, Form::Global] {
            if let Some(e) = self.get(scope, name) {
                return Some((e, scope));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_table_has_message_commands() {
        let ft = FormTable::new_system();
        let (print, scope) = ft.find("print").expect("print exists");
        assert_eq!(scope, Form::Global);
        assert_eq!(print.kind, ElementKind::Command);
        assert!(ft.get(Form::Mwnd, "print").is_some());
        assert!(ft.get(Form::IntList, "array").is_some());
    }

    #[test]
    fn arg_spec_parsing() {
        let map = parse_arg_spec("0:int,int;1:str;-1:0=timeout=int");
        assert_eq!(map[&0].len(), 2);
        assert_eq!(map[&0][0].form, Form::Int);
        assert_eq!(map[&1][0].form, Form::Str);
        assert_eq!(map[&-1][0].name, "timeout");
        let var = parse_arg_spec("0:__args");
        assert_eq!(var[&0][0].form, Form::Args);
        let opt = parse_arg_spec("0:int,int?");
        assert!(opt[&0][1].def_exist);
    }

    #[test]
    fn call_scope_keeps_first_binding() {
        let mut ft = FormTable::new_system();
        let make = |form: Form, code: i32| Element {
            kind: ElementKind::Property,
            code,
            name: "x".to_owned(),
            form,
            size: 0,
            overloads: OverloadMap::new(),
            origin: ElementOrigin::Call,
        };
        ft.add(Form::Call, make(Form::Int, 1));
        ft.add(Form::Call, make(Form::Str, 2));
        assert_eq!(ft.get(Form::Call, "x").unwrap().code, 1);
        ft.reset_call();
        assert!(ft.get(Form::Call, "x").is_none());
    }

    #[test]
    fn sel_and_msg_sets() {
        let ft = FormTable::new_system();
        let sel = ft.get(Form::Global, "sel").unwrap();
        assert!(is_sel_command(Form::Global, sel.code));
        assert!(is_read_flag_command(Form::Global, sel.code));
        assert!(!is_msg_command(Form::Global, sel.code));
        let print = ft.get(Form::Mwnd, "print").unwrap();
        assert!(is_msg_command(Form::Mwnd, print.code));
        assert!(!is_sel_command(Form::Mwnd, print.code));
    }
}
