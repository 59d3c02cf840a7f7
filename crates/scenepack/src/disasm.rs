//! Scene bytecode disassembler.
//!
//! Linear decode of `scn_bytes` into a readable listing: label markers,
//! string previews on pushes and text output, jump targets, and a
//! best-guess element name on `CD_COMMAND` recovered from the pushes since
//! the last `CD_ELM_POINT`. Diagnostic only.

use std::fmt::Write as _;

use ahash::AHashMap;

use crate::{
    bs::{ScnHeader, decode_str_table},
    bytecode::Opcode,
    elements::FormTable,
    forms::Form,
};

fn escape_preview(s: &str, limit: usize) -> String {
    let mut t = s
        .replace('\\', "\\\\")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
        .replace('\t', "\\t");
    if t.chars().count() > limit {
        t = t.chars().take(limit - 1).collect::<String>() + "\u{2026}";
    }
    t
}

fn fmt_form(code: i32) -> String {
    match Form::from_code(code) {
        Some(f) => format!("{f}({code})"),
        None => format!("form({code})"),
    }
}

#[derive(Clone, Copy)]
struct StackSlot {
    form: i32,
    value: Option<i32>,
}

struct Reader<'a> {
    scn: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let v = *self.scn.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn i32(&mut self) -> Option<i32> {
        if self.pos + 4 > self.scn.len() {
            return None;
        }
        let v = i32::from_le_bytes(self.scn[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Some(v)
    }
}

/// Names for system element codes, derived from the built-in table.
fn element_name_map() -> AHashMap<i32, String> {
    let ft = FormTable::new_system();
    let mut map = AHashMap::new();
    for parent in [Form::Global, Form::Mwnd, Form::Scene] {
        for name in ["print", "nl", "nli", "ruby", "set_face", "set_namae", "koe", "koe_play_wait",
            "koe_play_wait_key", "sel", "sel_cancel", "selmsg", "selmsg_cancel", "selbtn", "selbtn_cancel",
            "selbtn_start", "sel_image", "exkoe", "mwnd", "f", "s", "cnt"]
        {
            if let Some(e) = ft.get(parent, name) {
                map.entry(e.code).or_insert_with(|| format!("{parent}.{name}"));
            }
        }
    }
    map
}

/// Disassembles one scene's bytecode.
///
/// `label_list` / `z_label_list` annotate instruction offsets; `str_list`
/// is the decoded (original-order) string table.
pub fn disassemble_scn(
    scn: &[u8],
    str_list: &[String],
    label_list: &[i32],
    z_label_list: &[i32],
) -> Vec<String> {
    let mut labels_at: AHashMap<usize, Vec<String>> = AHashMap::new();
    for (i, &ofs) in label_list.iter().enumerate() {
        labels_at.entry(ofs as usize).or_default().push(format!("L{i}"));
    }
    for (i, &ofs) in z_label_list.iter().enumerate() {
        if ofs != 0 || i == 0 {
            labels_at.entry(ofs as usize).or_default().push(format!("Z{i}"));
        }
    }
    let elm_names = element_name_map();

    let mut out = Vec::new();
    let mut r = Reader { scn, pos: 0 };
    let mut stack: Vec<StackSlot> = Vec::new();
    let mut elm_point_value: Option<i32> = None;

    macro_rules! truncated {
        ($ofs:expr, $name:expr) => {{
            out.push(format!("{:08X}: {} <truncated>", $ofs, $name));
            break;
        }};
    }

    while r.pos < scn.len() {
        let ofs = r.pos;
        if let Some(names) = labels_at.get(&ofs) {
            out.push(format!("{:08X}: <{}>", ofs, names.join(",")));
        }
        let Some(raw) = r.u8() else { break };
        let Some(op) = Opcode::from_u8(raw) else {
            out.push(format!("{ofs:08X}: OP_{raw:02X} (unknown)"));
            break;
        };
        let opname: &'static str = op.into();
        match op {
            Opcode::None => out.push(format!("{ofs:08X}: {opname}")),
            Opcode::Nl => {
                let Some(line) = r.i32() else { truncated!(ofs, opname) };
                stack.clear();
                elm_point_value = None;
                out.push(format!("{ofs:08X}: {opname} {line}"));
            }
            Opcode::Push => {
                let (Some(form), Some(value)) = (r.i32(), r.i32()) else {
                    truncated!(ofs, opname)
                };
                let mut note = String::new();
                if form == Form::Str.code()
                    && let Some(s) = str_list.get(value as usize)
                {
                    let _ = write!(note, " ; \"{}\"", escape_preview(s, 80));
                }
                out.push(format!("{ofs:08X}: {opname} {}, {value}{note}", fmt_form(form)));
                stack.push(StackSlot {
                    form,
                    value: Some(value),
                });
                if elm_point_value.is_none() && form == Form::Int.code() {
                    elm_point_value = Some(value);
                }
            }
            Opcode::Pop => {
                let Some(form) = r.i32() else { truncated!(ofs, opname) };
                out.push(format!("{ofs:08X}: {opname} {}", fmt_form(form)));
                stack.pop();
            }
            Opcode::Copy => {
                let Some(form) = r.i32() else { truncated!(ofs, opname) };
                out.push(format!("{ofs:08X}: {opname} {}", fmt_form(form)));
                if let Some(&top) = stack.last() {
                    stack.push(top);
                }
            }
            Opcode::Property | Opcode::CopyElm | Opcode::Arg | Opcode::SelBlockStart | Opcode::SelBlockEnd => {
                out.push(format!("{ofs:08X}: {opname}"));
                match op {
                    Opcode::Property => {
                        stack.pop();
                        stack.push(StackSlot {
                            form: Form::Int.code(),
                            value: None,
                        });
                    }
                    Opcode::CopyElm => {
                        if let Some(&top) = stack.last() {
                            stack.push(top);
                        }
                    }
                    _ => {}
                }
            }
            Opcode::ElmPoint => {
                out.push(format!("{ofs:08X}: {opname}"));
                elm_point_value = None;
            }
            Opcode::DecProp => {
                let (Some(form), Some(prop_id)) = (r.i32(), r.i32()) else {
                    truncated!(ofs, opname)
                };
                out.push(format!("{ofs:08X}: {opname} {}, {prop_id}", fmt_form(form)));
            }
            Opcode::Goto | Opcode::GotoTrue | Opcode::GotoFalse => {
                let Some(label) = r.i32() else { truncated!(ofs, opname) };
                let dest = label_list
                    .get(label as usize)
                    .map(|&d| format!(" -> {d:08X}"))
                    .unwrap_or_default();
                out.push(format!("{ofs:08X}: {opname} L{label}{dest}"));
                if op != Opcode::Goto {
                    stack.pop();
                }
            }
            Opcode::Gosub | Opcode::GosubStr => {
                let (Some(label), Some(argc)) = (r.i32(), r.i32()) else {
                    truncated!(ofs, opname)
                };
                let mut forms = Vec::new();
                let mut bad = false;
                for _ in 0..argc.max(0) {
                    match r.i32() {
                        Some(f) => forms.push(fmt_form(f)),
                        None => {
                            bad = true;
                            break;
                        }
                    }
                }
                if bad {
                    truncated!(ofs, opname);
                }
                let dest = label_list
                    .get(label as usize)
                    .map(|&d| format!(" -> {d:08X}"))
                    .unwrap_or_default();
                out.push(format!(
                    "{ofs:08X}: {opname} L{label} argc={argc} forms=[{}]{dest}",
                    forms.join(", ")
                ));
            }
            Opcode::Return => {
                let Some(has_value) = r.i32() else { truncated!(ofs, opname) };
                let mut extra = String::new();
                if has_value != 0 {
                    let Some(form) = r.i32() else { truncated!(ofs, opname) };
                    let _ = write!(extra, " {}", fmt_form(form));
                }
                out.push(format!("{ofs:08X}: {opname} {has_value}{extra}"));
                stack.clear();
            }
            Opcode::Assign => {
                let (Some(l), Some(rr), Some(al)) = (r.i32(), r.i32(), r.i32()) else {
                    truncated!(ofs, opname)
                };
                out.push(format!(
                    "{ofs:08X}: {opname} l={} r={} al_id={al}",
                    fmt_form(l),
                    fmt_form(rr)
                ));
                stack.pop();
                stack.pop();
            }
            Opcode::Operate1 => {
                let Some(form) = r.i32() else { truncated!(ofs, opname) };
                let Some(opr) = r.u8() else { truncated!(ofs, opname) };
                out.push(format!("{ofs:08X}: {opname} {} op={opr}", fmt_form(form)));
                stack.pop();
                stack.push(StackSlot { form, value: None });
            }
            Opcode::Operate2 => {
                let (Some(fl), Some(fr)) = (r.i32(), r.i32()) else {
                    truncated!(ofs, opname)
                };
                let Some(opr) = r.u8() else { truncated!(ofs, opname) };
                out.push(format!(
                    "{ofs:08X}: {opname} {}, {} op={opr}",
                    fmt_form(fl),
                    fmt_form(fr)
                ));
                stack.pop();
                stack.pop();
                stack.push(StackSlot {
                    form: fl,
                    value: None,
                });
            }
            Opcode::Text => {
                let Some(read_flag) = r.i32() else { truncated!(ofs, opname) };
                let mut note = String::new();
                if let Some(top) = stack.last()
                    && top.form == Form::Str.code()
                    && let Some(sid) = top.value
                    && let Some(s) = str_list.get(sid as usize)
                {
                    let _ = write!(note, " ; \"{}\"", escape_preview(s, 120));
                }
                out.push(format!("{ofs:08X}: {opname} read_flag={read_flag}{note}"));
                stack.pop();
            }
            Opcode::Name => {
                let mut note = String::new();
                if let Some(top) = stack.last()
                    && top.form == Form::Str.code()
                    && let Some(sid) = top.value
                    && let Some(s) = str_list.get(sid as usize)
                {
                    let _ = write!(note, " \"{}\"", escape_preview(s, 120));
                }
                out.push(format!("{ofs:08X}: {opname}{note}"));
                stack.pop();
            }
            Opcode::Command => {
                let (Some(arg_list_id), Some(argc)) = (r.i32(), r.i32()) else {
                    truncated!(ofs, opname)
                };
                let mut arg_forms = Vec::new();
                let mut bad = false;
                for _ in 0..argc.max(0) {
                    let Some(f) = r.i32() else {
                        bad = true;
                        break;
                    };
                    if f == Form::List.code() {
                        let Some(sub_cnt) = r.i32() else {
                            bad = true;
                            break;
                        };
                        let mut sub = Vec::new();
                        for _ in 0..sub_cnt.max(0) {
                            match r.i32() {
                                Some(sf) => sub.push(fmt_form(sf)),
                                None => {
                                    bad = true;
                                    break;
                                }
                            }
                        }
                        arg_forms.push(format!("list[{}]", sub.join(",")));
                    } else {
                        arg_forms.push(fmt_form(f));
                    }
                }
                if bad {
                    truncated!(ofs, opname);
                }
                let Some(named_cnt) = r.i32() else { truncated!(ofs, opname) };
                for _ in 0..named_cnt.max(0) {
                    if r.i32().is_none() {
                        bad = true;
                        break;
                    }
                }
                if bad {
                    truncated!(ofs, opname);
                }
                let Some(ret_form) = r.i32() else { truncated!(ofs, opname) };
                // Element code: the int pushed right beneath the argument
                // values, or the first int after the last CD_ELM_POINT.
                let mut element_code = None;
                let depth = argc.max(0) as usize;
                if stack.len() > depth
                    && let Some(slot) = stack.get(stack.len() - depth - 1)
                    && slot.form == Form::Int.code()
                {
                    element_code = slot.value;
                }
                if element_code.is_none() {
                    element_code = elm_point_value;
                }
                // Read-flag commands carry one extra i32 after the call.
                let mut rf_note = String::new();
                if let Some(ec) = element_code
                    && crate::elements::is_read_flag_code(ec)
                {
                    let Some(rf) = r.i32() else { truncated!(ofs, opname) };
                    let _ = write!(rf_note, " read_flag={rf}");
                }
                let ec_note = element_code
                    .map(|ec| {
                        let name = elm_names
                            .get(&ec)
                            .map(|n| format!(" {n}"))
                            .unwrap_or_default();
                        format!(" ec=0x{ec:08X}{name}")
                    })
                    .unwrap_or_default();
                out.push(format!(
                    "{ofs:08X}: {opname} arg_list={arg_list_id} argc={argc} args=[{}] named={named_cnt} ret={}{rf_note}{ec_note}",
                    arg_forms.join(", "),
                    fmt_form(ret_form)
                ));
                for _ in 0..=depth {
                    if stack.pop().is_none() {
                        break;
                    }
                }
                if ret_form != Form::Void.code() {
                    stack.push(StackSlot {
                        form: ret_form,
                        value: None,
                    });
                }
            }
            Opcode::Eof => {
                out.push(format!("{ofs:08X}: {opname}"));
                break;
            }
        }
    }
    out
}

/// Disassembles a whole `.dat` image.
pub fn disassemble_dat(dat: &[u8]) -> Vec<String> {
    let Some(h) = ScnHeader::parse(dat) else {
        return vec!["invalid scene header".to_owned()];
    };
    let strings = decode_str_table(dat, &h);
    let read_i32s = |ofs: i32, cnt: i32| -> Vec<i32> {
        let ofs = ofs as usize;
        (0..cnt.max(0) as usize)
            .filter_map(|i| {
                let p = ofs + i * 4;
                dat.get(p..p + 4).map(|b| i32::from_le_bytes(b.try_into().unwrap()))
            })
            .collect()
    };
    let labels = read_i32s(h.label_list_ofs, h.label_cnt);
    let z_labels = read_i32s(h.z_label_list_ofs, h.z_label_cnt);
    let scn_end = (h.scn_ofs + h.scn_size).min(dat.len() as i32) as usize;
    let scn = &dat[h.scn_ofs as usize..scn_end];
    disassemble_scn(scn, &strings, &labels, &z_labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ca, ia::IncData, la, ma, msvc_rand::MsvcRand, sa};

    fn compile_scene(scene: &str) -> Vec<u8> {
        let mut inc = IncData::new();
        let expanded = ca::analyze_file(scene, &mut inc).unwrap();
        let mut lex = la::analyze(&expanded).unwrap();
        let mut root = sa::analyze(&mut inc, &lex).unwrap();
        let out = ma::analyze(&mut inc, &mut lex, &mut root).unwrap();
        let mut rng = MsvcRand::new(1);
        crate::bs::compile(&inc, &lex, &root, &out, &mut rng).unwrap()
    }

    #[test]
    fn listing_terminates_at_eof_and_shows_text() {
        let dat = compile_scene("*z0\n\"hello world\"\n");
        let lines = disassemble_dat(&dat);
        assert!(lines.last().unwrap().contains("CD_EOF"));
        assert!(lines.iter().any(|l| l.contains("CD_TEXT") && l.contains("hello world")));
        assert!(lines.iter().any(|l| l.contains("<") && l.contains("Z0")));
    }

    #[test]
    fn command_lines_carry_element_codes() {
        let dat = compile_scene("*z0\nkoe(1200, 1)\n");
        let lines = disassemble_dat(&dat);
        let cmd_line = lines
            .iter()
            .find(|l| l.contains("CD_COMMAND") && l.contains("argc=2"))
            .expect("koe call");
        assert!(cmd_line.contains("global.koe"), "got: {cmd_line}");
    }

    #[test]
    fn control_flow_shows_jump_targets() {
        let dat = compile_scene("*z0\nif (f[0] == 1) { \"a\" } else { \"b\" }\n");
        let lines = disassemble_dat(&dat);
        assert!(lines.iter().any(|l| l.contains("CD_GOTO_FALSE") && l.contains("->")));
    }

    #[test]
    fn every_compiled_scene_disassembles_fully() {
        let scene = "*z0\n\
             \u{3010}\"n\"\u{3011}\n\
             \"text line\"\n\
             f[0] = 1 + 2 * 3\n\
             while (f[0] > 0) { f[0] -= 1 }\n\
             switch (f[0]) { case (0) \"zero\" default \"other\" }\n";
        let dat = compile_scene(scene);
        let lines = disassemble_dat(&dat);
        assert!(lines.last().unwrap().contains("CD_EOF"));
        assert!(!lines.iter().any(|l| l.contains("unknown") || l.contains("truncated")));
    }
}
