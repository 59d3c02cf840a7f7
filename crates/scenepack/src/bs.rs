//! Binary save: lowers the annotated scene tree to bytecode and lays out
//! the per-scene `.dat` image.
//!
//! The `.dat` starts with a 33 x i32 header locating 17 sections; strings
//! are written in the shuffled order drawn from the compilation-wide MSVC
//! PRNG and XOR-masked per original id.

use crate::{
    bytecode::{BinaryStream, Opcode},
    charset::utf16_len,
    elements::{ELM_ARRAY, ELM_GLOBAL_CUR_CALL, ELM_GLOBAL_MSG_BLOCK, is_msg_command, is_read_flag_command},
    error::ErrorCode,
    forms::{ELM_OWNER_CALL_PROP, ElementKind, Form, elm_owner},
    ia::{IncData, StageError},
    la::{LexOutput, Z_LABEL_CNT},
    ma::MaOutput,
    msvc_rand::MsvcRand,
    tree::{
        ArgList, AssignNode, DefCmd, DefProp, ElementBody, ElementNode, ElmExp, ElmList, Exp, ExpBody, ForNode,
        GotoKind, GotoNode, IfNode, Literal, LoopLabelStack, LoopLabels, OpCode, ReturnNode, Sentence, SentenceBody,
        SmpBody, SmpExp, Ss, SwitchNode, WhileNode, first_atom, last_atom,
    },
};

type BsResult<T> = Result<T, StageError>;

/// The per-scene `.dat` header: 33 little-endian i32 fields, 132 bytes.
pub const SCN_HEADER_SIZE: usize = 132;
const SCN_FIELD_CNT: usize = SCN_HEADER_SIZE / 4;

/// Parsed per-scene header. Field order is the wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScnHeader {
    pub header_size: i32,
    pub str_index_list_ofs: i32,
    pub str_index_cnt: i32,
    pub str_list_ofs: i32,
    pub str_cnt: i32,
    pub scn_ofs: i32,
    pub scn_size: i32,
    pub label_list_ofs: i32,
    pub label_cnt: i32,
    pub z_label_list_ofs: i32,
    pub z_label_cnt: i32,
    pub cmd_label_list_ofs: i32,
    pub cmd_label_cnt: i32,
    pub scn_prop_list_ofs: i32,
    pub scn_prop_cnt: i32,
    pub scn_prop_name_index_list_ofs: i32,
    pub scn_prop_name_index_cnt: i32,
    pub scn_prop_name_list_ofs: i32,
    pub scn_prop_name_cnt: i32,
    pub scn_cmd_list_ofs: i32,
    pub scn_cmd_cnt: i32,
    pub scn_cmd_name_index_list_ofs: i32,
    pub scn_cmd_name_index_cnt: i32,
    pub scn_cmd_name_list_ofs: i32,
    pub scn_cmd_name_cnt: i32,
    pub call_prop_name_index_list_ofs: i32,
    pub call_prop_name_index_cnt: i32,
    pub call_prop_name_list_ofs: i32,
    pub call_prop_name_cnt: i32,
    pub namae_list_ofs: i32,
    pub namae_cnt: i32,
    pub read_flag_list_ofs: i32,
    pub read_flag_cnt: i32,
}

impl ScnHeader {
    fn fields(&self) -> [i32; SCN_FIELD_CNT] {
        [
            self.header_size,
            self.str_index_list_ofs,
            self.str_index_cnt,
            self.str_list_ofs,
            self.str_cnt,
            self.scn_ofs,
            self.scn_size,
            self.label_list_ofs,
            self.label_cnt,
            self.z_label_list_ofs,
            self.z_label_cnt,
            self.cmd_label_list_ofs,
            self.cmd_label_cnt,
            self.scn_prop_list_ofs,
            self.scn_prop_cnt,
            self.scn_prop_name_index_list_ofs,
            self.scn_prop_name_index_cnt,
            self.scn_prop_name_list_ofs,
            self.scn_prop_name_cnt,
            self.scn_cmd_list_ofs,
            self.scn_cmd_cnt,
            self.scn_cmd_name_index_list_ofs,
            self.scn_cmd_name_index_cnt,
            self.scn_cmd_name_list_ofs,
            self.scn_cmd_name_cnt,
            self.call_prop_name_index_list_ofs,
            self.call_prop_name_index_cnt,
            self.call_prop_name_list_ofs,
            self.call_prop_name_cnt,
            self.namae_list_ofs,
            self.namae_cnt,
            self.read_flag_list_ofs,
            self.read_flag_cnt,
        ]
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        for (i, v) in self.fields().iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn parse(dat: &[u8]) -> Option<Self> {
        if dat.len() < SCN_HEADER_SIZE {
            return None;
        }
        let f = |i: usize| i32::from_le_bytes(dat[i * 4..i * 4 + 4].try_into().unwrap());
        let mut h = Self::default();
        let mut i = 0;
        macro_rules! read {
            ($($field:ident),+ $(,)?) => {
                $(
                    h.$field = f(i);
                    i += 1;
                )+
            };
        }
        read!(
            header_size,
            str_index_list_ofs,
            str_index_cnt,
            str_list_ofs,
            str_cnt,
            scn_ofs,
            scn_size,
            label_list_ofs,
            label_cnt,
            z_label_list_ofs,
            z_label_cnt,
            cmd_label_list_ofs,
            cmd_label_cnt,
            scn_prop_list_ofs,
            scn_prop_cnt,
            scn_prop_name_index_list_ofs,
            scn_prop_name_index_cnt,
            scn_prop_name_list_ofs,
            scn_prop_name_cnt,
            scn_cmd_list_ofs,
            scn_cmd_cnt,
            scn_cmd_name_index_list_ofs,
            scn_cmd_name_index_cnt,
            scn_cmd_name_list_ofs,
            scn_cmd_name_cnt,
            call_prop_name_index_list_ofs,
            call_prop_name_index_cnt,
            call_prop_name_list_ofs,
            call_prop_name_cnt,
            namae_list_ofs,
            namae_cnt,
            read_flag_list_ofs,
            read_flag_cnt,
        );
        debug_assert_eq!(i, SCN_FIELD_CNT);
        Some(h)
    }
}

/// Reads the `(cmd_id, offset)` pairs out of a `.dat` image.
pub fn parse_cmd_labels(dat: &[u8]) -> Vec<(i32, i32)> {
    let Some(h) = ScnHeader::parse(dat) else { return Vec::new() };
    let ofs = h.cmd_label_list_ofs as usize;
    let cnt = h.cmd_label_cnt as usize;
    if h.cmd_label_list_ofs <= 0 || cnt == 0 || ofs + cnt * 8 > dat.len() {
        return Vec::new();
    }
    (0..cnt)
        .map(|i| {
            let p = ofs + i * 8;
            (
                i32::from_le_bytes(dat[p..p + 4].try_into().unwrap()),
                i32::from_le_bytes(dat[p + 4..p + 8].try_into().unwrap()),
            )
        })
        .collect()
}

fn mk_index_list(names: &[String]) -> Vec<(i32, i32)> {
    let mut out = Vec::with_capacity(names.len());
    let mut ofs = 0i32;
    for n in names {
        let len = utf16_len(n) as i32;
        out.push((ofs, len));
        ofs += len;
    }
    out
}

struct Bs<'a> {
    inc: &'a IncData,
    lex: &'a LexOutput,
    scn: BinaryStream,
    label_list: Vec<i32>,
    z_label_list: Vec<i32>,
    cmd_label_list: Vec<(i32, i32)>,
    scn_cmd_list: Vec<(i32, i32)>,
    namae_list: Vec<i32>,
    read_flag_list: Vec<i32>,
    cur_read_flag_no: i32,
    loop_labels: LoopLabelStack,
}

impl<'a> Bs<'a> {
    fn err_atom(code: ErrorCode, atom: crate::la::Atom) -> StageError {
        StageError::new(code, atom.line)
    }

    fn new_label(&mut self) -> usize {
        self.label_list.push(0);
        self.label_list.len() - 1
    }

    fn fix_label(&mut self, id: usize) {
        self.label_list[id] = self.scn.len() as i32;
    }

    fn push_form(&mut self, f: Form) {
        self.scn.push_i32(f.code());
    }

    fn ss(&mut self, sentences: &[Sentence]) -> BsResult<()> {
        for sen in sentences {
            self.sentence(sen)?;
        }
        Ok(())
    }

    fn sentence(&mut self, sen: &Sentence) -> BsResult<()> {
        self.scn.push_op(Opcode::Nl);
        self.scn.push_i32(sen.line as i32);
        if sen.is_include_sel {
            self.scn.push_op(Opcode::SelBlockStart);
        }
        match &sen.body {
            SentenceBody::Label(a) => {
                let id = a.opt as usize;
                if id < self.label_list.len() {
                    self.label_list[id] = self.scn.len() as i32;
                }
            }
            SentenceBody::ZLabel(a) => {
                let ofs = self.scn.len() as i32;
                let zi = a.opt as usize;
                if zi < self.z_label_list.len() {
                    self.z_label_list[zi] = ofs;
                }
                let backing = a.subopt as usize;
                if backing < self.label_list.len() {
                    self.label_list[backing] = ofs;
                }
            }
            SentenceBody::DefProp(dp) => self.def_prop(dp)?,
            SentenceBody::DefCmd(dc) => self.def_cmd(dc)?,
            SentenceBody::Goto(g) => self.goto(g)?,
            SentenceBody::Return(r) => self.return_(r)?,
            SentenceBody::If(n) => self.if_(n)?,
            SentenceBody::For(n) => self.for_(n)?,
            SentenceBody::While(n) => self.while_(n)?,
            SentenceBody::Continue(a) => {
                let Some(labels) = self.loop_labels.last().copied() else {
                    return Err(Self::err_atom(ErrorCode::BsContinueNoLoop, *a));
                };
                self.scn.push_op(Opcode::Goto);
                self.scn.push_i32(labels.continue_label as i32);
            }
            SentenceBody::Break(a) => {
                let Some(labels) = self.loop_labels.last().copied() else {
                    return Err(Self::err_atom(ErrorCode::BsBreakNoLoop, *a));
                };
                self.scn.push_op(Opcode::Goto);
                self.scn.push_i32(labels.break_label as i32);
            }
            SentenceBody::Switch(n) => self.switch(n)?,
            SentenceBody::Assign(n) => self.assign(n)?,
            SentenceBody::Command(n) => self.command(n)?,
            SentenceBody::Text(a) => self.text(*a, sen.line),
            SentenceBody::Name(n) => self.name(n),
            SentenceBody::Eof(_) => self.scn.push_op(Opcode::Eof),
        }
        if sen.is_include_sel {
            self.scn.push_op(Opcode::SelBlockEnd);
        }
        Ok(())
    }

    fn def_prop(&mut self, dp: &DefProp) -> BsResult<()> {
        if matches!(dp.form, Form::IntList | Form::StrList) {
            match dp.form_node.as_ref().and_then(|f| f.index.as_ref()) {
                Some(index) => self.exp(index, true)?,
                None => {
                    self.scn.push_op(Opcode::Push);
                    self.push_form(Form::Int);
                    self.scn.push_i32(0);
                }
            }
        }
        self.scn.push_op(Opcode::DecProp);
        self.push_form(dp.form);
        self.scn.push_i32(dp.prop_id);
        Ok(())
    }

    fn def_cmd(&mut self, dc: &DefCmd) -> BsResult<()> {
        // Forward-flowing execution jumps over the body.
        let end_label = self.new_label();
        self.scn.push_op(Opcode::Goto);
        self.scn.push_i32(end_label as i32);
        let body_ofs = self.scn.len() as i32;
        self.cmd_label_list.push((dc.cmd_id, body_ofs));
        for p in &dc.props {
            self.def_prop(p)?;
        }
        self.scn.push_op(Opcode::Arg);
        self.ss(&dc.block)?;
        self.scn.push_op(Opcode::Return);
        self.scn.push_i32(0);
        self.fix_label(end_label);
        let inc_cnt = self.inc.inc_command_cnt as i32;
        if dc.cmd_id >= inc_cnt {
            let idx = (dc.cmd_id - inc_cnt) as usize;
            if idx < self.scn_cmd_list.len() {
                self.scn_cmd_list[idx] = (dc.cmd_id, body_ofs);
            }
        }
        Ok(())
    }

    fn goto(&mut self, g: &GotoNode) -> BsResult<()> {
        match g.kind {
            GotoKind::Goto => {
                self.scn.push_op(Opcode::Goto);
                self.scn.push_i32(g.label_id());
            }
            GotoKind::Gosub | GotoKind::GosubStr => {
                self.goto_exp(g)?;
                let form = if g.kind == GotoKind::Gosub { Form::Int } else { Form::Str };
                self.scn.push_op(Opcode::Pop);
                self.push_form(form);
            }
        }
        Ok(())
    }

    fn goto_exp(&mut self, g: &GotoNode) -> BsResult<()> {
        if let Some(args) = &g.args {
            self.arg_list(args, true)?;
        }
        self.scn.push_op(if g.kind == GotoKind::GosubStr {
            Opcode::GosubStr
        } else {
            Opcode::Gosub
        });
        self.scn.push_i32(g.label_id());
        let args = g.args.as_ref().map_or(&[][..], |a| a.args.as_slice());
        self.scn.push_i32(args.len() as i32);
        for a in args {
            self.push_form(a.exp.tmp_form.dereference());
        }
        Ok(())
    }

    fn return_(&mut self, r: &ReturnNode) -> BsResult<()> {
        match &r.exp {
            Some(exp) => {
                self.exp(exp, true)?;
                self.scn.push_op(Opcode::Return);
                self.scn.push_i32(1);
                self.push_form(exp.node_form.dereference());
            }
            None => {
                self.scn.push_op(Opcode::Return);
                self.scn.push_i32(0);
            }
        }
        Ok(())
    }

    fn if_(&mut self, n: &IfNode) -> BsResult<()> {
        let end_label = self.new_label();
        for sub in &n.subs {
            match &sub.cond {
                Some(cond) => {
                    let next_label = self.new_label();
                    self.exp(cond, true)?;
                    self.scn.push_op(Opcode::GotoFalse);
                    self.scn.push_i32(next_label as i32);
                    self.ss(&sub.block)?;
                    self.scn.push_op(Opcode::Goto);
                    self.scn.push_i32(end_label as i32);
                    self.fix_label(next_label);
                }
                None => self.ss(&sub.block)?,
            }
        }
        self.fix_label(end_label);
        Ok(())
    }

    fn for_(&mut self, n: &ForNode) -> BsResult<()> {
        let init_label = self.new_label();
        let loop_label = self.new_label();
        let out_label = self.new_label();
        self.loop_labels.push(LoopLabels {
            continue_label: loop_label,
            break_label: out_label,
        });
        self.ss(&n.init)?;
        self.scn.push_op(Opcode::Goto);
        self.scn.push_i32(init_label as i32);
        self.fix_label(loop_label);
        self.ss(&n.step)?;
        self.fix_label(init_label);
        self.exp(&n.cond, true)?;
        self.scn.push_op(Opcode::GotoFalse);
        self.scn.push_i32(out_label as i32);
        self.ss(&n.block)?;
        self.scn.push_op(Opcode::Goto);
        self.scn.push_i32(loop_label as i32);
        self.fix_label(out_label);
        self.loop_labels.pop();
        Ok(())
    }

    fn while_(&mut self, n: &WhileNode) -> BsResult<()> {
        let loop_label = self.new_label();
        let out_label = self.new_label();
        self.loop_labels.push(LoopLabels {
            continue_label: loop_label,
            break_label: out_label,
        });
        self.fix_label(loop_label);
        self.exp(&n.cond, true)?;
        self.scn.push_op(Opcode::GotoFalse);
        self.scn.push_i32(out_label as i32);
        self.ss(&n.block)?;
        self.scn.push_op(Opcode::Goto);
        self.scn.push_i32(loop_label as i32);
        self.fix_label(out_label);
        self.loop_labels.pop();
        Ok(())
    }

    fn switch(&mut self, n: &SwitchNode) -> BsResult<()> {
        let form_l = n.cond.node_form.dereference();
        let out_label = self.new_label();
        let case_base = self.label_list.len();
        for _ in 0..n.cases.len() {
            self.new_label();
        }
        let default_label = n.default.as_ref().map(|_| self.new_label());
        self.exp(&n.cond, true)?;
        for (idx, case) in n.cases.iter().enumerate() {
            let form_r = case.value.node_form.dereference();
            self.scn.push_op(Opcode::Copy);
            self.push_form(form_l);
            self.exp(&case.value, true)?;
            self.scn.push_op(Opcode::Operate2);
            self.push_form(form_l);
            self.push_form(form_r);
            self.scn.push_u8(OpCode::Equal as u8);
            self.scn.push_op(Opcode::GotoTrue);
            self.scn.push_i32((case_base + idx) as i32);
        }
        self.scn.push_op(Opcode::Pop);
        self.push_form(form_l);
        self.scn.push_op(Opcode::Goto);
        self.scn.push_i32(default_label.unwrap_or(out_label) as i32);
        for (idx, case) in n.cases.iter().enumerate() {
            self.fix_label(case_base + idx);
            self.scn.push_op(Opcode::Pop);
            self.push_form(form_l);
            self.ss(&case.block)?;
            self.scn.push_op(Opcode::Goto);
            self.scn.push_i32(out_label as i32);
        }
        if let (Some(default), Some(label)) = (&n.default, default_label) {
            self.fix_label(label);
            self.ss(default)?;
            self.scn.push_op(Opcode::Goto);
            self.scn.push_i32(out_label as i32);
        }
        self.fix_label(out_label);
        Ok(())
    }

    fn assign(&mut self, n: &AssignNode) -> BsResult<()> {
        self.elm_list(&n.left.elm_list)?;
        if n.op != OpCode::None {
            self.scn.push_op(Opcode::CopyElm);
            self.scn.push_op(Opcode::Property);
        }
        self.exp(&n.right, !n.set_flag)?;
        if n.op != OpCode::None {
            self.scn.push_op(Opcode::Operate2);
            self.push_form(n.left.node_form.dereference());
            self.push_form(n.right.node_form.dereference());
            self.scn.push_u8(n.op as u8);
        }
        self.scn.push_op(Opcode::Assign);
        self.push_form(n.left.node_form);
        self.push_form(n.equal_form.dereference());
        self.scn.push_i32(n.al_id);
        Ok(())
    }

    fn command(&mut self, n: &ElmExp) -> BsResult<()> {
        self.elm_exp(n, true)?;
        self.scn.push_op(Opcode::Pop);
        self.push_form(n.node_form);
        Ok(())
    }

    fn text(&mut self, atom: crate::la::Atom, line: u32) {
        self.push_msg_block();
        self.scn.push_op(Opcode::Push);
        self.push_form(Form::Str);
        self.scn.push_i32(atom.opt);
        self.scn.push_op(Opcode::Text);
        self.scn.push_i32(self.cur_read_flag_no);
        self.cur_read_flag_no += 1;
        self.read_flag_list.push(line as i32);
    }

    fn name(&mut self, n: &crate::tree::NameNode) {
        self.push_msg_block();
        self.scn.push_op(Opcode::Push);
        self.push_form(Form::Str);
        self.scn.push_i32(n.name.opt);
        self.scn.push_op(Opcode::Name);
        // Dedup by text, not id: duplicate literals get distinct ids.
        let str_id = n.name.opt;
        let text = self.lex.str_list.get(str_id as usize);
        let already = self
            .namae_list
            .iter()
            .any(|&nid| self.lex.str_list.get(nid as usize) == text);
        if !already {
            self.namae_list.push(str_id);
        }
    }

    fn exp(&mut self, n: &Exp, need_value: bool) -> BsResult<()> {
        match &n.body {
            ExpBody::Simple(smp) => self.smp_exp(smp, need_value),
            ExpBody::Unary { op, exp, .. } => {
                if !need_value {
                    return Err(Self::err_atom(ErrorCode::BsNeedReference, first_atom(n)));
                }
                self.exp(exp, true)?;
                self.scn.push_op(Opcode::Operate1);
                self.push_form(exp.node_form.dereference());
                self.scn.push_u8(*op as u8);
                Ok(())
            }
            ExpBody::Binary { op, lhs, rhs, .. } => {
                if !need_value {
                    return Err(Self::err_atom(ErrorCode::BsNeedReference, first_atom(n)));
                }
                self.exp(lhs, true)?;
                self.exp(rhs, true)?;
                self.scn.push_op(Opcode::Operate2);
                self.push_form(lhs.node_form.dereference());
                self.push_form(rhs.node_form.dereference());
                self.scn.push_u8(*op as u8);
                Ok(())
            }
        }
    }

    fn smp_exp(&mut self, n: &SmpExp, need_value: bool) -> BsResult<()> {
        match &n.body {
            SmpBody::Paren(e) => self.exp(e, need_value),
            SmpBody::Goto(g) => {
                if !need_value {
                    return Err(Self::err_atom(ErrorCode::BsNeedReference, g.keyword));
                }
                self.goto_exp(g)
            }
            SmpBody::ElmExp(e) => self.elm_exp(e, need_value),
            SmpBody::ExpList(l) => {
                if !need_value {
                    let atom = l.exps.first().map(first_atom).unwrap_or_else(crate::la::Atom::none);
                    return Err(Self::err_atom(ErrorCode::BsNeedReference, atom));
                }
                for e in &l.exps {
                    self.exp(e, true)?;
                }
                Ok(())
            }
            SmpBody::Literal(l) => {
                if !need_value {
                    return Err(Self::err_atom(ErrorCode::BsNeedReference, l.atom));
                }
                self.literal(l);
                Ok(())
            }
        }
    }

    fn literal(&mut self, l: &Literal) {
        self.scn.push_op(Opcode::Push);
        if l.node_form == Form::Label {
            self.push_form(Form::Int);
        } else {
            self.push_form(l.node_form);
        }
        self.scn.push_i32(l.atom.opt);
    }

    fn arg_list(&mut self, args: &ArgList, need_value: bool) -> BsResult<()> {
        for a in &args.args {
            let form = a.exp.tmp_form;
            let need = need_value || form == Form::List || form.is_value();
            self.exp(&a.exp, need)?;
        }
        Ok(())
    }

    fn elm_exp(&mut self, n: &ElmExp, need_value: bool) -> BsResult<()> {
        match n.element_kind {
            Some(ElementKind::Command) => {
                let last = n.elm_list.elements.last();
                let (parent, code) = last.map_or((Form::Void, 0), |el| (el.element_parent_form, el.element_code));
                if is_msg_command(parent, code) {
                    self.push_msg_block();
                }
                self.elm_list(&n.elm_list)?;
                if is_read_flag_command(parent, code) {
                    self.scn.push_i32(self.cur_read_flag_no);
                    self.cur_read_flag_no += 1;
                    let line = last.map_or(0, |el| el.line);
                    self.read_flag_list.push(line as i32);
                }
                if need_value {
                    self.deref_for_value(n)?;
                }
            }
            _ => {
                self.elm_list(&n.elm_list)?;
                if need_value {
                    self.deref_for_value(n)?;
                }
            }
        }
        Ok(())
    }

    fn deref_for_value(&mut self, n: &ElmExp) -> BsResult<()> {
        let nf = n.node_form;
        if nf.is_value() {
            return Ok(());
        }
        if matches!(nf, Form::IntRef | Form::StrRef | Form::IntListRef | Form::StrListRef) {
            self.scn.push_op(Opcode::Property);
            return Ok(());
        }
        Err(Self::err_atom(ErrorCode::BsNeedValue, last_atom(n)))
    }

    fn elm_list(&mut self, n: &ElmList) -> BsResult<()> {
        self.scn.push_op(Opcode::ElmPoint);
        if n.parent_scope == Form::Call {
            self.scn.push_op(Opcode::Push);
            self.push_form(Form::Int);
            self.scn.push_i32(ELM_GLOBAL_CUR_CALL);
        }
        for el in &n.elements {
            self.element(el)?;
            if elm_owner(el.element_code) == ELM_OWNER_CALL_PROP && el.node_form.is_reference() {
                self.scn.push_op(Opcode::Property);
            }
        }
        Ok(())
    }

    fn element(&mut self, el: &ElementNode) -> BsResult<()> {
        match &el.body {
            ElementBody::Named { name, args } => {
                self.scn.push_op(Opcode::Push);
                self.push_form(Form::Int);
                self.scn.push_i32(el.element_code);
                if el.element_kind == Some(ElementKind::Command) {
                    self.command_call(el, *name, args)?;
                }
                Ok(())
            }
            ElementBody::Array { index, .. } => {
                self.scn.push_op(Opcode::Push);
                self.push_form(Form::Int);
                self.scn.push_i32(ELM_ARRAY);
                self.exp(index, true)
            }
        }
    }

    fn command_call(&mut self, el: &ElementNode, name: crate::la::Atom, args: &ArgList) -> BsResult<()> {
        let mut arg_cnt = args.args.len();
        self.arg_list(args, false)?;
        let template = self
            .inc
            .form_table
            .get_by_code(el.element_parent_form, el.element_code)
            .and_then(|info| info.overloads.get(&el.arg_list_id));
        // Missing trailing arguments are filled from template defaults.
        if let Some(template) = template
            && arg_cnt < template.len()
        {
            for t in &template[arg_cnt..] {
                if matches!(t.form, Form::Args | Form::ArgsRef) {
                    break;
                }
                self.scn.push_op(Opcode::Push);
                self.push_form(t.form);
                if t.form == Form::Int {
                    self.scn.push_i32(t.def_int);
                } else {
                    return Err(Self::err_atom(ErrorCode::BsIllegalDefaultArg, name));
                }
                arg_cnt += 1;
            }
        }
        self.scn.push_op(Opcode::Command);
        self.scn.push_i32(el.arg_list_id);
        self.scn.push_i32(arg_cnt as i32);
        // Argument forms are written back-to-front: defaults first, then
        // the real arguments.
        if let Some(template) = template
            && args.args.len() < template.len()
        {
            for t in template[args.args.len()..].iter().rev() {
                if matches!(t.form, Form::Args | Form::ArgsRef) {
                    break;
                }
                self.push_form(t.form);
            }
        }
        for a in args.args.iter().rev() {
            let form = a.exp.tmp_form;
            self.push_form(form);
            if form == Form::List
                && let ExpBody::Simple(smp) = &a.exp.body
                && let SmpBody::ExpList(list) = &smp.body
            {
                self.scn.push_i32(list.forms.len() as i32);
                for f in list.forms.iter().rev() {
                    self.push_form(f.dereference());
                }
            }
        }
        self.scn.push_i32(args.named_cnt as i32);
        for a in args.args.iter().rev() {
            if a.name.is_some() {
                self.scn.push_i32(a.name_id);
            }
        }
        self.push_form(el.node_form);
        Ok(())
    }

    fn push_msg_block(&mut self) {
        self.scn.push_op(Opcode::ElmPoint);
        self.scn.push_op(Opcode::Push);
        self.push_form(Form::Int);
        self.scn.push_i32(ELM_GLOBAL_MSG_BLOCK);
        self.scn.push_op(Opcode::Command);
        self.scn.push_i32(0);
        self.scn.push_i32(0);
        self.scn.push_i32(0);
        self.push_form(Form::Void);
    }
}

/// Lowers one scene and lays out its `.dat` image.
///
/// `rng` is the compilation-wide string shuffle state; it must be fed the
/// scenes in their sorted order.
pub fn compile(
    inc: &IncData,
    lex: &LexOutput,
    root: &Ss,
    ma: &MaOutput,
    rng: &mut MsvcRand,
) -> Result<Vec<u8>, StageError> {
    let str_cnt = lex.str_list.len();
    let mut str_sort_index: Vec<usize> = (0..str_cnt).collect();
    rng.shuffle(&mut str_sort_index);
    let mut str_index_list = vec![(0i32, 0i32); str_cnt];
    let mut ofs = 0i32;
    for &orig in &str_sort_index {
        let len = utf16_len(&lex.str_list[orig]) as i32;
        str_index_list[orig] = (ofs, len);
        ofs += len;
    }

    let user_props = &inc.property_list[inc.inc_property_cnt..];
    let user_cmds = &inc.command_list[inc.inc_command_cnt..];

    let mut bs = Bs {
        inc,
        lex,
        scn: BinaryStream::new(),
        label_list: vec![0; lex.label_list.len()],
        z_label_list: vec![0; Z_LABEL_CNT],
        cmd_label_list: Vec::new(),
        scn_cmd_list: vec![(0, 0); user_cmds.len()],
        namae_list: Vec::new(),
        read_flag_list: Vec::new(),
        cur_read_flag_no: 0,
        loop_labels: LoopLabelStack::new(),
    };
    bs.ss(&root.sentences)?;

    // Section layout.
    let mut h = ScnHeader {
        header_size: SCN_HEADER_SIZE as i32,
        ..ScnHeader::default()
    };
    let mut b = BinaryStream::new();
    b.push_bytes(&[0u8; SCN_HEADER_SIZE]);

    h.str_index_list_ofs = b.len() as i32;
    h.str_index_cnt = str_cnt as i32;
    for &(o, l) in &str_index_list {
        b.push_i32(o);
        b.push_i32(l);
    }
    h.str_list_ofs = b.len() as i32;
    h.str_cnt = str_cnt as i32;
    for &orig in &str_sort_index {
        let key = (28_807u32.wrapping_mul(orig as u32)) & 0xFFFF;
        for unit in lex.str_list[orig].encode_utf16() {
            b.push_u16(unit ^ key as u16);
        }
    }
    h.scn_ofs = b.len() as i32;
    h.scn_size = bs.scn.len() as i32;
    b.push_bytes(bs.scn.as_bytes());
    h.label_list_ofs = b.len() as i32;
    h.label_cnt = bs.label_list.len() as i32;
    for &v in &bs.label_list {
        b.push_i32(v);
    }
    h.z_label_list_ofs = b.len() as i32;
    h.z_label_cnt = bs.z_label_list.len() as i32;
    for &v in &bs.z_label_list {
        b.push_i32(v);
    }
    h.cmd_label_list_ofs = b.len() as i32;
    h.cmd_label_cnt = bs.cmd_label_list.len() as i32;
    for &(id, o) in &bs.cmd_label_list {
        b.push_i32(id);
        b.push_i32(o);
    }
    h.scn_prop_list_ofs = b.len() as i32;
    h.scn_prop_cnt = user_props.len() as i32;
    for p in user_props {
        b.push_i32(p.form.code());
        b.push_i32(p.size);
    }
    let prop_names: Vec<String> = user_props.iter().map(|p| p.name.clone()).collect();
    let prop_idx = mk_index_list(&prop_names);
    h.scn_prop_name_index_list_ofs = b.len() as i32;
    h.scn_prop_name_index_cnt = prop_idx.len() as i32;
    for &(o, l) in &prop_idx {
        b.push_i32(o);
        b.push_i32(l);
    }
    h.scn_prop_name_list_ofs = b.len() as i32;
    h.scn_prop_name_cnt = prop_names.len() as i32;
    for n in &prop_names {
        b.push_utf16(n);
    }
    h.scn_cmd_list_ofs = b.len() as i32;
    h.scn_cmd_cnt = bs.scn_cmd_list.len() as i32;
    for &(_, o) in &bs.scn_cmd_list {
        b.push_i32(o);
    }
    let cmd_names: Vec<String> = user_cmds.iter().map(|c| c.name.clone()).collect();
    let cmd_idx = mk_index_list(&cmd_names);
    h.scn_cmd_name_index_list_ofs = b.len() as i32;
    h.scn_cmd_name_index_cnt = cmd_idx.len() as i32;
    for &(o, l) in &cmd_idx {
        b.push_i32(o);
        b.push_i32(l);
    }
    h.scn_cmd_name_list_ofs = b.len() as i32;
    h.scn_cmd_name_cnt = cmd_names.len() as i32;
    for n in &cmd_names {
        b.push_utf16(n);
    }
    let call_idx = mk_index_list(&ma.call_prop_name_list);
    h.call_prop_name_index_list_ofs = b.len() as i32;
    h.call_prop_name_index_cnt = call_idx.len() as i32;
    for &(o, l) in &call_idx {
        b.push_i32(o);
        b.push_i32(l);
    }
    h.call_prop_name_list_ofs = b.len() as i32;
    h.call_prop_name_cnt = ma.call_prop_name_list.len() as i32;
    for n in &ma.call_prop_name_list {
        b.push_utf16(n);
    }
    h.namae_list_ofs = b.len() as i32;
    h.namae_cnt = bs.namae_list.len() as i32;
    for &v in &bs.namae_list {
        b.push_i32(v);
    }
    h.read_flag_list_ofs = b.len() as i32;
    h.read_flag_cnt = bs.read_flag_list.len() as i32;
    for &v in &bs.read_flag_list {
        b.push_i32(v);
    }

    let mut out = b.into_bytes();
    h.write_to(&mut out[..SCN_HEADER_SIZE]);
    Ok(out)
}

/// Decodes the string table of a `.dat` image back to original-id order.
pub fn decode_str_table(dat: &[u8], h: &ScnHeader) -> Vec<String> {
    let cnt = h.str_index_cnt.max(0) as usize;
    let mut out = Vec::with_capacity(cnt);
    let idx_ofs = h.str_index_list_ofs as usize;
    let blob_ofs = h.str_list_ofs as usize;
    for i in 0..cnt {
        let p = idx_ofs + i * 8;
        if p + 8 > dat.len() {
            out.push(String::new());
            continue;
        }
        let ofs = i32::from_le_bytes(dat[p..p + 4].try_into().unwrap()) as usize;
        let len = i32::from_le_bytes(dat[p + 4..p + 8].try_into().unwrap()) as usize;
        let start = blob_ofs + ofs * 2;
        let end = start + len * 2;
        if end > dat.len() {
            out.push(String::new());
            continue;
        }
        let key = (28_807u32.wrapping_mul(i as u32)) & 0xFFFF;
        let units: Vec<u16> = dat[start..end]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) ^ key as u16)
            .collect();
        out.push(String::from_utf16_lossy(&units));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ca, la, ma as ma_mod, sa};
    use pretty_assertions::assert_eq;

    fn lower(scene: &str) -> (Vec<u8>, LexOutput) {
        let mut inc = IncData::new();
        let expanded = ca::analyze_file(scene, &mut inc).expect("ca");
        let mut lex = la::analyze(&expanded).expect("la");
        let mut root = sa::analyze(&mut inc, &lex).expect("sa");
        let out = ma_mod::analyze(&mut inc, &mut lex, &mut root).expect("ma");
        let mut rng = MsvcRand::new(1);
        let dat = compile(&inc, &lex, &root, &out, &mut rng).expect("bs");
        (dat, lex)
    }

    #[test]
    fn minimal_scene_layout() {
        let (dat, _) = lower("\n*z0\n\"hi\"\n");
        let h = ScnHeader::parse(&dat).unwrap();
        assert_eq!(h.header_size, SCN_HEADER_SIZE as i32);
        assert_eq!(h.str_cnt, 1);
        assert_eq!(h.z_label_cnt, Z_LABEL_CNT as i32);
        assert_eq!(h.read_flag_cnt, 1);
        // z0 points at the byte after the leading CD_NL immediates.
        let z0 = {
            let p = h.z_label_list_ofs as usize;
            i32::from_le_bytes(dat[p..p + 4].try_into().unwrap())
        };
        assert!(z0 > 0);
        let scn = &dat[h.scn_ofs as usize..(h.scn_ofs + h.scn_size) as usize];
        assert_eq!(scn[z0 as usize - 5], Opcode::Nl as u8);
        assert_eq!(*scn.last().unwrap(), Opcode::Eof as u8);
        let strings = decode_str_table(&dat, &h);
        assert_eq!(strings, vec!["hi"]);
    }

    #[test]
    fn empty_scene_is_just_z0_and_eof() {
        let (dat, _) = lower("*z0\n");
        let h = ScnHeader::parse(&dat).unwrap();
        assert_eq!(h.str_cnt, 0);
        assert_eq!(h.read_flag_cnt, 0);
        let scn = &dat[h.scn_ofs as usize..(h.scn_ofs + h.scn_size) as usize];
        // Two sentences: the z-label and the EOF, each preceded by CD_NL.
        assert_eq!(scn[0], Opcode::Nl as u8);
        assert_eq!(*scn.last().unwrap(), Opcode::Eof as u8);
    }

    #[test]
    fn string_table_is_shuffled_but_recoverable() {
        let text: String = (0..12).map(|i| format!("\"str{i}\"\n")).collect();
        let (dat, lex) = lower(&format!("*z0\n{text}"));
        let h = ScnHeader::parse(&dat).unwrap();
        let strings = decode_str_table(&dat, &h);
        assert_eq!(strings, lex.str_list);
        // Twelve strings virtually never shuffle to identity: the blob
        // order must differ from source order.
        let first = {
            let p = h.str_index_list_ofs as usize;
            i32::from_le_bytes(dat[p..p + 4].try_into().unwrap())
        };
        let mut offsets = Vec::new();
        for i in 0..strings.len() {
            let p = h.str_index_list_ofs as usize + i * 8;
            offsets.push(i32::from_le_bytes(dat[p..p + 4].try_into().unwrap()));
        }
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_ne!(offsets, sorted, "expected a shuffled layout");
        let _ = first;
    }

    #[test]
    fn str_index_intervals_are_disjoint_and_exhaustive() {
        let (dat, lex) = lower("*z0\n\"alpha\"\n\"be\"\n\"gamma!\"\n");
        let h = ScnHeader::parse(&dat).unwrap();
        let mut intervals = Vec::new();
        let mut total = 0;
        for i in 0..h.str_index_cnt as usize {
            let p = h.str_index_list_ofs as usize + i * 8;
            let o = i32::from_le_bytes(dat[p..p + 4].try_into().unwrap());
            let l = i32::from_le_bytes(dat[p + 4..p + 8].try_into().unwrap());
            intervals.push((o, o + l));
            total += l;
            assert_eq!(l as usize, lex.str_list[i].encode_utf16().count());
        }
        intervals.sort_unstable();
        for w in intervals.windows(2) {
            assert_eq!(w[0].1, w[1].0, "intervals must tile the blob");
        }
        assert_eq!(total, intervals.last().unwrap().1);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let mut inc = IncData::new();
        let expanded = ca::analyze_file("*z0\nbreak\n", &mut inc).unwrap();
        let mut lex = la::analyze(&expanded).unwrap();
        let mut root = sa::analyze(&mut inc, &lex).unwrap();
        let out = ma_mod::analyze(&mut inc, &mut lex, &mut root).unwrap();
        let mut rng = MsvcRand::new(1);
        let err = compile(&inc, &lex, &root, &out, &mut rng).unwrap_err();
        assert_eq!(err.code, ErrorCode::BsBreakNoLoop);
    }

    #[test]
    fn continue_outside_loop_is_rejected() {
        let mut inc = IncData::new();
        let expanded = ca::analyze_file("*z0\ncontinue\n", &mut inc).unwrap();
        let mut lex = la::analyze(&expanded).unwrap();
        let mut root = sa::analyze(&mut inc, &lex).unwrap();
        let out = ma_mod::analyze(&mut inc, &mut lex, &mut root).unwrap();
        let mut rng = MsvcRand::new(1);
        let err = compile(&inc, &lex, &root, &out, &mut rng).unwrap_err();
        assert_eq!(err.code, ErrorCode::BsContinueNoLoop);
    }

    #[test]
    fn command_definition_emits_skip_jump_and_label() {
        let (dat, _) = lower("*z0\ncommand cmd9() { \"inside\" }\ncmd9()\n");
        let h = ScnHeader::parse(&dat).unwrap();
        assert_eq!(h.cmd_label_cnt, 1);
        assert_eq!(h.scn_cmd_cnt, 1);
        let p = h.cmd_label_list_ofs as usize;
        let cmd_id = i32::from_le_bytes(dat[p..p + 4].try_into().unwrap());
        let body = i32::from_le_bytes(dat[p + 4..p + 8].try_into().unwrap());
        assert_eq!(cmd_id, 0);
        assert!(body > 0 && body < h.scn_size);
        // scn_cmd_list mirrors the body offset for scene-local commands.
        let q = h.scn_cmd_list_ofs as usize;
        assert_eq!(i32::from_le_bytes(dat[q..q + 4].try_into().unwrap()), body);
    }

    #[test]
    fn speaker_names_deduplicate_by_text() {
        let (dat, _) = lower(
            "*z0\n\u{3010}\"alice\"\u{3011}\n\"a\"\n\u{3010}\"bob\"\u{3011}\n\"b\"\n\u{3010}\"alice\"\u{3011}\n\"c\"\n",
        );
        let h = ScnHeader::parse(&dat).unwrap();
        assert_eq!(h.namae_cnt, 2);
    }

    #[test]
    fn read_flags_carry_line_numbers() {
        let (dat, _) = lower("*z0\n\"one\"\n\n\"three\"\n");
        let h = ScnHeader::parse(&dat).unwrap();
        assert_eq!(h.read_flag_cnt, 2);
        let p = h.read_flag_list_ofs as usize;
        let l0 = i32::from_le_bytes(dat[p..p + 4].try_into().unwrap());
        let l1 = i32::from_le_bytes(dat[p + 4..p + 8].try_into().unwrap());
        assert_eq!(l0, 2);
        assert_eq!(l1, 4);
    }

    #[test]
    fn labels_point_inside_the_bytecode() {
        let (dat, _) = lower("*z0\n*top\n\"x\"\ngoto *top\n");
        let h = ScnHeader::parse(&dat).unwrap();
        for i in 0..h.label_cnt as usize {
            let p = h.label_list_ofs as usize + i * 4;
            let v = i32::from_le_bytes(dat[p..p + 4].try_into().unwrap());
            assert!(v >= 0 && v <= h.scn_size);
        }
    }
}
