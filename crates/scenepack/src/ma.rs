//! Meaning analyzer: element resolution, overload selection, type checks.
//!
//! Walks the scene tree bottom-up, resolving element chains against the
//! form table (call -> scene -> global), choosing overload argument lists,
//! and annotating nodes with their forms. The one implicit coercion lives
//! here: a lone unknown identifier in value position becomes a string
//! literal when its name contains neither `@` nor `$`.

use crate::{
    elements::{ArgTemplate, Element, ElementOrigin, is_sel_command},
    error::ErrorCode,
    forms::{ELM_OWNER_CALL_PROP, ElementKind, Form, create_elm_code},
    ia::{IncData, StageError},
    la::{Atom, AtomKind, LexOutput},
    tree::{
        ArgList, AssignNode, DefCmd, DefProp, ElementBody, ElementNode, ElmExp, ElmList, Exp, ExpBody, ExpList,
        ForNode, GotoKind, GotoNode, IfNode, Literal, OpCode, ReturnNode, Sentence, SentenceBody, SmpBody, SmpExp, Ss,
        SwitchNode, WhileNode, last_atom,
    },
};

type MaResult<T> = Result<T, StageError>;

/// Per-scene results MA adds on top of the annotated tree.
#[derive(Debug, Clone, Default)]
pub struct MaOutput {
    /// Names of properties declared inside command bodies, in slot order.
    pub call_prop_name_list: Vec<String>,
}

pub struct Ma<'a> {
    inc: &'a mut IncData,
    lex: &'a mut LexOutput,
    command_in: bool,
    cur_call_prop_cnt: usize,
    total_call_prop_cnt: usize,
    call_prop_name_list: Vec<String>,
}

fn err(code: ErrorCode, atom: Atom) -> StageError {
    StageError::new(code, atom.line)
}

impl<'a> Ma<'a> {
    pub fn new(inc: &'a mut IncData, lex: &'a mut LexOutput) -> Self {
        Self {
            inc,
            lex,
            command_in: false,
            cur_call_prop_cnt: 0,
            total_call_prop_cnt: 0,
            call_prop_name_list: Vec::new(),
        }
    }

    pub fn analyze(mut self, root: &mut Ss) -> MaResult<MaOutput> {
        for sen in &mut root.sentences {
            self.sentence(sen)?;
        }
        Ok(MaOutput {
            call_prop_name_list: self.call_prop_name_list,
        })
    }

    fn block(&mut self, sentences: &mut [Sentence]) -> MaResult<()> {
        for sen in sentences.iter_mut() {
            self.sentence(sen)?;
        }
        Ok(())
    }

    fn sentence(&mut self, sen: &mut Sentence) -> MaResult<()> {
        let mut sel = false;
        match &mut sen.body {
            SentenceBody::Label(_)
            | SentenceBody::ZLabel(_)
            | SentenceBody::Text(_)
            | SentenceBody::Eof(_)
            | SentenceBody::Name(_)
            | SentenceBody::Continue(_)
            | SentenceBody::Break(_) => {}
            SentenceBody::DefProp(dp) => self.def_prop(dp)?,
            SentenceBody::DefCmd(dc) => self.def_cmd(dc)?,
            SentenceBody::Goto(g) => self.goto(g)?,
            SentenceBody::Return(r) => self.return_(r, &mut sel)?,
            SentenceBody::If(n) => self.if_(n)?,
            SentenceBody::For(n) => self.for_(n)?,
            SentenceBody::While(n) => self.while_(n)?,
            SentenceBody::Switch(n) => self.switch(n)?,
            SentenceBody::Assign(n) => self.assign(n, &mut sel)?,
            SentenceBody::Command(n) => self.command(n, &mut sel)?,
        }
        sen.is_include_sel = sel;
        Ok(())
    }

    fn def_prop(&mut self, dp: &mut DefProp) -> MaResult<()> {
        if !self.command_in {
            return Err(err(ErrorCode::MaPropertyOutOfCommand, dp.name));
        }
        if let Some(fnode) = &mut dp.form_node
            && let Some(index) = &mut fnode.index
        {
            let mut sel = false;
            self.exp(index, &mut sel)?;
            if index.node_form != Form::Int {
                return Err(err(ErrorCode::MaDefPropNotInt, dp.name));
            }
        }
        let name = self.lex.unknown_name(dp.name.opt).to_owned();
        // Re-declaring a name inside the same command body keeps the first
        // binding, but the later declaration still consumes a slot.
        self.inc.form_table.add(
            Form::Call,
            Element {
                kind: ElementKind::Property,
                code: create_elm_code(ELM_OWNER_CALL_PROP, 0, self.cur_call_prop_cnt as u16),
                name: name.clone(),
                form: dp.form,
                size: 0,
                overloads: Default::default(),
                origin: ElementOrigin::Call,
            },
        );
        dp.prop_id = self.total_call_prop_cnt as i32;
        self.call_prop_name_list.push(name);
        self.cur_call_prop_cnt += 1;
        self.total_call_prop_cnt += 1;
        Ok(())
    }

    fn def_cmd(&mut self, dc: &mut DefCmd) -> MaResult<()> {
        self.command_in = true;
        for p in &mut dc.props {
            self.def_prop(p)?;
        }
        self.block(&mut dc.block)?;
        self.inc.form_table.reset_call();
        self.cur_call_prop_cnt = 0;
        self.command_in = false;
        Ok(())
    }

    fn goto(&mut self, g: &mut GotoNode) -> MaResult<()> {
        if g.kind != GotoKind::Goto {
            let mut sel = false;
            self.goto_exp(g, &mut sel)?;
            if sel {
                return Err(err(ErrorCode::MaSelCannotUseInGoto, g.keyword));
            }
        }
        g.node_form = Form::Void;
        Ok(())
    }

    fn goto_exp(&mut self, g: &mut GotoNode, sel: &mut bool) -> MaResult<()> {
        if let Some(args) = &mut g.args {
            for a in &mut args.args {
                self.exp(&mut a.exp, sel)?;
            }
        }
        g.node_form = match g.kind {
            GotoKind::Goto => Form::Void,
            GotoKind::Gosub => Form::Int,
            GotoKind::GosubStr => Form::Str,
        };
        Ok(())
    }

    fn return_(&mut self, r: &mut ReturnNode, sel: &mut bool) -> MaResult<()> {
        if let Some(exp) = &mut r.exp {
            self.exp(exp, sel)?;
        }
        Ok(())
    }

    fn if_(&mut self, n: &mut IfNode) -> MaResult<()> {
        for sub in &mut n.subs {
            if let Some(cond) = &mut sub.cond {
                let mut sel = false;
                self.exp(cond, &mut sel)?;
                if !cond.node_form.is_int_like() {
                    return Err(err(ErrorCode::MaIfCondIsNotInt, sub.keyword));
                }
                if sel {
                    return Err(err(ErrorCode::MaSelCannotUseInCond, sub.keyword));
                }
            }
            self.block(&mut sub.block)?;
        }
        Ok(())
    }

    fn for_(&mut self, n: &mut ForNode) -> MaResult<()> {
        self.block(&mut n.init)?;
        let mut sel = false;
        self.exp(&mut n.cond, &mut sel)?;
        if sel {
            return Err(err(ErrorCode::MaSelCannotUseInCond, n.keyword));
        }
        if !n.cond.node_form.is_int_like() {
            return Err(err(ErrorCode::MaForCondIsNotInt, n.keyword));
        }
        self.block(&mut n.step)?;
        self.block(&mut n.block)
    }

    fn while_(&mut self, n: &mut WhileNode) -> MaResult<()> {
        let mut sel = false;
        self.exp(&mut n.cond, &mut sel)?;
        if sel {
            return Err(err(ErrorCode::MaSelCannotUseInCond, n.keyword));
        }
        if !n.cond.node_form.is_int_like() {
            return Err(err(ErrorCode::MaWhileCondIsNotInt, n.keyword));
        }
        self.block(&mut n.block)
    }

    fn switch(&mut self, n: &mut SwitchNode) -> MaResult<()> {
        let mut sel = false;
        self.exp(&mut n.cond, &mut sel)?;
        if sel {
            return Err(err(ErrorCode::MaSelCannotUseInCond, n.keyword));
        }
        let cond_form = n.cond.node_form;
        for case in &mut n.cases {
            let mut case_sel = false;
            self.exp(&mut case.value, &mut case_sel)?;
            if case_sel {
                return Err(err(ErrorCode::MaSelCannotUseInCond, case.keyword));
            }
            let value_form = case.value.node_form;
            let compatible = (cond_form.is_int_like() && value_form.is_int_like())
                || (cond_form.is_str_like() && value_form.is_str_like());
            if !compatible {
                return Err(err(ErrorCode::MaCaseTypeMismatch, case.keyword));
            }
            self.block(&mut case.block)?;
        }
        if let Some(default) = &mut n.default {
            self.block(default)?;
        }
        Ok(())
    }

    fn assign(&mut self, n: &mut AssignNode, sel: &mut bool) -> MaResult<()> {
        {
            let mut left_sel = false;
            self.elm_exp(&mut n.left, &mut left_sel)?;
        }
        self.exp(&mut n.right, sel)?;
        let lf = n.left.node_form;
        let rf = n.right.node_form;
        let ef = if n.op == OpCode::None {
            rf
        } else {
            Self::check_operate_2(lf, rf, n.op)
        };
        n.equal_form = ef;
        match lf {
            Form::IntRef => {
                if !ef.is_int_like() {
                    return Err(err(ErrorCode::MaAssignTypeNoMatch, n.equal));
                }
                n.set_flag = false;
                n.al_id = 1;
            }
            Form::StrRef => {
                if !ef.is_str_like() {
                    return Err(err(ErrorCode::MaAssignTypeNoMatch, n.equal));
                }
                n.set_flag = false;
                n.al_id = 1;
            }
            Form::Void | Form::Int | Form::Str => {
                return Err(err(ErrorCode::MaAssignLeftNeedReference, n.equal));
            }
            _ => {
                if lf != ef {
                    return Err(err(ErrorCode::MaAssignTypeNoMatch, n.equal));
                }
                n.set_flag = true;
                n.al_id = 1;
            }
        }
        Ok(())
    }

    fn command(&mut self, n: &mut ElmExp, sel: &mut bool) -> MaResult<()> {
        self.elm_exp(n, sel)?;
        if n.element_kind != Some(ElementKind::Command) {
            return Err(err(ErrorCode::MaElementIsProperty, last_atom(n)));
        }
        Ok(())
    }

    /// Expression entry point, with the unknown-identifier recovery.
    fn exp(&mut self, n: &mut Exp, sel: &mut bool) -> MaResult<()> {
        match self.exp_sub(n, sel) {
            Ok(()) => Ok(()),
            Err(e) if e.code == ErrorCode::MaElementUnknown => {
                let Some(atom) = Self::rewrite_candidate(n) else {
                    return Err(e);
                };
                let name = self.lex.unknown_name(atom.opt).to_owned();
                if name.contains('@') || name.contains('$') {
                    return Err(e);
                }
                let str_id = self.lex.str_list.len() as i32;
                self.lex.str_list.push(name);
                let lit_atom = Atom {
                    id: atom.id,
                    line: atom.line,
                    kind: AtomKind::ValStr,
                    opt: str_id,
                    subopt: atom.subopt,
                };
                n.body = ExpBody::Simple(SmpExp {
                    node_form: Form::Str,
                    body: SmpBody::Literal(Literal {
                        atom: lit_atom,
                        node_form: Form::Str,
                    }),
                });
                n.node_form = Form::Str;
                n.tmp_form = Form::Str;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The rewrite fires only for a bare single-element chain with no
    /// arguments. Returns the identifier atom when eligible.
    fn rewrite_candidate(n: &Exp) -> Option<Atom> {
        let ExpBody::Simple(smp) = &n.body else { return None };
        let SmpBody::ElmExp(elm) = &smp.body else { return None };
        if elm.elm_list.elements.len() != 1 {
            return None;
        }
        let ElementBody::Named { name, args } = &elm.elm_list.elements[0].body else {
            return None;
        };
        if !args.args.is_empty() {
            return None;
        }
        Some(*name)
    }

    fn exp_sub(&mut self, n: &mut Exp, sel: &mut bool) -> MaResult<()> {
        match &mut n.body {
            ExpBody::Simple(smp) => {
                self.smp_exp(smp, sel)?;
                n.node_form = smp.node_form;
                n.tmp_form = smp.node_form;
                Ok(())
            }
            ExpBody::Unary { opr, op, exp } => {
                let opr = *opr;
                let op = *op;
                self.exp(exp, sel)?;
                let form = Self::check_operate_1(exp.node_form, op);
                n.node_form = form;
                n.tmp_form = form;
                if form == Form::Void {
                    return Err(err(ErrorCode::MaExpTypeNoMatch, opr));
                }
                Ok(())
            }
            ExpBody::Binary { opr, op, lhs, rhs } => {
                let opr = *opr;
                let op = *op;
                self.exp(lhs, sel)?;
                self.exp(rhs, sel)?;
                let form = Self::check_operate_2(lhs.node_form, rhs.node_form, op);
                n.node_form = form;
                n.tmp_form = form;
                if form == Form::Void {
                    return Err(err(ErrorCode::MaExpTypeNoMatch, opr));
                }
                Ok(())
            }
        }
    }

    fn exp_list(&mut self, n: &mut ExpList, sel: &mut bool) -> MaResult<()> {
        n.forms.clear();
        for e in &mut n.exps {
            self.exp(e, sel)?;
            n.forms.push(e.node_form);
        }
        Ok(())
    }

    fn smp_exp(&mut self, n: &mut SmpExp, sel: &mut bool) -> MaResult<()> {
        match &mut n.body {
            SmpBody::Paren(e) => {
                self.exp(e, sel)?;
                n.node_form = e.node_form;
            }
            SmpBody::ExpList(l) => {
                self.exp_list(l, sel)?;
                n.node_form = Form::List;
            }
            SmpBody::Goto(g) => {
                self.goto_exp(g, sel)?;
                n.node_form = g.node_form;
            }
            SmpBody::ElmExp(e) => {
                self.elm_exp(e, sel)?;
                n.node_form = e.node_form;
            }
            SmpBody::Literal(l) => {
                Self::literal(l);
                n.node_form = l.node_form;
            }
        }
        Ok(())
    }

    fn elm_exp(&mut self, n: &mut ElmExp, sel: &mut bool) -> MaResult<()> {
        self.elm_list(&mut n.elm_list, sel)?;
        n.element_kind = n.elm_list.element_kind;
        n.node_form = n.elm_list.node_form;
        Ok(())
    }

    fn elm_list(&mut self, n: &mut ElmList, sel: &mut bool) -> MaResult<()> {
        let first_name = match &n.elements[0].body {
            ElementBody::Named { name, .. } => self.lex.unknown_name(name.opt).to_owned(),
            ElementBody::Array { open_bracket, .. } => {
                return Err(err(ErrorCode::MaElementUnknown, *open_bracket).with_hint("[]"));
            }
        };
        let mut parent;
        let mut start = 0;
        match self.inc.form_table.find(&first_name).map(|(_, scope)| scope) {
            Some(scope) => {
                n.parent_scope = scope;
                parent = scope;
            }
            None => {
                let Some(form) = Form::from_name(&first_name) else {
                    let name_atom = match &n.elements[0].body {
                        ElementBody::Named { name, .. } => *name,
                        ElementBody::Array { open_bracket, .. } => *open_bracket,
                    };
                    return Err(err(ErrorCode::MaElementUnknown, name_atom).with_hint(format!("global.{first_name}")));
                };
                // A bare form name navigates into that form's bucket.
                let e0 = &mut n.elements[0];
                e0.node_form = form;
                e0.element_code = form.code();
                e0.element_kind = Some(ElementKind::Property);
                e0.element_parent_form = Form::Global;
                n.parent_scope = Form::Global;
                n.node_form = form;
                n.element_kind = Some(ElementKind::Property);
                parent = form;
                start = 1;
            }
        }
        for el in &mut n.elements[start..] {
            self.element(parent, el, sel)?;
            n.node_form = el.node_form;
            n.element_kind = el.element_kind;
            parent = el.node_form;
        }
        if n.element_kind == Some(ElementKind::Property) {
            n.node_form = n.node_form.reference();
        }
        Ok(())
    }

    fn element(&mut self, parent: Form, el: &mut ElementNode, sel: &mut bool) -> MaResult<()> {
        match &mut el.body {
            ElementBody::Named { name, args } => {
                let name = *name;
                let name_str = self.lex.unknown_name(name.opt).to_owned();
                let Some(info) = self.inc.form_table.get(parent, &name_str).cloned() else {
                    return Err(err(ErrorCode::MaElementUnknown, name).with_hint(format!("{parent}.{name_str}")));
                };
                el.node_form = info.form;
                el.element_code = info.code;
                el.element_kind = Some(info.kind);
                el.element_parent_form = parent;
                if info.kind == ElementKind::Command {
                    let mut inner_sel = false;
                    for a in &mut args.args {
                        self.exp(&mut a.exp, &mut inner_sel)?;
                    }
                    if inner_sel {
                        return Err(err(ErrorCode::MaSelCannotUseInArg, name));
                    }
                    let aid = Self::check_arg_list(self.lex, &info, args)?;
                    if aid < 0 {
                        return Err(err(ErrorCode::MaArgTypeNoMatch, name));
                    }
                    el.arg_list_id = aid;
                    if is_sel_command(parent, info.code) {
                        *sel = true;
                    }
                }
                Ok(())
            }
            ElementBody::Array { open_bracket, index } => {
                let open = *open_bracket;
                let Some(info) = self.inc.form_table.get(parent, "array").cloned() else {
                    return Err(err(ErrorCode::MaElementIllegalArray, open));
                };
                el.node_form = info.form;
                el.element_code = info.code;
                el.element_kind = Some(info.kind);
                el.element_parent_form = parent;
                let mut inner_sel = false;
                self.exp(index, &mut inner_sel)?;
                if inner_sel {
                    return Err(err(ErrorCode::MaSelCannotUseInIndex, open));
                }
                if !index.node_form.is_int_like() {
                    return Err(err(ErrorCode::MaIndexNotInt, open));
                }
                Ok(())
            }
        }
    }

    /// Overload selection. Candidates are tried in ascending id order; the
    /// named template (`-1`) is validated once a positional match is found.
    fn check_arg_list(lex: &LexOutput, info: &Element, real: &mut ArgList) -> MaResult<i32> {
        let keys: Vec<i32> = info.overloads.keys().copied().filter(|&k| k != -1).collect();
        for k in keys {
            if Self::check_no_named_arg_list(&info.overloads[&k], real) {
                Self::check_named_arg_list(lex, info, real)?;
                return Ok(k);
            }
        }
        Ok(-1)
    }

    fn check_no_named_arg_list(templates: &[ArgTemplate], real: &mut ArgList) -> bool {
        let positional_cnt = real.args.len() - real.named_cnt;
        let mut forms: Vec<Form> = real.args.iter().map(|a| a.exp.tmp_form).collect();
        let mut ti = 0;
        let mut ri = 0;
        loop {
            if ti == templates.len() {
                if ri == positional_cnt {
                    break;
                }
                return false;
            }
            let t = &templates[ti];
            if t.form == Form::Args {
                for f in &mut forms[ri..positional_cnt] {
                    *f = match *f {
                        Form::IntRef => Form::Int,
                        Form::StrRef => Form::Str,
                        other => other,
                    };
                }
                break;
            }
            if t.form == Form::ArgsRef {
                for f in &mut forms[ri..positional_cnt] {
                    *f = match *f {
                        Form::Int => Form::IntRef,
                        Form::Str => Form::StrRef,
                        other => other,
                    };
                }
                break;
            }
            if ri == positional_cnt {
                if t.def_exist {
                    break;
                }
                return false;
            }
            let rf = forms[ri];
            if t.form != rf {
                if t.form == Form::Int && rf == Form::IntRef {
                    forms[ri] = Form::Int;
                } else if t.form == Form::Str && rf == Form::StrRef {
                    forms[ri] = Form::Str;
                } else {
                    return false;
                }
            }
            ti += 1;
            ri += 1;
        }
        for (a, f) in real.args.iter_mut().zip(forms) {
            a.exp.tmp_form = f;
        }
        true
    }

    fn check_named_arg_list(lex: &LexOutput, info: &Element, real: &mut ArgList) -> MaResult<()> {
        if real.named_cnt == 0 {
            return Ok(());
        }
        let start = real.args.len() - real.named_cnt;
        let Some(template) = info.overloads.get(&-1) else {
            let atom = real.args[start].name.unwrap_or_else(Atom::none);
            return Err(err(ErrorCode::MaCmdNoNamedArgList, atom));
        };
        for a in &mut real.args[start..] {
            let name_atom = a.name.unwrap_or_else(Atom::none);
            let arg_name = lex.unknown_name(name_atom.opt);
            let Some(slot) = template.iter().find(|t| t.name == arg_name) else {
                return Err(err(ErrorCode::MaCmdIllegalNamedArg, name_atom));
            };
            let rf = a.exp.tmp_form;
            if rf != slot.form {
                if slot.form == Form::Int && rf == Form::IntRef {
                    a.exp.tmp_form = Form::Int;
                } else if slot.form == Form::Str && rf == Form::StrRef {
                    a.exp.tmp_form = Form::Str;
                } else {
                    return Err(err(ErrorCode::MaArgTypeNoMatch, name_atom));
                }
            }
            a.name_id = slot.id;
        }
        Ok(())
    }

    fn literal(l: &mut Literal) {
        l.node_form = match l.atom.kind {
            AtomKind::ValInt => Form::Int,
            AtomKind::ValStr => Form::Str,
            AtomKind::Label => Form::Label,
            _ => Form::Void,
        };
    }

    fn check_operate_1(rf: Form, _op: OpCode) -> Form {
        if rf.is_int_like() { Form::Int } else { Form::Void }
    }

    fn check_operate_2(lf: Form, rf: Form, op: OpCode) -> Form {
        if lf.is_int_like() && rf.is_int_like() {
            return match op {
                OpCode::None | OpCode::Tilde => Form::Void,
                _ => Form::Int,
            };
        }
        if lf.is_str_like() && rf.is_str_like() {
            if op == OpCode::Plus {
                return Form::Str;
            }
            if op.is_comparison() {
                return Form::Int;
            }
            return Form::Void;
        }
        if lf.is_str_like() && rf.is_int_like() {
            if op == OpCode::Multiple {
                return Form::Str;
            }
            return Form::Void;
        }
        Form::Void
    }
}

/// Resolves one scene tree against the shared table.
pub fn analyze(inc: &mut IncData, lex: &mut LexOutput, root: &mut Ss) -> MaResult<MaOutput> {
    Ma::new(inc, lex).analyze(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ca, la, sa};

    fn compile_front(inc_text: &str, scene: &str) -> Result<(Ss, IncData, LexOutput, MaOutput), StageError> {
        let mut inc = IncData::new();
        if !inc_text.is_empty() {
            let mut ia = crate::ia::IncAnalyzer::new(inc_text, Form::Global, &mut inc);
            let pending = ia.step1()?;
            ia.step2(pending)?;
        }
        let expanded = ca::analyze_file(scene, &mut inc)?;
        let mut lex = la::analyze(&expanded)?;
        let mut root = sa::analyze(&mut inc, &lex)?;
        let out = analyze(&mut inc, &mut lex, &mut root)?;
        Ok((root, inc, lex, out))
    }

    #[test]
    fn list_property_assignment_resolves() {
        let (root, ..) = compile_front("", "*z0\nf[3] = 42\n").unwrap();
        let SentenceBody::Assign(assign) = &root.sentences[1].body else {
            panic!("expected assign");
        };
        assert_eq!(assign.left.node_form, Form::IntRef);
        assert_eq!(assign.al_id, 1);
        assert!(!assign.set_flag);
    }

    #[test]
    fn str_list_assignment_type_checks() {
        assert!(compile_front("", "*z0\ns[0] = \"x\"\n").is_ok());
        let e = compile_front("", "*z0\ns[0] = 3\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaAssignTypeNoMatch);
    }

    #[test]
    fn command_result_is_not_assignable() {
        let inc_text = "#command pick(): int\n";
        let scene = "*z0\ncommand pick(): int { return(7) }\npick() = 3\n";
        let e = compile_front(inc_text, scene).unwrap_err();
        assert_eq!(e.code, ErrorCode::MaAssignLeftNeedReference);
    }

    #[test]
    fn unknown_bare_identifier_becomes_string() {
        let (root, _, lex, _) = compile_front("", "*z0\nset_face(smile01)\n").unwrap();
        assert!(lex.str_list.iter().any(|s| s == "smile01"));
        assert!(matches!(root.sentences[1].body, SentenceBody::Command(_)));
    }

    #[test]
    fn at_sign_inhibits_the_string_rewrite() {
        let e = compile_front("", "*z0\nset_face(smile@01)\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaElementUnknown);
    }

    #[test]
    fn overload_selection_picks_by_arity() {
        let (root, ..) = compile_front("", "*z0\nkoe(1500)\nkoe(1500, 3)\n").unwrap();
        let get_aid = |sen: &Sentence| {
            let SentenceBody::Command(c) = &sen.body else { panic!("expected command") };
            c.elm_list.elements[0].arg_list_id
        };
        assert_eq!(get_aid(&root.sentences[1]), 0);
        assert_eq!(get_aid(&root.sentences[2]), 1);
    }

    #[test]
    fn arg_type_mismatch_is_reported() {
        let e = compile_front("", "*z0\nkoe(\"oops\", 1)\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaArgTypeNoMatch);
    }

    #[test]
    fn named_argument_marks_selection_statement() {
        let (root, ..) = compile_front("", "*z0\nf[0] = sel([\"a\", \"b\"], timeout=30)\n").unwrap();
        assert!(root.sentences[1].is_include_sel);
    }

    #[test]
    fn unknown_named_argument_is_an_error() {
        let e = compile_front("", "*z0\nf[0] = sel([\"a\"], bogus=1)\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaCmdIllegalNamedArg);
    }

    #[test]
    fn sel_cannot_be_used_in_conditions() {
        let e = compile_front("", "*z0\nif (sel([\"a\"])) { \"x\" }\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaSelCannotUseInCond);
    }

    #[test]
    fn property_declaration_outside_command_fails() {
        let e = compile_front("", "*z0\nproperty tmp: int\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaPropertyOutOfCommand);
    }

    #[test]
    fn duplicate_call_property_keeps_first_binding() {
        let scene = "*z0\n\
             command cmd1() { property x: int property x: str x = 1 }\n\
             cmd1()\n";
        let (_, _, _, out) = compile_front("", scene).unwrap();
        // Both declarations consume a slot, but `x = 1` resolved against
        // the first (int) binding.
        assert_eq!(out.call_prop_name_list, vec!["x", "x"]);
    }

    #[test]
    fn command_used_as_value_has_value_form() {
        let inc_text = "#command pick(): int\n";
        let scene = "*z0\ncommand pick(): int { return(7) }\nf[0] = pick()\n";
        let (root, ..) = compile_front(inc_text, scene).unwrap();
        let SentenceBody::Assign(assign) = &root.sentences[2].body else {
            panic!("expected assign");
        };
        assert_eq!(assign.right.node_form, Form::Int);
    }

    #[test]
    fn string_int_multiplication_is_string_repeat() {
        assert!(compile_front("", "*z0\ns[0] = \"ab\" * 3\n").is_ok());
        let e = compile_front("", "*z0\ns[0] = \"ab\" - 3\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaExpTypeNoMatch);
    }

    #[test]
    fn if_condition_must_be_int() {
        let e = compile_front("", "*z0\nif (\"x\") { \"y\" }\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaIfCondIsNotInt);
    }

    #[test]
    fn switch_case_types_must_agree() {
        assert!(compile_front("", "*z0\nswitch (f[0]) { case (1) \"a\" }\n").is_ok());
        let e = compile_front("", "*z0\nswitch (f[0]) { case (\"s\") \"a\" }\n").unwrap_err();
        assert_eq!(e.code, ErrorCode::MaCaseTypeMismatch);
    }

    #[test]
    fn mwnd_member_chain_resolves() {
        let (root, ..) = compile_front("", "*z0\nmwnd.print(\"hi\")\n").unwrap();
        let SentenceBody::Command(c) = &root.sentences[1].body else {
            panic!("expected command");
        };
        assert_eq!(c.elm_list.elements.len(), 2);
        assert_eq!(c.elm_list.elements[1].element_parent_form, Form::Mwnd);
    }
}
