//! Syntactic analyzer: recursive descent over the atom stream.
//!
//! Alternatives are tried in a fixed order; a failed alternative records
//! the error at the deepest atom reached, and the error that survives to
//! the caller is the one with the largest atom id. Label existence,
//! z-label 0, and command-definition checks run after the parse.

use crate::{
    elements::ArgTemplate,
    error::ErrorCode,
    forms::Form,
    ia::{IncData, StageError},
    la::{Atom, AtomKind, LexOutput, Z_LABEL_CNT},
    tree::{
        ArgList, ArgNode, AssignNode, CaseNode, DefCmd, DefProp, ElementBody, ElementNode, ElmExp, ElmList, Exp,
        ExpBody, ExpList, ForNode, FormNode, GotoKind, GotoNode, GotoTargetKind, IfNode, IfSub, Literal, NameNode,
        OpCode, ReturnNode, SentenceBody, SmpBody, SmpExp, Ss, SwitchNode, WhileNode,
    },
    tree::Sentence,
};

const PRI_MAX: u32 = 99;

#[derive(Debug, Clone, Copy)]
struct BestError {
    code: Option<ErrorCode>,
    atom: Atom,
}

/// One label slot's definition state during the parse.
#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    line: u32,
    exist: bool,
}

pub struct Sa<'a> {
    inc: &'a mut IncData,
    lex: &'a LexOutput,
    labels: Vec<SlotState>,
    z_labels: Vec<SlotState>,
    best: BestError,
}

type P<T> = Option<(usize, T)>;

impl<'a> Sa<'a> {
    pub fn new(inc: &'a mut IncData, lex: &'a LexOutput) -> Self {
        let labels = lex
            .label_list
            .iter()
            .map(|l| SlotState {
                line: l.line,
                exist: false,
            })
            .collect();
        Self {
            inc,
            lex,
            labels,
            z_labels: vec![SlotState::default(); Z_LABEL_CNT],
            best: BestError {
                code: None,
                atom: Atom::none(),
            },
        }
    }

    fn a(&self, i: usize) -> Atom {
        self.lex.atom(i)
    }

    fn fail<T>(&mut self, code: ErrorCode, atom: Atom) -> Option<T> {
        if self.best.code.is_none() || self.best.atom.id < atom.id {
            self.best = BestError {
                code: Some(code),
                atom,
            };
        }
        None
    }

    fn atom(&self, i: usize, kind: AtomKind) -> P<Atom> {
        let a = self.a(i);
        (a.kind == kind).then_some((i + 1, a))
    }

    /// Runs the full parse plus the post-parse checks.
    pub fn analyze(mut self) -> Result<Ss, StageError> {
        let saved = self.best;
        let (_, sentences) = match self.ss(0) {
            Some(r) => r,
            None => return Err(self.take_error()),
        };
        self.best = saved;
        for (i, slot) in self.labels.iter().enumerate() {
            if !slot.exist {
                let name = self.lex.label_list[i].name.clone();
                return Err(StageError::new(ErrorCode::SaLabelNotExist, slot.line).with_hint(name));
            }
        }
        if !self.z_labels[0].exist {
            return Err(StageError::new(ErrorCode::SaZLabel00NotExist, 0));
        }
        for cmd in &self.inc.command_list[self.inc.inc_command_cnt..] {
            if !cmd.is_defined {
                return Err(StageError::new(ErrorCode::SaDefCmdNotExist, 0).with_hint(cmd.name.clone()));
            }
        }
        Ok(Ss { sentences })
    }

    fn take_error(&self) -> StageError {
        let code = self.best.code.unwrap_or(ErrorCode::SaSentenceIllegal);
        StageError::new(code, self.best.atom.line)
    }

    fn ss(&mut self, mut p: usize) -> P<Vec<Sentence>> {
        let saved = self.best;
        let mut sentences = Vec::new();
        while self.a(p).kind != AtomKind::None {
            let (p2, sen) = self.sentence(p)?;
            sentences.push(sen);
            p = p2;
        }
        self.best = saved;
        Some((p, sentences))
    }

    fn block(&mut self, p: usize) -> P<Vec<Sentence>> {
        let saved = self.best;
        let (mut p, open) = self.atom(p, AtomKind::OpenBrace)?;
        let mut sentences = Vec::new();
        while !matches!(self.a(p).kind, AtomKind::None | AtomKind::CloseBrace) {
            let Some((p2, sen)) = self.sentence(p) else {
                let a = self.a(p);
                return self.fail(ErrorCode::SaBlockIllegalSentence, a);
            };
            sentences.push(sen);
            p = p2;
        }
        let Some((p, _)) = self.atom(p, AtomKind::CloseBrace) else {
            return self.fail(ErrorCode::SaBlockNoCloseBrace, open);
        };
        self.best = saved;
        Some((p, sentences))
    }

    fn sentence(&mut self, p: usize) -> P<Sentence> {
        let saved = self.best;
        let line = self.a(p).line;
        macro_rules! alt {
            ($parse:expr, $wrap:expr) => {
                if let Some((p2, node)) = $parse {
                    self.best = saved;
                    return Some((
                        p2,
                        Sentence {
                            line,
                            is_include_sel: false,
                            body: $wrap(node),
                        },
                    ));
                }
            };
        }
        alt!(self.label(p), SentenceBody::Label);
        alt!(self.z_label(p), SentenceBody::ZLabel);
        alt!(self.def_cmd(p), SentenceBody::DefCmd);
        alt!(self.def_prop(p), SentenceBody::DefProp);
        alt!(self.goto(p), SentenceBody::Goto);
        alt!(self.return_(p), SentenceBody::Return);
        alt!(self.if_(p), SentenceBody::If);
        alt!(self.for_(p), SentenceBody::For);
        alt!(self.while_(p), SentenceBody::While);
        alt!(self.atom(p, AtomKind::Continue), SentenceBody::Continue);
        alt!(self.atom(p, AtomKind::Break), SentenceBody::Break);
        alt!(self.switch(p), SentenceBody::Switch);
        if let Some((p2, either)) = self.command_or_assign(p) {
            self.best = saved;
            let body = match either {
                CommandOrAssign::Command(c) => SentenceBody::Command(c),
                CommandOrAssign::Assign(a) => SentenceBody::Assign(a),
            };
            return Some((
                p2,
                Sentence {
                    line,
                    is_include_sel: false,
                    body,
                },
            ));
        }
        alt!(self.name(p), SentenceBody::Name);
        alt!(self.atom(p, AtomKind::ValStr), SentenceBody::Text);
        alt!(self.atom(p, AtomKind::Eof), SentenceBody::Eof);
        let a = self.a(p);
        self.fail(ErrorCode::SaSentenceIllegal, a)
    }

    fn label(&mut self, p: usize) -> P<Atom> {
        let (p, atom) = self.atom(p, AtomKind::Label)?;
        let idx = atom.opt as usize;
        if idx < self.labels.len() {
            if self.labels[idx].exist {
                return self.fail(ErrorCode::SaLabelOverlapped, atom);
            }
            self.labels[idx] = SlotState {
                line: atom.line,
                exist: true,
            };
        }
        Some((p, atom))
    }

    fn z_label(&mut self, p: usize) -> P<Atom> {
        let (p, atom) = self.atom(p, AtomKind::ZLabel)?;
        let zi = atom.opt as usize;
        if zi < self.z_labels.len() {
            if self.z_labels[zi].exist {
                return self.fail(ErrorCode::SaZLabelOverlapped, atom);
            }
            self.z_labels[zi] = SlotState {
                line: atom.line,
                exist: true,
            };
        }
        let backing = atom.subopt as usize;
        if backing < self.labels.len() {
            self.labels[backing] = SlotState {
                line: atom.line,
                exist: true,
            };
        }
        Some((p, atom))
    }

    fn def_prop(&mut self, p: usize) -> P<DefProp> {
        let saved = self.best;
        let line = self.a(p).line;
        let (p, _kw) = self.atom(p, AtomKind::Property)?;
        let Some((mut p, name)) = self.atom(p, AtomKind::Unknown) else {
            let a = self.a(p);
            return self.fail(ErrorCode::SaDefPropIllegalName, a);
        };
        let mut form_node = None;
        let mut form = Form::Int;
        if let Some((p2, _)) = self.atom(p, AtomKind::Colon) {
            let (p3, f) = self.form(p2)?;
            form = f.form;
            form_node = Some(f);
            p = p3;
        }
        self.best = saved;
        Some((
            p,
            DefProp {
                line,
                name,
                form_node,
                form,
                prop_id: 0,
            },
        ))
    }

    fn form(&mut self, p: usize) -> P<FormNode> {
        let saved = self.best;
        let (mut p, f) = self.atom(p, AtomKind::Unknown)?;
        let name = self.lex.unknown_name(f.opt);
        let Some(form) = Form::from_decl_name(name) else {
            return self.fail(ErrorCode::SaDefPropIllegalForm, f);
        };
        let mut open_bracket = None;
        let mut index = None;
        if let Some((p2, ob)) = self.atom(p, AtomKind::OpenBracket) {
            open_bracket = Some(ob);
            let (p3, exp) = self.exp(p2, 0)?;
            let Some((p4, _)) = self.atom(p3, AtomKind::CloseBracket) else {
                return self.fail(ErrorCode::SaDefPropNoCloseBracket, ob);
            };
            index = Some(Box::new(exp));
            p = p4;
        }
        self.best = saved;
        Some((
            p,
            FormNode {
                form,
                open_bracket,
                index,
            },
        ))
    }

    fn def_cmd(&mut self, p: usize) -> P<DefCmd> {
        let saved = self.best;
        let line = self.a(p).line;
        let (p, _kw) = self.atom(p, AtomKind::Command)?;
        let Some((mut p, name)) = self.atom(p, AtomKind::Unknown) else {
            let a = self.a(p);
            return self.fail(ErrorCode::SaDefCmdIllegalName, a);
        };
        let mut props = Vec::new();
        if let Some((p2, _)) = self.atom(p, AtomKind::OpenParen) {
            p = p2;
            if let Some((p3, _)) = self.atom(p, AtomKind::CloseParen) {
                p = p3;
            } else {
                loop {
                    let Some((p3, dp)) = self.def_prop(p) else {
                        let a = self.a(p);
                        return self.fail(ErrorCode::SaDefCmdIllegalArg, a);
                    };
                    props.push(dp);
                    p = p3;
                    if let Some((p4, _)) = self.atom(p, AtomKind::CloseParen) {
                        p = p4;
                        break;
                    }
                    let Some((p4, _)) = self.atom(p, AtomKind::Comma) else {
                        let a = self.a(p);
                        return self.fail(ErrorCode::SaDefCmdNoComma, a);
                    };
                    p = p4;
                }
            }
        }
        let mut form = Form::Int;
        if let Some((p2, _)) = self.atom(p, AtomKind::Colon) {
            let Some((p3, f)) = self.form(p2) else {
                let a = self.a(p2);
                return self.fail(ErrorCode::SaDefCmdIllegalForm, a);
            };
            form = f.form;
            p = p3;
        }
        let Some((p, block)) = self.block(p) else {
            return self.fail(ErrorCode::SaDefCmdNoOpenBrace, name);
        };
        let cmd_name = self.lex.unknown_name(name.opt).to_owned();
        let cmd_id = match self.inc.find_command(&cmd_name).cloned() {
            None => {
                let args: Vec<ArgTemplate> = props.iter().map(|x| ArgTemplate::positional(x.form)).collect();
                self.inc.push_command(Form::Scene, &cmd_name, form, args, true) as i32
            }
            Some(cmd) => {
                if cmd.is_defined {
                    return self.fail(ErrorCode::SaDefCmdAlreadyDefined, name);
                }
                if cmd.id < self.inc.inc_command_cnt {
                    if cmd.form != form {
                        return self.fail(ErrorCode::SaDefCmdTypeNoMatch, name);
                    }
                    if cmd.args.len() != props.len() {
                        return self.fail(ErrorCode::SaDefCmdArgTypeNoMatch, name);
                    }
                    for (t, dp) in cmd.args.iter().zip(&props) {
                        if t.form != dp.form {
                            return self.fail(ErrorCode::SaDefCmdArgTypeNoMatch, name);
                        }
                    }
                } else if let Some(c) = self.inc.command_list.iter_mut().find(|c| c.name == cmd_name) {
                    c.is_defined = true;
                }
                cmd.id as i32
            }
        };
        self.best = saved;
        Some((
            p,
            DefCmd {
                line,
                name,
                props,
                form,
                block,
                cmd_id,
            },
        ))
    }

    fn goto(&mut self, p: usize) -> P<GotoNode> {
        let saved = self.best;
        let line = self.a(p).line;
        let (kind, keyword, mut p) = if let Some((p2, kw)) = self.atom(p, AtomKind::Goto) {
            (GotoKind::Goto, kw, p2)
        } else if let Some((p2, kw)) = self.atom(p, AtomKind::Gosub) {
            (GotoKind::Gosub, kw, p2)
        } else if let Some((p2, kw)) = self.atom(p, AtomKind::GosubStr) {
            (GotoKind::GosubStr, kw, p2)
        } else {
            return None;
        };
        let mut args = None;
        if kind != GotoKind::Goto {
            let (p2, al) = self.arg_list(p)?;
            args = Some(al);
            p = p2;
        }
        if let Some((p2, target)) = self.atom(p, AtomKind::Label) {
            self.best = saved;
            return Some((
                p2,
                GotoNode {
                    line,
                    kind,
                    keyword,
                    args,
                    target_kind: GotoTargetKind::Label,
                    target,
                    node_form: Form::Void,
                },
            ));
        }
        if let Some((p2, target)) = self.atom(p, AtomKind::ZLabel) {
            self.best = saved;
            return Some((
                p2,
                GotoNode {
                    line,
                    kind,
                    keyword,
                    args,
                    target_kind: GotoTargetKind::ZLabel,
                    target,
                    node_form: Form::Void,
                },
            ));
        }
        self.fail(ErrorCode::SaGotoNoLabel, keyword)
    }

    fn return_(&mut self, p: usize) -> P<ReturnNode> {
        let saved = self.best;
        let line = self.a(p).line;
        let (mut p, keyword) = self.atom(p, AtomKind::Return)?;
        let mut exp = None;
        if let Some((p2, _)) = self.atom(p, AtomKind::OpenParen) {
            let Some((p3, e)) = self.exp(p2, 0) else {
                return self.fail(ErrorCode::SaReturnIllegalExp, keyword);
            };
            let Some((p4, _)) = self.atom(p3, AtomKind::CloseParen) else {
                return self.fail(ErrorCode::SaReturnNoCloseParen, keyword);
            };
            exp = Some(Box::new(e));
            p = p4;
        }
        self.best = saved;
        Some((p, ReturnNode { line, keyword, exp }))
    }

    fn clause_block(&mut self, p: usize, kw: Atom, illegal: ErrorCode) -> P<(Vec<Sentence>, Atom)> {
        let Some((mut p, open)) = self.atom(p, AtomKind::OpenBrace) else {
            return self.fail(ErrorCode::SaIfNoOpenBrace, kw);
        };
        let mut block = Vec::new();
        while !matches!(self.a(p).kind, AtomKind::None | AtomKind::CloseBrace) {
            let Some((p2, sen)) = self.sentence(p) else {
                return self.fail(illegal, kw);
            };
            block.push(sen);
            p = p2;
        }
        let Some((p, _)) = self.atom(p, AtomKind::CloseBrace) else {
            return self.fail(ErrorCode::SaIfNoCloseBrace, open);
        };
        Some((p, (block, open)))
    }

    fn if_(&mut self, mut p: usize) -> P<IfNode> {
        let saved = self.best;
        let line = self.a(p).line;
        let mut subs: Vec<IfSub> = Vec::new();
        loop {
            let first = subs.is_empty();
            let (kw, need_cond, last) = if first {
                let Some((p2, kw)) = self.atom(p, AtomKind::If) else {
                    return None;
                };
                p = p2;
                (kw, true, false)
            } else if let Some((p2, kw)) = self.atom(p, AtomKind::ElseIf) {
                p = p2;
                (kw, true, false)
            } else if let Some((p2, kw)) = self.atom(p, AtomKind::Else) {
                p = p2;
                (kw, false, true)
            } else {
                break;
            };
            let mut cond = None;
            if need_cond {
                let Some((p2, _)) = self.atom(p, AtomKind::OpenParen) else {
                    return self.fail(ErrorCode::SaIfNoOpenParen, kw);
                };
                let Some((p3, c)) = self.exp(p2, 0) else {
                    return self.fail(ErrorCode::SaIfIllegalCond, kw);
                };
                let Some((p4, _)) = self.atom(p3, AtomKind::CloseParen) else {
                    return self.fail(ErrorCode::SaIfNoCloseParen, kw);
                };
                cond = Some(c);
                p = p4;
            }
            let (p2, (block, _)) = self.clause_block(p, kw, ErrorCode::SaIfIllegalBlock)?;
            p = p2;
            subs.push(IfSub { keyword: kw, cond, block });
            if last {
                break;
            }
        }
        if subs.is_empty() {
            return None;
        }
        self.best = saved;
        Some((p, IfNode { line, subs }))
    }

    fn for_(&mut self, p: usize) -> P<ForNode> {
        let saved = self.best;
        let line = self.a(p).line;
        let (mut p, kw) = self.atom(p, AtomKind::For)?;
        let Some((p2, _)) = self.atom(p, AtomKind::OpenParen) else {
            return self.fail(ErrorCode::SaForNoOpenParen, kw);
        };
        p = p2;
        let mut init = Vec::new();
        while !matches!(self.a(p).kind, AtomKind::None | AtomKind::Comma) {
            let Some((p2, sen)) = self.sentence(p) else {
                return self.fail(ErrorCode::SaForIllegalInit, kw);
            };
            init.push(sen);
            p = p2;
        }
        let Some((p2, _)) = self.atom(p, AtomKind::Comma) else {
            return self.fail(ErrorCode::SaForNoInitComma, kw);
        };
        let Some((p3, cond)) = self.exp(p2, 0) else {
            return self.fail(ErrorCode::SaForIllegalCond, kw);
        };
        let Some((p4, _)) = self.atom(p3, AtomKind::Comma) else {
            return self.fail(ErrorCode::SaForNoCondComma, kw);
        };
        p = p4;
        let mut step = Vec::new();
        while !matches!(self.a(p).kind, AtomKind::None | AtomKind::CloseParen) {
            let Some((p2, sen)) = self.sentence(p) else {
                return self.fail(ErrorCode::SaForIllegalLoop, kw);
            };
            step.push(sen);
            p = p2;
        }
        let Some((p2, _)) = self.atom(p, AtomKind::CloseParen) else {
            return self.fail(ErrorCode::SaForNoCloseParen, kw);
        };
        let Some((p3, _open)) = self.atom(p2, AtomKind::OpenBrace) else {
            return self.fail(ErrorCode::SaForNoOpenBrace, kw);
        };
        p = p3;
        let mut block = Vec::new();
        while !matches!(self.a(p).kind, AtomKind::None | AtomKind::CloseBrace) {
            let Some((p2, sen)) = self.sentence(p) else {
                return self.fail(ErrorCode::SaForIllegalBlock, kw);
            };
            block.push(sen);
            p = p2;
        }
        let Some((p2, _)) = self.atom(p, AtomKind::CloseBrace) else {
            return self.fail(ErrorCode::SaForNoCloseBrace, kw);
        };
        self.best = saved;
        Some((
            p2,
            ForNode {
                line,
                keyword: kw,
                init,
                cond,
                step,
                block,
            },
        ))
    }

    fn while_(&mut self, p: usize) -> P<WhileNode> {
        let saved = self.best;
        let line = self.a(p).line;
        let (p, kw) = self.atom(p, AtomKind::While)?;
        let Some((p2, _)) = self.atom(p, AtomKind::OpenParen) else {
            return self.fail(ErrorCode::SaWhileNoOpenParen, kw);
        };
        let Some((p3, cond)) = self.exp(p2, 0) else {
            return self.fail(ErrorCode::SaWhileIllegalCond, kw);
        };
        let Some((p4, _)) = self.atom(p3, AtomKind::CloseParen) else {
            return self.fail(ErrorCode::SaWhileNoCloseParen, kw);
        };
        let Some((mut p5, open)) = self.atom(p4, AtomKind::OpenBrace) else {
            return self.fail(ErrorCode::SaWhileNoOpenBrace, kw);
        };
        let mut block = Vec::new();
        while !matches!(self.a(p5).kind, AtomKind::None | AtomKind::CloseBrace) {
            let Some((p6, sen)) = self.sentence(p5) else {
                return self.fail(ErrorCode::SaWhileIllegalBlock, kw);
            };
            block.push(sen);
            p5 = p6;
        }
        let Some((p6, _)) = self.atom(p5, AtomKind::CloseBrace) else {
            return self.fail(ErrorCode::SaWhileNoCloseBrace, open);
        };
        self.best = saved;
        Some((
            p6,
            WhileNode {
                line,
                keyword: kw,
                cond,
                block,
            },
        ))
    }

    fn switch(&mut self, p: usize) -> P<SwitchNode> {
        let saved = self.best;
        let line = self.a(p).line;
        let (p, kw) = self.atom(p, AtomKind::Switch)?;
        let Some((p2, _)) = self.atom(p, AtomKind::OpenParen) else {
            return self.fail(ErrorCode::SaSwitchNoOpenParen, kw);
        };
        let Some((p3, cond)) = self.exp(p2, 0) else {
            return self.fail(ErrorCode::SaSwitchIllegalCond, kw);
        };
        let Some((p4, _)) = self.atom(p3, AtomKind::CloseParen) else {
            return self.fail(ErrorCode::SaSwitchNoCloseParen, kw);
        };
        let Some((mut p5, open)) = self.atom(p4, AtomKind::OpenBrace) else {
            return self.fail(ErrorCode::SaSwitchNoOpenBrace, kw);
        };
        let mut cases = Vec::new();
        let mut default = None;
        while !matches!(self.a(p5).kind, AtomKind::None | AtomKind::CloseBrace) {
            if let Some((p6, case)) = self.case(p5) {
                cases.push(case);
                p5 = p6;
                continue;
            }
            if let Some((p6, block)) = self.default(p5) {
                if default.is_some() {
                    let a = self.a(p5);
                    return self.fail(ErrorCode::SaDefaultRedefine, a);
                }
                default = Some(block);
                p5 = p6;
                continue;
            }
            return self.fail(ErrorCode::SaSwitchIllegalCase, kw);
        }
        let Some((p6, _)) = self.atom(p5, AtomKind::CloseBrace) else {
            return self.fail(ErrorCode::SaSwitchNoCloseBrace, open);
        };
        self.best = saved;
        Some((
            p6,
            SwitchNode {
                line,
                keyword: kw,
                cond,
                cases,
                default,
            },
        ))
    }

    fn case(&mut self, p: usize) -> P<CaseNode> {
        let saved = self.best;
        let (p, kw) = self.atom(p, AtomKind::Case)?;
        let Some((p2, _)) = self.atom(p, AtomKind::OpenParen) else {
            return self.fail(ErrorCode::SaCaseNoOpenParen, kw);
        };
        let Some((p3, value)) = self.exp(p2, 0) else {
            return self.fail(ErrorCode::SaCaseIllegalValue, kw);
        };
        let Some((mut p4, _)) = self.atom(p3, AtomKind::CloseParen) else {
            return self.fail(ErrorCode::SaCaseNoCloseParen, kw);
        };
        let mut block = Vec::new();
        while !matches!(
            self.a(p4).kind,
            AtomKind::None | AtomKind::Case | AtomKind::Default | AtomKind::CloseBrace
        ) {
            let (p5, sen) = self.sentence(p4)?;
            block.push(sen);
            p4 = p5;
        }
        self.best = saved;
        Some((
            p4,
            CaseNode {
                keyword: kw,
                value,
                block,
            },
        ))
    }

    fn default(&mut self, p: usize) -> P<Vec<Sentence>> {
        let saved = self.best;
        let (mut p, _kw) = self.atom(p, AtomKind::Default)?;
        let mut block = Vec::new();
        while !matches!(
            self.a(p).kind,
            AtomKind::None | AtomKind::Case | AtomKind::Default | AtomKind::CloseBrace
        ) {
            let (p2, sen) = self.sentence(p)?;
            block.push(sen);
            p = p2;
        }
        self.best = saved;
        Some((p, block))
    }

    fn command_or_assign(&mut self, p: usize) -> P<CommandOrAssign> {
        let saved = self.best;
        let line = self.a(p).line;
        let (p, elm) = self.elm_exp(p)?;
        if let Some((p2, (equal, op))) = self.assign_operator(p) {
            let Some((p3, right)) = self.exp(p2, 0) else {
                let a = self.a(p2);
                return self.fail(ErrorCode::SaAssignIllegalRight, a);
            };
            self.best = saved;
            return Some((
                p3,
                CommandOrAssign::Assign(AssignNode {
                    line,
                    left: elm,
                    equal,
                    op,
                    right,
                    equal_form: Form::Void,
                    set_flag: false,
                    al_id: 0,
                }),
            ));
        }
        self.best = saved;
        Some((p, CommandOrAssign::Command(elm)))
    }

    fn exp_list(&mut self, p: usize) -> P<ExpList> {
        let saved = self.best;
        let (p, _open) = self.atom(p, AtomKind::OpenBracket)?;
        let Some((mut p, first)) = self.exp(p, 0) else {
            let a = self.a(p);
            return self.fail(ErrorCode::SaExpIllegal, a);
        };
        let mut exps = vec![first];
        loop {
            if let Some((p2, _)) = self.atom(p, AtomKind::CloseBracket) {
                p = p2;
                break;
            }
            let Some((p2, _)) = self.atom(p, AtomKind::Comma) else {
                let a = self.a(p);
                return self.fail(ErrorCode::SaExpListNoCloseBracket, a);
            };
            let Some((p3, e)) = self.exp(p2, 0) else {
                let a = self.a(p2);
                return self.fail(ErrorCode::SaExpIllegal, a);
            };
            exps.push(e);
            p = p3;
        }
        self.best = saved;
        Some((
            p,
            ExpList {
                exps,
                forms: Vec::new(),
            },
        ))
    }

    fn exp(&mut self, p: usize, pri: u32) -> P<Exp> {
        let saved = self.best;
        let line = self.a(p).line;
        let mut p = p;
        let mut exp;
        if let Some((p2, (opr, op))) = self.operator_1(p) {
            let Some((p3, inner)) = self.exp(p2, PRI_MAX) else {
                let a = self.a(p2);
                return self.fail(ErrorCode::SaExpIllegal, a);
            };
            exp = Exp {
                line,
                node_form: Form::Void,
                tmp_form: Form::Void,
                body: ExpBody::Unary {
                    opr,
                    op,
                    exp: Box::new(inner),
                },
            };
            p = p3;
        } else {
            let (p2, smp) = self.smp_exp(p)?;
            exp = Exp {
                line,
                node_form: Form::Void,
                tmp_form: Form::Void,
                body: ExpBody::Simple(smp),
            };
            p = p2;
        }
        while let Some((p2, (opr, op, npri))) = self.operator_2(p, pri) {
            let Some((p3, rhs)) = self.exp(p2, npri) else {
                let a = self.a(p2);
                return self.fail(ErrorCode::SaExpIllegal, a);
            };
            exp = Exp {
                line,
                node_form: Form::Void,
                tmp_form: Form::Void,
                body: ExpBody::Binary {
                    opr,
                    op,
                    lhs: Box::new(exp),
                    rhs: Box::new(rhs),
                },
            };
            p = p3;
        }
        self.best = saved;
        Some((p, exp))
    }

    fn smp_exp(&mut self, p: usize) -> P<SmpExp> {
        let saved = self.best;
        if let Some((p2, open)) = self.atom(p, AtomKind::OpenParen) {
            let Some((p3, e)) = self.exp(p2, 0) else {
                let a = self.a(p2);
                return self.fail(ErrorCode::SaExpIllegal, a);
            };
            let Some((p4, _)) = self.atom(p3, AtomKind::CloseParen) else {
                return self.fail(ErrorCode::SaSmpExpNoCloseParen, open);
            };
            self.best = saved;
            return Some((
                p4,
                SmpExp {
                    node_form: Form::Void,
                    body: SmpBody::Paren(Box::new(e)),
                },
            ));
        }
        if let Some((p2, l)) = self.exp_list(p) {
            self.best = saved;
            return Some((
                p2,
                SmpExp {
                    node_form: Form::Void,
                    body: SmpBody::ExpList(l),
                },
            ));
        }
        if let Some((p2, g)) = self.goto(p) {
            self.best = saved;
            return Some((
                p2,
                SmpExp {
                    node_form: Form::Void,
                    body: SmpBody::Goto(g),
                },
            ));
        }
        if let Some((p2, lit)) = self.literal(p) {
            self.best = saved;
            return Some((
                p2,
                SmpExp {
                    node_form: Form::Void,
                    body: SmpBody::Literal(lit),
                },
            ));
        }
        if let Some((p2, e)) = self.elm_exp(p) {
            self.best = saved;
            return Some((
                p2,
                SmpExp {
                    node_form: Form::Void,
                    body: SmpBody::ElmExp(e),
                },
            ));
        }
        None
    }

    fn elm_exp(&mut self, p: usize) -> P<ElmExp> {
        let saved = self.best;
        let line = self.a(p).line;
        let (p, elm_list) = self.elm_list(p)?;
        self.best = saved;
        Some((
            p,
            ElmExp {
                line,
                elm_list,
                element_kind: None,
                node_form: Form::Void,
            },
        ))
    }

    fn elm_list(&mut self, p: usize) -> P<ElmList> {
        let saved = self.best;
        let line = self.a(p).line;
        let (mut p, first) = self.element(p, true)?;
        let mut elements = vec![first];
        while matches!(self.a(p).kind, AtomKind::OpenBracket | AtomKind::Dot) {
            let (p2, el) = self.element(p, false)?;
            elements.push(el);
            p = p2;
        }
        self.best = saved;
        Some((
            p,
            ElmList {
                line,
                parent_scope: Form::Global,
                elements,
                element_kind: None,
                node_form: Form::Void,
            },
        ))
    }

    fn element(&mut self, p: usize, top: bool) -> P<ElementNode> {
        let saved = self.best;
        let line = self.a(p).line;
        if !top {
            if let Some((p2, open)) = self.atom(p, AtomKind::OpenBracket) {
                let Some((p3, e)) = self.exp(p2, 0) else {
                    let a = self.a(p2);
                    return self.fail(ErrorCode::SaElementIllegalExp, a);
                };
                let Some((p4, _)) = self.atom(p3, AtomKind::CloseBracket) else {
                    let a = self.a(p3);
                    return self.fail(ErrorCode::SaElementNoClose, a);
                };
                self.best = saved;
                return Some((
                    p4,
                    ElementNode {
                        line,
                        body: ElementBody::Array {
                            open_bracket: open,
                            index: Box::new(e),
                        },
                        node_form: Form::Void,
                        element_code: 0,
                        element_kind: None,
                        element_parent_form: Form::Void,
                        arg_list_id: 0,
                    },
                ));
            }
            if let Some((p2, _dot)) = self.atom(p, AtomKind::Dot) {
                let Some(r) = self.element(p2, true) else {
                    let a = self.a(p2);
                    return self.fail(ErrorCode::SaElementNoChild, a);
                };
                self.best = saved;
                return Some(r);
            }
        }
        let (p2, name) = self.atom(p, AtomKind::Unknown)?;
        let (p3, args) = self.arg_list(p2)?;
        self.best = saved;
        Some((
            p3,
            ElementNode {
                line,
                body: ElementBody::Named { name, args },
                node_form: Form::Void,
                element_code: 0,
                element_kind: None,
                element_parent_form: Form::Void,
                arg_list_id: 0,
            },
        ))
    }

    fn arg_list(&mut self, p: usize) -> P<ArgList> {
        let saved = self.best;
        let Some((mut p, _open)) = self.atom(p, AtomKind::OpenParen) else {
            self.best = saved;
            return Some((p, ArgList::default()));
        };
        let mut args = Vec::new();
        if let Some((p2, _)) = self.atom(p, AtomKind::CloseParen) {
            self.best = saved;
            return Some((
                p2,
                ArgList {
                    args,
                    named_cnt: 0,
                    has_parens: true,
                },
            ));
        }
        loop {
            let Some((p2, a)) = self.arg(p) else {
                let at = self.a(p);
                return self.fail(ErrorCode::SaExpIllegal, at);
            };
            args.push(a);
            p = p2;
            if let Some((p2, _)) = self.atom(p, AtomKind::CloseParen) {
                p = p2;
                break;
            }
            let Some((p2, _)) = self.atom(p, AtomKind::Comma) else {
                let at = self.a(p);
                return self.fail(ErrorCode::SaArgListNoCloseParen, at);
            };
            p = p2;
        }
        // Positional first, named arguments moved to the back in order.
        let (named, positional): (Vec<ArgNode>, Vec<ArgNode>) = args.into_iter().partition(|a| a.name.is_some());
        let named_cnt = named.len();
        let mut args = positional;
        args.extend(named);
        self.best = saved;
        Some((
            p,
            ArgList {
                args,
                named_cnt,
                has_parens: true,
            },
        ))
    }

    fn arg(&mut self, p: usize) -> P<ArgNode> {
        let saved = self.best;
        if let Some((p2, a)) = self.named_arg(p) {
            self.best = saved;
            return Some((p2, a));
        }
        let Some((p2, e)) = self.exp(p, 0) else {
            let a = self.a(p);
            return self.fail(ErrorCode::SaExpIllegal, a);
        };
        self.best = saved;
        Some((
            p2,
            ArgNode {
                name: None,
                exp: e,
                name_id: 0,
            },
        ))
    }

    fn named_arg(&mut self, p: usize) -> P<ArgNode> {
        let saved = self.best;
        let (p2, name) = self.atom(p, AtomKind::Unknown)?;
        let (p3, _) = self.atom(p2, AtomKind::Assign)?;
        let Some((p4, e)) = self.exp(p3, 0) else {
            let a = self.a(p3);
            return self.fail(ErrorCode::SaExpIllegal, a);
        };
        self.best = saved;
        Some((
            p4,
            ArgNode {
                name: Some(name),
                exp: e,
                name_id: 0,
            },
        ))
    }

    fn name(&mut self, p: usize) -> P<NameNode> {
        let saved = self.best;
        let line = self.a(p).line;
        let (p, _open) = self.atom(p, AtomKind::OpenSumi)?;
        let Some((p2, name)) = self.atom(p, AtomKind::ValStr) else {
            let a = self.a(p);
            return self.fail(ErrorCode::SaNameIllegalName, a);
        };
        let Some((p3, _)) = self.atom(p2, AtomKind::CloseSumi) else {
            let a = self.a(p2);
            return self.fail(ErrorCode::SaNameNoCloseSumi, a);
        };
        self.best = saved;
        Some((p3, NameNode { line, name }))
    }

    fn literal(&mut self, p: usize) -> P<Literal> {
        for kind in [AtomKind::ValInt, AtomKind::ValStr, AtomKind::Label] {
            if let Some((p2, atom)) = self.atom(p, kind) {
                return Some((
                    p2,
                    Literal {
                        atom,
                        node_form: Form::Void,
                    },
                ));
            }
        }
        None
    }

    fn operator_1(&mut self, p: usize) -> P<(Atom, OpCode)> {
        for (kind, op) in [
            (AtomKind::Plus, OpCode::Plus),
            (AtomKind::Minus, OpCode::Minus),
            (AtomKind::Tilde, OpCode::Tilde),
        ] {
            if let Some((p2, a)) = self.atom(p, kind) {
                return Some((p2, (a, op)));
            }
        }
        None
    }

    /// The 10-level binary precedence ladder. Returns the operator and the
    /// priority its right operand parses at.
    fn operator_2(&mut self, p: usize, last: u32) -> P<(Atom, OpCode, u32)> {
        use AtomKind::*;
        let ladder: [(&[(AtomKind, OpCode)], u32); 10] = [
            (&[(LogicalOr, OpCode::LogicalOr)], 1),
            (&[(LogicalAnd, OpCode::LogicalAnd)], 2),
            (&[(Or, OpCode::Or)], 3),
            (&[(Hat, OpCode::Hat)], 4),
            (&[(And, OpCode::And)], 5),
            (&[(Equal, OpCode::Equal), (NotEqual, OpCode::NotEqual)], 6),
            (
                &[
                    (Greater, OpCode::Greater),
                    (GreaterEqual, OpCode::GreaterEqual),
                    (Less, OpCode::Less),
                    (LessEqual, OpCode::LessEqual),
                ],
                7,
            ),
            (&[(Sl, OpCode::Sl), (Sr, OpCode::Sr), (Sr3, OpCode::Sr3)], 8),
            (&[(Plus, OpCode::Plus), (Minus, OpCode::Minus)], 9),
            (
                &[
                    (Multiple, OpCode::Multiple),
                    (Divide, OpCode::Divide),
                    (Percent, OpCode::Amari),
                ],
                10,
            ),
        ];
        for (level, (ops, npri)) in ladder.iter().enumerate() {
            if last <= level as u32 {
                for (kind, op) in *ops {
                    if let Some((p2, a)) = self.atom(p, *kind) {
                        return Some((p2, (a, *op, *npri)));
                    }
                }
            }
        }
        Option::None
    }

    fn assign_operator(&mut self, p: usize) -> P<(Atom, OpCode)> {
        use AtomKind::*;
        for (kind, op) in [
            (Assign, OpCode::None),
            (PlusAssign, OpCode::Plus),
            (MinusAssign, OpCode::Minus),
            (MultipleAssign, OpCode::Multiple),
            (DivideAssign, OpCode::Divide),
            (PercentAssign, OpCode::Amari),
            (AndAssign, OpCode::And),
            (OrAssign, OpCode::Or),
            (HatAssign, OpCode::Hat),
            (SlAssign, OpCode::Sl),
            (SrAssign, OpCode::Sr),
            (Sr3Assign, OpCode::Sr3),
        ] {
            if let Some((p2, a)) = self.atom(p, kind) {
                return Some((p2, (a, op)));
            }
        }
        Option::None
    }
}

enum CommandOrAssign {
    Command(ElmExp),
    Assign(AssignNode),
}

/// Parses one scene's atoms into the scene tree.
pub fn analyze(inc: &mut IncData, lex: &LexOutput) -> Result<Ss, StageError> {
    Sa::new(inc, lex).analyze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ca, la};

    fn parse(text: &str) -> Result<(Ss, IncData, LexOutput), StageError> {
        let mut inc = IncData::new();
        let expanded = ca::analyze_file(text, &mut inc)?;
        let lex = la::analyze(&expanded)?;
        let ss = analyze(&mut inc, &lex)?;
        Ok((ss, inc, lex))
    }

    #[test]
    fn minimal_scene_parses() {
        let (ss, _, _) = parse("*z0\n\"hi\"\n").unwrap();
        assert_eq!(ss.sentences.len(), 3);
        assert!(matches!(ss.sentences[0].body, SentenceBody::ZLabel(_)));
        assert!(matches!(ss.sentences[1].body, SentenceBody::Text(_)));
        assert!(matches!(ss.sentences[2].body, SentenceBody::Eof(_)));
    }

    #[test]
    fn missing_z0_is_an_error() {
        let err = parse("*start\n\"hi\"\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::SaZLabel00NotExist);
    }

    #[test]
    fn undefined_label_reference_is_an_error() {
        let err = parse("*z0\ngoto *nowhere\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::SaLabelNotExist);
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let err = parse("*z0\n*a\n*a\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::SaLabelOverlapped);
        let err = parse("*z0\n*z0\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::SaZLabelOverlapped);
    }

    fn parse_with_inc(inc_text: &str, scene: &str) -> Result<(Ss, IncData, LexOutput), StageError> {
        let mut inc = IncData::new();
        let mut ia = crate::ia::IncAnalyzer::new(inc_text, Form::Global, &mut inc);
        let pending = ia.step1()?;
        ia.step2(pending)?;
        let expanded = ca::analyze_file(scene, &mut inc)?;
        let lex = la::analyze(&expanded)?;
        let ss = analyze(&mut inc, &lex)?;
        Ok((ss, inc, lex))
    }

    #[test]
    fn command_definition_registers_and_checks_signature() {
        let inc_text = "#command add2(int, int): int\n";
        let good = "*z0\ncommand add2(property a: int, property b: int): int { return(1) }\n";
        let (_, inc, _) = parse_with_inc(inc_text, good).unwrap();
        let cmd = inc.find_command("add2").unwrap();
        assert_eq!(cmd.args.len(), 2);

        let bad = "*z0\ncommand add2(property a: str, property b: int): int { return(1) }\n";
        assert_eq!(
            parse_with_inc(inc_text, bad).unwrap_err().code,
            ErrorCode::SaDefCmdArgTypeNoMatch
        );
    }

    #[test]
    fn scene_local_command_without_body_is_an_error() {
        // A scene-local #command declaration must be defined in the scene.
        let err = parse("#command ghost(int)\n*z0\n\"x\"\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::SaDefCmdNotExist);
    }

    #[test]
    fn expression_precedence_builds_left_spine() {
        let (ss, _, _) = parse("*z0\nf[0] = 1 + 2 * 3\n").unwrap();
        let SentenceBody::Assign(assign) = &ss.sentences[1].body else {
            panic!("expected assign");
        };
        let ExpBody::Binary { op, rhs, .. } = &assign.right.body else {
            panic!("expected binary");
        };
        assert_eq!(*op, OpCode::Plus);
        let ExpBody::Binary { op: inner, .. } = &rhs.body else {
            panic!("expected nested mul");
        };
        assert_eq!(*inner, OpCode::Multiple);
    }

    #[test]
    fn control_flow_parses() {
        let src = "*z0\n\
                   if (1) { \"a\" } elseif (2) { \"b\" } else { \"c\" }\n\
                   while (1) { break continue }\n\
                   for (f[0] = 0, f[0] < 3, f[0] += 1) { \"t\" }\n\
                   switch (f[0]) { case (1) \"one\" case (2) \"two\" default \"other\" }\n";
        let (ss, _, _) = parse(src).unwrap();
        assert!(matches!(ss.sentences[1].body, SentenceBody::If(ref n) if n.subs.len() == 3));
        assert!(matches!(ss.sentences[2].body, SentenceBody::While(_)));
        assert!(matches!(ss.sentences[3].body, SentenceBody::For(_)));
        assert!(
            matches!(ss.sentences[4].body, SentenceBody::Switch(ref n) if n.cases.len() == 2 && n.default.is_some())
        );
    }

    #[test]
    fn named_args_move_to_the_back() {
        let (ss, _, lex) = parse("*z0\nsel([\"a\", \"b\"], timeout=30)\n").unwrap();
        let SentenceBody::Command(cmd) = &ss.sentences[1].body else {
            panic!("expected command");
        };
        let ElementBody::Named { args, .. } = &cmd.elm_list.elements[0].body else {
            panic!("expected named element");
        };
        assert_eq!(args.named_cnt, 1);
        let last = args.args.last().unwrap();
        let name = last.name.as_ref().unwrap();
        assert_eq!(lex.unknown_name(name.opt), "timeout");
    }

    #[test]
    fn speaker_name_statement() {
        let (ss, _, _) = parse("*z0\n\u{3010}\"alice\"\u{3011}\n\"hi\"\n").unwrap();
        assert!(matches!(ss.sentences[1].body, SentenceBody::Name(_)));
    }

    #[test]
    fn gosub_with_args_as_expression() {
        let (ss, _, _) = parse("*z0\n*sub\nf[0] = gosub(1, 2) *sub\n").unwrap();
        let SentenceBody::Assign(assign) = &ss.sentences[2].body else {
            panic!("expected assign");
        };
        let ExpBody::Simple(smp) = &assign.right.body else {
            panic!("expected simple");
        };
        assert!(matches!(smp.body, SmpBody::Goto(ref g) if g.kind == GotoKind::Gosub));
    }
}
