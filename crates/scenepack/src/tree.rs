//! The typed scene tree produced by SA and annotated by MA.
//!
//! Nodes are tagged variants with explicit kind fields rather than trait
//! objects; MA fills in the `node_form` / element annotations in place and
//! BS consumes them read-only.

use smallvec::SmallVec;

use crate::{
    forms::{ElementKind, Form},
    la::Atom,
};

/// Operator codes as emitted into `CD_OPERATE_*` immediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum OpCode {
    None = 0,
    Plus = 1,
    Minus = 2,
    Multiple = 3,
    Divide = 4,
    Amari = 5,
    And = 6,
    Or = 7,
    Hat = 8,
    Sl = 9,
    Sr = 10,
    Sr3 = 11,
    Tilde = 12,
    LogicalAnd = 13,
    LogicalOr = 14,
    Equal = 15,
    NotEqual = 16,
    Greater = 17,
    GreaterEqual = 18,
    Less = 19,
    LessEqual = 20,
}

impl OpCode {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal | Self::NotEqual | Self::Greater | Self::GreaterEqual | Self::Less | Self::LessEqual
        )
    }
}

/// Root of one scene.
#[derive(Debug, Clone, Default)]
pub struct Ss {
    pub sentences: Vec<Sentence>,
}

#[derive(Debug, Clone)]
pub struct Sentence {
    pub line: u32,
    /// Set by MA when the statement contains a selection command; BS
    /// brackets it with `CD_SEL_BLOCK_START/END`.
    pub is_include_sel: bool,
    pub body: SentenceBody,
}

#[derive(Debug, Clone)]
pub enum SentenceBody {
    Label(Atom),
    ZLabel(Atom),
    DefProp(DefProp),
    DefCmd(DefCmd),
    Goto(GotoNode),
    Return(ReturnNode),
    If(IfNode),
    For(ForNode),
    While(WhileNode),
    Continue(Atom),
    Break(Atom),
    Switch(SwitchNode),
    Assign(AssignNode),
    Command(ElmExp),
    Text(Atom),
    Name(NameNode),
    Eof(Atom),
}

/// `property name[: form[size]]`, inside a command's parameter list or body.
#[derive(Debug, Clone)]
pub struct DefProp {
    pub line: u32,
    pub name: Atom,
    pub form_node: Option<FormNode>,
    pub form: Form,
    /// Slot assigned by MA (index into the scene's call-prop name list).
    pub prop_id: i32,
}

/// A form annotation `: form` or `: form[size_exp]`.
#[derive(Debug, Clone)]
pub struct FormNode {
    pub form: Form,
    pub open_bracket: Option<Atom>,
    pub index: Option<Box<Exp>>,
}

/// `command name(args...)[: form] { ... }`.
#[derive(Debug, Clone)]
pub struct DefCmd {
    pub line: u32,
    pub name: Atom,
    pub props: Vec<DefProp>,
    pub form: Form,
    pub block: Vec<Sentence>,
    pub cmd_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotoKind {
    Goto,
    Gosub,
    GosubStr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotoTargetKind {
    Label,
    ZLabel,
}

/// `goto *l`, `gosub(args) *l`, `gosubstr(args) *l`; also the expression
/// form of the latter two.
#[derive(Debug, Clone)]
pub struct GotoNode {
    pub line: u32,
    pub kind: GotoKind,
    pub keyword: Atom,
    pub args: Option<ArgList>,
    pub target_kind: GotoTargetKind,
    pub target: Atom,
    pub node_form: Form,
}

impl GotoNode {
    /// The backing label id branched to (z-labels resolve to their backing
    /// plain label).
    pub fn label_id(&self) -> i32 {
        match self.target_kind {
            GotoTargetKind::Label => self.target.opt,
            GotoTargetKind::ZLabel => self.target.subopt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReturnNode {
    pub line: u32,
    pub keyword: Atom,
    pub exp: Option<Box<Exp>>,
}

#[derive(Debug, Clone)]
pub struct IfNode {
    pub line: u32,
    pub subs: Vec<IfSub>,
}

/// One `if` / `elseif` / `else` clause; `cond` is `None` for `else`.
#[derive(Debug, Clone)]
pub struct IfSub {
    pub keyword: Atom,
    pub cond: Option<Exp>,
    pub block: Vec<Sentence>,
}

#[derive(Debug, Clone)]
pub struct ForNode {
    pub line: u32,
    pub keyword: Atom,
    pub init: Vec<Sentence>,
    pub cond: Exp,
    pub step: Vec<Sentence>,
    pub block: Vec<Sentence>,
}

#[derive(Debug, Clone)]
pub struct WhileNode {
    pub line: u32,
    pub keyword: Atom,
    pub cond: Exp,
    pub block: Vec<Sentence>,
}

#[derive(Debug, Clone)]
pub struct SwitchNode {
    pub line: u32,
    pub keyword: Atom,
    pub cond: Exp,
    pub cases: Vec<CaseNode>,
    pub default: Option<Vec<Sentence>>,
}

#[derive(Debug, Clone)]
pub struct CaseNode {
    pub keyword: Atom,
    pub value: Exp,
    pub block: Vec<Sentence>,
}

#[derive(Debug, Clone)]
pub struct AssignNode {
    pub line: u32,
    pub left: ElmExp,
    /// The assignment operator; `op` is [`OpCode::None`] for plain `=`.
    pub equal: Atom,
    pub op: OpCode,
    pub right: Exp,
    /// Result form of the compound operation (MA).
    pub equal_form: Form,
    /// True when the LHS is a non-scalar slot assigned by value (MA).
    pub set_flag: bool,
    pub al_id: i32,
}

#[derive(Debug, Clone)]
pub struct NameNode {
    pub line: u32,
    pub name: Atom,
}

#[derive(Debug, Clone)]
pub struct Exp {
    pub line: u32,
    pub node_form: Form,
    /// Overload selection may widen this (`intref -> int`) in place.
    pub tmp_form: Form,
    pub body: ExpBody,
}

#[derive(Debug, Clone)]
pub enum ExpBody {
    Simple(SmpExp),
    Unary {
        opr: Atom,
        op: OpCode,
        exp: Box<Exp>,
    },
    Binary {
        opr: Atom,
        op: OpCode,
        lhs: Box<Exp>,
        rhs: Box<Exp>,
    },
}

#[derive(Debug, Clone)]
pub struct SmpExp {
    pub node_form: Form,
    pub body: SmpBody,
}

#[derive(Debug, Clone)]
pub enum SmpBody {
    Paren(Box<Exp>),
    ExpList(ExpList),
    Goto(GotoNode),
    ElmExp(ElmExp),
    Literal(Literal),
}

/// `[e, e, ...]` — a list-form argument.
#[derive(Debug, Clone)]
pub struct ExpList {
    pub exps: Vec<Exp>,
    /// Element forms collected by MA, in order.
    pub forms: Vec<Form>,
}

#[derive(Debug, Clone)]
pub struct Literal {
    pub atom: Atom,
    pub node_form: Form,
}

/// An element chain with its resolution results.
#[derive(Debug, Clone)]
pub struct ElmExp {
    pub line: u32,
    pub elm_list: ElmList,
    pub element_kind: Option<ElementKind>,
    pub node_form: Form,
}

#[derive(Debug, Clone)]
pub struct ElmList {
    pub line: u32,
    /// Scope the first name resolved in (call / scene / global).
    pub parent_scope: Form,
    pub elements: Vec<ElementNode>,
    pub element_kind: Option<ElementKind>,
    pub node_form: Form,
}

#[derive(Debug, Clone)]
pub struct ElementNode {
    pub line: u32,
    pub body: ElementBody,
    pub node_form: Form,
    pub element_code: i32,
    pub element_kind: Option<ElementKind>,
    pub element_parent_form: Form,
    pub arg_list_id: i32,
}

#[derive(Debug, Clone)]
pub enum ElementBody {
    Named { name: Atom, args: ArgList },
    Array { open_bracket: Atom, index: Box<Exp> },
}

#[derive(Debug, Clone, Default)]
pub struct ArgList {
    pub args: Vec<ArgNode>,
    /// Count of trailing named arguments (SA moves them to the back).
    pub named_cnt: usize,
    pub has_parens: bool,
}

#[derive(Debug, Clone)]
pub struct ArgNode {
    pub name: Option<Atom>,
    pub exp: Exp,
    /// Slot id in the named-argument template, assigned by MA.
    pub name_id: i32,
}

/// Collects every atom below a node; SA/MA error reporting keys on the
/// smallest/largest atom id in a subtree.
pub trait AtomVisit {
    fn visit_atoms(&self, f: &mut dyn FnMut(&Atom));
}

pub fn first_atom<T: AtomVisit + ?Sized>(node: &T) -> Atom {
    let mut best: Option<Atom> = None;
    node.visit_atoms(&mut |a| {
        if best.is_none_or(|b| a.id < b.id) {
            best = Some(*a);
        }
    });
    best.unwrap_or_else(Atom::none)
}

pub fn last_atom<T: AtomVisit + ?Sized>(node: &T) -> Atom {
    let mut best: Option<Atom> = None;
    node.visit_atoms(&mut |a| {
        if best.is_none_or(|b| a.id > b.id) {
            best = Some(*a);
        }
    });
    best.unwrap_or_else(Atom::none)
}

impl AtomVisit for Exp {
    fn visit_atoms(&self, f: &mut dyn FnMut(&Atom)) {
        match &self.body {
            ExpBody::Simple(s) => s.visit_atoms(f),
            ExpBody::Unary { opr, exp, .. } => {
                f(opr);
                exp.visit_atoms(f);
            }
            ExpBody::Binary { opr, lhs, rhs, .. } => {
                f(opr);
                lhs.visit_atoms(f);
                rhs.visit_atoms(f);
            }
        }
    }
}

impl AtomVisit for SmpExp {
    fn visit_atoms(&self, f: &mut dyn FnMut(&Atom)) {
        match &self.body {
            SmpBody::Paren(e) => e.visit_atoms(f),
            SmpBody::ExpList(l) => {
                for e in &l.exps {
                    e.visit_atoms(f);
                }
            }
            SmpBody::Goto(g) => {
                f(&g.keyword);
                f(&g.target);
                if let Some(args) = &g.args {
                    args.visit_atoms(f);
                }
            }
            SmpBody::ElmExp(e) => e.visit_atoms(f),
            SmpBody::Literal(l) => f(&l.atom),
        }
    }
}

impl AtomVisit for ElmExp {
    fn visit_atoms(&self, f: &mut dyn FnMut(&Atom)) {
        for el in &self.elm_list.elements {
            match &el.body {
                ElementBody::Named { name, args } => {
                    f(name);
                    args.visit_atoms(f);
                }
                ElementBody::Array { open_bracket, index } => {
                    f(open_bracket);
                    index.visit_atoms(f);
                }
            }
        }
    }
}

impl AtomVisit for ArgList {
    fn visit_atoms(&self, f: &mut dyn FnMut(&Atom)) {
        for a in &self.args {
            if let Some(n) = &a.name {
                f(n);
            }
            a.exp.visit_atoms(f);
        }
    }
}

/// Loop label pair for `continue`/`break` lowering.
#[derive(Debug, Clone, Copy)]
pub struct LoopLabels {
    pub continue_label: usize,
    pub break_label: usize,
}

/// BS keeps a stack of these; small because loops rarely nest deep.
pub type LoopLabelStack = SmallVec<[LoopLabels; 8]>;
