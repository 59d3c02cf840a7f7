#![doc = include_str!("../../../README.md")]

pub mod bs;
pub mod bytecode;
pub mod ca;
pub mod charset;
pub mod codec;
pub mod disasm;
pub mod elements;
pub mod error;
pub mod extract;
pub mod forms;
pub mod gei;
pub mod ia;
pub mod keys;
pub mod la;
pub mod linker;
pub mod ma;
pub mod msvc_rand;
pub mod pipeline;
pub mod sa;
pub mod trace;
pub mod tree;

pub use crate::{
    charset::Charset,
    error::{CompileError, CompileResult, ErrorCode},
    extract::{ExtractOptions, ExtractReport, extract_pck, restore_gameexe_ini},
    pipeline::{CompileReport, Project, compile},
    trace::{NoopTracer, StageTracer, StderrTracer},
};
