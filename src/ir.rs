#![allow(dead_code)]

use crate::cfg::ControlFlowGraph;

/// Intermediate representation for a decoded JVM class.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    /// Fully qualified name in dotted form, e.g. `com.example.App`.
    pub(crate) name: String,
    pub(crate) source_file: Option<String>,
    pub(crate) methods: Vec<Method>,
}

/// Intermediate representation for a method and its bytecode.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: MethodAccess,
    /// False for abstract and native methods, which carry no Code attribute.
    pub(crate) has_body: bool,
    pub(crate) bytecode: Vec<u8>,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) cfg: ControlFlowGraph,
    pub(crate) line_numbers: Vec<LineNumber>,
    pub(crate) exception_handlers: Vec<ExceptionHandler>,
}

impl Method {
    /// Source line for a bytecode offset, from the LineNumberTable.
    /// Returns -1 when the table is absent or does not cover the offset.
    pub(crate) fn line_for_offset(&self, offset: u32) -> i32 {
        let mut line = -1;
        for entry in &self.line_numbers {
            if entry.start_pc > offset {
                break;
            }
            line = entry.line as i32;
        }
        line
    }
}

/// Method access flags used for scanning decisions.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MethodAccess {
    pub(crate) is_static: bool,
    pub(crate) is_abstract: bool,
}

/// LineNumberTable record mapping a bytecode offset to a source line.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u32,
    pub(crate) line: u32,
}

/// Exception handler metadata from the Code attribute.
#[derive(Clone, Debug)]
pub(crate) struct ExceptionHandler {
    pub(crate) start_pc: u32,
    pub(crate) end_pc: u32,
    pub(crate) handler_pc: u32,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) opcode: u8,
    pub(crate) kind: InstructionKind,
}

/// Instruction kinds the string tracker distinguishes. Everything else is
/// `Other` and is handled through its operand-stack effect alone.
#[derive(Clone, Debug)]
pub(crate) enum InstructionKind {
    Invoke(CallSite),
    ConstString(String),
    LoadLocal(u16),
    StoreLocal(u16),
    Other(u8),
}

/// Call site extracted from an invocation instruction.
#[derive(Clone, Debug)]
pub(crate) struct CallSite {
    /// Declaring type in dotted form.
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    pub(crate) offset: u32,
}

impl CallSite {
    pub(crate) fn has_receiver(&self) -> bool {
        !matches!(self.kind, CallKind::Static | CallKind::Dynamic)
    }
}

/// Invocation opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
    Dynamic,
}
