//! Observed-execution control-flow graph engine for x86 binaries.
//!
//! cloud-chamber drives a traced child process one machine instruction at a
//! time and grows a control-flow graph out of the transfers the CPU actually
//! took, instead of guessing edges statically. The library is split along the
//! same seams as the tool: the tracer feeds `(ip, opcode bytes)` pairs, the
//! decoder turns them into text, and [`cfg::CfgBuilder::observe`] does the
//! graph work.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use cloud_chamber::{
//!     cfg::CfgBuilder,
//!     decoder::{CapstoneDecoder, Syntax},
//!     parser::inspect_executable,
//!     tracer,
//! };
//!
//! let target = inspect_executable("path/to/binary".as_ref()).unwrap();
//! let decoder = CapstoneDecoder::for_architecture(target.architecture, Syntax::Att).unwrap();
//!
//! let mut builder = CfgBuilder::new();
//! builder.start_path();
//! let stats = tracer::run(
//!     &["path/to/binary".to_string()],
//!     &decoder,
//!     &mut builder,
//!     &mut std::io::sink(),
//! ).unwrap();
//!
//! let cfg = builder.finish();
//! println!("{} unique instructions over {} executed", cfg.entries(), stats.executed);
//! ```

pub mod blocks;
pub mod cfg;
pub mod decoder;
pub mod format;
pub mod index;
pub mod parser;
pub mod tracer;

use std::fmt;

/// Represents an address in the traced process
pub type Address = u64;

/// Size of the opcode window peeked at each step.
pub const MAX_OPCODE_BYTES: usize = 16;

/// Longest valid x86 instruction encoding.
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Coarse control-flow role of an instruction, derived from its opcode bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsnKind {
    /// Straight-line instruction, at most one successor
    Basic,
    /// Conditional jump, at most two successors
    Branch,
    /// Call, one successor plus fall-throughs wired by the callee's return
    Call,
    /// Unconditional or indirect jump, unbounded successors
    Jump,
    /// Return, successors resolved against the shadow call stack
    Ret,
}

impl InsnKind {
    /// Classify an opcode window.
    ///
    /// Only opcode prefixes are inspected, never operands; that is enough to
    /// shape the graph and stays cheap in the stepping loop. The window is
    /// zero-padded past `size`, so the multi-byte patterns below are safe to
    /// probe unconditionally. First match wins:
    ///
    /// * `Branch` — `70..7F` (short Jcc), `0F 80..8F` (near Jcc)
    /// * `Call`   — `E8`, `9A`, `FF /2` forms, `41 FF` REX-prefixed forms
    /// * `Jump`   — `E9..EB`, `FF /4` forms, `E0..E3` (loop/jcxz),
    ///   `41 FF E0..E7`, `F3`-prefixed 2-3 byte encodings that are not rep ret
    /// * `Ret`    — `C3`/`CB` (1 byte), `C2`/`CA` (3 bytes), `F3 C3`
    /// * `Basic`  — everything else
    ///
    /// The `FF`-opcode and REX-prefixed patterns fold the encoded size into
    /// the match rather than decoding the ModR/M byte.
    pub fn of(opcodes: &[u8; MAX_OPCODE_BYTES], size: u8) -> InsnKind {
        let size = size as usize;
        let op = opcodes;
        if matches!(op[0], 0x70..=0x7F) || (op[0] == 0x0F && matches!(op[1], 0x80..=0x8F)) {
            InsnKind::Branch
        } else if op[0] == 0xE8
            || op[0] == 0x9A
            || (op[0] == 0xFF
                && ((size == 2 && matches!(op[1], 0xD0..=0xDF)) || size == 3 || op[1] == 0x15))
            || (op[0] == 0x41 && op[1] == 0xFF && (matches!(op[2], 0xD0..=0xD7) || size > 3))
        {
            InsnKind::Call
        } else if matches!(op[0], 0xE9..=0xEB)
            || (op[0] == 0xFF
                && ((size == 2 && matches!(op[1], 0xE0..=0xEF))
                    || size == 4
                    || size == 5
                    || op[1] == 0x25))
            || matches!(op[0], 0xE0..=0xE3)
            || (op[0] == 0x41 && op[1] == 0xFF && matches!(op[2], 0xE0..=0xE7))
            || (op[0] == 0xF3 && (size == 2 || size == 3) && op[1] != 0xC3)
        {
            InsnKind::Jump
        } else if ((op[0] == 0xC3 || op[0] == 0xCB) && size == 1)
            || ((op[0] == 0xC2 || op[0] == 0xCA) && size == 3)
            || (op[0] == 0xF3 && op[1] == 0xC3 && size == 2)
        {
            InsnKind::Ret
        } else {
            InsnKind::Basic
        }
    }
}

impl fmt::Display for InsnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsnKind::Basic => write!(f, "basic"),
            InsnKind::Branch => write!(f, "branch"),
            InsnKind::Call => write!(f, "call"),
            InsnKind::Jump => write!(f, "jump"),
            InsnKind::Ret => write!(f, "ret"),
        }
    }
}

/// One observed instruction, immutable once built.
#[derive(Debug, Clone)]
pub struct Instruction {
    addr: Address,
    size: u8,
    /// Raw encoding, zero-padded past `size`.
    opcodes: [u8; MAX_OPCODE_BYTES],
    kind: InsnKind,
}

impl Instruction {
    /// Build and classify an instruction from the peeked opcode window.
    ///
    /// Fails on a zero or oversized `size`, or when `opcodes` is shorter than
    /// `size` — the "instruction construction failed" case the tracing loop
    /// reports upward.
    pub fn new(addr: Address, size: u8, opcodes: &[u8]) -> Result<Self, TraceError> {
        if size == 0 || size as usize > MAX_INSTRUCTION_SIZE || opcodes.len() < size as usize {
            return Err(TraceError::InvalidInstruction {
                addr,
                size: size as usize,
            });
        }
        let mut bytes = [0u8; MAX_OPCODE_BYTES];
        bytes[..size as usize].copy_from_slice(&opcodes[..size as usize]);
        let kind = InsnKind::of(&bytes, size);
        Ok(Instruction {
            addr,
            size,
            opcodes: bytes,
            kind,
        })
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// The instruction bytes, up to the actual encoded size.
    pub fn bytes(&self) -> &[u8] {
        &self.opcodes[..self.size as usize]
    }

    pub fn kind(&self) -> InsnKind {
        self.kind
    }

    /// Address of the instruction immediately following this one, i.e. the
    /// fall-through target of a call or conditional branch.
    pub fn next_addr(&self) -> Address {
        self.addr + self.size as Address
    }
}

/// Two observations at the same address carry the same instruction in a
/// non-self-modifying binary, so identity is the address alone.
impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Instruction {}

/// Supported target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
        }
    }
}

/// Error type for tracing and graph construction
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Instruction construction failed (zero size, oversized encoding)
    #[error("instruction construction failed at 0x{addr:x}: invalid size {size}")]
    InvalidInstruction { addr: Address, size: usize },

    /// A node exceeded the out-degree bound its classification promises.
    /// This is a classifier defect, not an input error, and aborts the run.
    #[error(
        "classifier contract violated: {kind} instruction at 0x{addr:x} exceeds its out-degree bound"
    )]
    ClassifierContract { addr: Address, kind: InsnKind },

    /// Failed to parse the target binary
    #[error("failed to parse target: {0}")]
    ParsingError(String),

    /// Target compiled for an architecture we cannot trace
    #[error("unsupported architecture: e_machine {machine:#x}")]
    UnsupportedArchitecture { machine: u16 },

    /// Capstone error
    #[error("capstone error: {0}")]
    Capstone(#[from] capstone::Error),

    /// Failure driving the traced child process
    #[error("trace error: {0}")]
    Trace(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
