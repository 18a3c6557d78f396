//! Capstone-based instruction decoder for the stepping loop.

use std::fmt;

use capstone::arch::x86::{ArchMode as X86Mode, ArchSyntax as X86Syntax};
use capstone::prelude::{BuildsCapstone, BuildsCapstoneSyntax};
use capstone::Capstone;
use clap::ValueEnum;

use crate::{Address, Architecture, TraceError};

/// Disassembly syntax flavor. Affects display text only, never the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Syntax {
    /// AT&T syntax (default)
    Att,
    /// Intel syntax
    Intel,
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Syntax::Att => write!(f, "at&t"),
            Syntax::Intel => write!(f, "intel"),
        }
    }
}

/// One decoded instruction: encoded size plus its textual rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub size: u8,
    pub mnemonic: String,
    pub operands: String,
}

impl Decoded {
    /// Pre-formatted listing line: `"<hex addr>  <hex bytes>  <mnemonic>  <operands>"`.
    pub fn display_line(&self, addr: Address, bytes: &[u8]) -> String {
        let hex = bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("0x{addr:x}  {hex}  {}  {}", self.mnemonic, self.operands)
    }
}

/// Single-instruction decoder over the opcode window peeked at each step.
pub struct CapstoneDecoder {
    cs: Capstone,
    arch: Architecture,
}

impl CapstoneDecoder {
    /// Create a decoder for a traced architecture and syntax flavor.
    pub fn for_architecture(arch: Architecture, syntax: Syntax) -> Result<Self, TraceError> {
        let mode = match arch {
            Architecture::X86_32 => X86Mode::Mode32,
            Architecture::X86_64 => X86Mode::Mode64,
        };
        let flavor = match syntax {
            Syntax::Att => X86Syntax::Att,
            Syntax::Intel => X86Syntax::Intel,
        };
        let cs = Capstone::new()
            .x86()
            .mode(mode)
            .syntax(flavor)
            .detail(false)
            .build()?;
        Ok(CapstoneDecoder { cs, arch })
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Decode the single instruction at the start of `window`, reported at
    /// address `ip`. Returns `None` when the bytes do not form a valid
    /// instruction.
    pub fn decode(&self, window: &[u8], ip: Address) -> Option<Decoded> {
        let insns = self.cs.disasm_count(window, ip, 1).ok()?;
        let i = insns.iter().next()?;
        if i.address() != ip {
            return None;
        }
        Some(Decoded {
            size: i.bytes().len() as u8,
            mnemonic: i.mnemonic().unwrap_or("").to_string(),
            operands: i.op_str().unwrap_or("").to_string(),
        })
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.arch)
    }
}
