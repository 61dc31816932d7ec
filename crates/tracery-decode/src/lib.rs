//! Guest instruction decoding and trace formation.
//!
//! The decoder walks guest code recursively from an entry program counter,
//! partitioning everything statically reachable into single-entry /
//! multiple-exit traces. Machine-level decoding sits behind the [`GuestArch`]
//! trait; the crate ships an x86/x86-64 backend built on `iced-x86` and a
//! fixed-width AArch64 control-flow classifier.

mod aarch64;
mod trace;
mod x86;

pub use crate::aarch64::Aarch64Arch;
pub use crate::trace::{decode_traces, DecodedTrace, TraceId};
pub use crate::x86::X86Arch;

use tracery_mem::{AddressWidth, Pc};

/// Control-flow category of a decoded instruction.
///
/// Categories decide which successor PCs stay inside the current trace and
/// which start new traces; indirect edges are always resolved at run time by
/// the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Normal,
    NoOp,
    /// Decoded but known to fault (e.g. `ud2`); lowers to the error intrinsic.
    Error,
    /// Bytes did not decode to an instruction.
    Invalid,
    DirectJump,
    IndirectJump,
    ConditionalBranch,
    DirectCall,
    IndirectCall,
    Return,
    AsyncHypercall,
    ConditionalAsyncHypercall,
}

/// One decoded guest instruction with its successor PCs.
#[derive(Clone, Debug)]
pub struct DecodedInstruction {
    pub pc: Pc,
    /// The instruction's encoded bytes (everything read, for undecodable PCs).
    pub bytes: Vec<u8>,
    pub category: Category,
    /// PC immediately after this instruction.
    pub next_pc: Pc,
    /// Branch/call target, when statically known.
    pub branch_taken_pc: Option<Pc>,
    /// Fall-through PC for branches and the return site for calls.
    pub branch_not_taken_pc: Option<Pc>,
}

impl DecodedInstruction {
    /// An instruction record for bytes that failed to decode.
    pub fn invalid(pc: Pc, bytes: Vec<u8>) -> Self {
        Self {
            pc,
            bytes,
            category: Category::Invalid,
            next_pc: pc,
            branch_taken_pc: None,
            branch_not_taken_pc: None,
        }
    }

    pub fn is_decoded(&self) -> bool {
        self.category != Category::Invalid
    }
}

/// Architecture-level decode boundary.
///
/// Implementations turn raw bytes at a PC into a [`DecodedInstruction`];
/// decode failures are reported in-band as [`Category::Invalid`] records so
/// the trace decoder can still account for the PC.
pub trait GuestArch: Send + Sync {
    fn name(&self) -> &'static str;

    fn address_width(&self) -> AddressWidth;

    /// Upper bound on instruction length; the decoder reads at most this many
    /// executable bytes per PC.
    fn max_instruction_size(&self) -> usize;

    fn decode(&self, pc: Pc, bytes: &[u8]) -> DecodedInstruction;
}
