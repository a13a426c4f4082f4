//! Architecture-specific handling of probe call sites. Everything the rest of
//! the pipeline needs from a machine type goes through the [`Arch`] trait;
//! adding an architecture means implementing it and adding an arm to
//! [`from_machine`].

use crate::error::Result;
use crate::x86_64::X86_64;
use anyhow::bail;

/// How a probe stub call site reaches the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallSite {
    /// An ordinary call; control returns to the following instruction.
    Call,
    /// A tail jump; the stub call was the function's final operation.
    TailCall,
}

pub(crate) trait Arch {
    /// Verifies the instruction bytes around a probe relocation and reports
    /// what kind of call site they form. `offset` is the relocation's
    /// `r_offset`, i.e. the position of the unresolved displacement.
    fn classify_call_site(&self, section: &[u8], offset: u64, symname: &str) -> Result<CallSite>;

    /// Overwrites the call site so the function behaves as if the probe call
    /// were absent. Must only be called with a [`CallSite`] previously
    /// returned by `classify_call_site` for the same bytes.
    fn patch_call_site(&self, section: &mut [u8], offset: u64, site: CallSite);

    /// The relocation type the final linker ignores.
    fn none_relocation_type(&self) -> u32;

    /// The pointer-width absolute relocation type, used to bind instance
    /// descriptors to their probes.
    fn pointer_relocation_type(&self) -> u32;
}

pub(crate) fn from_machine(machine: u16) -> Result<&'static dyn Arch> {
    match machine {
        object::elf::EM_X86_64 => Ok(&X86_64),
        _ => bail!("unhandled machine type {machine:#x}"),
    }
}
