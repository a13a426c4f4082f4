//! x86-64 probe call sites. The compiler emits `call rel32` (or `jmp rel32`
//! for a tail call) against the probe stub symbol, with the four displacement
//! bytes left zero for the linker. We replace the whole five-byte instruction
//! with NOPs so the kernel linker can later patch a live call back in.

use crate::arch::Arch;
use crate::arch::CallSite;
use crate::error::Result;
use anyhow::bail;
use anyhow::ensure;

pub(crate) struct X86_64;

const CALL: u8 = 0xe8;
const JMP32: u8 = 0xe9;
const NOP: u8 = 0x90;
const RETQ: u8 = 0xc3;

impl Arch for X86_64 {
    fn classify_call_site(&self, section: &[u8], offset: u64, symname: &str) -> Result<CallSite> {
        let offset = offset as usize;
        ensure!(
            offset >= 1 && offset.checked_add(4).is_some_and(|end| end <= section.len()),
            "relocation for {symname} at offset {offset:#x} is outside the text section"
        );

        let opc = section[offset - 1];
        let site = match opc {
            CALL => CallSite::Call,
            JMP32 => CallSite::TailCall,
            _ => bail!("unexpected opcode {opc:#x} for {symname} at offset {offset:#x}"),
        };
        if section[offset..offset + 4] != [0, 0, 0, 0] {
            bail!(
                "displacement for {symname} at offset {offset:#x} is already resolved; \
                 was this object already link-edited?"
            );
        }
        Ok(site)
    }

    fn patch_call_site(&self, section: &mut [u8], offset: u64, site: CallSite) {
        let offset = offset as usize;
        section[offset - 1..offset + 4].fill(NOP);
        // A tail call would have transferred control without returning, so
        // the patched function must return itself.
        if site == CallSite::TailCall {
            section[offset - 1] = RETQ;
        }
    }

    fn none_relocation_type(&self) -> u32 {
        object::elf::R_X86_64_NONE
    }

    fn pointer_relocation_type(&self) -> u32 {
        object::elf::R_X86_64_64
    }
}
