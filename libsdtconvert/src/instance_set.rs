//! Emission of the probe instance linker set. Each patched call site gets one
//! descriptor in `set_sdt_instance_set` and one relocation in its RELA
//! companion, binding the descriptor to the probe definition it belongs to.

use crate::arch::Arch;
use crate::elf::elf64_r_info;
use crate::elf::ElfObject;
use crate::elf::Rela;
use crate::elf::SectionIndex;
use crate::error::Result;
use crate::rewrite::PROBE_PREFIX;
use anyhow::bail;
use hashbrown::HashMap;
use object::LittleEndian;
use object::I64;
use object::U64;
use std::mem::size_of;

/// Linker set holding one probe definition per SDT probe.
const PROBE_SET: &str = "set_sdt_probes_set";
const INSTANCE_SET: &str = "set_sdt_instance_set";
const INSTANCE_SET_RELA: &str = ".relaset_sdt_instance_set";

/// Probe definitions are registered through relocations against symbols
/// carrying this prefix.
const SDT_PREFIX: &str = "sdt_";

/// Size of the emitted descriptor: a pointer-width probe reference (zero
/// until the final linker binds it) followed by the call site's offset. The
/// layout is an ABI contract with the kernel linker.
const DESCRIPTOR_SIZE: usize = 16;

/// One patched call site, recorded in scan order.
pub(crate) struct ProbeInstance {
    pub(crate) symname: String,
    pub(crate) offset: u64,
}

/// The probe-set relocation an instance resolves to.
struct ProbeRef {
    sym: u32,
    addend: i64,
}

struct ProbeRelocs {
    by_name: HashMap<String, ProbeRef>,
    symtab: SectionIndex,
}

pub(crate) fn record_instances(
    obj: &mut ElfObject,
    instances: &[ProbeInstance],
    arch: &dyn Arch,
) -> Result<()> {
    let e = LittleEndian;
    let probe_relocs = probe_relocations(obj)?;

    let inst_scn = obj.add_section(
        INSTANCE_SET,
        object::elf::SHT_PROGBITS,
        u64::from(object::elf::SHF_ALLOC),
    )?;
    let rela_scn = obj.add_section(INSTANCE_SET_RELA, object::elf::SHT_RELA, 0)?;
    {
        let shdr = obj.shdr_mut(rela_scn);
        shdr.sh_link.set(e, probe_relocs.symtab.0 as u32);
        shdr.sh_info.set(e, inst_scn.0 as u32);
        shdr.sh_entsize.set(e, size_of::<Rela>() as u64);
    }

    for instance in instances {
        let Some(probename) = instance.symname.strip_prefix(PROBE_PREFIX) else {
            bail!("malformed probe symbol name {}", instance.symname);
        };
        let Some(probe) = probe_relocs.by_name.get(probename) else {
            bail!(
                "failed to find SDT probe relocation for {}",
                instance.symname
            );
        };
        tracing::info!(
            "matched {} to probe {SDT_PREFIX}{probename}",
            instance.symname
        );

        let descriptor_offset = obj.shdr(inst_scn).sh_size.get(e);
        let mut descriptor = [0u8; DESCRIPTOR_SIZE];
        descriptor[8..].copy_from_slice(&instance.offset.to_le_bytes());
        obj.append_data(inst_scn, &descriptor);

        let rela = Rela {
            r_offset: U64::new(e, descriptor_offset),
            r_info: U64::new(e, elf64_r_info(probe.sym, arch.pointer_relocation_type())),
            r_addend: I64::new(e, probe.addend),
        };
        obj.append_data(rela_scn, object::bytes_of(&rela));
    }
    Ok(())
}

/// Builds the join from probe name to the relocation that registers its
/// definition in the probe linker set. One linear scan; instances then match
/// in constant time. The first relocation for a given probe wins.
fn probe_relocations(obj: &ElfObject) -> Result<ProbeRelocs> {
    let e = LittleEndian;
    let Some(probe_scn) = obj.section_by_name(PROBE_SET) else {
        bail!("couldn't find SDT probe linker set");
    };

    let rel_scn = (0..obj.section_count()).map(SectionIndex).find(|&scn| {
        let shdr = obj.shdr(scn);
        matches!(
            shdr.sh_type.get(e),
            object::elf::SHT_REL | object::elf::SHT_RELA
        ) && shdr.sh_info.get(e) as usize == probe_scn.0
    });
    let Some(rel_scn) = rel_scn else {
        bail!("couldn't find relocation section for SDT probe linker set");
    };

    let symtab = obj.section_index(obj.shdr(rel_scn).sh_link.get(e), "symbol table")?;
    let strtab = obj.section_index(obj.shdr(symtab).sh_link.get(e), "string table")?;

    let mut by_name = HashMap::new();
    for index in 0..obj.reloc_count(rel_scn)? {
        let entry = obj.reloc_entry(rel_scn, index)?;
        let sym = obj.symbol(symtab, entry.sym())?;
        let name = obj.string(strtab, sym.st_name.get(e))?;
        let Some(probename) = name.strip_prefix(SDT_PREFIX) else {
            continue;
        };
        by_name
            .entry(probename.to_owned())
            .or_insert(ProbeRef {
                sym: entry.sym(),
                addend: entry.addend,
            });
    }
    Ok(ProbeRelocs { by_name, symtab })
}
