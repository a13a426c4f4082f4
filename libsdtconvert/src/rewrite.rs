//! The per-object pipeline: scan relocation sections for probe stub calls,
//! patch each call site, neutralize its relocation and record the instance.

use crate::arch;
use crate::arch::Arch;
use crate::arch::CallSite;
use crate::elf::ElfObject;
use crate::elf::RelocEntry;
use crate::elf::SectionIndex;
use crate::error::warning;
use crate::error::Context as _;
use crate::error::Result;
use crate::instance_set;
use crate::instance_set::ProbeInstance;
use anyhow::ensure;
use object::LittleEndian;
use std::path::Path;

/// Prefix of the symbols the compiler emits for probe stub call sites.
pub(crate) const PROBE_PREFIX: &str = "__dtrace_probe_";

/// Rewrites a single object in place. Files that aren't relocatable objects
/// are skipped with a warning; anything else that goes wrong is fatal, and
/// the file is only written once every call site has been processed.
pub(crate) fn process_object(path: &Path) -> Result<()> {
    let mut obj = ElfObject::open(path)?;
    if !obj.is_relocatable() {
        warning(&format!("invalid ELF type for '{}'", path.display()));
        return Ok(());
    }

    let mut instances = Vec::new();
    for index in 0..obj.section_count() {
        let scn = SectionIndex(index);
        let sh_type = obj.shdr(scn).sh_type.get(LittleEndian);
        if matches!(sh_type, object::elf::SHT_REL | object::elf::SHT_RELA) {
            process_reloc_scn(&mut obj, scn, &mut instances).with_context(|| {
                format!(
                    "{}: failed to process relocation section {index}",
                    path.display()
                )
            })?;
        }
    }

    if instances.is_empty() {
        tracing::info!("no probes found in {}", path.display());
        return Ok(());
    }

    // The scan only records instances once the machine type has been
    // dispatched, so this resolves the same architecture it used.
    let arch = arch::from_machine(obj.machine())?;
    instance_set::record_instances(&mut obj, &instances, arch)?;
    obj.flush()
}

/// Processes one REL or RELA section. Only relocations against `.text` are of
/// interest; other targets are skipped wholesale.
fn process_reloc_scn(
    obj: &mut ElfObject,
    scn: SectionIndex,
    instances: &mut Vec<ProbeInstance>,
) -> Result<()> {
    let e = LittleEndian;
    let shdr = obj.shdr(scn);
    let target = obj.section_index(shdr.sh_info.get(e), "relocation target")?;
    let symtab = obj.section_index(shdr.sh_link.get(e), "symbol table")?;

    let name = obj.section_name(target)?;
    if name != ".text" {
        tracing::info!("skipping relocation section for {name}");
        return Ok(());
    }
    let strtab = obj.section_index(obj.shdr(symtab).sh_link.get(e), "string table")?;

    for index in 0..obj.reloc_count(scn)? {
        let mut entry = obj.reloc_entry(scn, index)?;
        let Some((site, symname, arch)) = classify(obj, symtab, strtab, target, &entry)? else {
            continue;
        };

        arch.patch_call_site(obj.data_mut(target), entry.offset, site);
        entry.set_r_type(arch.none_relocation_type());
        obj.update_reloc_entry(scn, index, &entry)?;
        // Both buffers changed; make sure the container writes them back.
        obj.mark_dirty(target);
        obj.mark_dirty(scn);
        tracing::info!("updated relocation for {symname} at {:#x}", entry.offset - 1);

        instances.push(ProbeInstance {
            symname,
            offset: entry.offset,
        });
    }
    Ok(())
}

/// Decides what to do with one relocation entry. Returns `None` for entries
/// the pass leaves alone: relocations against other symbols, and call sites
/// already neutralized by an earlier run.
fn classify(
    obj: &ElfObject,
    symtab: SectionIndex,
    strtab: SectionIndex,
    target: SectionIndex,
    entry: &RelocEntry,
) -> Result<Option<(CallSite, String, &'static dyn Arch)>> {
    let sym = obj.symbol(symtab, entry.sym())?;
    let symname = obj.string(strtab, sym.st_name.get(LittleEndian))?;
    if !symname.starts_with(PROBE_PREFIX) {
        return Ok(None);
    }

    let st_type = sym.st_info & 0xf;
    let st_bind = sym.st_info >> 4;
    ensure!(
        st_type == object::elf::STT_NOTYPE,
        "unexpected symbol type {st_type} for {symname}"
    );
    ensure!(
        st_bind == object::elf::STB_GLOBAL,
        "unexpected binding {st_bind} for {symname}"
    );

    let arch = arch::from_machine(obj.machine())?;
    if entry.r_type() == arch.none_relocation_type() {
        tracing::info!(
            "skipping already patched call site for {symname} at {:#x}",
            entry.offset
        );
        return Ok(None);
    }

    let site = arch.classify_call_site(obj.data(target), entry.offset, symname)?;
    Ok(Some((site, symname.to_owned(), arch)))
}
