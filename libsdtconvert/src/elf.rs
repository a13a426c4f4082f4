//! The ELF container layer. An [`ElfObject`] owns the bytes of a relocatable
//! object together with a parsed copy of its header and section table. Callers
//! mutate section contents and relocation entries through it, append new
//! sections, and finally flush everything back to disk in one step.
//!
//! Pre-existing sections are written back only when marked dirty, and always
//! in place (their sizes never change). New sections, the grown section header
//! string table and the enlarged section header table don't fit in their old
//! locations, so the flush appends them past the end of the original image and
//! repoints `e_shoff`. The superseded copies stay behind as dead bytes, which
//! keeps every pre-existing file offset valid.

use crate::error::Context as _;
use crate::error::Result;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::ensure;
use object::LittleEndian;
use object::I64;
use object::U32;
use object::U64;
use std::ffi::CStr;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::mem::size_of;
use std::path::Path;
use std::path::PathBuf;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type Symbol = object::elf::Sym64<LittleEndian>;
pub(crate) type Rel = object::elf::Rel64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;

/// Index into the section table. Sections appended during this run get
/// indices following the pre-existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectionIndex(pub(crate) usize);

pub(crate) struct ElfObject {
    path: PathBuf,
    /// Held read-write for the object's whole lifetime; the flush writes back
    /// through it.
    file: std::fs::File,
    image: Vec<u8>,
    ehdr: FileHeader,
    sections: Vec<Section>,
    new_sections: Vec<NewSection>,
    /// Names appended to the section header string table. Stable offsets:
    /// existing bytes are never rewritten.
    shstrtab_tail: Vec<u8>,
}

struct Section {
    shdr: SectionHeader,
    data: Vec<u8>,
    dirty: bool,
}

struct NewSection {
    shdr: SectionHeader,
    data: Vec<u8>,
}

/// A relocation entry, uniform over REL and RELA sections. REL entries read
/// back a zero addend.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelocEntry {
    pub(crate) offset: u64,
    pub(crate) info: u64,
    pub(crate) addend: i64,
}

impl RelocEntry {
    pub(crate) fn sym(&self) -> u32 {
        (self.info >> 32) as u32
    }

    pub(crate) fn r_type(&self) -> u32 {
        self.info as u32
    }

    /// Replaces the relocation type, preserving the symbol index.
    pub(crate) fn set_r_type(&mut self, r_type: u32) {
        self.info = elf64_r_info(self.sym(), r_type);
    }
}

pub(crate) fn elf64_r_info(sym: u32, r_type: u32) -> u64 {
    (u64::from(sym) << 32) | u64::from(r_type)
}

impl ElfObject {
    /// Reads and parses the object at `path`. The file is opened read-write up
    /// front so that an unwritable input fails here rather than after
    /// patching.
    pub(crate) fn open(path: &Path) -> Result<ElfObject> {
        let mut file = std::fs::File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)
            .with_context(|| format!("failed to read {}", path.display()))?;
        ElfObject::parse(path.to_owned(), file, image)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    fn parse(path: PathBuf, file: std::fs::File, image: Vec<u8>) -> Result<ElfObject> {
        let e = LittleEndian;
        ensure!(image.starts_with(&object::elf::ELFMAG), "not an ELF file");
        const HEADER_LEN: usize = size_of::<FileHeader>();
        ensure!(image.len() >= HEADER_LEN, "truncated ELF header");
        let ehdr: FileHeader = *object::from_bytes(&image[..HEADER_LEN])
            .map_err(|()| anyhow!("misaligned ELF header"))?
            .0;
        ensure!(
            ehdr.e_ident.class == object::elf::ELFCLASS64,
            "only 64 bit ELF is supported"
        );
        ensure!(
            ehdr.e_ident.data == object::elf::ELFDATA2LSB,
            "only little endian ELF is supported"
        );

        let shoff = ehdr.e_shoff.get(e) as usize;
        let shnum = usize::from(ehdr.e_shnum.get(e));
        let shstrndx = ehdr.e_shstrndx.get(e);
        ensure!(shnum > 0, "empty or extended section header table");
        ensure!(
            shstrndx != object::elf::SHN_XINDEX && usize::from(shstrndx) < shnum,
            "invalid section header string table index {shstrndx}"
        );

        let mut sections = Vec::with_capacity(shnum);
        for index in 0..shnum {
            let start = shoff
                .checked_add(index * size_of::<SectionHeader>())
                .ok_or_else(|| anyhow!("section header {index} is out of range"))?;
            let bytes = image
                .get(start..start + size_of::<SectionHeader>())
                .ok_or_else(|| anyhow!("section header {index} is out of range"))?;
            let shdr: SectionHeader = *object::from_bytes(bytes)
                .map_err(|()| anyhow!("misaligned section header table"))?
                .0;
            let data = section_bytes(&image, &shdr, index)?.to_vec();
            sections.push(Section {
                shdr,
                data,
                dirty: false,
            });
        }

        Ok(ElfObject {
            path,
            file,
            image,
            ehdr,
            sections,
            new_sections: Vec::new(),
            shstrtab_tail: Vec::new(),
        })
    }

    pub(crate) fn is_relocatable(&self) -> bool {
        self.ehdr.e_type.get(LittleEndian) == object::elf::ET_REL
    }

    pub(crate) fn machine(&self) -> u16 {
        self.ehdr.e_machine.get(LittleEndian)
    }

    pub(crate) fn section_count(&self) -> usize {
        self.sections.len() + self.new_sections.len()
    }

    /// Validates a section index read from the file (`sh_link`, `sh_info`).
    pub(crate) fn section_index(&self, index: u32, what: &str) -> Result<SectionIndex> {
        ensure!(
            (index as usize) < self.section_count(),
            "invalid {what} section index {index}"
        );
        Ok(SectionIndex(index as usize))
    }

    pub(crate) fn shdr(&self, index: SectionIndex) -> &SectionHeader {
        match self.sections.get(index.0) {
            Some(section) => &section.shdr,
            None => &self.new_sections[index.0 - self.sections.len()].shdr,
        }
    }

    pub(crate) fn shdr_mut(&mut self, index: SectionIndex) -> &mut SectionHeader {
        if index.0 < self.sections.len() {
            &mut self.sections[index.0].shdr
        } else {
            &mut self.new_sections[index.0 - self.sections.len()].shdr
        }
    }

    pub(crate) fn data(&self, index: SectionIndex) -> &[u8] {
        match self.sections.get(index.0) {
            Some(section) => &section.data,
            None => &self.new_sections[index.0 - self.sections.len()].data,
        }
    }

    pub(crate) fn data_mut(&mut self, index: SectionIndex) -> &mut [u8] {
        if index.0 < self.sections.len() {
            &mut self.sections[index.0].data
        } else {
            &mut self.new_sections[index.0 - self.sections.len()].data
        }
    }

    /// Marks a pre-existing section's data for write-back. Sections created
    /// during this run are always written.
    pub(crate) fn mark_dirty(&mut self, index: SectionIndex) {
        if let Some(section) = self.sections.get_mut(index.0) {
            section.dirty = true;
        }
    }

    /// Resolves a name from the section header string table, including names
    /// appended during this run.
    fn shstr(&self, offset: u32) -> Result<&str> {
        let shstrndx = usize::from(self.ehdr.e_shstrndx.get(LittleEndian));
        let strtab = &self.sections[shstrndx].data;
        let offset = offset as usize;
        let bytes = if offset < strtab.len() {
            &strtab[offset..]
        } else {
            self.shstrtab_tail
                .get(offset - strtab.len()..)
                .ok_or_else(|| anyhow!("invalid section name offset {offset}"))?
        };
        read_c_str(bytes)
    }

    pub(crate) fn section_name(&self, index: SectionIndex) -> Result<&str> {
        self.shstr(self.shdr(index).sh_name.get(LittleEndian))
    }

    /// Looks up a section by name. Returns the first match.
    pub(crate) fn section_by_name(&self, name: &str) -> Option<SectionIndex> {
        (0..self.section_count())
            .map(SectionIndex)
            .find(|&index| self.section_name(index).is_ok_and(|n| n == name))
    }

    /// Retrieves the specified symbol, with bounds checking.
    pub(crate) fn symbol(&self, symtab: SectionIndex, index: u32) -> Result<Symbol> {
        let data = self.data(symtab);
        let start = index as usize * size_of::<Symbol>();
        let bytes = data
            .get(start..start + size_of::<Symbol>())
            .ok_or_else(|| anyhow!("invalid symbol index {index}"))?;
        Ok(*object::from_bytes(bytes)
            .map_err(|()| anyhow!("misaligned symbol table"))?
            .0)
    }

    /// Resolves a string table entry, e.g. a symbol name.
    pub(crate) fn string(&self, strtab: SectionIndex, offset: u32) -> Result<&str> {
        let bytes = self
            .data(strtab)
            .get(offset as usize..)
            .ok_or_else(|| anyhow!("invalid string table offset {offset}"))?;
        read_c_str(bytes)
    }

    /// Number of entries in a REL or RELA section.
    pub(crate) fn reloc_count(&self, scn: SectionIndex) -> Result<usize> {
        let e = LittleEndian;
        let shdr = self.shdr(scn);
        let expected = reloc_entry_size(shdr.sh_type.get(e))? as u64;
        let entsize = shdr.sh_entsize.get(e);
        ensure!(
            entsize == expected,
            "unexpected relocation entry size {entsize} in section {}",
            scn.0
        );
        Ok((shdr.sh_size.get(e) / expected) as usize)
    }

    pub(crate) fn reloc_entry(&self, scn: SectionIndex, index: usize) -> Result<RelocEntry> {
        let e = LittleEndian;
        let sh_type = self.shdr(scn).sh_type.get(e);
        let size = reloc_entry_size(sh_type)?;
        let bytes = self
            .data(scn)
            .get(index * size..(index + 1) * size)
            .ok_or_else(|| anyhow!("relocation entry {index} is out of range"))?;
        if sh_type == object::elf::SHT_RELA {
            let rela: &Rela = object::from_bytes(bytes)
                .map_err(|()| anyhow!("misaligned relocation section"))?
                .0;
            Ok(RelocEntry {
                offset: rela.r_offset.get(e),
                info: rela.r_info.get(e),
                addend: rela.r_addend.get(e),
            })
        } else {
            let rel: &Rel = object::from_bytes(bytes)
                .map_err(|()| anyhow!("misaligned relocation section"))?
                .0;
            Ok(RelocEntry {
                offset: rel.r_offset.get(e),
                info: rel.r_info.get(e),
                addend: 0,
            })
        }
    }

    /// Writes an updated relocation entry back into the section's data. The
    /// caller is responsible for marking the section dirty.
    pub(crate) fn update_reloc_entry(
        &mut self,
        scn: SectionIndex,
        index: usize,
        entry: &RelocEntry,
    ) -> Result<()> {
        let e = LittleEndian;
        let sh_type = self.shdr(scn).sh_type.get(e);
        let size = reloc_entry_size(sh_type)?;
        let bytes = self
            .data_mut(scn)
            .get_mut(index * size..(index + 1) * size)
            .ok_or_else(|| anyhow!("relocation entry {index} is out of range"))?;
        if sh_type == object::elf::SHT_RELA {
            let rela = Rela {
                r_offset: U64::new(e, entry.offset),
                r_info: U64::new(e, entry.info),
                r_addend: I64::new(e, entry.addend),
            };
            bytes.copy_from_slice(object::bytes_of(&rela));
        } else {
            let rel = Rel {
                r_offset: U64::new(e, entry.offset),
                r_info: U64::new(e, entry.info),
            };
            bytes.copy_from_slice(object::bytes_of(&rel));
        }
        Ok(())
    }

    /// Creates a new section. The name lands in the section header string
    /// table (with its NUL) and the returned index follows all pre-existing
    /// sections. Data is added separately via [`ElfObject::append_data`].
    pub(crate) fn add_section(
        &mut self,
        name: &str,
        sh_type: u32,
        sh_flags: u64,
    ) -> Result<SectionIndex> {
        let e = LittleEndian;
        let shstrndx = usize::from(self.ehdr.e_shstrndx.get(e));
        ensure!(shstrndx != 0, "cannot resolve section header string table");
        let strscn = self
            .sections
            .get_mut(shstrndx)
            .ok_or_else(|| anyhow!("cannot resolve section header string table"))?;

        let name_offset = strscn.shdr.sh_size.get(e);
        strscn
            .shdr
            .sh_size
            .set(e, name_offset + name.len() as u64 + 1);
        self.shstrtab_tail.extend_from_slice(name.as_bytes());
        self.shstrtab_tail.push(0);

        let shdr = SectionHeader {
            sh_name: U32::new(e, name_offset as u32),
            sh_type: U32::new(e, sh_type),
            sh_flags: U64::new(e, sh_flags),
            sh_addr: U64::new(e, 0),
            sh_offset: U64::new(e, 0),
            sh_size: U64::new(e, 0),
            sh_link: U32::new(e, 0),
            sh_info: U32::new(e, 0),
            sh_addralign: U64::new(e, 8),
            sh_entsize: U64::new(e, 0),
        };
        let index = SectionIndex(self.section_count());
        self.new_sections.push(NewSection {
            shdr,
            data: Vec::new(),
        });
        tracing::info!("added section {name}");
        Ok(index)
    }

    /// Appends data to a section created during this run, growing `sh_size`
    /// in step.
    pub(crate) fn append_data(&mut self, index: SectionIndex, bytes: &[u8]) {
        let e = LittleEndian;
        let scn = &mut self.new_sections[index.0 - self.sections.len()];
        scn.data.extend_from_slice(bytes);
        let size = scn.shdr.sh_size.get(e) + bytes.len() as u64;
        scn.shdr.sh_size.set(e, size);
    }

    /// Commits all changes back to the file: dirty pre-existing sections in
    /// place, then the grown string table, new section data and the enlarged
    /// section header table appended past the original image.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let e = LittleEndian;
        let mut out = self.image.clone();

        for section in &self.sections {
            if !section.dirty {
                continue;
            }
            debug_assert_eq!(section.data.len() as u64, section.shdr.sh_size.get(e));
            let start = section.shdr.sh_offset.get(e) as usize;
            out[start..start + section.data.len()].copy_from_slice(&section.data);
        }

        if !self.new_sections.is_empty() || !self.shstrtab_tail.is_empty() {
            let shstrndx = usize::from(self.ehdr.e_shstrndx.get(e));
            {
                let strscn = &mut self.sections[shstrndx];
                let offset = append_aligned(&mut out, strscn.shdr.sh_addralign.get(e));
                out.extend_from_slice(&strscn.data);
                out.extend_from_slice(&self.shstrtab_tail);
                strscn.shdr.sh_offset.set(e, offset);
            }

            for scn in &mut self.new_sections {
                let offset = append_aligned(&mut out, scn.shdr.sh_addralign.get(e));
                out.extend_from_slice(&scn.data);
                scn.shdr.sh_offset.set(e, offset);
            }

            let count = self.section_count();
            ensure!(
                count < usize::from(object::elf::SHN_LORESERVE),
                "too many sections ({count})"
            );
            let shoff = append_aligned(&mut out, 8);
            for section in &self.sections {
                out.extend_from_slice(object::bytes_of(&section.shdr));
            }
            for scn in &self.new_sections {
                out.extend_from_slice(object::bytes_of(&scn.shdr));
            }
            self.ehdr.e_shoff.set(e, shoff);
            self.ehdr.e_shnum.set(e, count as u16);
            out[..size_of::<FileHeader>()].copy_from_slice(object::bytes_of(&self.ehdr));
        }

        write_back(&mut self.file, &out)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

fn write_back(file: &mut std::fs::File, out: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(out)?;
    file.set_len(out.len() as u64)
}

fn section_bytes<'data>(
    image: &'data [u8],
    shdr: &SectionHeader,
    index: usize,
) -> Result<&'data [u8]> {
    let e = LittleEndian;
    if matches!(
        shdr.sh_type.get(e),
        object::elf::SHT_NULL | object::elf::SHT_NOBITS
    ) {
        return Ok(&[]);
    }
    let start = shdr.sh_offset.get(e) as usize;
    let end = start
        .checked_add(shdr.sh_size.get(e) as usize)
        .ok_or_else(|| anyhow!("section {index} data is out of range"))?;
    image
        .get(start..end)
        .ok_or_else(|| anyhow!("section {index} data is out of range"))
}

fn reloc_entry_size(sh_type: u32) -> Result<usize> {
    match sh_type {
        object::elf::SHT_REL => Ok(size_of::<Rel>()),
        object::elf::SHT_RELA => Ok(size_of::<Rela>()),
        ty => bail!("not a relocation section (type {ty:#x})"),
    }
}

fn read_c_str(bytes: &[u8]) -> Result<&str> {
    CStr::from_bytes_until_nul(bytes)
        .context("unterminated string in string table")?
        .to_str()
        .context("non-UTF-8 string in string table")
}

/// Pads `out` up to `alignment` and returns the aligned offset.
fn append_aligned(out: &mut Vec<u8>, alignment: u64) -> u64 {
    let alignment = (alignment.max(1)) as usize;
    let offset = out.len().next_multiple_of(alignment);
    out.resize(offset, 0);
    offset as u64
}
