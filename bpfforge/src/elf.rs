// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Relocatable-object parser.
//!
//! Reads 64-bit little-endian ELF objects produced by an external eBPF
//! compiler: section table, string tables, symbols, RELA entries, the
//! packed map-definition section and the license. Applying a relocation
//! rewrites the 32-bit immediate of an `lddw` with a loaded map's fd and
//! sets the word's `src_reg` nibble to the pseudo-fd marker.

use std::{collections::HashMap, os::fd::RawFd};

use log::debug;

use crate::{
    bytes,
    errors::{BpfForgeError, ElfError},
    insn::BPF_PSEUDO_MAP_FD,
    programs::ProgramType,
};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_RELA: u32 = 4;
const SHF_EXECINSTR: u64 = 0x4;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

/// Size of one packed map-definition record:
/// `(type, key_size, value_size, max_entries, flags)` as five u32s.
pub const MAP_DEF_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct ElfMapDef {
    pub name: String,
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    /// Byte offset of this record inside the maps section; symbols refer
    /// to maps by this offset.
    pub section_offset: u64,
}

#[derive(Debug, Clone)]
pub struct ElfSymbol {
    pub name: String,
    pub section_index: u16,
    pub value: u64,
}

#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: u64,
    pub symbol_index: u32,
    pub rel_type: u32,
    pub addend: i64,
}

#[derive(Debug, Clone)]
pub struct ElfProgram {
    pub name: String,
    pub prog_type: ProgramType,
    pub insns: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

#[derive(Debug)]
pub struct ElfObject {
    pub programs: Vec<ElfProgram>,
    pub maps: Vec<ElfMapDef>,
    pub license: String,
    /// Kernel version from a `version` section; compilers emit one for
    /// kprobe objects targeting pre-5.0 kernels.
    pub version: Option<u32>,
    pub symbols: Vec<ElfSymbol>,
    maps_section_index: Option<usize>,
}

struct Section {
    name: String,
    link_name_offset: u32,
    sh_type: u32,
    flags: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
}

fn truncated(what: &'static str) -> BpfForgeError {
    ElfError::Truncated(what).into()
}

impl ElfObject {
    /// Parse a relocatable object out of `data`. Only the magic and the
    /// 64-bit little-endian class are accepted.
    pub fn parse(data: &[u8]) -> Result<Self, BpfForgeError> {
        if data.len() < EHDR_SIZE {
            return Err(truncated("ELF header"));
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::Magic.into());
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ElfError::Class.into());
        }

        let shoff = bytes::get_u64(data, 40).ok_or_else(|| truncated("e_shoff"))? as usize;
        let shentsize = bytes::get_u16(data, 58).ok_or_else(|| truncated("e_shentsize"))? as usize;
        let shnum = bytes::get_u16(data, 60).ok_or_else(|| truncated("e_shnum"))? as usize;
        let shstrndx = bytes::get_u16(data, 62).ok_or_else(|| truncated("e_shstrndx"))? as usize;
        if shentsize != SHDR_SIZE {
            return Err(ElfError::Class.into());
        }

        let mut sections = Vec::with_capacity(shnum);
        for i in 0..shnum {
            sections.push(read_section(data, shoff + i * SHDR_SIZE)?);
        }

        // Resolve section names out of the section-header string table.
        let shstr = sections
            .get(shstrndx)
            .ok_or(ElfError::Truncated("shstrtab"))?;
        let shstr_range = section_bytes(data, shstr)?;
        for section in &mut sections {
            let name_off = section.link_name_offset;
            section.name = bytes::get_cstr(shstr_range, name_off as usize)
                .ok_or(ElfError::Truncated("section name"))?;
        }

        let symbols = parse_symbols(data, &sections)?;
        let maps_section_index = sections
            .iter()
            .position(|s| s.name == "maps" || s.name == ".maps");
        let maps = match maps_section_index {
            Some(index) => parse_maps(data, &sections[index], index as u16, &symbols)?,
            None => Vec::new(),
        };

        let license = sections
            .iter()
            .find(|s| s.name == "license")
            .map(|s| {
                let raw = section_bytes(data, s)?;
                Ok::<_, BpfForgeError>(
                    bytes::get_cstr(raw, 0).unwrap_or_default(),
                )
            })
            .transpose()?
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "GPL".to_string());

        let version = sections
            .iter()
            .find(|s| s.name == "version" && s.size >= 4)
            .map(|s| {
                let raw = section_bytes(data, s)?;
                bytes::get_u32(raw, 0).ok_or_else(|| truncated("version"))
            })
            .transpose()?;

        let mut programs = Vec::new();
        for (index, section) in sections.iter().enumerate() {
            if section.sh_type != SHT_PROGBITS || section.flags & SHF_EXECINSTR == 0 {
                continue;
            }
            if section.size == 0 || section.size % 8 != 0 {
                continue;
            }
            let prog_type = program_type_for_section(&section.name)?;
            let insns = section_bytes(data, section)?.to_vec();
            let relocations = parse_relocations(data, &sections, index as u32)?;
            debug!(
                "program section {:?}: {} insns, {} relocations",
                section.name,
                insns.len() / 8,
                relocations.len()
            );
            programs.push(ElfProgram {
                name: section.name.clone(),
                prog_type,
                insns,
                relocations,
            });
        }

        Ok(ElfObject {
            programs,
            maps,
            license,
            version,
            symbols,
            maps_section_index,
        })
    }

    /// Patch every map relocation in `program` using `map_fds`, keyed by
    /// map name. The rewritten word keeps its opcode and offset; only the
    /// immediate and the `src_reg` nibble change.
    pub fn apply_map_relocations(
        &self,
        program: &mut ElfProgram,
        map_fds: &HashMap<String, RawFd>,
    ) -> Result<(), BpfForgeError> {
        let maps_index = match self.maps_section_index {
            Some(index) => index as u16,
            None if program.relocations.is_empty() => return Ok(()),
            None => {
                return Err(ElfError::BadRelocation(
                    "object has relocations but no maps section".to_string(),
                )
                .into());
            }
        };

        for rel in &program.relocations {
            let symbol = self
                .symbols
                .get(rel.symbol_index as usize)
                .ok_or_else(|| {
                    ElfError::BadRelocation(format!("symbol index {} out of range", rel.symbol_index))
                })?;
            if symbol.section_index != maps_index {
                return Err(ElfError::BadRelocation(format!(
                    "symbol {:?} does not refer to the maps section",
                    symbol.name
                ))
                .into());
            }
            let map = self
                .maps
                .iter()
                .find(|m| m.section_offset == symbol.value)
                .ok_or_else(|| {
                    ElfError::BadRelocation(format!("no map at offset {}", symbol.value))
                })?;
            let fd = map_fds.get(&map.name).copied().ok_or_else(|| {
                ElfError::BadRelocation(format!("map {:?} was not loaded", map.name))
            })?;
            patch_map_fd(&mut program.insns, rel.offset as usize, fd)?;
            debug!(
                "relocated {:?} at insn byte offset {} to fd {fd}",
                map.name, rel.offset
            );
        }
        Ok(())
    }
}

/// Rewrite the instruction word at `offset` to load `fd` through the
/// pseudo-map-fd convention.
pub fn patch_map_fd(insns: &mut [u8], offset: usize, fd: RawFd) -> Result<(), BpfForgeError> {
    if offset % 8 != 0 || offset + 8 > insns.len() {
        return Err(ElfError::BadRelocation(format!(
            "relocation offset {offset} is not an instruction boundary"
        ))
        .into());
    }
    // Only the wide immediate load takes a map fd.
    if insns[offset] != 0x18 {
        return Err(ElfError::BadRelocation(format!(
            "relocation target at {offset} is not an lddw (opcode {:#04x})",
            insns[offset]
        ))
        .into());
    }
    let dst = insns[offset + 1] & 0x0f;
    insns[offset + 1] = dst | (BPF_PSEUDO_MAP_FD << 4);
    bytes::put_u32(insns, offset + 4, fd as u32);
    Ok(())
}

/// The closed section-name table mapping compiler conventions to program
/// types. `.text` is the generic entry and loads as a socket filter.
pub fn program_type_for_section(name: &str) -> Result<ProgramType, BpfForgeError> {
    let ty = if name == ".text" || name == "socket" {
        ProgramType::SocketFilter
    } else if name.starts_with("kprobe/") || name.starts_with("kretprobe/") {
        ProgramType::Kprobe
    } else if name.starts_with("tracepoint/") {
        ProgramType::Tracepoint
    } else if name.starts_with("raw_tracepoint/") {
        ProgramType::RawTracepoint
    } else if name == "xdp" || name.starts_with("xdp/") || name.starts_with("xdp_") {
        ProgramType::Xdp
    } else if name == "tc"
        || name.starts_with("tc/")
        || name.starts_with("tc_")
        || name == "classifier"
    {
        ProgramType::SchedCls
    } else if name.starts_with("cgroup/skb") {
        ProgramType::CgroupSkb
    } else if name.starts_with("lsm/") {
        ProgramType::Lsm
    } else {
        return Err(ElfError::UnknownSection(name.to_string()).into());
    };
    Ok(ty)
}

// Section parsing keeps the raw name offset around until the string table
// is known, then fills in `name`.
impl Section {
    fn placeholder() -> Self {
        Section {
            name: String::new(),
            link_name_offset: 0,
            sh_type: 0,
            flags: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
        }
    }
}

fn read_section(data: &[u8], at: usize) -> Result<Section, BpfForgeError> {
    let mut section = Section::placeholder();
    section.link_name_offset = bytes::get_u32(data, at).ok_or_else(|| truncated("sh_name"))?;
    section.sh_type = bytes::get_u32(data, at + 4).ok_or_else(|| truncated("sh_type"))?;
    section.flags = bytes::get_u64(data, at + 8).ok_or_else(|| truncated("sh_flags"))?;
    section.offset = bytes::get_u64(data, at + 24).ok_or_else(|| truncated("sh_offset"))?;
    section.size = bytes::get_u64(data, at + 32).ok_or_else(|| truncated("sh_size"))?;
    section.link = bytes::get_u32(data, at + 40).ok_or_else(|| truncated("sh_link"))?;
    section.info = bytes::get_u32(data, at + 44).ok_or_else(|| truncated("sh_info"))?;
    Ok(section)
}

fn section_bytes<'d>(data: &'d [u8], section: &Section) -> Result<&'d [u8], BpfForgeError> {
    let start = section.offset as usize;
    let end = start + section.size as usize;
    data.get(start..end).ok_or_else(|| truncated("section data"))
}

fn parse_symbols(data: &[u8], sections: &[Section]) -> Result<Vec<ElfSymbol>, BpfForgeError> {
    let symtab = match sections.iter().find(|s| s.sh_type == SHT_SYMTAB) {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    let strtab = sections
        .get(symtab.link as usize)
        .ok_or(ElfError::Truncated("symbol string table"))?;
    let strtab_bytes = section_bytes(data, strtab)?;
    let raw = section_bytes(data, symtab)?;

    let mut symbols = Vec::with_capacity(raw.len() / SYM_SIZE);
    for entry in raw.chunks_exact(SYM_SIZE) {
        let name_off = bytes::get_u32(entry, 0).ok_or_else(|| truncated("st_name"))?;
        let section_index = bytes::get_u16(entry, 6).ok_or_else(|| truncated("st_shndx"))?;
        let value = bytes::get_u64(entry, 8).ok_or_else(|| truncated("st_value"))?;
        let name = bytes::get_cstr(strtab_bytes, name_off as usize)
            .ok_or(ElfError::Truncated("symbol name"))?;
        symbols.push(ElfSymbol {
            name,
            section_index,
            value,
        });
    }
    Ok(symbols)
}

fn parse_maps(
    data: &[u8],
    section: &Section,
    section_index: u16,
    symbols: &[ElfSymbol],
) -> Result<Vec<ElfMapDef>, BpfForgeError> {
    let raw = section_bytes(data, section)?;
    if raw.len() % MAP_DEF_SIZE != 0 {
        return Err(ElfError::Truncated("maps section").into());
    }
    let mut maps = Vec::new();
    for (index, entry) in raw.chunks_exact(MAP_DEF_SIZE).enumerate() {
        let section_offset = (index * MAP_DEF_SIZE) as u64;
        let name = symbols
            .iter()
            .find(|sym| {
                sym.section_index == section_index
                    && sym.value == section_offset
                    && !sym.name.is_empty()
            })
            .map(|sym| sym.name.clone())
            .unwrap_or_else(|| format!("map_{index}"));
        maps.push(ElfMapDef {
            name,
            map_type: bytes::get_u32(entry, 0).ok_or_else(|| truncated("map type"))?,
            key_size: bytes::get_u32(entry, 4).ok_or_else(|| truncated("map key_size"))?,
            value_size: bytes::get_u32(entry, 8).ok_or_else(|| truncated("map value_size"))?,
            max_entries: bytes::get_u32(entry, 12).ok_or_else(|| truncated("map max_entries"))?,
            flags: bytes::get_u32(entry, 16).ok_or_else(|| truncated("map flags"))?,
            section_offset,
        });
    }
    Ok(maps)
}

fn parse_relocations(
    data: &[u8],
    sections: &[Section],
    target_index: u32,
) -> Result<Vec<Relocation>, BpfForgeError> {
    let mut relocations = Vec::new();
    for section in sections {
        if section.sh_type != SHT_RELA || section.info != target_index {
            continue;
        }
        let raw = section_bytes(data, section)?;
        for entry in raw.chunks_exact(RELA_SIZE) {
            let offset = bytes::get_u64(entry, 0).ok_or_else(|| truncated("r_offset"))?;
            let info = bytes::get_u64(entry, 8).ok_or_else(|| truncated("r_info"))?;
            let addend = bytes::get_i64(entry, 16).ok_or_else(|| truncated("r_addend"))?;
            relocations.push(Relocation {
                offset,
                symbol_index: (info >> 32) as u32,
                rel_type: (info & 0xffff_ffff) as u32,
                addend,
            });
        }
    }
    Ok(relocations)
}
