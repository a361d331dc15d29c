// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Test doubles: an in-memory kernel behind the [`Syscall`] seam and a
//! relocatable-object builder, so assembler, parser and lifecycle code is
//! exercised without privileges.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    os::fd::RawFd,
    sync::Mutex,
};

use nix::errno::Errno;

use crate::{
    bytes,
    errors::BpfForgeError,
    syscall::{BpfCmd, Syscall, layout, translate_errno},
    utils,
};

/// Route `log` output through the test harness; safe to call repeatedly.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const MAP_TYPE_PERCPU_HASH: u32 = 5;
const MAP_TYPE_PERCPU_ARRAY: u32 = 6;
const MAP_TYPE_LRU_PERCPU_HASH: u32 = 10;
const MAP_TYPE_LPM_TRIE: u32 = 11;
const MAP_TYPE_QUEUE: u32 = 22;
const MAP_TYPE_STACK: u32 = 23;

const UPDATE_NOEXIST: u64 = 1;
const UPDATE_EXIST: u64 = 2;

// SAFETY helpers for following attr pointers the way the kernel would.
unsafe fn read_user(addr: u64, len: usize) -> Vec<u8> {
    if addr == 0 || len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
}

unsafe fn write_user(addr: u64, data: &[u8]) {
    if addr == 0 || data.is_empty() {
        return;
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
}

unsafe fn read_user_cstr(addr: u64) -> String {
    if addr == 0 {
        return String::new();
    }
    let mut out = Vec::new();
    for i in 0..4096u64 {
        let byte = unsafe { *((addr + i) as *const u8) };
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    String::from_utf8_lossy(&out).to_string()
}

#[derive(Debug)]
struct FakeMap {
    map_type: u32,
    key_size: usize,
    value_size: usize,
    max_entries: u32,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    fifo: VecDeque<Vec<u8>>,
}

impl FakeMap {
    fn is_per_cpu(&self) -> bool {
        matches!(
            self.map_type,
            MAP_TYPE_PERCPU_HASH | MAP_TYPE_PERCPU_ARRAY | MAP_TYPE_LRU_PERCPU_HASH
        )
    }

    fn stored_value_len(&self) -> usize {
        if self.is_per_cpu() {
            utils::roundup8(self.value_size) * utils::nr_possible_cpus()
        } else {
            self.value_size
        }
    }

    // Longest stored prefix covering the queried address, LPM semantics.
    fn lpm_match(&self, query: &[u8]) -> Option<&Vec<u8>> {
        let addr = &query[4..];
        let mut best: Option<(u32, &Vec<u8>)> = None;
        for (key, value) in &self.data {
            let prefix_len = bytes::get_u32(key, 0)?;
            let data = &key[4..];
            if prefix_matches(data, addr, prefix_len)
                && best.map(|(len, _)| prefix_len > len).unwrap_or(true)
            {
                best = Some((prefix_len, value));
            }
        }
        best.map(|(_, value)| value)
    }
}

fn prefix_matches(prefix: &[u8], addr: &[u8], prefix_len: u32) -> bool {
    let full = (prefix_len / 8) as usize;
    if prefix[..full] != addr[..full] {
        return false;
    }
    let rest = prefix_len % 8;
    if rest == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rest);
    (prefix[full] & mask) == (addr[full] & mask)
}

/// One loaded program as the fake kernel saw it.
#[derive(Debug, Clone)]
pub(crate) struct FakeProgram {
    pub prog_type: u32,
    pub insns: Vec<u8>,
    pub license: String,
    pub name: String,
}

#[derive(Debug)]
struct Attachment {
    target_fd: RawFd,
    prog_fd: RawFd,
    attach_type: u32,
    detached: bool,
}

#[derive(Debug, Default)]
struct KernelState {
    next_fd: RawFd,
    maps: HashMap<RawFd, FakeMap>,
    programs: HashMap<RawFd, FakeProgram>,
    raw_tracepoints: HashMap<RawFd, (String, RawFd)>,
    links: HashMap<RawFd, (RawFd, u32)>,
    attachments: Vec<Attachment>,
    pins: HashMap<String, RawFd>,
    close_counts: HashMap<RawFd, u32>,
}

/// In-memory kernel. Descriptors are synthetic; [`Syscall::close`] is
/// routed here so nothing touches real fds.
#[derive(Debug)]
pub(crate) struct FakeKernel {
    state: Mutex<KernelState>,
    batch_supported: bool,
    verifier_log: Option<String>,
}

impl FakeKernel {
    pub fn new() -> Self {
        FakeKernel {
            state: Mutex::new(KernelState {
                next_fd: 100,
                ..Default::default()
            }),
            batch_supported: true,
            verifier_log: None,
        }
    }

    /// Pretend to be a kernel without the MAP_*_BATCH commands.
    pub fn without_batch_support() -> Self {
        FakeKernel {
            batch_supported: false,
            ..FakeKernel::new()
        }
    }

    /// Reject every PROG_LOAD with EACCES and this verifier log.
    pub fn with_verifier_rejection(log: &str) -> Self {
        FakeKernel {
            verifier_log: Some(log.to_string()),
            ..FakeKernel::new()
        }
    }

    pub fn close_count(&self, fd: RawFd) -> u32 {
        self.state
            .lock()
            .unwrap()
            .close_counts
            .get(&fd)
            .copied()
            .unwrap_or(0)
    }

    pub fn program(&self, fd: RawFd) -> Option<FakeProgram> {
        self.state.lock().unwrap().programs.get(&fd).cloned()
    }

    pub fn raw_tracepoint_attached(&self, name: &str, prog_fd: RawFd) -> bool {
        self.state
            .lock()
            .unwrap()
            .raw_tracepoints
            .values()
            .any(|(n, p)| n == name && *p == prog_fd)
    }

    pub fn link_created(&self, prog_fd: RawFd, attach_type: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .links
            .values()
            .any(|&(p, t)| p == prog_fd && t == attach_type)
    }

    pub fn cgroup_attached(&self, prog_fd: RawFd, attach_type: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .attachments
            .iter()
            .any(|a| a.prog_fd == prog_fd && a.attach_type == attach_type && !a.detached)
    }

    fn fail(&self, cmd: BpfCmd, errno: Errno) -> BpfForgeError {
        translate_errno(cmd, errno)
    }

    fn map_create(&self, state: &mut KernelState, attr: &[u8]) -> Result<i64, Errno> {
        let map = FakeMap {
            map_type: bytes::get_u32(attr, layout::MAP_TYPE).ok_or(Errno::EINVAL)?,
            key_size: bytes::get_u32(attr, layout::MAP_KEY_SIZE).ok_or(Errno::EINVAL)? as usize,
            value_size: bytes::get_u32(attr, layout::MAP_VALUE_SIZE).ok_or(Errno::EINVAL)?
                as usize,
            max_entries: bytes::get_u32(attr, layout::MAP_MAX_ENTRIES).ok_or(Errno::EINVAL)?,
            data: BTreeMap::new(),
            fifo: VecDeque::new(),
        };
        if map.map_type == MAP_TYPE_LPM_TRIE
            && bytes::get_u32(attr, layout::MAP_FLAGS).ok_or(Errno::EINVAL)? & 1 == 0
        {
            return Err(Errno::EINVAL);
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.maps.insert(fd, map);
        Ok(fd as i64)
    }

    fn elem_op(
        &self,
        cmd: BpfCmd,
        state: &mut KernelState,
        attr: &[u8],
    ) -> Result<i64, Errno> {
        let map_fd = bytes::get_u32(attr, layout::ELEM_MAP_FD).ok_or(Errno::EINVAL)? as RawFd;
        let key_addr = bytes::get_u64(attr, layout::ELEM_KEY).ok_or(Errno::EINVAL)?;
        let value_addr = bytes::get_u64(attr, layout::ELEM_VALUE).ok_or(Errno::EINVAL)?;
        let flags = bytes::get_u64(attr, layout::ELEM_FLAGS).ok_or(Errno::EINVAL)?;
        let map = state.maps.get_mut(&map_fd).ok_or(Errno::EBADF)?;
        let key = unsafe { read_user(key_addr, map.key_size) };
        let keyless = matches!(map.map_type, MAP_TYPE_QUEUE | MAP_TYPE_STACK);

        match cmd {
            BpfCmd::MapLookupElem => {
                let value = if keyless {
                    match map.map_type {
                        MAP_TYPE_QUEUE => map.fifo.front(),
                        _ => map.fifo.back(),
                    }
                    .ok_or(Errno::ENOENT)?
                } else if map.map_type == MAP_TYPE_LPM_TRIE {
                    map.lpm_match(&key).ok_or(Errno::ENOENT)?
                } else {
                    map.data.get(&key).ok_or(Errno::ENOENT)?
                };
                unsafe { write_user(value_addr, value) };
                Ok(0)
            }
            BpfCmd::MapUpdateElem => {
                let value = unsafe { read_user(value_addr, map.stored_value_len()) };
                if keyless {
                    if map.fifo.len() as u32 >= map.max_entries {
                        if flags & UPDATE_EXIST == 0 {
                            return Err(Errno::E2BIG);
                        }
                        map.fifo.pop_front();
                    }
                    map.fifo.push_back(value);
                    return Ok(0);
                }
                let present = map.data.contains_key(&key);
                if flags & UPDATE_NOEXIST != 0 && present {
                    return Err(Errno::EEXIST);
                }
                if flags & UPDATE_EXIST != 0 && !present {
                    return Err(Errno::ENOENT);
                }
                map.data.insert(key, value);
                Ok(0)
            }
            BpfCmd::MapDeleteElem => {
                map.data.remove(&key).ok_or(Errno::ENOENT)?;
                Ok(0)
            }
            BpfCmd::MapGetNextKey => {
                let next = if key_addr == 0 {
                    map.data.keys().next()
                } else {
                    map.data
                        .range::<Vec<u8>, _>((
                            std::ops::Bound::Excluded(&key),
                            std::ops::Bound::Unbounded,
                        ))
                        .map(|(k, _)| k)
                        .next()
                };
                let next = next.ok_or(Errno::ENOENT)?;
                unsafe { write_user(value_addr, next) };
                Ok(0)
            }
            BpfCmd::MapLookupAndDeleteElem => {
                let value = if keyless {
                    match map.map_type {
                        MAP_TYPE_QUEUE => map.fifo.pop_front(),
                        _ => map.fifo.pop_back(),
                    }
                    .ok_or(Errno::ENOENT)?
                } else {
                    map.data.remove(&key).ok_or(Errno::ENOENT)?
                };
                unsafe { write_user(value_addr, &value) };
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn batch_op(
        &self,
        cmd: BpfCmd,
        state: &mut KernelState,
        attr: &mut [u8],
    ) -> Result<i64, Errno> {
        if !self.batch_supported {
            return Err(Errno::ENOTSUP);
        }
        let map_fd = bytes::get_u32(attr, layout::BATCH_MAP_FD).ok_or(Errno::EINVAL)? as RawFd;
        let in_addr = bytes::get_u64(attr, layout::BATCH_IN).ok_or(Errno::EINVAL)?;
        let out_addr = bytes::get_u64(attr, layout::BATCH_OUT).ok_or(Errno::EINVAL)?;
        let keys_addr = bytes::get_u64(attr, layout::BATCH_KEYS).ok_or(Errno::EINVAL)?;
        let values_addr = bytes::get_u64(attr, layout::BATCH_VALUES).ok_or(Errno::EINVAL)?;
        let count = bytes::get_u32(attr, layout::BATCH_COUNT).ok_or(Errno::EINVAL)? as usize;
        let map = state.maps.get_mut(&map_fd).ok_or(Errno::EBADF)?;
        let key_size = map.key_size;
        let value_len = map.stored_value_len();

        match cmd {
            BpfCmd::MapLookupBatch | BpfCmd::MapLookupAndDeleteBatch => {
                // The cursor token is the last key of the previous chunk.
                let after = if in_addr == 0 {
                    None
                } else {
                    Some(unsafe { read_user(in_addr, key_size) })
                };
                let collected: Vec<(Vec<u8>, Vec<u8>)> = map
                    .data
                    .range::<Vec<u8>, _>((
                        after
                            .as_ref()
                            .map(std::ops::Bound::Excluded)
                            .unwrap_or(std::ops::Bound::Unbounded),
                        std::ops::Bound::Unbounded,
                    ))
                    .take(count)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let exhausted = collected.len() < count || {
                    let last = &collected[collected.len() - 1].0;
                    map.data
                        .range::<Vec<u8>, _>((
                            std::ops::Bound::Excluded(last),
                            std::ops::Bound::Unbounded,
                        ))
                        .next()
                        .is_none()
                };

                for (i, (key, value)) in collected.iter().enumerate() {
                    unsafe {
                        write_user(keys_addr + (i * key_size) as u64, key);
                        write_user(values_addr + (i * value_len) as u64, value);
                    }
                }
                if cmd == BpfCmd::MapLookupAndDeleteBatch {
                    for (key, _) in &collected {
                        map.data.remove(key);
                    }
                }
                if let Some((last_key, _)) = collected.last() {
                    let mut token = last_key.clone();
                    token.resize(key_size.max(8), 0);
                    unsafe { write_user(out_addr, &token) };
                }
                bytes::put_u32(attr, layout::BATCH_COUNT, collected.len() as u32);
                if exhausted { Err(Errno::ENOENT) } else { Ok(0) }
            }
            BpfCmd::MapUpdateBatch => {
                for i in 0..count {
                    let key = unsafe { read_user(keys_addr + (i * key_size) as u64, key_size) };
                    let value =
                        unsafe { read_user(values_addr + (i * value_len) as u64, value_len) };
                    map.data.insert(key, value);
                    bytes::put_u32(attr, layout::BATCH_COUNT, (i + 1) as u32);
                }
                Ok(0)
            }
            BpfCmd::MapDeleteBatch => {
                for i in 0..count {
                    let key = unsafe { read_user(keys_addr + (i * key_size) as u64, key_size) };
                    map.data.remove(&key).ok_or(Errno::ENOENT)?;
                    bytes::put_u32(attr, layout::BATCH_COUNT, (i + 1) as u32);
                }
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn prog_load(&self, state: &mut KernelState, attr: &[u8]) -> Result<i64, Errno> {
        if let Some(log) = &self.verifier_log {
            let log_addr = bytes::get_u64(attr, layout::PROG_LOG_BUF).ok_or(Errno::EINVAL)?;
            let log_size =
                bytes::get_u32(attr, layout::PROG_LOG_SIZE).ok_or(Errno::EINVAL)? as usize;
            if log_addr != 0 && log_size > 1 {
                let mut out = log.as_bytes()[..log.len().min(log_size - 1)].to_vec();
                out.push(0);
                unsafe { write_user(log_addr, &out) };
            }
            return Err(Errno::EACCES);
        }

        let insn_cnt = bytes::get_u32(attr, layout::PROG_INSN_CNT).ok_or(Errno::EINVAL)?;
        if insn_cnt == 0 {
            return Err(Errno::EINVAL);
        }
        let insns_addr = bytes::get_u64(attr, layout::PROG_INSNS).ok_or(Errno::EINVAL)?;
        let license_addr = bytes::get_u64(attr, layout::PROG_LICENSE).ok_or(Errno::EINVAL)?;
        let name_raw = &attr[layout::PROG_NAME..layout::PROG_NAME + bytes::OBJ_NAME_LEN];
        let program = FakeProgram {
            prog_type: bytes::get_u32(attr, layout::PROG_TYPE).ok_or(Errno::EINVAL)?,
            insns: unsafe { read_user(insns_addr, insn_cnt as usize * 8) },
            license: unsafe { read_user_cstr(license_addr) },
            name: bytes::get_cstr(name_raw, 0).unwrap_or_default(),
        };
        let fd = state.next_fd;
        state.next_fd += 1;
        state.programs.insert(fd, program);
        Ok(fd as i64)
    }

    fn obj_op(&self, cmd: BpfCmd, state: &mut KernelState, attr: &[u8]) -> Result<i64, Errno> {
        let path_addr = bytes::get_u64(attr, layout::OBJ_PATHNAME).ok_or(Errno::EINVAL)?;
        let path = unsafe { read_user_cstr(path_addr) };
        match cmd {
            BpfCmd::ObjPin => {
                let fd = bytes::get_u32(attr, layout::OBJ_BPF_FD).ok_or(Errno::EINVAL)? as RawFd;
                if state.pins.contains_key(&path) {
                    return Err(Errno::EEXIST);
                }
                state.pins.insert(path, fd);
                Ok(0)
            }
            _ => {
                let fd = *state.pins.get(&path).ok_or(Errno::ENOENT)?;
                Ok(fd as i64)
            }
        }
    }
}

impl Syscall for FakeKernel {
    fn bpf(&self, cmd: BpfCmd, attr: &mut [u8]) -> Result<i64, BpfForgeError> {
        let mut state = self.state.lock().unwrap();
        let result = match cmd {
            BpfCmd::MapCreate => self.map_create(&mut state, attr),
            BpfCmd::MapLookupElem
            | BpfCmd::MapUpdateElem
            | BpfCmd::MapDeleteElem
            | BpfCmd::MapGetNextKey
            | BpfCmd::MapLookupAndDeleteElem => self.elem_op(cmd, &mut state, attr),
            BpfCmd::MapLookupBatch
            | BpfCmd::MapLookupAndDeleteBatch
            | BpfCmd::MapUpdateBatch
            | BpfCmd::MapDeleteBatch => self.batch_op(cmd, &mut state, attr),
            BpfCmd::ProgLoad => self.prog_load(&mut state, attr),
            BpfCmd::ObjPin | BpfCmd::ObjGet => self.obj_op(cmd, &mut state, attr),
            BpfCmd::RawTracepointOpen => {
                let name_addr =
                    bytes::get_u64(attr, layout::RAW_TP_NAME).ok_or(Errno::EINVAL);
                let prog_fd = bytes::get_u32(attr, layout::RAW_TP_PROG_FD)
                    .ok_or(Errno::EINVAL)
                    .map(|fd| fd as RawFd);
                match (name_addr, prog_fd) {
                    (Ok(name_addr), Ok(prog_fd)) => {
                        if !state.programs.contains_key(&prog_fd) {
                            Err(Errno::EBADF)
                        } else {
                            let name = unsafe { read_user_cstr(name_addr) };
                            let fd = state.next_fd;
                            state.next_fd += 1;
                            state.raw_tracepoints.insert(fd, (name, prog_fd));
                            Ok(fd as i64)
                        }
                    }
                    _ => Err(Errno::EINVAL),
                }
            }
            BpfCmd::LinkCreate => {
                let prog_fd =
                    bytes::get_u32(attr, layout::LINK_PROG_FD).unwrap_or(0) as RawFd;
                let attach_type = bytes::get_u32(attr, layout::LINK_ATTACH_TYPE).unwrap_or(0);
                if !state.programs.contains_key(&prog_fd) {
                    Err(Errno::EBADF)
                } else {
                    let fd = state.next_fd;
                    state.next_fd += 1;
                    state.links.insert(fd, (prog_fd, attach_type));
                    Ok(fd as i64)
                }
            }
            BpfCmd::ProgAttach => {
                let target_fd =
                    bytes::get_u32(attr, layout::ATTACH_TARGET_FD).unwrap_or(0) as RawFd;
                let prog_fd = bytes::get_u32(attr, layout::ATTACH_BPF_FD).unwrap_or(0) as RawFd;
                let attach_type = bytes::get_u32(attr, layout::ATTACH_TYPE).unwrap_or(0);
                if !state.programs.contains_key(&prog_fd) {
                    Err(Errno::EBADF)
                } else {
                    state.attachments.push(Attachment {
                        target_fd,
                        prog_fd,
                        attach_type,
                        detached: false,
                    });
                    Ok(0)
                }
            }
            BpfCmd::ProgDetach => {
                let target_fd =
                    bytes::get_u32(attr, layout::ATTACH_TARGET_FD).unwrap_or(0) as RawFd;
                let prog_fd = bytes::get_u32(attr, layout::ATTACH_BPF_FD).unwrap_or(0) as RawFd;
                let attach_type = bytes::get_u32(attr, layout::ATTACH_TYPE).unwrap_or(0);
                match state.attachments.iter_mut().find(|a| {
                    a.target_fd == target_fd
                        && a.prog_fd == prog_fd
                        && a.attach_type == attach_type
                        && !a.detached
                }) {
                    Some(attachment) => {
                        attachment.detached = true;
                        Ok(0)
                    }
                    None => Err(Errno::ENOENT),
                }
            }
            BpfCmd::LinkDetach => Err(Errno::EINVAL),
        };
        result.map_err(|errno| self.fail(cmd, errno))
    }

    fn close(&self, fd: RawFd) {
        *self
            .state
            .lock()
            .unwrap()
            .close_counts
            .entry(fd)
            .or_insert(0) += 1;
    }
}

/// Minimal 64-bit little-endian relocatable-object writer for parser and
/// loader tests.
pub(crate) mod elf_builder {
    use crate::bytes;
    use crate::elf::MAP_DEF_SIZE;

    struct Program {
        name: String,
        insns: Vec<u8>,
        relocations: Vec<(u64, String)>,
    }

    struct MapEntry {
        name: String,
        fields: [u32; 5],
    }

    #[derive(Default)]
    pub struct ElfBuilder {
        programs: Vec<Program>,
        maps: Vec<MapEntry>,
        license: Option<String>,
        version: Option<u32>,
    }

    struct Shdr {
        name_off: u32,
        sh_type: u32,
        flags: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        entsize: u64,
    }

    impl ElfBuilder {
        pub fn new() -> Self {
            ElfBuilder::default()
        }

        pub fn program(mut self, name: &str, insns: &[u8]) -> Self {
            self.programs.push(Program {
                name: name.to_string(),
                insns: insns.to_vec(),
                relocations: Vec::new(),
            });
            self
        }

        pub fn map(
            mut self,
            name: &str,
            map_type: u32,
            key_size: u32,
            value_size: u32,
            max_entries: u32,
            flags: u32,
        ) -> Self {
            self.maps.push(MapEntry {
                name: name.to_string(),
                fields: [map_type, key_size, value_size, max_entries, flags],
            });
            self
        }

        /// RELA entry rewriting the instruction at `insn_offset` bytes
        /// into `program` with the fd of `map`.
        pub fn relocation(mut self, program: &str, insn_offset: u64, map: &str) -> Self {
            let target = self
                .programs
                .iter_mut()
                .find(|p| p.name == program)
                .expect("relocation names a known program section");
            target.relocations.push((insn_offset, map.to_string()));
            self
        }

        pub fn license(mut self, license: &str) -> Self {
            self.license = Some(license.to_string());
            self
        }

        pub fn version(mut self, version: u32) -> Self {
            self.version = Some(version);
            self
        }

        pub fn build(self) -> Vec<u8> {
            // Section order: NULL, programs, maps?, license?, symtab,
            // strtab, shstrtab, then one RELA section per program that
            // has relocations.
            let mut shstrtab: Vec<u8> = vec![0];
            let mut name_off = |name: &str, table: &mut Vec<u8>| -> u32 {
                let off = table.len() as u32;
                table.extend_from_slice(name.as_bytes());
                table.push(0);
                off
            };

            // Symbol string table and symbol records. Symbol 0 is the
            // null symbol; map symbols follow in declaration order.
            let mut strtab: Vec<u8> = vec![0];
            let mut symtab: Vec<u8> = vec![0; 24];
            let maps_section_index: u16 = if self.maps.is_empty() {
                0
            } else {
                (1 + self.programs.len()) as u16
            };
            let mut map_symbol_index = std::collections::HashMap::new();
            for (i, map) in self.maps.iter().enumerate() {
                let sym_name = name_off(&map.name, &mut strtab);
                let mut sym = [0u8; 24];
                bytes::put_u32(&mut sym, 0, sym_name);
                bytes::put_u16(&mut sym, 6, maps_section_index);
                bytes::put_u64(&mut sym, 8, (i * MAP_DEF_SIZE) as u64);
                symtab.extend_from_slice(&sym);
                map_symbol_index.insert(map.name.clone(), (i + 1) as u64);
            }

            let mut maps_data = Vec::new();
            for map in &self.maps {
                let mut entry = [0u8; MAP_DEF_SIZE];
                for (i, field) in map.fields.iter().enumerate() {
                    bytes::put_u32(&mut entry, i * 4, *field);
                }
                maps_data.extend_from_slice(&entry);
            }

            struct PendingSection {
                name: String,
                sh_type: u32,
                flags: u64,
                data: Vec<u8>,
                link: u32,
                info: u32,
                entsize: u64,
            }
            let mut pending: Vec<PendingSection> = Vec::new();
            pending.push(PendingSection {
                name: String::new(),
                sh_type: 0,
                flags: 0,
                data: Vec::new(),
                link: 0,
                info: 0,
                entsize: 0,
            });
            for program in &self.programs {
                pending.push(PendingSection {
                    name: program.name.clone(),
                    sh_type: 1, // PROGBITS
                    flags: 0x6, // ALLOC | EXECINSTR
                    data: program.insns.clone(),
                    link: 0,
                    info: 0,
                    entsize: 0,
                });
            }
            if !self.maps.is_empty() {
                pending.push(PendingSection {
                    name: "maps".to_string(),
                    sh_type: 1,
                    flags: 0x2,
                    data: maps_data,
                    link: 0,
                    info: 0,
                    entsize: 0,
                });
            }
            if let Some(license) = &self.license {
                let mut data = license.as_bytes().to_vec();
                data.push(0);
                pending.push(PendingSection {
                    name: "license".to_string(),
                    sh_type: 1,
                    flags: 0x2,
                    data,
                    link: 0,
                    info: 0,
                    entsize: 0,
                });
            }
            if let Some(version) = self.version {
                pending.push(PendingSection {
                    name: "version".to_string(),
                    sh_type: 1,
                    flags: 0x2,
                    data: version.to_le_bytes().to_vec(),
                    link: 0,
                    info: 0,
                    entsize: 0,
                });
            }
            let symtab_index = pending.len() as u32;
            let strtab_index = symtab_index + 1;
            pending.push(PendingSection {
                name: ".symtab".to_string(),
                sh_type: 2,
                flags: 0,
                data: symtab,
                link: strtab_index,
                info: 0,
                entsize: 24,
            });
            pending.push(PendingSection {
                name: ".strtab".to_string(),
                sh_type: 3,
                flags: 0,
                data: strtab,
                link: 0,
                info: 0,
                entsize: 0,
            });
            let shstrtab_index = pending.len();
            pending.push(PendingSection {
                name: ".shstrtab".to_string(),
                sh_type: 3,
                flags: 0,
                data: Vec::new(), // filled after names are interned
                link: 0,
                info: 0,
                entsize: 0,
            });
            for (prog_index, program) in self.programs.iter().enumerate() {
                if program.relocations.is_empty() {
                    continue;
                }
                let mut data = Vec::new();
                for (offset, map_name) in &program.relocations {
                    let sym = map_symbol_index
                        .get(map_name)
                        .expect("relocation names a declared map");
                    let mut rela = [0u8; 24];
                    bytes::put_u64(&mut rela, 0, *offset);
                    // R_BPF_64_64 = 1 in the low half of r_info.
                    bytes::put_u64(&mut rela, 8, (*sym << 32) | 1);
                    data.extend_from_slice(&rela);
                }
                pending.push(PendingSection {
                    name: format!(".rel{}", program.name),
                    sh_type: 4,
                    flags: 0,
                    data,
                    link: symtab_index,
                    info: (1 + prog_index) as u32,
                    entsize: 24,
                });
            }

            // Intern the section names, then lay out data and headers.
            let mut headers: Vec<Shdr> = Vec::new();
            let names: Vec<u32> = pending
                .iter()
                .map(|s| {
                    if s.name.is_empty() {
                        0
                    } else {
                        name_off(&s.name, &mut shstrtab)
                    }
                })
                .collect();
            pending[shstrtab_index].data = shstrtab;

            let mut out = vec![0u8; 64];
            for (section, name) in pending.iter().zip(&names) {
                let offset = out.len() as u64;
                out.extend_from_slice(&section.data);
                headers.push(Shdr {
                    name_off: *name,
                    sh_type: section.sh_type,
                    flags: section.flags,
                    offset,
                    size: section.data.len() as u64,
                    link: section.link,
                    info: section.info,
                    entsize: section.entsize,
                });
            }

            let shoff = out.len();
            for header in &headers {
                let mut shdr = [0u8; 64];
                bytes::put_u32(&mut shdr, 0, header.name_off);
                bytes::put_u32(&mut shdr, 4, header.sh_type);
                bytes::put_u64(&mut shdr, 8, header.flags);
                bytes::put_u64(&mut shdr, 24, header.offset);
                bytes::put_u64(&mut shdr, 32, header.size);
                bytes::put_u32(&mut shdr, 40, header.link);
                bytes::put_u32(&mut shdr, 44, header.info);
                bytes::put_u64(&mut shdr, 56, header.entsize);
                out.extend_from_slice(&shdr);
            }

            // ELF header: magic, 64-bit LE, ET_REL for EM_BPF.
            out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
            out[4] = 2;
            out[5] = 1;
            out[6] = 1;
            bytes::put_u16(&mut out, 16, 1); // e_type = ET_REL
            bytes::put_u16(&mut out, 18, 247); // e_machine = EM_BPF
            bytes::put_u32(&mut out, 20, 1); // e_version
            bytes::put_u64(&mut out, 40, shoff as u64);
            bytes::put_u16(&mut out, 52, 64); // e_ehsize
            bytes::put_u16(&mut out, 58, 64); // e_shentsize
            bytes::put_u16(&mut out, 60, headers.len() as u16);
            bytes::put_u16(&mut out, 62, shstrtab_index as u16);
            out
        }
    }
}
