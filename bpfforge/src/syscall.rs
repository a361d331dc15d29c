// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! The `bpf(2)` bridge.
//!
//! One multiplexed entry point takes `(cmd, attr pointer, attr size)`; the
//! request layout is a per-command packed struct out of the kernel UAPI
//! union. This module owns the command enumeration, the attr field offsets
//! and the errno translation. The [`Syscall`] trait is the seam the test
//! suite substitutes an in-memory kernel through.

use std::os::fd::RawFd;

use log::{debug, warn};
use nix::errno::Errno;

use crate::{
    bytes,
    errors::{BpfForgeError, KernelError},
};

/// Kernel command numbers for `bpf(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BpfCmd {
    MapCreate = 0,
    MapLookupElem = 1,
    MapUpdateElem = 2,
    MapDeleteElem = 3,
    MapGetNextKey = 4,
    ProgLoad = 5,
    ObjPin = 6,
    ObjGet = 7,
    ProgAttach = 8,
    ProgDetach = 9,
    RawTracepointOpen = 17,
    MapLookupAndDeleteElem = 21,
    MapLookupBatch = 24,
    MapLookupAndDeleteBatch = 25,
    MapUpdateBatch = 26,
    MapDeleteBatch = 27,
    LinkCreate = 28,
    LinkDetach = 34,
}

impl BpfCmd {
    pub fn name(&self) -> &'static str {
        match self {
            BpfCmd::MapCreate => "BPF_MAP_CREATE",
            BpfCmd::MapLookupElem => "BPF_MAP_LOOKUP_ELEM",
            BpfCmd::MapUpdateElem => "BPF_MAP_UPDATE_ELEM",
            BpfCmd::MapDeleteElem => "BPF_MAP_DELETE_ELEM",
            BpfCmd::MapGetNextKey => "BPF_MAP_GET_NEXT_KEY",
            BpfCmd::ProgLoad => "BPF_PROG_LOAD",
            BpfCmd::ObjPin => "BPF_OBJ_PIN",
            BpfCmd::ObjGet => "BPF_OBJ_GET",
            BpfCmd::ProgAttach => "BPF_PROG_ATTACH",
            BpfCmd::ProgDetach => "BPF_PROG_DETACH",
            BpfCmd::RawTracepointOpen => "BPF_RAW_TRACEPOINT_OPEN",
            BpfCmd::MapLookupAndDeleteElem => "BPF_MAP_LOOKUP_AND_DELETE_ELEM",
            BpfCmd::MapLookupBatch => "BPF_MAP_LOOKUP_BATCH",
            BpfCmd::MapLookupAndDeleteBatch => "BPF_MAP_LOOKUP_AND_DELETE_BATCH",
            BpfCmd::MapUpdateBatch => "BPF_MAP_UPDATE_BATCH",
            BpfCmd::MapDeleteBatch => "BPF_MAP_DELETE_BATCH",
            BpfCmd::LinkCreate => "BPF_LINK_CREATE",
            BpfCmd::LinkDetach => "BPF_LINK_DETACH",
        }
    }
}

/// A packed `bpf_attr` request. Fields are written at their UAPI offsets
/// into a zeroed buffer; the kernel requires bytes past the fields it
/// knows to be zero, which the zeroed buffer guarantees.
#[derive(Debug)]
pub struct Attr {
    buf: Vec<u8>,
}

impl Attr {
    pub fn zeroed(size: usize) -> Self {
        Attr {
            buf: vec![0u8; size],
        }
    }

    pub fn put_u32(&mut self, off: usize, value: u32) -> &mut Self {
        bytes::put_u32(&mut self.buf, off, value);
        self
    }

    pub fn put_u64(&mut self, off: usize, value: u64) -> &mut Self {
        bytes::put_u64(&mut self.buf, off, value);
        self
    }

    pub fn put_name(&mut self, off: usize, name: &str) -> &mut Self {
        bytes::put_obj_name(&mut self.buf, off, name);
        self
    }

    pub fn u32_at(&self, off: usize) -> u32 {
        bytes::get_u32(&self.buf, off).unwrap_or(0)
    }

    pub fn u64_at(&self, off: usize) -> u64 {
        bytes::get_u64(&self.buf, off).unwrap_or(0)
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

// bpf_attr field offsets, one module per command family.
pub(crate) mod layout {
    // BPF_MAP_CREATE
    pub const MAP_CREATE_SIZE: usize = 48;
    pub const MAP_TYPE: usize = 0;
    pub const MAP_KEY_SIZE: usize = 4;
    pub const MAP_VALUE_SIZE: usize = 8;
    pub const MAP_MAX_ENTRIES: usize = 12;
    pub const MAP_FLAGS: usize = 16;
    pub const MAP_NAME: usize = 28;

    // Element commands (lookup/update/delete/get_next_key/lookup_and_delete)
    pub const ELEM_SIZE: usize = 32;
    pub const ELEM_MAP_FD: usize = 0;
    pub const ELEM_KEY: usize = 8;
    pub const ELEM_VALUE: usize = 16;
    pub const ELEM_FLAGS: usize = 24;

    // Batch commands
    pub const BATCH_SIZE: usize = 56;
    pub const BATCH_IN: usize = 0;
    pub const BATCH_OUT: usize = 8;
    pub const BATCH_KEYS: usize = 16;
    pub const BATCH_VALUES: usize = 24;
    pub const BATCH_COUNT: usize = 32;
    pub const BATCH_MAP_FD: usize = 36;
    pub const BATCH_ELEM_FLAGS: usize = 40;

    // BPF_PROG_LOAD
    pub const PROG_LOAD_SIZE: usize = 72;
    pub const PROG_TYPE: usize = 0;
    pub const PROG_INSN_CNT: usize = 4;
    pub const PROG_INSNS: usize = 8;
    pub const PROG_LICENSE: usize = 16;
    pub const PROG_LOG_LEVEL: usize = 24;
    pub const PROG_LOG_SIZE: usize = 28;
    pub const PROG_LOG_BUF: usize = 32;
    pub const PROG_NAME: usize = 48;
    pub const PROG_EXPECTED_ATTACH_TYPE: usize = 68;

    // BPF_OBJ_PIN / BPF_OBJ_GET
    pub const OBJ_SIZE: usize = 16;
    pub const OBJ_PATHNAME: usize = 0;
    pub const OBJ_BPF_FD: usize = 8;

    // BPF_PROG_ATTACH / BPF_PROG_DETACH
    pub const ATTACH_SIZE: usize = 20;
    pub const ATTACH_TARGET_FD: usize = 0;
    pub const ATTACH_BPF_FD: usize = 4;
    pub const ATTACH_TYPE: usize = 8;
    pub const ATTACH_FLAGS: usize = 12;

    // BPF_RAW_TRACEPOINT_OPEN
    pub const RAW_TP_SIZE: usize = 16;
    pub const RAW_TP_NAME: usize = 0;
    pub const RAW_TP_PROG_FD: usize = 8;

    // BPF_LINK_CREATE
    pub const LINK_CREATE_SIZE: usize = 16;
    pub const LINK_PROG_FD: usize = 0;
    pub const LINK_TARGET_FD: usize = 4;
    pub const LINK_ATTACH_TYPE: usize = 8;
    pub const LINK_FLAGS: usize = 12;
}

pub fn pack_map_create(
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    flags: u32,
    name: &str,
) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(MAP_CREATE_SIZE);
    attr.put_u32(MAP_TYPE, map_type)
        .put_u32(MAP_KEY_SIZE, key_size)
        .put_u32(MAP_VALUE_SIZE, value_size)
        .put_u32(MAP_MAX_ENTRIES, max_entries)
        .put_u32(MAP_FLAGS, flags)
        .put_name(MAP_NAME, name);
    attr
}

pub fn pack_map_elem(map_fd: RawFd, key: u64, value: u64, flags: u64) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(ELEM_SIZE);
    attr.put_u32(ELEM_MAP_FD, map_fd as u32)
        .put_u64(ELEM_KEY, key)
        .put_u64(ELEM_VALUE, value)
        .put_u64(ELEM_FLAGS, flags);
    attr
}

#[allow(clippy::too_many_arguments)]
pub fn pack_map_batch(
    map_fd: RawFd,
    in_batch: u64,
    out_batch: u64,
    keys: u64,
    values: u64,
    count: u32,
    elem_flags: u64,
) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(BATCH_SIZE);
    attr.put_u64(BATCH_IN, in_batch)
        .put_u64(BATCH_OUT, out_batch)
        .put_u64(BATCH_KEYS, keys)
        .put_u64(BATCH_VALUES, values)
        .put_u32(BATCH_COUNT, count)
        .put_u32(BATCH_MAP_FD, map_fd as u32)
        .put_u64(BATCH_ELEM_FLAGS, elem_flags);
    attr
}

#[allow(clippy::too_many_arguments)]
pub fn pack_prog_load(
    prog_type: u32,
    insns: u64,
    insn_cnt: u32,
    license: u64,
    log_level: u32,
    log_buf: u64,
    log_size: u32,
    name: &str,
    expected_attach_type: u32,
) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(PROG_LOAD_SIZE);
    attr.put_u32(PROG_TYPE, prog_type)
        .put_u32(PROG_INSN_CNT, insn_cnt)
        .put_u64(PROG_INSNS, insns)
        .put_u64(PROG_LICENSE, license)
        .put_u32(PROG_LOG_LEVEL, log_level)
        .put_u32(PROG_LOG_SIZE, log_size)
        .put_u64(PROG_LOG_BUF, log_buf)
        .put_name(PROG_NAME, name)
        .put_u32(PROG_EXPECTED_ATTACH_TYPE, expected_attach_type);
    attr
}

pub fn pack_obj_pin(pathname: u64, fd: RawFd) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(OBJ_SIZE);
    attr.put_u64(OBJ_PATHNAME, pathname)
        .put_u32(OBJ_BPF_FD, fd as u32);
    attr
}

pub fn pack_obj_get(pathname: u64) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(OBJ_SIZE);
    attr.put_u64(OBJ_PATHNAME, pathname);
    attr
}

pub fn pack_prog_attach(target_fd: RawFd, prog_fd: RawFd, attach_type: u32, flags: u32) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(ATTACH_SIZE);
    attr.put_u32(ATTACH_TARGET_FD, target_fd as u32)
        .put_u32(ATTACH_BPF_FD, prog_fd as u32)
        .put_u32(ATTACH_TYPE, attach_type)
        .put_u32(ATTACH_FLAGS, flags);
    attr
}

pub fn pack_prog_detach(target_fd: RawFd, prog_fd: RawFd, attach_type: u32) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(ATTACH_SIZE);
    attr.put_u32(ATTACH_TARGET_FD, target_fd as u32)
        .put_u32(ATTACH_BPF_FD, prog_fd as u32)
        .put_u32(ATTACH_TYPE, attach_type);
    attr
}

pub fn pack_raw_tracepoint_open(name: u64, prog_fd: RawFd) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(RAW_TP_SIZE);
    attr.put_u64(RAW_TP_NAME, name)
        .put_u32(RAW_TP_PROG_FD, prog_fd as u32);
    attr
}

pub fn pack_link_create(prog_fd: RawFd, target_fd: RawFd, attach_type: u32, flags: u32) -> Attr {
    use layout::*;
    let mut attr = Attr::zeroed(LINK_CREATE_SIZE);
    attr.put_u32(LINK_PROG_FD, prog_fd as u32)
        .put_u32(LINK_TARGET_FD, target_fd as u32)
        .put_u32(LINK_ATTACH_TYPE, attach_type)
        .put_u32(LINK_FLAGS, flags);
    attr
}

/// The kernel entry point, substitutable for tests.
pub trait Syscall: std::fmt::Debug + Send + Sync {
    /// Issue one `bpf(2)` call. The attr buffer is mutable because several
    /// commands (batch ops, get_next_key) write results back into it.
    fn bpf(&self, cmd: BpfCmd, attr: &mut [u8]) -> Result<i64, BpfForgeError>;

    /// Close a descriptor this bridge handed out.
    fn close(&self, fd: RawFd);
}

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxKernel;

impl Syscall for LinuxKernel {
    fn bpf(&self, cmd: BpfCmd, attr: &mut [u8]) -> Result<i64, BpfForgeError> {
        debug!("bpf({}, {} byte attr)", cmd.name(), attr.len());
        loop {
            // SAFETY: attr points at a live buffer of the stated size and
            // every pointer packed inside it refers to arena memory that
            // outlives this call.
            let ret = unsafe {
                nix::libc::syscall(
                    nix::libc::SYS_bpf,
                    cmd as u32,
                    attr.as_mut_ptr(),
                    attr.len() as u32,
                )
            };
            if ret >= 0 {
                return Ok(ret as i64);
            }
            match Errno::last() {
                // bpf(2) never restarts on its own.
                Errno::EINTR => continue,
                errno => return Err(translate_errno(cmd, errno)),
            }
        }
    }

    fn close(&self, fd: RawFd) {
        if let Err(e) = nix::unistd::close(fd) {
            // Close failures on shutdown paths are logged, never fatal.
            warn!("closing fd {fd} failed: {e}");
        }
    }
}

pub(crate) fn translate_errno(cmd: BpfCmd, errno: Errno) -> BpfForgeError {
    match errno {
        Errno::EMFILE | Errno::ENFILE | Errno::ENOSPC => BpfForgeError::ResourceExhausted {
            command: cmd.name(),
            errno,
        },
        errno => KernelError::new(cmd.name(), errno).into(),
    }
}
