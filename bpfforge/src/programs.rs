// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Program loading and ownership.
//!
//! A loaded program is a kernel object addressed by fd; the kernel never
//! hands back mutable state, so the descriptor here is load parameters
//! plus the owned fd. Verifier rejections surface the log tail.

use std::{collections::HashMap, os::fd::RawFd, path::Path, sync::Arc};

use log::{debug, info};

use crate::{
    arena::SyscallArena,
    config::VerifierConfig,
    elf::ElfObject,
    errors::{BpfForgeError, ParseError},
    maps::{MapHandle, MapSpec, MapType},
    syscall::{self, BpfCmd, Syscall},
    utils,
};

/// Kernel program type numbers. Kretprobes load as [`Kprobe`]; the return
/// direction is an attach-time property.
///
/// [`Kprobe`]: ProgramType::Kprobe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProgramType {
    Unspec = 0,
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    CgroupSkb = 8,
    CgroupSock = 9,
    LwtIn = 10,
    LwtOut = 11,
    LwtXmit = 12,
    SockOps = 13,
    SkSkb = 14,
    CgroupDevice = 15,
    SkMsg = 16,
    RawTracepoint = 17,
    CgroupSockAddr = 18,
    LwtSeg6local = 19,
    LircMode2 = 20,
    SkReuseport = 21,
    FlowDissector = 22,
    CgroupSysctl = 23,
    RawTracepointWritable = 24,
    CgroupSockopt = 25,
    Tracing = 26,
    StructOps = 27,
    Ext = 28,
    Lsm = 29,
    SkLookup = 30,
    Syscall = 31,
}

impl TryFrom<u32> for ProgramType {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ProgramType::Unspec,
            1 => ProgramType::SocketFilter,
            2 => ProgramType::Kprobe,
            3 => ProgramType::SchedCls,
            4 => ProgramType::SchedAct,
            5 => ProgramType::Tracepoint,
            6 => ProgramType::Xdp,
            7 => ProgramType::PerfEvent,
            8 => ProgramType::CgroupSkb,
            9 => ProgramType::CgroupSock,
            10 => ProgramType::LwtIn,
            11 => ProgramType::LwtOut,
            12 => ProgramType::LwtXmit,
            13 => ProgramType::SockOps,
            14 => ProgramType::SkSkb,
            15 => ProgramType::CgroupDevice,
            16 => ProgramType::SkMsg,
            17 => ProgramType::RawTracepoint,
            18 => ProgramType::CgroupSockAddr,
            19 => ProgramType::LwtSeg6local,
            20 => ProgramType::LircMode2,
            21 => ProgramType::SkReuseport,
            22 => ProgramType::FlowDissector,
            23 => ProgramType::CgroupSysctl,
            24 => ProgramType::RawTracepointWritable,
            25 => ProgramType::CgroupSockopt,
            26 => ProgramType::Tracing,
            27 => ProgramType::StructOps,
            28 => ProgramType::Ext,
            29 => ProgramType::Lsm,
            30 => ProgramType::SkLookup,
            31 => ProgramType::Syscall,
            other => {
                return Err(ParseError::InvalidProgramType {
                    program: other.to_string(),
                });
            }
        })
    }
}

impl TryFrom<&str> for ProgramType {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(match value {
            "socket_filter" => ProgramType::SocketFilter,
            "kprobe" | "kretprobe" => ProgramType::Kprobe,
            "sched_cls" | "tc" => ProgramType::SchedCls,
            "sched_act" => ProgramType::SchedAct,
            "tracepoint" => ProgramType::Tracepoint,
            "xdp" => ProgramType::Xdp,
            "perf_event" => ProgramType::PerfEvent,
            "cgroup_skb" => ProgramType::CgroupSkb,
            "cgroup_sock" => ProgramType::CgroupSock,
            "sock_ops" => ProgramType::SockOps,
            "sk_skb" => ProgramType::SkSkb,
            "cgroup_device" => ProgramType::CgroupDevice,
            "sk_msg" => ProgramType::SkMsg,
            "raw_tracepoint" => ProgramType::RawTracepoint,
            "cgroup_sysctl" => ProgramType::CgroupSysctl,
            "cgroup_sockopt" => ProgramType::CgroupSockopt,
            "lsm" => ProgramType::Lsm,
            other => {
                return Err(ParseError::InvalidProgramType {
                    program: other.to_string(),
                });
            }
        })
    }
}

/// `BPF_LSM_MAC`; LSM programs declare it at load time.
const BPF_LSM_MAC: u32 = 27;

/// How much verifier output to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    None,
    Small,
    Large,
}

impl LogLevel {
    fn level(self) -> u32 {
        match self {
            LogLevel::None => 0,
            LogLevel::Small => 1,
            LogLevel::Large => 2,
        }
    }

    fn buf_size(self, config: &VerifierConfig) -> usize {
        match self {
            LogLevel::None => 0,
            LogLevel::Small => config.log_size_small as usize,
            LogLevel::Large => config.log_size_large as usize,
        }
    }
}

/// An owned, loaded program.
#[derive(Debug)]
pub struct ProgramDescriptor {
    fd: RawFd,
    prog_type: ProgramType,
    name: String,
    insn_count: u32,
    license: String,
    owned: bool,
    closed: bool,
    sys: Arc<dyn Syscall>,
}

impl ProgramDescriptor {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn prog_type(&self) -> ProgramType {
        self.prog_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insn_count(&self) -> u32 {
        self.insn_count
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn pin(&self, path: &Path) -> Result<(), BpfForgeError> {
        let mut arena = SyscallArena::new();
        let path_slot = arena.alloc_cstr(&utils::path_to_string(path)?);
        let mut attr = syscall::pack_obj_pin(arena.addr(path_slot), self.fd);
        self.sys.bpf(BpfCmd::ObjPin, attr.as_mut_slice())?;
        info!("pinned program {:?} at {}", self.name, path.display());
        Ok(())
    }

    /// Close the owned fd. Idempotent; unloading happens kernel-side once
    /// the last reference (including links) is gone.
    pub fn close(&mut self) {
        if self.owned && !self.closed {
            self.closed = true;
            self.sys.close(self.fd);
        }
    }
}

impl Drop for ProgramDescriptor {
    fn drop(&mut self) {
        self.close();
    }
}

// Kernel object names accept [0-9A-Za-z_.]; section names carry slashes.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn log_tail(log: &[u8]) -> String {
    let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
    let text = String::from_utf8_lossy(&log[..end]);
    let text = text.trim_end();
    const TAIL: usize = 4096;
    match text.char_indices().nth_back(TAIL) {
        Some((at, _)) => text[at..].to_string(),
        None => text.to_string(),
    }
}

/// Load `bytecode` and take ownership of the resulting fd. On rejection
/// the verifier log tail rides along in the error.
pub(crate) fn load_program(
    sys: Arc<dyn Syscall>,
    config: &VerifierConfig,
    prog_type: ProgramType,
    bytecode: &[u8],
    license: &str,
    name: &str,
    log_level: LogLevel,
) -> Result<ProgramDescriptor, BpfForgeError> {
    if bytecode.is_empty() || bytecode.len() % 8 != 0 {
        return Err(BpfForgeError::Error(format!(
            "bytecode length {} is not a positive multiple of 8",
            bytecode.len()
        )));
    }
    let insn_count = (bytecode.len() / 8) as u32;
    let name = sanitize_name(name);

    let mut arena = SyscallArena::new();
    let insns_slot = arena.alloc_from(bytecode);
    let license_slot = arena.alloc_cstr(license);
    let log_slot = arena.alloc_zeroed(log_level.buf_size(config));

    let expected_attach_type = match prog_type {
        ProgramType::Lsm => BPF_LSM_MAC,
        _ => 0,
    };
    let mut attr = syscall::pack_prog_load(
        prog_type as u32,
        arena.addr(insns_slot),
        insn_count,
        arena.addr(license_slot),
        log_level.level(),
        arena.addr(log_slot),
        log_level.buf_size(config) as u32,
        &name,
        expected_attach_type,
    );

    debug!("loading {prog_type:?} program {name:?} ({insn_count} insns)");
    match sys.bpf(BpfCmd::ProgLoad, attr.as_mut_slice()) {
        Ok(fd) => {
            info!("loaded program {name:?} with fd {fd}");
            Ok(ProgramDescriptor {
                fd: fd as RawFd,
                prog_type,
                name,
                insn_count,
                license: license.to_string(),
                owned: true,
                closed: false,
                sys,
            })
        }
        Err(BpfForgeError::Kernel(kernel)) => {
            let excerpt = log_tail(arena.bytes(log_slot));
            if excerpt.is_empty() {
                Err(kernel.into())
            } else {
                Err(BpfForgeError::Verifier {
                    source: kernel,
                    log_excerpt: excerpt,
                })
            }
        }
        Err(other) => Err(other),
    }
}

/// Everything a parsed object yields once loaded: programs keyed by their
/// section names, maps keyed by their symbol names.
#[derive(Debug)]
pub struct LoadedObject {
    pub programs: Vec<ProgramDescriptor>,
    pub maps: HashMap<String, MapHandle>,
}

/// Parse a relocatable object, create its maps, apply map-fd relocations
/// and load every program section.
pub(crate) fn load_object(
    sys: Arc<dyn Syscall>,
    config: &VerifierConfig,
    data: &[u8],
    log_level: LogLevel,
) -> Result<LoadedObject, BpfForgeError> {
    let object = ElfObject::parse(data)?;

    let mut maps = HashMap::new();
    let mut map_fds = HashMap::new();
    for def in &object.maps {
        let spec = MapSpec::new(
            MapType::try_from(def.map_type)?,
            def.name.clone(),
            def.key_size,
            def.value_size,
            def.max_entries,
        )
        .with_flags(def.flags);
        let map = MapHandle::create(sys.clone(), spec)?;
        map_fds.insert(def.name.clone(), map.fd());
        maps.insert(def.name.clone(), map);
    }

    let mut programs = Vec::new();
    for parsed in &object.programs {
        let mut program = parsed.clone();
        object.apply_map_relocations(&mut program, &map_fds)?;
        programs.push(load_program(
            sys.clone(),
            config,
            program.prog_type,
            &program.insns,
            &object.license,
            &program.name,
            log_level,
        )?);
    }

    Ok(LoadedObject { programs, maps })
}
