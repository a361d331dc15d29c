// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Construct, assemble, load and attach eBPF programs.
//!
//! The crate covers the full path from instructions to running kernel
//! hooks: the [`insn`] encoder emits 8-byte words, [`asm::assemble`]
//! resolves labels into bytecode, [`elf`] reads objects an external
//! compiler produced, and the [`Bpf`] handle drives the kernel through the
//! multiplexed `bpf(2)` entry point to create [maps](maps), load
//! [programs](programs) and attach [links](links). XDP and TC attachment
//! go over rtnetlink via [`netlink::NetlinkManager`].
//!
//! ```no_run
//! use bpfforge::{
//!     Bpf, LogLevel, ProgramType,
//!     asm::assemble,
//!     insn::{Reg, exit, mov64_imm},
//! };
//!
//! # fn main() -> Result<(), bpfforge::BpfForgeError> {
//! // XDP_PASS, the hello world of packet programs.
//! let bytecode = assemble(&[mov64_imm(Reg::R0, 2).into(), exit().into()])?;
//! let bpf = Bpf::new();
//! let program = bpf.load_program(
//!     ProgramType::Xdp,
//!     &bytecode,
//!     "GPL",
//!     "pass",
//!     LogLevel::Small,
//! )?;
//! # let _ = program;
//! # Ok(())
//! # }
//! ```
//!
//! All state lives in kernel objects addressed by fd; descriptors own
//! their fd and release it exactly once. Every syscall packs its request
//! into an arena scoped to the call, so buffers outlive the kernel's use
//! of them and nothing longer.

use std::{os::fd::RawFd, path::Path, sync::Arc};

use log::debug;

pub mod arena;
pub mod asm;
mod bytes;
pub mod config;
pub mod elf;
pub mod errors;
pub mod insn;
pub mod links;
pub mod maps;
pub mod netlink;
pub mod programs;
pub mod ringbuf;
pub mod syscall;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use errors::{BpfForgeError, KernelError, KernelErrorKind};
pub use links::{AttachType, CgroupAttachFlag, LinkDescriptor, LinkKind};
pub use maps::{MapHandle, MapSpec, MapType, UpdateFlag};
pub use netlink::{Direction, NetlinkManager, XdpMode};
pub use programs::{LoadedObject, LogLevel, ProgramDescriptor, ProgramType};
pub use ringbuf::RingBuffer;
pub use syscall::{LinuxKernel, Syscall};

/// Root handle over one [`Syscall`] implementation.
///
/// Cheap to clone conceptually: descriptors created through it keep their
/// own reference to the bridge, so the handle may be dropped first.
#[derive(Debug, Clone)]
pub struct Bpf {
    sys: Arc<dyn Syscall>,
    config: Config,
}

impl Bpf {
    /// A handle over the real kernel, configured from
    /// `/etc/bpfforge/bpfforge.toml` when present.
    pub fn new() -> Self {
        Bpf {
            sys: Arc::new(LinuxKernel),
            config: utils::open_config_file(),
        }
    }

    /// A handle over an injected bridge; how tests substitute an
    /// in-memory kernel.
    pub fn with_syscall(sys: Arc<dyn Syscall>) -> Self {
        Bpf {
            sys,
            config: Config::default(),
        }
    }

    pub fn create_map(&self, spec: MapSpec) -> Result<MapHandle, BpfForgeError> {
        MapHandle::create(self.sys.clone(), spec)
    }

    pub fn map_from_pin(&self, path: &Path, spec: MapSpec) -> Result<MapHandle, BpfForgeError> {
        MapHandle::from_pin(self.sys.clone(), path, spec)
    }

    pub fn load_program(
        &self,
        prog_type: ProgramType,
        bytecode: &[u8],
        license: &str,
        name: &str,
        log_level: LogLevel,
    ) -> Result<ProgramDescriptor, BpfForgeError> {
        programs::load_program(
            self.sys.clone(),
            &self.config.verifier(),
            prog_type,
            bytecode,
            license,
            name,
            log_level,
        )
    }

    /// Parse a relocatable object, create its maps, patch map references
    /// and load every program section.
    pub fn load_object(
        &self,
        data: &[u8],
        log_level: LogLevel,
    ) -> Result<LoadedObject, BpfForgeError> {
        programs::load_object(self.sys.clone(), &self.config.verifier(), data, log_level)
    }

    /// Attach a loaded program to a raw tracepoint, e.g. `sched_switch`.
    pub fn open_raw_tracepoint(
        &self,
        name: &str,
        prog_fd: RawFd,
    ) -> Result<LinkDescriptor, BpfForgeError> {
        links::open_raw_tracepoint(self.sys.clone(), name, prog_fd)
    }

    /// Attach a loaded program to a cgroup-v2 directory.
    pub fn attach_cgroup(
        &self,
        cgroup_path: &Path,
        prog_fd: RawFd,
        attach_type: AttachType,
        flag: CgroupAttachFlag,
    ) -> Result<LinkDescriptor, BpfForgeError> {
        links::attach_cgroup(self.sys.clone(), cgroup_path, prog_fd, attach_type, flag)
    }

    /// Create a link for a loaded LSM program; the hook was fixed at load.
    pub fn attach_lsm(&self, hook: &str, prog_fd: RawFd) -> Result<LinkDescriptor, BpfForgeError> {
        links::attach_lsm(self.sys.clone(), hook, prog_fd)
    }

    /// Known-unimplemented; see [`links`] for the supported alternative.
    pub fn attach_kprobe(
        &self,
        symbol: &str,
        prog_fd: RawFd,
    ) -> Result<LinkDescriptor, BpfForgeError> {
        links::attach_kprobe(symbol, prog_fd)
    }

    /// Load + attach in one step for cgroup hooks.
    pub fn setup_cgroup(
        &self,
        cgroup_path: &Path,
        prog_type: ProgramType,
        bytecode: &[u8],
        license: &str,
        name: &str,
        attach_type: AttachType,
        flag: CgroupAttachFlag,
    ) -> Result<(ProgramDescriptor, LinkDescriptor), BpfForgeError> {
        let program = self.load_program(prog_type, bytecode, license, name, LogLevel::Small)?;
        let link = self.attach_cgroup(cgroup_path, program.fd(), attach_type, flag)?;
        Ok((program, link))
    }

    /// Detach and release a program/link pair: the link closes first so
    /// the program is no longer reachable when its fd goes away.
    pub fn teardown(&self, mut link: LinkDescriptor, mut program: ProgramDescriptor) {
        debug!("tearing down {} -> {}", link.target(), program.name());
        link.close();
        program.close();
    }
}

impl Default for Bpf {
    fn default() -> Self {
        Bpf::new()
    }
}
