// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Attachment manager: raw tracepoints, cgroup hooks and LSM hooks.
//!
//! Every attachment yields a [`LinkDescriptor`]; closing the descriptor
//! detaches. XDP and TC ride over netlink instead of `bpf(2)` and live in
//! [`crate::netlink`]. Kprobe attachment is a known-unimplemented path:
//! the kprobe_multi link and the legacy perf_event_open route both have
//! unresolved attr-layout problems, so raw tracepoints are the supported
//! way to trace kernel functions.

use std::{os::fd::RawFd, path::Path, sync::Arc};

use log::{debug, info, warn};
use nix::{
    fcntl::{self, OFlag},
    sys::stat::Mode,
};

use crate::{
    arena::SyscallArena,
    errors::{BpfForgeError, ParseError},
    syscall::{self, BpfCmd, Syscall},
    utils,
};

/// Kernel attach type numbers for the hooks this crate drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AttachType {
    CgroupInetIngress = 0,
    CgroupInetEgress = 1,
    CgroupInetSockCreate = 2,
    CgroupSockOps = 3,
    CgroupDevice = 6,
    CgroupSysctl = 18,
    CgroupGetsockopt = 21,
    CgroupSetsockopt = 22,
    TraceRawTp = 23,
    LsmMac = 27,
    Xdp = 37,
}

impl TryFrom<&str> for AttachType {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(match value {
            "cgroup_inet_ingress" => AttachType::CgroupInetIngress,
            "cgroup_inet_egress" => AttachType::CgroupInetEgress,
            "cgroup_inet_sock_create" => AttachType::CgroupInetSockCreate,
            "cgroup_sock_ops" => AttachType::CgroupSockOps,
            "cgroup_device" => AttachType::CgroupDevice,
            "cgroup_sysctl" => AttachType::CgroupSysctl,
            "cgroup_getsockopt" => AttachType::CgroupGetsockopt,
            "cgroup_setsockopt" => AttachType::CgroupSetsockopt,
            "trace_raw_tp" => AttachType::TraceRawTp,
            "lsm_mac" => AttachType::LsmMac,
            "xdp" => AttachType::Xdp,
            other => {
                return Err(ParseError::InvalidAttachType {
                    attach: other.to_string(),
                });
            }
        })
    }
}

/// Cgroup attach flags; `Multi` is what program chains want.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CgroupAttachFlag {
    #[default]
    None = 0,
    AllowOverride = 1,
    AllowMulti = 2,
    Replace = 4,
}

/// What a link descriptor is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    RawTracepoint,
    Cgroup,
    Lsm,
    NetlinkXdp,
    Tc,
}

/// An active attachment. For bpf-link based kinds (`RawTracepoint`,
/// `Lsm`) the fd is the kernel link object and closing it detaches. For
/// legacy cgroup attachments the fd is the held cgroup directory and a
/// detach command is issued before it is closed.
#[derive(Debug)]
pub struct LinkDescriptor {
    fd: RawFd,
    kind: LinkKind,
    target: String,
    prog_fd: RawFd,
    attach_type: Option<AttachType>,
    closed: bool,
    sys: Arc<dyn Syscall>,
}

impl LinkDescriptor {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn prog_fd(&self) -> RawFd {
        self.prog_fd
    }

    /// Detach and release. Idempotent; a second close is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.kind == LinkKind::Cgroup {
            if let Some(attach_type) = self.attach_type {
                let mut attr =
                    syscall::pack_prog_detach(self.fd, self.prog_fd, attach_type as u32);
                if let Err(e) = self.sys.bpf(BpfCmd::ProgDetach, attr.as_mut_slice()) {
                    warn!("detach from {} failed: {e}", self.target);
                }
            }
        }
        debug!("closing {:?} link to {}", self.kind, self.target);
        self.sys.close(self.fd);
    }
}

impl Drop for LinkDescriptor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Attach `prog_fd` to a raw tracepoint by event name (no path), e.g.
/// `sched_switch`.
pub(crate) fn open_raw_tracepoint(
    sys: Arc<dyn Syscall>,
    name: &str,
    prog_fd: RawFd,
) -> Result<LinkDescriptor, BpfForgeError> {
    let mut arena = SyscallArena::new();
    let name_slot = arena.alloc_cstr(name);
    let mut attr = syscall::pack_raw_tracepoint_open(arena.addr(name_slot), prog_fd);
    let fd = sys.bpf(BpfCmd::RawTracepointOpen, attr.as_mut_slice())? as RawFd;
    info!("attached raw tracepoint {name:?} (link fd {fd})");
    Ok(LinkDescriptor {
        fd,
        kind: LinkKind::RawTracepoint,
        target: name.to_string(),
        prog_fd,
        attach_type: None,
        closed: false,
        sys,
    })
}

/// Attach `prog_fd` to a cgroup-v2 directory. The directory stays open
/// for the life of the link so the detach path has a target fd.
pub(crate) fn attach_cgroup(
    sys: Arc<dyn Syscall>,
    cgroup_path: &Path,
    prog_fd: RawFd,
    attach_type: AttachType,
    flag: CgroupAttachFlag,
) -> Result<LinkDescriptor, BpfForgeError> {
    let cgroup_fd = fcntl::open(
        cgroup_path,
        OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| {
        BpfForgeError::Error(format!(
            "unable to open cgroup {}: {e}",
            cgroup_path.display()
        ))
    })?;

    let mut attr = syscall::pack_prog_attach(cgroup_fd, prog_fd, attach_type as u32, flag as u32);
    if let Err(e) = sys.bpf(BpfCmd::ProgAttach, attr.as_mut_slice()) {
        sys.close(cgroup_fd);
        return Err(e);
    }
    let target = utils::path_to_string(cgroup_path)?;
    info!("attached prog fd {prog_fd} to cgroup {target} ({attach_type:?})");
    Ok(LinkDescriptor {
        fd: cgroup_fd,
        kind: LinkKind::Cgroup,
        target,
        prog_fd,
        attach_type: Some(attach_type),
        closed: false,
        sys,
    })
}

/// Create a BPF link for an LSM program. The hook itself was fixed at
/// load time; detaching is closing the returned link.
pub(crate) fn attach_lsm(
    sys: Arc<dyn Syscall>,
    hook: &str,
    prog_fd: RawFd,
) -> Result<LinkDescriptor, BpfForgeError> {
    let mut attr = syscall::pack_link_create(prog_fd, 0, AttachType::LsmMac as u32, 0);
    let fd = sys.bpf(BpfCmd::LinkCreate, attr.as_mut_slice())? as RawFd;
    info!("attached LSM hook {hook:?} (link fd {fd})");
    Ok(LinkDescriptor {
        fd,
        kind: LinkKind::Lsm,
        target: hook.to_string(),
        prog_fd,
        attach_type: Some(AttachType::LsmMac),
        closed: false,
        sys,
    })
}

/// Kprobe attachment is not implemented: the kprobe_multi link create
/// fails with EINVAL and the perf_event_open fallback with EAGAIN on the
/// kernels this was developed against. Use raw tracepoints instead.
pub(crate) fn attach_kprobe(_symbol: &str, _prog_fd: RawFd) -> Result<LinkDescriptor, BpfForgeError> {
    Err(BpfForgeError::NotSupported(
        "kprobe attachment; attach a raw tracepoint instead",
    ))
}
