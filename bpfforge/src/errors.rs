// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BpfForgeError {
    #[error("invalid instruction: {0}")]
    InvalidInstruction(String),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("verifier rejected program: {source}\n{log_excerpt}")]
    Verifier {
        #[source]
        source: KernelError,
        log_excerpt: String,
    },
    #[error("kernel does not support {0}")]
    NotSupported(&'static str),
    #[error("resource exhausted during {command}: {errno}")]
    ResourceExhausted {
        command: &'static str,
        errno: Errno,
    },
    #[error("invalid map operation: {0}")]
    InvalidMapOperation(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("An error occurred. {0}")]
    Error(String),
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("duplicate label {0:?}")]
    DuplicateLabel(String),
    #[error("jump to undefined label {0:?}")]
    UndefinedLabel(String),
    #[error("jump to {label:?} out of range: offset {offset} does not fit in 16 bits")]
    JumpOutOfRange { label: String, offset: i64 },
}

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("bad ELF magic")]
    Magic,
    #[error("not a 64-bit little-endian object")]
    Class,
    #[error("object truncated reading {0}")]
    Truncated(&'static str),
    #[error("unknown section prefix {0:?}")]
    UnknownSection(String),
    #[error("bad relocation: {0}")]
    BadRelocation(String),
}

/// A failed `bpf(2)` call, carrying the command name, the raw errno and a
/// coarse classification the higher layers dispatch on.
#[derive(Debug, Error)]
#[error("{command} failed: {errno}")]
pub struct KernelError {
    pub command: &'static str,
    pub errno: Errno,
    pub kind: KernelErrorKind,
}

impl KernelError {
    pub fn new(command: &'static str, errno: Errno) -> Self {
        KernelError {
            command,
            errno,
            kind: KernelErrorKind::from(errno),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelErrorKind {
    PermissionDenied,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    TryAgain,
    NotSupported,
    OutOfMemory,
    TooBig,
    Other,
}

impl From<Errno> for KernelErrorKind {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EACCES | Errno::EPERM => KernelErrorKind::PermissionDenied,
            Errno::EINVAL => KernelErrorKind::InvalidArgument,
            Errno::ENOENT => KernelErrorKind::NotFound,
            Errno::EEXIST => KernelErrorKind::AlreadyExists,
            Errno::EAGAIN => KernelErrorKind::TryAgain,
            Errno::ENOTSUP | Errno::ENOSYS => KernelErrorKind::NotSupported,
            Errno::ENOMEM => KernelErrorKind::OutOfMemory,
            Errno::E2BIG => KernelErrorKind::TooBig,
            _ => KernelErrorKind::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{program} is not a valid program type")]
    InvalidProgramType { program: String },
    #[error("{map} is not a valid map type")]
    InvalidMapType { map: String },
    #[error("{attach} is not a valid attach type")]
    InvalidAttachType { attach: String },
    #[error("invalid register {register:?}")]
    InvalidRegister { register: String },
    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        assert_eq!(
            KernelErrorKind::from(Errno::EACCES),
            KernelErrorKind::PermissionDenied
        );
        assert_eq!(
            KernelErrorKind::from(Errno::ENOENT),
            KernelErrorKind::NotFound
        );
        assert_eq!(KernelErrorKind::from(Errno::E2BIG), KernelErrorKind::TooBig);
        assert_eq!(KernelErrorKind::from(Errno::EIO), KernelErrorKind::Other);
    }

    #[test]
    fn test_kernel_error_carries_command_and_symbol() {
        let err = KernelError::new("BPF_MAP_CREATE", Errno::EPERM);
        let msg = err.to_string();
        assert!(msg.contains("BPF_MAP_CREATE"));
        assert!(msg.contains("Operation not permitted"));
    }
}
