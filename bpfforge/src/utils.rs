// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

use std::{fs, path::Path};

use anyhow::Context;
use log::{debug, info, warn};
use nix::{
    libc::RLIM_INFINITY,
    mount::{MsFlags, mount},
    net::if_::if_nametoindex,
    sys::resource::{Resource, setrlimit},
    unistd::{SysconfVar, sysconf},
};

use crate::{config::Config, errors::BpfForgeError};

pub(crate) const CFGPATH_BPFFORGE_CONFIG: &str = "/etc/bpfforge/bpfforge.toml";

/// Resolve an interface name to the index netlink attachment wants.
pub fn get_ifindex(iface: &str) -> Result<u32, BpfForgeError> {
    match if_nametoindex(iface) {
        Ok(index) => {
            debug!("Map {} to {}", iface, index);
            Ok(index)
        }
        Err(_) => {
            info!("Unable to validate interface {}", iface);
            Err(BpfForgeError::Error(format!(
                "invalid interface {iface}"
            )))
        }
    }
}

/// Raise RLIMIT_MEMLOCK so map and program allocations are not rejected
/// on kernels that still charge BPF memory against it.
pub fn bump_memlock_rlimit() -> anyhow::Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
        .context("failed to raise RLIMIT_MEMLOCK")
}

pub fn create_bpffs(directory: &str) -> anyhow::Result<()> {
    debug!("Creating bpffs at {directory}");
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME;
    mount::<str, str, str, str>(None, directory, Some("bpf"), flags, None)
        .with_context(|| format!("unable to create bpffs at {directory}"))
}

pub(crate) fn open_config_file() -> Config {
    if let Ok(contents) = fs::read_to_string(CFGPATH_BPFFORGE_CONFIG) {
        contents.parse().unwrap_or_else(|e| {
            warn!("Unable to parse config file, using defaults: {e}");
            Config::default()
        })
    } else {
        debug!("No config file found, using defaults");
        Config::default()
    }
}

/// Number of possible CPUs, which sizes per-CPU map value buffers. The
/// kernel publishes the range in sysfs, e.g. `0-7`.
pub(crate) fn nr_possible_cpus() -> usize {
    parse_cpu_range(
        fs::read_to_string("/sys/devices/system/cpu/possible")
            .unwrap_or_default()
            .trim(),
    )
    .unwrap_or(1)
}

fn parse_cpu_range(range: &str) -> Option<usize> {
    let last = range.rsplit(&[',', '-'][..]).next()?;
    last.parse::<usize>().ok().map(|n| n + 1)
}

pub(crate) fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

/// Per-CPU values are stored at an 8-byte stride per CPU.
pub(crate) fn roundup8(value: usize) -> usize {
    (value + 7) & !7
}

pub(crate) fn path_to_string(path: &Path) -> Result<String, BpfForgeError> {
    path.to_str()
        .map(String::from)
        .ok_or_else(|| BpfForgeError::Error(format!("non-UTF-8 path {}", path.display())))
}
