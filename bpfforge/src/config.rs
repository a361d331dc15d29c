// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

use std::str::FromStr;

use serde::Deserialize;

use crate::errors::ParseError;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    verifier: Option<VerifierConfig>,
    netlink: Option<NetlinkConfig>,
}

impl Config {
    pub(crate) fn verifier(&self) -> VerifierConfig {
        self.verifier.clone().unwrap_or_default()
    }

    pub(crate) fn netlink(&self) -> NetlinkConfig {
        self.netlink.clone().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerifierConfig {
    pub log_size_small: u32,
    pub log_size_large: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            // Enough for most rejection logs without a retry
            log_size_small: 64 * 1024,
            // The verifier truncates rather than failing when this is hit
            log_size_large: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetlinkConfig {
    pub recv_buf_size: usize,
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            recv_buf_size: 4096,
        }
    }
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(ParseError::ConfigParseError)
    }
}
