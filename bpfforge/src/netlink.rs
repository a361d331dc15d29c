// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! XDP and TC attachment over rtnetlink.
//!
//! Interface-level hooks are not reachable through `bpf(2)`: XDP programs
//! attach with an `RTM_SETLINK` carrying a nested `IFLA_XDP` attribute and
//! TC classifiers hang off a `clsact` qdisc via `RTM_NEWTFILTER`. Qdisc
//! queries go through `netlink-packet-route`; the BPF-specific attributes
//! it does not model are packed with the crate's own byte helpers.

use std::{cell::{Cell, RefCell}, os::fd::RawFd};

use log::{debug, info};
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage,
    NetlinkPayload,
};
use netlink_packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcMessage},
};
use netlink_sys::{Socket, SocketAddr, constants::NETLINK_ROUTE};
use nix::errno::Errno;

use crate::{
    bytes,
    config::NetlinkConfig,
    errors::{BpfForgeError, KernelError},
};

const NLMSG_HDR_SIZE: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const RTM_SETLINK: u16 = 19;
const RTM_NEWQDISC: u16 = 36;
const RTM_NEWTFILTER: u16 = 44;
const RTM_DELTFILTER: u16 = 45;

const NLA_F_NESTED: u16 = 0x8000;

const IFLA_XDP: u16 = 43;
const IFLA_XDP_FD: u16 = 1;
const IFLA_XDP_FLAGS: u16 = 3;

const XDP_FLAGS_UPDATE_IF_NOEXIST: u32 = 1;

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const TCA_BPF_FD: u16 = 6;
const TCA_BPF_NAME: u16 = 7;
const TCA_BPF_FLAGS: u16 = 8;
const TCA_BPF_FLAG_ACT_DIRECT: u32 = 1;

const TC_H_CLSACT: u32 = 0xFFFF_FFF1;
const TC_H_MIN_INGRESS: u32 = 0xFFF2;
const TC_H_MIN_EGRESS: u32 = 0xFFF3;
const CLSACT_HANDLE: u32 = 0xFFFF_0000;

// htons(ETH_P_ALL) in the low 16 bits of tcm_info.
const ETH_P_ALL_BE: u32 = 0x0300;

/// XDP attachment mode; the kernel picks driver offload when the flag
/// allows it and the driver cooperates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum XdpMode {
    /// Generic (skb) mode, available on every driver.
    Skb = 2,
    /// Native driver mode.
    #[default]
    Drv = 4,
    /// Hardware offload.
    Hw = 8,
}

/// Which clsact hook a TC classifier hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn parent(self) -> u32 {
        match self {
            Direction::Ingress => (TC_H_CLSACT & 0xFFFF_0000) | TC_H_MIN_INGRESS,
            Direction::Egress => (TC_H_CLSACT & 0xFFFF_0000) | TC_H_MIN_EGRESS,
        }
    }
}

fn nla(attr_type: u16, payload: &[u8]) -> Vec<u8> {
    let len = 4 + payload.len();
    let mut out = vec![0u8; (len + 3) & !3];
    bytes::put_u16(&mut out, 0, len as u16);
    bytes::put_u16(&mut out, 2, attr_type);
    out[4..4 + payload.len()].copy_from_slice(payload);
    out
}

fn nla_u32(attr_type: u16, value: u32) -> Vec<u8> {
    nla(attr_type, &value.to_le_bytes())
}

fn nla_cstr(attr_type: u16, value: &str) -> Vec<u8> {
    let mut payload = value.as_bytes().to_vec();
    payload.push(0);
    nla(attr_type, &payload)
}

fn nla_nested(attr_type: u16, children: &[u8]) -> Vec<u8> {
    nla(attr_type | NLA_F_NESTED, children)
}

fn netlink_request(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; NLMSG_HDR_SIZE + payload.len()];
    let len = out.len() as u32;
    bytes::put_u32(&mut out, 0, len);
    bytes::put_u16(&mut out, 4, msg_type);
    bytes::put_u16(&mut out, 6, flags);
    bytes::put_u32(&mut out, 8, seq);
    out[NLMSG_HDR_SIZE..].copy_from_slice(payload);
    out
}

// struct ifinfomsg: family, pad, type, index, flags, change.
fn ifinfomsg(if_index: u32) -> Vec<u8> {
    let mut out = vec![0u8; 16];
    bytes::put_u32(&mut out, 4, if_index);
    out
}

// struct tcmsg: family, pads, ifindex, handle, parent, info.
fn tcmsg(if_index: u32, handle: u32, parent: u32, info: u32) -> Vec<u8> {
    let mut out = vec![0u8; 20];
    bytes::put_u32(&mut out, 4, if_index);
    bytes::put_u32(&mut out, 8, handle);
    bytes::put_u32(&mut out, 12, parent);
    bytes::put_u32(&mut out, 16, info);
    out
}

fn xdp_set_payload(if_index: u32, prog_fd: RawFd, flags: u32) -> Vec<u8> {
    let mut children = nla(IFLA_XDP_FD, &(prog_fd as i32).to_le_bytes());
    children.extend_from_slice(&nla_u32(IFLA_XDP_FLAGS, flags));
    let mut payload = ifinfomsg(if_index);
    payload.extend_from_slice(&nla_nested(IFLA_XDP, &children));
    payload
}

fn tc_filter_payload(
    if_index: u32,
    direction: Direction,
    priority: u16,
    prog_fd: Option<(RawFd, &str)>,
) -> Vec<u8> {
    let info = ((priority as u32) << 16) | ETH_P_ALL_BE;
    let mut payload = tcmsg(if_index, 0, direction.parent(), info);
    if let Some((fd, name)) = prog_fd {
        payload.extend_from_slice(&nla_cstr(TCA_KIND, "bpf"));
        let mut options = nla(TCA_BPF_FD, &(fd as i32).to_le_bytes());
        options.extend_from_slice(&nla_cstr(TCA_BPF_NAME, name));
        options.extend_from_slice(&nla_u32(TCA_BPF_FLAGS, TCA_BPF_FLAG_ACT_DIRECT));
        payload.extend_from_slice(&nla_nested(TCA_OPTIONS, &options));
    }
    payload
}

/// One route-netlink socket driving XDP and TC attachment.
pub struct NetlinkManager {
    sock: RefCell<Socket>,
    seq: Cell<u32>,
    recv_buf_size: usize,
}

impl NetlinkManager {
    pub fn new() -> Result<Self, BpfForgeError> {
        Self::with_config(&NetlinkConfig::default())
    }

    pub fn with_config(config: &NetlinkConfig) -> Result<Self, BpfForgeError> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(NetlinkManager {
            sock: RefCell::new(socket),
            seq: Cell::new(1),
            recv_buf_size: config.recv_buf_size,
        })
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }

    fn request_and_ack(
        &self,
        command: &'static str,
        msg_type: u16,
        extra_flags: u16,
        payload: &[u8],
    ) -> Result<(), BpfForgeError> {
        let seq = self.next_seq();
        let request = netlink_request(
            msg_type,
            NLM_F_REQUEST | NLM_F_ACK | extra_flags,
            seq,
            payload,
        );
        debug!("{command}: sending {} byte netlink request", request.len());

        let socket = self.sock.borrow_mut();
        socket.send(&request, 0)?;

        let mut receive_buffer = vec![0; self.recv_buf_size];
        let n = socket.recv(&mut &mut receive_buffer[..], 0)?;
        let reply = &receive_buffer[..n];

        let reply_type = bytes::get_u16(reply, 4)
            .ok_or_else(|| BpfForgeError::Error("short netlink reply".to_string()))?;
        match reply_type {
            NLMSG_ERROR => {
                let code = bytes::get_i32(reply, NLMSG_HDR_SIZE)
                    .ok_or_else(|| BpfForgeError::Error("short netlink error".to_string()))?;
                if code == 0 {
                    Ok(())
                } else {
                    Err(KernelError::new(command, Errno::from_raw(-code)).into())
                }
            }
            NLMSG_DONE => Ok(()),
            other => Err(BpfForgeError::Error(format!(
                "unexpected netlink reply type {other}"
            ))),
        }
    }

    /// Attach an XDP program to the interface. Fails with the kernel's
    /// already-exists error if another program is attached in this mode.
    pub fn attach_xdp(
        &self,
        if_index: u32,
        prog_fd: RawFd,
        mode: XdpMode,
    ) -> Result<(), BpfForgeError> {
        let flags = XDP_FLAGS_UPDATE_IF_NOEXIST | mode as u32;
        self.request_and_ack(
            "RTM_SETLINK(xdp attach)",
            RTM_SETLINK,
            0,
            &xdp_set_payload(if_index, prog_fd, flags),
        )?;
        info!("attached XDP prog fd {prog_fd} to ifindex {if_index} ({mode:?})");
        Ok(())
    }

    /// Detach whatever XDP program is attached in `mode` by setting fd −1.
    pub fn detach_xdp(&self, if_index: u32, mode: XdpMode) -> Result<(), BpfForgeError> {
        self.request_and_ack(
            "RTM_SETLINK(xdp detach)",
            RTM_SETLINK,
            0,
            &xdp_set_payload(if_index, -1, mode as u32),
        )?;
        info!("detached XDP from ifindex {if_index}");
        Ok(())
    }

    /// True if a qdisc of `qdisc_name` sits on `if_index`.
    pub fn has_qdisc(&self, qdisc_name: String, if_index: i32) -> Result<bool, BpfForgeError> {
        let mut req =
            NetlinkMessage::from(RouteNetlinkMessage::GetQueueDiscipline(TcMessage::default()));
        req.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        req.header.sequence_number = self.next_seq();

        req.finalize();
        let mut buf = vec![0; req.header.length as usize];
        req.serialize(&mut buf);

        let socket = self.sock.borrow_mut();
        socket.send(&buf, 0)?;

        let mut receive_buffer = vec![0; self.recv_buf_size];
        let mut found = false;
        loop {
            let n = socket.recv(&mut &mut receive_buffer[..], 0)?;
            let bytes = &receive_buffer[..n];
            let rx_packet: NetlinkMessage<RouteNetlinkMessage> =
                NetlinkMessage::deserialize(bytes)
                    .map_err(|e| BpfForgeError::Error(format!("bad netlink reply: {e}")))?;
            match rx_packet.payload {
                NetlinkPayload::Done(_) => break,
                NetlinkPayload::Error(e) => {
                    return Err(BpfForgeError::Error(e.to_string()));
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::GetQueueDiscipline(
                    qdisc_message,
                )) => {
                    if qdisc_message.header.index == if_index
                        && qdisc_message
                            .attributes
                            .contains(&TcAttribute::Kind(qdisc_name.clone()))
                    {
                        found = true;
                        break;
                    }
                    continue;
                }
                _ => continue,
            }
        }
        Ok(found)
    }

    /// Install the clsact qdisc if the interface does not have one yet.
    pub fn ensure_clsact(&self, if_index: u32) -> Result<(), BpfForgeError> {
        if self.has_qdisc("clsact".to_string(), if_index as i32)? {
            return Ok(());
        }
        let mut payload = tcmsg(if_index, CLSACT_HANDLE, TC_H_CLSACT, 0);
        payload.extend_from_slice(&nla_cstr(TCA_KIND, "clsact"));
        match self.request_and_ack(
            "RTM_NEWQDISC(clsact)",
            RTM_NEWQDISC,
            NLM_F_CREATE | NLM_F_EXCL,
            &payload,
        ) {
            Ok(()) => {
                info!("created clsact qdisc on ifindex {if_index}");
                Ok(())
            }
            // Lost a race against another manager; the qdisc is there.
            Err(BpfForgeError::Kernel(KernelError {
                errno: Errno::EEXIST,
                ..
            })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Attach a classifier program to the interface's clsact hook with
    /// direct-action semantics.
    pub fn attach_tc(
        &self,
        if_index: u32,
        direction: Direction,
        priority: u16,
        prog_fd: RawFd,
        prog_name: &str,
    ) -> Result<(), BpfForgeError> {
        self.ensure_clsact(if_index)?;
        self.request_and_ack(
            "RTM_NEWTFILTER(bpf)",
            RTM_NEWTFILTER,
            NLM_F_CREATE | NLM_F_EXCL,
            &tc_filter_payload(if_index, direction, priority, Some((prog_fd, prog_name))),
        )?;
        info!(
            "attached TC {direction:?} filter prio {priority} on ifindex {if_index}"
        );
        Ok(())
    }

    /// Remove the classifier installed at `priority`.
    pub fn detach_tc(
        &self,
        if_index: u32,
        direction: Direction,
        priority: u16,
    ) -> Result<(), BpfForgeError> {
        self.request_and_ack(
            "RTM_DELTFILTER(bpf)",
            RTM_DELTFILTER,
            0,
            &tc_filter_payload(if_index, direction, priority, None),
        )?;
        info!(
            "detached TC {direction:?} filter prio {priority} on ifindex {if_index}"
        );
        Ok(())
    }
}

impl std::fmt::Debug for NetlinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkManager").finish_non_exhaustive()
    }
}
