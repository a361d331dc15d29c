// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Little-endian reads and writes over byte buffers.
//!
//! Every multi-byte field this crate exchanges with the kernel (instruction
//! words, `bpf_attr` fields, ELF records, netlink attributes) is
//! little-endian on the supported hosts, so these helpers are the single
//! place layout math happens.

/// Fixed length of kernel object names (maps and programs).
pub(crate) const OBJ_NAME_LEN: usize = 16;

pub(crate) fn get_u8(buf: &[u8], off: usize) -> Option<u8> {
    buf.get(off).copied()
}

pub(crate) fn get_u16(buf: &[u8], off: usize) -> Option<u16> {
    let bytes = buf.get(off..off + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> Option<u64> {
    let bytes = buf.get(off..off + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

pub(crate) fn get_i32(buf: &[u8], off: usize) -> Option<i32> {
    get_u32(buf, off).map(|v| v as i32)
}

pub(crate) fn get_i64(buf: &[u8], off: usize) -> Option<i64> {
    get_u64(buf, off).map(|v| v as i64)
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_i32(buf: &mut [u8], off: usize, value: i32) {
    put_u32(buf, off, value as u32);
}

/// Write `name` as a fixed-size, zero-padded object name. Overlong names
/// are truncated; the final byte is always NUL.
pub(crate) fn put_obj_name(buf: &mut [u8], off: usize, name: &str) {
    let field = &mut buf[off..off + OBJ_NAME_LEN];
    field.fill(0);
    let bytes = name.as_bytes();
    let len = bytes.len().min(OBJ_NAME_LEN - 1);
    field[..len].copy_from_slice(&bytes[..len]);
}

/// Read a NUL-terminated string starting at `off`. Unterminated input runs
/// to the end of the buffer.
pub(crate) fn get_cstr(buf: &[u8], off: usize) -> Option<String> {
    let tail = buf.get(off..)?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Some(String::from_utf8_lossy(&tail[..end]).to_string())
}
