// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! eBPF instruction encoder.
//!
//! Pure construction of 8-byte instruction words; nothing here touches the
//! kernel. Wire layout: opcode in byte 0, `dst | src << 4` in byte 1,
//! signed 16-bit offset in bytes 2-3, signed 32-bit immediate in bytes 4-7,
//! all little-endian. Semantic validation is the verifier's job; the
//! encoder only rejects values that cannot be represented in the word.

use std::str::FromStr;

use crate::{
    bytes,
    errors::{BpfForgeError, ParseError},
};

// Instruction classes (low three opcode bits).
pub const BPF_LD: u8 = 0x00;
pub const BPF_LDX: u8 = 0x01;
pub const BPF_ST: u8 = 0x02;
pub const BPF_STX: u8 = 0x03;
pub const BPF_ALU: u8 = 0x04;
pub const BPF_JMP: u8 = 0x05;
pub const BPF_JMP32: u8 = 0x06;
pub const BPF_ALU64: u8 = 0x07;

// Size field for load/store classes.
pub const BPF_W: u8 = 0x00;
pub const BPF_H: u8 = 0x08;
pub const BPF_B: u8 = 0x10;
pub const BPF_DW: u8 = 0x18;

// Mode field for load/store classes.
pub const BPF_IMM: u8 = 0x00;
pub const BPF_MEM: u8 = 0x60;

// Source bit for ALU and jump classes.
pub const BPF_K: u8 = 0x00;
pub const BPF_X: u8 = 0x08;

// END (byte-swap) direction bit.
pub const BPF_TO_LE: u8 = 0x00;
pub const BPF_TO_BE: u8 = 0x08;

/// `src_reg` value marking the immediate of an `lddw` as a map fd.
pub const BPF_PSEUDO_MAP_FD: u8 = 1;

/// The eleven eBPF registers. `R10` is the read-only frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
}

impl Reg {
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Reg {
    type Error = BpfForgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Reg::R0,
            1 => Reg::R1,
            2 => Reg::R2,
            3 => Reg::R3,
            4 => Reg::R4,
            5 => Reg::R5,
            6 => Reg::R6,
            7 => Reg::R7,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            other => {
                return Err(BpfForgeError::InvalidInstruction(format!(
                    "no register r{other}"
                )));
            }
        })
    }
}

impl FromStr for Reg {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s
            .strip_prefix('r')
            .and_then(|n| n.parse::<u8>().ok())
            .ok_or_else(|| ParseError::InvalidRegister {
                register: s.to_string(),
            })?;
        Reg::try_from(number).map_err(|_| ParseError::InvalidRegister {
            register: s.to_string(),
        })
    }
}

/// ALU operations, shared between the 32- and 64-bit classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0x00,
    Sub = 0x10,
    Mul = 0x20,
    Div = 0x30,
    Or = 0x40,
    And = 0x50,
    Lsh = 0x60,
    Rsh = 0x70,
    Neg = 0x80,
    Mod = 0x90,
    Xor = 0xa0,
    Mov = 0xb0,
    Arsh = 0xc0,
}

/// Conditional jump operations. `ja`, `call` and `exit` are separate forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JmpOp {
    Jeq = 0x10,
    Jgt = 0x20,
    Jge = 0x30,
    Jset = 0x40,
    Jne = 0x50,
    Jsgt = 0x60,
    Jsge = 0x70,
    Jlt = 0xa0,
    Jle = 0xb0,
    Jslt = 0xc0,
    Jsle = 0xd0,
}

pub const BPF_JA: u8 = 0x00;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;
const BPF_END: u8 = 0xd0;

/// Memory access width for load/store forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Size {
    Byte = BPF_B,
    Half = BPF_H,
    Word = BPF_W,
    Double = BPF_DW,
}

/// One encoded eBPF instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub opcode: u8,
    pub dst: Reg,
    pub src: Reg,
    pub offset: i16,
    pub imm: i32,
}

impl Insn {
    fn new(opcode: u8, dst: Reg, src: Reg, offset: i16, imm: i32) -> Self {
        Insn {
            opcode,
            dst,
            src,
            offset,
            imm,
        }
    }

    /// Encode as one little-endian 8-byte word.
    pub fn encode(&self) -> [u8; 8] {
        let mut word = [0u8; 8];
        word[0] = self.opcode;
        word[1] = self.dst.number() | (self.src.number() << 4);
        bytes::put_u16(&mut word, 2, self.offset as u16);
        bytes::put_i32(&mut word, 4, self.imm);
        word
    }
}

/// A wide-immediate (`lddw`) load: two adjacent words, indivisible, and
/// counted as two program-counter positions by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadImm64 {
    pub dst: Reg,
    pub imm: i64,
    /// 0 for plain constants, [`BPF_PSEUDO_MAP_FD`] for map references.
    pub src_kind: u8,
}

impl LoadImm64 {
    pub fn encode(&self) -> [u8; 16] {
        let mut words = [0u8; 16];
        words[0] = BPF_LD | BPF_DW | BPF_IMM;
        words[1] = self.dst.number() | (self.src_kind << 4);
        bytes::put_u32(&mut words, 4, self.imm as u64 as u32);
        bytes::put_u32(&mut words, 12, ((self.imm as u64) >> 32) as u32);
        words
    }
}

pub fn alu64_reg(op: AluOp, dst: Reg, src: Reg) -> Insn {
    Insn::new(BPF_ALU64 | BPF_X | op as u8, dst, src, 0, 0)
}

pub fn alu64_imm(op: AluOp, dst: Reg, imm: i32) -> Insn {
    Insn::new(BPF_ALU64 | BPF_K | op as u8, dst, Reg::R0, 0, imm)
}

pub fn alu32_reg(op: AluOp, dst: Reg, src: Reg) -> Insn {
    Insn::new(BPF_ALU | BPF_X | op as u8, dst, src, 0, 0)
}

pub fn alu32_imm(op: AluOp, dst: Reg, imm: i32) -> Insn {
    Insn::new(BPF_ALU | BPF_K | op as u8, dst, Reg::R0, 0, imm)
}

pub fn mov64_imm(dst: Reg, imm: i32) -> Insn {
    alu64_imm(AluOp::Mov, dst, imm)
}

pub fn mov64_reg(dst: Reg, src: Reg) -> Insn {
    alu64_reg(AluOp::Mov, dst, src)
}

pub fn mov32_imm(dst: Reg, imm: i32) -> Insn {
    alu32_imm(AluOp::Mov, dst, imm)
}

pub fn mov32_reg(dst: Reg, src: Reg) -> Insn {
    alu32_reg(AluOp::Mov, dst, src)
}

pub fn neg64(dst: Reg) -> Insn {
    Insn::new(BPF_ALU64 | BPF_K | AluOp::Neg as u8, dst, Reg::R0, 0, 0)
}

pub fn neg32(dst: Reg) -> Insn {
    Insn::new(BPF_ALU | BPF_K | AluOp::Neg as u8, dst, Reg::R0, 0, 0)
}

/// `dst = *(size *)(src + off)`
pub fn ldx(size: Size, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(BPF_LDX | BPF_MEM | size as u8, dst, src, off, 0)
}

/// `*(size *)(dst + off) = src`
pub fn stx(size: Size, dst: Reg, off: i16, src: Reg) -> Insn {
    Insn::new(BPF_STX | BPF_MEM | size as u8, dst, src, off, 0)
}

/// `*(size *)(dst + off) = imm`, range-checked against the store width.
pub fn st(size: Size, dst: Reg, off: i16, imm: i32) -> Result<Insn, BpfForgeError> {
    let fits = match size {
        Size::Byte => imm >= i8::MIN as i32 && imm <= u8::MAX as i32,
        Size::Half => imm >= i16::MIN as i32 && imm <= u16::MAX as i32,
        Size::Word | Size::Double => true,
    };
    if !fits {
        return Err(BpfForgeError::InvalidInstruction(format!(
            "immediate {imm} does not fit a {size:?} store"
        )));
    }
    Ok(Insn::new(BPF_ST | BPF_MEM | size as u8, dst, Reg::R0, off, imm))
}

/// `dst = imm` over the full 64-bit range.
pub fn load_imm64(dst: Reg, imm: i64) -> LoadImm64 {
    LoadImm64 {
        dst,
        imm,
        src_kind: 0,
    }
}

/// `dst = map` where `fd` is a loaded map descriptor. The pseudo marker in
/// `src_reg` tells the kernel to translate the fd into a map pointer.
pub fn load_map_fd(dst: Reg, fd: i32) -> LoadImm64 {
    LoadImm64 {
        dst,
        imm: fd as u32 as i64,
        src_kind: BPF_PSEUDO_MAP_FD,
    }
}

/// Unconditional `ja` with a concrete word offset.
pub fn ja(off: i16) -> Insn {
    Insn::new(BPF_JMP | BPF_JA, Reg::R0, Reg::R0, off, 0)
}

pub fn jmp_imm(op: JmpOp, dst: Reg, imm: i32, off: i16) -> Insn {
    Insn::new(BPF_JMP | BPF_K | op as u8, dst, Reg::R0, off, imm)
}

pub fn jmp_reg(op: JmpOp, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(BPF_JMP | BPF_X | op as u8, dst, src, off, 0)
}

pub fn jmp32_imm(op: JmpOp, dst: Reg, imm: i32, off: i16) -> Insn {
    Insn::new(BPF_JMP32 | BPF_K | op as u8, dst, Reg::R0, off, imm)
}

pub fn jmp32_reg(op: JmpOp, dst: Reg, src: Reg, off: i16) -> Insn {
    Insn::new(BPF_JMP32 | BPF_X | op as u8, dst, src, off, 0)
}

/// Call the kernel helper with the given numeric id.
pub fn call(helper_id: i32) -> Insn {
    Insn::new(BPF_JMP | BPF_CALL, Reg::R0, Reg::R0, 0, helper_id)
}

/// Return from the program with the value in r0.
pub fn exit() -> Insn {
    Insn::new(BPF_JMP | BPF_EXIT, Reg::R0, Reg::R0, 0, 0)
}

fn swap(direction: u8, dst: Reg, bits: u32) -> Result<Insn, BpfForgeError> {
    match bits {
        16 | 32 | 64 => Ok(Insn::new(
            BPF_ALU | BPF_END | direction,
            dst,
            Reg::R0,
            0,
            bits as i32,
        )),
        other => Err(BpfForgeError::InvalidInstruction(format!(
            "byte-swap width {other} (expected 16, 32 or 64)"
        ))),
    }
}

/// `be16`/`be32`/`be64`: convert `dst` to big-endian.
pub fn to_be(dst: Reg, bits: u32) -> Result<Insn, BpfForgeError> {
    swap(BPF_TO_BE, dst, bits)
}

/// `le16`/`le32`/`le64`: convert `dst` to little-endian.
pub fn to_le(dst: Reg, bits: u32) -> Result<Insn, BpfForgeError> {
    swap(BPF_TO_LE, dst, bits)
}

/// Kernel helper ids callable through [`call`].
pub mod helpers {
    pub const BPF_FUNC_MAP_LOOKUP_ELEM: i32 = 1;
    pub const BPF_FUNC_MAP_UPDATE_ELEM: i32 = 2;
    pub const BPF_FUNC_MAP_DELETE_ELEM: i32 = 3;
    pub const BPF_FUNC_KTIME_GET_NS: i32 = 5;
    pub const BPF_FUNC_TRACE_PRINTK: i32 = 6;
    pub const BPF_FUNC_GET_CURRENT_PID_TGID: i32 = 14;
    pub const BPF_FUNC_PERF_EVENT_OUTPUT: i32 = 25;
    pub const BPF_FUNC_REDIRECT_MAP: i32 = 51;
    pub const BPF_FUNC_RINGBUF_OUTPUT: i32 = 130;
    pub const BPF_FUNC_RINGBUF_RESERVE: i32 = 131;
    pub const BPF_FUNC_RINGBUF_SUBMIT: i32 = 132;
}
