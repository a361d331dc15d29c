// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Label-resolving assembler.
//!
//! Flattens a possibly-nested item sequence, assigns word indices to labels
//! (an `lddw` occupies two), resolves symbolic jumps to signed 16-bit
//! PC-relative offsets and concatenates the encoded words.

use std::collections::HashMap;

use crate::{
    errors::{AssemblyError, BpfForgeError},
    insn::{BPF_JA, BPF_JMP, BPF_JMP32, BPF_K, BPF_X, Insn, JmpOp, LoadImm64, Reg},
};

/// One element of an instruction list. Labels occupy zero bytes in the
/// emitted stream; blocks flatten depth-first, left-to-right.
#[derive(Debug, Clone)]
pub enum Item {
    Insn(Insn),
    Wide(LoadImm64),
    Label(String),
    Jump(SymJump),
    Block(Vec<Item>),
}

impl From<Insn> for Item {
    fn from(insn: Insn) -> Self {
        Item::Insn(insn)
    }
}

impl From<LoadImm64> for Item {
    fn from(wide: LoadImm64) -> Self {
        Item::Wide(wide)
    }
}

impl From<Vec<Item>> for Item {
    fn from(items: Vec<Item>) -> Self {
        Item::Block(items)
    }
}

/// A jump whose offset field is still a label name.
#[derive(Debug, Clone)]
pub struct SymJump {
    opcode: u8,
    dst: Reg,
    src: Reg,
    imm: i32,
    target: String,
}

/// Position marker. Adjacent labels collapse to the same word index and a
/// label after the last instruction resolves to the one-past-end index.
pub fn label(name: impl Into<String>) -> Item {
    Item::Label(name.into())
}

/// Unconditional jump to `target`.
pub fn ja_to(target: impl Into<String>) -> Item {
    Item::Jump(SymJump {
        opcode: BPF_JMP | BPF_JA,
        dst: Reg::R0,
        src: Reg::R0,
        imm: 0,
        target: target.into(),
    })
}

pub fn jmp_imm_to(op: JmpOp, dst: Reg, imm: i32, target: impl Into<String>) -> Item {
    Item::Jump(SymJump {
        opcode: BPF_JMP | BPF_K | op as u8,
        dst,
        src: Reg::R0,
        imm,
        target: target.into(),
    })
}

pub fn jmp_reg_to(op: JmpOp, dst: Reg, src: Reg, target: impl Into<String>) -> Item {
    Item::Jump(SymJump {
        opcode: BPF_JMP | BPF_X | op as u8,
        dst,
        src,
        imm: 0,
        target: target.into(),
    })
}

pub fn jmp32_imm_to(op: JmpOp, dst: Reg, imm: i32, target: impl Into<String>) -> Item {
    Item::Jump(SymJump {
        opcode: BPF_JMP32 | BPF_K | op as u8,
        dst,
        src: Reg::R0,
        imm,
        target: target.into(),
    })
}

pub fn jmp32_reg_to(op: JmpOp, dst: Reg, src: Reg, target: impl Into<String>) -> Item {
    Item::Jump(SymJump {
        opcode: BPF_JMP32 | BPF_X | op as u8,
        dst,
        src,
        imm: 0,
        target: target.into(),
    })
}

enum Flat {
    Word(Insn),
    Wide(LoadImm64),
    Jump(SymJump),
    Label(String),
}

impl Flat {
    fn words(&self) -> usize {
        match self {
            Flat::Word(_) | Flat::Jump(_) => 1,
            Flat::Wide(_) => 2,
            Flat::Label(_) => 0,
        }
    }
}

fn flatten(items: &[Item], out: &mut Vec<Flat>) {
    for item in items {
        match item {
            Item::Insn(insn) => out.push(Flat::Word(*insn)),
            Item::Wide(wide) => out.push(Flat::Wide(*wide)),
            Item::Jump(jump) => out.push(Flat::Jump(jump.clone())),
            Item::Label(name) => out.push(Flat::Label(name.clone())),
            Item::Block(inner) => flatten(inner, out),
        }
    }
}

/// Assemble an instruction list into kernel-ready bytecode. The result
/// length is always `8 × word_count` and identical across runs for the
/// same input.
pub fn assemble(items: &[Item]) -> Result<Vec<u8>, BpfForgeError> {
    let mut flat = Vec::new();
    flatten(items, &mut flat);

    let mut labels: HashMap<&str, usize> = HashMap::new();
    let mut index = 0usize;
    for element in &flat {
        if let Flat::Label(name) = element {
            if labels.insert(name.as_str(), index).is_some() {
                return Err(AssemblyError::DuplicateLabel(name.clone()).into());
            }
        }
        index += element.words();
    }
    let word_count = index;

    let mut bytecode = Vec::with_capacity(word_count * 8);
    let mut index = 0usize;
    for element in &flat {
        match element {
            Flat::Word(insn) => bytecode.extend_from_slice(&insn.encode()),
            Flat::Wide(wide) => bytecode.extend_from_slice(&wide.encode()),
            Flat::Jump(jump) => {
                let target = *labels
                    .get(jump.target.as_str())
                    .ok_or_else(|| AssemblyError::UndefinedLabel(jump.target.clone()))?;
                let offset = target as i64 - index as i64 - 1;
                if offset < i16::MIN as i64 || offset > i16::MAX as i64 {
                    return Err(AssemblyError::JumpOutOfRange {
                        label: jump.target.clone(),
                        offset,
                    }
                    .into());
                }
                let resolved = Insn {
                    opcode: jump.opcode,
                    dst: jump.dst,
                    src: jump.src,
                    offset: offset as i16,
                    imm: jump.imm,
                };
                bytecode.extend_from_slice(&resolved.encode());
            }
            Flat::Label(_) => {}
        }
        index += element.words();
    }

    debug_assert_eq!(bytecode.len(), word_count * 8);
    Ok(bytecode)
}
