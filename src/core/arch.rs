// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Architecture collaborator surface.
//!
//! The core has no knowledge of any concrete instruction set. A target
//! supplies an `Arch` implementation that resolves register and prefix
//! names, builds instruction contents for the instruction bytecode variant,
//! and provides byte-order and code-fill policy. Instruction encoders stay
//! entirely behind `InsnContents`; the optimizer only sees the shared
//! sizing protocol.

use std::fmt;

use super::bytecode::{AddSpan, Expansion, FinalizeCtx, ValueOutput};
use super::error::CoreError;
use super::expr::Expr;
use super::location::Location;

/// Byte order for emitted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Opaque register handle resolved by an `Arch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register(u32);

impl Register {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg{}", self.0)
    }
}

/// Opaque target-modifier handle (e.g. `short`, `near`, `far`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetMod(u32);

impl TargetMod {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Opaque instruction-prefix handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsnPrefix(u32);

impl InsnPrefix {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

/// One instruction operand as handed over by a parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(Register),
    Imm(Expr),
    Mem(Expr),
}

/// Architecture-specific contents of an instruction bytecode.
///
/// Implementations own the decoded instruction and its operand list and
/// answer the same five-way protocol every bytecode content does. The
/// architecture contract requires a finite `max_len` so that span-driven
/// expansion terminates.
pub trait InsnContents: fmt::Debug {
    fn clone_box(&self) -> Box<dyn InsnContents>;

    /// Resolve parse-time expressions against the symbol table.
    fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError>;

    /// Minimum length; may register short/long-branch spans with thresholds
    /// derived from the instruction set. `loc` is the start of the owning
    /// bytecode, usable inside span expressions.
    fn calc_len(
        &mut self,
        loc: Location,
        ctx: &FinalizeCtx<'_>,
        add_span: AddSpan<'_>,
    ) -> Result<u64, CoreError>;

    /// Grow towards the long form for one span.
    fn expand(
        &mut self,
        len: &mut u64,
        span_id: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, CoreError>;

    /// Emit exactly the current length's worth of bytes.
    fn to_bytes(
        &self,
        loc: Location,
        buf: &mut Vec<u8>,
        out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError>;

    /// Upper bound on the encoded length.
    fn max_len(&self) -> u64;
}

impl Clone for Box<dyn InsnContents> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Capability interface supplied by a target architecture.
pub trait Arch {
    fn keyword(&self) -> &'static str;

    /// Active mode (16, 32, or 64).
    fn mode_bits(&self) -> u32;

    fn default_endian(&self) -> Endian;

    fn lookup_register(&self, name: &str) -> Option<Register>;

    fn lookup_target_mod(&self, name: &str) -> Option<TargetMod>;

    fn lookup_prefix(&self, name: &str) -> Option<InsnPrefix>;

    /// Build instruction contents for a mnemonic; `None` when the mnemonic
    /// is not part of the instruction set.
    fn create_insn(
        &self,
        mnemonic: &str,
        operands: Vec<Operand>,
    ) -> Option<Box<dyn InsnContents>>;

    /// Fill pattern used to pad code sections (typically NOP sequences).
    fn code_fill(&self, len: u64) -> Result<Vec<u8>, CoreError>;

    /// Natural size in bits for an operand, when the architecture can tell.
    fn infer_operand_size(&self, operand: &Operand) -> Option<u32> {
        let _ = operand;
        None
    }
}
