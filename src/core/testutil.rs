// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Shared test doubles: a minimal architecture with one relaxable jump.

use super::arch::{
    Arch, Endian, InsnContents, InsnPrefix, Operand, Register, TargetMod,
};
use super::bc_data::Dataval;
use super::bytecode::{create_data, AddSpan, Bytecode, Expansion, FinalizeCtx, ValueOutput};
use super::error::{CoreError, CoreErrorKind};
use super::expr::{Expr, Op, SimplifyOpts};
use super::location::Location;
use super::value::resolve_syms;

/// A raw-byte data bytecode.
pub(crate) fn data_bytes(bytes: &[u8], line: u32) -> Bytecode {
    create_data(vec![Dataval::Raw(bytes.to_vec())], 1, false, line)
}

/// Relative jump with a two-byte short form and a five-byte long form,
/// relaxed when the displacement from the jump start leaves [-128, 127].
#[derive(Debug, Clone)]
pub(crate) struct TestJmp {
    target: Expr,
    long: bool,
}

impl TestJmp {
    pub(crate) fn to(target: Expr) -> Self {
        Self {
            target,
            long: false,
        }
    }

    fn dist_expr(&self, loc: Location) -> Expr {
        Expr::binary(self.target.clone().into(), Op::Sub, Expr::loc(loc).into())
    }
}

impl InsnContents for TestJmp {
    fn clone_box(&self) -> Box<dyn InsnContents> {
        Box::new(self.clone())
    }

    fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        resolve_syms(&mut self.target, ctx.symbols);
        self.target.simplify(SimplifyOpts::default())
    }

    fn calc_len(
        &mut self,
        loc: Location,
        _ctx: &FinalizeCtx<'_>,
        add_span: AddSpan<'_>,
    ) -> Result<u64, CoreError> {
        if self.long {
            return Ok(5);
        }
        add_span(1, self.dist_expr(loc), -128, 127);
        Ok(2)
    }

    fn expand(
        &mut self,
        len: &mut u64,
        _span_id: i32,
        _old_val: i64,
        _new_val: i64,
    ) -> Result<Expansion, CoreError> {
        self.long = true;
        *len = 5;
        Ok(Expansion::done())
    }

    fn to_bytes(
        &self,
        loc: Location,
        buf: &mut Vec<u8>,
        out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError> {
        let dist = out
            .eval_to_int(&self.dist_expr(loc))?
            .to_i64()
            .ok_or_else(|| {
                CoreError::new(CoreErrorKind::MalformedExpression, "jump target out of range")
            })?;
        if self.long {
            buf.push(0xe9);
            buf.extend_from_slice(&((dist - 5) as i32).to_le_bytes());
        } else {
            buf.push(0xeb);
            buf.push((dist - 2) as i8 as u8);
        }
        Ok(())
    }

    fn max_len(&self) -> u64 {
        5
    }
}

/// Architecture double: registers `r0`..`r15`, one `jmp` mnemonic, NOP
/// code fill.
pub(crate) struct TestArch;

impl Arch for TestArch {
    fn keyword(&self) -> &'static str {
        "test"
    }

    fn mode_bits(&self) -> u32 {
        32
    }

    fn default_endian(&self) -> Endian {
        Endian::Little
    }

    fn lookup_register(&self, name: &str) -> Option<Register> {
        let num: u32 = name.strip_prefix('r')?.parse().ok()?;
        (num < 16).then(|| Register::new(num))
    }

    fn lookup_target_mod(&self, name: &str) -> Option<TargetMod> {
        match name {
            "short" => Some(TargetMod::new(0)),
            "near" => Some(TargetMod::new(1)),
            _ => None,
        }
    }

    fn lookup_prefix(&self, _name: &str) -> Option<InsnPrefix> {
        None
    }

    fn create_insn(
        &self,
        mnemonic: &str,
        mut operands: Vec<Operand>,
    ) -> Option<Box<dyn InsnContents>> {
        if !mnemonic.eq_ignore_ascii_case("jmp") || operands.len() != 1 {
            return None;
        }
        match operands.pop() {
            Some(Operand::Imm(target)) => Some(Box::new(TestJmp::to(target))),
            _ => None,
        }
    }

    fn code_fill(&self, len: u64) -> Result<Vec<u8>, CoreError> {
        Ok(vec![0x90; len as usize])
    }
}
