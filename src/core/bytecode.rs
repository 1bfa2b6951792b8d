// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Bytecodes: the atomic emission units appended to sections.
//!
//! A bytecode couples polymorphic contents with the bookkeeping the
//! optimizer needs: a repeat count, the resolved fixed length, the resolved
//! section offset, and a dense index. Contents answer a small closed
//! protocol: `finalize` resolves parse-time expressions, `calc_len` reports
//! a baseline length and registers spans, `expand` grows towards a long
//! form, `to_bytes` emits exactly the resolved length, and `special_kind`
//! flags reservations, origin setters, and instructions for the phases
//! that treat them differently.

use super::arch::InsnContents;
use super::bc_data::{Data, Dataval, Fill, Leb128};
use super::bc_incbin::{Includes, Incbin};
use super::bc_layout::{Align, Org, Reserve};
use super::error::{CoreError, CoreErrorKind};
use super::expr::Expr;
use super::intnum::IntNum;
use super::location::Location;
use super::symbol::{SymbolId, SymbolTable};
use super::value::{resolve_const, Value};

/// Span registration callback: `(id, dependent expr, neg_thres, pos_thres)`.
///
/// A positive id expands only when the dependent value leaves the threshold
/// window; a negative id expands on every change. Ids must be distinct
/// within one bytecode.
pub type AddSpan<'a> = &'a mut dyn FnMut(i32, Expr, i64, i64);

/// Result of a span expansion step.
#[derive(Debug, Clone, Copy)]
pub struct Expansion {
    /// False when the bytecode can grow no further on this span.
    pub keep: bool,
    pub neg_thres: i64,
    pub pos_thres: i64,
}

impl Expansion {
    pub fn done() -> Self {
        Self {
            keep: false,
            neg_thres: 0,
            pos_thres: 0,
        }
    }
}

/// Context handed to `finalize`/`calc_len`.
pub struct FinalizeCtx<'a> {
    pub symbols: &'a SymbolTable,
    pub includes: &'a Includes,
    pub line: u32,
}

/// Byte-emission callbacks supplied by the emitter.
///
/// `emit_value` places a finalized value into its destination bytes,
/// delegating to the object format's relocation recording when the value is
/// still symbolic. The warn mode follows the value convention: zero
/// suppresses range warnings, positive requests unsigned checks, negative
/// signed checks.
pub trait ValueOutput {
    fn emit_value(
        &mut self,
        value: &Value,
        buf: &mut [u8],
        loc: Location,
        warn: i32,
    ) -> Result<(), CoreError>;

    fn emit_reloc(
        &mut self,
        sym: SymbolId,
        loc: Location,
        buf: &mut [u8],
        valsize: u32,
        warn: i32,
    ) -> Result<(), CoreError>;

    /// Evaluate an expression against final offsets.
    fn eval_to_int(&self, expr: &Expr) -> Result<IntNum, CoreError>;

    /// Fill pattern for the current section: the architecture's code fill
    /// in code sections, zero bytes otherwise.
    fn fill_pattern(&self, len: u64) -> Result<Vec<u8>, CoreError>;
}

/// Special bytecode classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    None,
    /// Claims space without emitting bytes.
    Reservation,
    /// Adjusts the following offset instead of having a fixed length.
    Origin,
    Instruction,
}

/// Polymorphic bytecode contents.
#[derive(Debug, Clone)]
pub enum Contents {
    /// Pre-encoded bytes.
    Raw(Vec<u8>),
    Data(Data),
    Leb128(Leb128),
    Reserve(Reserve),
    Align(Align),
    Org(Org),
    Incbin(Incbin),
    Fill(Fill),
    Insn(Box<dyn InsnContents>),
}

impl Contents {
    fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        match self {
            Contents::Raw(_) => Ok(()),
            Contents::Data(c) => c.finalize(ctx),
            Contents::Leb128(c) => c.finalize(ctx),
            Contents::Reserve(c) => c.finalize(ctx),
            Contents::Align(c) => c.finalize(ctx),
            Contents::Org(c) => c.finalize(ctx),
            Contents::Incbin(c) => c.finalize(ctx),
            Contents::Fill(c) => c.finalize(ctx),
            Contents::Insn(c) => c.finalize(ctx),
        }
    }

    fn calc_len(
        &mut self,
        loc: Location,
        ctx: &FinalizeCtx<'_>,
        add_span: AddSpan<'_>,
    ) -> Result<u64, CoreError> {
        match self {
            Contents::Raw(bytes) => Ok(bytes.len() as u64),
            Contents::Data(c) => c.calc_len(),
            Contents::Leb128(c) => c.calc_len(add_span),
            Contents::Reserve(c) => c.calc_len(),
            // Offset setters start at zero length; their real length comes
            // from update_offset once the start offset is known.
            Contents::Align(_) | Contents::Org(_) => Ok(0),
            Contents::Incbin(c) => c.calc_len(),
            Contents::Fill(c) => c.calc_len(),
            Contents::Insn(c) => c.calc_len(loc, ctx, add_span),
        }
    }

    fn expand(
        &mut self,
        len: &mut u64,
        span_id: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, CoreError> {
        match self {
            Contents::Leb128(c) => c.expand(len, span_id, old_val, new_val),
            Contents::Insn(c) => c.expand(len, span_id, old_val, new_val),
            _ => Err(CoreError::new(
                CoreErrorKind::InternalConsistency,
                "expansion requested for fixed-size contents",
            )),
        }
    }

    /// Recompute the length of offset-dependent contents for a new start
    /// offset. Returns `None` for contents whose length does not depend on
    /// their position.
    fn update_offset(&mut self, offset: u64) -> Result<Option<u64>, CoreError> {
        match self {
            Contents::Align(c) => Ok(Some(c.len_at(offset))),
            Contents::Org(c) => c.len_at(offset).map(Some),
            _ => Ok(None),
        }
    }

    fn to_bytes(
        &self,
        loc: Location,
        buf: &mut Vec<u8>,
        out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError> {
        match self {
            Contents::Raw(bytes) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            Contents::Data(c) => c.to_bytes(loc, buf, out),
            Contents::Leb128(c) => c.to_bytes(buf, out),
            // Reservations produce a gap; the emitter never calls this.
            Contents::Reserve(_) => Err(CoreError::new(
                CoreErrorKind::InternalConsistency,
                "reservation asked to emit bytes",
            )),
            Contents::Align(c) => c.to_bytes(buf, out),
            Contents::Org(c) => c.to_bytes(buf, out),
            Contents::Incbin(c) => c.to_bytes(buf),
            Contents::Fill(c) => c.to_bytes(buf),
            Contents::Insn(c) => c.to_bytes(loc, buf, out),
        }
    }

    pub fn special_kind(&self) -> SpecialKind {
        match self {
            Contents::Reserve(_) => SpecialKind::Reservation,
            Contents::Align(_) | Contents::Org(_) => SpecialKind::Origin,
            Contents::Insn(_) => SpecialKind::Instruction,
            _ => SpecialKind::None,
        }
    }
}

/// Offset value before the optimizer has placed a bytecode.
pub const UNPLACED: u64 = u64::MAX;

/// One emission unit inside a section.
#[derive(Debug, Clone)]
pub struct Bytecode {
    contents: Contents,
    /// Source line the bytecode came from.
    line: u32,
    /// Repeat count; `None` means one.
    multiple: Option<Expr>,
    /// Integer repeat count, resolved during initial sizing.
    mult_int: u64,
    /// Length of one copy, resolved by the optimizer.
    len: u64,
    /// Offset from section start, resolved by the optimizer.
    offset: u64,
    /// Dense index within the owning section.
    index: usize,
    /// Symbols whose labels point at this bytecode.
    symbols: Vec<SymbolId>,
}

impl Bytecode {
    pub fn new(contents: Contents, line: u32) -> Self {
        Self {
            contents,
            line,
            multiple: None,
            mult_int: 1,
            len: 0,
            offset: UNPLACED,
            index: 0,
            symbols: Vec::new(),
        }
    }

    pub fn contents(&self) -> &Contents {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut Contents {
        &mut self.contents
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn special_kind(&self) -> SpecialKind {
        self.contents.special_kind()
    }

    /// Set the repeat count expression.
    pub fn set_multiple(&mut self, e: Expr) {
        self.multiple = Some(e);
    }

    /// Multiply into the current repeat count.
    pub fn multiply_multiple(&mut self, e: Expr) {
        use super::expr::Op;
        self.multiple = Some(match self.multiple.take() {
            Some(old) => Expr::binary(old.into(), Op::Mul, e.into()),
            None => e,
        });
    }

    pub fn multiple_expr(&self) -> Option<&Expr> {
        self.multiple.as_ref()
    }

    /// Resolved repeat count; valid after initial sizing.
    pub fn mult_int(&self) -> u64 {
        self.mult_int
    }

    /// Length of one copy; valid after optimization.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Total length including repeats; valid after optimization.
    pub fn total_len(&self) -> u64 {
        self.len * self.mult_int
    }

    /// Offset from section start; valid after optimization.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the next bytecode; valid after optimization.
    pub fn next_offset(&self) -> u64 {
        self.offset + self.total_len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Record a label pointing at this bytecode.
    pub fn add_symbol(&mut self, sym: SymbolId) {
        self.symbols.push(sym);
    }

    pub fn symbols(&self) -> &[SymbolId] {
        &self.symbols
    }

    /// Resolve parse-time expressions against the completed symbol table.
    pub fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        let line = self.line;
        ctx.line = line;
        self.contents
            .finalize(ctx)
            .map_err(|e| e.or_line(line))
    }

    /// Compute the baseline length, resolve the repeat count, and register
    /// spans through `add_span`. `loc` is this bytecode's own start.
    pub fn calc_len(
        &mut self,
        loc: Location,
        ctx: &FinalizeCtx<'_>,
        add_span: AddSpan<'_>,
    ) -> Result<(), CoreError> {
        let line = self.line;
        self.len = self
            .contents
            .calc_len(loc, ctx, add_span)
            .map_err(|e| e.or_line(line))?;
        self.mult_int = match &self.multiple {
            None => 1,
            Some(e) => {
                let n = resolve_const(e, ctx.symbols).map_err(|e| e.or_line(line))?;
                n.to_u64().ok_or_else(|| {
                    CoreError::with_line(
                        CoreErrorKind::MalformedExpression,
                        "repeat count is negative or too large",
                        line,
                    )
                })?
            }
        };
        Ok(())
    }

    /// Grow towards a long form for the given span.
    pub fn expand(
        &mut self,
        span_id: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, CoreError> {
        let line = self.line;
        self.contents
            .expand(&mut self.len, span_id, old_val, new_val)
            .map_err(|e| e.or_line(line))
    }

    /// Place the bytecode at `offset`, recomputing offset-dependent
    /// lengths. Returns the offset of the next bytecode.
    pub fn update_offset(&mut self, offset: u64) -> Result<u64, CoreError> {
        self.offset = offset;
        if let Some(len) = self
            .contents
            .update_offset(offset)
            .map_err(|e| e.or_line(self.line))?
        {
            self.len = len;
        }
        Ok(self.next_offset())
    }

    /// Emit one copy of the contents; the emitter handles repeats and
    /// verifies the emitted length.
    pub fn to_bytes(
        &self,
        loc: Location,
        buf: &mut Vec<u8>,
        out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError> {
        self.contents
            .to_bytes(loc, buf, out)
            .map_err(|e| e.or_line(self.line))
    }
}

//
// General bytecode factory functions.
//

/// Create a bytecode containing data values of a uniform element size.
/// With `append_zero`, a single zero byte follows each value (C-string
/// helper). With an element size above one, strings are padded up to a
/// whole number of elements.
pub fn create_data(
    vals: Vec<Dataval>,
    elem_size: u32,
    append_zero: bool,
    line: u32,
) -> Bytecode {
    Bytecode::new(Contents::Data(Data::new(vals, elem_size, append_zero)), line)
}

/// Create a bytecode containing LEB128-encoded values.
pub fn create_leb128(vals: Vec<Expr>, signed: bool, line: u32) -> Bytecode {
    Bytecode::new(Contents::Leb128(Leb128::new(vals, signed)), line)
}

/// Create a bytecode reserving `numitems` × `itemsize` bytes of space.
pub fn create_reserve(numitems: Expr, itemsize: u32, line: u32) -> Bytecode {
    Bytecode::new(Contents::Reserve(Reserve::new(numitems, itemsize)), line)
}

/// Create a bytecode aligning the next bytecode to a power-of-two
/// boundary. Fill precedence: explicit `fill`, then the architecture code
/// fill (code sections), then zero.
pub fn create_align(
    boundary: Expr,
    fill: Option<Expr>,
    maxskip: Option<Expr>,
    line: u32,
) -> Bytecode {
    Bytecode::new(Contents::Align(Align::new(boundary, fill, maxskip)), line)
}

/// Create a bytecode placing the following bytecode at a fixed section
/// offset, padding with `fill`.
pub fn create_org(start: Expr, fill: u8, line: u32) -> Bytecode {
    Bytecode::new(Contents::Org(Org::new(start, fill)), line)
}

/// Create a bytecode including a slice of a binary file verbatim.
pub fn create_incbin(
    filename: impl Into<String>,
    start: Option<Expr>,
    maxlen: Option<Expr>,
    line: u32,
) -> Bytecode {
    Bytecode::new(
        Contents::Incbin(Incbin::new(filename.into(), start, maxlen)),
        line,
    )
}

/// Create a bytecode emitting `len` copies of a fill byte.
pub fn create_fill(len: Expr, val: u8, line: u32) -> Bytecode {
    Bytecode::new(Contents::Fill(Fill::new(len, val)), line)
}

/// Create an instruction bytecode from architecture-built contents.
pub fn create_insn(insn: Box<dyn InsnContents>, line: u32) -> Bytecode {
    Bytecode::new(Contents::Insn(insn), line)
}
