// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Data, LEB128, and fill bytecode contents.

use super::bytecode::{AddSpan, Expansion, FinalizeCtx, ValueOutput};
use super::error::{CoreError, CoreErrorKind};
use super::expr::{Expr, SimplifyOpts};
use super::intnum::IntNum;
use super::location::Location;
use super::value::{resolve_const, resolve_syms, Value};

/// One data item inside a data bytecode.
#[derive(Debug, Clone)]
pub enum Dataval {
    /// An expression headed for a fixed-size slot.
    Value(Value),
    /// String bytes, emitted verbatim (may contain NULs).
    String(Vec<u8>),
    /// Raw pre-encoded bytes.
    Raw(Vec<u8>),
}

impl Dataval {
    /// An expression value sized for `elem_size` bytes.
    pub fn value(expr: Expr, elem_size: u32) -> Self {
        Dataval::Value(Value::new(expr, elem_size * 8))
    }
}

/// Data values of a uniform element size.
#[derive(Debug, Clone)]
pub struct Data {
    vals: Vec<Dataval>,
    elem_size: u32,
    append_zero: bool,
}

impl Data {
    pub fn new(vals: Vec<Dataval>, elem_size: u32, append_zero: bool) -> Self {
        Self {
            vals,
            elem_size: elem_size.max(1),
            append_zero,
        }
    }

    /// Bytes occupied by one item, excluding the appended zero.
    fn item_len(&self, val: &Dataval) -> u64 {
        match val {
            Dataval::Value(_) => self.elem_size as u64,
            Dataval::String(bytes) | Dataval::Raw(bytes) => {
                let len = bytes.len() as u64;
                let elem = self.elem_size as u64;
                len.div_ceil(elem) * elem
            }
        }
    }

    pub(crate) fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        for val in &mut self.vals {
            if let Dataval::Value(v) = val {
                v.finalize(ctx.symbols)?;
            }
        }
        Ok(())
    }

    pub(crate) fn calc_len(&self) -> Result<u64, CoreError> {
        let zero = self.append_zero as u64;
        Ok(self
            .vals
            .iter()
            .map(|v| self.item_len(v) + zero)
            .sum())
    }

    pub(crate) fn to_bytes(
        &self,
        loc: Location,
        buf: &mut Vec<u8>,
        out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError> {
        let start = buf.len() as u64;
        for val in &self.vals {
            match val {
                Dataval::Value(v) => {
                    let written = buf.len() as u64 - start;
                    let here = Location::new(loc.sect, loc.bc, loc.off + written);
                    let mut dest = vec![0u8; self.elem_size as usize];
                    let warn = if v.is_signed() { -1 } else { 1 };
                    out.emit_value(v, &mut dest, here, warn)?;
                    buf.extend_from_slice(&dest);
                }
                Dataval::String(bytes) | Dataval::Raw(bytes) => {
                    buf.extend_from_slice(bytes);
                    let pad = self.item_len(val) - bytes.len() as u64;
                    buf.extend(std::iter::repeat_n(0u8, pad as usize));
                }
            }
            if self.append_zero {
                buf.push(0);
            }
        }
        Ok(())
    }
}

/// Largest encoding this implementation produces for one value.
const MAX_LEB128_LEN: u64 = 10;

#[derive(Debug, Clone)]
struct Leb128Val {
    expr: Expr,
    len: u64,
}

/// Variable-length LEB128-encoded values.
///
/// Unknown values are sized at the worst case and contracted through the
/// span protocol once the optimizer can evaluate them; the spans use
/// negative ids so every change re-sizes the value.
#[derive(Debug, Clone)]
pub struct Leb128 {
    vals: Vec<Leb128Val>,
    signed: bool,
}

impl Leb128 {
    pub fn new(exprs: Vec<Expr>, signed: bool) -> Self {
        Self {
            vals: exprs
                .into_iter()
                .map(|expr| Leb128Val { expr, len: 0 })
                .collect(),
            signed,
        }
    }

    pub(crate) fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        for val in &mut self.vals {
            resolve_syms(&mut val.expr, ctx.symbols);
            val.expr.simplify(SimplifyOpts::default())?;
        }
        Ok(())
    }

    pub(crate) fn calc_len(&mut self, add_span: AddSpan<'_>) -> Result<u64, CoreError> {
        let signed = self.signed;
        let mut total = 0;
        for (i, val) in self.vals.iter_mut().enumerate() {
            val.len = match val.expr.as_intnum() {
                Some(n) => leb128_size(n, signed)?,
                None => {
                    add_span(-(i as i32) - 1, val.expr.clone(), 0, 0);
                    MAX_LEB128_LEN
                }
            };
            total += val.len;
        }
        Ok(total)
    }

    pub(crate) fn expand(
        &mut self,
        len: &mut u64,
        span_id: i32,
        _old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, CoreError> {
        let idx = (-span_id - 1) as usize;
        let val = self.vals.get_mut(idx).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::InternalConsistency,
                "unknown LEB128 span id",
            )
        })?;
        let new_len = leb128_size(&IntNum::new(new_val), self.signed)?;
        *len = *len - val.len + new_len;
        val.len = new_len;
        Ok(Expansion {
            keep: true,
            neg_thres: 0,
            pos_thres: 0,
        })
    }

    pub(crate) fn to_bytes(
        &self,
        buf: &mut Vec<u8>,
        out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError> {
        for val in &self.vals {
            let n = match val.expr.as_intnum() {
                Some(n) => n.clone(),
                None => out.eval_to_int(&val.expr)?,
            };
            let bytes = leb128_encode(&n, self.signed, val.len)?;
            buf.extend_from_slice(&bytes);
        }
        Ok(())
    }
}

/// Length of the minimal encoding of `n`.
pub fn leb128_size(n: &IntNum, signed: bool) -> Result<u64, CoreError> {
    Ok(leb128_encode(n, signed, 0)?.len() as u64)
}

/// Encode `n`, padding with redundant continuation bytes up to `min_len`
/// so a previously reserved slot stays exactly filled.
pub fn leb128_encode(n: &IntNum, signed: bool, min_len: u64) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    if signed {
        let mut v = n.to_i64().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::MalformedExpression,
                "signed LEB128 value out of range",
            )
        })?;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            let sign_clear = byte & 0x40 == 0;
            if (v == 0 && sign_clear) || (v == -1 && !sign_clear) {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        let pad = if n.is_negative() { 0x7f } else { 0x00 };
        while (out.len() as u64) < min_len {
            let last = out.len() - 1;
            out[last] |= 0x80;
            out.push(pad);
        }
    } else {
        if n.is_negative() {
            return Err(CoreError::new(
                CoreErrorKind::MalformedExpression,
                "negative value in unsigned LEB128",
            ));
        }
        let mut v = n.to_u64().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::MalformedExpression,
                "unsigned LEB128 value out of range",
            )
        })?;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        while (out.len() as u64) < min_len {
            let last = out.len() - 1;
            out[last] |= 0x80;
            out.push(0x00);
        }
    }
    Ok(out)
}

/// An explicit run of one fill byte.
#[derive(Debug, Clone)]
pub struct Fill {
    len: Expr,
    val: u8,
    resolved: u64,
}

impl Fill {
    pub fn new(len: Expr, val: u8) -> Self {
        Self {
            len,
            val,
            resolved: 0,
        }
    }

    pub(crate) fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        let n = resolve_const(&self.len, ctx.symbols)?;
        self.resolved = n.to_u64().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::MalformedExpression,
                "fill length is negative or too large",
            )
        })?;
        Ok(())
    }

    pub(crate) fn calc_len(&self) -> Result<u64, CoreError> {
        Ok(self.resolved)
    }

    pub(crate) fn to_bytes(&self, buf: &mut Vec<u8>) -> Result<(), CoreError> {
        buf.extend(std::iter::repeat_n(self.val, self.resolved as usize));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_matches_known_encodings() {
        // Classic DWARF examples.
        assert_eq!(
            leb128_encode(&IntNum::new(624485), false, 0).unwrap(),
            vec![0xe5, 0x8e, 0x26]
        );
        assert_eq!(
            leb128_encode(&IntNum::new(-123456), true, 0).unwrap(),
            vec![0xc0, 0xbb, 0x78]
        );
        assert_eq!(leb128_encode(&IntNum::new(0), false, 0).unwrap(), vec![0]);
        assert_eq!(
            leb128_encode(&IntNum::new(-1), true, 0).unwrap(),
            vec![0x7f]
        );
    }

    #[test]
    fn leb128_padding_preserves_value_and_length() {
        let padded = leb128_encode(&IntNum::new(1), false, 3).unwrap();
        assert_eq!(padded, vec![0x81, 0x80, 0x00]);

        let padded = leb128_encode(&IntNum::new(-2), true, 3).unwrap();
        assert_eq!(padded.len(), 3);
        // Decode back: sign-extended result must be -2.
        let mut v: i64 = 0;
        let mut shift = 0;
        for byte in &padded {
            v |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
        }
        if shift < 64 && padded.last().map(|b| b & 0x40 != 0).is_some_and(|s| s) {
            v |= -1i64 << shift;
        }
        assert_eq!(v, -2);
    }

    #[test]
    fn unsigned_leb128_rejects_negative() {
        let err = leb128_encode(&IntNum::new(-3), false, 0).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::MalformedExpression);
    }

    #[test]
    fn leb128_sizes_grow_with_magnitude() {
        assert_eq!(leb128_size(&IntNum::new(0x7f), false).unwrap(), 1);
        assert_eq!(leb128_size(&IntNum::new(0x80), false).unwrap(), 2);
        assert_eq!(leb128_size(&IntNum::new(63), true).unwrap(), 1);
        assert_eq!(leb128_size(&IntNum::new(64), true).unwrap(), 2);
    }
}
