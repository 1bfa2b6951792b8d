// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Layout bytecode contents: reservations, alignment, origin.
//!
//! Align and org lengths depend on where the bytecode starts, so both are
//! offset setters: `calc_len` reports zero and the optimizer recomputes the
//! real length through `update_offset` whenever preceding bytecodes move.

use super::bytecode::{FinalizeCtx, ValueOutput};
use super::error::{CoreError, CoreErrorKind};
use super::expr::Expr;
use super::value::resolve_const;

fn const_u64(expr: &Expr, ctx: &FinalizeCtx<'_>, what: &str) -> Result<u64, CoreError> {
    let n = resolve_const(expr, ctx.symbols)?;
    n.to_u64().ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::MalformedExpression,
            format!("{what} is negative or too large"),
        )
    })
}

/// Space claimed without emitting bytes.
#[derive(Debug, Clone)]
pub struct Reserve {
    numitems: Expr,
    itemsize: u32,
    items: u64,
}

impl Reserve {
    pub fn new(numitems: Expr, itemsize: u32) -> Self {
        Self {
            numitems,
            itemsize: itemsize.max(1),
            items: 0,
        }
    }

    pub fn itemsize(&self) -> u32 {
        self.itemsize
    }

    pub fn numitems(&self) -> &Expr {
        &self.numitems
    }

    pub(crate) fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        self.items = const_u64(&self.numitems, ctx, "reserve count")?;
        Ok(())
    }

    pub(crate) fn calc_len(&self) -> Result<u64, CoreError> {
        Ok(self.items * self.itemsize as u64)
    }
}

/// Pad the next bytecode to a power-of-two boundary.
#[derive(Debug, Clone)]
pub struct Align {
    boundary: Expr,
    fill: Option<Expr>,
    maxskip: Option<Expr>,
    boundary_val: u64,
    fill_val: Option<u8>,
    maxskip_val: Option<u64>,
    len: u64,
}

impl Align {
    pub fn new(boundary: Expr, fill: Option<Expr>, maxskip: Option<Expr>) -> Self {
        Self {
            boundary,
            fill,
            maxskip,
            boundary_val: 1,
            fill_val: None,
            maxskip_val: None,
            len: 0,
        }
    }

    pub fn boundary(&self) -> u64 {
        self.boundary_val
    }

    pub(crate) fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        let boundary = const_u64(&self.boundary, ctx, "alignment boundary")?;
        if boundary == 0 || !boundary.is_power_of_two() {
            return Err(CoreError::new(
                CoreErrorKind::MalformedExpression,
                "alignment boundary is not a power of two",
            ));
        }
        self.boundary_val = boundary;
        if let Some(fill) = &self.fill {
            let val = const_u64(fill, ctx, "alignment fill")?;
            if val > 0xff {
                return Err(CoreError::new(
                    CoreErrorKind::MalformedExpression,
                    "alignment fill does not fit in a byte",
                ));
            }
            self.fill_val = Some(val as u8);
        }
        if let Some(maxskip) = &self.maxskip {
            self.maxskip_val = Some(const_u64(maxskip, ctx, "alignment maxskip")?);
        }
        Ok(())
    }

    /// Padding needed from `offset` to the boundary; zero when the skip
    /// would exceed maxskip.
    pub(crate) fn len_at(&mut self, offset: u64) -> u64 {
        let b = self.boundary_val;
        let mut pad = (b - offset % b) % b;
        if let Some(maxskip) = self.maxskip_val {
            if pad > maxskip {
                pad = 0;
            }
        }
        self.len = pad;
        pad
    }

    pub(crate) fn to_bytes(
        &self,
        buf: &mut Vec<u8>,
        out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError> {
        match self.fill_val {
            Some(f) => buf.extend(std::iter::repeat_n(f, self.len as usize)),
            None => buf.extend_from_slice(&out.fill_pattern(self.len)?),
        }
        Ok(())
    }
}

/// Put the following bytecode at a fixed section offset.
#[derive(Debug, Clone)]
pub struct Org {
    start: Expr,
    fill: u8,
    target: u64,
    len: u64,
}

impl Org {
    pub fn new(start: Expr, fill: u8) -> Self {
        Self {
            start,
            fill,
            target: 0,
            len: 0,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub(crate) fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        self.target = const_u64(&self.start, ctx, "org target")?;
        Ok(())
    }

    /// Fill length from `offset` up to the target; data already past the
    /// target cannot move backwards.
    pub(crate) fn len_at(&mut self, offset: u64) -> Result<u64, CoreError> {
        if self.target < offset {
            return Err(CoreError::new(
                CoreErrorKind::SectionOverflow,
                format!(
                    "org target {:#x} is behind the current offset {:#x}",
                    self.target, offset
                ),
            ));
        }
        self.len = self.target - offset;
        Ok(self.len)
    }

    pub(crate) fn to_bytes(
        &self,
        buf: &mut Vec<u8>,
        _out: &mut dyn ValueOutput,
    ) -> Result<(), CoreError> {
        buf.extend(std::iter::repeat_n(self.fill, self.len as usize));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_padding_wraps_at_boundary() {
        let mut align = Align::new(Expr::int(8), None, None);
        align.boundary_val = 8;
        assert_eq!(align.len_at(5), 3);
        assert_eq!(align.len_at(8), 0);
        assert_eq!(align.len_at(9), 7);
    }

    #[test]
    fn align_maxskip_suppresses_large_pads() {
        let mut align = Align::new(Expr::int(16), None, None);
        align.boundary_val = 16;
        align.maxskip_val = Some(3);
        assert_eq!(align.len_at(13), 3);
        assert_eq!(align.len_at(9), 0);
    }

    #[test]
    fn org_grows_to_target() {
        let mut org = Org::new(Expr::int(0x20), 0x90);
        org.target = 0x20;
        assert_eq!(org.len_at(0x18).unwrap(), 8);
        let err = org.len_at(0x28).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::SectionOverflow);
    }
}
