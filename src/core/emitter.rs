// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Byte emission: walks resolved bytecodes and produces the object image.
//!
//! Runs only after the optimizer has fixed every `(offset, length)` pair
//! and no hard error is pending. Concrete values land in section byte
//! buffers; symbolic references are handed to the object format as
//! relocations with the destination bits carrying the addend.

use super::arch::Endian;
use super::bytecode::{SpecialKind, ValueOutput};
use super::error::{CoreError, CoreErrorKind, DiagnosticSink};
use super::expr::Expr;
use super::floatnum::FloatWarn;
use super::intnum::{IntNum, Overflow};
use super::location::Location;
use super::object::Object;
use super::objfmt::{ObjFmt, Relocation};
use super::optimizer::OffsetResolver;
use super::section::SectionId;
use super::symbol::SymbolId;
use super::value::{eval_expr, Value};

/// Emitted form of one section.
#[derive(Debug)]
pub struct SectionImage {
    pub id: SectionId,
    pub name: String,
    pub vma: u64,
    /// Emitted bytes. Gap ranges are zero-filled, except in bss-attributed
    /// sections where nothing is materialized.
    pub bytes: Vec<u8>,
    /// Reservation ranges as `(section offset, length)`.
    pub gaps: Vec<(u64, u64)>,
    pub relocs: Vec<Relocation>,
}

/// Emitted form of a whole object, in section declaration order.
#[derive(Debug)]
pub struct ObjectImage {
    pub sections: Vec<SectionImage>,
}

impl ObjectImage {
    pub fn section_by_name(&self, name: &str) -> Option<&SectionImage> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Emission context for one section; implements the value/reloc callbacks
/// handed to bytecode contents.
struct Output<'a> {
    object: &'a Object,
    objfmt: &'a dyn ObjFmt,
    diags: &'a mut DiagnosticSink,
    cur_sect: SectionId,
    line: u32,
    relocs: Vec<Relocation>,
}

impl Output<'_> {
    fn resolver(&self) -> OffsetResolver<'_> {
        OffsetResolver {
            sections: self.object.sections(),
            symbols: self.object.symbols(),
        }
    }

    fn endian(&self) -> Endian {
        self.object
            .section(self.cur_sect)
            .endian()
            .unwrap_or_else(|| self.object.arch().default_endian())
    }

    /// Section-relative offset of a destination location.
    fn dest_offset(&self, loc: Location) -> Result<u64, CoreError> {
        let sect = self.object.section(loc.sect);
        let bc = sect.bytecode_at(loc.bc).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::InternalConsistency,
                "emission location outside its section",
            )
        })?;
        Ok(bc.offset() + loc.off)
    }

    fn warn_overflow(&mut self, size_bits: u32, overflow: Overflow) {
        let signed = match overflow {
            Overflow::None => return,
            Overflow::Signed => true,
            Overflow::Unsigned => false,
        };
        let kind = if signed { "signed" } else { "unsigned" };
        self.diags.warning(CoreError::with_line(
            CoreErrorKind::Overflow,
            format!("value does not fit in {size_bits} bits ({kind})"),
            self.line,
        ));
    }
}

impl ValueOutput for Output<'_> {
    fn emit_value(
        &mut self,
        value: &Value,
        buf: &mut [u8],
        loc: Location,
        warn: i32,
    ) -> Result<(), CoreError> {
        if let Some(f) = value.get_float() {
            let w = f.write_to(buf, self.endian())?;
            if warn != 0 && w != FloatWarn::None {
                let what = if w == FloatWarn::Overflow {
                    "overflow"
                } else {
                    "underflow"
                };
                self.diags.warning(CoreError::with_line(
                    CoreErrorKind::Overflow,
                    format!("floating point {what}"),
                    self.line,
                ));
            }
            return Ok(());
        }

        match value.get_intnum(&self.resolver(), true)? {
            Some(n) => {
                let overflow = n.write_to(buf, self.endian(), warn);
                self.warn_overflow(buf.len() as u32 * 8, overflow);
            }
            None => {
                // Still symbolic: the object format records a relocation
                // and the destination carries the absolute addend.
                let sym = value.rel().ok_or_else(|| {
                    CoreError::new(
                        CoreErrorKind::InternalConsistency,
                        "symbolic value without a relative symbol",
                    )
                })?;
                let reloc = self.objfmt.make_reloc(
                    sym,
                    self.dest_offset(loc)?,
                    value.size(),
                    value.is_seg_of(),
                    value.wrt(),
                );
                self.relocs.push(reloc);
                buf.fill(0);
                if let Some(abs) = value.abs_expr() {
                    let addend = eval_expr(abs, &self.resolver())?;
                    let overflow = addend.write_to(buf, self.endian(), warn);
                    self.warn_overflow(buf.len() as u32 * 8, overflow);
                }
            }
        }
        Ok(())
    }

    fn emit_reloc(
        &mut self,
        sym: SymbolId,
        loc: Location,
        buf: &mut [u8],
        valsize: u32,
        _warn: i32,
    ) -> Result<(), CoreError> {
        let reloc = self
            .objfmt
            .make_reloc(sym, self.dest_offset(loc)?, valsize, false, None);
        self.relocs.push(reloc);
        buf.fill(0);
        Ok(())
    }

    fn eval_to_int(&self, expr: &Expr) -> Result<IntNum, CoreError> {
        eval_expr(expr, &self.resolver())
    }

    fn fill_pattern(&self, len: u64) -> Result<Vec<u8>, CoreError> {
        if self.object.section(self.cur_sect).attrs().code {
            self.object.arch().code_fill(len)
        } else {
            Ok(vec![0; len as usize])
        }
    }
}

/// Walk every section in declaration order and emit bytes, gaps, and
/// relocations. Returns `None` when a hard error was already pending or
/// emission itself raised one; relocations are also attached to their
/// sections.
pub fn output(
    object: &mut Object,
    objfmt: &mut dyn ObjFmt,
    diags: &mut DiagnosticSink,
) -> Option<ObjectImage> {
    if diags.has_errors() {
        return None;
    }
    tracing::debug!(sections = object.sections().len(), "emit start");

    let mut images = Vec::new();
    let sect_ids: Vec<SectionId> = object.section_ids().collect();
    for sect_id in sect_ids {
        let sect = object.section(sect_id);
        let mut image = SectionImage {
            id: sect_id,
            name: sect.name().to_string(),
            vma: sect.vma(),
            bytes: Vec::new(),
            gaps: Vec::new(),
            relocs: Vec::new(),
        };
        let materialize_gaps = !sect.attrs().bss && !sect.is_absolute();
        let mut out = Output {
            object: &*object,
            objfmt: &*objfmt,
            diags: &mut *diags,
            cur_sect: sect_id,
            line: 0,
            relocs: Vec::new(),
        };

        for (idx, bc) in sect.iter().enumerate() {
            out.line = bc.line();
            if bc.special_kind() == SpecialKind::Reservation {
                let gap = bc.total_len();
                image.gaps.push((bc.offset(), gap));
                if materialize_gaps {
                    image.bytes.extend(std::iter::repeat_n(0u8, gap as usize));
                }
                continue;
            }
            let loc = Location::at(sect_id, idx);
            let mut once = Vec::with_capacity(bc.len() as usize);
            if let Err(e) = bc.to_bytes(loc, &mut once, &mut out) {
                out.diags.error(e);
                continue;
            }
            if once.len() as u64 != bc.len() {
                out.diags.error(CoreError::with_line(
                    CoreErrorKind::InternalConsistency,
                    format!(
                        "bytecode emitted {} bytes but resolved to {}",
                        once.len(),
                        bc.len()
                    ),
                    bc.line(),
                ));
                continue;
            }
            for _ in 0..bc.mult_int() {
                image.bytes.extend_from_slice(&once);
            }
        }
        image.relocs = out.relocs;
        images.push(image);
    }

    for image in &images {
        for reloc in &image.relocs {
            object.section_mut(image.id).add_reloc(reloc.clone());
        }
    }
    if diags.has_errors() {
        return None;
    }
    tracing::debug!("emit done");
    Some(ObjectImage { sections: images })
}
