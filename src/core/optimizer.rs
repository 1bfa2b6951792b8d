// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Span-driven length resolution.
//!
//! Converges every bytecode's `(offset, length)` pair to a fixed point in
//! the presence of forward references and short/long form decisions. The
//! problem is monotone for span-driven contents: expansion only grows, and
//! every bytecode has a finite maximum size, so the queue drains. Align and
//! org lengths are recomputed through `update_offset` whenever preceding
//! bytecodes move.

use std::collections::{BTreeSet, VecDeque};

use super::bytecode::{FinalizeCtx, UNPLACED};
use super::error::{CoreError, CoreErrorKind, DiagnosticSink};
use super::expr::{Expr, ExprTerm};
use super::location::Location;
use super::object::{Object, ObjectConfig};
use super::section::{Section, SectionId};
use super::symbol::{SymbolState, SymbolTable};
use super::value::{eval_expr, EvalContext, EvalValue};

/// One length-dependency edge from a bytecode to a distance expression.
#[derive(Debug)]
struct Span {
    /// Owning bytecode.
    sect: SectionId,
    bc: usize,
    /// Content-chosen id; negative ids expand on every change.
    id: i32,
    depexpr: Expr,
    neg_thres: i64,
    pos_thres: i64,
    /// Value at the last expansion.
    cur_val: i64,
    /// Value at the last evaluation.
    new_val: i64,
    active: bool,
    /// Set when the dependent value cannot be expressed as a
    /// section-relative distance; the bytecode is driven to its long form.
    known_long: bool,
}

enum SpanVal {
    Val(i64),
    ForceLong,
    Fail(CoreError),
}

pub(crate) struct OffsetResolver<'a> {
    pub(crate) sections: &'a [Section],
    pub(crate) symbols: &'a SymbolTable,
}

impl EvalContext for OffsetResolver<'_> {
    fn symbol_value(&self, id: super::symbol::SymbolId) -> Option<EvalValue> {
        match self.symbols.get(id).state() {
            SymbolState::Equ(e) | SymbolState::Absolute(e) => Some(EvalValue::Expr(e.clone())),
            SymbolState::Label(loc) => Some(EvalValue::Loc(*loc)),
            _ => None,
        }
    }

    fn location_offset(&self, loc: Location) -> Option<u64> {
        let sect = self.sections.get(loc.sect.index())?;
        // One-past-the-end references the section end.
        if loc.bc == sect.len() {
            return Some(sect.vma() + sect.size() + loc.off);
        }
        let bc = sect.bytecode_at(loc.bc)?;
        if bc.offset() == UNPLACED {
            return None;
        }
        Some(sect.vma() + bc.offset() + loc.off)
    }
}

/// Sections referenced by the locations and labels of a span expression.
fn span_sections(expr: &Expr, symbols: &SymbolTable, out: &mut BTreeSet<SectionId>) {
    expr.traverse_leaves(&mut |t| {
        match t {
            ExprTerm::Loc(l) => {
                out.insert(l.sect);
            }
            ExprTerm::Sym(id) => {
                if let SymbolState::Label(l) = symbols.get(*id).state() {
                    out.insert(l.sect);
                }
            }
            _ => {}
        }
        false
    });
}

fn eval_span(span: &Span, sections: &[Section], symbols: &SymbolTable) -> SpanVal {
    if span.known_long {
        return SpanVal::ForceLong;
    }
    let mut sects = BTreeSet::new();
    span_sections(&span.depexpr, symbols, &mut sects);
    if sects.len() > 1 && !sects.iter().all(|s| sections[s.index()].is_absolute()) {
        // A distance between sections with unknown relative placement has
        // no resolvable value here; it surfaces as a relocation at emit.
        return SpanVal::ForceLong;
    }
    let resolver = OffsetResolver { sections, symbols };
    match eval_expr(&span.depexpr, &resolver) {
        Ok(n) => match n.to_i64() {
            Some(v) => SpanVal::Val(v),
            None => SpanVal::ForceLong,
        },
        Err(e) if e.kind() == CoreErrorKind::UndefinedSymbol => SpanVal::Fail(CoreError::new(
            CoreErrorKind::UnresolvableSpan,
            "span depends on an undefined symbol",
        )),
        Err(e) => SpanVal::Fail(e),
    }
}

/// Whether a span's last evaluation requires its bytecode to grow.
fn needs_expand(span: &Span) -> bool {
    if !span.active {
        return false;
    }
    if span.id < 0 {
        span.new_val != span.cur_val
    } else {
        span.new_val < span.neg_thres || span.new_val > span.pos_thres
    }
}

/// Walk every section, replacing offsets and recomputing offset-dependent
/// lengths. Fails on backwards org targets and section overflow.
fn recompute_offsets(
    sections: &mut [Section],
    config: &ObjectConfig,
    diags: &mut DiagnosticSink,
) -> bool {
    for sect in sections.iter_mut() {
        let mut offset = 0u64;
        for idx in 0..sect.len() {
            let Some(bc) = sect.bytecode_mut(idx) else {
                continue;
            };
            match bc.update_offset(offset) {
                Ok(next) => offset = next,
                Err(e) => {
                    diags.error(e);
                    return false;
                }
            }
        }
        let max = sect.max_size().or(config.section_max);
        if let Some(max) = max {
            if sect.size() > max {
                diags.error(CoreError::new(
                    CoreErrorKind::SectionOverflow,
                    format!(
                        "section `{}` grew to {} bytes, past its maximum of {max}",
                        sect.name(),
                        sect.size()
                    ),
                ));
                return false;
            }
        }
    }
    true
}

/// Resolve all bytecode offsets and lengths to a fixed point.
///
/// Runs after `Object::finalize`. On return, either `diags` holds a hard
/// error or every bytecode has its final `(offset, length)` pair.
pub fn optimize(object: &mut Object, diags: &mut DiagnosticSink) {
    let mut spans: Vec<Span> = Vec::new();
    let mut total_bcs = 0usize;

    // Initial sizing: minimum lengths and span registration.
    {
        let symbols = &object.symbols;
        let includes = &object.includes;
        let ctx = FinalizeCtx {
            symbols,
            includes,
            line: 0,
        };
        for (si, sect) in object.sections.iter_mut().enumerate() {
            let sect_id = SectionId::new(si);
            for idx in 0..sect.len() {
                total_bcs += 1;
                let loc = Location::at(sect_id, idx);
                let Some(bc) = sect.bytecode_mut(idx) else {
                    continue;
                };
                let mut add = |id: i32, depexpr: Expr, neg_thres: i64, pos_thres: i64| {
                    spans.push(Span {
                        sect: sect_id,
                        bc: idx,
                        id,
                        depexpr,
                        neg_thres,
                        pos_thres,
                        cur_val: 0,
                        new_val: 0,
                        active: true,
                        known_long: false,
                    });
                };
                if let Err(e) = bc.calc_len(loc, &ctx, &mut add) {
                    diags.error(e);
                }
            }
        }
    }
    if diags.has_errors() {
        return;
    }
    tracing::debug!(bytecodes = total_bcs, spans = spans.len(), "initial sizing done");

    if !recompute_offsets(&mut object.sections, &object.config, diags) {
        return;
    }

    // Evaluate spans and queue the ones outside their windows. Negative-id
    // spans were sized against an estimate, so any known value counts as a
    // change.
    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, span) in spans.iter_mut().enumerate() {
        match eval_span(span, &object.sections, &object.symbols) {
            SpanVal::Val(v) => {
                span.new_val = v;
                if needs_expand(span) {
                    queue.push_back(i);
                }
            }
            SpanVal::ForceLong => {
                span.known_long = true;
                span.new_val = span.pos_thres.saturating_add(1);
                queue.push_back(i);
            }
            SpanVal::Fail(e) => {
                span.active = false;
                diags.error(e);
            }
        }
    }
    if diags.has_errors() {
        return;
    }

    // Monotone expansion to the fixed point. The cap is far above any
    // legitimate amount of work; reaching it means the contents violated
    // the protocol.
    let cap = 100 * total_bcs + 1000;
    let mut iterations = 0usize;
    while let Some(i) = queue.pop_front() {
        iterations += 1;
        if iterations > cap {
            diags.error(CoreError::new(
                CoreErrorKind::InternalConsistency,
                "span resolution did not converge",
            ));
            return;
        }
        if !needs_expand(&spans[i]) {
            continue;
        }

        let (sect_id, bc_idx) = (spans[i].sect, spans[i].bc);
        let span = &mut spans[i];
        let result = match object.sections[sect_id.index()].bytecode_mut(bc_idx) {
            Some(bc) => bc.expand(span.id, span.cur_val, span.new_val),
            None => Err(CoreError::new(
                CoreErrorKind::InternalConsistency,
                "span references a missing bytecode",
            )),
        };
        match result {
            Ok(exp) => {
                span.cur_val = span.new_val;
                span.neg_thres = exp.neg_thres;
                span.pos_thres = exp.pos_thres;
                if !exp.keep {
                    span.active = false;
                }
            }
            Err(e) => {
                diags.error(e);
                return;
            }
        }

        if !recompute_offsets(&mut object.sections, &object.config, diags) {
            return;
        }

        // Shifted offsets may push other spans out of their windows.
        for (j, span) in spans.iter_mut().enumerate() {
            if !span.active {
                continue;
            }
            match eval_span(span, &object.sections, &object.symbols) {
                SpanVal::Val(v) => {
                    span.new_val = v;
                    if needs_expand(span) {
                        queue.push_back(j);
                    }
                }
                SpanVal::ForceLong => {
                    span.known_long = true;
                    span.new_val = span.pos_thres.saturating_add(1);
                    queue.push_back(j);
                }
                SpanVal::Fail(e) => {
                    span.active = false;
                    diags.error(e);
                }
            }
        }
        if diags.has_errors() {
            return;
        }
    }
    tracing::debug!(iterations, "span resolution converged");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bytecode::{create_align, create_insn, create_org, create_reserve};
    use crate::core::section::SectionAttrs;
    use crate::core::testutil::{data_bytes, TestArch, TestJmp};

    fn object_with_text() -> (Object, SectionId) {
        let mut obj = Object::new("t.asm", "t.o", Box::new(TestArch));
        let text = obj
            .get_or_create_section(".text", SectionAttrs::code())
            .unwrap();
        obj.set_cur_section(text);
        (obj, text)
    }

    fn run(obj: &mut Object) -> DiagnosticSink {
        let mut diags = DiagnosticSink::new();
        obj.finalize(&mut diags);
        assert!(!diags.has_errors(), "finalize failed: {:?}", diags.diagnostics());
        optimize(obj, &mut diags);
        diags
    }

    #[test]
    fn offsets_are_cumulative_and_monotone() {
        let (mut obj, text) = object_with_text();
        obj.append_bytecode(data_bytes(&[1, 2, 3], 1)).unwrap();
        obj.append_bytecode(data_bytes(&[4, 5], 2)).unwrap();
        obj.append_bytecode(data_bytes(&[6], 3)).unwrap();
        let diags = run(&mut obj);
        assert!(!diags.has_errors());

        let sect = obj.section(text);
        let mut expect = 0;
        for bc in sect.iter() {
            assert_eq!(bc.offset(), expect);
            expect = bc.next_offset();
        }
        assert_eq!(sect.size(), 6);
    }

    #[test]
    fn align_inserts_padding_to_boundary() {
        let (mut obj, text) = object_with_text();
        obj.append_bytecode(data_bytes(&[0; 5], 1)).unwrap();
        obj.append_bytecode(create_align(Expr::int(8), None, None, 2))
            .unwrap();
        obj.append_bytecode(data_bytes(&[0xaa], 3)).unwrap();
        let diags = run(&mut obj);
        assert!(!diags.has_errors());

        let sect = obj.section(text);
        assert_eq!(sect.bytecode_at(1).map(|bc| bc.len()), Some(3));
        assert_eq!(sect.bytecode_at(2).map(|bc| bc.offset()), Some(8));
    }

    #[test]
    fn align_recomputes_when_preceding_bytes_change() {
        // Same program but with 7 bytes before the align: padding is 1.
        let (mut obj, text) = object_with_text();
        obj.append_bytecode(data_bytes(&[0; 7], 1)).unwrap();
        obj.append_bytecode(create_align(Expr::int(8), None, None, 2))
            .unwrap();
        obj.append_bytecode(data_bytes(&[0xaa], 3)).unwrap();
        let diags = run(&mut obj);
        assert!(!diags.has_errors());

        let sect = obj.section(text);
        assert_eq!(sect.bytecode_at(1).map(|bc| bc.len()), Some(1));
        assert_eq!(sect.bytecode_at(2).map(|bc| bc.offset()), Some(8));
    }

    #[test]
    fn org_pushes_following_bytecode_to_target() {
        let (mut obj, text) = object_with_text();
        obj.append_bytecode(data_bytes(&[1, 2], 1)).unwrap();
        obj.append_bytecode(create_org(Expr::int(0x10), 0x00, 2))
            .unwrap();
        obj.append_bytecode(data_bytes(&[3], 3)).unwrap();
        let diags = run(&mut obj);
        assert!(!diags.has_errors());
        assert_eq!(obj.section(text).bytecode_at(2).map(|bc| bc.offset()), Some(0x10));
    }

    #[test]
    fn org_behind_current_offset_fails() {
        let (mut obj, _) = object_with_text();
        obj.append_bytecode(data_bytes(&[0; 0x20], 1)).unwrap();
        obj.append_bytecode(create_org(Expr::int(0x10), 0x00, 2))
            .unwrap();
        let mut diags = DiagnosticSink::new();
        obj.finalize(&mut diags);
        optimize(&mut obj, &mut diags);
        assert!(diags.has_errors());
        assert_eq!(
            diags.diagnostics()[0].kind(),
            CoreErrorKind::SectionOverflow
        );
    }

    #[test]
    fn forward_jump_past_threshold_goes_long() {
        let (mut obj, text) = object_with_text();
        let target = obj.symbols_mut().lookup_or_create("l");
        obj.append_bytecode(create_insn(Box::new(TestJmp::to(Expr::sym(target))), 1))
            .unwrap();
        let mut filler = data_bytes(&[0], 2);
        filler.set_multiple(Expr::int(200));
        obj.append_bytecode(filler).unwrap();
        obj.define_label("l", 3).unwrap();
        // Label past the end of the fill.
        let end = obj.current_location().unwrap();
        assert_eq!(end.bc, 2);

        let diags = run(&mut obj);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        let sect = obj.section(text);
        assert_eq!(sect.bytecode_at(0).map(|bc| bc.len()), Some(5));
        assert_eq!(sect.bytecode_at(1).map(|bc| bc.offset()), Some(5));
        assert_eq!(sect.size(), 205);
    }

    #[test]
    fn short_jump_stays_short() {
        let (mut obj, text) = object_with_text();
        let target = obj.symbols_mut().lookup_or_create("l");
        obj.append_bytecode(create_insn(Box::new(TestJmp::to(Expr::sym(target))), 1))
            .unwrap();
        let mut filler = data_bytes(&[0], 2);
        filler.set_multiple(Expr::int(50));
        obj.append_bytecode(filler).unwrap();
        obj.define_label("l", 3).unwrap();

        let diags = run(&mut obj);
        assert!(!diags.has_errors());
        let sect = obj.section(text);
        assert_eq!(sect.bytecode_at(0).map(|bc| bc.len()), Some(2));
        assert_eq!(sect.size(), 52);
    }

    #[test]
    fn borderline_distance_crosses_into_long_form() {
        let (mut obj, text) = object_with_text();
        let target = obj.symbols_mut().lookup_or_create("l");
        obj.append_bytecode(create_insn(Box::new(TestJmp::to(Expr::sym(target))), 1))
            .unwrap();
        let mut filler = data_bytes(&[0], 2);
        filler.set_multiple(Expr::int(126));
        obj.append_bytecode(filler).unwrap();
        obj.define_label("l", 3).unwrap();
        // Distance from the jump start is 2+126 = 128, one past the +127
        // window, so the long form is required.
        let diags = run(&mut obj);
        assert!(!diags.has_errors());
        assert_eq!(obj.section(text).bytecode_at(0).map(|bc| bc.len()), Some(5));
    }

    #[test]
    fn undefined_span_symbol_is_an_unresolvable_span() {
        let (mut obj, _) = object_with_text();
        let missing = obj.symbols_mut().lookup_or_create("missing");
        obj.append_bytecode(create_insn(Box::new(TestJmp::to(Expr::sym(missing))), 1))
            .unwrap();
        let mut diags = DiagnosticSink::new();
        obj.finalize(&mut diags);
        optimize(&mut obj, &mut diags);
        assert!(diags.has_errors());
        assert_eq!(
            diags.diagnostics()[0].kind(),
            CoreErrorKind::UnresolvableSpan
        );
    }

    #[test]
    fn section_overflow_is_reported() {
        let (mut obj, _) = object_with_text();
        obj.config_mut().section_max = Some(16);
        obj.append_bytecode(data_bytes(&[0; 32], 1)).unwrap();
        let mut diags = DiagnosticSink::new();
        obj.finalize(&mut diags);
        optimize(&mut obj, &mut diags);
        assert!(diags.has_errors());
        assert_eq!(
            diags.diagnostics()[0].kind(),
            CoreErrorKind::SectionOverflow
        );
    }

    #[test]
    fn reservations_size_absolute_sections() {
        let mut obj = Object::new("t.asm", "t.o", Box::new(TestArch));
        let abs = obj.create_absolute_section(Expr::int(0x80));
        obj.set_cur_section(abs);
        obj.append_bytecode(create_reserve(Expr::int(4), 2, 1))
            .unwrap();
        let diags = run(&mut obj);
        assert!(!diags.has_errors());
        let sect = obj.section(abs);
        assert_eq!(sect.vma(), 0x80);
        assert_eq!(sect.size(), 8);
    }
}
