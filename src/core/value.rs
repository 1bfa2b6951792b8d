// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Expression evaluation and the sized value wrapper used for emission.
//!
//! `eval_expr` reduces an expression to an exact integer against a caller
//! context that supplies symbol values and location offsets; the optimizer
//! uses it for span distances and the emitter for final data values.
//!
//! A `Value` wraps a data expression with its destination size and splits
//! out the parts that must survive into relocations: a relative symbol, an
//! optional WRT base, and a SEG marker.

use super::error::{CoreError, CoreErrorKind};
use super::expr::{Expr, ExprTerm, Op, SimplifyOpts, TermKind};
use super::floatnum::FloatNum;
use super::intnum::IntNum;
use super::location::Location;
use super::symbol::{SymbolId, SymbolState, SymbolTable, SymbolValue};

/// Maximum depth for chained symbol resolution; past this the chain is
/// treated as circular.
const MAX_EVAL_DEPTH: u32 = 64;

/// What a symbol term resolves to during evaluation.
#[derive(Debug, Clone)]
pub enum EvalValue {
    Int(IntNum),
    Loc(Location),
    Expr(Expr),
}

/// Evaluation context: resolves symbols and places locations.
pub trait EvalContext {
    fn symbol_value(&self, id: SymbolId) -> Option<EvalValue>;
    fn location_offset(&self, loc: Location) -> Option<u64>;
}

/// Evaluate an expression to an exact integer.
pub fn eval_expr(e: &Expr, ctx: &dyn EvalContext) -> Result<IntNum, CoreError> {
    eval_inner(e, ctx, 0)
}

fn eval_inner(e: &Expr, ctx: &dyn EvalContext, depth: u32) -> Result<IntNum, CoreError> {
    if depth > MAX_EVAL_DEPTH {
        return Err(CoreError::new(
            CoreErrorKind::MalformedExpression,
            "circular symbol reference",
        ));
    }
    let op = e.op();
    match op {
        Op::Cond => {
            let terms = e.terms();
            if terms.len() != 3 {
                return Err(CoreError::new(
                    CoreErrorKind::MalformedExpression,
                    "conditional expression needs three terms",
                ));
            }
            let cond = eval_term(&terms[0], ctx, depth)?;
            let pick = if cond.is_zero() { 2 } else { 1 };
            eval_term(&terms[pick], ctx, depth)
        }
        Op::Seg | Op::Wrt | Op::SegOff => Err(CoreError::new(
            CoreErrorKind::MalformedExpression,
            "segment operator in integer expression",
        )),
        _ => {
            let terms = e.terms();
            let mut iter = terms.iter();
            let first = iter.next().ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InternalConsistency,
                    "expression with no terms",
                )
            })?;
            let mut acc = eval_term(first, ctx, depth)?;
            if terms.len() == 1 {
                if op != Op::Ident {
                    acc.calc(op, None)?;
                }
                return Ok(acc);
            }
            for term in iter {
                let rhs = eval_term(term, ctx, depth)?;
                acc.calc(op, Some(&rhs))?;
            }
            Ok(acc)
        }
    }
}

fn eval_term(term: &ExprTerm, ctx: &dyn EvalContext, depth: u32) -> Result<IntNum, CoreError> {
    match term {
        ExprTerm::Int(n) => Ok(n.clone()),
        ExprTerm::Expr(e) => eval_inner(e, ctx, depth + 1),
        ExprTerm::Loc(loc) => location_value(*loc, ctx),
        ExprTerm::Sym(id) => match ctx.symbol_value(*id) {
            Some(EvalValue::Int(n)) => Ok(n),
            Some(EvalValue::Loc(loc)) => location_value(loc, ctx),
            Some(EvalValue::Expr(e)) => eval_inner(&e, ctx, depth + 1),
            None => Err(CoreError::new(
                CoreErrorKind::UndefinedSymbol,
                "undefined symbol in expression",
            )),
        },
        ExprTerm::Float(_) => Err(CoreError::new(
            CoreErrorKind::MalformedExpression,
            "floating point value in integer expression",
        )),
        ExprTerm::Reg(_) => Err(CoreError::new(
            CoreErrorKind::MalformedExpression,
            "register in integer expression",
        )),
        ExprTerm::Subst(_) => Err(CoreError::new(
            CoreErrorKind::MalformedExpression,
            "unsubstituted placeholder in expression",
        )),
    }
}

fn location_value(loc: Location, ctx: &dyn EvalContext) -> Result<IntNum, CoreError> {
    ctx.location_offset(loc)
        .map(IntNum::from_u64)
        .ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::UnresolvableSpan,
                "location not yet placed",
            )
        })
}

/// Context resolving symbols against a table alone. Labels become
/// locations, which this context cannot place; anything needing an offset
/// fails and stays symbolic at the caller.
pub struct TableResolver<'a> {
    pub symbols: &'a SymbolTable,
}

impl EvalContext for TableResolver<'_> {
    fn symbol_value(&self, id: SymbolId) -> Option<EvalValue> {
        match self.symbols.get(id).state() {
            SymbolState::Equ(e) | SymbolState::Absolute(e) => Some(EvalValue::Expr(e.clone())),
            SymbolState::Label(loc) => Some(EvalValue::Loc(*loc)),
            _ => None,
        }
    }

    fn location_offset(&self, _loc: Location) -> Option<u64> {
        None
    }
}

/// Evaluate an expression that must be a table-resolvable constant (align
/// boundaries, org targets, reserve counts).
pub fn resolve_const(expr: &Expr, symbols: &SymbolTable) -> Result<IntNum, CoreError> {
    eval_expr(expr, &TableResolver { symbols })
}

/// Replace symbol terms with their resolved values throughout a tree:
/// resolved equs become integers, labels become location leaves, everything
/// else stays symbolic.
pub fn resolve_syms(expr: &mut Expr, symbols: &SymbolTable) {
    expr.traverse_post(&mut |e| {
        for term in e.terms_mut() {
            if let ExprTerm::Sym(id) = term {
                match symbols.resolve_value(*id) {
                    SymbolValue::Int(n) => *term = ExprTerm::Int(n),
                    SymbolValue::Loc(loc) => *term = ExprTerm::Loc(loc),
                    SymbolValue::Unresolved(_) => {}
                }
            }
        }
        false
    });
}

/// A data value headed for a fixed-size destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// Absolute portion; `None` when everything moved into `rel`.
    abs: Option<Expr>,
    /// Relative symbol portion surviving into a relocation.
    rel: Option<SymbolId>,
    /// Relocation base from a WRT composite.
    wrt: Option<SymbolId>,
    /// The value is the segment of `rel` rather than its offset.
    seg_of: bool,
    /// Destination size in bits.
    size: u32,
    /// Whether the destination is treated as signed.
    sign: bool,
}

impl Value {
    pub fn new(expr: Expr, size_bits: u32) -> Self {
        Self {
            abs: Some(expr),
            rel: None,
            wrt: None,
            seg_of: false,
            size: size_bits,
            sign: false,
        }
    }

    pub fn signed(expr: Expr, size_bits: u32) -> Self {
        Self {
            sign: true,
            ..Self::new(expr, size_bits)
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_signed(&self) -> bool {
        self.sign
    }

    pub fn rel(&self) -> Option<SymbolId> {
        self.rel
    }

    pub fn wrt(&self) -> Option<SymbolId> {
        self.wrt
    }

    pub fn is_seg_of(&self) -> bool {
        self.seg_of
    }

    pub fn abs_expr(&self) -> Option<&Expr> {
        self.abs.as_ref()
    }

    /// Resolve the expression against the completed symbol table and split
    /// out the relocatable parts. Fails when more than one symbol would
    /// have to survive into the output.
    pub fn finalize(&mut self, symbols: &SymbolTable) -> Result<(), CoreError> {
        let Some(mut expr) = self.abs.take() else {
            return Ok(());
        };
        resolve_syms(&mut expr, symbols);
        expr.simplify(SimplifyOpts::default())?;

        // WRT base splits off the right side.
        if expr.op() == Op::Wrt {
            let base = expr.extract_wrt().ok_or_else(|| {
                CoreError::new(CoreErrorKind::MalformedExpression, "malformed WRT")
            })?;
            self.wrt = base.as_symbol();
            if self.wrt.is_none() {
                return Err(CoreError::new(
                    CoreErrorKind::MalformedExpression,
                    "WRT base must be a single symbol",
                ));
            }
            expr.simplify(SimplifyOpts::default())?;
        }

        // SEG of a symbol keeps the symbol and marks segment emission.
        if expr.op() == Op::Seg {
            if let Some(ExprTerm::Sym(id)) = expr.terms().first() {
                self.seg_of = true;
                self.rel = Some(*id);
                self.abs = None;
                return Ok(());
            }
            return Err(CoreError::new(
                CoreErrorKind::MalformedExpression,
                "SEG of a non-symbol",
            ));
        }

        // Pull a single surviving symbol out of the top level.
        match expr.op() {
            Op::Ident => {
                if let Some(id) = expr.as_symbol() {
                    self.rel = Some(id);
                    self.abs = None;
                    return Ok(());
                }
            }
            Op::Add => {
                let sym_count = expr
                    .terms()
                    .iter()
                    .filter(|t| t.kind() == TermKind::Sym)
                    .count();
                if sym_count == 1 {
                    let terms = expr.terms_mut();
                    let idx = terms
                        .iter()
                        .position(|t| matches!(t, ExprTerm::Sym(_)));
                    if let Some(idx) = idx {
                        if let ExprTerm::Sym(id) = terms.remove(idx) {
                            self.rel = Some(id);
                        }
                    }
                    if expr.terms().len() == 1 {
                        expr = Expr::ident(expr.terms_mut().remove(0));
                    }
                    self.abs = Some(expr);
                    return Ok(());
                } else if sym_count > 1 {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedExpression,
                        "expression too complex to relocate",
                    ));
                }
            }
            _ => {
                if expr.contains(TermKind::Sym) {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedExpression,
                        "expression too complex to relocate",
                    ));
                }
            }
        }
        self.abs = Some(expr);
        Ok(())
    }

    /// Evaluate the absolute portion to an integer. Returns `None` when the
    /// value is still symbolic (a relocation must carry it) or, with
    /// `calc_dist` off, when it depends on unplaced locations.
    pub fn get_intnum(
        &self,
        ctx: &dyn EvalContext,
        calc_dist: bool,
    ) -> Result<Option<IntNum>, CoreError> {
        if self.rel.is_some() {
            return Ok(None);
        }
        let Some(abs) = &self.abs else {
            return Ok(Some(IntNum::zero()));
        };
        match eval_expr(abs, ctx) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == CoreErrorKind::UnresolvableSpan && !calc_dist => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The value as a float constant, when it is exactly that.
    pub fn get_float(&self) -> Option<&FloatNum> {
        if self.rel.is_some() {
            return None;
        }
        self.abs.as_ref().and_then(|e| e.as_float())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::section::SectionId;

    struct NoCtx;

    impl EvalContext for NoCtx {
        fn symbol_value(&self, _id: SymbolId) -> Option<EvalValue> {
            None
        }

        fn location_offset(&self, _loc: Location) -> Option<u64> {
            None
        }
    }

    struct OffsetCtx;

    impl EvalContext for OffsetCtx {
        fn symbol_value(&self, _id: SymbolId) -> Option<EvalValue> {
            None
        }

        fn location_offset(&self, loc: Location) -> Option<u64> {
            Some(loc.bc as u64 * 10)
        }
    }

    #[test]
    fn eval_folds_arithmetic() {
        let e = Expr::binary(
            Expr::int(2).into(),
            Op::Mul,
            Expr::binary(Expr::int(3).into(), Op::Add, Expr::int(4).into()).into(),
        );
        assert_eq!(eval_expr(&e, &NoCtx).unwrap(), IntNum::new(14));
    }

    #[test]
    fn eval_conditional_selects_branch() {
        let e = Expr::new(
            Op::Cond,
            vec![
                Expr::int(1).into(),
                Expr::int(10).into(),
                Expr::int(20).into(),
            ],
        )
        .unwrap();
        assert_eq!(eval_expr(&e, &NoCtx).unwrap(), IntNum::new(10));
        let e = Expr::new(
            Op::Cond,
            vec![
                Expr::int(0).into(),
                Expr::int(10).into(),
                Expr::int(20).into(),
            ],
        )
        .unwrap();
        assert_eq!(eval_expr(&e, &NoCtx).unwrap(), IntNum::new(20));
    }

    #[test]
    fn eval_reports_undefined_symbols() {
        let e = Expr::sym(SymbolId::for_tests(0));
        let err = eval_expr(&e, &NoCtx).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::UndefinedSymbol);
    }

    #[test]
    fn eval_location_difference() {
        let sect = SectionId::for_tests(0);
        let e = Expr::binary(
            Expr::loc(Location::at(sect, 5)).into(),
            Op::Sub,
            Expr::loc(Location::at(sect, 2)).into(),
        );
        assert_eq!(eval_expr(&e, &OffsetCtx).unwrap(), IntNum::new(30));
        let err = eval_expr(&e, &NoCtx).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::UnresolvableSpan);
    }

    #[test]
    fn value_finalize_splits_relative_symbol() {
        let mut symbols = SymbolTable::new();
        let lbl = symbols.lookup_or_create("lbl");
        let mut value = Value::new(
            Expr::binary(Expr::sym(lbl).into(), Op::Add, Expr::int(4).into()),
            32,
        );
        value.finalize(&symbols).unwrap();
        assert_eq!(value.rel(), Some(lbl));
        let abs = value.abs_expr().expect("absolute addend");
        assert_eq!(abs.as_intnum(), Some(&IntNum::new(4)));
    }

    #[test]
    fn value_finalize_resolves_equ_to_constant() {
        let mut symbols = SymbolTable::new();
        let foo = symbols.lookup_or_create("FOO");
        symbols
            .define_equ(
                foo,
                Expr::binary(
                    Expr::int(1).into(),
                    Op::Add,
                    Expr::binary(Expr::int(2).into(), Op::Mul, Expr::int(3).into()).into(),
                ),
                1,
            )
            .unwrap();
        let mut value = Value::new(Expr::sym(foo), 32);
        value.finalize(&symbols).unwrap();
        assert_eq!(value.rel(), None);
        assert_eq!(
            value.get_intnum(&NoCtx, true).unwrap(),
            Some(IntNum::new(7))
        );
    }

    #[test]
    fn value_finalize_rejects_two_symbols() {
        let mut symbols = SymbolTable::new();
        let a = symbols.lookup_or_create("a");
        let b = symbols.lookup_or_create("b");
        let mut value = Value::new(
            Expr::binary(Expr::sym(a).into(), Op::Add, Expr::sym(b).into()),
            16,
        );
        let err = value.finalize(&symbols).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::MalformedExpression);
    }

    #[test]
    fn value_finalize_splits_wrt_base() {
        let mut symbols = SymbolTable::new();
        let val = symbols.lookup_or_create("val");
        let base = symbols.lookup_or_create("base");
        let mut value = Value::new(
            Expr::binary(Expr::sym(val).into(), Op::Wrt, Expr::sym(base).into()),
            32,
        );
        value.finalize(&symbols).unwrap();
        assert_eq!(value.wrt(), Some(base));
        assert_eq!(value.rel(), Some(val));
    }

    #[test]
    fn value_seg_of_symbol_marks_segment() {
        let mut symbols = SymbolTable::new();
        let s = symbols.lookup_or_create("s");
        let mut value = Value::new(Expr::unary(Op::Seg, Expr::sym(s).into()), 16);
        value.finalize(&symbols).unwrap();
        assert!(value.is_seg_of());
        assert_eq!(value.rel(), Some(s));
    }

    #[test]
    fn float_value_is_exposed() {
        let symbols = SymbolTable::new();
        let mut value = Value::new(Expr::float(FloatNum::new(2.5)), 64);
        value.finalize(&symbols).unwrap();
        assert_eq!(value.get_float(), Some(&FloatNum::new(2.5)));
    }
}
