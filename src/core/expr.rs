// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Expression trees and algebraic simplification.
//!
//! An `Expr` is an operator tag plus an ordered list of terms; a term is a
//! constant, register, symbol, location, substitution placeholder, or a
//! nested expression. `simplify` rewrites a tree into canonical form:
//! negation is distributed as multiply-by-minus-one, nested associative
//! operators are leveled into one n-ary node, integer constants are folded,
//! algebraic identities are eliminated, and commutative terms are ordered so
//! that equivalent trees compare structurally equal.

use std::cmp::Ordering;
use std::fmt;

use super::arch::Register;
use super::error::{CoreError, CoreErrorKind};
use super::floatnum::FloatNum;
use super::intnum::IntNum;
use super::location::Location;
use super::symbol::SymbolId;

/// Expression operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Single-term wrapper; the canonical leaf form.
    Ident,
    Add,
    Sub,
    Mul,
    Div,
    SignDiv,
    Mod,
    SignMod,
    Neg,
    Not,
    Or,
    And,
    Xor,
    Xnor,
    Nor,
    Shl,
    Shr,
    Lor,
    Land,
    Lnot,
    Lxor,
    Lxnor,
    Lnor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Seg,
    Wrt,
    SegOff,
    Cond,
}

impl Op {
    /// Operators taking exactly one term.
    pub fn is_unary(self) -> bool {
        matches!(self, Op::Ident | Op::Neg | Op::Not | Op::Lnot | Op::Seg)
    }

    /// Operators that may keep more than two terms after leveling.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            Op::Add | Op::Mul | Op::Or | Op::And | Op::Xor | Op::Lor | Op::Land | Op::Lxor
        )
    }

    /// Operators whose term order does not matter; only these are reordered
    /// into canonical form.
    pub fn is_commutative(self) -> bool {
        self.is_associative()
    }

    /// Whether integer constants may be combined under this operator.
    pub fn folds_constants(self) -> bool {
        !matches!(self, Op::Seg | Op::Wrt | Op::SegOff | Op::Cond)
    }
}

/// Leaf variant tags, used for containment queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Int,
    Float,
    Reg,
    Sym,
    Loc,
    Subst,
    Expr,
}

/// A single expression term.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprTerm {
    Int(IntNum),
    Float(FloatNum),
    Reg(Register),
    Sym(SymbolId),
    Loc(Location),
    Subst(usize),
    Expr(Box<Expr>),
}

impl ExprTerm {
    pub fn kind(&self) -> TermKind {
        match self {
            ExprTerm::Int(_) => TermKind::Int,
            ExprTerm::Float(_) => TermKind::Float,
            ExprTerm::Reg(_) => TermKind::Reg,
            ExprTerm::Sym(_) => TermKind::Sym,
            ExprTerm::Loc(_) => TermKind::Loc,
            ExprTerm::Subst(_) => TermKind::Subst,
            ExprTerm::Expr(_) => TermKind::Expr,
        }
    }

    pub fn get_int(&self) -> Option<&IntNum> {
        match self {
            ExprTerm::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn get_expr(&self) -> Option<&Expr> {
        match self {
            ExprTerm::Expr(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IntNum> for ExprTerm {
    fn from(n: IntNum) -> Self {
        ExprTerm::Int(n)
    }
}

impl From<i64> for ExprTerm {
    fn from(n: i64) -> Self {
        ExprTerm::Int(IntNum::new(n))
    }
}

impl From<Expr> for ExprTerm {
    fn from(e: Expr) -> Self {
        ExprTerm::Expr(Box::new(e))
    }
}

/// Options controlling simplification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplifyOpts {
    /// Destroy `1*reg` products. Off by default so that an explicit scale
    /// of one survives into effective-address construction.
    pub simplify_reg_mul: bool,
}

/// A tagged n-ary expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    op: Op,
    terms: Vec<ExprTerm>,
}

impl Expr {
    /// Build a leaf wrapped in `Ident`.
    pub fn ident(term: ExprTerm) -> Self {
        let mut e = Expr {
            op: Op::Ident,
            terms: Vec::with_capacity(1),
        };
        e.add_term(term);
        e
    }

    pub fn int(val: i64) -> Self {
        Self::ident(ExprTerm::Int(IntNum::new(val)))
    }

    pub fn intnum(val: IntNum) -> Self {
        Self::ident(ExprTerm::Int(val))
    }

    pub fn float(val: FloatNum) -> Self {
        Self::ident(ExprTerm::Float(val))
    }

    pub fn sym(id: SymbolId) -> Self {
        Self::ident(ExprTerm::Sym(id))
    }

    pub fn reg(reg: Register) -> Self {
        Self::ident(ExprTerm::Reg(reg))
    }

    pub fn loc(loc: Location) -> Self {
        Self::ident(ExprTerm::Loc(loc))
    }

    pub fn subst(index: usize) -> Self {
        Self::ident(ExprTerm::Subst(index))
    }

    /// Build an n-ary expression, enforcing the operator's arity rules.
    pub fn new(op: Op, terms: Vec<ExprTerm>) -> Result<Self, CoreError> {
        match terms.len() {
            0 => {
                return Err(CoreError::new(
                    CoreErrorKind::MalformedExpression,
                    "expression must have at least one term",
                ))
            }
            1 => {
                if !op.is_unary() {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedExpression,
                        "expression with one term must be unary",
                    ));
                }
            }
            2 => {
                if op.is_unary() || op == Op::Cond {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedExpression,
                        "wrong number of terms for operator",
                    ));
                }
            }
            3 if op == Op::Cond => {}
            _ => {
                if !op.is_associative() {
                    return Err(CoreError::new(
                        CoreErrorKind::MalformedExpression,
                        "expression with more than two terms must be associative",
                    ));
                }
            }
        }
        let mut e = Expr {
            op,
            terms: Vec::with_capacity(terms.len()),
        };
        for term in terms {
            e.add_term(term);
        }
        Ok(e)
    }

    /// Build a unary expression. `op` must be unary.
    pub fn unary(op: Op, term: ExprTerm) -> Self {
        debug_assert!(op.is_unary());
        let mut e = Expr {
            op,
            terms: Vec::with_capacity(1),
        };
        e.add_term(term);
        e
    }

    /// Build a binary expression. `op` must not be unary.
    pub fn binary(a: ExprTerm, op: Op, b: ExprTerm) -> Self {
        debug_assert!(!op.is_unary() && op != Op::Cond);
        let mut e = Expr {
            op,
            terms: Vec::with_capacity(2),
        };
        e.add_term(a);
        e.add_term(b);
        e
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn terms(&self) -> &[ExprTerm] {
        &self.terms
    }

    pub(crate) fn terms_mut(&mut self) -> &mut Vec<ExprTerm> {
        &mut self.terms
    }

    /// Append a term, bringing up through any chain of single-term `Ident`
    /// wrappers so leaves are stored directly.
    fn add_term(&mut self, term: ExprTerm) {
        let mut term = term;
        loop {
            match term {
                ExprTerm::Expr(mut e) if e.op == Op::Ident && e.terms.len() == 1 => {
                    match e.terms.pop() {
                        Some(inner) => term = inner,
                        None => return,
                    }
                }
                other => {
                    self.terms.push(other);
                    return;
                }
            }
        }
    }

    // ---- value accessors (valid only on Ident-wrapped leaves) ----

    pub fn as_intnum(&self) -> Option<&IntNum> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Int(n))) => Some(n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&FloatNum> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Float(f))) => Some(f),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<SymbolId> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Sym(s))) => Some(*s),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<Register> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Reg(r))) => Some(*r),
            _ => None,
        }
    }

    pub fn as_location(&self) -> Option<Location> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Loc(l))) => Some(*l),
            _ => None,
        }
    }

    /// Deep copy with the term at `except` left out. Falls back to a full
    /// clone for single-term expressions.
    pub fn clone_except(&self, except: usize) -> Expr {
        if self.terms.len() == 1 {
            return self.clone();
        }
        Expr {
            op: self.op,
            terms: self
                .terms
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != except)
                .map(|(_, t)| t.clone())
                .collect(),
        }
    }

    // ---- traversal ----

    /// Post-order walk over every sub-expression. Stops early (returning
    /// true) when the callback returns true.
    pub fn traverse_post<F>(&mut self, f: &mut F) -> bool
    where
        F: FnMut(&mut Expr) -> bool,
    {
        for term in &mut self.terms {
            if let ExprTerm::Expr(e) = term {
                if e.traverse_post(f) {
                    return true;
                }
            }
        }
        f(self)
    }

    /// In-order walk over the leaves of the flattened form.
    pub fn traverse_leaves<F>(&self, f: &mut F) -> bool
    where
        F: FnMut(&ExprTerm) -> bool,
    {
        for term in &self.terms {
            match term {
                ExprTerm::Expr(e) => {
                    if e.traverse_leaves(f) {
                        return true;
                    }
                }
                leaf => {
                    if f(leaf) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether any leaf of the tree has the given kind.
    pub fn contains(&self, kind: TermKind) -> bool {
        self.traverse_leaves(&mut |t| t.kind() == kind)
    }

    /// Replace every `Subst` placeholder with a clone of the corresponding
    /// entry. Out-of-range indices fail.
    pub fn substitute(&mut self, subst: &[ExprTerm]) -> Result<(), CoreError> {
        for term in &mut self.terms {
            match term {
                ExprTerm::Expr(e) => e.substitute(subst)?,
                ExprTerm::Subst(i) => {
                    let repl = subst.get(*i).ok_or_else(|| {
                        CoreError::new(
                            CoreErrorKind::MalformedExpression,
                            "substitution index out of range",
                        )
                    })?;
                    *term = repl.clone();
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- simplification ----

    /// Rewrite into canonical form: negation distribution, leveling,
    /// constant folding, identity elimination, SEG:OFF projection, and
    /// commutative term ordering. Idempotent.
    pub fn simplify(&mut self, opts: SimplifyOpts) -> Result<(), CoreError> {
        self.level_tree(true, true, opts.simplify_reg_mul)?;
        self.order_terms_deep();
        Ok(())
    }

    /// Level the tree without identity simplification; used where term
    /// positions must be preserved for later splitting.
    pub fn level_only(&mut self) -> Result<(), CoreError> {
        self.level_tree(true, false, false)
    }

    fn level_tree(
        &mut self,
        fold_const: bool,
        simplify_ident: bool,
        simplify_reg_mul: bool,
    ) -> Result<(), CoreError> {
        self.xform_neg();

        for term in &mut self.terms {
            if let ExprTerm::Expr(e) = term {
                e.level_tree(fold_const, simplify_ident, simplify_reg_mul)?;
            }
        }

        // SEG of SEG:OFF simplifies to just the segment.
        if self.op == Op::Seg {
            if let Some(ExprTerm::Expr(e)) = self.terms.first_mut() {
                if e.op == Op::SegOff && e.terms.len() == 2 {
                    self.op = Op::Ident;
                    e.op = Op::Ident;
                    e.terms.pop();
                }
            }
        }

        self.level_op(fold_const, simplify_ident, simplify_reg_mul)
    }

    /// Negate a single term in place by building a `-1*term` product.
    fn neg_term(term: &mut ExprTerm) {
        let old = std::mem::replace(term, ExprTerm::Subst(0));
        *term = ExprTerm::Expr(Box::new(Expr {
            op: Op::Mul,
            terms: vec![ExprTerm::Int(IntNum::new(-1)), old],
        }));
    }

    /// Transform `-x` and `a-b` into multiply-by-minus-one form at this
    /// node. Called once per node during the post-order leveling walk.
    fn xform_neg(&mut self) {
        match self.op {
            Op::Neg => {
                self.op = Op::Ident;
                self.xform_neg_helper();
            }
            Op::Sub => {
                self.op = Op::Add;
                if let Some(rhs) = self.terms.get_mut(1) {
                    match rhs {
                        ExprTerm::Expr(e) => e.xform_neg_helper(),
                        other => Self::neg_term(other),
                    }
                }
            }
            _ => {}
        }
    }

    /// Negate this whole expression, distributing over `Add` and computing
    /// constants in place.
    fn xform_neg_helper(&mut self) {
        match self.op {
            Op::Add => {
                for term in &mut self.terms {
                    match term {
                        ExprTerm::Expr(e) => e.xform_neg_helper(),
                        other => Self::neg_term(other),
                    }
                }
            }
            Op::Sub => {
                // -(a-b) = (-a)+b
                self.op = Op::Add;
                if let Some(lhs) = self.terms.first_mut() {
                    match lhs {
                        ExprTerm::Expr(e) => e.xform_neg_helper(),
                        other => Self::neg_term(other),
                    }
                }
            }
            Op::Neg => {
                // Double negation collapses.
                self.op = Op::Ident;
            }
            Op::Ident => {
                // Constants negate in place; a wrapped expression absorbs
                // the negation itself (distributing through Add); only a
                // bare leaf becomes a -1 product.
                let in_place = match self.terms.first_mut() {
                    Some(ExprTerm::Float(f)) => {
                        f.neg();
                        true
                    }
                    Some(ExprTerm::Int(n)) => {
                        let _ = n.calc(Op::Neg, None);
                        true
                    }
                    Some(ExprTerm::Expr(e)) => {
                        e.xform_neg_helper();
                        true
                    }
                    _ => false,
                };
                if !in_place {
                    self.op = Op::Mul;
                    self.terms.push(ExprTerm::Int(IntNum::new(-1)));
                }
            }
            _ => {
                // Wrap everything else as -1*e; the MUL combines when
                // leveled.
                let inner = Expr {
                    op: self.op,
                    terms: std::mem::take(&mut self.terms),
                };
                self.op = Op::Mul;
                self.terms.push(ExprTerm::Int(IntNum::new(-1)));
                self.terms.push(ExprTerm::Expr(Box::new(inner)));
            }
        }
    }

    /// Level one node: bring up `Ident` children, fold integer constants,
    /// merge matching associative children, and simplify identities.
    fn level_op(
        &mut self,
        fold_const: bool,
        simplify_ident: bool,
        simplify_reg_mul: bool,
    ) -> Result<(), CoreError> {
        let fold_const = fold_const && self.op.folds_constants();
        let op = self.op;

        let mut int_idx: Option<usize> = None;
        let mut do_level = false;
        let mut i = 0;
        while i < self.terms.len() {
            // Bring up through Ident wrappers.
            loop {
                let inner = match &mut self.terms[i] {
                    ExprTerm::Expr(e) if e.op == Op::Ident && e.terms.len() == 1 => e.terms.pop(),
                    _ => None,
                };
                match inner {
                    Some(t) => self.terms[i] = t,
                    None => break,
                }
            }

            if let ExprTerm::Expr(e) = &self.terms[i] {
                if e.op == op {
                    do_level = true;
                }
            }

            if fold_const && matches!(self.terms[i], ExprTerm::Int(_)) {
                match int_idx {
                    None => int_idx = Some(i),
                    Some(fi) => {
                        let rhs = match self.terms.remove(i) {
                            ExprTerm::Int(n) => n,
                            _ => {
                                return Err(CoreError::new(
                                    CoreErrorKind::InternalConsistency,
                                    "integer term changed kind during folding",
                                ))
                            }
                        };
                        if let ExprTerm::Int(lhs) = &mut self.terms[fi] {
                            lhs.calc(op, Some(&rhs))?;
                        }
                        continue;
                    }
                }
            }
            i += 1;
        }

        if let Some(fi) = int_idx {
            if simplify_ident {
                self.simplify_identity(fi, simplify_reg_mul)?;
            } else if self.terms.len() == 1 {
                self.op = Op::Ident;
            }
        }

        self.collapse_ident_child();

        if !do_level || self.op != op || !op.is_associative() {
            return Ok(());
        }

        // Merge children whose operator matches, folding constants as they
        // come up.
        let old = std::mem::take(&mut self.terms);
        let mut int_idx: Option<usize> = None;
        for term in old {
            match term {
                ExprTerm::Expr(e) if e.op == op => {
                    for sub in e.terms {
                        if fold_const {
                            if let ExprTerm::Int(n) = &sub {
                                if let Some(fi) = int_idx {
                                    if let ExprTerm::Int(lhs) = &mut self.terms[fi] {
                                        lhs.calc(op, Some(n))?;
                                    }
                                    continue;
                                }
                                int_idx = Some(self.terms.len());
                            }
                        }
                        self.terms.push(sub);
                    }
                }
                other => {
                    if fold_const && int_idx.is_none() && matches!(other, ExprTerm::Int(_)) {
                        int_idx = Some(self.terms.len());
                    }
                    self.terms.push(other);
                }
            }
        }

        if let Some(fi) = int_idx {
            if simplify_ident {
                self.simplify_identity(fi, simplify_reg_mul)?;
            } else if self.terms.len() == 1 {
                self.op = Op::Ident;
            }
        } else if self.terms.len() == 1 {
            self.op = Op::Ident;
        }

        self.collapse_ident_child();
        Ok(())
    }

    /// Apply algebraic identities around the single integer term at
    /// `int_idx`; collapse to `Ident` when one term remains.
    fn simplify_identity(
        &mut self,
        int_idx: usize,
        simplify_reg_mul: bool,
    ) -> Result<(), CoreError> {
        let is_first = int_idx == 0;

        if self.terms.len() > 1 {
            let intn = match &self.terms[int_idx] {
                ExprTerm::Int(n) => n.clone(),
                _ => {
                    return Err(CoreError::new(
                        CoreErrorKind::InternalConsistency,
                        "identity simplification lost its integer term",
                    ))
                }
            };
            // Keep 1*reg so an explicit scale survives unless the caller
            // asked for aggressive simplification.
            let keep_reg_mul = !simplify_reg_mul
                && self.op == Op::Mul
                && intn.is_pos1()
                && self.contains(TermKind::Reg);
            if !keep_reg_mul
                && ((is_first && can_destroy_int_left(self.op, &intn))
                    || (!is_first && can_destroy_int_right(self.op, &intn)))
            {
                self.terms.remove(int_idx);
            } else if is_constant(self.op, &intn) {
                let int_term = self.terms.swap_remove(int_idx);
                self.terms.clear();
                self.terms.push(int_term);
            }
        }

        if self.terms.len() == 1 {
            if matches!(self.op, Op::Not | Op::Neg | Op::Lnot) {
                if let ExprTerm::Int(n) = &mut self.terms[0] {
                    n.calc(self.op, None)?;
                } else {
                    return Ok(());
                }
            }
            self.op = Op::Ident;
        }
        Ok(())
    }

    /// Bring up a single `Ident`-wrapped child expression into this node.
    fn collapse_ident_child(&mut self) {
        if self.op == Op::Ident
            && self.terms.len() == 1
            && matches!(self.terms[0], ExprTerm::Expr(_))
        {
            if let Some(ExprTerm::Expr(e)) = self.terms.pop() {
                *self = *e;
            }
        }
    }

    /// Stable-sort commutative terms throughout the tree so equivalent
    /// expressions compare structurally equal.
    fn order_terms_deep(&mut self) {
        for term in &mut self.terms {
            if let ExprTerm::Expr(e) = term {
                e.order_terms_deep();
            }
        }
        if self.terms.len() > 1 && self.op.is_commutative() {
            self.terms.sort_by(term_cmp);
        }
    }

    // ---- composite splitting ----

    /// Split a root-level `SEG:OFF` into its segment, leaving the offset
    /// behind under `Ident`.
    pub fn extract_segoff(&mut self) -> Option<Expr> {
        if self.op != Op::SegOff || self.terms.len() != 2 {
            return None;
        }
        let left = self.terms.remove(0);
        self.op = Op::Ident;
        Some(match left {
            ExprTerm::Expr(e) => *e,
            leaf => Expr {
                op: Op::Ident,
                terms: vec![leaf],
            },
        })
    }

    /// Split a root-level `WRT` into its right side, leaving the value
    /// behind under `Ident`.
    pub fn extract_wrt(&mut self) -> Option<Expr> {
        if self.op != Op::Wrt || self.terms.len() != 2 {
            return None;
        }
        let right = self.terms.pop()?;
        self.op = Op::Ident;
        Some(match right {
            ExprTerm::Expr(e) => *e,
            leaf => Expr {
                op: Op::Ident,
                terms: vec![leaf],
            },
        })
    }

    /// Find and split the first `SEG:OFF` at any depth.
    pub fn extract_deep_segoff(&mut self) -> Option<Expr> {
        if let Some(e) = self.extract_segoff() {
            return Some(e);
        }
        for term in &mut self.terms {
            if let ExprTerm::Expr(sub) = term {
                if let Some(e) = sub.extract_deep_segoff() {
                    return Some(e);
                }
            }
        }
        None
    }
}

/// Identities that make the entire result constant: `0*x`, `0&x`, `0&&x`,
/// `-1|x`.
fn is_constant(op: Op, intn: &IntNum) -> bool {
    let zero = intn.is_zero();
    (zero && op == Op::Mul)
        || (zero && op == Op::And)
        || (zero && op == Op::Land)
        || (intn.is_neg1() && op == Op::Or)
}

/// Left identities: `0+x`, `1*x`, `-1&x`, `nonzero&&x`, `0|x`, `0||x`.
fn can_destroy_int_left(op: Op, intn: &IntNum) -> bool {
    let zero = intn.is_zero();
    (intn.is_pos1() && op == Op::Mul)
        || (zero && op == Op::Add)
        || (intn.is_neg1() && op == Op::And)
        || (!zero && op == Op::Land)
        || (zero && op == Op::Or)
        || (zero && op == Op::Lor)
}

/// Right identities: the left set plus `x/1`, `x-0`, `x<<0`, `x>>0`.
fn can_destroy_int_right(op: Op, intn: &IntNum) -> bool {
    let zero = intn.is_zero();
    let pos1 = intn.is_pos1();
    (pos1 && op == Op::Mul)
        || (pos1 && op == Op::Div)
        || (zero && op == Op::Add)
        || (zero && op == Op::Sub)
        || (intn.is_neg1() && op == Op::And)
        || (!zero && op == Op::Land)
        || (zero && op == Op::Or)
        || (zero && op == Op::Lor)
        || (zero && op == Op::Shl)
        || (zero && op == Op::Shr)
}

/// Total deterministic order on terms for canonical ordering.
fn term_cmp(a: &ExprTerm, b: &ExprTerm) -> Ordering {
    fn rank(t: &ExprTerm) -> u8 {
        match t {
            ExprTerm::Int(_) => 0,
            ExprTerm::Float(_) => 1,
            ExprTerm::Reg(_) => 2,
            ExprTerm::Sym(_) => 3,
            ExprTerm::Loc(_) => 4,
            ExprTerm::Subst(_) => 5,
            ExprTerm::Expr(_) => 6,
        }
    }
    match (a, b) {
        (ExprTerm::Int(x), ExprTerm::Int(y)) => x.cmp(y),
        (ExprTerm::Float(x), ExprTerm::Float(y)) => x.value().to_bits().cmp(&y.value().to_bits()),
        (ExprTerm::Reg(x), ExprTerm::Reg(y)) => x.cmp(y),
        (ExprTerm::Sym(x), ExprTerm::Sym(y)) => x.cmp(y),
        (ExprTerm::Loc(x), ExprTerm::Loc(y)) => x.cmp(y),
        (ExprTerm::Subst(x), ExprTerm::Subst(y)) => x.cmp(y),
        (ExprTerm::Expr(x), ExprTerm::Expr(y)) => expr_cmp(x, y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn expr_cmp(a: &Expr, b: &Expr) -> Ordering {
    (a.op as u8)
        .cmp(&(b.op as u8))
        .then_with(|| a.terms.len().cmp(&b.terms.len()))
        .then_with(|| {
            for (x, y) in a.terms.iter().zip(b.terms.iter()) {
                let ord = term_cmp(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        })
}

impl fmt::Display for ExprTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprTerm::Int(n) => write!(f, "{n}"),
            ExprTerm::Float(v) => write!(f, "{v}"),
            ExprTerm::Reg(r) => write!(f, "{r}"),
            ExprTerm::Sym(s) => write!(f, "sym#{}", s.index()),
            ExprTerm::Loc(l) => write!(f, "{{{l}}}"),
            ExprTerm::Subst(i) => write!(f, "[{i}]"),
            ExprTerm::Expr(e) => write!(f, "({e})"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = match self.op {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::SignDiv => "//",
            Op::Mod => "%",
            Op::SignMod => "%%",
            Op::Or => "|",
            Op::And => "&",
            Op::Xor => "^",
            Op::Xnor => " XNOR ",
            Op::Nor => " NOR ",
            Op::Shl => "<<",
            Op::Shr => ">>",
            Op::Lor => "||",
            Op::Land => "&&",
            Op::Lxor => "^^",
            Op::Lxnor => " LXNOR ",
            Op::Lnor => " LNOR ",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::Le => "<=",
            Op::Ge => ">=",
            Op::Ne => "!=",
            Op::Eq => "==",
            Op::Wrt => " WRT ",
            Op::SegOff => ":",
            Op::Cond => "?",
            Op::Neg => {
                write!(f, "-")?;
                ""
            }
            Op::Not => {
                write!(f, "~")?;
                ""
            }
            Op::Lnot => {
                write!(f, "!")?;
                ""
            }
            Op::Seg => {
                write!(f, "SEG ")?;
                ""
            }
            Op::Ident => "",
        };
        for (i, term) in self.terms.iter().enumerate() {
            if i != 0 {
                write!(f, "{sep}")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn simplified(mut e: Expr) -> Expr {
        e.simplify(SimplifyOpts::default()).unwrap();
        e
    }

    fn add(a: Expr, b: Expr) -> Expr {
        Expr::binary(a.into(), Op::Add, b.into())
    }

    fn mul(a: Expr, b: Expr) -> Expr {
        Expr::binary(a.into(), Op::Mul, b.into())
    }

    #[test]
    fn constructor_enforces_arity() {
        let err = Expr::new(Op::Add, vec![ExprTerm::from(1)]).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::MalformedExpression);
        let err = Expr::new(Op::Neg, vec![ExprTerm::from(1), ExprTerm::from(2)]).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::MalformedExpression);
        let err = Expr::new(
            Op::Sub,
            vec![ExprTerm::from(1), ExprTerm::from(2), ExprTerm::from(3)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::MalformedExpression);
        assert!(Expr::new(
            Op::Cond,
            vec![ExprTerm::from(1), ExprTerm::from(2), ExprTerm::from(3)]
        )
        .is_ok());
    }

    #[test]
    fn ident_chains_collapse_on_construction() {
        let wrapped = Expr::ident(Expr::ident(Expr::int(5).into()).into());
        assert_eq!(wrapped.as_intnum(), Some(&IntNum::new(5)));
    }

    #[test]
    fn constant_folding_combines_integers() {
        let e = simplified(add(Expr::int(1), mul(Expr::int(2), Expr::int(3))));
        assert_eq!(e.as_intnum(), Some(&IntNum::new(7)));
    }

    #[test]
    fn folding_reports_division_by_zero() {
        let mut e = Expr::binary(Expr::int(4).into(), Op::Div, Expr::int(0).into());
        let err = e.simplify(SimplifyOpts::default()).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::DivisionByZero);
    }

    #[test]
    fn leveling_flattens_nested_adds() {
        let sym = SymbolId::for_tests(0);
        let e = simplified(add(
            add(Expr::sym(sym), Expr::int(1)),
            add(Expr::sym(sym), Expr::int(2)),
        ));
        assert_eq!(e.op(), Op::Add);
        assert_eq!(e.terms().len(), 3);
        let ints: Vec<_> = e.terms().iter().filter_map(|t| t.get_int()).collect();
        assert_eq!(ints, vec![&IntNum::new(3)]);
    }

    #[test]
    fn neg_distributes_over_add() {
        // -(x+3) => -1*x + -3
        let sym = SymbolId::for_tests(0);
        let e = simplified(Expr::unary(
            Op::Neg,
            add(Expr::sym(sym), Expr::int(3)).into(),
        ));
        assert_eq!(e.op(), Op::Add);
        assert_eq!(e.terms().len(), 2);
        assert!(e
            .terms()
            .iter()
            .any(|t| t.get_int() == Some(&IntNum::new(-3))));
        let prod = e
            .terms()
            .iter()
            .find_map(|t| t.get_expr())
            .expect("product term");
        assert_eq!(prod.op(), Op::Mul);
        assert!(prod
            .terms()
            .iter()
            .any(|t| t.get_int() == Some(&IntNum::new(-1))));
    }

    #[test]
    fn double_negation_collapses() {
        let e = simplified(Expr::unary(
            Op::Neg,
            Expr::unary(Op::Neg, Expr::int(5).into()).into(),
        ));
        assert_eq!(e.as_intnum(), Some(&IntNum::new(5)));
    }

    #[test]
    fn neg_of_float_negates_in_place() {
        let e = simplified(Expr::unary(Op::Neg, Expr::float(FloatNum::new(1.5)).into()));
        assert_eq!(e.as_float(), Some(&FloatNum::new(-1.5)));
    }

    #[test]
    fn identities_eliminate_neutral_terms() {
        let sym = SymbolId::for_tests(0);
        for (e, desc) in [
            (add(Expr::int(0), Expr::sym(sym)), "0+x"),
            (mul(Expr::int(1), Expr::sym(sym)), "1*x"),
            (
                Expr::binary(Expr::sym(sym).into(), Op::Sub, Expr::int(0).into()),
                "x-0",
            ),
            (
                Expr::binary(Expr::sym(sym).into(), Op::Div, Expr::int(1).into()),
                "x/1",
            ),
            (
                Expr::binary(Expr::sym(sym).into(), Op::Shl, Expr::int(0).into()),
                "x<<0",
            ),
            (
                Expr::binary(Expr::int(-1).into(), Op::And, Expr::sym(sym).into()),
                "-1&x",
            ),
            (
                Expr::binary(Expr::int(0).into(), Op::Or, Expr::sym(sym).into()),
                "0|x",
            ),
        ] {
            let s = simplified(e);
            assert_eq!(s.as_symbol(), Some(sym), "{desc} should reduce to x");
        }
    }

    #[test]
    fn absorbing_identities_produce_constants() {
        let sym = SymbolId::for_tests(0);
        for (e, want, desc) in [
            (mul(Expr::int(0), Expr::sym(sym)), 0, "0*x"),
            (
                Expr::binary(Expr::int(0).into(), Op::And, Expr::sym(sym).into()),
                0,
                "0&x",
            ),
            (
                Expr::binary(Expr::int(-1).into(), Op::Or, Expr::sym(sym).into()),
                -1,
                "-1|x",
            ),
            (
                Expr::binary(Expr::int(0).into(), Op::Land, Expr::sym(sym).into()),
                0,
                "0&&x",
            ),
        ] {
            let s = simplified(e);
            assert_eq!(s.as_intnum(), Some(&IntNum::new(want)), "{desc}");
        }
    }

    #[test]
    fn reg_mul_by_one_is_preserved_by_default() {
        let reg = Register::new(3);
        let e = simplified(mul(Expr::int(1), Expr::reg(reg)));
        assert_eq!(e.op(), Op::Mul);
        assert_eq!(e.terms().len(), 2);

        let mut e = mul(Expr::int(1), Expr::reg(reg));
        e.simplify(SimplifyOpts {
            simplify_reg_mul: true,
        })
        .unwrap();
        assert_eq!(e.as_register(), Some(reg));
    }

    #[test]
    fn seg_of_segoff_projects_segment() {
        let seg = SymbolId::for_tests(1);
        let off = SymbolId::for_tests(2);
        let e = simplified(Expr::unary(
            Op::Seg,
            Expr::binary(Expr::sym(seg).into(), Op::SegOff, Expr::sym(off).into()).into(),
        ));
        assert_eq!(e.as_symbol(), Some(seg));
    }

    #[test]
    fn extract_segoff_splits_composite() {
        let seg = SymbolId::for_tests(1);
        let off = SymbolId::for_tests(2);
        let mut e = Expr::binary(Expr::sym(seg).into(), Op::SegOff, Expr::sym(off).into());
        let segment = e.extract_segoff().expect("segoff splits");
        assert_eq!(segment.as_symbol(), Some(seg));
        assert_eq!(e.as_symbol(), Some(off));
    }

    #[test]
    fn extract_wrt_splits_right_side() {
        let val = SymbolId::for_tests(1);
        let base = SymbolId::for_tests(2);
        let mut e = Expr::binary(Expr::sym(val).into(), Op::Wrt, Expr::sym(base).into());
        let rhs = e.extract_wrt().expect("wrt splits");
        assert_eq!(rhs.as_symbol(), Some(base));
        assert_eq!(e.as_symbol(), Some(val));
    }

    #[test]
    fn extract_deep_segoff_reaches_nested_composite() {
        let seg = SymbolId::for_tests(1);
        let off = SymbolId::for_tests(2);
        let mut e = add(
            Expr::binary(Expr::sym(seg).into(), Op::SegOff, Expr::sym(off).into()),
            Expr::int(4),
        );
        let segment = e.extract_deep_segoff().expect("deep segoff found");
        assert_eq!(segment.as_symbol(), Some(seg));
    }

    #[test]
    fn substitute_replaces_placeholders() {
        let sym = SymbolId::for_tests(7);
        let mut e = add(Expr::subst(0), Expr::int(2));
        e.substitute(&[ExprTerm::Sym(sym)]).unwrap();
        let e = simplified(e);
        assert!(e.contains(TermKind::Sym));

        let mut e = Expr::subst(3);
        let err = e.substitute(&[ExprTerm::from(0)]).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::MalformedExpression);
    }

    #[test]
    fn clone_except_drops_one_term() {
        let sym = SymbolId::for_tests(0);
        let e = Expr::new(
            Op::Add,
            vec![Expr::sym(sym).into(), ExprTerm::from(2), ExprTerm::from(3)],
        )
        .unwrap();
        let without_sym = e.clone_except(0);
        assert_eq!(without_sym.terms().len(), 2);
        assert!(!without_sym.contains(TermKind::Sym));
    }

    #[test]
    fn canonical_ordering_makes_commuted_trees_equal() {
        let sym = SymbolId::for_tests(0);
        let a = simplified(add(Expr::sym(sym), Expr::int(5)));
        let b = simplified(add(Expr::int(5), Expr::sym(sym)));
        assert_eq!(a, b);
    }

    #[test]
    fn traverse_leaves_visits_flattened_order() {
        let sym = SymbolId::for_tests(0);
        let e = add(add(Expr::int(1), Expr::sym(sym)), Expr::int(2));
        let mut kinds = Vec::new();
        e.traverse_leaves(&mut |t| {
            kinds.push(t.kind());
            false
        });
        assert_eq!(kinds, vec![TermKind::Int, TermKind::Sym, TermKind::Int]);
    }

    // Random expression trees over a few symbols and small integers.
    fn arb_expr() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            (-16i64..17).prop_map(Expr::int),
            (0usize..3).prop_map(|i| Expr::sym(SymbolId::for_tests(i))),
        ];
        leaf.prop_recursive(4, 24, 3, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(a, b)| add(a, b)),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| mul(a, b)),
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| Expr::binary(a.into(), Op::Sub, b.into())),
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| Expr::binary(a.into(), Op::Or, b.into())),
                inner.clone().prop_map(|a| Expr::unary(Op::Neg, a.into())),
            ]
        })
    }

    proptest! {
        #[test]
        fn simplify_is_idempotent(e in arb_expr()) {
            let mut once = e.clone();
            prop_assume!(once.simplify(SimplifyOpts::default()).is_ok());
            let mut twice = once.clone();
            twice.simplify(SimplifyOpts::default()).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn commuted_adds_are_canonically_equal(
            a in arb_expr(),
            b in arb_expr(),
        ) {
            let mut e1 = add(a.clone(), b.clone());
            let mut e2 = add(b, a);
            prop_assume!(e1.simplify(SimplifyOpts::default()).is_ok());
            prop_assume!(e2.simplify(SimplifyOpts::default()).is_ok());
            prop_assert_eq!(e1, e2);
        }
    }
}
