// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Symbol table with deferred definition.
//!
//! Symbols are created on first mention and transition from undefined to
//! defined exactly once. Expressions reference symbols through `SymbolId`
//! handles into the table, so the table is the only owner and there are no
//! reference cycles between symbols and expression trees.

use std::collections::HashMap;

use super::error::{CoreError, CoreErrorKind};
use super::expr::Expr;
use super::intnum::IntNum;
use super::location::Location;
use super::value::{eval_expr, TableResolver};

/// Handle into a `SymbolTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(usize);

impl SymbolId {
    pub fn index(&self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(index: usize) -> Self {
        Self(index)
    }
}

/// Symbol visibility in the output object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Local,
    Global,
    Weak,
}

/// Declared symbol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeKind {
    #[default]
    NoType,
    Object,
    Func,
}

/// Definition state of a symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolState {
    /// Mentioned but not yet defined.
    Undefined,
    /// Alias for an expression, re-simplified on each dereference.
    Equ(Expr),
    /// Bound to a point in a section.
    Label(Location),
    /// Common storage request.
    Common { size: Expr, align: u64 },
    /// Declared here, defined elsewhere.
    Extern,
    /// Defined inside an absolute block.
    Absolute(Expr),
    /// Pre-registered by the object (section start, assembly position);
    /// never user-definable.
    Special,
}

/// The result of dereferencing a symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolValue {
    Int(IntNum),
    Loc(Location),
    /// Still symbolic; carries the handle for relocation emission.
    Unresolved(SymbolId),
}

/// A named symbol.
#[derive(Debug, Clone)]
pub struct Symbol {
    name: String,
    state: SymbolState,
    visibility: Visibility,
    type_kind: TypeKind,
    size: Option<Expr>,
    assoc: HashMap<String, String>,
    def_line: Option<u32>,
    use_line: Option<u32>,
}

impl Symbol {
    fn new(name: String) -> Self {
        Self {
            name,
            state: SymbolState::Undefined,
            visibility: Visibility::default(),
            type_kind: TypeKind::default(),
            size: None,
            assoc: HashMap::new(),
            def_line: None,
            use_line: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SymbolState {
        &self.state
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self.state, SymbolState::Undefined)
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn set_visibility(&mut self, vis: Visibility) {
        self.visibility = vis;
    }

    pub fn type_kind(&self) -> TypeKind {
        self.type_kind
    }

    pub fn set_type_kind(&mut self, kind: TypeKind) {
        self.type_kind = kind;
    }

    pub fn size(&self) -> Option<&Expr> {
        self.size.as_ref()
    }

    pub fn set_size(&mut self, size: Expr) {
        self.size = Some(size);
    }

    pub fn associated_data(&self, key: &str) -> Option<&str> {
        self.assoc.get(key).map(String::as_str)
    }

    pub fn set_associated_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.assoc.insert(key.into(), value.into());
    }

    /// Line of the definition, if defined.
    pub fn def_line(&self) -> Option<u32> {
        self.def_line
    }

    /// Line of the first recorded use.
    pub fn use_line(&self) -> Option<u32> {
        self.use_line
    }
}

/// Table of symbols owned by one object.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an existing symbol by name.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    /// Find or create a symbol. Idempotent: repeated calls return the same
    /// handle.
    pub fn lookup_or_create(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol::new(name.to_string()));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i), s))
    }

    /// Record a use. The earliest recorded line wins.
    pub fn use_sym(&mut self, id: SymbolId, line: u32) {
        let sym = &mut self.symbols[id.0];
        if sym.use_line.is_none() {
            sym.use_line = Some(line);
        }
    }

    fn define(
        &mut self,
        id: SymbolId,
        state: SymbolState,
        line: u32,
    ) -> Result<(), CoreError> {
        let sym = &mut self.symbols[id.0];
        match &sym.state {
            SymbolState::Undefined => {
                sym.state = state;
                sym.def_line = Some(line);
                Ok(())
            }
            SymbolState::Special => Err(CoreError::with_line(
                CoreErrorKind::SymbolRedefinition,
                format!("special symbol `{}` cannot be redefined", sym.name),
                line,
            )),
            existing if *existing == state => Ok(()),
            _ => Err(CoreError::with_line(
                CoreErrorKind::SymbolRedefinition,
                format!("symbol `{}` redefined", sym.name),
                line,
            )),
        }
    }

    pub fn define_label(&mut self, id: SymbolId, loc: Location, line: u32) -> Result<(), CoreError> {
        self.define(id, SymbolState::Label(loc), line)
    }

    pub fn define_equ(&mut self, id: SymbolId, expr: Expr, line: u32) -> Result<(), CoreError> {
        self.define(id, SymbolState::Equ(expr), line)
    }

    pub fn declare_extern(&mut self, id: SymbolId, line: u32) -> Result<(), CoreError> {
        self.define(id, SymbolState::Extern, line)
    }

    pub fn declare_common(
        &mut self,
        id: SymbolId,
        size: Expr,
        align: u64,
        line: u32,
    ) -> Result<(), CoreError> {
        self.define(id, SymbolState::Common { size, align }, line)
    }

    pub fn define_absolute(
        &mut self,
        id: SymbolId,
        start: Expr,
        line: u32,
    ) -> Result<(), CoreError> {
        self.define(id, SymbolState::Absolute(start), line)
    }

    /// Pre-register a special symbol; used by the object for section-start
    /// and assembly-position names.
    pub fn define_special(&mut self, name: &str) -> SymbolId {
        let id = self.lookup_or_create(name);
        self.symbols[id.0].state = SymbolState::Special;
        id
    }

    /// Dereference a symbol: a concrete integer for a fully resolved equ, a
    /// location for a label, otherwise still symbolic.
    pub fn resolve_value(&self, id: SymbolId) -> SymbolValue {
        match &self.symbols[id.0].state {
            SymbolState::Label(loc) => SymbolValue::Loc(*loc),
            SymbolState::Equ(e) | SymbolState::Absolute(e) => {
                match eval_expr(e, &TableResolver { symbols: self }) {
                    Ok(n) => SymbolValue::Int(n),
                    Err(_) => SymbolValue::Unresolved(id),
                }
            }
            _ => SymbolValue::Unresolved(id),
        }
    }
}
