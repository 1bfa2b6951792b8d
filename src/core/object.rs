// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! The object: root aggregate of one assembly.
//!
//! Owns the sections, the symbol table, the architecture handle, the
//! directive table, and configuration. Everything else holds index handles
//! into the object; there is no global state.

use std::collections::HashMap;

use super::arch::Arch;
use super::bc_incbin::Includes;
use super::bytecode::{Bytecode, FinalizeCtx};
use super::directive::{DirectiveFlags, DirectiveHandler, DirectiveManager, NameValues};
use super::error::{CoreError, CoreErrorKind, DiagnosticSink};
use super::expr::Expr;
use super::location::Location;
use super::section::{Section, SectionAttrs, SectionId};
use super::symbol::{SymbolId, SymbolTable};
use super::value::resolve_const;

/// Core configuration carried by the object.
#[derive(Debug, Clone, Default)]
pub struct ObjectConfig {
    /// Aggressive simplification: destroy `1*reg` products.
    pub simplify_reg_mul: bool,
    /// Default maximum size applied to every section.
    pub section_max: Option<u64>,
}

/// Root aggregate of one assembly run.
pub struct Object {
    src_name: String,
    obj_name: String,
    pub(crate) arch: Box<dyn Arch>,
    pub(crate) symbols: SymbolTable,
    pub(crate) sections: Vec<Section>,
    sect_by_name: HashMap<String, SectionId>,
    cur_section: Option<SectionId>,
    directives: DirectiveManager,
    pub(crate) includes: Includes,
    pub(crate) config: ObjectConfig,
    /// Labels waiting for their bytecode to be appended.
    pending_labels: Vec<SymbolId>,
    absolute_counter: usize,
}

impl Object {
    pub fn new(
        src_name: impl Into<String>,
        obj_name: impl Into<String>,
        arch: Box<dyn Arch>,
    ) -> Self {
        let mut symbols = SymbolTable::new();
        // Assembly position and section start are owned by the object and
        // never user-definable.
        symbols.define_special("$");
        symbols.define_special("$$");
        Self {
            src_name: src_name.into(),
            obj_name: obj_name.into(),
            arch,
            symbols,
            sections: Vec::new(),
            sect_by_name: HashMap::new(),
            cur_section: None,
            directives: DirectiveManager::new(),
            includes: Includes::new(),
            config: ObjectConfig::default(),
            pending_labels: Vec::new(),
            absolute_counter: 0,
        }
    }

    pub fn src_name(&self) -> &str {
        &self.src_name
    }

    pub fn obj_name(&self) -> &str {
        &self.obj_name
    }

    pub fn arch(&self) -> &dyn Arch {
        self.arch.as_ref()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn includes(&self) -> &Includes {
        &self.includes
    }

    pub fn includes_mut(&mut self) -> &mut Includes {
        &mut self.includes
    }

    pub fn config(&self) -> &ObjectConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ObjectConfig {
        &mut self.config
    }

    // ---- sections ----

    /// Find or create a section by name. Idempotent on the name; the
    /// attributes of a later call must match the first.
    pub fn get_or_create_section(
        &mut self,
        name: &str,
        attrs: SectionAttrs,
    ) -> Result<SectionId, CoreError> {
        if let Some(id) = self.sect_by_name.get(name) {
            let existing = &self.sections[id.index()];
            if existing.attrs() != attrs {
                return Err(CoreError::new(
                    CoreErrorKind::DirectiveArgError,
                    format!("section `{name}` redeclared with different attributes"),
                ));
            }
            return Ok(*id);
        }
        let id = SectionId::new(self.sections.len());
        self.sections.push(Section::new(name.to_string(), attrs));
        self.sect_by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Create a fresh absolute block starting at `start`.
    pub fn create_absolute_section(&mut self, start: Expr) -> SectionId {
        let name = format!("absolute.{}", self.absolute_counter);
        self.absolute_counter += 1;
        let id = SectionId::new(self.sections.len());
        self.sections.push(Section::new_absolute(name.clone(), start));
        self.sect_by_name.insert(name, id);
        id
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.index()]
    }

    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        self.sect_by_name.get(name).copied()
    }

    pub fn section_ids(&self) -> impl Iterator<Item = SectionId> {
        (0..self.sections.len()).map(SectionId::new)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn cur_section(&self) -> Option<SectionId> {
        self.cur_section
    }

    pub fn set_cur_section(&mut self, id: SectionId) {
        self.cur_section = Some(id);
    }

    // ---- bytecode and label plumbing ----

    /// The location the next appended bytecode will occupy.
    pub fn current_location(&self) -> Result<Location, CoreError> {
        let sect = self.cur_section.ok_or_else(|| {
            CoreError::new(CoreErrorKind::DirectiveArgError, "no active section")
        })?;
        Ok(Location::at(sect, self.sections[sect.index()].len()))
    }

    /// Append a bytecode to the current section, binding any labels
    /// waiting for it.
    pub fn append_bytecode(&mut self, mut bc: Bytecode) -> Result<Location, CoreError> {
        let sect = self.cur_section.ok_or_else(|| {
            CoreError::with_line(
                CoreErrorKind::DirectiveArgError,
                "no active section",
                bc.line(),
            )
        })?;
        for sym in self.pending_labels.drain(..) {
            bc.add_symbol(sym);
        }
        let index = self.sections[sect.index()].append(bc)?;
        Ok(Location::at(sect, index))
    }

    /// Define a label at the current position.
    pub fn define_label(&mut self, name: &str, line: u32) -> Result<SymbolId, CoreError> {
        let loc = self.current_location().map_err(|e| e.or_line(line))?;
        let id = self.symbols.lookup_or_create(name);
        self.symbols.define_label(id, loc, line)?;
        self.pending_labels.push(id);
        Ok(id)
    }

    // ---- directives ----

    /// Register a directive handler for a parser keyword.
    pub fn add_directive(
        &mut self,
        name: &str,
        parser: &str,
        handler: DirectiveHandler,
        flags: DirectiveFlags,
    ) {
        self.directives.add(name, parser, handler, flags);
    }

    pub fn has_directive(&self, name: &str, parser: &str) -> bool {
        self.directives.contains(name, parser)
    }

    /// Single entry point for parser-delivered directives.
    pub fn do_directive(
        &mut self,
        name: &str,
        parser: &str,
        namevals: &NameValues,
        objext_namevals: &NameValues,
        line: u32,
    ) -> Result<(), CoreError> {
        let directives = std::mem::take(&mut self.directives);
        let result = directives.dispatch(name, parser, self, namevals, objext_namevals, line);
        self.directives = directives;
        result
    }

    // ---- finalize ----

    /// Resolve parse-time expressions now that the symbol table is
    /// complete: absolute section bases and every bytecode's contents.
    /// Errors accumulate in `diags`.
    pub fn finalize(&mut self, diags: &mut DiagnosticSink) {
        tracing::debug!(sections = self.sections.len(), "finalize start");
        let symbols = &self.symbols;
        let includes = &self.includes;
        for sect in &mut self.sections {
            if let Some(start) = sect.absolute_start() {
                match resolve_const(start, symbols).and_then(|n| {
                    n.to_u64().ok_or_else(|| {
                        CoreError::new(
                            CoreErrorKind::MalformedExpression,
                            "absolute section start is negative or too large",
                        )
                    })
                }) {
                    Ok(vma) => sect.set_vma(vma),
                    Err(e) => diags.error(e),
                }
            }
            let mut ctx = FinalizeCtx {
                symbols,
                includes,
                line: 0,
            };
            for idx in 0..sect.len() {
                if let Some(bc) = sect.bytecode_mut(idx) {
                    if let Err(e) = bc.finalize(&mut ctx) {
                        diags.error(e);
                    }
                }
            }
        }
        tracing::debug!(errors = diags.error_count(), "finalize done");
    }
}
