// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Assembly pipeline facade.
//!
//! Wires an architecture, an object format, and an object together and
//! runs the straight-line flow: the caller's parser appends bytecodes and
//! defines symbols, then `assemble` finalizes, optimizes, and emits.
//! Warnings accumulate throughout; any hard error raised before emission
//! skips the emit phase.

use crate::core::arch::Arch;
use crate::core::emitter::{self, ObjectImage};
use crate::core::error::{CoreError, CoreErrorKind, Diagnostic, DiagnosticSink};
use crate::core::object::Object;
use crate::core::objfmt::ObjFmt;
use crate::core::optimizer;
use crate::core::section::SectionAttrs;

/// Drives one assembly from parsed input to an emitted image.
pub struct Assembler {
    object: Object,
    objfmt: Box<dyn ObjFmt>,
    diags: DiagnosticSink,
}

impl Assembler {
    /// Create an assembler with an initial default section selected per
    /// the object format's policy.
    pub fn new(
        src_name: impl Into<String>,
        obj_name: impl Into<String>,
        arch: Box<dyn Arch>,
        objfmt: Box<dyn ObjFmt>,
    ) -> Result<Self, CoreError> {
        let mut object = Object::new(src_name, obj_name, arch);
        let name = objfmt.default_section_name();
        let attrs = if objfmt.is_code_section(name) {
            SectionAttrs::code()
        } else {
            SectionAttrs::default()
        };
        let default = object.get_or_create_section(name, attrs)?;
        object.set_cur_section(default);
        Ok(Self {
            object,
            objfmt,
            diags: DiagnosticSink::new(),
        })
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }

    pub fn objfmt(&self) -> &dyn ObjFmt {
        self.objfmt.as_ref()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.diags.diagnostics()
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diags.take()
    }

    pub fn has_errors(&self) -> bool {
        self.diags.has_errors()
    }

    /// Record an error reported by a parser collaborator.
    pub fn parse_error(&mut self, message: impl Into<String>, line: u32) {
        self.diags.error(CoreError::with_line(
            CoreErrorKind::Syntax,
            message,
            line,
        ));
    }

    /// Resolve parse-time expressions against the completed symbol table.
    pub fn finalize(&mut self) {
        self.object.finalize(&mut self.diags);
    }

    /// Converge bytecode offsets and lengths to their fixed point.
    pub fn optimize(&mut self) {
        optimizer::optimize(&mut self.object, &mut self.diags);
    }

    /// Emit bytes and relocations. `None` when a hard error is pending.
    pub fn output(&mut self) -> Option<ObjectImage> {
        emitter::output(&mut self.object, self.objfmt.as_mut(), &mut self.diags)
    }

    /// Run finalize, optimize, and output in order, stopping at the first
    /// phase that raises a hard error.
    pub fn assemble(&mut self) -> Option<ObjectImage> {
        self.finalize();
        if self.diags.has_errors() {
            return None;
        }
        self.optimize();
        if self.diags.has_errors() {
            return None;
        }
        self.output()
    }

    /// Serialize an emitted image through the object format.
    pub fn write(
        &mut self,
        image: &ObjectImage,
        sink: &mut dyn std::io::Write,
    ) -> Result<(), CoreError> {
        self.objfmt.write(image, sink)
    }
}
