// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Ordered bytecode containers.

use super::arch::Endian;
use super::bytecode::{Bytecode, SpecialKind};
use super::error::{CoreError, CoreErrorKind};
use super::expr::Expr;
use super::objfmt::Relocation;

/// Handle into an object's section list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(usize);

impl SectionId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(index: usize) -> Self {
        Self(index)
    }
}

/// Section attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionAttrs {
    pub code: bool,
    pub bss: bool,
    pub readonly: bool,
}

impl SectionAttrs {
    pub fn code() -> Self {
        Self {
            code: true,
            ..Self::default()
        }
    }

    pub fn bss() -> Self {
        Self {
            bss: true,
            ..Self::default()
        }
    }
}

/// An ordered sequence of bytecodes plus per-section layout state.
///
/// Bytecodes are appended in parser order and never removed, so indices
/// stay stable and `Location` references remain valid for the object's
/// lifetime.
#[derive(Debug)]
pub struct Section {
    name: String,
    attrs: SectionAttrs,
    /// Effective alignment: the largest member alignment observed.
    align: u64,
    /// Virtual base address.
    vma: u64,
    /// Absolute block: placed at a fixed address, reservations only.
    absolute: bool,
    absolute_start: Option<Expr>,
    max_size: Option<u64>,
    /// Byte order for values emitted into this section; the architecture
    /// default applies when unset.
    endian: Option<Endian>,
    bytecodes: Vec<Bytecode>,
    relocs: Vec<Relocation>,
}

impl Section {
    pub(crate) fn new(name: String, attrs: SectionAttrs) -> Self {
        Self {
            name,
            attrs,
            align: 1,
            vma: 0,
            absolute: false,
            absolute_start: None,
            max_size: None,
            endian: None,
            bytecodes: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub(crate) fn new_absolute(name: String, start: Expr) -> Self {
        Self {
            absolute: true,
            absolute_start: Some(start),
            ..Self::new(name, SectionAttrs::bss())
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attrs(&self) -> SectionAttrs {
        self.attrs
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn absolute_start(&self) -> Option<&Expr> {
        self.absolute_start.as_ref()
    }

    pub fn align(&self) -> u64 {
        self.align
    }

    /// Raise the effective alignment; lower requests are ignored.
    pub fn update_align(&mut self, align: u64) {
        if align > self.align {
            self.align = align;
        }
    }

    pub fn vma(&self) -> u64 {
        self.vma
    }

    pub fn set_vma(&mut self, vma: u64) {
        self.vma = vma;
    }

    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    pub fn set_max_size(&mut self, max: u64) {
        self.max_size = Some(max);
    }

    pub fn endian(&self) -> Option<Endian> {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = Some(endian);
    }

    /// Append a bytecode, returning its index. O(1). Absolute blocks only
    /// accept reservations.
    pub fn append(&mut self, mut bc: Bytecode) -> Result<usize, CoreError> {
        if self.absolute && bc.special_kind() != SpecialKind::Reservation {
            return Err(CoreError::with_line(
                CoreErrorKind::DirectiveArgError,
                "only reservations are allowed in an absolute section",
                bc.line(),
            ));
        }
        let index = self.bytecodes.len();
        bc.set_index(index);
        self.bytecodes.push(bc);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.bytecodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytecodes.is_empty()
    }

    pub fn first(&self) -> Option<&Bytecode> {
        self.bytecodes.first()
    }

    /// The bytecode after `index`, if any.
    pub fn next(&self, index: usize) -> Option<&Bytecode> {
        self.bytecodes.get(index + 1)
    }

    pub fn bytecode_at(&self, index: usize) -> Option<&Bytecode> {
        self.bytecodes.get(index)
    }

    pub(crate) fn bytecode_mut(&mut self, index: usize) -> Option<&mut Bytecode> {
        self.bytecodes.get_mut(index)
    }

    pub fn bytecodes(&self) -> &[Bytecode] {
        &self.bytecodes
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytecode> {
        self.bytecodes.iter()
    }

    /// Total resolved size; valid after optimization.
    pub fn size(&self) -> u64 {
        self.bytecodes.last().map(|bc| bc.next_offset()).unwrap_or(0)
    }

    pub fn add_reloc(&mut self, reloc: Relocation) {
        self.relocs.push(reloc);
    }

    pub fn relocs(&self) -> &[Relocation] {
        &self.relocs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bytecode::{create_data, create_reserve};

    #[test]
    fn append_assigns_dense_indices() {
        let mut sect = Section::new(".text".into(), SectionAttrs::code());
        let a = sect.append(create_data(Vec::new(), 1, false, 1)).unwrap();
        let b = sect.append(create_data(Vec::new(), 1, false, 2)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(sect.bytecode_at(0).map(|bc| bc.index()), Some(0));
        assert_eq!(sect.next(0).map(|bc| bc.index()), Some(1));
        assert!(sect.next(1).is_none());
    }

    #[test]
    fn absolute_sections_only_take_reservations() {
        let mut sect = Section::new_absolute("absolute.0".into(), Expr::int(0x100));
        sect.append(create_reserve(Expr::int(4), 1, 1)).unwrap();
        let err = sect
            .append(create_data(Vec::new(), 1, false, 2))
            .unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::DirectiveArgError);
    }

    #[test]
    fn alignment_only_grows() {
        let mut sect = Section::new(".data".into(), SectionAttrs::default());
        sect.update_align(8);
        sect.update_align(4);
        assert_eq!(sect.align(), 8);
        sect.update_align(16);
        assert_eq!(sect.align(), 16);
    }
}
