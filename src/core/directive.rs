// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Directive dispatch and name/value argument lists.
//!
//! Parsers hand every directive through one entry point with two
//! name/value lists (generic and object-format specific). A `NameValue`
//! carries an optional name and an identifier, string, or expression
//! value; identifiers promote to symbol references on demand.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::{CoreError, CoreErrorKind};
use super::expr::Expr;
use super::object::Object;

/// The value part of a name/value pair.
#[derive(Debug, Clone, PartialEq)]
enum NvValue {
    Id(String),
    Str(String),
    Expr(Expr),
}

/// A single directive argument.
#[derive(Debug, Clone, PartialEq)]
pub struct NameValue {
    name: Option<String>,
    value: NvValue,
    /// Prefix marking a raw identifier; stripped by `as_id`.
    id_prefix: char,
}

impl NameValue {
    pub fn new_id(name: Option<String>, id: impl Into<String>, id_prefix: char) -> Self {
        Self {
            name,
            value: NvValue::Id(id.into()),
            id_prefix,
        }
    }

    pub fn new_string(name: Option<String>, s: impl Into<String>) -> Self {
        Self {
            name,
            value: NvValue::Str(s.into()),
            id_prefix: '\0',
        }
    }

    pub fn new_expr(name: Option<String>, e: Expr) -> Self {
        Self {
            name,
            value: NvValue::Expr(e),
            id_prefix: '\0',
        }
    }

    /// Unnamed identifier value.
    pub fn id(id: impl Into<String>, id_prefix: char) -> Self {
        Self::new_id(None, id, id_prefix)
    }

    /// Unnamed string value.
    pub fn string(s: impl Into<String>) -> Self {
        Self::new_string(None, s)
    }

    /// Unnamed expression value.
    pub fn expr(e: Expr) -> Self {
        Self::new_expr(None, e)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_expr(&self) -> bool {
        matches!(self.value, NvValue::Id(_) | NvValue::Expr(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.value, NvValue::Id(_) | NvValue::Str(_))
    }

    pub fn is_id(&self) -> bool {
        matches!(self.value, NvValue::Id(_))
    }

    /// The value as an expression; identifiers promote to symbol
    /// references (recording a use).
    pub fn as_expr(&self, object: &mut Object, line: u32) -> Result<Expr, CoreError> {
        match &self.value {
            NvValue::Expr(e) => Ok(e.clone()),
            NvValue::Id(id) => {
                let sym = object.symbols_mut().lookup_or_create(id);
                object.symbols_mut().use_sym(sym, line);
                Ok(Expr::sym(sym))
            }
            NvValue::Str(_) => Err(CoreError::with_line(
                CoreErrorKind::DirectiveArgError,
                "string where an expression was expected",
                line,
            )),
        }
    }

    /// The value as a string; identifiers read as their raw text.
    pub fn as_string(&self) -> Result<String, CoreError> {
        match &self.value {
            NvValue::Str(s) => Ok(s.clone()),
            NvValue::Id(id) => Ok(id.clone()),
            NvValue::Expr(_) => Err(CoreError::new(
                CoreErrorKind::DirectiveArgError,
                "expression where a string was expected",
            )),
        }
    }

    /// The value as an identifier, with any raw-identifier prefix
    /// stripped.
    pub fn as_id(&self) -> Result<String, CoreError> {
        match &self.value {
            NvValue::Id(id) => Ok(id
                .strip_prefix(self.id_prefix)
                .unwrap_or(id)
                .to_string()),
            _ => Err(CoreError::new(
                CoreErrorKind::DirectiveArgError,
                "value is not an identifier",
            )),
        }
    }
}

/// Vector of name/values.
pub type NameValues = Vec<NameValue>;

/// Pre-call validation for a directive's arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectiveFlags {
    /// Any arguments accepted.
    #[default]
    Any,
    /// At least one argument required.
    ArgRequired,
    /// First argument must be an identifier.
    IdRequired,
}

/// Directive handler. Receives the object and both name/value lists.
pub type DirectiveHandler =
    Arc<dyn Fn(&mut Object, &NameValues, &NameValues, u32) -> Result<(), CoreError>>;

#[derive(Clone)]
struct DirectiveEntry {
    flags: DirectiveFlags,
    handler: DirectiveHandler,
}

impl std::fmt::Debug for DirectiveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectiveEntry")
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Maps `(name, parser keyword)` to one directive handler.
#[derive(Default)]
pub struct DirectiveManager {
    entries: HashMap<(String, String), DirectiveEntry>,
}

impl DirectiveManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Names are case-insensitive.
    pub fn add(
        &mut self,
        name: &str,
        parser: &str,
        handler: DirectiveHandler,
        flags: DirectiveFlags,
    ) {
        self.entries.insert(
            (name.to_ascii_lowercase(), parser.to_ascii_lowercase()),
            DirectiveEntry { flags, handler },
        );
    }

    pub fn contains(&self, name: &str, parser: &str) -> bool {
        self.entries
            .contains_key(&(name.to_ascii_lowercase(), parser.to_ascii_lowercase()))
    }

    fn get(&self, name: &str, parser: &str) -> Result<DirectiveEntry, CoreError> {
        self.entries
            .get(&(name.to_ascii_lowercase(), parser.to_ascii_lowercase()))
            .cloned()
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::UnknownDirective,
                    format!("unrecognized directive `{name}`"),
                )
            })
    }

    /// Look up, validate, and invoke a directive.
    pub(crate) fn dispatch(
        &self,
        name: &str,
        parser: &str,
        object: &mut Object,
        namevals: &NameValues,
        objext_namevals: &NameValues,
        line: u32,
    ) -> Result<(), CoreError> {
        let entry = self.get(name, parser).map_err(|e| e.or_line(line))?;
        match entry.flags {
            DirectiveFlags::Any => {}
            DirectiveFlags::ArgRequired => {
                if namevals.is_empty() {
                    return Err(CoreError::with_line(
                        CoreErrorKind::DirectiveArgError,
                        format!("directive `{name}` requires an argument"),
                        line,
                    ));
                }
            }
            DirectiveFlags::IdRequired => {
                if !namevals.first().map(NameValue::is_id).unwrap_or(false) {
                    return Err(CoreError::with_line(
                        CoreErrorKind::DirectiveArgError,
                        format!("directive `{name}` requires an identifier parameter"),
                        line,
                    ));
                }
            }
        }
        (entry.handler)(object, namevals, objext_namevals, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namevalue_accessors_follow_kind() {
        let nv = NameValue::id("$label", '$');
        assert!(nv.is_id() && nv.is_expr() && nv.is_string());
        assert_eq!(nv.as_id().unwrap(), "label");
        assert_eq!(nv.as_string().unwrap(), "$label");

        let nv = NameValue::string("hello");
        assert!(!nv.is_id() && !nv.is_expr() && nv.is_string());
        assert_eq!(nv.as_string().unwrap(), "hello");
        assert!(nv.as_id().is_err());

        let nv = NameValue::new_expr(Some("align".into()), Expr::int(16));
        assert_eq!(nv.name(), Some("align"));
        assert!(nv.is_expr() && !nv.is_string());
        assert!(nv.as_string().is_err());
    }

    #[test]
    fn unknown_directive_lookup_fails() {
        let mgr = DirectiveManager::new();
        let err = mgr.get("nosuch", "nasm").unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::UnknownDirective);
    }

    #[test]
    fn lookup_is_case_insensitive_per_parser() {
        let mut mgr = DirectiveManager::new();
        mgr.add(
            "Section",
            "NASM",
            Arc::new(|_, _, _, _| Ok(())),
            DirectiveFlags::ArgRequired,
        );
        assert!(mgr.contains("section", "nasm"));
        assert!(!mgr.contains("section", "gas"));
    }
}
