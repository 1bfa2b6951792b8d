// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Binary file inclusion and the include search path.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::bytecode::FinalizeCtx;
use super::error::{CoreError, CoreErrorKind};
use super::expr::Expr;
use super::value::resolve_const;

/// Include-file search collaborator.
///
/// Files are looked up relative to the working directory first, then
/// through each registered search path in order.
#[derive(Debug, Clone, Default)]
pub struct Includes {
    paths: Vec<PathBuf>,
}

impl Includes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// Locate a file, returning its resolved path.
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        let direct = Path::new(filename);
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }
        for base in &self.paths {
            let candidate = base.join(filename);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

/// A verbatim slice of a binary file.
///
/// The length is fixed once finalized; a file that turns out to be too
/// short fails at emission time.
#[derive(Debug, Clone)]
pub struct Incbin {
    filename: String,
    start: Option<Expr>,
    maxlen: Option<Expr>,
    path: Option<PathBuf>,
    start_val: u64,
    len: u64,
}

impl Incbin {
    pub fn new(filename: String, start: Option<Expr>, maxlen: Option<Expr>) -> Self {
        Self {
            filename,
            start,
            maxlen,
            path: None,
            start_val: 0,
            len: 0,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub(crate) fn finalize(&mut self, ctx: &mut FinalizeCtx<'_>) -> Result<(), CoreError> {
        let resolve_u64 = |expr: &Expr, what: &str| -> Result<u64, CoreError> {
            let n = resolve_const(expr, ctx.symbols)?;
            n.to_u64().ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::MalformedExpression,
                    format!("incbin {what} is negative or too large"),
                )
            })
        };
        self.start_val = match &self.start {
            Some(e) => resolve_u64(e, "start")?,
            None => 0,
        };
        let maxlen = match &self.maxlen {
            Some(e) => Some(resolve_u64(e, "maximum length")?),
            None => None,
        };

        let path = ctx.includes.resolve(&self.filename).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::Io,
                format!("unable to open file `{}`", self.filename),
            )
        })?;
        let size = std::fs::metadata(&path)
            .map_err(|e| {
                CoreError::new(
                    CoreErrorKind::Io,
                    format!("unable to stat `{}`: {e}", path.display()),
                )
            })?
            .len();

        self.len = match maxlen {
            Some(maxlen) => maxlen,
            None => {
                if self.start_val > size {
                    return Err(CoreError::new(
                        CoreErrorKind::Io,
                        format!(
                            "incbin start {} is past the end of `{}` ({} bytes)",
                            self.start_val, self.filename, size
                        ),
                    ));
                }
                size - self.start_val
            }
        };
        self.path = Some(path);
        Ok(())
    }

    pub(crate) fn calc_len(&self) -> Result<u64, CoreError> {
        Ok(self.len)
    }

    pub(crate) fn to_bytes(&self, buf: &mut Vec<u8>) -> Result<(), CoreError> {
        let path = self.path.as_ref().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::InternalConsistency,
                "incbin emitted before finalize",
            )
        })?;
        let io_err = |e: std::io::Error| {
            CoreError::new(
                CoreErrorKind::Io,
                format!("error reading `{}`: {e}", self.filename),
            )
        };
        let mut file = File::open(path).map_err(io_err)?;
        file.seek(SeekFrom::Start(self.start_val)).map_err(io_err)?;
        let mut data = vec![0u8; self.len as usize];
        file.read_exact(&mut data).map_err(|_| {
            CoreError::new(
                CoreErrorKind::Io,
                format!(
                    "`{}` ended before {} bytes could be read at offset {}",
                    self.filename, self.len, self.start_val
                ),
            )
        })?;
        buf.extend_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::symbol::SymbolTable;
    use std::io::Write;

    fn temp_file(contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "asmforge-incbin-{}-{:?}.bin",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn finalize_ctx<'a>(symbols: &'a SymbolTable, includes: &'a Includes) -> FinalizeCtx<'a> {
        FinalizeCtx {
            symbols,
            includes,
            line: 1,
        }
    }

    #[test]
    fn incbin_emits_requested_slice() {
        let data: Vec<u8> = (0u8..32).collect();
        let path = temp_file(&data);
        let symbols = SymbolTable::new();
        let includes = Includes::new();
        let mut inc = Incbin::new(
            path.to_string_lossy().into_owned(),
            Some(Expr::int(4)),
            Some(Expr::int(16)),
        );
        inc.finalize(&mut finalize_ctx(&symbols, &includes)).unwrap();
        assert_eq!(inc.calc_len().unwrap(), 16);
        let mut buf = Vec::new();
        inc.to_bytes(&mut buf).unwrap();
        assert_eq!(buf, (4u8..20).collect::<Vec<_>>());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn incbin_defaults_to_rest_of_file() {
        let path = temp_file(&[1, 2, 3, 4, 5, 6]);
        let symbols = SymbolTable::new();
        let includes = Includes::new();
        let mut inc = Incbin::new(
            path.to_string_lossy().into_owned(),
            Some(Expr::int(2)),
            None,
        );
        inc.finalize(&mut finalize_ctx(&symbols, &includes)).unwrap();
        assert_eq!(inc.calc_len().unwrap(), 4);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn short_file_fails_at_emission() {
        let path = temp_file(&[0u8; 10]);
        let symbols = SymbolTable::new();
        let includes = Includes::new();
        let mut inc = Incbin::new(
            path.to_string_lossy().into_owned(),
            Some(Expr::int(4)),
            Some(Expr::int(16)),
        );
        inc.finalize(&mut finalize_ctx(&symbols, &includes)).unwrap();
        let mut buf = Vec::new();
        let err = inc.to_bytes(&mut buf).unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::Io);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_fails_at_finalize() {
        let symbols = SymbolTable::new();
        let includes = Includes::new();
        let mut inc = Incbin::new("definitely-missing.bin".into(), None, None);
        let err = inc
            .finalize(&mut finalize_ctx(&symbols, &includes))
            .unwrap_err();
        assert_eq!(err.kind(), CoreErrorKind::Io);
    }

    #[test]
    fn includes_search_paths_resolve_relative_names() {
        let data = [0xaau8; 4];
        let path = temp_file(&data);
        let dir = path.parent().unwrap().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let mut includes = Includes::new();
        includes.add_path(dir);
        assert!(includes.resolve(&name).is_some());
        assert!(includes.resolve("no-such-file.bin").is_none());
        let _ = std::fs::remove_file(path);
    }
}
