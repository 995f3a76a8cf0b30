//! Symbol-table and field-offset metadata.
//!
//! Structure knowledge comes entirely from two kinds of run-time metadata:
//! symbol tables mapping global names to addresses (one namespace for Xen
//! itself, one for the dom0 kernel), and an offset table mapping
//! `struct.field` names to byte layout. Together they substitute for the
//! compiled-in type information a crash dump does not carry.
//!
//! Line grammars are documented in `FORMATS.md`.

use std::collections::HashMap;
use std::io::{self, BufRead};

use thiserror::Error;
use tracing::info;

use crate::image::{Signedness, Width};

/// Errors from metadata loading and lookup.
#[derive(Debug, Error)]
pub enum SymbolError {
    /// A metadata line does not match the grammar.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// A name recurred within one namespace.
    #[error("duplicate symbol '{name}' in {namespace} namespace")]
    DuplicateSymbol { namespace: Namespace, name: String },

    /// A looked-up name is absent. Common and recoverable: metadata and
    /// hypervisor build drift apart across versions.
    #[error("unknown symbol '{name}' in {namespace} namespace")]
    UnknownSymbol { namespace: Namespace, name: String },

    /// No layout entry for a `struct.field` pair.
    #[error("no layout for field {struct_name}.{field}")]
    UnknownField { struct_name: String, field: String },

    /// Underlying reader failure.
    #[error("I/O failure reading metadata: {0}")]
    Io(#[from] io::Error),
}

/// Which symbol namespace a name lives in.
///
/// Hypervisor globals and dom0 kernel globals are resolved from separate
/// metadata files and must never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Xen,
    Dom0,
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Xen => write!(f, "Xen"),
            Namespace::Dom0 => write!(f, "dom0"),
        }
    }
}

/// Name → address lookups, split across independent namespaces.
#[derive(Debug, Default)]
pub struct SymbolTable {
    xen: HashMap<String, u64>,
    dom0: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, ns: Namespace) -> &HashMap<String, u64> {
        match ns {
            Namespace::Xen => &self.xen,
            Namespace::Dom0 => &self.dom0,
        }
    }

    /// Load a symbol file into one namespace, returning the entry count.
    ///
    /// Grammar per line: `<hex address> <type char> <name>` (nm / xen-syms
    /// map format). Blank lines are skipped. A malformed line is fatal for
    /// the file; a repeated name within the namespace is `DuplicateSymbol`.
    pub fn load(&mut self, reader: impl BufRead, ns: Namespace) -> Result<usize, SymbolError> {
        let mut count = 0usize;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let mut parts = trimmed.split_whitespace();
            let (addr, kind, name) = match (parts.next(), parts.next(), parts.next(), parts.next())
            {
                (Some(a), Some(k), Some(n), None) => (a, k, n),
                _ => {
                    return Err(SymbolError::Parse {
                        line: line_no,
                        reason: format!("expected '<address> <type> <name>', got '{}'", trimmed),
                    })
                }
            };
            if kind.len() != 1 {
                return Err(SymbolError::Parse {
                    line: line_no,
                    reason: format!("symbol type '{}' is not a single character", kind),
                });
            }
            let address = u64::from_str_radix(addr.trim_start_matches("0x"), 16).map_err(|_| {
                SymbolError::Parse {
                    line: line_no,
                    reason: format!("bad address '{}'", addr),
                }
            })?;

            let table = match ns {
                Namespace::Xen => &mut self.xen,
                Namespace::Dom0 => &mut self.dom0,
            };
            if table.insert(name.to_string(), address).is_some() {
                return Err(SymbolError::DuplicateSymbol {
                    namespace: ns,
                    name: name.to_string(),
                });
            }
            count += 1;
        }

        info!("loaded {} symbols into {} namespace", count, ns);
        Ok(count)
    }

    /// Resolve a name to its address.
    ///
    /// `UnknownSymbol` is an expected condition, not a fault: callers decide
    /// whether the symbol was mandatory.
    pub fn resolve_address(&self, ns: Namespace, name: &str) -> Result<u64, SymbolError> {
        self.namespace(ns)
            .get(name)
            .copied()
            .ok_or_else(|| SymbolError::UnknownSymbol {
                namespace: ns,
                name: name.to_string(),
            })
    }

    /// Number of symbols loaded into a namespace.
    pub fn len(&self, ns: Namespace) -> usize {
        self.namespace(ns).len()
    }

    pub fn is_empty(&self, ns: Namespace) -> bool {
        self.namespace(ns).is_empty()
    }
}

/// Width of a field as declared in offset metadata.
///
/// `Ptr` entries resolve to the container's pointer width, so one offset
/// file can serve both 32-bit and 64-bit hypervisor builds where layouts
/// otherwise agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    Fixed(Width),
    Ptr,
}

impl FieldWidth {
    /// Concrete width given the container's pointer width.
    pub fn resolve(self, pointer: Width) -> Width {
        match self {
            FieldWidth::Fixed(w) => w,
            FieldWidth::Ptr => pointer,
        }
    }
}

/// Layout of one structure field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetEntry {
    pub field: String,
    /// Byte offset from the start of the structure.
    pub offset: u32,
    pub width: FieldWidth,
    pub signedness: Signedness,
}

/// `struct.field` → byte-layout lookups.
///
/// Field order within a struct is the file order; rendering uses it as the
/// deterministic output order.
#[derive(Debug, Default)]
pub struct OffsetTable {
    structs: HashMap<String, Vec<OffsetEntry>>,
}

impl OffsetTable {
    /// Parse an offset file.
    ///
    /// Grammar per line: `<struct>.<field> <offset> <width> [signed]` where
    /// width is `1`, `2`, `4`, `8` or `ptr` and offset is decimal or
    /// `0x`-hex. `#` starts a comment; blank lines are skipped. Duplicate
    /// `struct.field` pairs are rejected.
    pub fn parse(reader: impl BufRead) -> Result<Self, SymbolError> {
        let mut table = OffsetTable::default();
        let mut count = 0usize;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let trimmed = match line.split('#').next() {
                Some(t) => t.trim(),
                None => "",
            };
            if trimmed.is_empty() {
                continue;
            }

            let parse_err = |reason: String| SymbolError::Parse {
                line: line_no,
                reason,
            };

            let mut parts = trimmed.split_whitespace();
            let (path, offset, width) = match (parts.next(), parts.next(), parts.next()) {
                (Some(p), Some(o), Some(w)) => (p, o, w),
                _ => {
                    return Err(parse_err(format!(
                        "expected '<struct>.<field> <offset> <width> [signed]', got '{}'",
                        trimmed
                    )))
                }
            };
            let signedness = match parts.next() {
                None => Signedness::Unsigned,
                Some("signed") => Signedness::Signed,
                Some(other) => return Err(parse_err(format!("unexpected token '{}'", other))),
            };
            if parts.next().is_some() {
                return Err(parse_err("trailing tokens".to_string()));
            }

            let (struct_name, field) = path
                .split_once('.')
                .filter(|(s, f)| !s.is_empty() && !f.is_empty())
                .ok_or_else(|| parse_err(format!("'{}' is not of the form struct.field", path)))?;

            let offset = if let Some(hex) = offset.strip_prefix("0x") {
                u32::from_str_radix(hex, 16)
            } else {
                offset.parse()
            }
            .map_err(|_| parse_err(format!("bad offset '{}'", offset)))?;

            let width = match width {
                "1" => FieldWidth::Fixed(Width::Byte),
                "2" => FieldWidth::Fixed(Width::Word),
                "4" => FieldWidth::Fixed(Width::Dword),
                "8" => FieldWidth::Fixed(Width::Qword),
                "ptr" => FieldWidth::Ptr,
                other => return Err(parse_err(format!("bad width '{}'", other))),
            };

            let fields = table.structs.entry(struct_name.to_string()).or_default();
            if fields.iter().any(|e| e.field == field) {
                return Err(parse_err(format!("duplicate entry for {}", path)));
            }
            fields.push(OffsetEntry {
                field: field.to_string(),
                offset,
                width,
                signedness,
            });
            count += 1;
        }

        info!(
            "loaded {} field offsets for {} structures",
            count,
            table.structs.len()
        );
        Ok(table)
    }

    /// All fields of a structure, in file order.
    pub fn fields_of(&self, struct_name: &str) -> Option<&[OffsetEntry]> {
        self.structs.get(struct_name).map(Vec::as_slice)
    }

    /// Resolve one field's layout.
    pub fn resolve_field(&self, struct_name: &str, field: &str) -> Result<&OffsetEntry, SymbolError> {
        self.structs
            .get(struct_name)
            .and_then(|fields| fields.iter().find(|e| e.field == field))
            .ok_or_else(|| SymbolError::UnknownField {
                struct_name: struct_name.to_string(),
                field: field.to_string(),
            })
    }
}
