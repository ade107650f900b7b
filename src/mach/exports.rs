//! The export trie: a compact prefix tree of every symbol an image exports,
//! with terminal nodes carrying flags and an image offset, a re-export
//! reference into another dylib, or a stub-and-resolver pair.
//!
//! Each node begins with a ULEB terminal size; if nonzero, the terminal
//! payload follows. After the terminal come the edges:
//! `{ edge_string NUL, child_offset_uleb }*`, child count first.

use core::ops::ControlFlow;

use crate::error::{Error, Result};
use crate::mach::uleb::read_uleb128;

pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where an exported symbol actually lives
pub enum ExportTarget<'a> {
    /// a plain offset from the image's preferred base
    Regular { offset: u64 },
    /// an absolute (non-relocated) constant
    Absolute { address: u64 },
    /// an offset into the image's thread-local template
    ThreadLocal { offset: u64 },
    /// really lives in a dependent dylib; empty name means "same name there"
    Reexport { lib_ordinal: u64, name: &'a str },
    /// a stub whose target is computed by running the resolver once
    StubAndResolver { stub_offset: u64, resolver_offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One exported symbol
pub struct Export<'a> {
    pub name: String,
    pub flags: u64,
    pub target: ExportTarget<'a>,
}

impl<'a> Export<'a> {
    pub fn is_weak_def(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0
    }
}

#[derive(Debug)]
/// A zero-copy view over an export trie blob
pub struct ExportTrie<'a> {
    data: &'a [u8],
}

struct Terminal<'a> {
    flags: u64,
    target: ExportTarget<'a>,
}

impl<'a> ExportTrie<'a> {
    pub fn new(data: &'a [u8]) -> ExportTrie<'a> {
        ExportTrie { data }
    }

    /// Whether the trie blob is empty; an empty trie exports nothing and is
    /// not an error
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn read_terminal(&self, offset: &mut usize) -> Result<Option<Terminal<'a>>> {
        let terminal_size = read_uleb128(self.data, offset)? as usize;
        if terminal_size == 0 {
            return Ok(None);
        }
        let terminal_end = offset
            .checked_add(terminal_size)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::Malformed("export trie terminal escapes the blob".into()))?;
        let mut cursor = *offset;
        *offset = terminal_end;
        let flags = read_uleb128(self.data, &mut cursor)?;
        let target = if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let lib_ordinal = read_uleb128(self.data, &mut cursor)?;
            let name_bytes = &self.data[cursor..terminal_end];
            let nul = name_bytes.iter().position(|&b| b == 0).ok_or_else(|| {
                Error::Malformed("export trie re-export name is not NUL-terminated".into())
            })?;
            let name = core::str::from_utf8(&name_bytes[..nul])
                .map_err(|_| Error::Malformed("export trie re-export name is not utf-8".into()))?;
            ExportTarget::Reexport { lib_ordinal, name }
        } else if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            let stub_offset = read_uleb128(self.data, &mut cursor)?;
            let resolver_offset = read_uleb128(self.data, &mut cursor)?;
            ExportTarget::StubAndResolver {
                stub_offset,
                resolver_offset,
            }
        } else {
            let value = read_uleb128(self.data, &mut cursor)?;
            match flags & EXPORT_SYMBOL_FLAGS_KIND_MASK {
                EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => ExportTarget::Absolute { address: value },
                EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL => ExportTarget::ThreadLocal { offset: value },
                _ => ExportTarget::Regular { offset: value },
            }
        };
        Ok(Some(Terminal { flags, target }))
    }

    /// Descends the trie looking for exactly `symbol`
    pub fn find(&self, symbol: &str) -> Result<Option<Export<'a>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let mut offset = 0usize;
        let mut remaining = symbol.as_bytes();
        // every hop moves to a strictly in-bounds child; cap the hops so a
        // cyclic trie cannot walk forever
        for _ in 0..=self.data.len() {
            let mut cursor = offset;
            let terminal = self.read_terminal(&mut cursor)?;
            if remaining.is_empty() {
                return Ok(terminal.map(|t| Export {
                    name: symbol.to_owned(),
                    flags: t.flags,
                    target: t.target,
                }));
            }
            let child_count = *self
                .data
                .get(cursor)
                .ok_or_else(|| Error::Malformed("export trie node escapes the blob".into()))?;
            cursor += 1;
            let mut matched = None;
            for _ in 0..child_count {
                let edge_start = cursor;
                let nul = self.data[edge_start..]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| {
                        Error::Malformed("export trie edge is not NUL-terminated".into())
                    })?;
                let edge = &self.data[edge_start..edge_start + nul];
                cursor = edge_start + nul + 1;
                let child_offset = read_uleb128(self.data, &mut cursor)? as usize;
                if remaining.starts_with(edge) {
                    matched = Some((edge.len(), child_offset));
                    break;
                }
            }
            match matched {
                Some((consumed, child_offset)) => {
                    if child_offset >= self.data.len() {
                        return Err(Error::Malformed(format!(
                            "export trie child offset {:#x} is outside the blob",
                            child_offset
                        )));
                    }
                    remaining = &remaining[consumed..];
                    offset = child_offset;
                }
                None => return Ok(None),
            }
        }
        Err(Error::Malformed("export trie walk did not terminate".into()))
    }

    /// Walks every export in the trie, in depth-first edge order. The
    /// handler can stop the walk early.
    pub fn for_each(
        &self,
        mut handler: impl FnMut(&Export<'a>) -> ControlFlow<()>,
    ) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }
        let mut fuel = self.data.len() + 1;
        let mut prefix = Vec::new();
        self.walk_node(0, &mut prefix, &mut fuel, &mut handler)
            .map(|_| ())
    }

    fn walk_node(
        &self,
        offset: usize,
        prefix: &mut Vec<u8>,
        fuel: &mut usize,
        handler: &mut impl FnMut(&Export<'a>) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>> {
        if *fuel == 0 {
            return Err(Error::Malformed("export trie walk did not terminate".into()));
        }
        *fuel -= 1;
        let mut cursor = offset;
        if let Some(terminal) = self.read_terminal(&mut cursor)? {
            let name = core::str::from_utf8(prefix)
                .map_err(|_| Error::Malformed("export trie symbol is not utf-8".into()))?
                .to_owned();
            let export = Export {
                name,
                flags: terminal.flags,
                target: terminal.target,
            };
            if handler(&export).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        let child_count = *self
            .data
            .get(cursor)
            .ok_or_else(|| Error::Malformed("export trie node escapes the blob".into()))?;
        cursor += 1;
        for _ in 0..child_count {
            let edge_start = cursor;
            let nul = self.data[cursor..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::Malformed("export trie edge is not NUL-terminated".into()))?;
            cursor = edge_start + nul + 1;
            let child_offset = read_uleb128(self.data, &mut cursor)? as usize;
            if child_offset >= self.data.len() {
                return Err(Error::Malformed(format!(
                    "export trie child offset {:#x} is outside the blob",
                    child_offset
                )));
            }
            let edge_len = nul;
            prefix.extend_from_slice(&self.data[edge_start..edge_start + edge_len]);
            let flow = self.walk_node(child_offset, prefix, fuel, handler)?;
            prefix.truncate(prefix.len() - edge_len);
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // hand-assembled trie exporting `_foo` -> 0x1000 and `_fob` (weak) -> 0x2000
    fn sample_trie() -> Vec<u8> {
        let mut trie = Vec::new();
        // root at 0: no terminal, one child "_fo" -> node at 7
        trie.extend_from_slice(&[0x00, 0x01]);
        trie.extend_from_slice(b"_fo\0");
        trie.push(7);
        assert_eq!(trie.len(), 7);
        // node at 7: no terminal, children "o" -> 16 and "b" -> 21
        trie.extend_from_slice(&[0x00, 0x02]);
        trie.extend_from_slice(b"o\0");
        trie.push(16);
        trie.extend_from_slice(b"b\0");
        trie.push(21);
        assert_eq!(trie.len(), 16);
        // node at 16: terminal size 3, flags 0, uleb 0x1000, no children
        trie.extend_from_slice(&[0x03, 0x00, 0x80, 0x20, 0x00]);
        assert_eq!(trie.len(), 21);
        // node at 21: terminal size 3, weak-def flag, uleb 0x2000, no children
        trie.extend_from_slice(&[0x03, 0x04, 0x80, 0x40, 0x00]);
        trie
    }

    #[test]
    fn find_descends_edges() {
        let data = sample_trie();
        let trie = ExportTrie::new(&data);
        let export = trie.find("_foo").unwrap().unwrap();
        assert_eq!(export.target, ExportTarget::Regular { offset: 0x1000 });
        assert!(!export.is_weak_def());
        let weak = trie.find("_fob").unwrap().unwrap();
        assert_eq!(weak.target, ExportTarget::Regular { offset: 0x2000 });
        assert!(weak.is_weak_def());
        assert!(trie.find("_fox").unwrap().is_none());
        assert!(trie.find("_f").unwrap().is_none());
    }

    #[test]
    fn empty_trie_finds_nothing() {
        let trie = ExportTrie::new(&[]);
        assert!(trie.find("_foo").unwrap().is_none());
        let mut count = 0;
        trie.for_each(|_| {
            count += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn for_each_yields_all_exports() {
        let data = sample_trie();
        let trie = ExportTrie::new(&data);
        let mut names = Vec::new();
        trie.for_each(|export| {
            names.push(export.name.clone());
            ControlFlow::Continue(())
        })
        .unwrap();
        names.sort();
        assert_eq!(names, vec!["_fob".to_owned(), "_foo".to_owned()]);
    }
}
