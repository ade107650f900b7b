//! The prebuilt loader: consumes a launch closure computed on a previous
//! launch. A closure records every image of the graph, its file identity,
//! and its dependency edges by index, so a launch that validates cleanly
//! skips path resolution and dependency discovery entirely. Any mismatch
//! invalidates the whole closure and the caller falls back to the
//! just-in-time path.

use std::path::Path;

use crate::error::{Error, Result};
use crate::loader::jit::{self, LoadOptions};
use crate::loader::{Dependent, DependentKind, FileId, LoaderKind, LoaderRef};
use crate::runtime::RuntimeState;

pub const CLOSURE_MAGIC: u32 = 0x636c_7331; // 'cls1'
pub const CLOSURE_VERSION: u32 = 1;

/// edge index meaning "weak-linked dylib that was missing at build time"
const MISSING_DEPENDENT: u32 = u32::MAX;

#[derive(Debug, Clone)]
/// One image of a serialized launch closure
pub struct ClosureEntry {
    pub path: String,
    pub uuid: [u8; 16],
    pub file_id: FileId,
    /// `(entry index, kind)` per dependency edge, in load-command order
    pub dependents: Vec<(u32, DependentKind)>,
}

#[derive(Debug, Clone, Default)]
/// A deserialized launch closure; entry 0 is the main executable
pub struct LaunchClosure {
    pub entries: Vec<ClosureEntry>,
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<u32> {
        let bytes = self
            .data
            .get(self.offset..self.offset + 4)
            .ok_or_else(|| Error::Malformed("truncated launch closure".into()))?;
        self.offset += 4;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self
            .data
            .get(self.offset..self.offset + 8)
            .ok_or_else(|| Error::Malformed("truncated launch closure".into()))?;
        self.offset += 8;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self
            .data
            .get(self.offset..self.offset + len)
            .ok_or_else(|| Error::Malformed("truncated launch closure".into()))?;
        self.offset += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Malformed("launch closure string is not utf-8".into()))
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self
            .data
            .get(self.offset..self.offset + N)
            .ok_or_else(|| Error::Malformed("truncated launch closure".into()))?;
        self.offset += N;
        Ok(bytes.try_into().unwrap())
    }
}

impl LaunchClosure {
    /// Records the loaded graph rooted at the arena's current contents
    pub fn from_state(state: &RuntimeState) -> LaunchClosure {
        let entries = state
            .loaders()
            .map(|loader| ClosureEntry {
                path: loader.path.clone(),
                uuid: loader.uuid,
                file_id: loader.file_id.clone(),
                dependents: loader
                    .dependents
                    .iter()
                    .map(|edge| {
                        (
                            edge.loader.map(|l| l.0).unwrap_or(MISSING_DEPENDENT),
                            edge.kind,
                        )
                    })
                    .collect(),
            })
            .collect();
        LaunchClosure { entries }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, CLOSURE_MAGIC);
        put_u32(&mut out, CLOSURE_VERSION);
        put_u32(&mut out, self.entries.len() as u32);
        for entry in &self.entries {
            put_str(&mut out, &entry.path);
            out.extend_from_slice(&entry.uuid);
            put_u64(&mut out, entry.file_id.device);
            put_u64(&mut out, entry.file_id.inode);
            put_u64(&mut out, entry.file_id.mtime);
            match &entry.file_id.cd_hash {
                Some(hash) => {
                    put_u32(&mut out, 1);
                    out.extend_from_slice(hash);
                }
                None => put_u32(&mut out, 0),
            }
            put_u32(&mut out, entry.dependents.len() as u32);
            for (index, kind) in &entry.dependents {
                put_u32(&mut out, *index);
                put_u32(
                    &mut out,
                    match kind {
                        DependentKind::Regular => 0,
                        DependentKind::WeakLink => 1,
                        DependentKind::Reexport => 2,
                        DependentKind::Upward => 3,
                    },
                );
            }
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<LaunchClosure> {
        let mut reader = Reader { data, offset: 0 };
        if reader.u32()? != CLOSURE_MAGIC {
            return Err(Error::Malformed("not a launch closure".into()));
        }
        if reader.u32()? != CLOSURE_VERSION {
            return Err(Error::Validation("launch closure version mismatch".into()));
        }
        let count = reader.u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let path = reader.str()?;
            let uuid: [u8; 16] = reader.bytes()?;
            let device = reader.u64()?;
            let inode = reader.u64()?;
            let mtime = reader.u64()?;
            let cd_hash = if reader.u32()? != 0 {
                Some(reader.bytes::<20>()?)
            } else {
                None
            };
            let edge_count = reader.u32()? as usize;
            let mut dependents = Vec::with_capacity(edge_count);
            for _ in 0..edge_count {
                let index = reader.u32()?;
                let kind = match reader.u32()? {
                    0 => DependentKind::Regular,
                    1 => DependentKind::WeakLink,
                    2 => DependentKind::Reexport,
                    3 => DependentKind::Upward,
                    other => {
                        return Err(Error::Malformed(format!(
                            "unknown closure edge kind {}",
                            other
                        )));
                    }
                };
                dependents.push((index, kind));
            }
            entries.push(ClosureEntry {
                path,
                uuid,
                file_id: FileId {
                    device,
                    inode,
                    mtime,
                    cd_hash,
                },
                dependents,
            });
        }
        Ok(LaunchClosure { entries })
    }

    /// Checks that every recorded file still matches its identity: same
    /// inode and mtime, or same cdHash when the image is signed
    pub fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            let current = FileId::for_file(Path::new(&entry.path), entry.file_id.cd_hash);
            let unchanged = if entry.file_id.cd_hash.is_some() {
                // signed images revalidate by content identity
                let bytes = std::fs::read(&entry.path)?;
                let mach = crate::mach::MachFile::parse(&bytes)?;
                mach.cd_hash()? == entry.file_id.cd_hash
            } else {
                current.device == entry.file_id.device
                    && current.inode == entry.file_id.inode
                    && current.mtime == entry.file_id.mtime
            };
            if !unchanged {
                return Err(Error::Validation(format!(
                    "'{}' changed since the launch closure was built",
                    entry.path
                )));
            }
        }
        Ok(())
    }

    /// Loads every image of a validated closure, skipping path resolution,
    /// and wires the recorded dependency edges. Returns the loaders in
    /// closure order (entry 0 first).
    pub fn load(&self, state: &mut RuntimeState) -> Result<Vec<LoaderRef>> {
        self.validate()?;
        let base = state.loader_count() as u32;
        let mut loaded = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            let options = LoadOptions {
                is_main_executable: i == 0 && base == 0,
                never_unload: true,
            };
            let ldr = jit::load_from_file(state, Path::new(&entry.path), options)?;
            {
                let loader = state.loader_mut(ldr);
                loader.kind = LoaderKind::Prebuilt;
                loader.flags |= crate::loader::LoaderFlags::IS_PREBUILT;
            }
            if state.loader(ldr).uuid != entry.uuid {
                return Err(Error::Validation(format!(
                    "'{}' UUID changed since the launch closure was built",
                    entry.path
                )));
            }
            loaded.push(ldr);
        }
        for (entry, &ldr) in self.entries.iter().zip(&loaded) {
            let edges = entry
                .dependents
                .iter()
                .map(|&(index, kind)| {
                    let loader = if index == MISSING_DEPENDENT {
                        None
                    } else {
                        loaded.get(index as usize).copied()
                    };
                    Dependent { kind, loader }
                })
                .collect();
            state.loader_mut(ldr).dependents = edges;
        }
        crate::fixup::patch::build_override_patch_tables(state)?;
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_serialization_roundtrip() {
        let closure = LaunchClosure {
            entries: vec![
                ClosureEntry {
                    path: "/bin/demo".into(),
                    uuid: [7; 16],
                    file_id: FileId {
                        device: 1,
                        inode: 42,
                        mtime: 1234,
                        cd_hash: Some([9; 20]),
                    },
                    dependents: vec![(1, DependentKind::Regular), (MISSING_DEPENDENT, DependentKind::WeakLink)],
                },
                ClosureEntry {
                    path: "/usr/lib/libfoo.dylib".into(),
                    uuid: [8; 16],
                    file_id: FileId::default(),
                    dependents: vec![],
                },
            ],
        };
        let bytes = closure.serialize();
        let parsed = LaunchClosure::deserialize(&bytes).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].path, "/bin/demo");
        assert_eq!(parsed.entries[0].dependents.len(), 2);
        assert_eq!(parsed.entries[0].dependents[1].0, MISSING_DEPENDENT);
        assert_eq!(parsed.entries[1].uuid, [8; 16]);
    }

    #[test]
    fn garbage_is_not_a_closure() {
        assert!(LaunchClosure::deserialize(&[1, 2, 3]).is_err());
    }
}
