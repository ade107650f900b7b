//! # libkobold
//!
//! ```text
//!         ,_-=(!7(7/zs_.
//!      .='  ' .`/,/!(=)Zm.
//!        .._,,._..  ,-`- `,\ ` -` -`\\7//WW.
//! ```
//!
//! `kobold` is the core of a Mach-O dynamic linker: it analyzes mach-o
//! images, maps them, resolves their dependents, applies their fixups, and
//! orders their initializers, in the sequence a process launch requires.
//!
//! The crate is layered leaves-first, and the layers only know about the
//! layers below them:
//!
//! * [`mach`] - a zero-copy analyzer over a mapped mach-o slice: load
//!   commands, segments, linkedit tables, fixup metadata. It is a pure
//!   function of the bytes and knows nothing of process state.
//! * [`config`] - the immutable, once-per-process record of platform,
//!   architecture, security policy, and path overrides, derived from
//!   kernel-supplied arguments.
//! * [`paths`] - the search algorithm that turns a requested install name
//!   (possibly `@rpath`-relative) into candidate files on disk.
//! * [`loader`] - the runtime representation of one loaded image, and the
//!   just-in-time loader that maps an image from disk and wires up its
//!   dependency edges.
//! * [`fixup`] - the engine that rewrites every rebase and bind location in
//!   a mapped image, across three generations of fixup metadata.
//! * [`cache`] - a read-only view of a dyld shared cache file: image table
//!   and patch tables.
//! * [`runtime`] - the process-wide mutable state: the loader arena, the
//!   weak-def map, the interpose table, and the loader lock.
//! * [`launch`] - the launch driver tying it all together.
//! * [`tlv`] - lazy per-thread storage for thread-local variables.
//! * [`helpers`] - the narrow vtable through which the linker calls back
//!   into libSystem once it is available.
//!
//! # Example
//!
//! ```rust,ignore
//! use kobold::mach::MachFile;
//!
//! let bytes = std::fs::read("/usr/lib/libfoo.dylib")?;
//! let image = MachFile::parse(&bytes)?;
//! image.for_each_dependent(|dep| {
//!     println!("{} (weak: {})", dep.path, dep.weak);
//!     std::ops::ControlFlow::Continue(())
//! })?;
//! ```

#[macro_use]
extern crate log;

pub mod error;
pub use crate::error::{Error, Result};

pub mod container;

pub mod mach;

pub mod config;
pub mod paths;

pub mod loader;

pub mod fixup;

pub mod cache;

pub mod runtime;

pub mod launch;

pub mod helpers;
pub mod tlv;
