//! A custom `kobold` error and result type, covering every way a launch can
//! go wrong: malformed images, incompatible slices, unresolvable dylibs and
//! symbols, validation and policy refusals, and plain resource exhaustion.

use core::fmt;
use core::result;
use std::error;
use std::io;

#[non_exhaustive]
#[derive(Debug)]
/// A custom `kobold` error
pub enum Error {
    /// The binary does not start with a known mach-o or fat magic number
    BadMagic(u64),
    /// The binary is malformed in some way: oversized load commands,
    /// ill-formed opcode streams, chain overflow, unknown pointer formats
    Malformed(String),
    /// The binary parsed, but is not usable in this process: wrong
    /// architecture, wrong platform, or built against a too-new SDK
    Incompatible(String),
    /// A dependent dylib could not be resolved through any search path
    DylibMissing {
        /// the requested install name or path
        path: String,
        /// the image that asked for it
        client: String,
        /// candidate paths that were tried, plus any SDK-version addendum
        detail: String,
    },
    /// A bind target was not found and the import was not weak
    SymbolMissing {
        /// the undefined symbol name
        symbol: String,
        /// the image that imports it
        client: String,
        /// where the lookup was directed (dylib path or namespace)
        detail: String,
    },
    /// The file on disk no longer matches its recorded identity
    /// (cdHash mismatch, inode/mtime changed under a prebuilt closure)
    Validation(String),
    /// Out of address space, a failed map, or a failed protection change
    Resource(String),
    /// The security policy refused the operation: AMFI denied the load,
    /// `@` paths are disallowed, or a restricted process used an env var
    Policy(String),
    /// An IO error from reading an image or cache file
    IO(io::Error),
    /// A scroll parse error while decoding an on-disk record
    Scroll(scroll::Error),
}

/// The exit-reason kind reported when a launch error aborts the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    SymbolMissing,
    DylibMissing,
    Other,
}

impl Error {
    /// Which abort-payload kind this error maps to when it is fatal at launch
    pub fn abort_kind(&self) -> AbortKind {
        match self {
            Error::SymbolMissing { .. } => AbortKind::SymbolMissing,
            Error::DylibMissing { .. } => AbortKind::DylibMissing,
            _ => AbortKind::Other,
        }
    }

    /// Terminates the process over a fatal launch error, emitting the
    /// single-line structured reason first. There is no rollback from a
    /// failed launch.
    pub fn abort(self) -> ! {
        error!("dyld[launch]: {:?}: {}", self.abort_kind(), self);
        std::process::abort()
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(io) => Some(io),
            Error::Scroll(scroll) => Some(scroll),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadMagic(magic) => write!(fmt, "Invalid magic number: 0x{:x}", magic),
            Error::Malformed(msg) => write!(fmt, "Malformed image: {}", msg),
            Error::Incompatible(msg) => write!(fmt, "Incompatible image: {}", msg),
            Error::DylibMissing {
                path,
                client,
                detail,
            } => write!(
                fmt,
                "Library not loaded: '{}'\n  Referenced from: '{}'\n  Reason: {}",
                path, client, detail
            ),
            Error::SymbolMissing {
                symbol,
                client,
                detail,
            } => write!(
                fmt,
                "Symbol not found: '{}'\n  Referenced from: '{}'\n  Expected in: {}",
                symbol, client, detail
            ),
            Error::Validation(msg) => write!(fmt, "Validation failed: {}", msg),
            Error::Resource(msg) => write!(fmt, "Resource failure: {}", msg),
            Error::Policy(msg) => write!(fmt, "Not permitted: {}", msg),
            Error::IO(err) => write!(fmt, "IO error: {}", err),
            Error::Scroll(err) => write!(fmt, "Scroll error: {}", err),
        }
    }
}

/// An impish result type
pub type Result<T> = result::Result<T, Error>;
