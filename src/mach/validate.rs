//! Layout and policy validation: everything that must hold before any
//! mapping decision is made from an untrusted mach-o slice.

use crate::error::{Error, Result};
use crate::mach::arch::{self, GradedArchs};
use crate::mach::constants::{SEG_LINKEDIT, SEG_PAGEZERO, SEG_TEXT};
use crate::mach::header::{
    MH_BUNDLE, MH_DYLIB, MH_DYLINKER, MH_EXECUTE, MH_PRELOAD,
};
use crate::mach::{EntryInfo, MachFile, Platform, Version32};

/// What the process will accept from an image
#[derive(Debug, Clone, Copy)]
pub struct ValidationPolicy<'p> {
    /// path the image was loaded from, for error wording
    pub path: &'p str,
    pub archs: &'p GradedArchs,
    /// the platform this process runs on
    pub platform: Platform,
    /// the OS version this process runs on; images requiring newer are
    /// rejected with the version in the message
    pub os_version: Version32,
    /// whether the file is signed as an OS binary
    pub is_os_binary: bool,
    pub internal_install: bool,
    /// acceptable values of the header filetype field
    pub filetypes: &'p [u32],
}

/// filetypes a main executable may have
pub const MAIN_EXECUTABLE_FILETYPES: &[u32] = &[MH_EXECUTE];
/// filetypes a loadable image may have
pub const LOADABLE_FILETYPES: &[u32] = &[MH_DYLIB, MH_BUNDLE, MH_EXECUTE, MH_DYLINKER];

impl<'p> ValidationPolicy<'p> {
    pub fn for_main_executable(
        path: &'p str,
        archs: &'p GradedArchs,
        platform: Platform,
        os_version: Version32,
    ) -> ValidationPolicy<'p> {
        ValidationPolicy {
            path,
            archs,
            platform,
            os_version,
            is_os_binary: false,
            internal_install: false,
            filetypes: MAIN_EXECUTABLE_FILETYPES,
        }
    }

    pub fn for_dylib(
        path: &'p str,
        archs: &'p GradedArchs,
        platform: Platform,
        os_version: Version32,
    ) -> ValidationPolicy<'p> {
        ValidationPolicy {
            path,
            archs,
            platform,
            os_version,
            is_os_binary: false,
            internal_install: false,
            filetypes: &[MH_DYLIB, MH_BUNDLE],
        }
    }
}

impl<'a> MachFile<'a> {
    /// Validates the parsed image against `policy` and the layout
    /// invariants. Succeeds only when every check holds; the first failure
    /// is reported with the image path.
    pub fn validate(&self, policy: &ValidationPolicy) -> Result<()> {
        self.validate_arch(policy)?;
        self.validate_filetype(policy)?;
        self.validate_platform(policy)?;
        self.validate_text(policy)?;
        self.validate_segments(policy)?;
        self.validate_linkedit(policy)?;
        self.validate_entry(policy)?;
        if self.header.filetype == MH_DYLIB && self.install_name.is_none() {
            return Err(Error::Malformed(format!(
                "dylib '{}' has no LC_ID_DYLIB",
                policy.path
            )));
        }
        if let Some(chained) = self.chained_fixups()? {
            if self.linkedit.dyld_info.is_some() {
                return Err(Error::Malformed(format!(
                    "'{}' has both LC_DYLD_INFO and LC_DYLD_CHAINED_FIXUPS",
                    policy.path
                )));
            }
            // decoding the starts table runs every chained-header check
            chained.starts()?;
        }
        Ok(())
    }

    fn validate_arch(&self, policy: &ValidationPolicy) -> Result<()> {
        if policy
            .archs
            .grade(self.header.cputype, self.header.cpusubtype, policy.is_os_binary)
            .is_some()
        {
            return Ok(());
        }
        let have = arch::arch_name(self.header.cputype, self.header.cpusubtype);
        if policy.archs.supports_cputype(self.header.cputype) {
            Err(Error::Incompatible(format!(
                "'{}' has incompatible cpu subtype; have '{}', need '{}'",
                policy.path, have, policy.archs
            )))
        } else {
            Err(Error::Incompatible(format!(
                "'{}' is for the wrong architecture; have '{}', need '{}'",
                policy.path, have, policy.archs
            )))
        }
    }

    fn validate_filetype(&self, policy: &ValidationPolicy) -> Result<()> {
        if policy.filetypes.contains(&self.header.filetype) {
            Ok(())
        } else {
            Err(Error::Incompatible(format!(
                "'{}' is not loadable here: filetype {}",
                policy.path,
                crate::mach::header::filetype_to_str(self.header.filetype)
            )))
        }
    }

    fn validate_platform(&self, policy: &ValidationPolicy) -> Result<()> {
        if matches!(policy.platform, Platform::Unknown(_)) {
            return Ok(());
        }
        let info = match &self.platform {
            Some(info) => info,
            None => {
                return Err(Error::Incompatible(format!(
                    "'{}' has no platform load command",
                    policy.path
                )));
            }
        };
        if !policy.platform.accepts(info.platform) {
            return Err(Error::Incompatible(format!(
                "'{}' was built for {}, cannot load in a {} process",
                policy.path, info.platform, policy.platform
            )));
        }
        if info.min_os > policy.os_version {
            return Err(Error::Incompatible(format!(
                "'{}' requires {} {} but the running version is {}",
                policy.path, info.platform, info.min_os, policy.os_version
            )));
        }
        Ok(())
    }

    fn validate_text(&self, policy: &ValidationPolicy) -> Result<()> {
        let text = self.segment(SEG_TEXT).ok_or_else(|| {
            Error::Malformed(format!("'{}' has no __TEXT segment", policy.path))
        })?;
        if text.fileoff != 0 && self.header.filetype != MH_PRELOAD {
            return Err(Error::Malformed(format!(
                "'{}' __TEXT does not start at file offset 0",
                policy.path
            )));
        }
        let commands_end = self.header.size() as u64 + u64::from(self.header.sizeofcmds);
        if commands_end > text.filesize {
            return Err(Error::Malformed(format!(
                "'{}' load commands stretch beyond the __TEXT segment",
                policy.path
            )));
        }
        if text.init_prot.is_writable() || !text.init_prot.is_executable() {
            return Err(Error::Malformed(format!(
                "'{}' __TEXT segment is not mapped r-x",
                policy.path
            )));
        }
        Ok(())
    }

    fn validate_segments(&self, policy: &ValidationPolicy) -> Result<()> {
        let file_len = self.data.len() as u64;
        let mut last_fileoff = 0u64;
        for (i, segment) in self.segments.iter().enumerate() {
            if segment.filesize > segment.vmsize && segment.name != SEG_LINKEDIT {
                return Err(Error::Malformed(format!(
                    "'{}' segment {} filesize exceeds vmsize",
                    policy.path, segment.name
                )));
            }
            let file_end = segment.fileoff.checked_add(segment.filesize).ok_or_else(|| {
                Error::Malformed(format!(
                    "'{}' segment {} file range overflows",
                    policy.path, segment.name
                ))
            })?;
            if file_end > file_len {
                return Err(Error::Malformed(format!(
                    "'{}' segment {} file range {:#x}..{:#x} is outside the {:#x} byte slice",
                    policy.path, segment.name, segment.fileoff, file_end, file_len
                )));
            }
            if segment.filesize > 0 {
                if segment.fileoff < last_fileoff {
                    return Err(Error::Malformed(format!(
                        "'{}' segment {} file offset goes backwards",
                        policy.path, segment.name
                    )));
                }
                last_fileoff = segment.fileoff;
            }
            segment.vmaddr.checked_add(segment.vmsize).ok_or_else(|| {
                Error::Malformed(format!(
                    "'{}' segment {} vm range overflows",
                    policy.path, segment.name
                ))
            })?;
            for other in &self.segments[i + 1..] {
                let disjoint = segment.vmaddr + segment.vmsize <= other.vmaddr
                    || other.vmaddr + other.vmsize <= segment.vmaddr;
                if !disjoint && segment.vmsize > 0 && other.vmsize > 0 {
                    return Err(Error::Malformed(format!(
                        "'{}' segments {} and {} overlap in vm space",
                        policy.path, segment.name, other.name
                    )));
                }
            }
            if segment.name == SEG_PAGEZERO
                && (segment.filesize != 0 || !segment.init_prot.is_empty())
            {
                return Err(Error::Malformed(format!(
                    "'{}' __PAGEZERO must be empty and inaccessible",
                    policy.path
                )));
            }
        }
        Ok(())
    }

    /// Every linkedit table must lie inside the linkedit segment, and the
    /// dyld-info streams must appear in their canonical order
    fn validate_linkedit(&self, policy: &ValidationPolicy) -> Result<()> {
        let linkedit = match self.segment(SEG_LINKEDIT) {
            Some(linkedit) => linkedit,
            // images with no linkedit tables at all are acceptable
            None => {
                return if self.linkedit.symtab.is_none() && self.linkedit.dyld_info.is_none() {
                    Ok(())
                } else {
                    Err(Error::Malformed(format!(
                        "'{}' has linkedit tables but no __LINKEDIT segment",
                        policy.path
                    )))
                };
            }
        };
        let le_start = linkedit.fileoff;
        let le_end = linkedit.fileoff + linkedit.filesize;
        let mut check = |off: u32, size: u32, what: &str| -> Result<()> {
            if size == 0 {
                return Ok(());
            }
            let start = u64::from(off);
            let end = start + u64::from(size);
            if start < le_start || end > le_end {
                return Err(Error::Malformed(format!(
                    "'{}' {} {:#x}..{:#x} is outside __LINKEDIT {:#x}..{:#x}",
                    policy.path, what, start, end, le_start, le_end
                )));
            }
            Ok(())
        };
        if let Some(symtab) = &self.linkedit.symtab {
            let nlist_size = if self.is64() { 16 } else { 12 };
            check(symtab.symoff, symtab.nsyms.saturating_mul(nlist_size), "symbol table")?;
            check(symtab.stroff, symtab.strsize, "string pool")?;
        }
        if let Some(dysymtab) = &self.linkedit.dysymtab {
            check(dysymtab.indirectsymoff, dysymtab.nindirectsyms.saturating_mul(4), "indirect symbol table")?;
            check(dysymtab.locreloff, dysymtab.nlocrel.saturating_mul(8), "local relocations")?;
            check(dysymtab.extreloff, dysymtab.nextrel.saturating_mul(8), "external relocations")?;
        }
        if let Some(info) = &self.linkedit.dyld_info {
            check(info.rebase_off, info.rebase_size, "rebase opcodes")?;
            check(info.bind_off, info.bind_size, "bind opcodes")?;
            check(info.weak_bind_off, info.weak_bind_size, "weak bind opcodes")?;
            check(info.lazy_bind_off, info.lazy_bind_size, "lazy bind opcodes")?;
            check(info.export_off, info.export_size, "export trie")?;
            // the streams are laid out in a fixed order; a stream that
            // starts before its predecessor is lying about its extent
            let mut previous = 0u32;
            for (off, size) in [
                (info.rebase_off, info.rebase_size),
                (info.bind_off, info.bind_size),
                (info.weak_bind_off, info.weak_bind_size),
                (info.lazy_bind_off, info.lazy_bind_size),
                (info.export_off, info.export_size),
            ] {
                if size == 0 {
                    continue;
                }
                if off < previous {
                    return Err(Error::Malformed(format!(
                        "'{}' dyld info streams are not monotone",
                        policy.path
                    )));
                }
                previous = off;
            }
        }
        if let Some(chained) = &self.linkedit.chained_fixups {
            check(chained.dataoff, chained.datasize, "chained fixups")?;
        }
        if let Some(trie) = &self.linkedit.exports_trie {
            check(trie.dataoff, trie.datasize, "export trie")?;
        }
        if let Some(sig) = &self.linkedit.code_signature {
            check(sig.dataoff, sig.datasize, "code signature")?;
        }
        Ok(())
    }

    fn validate_entry(&self, policy: &ValidationPolicy) -> Result<()> {
        if self.header.filetype != MH_EXECUTE {
            return Ok(());
        }
        // driverkit executables are entered through their own runtime and
        // must not name an entry point; everything else must name one
        let driverkit = self
            .platform
            .as_ref()
            .map(|info| info.platform == Platform::DriverKit)
            .unwrap_or(false);
        match &self.entry {
            Some(EntryInfo::Main { entry_offset, .. }) => {
                if driverkit {
                    return Err(Error::Malformed(format!(
                        "'{}' LC_MAIN not allowed for driverkit",
                        policy.path
                    )));
                }
                let text = self.segment(SEG_TEXT).ok_or_else(|| {
                    Error::Malformed(format!("'{}' has no __TEXT segment", policy.path))
                })?;
                if *entry_offset >= text.filesize {
                    return Err(Error::Malformed(format!(
                        "'{}' LC_MAIN entry offset {:#x} is outside __TEXT",
                        policy.path, entry_offset
                    )));
                }
                Ok(())
            }
            Some(EntryInfo::UnixThread { .. }) => {
                if driverkit {
                    return Err(Error::Malformed(format!(
                        "'{}' LC_UNIXTHREAD not allowed for driverkit",
                        policy.path
                    )));
                }
                Ok(())
            }
            None => {
                if driverkit {
                    Ok(())
                } else {
                    Err(Error::Malformed(format!(
                        "'{}' has neither LC_MAIN nor LC_UNIXTHREAD",
                        policy.path
                    )))
                }
            }
        }
    }
}
