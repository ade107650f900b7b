//! Path resolution: turning a requested install name (possibly `@rpath`,
//! `@loader_path`, or `@executable_path` relative) into candidate files,
//! in the precise precedence order the loader promises. The resolver only
//! generates candidates; the caller supplies a `try_load` that says which
//! one actually works, and the first success wins.

use std::path::{Component, Path, PathBuf};

use crate::config::{ProcessConfig, Security, Verbosity};
use crate::error::{Error, Result};
use crate::mach::{MachFile, Platform};

/// One entry of a `DYLD_VERSIONED_*_PATH` table: a dylib that may override
/// the OS copy at its install name if it is newer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedOverride {
    pub install_name: String,
    pub path: String,
    pub compat_version: u32,
    pub current_version: u32,
}

#[derive(Debug, Default)]
/// Search-path state derived from the environment (and the main
/// executable's embedded `LC_DYLD_ENVIRONMENT` strings, policy permitting)
pub struct PathOverrides {
    pub framework_paths: Vec<String>,
    pub library_paths: Vec<String>,
    pub fallback_framework_paths: Option<Vec<String>>,
    pub fallback_library_paths: Option<Vec<String>>,
    pub insert_libraries: Vec<String>,
    pub image_suffixes: Vec<String>,
    /// simulator root (`DYLD_ROOT_PATH`)
    pub root_path: Option<String>,
    /// auxiliary mounted override tree
    pub cryptex_root: Option<String>,
    pub versioned_overrides: Vec<VersionedOverride>,
    /// the process's `HOME`, for the per-user classic framework fallback
    pub home: Option<String>,
    platform: Platform,
}

fn split_colon_list(value: &str) -> Vec<String> {
    value
        .split(':')
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

impl PathOverrides {
    pub fn new(
        args: &crate::config::KernelArgs,
        security: &Security,
        embedded_vars: &[String],
        platform: Platform,
    ) -> PathOverrides {
        let mut overrides = PathOverrides {
            platform,
            home: args.env("HOME").map(str::to_owned),
            ..PathOverrides::default()
        };
        if security.allow_env_paths() {
            for entry in &args.envp {
                overrides.add_env_var(entry);
            }
        }
        if security.allow_embedded_vars() {
            for entry in embedded_vars {
                overrides.add_env_var(entry);
            }
        }
        // the simulator root is only meaningful for simulator processes
        if !platform.is_simulator() {
            overrides.root_path = None;
        }
        overrides.build_versioned_tables(args, security);
        overrides
    }

    fn add_env_var(&mut self, entry: &str) {
        let (key, value) = match entry.split_once('=') {
            Some(pair) => pair,
            None => return,
        };
        match key {
            "DYLD_FRAMEWORK_PATH" => self.framework_paths.extend(split_colon_list(value)),
            "DYLD_LIBRARY_PATH" => self.library_paths.extend(split_colon_list(value)),
            "DYLD_FALLBACK_FRAMEWORK_PATH" => {
                self.fallback_framework_paths = Some(split_colon_list(value))
            }
            "DYLD_FALLBACK_LIBRARY_PATH" => {
                self.fallback_library_paths = Some(split_colon_list(value))
            }
            "DYLD_INSERT_LIBRARIES" => self.insert_libraries.extend(split_colon_list(value)),
            "DYLD_IMAGE_SUFFIX" => self.image_suffixes.extend(split_colon_list(value)),
            "DYLD_ROOT_PATH" => self.root_path = Some(value.to_owned()),
            _ => {}
        }
    }

    /// Scans the `DYLD_VERSIONED_*_PATH` directories once, recording each
    /// dylib's install name and versions
    fn build_versioned_tables(&mut self, args: &crate::config::KernelArgs, security: &Security) {
        if !security.allow_env_paths() {
            return;
        }
        let mut dirs = Vec::new();
        for key in ["DYLD_VERSIONED_LIBRARY_PATH", "DYLD_VERSIONED_FRAMEWORK_PATH"] {
            if let Some(value) = args.env(key) {
                dirs.extend(split_colon_list(value));
            }
        }
        for dir in dirs {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                if let Some(record) = read_dylib_id(&path) {
                    debug!(
                        "versioned override: {} v{:#x} at {}",
                        record.install_name,
                        record.current_version,
                        path.display()
                    );
                    self.versioned_overrides.push(record);
                }
            }
        }
    }

    /// The fallback directories for a dylib leaf-name search: the env
    /// override when present, the classic platform defaults otherwise
    fn library_fallbacks(&self) -> Vec<String> {
        match &self.fallback_library_paths {
            Some(paths) => paths.clone(),
            None => vec!["/usr/local/lib".to_owned(), "/usr/lib".to_owned()],
        }
    }

    fn framework_fallbacks(&self) -> Vec<String> {
        match &self.fallback_framework_paths {
            Some(paths) => paths.clone(),
            None => {
                let mut paths = Vec::new();
                if let Some(home) = &self.home {
                    paths.push(format!("{}/Library/Frameworks", home));
                }
                paths.push("/Library/Frameworks".to_owned());
                paths.push("/Network/Library/Frameworks".to_owned());
                paths.push("/System/Library/Frameworks".to_owned());
                paths
            }
        }
    }
}

/// The stack of images that led to a load request, closest first; `@rpath`
/// expansion walks every `LC_RPATH` along it
#[derive(Debug, Default)]
pub struct LoadChain<'a> {
    /// directory of the image making the request
    pub loader_dir: Option<&'a str>,
    /// rpaths of every image on the chain, from the requester outward
    pub rpath_stack: Vec<&'a [String]>,
}

#[derive(Debug, Clone, Copy, Default)]
/// Per-request options for the resolver
pub struct ResolveOptions {
    /// classic fallback directories apply only to binaries that opted in
    pub use_fallback_paths: bool,
    /// request came from an `LC_LOAD_WEAK_DYLIB` edge
    pub weak: bool,
}

/// Lexically normalizes `.` and `..` segments, the way candidate paths are
/// compared for reuse
pub fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part.to_str().unwrap_or("")),
            Component::ParentDir => {
                if !out.is_empty() {
                    out.pop();
                }
            }
            _ => {}
        }
    }
    let joined = out.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// The `Name.framework/Name` style tail of a framework install path, or
/// `None` when the path does not name a framework. Versioned layouts
/// (`Name.framework/Versions/A/Name`) are recognized too.
pub fn framework_partial_path(path: &str) -> Option<&str> {
    let leaf = path.rsplit('/').next()?;
    let marker = format!("{}.framework/", leaf);
    let start = path.find(&marker)?;
    Some(&path[start..])
}

/// The leaf name of a dylib path
pub fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl ProcessConfig {
    /// Runs `try_load` over every candidate for `request` in precedence
    /// order, stopping at the first success. When every candidate fails
    /// the error lists the paths that were tried.
    pub fn resolve_dylib<T>(
        &self,
        request: &str,
        chain: &LoadChain,
        options: ResolveOptions,
        mut try_load: impl FnMut(&str) -> Option<T>,
    ) -> Result<T> {
        let mut tried = Vec::new();
        let mut attempt = |candidate: &str, tried: &mut Vec<String>| -> Option<T> {
            if self.log.contains(Verbosity::SEARCHING) {
                debug!("searching: trying '{}'", candidate);
            }
            // every candidate is first expanded by DYLD_IMAGE_SUFFIX
            for suffix in &self.path_overrides.image_suffixes {
                let suffixed = apply_suffix(candidate, suffix);
                if let Some(found) = try_load(&suffixed) {
                    return Some(found);
                }
                tried.push(suffixed);
            }
            if let Some(found) = try_load(candidate) {
                return Some(found);
            }
            tried.push(candidate.to_owned());
            None
        };

        // 1. DYLD_FRAMEWORK_PATH / DYLD_LIBRARY_PATH overrides
        if let Some(partial) = framework_partial_path(request) {
            for dir in &self.path_overrides.framework_paths {
                let candidate = format!("{}/{}", dir, partial);
                if let Some(found) = attempt(&candidate, &mut tried) {
                    return Ok(found);
                }
            }
        }
        for dir in &self.path_overrides.library_paths {
            let candidate = format!("{}/{}", dir, leaf_name(request));
            if let Some(found) = attempt(&candidate, &mut tried) {
                return Ok(found);
            }
        }

        // 2. versioned overrides: use the table copy when it is newer than
        // what is installed at the request's install name
        if let Some(path) = self.versioned_override_for(request) {
            if let Some(found) = attempt(&path, &mut tried) {
                return Ok(found);
            }
        }

        // 3. @ expansions
        if request.starts_with('@') {
            if !self.security.allow_at_paths() {
                return Err(Error::Policy(format!(
                    "'@' paths are not allowed in this process: '{}'",
                    request
                )));
            }
            if let Some(rest) = request.strip_prefix("@executable_path/") {
                // setuid binaries never get @executable_path, even when
                // the other @ expansions are allowed
                if self.security.restricted {
                    return Err(Error::Policy(format!(
                        "'@executable_path' is not allowed in restricted processes: '{}'",
                        request
                    )));
                }
                let dir = parent_dir(&self.process.main_executable_path);
                let candidate = format!("{}/{}", dir, rest);
                if let Some(found) = attempt(&candidate, &mut tried) {
                    return Ok(found);
                }
            } else if let Some(rest) = request.strip_prefix("@loader_path/") {
                if let Some(dir) = chain.loader_dir {
                    let candidate = format!("{}/{}", dir, rest);
                    if let Some(found) = attempt(&candidate, &mut tried) {
                        return Ok(found);
                    }
                }
            } else if let Some(rest) = request.strip_prefix("@rpath/") {
                // walk every LC_RPATH on the load chain, closest image
                // first, re-entering the resolver for relative rpaths
                for rpaths in &chain.rpath_stack {
                    for rpath in rpaths.iter() {
                        let expanded = if let Some(rel) = rpath.strip_prefix("@loader_path/") {
                            match chain.loader_dir {
                                Some(dir) => format!("{}/{}/{}", dir, rel, rest),
                                None => continue,
                            }
                        } else if let Some(rel) = rpath.strip_prefix("@executable_path/") {
                            format!(
                                "{}/{}/{}",
                                parent_dir(&self.process.main_executable_path),
                                rel,
                                rest
                            )
                        } else {
                            format!("{}/{}", rpath, rest)
                        };
                        if let Some(found) = attempt(&expanded, &mut tried) {
                            return Ok(found);
                        }
                    }
                }
            }
        } else {
            // 4. simulator root and cryptex prefixes
            if let Some(root) = &self.path_overrides.root_path {
                let candidate = format!("{}{}", root, request);
                if let Some(found) = attempt(&candidate, &mut tried) {
                    return Ok(found);
                }
            }
            if let Some(cryptex) = &self.path_overrides.cryptex_root {
                let candidate = format!("{}{}", cryptex, request);
                if let Some(found) = attempt(&candidate, &mut tried) {
                    return Ok(found);
                }
            }
            // 5. Catalyst support tree
            if self.process.platform == Platform::MacCatalyst {
                let candidate = format!("/System/iOSSupport{}", request);
                if let Some(found) = attempt(&candidate, &mut tried) {
                    return Ok(found);
                }
            }
            // 6. the path as requested
            if let Some(found) = attempt(request, &mut tried) {
                return Ok(found);
            }
        }

        // 7. classic fallback directories, for binaries that opted in
        if options.use_fallback_paths && self.security.allow_fallback_paths() {
            if let Some(partial) = framework_partial_path(request) {
                for dir in self.path_overrides.framework_fallbacks() {
                    let candidate = format!("{}/{}", dir, partial);
                    if let Some(found) = attempt(&candidate, &mut tried) {
                        return Ok(found);
                    }
                }
            } else {
                for dir in self.path_overrides.library_fallbacks() {
                    let candidate = format!("{}/{}", dir, leaf_name(request));
                    if let Some(found) = attempt(&candidate, &mut tried) {
                        return Ok(found);
                    }
                }
            }
        }

        Err(Error::DylibMissing {
            path: request.to_owned(),
            client: String::new(),
            detail: format!("tried: '{}'", tried.join("', '")),
        })
    }

    /// Looks `install_name` up in the versioned-override tables. The
    /// override wins only when its compatibility version is strictly newer
    /// than the installed copy's; among several, the higher current
    /// version wins. The installed copy is stat'ed at the raw path first,
    /// then under the cryptex prefix.
    fn versioned_override_for(&self, install_name: &str) -> Option<String> {
        let mut best: Option<&VersionedOverride> = None;
        for entry in &self.path_overrides.versioned_overrides {
            if entry.install_name != install_name {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => entry.current_version > current.current_version,
            };
            if better {
                best = Some(entry);
            }
        }
        let best = best?;
        let installed = self
            .installed_compat_version(install_name)
            .unwrap_or(0);
        if best.compat_version > installed {
            Some(best.path.clone())
        } else {
            None
        }
    }

    fn installed_compat_version(&self, install_name: &str) -> Option<u32> {
        let mut candidates = vec![PathBuf::from(install_name)];
        if let Some(cryptex) = &self.path_overrides.cryptex_root {
            candidates.push(PathBuf::from(format!("{}{}", cryptex, install_name)));
        }
        for path in candidates {
            if let Some(record) = read_dylib_id(&path) {
                return Some(record.compat_version);
            }
        }
        None
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => ".",
    }
}

/// Inserts `suffix` before a trailing `.dylib`, or appends it
pub fn apply_suffix(path: &str, suffix: &str) -> String {
    match path.strip_suffix(".dylib") {
        Some(stem) => format!("{}{}.dylib", stem, suffix),
        None => format!("{}{}", path, suffix),
    }
}

fn read_dylib_id(path: &Path) -> Option<VersionedOverride> {
    let bytes = std::fs::read(path).ok()?;
    let mach = MachFile::parse(&bytes).ok()?;
    let install_name = mach.install_name?;
    let mut record = VersionedOverride {
        install_name,
        path: path.to_string_lossy().into_owned(),
        compat_version: 0,
        current_version: 0,
    };
    // versions live in LC_ID_DYLIB; re-walk the commands for them
    for cmd in crate::mach::load_command::walk(&bytes, &mach.header, mach.ctx).ok()? {
        if let crate::mach::load_command::CommandVariant::IdDylib(dylib) = cmd.command {
            record.compat_version = dylib.dylib.compatibility_version;
            record.current_version = dylib.dylib.current_version;
            break;
        }
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_partials() {
        assert_eq!(
            framework_partial_path("/System/Library/Frameworks/Foo.framework/Foo"),
            Some("Foo.framework/Foo")
        );
        assert_eq!(
            framework_partial_path("/S/L/F/Foo.framework/Versions/A/Foo"),
            Some("Foo.framework/Versions/A/Foo")
        );
        assert_eq!(framework_partial_path("/usr/lib/libfoo.dylib"), None);
    }

    #[test]
    fn suffix_insertion() {
        assert_eq!(
            apply_suffix("/usr/lib/libfoo.dylib", "_debug"),
            "/usr/lib/libfoo_debug.dylib"
        );
        assert_eq!(
            apply_suffix("/S/F/Foo.framework/Foo", "_profile"),
            "/S/F/Foo.framework/Foo_profile"
        );
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(normalize("/a/p/../lib/libq.dylib"), "/a/lib/libq.dylib");
        assert_eq!(normalize("/a/./b"), "/a/b");
        assert_eq!(normalize("a/../../b"), "b");
    }

    #[test]
    fn parent_dirs() {
        assert_eq!(parent_dir("/a/p/main"), "/a/p");
        assert_eq!(parent_dir("/main"), "/");
        assert_eq!(parent_dir("main"), ".");
    }
}
