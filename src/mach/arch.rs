//! Cpu types, subtypes, and graded architecture sets. A graded arch set is
//! an ordered preference list used both to pick the best slice out of a fat
//! file and to reject a thin mach-o the process cannot run.

use core::fmt;

pub const CPU_ARCH_MASK: u32 = 0xff00_0000;
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_ARM: u32 = 12;
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// mask for the low 24 bits of a cpusubtype; the high byte carries
/// capability bits
pub const CPU_SUBTYPE_MASK: u32 = 0x00ff_ffff;
/// 64-bit libraries capability bit
pub const CPU_SUBTYPE_LIB64: u32 = 0x8000_0000;
/// pointer authentication with versioned ABI
pub const CPU_SUBTYPE_PTRAUTH_ABI: u32 = 0x8000_0000;

pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
/// Haswell and newer x86_64
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
pub const CPU_SUBTYPE_ARM64_V8: u32 = 1;
/// arm64 with pointer authentication
pub const CPU_SUBTYPE_ARM64E: u32 = 2;
pub const CPU_SUBTYPE_ARM_V7K: u32 = 12;
pub const CPU_SUBTYPE_ARM64_32_V8: u32 = 1;

#[inline(always)]
pub fn cputype_to_str(cputype: u32) -> &'static str {
    match cputype {
        CPU_TYPE_ARM64 => "ARM64",
        CPU_TYPE_X86_64 => "x86-64",
        CPU_TYPE_ARM => "ARM",
        CPU_TYPE_X86 => "x86",
        _ => "UNIMPLEMENTED CPUTYPE",
    }
}

/// Canonical arch-name strings, as they appear in `DYLD_FORCE_PLATFORM`
/// style diagnostics and fat-slice messages
pub fn arch_name(cputype: u32, cpusubtype: u32) -> &'static str {
    match (cputype, cpusubtype & CPU_SUBTYPE_MASK) {
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H) => "x86_64h",
        (CPU_TYPE_X86_64, _) => "x86_64",
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) => "arm64e",
        (CPU_TYPE_ARM64, _) => "arm64",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K) => "armv7k",
        (CPU_TYPE_ARM, _) => "arm",
        (CPU_TYPE_X86, _) => "i386",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One entry in a graded arch set
pub struct GradedArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    /// when set, only binaries signed as OS binaries may use this grade
    /// (arm64e preview ABI is restricted this way)
    pub os_binaries_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An ordered preference list of architectures the process can run, best
/// grade first
pub struct GradedArchs {
    grades: Vec<GradedArch>,
}

impl fmt::Display for GradedArchs {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for grade in &self.grades {
            if !first {
                write!(fmt, ", ")?;
            }
            write!(fmt, "{}", arch_name(grade.cputype, grade.cpusubtype))?;
            first = false;
        }
        Ok(())
    }
}

impl GradedArchs {
    /// x86_64 processes: prefer haswell slices, fall back to plain x86_64
    pub fn x86_64h() -> GradedArchs {
        GradedArchs {
            grades: vec![
                GradedArch {
                    cputype: CPU_TYPE_X86_64,
                    cpusubtype: CPU_SUBTYPE_X86_64_H,
                    os_binaries_only: false,
                },
                GradedArch {
                    cputype: CPU_TYPE_X86_64,
                    cpusubtype: CPU_SUBTYPE_X86_64_ALL,
                    os_binaries_only: false,
                },
            ],
        }
    }

    /// Plain x86_64 processes
    pub fn x86_64() -> GradedArchs {
        GradedArchs {
            grades: vec![GradedArch {
                cputype: CPU_TYPE_X86_64,
                cpusubtype: CPU_SUBTYPE_X86_64_ALL,
                os_binaries_only: false,
            }],
        }
    }

    /// arm64e processes with pointer authentication keys enabled: arm64e
    /// slices only, and third-party arm64e only when signed as OS binaries
    pub fn arm64e() -> GradedArchs {
        GradedArchs {
            grades: vec![
                GradedArch {
                    cputype: CPU_TYPE_ARM64,
                    cpusubtype: CPU_SUBTYPE_ARM64E,
                    os_binaries_only: true,
                },
                GradedArch {
                    cputype: CPU_TYPE_ARM64,
                    cpusubtype: CPU_SUBTYPE_ARM64_ALL,
                    os_binaries_only: false,
                },
            ],
        }
    }

    /// arm64e processes that had their ptrauth keys disabled: grade arm64e
    /// slices like plain arm64
    pub fn arm64e_keys_off() -> GradedArchs {
        GradedArchs {
            grades: vec![
                GradedArch {
                    cputype: CPU_TYPE_ARM64,
                    cpusubtype: CPU_SUBTYPE_ARM64E,
                    os_binaries_only: false,
                },
                GradedArch {
                    cputype: CPU_TYPE_ARM64,
                    cpusubtype: CPU_SUBTYPE_ARM64_ALL,
                    os_binaries_only: false,
                },
            ],
        }
    }

    /// Plain arm64 processes
    pub fn arm64() -> GradedArchs {
        GradedArchs {
            grades: vec![GradedArch {
                cputype: CPU_TYPE_ARM64,
                cpusubtype: CPU_SUBTYPE_ARM64_ALL,
                os_binaries_only: false,
            }],
        }
    }

    /// The graded set for a process whose main executable has the given
    /// cputype/cpusubtype, with `keys_off` saying whether ptrauth keys were
    /// disabled at spawn
    pub fn for_main_executable(cputype: u32, cpusubtype: u32, keys_off: bool) -> GradedArchs {
        match (cputype, cpusubtype & CPU_SUBTYPE_MASK) {
            (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H) => GradedArchs::x86_64h(),
            (CPU_TYPE_X86_64, _) => GradedArchs::x86_64(),
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) if keys_off => GradedArchs::arm64e_keys_off(),
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) => GradedArchs::arm64e(),
            _ => GradedArchs {
                grades: vec![GradedArch {
                    cputype,
                    cpusubtype: cpusubtype & CPU_SUBTYPE_MASK,
                    os_binaries_only: false,
                }],
            },
        }
    }

    /// The entries of this set, best grade first
    pub fn grades(&self) -> &[GradedArch] {
        &self.grades
    }

    /// Grades a slice: returns `Some(rank)` with 0 the best possible rank,
    /// or `None` when the slice is not loadable in this process
    pub fn grade(&self, cputype: u32, cpusubtype: u32, is_os_binary: bool) -> Option<usize> {
        let cpusubtype = cpusubtype & CPU_SUBTYPE_MASK;
        self.grades.iter().position(|grade| {
            grade.cputype == cputype
                && grade.cpusubtype == cpusubtype
                && (!grade.os_binaries_only || is_os_binary)
        })
    }

    /// Whether any grade matches the cputype at all (used in error wording
    /// to distinguish "wrong arch" from "wrong subtype")
    pub fn supports_cputype(&self, cputype: u32) -> bool {
        self.grades.iter().any(|grade| grade.cputype == cputype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haswell_prefers_h_slice() {
        let archs = GradedArchs::x86_64h();
        assert_eq!(archs.grade(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H, false), Some(0));
        assert_eq!(
            archs.grade(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL, false),
            Some(1)
        );
        assert_eq!(archs.grade(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL, false), None);
    }

    #[test]
    fn arm64e_third_party_needs_os_binary() {
        let archs = GradedArchs::arm64e();
        assert_eq!(archs.grade(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, false), None);
        assert_eq!(archs.grade(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, true), Some(0));
        // capability bits in the high byte are ignored for grading
        assert_eq!(
            archs.grade(
                CPU_TYPE_ARM64,
                CPU_SUBTYPE_ARM64E | CPU_SUBTYPE_PTRAUTH_ABI,
                true
            ),
            Some(0)
        );
    }
}
