//! Constants for segments, sections, and the indirect symbol table, lifted
//! from `mach-o/loader.h`.

// The flags field of a section structure is separated into two parts a section
// type and section attributes.  The section types are mutually exclusive (it
// can only have one type) but the section attributes are not (it may have more
// than one attribute).
pub const SECTION_TYPE: u32 = 0x0000_00ff; // 256 section types
pub const SECTION_ATTRIBUTES: u32 = 0xffff_ff00; //  24 section attributes

// Constants for the type of a section
pub const S_REGULAR: u32 = 0x0; // regular section
pub const S_ZEROFILL: u32 = 0x1; // zero fill on demand section
pub const S_CSTRING_LITERALS: u32 = 0x2; // section with only literal C strings
pub const S_4BYTE_LITERALS: u32 = 0x3; // section with only 4 byte literals
pub const S_8BYTE_LITERALS: u32 = 0x4; // section with only 8 byte literals
pub const S_LITERAL_POINTERS: u32 = 0x5; // section with only pointers to literals

// For the two types of symbol pointers sections and the symbol stubs section
// they have indirect symbol table entries.  For each of the entries in the
// section the indirect symbol table entries, in corresponding order in the
// indirect symbol table, start at the index stored in the reserved1 field
// of the section structure.  Since the indirect symbol table entries
// correspond to the entries in the section the number of indirect symbol table
// entries is inferred from the size of the section divided by the size of the
// entries in the section.  For symbol pointers sections the size of the entries
// in the section is 4 bytes and for symbol stubs sections the byte size of the
// stubs is stored in the reserved2 field of the section structure.
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6; // section with only non-lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7; // section with only lazy symbol pointers
pub const S_SYMBOL_STUBS: u32 = 0x8; // section with only symbol stubs, byte size of stub in the reserved2 field
pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9; // section with only function pointers for initialization
pub const S_MOD_TERM_FUNC_POINTERS: u32 = 0xa; // section with only function pointers for termination
pub const S_COALESCED: u32 = 0xb; // section contains symbols that are to be coalesced
pub const S_GB_ZEROFILL: u32 = 0xc; // zero fill on demand section that can be larger than 4 gigabytes
pub const S_INTERPOSING: u32 = 0xd; // section with only pairs of function pointers for interposing
pub const S_16BYTE_LITERALS: u32 = 0xe; // section with only 16 byte literals
pub const S_DTRACE_DOF: u32 = 0xf; // section contains DTrace Object Format
pub const S_LAZY_DYLIB_SYMBOL_POINTERS: u32 = 0x10; // section with only lazy symbol pointers to lazy loaded dylibs

// Section types to support thread local variables
pub const S_THREAD_LOCAL_REGULAR: u32 = 0x11; // template of initial values for TLVs
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12; // template of initial values for TLVs
pub const S_THREAD_LOCAL_VARIABLES: u32 = 0x13; // TLV descriptors
pub const S_THREAD_LOCAL_VARIABLE_POINTERS: u32 = 0x14; // pointers to TLV descriptors
pub const S_THREAD_LOCAL_INIT_FUNCTION_POINTERS: u32 = 0x15; // functions to call to initialize TLV values
pub const S_INIT_FUNC_OFFSETS: u32 = 0x16; // 32-bit offsets to initializers

// Constants for the section attributes part of the flags field of a section
// structure.
pub const SECTION_ATTRIBUTES_USR: u32 = 0xff00_0000; // User setable attributes
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000; // section contains only true machine instructions
pub const S_ATTR_NO_TOC: u32 = 0x4000_0000; // section contains coalesced symbols that are not to be in a ranlib table of contents
pub const S_ATTR_STRIP_STATIC_SYMS: u32 = 0x2000_0000; // ok to strip static symbols in this section in files with the MH_DYLDLINK flag
pub const S_ATTR_NO_DEAD_STRIP: u32 = 0x1000_0000; // no dead stripping
pub const S_ATTR_LIVE_SUPPORT: u32 = 0x0800_0000; // blocks are live if they reference live blocks
pub const S_ATTR_SELF_MODIFYING_CODE: u32 = 0x0400_0000; // Used with i386 code stubs written on by dyld
pub const S_ATTR_DEBUG: u32 = 0x0200_0000; // debug section
pub const SECTION_ATTRIBUTES_SYS: u32 = 0x00ff_ff00; // system setable attributes
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400; // section contains some machine instructions
pub const S_ATTR_EXT_RELOC: u32 = 0x0000_0200; // section has external relocation entries
pub const S_ATTR_LOC_RELOC: u32 = 0x0000_0100; // section has local relocation entries

// The currently known segment names and the section names in those segments
pub const SEG_PAGEZERO: &str = "__PAGEZERO"; // the pagezero segment which has no protections and catches NULL references for MH_EXECUTE files
pub const SEG_TEXT: &str = "__TEXT"; // the traditional UNIX text segment
pub const SECT_TEXT: &str = "__text"; // the real text part of the text section no headers, and no padding
pub const SEG_DATA: &str = "__DATA"; // the traditional UNIX data segment
pub const SEG_DATA_CONST: &str = "__DATA_CONST"; // data that is rebased/bound at load then made read-only
pub const SEG_DATA_DIRTY: &str = "__DATA_DIRTY"; // data expected to be dirtied
pub const SECT_DATA: &str = "__data"; // the real initialized data section no padding, no bss overlap
pub const SECT_BSS: &str = "__bss"; // the real uninitialized data section no padding
pub const SECT_COMMON: &str = "__common"; // the section common symbols are allocated in by the link editor
pub const SEG_LINKEDIT: &str = "__LINKEDIT"; // the segment containing all structs created and maintained by the link editor
pub const SEG_TPRO_CONST: &str = "__TPRO_CONST"; // hardware write-protected const data
pub const SECT_INTERPOSE: &str = "__interpose"; // interposing tuples consumed at launch
pub const SECT_RESTRICT: &str = "__restrict"; // marks a main executable that ignores DYLD_ env vars
pub const SEG_RESTRICT: &str = "__RESTRICT";

// Objective-C metadata sections the loader inspects when deciding whether an
// image can have +load methods run
pub const SECT_OBJC_CLASSLIST: &str = "__objc_classlist";
pub const SECT_OBJC_CATLIST: &str = "__objc_catlist";
pub const SECT_OBJC_NLCLSLIST: &str = "__objc_nlclslist";
pub const SECT_OBJC_NLCATLIST: &str = "__objc_nlcatlist";
pub const SECT_OBJC_IMAGEINFO: &str = "__objc_imageinfo";

// An indirect symbol table entry is simply a 32bit index into the symbol table
// to the symbol that the pointer or stub is referring to.  Unless it is for a
// non-lazy symbol pointer section for a defined symbol which strip(1) has
// removed.  In which case it has the value INDIRECT_SYMBOL_LOCAL.  If the
// symbol was also absolute INDIRECT_SYMBOL_ABS is or'ed with that.
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

// VM protection bits, from mach/vm_prot.h
pub const VM_PROT_READ: u32 = 0x1;
pub const VM_PROT_WRITE: u32 = 0x2;
pub const VM_PROT_EXECUTE: u32 = 0x4;

bitflags::bitflags! {
    /// Initial or maximum protection of a mapped segment
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        const READ = VM_PROT_READ;
        const WRITE = VM_PROT_WRITE;
        const EXECUTE = VM_PROT_EXECUTE;
    }
}

impl VmProt {
    pub fn is_readable(self) -> bool {
        self.contains(VmProt::READ)
    }
    pub fn is_writable(self) -> bool {
        self.contains(VmProt::WRITE)
    }
    pub fn is_executable(self) -> bool {
        self.contains(VmProt::EXECUTE)
    }
}
