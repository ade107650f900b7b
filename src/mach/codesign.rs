//! Embedded code signature parsing: just enough of the SuperBlob and
//! CodeDirectory to recover the cdHash an image is validated against. All
//! code-signing structures are big-endian.

use scroll::Pread;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// embedded signature SuperBlob magic
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
/// CodeDirectory blob magic
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;

/// slot type of the primary CodeDirectory in the SuperBlob index
pub const CSSLOT_CODEDIRECTORY: u32 = 0;
/// first alternate CodeDirectory slot
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;

/// the signature was produced by the linker itself (ad-hoc)
pub const CS_LINKER_SIGNED: u32 = 0x20000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
/// SuperBlob header for an embedded signature
pub struct SuperBlob {
    pub magic: u32,
    pub length: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
/// One entry in the SuperBlob index
pub struct BlobIndex {
    pub typ: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread)]
/// The interesting prefix of a CodeDirectory blob
pub struct CodeDirectory {
    pub magic: u32,
    pub length: u32,
    pub version: u32,
    pub flags: u32,
    pub hash_offset: u32,
    pub ident_offset: u32,
    pub n_special_slots: u32,
    pub n_code_slots: u32,
    pub code_limit: u32,
    pub hash_size: u8,
    pub hash_type: u8,
    pub platform: u8,
    pub page_size: u8,
}

/// Finds the best CodeDirectory in an embedded signature blob. SHA-256
/// directories are preferred over SHA-1 when both are present.
fn best_code_directory(blob: &[u8]) -> Result<Option<(usize, CodeDirectory)>> {
    let superblob: SuperBlob = blob.pread_with(0, scroll::BE)?;
    if superblob.magic != CSMAGIC_EMBEDDED_SIGNATURE {
        return Ok(None);
    }
    if superblob.length as usize > blob.len() {
        return Err(Error::Malformed(
            "code signature SuperBlob length exceeds its blob".into(),
        ));
    }
    let mut best: Option<(usize, CodeDirectory)> = None;
    for i in 0..superblob.count as usize {
        let index: BlobIndex = blob.pread_with(12 + i * 8, scroll::BE)?;
        if index.typ != CSSLOT_CODEDIRECTORY
            && !(CSSLOT_ALTERNATE_CODEDIRECTORIES..CSSLOT_ALTERNATE_CODEDIRECTORIES + 0x10)
                .contains(&index.typ)
        {
            continue;
        }
        let offset = index.offset as usize;
        let directory: CodeDirectory = blob.pread_with(offset, scroll::BE)?;
        if directory.magic != CSMAGIC_CODEDIRECTORY {
            return Err(Error::Malformed(
                "code signature slot does not hold a CodeDirectory".into(),
            ));
        }
        if offset + directory.length as usize > blob.len() {
            return Err(Error::Malformed(
                "CodeDirectory length exceeds its SuperBlob".into(),
            ));
        }
        let better = match &best {
            None => true,
            Some((_, current)) => {
                current.hash_type != CS_HASHTYPE_SHA256
                    && directory.hash_type == CS_HASHTYPE_SHA256
            }
        };
        if better {
            best = Some((offset, directory));
        }
    }
    Ok(best)
}

/// Computes the cdHash of an embedded signature blob: the hash of the best
/// CodeDirectory, truncated to 20 bytes. Returns `None` when the blob does
/// not hold an embedded signature.
pub fn cd_hash(blob: &[u8]) -> Result<Option<[u8; 20]>> {
    let (offset, directory) = match best_code_directory(blob)? {
        Some(found) => found,
        None => return Ok(None),
    };
    let bytes = &blob[offset..offset + directory.length as usize];
    let digest = match directory.hash_type {
        CS_HASHTYPE_SHA256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            hasher.finalize().to_vec()
        }
        CS_HASHTYPE_SHA1 => {
            // SHA-1 directories are legacy; dyld still identifies them by a
            // SHA-256 over the directory, truncated like the kernel does
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            hasher.finalize().to_vec()
        }
        other => {
            return Err(Error::Malformed(format!(
                "unsupported CodeDirectory hash type {}",
                other
            )));
        }
    };
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest[..20]);
    Ok(Some(hash))
}

/// Whether the signature was produced by the linker (ad-hoc signed)
pub fn is_linker_signed(blob: &[u8]) -> bool {
    match best_code_directory(blob) {
        Ok(Some((_, directory))) => directory.flags & CS_LINKER_SIGNED != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_signature(hash_type: u8, flags: u32) -> Vec<u8> {
        let mut blob = Vec::new();
        // SuperBlob: magic, length, count=1; BlobIndex: CODEDIRECTORY at 20
        blob.extend_from_slice(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        blob.extend_from_slice(&112u32.to_be_bytes());
        blob.extend_from_slice(&1u32.to_be_bytes());
        blob.extend_from_slice(&CSSLOT_CODEDIRECTORY.to_be_bytes());
        blob.extend_from_slice(&20u32.to_be_bytes());
        // CodeDirectory, 92 bytes: the Pread prefix plus padding
        blob.extend_from_slice(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
        blob.extend_from_slice(&92u32.to_be_bytes());
        blob.extend_from_slice(&0x20400u32.to_be_bytes());
        blob.extend_from_slice(&flags.to_be_bytes());
        blob.extend_from_slice(&0u32.to_be_bytes()); // hash_offset
        blob.extend_from_slice(&0u32.to_be_bytes()); // ident_offset
        blob.extend_from_slice(&0u32.to_be_bytes()); // n_special_slots
        blob.extend_from_slice(&0u32.to_be_bytes()); // n_code_slots
        blob.extend_from_slice(&0u32.to_be_bytes()); // code_limit
        blob.push(32); // hash_size
        blob.push(hash_type);
        blob.push(0); // platform
        blob.push(12); // page_size
        while blob.len() < 112 {
            blob.push(0);
        }
        blob
    }

    #[test]
    fn cd_hash_is_stable_and_20_bytes() {
        let blob = build_signature(CS_HASHTYPE_SHA256, 0);
        let first = cd_hash(&blob).unwrap().unwrap();
        let second = cd_hash(&blob).unwrap().unwrap();
        assert_eq!(first, second);
        // a different directory hashes differently
        let other = build_signature(CS_HASHTYPE_SHA256, CS_LINKER_SIGNED);
        assert_ne!(first, cd_hash(&other).unwrap().unwrap());
    }

    #[test]
    fn linker_signed_flag_is_detected() {
        assert!(is_linker_signed(&build_signature(
            CS_HASHTYPE_SHA256,
            CS_LINKER_SIGNED
        )));
        assert!(!is_linker_signed(&build_signature(CS_HASHTYPE_SHA256, 0)));
    }

    #[test]
    fn non_signature_blob_is_none() {
        assert!(cd_hash(&[0u8; 16]).unwrap().is_none());
    }
}
