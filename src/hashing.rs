//! Name hashing shared by the public-API cache and the dynamic-call registry.
//!
//! Every identity in this crate — script names, public symbol names, dynamic
//! call definitions — is collapsed to a 32-bit CRC. Collisions are treated as
//! fatal configuration errors by the callers of `crc32`, not by this module.

use crc::{Crc, CRC_32_ISO_HDLC};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC32 of a byte string, matching the guest-side `crc32()` used to build
/// `dyncall_table` hashes and symbol manifests.
pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Collapse runs of ASCII spaces into a single space, so that `"void f(int)"`
/// and `"void  f(int)"` hash identically. Dynamic call definitions are
/// canonicalized this way before hashing.
pub fn single_spaced(def: &str) -> String {
    let mut out = String::with_capacity(def.len());
    let mut last_was_space = false;
    for c in def.chars() {
        if c == ' ' {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// Hash for a dynamic-call definition: canonicalize, then CRC32.
pub fn dyncall_hash(definition: &str) -> u32 {
    crc32(single_spaced(definition).as_bytes())
}

/// Hash for a plain name (script names, public API symbols): CRC32 as-is.
pub fn name_hash(name: &str) -> u32 {
    crc32(name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_runs_of_spaces() {
        assert_eq!(single_spaced("void   f(int  x)"), "void f(int x)");
        assert_eq!(single_spaced("a b"), "a b");
        assert_eq!(single_spaced(""), "");
    }

    #[test]
    fn canonicalization_affects_the_hash() {
        assert_eq!(dyncall_hash("void f(int)"), dyncall_hash("void  f(int)"));
        assert_ne!(dyncall_hash("void f(int)"), dyncall_hash("void f(long)"));
    }

    #[test]
    fn name_hash_is_stable() {
        assert_eq!(name_hash("MyFunc"), name_hash("MyFunc"));
        assert_ne!(name_hash("MyFunc"), name_hash("OtherFunc"));
    }
}
