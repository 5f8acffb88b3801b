//! Owns immutable ELF bytes and the per-binary symbol manifest that
//! `ScriptInstance::new` forks from.
//!
//! The source keeps one "template VM" per binary as a COW parent so every
//! fork shares its code pages by reference; we don't need a literal
//! template machine here because `GuestMachine::load_elf` is cheap enough
//! to repeat per fork, but we do keep bytes and symbols owned once and
//! handed out by shared reference.

use std::collections::HashMap;
use std::sync::Arc;

use object::{Object, ObjectSymbol};

use crate::error::{ScriptError, ScriptResult};
use crate::hashing::crc32;

/// An ELF image plus its optional public-symbol manifest. Never mutated
/// after `BinaryStore::insert`.
#[derive(Debug)]
pub struct Binary {
    pub name: String,
    pub bytes: Arc<[u8]>,
    /// `(crc32(symbol_line), line)` pairs in manifest order; `ScriptInstance`
    /// resolves each against `elf_symbols` to build `public_api`.
    pub symbols: Vec<(u32, String)>,
    /// Every named symbol in the ELF's own symbol table, keyed by name, as
    /// parsed once at insert time. Covers both the optional public-API
    /// manifest and required symbols (`fast_exit`, `dyncall_table`) that
    /// never appear in a manifest at all.
    pub elf_symbols: HashMap<String, u64>,
}

impl Binary {
    fn new(name: impl Into<String>, bytes: Vec<u8>, symbols: Vec<String>) -> Self {
        let elf_symbols = parse_elf_symbols(&bytes);
        let symbols = symbols
            .into_iter()
            .map(|line| (crc32(line.as_bytes()), line))
            .collect();
        Self {
            name: name.into(),
            bytes: Arc::from(bytes),
            symbols,
            elf_symbols,
        }
    }
}

/// Parses `bytes` as an ELF image and collects its named symbols into a
/// `name -> address` map. A malformed or non-ELF image (e.g. a test fixture
/// assembled by hand with no section headers) yields an empty map rather
/// than an error: a missing symbol table is the same "not found" outcome as
/// a missing manifest entry, not a load failure.
fn parse_elf_symbols(bytes: &[u8]) -> HashMap<String, u64> {
    let file = match object::File::parse(bytes) {
        Ok(file) => file,
        Err(_) => return HashMap::new(),
    };
    file.symbols()
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), sym.address()))
        })
        .collect()
}

/// Parses a plain-text symbol manifest, one symbol per line. Blank lines
/// and `#`-prefixed comments are skipped; this is forgiving on purpose
/// since a missing manifest file is a warning, not an error, per §6.
pub fn parse_symbol_manifest(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// Name-indexed store of immutable ELF binaries. Binaries are never
/// mutated or removed once inserted; only the process shutdown path drops
/// the whole store.
#[derive(Debug, Default)]
pub struct BinaryStore {
    binaries: HashMap<String, Arc<Binary>>,
}

impl BinaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bytes` under `name`. Fails if the name is already taken;
    /// binaries are write-once.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
        symbols: Vec<String>,
    ) -> ScriptResult<()> {
        let name = name.into();
        if self.binaries.contains_key(&name) {
            return Err(ScriptError::BinaryAlreadyExists(name));
        }
        log::debug!("binary store: inserting '{name}' ({} bytes, {} symbols)", bytes.len(), symbols.len());
        let binary = Binary::new(name.clone(), bytes, symbols);
        self.binaries.insert(name, Arc::new(binary));
        Ok(())
    }

    /// Reads `path` and, if present, a sibling `<path>.symbols` manifest.
    /// A missing manifest is logged and treated as an empty one.
    pub fn load_from_disk(
        &mut self,
        name: impl Into<String>,
        path: impl AsRef<std::path::Path>,
    ) -> ScriptResult<()> {
        let name = name.into();
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let symbols_path = path.with_extension("symbols");
        let symbols = match std::fs::read_to_string(&symbols_path) {
            Ok(text) => parse_symbol_manifest(&text),
            Err(_) => {
                log::warn!("no symbol manifest at {}", symbols_path.display());
                Vec::new()
            }
        };
        self.insert(name, bytes, symbols)
    }

    pub fn get(&self, name: &str) -> ScriptResult<Arc<Binary>> {
        self.binaries
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::BinaryNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.binaries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.binaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binaries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_roundtrips() {
        let mut store = BinaryStore::new();
        store.insert("game", vec![0x7f, b'E', b'L', b'F'], vec!["MyFunc".into()]).unwrap();
        let binary = store.get("game").unwrap();
        assert_eq!(binary.name, "game");
        assert_eq!(binary.symbols.len(), 1);
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut store = BinaryStore::new();
        store.insert("game", vec![1, 2, 3], vec![]).unwrap();
        let err = store.insert("game", vec![4, 5, 6], vec![]).unwrap_err();
        assert!(matches!(err, ScriptError::BinaryAlreadyExists(_)));
    }

    #[test]
    fn missing_get_fails() {
        let store = BinaryStore::new();
        assert!(matches!(store.get("nope"), Err(ScriptError::BinaryNotFound(_))));
    }

    #[test]
    fn manifest_parsing_skips_blank_and_comment_lines() {
        let text = "MyFunc\n\n# a comment\nOtherFunc\n";
        let symbols = parse_symbol_manifest(text);
        assert_eq!(symbols, vec!["MyFunc".to_string(), "OtherFunc".to_string()]);
    }
}
