// This module holds the compiled form of a function and writes finished functions into an
// ELF relocatable object through the object crate. CompiledFunction carries the encoded
// instruction words as little-endian bytes, the relocations the code generator recorded for
// calls and symbol addresses, the symbol entry describing where the function lives in the
// text section, and the frame size. ElfAssembler appends every function to one .text
// section, defines a symbol for each, creates undefined symbols for referenced names that
// no compiled function defines, and translates the backend's relocation kinds into the
// matching R_AARCH64_* types.

//! Compiled functions and ELF object emission.

use hashbrown::HashMap;
use object::write::{Object, Relocation as ObjectRelocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{elf, Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope};

use super::error::{CompileError, CompileResult};

/// Relocation types the code generator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    /// 26-bit branch displacement of a `bl`.
    Call26,
    /// Page of a symbol address, for `adrp`.
    AdrPage21,
    /// Low 12 bits of a symbol address, for the `add` after `adrp`.
    AddLo12,
}

impl RelocationKind {
    pub fn elf_type(self) -> u32 {
        match self {
            RelocationKind::Call26 => elf::R_AARCH64_CALL26,
            RelocationKind::AdrPage21 => elf::R_AARCH64_ADR_PREL_PG_HI21,
            RelocationKind::AddLo12 => elf::R_AARCH64_ADD_ABS_LO12_NC,
        }
    }
}

/// A symbol reference patched at link time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the instruction inside the function.
    pub offset: u32,
    pub symbol: String,
    pub kind: RelocationKind,
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Global,
    Local,
}

/// Where a function's code lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    /// Offset inside the function's section.
    pub offset: u64,
    pub size: u64,
    pub visibility: Visibility,
}

/// Machine code and metadata of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunction {
    pub name: String,
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub symbol: SymbolEntry,
    /// Bytes the function moves the stack pointer by.
    pub frame_size: u32,
}

impl CompiledFunction {
    /// Instruction words in order.
    pub fn words(&self) -> Vec<u32> {
        self.code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Builds an AArch64 ELF relocatable object.
pub struct ElfAssembler {
    object: Object<'static>,
    symbols: HashMap<String, SymbolId>,
    defined: Vec<(SymbolId, u64, Vec<Relocation>)>,
}

impl Default for ElfAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfAssembler {
    pub fn new() -> Self {
        Self {
            object: Object::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little),
            symbols: HashMap::new(),
            defined: Vec::new(),
        }
    }

    /// Append a function to `.text` and define its symbol.
    pub fn add_function(&mut self, func: &CompiledFunction) {
        let text = self.object.section_id(StandardSection::Text);
        let offset = self.object.append_section_data(text, &func.code, 4);
        let symbol = Symbol {
            name: func.symbol.name.as_bytes().to_vec(),
            value: offset + func.symbol.offset,
            size: func.symbol.size,
            kind: SymbolKind::Text,
            scope: match func.symbol.visibility {
                Visibility::Global => SymbolScope::Linkage,
                Visibility::Local => SymbolScope::Compilation,
            },
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        };
        let id = match self.symbols.get(&func.symbol.name) {
            // Referenced before it was defined.
            Some(&id) => {
                let existing = self.object.symbol_mut(id);
                existing.value = symbol.value;
                existing.size = symbol.size;
                existing.kind = symbol.kind;
                existing.scope = symbol.scope;
                existing.section = symbol.section;
                id
            }
            None => {
                let id = self.object.add_symbol(symbol);
                self.symbols.insert(func.symbol.name.clone(), id);
                id
            }
        };
        self.defined.push((id, offset, func.relocations.clone()));
        log::debug!("placed {} at .text+{offset:#x} ({} bytes)", func.name, func.code.len());
    }

    fn symbol_for(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.object.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.symbols.insert(name.to_string(), id);
        id
    }

    /// Emit relocations and serialize the object.
    pub fn finish(mut self) -> CompileResult<Vec<u8>> {
        let text = self.object.section_id(StandardSection::Text);
        let defined = std::mem::take(&mut self.defined);
        for (_, base, relocations) in defined {
            for r in relocations {
                let symbol = self.symbol_for(&r.symbol);
                self.object
                    .add_relocation(
                        text,
                        ObjectRelocation {
                            offset: base + r.offset as u64,
                            symbol,
                            addend: r.addend,
                            flags: RelocationFlags::Elf { r_type: r.kind.elf_type() },
                        },
                    )
                    .map_err(|e| CompileError::ObjectWrite(e.to_string()))?;
            }
        }
        self.object.write().map_err(|e| CompileError::ObjectWrite(e.to_string()))
    }

    /// Write `funcs` into a fresh object file.
    pub fn build_object(funcs: &[CompiledFunction]) -> CompileResult<Vec<u8>> {
        let mut asm = Self::new();
        for func in funcs {
            asm.add_function(func);
        }
        asm.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn function(name: &str, words: &[u32], relocations: Vec<Relocation>) -> CompiledFunction {
        let code: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        CompiledFunction {
            name: name.into(),
            symbol: SymbolEntry {
                name: name.into(),
                offset: 0,
                size: code.len() as u64,
                visibility: Visibility::Global,
            },
            code,
            relocations,
            frame_size: 0,
        }
    }

    #[test]
    fn test_object_has_text_and_symbols() {
        let leaf = function("leaf", &[0xD65F_03C0], vec![]);
        let caller = function(
            "caller",
            &[0x9400_0000, 0xD65F_03C0],
            vec![Relocation {
                offset: 0,
                symbol: "external".into(),
                kind: RelocationKind::Call26,
                addend: 0,
            }],
        );
        let bytes = ElfAssembler::build_object(&[leaf, caller]).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::Aarch64);
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.size(), 12);
        assert_eq!(text.relocations().count(), 1);
        let leaf = file.symbol_by_name("leaf").unwrap();
        assert_eq!(leaf.address(), 0);
        assert_eq!(file.symbol_by_name("caller").unwrap().address(), 4);
        assert!(file.symbol_by_name("external").unwrap().is_undefined());
    }

    #[test]
    fn test_words_round_trip() {
        let f = function("f", &[0x8B01_0000, 0xD65F_03C0], vec![]);
        assert_eq!(f.words(), vec![0x8B01_0000, 0xD65F_03C0]);
    }
}
