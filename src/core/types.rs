//! Type registry shared read-only by every function compilation.
//!
//! The lowering step hands the backend type ids; the backend only ever asks
//! for sizes, alignments, field offsets and how many machine words a value of
//! the type occupies. Builtin types live at fixed ids so they can be named as
//! constants; aggregates are interned on creation.

use std::fmt;

use hashbrown::HashMap;

/// Size of one machine word in bytes.
pub const WORD_SIZE: u32 = 8;

/// Largest value that still travels in registers (two words).
pub const MAX_REGISTER_VALUE_SIZE: u32 = 2 * WORD_SIZE;

/// Index of a type inside a [`TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    pub const VOID: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const I8: TypeId = TypeId(2);
    pub const I16: TypeId = TypeId(3);
    pub const I32: TypeId = TypeId(4);
    pub const I64: TypeId = TypeId(5);
    pub const U8: TypeId = TypeId(6);
    pub const U16: TypeId = TypeId(7);
    pub const U32: TypeId = TypeId(8);
    pub const U64: TypeId = TypeId(9);
    pub const PTR: TypeId = TypeId(10);
    /// Virtual memory state threaded through side-effecting operations.
    pub const MEM: TypeId = TypeId(11);
    /// Pointer + length pair.
    pub const SLICE: TypeId = TypeId(12);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Shape of a registered type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Bool,
    Int { bits: u8, signed: bool },
    Ptr,
    Mem,
    Slice,
    Struct(StructLayout),
}

/// Field layout of an aggregate, computed once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub fields: Vec<TypeId>,
    pub offsets: Vec<u32>,
    pub size: u32,
    pub align: u32,
}

#[derive(Debug, Clone)]
struct TypeInfo {
    kind: TypeKind,
    size: u32,
    align: u32,
}

/// Registry answering size/alignment/field-offset queries by type id.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
    structs: HashMap<Vec<TypeId>, TypeId>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry holding only the builtin types.
    pub fn new() -> Self {
        let int = |bits: u8, signed: bool| TypeInfo {
            kind: TypeKind::Int { bits, signed },
            size: bits as u32 / 8,
            align: bits as u32 / 8,
        };
        let types = vec![
            TypeInfo { kind: TypeKind::Void, size: 0, align: 1 },
            TypeInfo { kind: TypeKind::Bool, size: 1, align: 1 },
            int(8, true),
            int(16, true),
            int(32, true),
            int(64, true),
            int(8, false),
            int(16, false),
            int(32, false),
            int(64, false),
            TypeInfo { kind: TypeKind::Ptr, size: 8, align: 8 },
            TypeInfo { kind: TypeKind::Mem, size: 0, align: 1 },
            TypeInfo { kind: TypeKind::Slice, size: 16, align: 8 },
        ];
        Self {
            types,
            structs: HashMap::new(),
        }
    }

    /// Register (or look up) the aggregate made of `fields` in order.
    pub fn struct_type(&mut self, fields: &[TypeId]) -> TypeId {
        if let Some(&id) = self.structs.get(fields) {
            return id;
        }

        let mut offsets = Vec::with_capacity(fields.len());
        let mut size = 0u32;
        let mut align = 1u32;
        for &field in fields {
            let field_align = self.align(field);
            size = align_to(size, field_align);
            offsets.push(size);
            size += self.size(field);
            align = align.max(field_align);
        }
        let size = align_to(size, align);

        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeInfo {
            kind: TypeKind::Struct(StructLayout {
                fields: fields.to_vec(),
                offsets,
                size,
                align,
            }),
            size,
            align,
        });
        self.structs.insert(fields.to_vec(), id);
        id
    }

    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        &self.types[ty.index()].kind
    }

    /// Size in bytes.
    pub fn size(&self, ty: TypeId) -> u32 {
        self.types[ty.index()].size
    }

    /// Alignment in bytes.
    pub fn align(&self, ty: TypeId) -> u32 {
        self.types[ty.index()].align
    }

    pub fn is_valid(&self, ty: TypeId) -> bool {
        ty.index() < self.types.len()
    }

    /// Number of fields of an aggregate; slices count as two.
    pub fn field_count(&self, ty: TypeId) -> usize {
        match self.kind(ty) {
            TypeKind::Slice => 2,
            TypeKind::Struct(layout) => layout.fields.len(),
            _ => 0,
        }
    }

    /// Byte offset of field `index`.
    pub fn field_offset(&self, ty: TypeId, index: usize) -> Option<u32> {
        match self.kind(ty) {
            TypeKind::Slice if index < 2 => Some(index as u32 * WORD_SIZE),
            TypeKind::Struct(layout) => layout.offsets.get(index).copied(),
            _ => None,
        }
    }

    /// Type of field `index`.
    pub fn field_type(&self, ty: TypeId, index: usize) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Slice if index == 0 => Some(TypeId::PTR),
            TypeKind::Slice if index == 1 => Some(TypeId::I64),
            TypeKind::Struct(layout) => layout.fields.get(index).copied(),
            _ => None,
        }
    }

    /// Machine words a value of this type occupies when held in registers.
    ///
    /// Returns 0 for types without a runtime value (void, memory) and for
    /// aggregates too wide to live in registers.
    pub fn parts(&self, ty: TypeId) -> u32 {
        match self.kind(ty) {
            TypeKind::Void | TypeKind::Mem => 0,
            _ => {
                let size = self.size(ty);
                if size == 0 || size > MAX_REGISTER_VALUE_SIZE {
                    0
                } else {
                    size.div_ceil(WORD_SIZE)
                }
            }
        }
    }

    /// Whether values of this type can be SSA values at all.
    pub fn is_register_value(&self, ty: TypeId) -> bool {
        self.parts(ty) > 0
    }

    /// Aggregates wider than two words live in memory and travel by reference.
    pub fn is_memory_aggregate(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Struct(_)) && self.size(ty) > MAX_REGISTER_VALUE_SIZE
    }

    /// True when every field is one word at offset `8 * index`, so each part
    /// of the register value is exactly one field.
    pub fn is_word_partitioned(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::Slice => true,
            TypeKind::Struct(layout) => {
                layout.fields.len() <= 2
                    && layout
                        .fields
                        .iter()
                        .zip(&layout.offsets)
                        .enumerate()
                        .all(|(i, (&f, &off))| self.size(f) == WORD_SIZE && off == i as u32 * WORD_SIZE)
            }
            _ => false,
        }
    }

    pub fn is_integer(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Int { .. } | TypeKind::Bool | TypeKind::Ptr)
    }

    pub fn is_signed(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Int { signed: true, .. })
    }

    /// Width in bits of a scalar; 64 for pointers.
    pub fn bits(&self, ty: TypeId) -> u32 {
        self.size(ty) * 8
    }

    /// Look up a builtin by its textual name.
    pub fn builtin(name: &str) -> Option<TypeId> {
        Some(match name {
            "void" => TypeId::VOID,
            "bool" => TypeId::BOOL,
            "i8" => TypeId::I8,
            "i16" => TypeId::I16,
            "i32" => TypeId::I32,
            "i64" => TypeId::I64,
            "u8" => TypeId::U8,
            "u16" => TypeId::U16,
            "u32" => TypeId::U32,
            "u64" => TypeId::U64,
            "ptr" => TypeId::PTR,
            "mem" => TypeId::MEM,
            "slice" => TypeId::SLICE,
            _ => return None,
        })
    }

    /// Printable name of a type.
    pub fn name(&self, ty: TypeId) -> String {
        match self.kind(ty) {
            TypeKind::Void => "void".into(),
            TypeKind::Bool => "bool".into(),
            TypeKind::Int { bits, signed } => format!("{}{}", if *signed { 'i' } else { 'u' }, bits),
            TypeKind::Ptr => "ptr".into(),
            TypeKind::Mem => "mem".into(),
            TypeKind::Slice => "slice".into(),
            TypeKind::Struct(layout) => {
                let fields: Vec<String> = layout.fields.iter().map(|&f| self.name(f)).collect();
                format!("{{{}}}", fields.join(", "))
            }
        }
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub fn align_to(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_sizes() {
        let types = TypeRegistry::new();
        assert_eq!(types.size(TypeId::I32), 4);
        assert_eq!(types.size(TypeId::SLICE), 16);
        assert_eq!(types.parts(TypeId::SLICE), 2);
        assert_eq!(types.parts(TypeId::MEM), 0);
        assert!(types.is_signed(TypeId::I16));
        assert!(!types.is_signed(TypeId::U16));
    }

    #[test]
    fn struct_layout_respects_alignment() {
        let mut types = TypeRegistry::new();
        let s = types.struct_type(&[TypeId::U8, TypeId::I64, TypeId::I32]);
        assert_eq!(types.field_offset(s, 0), Some(0));
        assert_eq!(types.field_offset(s, 1), Some(8));
        assert_eq!(types.field_offset(s, 2), Some(16));
        assert_eq!(types.size(s), 24);
        assert_eq!(types.align(s), 8);
        assert!(types.is_memory_aggregate(s));
        assert_eq!(types.parts(s), 0);
        // Interned.
        assert_eq!(types.struct_type(&[TypeId::U8, TypeId::I64, TypeId::I32]), s);
    }

    #[test]
    fn word_partitioned_pairs() {
        let mut types = TypeRegistry::new();
        let pair = types.struct_type(&[TypeId::I64, TypeId::PTR]);
        let packed = types.struct_type(&[TypeId::I32, TypeId::I32]);
        assert!(types.is_word_partitioned(pair));
        assert!(!types.is_word_partitioned(packed));
        assert_eq!(types.parts(packed), 1);
        assert_eq!(types.name(pair), "{i64, ptr}");
    }
}
