//! The struct descriptor table.
//!
//! A [`Catalog`] lists every member name, type name, type size and struct definition of one
//! layout. Documents carry the catalog they were written with in their `DNA1` block; the
//! running program builds its own with a [`CatalogBuilder`].
//!
//! ## Encoding
//!
//! ```text
//! "SDNA"
//! "NAME" i32 count, NUL-terminated names, pad to 4
//! "TYPE" i32 count, NUL-terminated names, pad to 4
//! "TLEN" i16 per type, pad to 4
//! "STRC" i32 count, per struct: i16 type, i16 member count, (i16 type, i16 name)*
//! ```

use std::collections::HashMap;

use crate::error::{LoaderError, Result};
use crate::format::{Layout, PointerWidth};

/// Name of the synthetic struct at index 0. Blocks referencing it hold raw bytes.
pub const RAW_STRUCT: &str = "Link";

/// Scalar member types with a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// Signed 8-bit character.
    Char,
    /// Unsigned 8-bit character.
    UChar,
    /// `i16`.
    Short,
    /// `u16`.
    UShort,
    /// `i32`.
    Int,
    /// `u32`.
    UInt,
    /// `f32`.
    Float,
    /// `f64`.
    Double,
    /// `i64`.
    Int64,
    /// `u64`.
    UInt64,
    /// `i8`.
    Int8,
}

impl Primitive {
    /// Every primitive, in registration order.
    pub const ALL: [Primitive; 11] = [
        Self::Char,
        Self::UChar,
        Self::Short,
        Self::UShort,
        Self::Int,
        Self::UInt,
        Self::Float,
        Self::Double,
        Self::Int64,
        Self::UInt64,
        Self::Int8,
    ];

    /// Type name as stored in the table.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Char => "char",
            Self::UChar => "uchar",
            Self::Short => "short",
            Self::UShort => "ushort",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Double => "double",
            Self::Int64 => "int64_t",
            Self::UInt64 => "uint64_t",
            Self::Int8 => "int8_t",
        }
    }

    /// Looks up a primitive by type name.
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.type_name() == name)
    }

    /// Size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Char | Self::UChar | Self::Int8 => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Double | Self::Int64 | Self::UInt64 => 8,
        }
    }

    /// True for the 8-bit character types.
    pub fn is_char(self) -> bool {
        matches!(self, Self::Char | Self::UChar)
    }

    /// True for `float` and `double`.
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }
}

/// Returns true if a member name declares a pointer (`*next`, `(*func)()`).
pub fn is_pointer_name(name: &str) -> bool {
    name.starts_with('*') || name.starts_with("(*")
}

/// Product of all `[N]` dimensions of a member name (1 when there are none).
pub fn array_len(name: &str) -> usize {
    let mut len = 1usize;
    let mut rest = name;
    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        let digits = &rest[open + 1..open + close];
        len = len.saturating_mul(digits.trim().parse::<usize>().unwrap_or(1));
        rest = &rest[open + close + 1..];
    }
    len
}

/// Bare member identifier (`*mat[4]` gives `mat`, `(*func)()` gives `func`), used to match
/// members across layouts and to look them up by name.
pub fn base_name(name: &str) -> &str {
    let name = name.trim_start_matches(['*', '(']);
    match name.find(['[', ')']) {
        Some(i) => &name[..i],
        None => name,
    }
}

/// What a member holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// A scalar (or array of scalars).
    Primitive(Primitive),
    /// A pointer (or array of pointers).
    Pointer,
    /// An embedded struct, by struct index.
    Struct(usize),
    /// A type with no known layout, copied as opaque bytes.
    Opaque,
}

impl MemberKind {
    /// Coarse category used when matching members across layouts.
    pub fn category(&self) -> u8 {
        match self {
            Self::Primitive(_) => 0,
            Self::Pointer => 1,
            Self::Struct(_) => 2,
            Self::Opaque => 3,
        }
    }
}

/// A resolved struct member.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    /// Type name.
    pub type_name: String,
    /// Full member name, including `*` and array suffixes.
    pub name: String,
    /// Byte offset within the struct.
    pub offset: usize,
    /// Size of a single element.
    pub elem_size: usize,
    /// Number of elements.
    pub array_len: usize,
    /// Category and type.
    pub kind: MemberKind,
}

impl MemberInfo {
    /// Total size of the member.
    pub fn size(&self) -> usize {
        self.elem_size.saturating_mul(self.array_len)
    }

    /// Total size of the member, or `None` if it does not fit in `usize`.
    pub fn checked_size(&self) -> Option<usize> {
        self.elem_size.checked_mul(self.array_len)
    }

    /// Bare identifier, without pointer or array decorations.
    pub fn base(&self) -> &str {
        base_name(&self.name)
    }

    /// For pointer members, the pointee type name.
    pub fn pointee(&self) -> Option<&str> {
        match self.kind {
            MemberKind::Pointer => Some(&self.type_name),
            _ => None,
        }
    }
}

/// A resolved struct definition.
#[derive(Debug, Clone)]
pub struct StructInfo {
    /// Type name of the struct.
    pub name: String,
    /// Index into the type table.
    pub type_index: usize,
    /// Size in bytes according to the type table.
    pub size: usize,
    /// Members in declaration order.
    pub members: Vec<MemberInfo>,
    by_base: HashMap<String, usize>,
}

impl StructInfo {
    /// Finds a member by its bare identifier.
    pub fn member(&self, base: &str) -> Option<&MemberInfo> {
        self.by_base.get(base).and_then(|i| self.members.get(*i))
    }
}

#[derive(Debug, Clone)]
struct RawStruct {
    type_index: usize,
    members: Vec<(usize, usize)>,
}

/// A decoded struct descriptor table.
#[derive(Debug, Clone)]
pub struct Catalog {
    layout: Layout,
    names: Vec<String>,
    types: Vec<String>,
    type_sizes: Vec<u16>,
    raw_structs: Vec<RawStruct>,
    structs: Vec<StructInfo>,
    struct_by_name: HashMap<String, usize>,
}

impl Catalog {
    fn assemble(
        layout: Layout,
        names: Vec<String>,
        types: Vec<String>,
        type_sizes: Vec<u16>,
        raw_structs: Vec<RawStruct>,
    ) -> Result<Self> {
        let mut struct_by_name = HashMap::new();
        for (i, s) in raw_structs.iter().enumerate() {
            let name = types.get(s.type_index).ok_or_else(|| {
                LoaderError::Dna(format!("struct {i} references unknown type {}", s.type_index))
            })?;
            struct_by_name.entry(name.clone()).or_insert(i);
        }

        let struct_size = |index: usize| {
            raw_structs
                .get(index)
                .and_then(|s| type_sizes.get(s.type_index))
                .map_or(0, |size| usize::from(*size))
        };

        let mut structs = Vec::with_capacity(raw_structs.len());
        for s in &raw_structs {
            let struct_name = types.get(s.type_index).ok_or_else(|| {
                LoaderError::Dna(format!("struct references unknown type {}", s.type_index))
            })?;
            let size = usize::from(type_sizes.get(s.type_index).copied().unwrap_or(0));
            let mut members = Vec::with_capacity(s.members.len());
            let mut by_base = HashMap::new();
            let mut offset = 0usize;
            for (type_index, name_index) in &s.members {
                let type_name = types.get(*type_index).ok_or_else(|| {
                    LoaderError::Dna(format!("member references unknown type {type_index}"))
                })?;
                let name = names.get(*name_index).ok_or_else(|| {
                    LoaderError::Dna(format!("member references unknown name {name_index}"))
                })?;
                let (kind, elem_size) = if is_pointer_name(name) {
                    (MemberKind::Pointer, layout.pointer_size())
                } else if let Some(prim) = Primitive::from_type_name(type_name) {
                    (MemberKind::Primitive(prim), prim.size())
                } else if let Some(idx) = struct_by_name.get(type_name.as_str()) {
                    (MemberKind::Struct(*idx), struct_size(*idx))
                } else {
                    (
                        MemberKind::Opaque,
                        usize::from(type_sizes.get(*type_index).copied().unwrap_or(0)),
                    )
                };
                let member = MemberInfo {
                    type_name: type_name.clone(),
                    name: name.clone(),
                    offset,
                    elem_size,
                    array_len: array_len(name),
                    kind,
                };
                offset = member
                    .checked_size()
                    .and_then(|n| offset.checked_add(n))
                    .filter(|end| *end <= size)
                    .ok_or_else(|| {
                        LoaderError::Dna(format!(
                            "struct {struct_name}: member {name} overruns the declared size {size}"
                        ))
                    })?;
                by_base
                    .entry(member.base().to_owned())
                    .or_insert(members.len());
                members.push(member);
            }
            structs.push(StructInfo {
                name: struct_name.clone(),
                type_index: s.type_index,
                size,
                members,
                by_base,
            });
        }
        reject_embedding_cycles(&structs)?;

        Ok(Self {
            layout,
            names,
            types,
            type_sizes,
            raw_structs,
            structs,
            struct_by_name,
        })
    }

    /// Decodes a `DNA1` payload written with `layout`.
    pub fn parse(data: &[u8], layout: Layout) -> Result<Self> {
        let mut cur = Cursor {
            data,
            pos: 0,
            layout,
        };
        cur.expect_tag(b"SDNA")?;

        cur.expect_tag(b"NAME")?;
        let name_count = cur.count()?;
        let mut names = Vec::with_capacity(name_count);
        for _ in 0..name_count {
            names.push(cur.c_string()?);
        }
        cur.align4();

        cur.expect_tag(b"TYPE")?;
        let type_count = cur.count()?;
        let mut types = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            types.push(cur.c_string()?);
        }
        cur.align4();

        cur.expect_tag(b"TLEN")?;
        let mut type_sizes = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            type_sizes.push(cur.i16()? as u16);
        }
        cur.align4();

        cur.expect_tag(b"STRC")?;
        let struct_count = cur.count()?;
        let mut raw_structs = Vec::with_capacity(struct_count);
        for _ in 0..struct_count {
            let type_index = cur.index(type_count)?;
            let member_count = cur.i16()?.max(0) as usize;
            let mut members = Vec::with_capacity(member_count);
            for _ in 0..member_count {
                let t = cur.index(type_count)?;
                let n = cur.index(name_count)?;
                members.push((t, n));
            }
            raw_structs.push(RawStruct {
                type_index,
                members,
            });
        }

        let catalog = Self::assemble(layout, names, types, type_sizes, raw_structs)?;
        catalog.check_pointer_size()?;
        Ok(catalog)
    }

    /// Pointer width derived from `ListBase` (two pointers) must agree with the layout.
    fn check_pointer_size(&self) -> Result<()> {
        let Some(list_base) = self.struct_info_by_name("ListBase") else {
            return Err(LoaderError::Dna("struct table has no ListBase".into()));
        };
        if list_base.members.len() != 2 {
            return Err(LoaderError::Dna(format!(
                "ListBase must have 2 members, found {}",
                list_base.members.len()
            )));
        }
        let derived = PointerWidth::from_size(list_base.size / 2).ok_or_else(|| {
            LoaderError::Dna(format!(
                "ListBase size {} gives no valid pointer width",
                list_base.size
            ))
        })?;
        if derived != self.layout.width {
            return Err(LoaderError::Dna(format!(
                "struct table pointer size {} disagrees with header ({})",
                derived.size(),
                self.layout.pointer_size()
            )));
        }
        Ok(())
    }

    /// Serializes the table with this catalog's endianness.
    pub fn encode(&self) -> Vec<u8> {
        let layout = self.layout;
        let mut out = Vec::new();
        out.extend_from_slice(b"SDNA");

        out.extend_from_slice(b"NAME");
        layout.put_i32(&mut out, self.names.len() as i32);
        for name in &self.names {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        pad4(&mut out);

        out.extend_from_slice(b"TYPE");
        layout.put_i32(&mut out, self.types.len() as i32);
        for ty in &self.types {
            out.extend_from_slice(ty.as_bytes());
            out.push(0);
        }
        pad4(&mut out);

        out.extend_from_slice(b"TLEN");
        for size in &self.type_sizes {
            layout.put_i16(&mut out, *size as i16);
        }
        pad4(&mut out);

        out.extend_from_slice(b"STRC");
        layout.put_i32(&mut out, self.raw_structs.len() as i32);
        for s in &self.raw_structs {
            layout.put_i16(&mut out, s.type_index as i16);
            layout.put_i16(&mut out, s.members.len() as i16);
            for (t, n) in &s.members {
                layout.put_i16(&mut out, *t as i16);
                layout.put_i16(&mut out, *n as i16);
            }
        }
        out
    }

    /// Layout the sizes and offsets were computed for.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Pointer size in bytes.
    pub fn pointer_size(&self) -> usize {
        self.layout.pointer_size()
    }

    /// Number of structs.
    pub fn struct_count(&self) -> usize {
        self.structs.len()
    }

    /// Struct index for a type name.
    pub fn struct_index(&self, name: &str) -> Option<usize> {
        self.struct_by_name.get(name).copied()
    }

    /// Struct by index.
    pub fn struct_info(&self, index: usize) -> Option<&StructInfo> {
        self.structs.get(index)
    }

    /// Struct by type name.
    pub fn struct_info_by_name(&self, name: &str) -> Option<&StructInfo> {
        self.struct_index(name).and_then(|i| self.structs.get(i))
    }

    /// Size of a type by name.
    pub fn type_size(&self, name: &str) -> Option<usize> {
        let idx = self.types.iter().position(|t| t == name)?;
        self.type_sizes.get(idx).map(|s| usize::from(*s))
    }

    /// Offset and capacity of the stored entity name inside an entity block.
    pub fn id_name_slot(&self) -> Option<(usize, usize)> {
        let id = self.struct_info_by_name("ID")?;
        let name = id.member("name")?;
        Some((name.offset, name.size()))
    }

    /// Structs in index order.
    pub fn structs(&self) -> &[StructInfo] {
        &self.structs
    }
}

/// Fails if any struct embeds itself, directly or through other structs.
fn reject_embedding_cycles(structs: &[StructInfo]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Open,
        Done,
    }
    let mut marks = vec![Mark::Unvisited; structs.len()];
    for root in 0..structs.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // (struct, next member to look at)
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::Open;
        while let Some((index, member)) = stack.pop() {
            let next = structs[index]
                .members
                .iter()
                .enumerate()
                .skip(member)
                .find_map(|(i, m)| match m.kind {
                    MemberKind::Struct(sub) if m.array_len > 0 => Some((i, sub)),
                    _ => None,
                });
            let Some((i, sub)) = next else {
                marks[index] = Mark::Done;
                continue;
            };
            stack.push((index, i + 1));
            match marks.get(sub).copied() {
                Some(Mark::Open) => {
                    return Err(LoaderError::Dna(format!(
                        "struct {} embeds itself through {}",
                        structs[sub].name, structs[index].name
                    )));
                }
                Some(Mark::Unvisited) => {
                    marks[sub] = Mark::Open;
                    stack.push((sub, 0));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    layout: Layout,
}

impl Cursor<'_> {
    fn truncated(&self) -> LoaderError {
        LoaderError::Dna(format!("struct table truncated at offset {}", self.pos))
    }

    fn expect_tag(&mut self, tag: &[u8; 4]) -> Result<()> {
        let got = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| self.truncated())?;
        if got != tag {
            return Err(LoaderError::Dna(format!(
                "expected {} tag at offset {}",
                String::from_utf8_lossy(tag),
                self.pos
            )));
        }
        self.pos += 4;
        Ok(())
    }

    fn count(&mut self) -> Result<usize> {
        let n = self
            .layout
            .read_i32(self.data, self.pos)
            .map_err(|_| self.truncated())?;
        self.pos += 4;
        if n < 0 {
            return Err(LoaderError::Dna(format!("negative count {n}")));
        }
        Ok(n as usize)
    }

    fn i16(&mut self) -> Result<i16> {
        let n = self
            .layout
            .read_i16(self.data, self.pos)
            .map_err(|_| self.truncated())?;
        self.pos += 2;
        Ok(n)
    }

    fn index(&mut self, bound: usize) -> Result<usize> {
        let n = self.i16()? as u16 as usize;
        if n >= bound {
            return Err(LoaderError::Dna(format!(
                "index {n} out of range ({bound} entries)"
            )));
        }
        Ok(n)
    }

    fn c_string(&mut self) -> Result<String> {
        let rest = self.data.get(self.pos..).ok_or_else(|| self.truncated())?;
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| self.truncated())?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }

    fn align4(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }
}

// --- Builder ---

/// Declares structs programmatically to produce a [`Catalog`].
///
/// Primitive types and the raw-data struct are registered up front. Struct definitions are
/// idempotent: declaring a struct twice keeps the first definition.
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    layout: Layout,
    names: Vec<String>,
    name_index: HashMap<String, usize>,
    types: Vec<String>,
    type_index: HashMap<String, usize>,
    type_sizes: Vec<u16>,
    structs: Vec<RawStruct>,
    struct_index: HashMap<String, usize>,
}

impl CatalogBuilder {
    /// Creates a builder for `layout`.
    pub fn new(layout: Layout) -> Self {
        let mut builder = Self {
            layout,
            names: Vec::new(),
            name_index: HashMap::new(),
            types: Vec::new(),
            type_index: HashMap::new(),
            type_sizes: Vec::new(),
            structs: Vec::new(),
            struct_index: HashMap::new(),
        };
        for prim in Primitive::ALL {
            builder.intern_type(prim.type_name(), prim.size());
        }
        builder.intern_type("void", 0);
        // Struct 0 is the raw-data link struct.
        let ptr = ("void".to_owned(), "*next".to_owned());
        let prev = ("void".to_owned(), "*prev".to_owned());
        let _ = builder.add_struct(RAW_STRUCT, &[ptr, prev]);
        builder
    }

    /// Layout the catalog is built for.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    fn intern_type(&mut self, name: &str, size: usize) -> usize {
        if let Some(i) = self.type_index.get(name) {
            return *i;
        }
        let i = self.types.len();
        self.types.push(name.to_owned());
        self.type_sizes.push(size as u16);
        self.type_index.insert(name.to_owned(), i);
        i
    }

    fn intern_name(&mut self, name: &str) -> usize {
        if let Some(i) = self.name_index.get(name) {
            return *i;
        }
        let i = self.names.len();
        self.names.push(name.to_owned());
        self.name_index.insert(name.to_owned(), i);
        i
    }

    /// Returns true if a struct with this name was declared.
    pub fn has_struct(&self, name: &str) -> bool {
        self.struct_index.contains_key(name)
    }

    /// Declares a pointer member. The pointee type is registered (with size 0) if unknown.
    pub fn pointer_member(&mut self, name: &str, pointee: &str) -> (String, String) {
        self.intern_type(pointee, 0);
        let name = if is_pointer_name(name) {
            name.to_owned()
        } else {
            format!("*{name}")
        };
        (pointee.to_owned(), name)
    }

    /// Declares a fixed-capacity `char` array member.
    pub fn string_member(&mut self, name: &str, capacity: usize) -> (String, String) {
        ("char".to_owned(), format!("{name}[{capacity}]"))
    }

    /// Declares a struct with `(type, name)` members and returns its index.
    ///
    /// Fails if a non-pointer member's type is unknown.
    pub fn add_struct(&mut self, name: &str, members: &[(String, String)]) -> Result<usize> {
        if let Some(i) = self.struct_index.get(name) {
            return Ok(*i);
        }
        let ptr_size = self.layout.pointer_size();
        let mut size = 0usize;
        let mut resolved = Vec::with_capacity(members.len());
        for (ty, member) in members {
            let elem = if is_pointer_name(member) {
                self.intern_type(ty, 0);
                ptr_size
            } else {
                let Some(t) = self.type_index.get(ty.as_str()) else {
                    return Err(LoaderError::Dna(format!(
                        "struct {name}: member {member} has undeclared type {ty}"
                    )));
                };
                if self.type_sizes[*t] == 0 && !self.struct_index.contains_key(ty.as_str()) {
                    return Err(LoaderError::Dna(format!(
                        "struct {name}: member {member} embeds incomplete type {ty}"
                    )));
                }
                usize::from(self.type_sizes[*t])
            };
            size = elem
                .checked_mul(array_len(member))
                .and_then(|n| size.checked_add(n))
                .filter(|total| *total <= usize::from(u16::MAX))
                .ok_or_else(|| {
                    LoaderError::Dna(format!("struct {name}: member {member} is too large"))
                })?;
            let t = self.intern_type(ty, 0);
            let n = self.intern_name(member);
            resolved.push((t, n));
        }
        let type_index = self.intern_type(name, size);
        // The type may have been registered by a pointer before its definition.
        self.type_sizes[type_index] = size as u16;
        let index = self.structs.len();
        self.structs.push(RawStruct {
            type_index,
            members: resolved,
        });
        self.struct_index.insert(name.to_owned(), index);
        Ok(index)
    }

    /// Declares `T` (and everything it embeds).
    pub fn define<T: super::DnaStruct>(&mut self) -> Result<&mut Self> {
        T::describe(self)?;
        Ok(self)
    }

    /// Finishes the catalog.
    pub fn build(self) -> Result<Catalog> {
        Catalog::assemble(
            self.layout,
            self.names,
            self.types,
            self.type_sizes,
            self.structs,
        )
    }
}
