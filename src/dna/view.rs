//! Typed access to reconstructed struct bytes.
//!
//! Reconstructed payloads are plain byte buffers in the memory layout. [`StructView`] and
//! [`StructViewMut`] resolve members by name through the memory [`Catalog`] so kinds and
//! versioning passes never compute offsets by hand. The [`DnaField`] and [`DnaStruct`]
//! traits are what `#[derive(DnaStruct)]` builds on.

use crate::dna::catalog::{Catalog, CatalogBuilder, MemberInfo, MemberKind, Primitive, StructInfo};
use crate::error::{LoaderError, Result};
use crate::format::Layout;

/// Scalars that map one-to-one to a [`Primitive`].
pub trait DnaPrimitive: Copy + Default {
    /// The matching table type.
    const PRIMITIVE: Primitive;

    /// Decodes one value at `at`.
    fn decode(layout: &Layout, data: &[u8], at: usize) -> Result<Self>;

    /// Encodes one value at `at`.
    fn encode(self, layout: &Layout, data: &mut [u8], at: usize) -> Result<()>;
}

macro_rules! impl_primitive_via {
    ($ty:ty, $prim:ident, $read:ident, $write:ident, $raw:ty) => {
        impl DnaPrimitive for $ty {
            const PRIMITIVE: Primitive = Primitive::$prim;

            fn decode(layout: &Layout, data: &[u8], at: usize) -> Result<Self> {
                layout.$read(data, at).map(|v| v as $ty)
            }

            fn encode(self, layout: &Layout, data: &mut [u8], at: usize) -> Result<()> {
                layout.$write(data, at, self as $raw)
            }
        }
    };
}

impl_primitive_via!(i16, Short, read_i16, write_i16, i16);
impl_primitive_via!(u16, UShort, read_u16, write_u16, u16);
impl_primitive_via!(i32, Int, read_i32, write_i32, i32);
impl_primitive_via!(u32, UInt, read_u32, write_u32, u32);
impl_primitive_via!(i64, Int64, read_u64, write_u64, u64);
impl_primitive_via!(u64, UInt64, read_u64, write_u64, u64);

fn byte_at(data: &[u8], at: usize) -> Result<u8> {
    data.get(at).copied().ok_or_else(|| {
        LoaderError::Corrupt(format!("byte offset {at} exceeds buffer of {} bytes", data.len()))
    })
}

fn set_byte_at(data: &mut [u8], at: usize, value: u8) -> Result<()> {
    let len = data.len();
    let slot = data.get_mut(at).ok_or_else(|| {
        LoaderError::Corrupt(format!("byte offset {at} exceeds buffer of {len} bytes"))
    })?;
    *slot = value;
    Ok(())
}

impl DnaPrimitive for u8 {
    const PRIMITIVE: Primitive = Primitive::UChar;

    fn decode(_: &Layout, data: &[u8], at: usize) -> Result<Self> {
        byte_at(data, at)
    }

    fn encode(self, _: &Layout, data: &mut [u8], at: usize) -> Result<()> {
        set_byte_at(data, at, self)
    }
}

impl DnaPrimitive for i8 {
    const PRIMITIVE: Primitive = Primitive::Char;

    fn decode(_: &Layout, data: &[u8], at: usize) -> Result<Self> {
        byte_at(data, at).map(|b| b as i8)
    }

    fn encode(self, _: &Layout, data: &mut [u8], at: usize) -> Result<()> {
        set_byte_at(data, at, self as u8)
    }
}

impl DnaPrimitive for f32 {
    const PRIMITIVE: Primitive = Primitive::Float;

    fn decode(layout: &Layout, data: &[u8], at: usize) -> Result<Self> {
        layout.read_u32(data, at).map(f32::from_bits)
    }

    fn encode(self, layout: &Layout, data: &mut [u8], at: usize) -> Result<()> {
        layout.write_u32(data, at, self.to_bits())
    }
}

impl DnaPrimitive for f64 {
    const PRIMITIVE: Primitive = Primitive::Double;

    fn decode(layout: &Layout, data: &[u8], at: usize) -> Result<Self> {
        layout.read_u64(data, at).map(f64::from_bits)
    }

    fn encode(self, layout: &Layout, data: &mut [u8], at: usize) -> Result<()> {
        layout.write_u64(data, at, self.to_bits())
    }
}

fn no_member(info: &StructInfo, name: &str) -> LoaderError {
    LoaderError::Dna(format!("struct {} has no member {name}", info.name))
}

fn wrong_kind(info: &StructInfo, member: &MemberInfo, expected: &str) -> LoaderError {
    LoaderError::Dna(format!(
        "member {}.{} is {} {}, not {expected}",
        info.name,
        member.name,
        member.type_name,
        match member.kind {
            MemberKind::Pointer => "pointer",
            MemberKind::Primitive(_) => "scalar",
            MemberKind::Struct(_) => "struct",
            MemberKind::Opaque => "opaque",
        }
    ))
}

fn element_offset(info: &StructInfo, member: &MemberInfo, index: usize) -> Result<usize> {
    if index >= member.array_len {
        return Err(LoaderError::Dna(format!(
            "index {index} out of bounds for {}.{}",
            info.name, member.name
        )));
    }
    Ok(member.offset + index * member.elem_size)
}

fn lookup<'c>(catalog: &'c Catalog, struct_name: &str) -> Result<&'c StructInfo> {
    catalog
        .struct_info_by_name(struct_name)
        .ok_or_else(|| LoaderError::Dna(format!("struct {struct_name} is not declared")))
}

fn check_len(info: &StructInfo, len: usize) -> Result<()> {
    if len < info.size {
        return Err(LoaderError::Corrupt(format!(
            "{} needs {} bytes, buffer holds {len}",
            info.name, info.size
        )));
    }
    Ok(())
}

/// Read-only view of one struct instance.
#[derive(Debug, Clone, Copy)]
pub struct StructView<'a> {
    catalog: &'a Catalog,
    info: &'a StructInfo,
    data: &'a [u8],
}

impl<'a> StructView<'a> {
    /// Views `data` as an instance of `struct_name`.
    pub fn new(catalog: &'a Catalog, struct_name: &str, data: &'a [u8]) -> Result<Self> {
        let info = lookup(catalog, struct_name)?;
        check_len(info, data.len())?;
        Ok(Self {
            catalog,
            info,
            data,
        })
    }

    /// Views `data` as an instance of the struct at `index`.
    pub fn at_index(catalog: &'a Catalog, index: usize, data: &'a [u8]) -> Result<Self> {
        let info = catalog
            .struct_info(index)
            .ok_or_else(|| LoaderError::Dna(format!("struct index {index} out of range")))?;
        check_len(info, data.len())?;
        Ok(Self {
            catalog,
            info,
            data,
        })
    }

    /// Struct definition.
    pub fn info(&self) -> &'a StructInfo {
        self.info
    }

    /// Catalog the view resolves against.
    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    /// Raw bytes of this instance.
    pub fn bytes(&self) -> &'a [u8] {
        &self.data[..self.info.size]
    }

    /// Member by bare identifier.
    pub fn member(&self, name: &str) -> Result<&'a MemberInfo> {
        self.info
            .member(name)
            .ok_or_else(|| no_member(self.info, name))
    }

    /// True if the struct declares `name`.
    pub fn has(&self, name: &str) -> bool {
        self.info.member(name).is_some()
    }

    /// Reads a scalar.
    pub fn get<T: DnaPrimitive>(&self, name: &str) -> Result<T> {
        self.get_at(name, 0)
    }

    /// Reads element `index` of a scalar array.
    pub fn get_at<T: DnaPrimitive>(&self, name: &str, index: usize) -> Result<T> {
        let member = self.member(name)?;
        match member.kind {
            MemberKind::Primitive(p) if p == T::PRIMITIVE => {}
            _ => return Err(wrong_kind(self.info, member, T::PRIMITIVE.type_name())),
        }
        let at = element_offset(self.info, member, index)?;
        T::decode(&self.catalog.layout(), self.data, at)
    }

    /// Reads a NUL-terminated `char` array.
    pub fn string(&self, name: &str) -> Result<String> {
        let member = self.member(name)?;
        if !matches!(member.kind, MemberKind::Primitive(p) if p.is_char()) {
            return Err(wrong_kind(self.info, member, "char array"));
        }
        let raw = &self.data[member.offset..member.offset + member.size()];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Reads a pointer.
    pub fn pointer(&self, name: &str) -> Result<u64> {
        self.pointer_at(name, 0)
    }

    /// Reads element `index` of a pointer array.
    pub fn pointer_at(&self, name: &str, index: usize) -> Result<u64> {
        let member = self.member(name)?;
        if member.kind != MemberKind::Pointer {
            return Err(wrong_kind(self.info, member, "pointer"));
        }
        let at = element_offset(self.info, member, index)?;
        self.catalog.layout().read_ptr(self.data, at)
    }

    /// Views an embedded struct.
    pub fn substruct(&self, name: &str) -> Result<StructView<'a>> {
        let member = self.member(name)?;
        let MemberKind::Struct(index) = member.kind else {
            return Err(wrong_kind(self.info, member, "struct"));
        };
        let data = &self.data[member.offset..member.offset + member.size()];
        StructView::at_index(self.catalog, index, data)
    }
}

/// Mutable view of one struct instance.
#[derive(Debug)]
pub struct StructViewMut<'a> {
    catalog: &'a Catalog,
    info: &'a StructInfo,
    data: &'a mut [u8],
}

impl<'a> StructViewMut<'a> {
    /// Views `data` as an instance of `struct_name`.
    pub fn new(catalog: &'a Catalog, struct_name: &str, data: &'a mut [u8]) -> Result<Self> {
        let info = lookup(catalog, struct_name)?;
        check_len(info, data.len())?;
        Ok(Self {
            catalog,
            info,
            data,
        })
    }

    /// Views `data` as an instance of the struct at `index`.
    pub fn at_index(catalog: &'a Catalog, index: usize, data: &'a mut [u8]) -> Result<Self> {
        let info = catalog
            .struct_info(index)
            .ok_or_else(|| LoaderError::Dna(format!("struct index {index} out of range")))?;
        check_len(info, data.len())?;
        Ok(Self {
            catalog,
            info,
            data,
        })
    }

    /// Read-only reborrow.
    pub fn as_view(&self) -> StructView<'_> {
        StructView {
            catalog: self.catalog,
            info: self.info,
            data: &self.data[..],
        }
    }

    fn member(&self, name: &str) -> Result<&'a MemberInfo> {
        self.info
            .member(name)
            .ok_or_else(|| no_member(self.info, name))
    }

    /// Writes a scalar.
    pub fn set<T: DnaPrimitive>(&mut self, name: &str, value: T) -> Result<()> {
        self.set_at(name, 0, value)
    }

    /// Writes element `index` of a scalar array.
    pub fn set_at<T: DnaPrimitive>(&mut self, name: &str, index: usize, value: T) -> Result<()> {
        let member = self.member(name)?;
        match member.kind {
            MemberKind::Primitive(p) if p == T::PRIMITIVE => {}
            _ => return Err(wrong_kind(self.info, member, T::PRIMITIVE.type_name())),
        }
        let at = element_offset(self.info, member, index)?;
        value.encode(&self.catalog.layout(), self.data, at)
    }

    /// Writes a `char` array, truncating to leave room for the terminator.
    pub fn set_string(&mut self, name: &str, value: &str) -> Result<()> {
        let member = self.member(name)?;
        if !matches!(member.kind, MemberKind::Primitive(p) if p.is_char()) {
            return Err(wrong_kind(self.info, member, "char array"));
        }
        let slot = &mut self.data[member.offset..member.offset + member.size()];
        slot.fill(0);
        let bytes = value.as_bytes();
        let n = bytes.len().min(slot.len().saturating_sub(1));
        slot[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Writes a pointer.
    pub fn set_pointer(&mut self, name: &str, value: u64) -> Result<()> {
        self.set_pointer_at(name, 0, value)
    }

    /// Writes element `index` of a pointer array.
    pub fn set_pointer_at(&mut self, name: &str, index: usize, value: u64) -> Result<()> {
        let member = self.member(name)?;
        if member.kind != MemberKind::Pointer {
            return Err(wrong_kind(self.info, member, "pointer"));
        }
        let at = element_offset(self.info, member, index)?;
        self.catalog.layout().write_ptr(self.data, at, value)
    }

    /// Mutable view of an embedded struct.
    pub fn substruct_mut(&mut self, name: &str) -> Result<StructViewMut<'_>> {
        let member = self.member(name)?;
        let MemberKind::Struct(index) = member.kind else {
            return Err(wrong_kind(self.info, member, "struct"));
        };
        let catalog = self.catalog;
        let data = &mut self.data[member.offset..member.offset + member.size()];
        StructViewMut::at_index(catalog, index, data)
    }
}

/// A value that can be a struct member.
///
/// Implemented for the primitive scalars, fixed arrays of them, and every type deriving
/// [`DnaStruct`].
pub trait DnaField: Sized {
    /// Registers what the member needs and returns its `(type, name)` declaration.
    fn declare(builder: &mut CatalogBuilder, name: &str) -> Result<(String, String)>;

    /// Reads the member `name` from `view`.
    fn read_member(view: &StructView<'_>, name: &str) -> Result<Self>;

    /// Writes the member `name` into `view`.
    fn write_member(&self, view: &mut StructViewMut<'_>, name: &str) -> Result<()>;
}

macro_rules! impl_field_for_primitive {
    ($($ty:ty),*) => {
        $(
            impl DnaField for $ty {
                fn declare(_: &mut CatalogBuilder, name: &str) -> Result<(String, String)> {
                    Ok((<$ty as DnaPrimitive>::PRIMITIVE.type_name().to_owned(), name.to_owned()))
                }

                fn read_member(view: &StructView<'_>, name: &str) -> Result<Self> {
                    view.get(name)
                }

                fn write_member(&self, view: &mut StructViewMut<'_>, name: &str) -> Result<()> {
                    view.set(name, *self)
                }
            }
        )*
    };
}

impl_field_for_primitive!(u8, i8, i16, u16, i32, u32, i64, u64, f32, f64);

impl<T: DnaPrimitive, const N: usize> DnaField for [T; N] {
    fn declare(_: &mut CatalogBuilder, name: &str) -> Result<(String, String)> {
        Ok((T::PRIMITIVE.type_name().to_owned(), format!("{name}[{N}]")))
    }

    fn read_member(view: &StructView<'_>, name: &str) -> Result<Self> {
        let mut out = [T::default(); N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = view.get_at(name, i)?;
        }
        Ok(out)
    }

    fn write_member(&self, view: &mut StructViewMut<'_>, name: &str) -> Result<()> {
        for (i, value) in self.iter().enumerate() {
            view.set_at(name, i, *value)?;
        }
        Ok(())
    }
}

/// A Rust type mirroring a struct of the table.
///
/// Usually derived with `#[derive(DnaStruct)]`.
pub trait DnaStruct: Sized {
    /// Type name in the table.
    const NAME: &'static str;

    /// Declares the struct (and the structs it embeds) and returns its index.
    fn describe(builder: &mut CatalogBuilder) -> Result<usize>;

    /// Reads an instance from a view.
    fn read(view: &StructView<'_>) -> Result<Self>;

    /// Writes this instance into a view.
    fn write(&self, view: &mut StructViewMut<'_>) -> Result<()>;

    /// Decodes an instance from memory-layout bytes.
    fn from_bytes(catalog: &Catalog, data: &[u8]) -> Result<Self> {
        Self::read(&StructView::new(catalog, Self::NAME, data)?)
    }

    /// Encodes this instance into a zeroed buffer of the struct's size.
    fn to_bytes(&self, catalog: &Catalog) -> Result<Vec<u8>> {
        let size = catalog
            .struct_info_by_name(Self::NAME)
            .map(|s| s.size)
            .ok_or_else(|| LoaderError::Dna(format!("struct {} is not declared", Self::NAME)))?;
        let mut buf = vec![0u8; size];
        self.write(&mut StructViewMut::new(catalog, Self::NAME, &mut buf)?)?;
        Ok(buf)
    }
}
