//! Struct reconciliation between a document's catalog and the memory catalog.
//!
//! [`reconcile`] compares every file struct with the memory struct of the same name once per
//! document. [`Reconciler::reconstruct`] then converts individual records: a byte copy for
//! unchanged structs, a member-by-member rebuild for changed ones.

use crate::dna::catalog::{Catalog, MemberInfo, MemberKind, Primitive, StructInfo};
use crate::error::{LoaderError, Result};
use crate::format::Endian;

/// Comparison result for one file struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructFlag {
    /// Identical layout; records are copied.
    Equal,
    /// Same name, different layout; records are rebuilt member by member.
    Unequal,
    /// No memory struct with this name; records are dropped.
    Removed,
}

/// Per-document comparison of a file catalog against the memory catalog.
#[derive(Debug, Clone)]
pub struct Reconciler {
    flags: Vec<StructFlag>,
    to_memory: Vec<Option<usize>>,
    swap_endian: bool,
}

/// Computes the flag of every struct in `file` relative to `memory`.
pub fn reconcile(file: &Catalog, memory: &Catalog) -> Reconciler {
    let mut flags = Vec::with_capacity(file.struct_count());
    let mut to_memory = Vec::with_capacity(file.struct_count());
    let pointer_sizes_differ = file.pointer_size() != memory.pointer_size();

    for (index, fs) in file.structs().iter().enumerate() {
        let Some(mi) = memory.struct_index(&fs.name) else {
            flags.push(StructFlag::Removed);
            to_memory.push(None);
            continue;
        };
        to_memory.push(Some(mi));
        if index == 0 {
            flags.push(StructFlag::Equal);
            continue;
        }
        let ms = &memory.structs()[mi];
        flags.push(if shallow_equal(fs, ms, pointer_sizes_differ) {
            StructFlag::Equal
        } else {
            StructFlag::Unequal
        });
    }

    // An embedded struct that changed makes its container change too; iterate to a fixpoint.
    loop {
        let mut changed = false;
        for index in 1..flags.len() {
            if flags[index] != StructFlag::Equal {
                continue;
            }
            let embeds_unequal = file.structs()[index].members.iter().any(|m| {
                matches!(m.kind, MemberKind::Struct(sub) if flags.get(sub) != Some(&StructFlag::Equal))
            });
            if embeds_unequal {
                flags[index] = StructFlag::Unequal;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let unequal = flags.iter().filter(|f| **f == StructFlag::Unequal).count();
    let removed = flags.iter().filter(|f| **f == StructFlag::Removed).count();
    log::debug!(
        "reconciled {} structs ({unequal} changed, {removed} removed)",
        flags.len()
    );

    Reconciler {
        flags,
        to_memory,
        swap_endian: file.layout().endian != memory.layout().endian,
    }
}

fn shallow_equal(file: &StructInfo, memory: &StructInfo, pointer_sizes_differ: bool) -> bool {
    if file.size != memory.size || file.members.len() != memory.members.len() {
        return false;
    }
    file.members.iter().zip(&memory.members).all(|(f, m)| {
        f.type_name == m.type_name
            && f.name == m.name
            && !(pointer_sizes_differ && f.kind == MemberKind::Pointer)
    })
}

impl Reconciler {
    /// Flag of file struct `index`. Unknown indices count as removed.
    pub fn flag(&self, index: usize) -> StructFlag {
        self.flags.get(index).copied().unwrap_or(StructFlag::Removed)
    }

    /// Memory struct matching file struct `index`.
    pub fn memory_struct(&self, index: usize) -> Option<usize> {
        self.to_memory.get(index).copied().flatten()
    }

    /// Number of file structs flagged `flag`.
    pub fn count(&self, flag: StructFlag) -> usize {
        self.flags.iter().filter(|f| **f == flag).count()
    }

    /// True when the file layout uses the other byte order.
    pub fn swaps_endian(&self) -> bool {
        self.swap_endian
    }

    /// Converts `count` consecutive records of file struct `index` into the memory layout.
    ///
    /// Returns `None` for removed structs.
    pub fn reconstruct(
        &self,
        file: &Catalog,
        memory: &Catalog,
        index: usize,
        raw: &[u8],
        count: usize,
    ) -> Result<Option<Vec<u8>>> {
        let flag = self.flag(index);
        if flag == StructFlag::Removed {
            return Ok(None);
        }
        let Some(mi) = self.memory_struct(index) else {
            return Ok(None);
        };
        let fs = file
            .struct_info(index)
            .ok_or_else(|| LoaderError::Corrupt(format!("struct index {index} out of range")))?;
        let ms = memory
            .struct_info(mi)
            .ok_or_else(|| LoaderError::Internal(format!("memory struct {mi} vanished")))?;

        if fs.size == 0 && count > 0 {
            return Err(LoaderError::Corrupt(format!(
                "corrupt document: {count} records of zero-sized struct {}",
                fs.name
            )));
        }
        let needed = fs.size.saturating_mul(count);
        if raw.len() < needed {
            return Err(LoaderError::Corrupt(format!(
                "corrupt document: {count} x {} needs {needed} bytes, record holds {}",
                fs.name,
                raw.len()
            )));
        }

        let out_len = ms.size.checked_mul(count).ok_or_else(|| {
            LoaderError::Corrupt(format!("corrupt document: {count} x {} overflows", ms.name))
        })?;
        let mut out = vec![0u8; out_len];
        let ctx = Ctx {
            file,
            memory,
            reconciler: self,
        };
        for i in 0..count {
            let src = &raw[i * fs.size..(i + 1) * fs.size];
            let dst = &mut out[i * ms.size..(i + 1) * ms.size];
            ctx.convert_struct(flag, index, mi, src, dst)?;
        }
        Ok(Some(out))
    }
}

struct Ctx<'a> {
    file: &'a Catalog,
    memory: &'a Catalog,
    reconciler: &'a Reconciler,
}

impl Ctx<'_> {
    fn convert_struct(
        &self,
        flag: StructFlag,
        file_index: usize,
        memory_index: usize,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<()> {
        match flag {
            StructFlag::Removed => Ok(()),
            StructFlag::Equal => {
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
                if self.reconciler.swap_endian {
                    swap_struct(self.memory, memory_index, &mut dst[..n]);
                }
                Ok(())
            }
            StructFlag::Unequal => self.rebuild(file_index, memory_index, src, dst),
        }
    }

    fn rebuild(
        &self,
        file_index: usize,
        memory_index: usize,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<()> {
        let fs = &self.file.structs()[file_index];
        let ms = &self.memory.structs()[memory_index];
        for mm in &ms.members {
            let Some(fm) = fs.member(mm.base()) else {
                continue;
            };
            if fm.kind.category() != mm.kind.category() {
                continue;
            }
            let shared = fm.array_len.min(mm.array_len);
            match (fm.kind, mm.kind) {
                (MemberKind::Primitive(fp), MemberKind::Primitive(mp)) => {
                    for e in 0..shared {
                        let s = fm.offset + e * fm.elem_size;
                        let d = mm.offset + e * mm.elem_size;
                        self.convert_primitive(fp, mp, &src[s..s + fm.elem_size], &mut dst[d..d + mm.elem_size]);
                    }
                }
                (MemberKind::Pointer, MemberKind::Pointer) => {
                    for e in 0..shared {
                        let value = self
                            .file
                            .layout()
                            .read_ptr(src, fm.offset + e * fm.elem_size)?;
                        let value = self
                            .file
                            .layout()
                            .convert_address(value, self.memory.layout().width);
                        self.memory
                            .layout()
                            .write_ptr(dst, mm.offset + e * mm.elem_size, value)?;
                    }
                }
                (MemberKind::Struct(fsub), MemberKind::Struct(msub)) => {
                    if fm.type_name != mm.type_name {
                        continue;
                    }
                    let flag = self.reconciler.flag(fsub);
                    for e in 0..shared {
                        let s = fm.offset + e * fm.elem_size;
                        let d = mm.offset + e * mm.elem_size;
                        self.convert_struct(
                            flag,
                            fsub,
                            msub,
                            &src[s..s + fm.elem_size],
                            &mut dst[d..d + mm.elem_size],
                        )?;
                    }
                }
                (MemberKind::Opaque, MemberKind::Opaque) => {
                    if fm.type_name == mm.type_name && fm.elem_size == mm.elem_size {
                        let n = shared * mm.elem_size;
                        dst[mm.offset..mm.offset + n].copy_from_slice(&src[fm.offset..fm.offset + n]);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn convert_primitive(&self, from: Primitive, to: Primitive, src: &[u8], dst: &mut [u8]) {
        let file_endian = self.file.layout().endian;
        let memory_endian = self.memory.layout().endian;
        if from == to {
            dst.copy_from_slice(src);
            if file_endian != memory_endian {
                dst.reverse();
            }
            return;
        }
        let (int, float) = decode_number(from, src, file_endian);
        let float = if from.is_char() && to.is_float() {
            float / 255.0
        } else {
            float
        };
        encode_number(to, int, float, dst, memory_endian);
    }
}

fn ordered<const N: usize>(src: &[u8], endian: Endian) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&src[..N]);
    if endian == Endian::Big {
        bytes.reverse();
    }
    bytes
}

/// Reads a scalar as (wrapping integer, float) pair.
fn decode_number(prim: Primitive, src: &[u8], endian: Endian) -> (u64, f64) {
    match prim {
        Primitive::Char | Primitive::Int8 => {
            let v = src[0] as i8;
            (v as i64 as u64, f64::from(v))
        }
        Primitive::UChar => (u64::from(src[0]), f64::from(src[0])),
        Primitive::Short => {
            let v = i16::from_le_bytes(ordered(src, endian));
            (v as i64 as u64, f64::from(v))
        }
        Primitive::UShort => {
            let v = u16::from_le_bytes(ordered(src, endian));
            (u64::from(v), f64::from(v))
        }
        Primitive::Int => {
            let v = i32::from_le_bytes(ordered(src, endian));
            (v as i64 as u64, f64::from(v))
        }
        Primitive::UInt => {
            let v = u32::from_le_bytes(ordered(src, endian));
            (u64::from(v), f64::from(v))
        }
        Primitive::Float => {
            let v = f32::from_le_bytes(ordered(src, endian));
            (v as i64 as u64, f64::from(v))
        }
        Primitive::Double => {
            let v = f64::from_le_bytes(ordered(src, endian));
            (v as i64 as u64, v)
        }
        Primitive::Int64 => {
            let v = i64::from_le_bytes(ordered(src, endian));
            (v as u64, v as f64)
        }
        Primitive::UInt64 => {
            let v = u64::from_le_bytes(ordered(src, endian));
            (v, v as f64)
        }
    }
}

fn encode_number(prim: Primitive, int: u64, float: f64, dst: &mut [u8], endian: Endian) {
    let mut le: Vec<u8> = match prim {
        Primitive::Char | Primitive::Int8 | Primitive::UChar => vec![int as u8],
        Primitive::Short | Primitive::UShort => (int as u16).to_le_bytes().to_vec(),
        Primitive::Int | Primitive::UInt => (int as u32).to_le_bytes().to_vec(),
        Primitive::Float => (float as f32).to_le_bytes().to_vec(),
        Primitive::Double => float.to_le_bytes().to_vec(),
        Primitive::Int64 | Primitive::UInt64 => int.to_le_bytes().to_vec(),
    };
    if endian == Endian::Big {
        le.reverse();
    }
    let n = le.len().min(dst.len());
    dst[..n].copy_from_slice(&le[..n]);
}

/// Reverses the byte order of every multi-byte member, recursing into embedded structs.
pub(crate) fn swap_struct(catalog: &Catalog, index: usize, data: &mut [u8]) {
    let Some(info) = catalog.struct_info(index) else {
        return;
    };
    for member in &info.members {
        swap_member(catalog, member, data);
    }
}

fn swap_member(catalog: &Catalog, member: &MemberInfo, data: &mut [u8]) {
    for e in 0..member.array_len {
        let start = member.offset + e * member.elem_size;
        let end = start + member.elem_size;
        let Some(slot) = data.get_mut(start..end) else {
            return;
        };
        match member.kind {
            MemberKind::Primitive(_) | MemberKind::Pointer => slot.reverse(),
            MemberKind::Struct(sub) => swap_struct(catalog, sub, slot),
            MemberKind::Opaque => {}
        }
    }
}
