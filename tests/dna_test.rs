#![allow(missing_docs)]

mod common;

use blendloader::dna::{
    self, Catalog, CatalogBuilder, DnaStruct, IdHeader, MemberKind, StructFlag, StructView,
    StructViewMut, builtin_catalog,
};
use blendloader::format::{Endian, Layout, PointerWidth};
use blendloader::{LoaderError, Result};
use common::*;

fn index(catalog: &Catalog, name: &str) -> Result<usize> {
    catalog
        .struct_index(name)
        .ok_or_else(|| LoaderError::Dna(format!("{name} not declared")))
}

#[test]
fn test_catalog_survives_encoding() -> Result<()> {
    for layout in [
        Layout::native(),
        Layout::new(PointerWidth::Width32, Endian::Big),
    ] {
        let catalog = catalog(layout)?;
        let parsed = Catalog::parse(&catalog.encode(), layout)?;
        assert_eq!(parsed.struct_count(), catalog.struct_count());
        for info in catalog.structs() {
            let other = parsed.struct_info_by_name(&info.name).ok_or_else(|| {
                LoaderError::Dna(format!("{} lost in encoding", info.name))
            })?;
            assert_eq!(other.size, info.size, "{}", info.name);
            let offsets: Vec<_> = info.members.iter().map(|m| (&m.name, m.offset)).collect();
            let parsed_offsets: Vec<_> = other.members.iter().map(|m| (&m.name, m.offset)).collect();
            assert_eq!(offsets, parsed_offsets);
        }
    }
    Ok(())
}

#[test]
fn test_derived_layout() -> Result<()> {
    let catalog = native_catalog()?;
    let info = catalog.struct_info_by_name("Object").ok_or_else(|| LoaderError::Dna("Object".into()))?;

    let id = info.member("id").ok_or_else(|| LoaderError::Dna("id".into()))?;
    assert_eq!(id.offset, 0);
    assert!(matches!(id.kind, MemberKind::Struct(_)));
    assert_eq!(id.type_name, "ID");

    let data = info.member("data").ok_or_else(|| LoaderError::Dna("data".into()))?;
    assert_eq!(data.pointee(), Some("Mesh"));
    assert_eq!(data.name, "*data");

    let loc = info.member("loc").ok_or_else(|| LoaderError::Dna("loc".into()))?;
    assert_eq!(loc.array_len, 3);
    assert_eq!(loc.elem_size, 4);
    assert_eq!(catalog.id_name_slot().map(|(_, len)| len), Some(66));
    Ok(())
}

#[test]
fn test_struct_values_survive_every_layout() -> Result<()> {
    let value = Object {
        parent: 0x40,
        data: 0x1234,
        props: 0x88,
        loc: [0.5, -1.5, 3.25],
        layer: -7,
        ..object("Suzanne")
    };
    for layout in [
        Layout::native(),
        Layout::new(PointerWidth::Width32, Endian::Little),
        Layout::new(PointerWidth::Width64, Endian::Big),
    ] {
        let catalog = catalog(layout)?;
        let bytes = value.to_bytes(&catalog)?;
        let info = catalog.struct_info_by_name("Object").ok_or_else(|| LoaderError::Dna("Object".into()))?;
        assert_eq!(bytes.len(), info.size);
        assert_eq!(Object::from_bytes(&catalog, &bytes)?, value, "{layout:?}");
    }
    Ok(())
}

#[test]
fn test_views_read_and_write_members() -> Result<()> {
    let catalog = native_catalog()?;
    let mut bytes = material("Red", 0.75).to_bytes(&catalog)?;
    {
        let view = StructView::new(&catalog, "Material", &bytes)?;
        assert_eq!(view.get::<f32>("r")?, 0.75);
        assert_eq!(view.substruct("id")?.string("name")?, "MARed");
        assert!(view.has("g"));
        assert!(!view.has("alpha"));
        assert!(view.get::<f32>("alpha").is_err());
    }
    {
        let mut view = StructViewMut::new(&catalog, "Material", &mut bytes)?;
        view.set("g", 0.125f32)?;
        view.substruct_mut("id")?.set_string("name", "MAGreen")?;
    }
    let material = Material::from_bytes(&catalog, &bytes)?;
    assert_eq!(material.g, 0.125);
    assert_eq!(material.id.name, "MAGreen");

    let header = IdHeader::from_bytes(&catalog, &bytes[..catalog.struct_info_by_name("ID").map_or(0, |s| s.size)])?;
    assert_eq!(header.name, "MAGreen");
    Ok(())
}

#[test]
fn test_reconciling_a_catalog_with_itself() -> Result<()> {
    let catalog = native_catalog()?;
    let reconciler = dna::reconcile(&catalog, &catalog);
    assert_eq!(reconciler.count(StructFlag::Equal), catalog.struct_count());
    assert!(!reconciler.swaps_endian());

    let bytes = object("Cube").to_bytes(&catalog)?;
    let doubled = [bytes.clone(), bytes.clone()].concat();
    let rebuilt = reconciler.reconstruct(&catalog, &catalog, index(&catalog, "Object")?, &doubled, 2)?;
    assert_eq!(rebuilt, Some(doubled));
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Material")]
struct MaterialV0 {
    id: IdHeader,
    r: f64,
    b: f32,
    #[dna(rename = "g")]
    green: i16,
}

#[derive(Debug, Clone, Default, PartialEq, DnaStruct)]
#[dna(name = "Lamp")]
struct Lamp {
    id: IdHeader,
    energy: f32,
}

#[test]
fn test_changed_members_are_converted() -> Result<()> {
    let memory = native_catalog()?;
    let mut file = builtin_catalog(Layout::new(PointerWidth::Width32, Endian::Big))?;
    file.define::<MaterialV0>()?.define::<Lamp>()?;
    let file = file.build()?;

    let reconciler = dna::reconcile(&file, &memory);
    let material_index = index(&file, "Material")?;
    let lamp_index = index(&file, "Lamp")?;
    assert_eq!(reconciler.flag(material_index), StructFlag::Unequal);
    assert_eq!(reconciler.flag(lamp_index), StructFlag::Removed);
    assert_eq!(reconciler.flag(index(&file, "ID")?), StructFlag::Unequal);
    assert!(reconciler.swaps_endian());

    let old = MaterialV0 {
        id: IdHeader {
            session_uid: 17,
            ..header(MA, "Old")
        },
        r: 0.5,
        b: 0.75,
        green: 3,
    };
    let raw = old.to_bytes(&file)?;
    let rebuilt = reconciler
        .reconstruct(&file, &memory, material_index, &raw, 1)?
        .ok_or_else(|| LoaderError::Dna("Material dropped".into()))?;
    let material = Material::from_bytes(&memory, &rebuilt)?;
    assert_eq!(material.r, 0.5);
    assert_eq!(material.g, 3.0);
    assert_eq!(material.b, 0.75);
    assert_eq!(material.id.name, "MAOld");
    assert_eq!(material.id.session_uid, 17);

    let lamp = Lamp::default().to_bytes(&file)?;
    assert_eq!(reconciler.reconstruct(&file, &memory, lamp_index, &lamp, 1)?, None);
    Ok(())
}

#[test]
fn test_short_records_are_corrupt() -> Result<()> {
    let catalog = native_catalog()?;
    let reconciler = dna::reconcile(&catalog, &catalog);
    let bytes = object("Cube").to_bytes(&catalog)?;
    let err = reconciler.reconstruct(&catalog, &catalog, index(&catalog, "Object")?, &bytes, 2);
    assert!(matches!(err, Err(LoaderError::Corrupt(_))), "{err:?}");
    Ok(())
}

type RawStructDef<'a> = (i16, &'a [(i16, i16)]);

/// Encodes a struct table by hand, little-endian with 8-byte pointers. Type 1 must be a
/// `ListBase` of two pointers.
fn raw_table(names: &[&str], types: &[(&str, i16)], structs: &[RawStructDef<'_>]) -> Vec<u8> {
    let layout = Layout::new(PointerWidth::Width64, Endian::Little);
    let pad = |out: &mut Vec<u8>| {
        while out.len() % 4 != 0 {
            out.push(0);
        }
    };
    let mut out = b"SDNA".to_vec();
    out.extend_from_slice(b"NAME");
    layout.put_i32(&mut out, names.len() as i32);
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    pad(&mut out);
    out.extend_from_slice(b"TYPE");
    layout.put_i32(&mut out, types.len() as i32);
    for (ty, _) in types {
        out.extend_from_slice(ty.as_bytes());
        out.push(0);
    }
    pad(&mut out);
    out.extend_from_slice(b"TLEN");
    for (_, size) in types {
        layout.put_i16(&mut out, *size);
    }
    pad(&mut out);
    out.extend_from_slice(b"STRC");
    layout.put_i32(&mut out, structs.len() as i32);
    for (ty, members) in structs {
        layout.put_i16(&mut out, *ty);
        layout.put_i16(&mut out, members.len() as i16);
        for (t, n) in *members {
            layout.put_i16(&mut out, *t);
            layout.put_i16(&mut out, *n);
        }
    }
    out
}

const LIST_BASE: RawStructDef<'static> = (1, &[(0, 0), (0, 1)]);

fn parse_raw(table: &[u8]) -> Result<Catalog> {
    Catalog::parse(table, Layout::new(PointerWidth::Width64, Endian::Little))
}

/// Rewrites the `TLEN` entry of `struct_name` in an encoded table starting at `dna`.
fn patch_type_size(bytes: &mut [u8], dna: usize, catalog: &Catalog, struct_name: &str, size: i16) -> Result<()> {
    let type_index = catalog
        .struct_info_by_name(struct_name)
        .map(|s| s.type_index)
        .ok_or_else(|| LoaderError::Dna(format!("{struct_name} not declared")))?;
    let tlen = bytes[dna..]
        .windows(4)
        .position(|w| w == b"TLEN")
        .map(|p| dna + p + 4)
        .ok_or_else(|| LoaderError::Dna("no TLEN section".into()))?;
    let mut encoded = Vec::new();
    catalog.layout().put_i16(&mut encoded, size);
    let at = tlen + 2 * type_index;
    bytes[at..at + 2].copy_from_slice(&encoded);
    Ok(())
}

#[test]
fn test_members_must_fit_the_declared_size() -> Result<()> {
    let names = ["*first", "*last", "x", "y"];
    let point: RawStructDef<'_> = (3, &[(2, 2), (2, 3)]);
    let fits = raw_table(&names, &[("void", 0), ("ListBase", 16), ("float", 4), ("Point", 8)], &[LIST_BASE, point]);
    assert_eq!(parse_raw(&fits)?.struct_info_by_name("Point").map(|s| s.size), Some(8));

    let short = raw_table(&names, &[("void", 0), ("ListBase", 16), ("float", 4), ("Point", 4)], &[LIST_BASE, point]);
    match parse_raw(&short) {
        Err(LoaderError::Dna(msg)) => assert!(msg.contains("overruns"), "{msg}"),
        other => panic!("expected a struct table error, got {other:?}"),
    }

    // The same damage in a real table, shrinking an entity struct below its header.
    let catalog = native_catalog()?;
    let mut encoded = catalog.encode();
    patch_type_size(&mut encoded, 0, &catalog, "Material", 4)?;
    let err = Catalog::parse(&encoded, catalog.layout());
    assert!(matches!(err, Err(LoaderError::Dna(_))), "{err:?}");
    Ok(())
}

#[test]
fn test_damaged_struct_table_fails_the_load() -> Result<()> {
    let catalog = native_catalog()?;
    let mut bytes = scene_file(&catalog)?;
    let dna = bytes
        .windows(4)
        .rposition(|w| w == b"SDNA")
        .ok_or_else(|| LoaderError::Dna("no struct table".into()))?;
    patch_type_size(&mut bytes, dna, &catalog, "Material", 4)?;
    let err = loader()?.load_memory(bytes);
    assert!(matches!(err, Err(LoaderError::Dna(_))), "{err:?}");
    Ok(())
}

#[test]
fn test_structs_embedding_themselves_are_rejected() -> Result<()> {
    // Node { Node inner; }
    let direct = raw_table(
        &["*first", "*last", "inner"],
        &[("void", 0), ("ListBase", 16), ("Node", 8)],
        &[LIST_BASE, (2, &[(2, 2)])],
    );
    match parse_raw(&direct) {
        Err(LoaderError::Dna(msg)) => assert!(msg.contains("embeds itself"), "{msg}"),
        other => panic!("expected a struct table error, got {other:?}"),
    }

    // Node { Pair pair; }  Pair { Node node; }
    let indirect = raw_table(
        &["*first", "*last", "pair", "node"],
        &[("void", 0), ("ListBase", 16), ("Node", 8), ("Pair", 8)],
        &[LIST_BASE, (2, &[(3, 2)]), (3, &[(2, 3)])],
    );
    match parse_raw(&indirect) {
        Err(LoaderError::Dna(msg)) => assert!(msg.contains("embeds itself"), "{msg}"),
        other => panic!("expected a struct table error, got {other:?}"),
    }

    // Pointers to the own type are fine.
    let linked = raw_table(
        &["*first", "*last", "*next", "value"],
        &[("void", 0), ("ListBase", 16), ("Node", 16), ("int", 4)],
        &[LIST_BASE, (2, &[(2, 2), (3, 3)])],
    );
    assert!(parse_raw(&linked)?.struct_info_by_name("Node").is_some());
    Ok(())
}

#[test]
fn test_oversized_members_are_rejected() -> Result<()> {
    let mut builder = CatalogBuilder::new(Layout::native());
    let huge = builder.add_struct("Huge", &[("char".into(), "a[100000000000][100000000000]".into())]);
    assert!(matches!(huge, Err(LoaderError::Dna(_))), "{huge:?}");

    let wide = builder.add_struct("Wide", &[("char".into(), "a[70000]".into())]);
    assert!(matches!(wide, Err(LoaderError::Dna(_))), "{wide:?}");

    let fits = builder.add_struct("Small", &[("char".into(), "a[16]".into())]);
    assert!(fits.is_ok(), "{fits:?}");
    Ok(())
}
