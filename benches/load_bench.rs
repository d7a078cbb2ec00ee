#![allow(missing_docs)]

use blendloader::dna::{DnaStruct, FileGlobalStruct, IdHeader, builtin_catalog};
use blendloader::format::{BlockCode, IdCode, Layout};
use blendloader::writer::BlockWriter;
use blendloader::{GenericKind, Loader};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

const OB: IdCode = IdCode::new(*b"OB");
const ME: IdCode = IdCode::new(*b"ME");

#[derive(Debug, Default, DnaStruct)]
#[dna(name = "Object")]
struct Object {
    id: IdHeader,
    #[dna(pointer = "Mesh")]
    data: u64,
    #[dna(pointer = "Object")]
    parent: u64,
    loc: [f32; 3],
}

#[derive(Debug, Default, DnaStruct)]
#[dna(name = "Mesh")]
struct Mesh {
    id: IdHeader,
    #[dna(pointer)]
    verts: u64,
    totvert: i32,
}

fn loader() -> Loader {
    Loader::builder()
        .define::<Object>()
        .define::<Mesh>()
        .kind(GenericKind::new(OB, "object", "Object"))
        .kind(GenericKind::new(ME, "mesh", "Mesh"))
        .build()
        .expect("Failed to build loader")
}

/// `count` objects, each with a mesh owning a vertex buffer, chained by parent.
fn fixture(count: u64) -> Vec<u8> {
    let mut catalog = builtin_catalog(Layout::native()).expect("Failed to start catalog");
    catalog
        .define::<Object>()
        .and_then(|c| c.define::<Mesh>())
        .expect("Failed to declare structs");
    let catalog = catalog.build().expect("Failed to build catalog");

    let mut w = BlockWriter::new(&catalog, 405);
    w.write_struct(BlockCode::GLOB, 0, &FileGlobalStruct::default())
        .expect("Failed to write global block");
    for i in 0..count {
        let base = 0x1_0000 + i * 0x40;
        let object = Object {
            id: IdHeader {
                name: format!("OBObject{i}"),
                ..IdHeader::default()
            },
            data: base + 0x10,
            parent: if i == 0 { 0 } else { base - 0x40 },
            loc: [i as f32, 0.0, 0.0],
        };
        let mesh = Mesh {
            id: IdHeader {
                name: format!("MEMesh{i}"),
                ..IdHeader::default()
            },
            verts: base + 0x20,
            totvert: 256,
        };
        w.write_struct(BlockCode::entity(OB), base, &object)
            .expect("Failed to write object");
        w.write_struct(BlockCode::entity(ME), base + 0x10, &mesh)
            .expect("Failed to write mesh");
        w.write_raw(BlockCode::DATA, base + 0x20, &[0u8; 256 * 12])
            .expect("Failed to write vertices");
    }
    w.finish()
}

fn bench_load(c: &mut Criterion) {
    let loader = loader();
    let bytes = fixture(2_000);

    let mut group = c.benchmark_group("Load");

    group.bench_function("load_memory", |b| {
        b.iter(|| {
            let blend = loader
                .load_memory(black_box(bytes.clone()))
                .expect("Failed to load");
            black_box(blend.graph.len());
        });
    });

    let blend = loader.load_memory(bytes.clone()).expect("Failed to load");
    group.bench_function("write_snapshot", |b| {
        b.iter(|| {
            let snapshot = loader.write_snapshot(&blend, None).expect("Failed to write");
            black_box(snapshot.len());
        });
    });

    // Every block identical: the restore hands entities over without decoding.
    let first = loader.write_snapshot(&blend, None).expect("Failed to write");
    let second = loader
        .write_snapshot(&blend, Some(&first))
        .expect("Failed to write");
    group.bench_function("restore_unchanged", |b| {
        b.iter_batched(
            || loader.load_memory(bytes.clone()).expect("Failed to load"),
            |previous| {
                let restored = loader
                    .restore_undo(previous, &second)
                    .expect("Failed to restore");
                black_box(restored.graph.len());
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_load);
criterion_main!(benches);
