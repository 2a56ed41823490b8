//! Benchmarks for type descriptor decoding.
//!
//! Measures the hot paths compiled code hits through the runtime helpers:
//! - Header decoding of a descriptor
//! - Tail field lookups, with and without the offset cache
//! - Optional field scans
//! - Casting along a deep base chain

extern crate eeruntime;

use criterion::{criterion_group, criterion_main, Criterion};
use eeruntime::prelude::*;
use std::hint::black_box;

const IMAGE_BASE: u64 = 0x20_0000;

struct Fixture {
    memory: AddressSpace,
    object: u64,
    leaf: u64,
    nullable: u64,
}

/// A 16-deep class chain rooted at object, plus a nullable value type.
fn fixture(layout: TargetLayout) -> Fixture {
    let mut memory = AddressSpace::new(layout);
    let image = memory
        .map_region(IMAGE_BASE, 0x4000, RegionKind::Image)
        .unwrap();
    let pointer = layout.pointer_bytes();

    let object = TypeDescriptorBuilder::new()
        .base_size(3 * pointer)
        .build(&mut memory, image)
        .unwrap();
    let mut leaf = object;
    for depth in 0..16u32 {
        leaf = TypeDescriptorBuilder::new()
            .base_size(3 * pointer + depth * 8)
            .base_type(leaf)
            .finalizer(0x7_0000 + u64::from(depth))
            .rare_flags(EETypeRareFlags::HAS_CCTOR)
            .build(&mut memory, image)
            .unwrap();
    }
    let int32 = TypeDescriptorBuilder::new()
        .base_size(2 * pointer + 4)
        .value_type()
        .cor_element_type(CorElementType::I4)
        .build(&mut memory, image)
        .unwrap();
    let nullable = TypeDescriptorBuilder::new()
        .base_size(2 * pointer + 8)
        .nullable(int32, false)
        .optional_field(OptionalFieldTag::ValueTypeFieldPadding, 0)
        .optional_field(OptionalFieldTag::NullableValueOffset, 3)
        .build(&mut memory, image)
        .unwrap();

    Fixture {
        memory,
        object,
        leaf,
        nullable,
    }
}

/// Benchmark decoding a descriptor header.
fn bench_descriptor_header(c: &mut Criterion) {
    let fixture = fixture(TargetLayout::native64());

    c.bench_function("eetype_header", |b| {
        b.iter(|| {
            let descriptor = TypeDescriptor::new(&fixture.memory, black_box(fixture.leaf)).unwrap();
            black_box(descriptor.base_size())
        });
    });
}

/// Benchmark the finalizer lookup, whose offset depends on the tail layout.
fn bench_tail_field(c: &mut Criterion) {
    let fixture = fixture(TargetLayout::portable64());
    let cache = OffsetCache::new();

    let mut group = c.benchmark_group("eetype_tail_field");
    group.bench_function("direct", |b| {
        let descriptor = TypeDescriptor::new(&fixture.memory, fixture.leaf).unwrap();
        b.iter(|| black_box(descriptor.finalizer_code().unwrap()));
    });
    group.bench_function("cached", |b| {
        let descriptor = TypeDescriptor::new(&fixture.memory, fixture.leaf)
            .unwrap()
            .with_offset_cache(&cache);
        b.iter(|| black_box(descriptor.finalizer_code().unwrap()));
    });
    group.finish();
}

/// Benchmark optional field scans for a hit at the end of the blob and a miss.
fn bench_optional_fields(c: &mut Criterion) {
    let blob = OptionalFieldsBuilder::new()
        .field(OptionalFieldTag::RareFlags, 0x10)
        .field(OptionalFieldTag::DispatchMap, 0x1234)
        .field(OptionalFieldTag::ValueTypeFieldPadding, 4)
        .field(OptionalFieldTag::NullableValueOffset, 7)
        .encode();

    let mut group = c.benchmark_group("eetype_optional_fields");
    group.bench_function("last", |b| {
        b.iter(|| {
            get_inline_field(
                Some(black_box(&blob)),
                OptionalFieldTag::NullableValueOffset,
                0,
            )
            .unwrap()
        });
    });
    group.bench_function("missing", |b| {
        b.iter(|| {
            get_inline_field(
                Some(black_box(&blob)),
                OptionalFieldTag::ICastableIsInstSlot,
                0,
            )
            .unwrap()
        });
    });
    group.finish();
}

/// Benchmark the nullable value offset, which goes through the rare flags and the blob.
fn bench_nullable_offset(c: &mut Criterion) {
    let fixture = fixture(TargetLayout::native64());
    let nullable = TypeDescriptor::new(&fixture.memory, fixture.nullable).unwrap();

    c.bench_function("eetype_nullable_value_offset", |b| {
        b.iter(|| black_box(nullable.nullable_value_offset().unwrap()));
    });
}

/// Benchmark a cast that walks the full base chain.
fn bench_cast_deep_chain(c: &mut Criterion) {
    let fixture = fixture(TargetLayout::native64());
    let leaf = TypeDescriptor::new(&fixture.memory, fixture.leaf).unwrap();
    let object = TypeDescriptor::new(&fixture.memory, fixture.object).unwrap();

    c.bench_function("eetype_cast_deep_chain", |b| {
        b.iter(|| black_box(is_instance_of_class(black_box(&leaf), &object).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_descriptor_header,
    bench_tail_field,
    bench_optional_fields,
    bench_nullable_offset,
    bench_cast_deep_chain
);
criterion_main!(benches);
