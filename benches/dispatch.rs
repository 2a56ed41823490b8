//! Benchmarks for exception dispatch.
//!
//! - Clause table decoding
//! - Single-frame first pass against a typed catch
//! - Full two-pass dispatch through a stack of frames with finallies

extern crate eeruntime;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use eeruntime::prelude::*;
use std::hint::black_box;

const IMAGE_BASE: u64 = 0x20_0000;
const CLAUSE_BASE: u64 = 0x30_0000;
const THROWN: ObjectRef = ObjectRef::new(0x5000_0000);

/// Callbacks whose funclets do nothing.
struct NoopCallbacks {
    exception_type: u64,
}

impl ExceptionCallbacks for NoopCallbacks {
    fn exception_type(&self, _exception: ObjectRef) -> Result<u64> {
        Ok(self.exception_type)
    }

    fn call_filter_funclet(
        &mut self,
        _exception: ObjectRef,
        _filter: u64,
        _shadow_stack: u64,
    ) -> Result<bool> {
        Ok(false)
    }

    fn call_finally_funclet(&mut self, _handler: u64, _shadow_stack: u64) -> Result<()> {
        Ok(())
    }
}

/// Descriptors for object and one exception type, and the address of the exception type.
fn universe() -> (AddressSpace, u64, u64) {
    let mut memory = AddressSpace::new(TargetLayout::native64());
    let image = memory
        .map_region(IMAGE_BASE, 0x1000, RegionKind::Image)
        .unwrap();
    let object = TypeDescriptorBuilder::new()
        .base_size(24)
        .build(&mut memory, image)
        .unwrap();
    let exception = TypeDescriptorBuilder::new()
        .base_size(128)
        .base_type(object)
        .build(&mut memory, image)
        .unwrap();
    (memory, object, exception)
}

/// Nested try/finally blocks around offset 0x180.
fn finally_table(depth: u32) -> ClauseTableBuilder {
    let mut table = ClauseTableBuilder::new();
    for level in 0..depth {
        table.push(EHClause::fault(
            0x100 - level * 0x10,
            0x200 + level * 0x10,
            0x400 + level * 0x10,
        ));
    }
    table
}

/// The finally blocks of [`finally_table`] inside a catch of `catch_type`.
fn method_table(depth: u32, catch_type: u64) -> ClauseTableBuilder {
    finally_table(depth).clause(EHClause::typed(0x00, 0x800, 0x900, catch_type as u32, 0))
}

/// Benchmark decoding a clause table.
fn bench_clause_decoding(c: &mut Criterion) {
    let table = method_table(8, 0x20_0000).encode();

    c.bench_function("clause_decode_9", |b| {
        b.iter(|| {
            EHClauseIterator::new(black_box(&table))
                .unwrap()
                .map(|clause| clause.unwrap().try_end_offset)
                .sum::<u32>()
        });
    });
}

/// Benchmark the first pass of one frame.
fn bench_first_pass(c: &mut Criterion) {
    let (memory, object, exception) = universe();
    let table = method_table(8, object).encode();
    let mut callbacks = NoopCallbacks {
        exception_type: exception,
    };

    c.bench_function("first_pass_frame", |b| {
        b.iter(|| {
            find_first_pass_handler(
                &memory,
                &mut callbacks,
                THROWN,
                MAX_TRY_REGION_IDX,
                black_box(0x180),
                0,
                0x1000,
                EHClauseIterator::new(&table).unwrap(),
            )
            .unwrap()
        });
    });
}

/// Benchmark a full dispatch as the stack between throw and catch gets deeper.
fn bench_full_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_stack_depth");

    for frames in [1usize, 8, 32] {
        let (mut memory, object, exception) = universe();
        let finally_only = finally_table(2).encode();
        let catcher = method_table(2, object).encode();

        let size = finally_only.len() + catcher.len();
        let region = memory
            .map_region(CLAUSE_BASE, size, RegionKind::Image)
            .unwrap();
        let finally_address = memory.allocate(region, finally_only.len(), 1).unwrap();
        memory.write_bytes(finally_address, &finally_only).unwrap();
        let catch_address = memory.allocate(region, catcher.len(), 1).unwrap();
        memory.write_bytes(catch_address, &catcher).unwrap();

        let mut stack: Vec<FrameInfo> = (0..frames - 1)
            .map(|index| FrameInfo::new(0x10_0000 * (index as u64 + 1), 0x180, finally_address))
            .collect();
        stack.push(FrameInfo::new(0xF00_0000, 0x180, catch_address));

        group.bench_with_input(BenchmarkId::from_parameter(frames), &stack, |b, stack| {
            let mut dispatcher = ExceptionDispatcher::new(
                &memory,
                NoopCallbacks {
                    exception_type: exception,
                },
            );
            b.iter(|| {
                let mut walker = ShadowStackWalker::new(stack.clone());
                dispatcher
                    .dispatch(&mut walker, THROWN, MAX_TRY_REGION_IDX)
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_clause_decoding,
    bench_first_pass,
    bench_full_dispatch
);
criterion_main!(benches);
