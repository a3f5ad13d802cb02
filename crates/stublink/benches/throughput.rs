//! Performance benchmarks for `stublink`.
//!
//! Measures:
//! - Native thunk linking into a heap (short and relaxed layouts)
//! - Branch-heavy relaxation workloads (hundreds of labels)
//! - IL stub linking across several code streams
//!
//! Run with: `cargo bench`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use stublink::il::{BranchForm, IlStubLinker, IlStubOptions, StreamKind, TokenKind};
use stublink::x86::{cond, CALL64, JCC64, JMP64};
use stublink::{BumpHeap, StubFlags, StubLinker};

// ─── Native ─────────────────────────────────────────────────────────────────

fn shuffle_thunk(heap: &Arc<BumpHeap>) {
    let mut sl = StubLinker::new();
    let target = sl.new_external_code_label(0x7FFF_0000_1000);
    // mov rdi, rsi; mov rsi, rdx; jmp target
    sl.emit_bytes(&[0x48, 0x89, 0xF7, 0x48, 0x89, 0xD6]);
    sl.emit_label_ref(target, &JMP64, 0);
    let stub = sl
        .link(heap.clone(), StubFlags::SHUFFLE_THUNK)
        .expect("link");
    black_box(stub.entry_point());
}

fn bench_native(c: &mut Criterion) {
    let mut group = c.benchmark_group("native");
    // Big enough that the bump heap never runs out during a run.
    let heap = Arc::new(BumpHeap::new(0x1000_0000, 1 << 40));

    group.bench_function("shuffle_thunk", |b| b.iter(|| shuffle_thunk(&heap)));

    group.bench_function("dispatch_chain_64", |b| {
        b.iter(|| {
            let mut sl = StubLinker::new();
            let fail = sl.new_code_label();
            for i in 0..64u32 {
                // cmp eax, imm32; je target_i
                sl.emit8(0x3D).emit32(i);
                let target = sl.new_external_code_label(0x7FFF_0000_0000 + u64::from(i) * 0x40);
                sl.emit_label_ref(target, &JCC64, cond::E);
            }
            sl.emit_label_ref(fail, &JMP64, 0);
            sl.emit_label(fail).expect("bind");
            let callee = sl.new_external_code_label(0x7FFF_FFFF_0000);
            sl.emit_label_ref(callee, &CALL64, 0);
            sl.emit8(0xC3);
            black_box(sl.link(heap.clone(), StubFlags::NONE).expect("link"))
        })
    });

    group.finish();
}

// ─── Relaxation ─────────────────────────────────────────────────────────────

fn relaxation_workload(branches: usize) -> StubLinker<'static> {
    let mut sl = StubLinker::new();
    let labels: Vec<_> = (0..branches).map(|_| sl.new_code_label()).collect();
    // Every branch jumps forward over half of the others, so widening one
    // pushes several more out of rel8 range.
    for (i, _) in labels.iter().enumerate() {
        let target = labels[(i + branches / 2) % branches];
        sl.emit_label_ref(target, &JMP64, 0);
        sl.emit_bytes(&[0x90; 3]);
    }
    for label in &labels {
        sl.emit_label(*label).expect("bind");
        sl.emit8(0x90);
    }
    sl
}

fn bench_relaxation(c: &mut Criterion) {
    let mut group = c.benchmark_group("relaxation");
    for branches in [16usize, 128, 512] {
        group.throughput(Throughput::Elements(branches as u64));
        group.bench_function(format!("jmp_{branches}"), |b| {
            b.iter(|| {
                let mut sl = relaxation_workload(black_box(branches));
                black_box(sl.calculate_size().expect("layout"))
            })
        });
    }
    group.finish();
}

// ─── IL ─────────────────────────────────────────────────────────────────────

fn pinvoke_stub(args: u16, form: BranchForm) -> IlStubLinker {
    let mut il = IlStubLinker::new(IlStubOptions {
        returns_value: true,
        branch_form: form,
        ..IlStubOptions::default()
    });
    let setup = il.new_code_stream(StreamKind::Setup);
    let marshal = il.new_code_stream(StreamKind::Marshal);
    let dispatch = il.new_code_stream(StreamKind::Dispatch);
    let unmarshal = il.new_code_stream(StreamKind::ReturnUnmarshal);

    let result = il.new_local(stublink::il::ElementType::I4).expect("local");
    let target = il.get_token(TokenKind::Method, 0x1234).expect("token");
    il.stream(setup).emit_ldc(0).emit_stloc(result);
    for arg in 0..args {
        let skip = il.new_code_label();
        il.stream(marshal)
            .emit_ldarg(arg)
            .emit_brfalse(skip)
            .emit_ldarg(arg)
            .emit_pop()
            .emit_label(skip);
    }
    for arg in 0..args {
        il.stream(dispatch).emit_ldarg(arg);
    }
    il.stream(dispatch)
        .emit_call(target, args, 1)
        .emit_stloc(result);
    il.stream(unmarshal).emit_ldloc(result).emit_ret();
    il
}

fn bench_il(c: &mut Criterion) {
    let mut group = c.benchmark_group("il");
    for args in [4u16, 32] {
        group.bench_function(format!("pinvoke_long_{args}"), |b| {
            b.iter(|| {
                let il = pinvoke_stub(black_box(args), BranchForm::Long);
                black_box(il.build().expect("build"))
            })
        });
        group.bench_function(format!("pinvoke_relaxed_{args}"), |b| {
            b.iter(|| {
                let il = pinvoke_stub(black_box(args), BranchForm::Relaxed);
                black_box(il.build().expect("build"))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_native, bench_relaxation, bench_il);
criterion_main!(benches);
