#![no_main]
use libfuzzer_sys::fuzz_target;

use stublink::il::{BranchForm, IlCodeLabel, IlStubLinker, IlStubOptions, StreamKind};

const KINDS: [StreamKind; 4] = [
    StreamKind::Setup,
    StreamKind::Marshal,
    StreamKind::Dispatch,
    StreamKind::Cleanup,
];

fuzz_target!(|data: &[u8]| {
    // Drive the IL linker with arbitrary streams, labels, branches and
    // exception blocks. Every defect must come back as an error.
    let form = if data.first().map_or(false, |b| b & 1 == 1) {
        BranchForm::Relaxed
    } else {
        BranchForm::Long
    };
    let mut il = IlStubLinker::new(IlStubOptions {
        branch_form: form,
        ..IlStubOptions::default()
    });
    let streams: Vec<_> = KINDS.iter().map(|&k| il.new_code_stream(k)).collect();
    let mut labels: Vec<IlCodeLabel> = Vec::new();

    let mut bytes = data.iter().copied().skip(1);
    while let Some(op) = bytes.next() {
        let arg = bytes.next().unwrap_or(0);
        let s = streams[(op >> 6) as usize];
        match op % 12 {
            0 => {
                il.stream(s).emit_ldc(i32::from(arg as i8) * 1000);
            }
            1 => {
                il.stream(s).emit_pop();
            }
            2 => {
                il.stream(s).emit_add();
            }
            3 => labels.push(il.new_code_label()),
            4 => {
                if let Some(&label) = labels.get(arg as usize % labels.len().max(1)) {
                    il.stream(s).emit_label(label);
                }
            }
            5 => {
                if let Some(&label) = labels.get(arg as usize % labels.len().max(1)) {
                    il.stream(s).emit_br(label);
                }
            }
            6 => {
                if let Some(&label) = labels.get(arg as usize % labels.len().max(1)) {
                    il.stream(s).emit_brtrue(label);
                }
            }
            7 => {
                let targets: Vec<_> = labels.iter().copied().take(arg as usize % 8).collect();
                il.stream(s).emit_switch(&targets);
            }
            8 => {
                il.stream(s).emit_ldarg(u16::from(arg)).emit_ldloc(u16::from(arg) << 1);
            }
            9 => {
                il.stream(s).begin_try_block();
            }
            10 => {
                let stream = il.stream(s);
                let _ = match arg % 4 {
                    0 => stream.end_try_block().map(|_| ()),
                    1 => stream.begin_finally_block().map(|_| ()),
                    2 => stream.end_finally_block().map(|_| ()),
                    _ => stream.begin_catch_block(0x0200_0001).map(|_| ()),
                };
            }
            _ => {
                il.stream(s).emit_nop();
            }
        }
    }
    il.stream(streams[3]).emit_ret();
    if let Ok(stub) = il.build() {
        let _ = stub.method_body(0);
    }
});
