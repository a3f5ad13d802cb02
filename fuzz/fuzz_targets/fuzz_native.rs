#![no_main]
use libfuzzer_sys::fuzz_target;

use stublink::x86::{CALL64, JCC64, JMP64, LOAD_ADDRESS64};
use stublink::{CodeLabel, StubLinker};

fuzz_target!(|data: &[u8]| {
    // Interpret the input as a little program for the native linker.
    // Linking must never panic, only return Ok/Err.
    let mut sl = StubLinker::new();
    let mut labels: Vec<CodeLabel> = Vec::new();
    let mut bytes = data.iter().copied();
    while let Some(op) = bytes.next() {
        let arg = bytes.next().unwrap_or(0);
        match op % 8 {
            0 => {
                sl.emit8(arg);
            }
            1 => {
                sl.emit_bytes(&vec![0x90; arg as usize]);
            }
            2 => labels.push(sl.new_code_label()),
            3 => {
                if let Some(&label) = labels.get(arg as usize % labels.len().max(1)) {
                    let _ = sl.emit_label(label);
                }
            }
            4 => {
                let address = u64::from(arg) << (op >> 3);
                labels.push(sl.new_external_code_label(address));
            }
            5 => {
                if let Some(&label) = labels.get(arg as usize % labels.len().max(1)) {
                    sl.emit_label_ref(label, &JCC64, u32::from(op >> 4));
                }
            }
            6 => {
                if let Some(&label) = labels.get(arg as usize % labels.len().max(1)) {
                    if op & 0x80 == 0 {
                        sl.emit_label_ref(label, &JMP64, 0);
                    } else {
                        sl.emit_label_ref(label, &CALL64, 0);
                    }
                }
            }
            _ => {
                if let Some(&label) = labels.get(arg as usize % labels.len().max(1)) {
                    sl.emit_label_ref(label, &LOAD_ADDRESS64, u32::from(op >> 4));
                }
            }
        }
    }
    let _ = sl.link_at(0x40_0000);
});
