//! Native thunk example: an argument-shuffling trampoline and a
//! dispatch table whose branches relax to their shortest forms.
//!
//! Run with: `cargo run --example thunk`

use std::sync::Arc;

use stublink::x86::{cond, JCC64, JMP64, LOAD_ADDRESS64};
use stublink::{BumpHeap, StubFlags, StubLinker};

fn main() -> Result<(), stublink::LinkError> {
    println!("=== stublink thunk example ===\n");
    let heap = Arc::new(BumpHeap::new(0x7F00_0000_0000, 0x1_0000));

    // --- Shuffle thunk ---
    println!("1. Shuffle thunk (drop the first argument, tail-call the target):");
    let mut sl = StubLinker::new();
    let target = sl.new_external_code_label(0x7FFF_DEAD_0000);
    sl.emit_bytes(&[0x48, 0x89, 0xF7]); // mov rdi, rsi
    sl.emit_bytes(&[0x48, 0x89, 0xD6]); // mov rsi, rdx
    sl.emit_label_ref(target, &JMP64, 0);
    let thunk = sl.link(heap.clone(), StubFlags::SHUFFLE_THUNK)?;
    println!("   entry point 0x{:X}", thunk.entry_point());
    print_hex("   ", thunk.code());

    // --- Dispatch table ---
    println!("\n2. Dispatch on eax (short branches, embedded data):");
    let mut sl = StubLinker::new();
    let table = sl.new_code_label();
    let small = sl.new_code_label();
    sl.emit_bytes(&[0x83, 0xF8, 0x10]); // cmp eax, 16
    sl.emit_label_ref(small, &JCC64, cond::B);
    sl.emit_label_ref(table, &LOAD_ADDRESS64, 0); // lea rax, [rip+table]
    sl.emit8(0xC3);
    sl.emit_label(small)?;
    sl.emit_bytes(&[0x31, 0xC0, 0xC3]); // xor eax, eax; ret
    sl.emit_label(table)?;
    for i in 0..4u64 {
        sl.emit64(0x1000 * i);
    }
    let layout = sl.calculate_size()?;
    println!(
        "   {} bytes of code in {} pass(es), widths {:?}",
        layout.code_size,
        layout.passes,
        sl.ref_sizes()
    );
    let stub = sl.emit_stub(heap.clone(), StubFlags::NONE)?;
    print_hex("   ", stub.code());
    for fixup in stub.fixups() {
        println!(
            "   fixup at +{:<3} {:>3}  value {:#x}",
            fixup.offset, fixup.size, fixup.value
        );
    }

    println!("\n   heap: {} live bytes", heap.live_bytes());
    drop(thunk);
    drop(stub);
    println!("   heap: {} live bytes after release", heap.live_bytes());
    Ok(())
}

fn print_hex(prefix: &str, bytes: &[u8]) {
    for chunk in bytes.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
        println!("{}{}", prefix, hex.join(" "));
    }
}
