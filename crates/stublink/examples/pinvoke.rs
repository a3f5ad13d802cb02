//! IL stub example: a platform-invoke style marshaling stub built from
//! several code streams, with a finally block around the native call.
//!
//! Run with: `cargo run --example pinvoke`

use stublink::il::{
    CallingConvention, ElementType, FunctionSigBuilder, IlStubOptions, SigType, StreamKind,
    TokenKind,
};
use stublink::IlStubLinker;

fn main() -> Result<(), stublink::LinkError> {
    println!("=== stublink pinvoke example ===\n");

    let mut il = IlStubLinker::new(IlStubOptions {
        returns_value: true,
        ..IlStubOptions::default()
    });
    let setup = il.new_code_stream(StreamKind::Setup);
    let marshal = il.new_code_stream(StreamKind::Marshal);
    let dispatch = il.new_code_stream(StreamKind::Dispatch);
    let unmarshal = il.new_code_stream(StreamKind::ReturnUnmarshal);

    // int native(byte* buffer, int length)
    let buffer = il.new_local(SigType::ptr(ElementType::U1))?;
    let result = il.new_local(ElementType::I4)?;
    let pinned = il.new_local(SigType::pinned(SigType::by_ref(ElementType::U1)))?;

    let mut sig = FunctionSigBuilder::new(CallingConvention::StdCall);
    sig.set_return_type(ElementType::I4);
    sig.new_arg(SigType::ptr(ElementType::U1));
    sig.new_arg(ElementType::I4);
    let sig_blob = sig.build()?;
    let sig_token = il.get_token(TokenKind::Signature, 1)?;
    let target = il.get_token(TokenKind::Field, 0x7FFF_0000)?;

    il.stream(setup).emit_ldc(0).emit_stloc(result);

    let null = il.new_code_label();
    let pinned_done = il.new_code_label();
    il.stream(marshal)
        .emit_ldarg(0)
        .emit_dup()
        .emit_stloc(pinned)
        .emit_brfalse(null)
        .emit_ldloc(pinned)
        .emit_conv_i()
        .emit_stloc(buffer)
        .emit_br(pinned_done)
        .emit_label(null)
        .emit_ldc(0)
        .emit_conv_i()
        .emit_stloc(buffer)
        .emit_label(pinned_done);

    let done = il.new_code_label();
    let stream = il.stream(dispatch);
    stream.begin_try_block();
    stream
        .emit_ldloc(buffer)
        .emit_ldarg(1)
        .emit_ldsfld(target)
        .emit_calli(sig_token, 2, 1)
        .emit_stloc(result)
        .emit_leave(done);
    stream.end_try_block()?;
    stream.begin_finally_block()?;
    stream.emit_ldc(0).emit_conv_u().emit_stloc(pinned).emit_endfinally();
    stream.end_finally_block()?;
    stream.emit_label(done);

    il.stream(unmarshal).emit_ldloc(result).emit_ret();

    let stub = il.build()?;
    println!("{}", stub.listing());
    println!("max stack:       {}", stub.max_stack());
    println!("code size:       {}", stub.code().len());
    println!("calli signature: {:02X?}", sig_blob);
    println!("local signature: {:02X?}", stub.local_signature());
    for clause in stub.eh_clauses() {
        println!("clause:          {:?}", clause);
    }
    // StandAloneSig token the caller registered for the locals blob.
    let body = stub.method_body(0x1100_0002)?;
    println!("method body:     {} bytes", body.len());
    Ok(())
}
