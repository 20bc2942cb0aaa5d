#![no_main]

#[macro_use]
extern crate libfuzzer_sys;
extern crate ftpc_engine;

use ftpc_engine::reply::ReplyAssembler;

fuzz_target!(|data: &[u8]| {
    let mut assembler = ReplyAssembler::new();
    let _ = assembler.feed(data);
});
