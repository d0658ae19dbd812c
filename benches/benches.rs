use criterion::{criterion_group, criterion_main};


criterion_group!(benches, merkle::map, crypto::sigs, harness::chain);
criterion_main!(benches);
