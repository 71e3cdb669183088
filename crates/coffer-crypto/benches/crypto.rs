use coffer_crypto::{decrypt_buffer, encrypt_buffer, encrypt_name, KEY_SIZE};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_buffer(bencher: divan::Bencher, size: usize) {
    let key = [0xABu8; KEY_SIZE];
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt_buffer(divan::black_box(&key), divan::black_box(&data)).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_buffer(bencher: divan::Bencher, size: usize) {
    let key = [0xABu8; KEY_SIZE];
    let sealed = encrypt_buffer(&key, &make_data(size)).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| decrypt_buffer(divan::black_box(&key), divan::black_box(&sealed)).unwrap());
}

#[divan::bench(args = ["a.txt", "projects/coffer/crates/coffer-engine/src/journal.rs"])]
fn bench_encrypt_name(name: &str) -> String {
    let key = [0x55u8; KEY_SIZE];
    encrypt_name(divan::black_box(&key), divan::black_box(name)).unwrap()
}

fn main() {
    divan::main();
}
