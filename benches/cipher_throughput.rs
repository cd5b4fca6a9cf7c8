use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ssr_accelerator::obfs::{ObfsContext, ObfsMode, Obfuscator};
use ssr_accelerator::{encode_header, CipherEngine, CipherMethod, TargetAddress};

const SIZES: [usize; 3] = [1024, 16 * 1024, 64 * 1024];

/// Encrypt throughput per supported method and chunk size
fn bench_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt");

    for method in CipherMethod::ALL.into_iter().filter(|m| m.is_supported()) {
        for size in SIZES {
            group.throughput(Throughput::Bytes(size as u64));
            let data = vec![0xA5u8; size];
            let mut engine = CipherEngine::new(method, "bench-password").unwrap();

            group.bench_with_input(BenchmarkId::new(method.as_str(), size), &data, |b, data| {
                b.iter(|| engine.encrypt(black_box(data)).unwrap());
            });
        }
    }

    group.finish();
}

/// Decrypt throughput once the peer IV has been consumed
fn bench_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("decrypt");
    let size = 16 * 1024;
    group.throughput(Throughput::Bytes(size as u64));

    for method in [CipherMethod::Aes256Cfb, CipherMethod::ChaCha20Ietf] {
        let (mut encryptor, _) = CipherEngine::new(method, "bench-password").unwrap().split();
        let (_, mut decryptor) = CipherEngine::new(method, "bench-password").unwrap().split();
        // prime the decryptor with the IV-carrying first chunk
        decryptor.decrypt(&encryptor.encrypt(b"prime").unwrap()).unwrap();
        let ciphertext = encryptor.encrypt(&vec![0x5Au8; size]).unwrap();

        group.bench_function(method.as_str(), |b| {
            b.iter(|| decryptor.decrypt(black_box(&ciphertext)).unwrap());
        });
    }

    group.finish();
}

/// Cost of the first upstream chunk: header, cipher setup and obfs framing
fn bench_first_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_chunk");
    let target = TargetAddress::new("www.example.com", 443);

    for mode in ObfsMode::ALL {
        group.bench_function(mode.as_str(), |b| {
            b.iter(|| {
                let header = encode_header(black_box(&target)).unwrap();
                let mut engine =
                    CipherEngine::new(CipherMethod::ChaCha20Ietf, "bench-password").unwrap();
                let mut obfs = mode.build(ObfsContext {
                    host: "relay.example.com".to_string(),
                    port: 443,
                    param: Some("cdn.example.com".to_string()),
                    key: engine.key().to_vec(),
                    iv_len: CipherMethod::ChaCha20Ietf.iv_len(),
                    head_len: header.len(),
                });
                let ciphertext = engine.encrypt(&header).unwrap();
                obfs.obfuscate(&ciphertext).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encrypt, bench_decrypt, bench_first_chunk);
criterion_main!(benches);
