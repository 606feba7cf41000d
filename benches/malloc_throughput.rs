use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::{hint::black_box, thread};

const OPS: u64 = 100_000;
const THREADS: u64 = 4;

/// hoardling alloc/free throughput.
fn hoard_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = hoardling::hoard_malloc(size);
      black_box(ptr);
      hoardling::hoard_free(ptr);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Keeps a window of live blocks so frees land in partly-full superblocks.
fn hoard_windowed(size: usize) {
  let mut window = [core::ptr::null_mut::<u8>(); 64];
  for i in 0..OPS as usize {
    let slot = &mut window[i % 64];
    unsafe {
      hoardling::hoard_free(*slot);
      *slot = hoardling::hoard_malloc(size);
    }
  }
  for p in window {
    unsafe { hoardling::hoard_free(p) };
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  hoardling::init().expect("arena reservation");
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("hoardling", size), &size, |b, &size| {
      b.iter(|| hoard_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("hoardling_window", size), &size, |b, &size| {
      b.iter(|| hoard_windowed(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_threaded(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_threaded");
  group.throughput(Throughput::Elements(OPS * THREADS));

  for size in [16, 256] {
    group.bench_with_input(BenchmarkId::new("hoardling", size), &size, |b, &size| {
      b.iter(|| {
        thread::scope(|s| {
          for _ in 0..THREADS {
            s.spawn(|| hoard_windowed(size));
          }
        })
      })
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| {
        thread::scope(|s| {
          for _ in 0..THREADS {
            s.spawn(|| libc_malloc_free(size));
          }
        })
      })
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_threaded);
criterion_main!(benches);
