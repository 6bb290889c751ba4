//! Fragmentation soak: mixed sizes, mixed alignments, randomized frees.
//!
//! A counting logger is installed so corruption diagnostics (which the
//! allocator only logs, never surfaces) fail the test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata::{counters, Pool};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

static ERROR_RECORDS: AtomicUsize = AtomicUsize::new(0);

struct ErrorCountingLogger;

impl log::Log for ErrorCountingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Error
    }

    fn log(&self, record: &log::Record) {
        if record.level() == log::Level::Error {
            ERROR_RECORDS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

static LOGGER: ErrorCountingLogger = ErrorCountingLogger;

fn install_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Error);
    }
}

fn assert_clean_teardown() {
    assert_eq!(counters::used_bytes(), 0, "leaked OS bytes");
    assert_eq!(counters::op_count(), 0, "unbalanced OS operations");
    assert_eq!(
        ERROR_RECORDS.load(Ordering::SeqCst),
        0,
        "corruption diagnostics were logged"
    );
}

#[test]
fn fragmentation_soak() {
    let _guard = serial();
    install_logger();
    let mut rng = StdRng::seed_from_u64(0x50AC);
    {
        let pool = Pool::new();
        let mut live: Vec<(usize, usize, u8)> = Vec::new();

        // Phase 1: 1200 allocations, 16..=16384 bytes, alignments <= 256.
        for round in 0..1200usize {
            let bytes = rng.gen_range(16..=16384usize);
            let alignment = 1usize << rng.gen_range(0..=8u32);
            let fill = (round % 251) as u8;
            let ptr = pool.allocate(bytes, alignment, false).unwrap();
            assert_eq!(ptr.as_ptr() as usize % alignment.max(1), 0);
            unsafe { ptr.as_ptr().write_bytes(fill, bytes) };
            live.push((ptr.as_ptr() as usize, bytes, fill));
        }

        // Phase 2: free a random half.
        for _ in 0..600 {
            let (address, bytes, fill) = live.swap_remove(rng.gen_range(0..live.len()));
            let ptr = address as *mut u8;
            unsafe {
                assert_eq!(ptr.read(), fill);
                assert_eq!(ptr.add(bytes - 1).read(), fill);
            }
            pool.deallocate(ptr);
        }

        // Phase 3: 600 more small ones.
        for round in 0..600usize {
            let bytes = rng.gen_range(1..=1024usize);
            let fill = (round % 249) as u8;
            let ptr = pool.allocate(bytes, 0, false).unwrap();
            unsafe { ptr.as_ptr().write_bytes(fill, bytes) };
            live.push((ptr.as_ptr() as usize, bytes, fill));
        }

        // Phase 4: free the rest, verifying every pattern survived.
        while let Some((address, bytes, fill)) = live.pop() {
            let ptr = address as *mut u8;
            unsafe {
                assert_eq!(ptr.read(), fill);
                assert_eq!(ptr.add(bytes - 1).read(), fill);
            }
            pool.deallocate(ptr);
        }
        pool.flush_thread_cache();
    }
    assert_clean_teardown();
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 8,
        .. ProptestConfig::default()
    })]

    // Arbitrary allocate/free interleavings keep live blocks isolated and
    // tear down to balanced counters.
    #[test]
    fn random_sequences_preserve_isolation(
        ops in proptest::collection::vec((1usize..8192, any::<bool>()), 1..160)
    ) {
        let _guard = serial();
        install_logger();
        {
            let pool = Pool::new();
            let mut live: Vec<(usize, usize, u8)> = Vec::new();
            for (round, &(size, free_first)) in ops.iter().enumerate() {
                if free_first && !live.is_empty() {
                    let (address, bytes, fill) = live.swap_remove(size % live.len());
                    let ptr = address as *mut u8;
                    unsafe {
                        prop_assert_eq!(ptr.read(), fill);
                        prop_assert_eq!(ptr.add(bytes - 1).read(), fill);
                    }
                    pool.deallocate(ptr);
                } else {
                    let fill = (round % 251) as u8;
                    let ptr = pool.allocate(size, 0, false).unwrap();
                    unsafe { ptr.as_ptr().write_bytes(fill, size) };
                    live.push((ptr.as_ptr() as usize, size, fill));
                }
            }
            while let Some((address, bytes, fill)) = live.pop() {
                let ptr = address as *mut u8;
                unsafe {
                    prop_assert_eq!(ptr.read(), fill);
                    prop_assert_eq!(ptr.add(bytes - 1).read(), fill);
                }
                pool.deallocate(ptr);
            }
        }
        prop_assert_eq!(counters::used_bytes(), 0);
        prop_assert_eq!(counters::op_count(), 0);
    }
}
