//! Paging scenarios: eager and demand loading, swap under memory
//! pressure, LRU victim selection, and the sort benchmark that sweeps an
//! array larger than physical memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mekos_kernel::machine::mmu::{PteFlags, INVALID_FRAME, PAGE_SIZE};
use mekos_kernel::test_utils;
use mekos_kernel::threads::thread::Thread;
use mekos_kernel::vm::address_space::AddressSpace;
use mekos_kernel::vm::transfer;
use mekos_kernel::{Kernel, KernelConfig};

fn boot(tweak: impl FnOnce(&mut KernelConfig)) -> (Arc<Kernel>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let k = test_utils::boot(&dir.path().join("DISK"), tweak);
    (k, dir)
}

/// Fork a user thread over a fresh address space for `name` and run
/// `body` on it; panics in `body` fail the test through the thread's
/// status channel... so assert inside and double-check with the flag.
fn run_user(k: &Arc<Kernel>, name: &str, body: impl FnOnce(&Arc<Kernel>) + Send + 'static) {
    let executable = k.file_system().open(k, name).unwrap();
    let thread = Thread::new(k, name, true);
    let space = AddressSpace::new(k, executable, thread.id()).unwrap();
    thread.set_space(space);
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    thread.fork(
        k,
        Box::new(move |k| {
            body(k);
            flag.store(true, Ordering::SeqCst);
        }),
    );
    thread.join(k);
    assert!(done.load(Ordering::SeqCst), "user thread died early");
}

fn word_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn eager_loading_places_code_and_data() {
    let (k, _dir) = boot(|_| {});
    let code = word_pattern(300);
    let data: Vec<u8> = (0..200).map(|i| (i as u8) ^ 0x5a).collect();
    test_utils::install_executable(&k, "prog", &code, &data, 256);

    let expected: Vec<u8> = code.iter().chain(data.iter()).copied().collect();
    run_user(&k, "prog", move |k| {
        for (i, chunk) in expected.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            assert_eq!(
                transfer::read_user_word(k, 4 * i as u32),
                u32::from_le_bytes(word),
                "byte {} of the image is wrong",
                4 * i
            );
        }
        // BSS reads as zero and takes writes.
        let bss = 500u32;
        assert_eq!(transfer::read_user_word(k, bss), 0);
        transfer::write_user_word(k, bss, 0xfeed_f00d);
        assert_eq!(transfer::read_user_word(k, bss), 0xfeed_f00d);
    });
}

#[test]
fn demand_loading_faults_pages_in_on_first_touch() {
    let (k, _dir) = boot(|c| {
        c.use_tlb = true;
        c.demand_loading = true;
    });
    let code = word_pattern(2 * PAGE_SIZE + 40);
    test_utils::install_executable(&k, "prog", &code, &[], 512);

    let executable = k.file_system().open(&k, "prog").unwrap();
    let thread = Thread::new(&k, "prog", true);
    let space = AddressSpace::new(&k, executable, thread.id()).unwrap();
    thread.set_space(Arc::clone(&space));

    // Nothing resident before the first touch.
    for vpn in 0..space.num_pages() {
        assert!(!space.page_table_entry(vpn).is_valid());
    }

    let body_space = Arc::clone(&space);
    let expected = code.clone();
    thread.fork(
        &k,
        Box::new(move |k| {
            for (i, chunk) in expected.chunks(4).enumerate() {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                assert_eq!(transfer::read_user_word(k, 4 * i as u32), u32::from_le_bytes(word));
            }
            // The touched code pages are resident now.
            assert!(body_space.page_table_entry(0).is_valid());
            assert!(body_space.page_table_entry(1).is_valid());
        }),
    );
    thread.join(&k);
}

#[test]
fn swap_spills_dirty_pages_and_reloads_them() {
    let (k, _dir) = boot(|c| {
        c.use_tlb = true;
        c.demand_loading = true;
        c.swap = true;
        c.num_phys_pages = 8;
    });
    // 16 pages of zeroed data plus stack; far more than the 8 frames.
    test_utils::install_executable(&k, "prog", &[], &[], 16 * PAGE_SIZE as u32);

    let executable = k.file_system().open(&k, "prog").unwrap();
    let thread = Thread::new(&k, "prog", true);
    let space = AddressSpace::new(&k, executable, thread.id()).unwrap();
    thread.set_space(Arc::clone(&space));

    let body_space = Arc::clone(&space);
    thread.fork(
        &k,
        Box::new(move |k| {
            // Stamp one word per page, sweeping well past physical memory.
            for vpn in 0..16u32 {
                transfer::write_user_word(k, vpn * PAGE_SIZE as u32, 0xa000 + vpn);
            }
            // The sweep evicted early pages.
            let evicted = (0..16u32)
                .filter(|&vpn| !body_space.page_table_entry(vpn).is_valid())
                .count();
            assert!(evicted >= 8, "only {evicted} pages were evicted");
            // Every stamp survives the round trip through swap.
            for vpn in 0..16u32 {
                assert_eq!(
                    transfer::read_user_word(k, vpn * PAGE_SIZE as u32),
                    0xa000 + vpn
                );
            }
        }),
    );
    thread.join(&k);
}

#[test]
fn lru_evicts_the_page_with_the_oldest_timer() {
    let (k, _dir) = boot(|c| {
        c.use_tlb = true;
        c.demand_loading = true;
        c.swap = true;
        c.use_lru = true;
        c.num_phys_pages = 4;
    });
    test_utils::install_executable(&k, "prog", &[], &[], 8 * PAGE_SIZE as u32);

    let executable = k.file_system().open(&k, "prog").unwrap();
    let thread = Thread::new(&k, "prog", true);
    let space = AddressSpace::new(&k, executable, thread.id()).unwrap();
    thread.set_space(Arc::clone(&space));

    let body_space = Arc::clone(&space);
    thread.fork(
        &k,
        Box::new(move |k| {
            // Fill all four frames in fault order 0, 1, 2, 3.
            for vpn in 0..4u32 {
                transfer::write_user_word(k, vpn * PAGE_SIZE as u32, 0xb000 + vpn);
            }
            // Page 0 now carries the maximal timer; the next fault must
            // claim its frame.
            transfer::write_user_word(k, 4 * PAGE_SIZE as u32, 0xb004);
            let entry = body_space.page_table_entry(0);
            assert!(!entry.is_valid(), "LRU picked the wrong victim");
            assert!(entry.flags.contains(PteFlags::IN_SWAP));
            assert_eq!(entry.physical_page, INVALID_FRAME);
            // And it comes back intact from swap.
            assert_eq!(transfer::read_user_word(k, 0), 0xb000);
        }),
    );
    thread.join(&k);
}

fn sort_benchmark(tweak: impl FnOnce(&mut KernelConfig)) {
    const DIM: u32 = 1024;
    let (k, _dir) = boot(tweak);
    test_utils::install_executable(&k, "sort", &[], &[], DIM * 4);

    run_user(&k, "sort", move |k| {
        for i in 0..DIM {
            transfer::write_user_word(k, 4 * i, DIM - i);
        }
        for i in 0..DIM - 1 {
            for j in 0..DIM - 1 - i {
                let a = transfer::read_user_word(k, 4 * j);
                let b = transfer::read_user_word(k, 4 * (j + 1));
                if a > b {
                    transfer::write_user_word(k, 4 * j, b);
                    transfer::write_user_word(k, 4 * (j + 1), a);
                }
            }
        }
        assert_eq!(transfer::read_user_word(k, 0), 1);
        assert_eq!(transfer::read_user_word(k, 4 * (DIM - 1)), DIM);
    });
}

#[test]
fn sort_benchmark_without_swap() {
    sort_benchmark(|c| {
        c.use_tlb = true;
        c.demand_loading = true;
        c.num_phys_pages = 64;
    });
}

#[test]
fn sort_benchmark_with_swap() {
    sort_benchmark(|c| {
        c.use_tlb = true;
        c.demand_loading = true;
        c.swap = true;
        c.use_lru = true;
        c.num_phys_pages = 16;
    });
}
