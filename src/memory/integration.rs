#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::config::{ExhaustionPolicy, ManagerConfig};
    use crate::memory::diagnostics::Origin;
    use crate::memory::fallback::PageFallback;
    use crate::memory::manager::MemoryManager;
    use crate::memory::pool_box::PoolBox;
    use crate::memory::shared::SharedMemoryManager;
    use crate::memory::size_class::SizeClassConfig;
    use crate::memory::stats;
    use crate::sync::Arc;
    use crate::sync::thread;
    use std::cell::RefCell;
    use std::ptr::NonNull;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Complex {
        re: f64,
        im: f64,
    }

    fn workload_config() -> ManagerConfig {
        ManagerConfig::default().with_size_classes([
            SizeClassConfig::new(16, 1024),
            SizeClassConfig::new(64, 1024),
            SizeClassConfig::new(256, 1024),
        ])
    }

    #[test]
    fn test_integration_complex_workload() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // 500 rounds of 1000 short-lived values, all through PoolBox
        let manager = RefCell::new(MemoryManager::new(workload_config()).unwrap());

        for round in 0..500u32 {
            let values: Vec<_> = (0..1000u32)
                .map(|i| {
                    let value = Complex {
                        re: f64::from(round),
                        im: f64::from(i),
                    };
                    PoolBox::new_in(value, &manager).unwrap()
                })
                .collect();
            assert_eq!(values[999].im, 999.0);
            assert_eq!(manager.borrow().stats().pools[0].free_count, 24);
        }

        let manager = manager.into_inner();
        for pool in &manager.stats().pools {
            assert_eq!(pool.free_count, pool.block_count);
        }
        assert_eq!(manager.stats().pools[0].high_water, 1000);
        manager.check_integrity().unwrap();
        assert!(manager.teardown().is_clean());
    }

    #[test]
    fn test_integration_leak_end_to_end() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = MemoryManager::new(workload_config()).unwrap();
        // Rotate through all three pools and the fallback
        let sizes = [8, 50, 200, 4000];

        let ptrs: Vec<_> = (0..500)
            .map(|i| manager.allocate(sizes[i % 4]).unwrap())
            .collect();
        let leaked = ptrs[333];
        for (i, ptr) in ptrs.into_iter().enumerate() {
            if i != 333 {
                manager.free(ptr).unwrap();
            }
        }

        let report = manager.teardown();
        assert_eq!(report.leaks.len(), 1);
        let leak = report.leaks[0];
        assert_eq!(leak.address, leaked.as_ptr() as usize);
        assert_eq!(leak.size, 50);
        assert_eq!(leak.sequence, 333);
        assert!(matches!(leak.origin, Origin::Pool { block_size: 64, .. }));
        assert!(leak.site.file().ends_with("integration.rs"));

        let free: Vec<_> = report.pools.iter().map(|p| p.free_count).collect();
        assert_eq!(free, vec![1024, 1023, 1024]);
        assert!(report.pools.iter().all(|p| p.allocations == 125));
    }

    #[test]
    fn test_integration_leaks_merge_pool_and_fallback_records() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager = MemoryManager::new(workload_config()).unwrap();
        let sizes = [8, 50, 200, 4000];

        let ptrs: Vec<_> = (0..500)
            .map(|i| manager.allocate(sizes[i % 4]).unwrap())
            .collect();
        // Keep one allocation from every shard: i = 100..=103
        for (i, ptr) in ptrs.iter().enumerate() {
            if !(100..104).contains(&i) {
                manager.free(*ptr).unwrap();
            }
        }

        let report = manager.teardown();
        let addrs: Vec<_> = report.leaks.iter().map(|l| l.address).collect();
        let expected: Vec<_> = ptrs[100..104].iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(addrs, expected);
        assert!(matches!(report.leaks[0].origin, Origin::Pool { block_size: 16, .. }));
        assert!(matches!(report.leaks[1].origin, Origin::Pool { block_size: 64, .. }));
        assert!(matches!(report.leaks[2].origin, Origin::Pool { block_size: 256, .. }));
        assert_eq!(
            report.leaks[3].origin,
            Origin::Fallback { exhausted_class: None }
        );
        assert_eq!(report.leaked_bytes(), 8 + 50 + 200 + 4000);
    }

    #[test]
    fn test_integration_mixed_sizes_with_page_fallback() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = ManagerConfig::default()
            .with_size_classes([
                SizeClassConfig::new(16, 256),
                SizeClassConfig::new(64, 1024),
                SizeClassConfig::new(256, 1024),
            ])
            .with_exhaustion_policy(ExhaustionPolicy::Fallback);
        let mut manager =
            MemoryManager::with_fallback(config, PageFallback::new(1024 * 1024)).unwrap();

        let mut live = Vec::new();
        for i in 0..3000usize {
            let size = match i % 5 {
                0 => 8,
                1 => 60,
                2 => 200,
                3 => 5000,
                _ => 16,
            };
            let ptr = manager.allocate(size).unwrap();
            // Safety: Test code; ptr has at least `size` bytes.
            unsafe { ptr.as_ptr().write_bytes((i % 251) as u8, size) };
            live.push((ptr, size, (i % 251) as u8));
            if i % 4 == 0 {
                let (ptr, size, tag) = live.swap_remove(live.len() / 2);
                // Safety: Test code.
                unsafe { assert_eq!(ptr.as_ptr().add(size - 1).read(), tag) };
                manager.free(ptr).unwrap();
            }
        }

        // Far more than 256 small values stay live at once
        assert!(manager.stats().exhaustion_spills > 0);
        manager.check_integrity().unwrap();

        for (ptr, _, tag) in live {
            // Safety: Test code.
            unsafe { assert_eq!(ptr.as_ptr().read(), tag) };
            manager.free(ptr).unwrap();
        }
        let stats = manager.stats();
        assert_eq!(stats.live_blocks(), 0);
        assert_eq!(stats.fallback_live, 0);
        assert!(manager.teardown().is_clean());
    }

    #[test]
    fn test_integration_shared_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let num_threads = 8usize;
        let iters = 200usize;
        let manager = Arc::new(SharedMemoryManager::new(workload_config()).unwrap());
        let barrier = Arc::new(std::sync::Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let m = Arc::clone(&manager);
                let b = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut ptrs = Vec::with_capacity(iters);
                    b.wait();
                    for i in 0..iters {
                        let size = 16 << (i % 4); // 16 to 128 bytes
                        let ptr = m.allocate(size).unwrap();
                        // Safety: Test code.
                        unsafe { ptr.as_ptr().write(t as u8) };
                        ptrs.push(ptr.as_ptr() as usize);
                    }
                    for addr in ptrs {
                        let ptr = NonNull::new(addr as *mut u8).unwrap();
                        // Safety: Test code.
                        unsafe { assert_eq!(ptr.as_ptr().read(), t as u8) };
                        m.free(ptr).unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        manager.check_integrity().unwrap();
        let manager = Arc::into_inner(manager).unwrap();
        assert!(manager.teardown().is_clean());
    }

    #[test]
    fn test_integration_gauges_track_arenas() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let manager = MemoryManager::new(workload_config()).unwrap();
        // 16 KiB + 64 KiB + 256 KiB, all page multiples
        let arenas = (16 + 64 + 256) * 1024;

        let gauges = stats::global_gauges();
        assert!(gauges.pool_arena_bytes >= arenas);
        assert!(gauges.total_reserved >= gauges.pool_arena_bytes);
        assert!(gauges.total_committed >= arenas);

        let report = manager.teardown();
        assert!(report.is_clean());
        assert_eq!(report.pools.len(), 3);
    }

    #[test]
    fn test_integration_drop_releases_fallback_leaks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut manager =
            MemoryManager::with_fallback(workload_config(), PageFallback::new(0)).unwrap();
        manager.allocate(10_000).unwrap();
        manager.allocate(1).unwrap();
        // Reported and released without a panic
        drop(manager);
    }
}
