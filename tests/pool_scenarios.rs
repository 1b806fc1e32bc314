//! End-to-end pool behavior through the public API
//!
//! Every test runs against the mock runtime, so the suite exercises the full
//! allocator logic without a GPU.

use std::sync::Arc;

use hippool::{
    DeviceRuntime, MemoryPool, MockRuntime, PoolError, SingleDeviceMemoryPool, Stream,
    ALLOCATION_UNIT,
};

fn mock_pool() -> (Arc<MockRuntime>, SingleDeviceMemoryPool) {
    let mock = Arc::new(MockRuntime::new());
    let rt: Arc<dyn DeviceRuntime> = mock.clone();
    (mock, SingleDeviceMemoryPool::with_runtime(rt, 0))
}

#[test]
fn round_trip_rounds_reuses_and_accounts() {
    let (mock, pool) = mock_pool();

    let p = pool.malloc(100).unwrap();
    let addr = p.ptr();
    assert_eq!(addr % ALLOCATION_UNIT, 0);
    assert_eq!(p.memory_size(), 512);
    assert_eq!(pool.used_bytes().unwrap(), 512);
    assert_eq!(pool.free_bytes().unwrap(), 0);

    drop(p);
    assert_eq!(pool.used_bytes().unwrap(), 0);
    assert_eq!(pool.free_bytes().unwrap(), 512);
    assert_eq!(pool.n_free_blocks().unwrap(), 1);

    // LIFO reuse hands back the same address without touching the runtime
    let calls_before = mock.stats().malloc_calls;
    let q = pool.malloc(100).unwrap();
    assert_eq!(q.ptr(), addr);
    assert_eq!(mock.stats().malloc_calls, calls_before);
}

#[test]
fn split_serves_first_bytes_of_cached_parent() {
    let (_mock, pool) = mock_pool();

    drop(pool.malloc(2048).unwrap());

    let p = pool.malloc(512).unwrap();
    assert_eq!(pool.free_bytes().unwrap(), 1536);
    assert_eq!(pool.used_bytes().unwrap(), 512);
    drop(p);
}

#[test]
fn coalesce_out_of_order_frees_restore_whole_block() {
    let (_mock, pool) = mock_pool();

    drop(pool.malloc(2048).unwrap());
    let mut ps: Vec<_> = (0..4).map(|_| pool.malloc(512).unwrap()).collect();
    assert_eq!(pool.free_bytes().unwrap(), 0);

    // Free in order [1], [3], [0], [2]
    for idx in [1usize, 2, 0, 0] {
        ps.remove(idx);
    }
    assert!(ps.is_empty());

    assert_eq!(pool.used_bytes().unwrap(), 0);
    assert_eq!(pool.free_bytes().unwrap(), 2048);
    assert_eq!(pool.n_free_blocks().unwrap(), 1);
}

#[test]
fn stream_isolation_prevents_cross_stream_reuse() {
    let (mock, pool) = mock_pool();
    let rt: Arc<dyn DeviceRuntime> = mock.clone();
    let stream_a = Stream::new(rt.clone()).unwrap();
    let stream_b = Stream::new(rt).unwrap();

    let addr_a;
    {
        let _scope = stream_a.activate();
        let p = pool.malloc(512).unwrap();
        addr_a = p.ptr();
    }
    assert_eq!(pool.free_bytes().unwrap(), 512);

    {
        let _scope = stream_b.activate();
        let p = pool.malloc(512).unwrap();
        assert_ne!(p.ptr(), addr_a);
    }

    // Back on stream A the cached chunk is reused
    {
        let _scope = stream_a.activate();
        let p = pool.malloc(512).unwrap();
        assert_eq!(p.ptr(), addr_a);
    }
}

#[test]
fn oom_retry_frees_cached_parent_then_succeeds() {
    let (mock, pool) = mock_pool();

    drop(pool.malloc(2048).unwrap());
    assert_eq!(mock.live_allocations(), 1);

    mock.fail_next_allocs(1);
    let p = pool.malloc(8192).unwrap();
    assert_eq!(p.memory_size(), 8192);

    // The cached 2048-byte parent went back to the runtime during the retry
    assert_eq!(pool.free_bytes().unwrap(), 0);
    assert_eq!(mock.live_allocations(), 1);
}

#[test]
fn oom_after_all_retries_surfaces_requested_size() {
    let (mock, pool) = mock_pool();

    mock.fail_next_allocs(3);
    match pool.malloc(1000) {
        Err(PoolError::OutOfMemory { requested }) => assert_eq!(requested, 1024),
        other => panic!("expected OutOfMemory, got {:?}", other.map(|p| p.ptr())),
    }
}

#[test]
fn zero_size_malloc_is_free_of_bookkeeping() {
    let (mock, pool) = mock_pool();

    let p = pool.malloc(0).unwrap();
    assert_eq!(p.ptr(), 0);
    assert_eq!(p.memory_size(), 0);

    drop(p);
    assert_eq!(pool.used_bytes().unwrap(), 0);
    assert_eq!(pool.free_bytes().unwrap(), 0);
    assert_eq!(pool.total_bytes().unwrap(), 0);
    assert_eq!(mock.stats().malloc_calls, 0);
    assert_eq!(mock.stats().free_calls, 0);
}

#[test]
fn free_all_blocks_returns_only_whole_parents() {
    let (mock, pool) = mock_pool();

    // Split parent with a live sibling: 512 in use, 1536 cached tail
    drop(pool.malloc(2048).unwrap());
    let live = pool.malloc(512).unwrap();
    // Second whole cached parent; 2048 lands above the 1536 tail's bin, so
    // this cold-allocates instead of splitting the tail
    drop(pool.malloc(2048).unwrap());
    assert_eq!(mock.live_allocations(), 2);

    pool.free_all_blocks().unwrap();

    // The whole 2048 went back; the 1536 tail is retained because its
    // sibling is in use
    assert_eq!(pool.free_bytes().unwrap(), 1536);
    assert_eq!(pool.used_bytes().unwrap(), 512);
    assert_eq!(mock.live_allocations(), 1);

    drop(live);
    pool.free_all_blocks().unwrap();
    assert_eq!(pool.total_bytes().unwrap(), 0);
    assert_eq!(mock.live_allocations(), 0);
}

#[test]
fn growing_request_sizes_extend_the_arena() {
    let (_mock, pool) = mock_pool();

    // Bin index far beyond the initial arena length
    let big = 4 * 1024 * 1024;
    let p = pool.malloc(big).unwrap();
    assert_eq!(p.memory_size(), big);
    drop(p);
    assert_eq!(pool.free_bytes().unwrap(), big);

    let q = pool.malloc(big).unwrap();
    assert_eq!(pool.free_bytes().unwrap(), 0);
    drop(q);
}

#[test]
fn larger_bin_serves_smaller_request() {
    let (mock, pool) = mock_pool();

    drop(pool.malloc(4096).unwrap());
    let calls = mock.stats().malloc_calls;

    // 1024-byte request is served by splitting the cached 4096 chunk
    let p = pool.malloc(1024).unwrap();
    assert_eq!(mock.stats().malloc_calls, calls);
    assert_eq!(pool.free_bytes().unwrap(), 3072);
    drop(p);
}

#[test]
fn multi_device_pools_are_independent() {
    let mock = Arc::new(MockRuntime::with_devices(2));
    let rt: Arc<dyn DeviceRuntime> = mock.clone();
    let pool = MemoryPool::with_runtime(rt);

    drop(pool.malloc(512).unwrap());
    mock.set_device(1).unwrap();
    drop(pool.malloc(1024).unwrap());

    assert_eq!(pool.free_bytes().unwrap(), 1024);
    mock.set_device(0).unwrap();
    assert_eq!(pool.free_bytes().unwrap(), 512);
}

#[test]
fn randomized_workload_keeps_accounting_balanced() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let (_mock, pool) = mock_pool();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live = Vec::new();

    for _ in 0..500 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=16 * 1024);
            let p = pool.malloc(size).unwrap();
            assert_eq!(p.ptr() % ALLOCATION_UNIT, 0);
            live.push(p);
        } else {
            let idx = rng.gen_range(0..live.len());
            live.swap_remove(idx);
        }

        let used = pool.used_bytes().unwrap();
        let expected: usize = live.iter().map(|p| p.memory_size()).sum();
        assert_eq!(used, expected);
        assert_eq!(
            pool.total_bytes().unwrap(),
            used + pool.free_bytes().unwrap()
        );
    }

    live.clear();
    assert_eq!(pool.used_bytes().unwrap(), 0);
    pool.free_all_blocks().unwrap();
    assert_eq!(pool.total_bytes().unwrap(), 0);
}

#[test]
fn deprecated_bulk_release_alias_still_works() {
    let (_mock, pool) = mock_pool();
    drop(pool.malloc(512).unwrap());

    #[allow(deprecated)]
    pool.free_all_free().unwrap();
    assert_eq!(pool.free_bytes().unwrap(), 0);
}
