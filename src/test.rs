#![allow(unused)]
use super::device;
use super::fs;
use device::{BlockFile, RamDisk};
use fs::{
    BlockCache, BlockData, BlockDevice, Cache, CacheConfig, LogHeader, OpContext, SuperBlock,
    BLOCK_SIZE,
};
use rand::Rng;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const TOTAL: u32 = 256;
const LOG_START: u32 = 200;
const LOG_BLOCKS: u32 = 30;
const BITMAP_START: u32 = 240;

// 手工布局: 数据在前, 日志在 200 之后, 位图全零 (没有经过格式化)
fn test_super_block() -> SuperBlock {
    SuperBlock::new(
        TOTAL,
        BITMAP_START - 1,
        0,
        LOG_BLOCKS,
        LOG_START,
        LOG_START + 1 + LOG_BLOCKS,
        BITMAP_START,
    )
}

fn test_config() -> CacheConfig {
    CacheConfig {
        eviction_threshold: 8,
        op_max_num_blocks: 10,
        pool_size: 64,
    }
}

fn boot(disk: &Arc<RamDisk>, config: CacheConfig) -> Cache {
    let device: Arc<dyn BlockDevice> = Arc::clone(disk) as Arc<dyn BlockDevice>;
    Cache::with_config(test_super_block(), device, config)
}

fn ram_cache(config: CacheConfig) -> (Arc<RamDisk>, Cache) {
    let disk = Arc::new(RamDisk::new(TOTAL as usize));
    let cache = boot(&disk, config);
    (disk, cache)
}

fn disk_header(disk: &RamDisk) -> LogHeader {
    LogHeader::load(&BlockData(disk.read_raw(LOG_START as usize)))
}

fn write_pattern(cache: &Cache, ctx: Option<&mut OpContext>, block_no: usize, byte: u8) {
    let mut block = cache.acquire(block_no);
    block.data_mut().fill(byte);
    cache.sync(ctx, &block);
    cache.release(block);
}

#[test]
fn committed_block_reaches_disk() {
    let (disk, cache) = ram_cache(test_config());

    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    let mut b = cache.acquire(10);
    b.data_mut().fill(0xAB);
    cache.sync(Some(&mut ctx), &b);
    assert!(b.is_pinned());
    cache.release(b);
    // 提交之前家位置不变
    assert_eq!(disk.read_raw(10), [0; BLOCK_SIZE]);
    cache.end_op(&mut ctx);

    assert_eq!(disk.read_raw(10), [0xAB; BLOCK_SIZE]);
    assert!(disk_header(&disk).is_empty());
    assert_eq!(cache.log_stats().staged, 0);
    let b = cache.acquire(10);
    assert!(!b.is_pinned());
    assert_eq!(b.data().0, [0xAB; BLOCK_SIZE]);
}

#[test]
fn sync_without_context_writes_through() {
    let (disk, cache) = ram_cache(test_config());
    write_pattern(&cache, None, 7, 0x3C);
    assert_eq!(disk.read_raw(7), [0x3C; BLOCK_SIZE]);
    assert_eq!(cache.log_stats().staged, 0);
}

#[test]
fn staging_the_same_block_twice_uses_one_slot() {
    let (disk, cache) = ram_cache(test_config());

    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    let mut b = cache.acquire(12);
    b.data_mut()[0] = 1;
    cache.sync(Some(&mut ctx), &b);
    b.data_mut()[1] = 2;
    cache.sync(Some(&mut ctx), &b);
    cache.release(b);
    write_pattern(&cache, Some(&mut ctx), 13, 9);

    assert_eq!(ctx.staged(), 2);
    assert_eq!(cache.log_stats().staged, 2);
    cache.end_op(&mut ctx);

    // 提交时取的是块最新的内存内容
    let home = disk.read_raw(12);
    assert_eq!(&home[..2], &[1, 2]);
    assert_eq!(disk.read_raw(13), [9; BLOCK_SIZE]);
}

#[test]
fn last_end_op_commits_the_batch() {
    let (disk, cache) = ram_cache(test_config());

    let mut first = OpContext::new();
    let mut second = OpContext::new();
    cache.begin_op(&mut first);
    cache.begin_op(&mut second);
    write_pattern(&cache, Some(&mut first), 20, 0x11);
    write_pattern(&cache, Some(&mut second), 21, 0x22);
    write_pattern(&cache, Some(&mut second), 22, 0x33);

    cache.end_op(&mut first);
    let stats = cache.log_stats();
    assert_eq!(stats.outstanding, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.staged, 3);
    assert_eq!(disk.read_raw(20), [0; BLOCK_SIZE]);

    cache.end_op(&mut second);
    assert_eq!(cache.log_stats().staged, 0);
    assert_eq!(disk.read_raw(20), [0x11; BLOCK_SIZE]);
    assert_eq!(disk.read_raw(21), [0x22; BLOCK_SIZE]);
    assert_eq!(disk.read_raw(22), [0x33; BLOCK_SIZE]);
}

#[test]
#[should_panic(expected = "too many blocks in one operation")]
fn operation_cap_is_fatal() {
    let (_disk, cache) = ram_cache(test_config());
    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    for block_no in 30..41 {
        write_pattern(&cache, Some(&mut ctx), block_no, 1);
    }
}

#[test]
fn begin_op_waits_for_log_space() {
    let (_disk, cache) = ram_cache(test_config());
    // 容量 30, 每个操作预留 10: 最多同时准入 3 个
    let mut ctxs: Vec<OpContext> = (0..3).map(|_| OpContext::new()).collect();
    for ctx in ctxs.iter_mut() {
        cache.begin_op(ctx);
    }
    let admitted = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut ctx = OpContext::new();
            cache.begin_op(&mut ctx);
            admitted.store(true, Ordering::SeqCst);
            cache.end_op(&mut ctx);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(!admitted.load(Ordering::SeqCst));
        cache.end_op(&mut ctxs[0]);
    });

    assert!(admitted.load(Ordering::SeqCst));
    cache.end_op(&mut ctxs[1]);
    cache.end_op(&mut ctxs[2]);
    assert_eq!(cache.log_stats().outstanding, 0);
}

#[test]
fn acquire_serializes_holders_of_one_block() {
    let (_disk, cache) = ram_cache(test_config());
    let held = cache.acquire(10);
    let acquired = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let b = cache.acquire(10);
            acquired.store(true, Ordering::SeqCst);
            cache.release(b);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        assert_eq!(cache.get_num_cached_blocks(), 1);
        cache.release(held);
    });

    assert!(acquired.load(Ordering::SeqCst));
    assert_eq!(cache.get_num_cached_blocks(), 1);
}

#[test]
fn scavenger_keeps_the_cache_near_its_threshold() {
    let config = CacheConfig {
        eviction_threshold: 4,
        ..test_config()
    };
    let (_disk, cache) = ram_cache(config);
    for block_no in 0..40 {
        let b = cache.acquire(block_no);
        assert!(cache.get_num_cached_blocks() <= config.eviction_threshold);
        cache.release(b);
    }
}

#[test]
fn pinned_and_held_blocks_are_never_evicted() {
    let config = CacheConfig {
        eviction_threshold: 4,
        ..test_config()
    };
    let (_disk, cache) = ram_cache(config);

    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    for block_no in 20..23 {
        write_pattern(&cache, Some(&mut ctx), block_no, 0x77);
    }
    let held = cache.acquire(30);

    for block_no in 40..60 {
        let b = cache.acquire(block_no);
        cache.release(b);
        for pinned in 20..23 {
            assert!(cache.is_cached(pinned));
        }
        assert!(cache.is_cached(30));
    }

    cache.end_op(&mut ctx);
    // 提交之后不再 pin, 下一次回收就能带走它们
    let b = cache.acquire(61);
    for block_no in 20..23 {
        assert!(!cache.is_cached(block_no));
    }
    assert!(cache.is_cached(30));
    cache.release(b);
    cache.release(held);
}

#[test]
#[should_panic(expected = "Run out of BlockCache")]
fn full_pool_of_busy_blocks_is_fatal() {
    let config = CacheConfig {
        eviction_threshold: 8,
        op_max_num_blocks: 10,
        pool_size: 4,
    };
    let (_disk, cache) = ram_cache(config);
    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    // 两个被持有, 两个暂存在日志中: 回收器一个都带不走
    let held: Vec<_> = (0..2).map(|block_no| cache.acquire(block_no)).collect();
    for block_no in 2..4 {
        write_pattern(&cache, Some(&mut ctx), block_no, 0x55);
    }
    assert_eq!(cache.get_num_cached_blocks(), 4);
    cache.acquire(4);
}

#[test]
fn commit_is_atomic_at_every_crash_point() {
    let base = {
        let (disk, cache) = ram_cache(test_config());
        for block_no in 10..13 {
            write_pattern(&cache, None, block_no, 0x11);
        }
        disk.snapshot()
    };

    // 3 个日志槽 + 日志头 + 3 个家位置 + 日志头
    for budget in 0..=8 {
        let disk = Arc::new(RamDisk::from_blocks(base.clone()));
        let cache = boot(&disk, test_config());
        let mut ctx = OpContext::new();
        cache.begin_op(&mut ctx);
        for block_no in 10..13 {
            write_pattern(&cache, Some(&mut ctx), block_no, 0x22);
        }
        disk.crash_after(budget);
        cache.end_op(&mut ctx);

        let rebooted = Arc::new(RamDisk::from_blocks(disk.snapshot()));
        let _cache = boot(&rebooted, test_config());
        let expected = if budget < 4 { 0x11 } else { 0x22 };
        for block_no in 10..13 {
            assert_eq!(
                rebooted.read_raw(block_no),
                [expected; BLOCK_SIZE],
                "crash after {} writes, block {}",
                budget,
                block_no
            );
        }
        assert!(disk_header(&rebooted).is_empty());
    }
}

#[test]
fn recovery_replays_once_and_is_idempotent() {
    let disk = Arc::new(RamDisk::new(TOTAL as usize));
    // 模拟一次写完日志头之后掉电的提交
    let mut header = LogHeader::empty();
    header.push(10);
    header.push(11);
    let mut data = BlockData::zeroed();
    header.store(&mut data);
    disk.write_block(LOG_START as usize, &data);
    disk.write_block(LOG_START as usize + 1, &[0x5A; BLOCK_SIZE]);
    disk.write_block(LOG_START as usize + 2, &[0x6B; BLOCK_SIZE]);

    let cache = boot(&disk, test_config());
    assert_eq!(disk.read_raw(10), [0x5A; BLOCK_SIZE]);
    assert_eq!(disk.read_raw(11), [0x6B; BLOCK_SIZE]);
    assert!(disk_header(&disk).is_empty());

    let before = disk.snapshot();
    let writes = disk.num_writes();
    cache.recover();
    assert_eq!(disk.snapshot(), before);
    // 只多写了一次空日志头
    assert_eq!(disk.num_writes(), writes + 1);
    assert_eq!(cache.log_stats().staged, 0);
}

#[test]
#[should_panic(expected = "recover with 1 operations in flight")]
fn recover_during_an_operation_is_fatal() {
    let (_disk, cache) = ram_cache(test_config());
    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    write_pattern(&cache, Some(&mut ctx), 10, 0x33);
    cache.recover();
}

#[test]
fn alloc_returns_distinct_zeroed_blocks() {
    let (disk, cache) = ram_cache(test_config());
    for block_no in 0..8 {
        disk.write_block(block_no, &[0xFF; BLOCK_SIZE]);
    }

    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    let allocated: Vec<usize> = (0..5).map(|_| cache.alloc(&mut ctx)).collect();
    // 同一个位图块只占一个槽, 再加上五个清零的新块
    assert_eq!(ctx.staged(), 6);
    for &block_no in &allocated {
        // 清零随事务提交, 之前磁盘上还是旧内容
        assert_eq!(disk.read_raw(block_no), [0xFF; BLOCK_SIZE]);
    }
    cache.end_op(&mut ctx);

    assert!(allocated.windows(2).all(|w| w[0] < w[1]));
    for &block_no in &allocated {
        assert_eq!(disk.read_raw(block_no), [0; BLOCK_SIZE]);
        assert!(fs::is_allocated(&cache, block_no));
    }
}

#[test]
fn freed_block_is_allocated_again() {
    let (_disk, cache) = ram_cache(test_config());
    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    let a = cache.alloc(&mut ctx);
    let b = cache.alloc(&mut ctx);
    cache.free(&mut ctx, a);
    assert!(!fs::is_allocated(&cache, a));
    assert_eq!(cache.alloc(&mut ctx), a);
    assert_ne!(a, b);
    cache.end_op(&mut ctx);
}

#[test]
fn reallocating_a_freed_block_is_not_durable_before_commit() {
    let (disk, cache) = ram_cache(test_config());
    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    let a = cache.alloc(&mut ctx);
    write_pattern(&cache, Some(&mut ctx), a, 0x42);
    cache.end_op(&mut ctx);

    // op1 释放 a 后结束, 但 op2 还没结束, 所以没有提交
    let mut op1 = OpContext::new();
    let mut op2 = OpContext::new();
    cache.begin_op(&mut op1);
    cache.begin_op(&mut op2);
    cache.free(&mut op1, a);
    cache.end_op(&mut op1);
    assert_eq!(cache.alloc(&mut op2), a);

    // 此刻掉电: a 仍属于旧的主人, 内容也没有变
    let rebooted = Arc::new(RamDisk::from_blocks(disk.snapshot()));
    let after_crash = boot(&rebooted, test_config());
    assert!(fs::is_allocated(&after_crash, a));
    assert_eq!(rebooted.read_raw(a), [0x42; BLOCK_SIZE]);

    cache.end_op(&mut op2);
    assert!(fs::is_allocated(&cache, a));
    assert_eq!(disk.read_raw(a), [0; BLOCK_SIZE]);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let (_disk, cache) = ram_cache(test_config());
    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    let b = cache.alloc(&mut ctx);
    cache.end_op(&mut ctx);

    cache.begin_op(&mut ctx);
    cache.free(&mut ctx, b);
    cache.free(&mut ctx, b);
}

#[test]
#[should_panic(expected = "no free block")]
fn exhausted_bitmap_is_fatal() {
    let disk: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(64));
    let cache = fs::create_with_config(disk, 64, 10, 8, test_config());
    let free = (cache.super_block().num_blocks - cache.super_block().data_start()) as usize;
    for _ in 0..=free {
        let mut ctx = OpContext::new();
        cache.begin_op(&mut ctx);
        cache.alloc(&mut ctx);
        cache.end_op(&mut ctx);
    }
}

#[test]
fn format_marks_metadata_used() {
    let disk: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(1024));
    let cache = fs::create(disk, 1024, 30, 64);
    let sb = *cache.super_block();
    let data_start = sb.data_start() as usize;

    assert!(fs::is_allocated(&cache, 0));
    assert!(fs::is_allocated(&cache, data_start - 1));
    assert!(!fs::is_allocated(&cache, data_start));
    assert_eq!(cache.bitmap().count_used(cache.as_ref()), data_start);

    let mut ctx = OpContext::new();
    cache.begin_op(&mut ctx);
    assert_eq!(cache.alloc(&mut ctx), data_start);
    cache.end_op(&mut ctx);
}

#[test]
fn image_file_survives_reopen() -> std::io::Result<()> {
    std::fs::create_dir_all("target")?;
    let open_file = || -> std::io::Result<Arc<dyn BlockDevice>> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open("target/journal-cache-test.img")?;
        f.set_len(512 * BLOCK_SIZE as u64)?;
        Ok(Arc::new(BlockFile(Mutex::new(f))))
    };

    let block_no = {
        let cache = fs::create(open_file()?, 512, 20, 16);
        let mut ctx = OpContext::new();
        cache.begin_op(&mut ctx);
        let block_no = cache.alloc(&mut ctx);
        write_pattern(&cache, Some(&mut ctx), block_no, 0x42);
        cache.end_op(&mut ctx);
        block_no
    };

    let cache = fs::open(open_file()?);
    assert!(fs::is_allocated(&cache, block_no));
    let b = cache.acquire(block_no);
    assert_eq!(b.data().0, [0x42; BLOCK_SIZE]);
    Ok(())
}

#[test]
fn concurrent_transactions_keep_log_and_bitmap_consistent() {
    let disk = Arc::new(RamDisk::new(1024));
    let device: Arc<dyn BlockDevice> = Arc::clone(&disk) as Arc<dyn BlockDevice>;
    let cache = fs::create_with_config(device, 1024, 30, 16, test_config());
    let capacity = cache.super_block().log_capacity();
    let op_max = cache.config().op_max_num_blocks;
    let baseline = cache.bitmap().count_used(cache.as_ref());

    let owned: Vec<HashMap<usize, u8>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = &cache;
                s.spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut owned: HashMap<usize, u8> = HashMap::new();
                    for _ in 0..50 {
                        let mut ctx = OpContext::new();
                        cache.begin_op(&mut ctx);
                        let stats = cache.log_stats();
                        assert!(stats.outstanding * op_max + stats.pending <= capacity);
                        if owned.is_empty() || rng.gen_bool(0.6) {
                            for _ in 0..rng.gen_range(1..=3) {
                                let block_no = cache.alloc(&mut ctx);
                                let byte: u8 = rng.gen();
                                write_pattern(cache, Some(&mut ctx), block_no, byte);
                                assert!(owned.insert(block_no, byte).is_none());
                            }
                        } else {
                            let victim = *owned.keys().next().unwrap();
                            owned.remove(&victim);
                            cache.free(&mut ctx, victim);
                        }
                        cache.end_op(&mut ctx);
                    }
                    owned
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(cache.log_stats().staged, 0);
    let mut total = 0;
    for map in &owned {
        for (&block_no, &byte) in map {
            assert_eq!(disk.read_raw(block_no), [byte; BLOCK_SIZE]);
            total += 1;
        }
    }
    assert_eq!(cache.bitmap().count_used(cache.as_ref()), baseline + total);
}
