//! 块缓存层: 在内存中缓存磁盘块的数据, 避免频繁读写磁盘
//!
//! 每个被缓存的磁盘块在内存中有且只有一个 [`Block`], 它由缓存索引 ([`super::CacheIndex`]) 独占持有.
//! 客户端通过 `acquire` 拿到的是一个 [`BlockGuard`]: 它持有块的睡眠锁,
//! 在它存活期间客户端可以独占地读写块的缓冲区, 在它被 drop (即 `release`) 时锁自动释放.
//!
//! 块在被 release 或回收时都不会写回磁盘:
//! 数据只在 `sync` 时进入日志 (或直接写回), 回收一个未暂存的块不会产生任何 I/O.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};

use super::{BlockData, CacheIndex, OnDisk};

/// Cached block inside memory
pub struct Block {
    /// block_no 记录了这个块缓存来自于磁盘中的块的编号
    block_no: usize,
    /// 缓冲区中的数据已经从磁盘读入
    valid: AtomicBool,
    /// 当前被某个客户端持有
    acquired: AtomicBool,
    /// 已暂存到尚未提交的日志中, 不能被回收
    pinned: AtomicBool,
    /// 持有者与等待者的数量, 只在缓存索引的锁内修改
    refs: AtomicUsize,
    /// 块的睡眠锁, 拿不到锁的执行流会挂起直到持有者释放
    data: Arc<Mutex<BlockData>>,
}

impl Block {
    pub fn new(block_no: usize) -> Self {
        Self {
            block_no,
            valid: AtomicBool::new(false),
            acquired: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            data: Arc::new(Mutex::new(BlockData::zeroed())),
        }
    }

    pub fn block_no(&self) -> usize {
        self.block_no
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub(super) fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
    }

    pub(super) fn unpin(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    /// 没有人持有或等待, 也没有暂存在日志中
    pub fn is_evictable(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 0 && !self.is_acquired() && !self.is_pinned()
    }

    pub(super) fn get(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn put(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "block {} released too many times", self.block_no);
    }
}

/// 一个被 acquire 的块: 持有块的睡眠锁, drop 时自动 release.
///
/// 只有通过它才能访问块的缓冲区, 所以 "调用者必须持有块锁" 的约定由类型保证.
pub struct BlockGuard<'a> {
    // 字段按声明顺序 drop: 先释放块锁, 再归还引用
    data: ArcMutexGuard<RawMutex, BlockData>,
    held: Held<'a>,
}

/// 在索引中登记过的一次引用, drop 时归还
struct Held<'a> {
    block: Arc<Block>,
    index: &'a CacheIndex,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.index.put(&self.block);
    }
}

impl<'a> BlockGuard<'a> {
    /// 对已经登记 (refs 已加一) 的块加锁. 可能睡眠.
    pub(super) fn lock(block: Arc<Block>, index: &'a CacheIndex) -> Self {
        let data = block.data.lock_arc();
        block.acquired.store(true, Ordering::Release);
        Self {
            data,
            held: Held { block, index },
        }
    }

    pub fn block_no(&self) -> usize {
        self.held.block.block_no
    }

    pub fn block(&self) -> &Block {
        &self.held.block
    }

    pub fn is_pinned(&self) -> bool {
        self.held.block.is_pinned()
    }

    pub(super) fn mark_valid(&self) {
        self.held.block.valid.store(true, Ordering::Release);
    }

    pub fn data(&self) -> &BlockData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BlockData {
        &mut self.data
    }

    pub fn read<T: OnDisk, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        self.data().read(offset, f)
    }

    pub fn modify<T: OnDisk, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        self.data_mut().modify(offset, f)
    }
}

impl Drop for BlockGuard<'_> {
    /// release: 先清除 acquired, 随后块锁释放 (唤醒等待者), 最后在索引中归还引用
    fn drop(&mut self) {
        self.held.block.acquired.store(false, Ordering::Release);
    }
}
