//! 块缓存的对外接口.
//!
//! 上层 (inode / 目录层) 只依赖 [`BlockCache`] 这个 trait;
//! [`Cache`] 是它唯一的实现, 把缓存索引, 回收器, 日志层和位图分配组合在一起.
//! 整个缓存是一个在启动时构造一次的对象, 没有全局状态.

use std::sync::Arc;

use log::{debug, info};

use super::{
    scavenge, Bitmap, Block, BlockDevice, BlockGuard, CacheIndex, LogManager, LogStats,
    OpContext, SuperBlock, BLOCK_POOL_SIZE, EVICTION_THRESHOLD, OP_MAX_NUM_BLOCKS,
};

/// 缓存的可调参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// 缓存块数超过它时, acquire 之后触发一次回收
    pub eviction_threshold: usize,
    /// 单个操作最多暂存的块数
    pub op_max_num_blocks: usize,
    /// 内存中 Block 对象池的容量
    pub pool_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: EVICTION_THRESHOLD,
            op_max_num_blocks: OP_MAX_NUM_BLOCKS,
            pool_size: BLOCK_POOL_SIZE,
        }
    }
}

/// 块缓存提供给上层的全部能力. 所有操作要么成功, 要么 panic.
pub trait BlockCache: Send + Sync {
    /// 当前驻留在内存中的块数
    fn get_num_cached_blocks(&self) -> usize;

    /// 取得块的独占访问权, 必要时从磁盘读入. 块正被别人持有时睡眠等待.
    fn acquire(&self, block_no: usize) -> BlockGuard<'_>;

    /// 放弃独占访问权, 唤醒等待这个块的其他执行流
    fn release(&self, block: BlockGuard<'_>);

    /// 开始一个上层操作, 日志空间不够或提交进行中时睡眠等待
    fn begin_op(&self, ctx: &mut OpContext);

    /// 有 ctx 时把块暂存进当前事务; 没有 ctx 时直接同步写回磁盘
    fn sync(&self, ctx: Option<&mut OpContext>, block: &BlockGuard<'_>);

    /// 结束一个上层操作, 最后一个结束的操作负责提交
    fn end_op(&self, ctx: &mut OpContext);

    /// 在位图中分配一个块, 返回清零后的块号
    fn alloc(&self, ctx: &mut OpContext) -> usize;

    /// 在位图中释放一个块, 重复释放是致命错误
    fn free(&self, ctx: &mut OpContext, block_no: usize);
}

pub struct Cache {
    super_block: SuperBlock,
    block_device: Arc<dyn BlockDevice>,
    config: CacheConfig,
    index: CacheIndex,
    log: LogManager,
    bitmap: Bitmap,
}

impl Cache {
    pub fn new(super_block: SuperBlock, block_device: Arc<dyn BlockDevice>) -> Self {
        Self::with_config(super_block, block_device, CacheConfig::default())
    }

    /// 构造缓存, 并无条件地执行一次崩溃恢复
    pub fn with_config(
        super_block: SuperBlock,
        block_device: Arc<dyn BlockDevice>,
        config: CacheConfig,
    ) -> Self {
        let log = LogManager::new(
            &super_block,
            config.op_max_num_blocks,
            Arc::clone(&block_device),
        );
        let cache = Self {
            bitmap: Bitmap::new(
                super_block.bitmap_start as usize,
                super_block.num_blocks as usize,
            ),
            super_block,
            block_device,
            config,
            index: CacheIndex::new(config.pool_size),
            log,
        };
        cache.log.recover();
        info!(
            "block cache ready: {} blocks, log capacity {}",
            super_block.num_blocks,
            cache.log.capacity()
        );
        cache
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn block_device(&self) -> &Arc<dyn BlockDevice> {
        &self.block_device
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn log_stats(&self) -> LogStats {
        self.log.stats()
    }

    pub fn is_cached(&self, block_no: usize) -> bool {
        self.index.contains(block_no)
    }

    /// 再执行一次崩溃恢复. 只能在没有在途操作时调用
    pub fn recover(&self) {
        self.log.recover();
    }

    pub(super) fn unpin(&self, block_no: usize) {
        if let Some(block) = self.index.lock().lookup(block_no) {
            block.unpin();
        }
    }

    /// 在索引中查找或登记块, 并在索引锁内给它加一次引用
    fn get_block(&self, block_no: usize) -> Arc<Block> {
        let mut list = self.index.lock();
        let block = match list.lookup(block_no) {
            Some(block) => Arc::clone(block),
            None => {
                if list.is_full() {
                    scavenge(&mut list);
                }
                let handle = list
                    .insert(Block::new(block_no))
                    .unwrap_or_else(|| panic!("Run out of BlockCache"));
                debug!("cache: block {} -> slot {}", block_no, handle);
                Arc::clone(list.lookup(block_no).unwrap_or_else(|| unreachable!()))
            }
        };
        block.get();
        if list.len() > self.config.eviction_threshold {
            scavenge(&mut list);
        }
        block
    }
}

impl BlockCache for Cache {
    fn get_num_cached_blocks(&self) -> usize {
        self.index.len()
    }

    fn acquire(&self, block_no: usize) -> BlockGuard<'_> {
        assert!(
            block_no < self.super_block.num_blocks as usize,
            "block out of range: {} >= {}",
            block_no,
            self.super_block.num_blocks
        );
        let block = self.get_block(block_no);
        let mut guard = BlockGuard::lock(block, &self.index);
        if !guard.block().is_valid() {
            self.block_device.read_block(block_no, guard.data_mut());
            guard.mark_valid();
        }
        guard
    }

    fn release(&self, block: BlockGuard<'_>) {
        drop(block);
    }

    fn begin_op(&self, ctx: &mut OpContext) {
        self.log.begin_op(ctx);
    }

    fn sync(&self, ctx: Option<&mut OpContext>, block: &BlockGuard<'_>) {
        match ctx {
            Some(ctx) => self.log.stage(ctx, block),
            None => self.block_device.write_block(block.block_no(), block.data()),
        }
    }

    fn end_op(&self, ctx: &mut OpContext) {
        self.log.end_op(ctx, self);
    }

    fn alloc(&self, ctx: &mut OpContext) -> usize {
        self.bitmap.alloc(self, ctx)
    }

    fn free(&self, ctx: &mut OpContext, block_no: usize) {
        self.bitmap.dealloc(self, ctx, block_no);
    }
}
