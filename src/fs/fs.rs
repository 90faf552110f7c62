//! 磁盘布局的创建与打开
//!
//! Blocks: Super Block(0) -> Log Header -> Log Slots -> Inode Blocks -> Bitmap Blocks -> Data Blocks
//!
//! 格式化只负责划分区域, 写超级块, 清空日志头, 并在位图中把元数据区域标记为已分配.
//! 之后的所有读写都经过 [`Cache`].

use std::sync::Arc;

use log::info;

use super::{
    BlockCache, BlockData, BlockDevice, Cache, CacheConfig, SuperBlock, BIT_PER_BLOCK,
    INODE_PER_BLOCK, LOG_MAX_SIZE,
};

/// 在块设备上创建一个空的磁盘布局, 返回在它上面启动的缓存
pub fn create(
    block_device: Arc<dyn BlockDevice>,
    total_blocks: u32,  // 磁盘总块数
    num_log_blocks: u32, // 日志槽数 (不含日志头)
    num_inodes: u32,
) -> Arc<Cache> {
    create_with_config(
        block_device,
        total_blocks,
        num_log_blocks,
        num_inodes,
        CacheConfig::default(),
    )
}

pub fn create_with_config(
    block_device: Arc<dyn BlockDevice>,
    total_blocks: u32,
    num_log_blocks: u32,
    num_inodes: u32,
    config: CacheConfig,
) -> Arc<Cache> {
    assert!(
        num_log_blocks as usize <= LOG_MAX_SIZE,
        "log header holds at most {} entries",
        LOG_MAX_SIZE
    );

    // 0 是超级块, 日志头紧随其后
    let log_start = 1;
    let inode_start = log_start + 1 + num_log_blocks;
    // 向上取整
    let inode_blocks = (num_inodes + INODE_PER_BLOCK as u32 - 1) / INODE_PER_BLOCK as u32;
    let bitmap_start = inode_start + inode_blocks;
    let bitmap_blocks = (total_blocks + BIT_PER_BLOCK as u32 - 1) / BIT_PER_BLOCK as u32;
    let data_start = bitmap_start + bitmap_blocks;
    assert!(
        data_start < total_blocks,
        "{} blocks cannot hold the metadata ({} blocks)",
        total_blocks,
        data_start
    );

    let super_block = SuperBlock::new(
        total_blocks,
        total_blocks - data_start,
        num_inodes,
        num_log_blocks,
        log_start,
        inode_start,
        bitmap_start,
    );

    // 第一次使用, 需要将块设备的前 total_blocks 个块清零, 日志头因此也为空
    let zero = BlockData::zeroed();
    for i in 0..total_blocks {
        block_device.write_block(i as usize, &zero);
    }

    let mut data = BlockData::zeroed();
    data.modify(0, |sb: &mut SuperBlock| *sb = super_block);
    block_device.write_block(0, &data);

    let cache = Cache::with_config(super_block, block_device, config);
    cache.bitmap().mark_used(&cache, 0..data_start as usize);

    info!(
        "format: {} blocks, log {}..{}, inodes {}..{}, bitmap {}..{}, data {}..{}",
        total_blocks,
        log_start,
        inode_start,
        inode_start,
        bitmap_start,
        bitmap_start,
        data_start,
        data_start,
        total_blocks
    );
    Arc::new(cache)
}

/// 读出超级块
pub fn read_super_block(block_device: &Arc<dyn BlockDevice>) -> SuperBlock {
    let mut data = BlockData::zeroed();
    block_device.read_block(0, &mut data);
    let super_block = *data.get_ref::<SuperBlock>(0);
    assert!(super_block.is_valid(), "Error loading journal fs!");
    super_block
}

/// 从一个已经格式化过的块设备上启动缓存, 启动时会重放日志
pub fn open(block_device: Arc<dyn BlockDevice>) -> Arc<Cache> {
    open_with_config(block_device, CacheConfig::default())
}

pub fn open_with_config(block_device: Arc<dyn BlockDevice>, config: CacheConfig) -> Arc<Cache> {
    let super_block = read_super_block(&block_device);
    info!("open: {:?}", super_block);
    Arc::new(Cache::with_config(super_block, block_device, config))
}

/// 某个块是否已在位图中分配, 用于检查
pub fn is_allocated(cache: &Cache, block_no: usize) -> bool {
    let super_block = cache.super_block();
    let bitmap_block = cache.acquire(super_block.bitmap_start as usize + block_no / BIT_PER_BLOCK);
    let bit = block_no % BIT_PER_BLOCK;
    bitmap_block.read(0, |bits: &[u64; 64]| bits[bit / 64] & (1u64 << (bit % 64)) != 0)
}
