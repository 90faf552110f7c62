mod bitmap;
mod block_cache;
mod block_dev;
mod cache;
mod cache_index;
mod fs;
mod journal;
mod layout;
mod scavenger;

extern crate log;

/// Use a block size of 512 bytes
pub const BLOCK_SIZE: usize = 512;
/// 块的 bit 数量, 即一个位图块能描述的块数
pub const BIT_PER_BLOCK: usize = BLOCK_SIZE * 8;
/// 日志头占一个块: 8 字节的 num_blocks 加上若干个 8 字节的块号
pub const LOG_MAX_SIZE: usize = (BLOCK_SIZE - 8) / 8;
/// 单个操作最多能暂存的块数
pub const OP_MAX_NUM_BLOCKS: usize = 10;
/// 缓存块数超过该值时触发回收
pub const EVICTION_THRESHOLD: usize = 20;
/// 内存中 Block 对象池的容量
pub const BLOCK_POOL_SIZE: usize = 1024;
/// 每个块中的 inode 数 (只用于计算 inode 区域大小)
pub const INODE_PER_BLOCK: usize = 8;
/// Magic number for sanity check
pub const JOURNAL_FS_MAGIC: u32 = 0x4a46_5331;

pub use bitmap::Bitmap;
pub use block_cache::{Block, BlockGuard};
pub use block_dev::BlockDevice;
pub use cache::{BlockCache, Cache, CacheConfig};
pub use cache_index::{CacheIndex, CacheList, Handle};
pub use fs::{
    create, create_with_config, is_allocated, open, open_with_config, read_super_block,
};
pub use journal::{LogManager, LogStats, OpContext};
pub use layout::*;
pub use scavenger::scavenge;
