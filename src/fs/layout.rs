//! 磁盘数据结构层的代码在 layout.rs 和 bitmap.rs 中
//!
//! 两个磁盘数据结构 [`SuperBlock`], [`LogHeader`], 以及块缓冲区 [`BlockData`]
//!
//! 在磁盘布局中, 按照块编号从小到大顺序地分成 5 个不同属性的连续区域:
//!
//! - 最开始的区域的长度为一个块, 其内容是超级块 ([`SuperBlock`])
//!   超级块内以 魔数 的形式提供了合法性检查功能, 同时还可以定位其他连续区域的位置
//!
//! - 第二个区域是日志区域, 长度为 1 + num_log_blocks 个块:
//!   第一个块是日志头 ([`LogHeader`]), 后面紧跟着按日志头顺序排列的日志槽
//!
//! - 第三个区域是索引节点区域, 由上层的 inode 层使用
//!
//! - 第四个区域是一个位图, 每个 bit 对应磁盘上的一个块 (按绝对块号)
//!
//! - 最后的区域则是数据块区域

use std::ops::{Deref, DerefMut};

use super::{BIT_PER_BLOCK, BLOCK_SIZE, JOURNAL_FS_MAGIC, LOG_MAX_SIZE};

/// 可以直接按字节解释的磁盘数据结构.
///
/// # Safety
///
/// 实现者必须是 `#[repr(C)]` 的纯整数结构 (或整数数组), 任意比特模式都合法.
pub unsafe trait OnDisk: Copy {}

unsafe impl<const N: usize> OnDisk for [u8; N] {}
unsafe impl<const N: usize> OnDisk for [u64; N] {}
unsafe impl OnDisk for SuperBlock {}
unsafe impl OnDisk for LogHeader {}

/// 一个块大小的缓冲区, 按 8 字节对齐, 这样其中的 u64 字段可以被直接引用
#[repr(C, align(8))]
#[derive(Clone)]
pub struct BlockData(pub [u8; BLOCK_SIZE]);

impl BlockData {
    pub const fn zeroed() -> Self {
        Self([0; BLOCK_SIZE])
    }

    /// 获取缓冲区中的位于偏移量 offset 的一个类型为 T 的磁盘上数据结构的不可变引用.
    pub fn get_ref<T: OnDisk>(&self, offset: usize) -> &T {
        check_bounds::<T>(offset);
        // 对齐和越界已经检查过, T 的任意比特模式都合法
        unsafe { &*(self.0.as_ptr().add(offset) as *const T) }
    }

    /// get_mut 会获取磁盘上数据结构的可变引用, 由此可以对数据结构进行修改.
    pub fn get_mut<T: OnDisk>(&mut self, offset: usize) -> &mut T {
        check_bounds::<T>(offset);
        unsafe { &mut *(self.0.as_mut_ptr().add(offset) as *mut T) }
    }

    // 在缓冲区偏移量为 offset 的位置获取一个类型为 T 的磁盘上数据结构的不可变/可变引用(分别对应 read/modify ),
    // 并让它执行传入的闭包 f 中所定义的操作.
    pub fn read<T: OnDisk, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    pub fn modify<T: OnDisk, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }
}

fn check_bounds<T>(offset: usize) {
    // 确认 T 被整个包含在磁盘块及其缓冲区之内
    assert!(offset + std::mem::size_of::<T>() <= BLOCK_SIZE);
    assert!(
        offset % std::mem::align_of::<T>() == 0,
        "misaligned block address: {offset}"
    );
}

impl Deref for BlockData {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BlockData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// SuperBlock 是一个磁盘上数据结构, 它就存放在磁盘上编号为 0 的块的起始处.
/// 缓存层只读取它, 不修改它.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperBlock {
    magic: u32, // 用于合法性验证的魔数
    pub num_blocks: u32,
    pub num_data_blocks: u32,
    pub num_inodes: u32,
    pub num_log_blocks: u32,
    pub log_start: u32,
    pub inode_start: u32,
    pub bitmap_start: u32,
}

impl SuperBlock {
    /// 各个区域的位置是以参数的形式传入进来的,
    /// 它们的划分是更上层的 [`super::create`] 需要完成的工作
    pub fn new(
        num_blocks: u32,
        num_data_blocks: u32,
        num_inodes: u32,
        num_log_blocks: u32,
        log_start: u32,
        inode_start: u32,
        bitmap_start: u32,
    ) -> Self {
        Self {
            magic: JOURNAL_FS_MAGIC,
            num_blocks,
            num_data_blocks,
            num_inodes,
            num_log_blocks,
            log_start,
            inode_start,
            bitmap_start,
        }
    }

    /// is_valid 可以通过魔数判断超级块是否合法
    pub fn is_valid(&self) -> bool {
        self.magic == JOURNAL_FS_MAGIC
    }

    /// 位图覆盖全部 num_blocks 个块所需的块数
    pub fn num_bitmap_blocks(&self) -> u32 {
        (self.num_blocks + BIT_PER_BLOCK as u32 - 1) / BIT_PER_BLOCK as u32
    }

    /// 数据区域的起始块号
    pub fn data_start(&self) -> u32 {
        self.bitmap_start + self.num_bitmap_blocks()
    }

    /// 日志真正可用的槽数, 受日志头能记录的条目数限制
    pub fn log_capacity(&self) -> usize {
        (self.num_log_blocks as usize).min(LOG_MAX_SIZE)
    }
}

/// 日志头, 在磁盘上位于 log_start, 内存中有唯一的一份镜像.
///
/// `block_no[..num_blocks]` 按暂存顺序记录各个块的家位置 (home location),
/// 第 i 个条目的内容保存在日志槽 `log_start + 1 + i` 中.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LogHeader {
    pub num_blocks: u64,
    pub block_no: [u64; LOG_MAX_SIZE],
}

impl LogHeader {
    pub const fn empty() -> Self {
        Self {
            num_blocks: 0,
            block_no: [0; LOG_MAX_SIZE],
        }
    }

    pub fn len(&self) -> usize {
        self.num_blocks as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    /// 已暂存的家位置块号
    pub fn entries(&self) -> &[u64] {
        assert!(
            self.len() <= LOG_MAX_SIZE,
            "corrupt log header: {} entries",
            self.num_blocks
        );
        &self.block_no[..self.len()]
    }

    pub fn contains(&self, block_no: usize) -> bool {
        self.entries().iter().any(|&no| no as usize == block_no)
    }

    /// 追加一个条目, 返回它在日志中的槽位
    pub fn push(&mut self, block_no: usize) -> usize {
        let slot = self.len();
        assert!(slot < LOG_MAX_SIZE, "log capacity exceeded");
        self.block_no[slot] = block_no as u64;
        self.num_blocks += 1;
        slot
    }

    pub fn clear(&mut self) {
        self.num_blocks = 0;
    }

    pub fn load(data: &BlockData) -> Self {
        *data.get_ref::<LogHeader>(0)
    }

    pub fn store(&self, data: &mut BlockData) {
        *data.get_mut::<LogHeader>(0) = *self;
    }
}
