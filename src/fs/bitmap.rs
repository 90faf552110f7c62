//! 磁盘数据结构层的代码在 layout.rs 和 bitmap.rs 中
//!
//! 位图区域由若干个块组成, 每个块大小为 512 bytes, 即 4096 bits.
//! 第 b 个 bit 代表磁盘上第 b 个块 (绝对块号) 的分配状态, 0 意味着未分配, 而 1 则意味着已经分配出去.
//!
//! 位图所要做的事情是通过基于 bit 为单位的分配(寻找一个为 0 的 bit 位并设置为 1)
//! 和回收(将bit位清零)来进行数据块的分配和回收.
//! 对位图块的修改都通过块缓存的 acquire/sync 完成, 所以分配和回收与同一个事务中的其他修改一起提交.

use std::ops::Range;

use log::trace;

use super::{BlockCache, OpContext, BIT_PER_BLOCK};

/// BitmapBlock 将位图区域中的一个磁盘块解释为长度为 64 的一个 u64 数组,
/// 每个 u64 打包了一组 64 bits, 于是整个数组包含 64 * 64 = 4096 bits
type BitmapBlock = [u64; 64]; // size = 64 * 64 = 4096 bits = 512 bytes

type DataBlock = [u8; BIT_PER_BLOCK / 8];

/// Bitmap 自身是驻留在内存中的,
/// 但是它能够表示磁盘上那些块的分配情况.
pub struct Bitmap {
    /// 位图所在区域的起始块编号
    start_block_id: usize,
    /// 位图描述的块数, 即超级块中的 num_blocks
    num_bits: usize,
}

impl Bitmap {
    pub fn new(start_block_id: usize, num_bits: usize) -> Self {
        Self {
            start_block_id,
            num_bits,
        }
    }

    /// 位图占用的块数
    pub fn blocks_counts(&self) -> usize {
        (self.num_bits + BIT_PER_BLOCK - 1) / BIT_PER_BLOCK
    }

    /// 分配一个新块
    ///
    /// 遍历区域中的每个块, 再在每个块中以 bit 组(每组 64 bits)为单位进行遍历,
    /// 找到一个尚未被全部分配出去的组, 最后在里面分配一个 bit.
    /// 位图块的修改和清零后的新块都暂存进 ctx 所在的事务, 与它一起提交.
    ///
    /// 所有 bit 均已经被分配出去是致命错误.
    pub fn alloc(&self, cache: &dyn BlockCache, ctx: &mut OpContext) -> usize {
        for block_id in 0..self.blocks_counts() {
            let mut bitmap_block = cache.acquire(block_id + self.start_block_id);
            let num_bits = self.num_bits;
            let pos = bitmap_block.modify(0, |bitmap_block: &mut BitmapBlock| -> Option<usize> {
                // 找到最低的一个 0 的位置
                let (bits64_pos, inner_pos) = bitmap_block
                    .iter()
                    .enumerate()
                    .find(|(_, bits64)| **bits64 != u64::MAX)
                    .map(|(bits64_pos, bits64)| (bits64_pos, bits64.trailing_ones() as usize))?;
                let bit = block_id * BIT_PER_BLOCK + bits64_pos * 64 + inner_pos;
                // 最后一个位图块的尾部不对应任何块
                if bit >= num_bits {
                    return None;
                }
                bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                Some(bit)
            });
            if let Some(bit) = pos {
                cache.sync(Some(&mut *ctx), &bitmap_block);
                cache.release(bitmap_block);

                let mut data_block = cache.acquire(bit);
                data_block.modify(0, |data: &mut DataBlock| data.fill(0));
                cache.sync(Some(&mut *ctx), &data_block);
                cache.release(data_block);

                trace!("bitmap: alloc block {}", bit);
                return bit;
            }
            cache.release(bitmap_block);
        }
        panic!("no free block");
    }

    /// 释放一个块, 它的 bit 必须处于已分配状态
    pub fn dealloc(&self, cache: &dyn BlockCache, ctx: &mut OpContext, bit: usize) {
        assert!(
            bit < self.num_bits,
            "block out of range: {} >= {}",
            bit,
            self.num_bits
        );
        let (block_id, bits64_pos, inner_pos) = decomposition(bit);
        let mut bitmap_block = cache.acquire(block_id + self.start_block_id);
        bitmap_block.modify(0, |bitmap_block: &mut BitmapBlock| {
            assert!(
                bitmap_block[bits64_pos] & (1u64 << inner_pos) != 0,
                "double free: block {}",
                bit
            );
            bitmap_block[bits64_pos] &= !(1u64 << inner_pos);
        });
        cache.sync(Some(ctx), &bitmap_block);
        cache.release(bitmap_block);
        trace!("bitmap: free block {}", bit);
    }

    /// 把一段块标记为已分配, 直接写回磁盘 (不经过日志), 只在格式化时使用
    pub fn mark_used(&self, cache: &dyn BlockCache, range: Range<usize>) {
        assert!(range.end <= self.num_bits, "block out of range");
        for block_id in 0..self.blocks_counts() {
            let first = block_id * BIT_PER_BLOCK;
            let last = first + BIT_PER_BLOCK;
            if range.end <= first || range.start >= last {
                continue;
            }
            let mut bitmap_block = cache.acquire(block_id + self.start_block_id);
            bitmap_block.modify(0, |bitmap_block: &mut BitmapBlock| {
                for bit in range.start.max(first)..range.end.min(last) {
                    let (_, bits64_pos, inner_pos) = decomposition(bit);
                    bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                }
            });
            cache.sync(None, &bitmap_block);
            cache.release(bitmap_block);
        }
    }

    /// 统计已分配的块数
    pub fn count_used(&self, cache: &dyn BlockCache) -> usize {
        let mut used = 0;
        for block_id in 0..self.blocks_counts() {
            let bitmap_block = cache.acquire(block_id + self.start_block_id);
            let first = block_id * BIT_PER_BLOCK;
            let num_bits = self.num_bits;
            used += bitmap_block.read(0, |bitmap_block: &BitmapBlock| {
                (first..num_bits.min(first + BIT_PER_BLOCK))
                    .filter(|&bit| {
                        let (_, bits64_pos, inner_pos) = decomposition(bit);
                        bitmap_block[bits64_pos] & (1u64 << inner_pos) != 0
                    })
                    .count()
            });
            cache.release(bitmap_block);
        }
        used
    }

    /// 获取可分配块的最大数量
    pub fn maximum(&self) -> usize {
        self.num_bits
    }
}

/// 将bit编号 bit 分解为区域中的块编号 block_pos , 块内的组编号 bits64_pos 以及组内编号 inner_pos 的三元组
fn decomposition(mut bit: usize) -> (usize, usize, usize) {
    let block_id = bit / BIT_PER_BLOCK;
    bit %= BIT_PER_BLOCK;
    (block_id, bit / 64, bit % 64)
}

#[cfg(test)]
mod tests {
    use super::decomposition;

    #[test]
    fn bits_split_into_block_group_and_offset() {
        assert_eq!(decomposition(0), (0, 0, 0));
        assert_eq!(decomposition(65), (0, 1, 1));
        assert_eq!(decomposition(4096 + 130), (1, 2, 2));
    }
}
