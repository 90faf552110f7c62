use crate::fs::{BlockDevice, BLOCK_SIZE};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

pub struct BlockFile(pub Mutex<File>);

// std::file::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的，
// 在访问一个特定的块的时候，我们必须先 seek 到这个块的开头位置

impl BlockDevice for BlockFile {
    /// 读取一个块从文件
    fn read_block(&self, block_id: usize, buf: &mut [u8; BLOCK_SIZE]) {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        file.read_exact(buf).expect("Not a complete block");
    }

    /// 写一个块到文件
    fn write_block(&self, block_id: usize, buf: &[u8; BLOCK_SIZE]) {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        file.write_all(buf).expect("Not a complete block");
    }
}

/// 内存中的磁盘, 可以模拟掉电: 剩余写入预算用完之后, 所有写入都被丢弃
pub struct RamDisk {
    blocks: spin::Mutex<Vec<[u8; BLOCK_SIZE]>>,
    writes: AtomicUsize,
    /// None 表示一直有电
    power: spin::Mutex<Option<usize>>,
}

impl RamDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self::from_blocks(vec![[0; BLOCK_SIZE]; num_blocks])
    }

    pub fn from_blocks(blocks: Vec<[u8; BLOCK_SIZE]>) -> Self {
        Self {
            blocks: spin::Mutex::new(blocks),
            writes: AtomicUsize::new(0),
            power: spin::Mutex::new(None),
        }
    }

    /// 再允许 n 次写入, 之后掉电
    pub fn crash_after(&self, n: usize) {
        *self.power.lock() = Some(n);
    }

    pub fn has_crashed(&self) -> bool {
        *self.power.lock() == Some(0)
    }

    /// 成功落盘的写入次数
    pub fn num_writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// 磁盘当前内容的拷贝, 用来 "重启"
    pub fn snapshot(&self) -> Vec<[u8; BLOCK_SIZE]> {
        self.blocks.lock().clone()
    }

    /// 绕过缓存直接读一个块
    pub fn read_raw(&self, block_id: usize) -> [u8; BLOCK_SIZE] {
        self.blocks.lock()[block_id]
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8; BLOCK_SIZE]) {
        let blocks = self.blocks.lock();
        assert!(block_id < blocks.len(), "block out of range: {}", block_id);
        buf.copy_from_slice(&blocks[block_id]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8; BLOCK_SIZE]) {
        let mut power = self.power.lock();
        match power.as_mut() {
            Some(0) => return,
            Some(left) => *left -= 1,
            None => {}
        }
        let mut blocks = self.blocks.lock();
        assert!(block_id < blocks.len(), "block out of range: {}", block_id);
        blocks[block_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::AcqRel);
    }
}
