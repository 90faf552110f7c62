//! 块设备仅支持以块为单位进行随机读写, 需要由具体的块设备驱动来实现这两个方法.
//! 块缓存层和日志层会调用这两个方法, 进行块缓存的管理和日志的落盘.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的块设备驱动程序.

use std::any::Any;

use super::BLOCK_SIZE;

// 块设备接口层
// 定义设备驱动需要实现的块读写接口 BlockDevice trait
// 没有部分块读写, 每次读写恰好一个块

pub trait BlockDevice: Send + Sync + Any {
    // read_block 将编号为 block_id 的块从磁盘读入内存中的缓冲区 buf ;
    fn read_block(&self, block_id: usize, buf: &mut [u8; BLOCK_SIZE]);

    // write_block 将内存中的缓冲区 buf 中的数据写入磁盘编号为 block_id 的块.
    fn write_block(&self, block_id: usize, buf: &[u8; BLOCK_SIZE]);
}
