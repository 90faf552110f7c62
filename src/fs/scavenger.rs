//! 回收器: 缓存块数超过阈值时, 把没有人持有也没有暂存在日志中的块从索引里移除.
//!
//! 只扫描一遍当前的候选者, 从不等待. 可能一个都回收不了, 缓存也允许暂时超过阈值.

use log::debug;

use super::{CacheList, Handle};

/// 在持有索引锁的情况下扫描一遍, 返回回收的块数
pub fn scavenge(list: &mut CacheList) -> usize {
    let cached = list.len();
    debug!("[block scavenger] in cache block: {}", cached);

    let victims: Vec<Handle> = list
        .iter()
        .filter(|(_, block)| block.is_evictable())
        .map(|(handle, _)| handle)
        .collect();
    for handle in victims {
        list.remove(handle);
    }

    let cleared = cached - list.len();
    debug!(
        "[block scavenger] cleared: {}, left: {}",
        cleared,
        list.len()
    );
    cleared
}
