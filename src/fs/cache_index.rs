//! 缓存索引: 块号 -> 内存中的 [`Block`]
//!
//! 块对象放在一个定长的对象池 (arena) 里, 用稳定的整数句柄 [`Handle`] 寻址,
//! 另有一个按块号排序的 `BTreeMap` 负责查找. 回收只是把槽位清空并归还句柄, 不存在悬垂指针.
//!
//! 整个索引由一把自旋锁保护, 它与每个块自己的睡眠锁相互独立:
//! 持有索引锁时绝不等待块锁, 所以两者之间不会形成环.

use std::{collections::BTreeMap, sync::Arc};

use spin::{Mutex, MutexGuard};

use super::Block;

/// 对象池中的槽位编号
pub type Handle = usize;

pub struct CacheList {
    slots: Vec<Option<Arc<Block>>>,
    /// 空闲槽位
    free: Vec<Handle>,
    by_block_no: BTreeMap<usize, Handle>,
    capacity: usize,
}

impl CacheList {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_block_no: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.by_block_no.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_block_no.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty() && self.slots.len() == self.capacity
    }

    pub fn lookup(&self, block_no: usize) -> Option<&Arc<Block>> {
        self.by_block_no
            .get(&block_no)
            .and_then(|&handle| self.slots[handle].as_ref())
    }

    /// 插入一个新块, 对象池已满时返回 None
    pub fn insert(&mut self, block: Block) -> Option<Handle> {
        assert!(
            !self.by_block_no.contains_key(&block.block_no()),
            "block {} cached twice",
            block.block_no()
        );
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return None,
        };
        self.by_block_no.insert(block.block_no(), handle);
        self.slots[handle] = Some(Arc::new(block));
        Some(handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<Arc<Block>> {
        let block = self.slots.get_mut(handle)?.take()?;
        self.by_block_no.remove(&block.block_no());
        self.free.push(handle);
        Some(block)
    }

    /// 按块号顺序遍历所有驻留的块
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Arc<Block>)> + '_ {
        self.by_block_no
            .values()
            .filter_map(|&handle| self.slots[handle].as_ref().map(|block| (handle, block)))
    }
}

pub struct CacheIndex {
    list: Mutex<CacheList>,
}

impl CacheIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: Mutex::new(CacheList::new(capacity)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CacheList> {
        self.list.lock()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn contains(&self, block_no: usize) -> bool {
        self.list.lock().lookup(block_no).is_some()
    }

    /// 在索引的锁内归还一次引用, 与查找时的 `get` 配对
    pub fn put(&self, block: &Block) {
        let _list = self.list.lock();
        block.put();
    }
}
