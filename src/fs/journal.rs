//! 日志层: 把并发的上层操作的块写入组合成原子的, 可崩溃恢复的事务
//!
//! 一个上层操作的流程是 `begin_op` -> (`acquire` -> 修改 -> `sync` -> `release`)* -> `end_op`.
//! `sync` 只把块号记进内存中的日志头 (暂存), 并把块 pin 住防止被回收;
//! 最后一个结束的操作负责提交 (commit):
//!
//! 1. 把每个暂存块当前的内存内容写入日志槽 (`log_start + 1 + i`)
//! 2. 写日志头, 从这一刻起事务已经持久
//! 3. 恢复 (install): 把日志槽拷贝回各自的家位置, 清空日志头并写回
//! 4. 取消各个块的 pin
//!
//! 任何时刻掉电, 磁盘上的日志头要么仍记录着条目 (重放第 3 步), 要么为空 (什么都不用做).
//! 恢复是幂等的, 所以它既是开机时的崩溃恢复, 也是每次提交的后半段.
//!
//! 日志头, 在途操作数, 已结束但未提交的暂存数都由同一把锁保护.
//! 提交期间一直持有这把锁, 新的 `begin_op` 和 `sync` 都会等到提交结束.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace};

use super::{
    BlockCache, BlockData, BlockDevice, BlockGuard, Cache, LogHeader, SuperBlock,
};

/// 一个进行中的上层操作. 只记录它新暂存的块数, 用来检查单个操作的上限
#[derive(Debug, Default)]
pub struct OpContext {
    staged: usize,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staged(&self) -> usize {
        self.staged
    }
}

/// 日志的准入状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    /// 已经 begin_op 还没有 end_op 的操作数
    pub outstanding: usize,
    /// 已经结束但尚未提交的操作所暂存的块数
    pub pending: usize,
    /// 日志头中的条目数
    pub staged: usize,
}

struct LogState {
    header: LogHeader,
    outstanding: usize,
    pending: usize,
}

pub struct LogManager {
    log_start: usize,
    capacity: usize,
    op_max_num_blocks: usize,
    block_device: Arc<dyn BlockDevice>,
    state: Mutex<LogState>,
    /// begin_op 在这里等待日志空间
    admission: Condvar,
}

impl LogManager {
    pub fn new(
        super_block: &SuperBlock,
        op_max_num_blocks: usize,
        block_device: Arc<dyn BlockDevice>,
    ) -> Self {
        let capacity = super_block.log_capacity();
        assert!(
            capacity >= op_max_num_blocks,
            "log of {} blocks cannot hold one operation of {} blocks",
            capacity,
            op_max_num_blocks
        );
        Self {
            log_start: super_block.log_start as usize,
            capacity,
            op_max_num_blocks,
            block_device,
            state: Mutex::new(LogState {
                header: LogHeader::empty(),
                outstanding: 0,
                pending: 0,
            }),
            admission: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock_state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> LogStats {
        let state = self.lock_state();
        LogStats {
            outstanding: state.outstanding,
            pending: state.pending,
            staged: state.header.len(),
        }
    }

    fn read_header(&self) -> LogHeader {
        let mut data = BlockData::zeroed();
        self.block_device.read_block(self.log_start, &mut data);
        LogHeader::load(&data)
    }

    fn write_header(&self, header: &LogHeader) {
        let mut data = BlockData::zeroed();
        header.store(&mut data);
        self.block_device.write_block(self.log_start, &data);
    }

    fn slot(&self, i: usize) -> usize {
        self.log_start + 1 + i
    }

    /// 崩溃恢复: 读磁盘上的日志头, 把每个日志槽拷贝回家位置, 再把空日志头写回.
    ///
    /// 幂等: 日志头为空时只多一次写入. 有在途操作时调用是致命错误.
    pub fn recover(&self) {
        let mut state = self.lock_state();
        assert!(
            state.outstanding == 0,
            "recover with {} operations in flight",
            state.outstanding
        );
        self.install(&mut state.header);
    }

    fn install(&self, header: &mut LogHeader) {
        *header = self.read_header();
        assert!(
            header.len() <= self.capacity,
            "corrupt log header: {} entries, capacity {}",
            header.len(),
            self.capacity
        );
        if !header.is_empty() {
            info!("log: replaying {} blocks", header.len());
        }
        let mut data = BlockData::zeroed();
        for (i, &home) in header.entries().iter().enumerate() {
            self.block_device.read_block(self.slot(i), &mut data);
            self.block_device.write_block(home as usize, &data);
        }
        header.clear();
        self.write_header(header);
    }

    /// 准入控制: 提交进行中, 或者日志装不下所有在途操作的最大暂存量时睡眠等待
    pub fn begin_op(&self, ctx: &mut OpContext) {
        let mut state = self.lock_state();
        // header.len() 也包含在途操作已经暂存的块, 它们同时被算在预留里.
        // 重复计算只会偏保守, 不能换成 pending
        while (state.outstanding + 1) * self.op_max_num_blocks + state.header.len() > self.capacity
        {
            trace!(
                "begin_op: waiting, outstanding {} staged {}",
                state.outstanding,
                state.header.len()
            );
            state = self
                .admission
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.outstanding += 1;
        ctx.staged = 0;
    }

    /// 把块暂存进当前事务. 同一个块只占一个日志槽
    pub fn stage(&self, ctx: &mut OpContext, block: &BlockGuard) {
        let mut state = self.lock_state();
        assert!(state.outstanding > 0, "sync outside of an operation");
        if state.header.contains(block.block_no()) {
            return;
        }
        assert!(
            ctx.staged < self.op_max_num_blocks,
            "too many blocks in one operation: limit {}",
            self.op_max_num_blocks
        );
        assert!(state.header.len() < self.capacity, "log capacity exceeded");
        state.header.push(block.block_no());
        ctx.staged += 1;
        block.block().pin();
    }

    /// 结束一个操作; 最后一个结束的操作同步地完成提交
    pub fn end_op(&self, ctx: &mut OpContext, cache: &Cache) {
        let mut state = self.lock_state();
        assert!(state.outstanding > 0, "end_op without begin_op");
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.commit(&mut state, cache);
            state.pending = 0;
        } else {
            state.pending += ctx.staged;
        }
        ctx.staged = 0;
        self.admission.notify_all();
    }

    fn commit(&self, state: &mut LogState, cache: &Cache) {
        if state.header.is_empty() {
            return;
        }
        let staged: Vec<usize> = state
            .header
            .entries()
            .iter()
            .map(|&no| no as usize)
            .collect();
        debug!("log: committing {} blocks", staged.len());

        // 先写日志槽, 再写日志头
        for (i, &home) in staged.iter().enumerate() {
            let block = cache.acquire(home);
            self.block_device.write_block(self.slot(i), block.data());
            cache.release(block);
        }
        self.write_header(&state.header);

        self.install(&mut state.header);

        for home in staged {
            cache.unpin(home);
        }
    }
}
