//! GPU 同步机制模块
//!
//! 提供 CPU-GPU 同步所需的 Fence 抽象。描述符的延迟释放以 Fence 值作为"纪元"：
//! 释放时打上"下一个 Fence 值"的标签，只有当 GPU 完成到该值后才真正回收。
//!
//! # 使用场景
//!
//! 1. **延迟释放**：读取 `next_fence_value` 给释放的描述符打标签
//! 2. **回收**：读取 `completed_fence_value` 清理延迟释放队列
//! 3. **同步上传/关闭**：`wait_for_value` 阻塞等待 GPU（无超时）

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::error::Result;

/// Fence 值
///
/// 用于CPU-GPU同步的单调递增值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FenceValue(u64);

impl FenceValue {
    /// 创建新的Fence值
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 下一个Fence值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for FenceValue {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Fence 查询接口
///
/// 由命令队列一方提供。描述符堆只需要这三个操作，
/// 因此可以在没有真实 GPU 的情况下用 [`FenceManager`] 驱动测试。
pub trait FenceSource: Send + Sync {
    /// 当前正在录制的命令列表提交后将会 signal 的值
    fn next_fence_value(&self) -> FenceValue;

    /// GPU 已经完成的最大 Fence 值
    fn completed_fence_value(&self) -> FenceValue;

    /// 阻塞等待直到 GPU 完成 `value`
    ///
    /// 没有超时：GPU 挂起会表现为调用线程挂起。
    fn wait_for_value(&self, value: FenceValue) -> Result<()>;
}

/// Fence 管理器
///
/// 纯 CPU 侧的 Fence 实现。`signal` 模拟提交命令列表，
/// `update_completed_value` 模拟 GPU 完成工作。
///
/// # 示例
///
/// ```rust
/// use dist_heap::renderer::sync::{FenceManager, FenceSource, FenceValue};
///
/// let fences = FenceManager::new();
/// assert_eq!(fences.next_fence_value(), FenceValue::new(1));
///
/// let submitted = fences.signal();
/// fences.update_completed_value(submitted);
/// fences.wait_for_value(submitted).unwrap();
/// ```
pub struct FenceManager {
    /// 最后一次提交的Fence值（CPU侧）
    current_value: AtomicU64,
    /// 已完成的Fence值（GPU侧）
    completed_value: AtomicU64,
    /// 等待者使用的锁与条件变量
    wait_lock: Mutex<()>,
    completed_signal: Condvar,
}

impl FenceManager {
    /// 创建新的Fence管理器
    pub fn new() -> Self {
        Self {
            current_value: AtomicU64::new(0),
            completed_value: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
            completed_signal: Condvar::new(),
        }
    }

    /// 获取最后一次提交的Fence值
    pub fn current_value(&self) -> FenceValue {
        FenceValue::new(self.current_value.load(Ordering::Acquire))
    }

    /// 提交：递增计数器并返回本次 signal 的值
    pub fn signal(&self) -> FenceValue {
        let value = self.current_value.fetch_add(1, Ordering::AcqRel);
        FenceValue::new(value + 1)
    }

    /// 更新已完成的Fence值
    ///
    /// 已完成值只会前进，较小的值会被忽略。
    pub fn update_completed_value(&self, value: FenceValue) {
        let _guard = self.wait_lock.lock();
        self.completed_value.fetch_max(value.value(), Ordering::AcqRel);
        self.completed_signal.notify_all();
    }

    /// 检查特定Fence值是否已完成
    pub fn is_completed(&self, value: FenceValue) -> bool {
        self.completed_fence_value() >= value
    }

    /// 等待所有已提交的工作完成
    pub fn flush(&self) -> Result<()> {
        self.wait_for_value(self.current_value())
    }

    /// 重置Fence管理器
    pub fn reset(&self) {
        let _guard = self.wait_lock.lock();
        self.current_value.store(0, Ordering::Release);
        self.completed_value.store(0, Ordering::Release);
    }
}

impl FenceSource for FenceManager {
    fn next_fence_value(&self) -> FenceValue {
        self.current_value().next()
    }

    fn completed_fence_value(&self) -> FenceValue {
        FenceValue::new(self.completed_value.load(Ordering::Acquire))
    }

    fn wait_for_value(&self, value: FenceValue) -> Result<()> {
        let mut guard = self.wait_lock.lock();
        while !self.is_completed(value) {
            self.completed_signal.wait(&mut guard);
        }
        Ok(())
    }
}

impl Default for FenceManager {
    fn default() -> Self {
        Self::new()
    }
}
