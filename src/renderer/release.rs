//! 延迟释放队列
//!
//! GPU 可能仍在执行引用了某个描述符的命令列表，因此释放不能立即生效。
//! 每个释放的对象都带着一个 Fence 值入队，只有当 GPU 完成到该值后才真正回收。
//!
//! 队列按 Fence 值非递减排序，清理时遇到第一个未完成的条目即可停止。

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

use super::sync::FenceValue;

/// 可延迟释放的对象
///
/// 擦除具体资源类型，只保留"释放"这一个能力。
/// 任何 `FnOnce() + Send` 闭包都可以直接作为延迟释放对象。
pub trait StaleResource: Send {
    /// 真正释放资源
    fn release(self: Box<Self>);
}

impl<F> StaleResource for F
where
    F: FnOnce() + Send,
{
    fn release(self: Box<Self>) {
        (*self)()
    }
}

struct StaleEntry {
    fence_value: FenceValue,
    resource: Box<dyn StaleResource>,
}

/// 延迟释放队列
#[derive(Default)]
pub struct ReleaseQueue {
    entries: Mutex<VecDeque<StaleEntry>>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 将对象加入队列，在 GPU 完成 `fence_value` 之后释放
    pub fn safe_release<R>(&self, fence_value: FenceValue, resource: R)
    where
        R: StaleResource + 'static,
    {
        self.safe_release_boxed(fence_value, Box::new(resource));
    }

    /// 同 [`safe_release`](Self::safe_release)，接收已装箱的对象
    pub fn safe_release_boxed(&self, fence_value: FenceValue, resource: Box<dyn StaleResource>) {
        let mut entries = self.entries.lock();

        // 多个线程可能先读 Fence 值再入队，顺序可能交错。
        // 向上取整只会推迟回收，保持队列有序。
        let fence_value = match entries.back() {
            Some(last) if last.fence_value > fence_value => {
                trace!(
                    requested = fence_value.value(),
                    clamped = last.fence_value.value(),
                    "Clamping stale resource fence value"
                );
                last.fence_value
            }
            _ => fence_value,
        };

        entries.push_back(StaleEntry {
            fence_value,
            resource,
        });
    }

    /// 释放所有 Fence 值不大于 `completed` 的条目
    ///
    /// 返回释放的条目数。用过早读取的 `completed` 调用只会推迟回收。
    pub fn purge(&self, completed: FenceValue) -> usize {
        let ready: Vec<StaleEntry> = {
            let mut entries = self.entries.lock();
            let count = entries
                .iter()
                .take_while(|entry| entry.fence_value <= completed)
                .count();
            entries.drain(..count).collect()
        };

        // 释放回调可能重新进入队列，必须在锁外执行
        let released = ready.len();
        for entry in ready {
            entry.resource.release();
        }

        if released > 0 {
            debug!(
                released,
                completed = completed.value(),
                remaining = self.len(),
                "Purged stale descriptor releases"
            );
        }
        released
    }

    /// 无条件释放所有条目
    ///
    /// 仅在确认 GPU 空闲（例如关闭时）后调用。
    pub fn purge_all(&self) -> usize {
        let mut released = 0;
        loop {
            let ready: Vec<StaleEntry> = self.entries.lock().drain(..).collect();
            if ready.is_empty() {
                break;
            }
            released += ready.len();
            for entry in ready {
                entry.resource.release();
            }
        }
        released
    }

    /// 队列中等待释放的条目数
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 队尾条目的 Fence 值
    pub fn last_fence_value(&self) -> Option<FenceValue> {
        self.entries.lock().back().map(|entry| entry.fence_value)
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        let pending = self.entries.get_mut().len();
        if pending > 0 {
            warn!(pending, "Release queue dropped with pending entries, releasing unconditionally");
            self.purge_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn test_purge_stops_at_first_pending_entry() {
        let queue = ReleaseQueue::new();
        let released = Arc::new(StdMutex::new(Vec::new()));

        for (tag, fence) in [(0, 3), (1, 3), (2, 5), (3, 7)] {
            let released = Arc::clone(&released);
            queue.safe_release(FenceValue::new(fence), move || {
                released.lock().unwrap().push(tag);
            });
        }

        assert_eq!(queue.purge(FenceValue::new(5)), 3);
        assert_eq!(*released.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.last_fence_value(), Some(FenceValue::new(7)));

        // 过早读取的完成值只会推迟回收
        assert_eq!(queue.purge(FenceValue::new(6)), 0);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.purge(FenceValue::new(7)), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_order_fence_is_clamped() {
        let queue = ReleaseQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        queue.safe_release(FenceValue::new(4), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&counter);
        queue.safe_release(FenceValue::new(2), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(queue.purge(FenceValue::new(3)), 0);
        assert_eq!(queue.purge(FenceValue::new(4)), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_purge_all_handles_reentrant_releases() {
        let queue = Arc::new(ReleaseQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::clone(&queue);
        let c = Arc::clone(&counter);
        queue.safe_release(FenceValue::new(100), move || {
            let c2 = Arc::clone(&c);
            c.fetch_add(1, Ordering::SeqCst);
            inner_queue.safe_release(FenceValue::new(200), move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(queue.purge_all(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_releases_pending_entries() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = ReleaseQueue::new();
            let c = Arc::clone(&counter);
            queue.safe_release(FenceValue::new(1), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
