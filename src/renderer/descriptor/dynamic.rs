//! 动态描述符子分配
//!
//! 每个命令上下文持有一个 [`DynamicSuballocationsManager`]。它从 GPU 堆的动态区域
//! 成块申请描述符，再在块内线性切分；帧末通过 [`release_allocations`] 整体归还。
//! 块内分配不需要任何同步，只有申请新块时才会进入 GPU 堆的锁。
//!
//! [`release_allocations`]: DynamicSuballocationsManager::release_allocations

use std::sync::Arc;
use tracing::debug;

use super::gpu_heap::GpuDescriptorHeap;
use super::DescriptorHeapAllocation;

/// 每个命令上下文私有的动态描述符分配器
pub struct DynamicSuballocationsManager {
    parent: Arc<GpuDescriptorHeap>,
    /// 本帧申请的所有块
    chunks: Vec<DescriptorHeapAllocation>,
    /// 最后一个块中下一个可用的位置
    current_offset_in_chunk: u32,
    chunk_size: u32,
    current_suballocations_total: u32,
    peak_suballocations_total: u32,
    current_descriptor_count: u32,
    peak_descriptor_count: u32,
    peak_chunk_count: usize,
    name: String,
}

impl DynamicSuballocationsManager {
    pub fn new(parent: Arc<GpuDescriptorHeap>, chunk_size: u32, name: impl Into<String>) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            parent,
            chunks: Vec::new(),
            current_offset_in_chunk: 0,
            chunk_size,
            current_suballocations_total: 0,
            peak_suballocations_total: 0,
            current_descriptor_count: 0,
            peak_descriptor_count: 0,
            peak_chunk_count: 0,
            name: name.into(),
        }
    }

    /// 分配 `count` 个连续描述符
    ///
    /// 当前块放不下时向父堆申请 `max(chunk_size, count)` 大小的新块。
    /// 父堆动态区域耗尽时返回空分配，已有状态保持不变。
    /// 返回的分配没有所属分配器，丢弃时不做任何事。
    pub fn allocate(&mut self, count: u32) -> DescriptorHeapAllocation {
        if count == 0 {
            return DescriptorHeapAllocation::null();
        }

        let needs_chunk = match self.chunks.last() {
            // current_offset_in_chunk 不会超过块大小，相减不会下溢
            Some(chunk) => count > chunk.num_handles() - self.current_offset_in_chunk,
            None => true,
        };

        if needs_chunk {
            let chunk_size = self.chunk_size.max(count);
            let chunk = self.parent.allocate_dynamic(chunk_size);
            if chunk.is_null() {
                crate::engine_error!(
                    manager = %self.name,
                    heap_type = self.parent.heap_type().name(),
                    requested = count,
                    chunk_size,
                    dynamic_capacity = self.parent.max_dynamic_descriptors(),
                    "Dynamic descriptor heap is exhausted"
                );
                return DescriptorHeapAllocation::null();
            }

            self.chunks.push(chunk);
            self.current_offset_in_chunk = 0;
            self.current_descriptor_count += chunk_size;
            self.peak_descriptor_count = self.peak_descriptor_count.max(self.current_descriptor_count);
            self.peak_chunk_count = self.peak_chunk_count.max(self.chunks.len());
        }

        let Some(chunk) = self.chunks.last() else {
            return DescriptorHeapAllocation::null();
        };
        let offset = self.current_offset_in_chunk;
        let allocation = DescriptorHeapAllocation::new(
            None,
            chunk.cpu_handle(offset),
            chunk.gpu_handle(offset),
            count,
            chunk.allocation_manager_id(),
            chunk.descriptor_size(),
        );

        self.current_offset_in_chunk += count;
        self.current_suballocations_total += count;
        self.peak_suballocations_total = self
            .peak_suballocations_total
            .max(self.current_suballocations_total);

        allocation
    }

    /// 单个子分配不单独归还，由 [`release_allocations`](Self::release_allocations) 统一回收
    pub fn free(&mut self, mut allocation: DescriptorHeapAllocation) {
        allocation.reset();
    }

    /// 把本帧的所有块交还父堆
    ///
    /// 块进入延迟释放队列，GPU 完成当前帧后才可复用。调用后，之前返回的子分配全部失效。
    pub fn release_allocations(&mut self) {
        if !self.chunks.is_empty() {
            debug!(
                manager = %self.name,
                chunks = self.chunks.len(),
                descriptors = self.current_suballocations_total,
                "Releasing dynamic descriptor chunks"
            );
        }

        self.chunks.clear();
        self.current_offset_in_chunk = 0;
        self.current_suballocations_total = 0;
        self.current_descriptor_count = 0;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// 当前持有的块数
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn peak_chunk_count(&self) -> usize {
        self.peak_chunk_count
    }

    /// 当前从父堆申请的描述符总数
    pub fn current_descriptor_count(&self) -> u32 {
        self.current_descriptor_count
    }

    pub fn peak_descriptor_count(&self) -> u32 {
        self.peak_descriptor_count
    }

    /// 本帧已经切分出去的描述符总数
    pub fn current_suballocations_total(&self) -> u32 {
        self.current_suballocations_total
    }

    pub fn peak_suballocations_total(&self) -> u32 {
        self.peak_suballocations_total
    }
}

impl Drop for DynamicSuballocationsManager {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.chunks.is_empty() && self.current_offset_in_chunk == 0,
                "All dynamic allocations of '{}' must be released before the manager is destroyed",
                self.name
            );
        }

        debug!(
            manager = %self.name,
            peak_suballocations = self.peak_suballocations_total,
            peak_descriptors = self.peak_descriptor_count,
            peak_chunks = self.peak_chunk_count,
            chunk_size = self.chunk_size,
            "Dynamic suballocations manager released"
        );
    }
}
