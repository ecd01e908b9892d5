//! CPU 描述符堆池
//!
//! 非着色器可见的描述符存储。由若干 [`DescriptorHeapAllocationManager`] 组成，
//! 所有管理器都满时追加一个新堆；管理器只增不减。

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

use crate::core::error::Result;
use crate::gfx::backend::RenderDevice;
use crate::renderer::release::ReleaseQueue;
use crate::renderer::sync::FenceSource;

use super::manager::DescriptorHeapAllocationManager;
use super::{
    DescriptorAllocator, DescriptorHeapAllocation, DescriptorHeapDescriptor, DescriptorHeapStats,
    DescriptorHeapType,
};

struct CpuHeapState {
    managers: Vec<DescriptorHeapAllocationManager>,
    /// 至少还有一个空闲描述符的管理器
    available: BTreeSet<usize>,
    current_size: u32,
    max_size: u32,
}

/// CPU 描述符堆池
pub struct CpuDescriptorHeap {
    this: Weak<CpuDescriptorHeap>,
    device: Arc<dyn RenderDevice>,
    /// 队列由堆集合持有，堆只保留弱引用，避免队列条目与堆互相持有
    releases: Weak<ReleaseQueue>,
    fences: Arc<dyn FenceSource>,
    heap_type: DescriptorHeapType,
    /// 新建堆的默认大小
    heap_size: u32,
    state: Mutex<CpuHeapState>,
}

impl CpuDescriptorHeap {
    /// 创建堆池，并立即创建第一个大小为 `heap_size` 的堆
    pub fn new(
        device: Arc<dyn RenderDevice>,
        releases: Arc<ReleaseQueue>,
        fences: Arc<dyn FenceSource>,
        heap_size: u32,
        heap_type: DescriptorHeapType,
    ) -> Result<Arc<Self>> {
        let first = DescriptorHeapAllocationManager::new(
            device.as_ref(),
            0,
            &Self::heap_descriptor(heap_type, heap_size),
        )?;

        let mut available = BTreeSet::new();
        available.insert(0);

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            device,
            releases: Arc::downgrade(&releases),
            fences,
            heap_type,
            heap_size,
            state: Mutex::new(CpuHeapState {
                managers: vec![first],
                available,
                current_size: 0,
                max_size: 0,
            }),
        }))
    }

    fn heap_descriptor(heap_type: DescriptorHeapType, num_descriptors: u32) -> DescriptorHeapDescriptor {
        DescriptorHeapDescriptor::new(heap_type, num_descriptors)
            .with_name(format!("CPU {} Heap", heap_type.name()))
    }

    fn owner(&self) -> Option<Arc<dyn DescriptorAllocator>> {
        self.this
            .upgrade()
            .map(|heap| heap as Arc<dyn DescriptorAllocator>)
    }

    /// 立即把分配归还给所属管理器
    ///
    /// 只能在 GPU 不再引用这些描述符之后调用，由延迟释放队列负责。
    fn free_allocation(&self, allocation: DescriptorHeapAllocation) {
        let mut state = self.state.lock();
        let id = allocation.allocation_manager_id() as usize;
        let count = allocation.num_handles();

        assert!(
            id < state.managers.len(),
            "Allocation manager id {} is out of range for {} CPU heap",
            id,
            self.heap_type.name()
        );
        state.managers[id].free_allocation(allocation);
        state.available.insert(id);
        state.current_size -= count;
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// 新建堆的默认大小
    pub fn heap_size(&self) -> u32 {
        self.heap_size
    }

    /// 当前的堆数量
    pub fn heap_count(&self) -> usize {
        self.state.lock().managers.len()
    }

    /// 每个堆的容量，按创建顺序
    pub fn heap_capacities(&self) -> Vec<u32> {
        self.state
            .lock()
            .managers
            .iter()
            .map(|manager| manager.max_descriptors())
            .collect()
    }

    /// 当前已分配的描述符数量
    pub fn current_size(&self) -> u32 {
        self.state.lock().current_size
    }

    /// 已分配描述符数量的历史峰值
    pub fn max_size(&self) -> u32 {
        self.state.lock().max_size
    }

    pub fn stats(&self) -> DescriptorHeapStats {
        let state = self.state.lock();
        let capacity = state
            .managers
            .iter()
            .map(|manager| manager.max_descriptors())
            .sum();
        DescriptorHeapStats::new(self.heap_type, capacity, state.current_size, state.max_size)
    }
}

impl DescriptorAllocator for CpuDescriptorHeap {
    fn allocate(&self, count: u32) -> DescriptorHeapAllocation {
        if count == 0 {
            return DescriptorHeapAllocation::null();
        }

        let owner = self.owner();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut allocation = DescriptorHeapAllocation::null();
        let candidates: Vec<usize> = state.available.iter().copied().collect();
        for index in candidates {
            let manager = &mut state.managers[index];
            allocation = manager.allocate(count, owner.clone());
            // 已满的管理器不再参与后续查找，即使这次请求没有成功
            if manager.num_available_descriptors() == 0 {
                state.available.remove(&index);
            }
            if !allocation.is_null() {
                break;
            }
        }

        if allocation.is_null() {
            // 超大请求得到一个恰好够用的堆
            let new_size = self.heap_size.max(count);
            let id = state.managers.len();
            assert!(id < u16::MAX as usize, "Too many {} CPU heaps", self.heap_type.name());

            let mut manager = match DescriptorHeapAllocationManager::new(
                self.device.as_ref(),
                id as u16,
                &Self::heap_descriptor(self.heap_type, new_size),
            ) {
                Ok(manager) => manager,
                Err(e) => {
                    error!(
                        heap_type = self.heap_type.name(),
                        count,
                        error = %e,
                        "Failed to grow CPU descriptor heap"
                    );
                    return DescriptorHeapAllocation::null();
                }
            };

            info!(
                heap_type = self.heap_type.name(),
                heap_index = id,
                heap_size = new_size,
                requested = count,
                "CPU descriptor heap exhausted, adding a new heap"
            );

            allocation = manager.allocate(count, owner);
            debug_assert!(!allocation.is_null());
            if manager.num_available_descriptors() > 0 {
                state.available.insert(id);
            }
            state.managers.push(manager);
        }

        state.current_size += allocation.num_handles();
        state.max_size = state.max_size.max(state.current_size);
        allocation
    }

    fn free(&self, mut allocation: DescriptorHeapAllocation) {
        if allocation.is_null() {
            return;
        }
        allocation.detach_owner();

        let Some(heap) = self.this.upgrade() else {
            allocation.reset();
            return;
        };

        match self.releases.upgrade() {
            Some(releases) => {
                let fence_value = self.fences.next_fence_value();
                releases.safe_release(fence_value, move || heap.free_allocation(allocation));
            }
            None => {
                // 堆集合已经关闭，GPU 不再使用任何描述符
                crate::engine_warn!(
                    heap_type = self.heap_type.name(),
                    count = allocation.num_handles(),
                    "Release queue is gone, freeing descriptors immediately"
                );
                heap.free_allocation(allocation);
            }
        }
    }

    fn descriptor_size(&self) -> u32 {
        self.device.descriptor_increment_size(self.heap_type)
    }
}

impl Drop for CpuDescriptorHeap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug!(
            heap_type = self.heap_type.name(),
            heaps = state.managers.len(),
            peak = state.max_size,
            "CPU descriptor heap released"
        );

        if !std::thread::panicking() {
            debug_assert_eq!(
                state.current_size, 0,
                "Not all descriptors were released from {} CPU heap",
                self.heap_type.name()
            );
        }
    }
}
