//! 着色器可见的 GPU 描述符堆
//!
//! 每种可着色器可见的堆类型只有一个，且创建后大小固定。堆被划分为两个区域：
//!
//! ```text
//! |  静态区域（长期存在的资源）  |  动态区域（按帧分块）  |
//! 0                     num_static          num_static + num_dynamic
//! ```
//!
//! 静态区域由调用方直接分配；动态区域只通过
//! [`DynamicSuballocationsManager`](super::DynamicSuballocationsManager) 按块分配。

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::core::error::Result;
use crate::gfx::backend::{DescriptorHeapObject, RenderDevice};
use crate::renderer::release::ReleaseQueue;
use crate::renderer::sync::FenceSource;

use super::manager::DescriptorHeapAllocationManager;
use super::{
    DescriptorAllocator, DescriptorHeapAllocation, DescriptorHeapDescriptor, DescriptorHeapStats,
    DescriptorHeapType,
};

/// 静态区域管理器编号
pub const STATIC_MANAGER_ID: u16 = 0;
/// 动态区域管理器编号
pub const DYNAMIC_MANAGER_ID: u16 = 1;

#[derive(Debug, Default, Clone, Copy)]
struct RegionUsage {
    current: u32,
    peak: u32,
}

impl RegionUsage {
    fn add(&mut self, count: u32) {
        self.current += count;
        self.peak = self.peak.max(self.current);
    }
}

struct GpuHeapState {
    static_manager: DescriptorHeapAllocationManager,
    dynamic_manager: DescriptorHeapAllocationManager,
    static_usage: RegionUsage,
    dynamic_usage: RegionUsage,
}

impl GpuHeapState {
    fn manager(&mut self, id: u16) -> (&mut DescriptorHeapAllocationManager, &mut RegionUsage) {
        match id {
            STATIC_MANAGER_ID => (&mut self.static_manager, &mut self.static_usage),
            DYNAMIC_MANAGER_ID => (&mut self.dynamic_manager, &mut self.dynamic_usage),
            _ => panic!("Invalid GPU descriptor heap manager id {}", id),
        }
    }
}

/// 着色器可见的描述符堆
///
/// 多个命令上下文会同时从动态区域取块，所有访问都经过内部锁。
pub struct GpuDescriptorHeap {
    this: Weak<GpuDescriptorHeap>,
    /// 队列由堆集合持有，堆只保留弱引用，避免队列条目与堆互相持有
    releases: Weak<ReleaseQueue>,
    fences: Arc<dyn FenceSource>,
    heap: Arc<dyn DescriptorHeapObject>,
    heap_type: DescriptorHeapType,
    descriptor_size: u32,
    num_static: u32,
    num_dynamic: u32,
    state: Mutex<GpuHeapState>,
}

impl GpuDescriptorHeap {
    /// 创建大小为 `num_static + num_dynamic` 的着色器可见堆
    ///
    /// 只接受 CBV_SRV_UAV 和 Sampler 类型。
    pub fn new(
        device: Arc<dyn RenderDevice>,
        releases: Arc<ReleaseQueue>,
        fences: Arc<dyn FenceSource>,
        num_static: u32,
        num_dynamic: u32,
        heap_type: DescriptorHeapType,
    ) -> Result<Arc<Self>> {
        assert!(
            heap_type.can_be_shader_visible(),
            "{} heaps cannot be shader visible",
            heap_type.name()
        );

        let desc = DescriptorHeapDescriptor::new(heap_type, num_static + num_dynamic)
            .with_shader_visible(true)
            .with_name(format!("GPU {} Heap", heap_type.name()));
        let heap = device.create_descriptor_heap(&desc)?;
        let descriptor_size = device.descriptor_increment_size(heap_type);

        let static_manager = DescriptorHeapAllocationManager::with_sub_range(
            heap.clone(),
            descriptor_size,
            STATIC_MANAGER_ID,
            0,
            num_static,
        );
        let dynamic_manager = DescriptorHeapAllocationManager::with_sub_range(
            heap.clone(),
            descriptor_size,
            DYNAMIC_MANAGER_ID,
            num_static,
            num_dynamic,
        );

        info!(
            heap_type = heap_type.name(),
            num_static,
            num_dynamic,
            backend = device.backend_name(),
            "GPU descriptor heap created"
        );

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            releases: Arc::downgrade(&releases),
            fences,
            heap,
            heap_type,
            descriptor_size,
            num_static,
            num_dynamic,
            state: Mutex::new(GpuHeapState {
                static_manager,
                dynamic_manager,
                static_usage: RegionUsage::default(),
                dynamic_usage: RegionUsage::default(),
            }),
        }))
    }

    fn owner(&self) -> Option<Arc<dyn DescriptorAllocator>> {
        self.this
            .upgrade()
            .map(|heap| heap as Arc<dyn DescriptorAllocator>)
    }

    fn allocate_in(&self, id: u16, count: u32) -> DescriptorHeapAllocation {
        if count == 0 {
            return DescriptorHeapAllocation::null();
        }

        let owner = self.owner();
        let mut state = self.state.lock();
        let (manager, usage) = state.manager(id);
        let allocation = manager.allocate(count, owner);
        if !allocation.is_null() {
            usage.add(count);
        }
        allocation
    }

    /// 从动态区域分配一个块
    ///
    /// 只由 [`DynamicSuballocationsManager`](super::DynamicSuballocationsManager) 调用。
    pub(crate) fn allocate_dynamic(&self, count: u32) -> DescriptorHeapAllocation {
        self.allocate_in(DYNAMIC_MANAGER_ID, count)
    }

    fn free_allocation(&self, allocation: DescriptorHeapAllocation) {
        let mut state = self.state.lock();
        let count = allocation.num_handles();
        let (manager, usage) = state.manager(allocation.allocation_manager_id());
        manager.free_allocation(allocation);
        usage.current -= count;
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// 底层堆对象，用于绑定到命令列表
    pub fn heap(&self) -> &Arc<dyn DescriptorHeapObject> {
        &self.heap
    }

    pub fn max_static_descriptors(&self) -> u32 {
        self.num_static
    }

    pub fn max_dynamic_descriptors(&self) -> u32 {
        self.num_dynamic
    }

    pub fn static_size(&self) -> u32 {
        self.state.lock().static_usage.current
    }

    pub fn dynamic_size(&self) -> u32 {
        self.state.lock().dynamic_usage.current
    }

    pub fn max_static_size(&self) -> u32 {
        self.state.lock().static_usage.peak
    }

    pub fn max_dynamic_size(&self) -> u32 {
        self.state.lock().dynamic_usage.peak
    }

    /// 静态区域统计
    pub fn static_stats(&self) -> DescriptorHeapStats {
        let usage = self.state.lock().static_usage;
        DescriptorHeapStats::new(self.heap_type, self.num_static, usage.current, usage.peak)
    }

    /// 动态区域统计
    pub fn dynamic_stats(&self) -> DescriptorHeapStats {
        let usage = self.state.lock().dynamic_usage;
        DescriptorHeapStats::new(self.heap_type, self.num_dynamic, usage.current, usage.peak)
    }
}

impl DescriptorAllocator for GpuDescriptorHeap {
    /// 从静态区域分配
    fn allocate(&self, count: u32) -> DescriptorHeapAllocation {
        self.allocate_in(STATIC_MANAGER_ID, count)
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
        self.descriptor_size
    }
}

impl Drop for GpuDescriptorHeap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug!(
            heap_type = self.heap_type.name(),
            static_peak = state.static_usage.peak,
            static_capacity = self.num_static,
            dynamic_peak = state.dynamic_usage.peak,
            dynamic_capacity = self.num_dynamic,
            "GPU descriptor heap released"
        );
    }
}
