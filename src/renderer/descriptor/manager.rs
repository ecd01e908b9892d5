//! 描述符堆分配管理器
//!
//! 把一个 [`VariableSizeAllocationsManager`] 绑定到一个具体的描述符堆
//! （或堆的一个子区间），把区间偏移换算成 CPU/GPU 描述符句柄。

use std::sync::Arc;
use tracing::{debug, info};

use crate::core::error::Result;
use crate::gfx::backend::{DescriptorHeapObject, RenderDevice};

use super::variable_size::VariableSizeAllocationsManager;
use super::{
    CpuDescriptorHandle, DescriptorAllocator, DescriptorHeapAllocation, DescriptorHeapDescriptor,
    DescriptorHeapType, GpuDescriptorHandle,
};

/// 描述符堆分配管理器
///
/// 多个管理器可以属于同一个父分配器，`id` 用于把释放路由回正确的管理器。
pub struct DescriptorHeapAllocationManager {
    heap: Arc<dyn DescriptorHeapObject>,
    id: u16,
    heap_type: DescriptorHeapType,
    /// 在堆中的第一个描述符
    first_descriptor: u32,
    num_descriptors: u32,
    descriptor_size: u32,
    first_cpu_handle: CpuDescriptorHandle,
    first_gpu_handle: Option<GpuDescriptorHandle>,
    free_blocks: VariableSizeAllocationsManager,
    /// 已分配数量的历史峰值
    max_allocated_size: u32,
}

impl DescriptorHeapAllocationManager {
    /// 创建新的描述符堆，并管理其全部描述符
    pub fn new(
        device: &dyn RenderDevice,
        id: u16,
        desc: &DescriptorHeapDescriptor,
    ) -> Result<Self> {
        let heap = device.create_descriptor_heap(desc)?;
        let descriptor_size = device.descriptor_increment_size(desc.heap_type);

        info!(
            id,
            heap_type = desc.heap_type.name(),
            num_descriptors = desc.num_descriptors,
            shader_visible = desc.shader_visible,
            backend = device.backend_name(),
            "Descriptor heap created"
        );

        Ok(Self::with_sub_range(heap, descriptor_size, id, 0, desc.num_descriptors))
    }

    /// 管理已有堆中的 `[first_descriptor, first_descriptor + num_descriptors)` 区间
    pub fn with_sub_range(
        heap: Arc<dyn DescriptorHeapObject>,
        descriptor_size: u32,
        id: u16,
        first_descriptor: u32,
        num_descriptors: u32,
    ) -> Self {
        assert!(
            first_descriptor as u64 + num_descriptors as u64 <= heap.num_descriptors() as u64,
            "Sub-range [{}, {}) exceeds heap size {}",
            first_descriptor,
            first_descriptor as u64 + num_descriptors as u64,
            heap.num_descriptors()
        );

        let first_cpu_handle = heap.cpu_start().offset(first_descriptor, descriptor_size);
        let first_gpu_handle = heap
            .gpu_start()
            .map(|start| start.offset(first_descriptor, descriptor_size));

        Self {
            heap_type: heap.heap_type(),
            heap,
            id,
            first_descriptor,
            num_descriptors,
            descriptor_size,
            first_cpu_handle,
            first_gpu_handle,
            free_blocks: VariableSizeAllocationsManager::new(num_descriptors as usize),
            max_allocated_size: 0,
        }
    }

    /// 分配 `count` 个连续描述符
    ///
    /// 描述符不需要对齐，因此对齐固定为 1。空间不足时返回空分配，不在这里重试。
    pub fn allocate(
        &mut self,
        count: u32,
        owner: Option<Arc<dyn DescriptorAllocator>>,
    ) -> DescriptorHeapAllocation {
        let allocation = self.free_blocks.allocate(count as usize, 1);
        if !allocation.is_valid() {
            return DescriptorHeapAllocation::null();
        }
        debug_assert_eq!(allocation.size, count as usize);

        let offset = allocation.unaligned_offset as u32;
        let cpu_handle = self.first_cpu_handle.offset(offset, self.descriptor_size);
        let gpu_handle = self
            .first_gpu_handle
            .map(|handle| handle.offset(offset, self.descriptor_size));

        self.max_allocated_size = self.max_allocated_size.max(self.num_allocated_descriptors());

        DescriptorHeapAllocation::new(
            owner,
            cpu_handle,
            gpu_handle,
            count,
            self.id,
            self.descriptor_size,
        )
    }

    /// 把分配归还到空闲列表
    ///
    /// 分配必须来自这个管理器；不匹配说明调用层存在错误。
    pub fn free_allocation(&mut self, mut allocation: DescriptorHeapAllocation) {
        assert_eq!(
            allocation.allocation_manager_id(),
            self.id,
            "Allocation does not belong to descriptor heap manager {}",
            self.id
        );

        let first = allocation.cpu_handle(0).ptr;
        debug_assert!(first >= self.first_cpu_handle.ptr);
        let offset = (first - self.first_cpu_handle.ptr) / self.descriptor_size as usize;
        self.free_blocks
            .free(offset, allocation.num_handles() as usize);

        // 槽位已经归还，句柄本身不能再触发释放
        allocation.reset();
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// 底层堆对象
    pub fn heap(&self) -> &Arc<dyn DescriptorHeapObject> {
        &self.heap
    }

    /// 在堆中的第一个描述符
    pub fn first_descriptor(&self) -> u32 {
        self.first_descriptor
    }

    pub fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }

    pub fn max_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    pub fn num_available_descriptors(&self) -> u32 {
        self.free_blocks.free_size() as u32
    }

    pub fn num_allocated_descriptors(&self) -> u32 {
        self.free_blocks.used_size() as u32
    }

    /// 已分配数量的历史峰值
    pub fn max_allocated_size(&self) -> u32 {
        self.max_allocated_size
    }
}

impl Drop for DescriptorHeapAllocationManager {
    fn drop(&mut self) {
        debug!(
            id = self.id,
            heap_type = self.heap_type.name(),
            peak = self.max_allocated_size,
            capacity = self.num_descriptors,
            "Descriptor heap manager released"
        );

        if !std::thread::panicking() {
            debug_assert!(
                self.free_blocks.is_empty(),
                "Not all descriptors were released by manager {} ({} still allocated)",
                self.id,
                self.free_blocks.used_size()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::null::NullDevice;

    #[test]
    fn test_allocate_maps_offsets_to_handles() {
        let device = NullDevice::new();
        let mut manager =
            DescriptorHeapAllocationManager::new(&device, 0, &DescriptorHeapDescriptor::cbv_srv_uav(16))
                .unwrap();
        let base_cpu = manager.heap().cpu_start().ptr;
        let base_gpu = manager.heap().gpu_start().unwrap().ptr;

        let a = manager.allocate(4, None);
        let b = manager.allocate(3, None);
        assert_eq!(a.cpu_handle(0).ptr, base_cpu);
        assert_eq!(b.cpu_handle(0).ptr, base_cpu + 4 * 32);
        assert_eq!(b.gpu_handle(2).unwrap().ptr, base_gpu + 6 * 32);
        assert_eq!(b.allocation_manager_id(), 0);
        assert_eq!(manager.num_available_descriptors(), 9);
        assert_eq!(manager.num_allocated_descriptors(), 7);
        assert_eq!(manager.max_allocated_size(), 7);

        manager.free_allocation(a);
        assert_eq!(manager.num_allocated_descriptors(), 3);
        manager.free_allocation(b);
        assert_eq!(manager.num_available_descriptors(), 16);
        assert_eq!(manager.num_allocated_descriptors(), 0);
        assert_eq!(manager.max_allocated_size(), 7);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let device = NullDevice::new();
        let mut manager =
            DescriptorHeapAllocationManager::new(&device, 3, &DescriptorHeapDescriptor::rtv(4)).unwrap();

        let a = manager.allocate(4, None);
        assert!(!a.is_null());
        assert!(!a.is_shader_visible());
        assert!(manager.allocate(1, None).is_null());

        manager.free_allocation(a);
    }

    #[test]
    fn test_sub_range() {
        let device = NullDevice::new();
        let heap = device
            .create_descriptor_heap(&DescriptorHeapDescriptor::cbv_srv_uav(32))
            .unwrap();
        let size = device.descriptor_increment_size(DescriptorHeapType::CbvSrvUav);

        let mut lower = DescriptorHeapAllocationManager::with_sub_range(heap.clone(), size, 0, 0, 24);
        let mut upper = DescriptorHeapAllocationManager::with_sub_range(heap.clone(), size, 1, 24, 8);

        let a = upper.allocate(8, None);
        assert_eq!(a.cpu_handle(0).ptr, heap.cpu_start().ptr + 24 * 32);
        assert_eq!(a.allocation_manager_id(), 1);
        assert!(upper.allocate(1, None).is_null());

        let b = lower.allocate(24, None);
        assert_eq!(b.cpu_handle(0).ptr, heap.cpu_start().ptr);

        upper.free_allocation(a);
        lower.free_allocation(b);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_free_to_wrong_manager_panics() {
        let device = NullDevice::new();
        let mut first =
            DescriptorHeapAllocationManager::new(&device, 0, &DescriptorHeapDescriptor::rtv(4)).unwrap();
        let mut second =
            DescriptorHeapAllocationManager::new(&device, 1, &DescriptorHeapDescriptor::rtv(4)).unwrap();

        let allocation = first.allocate(1, None);
        second.free_allocation(allocation);
    }
}
