//! 描述符堆分配句柄

use std::fmt;
use std::sync::Arc;

use super::{CpuDescriptorHandle, DescriptorAllocator, GpuDescriptorHandle};

/// 一段连续描述符槽位
///
/// 只能移动、不能复制。持有者独占这些槽位；句柄被丢弃时
/// 通过所属分配器的 [`DescriptorAllocator::free`] 归还，且只归还一次。
/// 空分配（CPU 句柄为 0）不持有任何资源，丢弃时什么也不做。
///
/// 动态子分配没有所属分配器：它们随所在的块在帧末统一回收。
pub struct DescriptorHeapAllocation {
    first_cpu_handle: CpuDescriptorHandle,
    first_gpu_handle: Option<GpuDescriptorHandle>,
    num_handles: u32,
    allocation_manager_id: u16,
    descriptor_size: u32,
    owner: Option<Arc<dyn DescriptorAllocator>>,
}

impl DescriptorHeapAllocation {
    pub(crate) fn new(
        owner: Option<Arc<dyn DescriptorAllocator>>,
        first_cpu_handle: CpuDescriptorHandle,
        first_gpu_handle: Option<GpuDescriptorHandle>,
        num_handles: u32,
        allocation_manager_id: u16,
        descriptor_size: u32,
    ) -> Self {
        debug_assert!(!first_cpu_handle.is_null());
        debug_assert!(num_handles > 0);
        Self {
            first_cpu_handle,
            first_gpu_handle,
            num_handles,
            allocation_manager_id,
            descriptor_size,
            owner,
        }
    }

    /// 空分配
    pub fn null() -> Self {
        Self {
            first_cpu_handle: CpuDescriptorHandle::NULL,
            first_gpu_handle: None,
            num_handles: 0,
            allocation_manager_id: u16::MAX,
            descriptor_size: 0,
            owner: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.first_cpu_handle.is_null()
    }

    /// 第 `offset` 个描述符的 CPU 句柄
    pub fn cpu_handle(&self, offset: u32) -> CpuDescriptorHandle {
        debug_assert!(
            offset < self.num_handles,
            "Descriptor offset {} is out of range [0, {})",
            offset,
            self.num_handles
        );
        self.first_cpu_handle.offset(offset, self.descriptor_size)
    }

    /// 第 `offset` 个描述符的 GPU 句柄，堆不是着色器可见时为 `None`
    pub fn gpu_handle(&self, offset: u32) -> Option<GpuDescriptorHandle> {
        debug_assert!(
            offset < self.num_handles,
            "Descriptor offset {} is out of range [0, {})",
            offset,
            self.num_handles
        );
        self.first_gpu_handle
            .map(|handle| handle.offset(offset, self.descriptor_size))
    }

    pub fn num_handles(&self) -> u32 {
        self.num_handles
    }

    pub fn is_shader_visible(&self) -> bool {
        self.first_gpu_handle.is_some()
    }

    /// 分配所属的管理器编号，用于把释放路由回正确的管理器
    pub fn allocation_manager_id(&self) -> u16 {
        self.allocation_manager_id
    }

    pub fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }

    /// 放弃这段槽位而不归还
    ///
    /// 用于所有权已经转移到别处（例如动态块的子分配）的情况。
    pub fn reset(&mut self) {
        self.first_cpu_handle = CpuDescriptorHandle::NULL;
        self.first_gpu_handle = None;
        self.num_handles = 0;
        self.allocation_manager_id = u16::MAX;
        self.descriptor_size = 0;
        self.owner = None;
    }

    /// 断开与所属分配器的关联，丢弃时不再回调
    pub(crate) fn detach_owner(&mut self) {
        self.owner = None;
    }
}

impl Default for DescriptorHeapAllocation {
    fn default() -> Self {
        Self::null()
    }
}

impl Drop for DescriptorHeapAllocation {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            if !self.is_null() {
                owner.free(std::mem::take(self));
            }
        }
    }
}

impl fmt::Debug for DescriptorHeapAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeapAllocation")
            .field("first_cpu_handle", &self.first_cpu_handle)
            .field("first_gpu_handle", &self.first_gpu_handle)
            .field("num_handles", &self.num_handles)
            .field("allocation_manager_id", &self.allocation_manager_id)
            .field("descriptor_size", &self.descriptor_size)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// 记录所有释放请求的分配器
    #[derive(Default)]
    struct RecordingAllocator {
        freed: Mutex<Vec<(usize, u32)>>,
    }

    impl DescriptorAllocator for RecordingAllocator {
        fn allocate(&self, _count: u32) -> DescriptorHeapAllocation {
            DescriptorHeapAllocation::null()
        }

        fn free(&self, mut allocation: DescriptorHeapAllocation) {
            self.freed
                .lock()
                .push((allocation.cpu_handle(0).ptr, allocation.num_handles()));
            allocation.reset();
        }

        fn descriptor_size(&self) -> u32 {
            32
        }
    }

    fn owned_allocation(owner: &Arc<RecordingAllocator>, ptr: usize, count: u32) -> DescriptorHeapAllocation {
        let owner: Arc<dyn DescriptorAllocator> = owner.clone();
        DescriptorHeapAllocation::new(
            Some(owner),
            CpuDescriptorHandle::new(ptr),
            Some(GpuDescriptorHandle::new(ptr as u64 * 2)),
            count,
            0,
            32,
        )
    }

    #[test]
    fn test_null_allocation() {
        let allocation = DescriptorHeapAllocation::null();
        assert!(allocation.is_null());
        assert_eq!(allocation.num_handles(), 0);
        assert!(!allocation.is_shader_visible());
    }

    #[test]
    fn test_handles() {
        let owner = Arc::new(RecordingAllocator::default());
        let mut allocation = owned_allocation(&owner, 1000, 4);

        assert_eq!(allocation.cpu_handle(0).ptr, 1000);
        assert_eq!(allocation.cpu_handle(3).ptr, 1096);
        assert_eq!(allocation.gpu_handle(1).map(|h| h.ptr), Some(2032));
        assert!(allocation.is_shader_visible());

        allocation.reset();
        drop(allocation);
        assert!(owner.freed.lock().is_empty());
    }

    #[test]
    fn test_drop_frees_exactly_once() {
        let owner = Arc::new(RecordingAllocator::default());
        {
            let allocation = owned_allocation(&owner, 4096, 8);
            // 移动不会触发释放
            let moved = allocation;
            let _kept = vec![moved];
        }
        assert_eq!(*owner.freed.lock(), vec![(4096, 8)]);
    }

    #[test]
    fn test_drop_on_early_return() {
        fn fallible(owner: &Arc<RecordingAllocator>) -> Result<(), &'static str> {
            let _allocation = owned_allocation(owner, 64, 2);
            Err("bail out")
        }

        let owner = Arc::new(RecordingAllocator::default());
        assert!(fallible(&owner).is_err());
        assert_eq!(owner.freed.lock().len(), 1);
    }
}
