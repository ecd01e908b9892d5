//! 描述符管理模块
//!
//! 负责在后备描述符堆中分配、跟踪和回收固定大小的描述符槽位。
//!
//! # 组件（从底层到上层）
//!
//! - [`VariableSizeAllocationsManager`]：与 GPU 无关的变长区间分配器（最佳适配 + 合并）
//! - [`DescriptorHeapAllocation`]：一段连续描述符槽位的独占句柄，析构时自动归还
//! - [`DescriptorHeapAllocationManager`]：把一个变长分配器绑定到一个具体的堆（或堆的子区间）
//! - [`CpuDescriptorHeap`]：CPU 可见描述符堆池，耗尽时追加新堆
//! - [`GpuDescriptorHeap`]：唯一的着色器可见堆，划分为静态区域和动态区域
//! - [`DynamicSuballocationsManager`]：每个命令上下文私有的动态描述符分配器
//! - [`DescriptorHeapSet`]：持有以上所有堆的顶层上下文
//!
//! # 释放策略
//!
//! 描述符从不同步释放。释放时带上"下一个 Fence 值"进入延迟释放队列，
//! GPU 完成该值之后才真正回到空闲列表。
//!
//! # DirectX 12 堆类型
//!
//! - **CBV_SRV_UAV**：常量缓冲、着色资源和无序访问视图，可着色器可见
//! - **Sampler**：采样器，可着色器可见
//! - **RTV** / **DSV**：渲染目标和深度模板视图，仅 CPU 可见

pub mod variable_size;
pub mod allocation;
pub mod manager;
pub mod cpu_heap;
pub mod gpu_heap;
pub mod dynamic;
pub mod heap_set;

pub use variable_size::{Allocation, VariableSizeAllocationsManager};
pub use allocation::DescriptorHeapAllocation;
pub use manager::DescriptorHeapAllocationManager;
pub use cpu_heap::CpuDescriptorHeap;
pub use gpu_heap::GpuDescriptorHeap;
pub use dynamic::DynamicSuballocationsManager;
pub use heap_set::DescriptorHeapSet;

/// 描述符堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// CBV / SRV / UAV
    CbvSrvUav,
    /// 采样器
    Sampler,
    /// 渲染目标视图
    Rtv,
    /// 深度模板视图
    Dsv,
}

impl DescriptorHeapType {
    /// 所有堆类型
    pub const ALL: [DescriptorHeapType; 4] = [
        DescriptorHeapType::CbvSrvUav,
        DescriptorHeapType::Sampler,
        DescriptorHeapType::Rtv,
        DescriptorHeapType::Dsv,
    ];

    /// 该类型的堆能否设为着色器可见
    pub fn can_be_shader_visible(&self) -> bool {
        matches!(self, DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler)
    }

    /// 获取堆类型名称
    pub fn name(&self) -> &'static str {
        match self {
            DescriptorHeapType::CbvSrvUav => "CBV_SRV_UAV",
            DescriptorHeapType::Sampler => "SAMPLER",
            DescriptorHeapType::Rtv => "RTV",
            DescriptorHeapType::Dsv => "DSV",
        }
    }
}

/// 描述符堆描述信息
#[derive(Debug, Clone)]
pub struct DescriptorHeapDescriptor {
    /// 堆类型
    pub heap_type: DescriptorHeapType,
    /// 描述符数量
    pub num_descriptors: u32,
    /// 是否着色器可见
    pub shader_visible: bool,
    /// 调试名称
    pub name: Option<String>,
}

impl DescriptorHeapDescriptor {
    /// 创建新的 CPU 可见描述符堆描述
    pub fn new(heap_type: DescriptorHeapType, num_descriptors: u32) -> Self {
        Self {
            heap_type,
            num_descriptors,
            shader_visible: false,
            name: None,
        }
    }

    /// 设置调试名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 设置着色器可见性
    pub fn with_shader_visible(mut self, visible: bool) -> Self {
        debug_assert!(
            !visible || self.heap_type.can_be_shader_visible(),
            "{} heaps cannot be shader visible",
            self.heap_type.name()
        );
        self.shader_visible = visible;
        self
    }

    /// 创建 RTV 堆描述
    pub fn rtv(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapType::Rtv, num_descriptors).with_name("RTV Heap")
    }

    /// 创建 DSV 堆描述
    pub fn dsv(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapType::Dsv, num_descriptors).with_name("DSV Heap")
    }

    /// 创建着色器可见的 CBV/SRV/UAV 堆描述
    pub fn cbv_srv_uav(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapType::CbvSrvUav, num_descriptors)
            .with_shader_visible(true)
            .with_name("CBV/SRV/UAV Heap")
    }

    /// 创建着色器可见的采样器堆描述
    pub fn sampler(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapType::Sampler, num_descriptors)
            .with_shader_visible(true)
            .with_name("Sampler Heap")
    }
}

/// 描述符句柄（CPU 可见）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle {
    /// 句柄指针值，0 表示空句柄
    pub ptr: usize,
}

impl CpuDescriptorHandle {
    pub const NULL: Self = Self { ptr: 0 };

    /// 创建新的 CPU 描述符句柄
    pub fn new(ptr: usize) -> Self {
        Self { ptr }
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    /// 偏移句柄
    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + count as usize * increment_size as usize,
        }
    }
}

/// 描述符句柄（GPU 可见）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle {
    /// 句柄指针值
    pub ptr: u64,
}

impl GpuDescriptorHandle {
    /// 创建新的 GPU 描述符句柄
    pub fn new(ptr: u64) -> Self {
        Self { ptr }
    }

    /// 偏移句柄
    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + count as u64 * increment_size as u64,
        }
    }
}

/// 描述符分配器接口
///
/// 由 [`CpuDescriptorHeap`] 和 [`GpuDescriptorHeap`] 实现。
/// 分配出的 [`DescriptorHeapAllocation`] 持有分配器的引用，析构时回调 `free`。
pub trait DescriptorAllocator: Send + Sync {
    /// 分配 `count` 个连续描述符，失败时返回空分配
    fn allocate(&self, count: u32) -> DescriptorHeapAllocation;

    /// 归还分配；实际回收推迟到 GPU 不再使用之后
    fn free(&self, allocation: DescriptorHeapAllocation);

    /// 单个描述符的字节步长
    fn descriptor_size(&self) -> u32;
}

/// 描述符堆统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorHeapStats {
    /// 堆类型
    pub heap_type: DescriptorHeapType,
    /// 总容量
    pub capacity: u32,
    /// 已使用数量
    pub used: u32,
    /// 可用数量
    pub available: u32,
    /// 历史峰值
    pub peak: u32,
    /// 使用率 (0.0 - 1.0)
    pub usage_ratio: f32,
}

impl DescriptorHeapStats {
    /// 创建新的统计信息
    pub fn new(heap_type: DescriptorHeapType, capacity: u32, used: u32, peak: u32) -> Self {
        let available = capacity.saturating_sub(used);
        let usage_ratio = if capacity > 0 {
            used as f32 / capacity as f32
        } else {
            0.0
        };

        Self {
            heap_type,
            capacity,
            used,
            available,
            peak,
            usage_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_type() {
        assert_eq!(DescriptorHeapType::CbvSrvUav.name(), "CBV_SRV_UAV");
        assert!(DescriptorHeapType::Sampler.can_be_shader_visible());
        assert!(!DescriptorHeapType::Rtv.can_be_shader_visible());
    }

    #[test]
    fn test_descriptor_heap_descriptor() {
        let desc = DescriptorHeapDescriptor::rtv(100);
        assert_eq!(desc.heap_type, DescriptorHeapType::Rtv);
        assert_eq!(desc.num_descriptors, 100);
        assert!(!desc.shader_visible);
        assert_eq!(desc.name, Some("RTV Heap".to_string()));

        let desc = DescriptorHeapDescriptor::cbv_srv_uav(128);
        assert!(desc.shader_visible);
    }

    #[test]
    fn test_descriptor_handle_offset() {
        let cpu = CpuDescriptorHandle::new(1000);
        assert_eq!(cpu.offset(5, 32).ptr, 1160);
        assert!(CpuDescriptorHandle::NULL.is_null());

        let gpu = GpuDescriptorHandle::new(2000);
        assert_eq!(gpu.offset(10, 32).ptr, 2320);
    }

    #[test]
    fn test_descriptor_heap_stats() {
        let stats = DescriptorHeapStats::new(DescriptorHeapType::Rtv, 100, 50, 75);
        assert_eq!(stats.available, 50);
        assert_eq!(stats.peak, 75);
        assert_eq!(stats.usage_ratio, 0.5);
    }
}
