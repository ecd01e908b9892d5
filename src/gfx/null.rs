//! 模拟设备
//!
//! 不访问任何 GPU：每个描述符堆只是一段互不重叠的虚拟地址区间。
//! 用于测试和没有 DirectX 12 的平台上的演示程序。

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{DescriptorHeapObject, RenderDevice};
use crate::renderer::descriptor::{
    CpuDescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapType, GpuDescriptorHandle,
};

/// CPU 虚拟地址的起点（非零，保证空句柄可区分）
const CPU_ADDRESS_BASE: usize = 0x1000_0000;
/// GPU 虚拟地址的起点
const GPU_ADDRESS_BASE: u64 = 0x1_0000_0000;
/// 相邻堆之间的对齐
const HEAP_ADDRESS_ALIGNMENT: usize = 0x1000;

/// 模拟的描述符堆
#[derive(Debug)]
pub struct NullDescriptorHeap {
    heap_type: DescriptorHeapType,
    num_descriptors: u32,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,
    name: Option<String>,
}

impl NullDescriptorHeap {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl DescriptorHeapObject for NullDescriptorHeap {
    fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    fn num_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    fn is_shader_visible(&self) -> bool {
        self.gpu_start.is_some()
    }

    fn cpu_start(&self) -> CpuDescriptorHandle {
        self.cpu_start
    }

    fn gpu_start(&self) -> Option<GpuDescriptorHandle> {
        self.gpu_start
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct AddressSpace {
    next_cpu: usize,
    next_gpu: u64,
    heaps_created: usize,
}

/// 模拟设备
#[derive(Debug)]
pub struct NullDevice {
    addresses: Mutex<AddressSpace>,
    /// 允许创建的最大堆数量，超出后创建失败
    heap_limit: Option<usize>,
}

impl NullDevice {
    pub fn new() -> Self {
        Self {
            addresses: Mutex::new(AddressSpace {
                next_cpu: CPU_ADDRESS_BASE,
                next_gpu: GPU_ADDRESS_BASE,
                heaps_created: 0,
            }),
            heap_limit: None,
        }
    }

    /// 最多允许创建 `limit` 个堆，用于模拟设备调用失败
    pub fn with_heap_limit(limit: usize) -> Self {
        Self {
            heap_limit: Some(limit),
            ..Self::new()
        }
    }

    /// 已经创建的堆数量
    pub fn heaps_created(&self) -> usize {
        self.addresses.lock().heaps_created
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for NullDevice {
    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDescriptor,
    ) -> Result<Arc<dyn DescriptorHeapObject>> {
        if desc.num_descriptors == 0 {
            return Err(GraphicsError::DescriptorHeapCreation(format!(
                "{} heap must contain at least one descriptor",
                desc.heap_type.name()
            ))
            .into());
        }
        if desc.shader_visible && !desc.heap_type.can_be_shader_visible() {
            return Err(GraphicsError::DescriptorHeapCreation(format!(
                "{} heaps cannot be shader visible",
                desc.heap_type.name()
            ))
            .into());
        }

        let mut addresses = self.addresses.lock();
        if let Some(limit) = self.heap_limit {
            if addresses.heaps_created >= limit {
                return Err(GraphicsError::DescriptorHeapCreation(format!(
                    "Heap limit of {} reached while creating {} heap",
                    limit,
                    desc.heap_type.name()
                ))
                .into());
            }
        }

        let byte_size =
            desc.num_descriptors as usize * self.descriptor_increment_size(desc.heap_type) as usize;
        let reserved = (byte_size + HEAP_ADDRESS_ALIGNMENT - 1) & !(HEAP_ADDRESS_ALIGNMENT - 1);

        let cpu_start = CpuDescriptorHandle::new(addresses.next_cpu);
        addresses.next_cpu += reserved;

        let gpu_start = if desc.shader_visible {
            let start = GpuDescriptorHandle::new(addresses.next_gpu);
            addresses.next_gpu += reserved as u64;
            Some(start)
        } else {
            None
        };
        addresses.heaps_created += 1;

        debug!(
            heap_type = desc.heap_type.name(),
            num_descriptors = desc.num_descriptors,
            shader_visible = desc.shader_visible,
            cpu_start = cpu_start.ptr,
            "Null descriptor heap created"
        );

        Ok(Arc::new(NullDescriptorHeap {
            heap_type: desc.heap_type,
            num_descriptors: desc.num_descriptors,
            cpu_start,
            gpu_start,
            name: desc.name.clone(),
        }))
    }

    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32 {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => 32,
            DescriptorHeapType::Sampler => 32,
            DescriptorHeapType::Rtv => 32,
            DescriptorHeapType::Dsv => 8,
        }
    }

    fn backend_name(&self) -> &str {
        "Null"
    }
}
