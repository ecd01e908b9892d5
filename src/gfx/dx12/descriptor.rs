//! DirectX 12 描述符堆实现

use std::any::Any;
use windows::Win32::Graphics::Direct3D12::*;

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::DescriptorHeapObject;
use crate::renderer::descriptor::{
    CpuDescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapType, GpuDescriptorHandle,
};

/// 转换为 DX12 堆类型
pub fn to_dx12_heap_type(heap_type: DescriptorHeapType) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match heap_type {
        DescriptorHeapType::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapType::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapType::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapType::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

/// DX12 描述符堆
///
/// 封装 ID3D12DescriptorHeap，起始句柄在创建时读取一次。
pub struct Dx12DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    heap_type: DescriptorHeapType,
    num_descriptors: u32,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,
}

impl Dx12DescriptorHeap {
    pub fn new(device: &ID3D12Device, desc: &DescriptorHeapDescriptor) -> Result<Self> {
        let flags = if desc.shader_visible {
            D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
        } else {
            D3D12_DESCRIPTOR_HEAP_FLAG_NONE
        };

        let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: to_dx12_heap_type(desc.heap_type),
            NumDescriptors: desc.num_descriptors,
            Flags: flags,
            NodeMask: 0,
        };

        unsafe {
            let heap: ID3D12DescriptorHeap = device.CreateDescriptorHeap(&heap_desc).map_err(|e| {
                GraphicsError::DescriptorHeapCreation(format!(
                    "Failed to create {} descriptor heap with {} descriptors: {:?}",
                    desc.heap_type.name(),
                    desc.num_descriptors,
                    e
                ))
            })?;

            // 调试名称
            if let Some(name) = &desc.name {
                let wide_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
                let _ = heap.SetName(windows::core::PCWSTR(wide_name.as_ptr()));
            }

            let cpu_start = CpuDescriptorHandle::new(heap.GetCPUDescriptorHandleForHeapStart().ptr);
            let gpu_start = if desc.shader_visible {
                Some(GpuDescriptorHandle::new(heap.GetGPUDescriptorHandleForHeapStart().ptr))
            } else {
                None
            };

            Ok(Self {
                heap,
                heap_type: desc.heap_type,
                num_descriptors: desc.num_descriptors,
                cpu_start,
                gpu_start,
            })
        }
    }

    /// 底层 DX12 描述符堆，用于 SetDescriptorHeaps
    pub fn heap(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }
}

impl DescriptorHeapObject for Dx12DescriptorHeap {
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

/// 转换为 DX12 CPU 描述符句柄
pub fn to_dx12_cpu_handle(handle: CpuDescriptorHandle) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE { ptr: handle.ptr }
}

/// 转换为 DX12 GPU 描述符句柄
pub fn to_dx12_gpu_handle(handle: GpuDescriptorHandle) -> D3D12_GPU_DESCRIPTOR_HANDLE {
    D3D12_GPU_DESCRIPTOR_HANDLE { ptr: handle.ptr }
}

// DX12 堆是线程安全的
unsafe impl Send for Dx12DescriptorHeap {}
unsafe impl Sync for Dx12DescriptorHeap {}
