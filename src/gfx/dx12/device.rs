//! DirectX 12 设备与 Fence

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE};

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{DescriptorHeapObject, RenderDevice};
use crate::renderer::descriptor::{DescriptorHeapDescriptor, DescriptorHeapType};
use crate::renderer::sync::{FenceSource, FenceValue};

use super::descriptor::{to_dx12_heap_type, Dx12DescriptorHeap};

/// DX12 设备
pub struct Dx12Device {
    device: ID3D12Device,
    /// 按 CBV_SRV_UAV、Sampler、RTV、DSV 顺序缓存的描述符步长
    increment_sizes: [u32; 4],
}

impl Dx12Device {
    /// 在默认适配器上创建设备
    pub fn new() -> Result<Self> {
        unsafe {
            #[cfg(debug_assertions)]
            {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            debug!("DX12 Debug Layer enabled");
                        }
                    }
                    Err(_) => warn!("Failed to enable DX12 Debug Layer"),
                }
            }

            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(None, D3D_FEATURE_LEVEL_11_0, &mut device).map_err(|e| {
                GraphicsError::DeviceCreation(format!("Failed to create D3D12 device: {:?}", e))
            })?;
            let device = device.ok_or_else(|| {
                GraphicsError::DeviceCreation("D3D12CreateDevice returned no device".to_string())
            })?;

            Ok(Self::from_device(device))
        }
    }

    /// 包装已有的设备
    pub fn from_device(device: ID3D12Device) -> Self {
        let increment_sizes = DescriptorHeapType::ALL.map(|heap_type| unsafe {
            device.GetDescriptorHandleIncrementSize(to_dx12_heap_type(heap_type))
        });

        info!(
            cbv_srv_uav = increment_sizes[0],
            sampler = increment_sizes[1],
            rtv = increment_sizes[2],
            dsv = increment_sizes[3],
            "DX12 device ready"
        );

        Self {
            device,
            increment_sizes,
        }
    }

    pub fn device(&self) -> &ID3D12Device {
        &self.device
    }

    /// 创建直接命令队列
    pub fn create_command_queue(&self) -> Result<ID3D12CommandQueue> {
        let queue_desc = D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        };
        unsafe {
            self.device.CreateCommandQueue(&queue_desc).map_err(|e| {
                GraphicsError::DeviceCreation(format!("Failed to create command queue: {:?}", e))
                    .into()
            })
        }
    }

    /// 创建 Fence
    pub fn create_fence(&self) -> Result<Arc<Dx12Fence>> {
        Dx12Fence::new(&self.device).map(Arc::new)
    }
}

impl RenderDevice for Dx12Device {
    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDescriptor,
    ) -> Result<Arc<dyn DescriptorHeapObject>> {
        let heap = Dx12DescriptorHeap::new(&self.device, desc)?;
        Ok(Arc::new(heap))
    }

    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32 {
        let index = match heap_type {
            DescriptorHeapType::CbvSrvUav => 0,
            DescriptorHeapType::Sampler => 1,
            DescriptorHeapType::Rtv => 2,
            DescriptorHeapType::Dsv => 3,
        };
        self.increment_sizes[index]
    }

    fn backend_name(&self) -> &str {
        "DirectX 12"
    }
}

// DX12 设备是线程安全的
unsafe impl Send for Dx12Device {}
unsafe impl Sync for Dx12Device {}

/// 基于 ID3D12Fence 的 Fence
///
/// 提交计数在 CPU 端维护；完成值直接读取 GPU。
pub struct Dx12Fence {
    fence: ID3D12Fence,
    last_signaled: AtomicU64,
    /// 等待用事件，同一时刻只允许一个等待者使用
    event: Mutex<HANDLE>,
}

impl Dx12Fence {
    pub fn new(device: &ID3D12Device) -> Result<Self> {
        unsafe {
            let fence: ID3D12Fence = device.CreateFence(0, D3D12_FENCE_FLAG_NONE).map_err(|e| {
                GraphicsError::FenceCreation(format!("Failed to create fence: {:?}", e))
            })?;
            let event = CreateEventA(None, false, false, None).map_err(|e| {
                GraphicsError::FenceCreation(format!("Failed to create fence event: {:?}", e))
            })?;

            Ok(Self {
                fence,
                last_signaled: AtomicU64::new(0),
                event: Mutex::new(event),
            })
        }
    }

    /// 在队列末尾写入下一个 Fence 值并返回它
    pub fn signal(&self, queue: &ID3D12CommandQueue) -> Result<FenceValue> {
        let value = self.last_signaled.fetch_add(1, Ordering::AcqRel) + 1;
        unsafe {
            queue.Signal(&self.fence, value).map_err(|e| {
                GraphicsError::FenceWait(format!("Failed to signal fence value {}: {:?}", value, e))
            })?;
        }
        Ok(FenceValue::new(value))
    }

    pub fn fence(&self) -> &ID3D12Fence {
        &self.fence
    }
}

impl FenceSource for Dx12Fence {
    fn next_fence_value(&self) -> FenceValue {
        FenceValue::new(self.last_signaled.load(Ordering::Acquire) + 1)
    }

    fn completed_fence_value(&self) -> FenceValue {
        FenceValue::new(unsafe { self.fence.GetCompletedValue() })
    }

    fn wait_for_value(&self, value: FenceValue) -> Result<()> {
        if self.completed_fence_value() >= value {
            return Ok(());
        }

        let event = self.event.lock();
        unsafe {
            self.fence
                .SetEventOnCompletion(value.value(), *event)
                .map_err(|e| {
                    GraphicsError::FenceWait(format!(
                        "Failed to wait for fence value {}: {:?}",
                        value.value(),
                        e
                    ))
                })?;
            WaitForSingleObject(*event, INFINITE);
        }
        Ok(())
    }
}

impl Drop for Dx12Fence {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(*self.event.get_mut());
        }
    }
}

// ID3D12Fence 是线程安全的，事件句柄由锁保护
unsafe impl Send for Dx12Fence {}
unsafe impl Sync for Dx12Fence {}
