//! 图形后端模块
//!
//! 描述符堆子系统通过 [`RenderDevice`] 访问设备，具体实现包括：
//! - `null`：不访问 GPU 的模拟设备，用于测试和演示
//! - `dx12`：DirectX 12 设备（仅 Windows）

pub mod backend;
pub mod null;
#[cfg(target_os = "windows")]
pub mod dx12;

pub use backend::{DescriptorHeapObject, RenderDevice};
pub use null::NullDevice;
#[cfg(target_os = "windows")]
pub use dx12::{Dx12Device, Dx12Fence};
