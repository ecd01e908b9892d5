//! DirectX 12 后端
//!
//! - `descriptor`：ID3D12DescriptorHeap 的封装
//! - `device`：ID3D12Device 和 ID3D12Fence 的封装

pub mod descriptor;
pub mod device;

pub use descriptor::Dx12DescriptorHeap;
pub use device::{Dx12Device, Dx12Fence};
