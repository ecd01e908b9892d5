//! DistHeap - DirectX 12 描述符堆分配子系统
//!
//! 在 CPU 可见和着色器可见的描述符堆中分配、跟踪和回收描述符槽位，
//! 并保证 GPU 仍可能读取的槽位不会被提前复用。
//!
//! # 模块结构
//!
//! - `core`: 日志、配置、错误处理
//! - `renderer`: Fence、延迟释放队列和描述符分配器
//! - `gfx`: 图形设备抽象（模拟设备和 DX12）
//!
//! # 使用示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use dist_heap::core::Config;
//! use dist_heap::gfx::NullDevice;
//! use dist_heap::renderer::descriptor::{DescriptorHeapSet, DescriptorHeapType};
//! use dist_heap::renderer::sync::FenceManager;
//!
//! let config = Config::default();
//! let fences = Arc::new(FenceManager::new());
//! let heaps = DescriptorHeapSet::new(&config.descriptors, Arc::new(NullDevice::new()), fences.clone())?;
//!
//! let rtv = heaps.allocate_cpu(DescriptorHeapType::Rtv, 2);
//! drop(rtv);
//!
//! let value = fences.signal();
//! fences.update_completed_value(value);
//! heaps.purge_releases();
//! # Ok::<(), dist_heap::core::DistHeapError>(())
//! ```

pub mod core;
pub mod renderer;
pub mod gfx;
