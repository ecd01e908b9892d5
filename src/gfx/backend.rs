//! 图形设备的统一抽象接口
//!
//! 描述符堆子系统只需要设备提供两件事：创建描述符堆，以及查询每种堆类型的描述符步长。
//! 所有分配器都通过构造函数显式接收 `Arc<dyn RenderDevice>`，不依赖任何全局单例，
//! 因此可以用 [`NullDevice`](super::null::NullDevice) 在没有 GPU 的环境下独立测试。

use std::any::Any;
use std::sync::Arc;

use crate::core::error::Result;
use crate::renderer::descriptor::{
    CpuDescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapType, GpuDescriptorHandle,
};

/// 设备创建出的描述符堆对象
pub trait DescriptorHeapObject: Send + Sync {
    /// 堆类型
    fn heap_type(&self) -> DescriptorHeapType;

    /// 堆中描述符数量
    fn num_descriptors(&self) -> u32;

    /// 是否着色器可见
    fn is_shader_visible(&self) -> bool;

    /// 第一个描述符的 CPU 句柄
    fn cpu_start(&self) -> CpuDescriptorHandle;

    /// 第一个描述符的 GPU 句柄（仅对着色器可见的堆）
    fn gpu_start(&self) -> Option<GpuDescriptorHandle>;

    /// 用于向下转换为具体后端的堆类型（例如绑定到命令列表）
    fn as_any(&self) -> &dyn Any;
}

/// 图形设备接口
pub trait RenderDevice: Send + Sync {
    /// 创建描述符堆
    ///
    /// 设备调用失败时返回 `GraphicsError::DescriptorHeapCreation`，
    /// 调用方不会重试。
    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDescriptor,
    ) -> Result<Arc<dyn DescriptorHeapObject>>;

    /// 指定堆类型中单个描述符的字节步长
    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32;

    /// 获取后端的名称，用于日志输出
    fn backend_name(&self) -> &str;
}
