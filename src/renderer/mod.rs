//! 渲染器模块
//!
//! 与具体图形 API 无关的描述符管理组件。
//!
//! - `sync`：Fence 抽象，描述符回收的时间基准
//! - `release`：按 Fence 值排序的延迟释放队列
//! - `descriptor`：描述符分配器的各个层级

pub mod sync;
pub mod release;
pub mod descriptor;
