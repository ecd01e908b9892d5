//! 描述符堆集合
//!
//! 渲染设备持有的顶层上下文：四个 CPU 堆池、两个着色器可见堆和共享的延迟释放队列。

use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::DescriptorConfig;
use crate::core::error::Result;
use crate::gfx::backend::RenderDevice;
use crate::renderer::release::ReleaseQueue;
use crate::renderer::sync::{FenceSource, FenceValue};

use super::{
    CpuDescriptorHeap, DescriptorAllocator, DescriptorHeapAllocation, DescriptorHeapStats,
    DescriptorHeapType, DynamicSuballocationsManager, GpuDescriptorHeap,
};

/// 所有描述符堆
pub struct DescriptorHeapSet {
    device: Arc<dyn RenderDevice>,
    fences: Arc<dyn FenceSource>,
    releases: Arc<ReleaseQueue>,
    /// 按 [`DescriptorHeapType::ALL`] 的顺序
    cpu_heaps: Vec<Arc<CpuDescriptorHeap>>,
    gpu_cbv_srv_uav: Arc<GpuDescriptorHeap>,
    gpu_sampler: Arc<GpuDescriptorHeap>,
    chunk_cbv_srv_uav: u32,
    chunk_sampler: u32,
}

fn cpu_heap_index(heap_type: DescriptorHeapType) -> usize {
    match heap_type {
        DescriptorHeapType::CbvSrvUav => 0,
        DescriptorHeapType::Sampler => 1,
        DescriptorHeapType::Rtv => 2,
        DescriptorHeapType::Dsv => 3,
    }
}

impl DescriptorHeapSet {
    /// 按配置创建所有堆
    ///
    /// 任何一个堆创建失败都会直接返回错误。
    pub fn new(
        config: &DescriptorConfig,
        device: Arc<dyn RenderDevice>,
        fences: Arc<dyn FenceSource>,
    ) -> Result<Self> {
        let releases = Arc::new(ReleaseQueue::new());

        let cpu_sizes = &config.cpu_heap_sizes;
        let cpu_heaps = DescriptorHeapType::ALL
            .iter()
            .map(|&heap_type| {
                let heap_size = match heap_type {
                    DescriptorHeapType::CbvSrvUav => cpu_sizes.cbv_srv_uav,
                    DescriptorHeapType::Sampler => cpu_sizes.sampler,
                    DescriptorHeapType::Rtv => cpu_sizes.rtv,
                    DescriptorHeapType::Dsv => cpu_sizes.dsv,
                };
                CpuDescriptorHeap::new(
                    device.clone(),
                    releases.clone(),
                    fences.clone(),
                    heap_size,
                    heap_type,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let gpu_sizes = &config.gpu_heap_sizes;
        let gpu_cbv_srv_uav = GpuDescriptorHeap::new(
            device.clone(),
            releases.clone(),
            fences.clone(),
            gpu_sizes.cbv_srv_uav.static_size,
            gpu_sizes.cbv_srv_uav.dynamic_size,
            DescriptorHeapType::CbvSrvUav,
        )?;
        let gpu_sampler = GpuDescriptorHeap::new(
            device.clone(),
            releases.clone(),
            fences.clone(),
            gpu_sizes.sampler.static_size,
            gpu_sizes.sampler.dynamic_size,
            DescriptorHeapType::Sampler,
        )?;

        crate::engine_info!(
            backend = device.backend_name(),
            gpu_cbv_srv_uav = gpu_sizes.cbv_srv_uav.total(),
            gpu_sampler = gpu_sizes.sampler.total(),
            "Descriptor heaps initialized"
        );

        Ok(Self {
            device,
            fences,
            releases,
            cpu_heaps,
            gpu_cbv_srv_uav,
            gpu_sampler,
            chunk_cbv_srv_uav: config.dynamic_chunk_sizes.cbv_srv_uav,
            chunk_sampler: config.dynamic_chunk_sizes.sampler,
        })
    }

    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    pub fn release_queue(&self) -> &Arc<ReleaseQueue> {
        &self.releases
    }

    pub fn cpu_heap(&self, heap_type: DescriptorHeapType) -> &Arc<CpuDescriptorHeap> {
        &self.cpu_heaps[cpu_heap_index(heap_type)]
    }

    /// 着色器可见堆，RTV 和 DSV 没有
    pub fn gpu_heap(&self, heap_type: DescriptorHeapType) -> Option<&Arc<GpuDescriptorHeap>> {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => Some(&self.gpu_cbv_srv_uav),
            DescriptorHeapType::Sampler => Some(&self.gpu_sampler),
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => None,
        }
    }

    /// 从 CPU 堆池分配
    pub fn allocate_cpu(&self, heap_type: DescriptorHeapType, count: u32) -> DescriptorHeapAllocation {
        self.cpu_heap(heap_type).allocate(count)
    }

    /// 从着色器可见堆的静态区域分配
    ///
    /// RTV 和 DSV 返回空分配。
    pub fn allocate_gpu(&self, heap_type: DescriptorHeapType, count: u32) -> DescriptorHeapAllocation {
        match self.gpu_heap(heap_type) {
            Some(heap) => heap.allocate(count),
            None => {
                warn!(
                    heap_type = heap_type.name(),
                    "Requested shader visible descriptors from a CPU-only heap type"
                );
                DescriptorHeapAllocation::null()
            }
        }
    }

    /// 为一个命令上下文创建动态分配器，块大小取自配置
    pub fn create_dynamic_manager(
        &self,
        heap_type: DescriptorHeapType,
        name: impl Into<String>,
    ) -> Option<DynamicSuballocationsManager> {
        let chunk_size = match heap_type {
            DescriptorHeapType::CbvSrvUav => self.chunk_cbv_srv_uav,
            DescriptorHeapType::Sampler => self.chunk_sampler,
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => return None,
        };
        let parent = self.gpu_heap(heap_type)?.clone();
        Some(DynamicSuballocationsManager::new(parent, chunk_size, name))
    }

    /// 回收 GPU 已经完成的延迟释放，通常每帧调用一次
    pub fn purge_releases(&self) -> usize {
        let purged = self.releases.purge(self.fences.completed_fence_value());
        if purged > 0 {
            debug!(purged, remaining = self.releases.len(), "Purged stale descriptors");
        }
        purged
    }

    /// 回收所有延迟释放
    ///
    /// `wait` 为 true 时先等待最后一次提交的 Fence 值；为 false 时调用方必须保证 GPU 已空闲。
    pub fn release_all(&self, wait: bool) -> Result<usize> {
        if wait {
            let last_submitted = self.fences.next_fence_value().value().saturating_sub(1);
            if last_submitted > 0 {
                self.fences.wait_for_value(FenceValue::new(last_submitted))?;
            }
        }
        Ok(self.releases.purge_all())
    }

    /// 所有堆的使用统计：四个 CPU 堆池，然后是两个着色器可见堆的静态和动态区域
    pub fn stats(&self) -> Vec<DescriptorHeapStats> {
        let mut stats: Vec<DescriptorHeapStats> =
            self.cpu_heaps.iter().map(|heap| heap.stats()).collect();
        for heap in [&self.gpu_cbv_srv_uav, &self.gpu_sampler] {
            stats.push(heap.static_stats());
            stats.push(heap.dynamic_stats());
        }
        stats
    }
}

impl Drop for DescriptorHeapSet {
    fn drop(&mut self) {
        // 队列中的条目持有堆的引用；集合销毁后，仍存活的分配直接归还到堆
        let pending = self.releases.len();
        if pending > 0 {
            crate::engine_warn!(
                pending,
                "Descriptor heap set dropped with pending releases, forcing purge"
            );
            self.releases.purge_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::null::NullDevice;
    use crate::renderer::sync::FenceManager;

    fn create_set() -> (DescriptorHeapSet, Arc<FenceManager>) {
        let mut config = Config::default();
        config.descriptors.cpu_heap_sizes.rtv = 4;
        config.descriptors.gpu_heap_sizes.sampler.static_size = 8;
        config.descriptors.gpu_heap_sizes.sampler.dynamic_size = 8;
        config.descriptors.dynamic_chunk_sizes.sampler = 4;

        let fences = Arc::new(FenceManager::new());
        let set = DescriptorHeapSet::new(
            &config.descriptors,
            Arc::new(NullDevice::new()),
            fences.clone(),
        )
        .unwrap();
        (set, fences)
    }

    #[test]
    fn test_allocations_by_type() {
        let (set, _fences) = create_set();

        let rtv = set.allocate_cpu(DescriptorHeapType::Rtv, 2);
        assert!(!rtv.is_null());
        assert!(!rtv.is_shader_visible());

        let srv = set.allocate_gpu(DescriptorHeapType::CbvSrvUav, 4);
        assert!(srv.is_shader_visible());

        assert!(set.allocate_gpu(DescriptorHeapType::Dsv, 1).is_null());
        assert!(set.create_dynamic_manager(DescriptorHeapType::Rtv, "rtv").is_none());

        drop((rtv, srv));
        assert_eq!(set.release_all(false).unwrap(), 2);
    }

    #[test]
    fn test_purge_releases_follows_fence() {
        let (set, fences) = create_set();

        let allocation = set.allocate_cpu(DescriptorHeapType::Rtv, 4);
        drop(allocation);
        assert_eq!(set.purge_releases(), 0);

        let value = fences.signal();
        fences.update_completed_value(value);
        assert_eq!(set.purge_releases(), 1);
        assert_eq!(set.cpu_heap(DescriptorHeapType::Rtv).current_size(), 0);
    }

    #[test]
    fn test_release_all_waits_for_last_submission() {
        let (set, fences) = create_set();

        let mut manager = set
            .create_dynamic_manager(DescriptorHeapType::Sampler, "Context 0")
            .unwrap();
        assert_eq!(manager.chunk_size(), 4);
        let _sampler = manager.allocate(3);
        manager.release_allocations();

        let submitted = fences.signal();
        let completer = {
            let fences = fences.clone();
            std::thread::spawn(move || fences.update_completed_value(submitted))
        };

        assert_eq!(set.release_all(true).unwrap(), 1);
        completer.join().unwrap();
        assert_eq!(set.gpu_heap(DescriptorHeapType::Sampler).unwrap().dynamic_size(), 0);
    }

    #[test]
    fn test_allocations_outlive_the_set() {
        let (set, _fences) = create_set();

        let mut manager = set
            .create_dynamic_manager(DescriptorHeapType::Sampler, "Context 0")
            .unwrap();
        let sampler = manager.allocate(3);
        assert!(!sampler.is_null());
        let rtv = set.allocate_cpu(DescriptorHeapType::Rtv, 2);

        let gpu = set.gpu_heap(DescriptorHeapType::Sampler).unwrap().clone();
        let cpu = set.cpu_heap(DescriptorHeapType::Rtv).clone();
        drop(set);

        // 队列随集合一起销毁，之后的释放立即生效
        drop(sampler);
        manager.release_allocations();
        assert_eq!(gpu.dynamic_size(), 0);
        drop(rtv);
        assert_eq!(cpu.current_size(), 0);

        // 没有残留的引用环
        drop(manager);
        assert_eq!(Arc::strong_count(&gpu), 1);
        assert_eq!(Arc::strong_count(&cpu), 1);
    }

    #[test]
    fn test_stats_cover_every_heap() {
        let (set, _fences) = create_set();

        let allocation = set.allocate_cpu(DescriptorHeapType::Rtv, 3);
        let stats = set.stats();
        assert_eq!(stats.len(), 8);
        assert_eq!(stats[2].heap_type, DescriptorHeapType::Rtv);
        assert_eq!(stats[2].used, 3);
        assert_eq!(stats[2].capacity, 4);
        assert_eq!(stats[6].heap_type, DescriptorHeapType::Sampler);
        assert_eq!(stats[6].capacity, 8);

        drop(allocation);
        set.release_all(false).unwrap();
    }
}
