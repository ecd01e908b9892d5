//! DistHeap 演示程序
//!
//! 模拟若干帧的描述符使用：每帧每个命令上下文从动态区域取描述符，
//! 偶尔创建和销毁长期存在的视图，并按 Fence 回收延迟释放的描述符。
//!
//! # 使用方法
//!
//! ```bash
//! cargo run -- --frames 120 --contexts 4
//!
//! # 使用 DirectX 12 设备（仅 Windows）
//! cargo run -- --dx12
//! ```
//!
//! # 命令行参数
//!
//! - `--frames <value>`: 模拟的帧数
//! - `--contexts <value>`: 命令上下文数量
//! - `--cpu-heap-size <value>` / `--dynamic-chunk-size <value>` / `--log-level <value>`: 覆盖配置

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use dist_heap::core::{log, Config};
use dist_heap::gfx::{NullDevice, RenderDevice};
use dist_heap::renderer::descriptor::{DescriptorHeapAllocation, DescriptorHeapSet, DescriptorHeapType};
use dist_heap::renderer::sync::{FenceManager, FenceSource, FenceValue};

/// 同时在 GPU 上执行的帧数
const FRAMES_IN_FLIGHT: u64 = 2;

/// Fence 时间线：提交一帧并返回它的 Fence 值
struct Timeline {
    fences: Arc<dyn FenceSource>,
    submit: Box<dyn Fn() -> dist_heap::core::Result<FenceValue>>,
    /// 模拟设备的 Fence，关闭时由 CPU 直接完成
    simulated: Option<Arc<FenceManager>>,
}

impl Timeline {
    /// 模拟 GPU：每次提交时，比当前帧早 `FRAMES_IN_FLIGHT` 帧的工作视为完成
    fn simulated() -> Self {
        let fences = Arc::new(FenceManager::new());
        let gpu = fences.clone();
        Self {
            fences: fences.clone(),
            simulated: Some(fences),
            submit: Box::new(move || {
                let value = gpu.signal();
                let completed = value.value().saturating_sub(FRAMES_IN_FLIGHT);
                gpu.update_completed_value(FenceValue::new(completed));
                Ok(value)
            }),
        }
    }
}

fn arg_value(args: &[String], flag: &str) -> Option<u32> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1))
        .and_then(|s| s.parse().ok())
}

#[cfg(target_os = "windows")]
fn create_backend(args: &[String]) -> Result<(Arc<dyn RenderDevice>, Timeline)> {
    use dist_heap::gfx::Dx12Device;

    if !args.iter().any(|a| a == "--dx12") {
        return Ok((Arc::new(NullDevice::new()), Timeline::simulated()));
    }

    let device = Dx12Device::new().context("Failed to initialize DirectX 12")?;
    let queue = device.create_command_queue()?;
    let fence = device.create_fence()?;
    let signal_fence = fence.clone();
    let timeline = Timeline {
        fences: fence,
        submit: Box::new(move || signal_fence.signal(&queue)),
        simulated: None,
    };
    Ok((Arc::new(device), timeline))
}

#[cfg(not(target_os = "windows"))]
fn create_backend(args: &[String]) -> Result<(Arc<dyn RenderDevice>, Timeline)> {
    if args.iter().any(|a| a == "--dx12") {
        anyhow::bail!("DX12 backend is only available on Windows");
    }
    Ok((Arc::new(NullDevice::new()), Timeline::simulated()))
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // 1. 加载配置（在初始化日志之前）
    let mut config = Config::from_file_or_default("distheap.toml");
    config.apply_args(&args);
    config.validate().context("Invalid configuration")?;

    // 2. 初始化日志系统
    let log_file = config
        .logging
        .file_output
        .then(|| config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file)?;
    info!(version = env!("CARGO_PKG_VERSION"), "DistHeap starting...");

    let frames = arg_value(&args, "--frames").unwrap_or(60);
    let contexts = arg_value(&args, "--contexts").unwrap_or(2).max(1);

    // 3. 创建设备和所有描述符堆
    let (device, timeline) = create_backend(&args)?;
    info!(backend = device.backend_name(), frames, contexts, "Device created");

    let heaps = DescriptorHeapSet::new(&config.descriptors, device, timeline.fences.clone())
        .context("Failed to create descriptor heaps")?;

    let mut dynamic_managers = (0..contexts)
        .map(|index| {
            heaps
                .create_dynamic_manager(DescriptorHeapType::CbvSrvUav, format!("Context {}", index))
                .context("CBV/SRV/UAV heap is not shader visible")
        })
        .collect::<Result<Vec<_>>>()?;

    // 4. 帧循环
    let mut render_targets = heaps.allocate_cpu(DescriptorHeapType::Rtv, 2);
    let mut depth = heaps.allocate_cpu(DescriptorHeapType::Dsv, 1);
    let mut textures: VecDeque<DescriptorHeapAllocation> = VecDeque::new();

    for frame in 0..frames {
        // 长期存在的纹理视图：每帧创建一个，保留最近 16 个
        textures.push_back(heaps.allocate_gpu(DescriptorHeapType::CbvSrvUav, 1 + frame % 4));
        if textures.len() > 16 {
            textures.pop_front();
        }

        // 每 30 帧模拟一次窗口大小改变，重建渲染目标
        if frame % 30 == 29 {
            render_targets = heaps.allocate_cpu(DescriptorHeapType::Rtv, 2);
            depth = heaps.allocate_cpu(DescriptorHeapType::Dsv, 1);
            debug!(frame, "Render targets recreated");
        }

        for (index, manager) in dynamic_managers.iter_mut().enumerate() {
            let draws = 8 + (frame as usize + index) % 8;
            for draw in 0..draws {
                let table = manager.allocate(1 + (draw % 5) as u32);
                if table.is_null() {
                    dist_heap::engine_warn!(frame, context = index, "Dynamic descriptors exhausted");
                    break;
                }
            }
        }

        // 动态块按本帧即将写入的 Fence 值进入延迟释放队列
        for manager in dynamic_managers.iter_mut() {
            manager.release_allocations();
        }
        let fence_value = (timeline.submit)()?;
        let purged = heaps.purge_releases();

        debug!(
            frame,
            fence = fence_value.value(),
            purged,
            pending = heaps.release_queue().len(),
            "Frame submitted"
        );
    }

    // 5. 关闭：释放所有描述符并等待 GPU
    drop(textures);
    drop(render_targets);
    drop(depth);

    let last_submitted = (timeline.submit)()?;
    debug!(
        completed = timeline.fences.completed_fence_value().value(),
        last_submitted = last_submitted.value(),
        "Waiting for GPU"
    );
    if let Some(gpu) = &timeline.simulated {
        gpu.update_completed_value(last_submitted);
    }
    let released = heaps.release_all(true)?;

    for stats in heaps.stats() {
        info!(
            heap_type = stats.heap_type.name(),
            capacity = stats.capacity,
            used = stats.used,
            peak = stats.peak,
            "Descriptor heap usage"
        );
    }
    for manager in &dynamic_managers {
        info!(
            context = manager.name(),
            peak_suballocations = manager.peak_suballocations_total(),
            peak_descriptors = manager.peak_descriptor_count(),
            "Dynamic descriptor usage"
        );
    }

    drop(dynamic_managers);
    info!(released, "DistHeap shut down");
    Ok(())
}
