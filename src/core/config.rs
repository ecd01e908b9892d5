//! 配置管理模块
//!
//! 提供描述符堆子系统配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (distheap.toml)
//!
//! ```toml
//! [descriptors.cpu_heap_sizes]
//! cbv_srv_uav = 8192
//! sampler = 2048
//! rtv = 1024
//! dsv = 1024
//!
//! [descriptors.gpu_heap_sizes.cbv_srv_uav]
//! static_size = 16384
//! dynamic_size = 8192
//!
//! [descriptors.gpu_heap_sizes.sampler]
//! static_size = 1024
//! dynamic_size = 1024
//!
//! [descriptors.dynamic_chunk_sizes]
//! cbv_srv_uav = 256
//! sampler = 32
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};

/// 子系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 描述符堆配置
    #[serde(default)]
    pub descriptors: DescriptorConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 描述符堆配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorConfig {
    /// CPU 描述符堆的默认大小（按堆类型）
    #[serde(default)]
    pub cpu_heap_sizes: CpuHeapSizes,

    /// 着色器可见堆的静态/动态区域划分
    #[serde(default)]
    pub gpu_heap_sizes: GpuHeapSizes,

    /// 动态描述符块大小
    #[serde(default)]
    pub dynamic_chunk_sizes: DynamicChunkSizes,
}

/// CPU 描述符堆大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuHeapSizes {
    #[serde(default = "default_cpu_cbv_srv_uav")]
    pub cbv_srv_uav: u32,
    #[serde(default = "default_cpu_sampler")]
    pub sampler: u32,
    #[serde(default = "default_cpu_rtv")]
    pub rtv: u32,
    #[serde(default = "default_cpu_dsv")]
    pub dsv: u32,
}

/// 单个着色器可见堆的划分
///
/// `[0, static_size)` 用于静态/可变资源，
/// `[static_size, static_size + dynamic_size)` 用于动态资源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuHeapSplit {
    pub static_size: u32,
    pub dynamic_size: u32,
}

impl GpuHeapSplit {
    /// 堆的总容量
    pub fn total(&self) -> u32 {
        self.static_size + self.dynamic_size
    }
}

/// GPU 描述符堆大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuHeapSizes {
    #[serde(default = "default_gpu_cbv_srv_uav")]
    pub cbv_srv_uav: GpuHeapSplit,
    #[serde(default = "default_gpu_sampler")]
    pub sampler: GpuHeapSplit,
}

/// 动态描述符块大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicChunkSizes {
    #[serde(default = "default_chunk_cbv_srv_uav")]
    pub cbv_srv_uav: u32,
    #[serde(default = "default_chunk_sampler")]
    pub sampler: u32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("unknown log level '{}'", other),
            }),
        }
    }
}

// 默认值函数
fn default_cpu_cbv_srv_uav() -> u32 { 8192 }
fn default_cpu_sampler() -> u32 { 2048 }
fn default_cpu_rtv() -> u32 { 1024 }
fn default_cpu_dsv() -> u32 { 1024 }
fn default_gpu_cbv_srv_uav() -> GpuHeapSplit { GpuHeapSplit { static_size: 16384, dynamic_size: 8192 } }
fn default_gpu_sampler() -> GpuHeapSplit { GpuHeapSplit { static_size: 1024, dynamic_size: 1024 } }
fn default_chunk_cbv_srv_uav() -> u32 { 256 }
fn default_chunk_sampler() -> u32 { 32 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "distheap.log".to_string() }

impl Default for CpuHeapSizes {
    fn default() -> Self {
        Self {
            cbv_srv_uav: default_cpu_cbv_srv_uav(),
            sampler: default_cpu_sampler(),
            rtv: default_cpu_rtv(),
            dsv: default_cpu_dsv(),
        }
    }
}

impl Default for GpuHeapSizes {
    fn default() -> Self {
        Self {
            cbv_srv_uav: default_gpu_cbv_srv_uav(),
            sampler: default_gpu_sampler(),
        }
    }
}

impl Default for DynamicChunkSizes {
    fn default() -> Self {
        Self {
            cbv_srv_uav: default_chunk_cbv_srv_uav(),
            sampler: default_chunk_sampler(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    ///
    /// # 示例
    ///
    /// ```no_run
    /// use dist_heap::core::Config;
    ///
    /// let config = Config::from_file("distheap.toml")?;
    /// # Ok::<(), dist_heap::core::DistHeapError>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml_str(&contents)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--cpu-heap-size <value>`: 所有 CPU 描述符堆的默认大小
    /// - `--dynamic-chunk-size <value>`: CBV/SRV/UAV 动态块大小
    /// - `--log-level <value>`: 日志级别
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        let value_of = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|idx| args.get(idx + 1))
        };

        if let Some(size) = value_of("--cpu-heap-size").and_then(|s| s.parse::<u32>().ok()) {
            let sizes = &mut self.descriptors.cpu_heap_sizes;
            sizes.cbv_srv_uav = size;
            sizes.sampler = size;
            sizes.rtv = size;
            sizes.dsv = size;
        }

        if let Some(size) = value_of("--dynamic-chunk-size").and_then(|s| s.parse::<u32>().ok()) {
            self.descriptors.dynamic_chunk_sizes.cbv_srv_uav = size;
        }

        if let Some(level) = value_of("--log-level").and_then(|s| s.parse::<LogLevel>().ok()) {
            self.logging.level = level;
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let cpu = &self.descriptors.cpu_heap_sizes;
        for (field, size) in [
            ("descriptors.cpu_heap_sizes.cbv_srv_uav", cpu.cbv_srv_uav),
            ("descriptors.cpu_heap_sizes.sampler", cpu.sampler),
            ("descriptors.cpu_heap_sizes.rtv", cpu.rtv),
            ("descriptors.cpu_heap_sizes.dsv", cpu.dsv),
        ] {
            if size == 0 {
                return Err(invalid(field, "CPU heap size must be greater than 0"));
            }
        }

        let gpu = &self.descriptors.gpu_heap_sizes;
        let chunks = &self.descriptors.dynamic_chunk_sizes;
        for (name, split, chunk) in [
            ("cbv_srv_uav", gpu.cbv_srv_uav, chunks.cbv_srv_uav),
            ("sampler", gpu.sampler, chunks.sampler),
        ] {
            if split.total() == 0 {
                return Err(invalid(
                    &format!("descriptors.gpu_heap_sizes.{}", name),
                    "GPU heap must hold at least one descriptor",
                ));
            }
            if chunk == 0 {
                return Err(invalid(
                    &format!("descriptors.dynamic_chunk_sizes.{}", name),
                    "dynamic chunk size must be greater than 0",
                ));
            }
            if chunk > split.dynamic_size {
                return Err(invalid(
                    &format!("descriptors.dynamic_chunk_sizes.{}", name),
                    "dynamic chunk size must not exceed the dynamic region",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> super::error::DistHeapError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
