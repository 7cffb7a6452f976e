//! 日志系统模块
//!
//! 基于 tracing 生态为容器内核提供结构化日志：
//!
//! - 多级别日志（TRACE, DEBUG, INFO, WARN, ERROR）
//! - JSON 格式输出（可选）
//! - 文件输出（异步非阻塞，按时间轮转）
//! - 按模块过滤（EnvFilter 指令）
//!
//! # 示例
//!
//! ```rust,no_run
//! use jimu_core::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//! use std::path::PathBuf;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LoggerConfig::builder()
//!         .level("debug")
//!         .file_output(PathBuf::from("./logs"))
//!         .rotation(RotationStrategy::Daily)
//!         .build();
//!
//!     let _guard = Logger::init(config)?;
//!
//!     tracing::info!(module_id = 3, "模块已解析");
//!     Ok(())
//! }
//! ```

use std::io;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::utils::Result;

// ==================== 日志轮转策略 ====================

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转（单个日志文件）
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从字符串解析轮转策略，未知值回落到每天轮转
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

// ==================== 日志配置 ====================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别（"trace" / "debug" / "info" / "warn" / "error"）
    pub level: String,

    /// 是否使用 JSON 格式输出
    pub json_format: bool,

    /// 是否输出到控制台
    pub console_output: bool,

    /// 文件输出目录（None 表示不输出到文件）
    pub file_output: Option<PathBuf>,

    /// 日志文件名前缀
    pub file_prefix: String,

    /// 日志轮转策略
    pub rotation: RotationStrategy,

    /// 自定义过滤指令（EnvFilter 格式），
    /// 例如 "jimu_core=debug,jimu_core::container=trace"
    pub filter_directives: Option<String>,

    /// 是否启用 ANSI 颜色（控制台输出）
    pub ansi_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "jimu-core".to_string(),
            rotation: RotationStrategy::Daily,
            filter_directives: None,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    fn env_filter(&self) -> EnvFilter {
        match &self.filter_directives {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::new(&self.level),
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 设置日志级别
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// 启用 JSON 格式输出
    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    /// 设置控制台输出
    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    /// 设置日志文件前缀
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    /// 设置轮转策略
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    /// 设置过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    /// 启用 ANSI 颜色
    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    /// 构建配置
    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ==================== 日志系统 ====================

/// 日志系统守卫
///
/// 持有非阻塞写入器的 WorkerGuard，丢弃时等待挂起的日志写入完成。
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 日志系统入口
pub struct Logger;

impl Logger {
    /// 初始化全局日志系统
    ///
    /// 重复初始化会返回错误（tracing 全局订阅器只能设置一次）。
    /// 返回的守卫在存活期间保证文件日志被完整写出。
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        let filter = config.env_filter();

        let file_layer_parts = match &config.file_output {
            Some(dir) => {
                let appender = RollingFileAppender::new(
                    config.rotation.to_rotation(),
                    dir,
                    format!("{}.log", config.file_prefix),
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                Some((writer, guard))
            }
            None => None,
        };

        let console_layer = config.console_output.then(|| {
            if config.json_format {
                fmt::layer()
                    .json()
                    .with_writer(io::stdout as fn() -> io::Stdout)
                    .boxed()
            } else {
                fmt::layer()
                    .with_ansi(config.ansi_colors)
                    .with_writer(io::stdout as fn() -> io::Stdout)
                    .boxed()
            }
        });

        let (file_layer, file_guard) = match file_layer_parts {
            Some((writer, guard)) => {
                let layer = if config.json_format {
                    fmt::layer().json().with_ansi(false).with_writer(writer).boxed()
                } else {
                    fmt::layer().with_ansi(false).with_writer(writer).boxed()
                };
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("日志系统初始化失败: {e}"))?;

        Ok(LogGuard {
            _file_guard: file_guard,
        })
    }
}
