//! 容器配置
//!
//! 定义容器内核的配置结构和加载逻辑。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::Result;

/// 框架起始级别配置键
///
/// 起始级别引擎在收到"使用起始配置"哨兵时从适配器属性中读取该键，
/// 缺省为 1。
pub const PROP_BEGINNING_START_LEVEL: &str = "framework.beginning.startlevel";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<std::path::PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 容器配置
///
/// 控制锁超时、解析后自动启动行为和动态解析缓存等内核参数。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// 状态变更锁与名称/位置锁的获取超时（毫秒）
    #[serde(default = "default_lock_timeout_ms")]
    pub state_lock_timeout_ms: u64,

    /// 解析完成后是否自动启动新解析出的持久启动模块。
    ///
    /// 参考实现始终执行此自动启动；关闭该项即偏离参考行为。
    #[serde(default = "default_true")]
    pub auto_start_on_resolve: bool,

    /// 动态解析失败缓存容量
    #[serde(default = "default_miss_cache_size")]
    pub dynamic_miss_cache_size: usize,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 框架属性（适配器属性查找的缺省来源）
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_miss_cache_size() -> usize {
    256
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            state_lock_timeout_ms: default_lock_timeout_ms(),
            auto_start_on_resolve: default_true(),
            dynamic_miss_cache_size: default_miss_cache_size(),
            logging: LogConfig::default(),
            properties: HashMap::new(),
        }
    }
}

impl ContainerConfig {
    /// 创建配置构建器
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::default()
    }

    /// 从 YAML 文件加载配置
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ContainerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// 状态变更锁超时
    pub fn state_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.state_lock_timeout_ms)
    }

    /// 查找框架属性
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// 容器配置构建器
#[derive(Debug, Default)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    /// 设置锁超时（毫秒）
    pub fn state_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.state_lock_timeout_ms = ms;
        self
    }

    /// 设置解析后自动启动行为
    pub fn auto_start_on_resolve(mut self, enable: bool) -> Self {
        self.config.auto_start_on_resolve = enable;
        self
    }

    /// 设置动态解析失败缓存容量
    pub fn dynamic_miss_cache_size(mut self, size: usize) -> Self {
        self.config.dynamic_miss_cache_size = size;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 设置框架属性
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> ContainerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ContainerConfig::default();
        assert_eq!(config.state_lock_timeout_ms, 5000);
        assert!(config.auto_start_on_resolve);
        assert_eq!(config.dynamic_miss_cache_size, 256);
    }

    #[test]
    fn test_builder() {
        let config = ContainerConfig::builder()
            .state_lock_timeout_ms(100)
            .auto_start_on_resolve(false)
            .log_level("debug")
            .property(PROP_BEGINNING_START_LEVEL, "3")
            .build();

        assert_eq!(config.state_lock_timeout(), Duration::from_millis(100));
        assert!(!config.auto_start_on_resolve);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.property(PROP_BEGINNING_START_LEVEL), Some("3"));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "state_lock_timeout_ms: 250\nlogging:\n  level: warn\nproperties:\n  framework.beginning.startlevel: \"2\""
        )
        .unwrap();

        let config = ContainerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.state_lock_timeout_ms, 250);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.property(PROP_BEGINNING_START_LEVEL), Some("2"));
        // 未出现的字段取默认值
        assert!(config.auto_start_on_resolve);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ContainerConfig::builder().state_lock_timeout_ms(42).build();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ContainerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.state_lock_timeout_ms, 42);
    }
}
