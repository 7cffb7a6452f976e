//! 核心模块
//!
//! 包含容器配置。

pub mod config;

pub use config::{ContainerConfig, ContainerConfigBuilder, LogConfig, PROP_BEGINNING_START_LEVEL};
