//! # Jimu Core - 积木容器内核
//!
//! 积木容器内核是动态组件运行时的模块容器核心，提供以下能力：
//!
//! - **生命周期编排**: 模块的安装、更新、卸载与准入控制
//! - **解析管线**: 乐观快照 → 纯函数解析 → 校验合并 → 事件发布
//! - **刷新引擎**: 取消解析闭包与后续重解析
//! - **起始级别**: 框架级与模块级起始级别状态机及后台调度器
//! - **配置与日志**: 统一的配置加载和结构化日志
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use jimu_core::container::adaptor::ContainerAdaptor;
//! use jimu_core::container::ModuleContainer;
//! use jimu_core::core::config::ContainerConfig;
//! use jimu_core::database::ModuleDatabase;
//! use jimu_core::module::RevisionBuilder;
//! use jimu_core::resolver::ModuleResolver;
//! use semver::Version;
//!
//! async fn bootstrap(
//!     adaptor: Arc<dyn ContainerAdaptor>,
//!     resolver: Arc<dyn ModuleResolver>,
//! ) -> jimu_core::Result<()> {
//!     let database = Arc::new(ModuleDatabase::new());
//!     let container = ModuleContainer::new(
//!         adaptor,
//!         resolver,
//!         database,
//!         ContainerConfig::default(),
//!     );
//!
//!     // 首个安装的模块即系统模块（id 0）
//!     let system = container
//!         .install(
//!             None,
//!             "System Module",
//!             &RevisionBuilder::named("system.module", Version::new(1, 0, 0)),
//!         )
//!         .await?;
//!     container.open().await?;
//!     container.resolve(Some(&[system.clone()]), true).await?;
//!     container.start(&system, Default::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `container` - 容器编排引擎（解析、刷新、起始级别、外观）
//! - `database` - 模块数据库（图存储、时间戳、排序）
//! - `module` - 数据模型（模块、修订版、布线、连线）
//! - `resolver` - 解析器接口
//! - `core` - 容器配置
//! - `utils` - 错误类型和日志系统

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod container;
pub mod core;
pub mod database;
pub mod module;
pub mod resolver;
pub mod utils;

// 重导出常用类型，方便使用
pub use container::adaptor::{
    AdminAction, CollisionHook, CollisionMode, ContainerAdaptor, ContainerListener,
    NoopCollisionHook,
};
pub use container::startlevel::USE_BEGINNING_START_LEVEL;
pub use container::{dependency_closure_revisions, ModuleContainer};
pub use database::{ModuleDatabase, Sort, WiringMap};
pub use module::{
    directives, namespace, ActivationPolicy, Capability, ContainerEvent, Module, ModuleEvent,
    ModuleId, ModuleRevision, ModuleWire, ModuleWiring, Requirement, RevisionBuilder, RevisionId,
    StartOptions, State, StopOptions, SYSTEM_MODULE_ID,
};
pub use resolver::{DeltaWiring, ModuleResolver};
pub use utils::{error_code, ContainerError, Result};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use crate::core::config::{ContainerConfig, ContainerConfigBuilder, PROP_BEGINNING_START_LEVEL};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
