//! 模块数据模型
//!
//! 包含容器的核心数据模型：
//! - 生命周期状态机与启动/停止选项
//! - 模块实体与修订版序列
//! - 修订版、能力与需求
//! - 布线与连线

pub mod metadata;
#[allow(clippy::module_inception)]
pub mod module;
pub mod revision;
pub mod wiring;

// 重导出常用类型
pub use metadata::{
    ActivationPolicy, ContainerEvent, ModuleEvent, ModuleId, StartOptions, State, StopOptions,
    SYSTEM_MODULE_ID,
};
pub use module::{Module, ModuleRevisions};
pub use revision::{
    directives, namespace, Capability, ModuleRevision, Requirement, RevisionBuilder, RevisionId,
};
pub use wiring::{ModuleWire, ModuleWiring};
