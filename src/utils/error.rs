//! 积木容器内核错误类型定义
//!
//! 本模块定义了容器内核中使用的所有错误类型。

use semver::Version;
use thiserror::Error;

/// 容器内核核心错误类型
#[derive(Error, Debug)]
pub enum ContainerError {
    // ==================== 准入控制错误 ====================

    /// 状态变更锁获取失败（超时或任务被取消）
    #[error("状态变更失败: {0}")]
    StateChange(String),

    /// 安装被碰撞钩子拒绝
    #[error("安装被钩子拒绝: {0}")]
    RejectedByHook(String),

    /// 同名同版本模块已存在
    #[error("已安装同名模块: '{name}' 版本 '{version}'")]
    DuplicateModule { name: String, version: Version },

    /// 模块已卸载，操作无效
    #[error("模块已卸载: id={0}")]
    Uninstalled(u64),

    // ==================== 解析错误 ====================

    /// 解析失败
    #[error("解析失败: {0}")]
    Resolution(String),

    // ==================== 生命周期错误 ====================

    /// 瞬态启动的起始级别高于当前活动起始级别
    #[error("模块 {module} 的起始级别 {start_level} 高于活动起始级别 {active}，无法瞬态启动")]
    StartLevelNotMet {
        module: u64,
        start_level: i32,
        active: i32,
    },

    /// 操作不合法（如启动 fragment、设置系统模块起始级别）
    #[error("非法操作: {0}")]
    InvalidOperation(String),

    /// 权限不足
    #[error("权限被拒绝: {0}")]
    PermissionDenied(String),

    // ==================== 内部错误 ====================

    /// 不变量被破坏（程序缺陷）
    #[error("内部错误: {0}")]
    Internal(String),

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 容器操作结果类型别名
pub type Result<T> = std::result::Result<T, ContainerError>;

/// 错误码常量
///
/// 以标记形式向调用方暴露的失败类别。
pub mod error_code {
    /// 状态变更锁获取失败
    pub const STATE_CHANGE_ERROR: &str = "STATE_CHANGE_ERROR";
    /// 碰撞钩子拒绝
    pub const REJECTED_BY_HOOK: &str = "REJECTED_BY_HOOK";
    /// 同名同版本碰撞
    pub const DUPLICATE_BUNDLE_ERROR: &str = "DUPLICATE_BUNDLE_ERROR";
    /// 解析失败
    pub const RESOLUTION_ERROR: &str = "RESOLUTION_ERROR";
    /// 瞬态启动失败
    pub const START_TRANSIENT_ERROR: &str = "START_TRANSIENT_ERROR";
    /// 权限不足
    pub const PERMISSION_ERROR: &str = "PERMISSION_ERROR";
    /// 模块已卸载
    pub const INVALID_STATE_ERROR: &str = "INVALID_STATE_ERROR";
    /// 内部不变量被破坏
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

impl ContainerError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            ContainerError::StateChange(_) => error_code::STATE_CHANGE_ERROR,
            ContainerError::RejectedByHook(_) => error_code::REJECTED_BY_HOOK,
            ContainerError::DuplicateModule { .. } => error_code::DUPLICATE_BUNDLE_ERROR,
            ContainerError::Resolution(_) => error_code::RESOLUTION_ERROR,
            ContainerError::StartLevelNotMet { .. } => error_code::START_TRANSIENT_ERROR,
            ContainerError::PermissionDenied(_) => error_code::PERMISSION_ERROR,
            ContainerError::Uninstalled(_) => error_code::INVALID_STATE_ERROR,
            ContainerError::Internal(_) => error_code::INTERNAL_ERROR,
            _ => "UNKNOWN",
        }
    }

    /// 是否为解析错误
    pub fn is_resolution_error(&self) -> bool {
        matches!(self, ContainerError::Resolution(_))
    }
}
