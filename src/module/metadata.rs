//! 模块生命周期元数据定义
//!
//! 定义模块状态机、事件种类和启动/停止选项。

use serde::{Deserialize, Serialize};

/// 模块标识类型
pub type ModuleId = u64;

/// 系统模块的保留标识
///
/// 容器打开期间 id 为 0 的模块始终存在，普通流程不能卸载它，
/// 刷新它是一个独立的异步操作。
pub const SYSTEM_MODULE_ID: ModuleId = 0;

/// 模块生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// 已安装但未解析
    Installed,
    /// 已解析
    Resolved,
    /// 正在启动
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载
    Uninstalled,
}

impl State {
    /// 是否属于活动集 {Starting, Active, Stopping}
    pub fn is_active_set(&self) -> bool {
        matches!(self, State::Starting | State::Active | State::Stopping)
    }

    /// 是否属于已解析集 {Resolved} ∪ 活动集
    pub fn is_resolved_set(&self) -> bool {
        matches!(self, State::Resolved) || self.is_active_set()
    }
}

/// 模块事件种类
///
/// 同时用作每模块状态变更锁的迁移标记：持有锁的任务用它声明
/// 正在尝试哪种迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleEvent {
    /// 已安装
    Installed,
    /// 已解析
    Resolved,
    /// 已回到未解析
    Unresolved,
    /// 已更新
    Updated,
    /// 已卸载
    Uninstalled,
    /// 已启动
    Started,
    /// 已停止
    Stopped,
}

/// 容器级事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerEvent {
    /// 一次刷新操作完成
    Refresh,
    /// 一次框架起始级别变更完成
    StartLevel,
    /// 编排过程中出现的生命周期错误
    Error,
}

/// 激活策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPolicy {
    /// 立即激活（默认）
    #[default]
    Eager,
    /// 惰性激活：启动时仅进入 Starting，等待触发
    Lazy,
}

/// 启动选项
///
/// 各标志可以组合；`transient_if_auto_start` 与 `transient_resume`
/// 隐含瞬态启动（不持久化自动启动标志）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// 瞬态启动：不持久化自动启动标志
    pub transient: bool,
    /// 仅当模块带有持久自动启动标志时才启动
    pub if_auto_start: bool,
    /// 恢复式启动：尊重惰性激活策略（惰性模块仅进入 Starting）
    pub resume: bool,
}

impl StartOptions {
    /// 持久启动（默认）
    pub fn persistent() -> Self {
        Self::default()
    }

    /// 瞬态启动
    pub fn transient() -> Self {
        Self {
            transient: true,
            ..Self::default()
        }
    }

    /// 瞬态恢复启动（更新后重启）
    pub fn transient_resume() -> Self {
        Self {
            transient: true,
            resume: true,
            ..Self::default()
        }
    }

    /// 自动启动（解析后与起始级别爬升使用）：
    /// 仅启动持久自动启动的模块，并尊重惰性激活策略
    pub fn transient_if_auto_start() -> Self {
        Self {
            transient: true,
            if_auto_start: true,
            resume: true,
        }
    }
}

/// 停止选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// 瞬态停止：不清除持久自动启动标志
    pub transient: bool,
}

impl StopOptions {
    /// 瞬态停止
    pub fn transient() -> Self {
        Self { transient: true }
    }
}
