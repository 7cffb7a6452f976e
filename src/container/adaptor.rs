//! 容器适配器接口
//!
//! 适配器是容器与宿主系统之间的全部外部表面：生命周期事件发布、
//! 碰撞钩子、权限检查、配置属性查找，以及模块的实际激活/停用
//! 钩子。事件发布必须是线程安全的即发即忘操作，并且不得重入
//! 容器。

use std::sync::Arc;

use async_trait::async_trait;

use crate::module::metadata::{ContainerEvent, ModuleEvent};
use crate::module::module::Module;
use crate::utils::{ContainerError, Result};

/// 碰撞检查场景
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionMode {
    /// 安装新模块时
    Installing,
    /// 更新既有模块时
    Updating,
}

/// 管理类操作（权限检查的对象）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    /// 安装/更新/卸载
    Lifecycle,
    /// 解析/刷新
    Resolve,
    /// 修改单个模块起始级别
    Execute,
    /// 修改框架起始级别
    StartLevel,
}

/// 容器事件监听器
///
/// 刷新与起始级别操作的调用方可以附带监听器，在操作完成时收到
/// 对应的容器事件。
pub trait ContainerListener: Send + Sync {
    /// 接收一个容器事件
    fn on_container_event(
        &self,
        event: ContainerEvent,
        module: Option<&Arc<Module>>,
        error: Option<&ContainerError>,
    );
}

/// 模块碰撞钩子
///
/// 不受信任的外部代码：可以任意阻塞，可以就地过滤候选集。容器
/// 保证在不持有数据库锁的情况下调用它。
pub trait CollisionHook: Send + Sync {
    /// 过滤同名同版本候选集
    ///
    /// 留在 `candidates` 中的任何候选都会导致安装/更新失败。
    fn filter_collisions(
        &self,
        mode: CollisionMode,
        target: &Arc<Module>,
        candidates: &mut Vec<Arc<Module>>,
    );
}

/// 不做任何过滤的缺省碰撞钩子
pub struct NoopCollisionHook;

impl CollisionHook for NoopCollisionHook {
    fn filter_collisions(
        &self,
        _mode: CollisionMode,
        _target: &Arc<Module>,
        _candidates: &mut Vec<Arc<Module>>,
    ) {
    }
}

/// 容器适配器
#[async_trait]
pub trait ContainerAdaptor: Send + Sync {
    /// 发布模块生命周期事件（即发即忘，不得重入容器）
    fn publish_module_event(&self, event: ModuleEvent, module: &Arc<Module>, origin: &Arc<Module>);

    /// 发布容器级事件（即发即忘，不得重入容器）
    fn publish_container_event(
        &self,
        event: ContainerEvent,
        module: Option<&Arc<Module>>,
        error: Option<&ContainerError>,
        listeners: &[Arc<dyn ContainerListener>],
    );

    /// 获取碰撞钩子
    fn collision_hook(&self) -> Arc<dyn CollisionHook> {
        Arc::new(NoopCollisionHook)
    }

    /// 既有模块对发起安装的模块是否可见
    ///
    /// 不可见时，同位置的重复安装以"被钩子拒绝"失败。
    fn is_module_visible(&self, _origin: &Arc<Module>, _existing: &Arc<Module>) -> bool {
        true
    }

    /// 权限检查，失败返回权限错误
    fn check_permission(&self, _module: Option<&Arc<Module>>, _action: AdminAction) -> Result<()> {
        Ok(())
    }

    /// 字符串配置查找（如 `framework.beginning.startlevel`）
    fn property(&self, _key: &str) -> Option<String> {
        None
    }

    /// 系统模块刷新启动时的通知信号
    fn refreshed_system_module(&self) {}

    /// 激活模块（实际的启动动作，可任意耗时）
    async fn activate(&self, _module: &Arc<Module>) -> Result<()> {
        Ok(())
    }

    /// 停用模块（实际的停止动作，可任意耗时）
    async fn deactivate(&self, _module: &Arc<Module>) -> Result<()> {
        Ok(())
    }
}
