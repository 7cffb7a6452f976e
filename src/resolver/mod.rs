//! 解析器接口
//!
//! 解析器是一个纯函数式外部协作者：给定触发集、未解析集与当前
//! 布线快照，产出一批增量布线。容器在不持有任何锁的情况下调用
//! 它，然后在数据库写锁下按乐观时间戳校验并合并结果。

use std::sync::Arc;

use crate::database::WiringMap;
use crate::module::revision::{ModuleRevision, Requirement};
use crate::utils::Result;

/// 增量布线：解析器产出的最小布线变更集
///
/// 键是受影响的修订版；值要么是全新布线（新解析的修订版），要么
/// 是在既有布线基础上补充了连线的替换布线（既有提供方）。
pub type DeltaWiring = WiringMap;

/// 模块解析器
///
/// 实现必须是纯函数：不得回调容器，不得依赖快照之外的可变状态。
pub trait ModuleResolver: Send + Sync {
    /// 计算一批增量布线
    ///
    /// # 参数
    ///
    /// * `triggers` - 触发解析的修订版
    /// * `triggers_mandatory` - 为 true 时任一触发修订版无法解析即失败
    /// * `unresolved` - 当前全部未解析的当前修订版
    /// * `wirings` - 当前布线快照
    ///
    /// 返回空增量表示无事可做。
    fn resolve_delta(
        &self,
        triggers: &[Arc<ModuleRevision>],
        triggers_mandatory: bool,
        unresolved: &[Arc<ModuleRevision>],
        wirings: &WiringMap,
    ) -> Result<DeltaWiring>;

    /// 针对单个动态包需求计算增量布线
    ///
    /// `requirement` 是动态需求对具体包名的投影。成功的增量必须让
    /// 需求方修订版的布线在尾部新增恰好一条包命名空间连线。
    fn resolve_dynamic_delta(
        &self,
        requirement: &Requirement,
        unresolved: &[Arc<ModuleRevision>],
        wirings: &WiringMap,
    ) -> Result<DeltaWiring>;
}
