//! 模块数据库
//!
//! 容器唯一的可变共享图：模块、修订版、布线、起始级别分配。
//! 多读单写锁保护全部状态；任何改变模块、修订版或布线集合的
//! 变更都会使修订时间戳严格单调递增，解析与刷新用它做乐观并发
//! 校验。
//!
//! 锁层次要求：调用方可以在持有状态变更锁的情况下获取数据库
//! 读锁或写锁，反向顺序被禁止。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use semver::Version;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::module::metadata::{ModuleId, SYSTEM_MODULE_ID};
use crate::module::module::Module;
use crate::module::revision::{ModuleRevision, RevisionBuilder, RevisionId};
use crate::module::wiring::ModuleWiring;

/// 布线表快照/增量的键值表示
pub type WiringMap = BTreeMap<RevisionId, Arc<ModuleWiring>>;

/// 模块排序键
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    /// 依赖序：提供方在前，依赖方在后
    ByDependency,
    /// 起始级别升序
    ByStartLevel,
}

/// 模块数据库
pub struct ModuleDatabase {
    state: RwLock<DatabaseState>,
}

impl ModuleDatabase {
    /// 创建空数据库
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DatabaseState {
                modules_by_id: BTreeMap::new(),
                modules_by_location: HashMap::new(),
                uninstalled_modules: HashMap::new(),
                revisions_by_name: HashMap::new(),
                wirings: BTreeMap::new(),
                revisions_timestamp: 0,
                initial_start_level: 1,
                next_id: 0,
                next_seq: HashMap::new(),
            }),
        }
    }

    /// 获取读锁
    pub async fn read(&self) -> RwLockReadGuard<'_, DatabaseState> {
        self.state.read().await
    }

    /// 获取写锁
    pub async fn write(&self) -> RwLockWriteGuard<'_, DatabaseState> {
        self.state.write().await
    }

    // ==================== 便捷查询 ====================

    /// 按标识查找模块
    pub async fn module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.read().await.module(id)
    }

    /// 按位置查找模块
    pub async fn module_at(&self, location: &str) -> Option<Arc<Module>> {
        self.read().await.module_at(location)
    }

    /// 当前全部模块（按标识升序）
    pub async fn modules(&self) -> Vec<Arc<Module>> {
        self.read().await.modules()
    }

    /// 修订版的当前布线
    pub async fn wiring(&self, revision: RevisionId) -> Option<Arc<ModuleWiring>> {
        self.read().await.wiring(revision)
    }

    /// 当前修订时间戳
    pub async fn revisions_timestamp(&self) -> u64 {
        self.read().await.revisions_timestamp()
    }
}

impl Default for ModuleDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// 数据库内部状态（通过读/写守卫访问）
pub struct DatabaseState {
    modules_by_id: BTreeMap<ModuleId, Arc<Module>>,
    modules_by_location: HashMap<String, Arc<Module>>,
    /// 已卸载但修订版尚未被刷新丢弃的模块（刷新闭包仍需触达）
    uninstalled_modules: HashMap<ModuleId, Arc<Module>>,
    revisions_by_name: HashMap<String, Vec<Arc<ModuleRevision>>>,
    wirings: WiringMap,
    revisions_timestamp: u64,
    initial_start_level: i32,
    next_id: ModuleId,
    next_seq: HashMap<ModuleId, u32>,
}

impl DatabaseState {
    fn bump(&mut self) {
        self.revisions_timestamp += 1;
    }

    /// 修订时间戳（随模块/修订版/布线集合的变更严格递增）
    pub fn revisions_timestamp(&self) -> u64 {
        self.revisions_timestamp
    }

    // ==================== 查询 ====================

    /// 按标识查找模块
    pub fn module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.modules_by_id.get(&id).cloned()
    }

    /// 按位置查找模块
    pub fn module_at(&self, location: &str) -> Option<Arc<Module>> {
        self.modules_by_location.get(location).cloned()
    }

    /// 当前全部模块（按标识升序）
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules_by_id.values().cloned().collect()
    }

    /// 修订版所属的模块
    ///
    /// 与 [`DatabaseState::module`] 不同，也能触达已卸载但待刷新
    /// 清理的模块。
    pub fn module_of(&self, revision: &ModuleRevision) -> Option<Arc<Module>> {
        self.module(revision.module_id())
            .or_else(|| self.uninstalled_modules.get(&revision.module_id()).cloned())
    }

    /// 按符号名（和可选版本）查找修订版
    pub fn revisions(&self, name: &str, version: Option<&Version>) -> Vec<Arc<ModuleRevision>> {
        let Some(list) = self.revisions_by_name.get(name) else {
            return Vec::new();
        };
        list.iter()
            .filter(|r| version.map(|v| r.version() == v).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// 修订版的当前布线
    pub fn wiring(&self, revision: RevisionId) -> Option<Arc<ModuleWiring>> {
        self.wirings.get(&revision).cloned()
    }

    /// 布线表的浅快照（同一批布线对象，新的映射）
    pub fn wirings_copy(&self) -> WiringMap {
        self.wirings.clone()
    }

    /// 修订版是否为其模块的当前版
    pub fn is_current(&self, revision: RevisionId) -> bool {
        self.modules_by_id
            .get(&revision.module)
            .map(|m| m.revisions().is_current(revision))
            .unwrap_or(false)
    }

    /// 待移除修订版集合
    ///
    /// 仍持有布线但已不再是存活模块当前版的修订版（包含已卸载
    /// 模块的全部带布线修订版）。
    pub fn removal_pending(&self) -> Vec<Arc<ModuleRevision>> {
        self.wirings
            .iter()
            .filter(|(id, _)| !self.is_current(**id))
            .map(|(_, wiring)| wiring.revision().clone())
            .collect()
    }

    /// 新安装模块的缺省起始级别
    pub fn initial_module_start_level(&self) -> i32 {
        self.initial_start_level
    }

    /// 设置新安装模块的缺省起始级别
    pub fn set_initial_module_start_level(&mut self, level: i32) {
        self.initial_start_level = level;
    }

    // ==================== 变更 ====================

    /// 安装新模块
    ///
    /// 分配下一个模块标识（首个安装即系统模块，id 0、起始级别 0），
    /// 用构建器生成初始修订版并建立索引。
    pub fn install(&mut self, location: &str, builder: &RevisionBuilder) -> Arc<Module> {
        let id = self.next_id;
        self.next_id += 1;
        let revision = builder.build(RevisionId::new(id, 0));
        self.next_seq.insert(id, 1);

        let start_level = if id == SYSTEM_MODULE_ID {
            0
        } else {
            self.initial_start_level
        };
        let module = Module::new(id, location.to_string(), revision.clone(), start_level);

        self.modules_by_id.insert(id, module.clone());
        self.modules_by_location
            .insert(location.to_string(), module.clone());
        self.index_revision(&revision);
        self.bump();

        debug!(module_id = id, location = %location, "模块已安装入库");
        module
    }

    /// 为模块追加新的当前修订版
    pub fn update(&mut self, module: &Arc<Module>, builder: &RevisionBuilder) -> Arc<ModuleRevision> {
        let seq = self.next_seq.entry(module.id()).or_insert(0);
        let revision = builder.build(RevisionId::new(module.id(), *seq));
        *seq += 1;

        module.revisions().add_current(revision.clone());
        module.touch();
        self.index_revision(&revision);
        self.bump();

        debug!(module_id = module.id(), revision = %revision.id(), "模块已更新入库");
        revision
    }

    /// 卸载模块
    ///
    /// 从标识与位置索引中移除并标记已卸载；修订版与布线留待刷新
    /// 清理（待移除集合）。
    pub fn uninstall(&mut self, module: &Arc<Module>) {
        self.modules_by_id.remove(&module.id());
        self.modules_by_location.remove(module.location());
        self.uninstalled_modules.insert(module.id(), module.clone());
        module.revisions().mark_uninstalled();
        module.touch();
        self.bump();

        debug!(module_id = module.id(), "模块已卸载出库");
    }

    /// 修订版全部被丢弃后，把已卸载模块从数据库中彻底移除
    pub fn purge_if_empty(&mut self, module: &Arc<Module>) {
        if module.revisions().all().is_empty() {
            self.uninstalled_modules.remove(&module.id());
            self.next_seq.remove(&module.id());
        }
    }

    /// 合并一批增量布线
    pub fn merge_wiring(&mut self, delta: WiringMap) {
        trace!(count = delta.len(), "合并增量布线");
        self.wirings.extend(delta);
        self.bump();
    }

    /// 以修剪后的布线表整体替换当前表（刷新提交）
    pub fn set_wirings(&mut self, wirings: WiringMap) {
        self.wirings = wirings;
        self.bump();
    }

    /// 从索引中摘除修订版的能力（刷新丢弃修订版时调用）
    pub fn remove_capabilities(&mut self, revision: &ModuleRevision) {
        if let Some(name) = revision.symbolic_name() {
            if let Some(list) = self.revisions_by_name.get_mut(name) {
                list.retain(|r| r.id() != revision.id());
                if list.is_empty() {
                    self.revisions_by_name.remove(name);
                }
            }
        }
    }

    /// 持久化模块起始级别（不影响修订时间戳）
    pub fn set_start_level(&mut self, module: &Arc<Module>, level: i32) {
        module.set_start_level(level);
    }

    fn index_revision(&mut self, revision: &Arc<ModuleRevision>) {
        if let Some(name) = revision.symbolic_name() {
            self.revisions_by_name
                .entry(name.to_string())
                .or_default()
                .push(revision.clone());
        }
    }

    // ==================== 排序 ====================

    /// 返回按给定键排序的全部模块
    pub fn sorted_modules(&self, keys: &[Sort]) -> Vec<Arc<Module>> {
        let mut modules = self.modules();
        self.sort_modules(&mut modules, keys);
        modules
    }

    /// 就地排序模块列表
    ///
    /// 依赖序在前、起始级别在后地应用：结果以起始级别为主序，
    /// 相同级别内保持提供方在前。
    pub fn sort_modules(&self, modules: &mut Vec<Arc<Module>>, keys: &[Sort]) {
        if keys.contains(&Sort::ByDependency) {
            self.sort_by_dependency(modules);
        }
        if keys.contains(&Sort::ByStartLevel) {
            modules.sort_by_key(|m| m.start_level());
        }
    }

    fn sort_by_dependency(&self, modules: &mut Vec<Arc<Module>>) {
        let in_list: HashSet<ModuleId> = modules.iter().map(|m| m.id()).collect();
        let by_id: HashMap<ModuleId, Arc<Module>> =
            modules.iter().map(|m| (m.id(), m.clone())).collect();

        let mut visited: HashSet<ModuleId> = HashSet::new();
        let mut ordered: Vec<Arc<Module>> = Vec::with_capacity(modules.len());
        for module in modules.iter() {
            self.visit_dependencies(module, &in_list, &by_id, &mut visited, &mut ordered);
        }
        *modules = ordered;
    }

    fn visit_dependencies(
        &self,
        module: &Arc<Module>,
        in_list: &HashSet<ModuleId>,
        by_id: &HashMap<ModuleId, Arc<Module>>,
        visited: &mut HashSet<ModuleId>,
        ordered: &mut Vec<Arc<Module>>,
    ) {
        if !visited.insert(module.id()) {
            return;
        }
        for revision in module.revisions().all() {
            let Some(wiring) = self.wirings.get(&revision.id()) else {
                continue;
            };
            for wire in wiring.required_wires(None) {
                let provider = wire.provider().module_id();
                if provider == module.id() || !in_list.contains(&provider) {
                    continue;
                }
                if let Some(dep) = by_id.get(&provider) {
                    self.visit_dependencies(dep, in_list, by_id, visited, ordered);
                }
            }
        }
        ordered.push(module.clone());
    }
}
