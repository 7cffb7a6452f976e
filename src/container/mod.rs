//! 模块容器
//!
//! 容器负责模块的安装、更新、卸载、解析、刷新与起始级别编排，
//! 并在并发读者面前维持布线图的一致性。
//!
//! 并发设计采用"快照 → 纯计算 → 校验并提交"的乐观模式：在数据库
//! 读锁下捕获修订时间戳与布线快照，在无锁状态调用纯函数解析器，
//! 再在写锁下校验时间戳后合并。时间戳冲突触发确定性的重试。
//!
//! 锁层次（必须按此顺序获取）：
//! 1. 位置/符号名命名锁
//! 2. 每模块状态变更锁（正向操作按迁移集合的迭代顺序，刷新按
//!    逆序以匹配停止顺序）
//! 3. 数据库读锁或写锁
//! 4. 外观内部的短互斥量

pub mod adaptor;
pub mod locks;
pub mod startlevel;
pub mod wiring_facade;

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use semver::Version;
use tracing::{debug, info, warn};

use crate::core::config::ContainerConfig;
use crate::database::{DatabaseState, ModuleDatabase, Sort, WiringMap};
use crate::module::metadata::{
    ModuleEvent, ModuleId, StartOptions, State, StopOptions, SYSTEM_MODULE_ID,
};
use crate::module::module::Module;
use crate::module::revision::{
    directives, namespace, ModuleRevision, Requirement, RevisionBuilder, RevisionId,
};
use crate::module::wiring::{ModuleWire, ModuleWiring};
use crate::module::ContainerEvent;
use crate::resolver::{DeltaWiring, ModuleResolver};
use crate::utils::{ContainerError, Result};

use adaptor::{AdminAction, CollisionMode, ContainerAdaptor, ContainerListener};
use locks::{LockSet, StateChangeGuard};
use startlevel::{ContainerStartLevel, USE_BEGINNING_START_LEVEL};
use wiring_facade::ContainerWiring;

/// 模块容器
///
/// 通过 [`ModuleContainer::new`] 构造，以 `Arc` 共享。数据库持有
/// 持久图；容器持有瞬态状态（命名锁、调度器、系统模块刷新标志）。
pub struct ModuleContainer {
    /// 指向自身的弱引用（后台任务派生用）
    self_ref: Weak<ModuleContainer>,
    adaptor: Arc<dyn ContainerAdaptor>,
    resolver: Arc<dyn ModuleResolver>,
    database: Arc<ModuleDatabase>,
    config: ContainerConfig,

    /// 安装操作对位置的写锁
    location_locks: LockSet,
    /// 安装与更新操作对符号名的写锁
    name_locks: LockSet,

    frame_wiring: ContainerWiring,
    frame_start_level: ContainerStartLevel,

    /// 系统模块刷新进行中标志（独立监视器保护）
    refreshing_system: Mutex<bool>,

    /// 动态解析失败缓存：(修订版, 包名) -> 失败时的修订时间戳
    dynamic_misses: Mutex<LruCache<(RevisionId, String), u64>>,
}

impl ModuleContainer {
    /// 构造新容器
    ///
    /// # 示例
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use jimu_core::{ContainerAdaptor, ContainerConfig, ModuleContainer, ModuleDatabase, ModuleResolver};
    ///
    /// fn bootstrap(
    ///     adaptor: Arc<dyn ContainerAdaptor>,
    ///     resolver: Arc<dyn ModuleResolver>,
    /// ) -> Arc<ModuleContainer> {
    ///     ModuleContainer::new(
    ///         adaptor,
    ///         resolver,
    ///         Arc::new(ModuleDatabase::new()),
    ///         ContainerConfig::default(),
    ///     )
    /// }
    /// ```
    pub fn new(
        adaptor: Arc<dyn ContainerAdaptor>,
        resolver: Arc<dyn ModuleResolver>,
        database: Arc<ModuleDatabase>,
        config: ContainerConfig,
    ) -> Arc<Self> {
        let cache_size = NonZeroUsize::new(config.dynamic_miss_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            adaptor,
            resolver,
            database,
            config,
            location_locks: LockSet::new(),
            name_locks: LockSet::new(),
            frame_wiring: ContainerWiring::new(weak.clone()),
            frame_start_level: ContainerStartLevel::new(weak.clone()),
            refreshing_system: Mutex::new(false),
            dynamic_misses: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// 容器适配器
    pub fn adaptor(&self) -> &Arc<dyn ContainerAdaptor> {
        &self.adaptor
    }

    /// 模块数据库
    pub fn database(&self) -> &Arc<ModuleDatabase> {
        &self.database
    }

    /// 容器配置
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    // ==================== 查询 ====================

    /// 全部已安装模块（按标识升序）
    pub async fn modules(&self) -> Vec<Arc<Module>> {
        self.database.modules().await
    }

    /// 按标识查找模块
    pub async fn module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.database.module(id).await
    }

    /// 按位置查找模块
    pub async fn module_at(&self, location: &str) -> Option<Arc<Module>> {
        self.database.module_at(location).await
    }

    /// 按符号名（和可选版本）查找修订版快照
    pub async fn revisions(
        &self,
        name: &str,
        version: Option<&Version>,
    ) -> Vec<Arc<ModuleRevision>> {
        self.database.read().await.revisions(name, version)
    }

    /// 当前活动起始级别
    pub fn active_start_level(&self) -> i32 {
        self.frame_start_level.active_start_level()
    }

    /// 系统模块刷新是否正在进行
    pub fn is_refreshing_system_module(&self) -> bool {
        *self.refreshing_system.lock()
    }

    // ==================== 安装 ====================

    /// 在指定位置安装新模块
    ///
    /// 位置已存在模块时返回既有模块且不使用构建器；若发起者存在
    /// 而既有模块对其不可见，以"被钩子拒绝"失败。同名同版本碰撞
    /// 先交给碰撞钩子过滤，剩余候选导致重复模块错误。
    pub async fn install(
        &self,
        origin: Option<&Arc<Module>>,
        location: &str,
        builder: &RevisionBuilder,
    ) -> Result<Arc<Module>> {
        let wait = self.config.state_lock_timeout();
        let _location_guard = self.location_locks.try_lock(location, wait).await.map_err(|_| {
            ContainerError::StateChange(format!("获取安装位置锁失败: {location}"))
        })?;
        let _name_guard = match builder.symbolic_name() {
            Some(name) => Some(self.name_locks.try_lock(name, wait).await.map_err(|_| {
                ContainerError::StateChange(format!("获取符号名锁失败: {name}"))
            })?),
            None => None,
        };

        // 读锁下查找既有模块并收集碰撞候选
        let (existing, mut candidates) = {
            let db = self.database.read().await;
            let existing = db.module_at(location);
            let mut candidates: Vec<Arc<Module>> = Vec::new();
            if existing.is_none() {
                if let Some(name) = builder.symbolic_name() {
                    for revision in db.revisions(name, Some(builder.version())) {
                        // 只关心当前修订版
                        if !db.is_current(revision.id()) {
                            continue;
                        }
                        if let Some(module) = db.module_of(&revision) {
                            if !candidates.iter().any(|c| Arc::ptr_eq(c, &module)) {
                                candidates.push(module);
                            }
                        }
                    }
                }
            }
            (existing, candidates)
        };

        // 既有位置必须对发起者可见
        if let Some(existing) = existing {
            if let Some(origin) = origin {
                if !self.adaptor.is_module_visible(origin, &existing) {
                    return Err(ContainerError::RejectedByHook(format!(
                        "位置 '{location}' 已存在对发起者不可见的模块: {existing}"
                    )));
                }
            }
            return Ok(existing);
        }

        // 从发起者的视角执行碰撞过滤（钩子在数据库锁之外调用）
        if let Some(origin) = origin {
            if !candidates.is_empty() {
                self.adaptor.collision_hook().filter_collisions(
                    CollisionMode::Installing,
                    origin,
                    &mut candidates,
                );
            }
        }
        if !candidates.is_empty() {
            return Err(ContainerError::DuplicateModule {
                name: builder.symbolic_name().unwrap_or("<anonymous>").to_string(),
                version: builder.version().clone(),
            });
        }

        let module = {
            let mut db = self.database.write().await;
            db.install(location, builder)
        };
        info!(module_id = module.id(), location = %location, "模块已安装");
        self.adaptor
            .publish_module_event(ModuleEvent::Installed, &module, origin.unwrap_or(&module));
        Ok(module)
    }

    // ==================== 更新 ====================

    /// 用新修订版更新模块
    pub async fn update(&self, module: &Arc<Module>, builder: &RevisionBuilder) -> Result<()> {
        self.adaptor
            .check_permission(Some(module), AdminAction::Lifecycle)?;
        let wait = self.config.state_lock_timeout();
        let _name_guard = match builder.symbolic_name() {
            Some(name) => Some(self.name_locks.try_lock(name, wait).await.map_err(|_| {
                ContainerError::StateChange(format!("获取符号名锁失败: {name}"))
            })?),
            None => None,
        };

        // 碰撞候选（排除被更新模块自身）
        let mut candidates: Vec<Arc<Module>> = Vec::new();
        if let Some(name) = builder.symbolic_name() {
            let db = self.database.read().await;
            for revision in db.revisions(name, Some(builder.version())) {
                if !db.is_current(revision.id()) {
                    continue;
                }
                if let Some(candidate) = db.module_of(&revision) {
                    if Arc::ptr_eq(&candidate, module) {
                        continue;
                    }
                    if !candidates.iter().any(|c| Arc::ptr_eq(c, &candidate)) {
                        candidates.push(candidate);
                    }
                }
            }
        }
        if !candidates.is_empty() {
            self.adaptor.collision_hook().filter_collisions(
                CollisionMode::Updating,
                module,
                &mut candidates,
            );
        }
        if !candidates.is_empty() {
            return Err(ContainerError::DuplicateModule {
                name: builder.symbolic_name().unwrap_or("<anonymous>").to_string(),
                version: builder.version().clone(),
            });
        }

        let previous = {
            let guard = module
                .state_change_lock()
                .lock(ModuleEvent::Updated, wait)
                .await?;
            module.check_valid()?;
            let previous = module.state();
            if previous.is_active_set() {
                // 停止失败终止更新
                self.do_stop_locked(module, &guard).await?;
            }
            if previous.is_resolved_set() {
                module.set_state(State::Installed);
                self.adaptor
                    .publish_module_event(ModuleEvent::Unresolved, module, module);
            }
            let mut db = self.database.write().await;
            db.update(module, builder);
            previous
        };

        // 仅在成功时发布更新事件
        info!(module_id = module.id(), "模块已更新");
        self.adaptor
            .publish_module_event(ModuleEvent::Updated, module, module);

        if previous.is_active_set() {
            // 必要时重启；失败上报为容器错误而不抛出
            if let Err(e) = self.start(module, StartOptions::transient_resume()).await {
                self.adaptor
                    .publish_container_event(ContainerEvent::Error, Some(module), Some(&e), &[]);
            }
        }
        Ok(())
    }

    // ==================== 卸载 ====================

    /// 卸载模块
    pub async fn uninstall(&self, module: &Arc<Module>) -> Result<()> {
        self.adaptor
            .check_permission(Some(module), AdminAction::Lifecycle)?;
        let wait = self.config.state_lock_timeout();
        {
            let guard = module
                .state_change_lock()
                .lock(ModuleEvent::Uninstalled, wait)
                .await?;
            module.check_valid()?;
            let previous = module.state();
            if previous.is_active_set() {
                if let Err(e) = self.do_stop_locked(module, &guard).await {
                    self.adaptor.publish_container_event(
                        ContainerEvent::Error,
                        Some(module),
                        Some(&e),
                        &[],
                    );
                }
            }
            if previous.is_resolved_set() {
                module.set_state(State::Installed);
                self.adaptor
                    .publish_module_event(ModuleEvent::Unresolved, module, module);
            }
            let mut db = self.database.write().await;
            db.uninstall(module);
            module.set_state(State::Uninstalled);
        }
        info!(module_id = module.id(), "模块已卸载");
        self.adaptor
            .publish_module_event(ModuleEvent::Uninstalled, module, module);
        Ok(())
    }

    // ==================== 解析 ====================

    /// 解析指定模块的当前修订版
    ///
    /// `triggers` 为 `None` 时解析全部未解析的当前修订版；
    /// `triggers_mandatory` 为 true 时任一触发模块无法解析即返回
    /// 解析错误。时间戳冲突在内部重试直至提交。
    pub async fn resolve(
        &self,
        triggers: Option<&[Arc<Module>]>,
        triggers_mandatory: bool,
    ) -> Result<()> {
        self.resolve_internal(triggers.unwrap_or(&[]), triggers_mandatory, false)
            .await
    }

    async fn resolve_internal(
        &self,
        triggers: &[Arc<Module>],
        triggers_mandatory: bool,
        restart_triggers: bool,
    ) -> Result<()> {
        if self.is_refreshing_system_module() {
            return Err(ContainerError::Resolution(
                "系统模块正在刷新，无法解析".to_string(),
            ));
        }
        loop {
            if self
                .resolve_and_apply(triggers, triggers_mandatory, restart_triggers)
                .await?
            {
                return Ok(());
            }
            debug!("修订时间戳冲突，重试解析");
        }
    }

    async fn resolve_and_apply(
        &self,
        triggers: &[Arc<Module>],
        triggers_mandatory: bool,
        restart_triggers: bool,
    ) -> Result<bool> {
        // 阶段一：读锁下的乐观快照
        let (timestamp, wiring_clone, trigger_revisions, unresolved) = {
            let db = self.database.read().await;
            let timestamp = db.revisions_timestamp();
            let wiring_clone = db.wirings_copy();
            let trigger_revisions: Vec<Arc<ModuleRevision>> = triggers
                .iter()
                .filter(|m| m.state() != State::Uninstalled)
                .filter_map(|m| m.current_revision())
                .collect();
            let unresolved: Vec<Arc<ModuleRevision>> = db
                .modules()
                .iter()
                .filter_map(|m| m.current_revision())
                .filter(|r| !wiring_clone.contains_key(&r.id()))
                .collect();
            (timestamp, wiring_clone, trigger_revisions, unresolved)
        };

        // 阶段二：无锁调用纯函数解析器
        let delta = self.resolver.resolve_delta(
            &trigger_revisions,
            triggers_mandatory,
            &unresolved,
            &wiring_clone,
        )?;
        if delta.is_empty() {
            return Ok(true); // 无事可做
        }

        // 此前未布线的修订版即新解析出的模块
        let modules_resolved: Vec<Arc<Module>> = {
            let db = self.database.read().await;
            delta
                .iter()
                .filter(|(id, _)| !wiring_clone.contains_key(*id))
                .filter_map(|(_, wiring)| db.module_of(wiring.revision()))
                .collect()
        };

        self.apply_delta(delta, modules_resolved, triggers, timestamp, restart_triggers)
            .await
    }

    /// 校验并提交一批增量布线
    ///
    /// 返回 `Ok(false)` 表示时间戳冲突，调用方需要重试。
    async fn apply_delta(
        &self,
        mut delta: DeltaWiring,
        modules_resolved: Vec<Arc<Module>>,
        triggers: &[Arc<Module>],
        timestamp: u64,
        restart_triggers: bool,
    ) -> Result<bool> {
        let wait = self.config.state_lock_timeout();

        // 按迭代顺序获取 RESOLVED 状态变更锁
        let mut locked: Vec<(Arc<Module>, StateChangeGuard)> =
            Vec::with_capacity(modules_resolved.len());
        for module in &modules_resolved {
            let guard = module
                .state_change_lock()
                .lock(ModuleEvent::Resolved, wait)
                .await
                .map_err(|e| ContainerError::Internal(format!("无法获取状态变更锁: {e}")))?;
            locked.push((module.clone(), guard));
        }

        let mut modules_locked: Vec<Arc<Module>> =
            locked.iter().map(|(m, _)| m.clone()).collect();

        {
            let mut db = self.database.write().await;
            if timestamp != db.revisions_timestamp() {
                return Ok(false); // 需要重试
            }
            let current_wirings = db.wirings_copy();
            for (revision_id, delta_wiring) in delta.iter_mut() {
                if let Some(existing) = current_wirings.get(revision_id) {
                    // 既有布线就地更新能力与连线，并把真实布线写回增量
                    existing.set_capabilities(delta_wiring.capabilities(None));
                    existing.set_provided_wires(delta_wiring.provided_wires(None));
                    existing.set_required_wires(delta_wiring.required_wires(None));
                    *delta_wiring = existing.clone();
                }
            }
            db.merge_wiring(delta);
            db.sort_modules(&mut modules_locked, &[Sort::ByDependency, Sort::ByStartLevel]);
        }

        // 写锁释放后才把状态迁移暴露给其他任务
        for module in &modules_locked {
            module.set_state(State::Resolved);
        }
        drop(locked);

        for module in &modules_locked {
            self.adaptor
                .publish_module_event(ModuleEvent::Resolved, module, module);
        }

        // 按需重启触发模块
        let trigger_set: HashSet<ModuleId> = if restart_triggers {
            triggers.iter().map(|m| m.id()).collect()
        } else {
            HashSet::new()
        };
        if restart_triggers {
            for module in triggers {
                if module.id() != SYSTEM_MODULE_ID && module.state().is_resolved_set() {
                    if let Err(e) =
                        Box::pin(self.start(module, StartOptions::transient())).await
                    {
                        self.adaptor.publish_container_event(
                            ContainerEvent::Error,
                            Some(module),
                            Some(&e),
                            &[],
                        );
                    }
                }
            }
        }

        // 自动启动新解析出的持久启动模块。
        // 参考实现始终如此；auto_start_on_resolve 允许偏离。
        if self.config.auto_start_on_resolve {
            for module in &modules_locked {
                if module.state_change_lock().in_transition(ModuleEvent::Started)
                    || module.is_system()
                    || trigger_set.contains(&module.id())
                {
                    continue;
                }
                if let Err(e) =
                    Box::pin(self.start(module, StartOptions::transient_if_auto_start())).await
                {
                    self.adaptor.publish_container_event(
                        ContainerEvent::Error,
                        Some(module),
                        Some(&e),
                        &[],
                    );
                }
            }
        }
        Ok(true)
    }

    // ==================== 动态解析 ====================

    /// 针对具体包名对已解析修订版做动态解析
    ///
    /// 成功时返回新增的尾部连线；修订版无动态需求、未解析或为
    /// fragment 时返回 `None`。
    pub async fn resolve_dynamic(
        &self,
        package_name: &str,
        revision: &Arc<ModuleRevision>,
    ) -> Result<Option<Arc<ModuleWire>>> {
        loop {
            let (timestamp, dynamic_requirements, wiring_clone, unresolved) = {
                let db = self.database.read().await;
                let timestamp = db.revisions_timestamp();
                // 失败缓存仅在时间戳未推进时有效
                let cache_key = (revision.id(), package_name.to_string());
                if self.dynamic_misses.lock().get(&cache_key) == Some(&timestamp) {
                    return Ok(None);
                }
                let dynamic_requirements = self.dynamic_requirements(&db, package_name, revision);
                if dynamic_requirements.is_empty() {
                    return Ok(None);
                }
                let wiring_clone = db.wirings_copy();
                let unresolved: Vec<Arc<ModuleRevision>> = db
                    .modules()
                    .iter()
                    .filter_map(|m| m.current_revision())
                    .filter(|r| !wiring_clone.contains_key(&r.id()))
                    .collect();
                (timestamp, dynamic_requirements, wiring_clone, unresolved)
            };

            // 取第一个真正为该修订版布线的增量
            let mut delta: Option<DeltaWiring> = None;
            for requirement in &dynamic_requirements {
                let candidate =
                    self.resolver
                        .resolve_dynamic_delta(requirement, &unresolved, &wiring_clone)?;
                if candidate.contains_key(&revision.id()) {
                    delta = Some(candidate);
                    break;
                }
            }
            let Some(delta) = delta else {
                self.dynamic_misses
                    .lock()
                    .put((revision.id(), package_name.to_string()), timestamp);
                return Ok(None);
            };

            let modules_resolved: Vec<Arc<Module>> = {
                let db = self.database.read().await;
                delta
                    .iter()
                    .filter(|(id, _)| !wiring_clone.contains_key(*id))
                    .filter_map(|(_, wiring)| db.module_of(wiring.revision()))
                    .collect()
            };

            // 预期副作用：需求方布线尾部恰好新增一条包连线
            let result = delta
                .get(&revision.id())
                .and_then(|wiring| wiring.required_wires(None).last().cloned());
            if let Some(wire) = &result {
                let package_ok = wire.namespace() == namespace::PACKAGE
                    && wire.capability().attribute_str(directives::ATTR_PACKAGE)
                        == Some(package_name);
                if !package_ok {
                    return Err(ContainerError::Resolution(format!(
                        "解析器产出了不一致的动态连线: {wire}"
                    )));
                }
            }

            if self
                .apply_delta(delta, modules_resolved, &[], timestamp, false)
                .await?
            {
                return Ok(result);
            }
            debug!("修订时间戳冲突，重试动态解析");
        }
    }

    fn dynamic_requirements(
        &self,
        db: &DatabaseState,
        package_name: &str,
        revision: &Arc<ModuleRevision>,
    ) -> Vec<Requirement> {
        if revision.is_fragment() {
            // 只对宿主修订版生效
            return Vec::new();
        }
        let Some(wiring) = db.wiring(revision.id()) else {
            // 未解析
            return Vec::new();
        };
        wiring
            .requirements(Some(namespace::PACKAGE))
            .iter()
            .filter_map(|r| r.dynamic_package_requirement(package_name))
            .collect()
    }

    // ==================== 刷新 ====================

    /// 刷新指定模块集合
    ///
    /// `initial` 为 `None` 时以待移除集合为种子。先计算刷新闭包并
    /// 整体取消解析，再以重启语义重新解析幸存的触发模块。
    pub async fn refresh(&self, initial: Option<Vec<Arc<Module>>>) -> Result<()> {
        let refresh_triggers = self.unresolve(initial).await?;
        if !self.is_refreshing_system_module() {
            self.resolve_internal(&refresh_triggers, false, true).await?;
        }
        Ok(())
    }

    /// 指定模块集合的依赖闭包快照
    pub async fn dependency_closure(&self, initial: &[Arc<Module>]) -> Vec<Arc<Module>> {
        let db = self.database.read().await;
        let wirings = db.wirings_copy();
        refresh_closure(&db, Some(initial), &wirings)
    }

    /// 待移除修订版快照
    pub async fn removal_pending(&self) -> Vec<Arc<ModuleRevision>> {
        self.database.read().await.removal_pending()
    }

    async fn unresolve(&self, initial: Option<Vec<Arc<Module>>>) -> Result<Vec<Arc<Module>>> {
        loop {
            if let Some(refresh_triggers) = self.unresolve0(initial.clone()).await? {
                return Ok(refresh_triggers);
            }
            debug!("修订时间戳冲突，重试取消解析");
        }
    }

    /// 单次取消解析尝试；时间戳冲突返回 `Ok(None)`
    async fn unresolve0(
        &self,
        mut initial: Option<Vec<Arc<Module>>>,
    ) -> Result<Option<Vec<Arc<Module>>>> {
        let wait = self.config.state_lock_timeout();

        struct ProviderPrune {
            wiring: Arc<ModuleWiring>,
            wires: Vec<Arc<ModuleWire>>,
        }

        // 阶段一：读锁下快照并计算刷新闭包
        let (timestamp, wiring_copy, refresh_triggers, to_remove_revisions, to_remove_wirings, provider_prunes) = {
            let db = self.database.read().await;
            check_system_extension_refresh(&db, initial.as_mut());
            let timestamp = db.revisions_timestamp();
            let mut wiring_copy = db.wirings_copy();
            let mut refresh_triggers = refresh_closure(&db, initial.as_deref(), &wiring_copy);

            let mut to_remove_revisions: Vec<(Arc<Module>, Arc<ModuleRevision>)> = Vec::new();
            let mut to_remove_wirings = Vec::new();
            let mut provider_prunes: HashMap<RevisionId, ProviderPrune> = HashMap::new();
            for module in &refresh_triggers {
                let mut first = true;
                for revision in module.revisions().all() {
                    if let Some(removed) = wiring_copy.remove(&revision.id()) {
                        // 幸存提供方需要剥离指向被移除布线的连线
                        for wire in removed.required_wires(None) {
                            let provider_id = wire.provider().id();
                            if let Some(provider_wiring) = db.wiring(provider_id) {
                                provider_prunes
                                    .entry(provider_id)
                                    .or_insert_with(|| ProviderPrune {
                                        wiring: provider_wiring,
                                        wires: Vec::new(),
                                    })
                                    .wires
                                    .push(wire);
                            }
                        }
                        to_remove_wirings.push(removed);
                    }
                    if !first || module.revisions().is_uninstalled() {
                        to_remove_revisions.push((module.clone(), revision.clone()));
                    }
                    first = false;
                }
            }
            // 已卸载模块不再参与停止/重启
            refresh_triggers.retain(|m| m.state() != State::Uninstalled);
            db.sort_modules(&mut refresh_triggers, &[Sort::ByStartLevel, Sort::ByDependency]);
            (
                timestamp,
                wiring_copy,
                refresh_triggers,
                to_remove_revisions,
                to_remove_wirings,
                provider_prunes,
            )
        };

        // 活动的系统模块在刷新闭包中：转交异步系统刷新，调用方不再重解析
        if refresh_triggers.iter().any(|m| m.is_system()) {
            if let Some(system) = self.database.module(SYSTEM_MODULE_ID).await {
                if system.state().is_active_set() {
                    self.refresh_system_module().await;
                    return Ok(Some(Vec::new()));
                }
            }
        }

        // 阶段二：逆序获取 UNRESOLVED 状态变更锁（与停止顺序一致）
        let mut locked: Vec<(Arc<Module>, StateChangeGuard)> =
            Vec::with_capacity(refresh_triggers.len());
        for module in refresh_triggers.iter().rev() {
            let guard = module
                .state_change_lock()
                .lock(ModuleEvent::Unresolved, wait)
                .await
                .map_err(|e| ContainerError::Internal(format!("无法获取状态变更锁: {e}")))?;
            locked.push((module.clone(), guard));
        }

        // 阶段三：逆序停止活动模块；前态非 Active 的剔除出重启集
        let mut restart_triggers: Vec<Arc<Module>> = Vec::new();
        for (module, guard) in &locked {
            let previous = module.state();
            if previous.is_active_set() {
                if let Err(e) = self.do_stop_locked(module, guard).await {
                    self.adaptor.publish_container_event(
                        ContainerEvent::Error,
                        Some(module),
                        Some(&e),
                        &[],
                    );
                }
            }
            if previous == State::Active {
                restart_triggers.push(module.clone());
            }
        }
        // 锁获取是逆序的，恢复为起始级别升序
        restart_triggers.reverse();

        // 健全性检查：持锁模块必须已离开活动集
        for (module, _) in &locked {
            if module.state().is_active_set() {
                return Err(ContainerError::Internal(format!(
                    "模块停止后仍处于活动状态: {module} ({:?})",
                    module.state()
                )));
            }
        }

        // 阶段四：写锁下校验时间戳并提交修剪
        {
            let mut db = self.database.write().await;
            if timestamp != db.revisions_timestamp() {
                return Ok(None); // 需要重试
            }
            for prune in provider_prunes.values() {
                let remaining: Vec<Arc<ModuleWire>> = prune
                    .wiring
                    .provided_wires(None)
                    .into_iter()
                    .filter(|w| !prune.wires.iter().any(|r| Arc::ptr_eq(w, r)))
                    .collect();
                prune.wiring.set_provided_wires(remaining);
                for wire in &prune.wires {
                    wire.invalidate();
                }
            }
            for (module, revision) in &to_remove_revisions {
                module.revisions().remove(revision.id());
                db.remove_capabilities(revision);
                db.purge_if_empty(module);
            }
            for wiring in &to_remove_wirings {
                wiring.invalidate();
            }
            db.set_wirings(wiring_copy);
        }

        // 阶段五：状态回退并记录事件（沿用持锁顺序，与停止顺序一致）
        let mut modules_unresolved: Vec<Arc<Module>> = Vec::new();
        for (module, _) in locked.iter() {
            if module.state() == State::Resolved {
                module.set_state(State::Installed);
                modules_unresolved.push(module.clone());
            }
        }
        drop(locked);

        // 释放全部锁之后发布事件
        for module in &modules_unresolved {
            self.adaptor
                .publish_module_event(ModuleEvent::Unresolved, module, module);
        }
        Ok(Some(restart_triggers))
    }

    /// 异步刷新系统模块
    ///
    /// 同一时刻至多一次在途系统刷新；标志由下一次 `open` 清除，
    /// 在此期间无关的解析调用都会失败。
    pub(crate) async fn refresh_system_module(&self) {
        {
            let mut refreshing = self.refreshing_system.lock();
            if *refreshing {
                return;
            }
            *refreshing = true;
        }
        self.adaptor.refreshed_system_module();
        let Some(system) = self.database.module(SYSTEM_MODULE_ID).await else {
            return;
        };
        let Some(container) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            info!("开始异步刷新系统模块");
            if let Err(e) = container.stop(&system, StopOptions::transient()).await {
                warn!(error = %e, "系统模块刷新停止失败");
                container.adaptor.publish_container_event(
                    ContainerEvent::Error,
                    Some(&system),
                    Some(&e),
                    &[],
                );
            }
        });
    }

    // ==================== 模块生命周期 ====================

    /// 启动模块
    ///
    /// 异步状态变更锁没有任务重入性，所以解析发生在获取 STARTED
    /// 锁之前，持锁后重新校验状态。
    pub async fn start(&self, module: &Arc<Module>, options: StartOptions) -> Result<()> {
        module.check_valid()?;
        if options.if_auto_start && !module.is_persistently_started() {
            return Ok(()); // 无自动启动标志
        }
        if module
            .current_revision()
            .map(|r| r.is_fragment())
            .unwrap_or(false)
        {
            return Err(ContainerError::InvalidOperation(format!(
                "fragment 模块不能启动: {module}"
            )));
        }
        if !options.transient {
            module.set_persistently_started(true);
        }

        let active = self.frame_start_level.active_start_level();
        if !module.is_system() && module.start_level() > active {
            if options.transient {
                if options.if_auto_start {
                    return Ok(()); // 爬升途中级别变化，交给后续爬升
                }
                return Err(ContainerError::StartLevelNotMet {
                    module: module.id(),
                    start_level: module.start_level(),
                    active,
                });
            }
            return Ok(()); // 持久启动已记录，等待起始级别爬升
        }

        if !module.state().is_resolved_set() {
            self.resolve_internal(std::slice::from_ref(module), true, false)
                .await?;
        }

        {
            let guard = module
                .state_change_lock()
                .lock(ModuleEvent::Started, self.config.state_lock_timeout())
                .await?;
            self.do_start_locked(module, &guard, options).await?;
        }

        // 系统模块激活后把框架爬升到起始配置级别
        if module.is_system() && module.state() == State::Active {
            self.frame_start_level
                .do_container_start_level(self, Some(module), USE_BEGINNING_START_LEVEL, &[])
                .await?;
        }
        Ok(())
    }

    /// 停止模块
    pub async fn stop(&self, module: &Arc<Module>, options: StopOptions) -> Result<()> {
        module.check_valid()?;
        if !options.transient {
            module.set_persistently_started(false);
        }
        // 系统模块停止前先把框架降到级别 0
        if module.is_system() && module.state().is_active_set() {
            self.frame_start_level
                .do_container_start_level(self, Some(module), 0, &[])
                .await?;
        }
        let guard = module
            .state_change_lock()
            .lock(ModuleEvent::Stopped, self.config.state_lock_timeout())
            .await?;
        self.do_stop_locked(module, &guard).await
    }

    /// 已持有状态变更锁时的启动实现（守卫作为持锁证明）
    async fn do_start_locked(
        &self,
        module: &Arc<Module>,
        _proof: &StateChangeGuard,
        options: StartOptions,
    ) -> Result<()> {
        module.check_valid()?;
        let state = module.state();
        if state == State::Active {
            return Ok(());
        }
        let lazy = module.is_lazy_activate() && options.resume;
        if state == State::Starting && lazy {
            return Ok(());
        }
        if !state.is_resolved_set() {
            return Err(ContainerError::Resolution(format!(
                "无法启动未解析的模块: {module}"
            )));
        }
        if lazy {
            // 惰性激活：进入 Starting 等待触发
            module.set_state(State::Starting);
            debug!(module_id = module.id(), "惰性激活模块进入 Starting");
            return Ok(());
        }

        module.set_state(State::Starting);
        match self.adaptor.activate(module).await {
            Ok(()) => {
                module.set_state(State::Active);
                info!(module_id = module.id(), "模块已启动");
                self.adaptor
                    .publish_module_event(ModuleEvent::Started, module, module);
                Ok(())
            }
            Err(e) => {
                module.set_state(State::Resolved);
                Err(e)
            }
        }
    }

    /// 已持有状态变更锁时的停止实现（守卫作为持锁证明）
    ///
    /// 激活器失败仍然落到 Resolved 并发布停止事件，错误随后上浮。
    async fn do_stop_locked(&self, module: &Arc<Module>, _proof: &StateChangeGuard) -> Result<()> {
        module.check_valid()?;
        if !module.state().is_active_set() {
            return Ok(());
        }
        module.set_state(State::Stopping);
        let result = self.adaptor.deactivate(module).await;
        module.set_state(State::Resolved);
        info!(module_id = module.id(), "模块已停止");
        self.adaptor
            .publish_module_event(ModuleEvent::Stopped, module, module);
        result
    }

    // ==================== 起始级别 ====================

    /// 设置单个模块的起始级别
    pub async fn set_module_start_level(&self, module: &Arc<Module>, level: i32) -> Result<()> {
        self.frame_start_level
            .set_module_start_level(self, module, level)
            .await
    }

    /// 设置框架起始级别（后台爬升）
    pub fn set_start_level(
        &self,
        level: i32,
        listeners: Vec<Arc<dyn ContainerListener>>,
    ) -> Result<()> {
        self.frame_start_level.set_start_level(self, level, listeners)
    }

    /// 新安装模块的缺省起始级别
    pub async fn initial_module_start_level(&self) -> i32 {
        self.database.read().await.initial_module_start_level()
    }

    /// 设置新安装模块的缺省起始级别
    pub async fn set_initial_module_start_level(&self, level: i32) -> Result<()> {
        self.adaptor.check_permission(None, AdminAction::StartLevel)?;
        if level < 1 {
            return Err(ContainerError::InvalidOperation(format!(
                "起始级别不能小于 1: {level}"
            )));
        }
        self.database.write().await.set_initial_module_start_level(level);
        Ok(())
    }

    // ==================== 布线外观 ====================

    /// 在后台刷新指定模块集合
    ///
    /// 同一调度器串行执行全部刷新任务；完成后无论成败都向监听器
    /// 发布刷新事件，解析错误先以容器错误事件发出。
    pub fn refresh_modules(
        &self,
        modules: Option<Vec<Arc<Module>>>,
        listeners: Vec<Arc<dyn ContainerListener>>,
    ) -> Result<()> {
        self.frame_wiring.refresh_modules(self, modules, listeners)
    }

    /// 解析指定模块集合（`None` 表示全部）
    ///
    /// 全部模块解析后拥有布线时返回 true；解析错误返回 false。
    pub async fn resolve_modules(&self, modules: Option<Vec<Arc<Module>>>) -> Result<bool> {
        self.adaptor.check_permission(None, AdminAction::Resolve)?;
        match self.resolve(modules.as_deref(), false).await {
            Err(e) if e.is_resolution_error() => return Ok(false),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        let to_check = match modules {
            Some(list) => list,
            None => self.modules().await,
        };
        let db = self.database.read().await;
        Ok(to_check.iter().all(|m| {
            m.current_revision()
                .map(|r| db.wiring(r.id()).is_some())
                .unwrap_or(false)
        }))
    }

    // ==================== 打开 / 关闭 ====================

    /// 打开容器：按持久布线同步模块状态，重置调度器
    pub async fn open(&self) -> Result<()> {
        self.load_modules().await?;
        self.frame_start_level.open();
        self.frame_wiring.open();
        *self.refreshing_system.lock() = false;
        info!("容器已打开");
        Ok(())
    }

    /// 关闭容器：关闭调度器并卸载全部非系统模块的内存状态
    pub async fn close(&self) -> Result<()> {
        self.frame_start_level.close();
        self.frame_wiring.close();
        self.unload_modules().await?;
        info!("容器已关闭");
        Ok(())
    }

    /// 设置初始模块状态：系统模块 Installed，其余 Uninstalled
    pub async fn set_initial_module_states(&self) -> Result<()> {
        let wait = self.config.state_lock_timeout();
        let db = self.database.read().await;
        for module in db.modules() {
            let _guard = module
                .state_change_lock()
                .lock(ModuleEvent::Uninstalled, wait)
                .await?;
            if module.is_system() {
                module.set_state(State::Installed);
            } else {
                module.set_state(State::Uninstalled);
            }
        }
        for wiring in db.wirings_copy().values() {
            wiring.invalidate();
        }
        Ok(())
    }

    async fn load_modules(&self) -> Result<()> {
        let wait = self.config.state_lock_timeout();
        let db = self.database.read().await;
        let modules = db.modules();
        let mut guards = Vec::with_capacity(modules.len());
        for module in &modules {
            let guard = module
                .state_change_lock()
                .lock(ModuleEvent::Resolved, wait)
                .await
                .map_err(|e| ContainerError::Internal(format!("无法锁定模块状态: {e}")))?;
            let wired = module
                .current_revision()
                .map(|r| db.wiring(r.id()).is_some())
                .unwrap_or(false);
            module.set_state(if wired { State::Resolved } else { State::Installed });
            guards.push(guard);
        }
        for wiring in db.wirings_copy().values() {
            wiring.validate();
        }
        drop(guards);
        Ok(())
    }

    async fn unload_modules(&self) -> Result<()> {
        let wait = self.config.state_lock_timeout();
        let db = self.database.read().await;
        let mut guards = Vec::new();
        for module in db.modules() {
            if module.is_system() {
                continue;
            }
            let guard = module
                .state_change_lock()
                .lock(ModuleEvent::Uninstalled, wait)
                .await
                .map_err(|e| ContainerError::Internal(format!("无法锁定模块状态: {e}")))?;
            module.set_state(State::Uninstalled);
            guards.push(guard);
        }
        for wiring in db.wirings_copy().values() {
            wiring.invalidate();
        }
        drop(guards);
        Ok(())
    }
}

// ==================== 刷新闭包 ====================

/// 计算模块刷新闭包
///
/// 从种子集出发，沿每个修订版被消费的连线加入全部需求方，对
/// fragment 修订版再沿宿主连线加入全部宿主。`initial` 为 `None`
/// 时以待移除集合为种子。
pub(crate) fn refresh_closure(
    db: &DatabaseState,
    initial: Option<&[Arc<Module>]>,
    wirings: &WiringMap,
) -> Vec<Arc<Module>> {
    let seeds: Vec<Arc<Module>> = match initial {
        Some(list) => list.to_vec(),
        None => {
            let mut seeds: Vec<Arc<Module>> = Vec::new();
            for revision in db.removal_pending() {
                if let Some(module) = db.module_of(&revision) {
                    if !seeds.iter().any(|m| Arc::ptr_eq(m, &module)) {
                        seeds.push(module);
                    }
                }
            }
            seeds
        }
    };

    let mut closure: Vec<Arc<Module>> = Vec::new();
    let mut seen: HashSet<ModuleId> = HashSet::new();
    for module in &seeds {
        add_dependent_modules(db, module, wirings, &mut closure, &mut seen);
    }
    closure
}

fn add_dependent_modules(
    db: &DatabaseState,
    module: &Arc<Module>,
    wirings: &WiringMap,
    closure: &mut Vec<Arc<Module>>,
    seen: &mut HashSet<ModuleId>,
) {
    if !seen.insert(module.id()) {
        return;
    }
    closure.push(module.clone());
    for revision in module.revisions().all() {
        let Some(wiring) = wirings.get(&revision.id()) else {
            continue;
        };
        // 被消费连线的每个需求方都要一起刷新
        for wire in wiring.provided_wires(None) {
            if let Some(requirer) = db.module_of(wire.requirer()) {
                add_dependent_modules(db, &requirer, wirings, closure, seen);
            }
        }
        // fragment 把宿主也拖进闭包
        if revision.is_fragment() {
            for wire in wiring.required_wires(Some(namespace::HOST)) {
                if let Some(host) = db.module_of(wire.provider()) {
                    add_dependent_modules(db, &host, wirings, closure, seen);
                }
            }
        }
    }
}

/// 计算修订版层面的依赖闭包
pub fn dependency_closure_revisions(
    initial: &Arc<ModuleRevision>,
    wirings: &WiringMap,
) -> Vec<Arc<ModuleRevision>> {
    let mut closure: Vec<Arc<ModuleRevision>> = Vec::new();
    let mut seen: HashSet<RevisionId> = HashSet::new();
    add_dependent_revisions(initial, wirings, &mut closure, &mut seen);
    closure
}

fn add_dependent_revisions(
    revision: &Arc<ModuleRevision>,
    wirings: &WiringMap,
    closure: &mut Vec<Arc<ModuleRevision>>,
    seen: &mut HashSet<RevisionId>,
) {
    if !seen.insert(revision.id()) {
        return;
    }
    closure.push(revision.clone());
    let Some(wiring) = wirings.get(&revision.id()) else {
        return;
    };
    for wire in wiring.provided_wires(None) {
        add_dependent_revisions(wire.requirer(), wirings, closure, seen);
    }
    if revision.is_fragment() {
        for wire in wiring.required_wires(Some(namespace::HOST)) {
            add_dependent_revisions(wire.provider(), wirings, closure, seen);
        }
    }
}

/// 系统扩展刷新检查
///
/// 活动的系统模块从种子集剔除（绝不直接取消解析它）；附着在系统
/// 模块上的已解析 fragment 同样剔除，否则会无谓地关停整个框架。
fn check_system_extension_refresh(db: &DatabaseState, initial: Option<&mut Vec<Arc<Module>>>) {
    let Some(initial) = initial else {
        return;
    };
    initial.retain(|module| {
        if module.is_system() {
            return !module.state().is_active_set();
        }
        if !module.state().is_resolved_set() {
            return true;
        }
        let Some(current) = module.current_revision() else {
            return true;
        };
        if !current.is_fragment() {
            return true;
        }
        let Some(wiring) = db.wiring(current.id()) else {
            return true;
        };
        !wiring
            .required_wires(Some(namespace::HOST))
            .iter()
            .any(|wire| wire.provider().module_id() == SYSTEM_MODULE_ID)
    });
}
