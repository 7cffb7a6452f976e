//! 模块实体
//!
//! 模块是带标识、位置和生命周期状态的长生命周期实体。持久图数据
//! 归数据库所有；模块自身只持有瞬态状态（生命周期状态、状态变更
//! 锁、起始级别、自动启动标志）和自己的修订版序列。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::container::locks::StateChangeLock;
use crate::utils::{ContainerError, Result};

use super::metadata::{ActivationPolicy, ModuleId, State, SYSTEM_MODULE_ID};
use super::revision::{ModuleRevision, RevisionId};

/// 模块的修订版序列
///
/// 下标 0 为当前修订版；更新把新修订版插入头部，刷新丢弃其余。
#[derive(Debug)]
pub struct ModuleRevisions {
    list: RwLock<Vec<Arc<ModuleRevision>>>,
    uninstalled: AtomicBool,
}

impl ModuleRevisions {
    fn new(initial: Arc<ModuleRevision>) -> Self {
        Self {
            list: RwLock::new(vec![initial]),
            uninstalled: AtomicBool::new(false),
        }
    }

    /// 当前修订版
    ///
    /// 仅在刷新清空了已卸载模块的修订版后才为 `None`。
    pub fn current(&self) -> Option<Arc<ModuleRevision>> {
        self.list.read().first().cloned()
    }

    /// 修订版快照，当前版在前
    pub fn all(&self) -> Vec<Arc<ModuleRevision>> {
        self.list.read().clone()
    }

    /// 模块是否已卸载
    pub fn is_uninstalled(&self) -> bool {
        self.uninstalled.load(Ordering::Acquire)
    }

    /// 指定修订版是否为当前版
    pub fn is_current(&self, id: RevisionId) -> bool {
        !self.is_uninstalled() && self.current().map(|r| r.id()) == Some(id)
    }

    /// 插入新的当前修订版（更新操作，调用方须持有数据库写锁）
    pub(crate) fn add_current(&self, revision: Arc<ModuleRevision>) {
        self.list.write().insert(0, revision);
    }

    /// 摘除一个修订版（刷新操作，调用方须持有数据库写锁）
    pub(crate) fn remove(&self, id: RevisionId) {
        self.list.write().retain(|r| r.id() != id);
    }

    pub(crate) fn mark_uninstalled(&self) {
        self.uninstalled.store(true, Ordering::Release);
    }
}

/// 模块实体
pub struct Module {
    id: ModuleId,
    location: String,
    state: RwLock<State>,
    state_change: StateChangeLock,
    start_level: AtomicI32,
    persistently_started: AtomicBool,
    revisions: ModuleRevisions,
    last_modified: RwLock<DateTime<Utc>>,
}

impl Module {
    pub(crate) fn new(
        id: ModuleId,
        location: String,
        initial_revision: Arc<ModuleRevision>,
        start_level: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            location,
            state: RwLock::new(State::Installed),
            state_change: StateChangeLock::new(),
            start_level: AtomicI32::new(start_level),
            persistently_started: AtomicBool::new(false),
            revisions: ModuleRevisions::new(initial_revision),
            last_modified: RwLock::new(Utc::now()),
        })
    }

    /// 模块标识
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// 是否为系统模块
    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_MODULE_ID
    }

    /// 安装位置（每个未卸载模块唯一）
    pub fn location(&self) -> &str {
        &self.location
    }

    /// 当前生命周期状态
    pub fn state(&self) -> State {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.write() = state;
    }

    /// 校验模块未被卸载
    pub fn check_valid(&self) -> Result<()> {
        if self.state() == State::Uninstalled {
            return Err(ContainerError::Uninstalled(self.id));
        }
        Ok(())
    }

    /// 每模块状态变更锁
    pub fn state_change_lock(&self) -> &StateChangeLock {
        &self.state_change
    }

    /// 起始级别
    pub fn start_level(&self) -> i32 {
        self.start_level.load(Ordering::Acquire)
    }

    pub(crate) fn set_start_level(&self, level: i32) {
        self.start_level.store(level, Ordering::Release);
    }

    /// 是否带持久自动启动标志
    pub fn is_persistently_started(&self) -> bool {
        self.persistently_started.load(Ordering::Acquire)
    }

    pub(crate) fn set_persistently_started(&self, started: bool) {
        self.persistently_started.store(started, Ordering::Release);
    }

    /// 当前修订版是否声明惰性激活
    pub fn is_lazy_activate(&self) -> bool {
        self.current_revision()
            .map(|r| r.activation_policy() == ActivationPolicy::Lazy)
            .unwrap_or(false)
    }

    /// 修订版序列
    pub fn revisions(&self) -> &ModuleRevisions {
        &self.revisions
    }

    /// 当前修订版
    pub fn current_revision(&self) -> Option<Arc<ModuleRevision>> {
        self.revisions.current()
    }

    /// 当前符号名
    pub fn symbolic_name(&self) -> Option<String> {
        self.current_revision()
            .and_then(|r| r.symbolic_name().map(str::to_string))
    }

    /// 最近一次安装/更新/卸载的时间
    pub fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.read()
    }

    pub(crate) fn touch(&self) {
        *self.last_modified.write() = Utc::now();
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state())
            .field("start_level", &self.start_level())
            .finish()
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbolic_name() {
            Some(name) => write!(f, "{}[{}]", name, self.id),
            None => write!(f, "module[{}]", self.id),
        }
    }
}
