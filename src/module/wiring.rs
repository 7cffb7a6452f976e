//! 布线与连线
//!
//! 布线（wiring）是修订版解析后的绑定结果；连线（wire）是一条
//! 从需求指向能力的有向边，由两端布线共同持有。失效都是一次性
//! 且幂等的：失效后的查询只返回空结果。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::revision::{Capability, ModuleRevision, Requirement, RevisionId};

/// 连线：`(需求方修订版, 需求) ↔ (提供方修订版, 能力)`
#[derive(Debug)]
pub struct ModuleWire {
    requirer: Arc<ModuleRevision>,
    requirement: Arc<Requirement>,
    provider: Arc<ModuleRevision>,
    capability: Arc<Capability>,
    valid: AtomicBool,
}

impl ModuleWire {
    /// 创建连线
    pub fn new(
        requirer: Arc<ModuleRevision>,
        requirement: Arc<Requirement>,
        provider: Arc<ModuleRevision>,
        capability: Arc<Capability>,
    ) -> Arc<Self> {
        Arc::new(Self {
            requirer,
            requirement,
            provider,
            capability,
            valid: AtomicBool::new(true),
        })
    }

    /// 需求方修订版
    pub fn requirer(&self) -> &Arc<ModuleRevision> {
        &self.requirer
    }

    /// 需求
    pub fn requirement(&self) -> &Arc<Requirement> {
        &self.requirement
    }

    /// 提供方修订版
    pub fn provider(&self) -> &Arc<ModuleRevision> {
        &self.provider
    }

    /// 能力
    pub fn capability(&self) -> &Arc<Capability> {
        &self.capability
    }

    /// 连线所在命名空间
    pub fn namespace(&self) -> &str {
        &self.capability.namespace
    }

    /// 连线是否仍有效
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// 使连线失效（幂等）
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl fmt::Display for ModuleWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.requirer.id(),
            self.namespace(),
            self.provider.id()
        )
    }
}

#[derive(Debug)]
struct WiringInner {
    capabilities: Vec<Arc<Capability>>,
    requirements: Vec<Arc<Requirement>>,
    provided: Vec<Arc<ModuleWire>>,
    required: Vec<Arc<ModuleWire>>,
    valid: bool,
}

/// 布线：一个修订版解析后的绑定
///
/// 内部可变字段由短临界区读写锁保护；就地修改（`set_*`）只允许在
/// 持有数据库写锁时进行，并发读方总是持有数据库读锁。
#[derive(Debug)]
pub struct ModuleWiring {
    revision: Arc<ModuleRevision>,
    inner: RwLock<WiringInner>,
}

impl ModuleWiring {
    /// 为修订版创建布线
    pub fn new(
        revision: Arc<ModuleRevision>,
        capabilities: Vec<Arc<Capability>>,
        requirements: Vec<Arc<Requirement>>,
        provided: Vec<Arc<ModuleWire>>,
        required: Vec<Arc<ModuleWire>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            revision,
            inner: RwLock::new(WiringInner {
                capabilities,
                requirements,
                provided,
                required,
                valid: true,
            }),
        })
    }

    /// 所属修订版
    pub fn revision(&self) -> &Arc<ModuleRevision> {
        &self.revision
    }

    /// 所属修订版标识
    pub fn revision_id(&self) -> RevisionId {
        self.revision.id()
    }

    /// 布线是否仍有效
    pub fn is_valid(&self) -> bool {
        self.inner.read().valid
    }

    /// 解析后的有效能力列表（可按命名空间过滤）
    pub fn capabilities(&self, ns: Option<&str>) -> Vec<Arc<Capability>> {
        let inner = self.inner.read();
        if !inner.valid {
            return Vec::new();
        }
        match ns {
            Some(ns) => inner
                .capabilities
                .iter()
                .filter(|c| c.namespace == ns)
                .cloned()
                .collect(),
            None => inner.capabilities.clone(),
        }
    }

    /// 解析后的有效需求列表（可按命名空间过滤）
    pub fn requirements(&self, ns: Option<&str>) -> Vec<Arc<Requirement>> {
        let inner = self.inner.read();
        if !inner.valid {
            return Vec::new();
        }
        match ns {
            Some(ns) => inner
                .requirements
                .iter()
                .filter(|r| r.namespace == ns)
                .cloned()
                .collect(),
            None => inner.requirements.clone(),
        }
    }

    /// 被其他修订版消费的连线（可按命名空间过滤）
    pub fn provided_wires(&self, ns: Option<&str>) -> Vec<Arc<ModuleWire>> {
        let inner = self.inner.read();
        if !inner.valid {
            return Vec::new();
        }
        match ns {
            Some(ns) => inner
                .provided
                .iter()
                .filter(|w| w.namespace() == ns)
                .cloned()
                .collect(),
            None => inner.provided.clone(),
        }
    }

    /// 本修订版消费的连线（可按命名空间过滤）
    pub fn required_wires(&self, ns: Option<&str>) -> Vec<Arc<ModuleWire>> {
        let inner = self.inner.read();
        if !inner.valid {
            return Vec::new();
        }
        match ns {
            Some(ns) => inner
                .required
                .iter()
                .filter(|w| w.namespace() == ns)
                .cloned()
                .collect(),
            None => inner.required.clone(),
        }
    }

    /// 替换能力列表（调用方须持有数据库写锁）
    pub(crate) fn set_capabilities(&self, capabilities: Vec<Arc<Capability>>) {
        self.inner.write().capabilities = capabilities;
    }

    /// 替换被消费连线列表（调用方须持有数据库写锁）
    pub(crate) fn set_provided_wires(&self, provided: Vec<Arc<ModuleWire>>) {
        self.inner.write().provided = provided;
    }

    /// 替换消费连线列表（调用方须持有数据库写锁）
    pub(crate) fn set_required_wires(&self, required: Vec<Arc<ModuleWire>>) {
        self.inner.write().required = required;
    }

    /// 使布线失效（幂等）
    ///
    /// 失效后所有查询返回空结果。
    pub(crate) fn invalidate(&self) {
        self.inner.write().valid = false;
    }

    /// 重新激活（容器打开时对持久化布线调用）
    pub(crate) fn validate(&self) {
        self.inner.write().valid = true;
    }
}

impl fmt::Display for ModuleWiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wiring[{}]", self.revision)
    }
}
