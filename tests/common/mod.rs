//! 集成测试辅助
//!
//! 提供记录事件的测试适配器和一个简单的包/宿主匹配解析器。

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use semver::Version;

use jimu_core::container::adaptor::{
    AdminAction, CollisionHook, CollisionMode, ContainerAdaptor, ContainerListener,
};
use jimu_core::container::ModuleContainer;
use jimu_core::core::config::ContainerConfig;
use jimu_core::database::ModuleDatabase;
use jimu_core::module::{
    namespace, ContainerEvent, Module, ModuleEvent, ModuleId, ModuleRevision, ModuleWire,
    ModuleWiring, Requirement, RevisionBuilder, RevisionId,
};
use jimu_core::resolver::{DeltaWiring, ModuleResolver};
use jimu_core::{ContainerError, Result, WiringMap};

// ==================== 测试适配器 ====================

/// 记录全部事件发布的测试适配器
pub struct TestAdaptor {
    /// 模块事件记录
    pub module_events: Mutex<Vec<(ModuleEvent, ModuleId)>>,
    /// 容器事件记录（事件, 模块, 是否带错误）
    pub container_events: Mutex<Vec<(ContainerEvent, Option<ModuleId>, bool)>>,
    /// 框架属性
    pub properties: Mutex<HashMap<String, String>>,
    /// 激活会失败的模块
    pub activation_failures: Mutex<HashSet<ModuleId>>,
    /// 激活顺序记录
    pub activations: Mutex<Vec<ModuleId>>,
    /// 碰撞钩子是否放行全部候选
    pub collision_allow: Arc<AtomicBool>,
    /// 对发起者不可见的位置集合
    pub invisible_locations: Mutex<HashSet<String>>,
    /// refreshed_system_module 调用次数
    pub system_refresh_signals: AtomicUsize,
}

impl TestAdaptor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            module_events: Mutex::new(Vec::new()),
            container_events: Mutex::new(Vec::new()),
            properties: Mutex::new(HashMap::new()),
            activation_failures: Mutex::new(HashSet::new()),
            activations: Mutex::new(Vec::new()),
            collision_allow: Arc::new(AtomicBool::new(false)),
            invisible_locations: Mutex::new(HashSet::new()),
            system_refresh_signals: AtomicUsize::new(0),
        })
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.properties
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// 指定模块的事件序列
    pub fn events_for(&self, module_id: ModuleId) -> Vec<ModuleEvent> {
        self.module_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id)| *id == module_id)
            .map(|(event, _)| *event)
            .collect()
    }

    /// 指定事件的发布次数
    pub fn event_count(&self, event: ModuleEvent, module_id: ModuleId) -> usize {
        self.events_for(module_id)
            .iter()
            .filter(|e| **e == event)
            .count()
    }

    pub fn container_event_count(&self, event: ContainerEvent) -> usize {
        self.container_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| *e == event)
            .count()
    }
}

struct TestCollisionHook {
    allow: Arc<AtomicBool>,
}

impl CollisionHook for TestCollisionHook {
    fn filter_collisions(
        &self,
        _mode: CollisionMode,
        _target: &Arc<Module>,
        candidates: &mut Vec<Arc<Module>>,
    ) {
        if self.allow.load(Ordering::SeqCst) {
            candidates.clear();
        }
    }
}

#[async_trait]
impl ContainerAdaptor for TestAdaptor {
    fn publish_module_event(&self, event: ModuleEvent, module: &Arc<Module>, _origin: &Arc<Module>) {
        self.module_events.lock().unwrap().push((event, module.id()));
    }

    fn publish_container_event(
        &self,
        event: ContainerEvent,
        module: Option<&Arc<Module>>,
        error: Option<&ContainerError>,
        listeners: &[Arc<dyn ContainerListener>],
    ) {
        self.container_events
            .lock()
            .unwrap()
            .push((event, module.map(|m| m.id()), error.is_some()));
        for listener in listeners {
            listener.on_container_event(event, module, error);
        }
    }

    fn collision_hook(&self) -> Arc<dyn CollisionHook> {
        Arc::new(TestCollisionHook {
            allow: self.collision_allow.clone(),
        })
    }

    fn is_module_visible(&self, _origin: &Arc<Module>, existing: &Arc<Module>) -> bool {
        !self
            .invisible_locations
            .lock()
            .unwrap()
            .contains(existing.location())
    }

    fn check_permission(&self, _module: Option<&Arc<Module>>, _action: AdminAction) -> Result<()> {
        Ok(())
    }

    fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().unwrap().get(key).cloned()
    }

    fn refreshed_system_module(&self) {
        self.system_refresh_signals.fetch_add(1, Ordering::SeqCst);
    }

    async fn activate(&self, module: &Arc<Module>) -> Result<()> {
        if self
            .activation_failures
            .lock()
            .unwrap()
            .contains(&module.id())
        {
            return Err(ContainerError::Other(anyhow::anyhow!(
                "activator 故障注入: {}",
                module.id()
            )));
        }
        self.activations.lock().unwrap().push(module.id());
        Ok(())
    }

    async fn deactivate(&self, _module: &Arc<Module>) -> Result<()> {
        Ok(())
    }
}

/// 记录容器事件的监听器
pub struct TestListener {
    pub events: Mutex<Vec<ContainerEvent>>,
}

impl TestListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self, event: ContainerEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }
}

impl ContainerListener for TestListener {
    fn on_container_event(
        &self,
        event: ContainerEvent,
        _module: Option<&Arc<Module>>,
        _error: Option<&ContainerError>,
    ) {
        self.events.lock().unwrap().push(event);
    }
}

// ==================== 测试解析器 ====================

/// 简单的首次匹配解析器
///
/// 对未解析集合做不动点迭代：一个修订版的全部强制需求都能在
/// 已布线或本轮新解析的修订版中找到提供者时即告解析。动态需求
/// 在静态解析时跳过；fragment 作为包提供者被排除。
pub struct TestResolver;

impl TestResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    fn find_capability(
        requirement: &Requirement,
        wirings: &WiringMap,
        newly_resolved: &[Arc<ModuleRevision>],
    ) -> Option<(Arc<ModuleRevision>, Arc<jimu_core::Capability>)> {
        // 新修订版优先于旧修订版（逆序迭代布线表）
        for (_, wiring) in wirings.iter().rev() {
            let provider = wiring.revision();
            if provider.id().module == requirement.revision.module {
                continue;
            }
            if requirement.namespace == namespace::PACKAGE && provider.is_fragment() {
                continue;
            }
            for capability in wiring.capabilities(Some(requirement.namespace.as_str())) {
                if requirement.matches(&capability) {
                    return Some((provider.clone(), capability));
                }
            }
        }
        for provider in newly_resolved {
            if provider.id().module == requirement.revision.module {
                continue;
            }
            if requirement.namespace == namespace::PACKAGE && provider.is_fragment() {
                continue;
            }
            for capability in provider.capabilities_in(&requirement.namespace) {
                if requirement.matches(&capability) {
                    return Some((provider.clone(), capability));
                }
            }
        }
        None
    }
}

impl ModuleResolver for TestResolver {
    fn resolve_delta(
        &self,
        triggers: &[Arc<ModuleRevision>],
        triggers_mandatory: bool,
        unresolved: &[Arc<ModuleRevision>],
        wirings: &WiringMap,
    ) -> Result<DeltaWiring> {
        // (修订版, 消费连线) 的本轮选择
        let mut selected: BTreeMap<RevisionId, (Arc<ModuleRevision>, Vec<Arc<ModuleWire>>)> =
            BTreeMap::new();

        let mut progress = true;
        while progress {
            progress = false;
            'attempt: for revision in unresolved {
                if wirings.contains_key(&revision.id()) || selected.contains_key(&revision.id()) {
                    continue;
                }
                let resolved_now: Vec<Arc<ModuleRevision>> =
                    selected.values().map(|(r, _)| r.clone()).collect();
                let mut required: Vec<Arc<ModuleWire>> = Vec::new();
                for requirement in revision.requirements() {
                    if requirement.is_dynamic() {
                        continue;
                    }
                    match Self::find_capability(requirement, wirings, &resolved_now) {
                        Some((provider, capability)) => {
                            required.push(ModuleWire::new(
                                revision.clone(),
                                requirement.clone(),
                                provider,
                                capability,
                            ));
                        }
                        None if requirement.is_optional() => {}
                        None => continue 'attempt,
                    }
                }
                selected.insert(revision.id(), (revision.clone(), required));
                progress = true;
            }
        }

        if triggers_mandatory {
            for trigger in triggers {
                if !wirings.contains_key(&trigger.id()) && !selected.contains_key(&trigger.id()) {
                    return Err(ContainerError::Resolution(format!(
                        "无法解析触发修订版: {trigger}"
                    )));
                }
            }
        }

        // 汇总提供方新增连线
        let mut provided_additions: BTreeMap<RevisionId, Vec<Arc<ModuleWire>>> = BTreeMap::new();
        for (_, wires) in selected.values() {
            for wire in wires {
                provided_additions
                    .entry(wire.provider().id())
                    .or_default()
                    .push(wire.clone());
            }
        }

        let mut delta = DeltaWiring::new();
        for (id, (revision, required)) in &selected {
            let provided = provided_additions.remove(id).unwrap_or_default();
            delta.insert(
                *id,
                ModuleWiring::new(
                    revision.clone(),
                    revision.capabilities().to_vec(),
                    revision.requirements().to_vec(),
                    provided,
                    required.clone(),
                ),
            );
        }
        // 既有提供方：在旧布线基础上补充连线
        for (id, wires) in provided_additions {
            let Some(existing) = wirings.get(&id) else {
                continue;
            };
            let mut provided = existing.provided_wires(None);
            provided.extend(wires);
            delta.insert(
                id,
                ModuleWiring::new(
                    existing.revision().clone(),
                    existing.capabilities(None),
                    existing.requirements(None),
                    provided,
                    existing.required_wires(None),
                ),
            );
        }
        Ok(delta)
    }

    fn resolve_dynamic_delta(
        &self,
        requirement: &Requirement,
        _unresolved: &[Arc<ModuleRevision>],
        wirings: &WiringMap,
    ) -> Result<DeltaWiring> {
        let Some(requirer_wiring) = wirings.get(&requirement.revision) else {
            return Ok(DeltaWiring::new());
        };
        let requirer = requirer_wiring.revision().clone();

        for (provider_id, provider_wiring) in wirings.iter().rev() {
            if provider_id.module == requirement.revision.module {
                continue;
            }
            if provider_wiring.revision().is_fragment() {
                continue;
            }
            for capability in provider_wiring.capabilities(Some(namespace::PACKAGE)) {
                if !requirement.matches(&capability) {
                    continue;
                }
                let wire = ModuleWire::new(
                    requirer.clone(),
                    Arc::new(requirement.clone()),
                    provider_wiring.revision().clone(),
                    capability,
                );

                let mut required = requirer_wiring.required_wires(None);
                required.push(wire.clone());
                let mut provided = provider_wiring.provided_wires(None);
                provided.push(wire);

                let mut delta = DeltaWiring::new();
                delta.insert(
                    requirement.revision,
                    ModuleWiring::new(
                        requirer.clone(),
                        requirer_wiring.capabilities(None),
                        requirer_wiring.requirements(None),
                        requirer_wiring.provided_wires(None),
                        required,
                    ),
                );
                delta.insert(
                    *provider_id,
                    ModuleWiring::new(
                        provider_wiring.revision().clone(),
                        provider_wiring.capabilities(None),
                        provider_wiring.requirements(None),
                        provided,
                        provider_wiring.required_wires(None),
                    ),
                );
                return Ok(delta);
            }
        }
        Ok(DeltaWiring::new())
    }
}

// ==================== 环境搭建 ====================

/// 测试环境：容器 + 适配器
pub struct TestContext {
    pub container: Arc<ModuleContainer>,
    pub adaptor: Arc<TestAdaptor>,
}

/// 创建容器（未安装系统模块）
pub fn setup() -> TestContext {
    setup_with_config(ContainerConfig::builder().state_lock_timeout_ms(2000).build())
}

pub fn setup_with_config(config: ContainerConfig) -> TestContext {
    let adaptor = TestAdaptor::new();
    let container = ModuleContainer::new(
        adaptor.clone(),
        TestResolver::new(),
        Arc::new(ModuleDatabase::new()),
        config,
    );
    TestContext { container, adaptor }
}

/// 安装并启动系统模块，打开容器（活动起始级别爬升到 1）
pub async fn boot(ctx: &TestContext) -> Arc<Module> {
    boot_with_system_builder(
        ctx,
        RevisionBuilder::named("system.module", Version::new(1, 0, 0)),
    )
    .await
}

pub async fn boot_with_system_builder(
    ctx: &TestContext,
    builder: RevisionBuilder,
) -> Arc<Module> {
    let system = ctx
        .container
        .install(None, "System Module", &builder)
        .await
        .expect("安装系统模块失败");
    assert_eq!(system.id(), 0);
    ctx.container.open().await.expect("打开容器失败");
    ctx.container
        .start(&system, Default::default())
        .await
        .expect("启动系统模块失败");
    system
}

/// 以默认版本 1.0.0 构建命名修订版
pub fn builder(name: &str) -> RevisionBuilder {
    RevisionBuilder::named(name, Version::new(1, 0, 0))
}

/// 轮询等待条件成立（后台任务用）
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("等待超时: {what}");
}
