//! 起始级别引擎
//!
//! 活动起始级别从 0（未激活）开始，按单位步长单调爬升或回落。
//! 框架级与单模块级两种作业都经由同一个单消费者调度器串行执行；
//! 上行步骤先启动惰性激活模块再启动其余模块，下行步骤按依赖序
//! 逆向停止。

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::PROP_BEGINNING_START_LEVEL;
use crate::database::Sort;
use crate::module::metadata::{ContainerEvent, StartOptions, StopOptions, SYSTEM_MODULE_ID};
use crate::module::module::Module;
use crate::utils::{ContainerError, Result};

use super::adaptor::{AdminAction, ContainerListener};
use super::ModuleContainer;

/// 哨兵：要求引擎从配置键 `framework.beginning.startlevel` 读取
/// 目标级别（缺省 1）
pub const USE_BEGINNING_START_LEVEL: i32 = i32::MIN;

enum StartLevelJob {
    Framework {
        target: i32,
        listeners: Vec<Arc<dyn ContainerListener>>,
    },
    Module {
        module: Arc<Module>,
        level: i32,
    },
}

enum DispatcherState {
    /// 未创建，首次使用时按需创建
    Idle,
    Running {
        tx: UnboundedSender<StartLevelJob>,
        _handle: JoinHandle<()>,
    },
    /// 已关闭，拒绝后续操作直到下一次打开
    Closed,
}

/// 起始级别引擎
pub struct ContainerStartLevel {
    container: Weak<ModuleContainer>,
    /// 活动起始级别；0 表示尚未激活
    active: AtomicI32,
    dispatcher: Mutex<DispatcherState>,
    /// 框架级爬升的串行化锁
    ramp_lock: AsyncMutex<()>,
}

impl ContainerStartLevel {
    pub(crate) fn new(container: Weak<ModuleContainer>) -> Self {
        Self {
            container,
            active: AtomicI32::new(0),
            dispatcher: Mutex::new(DispatcherState::Idle),
            ramp_lock: AsyncMutex::new(()),
        }
    }

    /// 当前活动起始级别
    pub fn active_start_level(&self) -> i32 {
        self.active.load(Ordering::SeqCst)
    }

    /// 设置单个模块的起始级别并排队调整作业
    pub(crate) async fn set_module_start_level(
        &self,
        container: &ModuleContainer,
        module: &Arc<Module>,
        level: i32,
    ) -> Result<()> {
        container
            .adaptor()
            .check_permission(Some(module), AdminAction::Execute)?;
        if module.is_system() {
            return Err(ContainerError::InvalidOperation(
                "不能设置系统模块的起始级别".to_string(),
            ));
        }
        if level < 1 {
            return Err(ContainerError::InvalidOperation(format!(
                "起始级别不能小于 1: {level}"
            )));
        }
        if module.start_level() == level {
            return Ok(()); // 无变化
        }
        {
            let mut db = container.database().write().await;
            db.set_start_level(module, level);
        }
        debug!(module_id = module.id(), level, "模块起始级别已更新，排队调整作业");
        self.enqueue(StartLevelJob::Module {
            module: module.clone(),
            level,
        })
    }

    /// 设置框架起始级别（排队后台爬升作业）
    pub(crate) fn set_start_level(
        &self,
        container: &ModuleContainer,
        level: i32,
        listeners: Vec<Arc<dyn ContainerListener>>,
    ) -> Result<()> {
        container
            .adaptor()
            .check_permission(None, AdminAction::StartLevel)?;
        if level < 1 {
            return Err(ContainerError::InvalidOperation(format!(
                "起始级别不能小于 1: {level}"
            )));
        }
        if self.active_start_level() == 0 {
            return Err(ContainerError::InvalidOperation(
                "框架尚未激活".to_string(),
            ));
        }
        self.enqueue(StartLevelJob::Framework {
            target: level,
            listeners,
        })
    }

    fn enqueue(&self, job: StartLevelJob) -> Result<()> {
        let mut state = self.dispatcher.lock();
        match &*state {
            DispatcherState::Closed => Err(ContainerError::InvalidOperation(
                "起始级别调度器已关闭".to_string(),
            )),
            DispatcherState::Running { tx, .. } => tx
                .send(job)
                .map_err(|_| ContainerError::Internal("起始级别调度器已退出".to_string())),
            DispatcherState::Idle => {
                let (tx, handle) = self.spawn_worker();
                let send = tx
                    .send(job)
                    .map_err(|_| ContainerError::Internal("起始级别调度器已退出".to_string()));
                *state = DispatcherState::Running { tx, _handle: handle };
                send
            }
        }
    }

    fn spawn_worker(&self) -> (UnboundedSender<StartLevelJob>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StartLevelJob>();
        let weak = self.container.clone();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(container) = weak.upgrade() else {
                    break;
                };
                match job {
                    StartLevelJob::Framework { target, listeners } => {
                        let system = container.module(SYSTEM_MODULE_ID).await;
                        if let Err(e) = container
                            .frame_start_level
                            .do_container_start_level(
                                &container,
                                system.as_ref(),
                                target,
                                &listeners,
                            )
                            .await
                        {
                            warn!(error = %e, "框架起始级别作业失败");
                        }
                    }
                    StartLevelJob::Module { module, level } => {
                        container
                            .frame_start_level
                            .handle_module_job(&container, &module, level)
                            .await;
                    }
                }
            }
        });
        (tx, handle)
    }

    /// 单模块起始级别作业：级别不再满足则瞬态停止，满足则自动启动。
    /// 绝不改动活动起始级别。
    async fn handle_module_job(&self, container: &ModuleContainer, module: &Arc<Module>, level: i32) {
        let result = if self.active_start_level() < level {
            if module.state().is_active_set() {
                // 级别不再满足后没有任务能成功启动它，无需状态变更锁
                container.stop(module, StopOptions::transient()).await
            } else {
                Ok(())
            }
        } else {
            container
                .start(module, StartOptions::transient_if_auto_start())
                .await
        };
        if let Err(e) = result {
            container.adaptor().publish_container_event(
                ContainerEvent::Error,
                Some(module),
                Some(&e),
                &[],
            );
        }
    }

    /// 执行一次框架起始级别变更
    ///
    /// 完成时发布起始级别容器事件；上行途中若系统模块刷新标志
    /// 被置位则立即停止处理。
    pub(crate) async fn do_container_start_level(
        &self,
        container: &ModuleContainer,
        event_module: Option<&Arc<Module>>,
        target: i32,
        listeners: &[Arc<dyn ContainerListener>],
    ) -> Result<()> {
        let _ramp = self.ramp_lock.lock().await;
        let target = if target == USE_BEGINNING_START_LEVEL {
            container
                .adaptor()
                .property(PROP_BEGINNING_START_LEVEL)
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(1)
        } else {
            target
        };

        let current = self.active_start_level();
        info!(from = current, to = target, "框架起始级别变更");
        if target > current {
            for step in current..target {
                let to_level = step + 1;
                self.active.store(to_level, Ordering::SeqCst);
                // 每一步都重新取模块列表：上一级别可能安装了新模块
                let sorted = {
                    let db = container.database().read().await;
                    db.sorted_modules(&[Sort::ByStartLevel])
                };
                self.inc_start_level(container, to_level, &sorted, true).await;
                self.inc_start_level(container, to_level, &sorted, false).await;
            }
        } else {
            for step in ((target + 1)..=current).rev() {
                let to_level = step - 1;
                self.active.store(to_level, Ordering::SeqCst);
                let sorted = {
                    let db = container.database().read().await;
                    db.sorted_modules(&[Sort::ByStartLevel, Sort::ByDependency])
                };
                self.dec_start_level(container, to_level, &sorted).await;
            }
        }

        container.adaptor().publish_container_event(
            ContainerEvent::StartLevel,
            event_module,
            None,
            listeners,
        );
        Ok(())
    }

    /// 上行一步：`lazy_only` 轮只启动惰性激活模块，随后一轮启动
    /// 其余模块。级别更高的模块出现即停止扫描。
    async fn inc_start_level(
        &self,
        container: &ModuleContainer,
        to_level: i32,
        sorted: &[Arc<Module>],
        lazy_only: bool,
    ) {
        for module in sorted {
            if container.is_refreshing_system_module() {
                return;
            }
            let module_level = module.start_level();
            if module_level < to_level {
                // 更低级别的模块应当已经启动
                continue;
            }
            if module_level > to_level {
                break;
            }
            if module.is_lazy_activate() != lazy_only {
                continue;
            }
            match Box::pin(container.start(module, StartOptions::transient_if_auto_start())).await
            {
                Ok(()) => {}
                Err(ContainerError::Uninstalled(_)) => continue,
                Err(e) => {
                    container.adaptor().publish_container_event(
                        ContainerEvent::Error,
                        Some(module),
                        Some(&e),
                        &[],
                    );
                }
            }
        }
    }

    /// 下行一步：逆序停止起始级别等于 `to_level + 1` 的活动模块
    async fn dec_start_level(
        &self,
        container: &ModuleContainer,
        to_level: i32,
        sorted: &[Arc<Module>],
    ) {
        for module in sorted.iter().rev() {
            let module_level = module.start_level();
            if module_level > to_level + 1 {
                // 更高级别的模块应当已经停止
                continue;
            }
            if module_level <= to_level {
                break;
            }
            if module.state().is_active_set() {
                match Box::pin(container.stop(module, StopOptions::transient())).await {
                    Ok(()) => {}
                    Err(ContainerError::Uninstalled(_)) => continue,
                    Err(e) => {
                        container.adaptor().publish_container_event(
                            ContainerEvent::Error,
                            Some(module),
                            Some(&e),
                            &[],
                        );
                    }
                }
            }
        }
    }

    /// 重置调度器（容器打开时调用）
    pub(crate) fn open(&self) {
        let mut state = self.dispatcher.lock();
        // 旧 worker 随发送端丢弃而退出，新的按需创建
        *state = DispatcherState::Idle;
    }

    /// 关闭调度器，阻止后续操作直到下一次打开
    pub(crate) fn close(&self) {
        let mut state = self.dispatcher.lock();
        *state = DispatcherState::Closed;
    }
}
