//! 布线外观
//!
//! 面向外部调用方合并刷新/解析请求。刷新作业排队到专属的单消费
//! 者调度器上，同一时刻至多一个刷新在途；作业完成后无论成败都向
//! 随附的监听器发布刷新事件。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::module::metadata::{ContainerEvent, SYSTEM_MODULE_ID};
use crate::module::module::Module;
use crate::utils::{ContainerError, Result};

use super::adaptor::{AdminAction, ContainerListener};
use super::ModuleContainer;

struct RefreshJob {
    modules: Option<Vec<Arc<Module>>>,
    listeners: Vec<Arc<dyn ContainerListener>>,
}

enum DispatcherState {
    Idle,
    Running {
        tx: UnboundedSender<RefreshJob>,
        _handle: JoinHandle<()>,
    },
    Closed,
}

/// 布线外观
pub struct ContainerWiring {
    container: Weak<ModuleContainer>,
    dispatcher: Mutex<DispatcherState>,
}

impl ContainerWiring {
    pub(crate) fn new(container: Weak<ModuleContainer>) -> Self {
        Self {
            container,
            dispatcher: Mutex::new(DispatcherState::Idle),
        }
    }

    /// 排队一次后台刷新
    ///
    /// `modules` 为 `None` 时刷新待移除集合。刷新过程中的解析错误
    /// 先以容器错误事件发出，随后无论成败都向监听器发布刷新事件。
    pub(crate) fn refresh_modules(
        &self,
        container: &ModuleContainer,
        modules: Option<Vec<Arc<Module>>>,
        listeners: Vec<Arc<dyn ContainerListener>>,
    ) -> Result<()> {
        container
            .adaptor()
            .check_permission(None, AdminAction::Resolve)?;
        self.enqueue(RefreshJob { modules, listeners })
    }

    fn enqueue(&self, job: RefreshJob) -> Result<()> {
        let mut state = self.dispatcher.lock();
        match &*state {
            DispatcherState::Closed => Err(ContainerError::InvalidOperation(
                "刷新调度器已关闭".to_string(),
            )),
            DispatcherState::Running { tx, .. } => tx
                .send(job)
                .map_err(|_| ContainerError::Internal("刷新调度器已退出".to_string())),
            DispatcherState::Idle => {
                let (tx, handle) = self.spawn_worker();
                let send = tx
                    .send(job)
                    .map_err(|_| ContainerError::Internal("刷新调度器已退出".to_string()));
                *state = DispatcherState::Running { tx, _handle: handle };
                send
            }
        }
    }

    fn spawn_worker(&self) -> (UnboundedSender<RefreshJob>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RefreshJob>();
        let weak = self.container.clone();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(container) = weak.upgrade() else {
                    break;
                };
                let system = container.module(SYSTEM_MODULE_ID).await;
                let result = container.refresh(job.modules).await;
                if let Err(e) = result {
                    warn!(error = %e, "后台刷新失败");
                    container.adaptor().publish_container_event(
                        ContainerEvent::Error,
                        system.as_ref(),
                        Some(&e),
                        &[],
                    );
                }
                // 无论成败都向监听器发布刷新事件
                container.adaptor().publish_container_event(
                    ContainerEvent::Refresh,
                    system.as_ref(),
                    None,
                    &job.listeners,
                );
            }
        });
        (tx, handle)
    }

    /// 重置调度器（容器打开时调用）
    pub(crate) fn open(&self) {
        let mut state = self.dispatcher.lock();
        *state = DispatcherState::Idle;
    }

    /// 关闭调度器，阻止后续操作直到下一次打开
    pub(crate) fn close(&self) {
        let mut state = self.dispatcher.lock();
        *state = DispatcherState::Closed;
    }
}
