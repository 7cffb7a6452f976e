//! 容器锁原语
//!
//! - [`LockSet`]: 按字符串键（位置、符号名）索引的命名锁注册表，
//!   带超时获取，无人等待时回收条目。
//! - [`StateChangeLock`]: 每模块状态变更锁，携带当前迁移标记。
//!
//! 两者都基于 tokio 互斥量实现，守卫可跨 await 点持有。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::trace;

use crate::module::metadata::ModuleEvent;
use crate::utils::{ContainerError, Result};

// ==================== 命名锁注册表 ====================

#[derive(Default, Debug)]
struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    /// 对该条目感兴趣的任务数（持有者 + 等待者）
    interest: usize,
}

/// 命名锁注册表
///
/// 用于串行化针对同一位置或同一符号名的安装/更新操作，而不阻塞
/// 无关操作。条目在最后一个感兴趣的任务释放后被移除。
///
/// # Example
///
/// ```rust
/// use jimu_core::container::locks::LockSet;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let locks = LockSet::new();
///
///     let guard = locks.try_lock("file:a", Duration::from_secs(5)).await.unwrap();
///     // 不同键互不阻塞
///     let other = locks.try_lock("file:b", Duration::from_secs(5)).await.unwrap();
///
///     // 守卫丢弃即释放，无人等待的条目被回收
///     drop(guard);
///     drop(other);
///     assert!(locks.is_empty());
/// }
/// ```
pub struct LockSet {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl LockSet {
    /// 创建空注册表
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 以超时方式获取键锁
    ///
    /// 成功返回守卫（丢弃即释放）；超时返回状态变更错误。
    ///
    /// # Arguments
    ///
    /// * `key` - 锁键（安装位置或符号名）
    /// * `wait` - 最长等待时长
    ///
    /// # Example
    ///
    /// ```rust
    /// use jimu_core::container::locks::LockSet;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let locks = LockSet::new();
    ///     let _guard = locks.try_lock("demo", Duration::from_secs(5)).await.unwrap();
    ///
    ///     // 已被持有：超时后以状态变更错误失败
    ///     let result = locks.try_lock("demo", Duration::from_millis(10)).await;
    ///     assert!(result.is_err());
    /// }
    /// ```
    pub async fn try_lock(&self, key: &str, wait: Duration) -> Result<KeyLockGuard> {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_default();
            entry.interest += 1;
            entry.mutex.clone()
        };

        match timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => {
                trace!(key = %key, "已获取命名锁");
                Ok(KeyLockGuard {
                    guard: Some(guard),
                    key: key.to_string(),
                    entries: self.entries.clone(),
                })
            }
            Err(_) => {
                self.release_interest(key);
                Err(ContainerError::StateChange(format!(
                    "获取命名锁超时: '{key}'"
                )))
            }
        }
    }

    fn release_interest(&self, key: &str) {
        Self::release_interest_in(&self.entries, key);
    }

    fn release_interest_in(entries: &Mutex<HashMap<String, LockEntry>>, key: &str) {
        let mut entries = entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.interest -= 1;
            if entry.interest == 0 {
                entries.remove(key);
            }
        }
    }

    /// 当前注册的键数量
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 注册表是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LockSet {
    fn default() -> Self {
        Self::new()
    }
}

/// 命名锁守卫
#[derive(Debug)]
pub struct KeyLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        // 先释放互斥量，再回收注册条目
        self.guard.take();
        LockSet::release_interest_in(&self.entries, &self.key);
        trace!(key = %self.key, "已释放命名锁");
    }
}

// ==================== 状态变更锁 ====================

/// 每模块状态变更锁
///
/// 互斥量之外携带一个当前迁移标记，供解析引擎的自动启动步骤判断
/// 模块是否正处于启动迁移中。
pub struct StateChangeLock {
    mutex: Arc<AsyncMutex<()>>,
    current: Arc<Mutex<Option<ModuleEvent>>>,
}

impl StateChangeLock {
    /// 创建状态变更锁
    pub fn new() -> Self {
        Self {
            mutex: Arc::new(AsyncMutex::new(())),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// 以超时方式获取锁并声明迁移种类
    ///
    /// # Example
    ///
    /// ```rust
    /// use jimu_core::container::locks::StateChangeLock;
    /// use jimu_core::ModuleEvent;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let lock = StateChangeLock::new();
    ///
    ///     let guard = lock.lock(ModuleEvent::Started, Duration::from_secs(5)).await.unwrap();
    ///     assert!(lock.in_transition(ModuleEvent::Started));
    ///
    ///     // 丢弃守卫清除迁移标记并释放互斥量
    ///     drop(guard);
    ///     assert_eq!(lock.current_transition(), None);
    /// }
    /// ```
    pub async fn lock(&self, transition: ModuleEvent, wait: Duration) -> Result<StateChangeGuard> {
        match timeout(wait, self.mutex.clone().lock_owned()).await {
            Ok(guard) => {
                *self.current.lock() = Some(transition);
                Ok(StateChangeGuard {
                    guard: Some(guard),
                    current: self.current.clone(),
                })
            }
            Err(_) => Err(ContainerError::StateChange(format!(
                "获取状态变更锁超时: {transition:?}"
            ))),
        }
    }

    /// 当前正在进行的迁移（如有）
    pub fn current_transition(&self) -> Option<ModuleEvent> {
        *self.current.lock()
    }

    /// 是否正处于指定迁移中
    pub fn in_transition(&self, transition: ModuleEvent) -> bool {
        self.current_transition() == Some(transition)
    }
}

impl Default for StateChangeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateChangeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChangeLock")
            .field("current", &self.current_transition())
            .finish()
    }
}

/// 状态变更锁守卫
///
/// 丢弃时清除迁移标记并释放互斥量。内部生命周期流程把它作为
/// "已持锁"的证明参数传递。
#[derive(Debug)]
pub struct StateChangeGuard {
    guard: Option<OwnedMutexGuard<()>>,
    current: Arc<Mutex<Option<ModuleEvent>>>,
}

impl Drop for StateChangeGuard {
    fn drop(&mut self) {
        *self.current.lock() = None;
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_lock_set_basic() {
        let locks = LockSet::new();
        let guard = locks.try_lock("file:a", LONG).await.unwrap();
        assert_eq!(locks.len(), 1);

        // 不同键互不阻塞
        let other = locks.try_lock("file:b", LONG).await.unwrap();
        drop(other);

        // 同一键超时
        let err = locks.try_lock("file:a", SHORT).await.unwrap_err();
        assert!(matches!(err, ContainerError::StateChange(_)));

        drop(guard);
        assert!(locks.is_empty());

        // 释放后可再次获取
        let _guard = locks.try_lock("file:a", LONG).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_set_handoff() {
        let locks = Arc::new(LockSet::new());
        let guard = locks.try_lock("name", LONG).await.unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2.try_lock("name", LONG).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_state_change_lock_tag() {
        let lock = StateChangeLock::new();
        assert_eq!(lock.current_transition(), None);

        let guard = lock.lock(ModuleEvent::Started, LONG).await.unwrap();
        assert!(lock.in_transition(ModuleEvent::Started));
        assert!(!lock.in_transition(ModuleEvent::Stopped));

        // 已被持有时获取超时
        let err = lock.lock(ModuleEvent::Updated, SHORT).await.unwrap_err();
        assert!(matches!(err, ContainerError::StateChange(_)));

        drop(guard);
        assert_eq!(lock.current_transition(), None);

        let _guard = lock.lock(ModuleEvent::Updated, LONG).await.unwrap();
        assert!(lock.in_transition(ModuleEvent::Updated));
    }
}
