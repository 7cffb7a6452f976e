//! # 起始级别集成测试
//!
//! 覆盖框架起始级别的单位步长爬升/回落、惰性优先的两轮启动、
//! 单模块起始级别变更作业与参数校验。

mod common;

use common::{boot, builder, setup, wait_until, TestListener};
use jimu_core::module::{ContainerEvent, StartOptions, State};
use jimu_core::{ContainerError, PROP_BEGINNING_START_LEVEL};

/// 场景：起始级别 {1,1,2,3,5}，框架爬升到 3
#[tokio::test]
async fn test_framework_start_level_ramp() {
    let ctx = setup();
    let system = ctx
        .container
        .install(None, "System Module", &builder("system.module"))
        .await
        .unwrap();
    ctx.container.open().await.unwrap();

    // 惰性激活模块与急切模块各一个在级别 1
    let m1 = ctx
        .container
        .install(None, "file:m1", &builder("m1").lazy_activation())
        .await
        .unwrap();
    let m2 = ctx.container.install(None, "file:m2", &builder("m2")).await.unwrap();
    let m3 = ctx.container.install(None, "file:m3", &builder("m3")).await.unwrap();
    let m4 = ctx.container.install(None, "file:m4", &builder("m4")).await.unwrap();
    let m5 = ctx.container.install(None, "file:m5", &builder("m5")).await.unwrap();
    {
        let mut db = ctx.container.database().write().await;
        db.set_start_level(&m3, 2);
        db.set_start_level(&m4, 3);
        db.set_start_level(&m5, 5);
    }

    // 框架未激活（级别 0）：持久启动只记录自动启动标志
    for module in [&m1, &m2, &m3, &m4, &m5] {
        ctx.container
            .start(module, StartOptions::persistent())
            .await
            .unwrap();
        assert!(module.is_persistently_started());
        assert_eq!(module.state(), State::Installed);
    }

    // 未激活时不允许设置框架起始级别
    let err = ctx.container.set_start_level(3, vec![]).unwrap_err();
    assert!(matches!(err, ContainerError::InvalidOperation(_)));

    // 启动系统模块：爬升到起始配置级别 1
    ctx.container
        .start(&system, StartOptions::persistent())
        .await
        .unwrap();
    assert_eq!(ctx.container.active_start_level(), 1);
    // 惰性模块只进入 Starting，急切模块完成激活；
    // 更高级别的模块已随解析就绪但保持不活动
    assert_eq!(m1.state(), State::Starting);
    assert_eq!(m2.state(), State::Active);
    assert_eq!(m3.state(), State::Resolved);
    assert_eq!(ctx.adaptor.container_event_count(ContainerEvent::StartLevel), 1);

    // 爬升到 3
    let listener = TestListener::new();
    ctx.container.set_start_level(3, vec![listener.clone()]).unwrap();
    wait_until("框架爬升到 3", || ctx.container.active_start_level() == 3).await;
    wait_until("级别 3 的模块已激活", || m4.state() == State::Active).await;

    assert_eq!(m3.state(), State::Active);
    assert_eq!(m4.state(), State::Active);
    // 级别 5 的模块保持不活动
    assert_eq!(m5.state(), State::Resolved);
    assert_eq!(listener.count(ContainerEvent::StartLevel), 1);

    // 回落到 1：级别高于 1 的活动模块被瞬态停止
    ctx.container.set_start_level(1, vec![]).unwrap();
    wait_until("框架回落到 1", || ctx.container.active_start_level() == 1).await;
    wait_until("级别 2/3 的模块已停止", || {
        m3.state() == State::Resolved && m4.state() == State::Resolved
    })
    .await;
    assert_eq!(m2.state(), State::Active);
    // 瞬态停止保留自动启动标志，再次爬升可恢复
    assert!(m4.is_persistently_started());
}

/// 单模块起始级别变更：级别不再满足时停止，重新满足时自动启动
#[tokio::test]
async fn test_module_start_level_change() {
    let ctx = setup();
    boot(&ctx).await;
    let x = ctx.container.install(None, "file:x", &builder("x")).await.unwrap();
    ctx.container.start(&x, StartOptions::persistent()).await.unwrap();
    assert_eq!(x.state(), State::Active);

    // 提升到活动级别之上 → 后台停止
    ctx.container.set_module_start_level(&x, 3).await.unwrap();
    assert_eq!(x.start_level(), 3);
    wait_until("模块因级别不满足而停止", || x.state() == State::Resolved).await;

    // 回到活动级别之内 → 凭自动启动标志恢复
    ctx.container.set_module_start_level(&x, 1).await.unwrap();
    wait_until("模块恢复启动", || x.state() == State::Active).await;
}

/// 参数校验：系统模块、非法级别
#[tokio::test]
async fn test_start_level_validation() {
    let ctx = setup();
    let system = boot(&ctx).await;
    let x = ctx.container.install(None, "file:x", &builder("x")).await.unwrap();

    let err = ctx
        .container
        .set_module_start_level(&system, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::InvalidOperation(_)));

    let err = ctx.container.set_module_start_level(&x, 0).await.unwrap_err();
    assert!(matches!(err, ContainerError::InvalidOperation(_)));

    let err = ctx.container.set_start_level(0, vec![]).unwrap_err();
    assert!(matches!(err, ContainerError::InvalidOperation(_)));

    let err = ctx.container.set_initial_module_start_level(0).await.unwrap_err();
    assert!(matches!(err, ContainerError::InvalidOperation(_)));
}

/// 起始配置级别从适配器属性读取
#[tokio::test]
async fn test_beginning_start_level_property() {
    let ctx = setup();
    ctx.adaptor.set_property(PROP_BEGINNING_START_LEVEL, "2");

    let system = ctx
        .container
        .install(None, "System Module", &builder("system.module"))
        .await
        .unwrap();
    ctx.container.open().await.unwrap();

    let a = ctx.container.install(None, "file:a", &builder("a")).await.unwrap();
    {
        let mut db = ctx.container.database().write().await;
        db.set_start_level(&a, 2);
    }
    ctx.container.start(&a, StartOptions::persistent()).await.unwrap();
    assert_eq!(a.state(), State::Installed);

    ctx.container
        .start(&system, StartOptions::persistent())
        .await
        .unwrap();
    assert_eq!(ctx.container.active_start_level(), 2);
    assert_eq!(a.state(), State::Active);
}

/// 新安装模块继承缺省起始级别
#[tokio::test]
async fn test_initial_module_start_level() {
    let ctx = setup();
    boot(&ctx).await;

    assert_eq!(ctx.container.initial_module_start_level().await, 1);
    ctx.container.set_initial_module_start_level(4).await.unwrap();

    let a = ctx.container.install(None, "file:a", &builder("a")).await.unwrap();
    assert_eq!(a.start_level(), 4);

    // 级别高于活动级别：瞬态启动失败，持久启动只记录
    let err = ctx
        .container
        .start(&a, StartOptions::transient())
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::StartLevelNotMet { .. }));
    ctx.container.start(&a, StartOptions::persistent()).await.unwrap();
    assert_eq!(a.state(), State::Installed);
    assert!(a.is_persistently_started());
}
