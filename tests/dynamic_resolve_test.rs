//! # 动态解析集成测试
//!
//! 覆盖动态包需求的投影、尾部连线的一致性约束与失败路径。

mod common;

use common::{boot, builder, setup};
use jimu_core::module::{directives, namespace, State};

/// 动态需求按通配符投影并在尾部新增一条包连线
#[tokio::test]
async fn test_resolve_dynamic_package() {
    let ctx = setup();
    boot(&ctx).await;

    let a = ctx
        .container
        .install(None, "file:a", &builder("a").dynamic_package("com.dyn.*"))
        .await
        .unwrap();
    let b = ctx
        .container
        .install(None, "file:b", &builder("b").provides_package("com.dyn.impl"))
        .await
        .unwrap();
    ctx.container
        .resolve(Some(&[a.clone(), b.clone()]), true)
        .await
        .unwrap();

    let revision_a = a.current_revision().unwrap();
    // 动态需求不参与静态解析
    {
        let db = ctx.container.database().read().await;
        let wiring = db.wiring(revision_a.id()).unwrap();
        assert!(wiring.required_wires(None).is_empty());
    }

    let wire = ctx
        .container
        .resolve_dynamic("com.dyn.impl", &revision_a)
        .await
        .unwrap()
        .expect("动态解析应当成功");

    // 约束：尾部连线在包命名空间且包属性等于请求的包名
    assert_eq!(wire.namespace(), namespace::PACKAGE);
    assert_eq!(
        wire.capability().attribute_str(directives::ATTR_PACKAGE),
        Some("com.dyn.impl")
    );
    assert_eq!(wire.provider().id(), b.current_revision().unwrap().id());

    // 副作用落在需求方布线的尾部
    let db = ctx.container.database().read().await;
    let wiring = db.wiring(revision_a.id()).unwrap();
    let required = wiring.required_wires(None);
    assert_eq!(required.len(), 1);
    assert!(std::sync::Arc::ptr_eq(&required[0], &wire));
    // 提供方布线同步获得被消费连线
    let provider_wiring = db.wiring(b.current_revision().unwrap().id()).unwrap();
    assert!(provider_wiring
        .provided_wires(Some(namespace::PACKAGE))
        .iter()
        .any(|w| std::sync::Arc::ptr_eq(w, &wire)));
}

/// 无动态需求、无提供者、未解析或 fragment：返回 None
#[tokio::test]
async fn test_resolve_dynamic_misses() {
    let ctx = setup();
    boot(&ctx).await;

    let a = ctx
        .container
        .install(None, "file:a", &builder("a").dynamic_package("com.dyn.*"))
        .await
        .unwrap();
    ctx.container.resolve(Some(&[a.clone()]), true).await.unwrap();
    let revision_a = a.current_revision().unwrap();

    // 模式不匹配
    assert!(ctx
        .container
        .resolve_dynamic("org.other.pkg", &revision_a)
        .await
        .unwrap()
        .is_none());

    // 匹配但没有提供者；第二次命中失败缓存走快速路径
    assert!(ctx
        .container
        .resolve_dynamic("com.dyn.missing", &revision_a)
        .await
        .unwrap()
        .is_none());
    assert!(ctx
        .container
        .resolve_dynamic("com.dyn.missing", &revision_a)
        .await
        .unwrap()
        .is_none());

    // 新提供者安装并解析后，时间戳推进使缓存失效
    let b = ctx
        .container
        .install(None, "file:b", &builder("b").provides_package("com.dyn.missing"))
        .await
        .unwrap();
    ctx.container.resolve(Some(&[b.clone()]), true).await.unwrap();
    assert!(ctx
        .container
        .resolve_dynamic("com.dyn.missing", &revision_a)
        .await
        .unwrap()
        .is_some());

    // 未解析的修订版直接返回 None
    let c = ctx
        .container
        .install(None, "file:c", &builder("c").dynamic_package("*"))
        .await
        .unwrap();
    let revision_c = c.current_revision().unwrap();
    assert_eq!(c.state(), State::Installed);
    assert!(ctx
        .container
        .resolve_dynamic("com.dyn.impl", &revision_c)
        .await
        .unwrap()
        .is_none());

    // fragment 修订版直接返回 None
    let f = ctx
        .container
        .install(None, "file:f", &builder("a.ext").fragment_host("a"))
        .await
        .unwrap();
    ctx.container.resolve(Some(&[f.clone()]), true).await.unwrap();
    let revision_f = f.current_revision().unwrap();
    assert!(ctx
        .container
        .resolve_dynamic("com.dyn.impl", &revision_f)
        .await
        .unwrap()
        .is_none());
}
