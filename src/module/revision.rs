//! 模块修订版定义
//!
//! 修订版是模块声明的不可变快照：符号名、版本、提供的能力与声明的
//! 需求。更新模块会追加新的修订版并将其提升为当前版；刷新会丢弃
//! 所有非当前修订版。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::metadata::{ActivationPolicy, ModuleId};

/// 连线命名空间常量
pub mod namespace {
    /// 包命名空间：提供/消费代码包
    pub const PACKAGE: &str = "package";
    /// 宿主命名空间：fragment 通过它附着到宿主修订版
    pub const HOST: &str = "host";
}

/// 常用属性与指令键
pub mod directives {
    /// 包命名空间中的包名属性
    pub const ATTR_PACKAGE: &str = "package";
    /// 宿主命名空间中的宿主符号名属性
    pub const ATTR_HOST: &str = "host";
    /// 需求的解析方式指令
    pub const DIR_RESOLUTION: &str = "resolution";
    /// 可选需求：没有提供者时解析仍可成功
    pub const RESOLUTION_OPTIONAL: &str = "optional";
    /// 动态需求：静态解析时忽略，运行期按包名触发
    pub const RESOLUTION_DYNAMIC: &str = "dynamic";
    /// 强制需求（默认）
    pub const RESOLUTION_MANDATORY: &str = "mandatory";
}

/// 修订版标识
///
/// 以 `(模块 id, 序号)` 作为图数据库中的键，避免修订版、连线与
/// 布线之间出现循环引用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionId {
    /// 所属模块标识
    pub module: ModuleId,
    /// 模块内的修订序号（随更新单调递增）
    pub seq: u32,
}

impl RevisionId {
    /// 创建修订版标识
    pub fn new(module: ModuleId, seq: u32) -> Self {
        Self { module, seq }
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.seq)
    }
}

/// 能力：修订版在某个命名空间中提供的带属性声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// 命名空间
    pub namespace: String,
    /// 属性
    pub attributes: HashMap<String, Value>,
    /// 指令
    pub directives: HashMap<String, String>,
    /// 提供该能力的修订版
    pub revision: RevisionId,
}

impl Capability {
    /// 读取字符串属性
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// 需求：修订版在某个命名空间中声明的带属性需要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    /// 命名空间
    pub namespace: String,
    /// 属性（解析时须与能力属性完全相等）
    pub attributes: HashMap<String, Value>,
    /// 指令
    pub directives: HashMap<String, String>,
    /// 声明该需求的修订版
    pub revision: RevisionId,
}

impl Requirement {
    /// 该需求是否可选
    pub fn is_optional(&self) -> bool {
        self.directives.get(directives::DIR_RESOLUTION).map(String::as_str)
            == Some(directives::RESOLUTION_OPTIONAL)
    }

    /// 该需求是否为动态需求
    pub fn is_dynamic(&self) -> bool {
        self.directives.get(directives::DIR_RESOLUTION).map(String::as_str)
            == Some(directives::RESOLUTION_DYNAMIC)
    }

    /// 判断能力是否满足该需求
    ///
    /// 命名空间必须一致，且需求的所有属性在能力中逐项相等。
    pub fn matches(&self, capability: &Capability) -> bool {
        if self.namespace != capability.namespace {
            return false;
        }
        self.attributes
            .iter()
            .all(|(key, value)| capability.attributes.get(key) == Some(value))
    }

    /// 将动态需求投影为针对具体包名的需求
    ///
    /// 仅对包命名空间、`resolution=dynamic` 的需求有效；其 `package`
    /// 属性按精确值或尾部 `*` 通配符与目标包名匹配。匹配成功返回
    /// 一个以具体包名为属性的强制需求。
    pub fn dynamic_package_requirement(&self, package_name: &str) -> Option<Requirement> {
        if self.namespace != namespace::PACKAGE || !self.is_dynamic() {
            return None;
        }
        let pattern = self
            .attributes
            .get(directives::ATTR_PACKAGE)
            .and_then(Value::as_str)?;
        let matched = if pattern == "*" {
            true
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            package_name.starts_with(prefix)
                && package_name.len() > prefix.len()
                && package_name.as_bytes()[prefix.len()] == b'.'
        } else {
            pattern == package_name
        };
        if !matched {
            return None;
        }

        let mut attributes = self.attributes.clone();
        attributes.insert(
            directives::ATTR_PACKAGE.to_string(),
            Value::String(package_name.to_string()),
        );
        let mut dirs = self.directives.clone();
        dirs.insert(
            directives::DIR_RESOLUTION.to_string(),
            directives::RESOLUTION_MANDATORY.to_string(),
        );
        Some(Requirement {
            namespace: self.namespace.clone(),
            attributes,
            directives: dirs,
            revision: self.revision,
        })
    }
}

/// 模块修订版
///
/// 不可变；是否已解析通过数据库的布线表查询，修订版自身不持有
/// 指向布线的引用。
#[derive(Debug)]
pub struct ModuleRevision {
    id: RevisionId,
    symbolic_name: Option<String>,
    version: Version,
    fragment: bool,
    activation_policy: ActivationPolicy,
    capabilities: Vec<Arc<Capability>>,
    requirements: Vec<Arc<Requirement>>,
}

impl ModuleRevision {
    /// 修订版标识
    pub fn id(&self) -> RevisionId {
        self.id
    }

    /// 所属模块标识
    pub fn module_id(&self) -> ModuleId {
        self.id.module
    }

    /// 符号名
    pub fn symbolic_name(&self) -> Option<&str> {
        self.symbolic_name.as_deref()
    }

    /// 版本
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// 是否为 fragment 修订版
    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    /// 激活策略
    pub fn activation_policy(&self) -> ActivationPolicy {
        self.activation_policy
    }

    /// 声明提供的能力
    pub fn capabilities(&self) -> &[Arc<Capability>] {
        &self.capabilities
    }

    /// 指定命名空间下声明提供的能力
    pub fn capabilities_in(&self, ns: &str) -> Vec<Arc<Capability>> {
        self.capabilities
            .iter()
            .filter(|c| c.namespace == ns)
            .cloned()
            .collect()
    }

    /// 声明的需求
    pub fn requirements(&self) -> &[Arc<Requirement>] {
        &self.requirements
    }
}

impl fmt::Display for ModuleRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} [{}]",
            self.symbolic_name.as_deref().unwrap_or("<anonymous>"),
            self.version,
            self.id
        )
    }
}

/// 声明条目（构建器内部使用）
#[derive(Debug, Clone, Default)]
struct DeclarationSpec {
    namespace: String,
    attributes: HashMap<String, Value>,
    directives: HashMap<String, String>,
}

/// 修订版构建器
///
/// 安装与更新操作用它描述新修订版。非 fragment 且带符号名的修订版
/// 会自动提供一个宿主能力，供 fragment 附着。
#[derive(Debug, Clone)]
pub struct RevisionBuilder {
    symbolic_name: Option<String>,
    version: Version,
    fragment: bool,
    activation_policy: ActivationPolicy,
    capabilities: Vec<DeclarationSpec>,
    requirements: Vec<DeclarationSpec>,
}

impl RevisionBuilder {
    /// 创建匿名修订版构建器
    pub fn new() -> Self {
        Self {
            symbolic_name: None,
            version: Version::new(0, 0, 0),
            fragment: false,
            activation_policy: ActivationPolicy::Eager,
            capabilities: Vec::new(),
            requirements: Vec::new(),
        }
    }

    /// 创建带符号名和版本的构建器
    ///
    /// # 示例
    ///
    /// ```rust
    /// use jimu_core::module::RevisionBuilder;
    /// use semver::Version;
    ///
    /// let builder = RevisionBuilder::named("demo.module", Version::new(1, 0, 0))
    ///     .provides_package("demo.api")
    ///     .requires_package("other.api");
    ///
    /// assert_eq!(builder.symbolic_name(), Some("demo.module"));
    /// assert_eq!(builder.version(), &Version::new(1, 0, 0));
    /// ```
    pub fn named(name: impl Into<String>, version: Version) -> Self {
        let mut builder = Self::new();
        builder.symbolic_name = Some(name.into());
        builder.version = version;
        builder
    }

    /// 符号名
    pub fn symbolic_name(&self) -> Option<&str> {
        self.symbolic_name.as_deref()
    }

    /// 版本
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// 标记为 fragment 修订版
    pub fn fragment(mut self) -> Self {
        self.fragment = true;
        self
    }

    /// 设置惰性激活策略
    pub fn lazy_activation(mut self) -> Self {
        self.activation_policy = ActivationPolicy::Lazy;
        self
    }

    /// 添加任意能力声明
    pub fn capability(
        mut self,
        ns: impl Into<String>,
        attributes: HashMap<String, Value>,
        directives: HashMap<String, String>,
    ) -> Self {
        self.capabilities.push(DeclarationSpec {
            namespace: ns.into(),
            attributes,
            directives,
        });
        self
    }

    /// 添加任意需求声明
    pub fn requirement(
        mut self,
        ns: impl Into<String>,
        attributes: HashMap<String, Value>,
        directives: HashMap<String, String>,
    ) -> Self {
        self.requirements.push(DeclarationSpec {
            namespace: ns.into(),
            attributes,
            directives,
        });
        self
    }

    /// 提供一个包
    pub fn provides_package(self, package: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(
            directives::ATTR_PACKAGE.to_string(),
            Value::String(package.into()),
        );
        self.capability(namespace::PACKAGE, attributes, HashMap::new())
    }

    /// 需要一个包（强制）
    pub fn requires_package(self, package: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(
            directives::ATTR_PACKAGE.to_string(),
            Value::String(package.into()),
        );
        self.requirement(namespace::PACKAGE, attributes, HashMap::new())
    }

    /// 需要一个包（可选）
    pub fn requires_package_optional(self, package: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(
            directives::ATTR_PACKAGE.to_string(),
            Value::String(package.into()),
        );
        let mut dirs = HashMap::new();
        dirs.insert(
            directives::DIR_RESOLUTION.to_string(),
            directives::RESOLUTION_OPTIONAL.to_string(),
        );
        self.requirement(namespace::PACKAGE, attributes, dirs)
    }

    /// 声明动态包需求（包名可带尾部 `*` 通配符）
    pub fn dynamic_package(self, pattern: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(
            directives::ATTR_PACKAGE.to_string(),
            Value::String(pattern.into()),
        );
        let mut dirs = HashMap::new();
        dirs.insert(
            directives::DIR_RESOLUTION.to_string(),
            directives::RESOLUTION_DYNAMIC.to_string(),
        );
        self.requirement(namespace::PACKAGE, attributes, dirs)
    }

    /// 声明宿主需求（fragment 附着目标）
    pub fn fragment_host(self, host: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(
            directives::ATTR_HOST.to_string(),
            Value::String(host.into()),
        );
        self.fragment().requirement(namespace::HOST, attributes, HashMap::new())
    }

    /// 按分配好的标识构建修订版
    pub(crate) fn build(&self, id: RevisionId) -> Arc<ModuleRevision> {
        let mut capabilities: Vec<Arc<Capability>> = self
            .capabilities
            .iter()
            .map(|spec| {
                Arc::new(Capability {
                    namespace: spec.namespace.clone(),
                    attributes: spec.attributes.clone(),
                    directives: spec.directives.clone(),
                    revision: id,
                })
            })
            .collect();

        // 非 fragment 的命名修订版自动成为可附着宿主
        if !self.fragment {
            if let Some(name) = &self.symbolic_name {
                let mut attributes = HashMap::new();
                attributes.insert(
                    directives::ATTR_HOST.to_string(),
                    Value::String(name.clone()),
                );
                capabilities.push(Arc::new(Capability {
                    namespace: namespace::HOST.to_string(),
                    attributes,
                    directives: HashMap::new(),
                    revision: id,
                }));
            }
        }

        let requirements = self
            .requirements
            .iter()
            .map(|spec| {
                Arc::new(Requirement {
                    namespace: spec.namespace.clone(),
                    attributes: spec.attributes.clone(),
                    directives: spec.directives.clone(),
                    revision: id,
                })
            })
            .collect();

        Arc::new(ModuleRevision {
            id,
            symbolic_name: self.symbolic_name.clone(),
            version: self.version.clone(),
            fragment: self.fragment,
            activation_policy: self.activation_policy,
            capabilities,
            requirements,
        })
    }
}

impl Default for RevisionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
