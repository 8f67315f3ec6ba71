//! Client-side namespace built from the server's procedure catalog
//!
//! The server describes every remote procedure as a
//! `[qualified_name, doc, arg_spec]` triple. [`NamespaceBuilder`] turns that
//! catalog into a tree of [`Namespace`] nodes mirroring the dotted names:
//!
//! ```text
//! stage.get_x, stage.set_x, stage.move_to, camera.acquire
//!
//! root
//! ├── stage   x (property), get_x(), set_x(), move_to()
//! └── camera  acquire()
//! ```
//!
//! A `get_X`/`set_X` pair becomes the property `X`. Once built, the tree is
//! write-protected: [`Namespace::set`] only accepts properties with a setter
//! and rejects everything else locally, before any request is sent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{AppResult, ScopeError};
use crate::rpc::client::SharedClient;
use crate::rpc::wire::{Kwargs, Reply};

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parameter description of a remote procedure.
///
/// `defaults` and `kwonlydefaults` map parameter names to default values.
/// Missing or `null` fields read as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    /// Positional parameter names.
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,
    /// Name of the `*args` parameter.
    #[serde(default)]
    pub varargs: Option<String>,
    /// Name of the `**kwargs` parameter.
    #[serde(default)]
    pub varkw: Option<String>,
    /// Defaults of positional parameters.
    #[serde(default, deserialize_with = "null_as_default")]
    pub defaults: Map<String, Value>,
    /// Keyword-only parameter names.
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwonlyargs: Vec<String>,
    /// Defaults of keyword-only parameters.
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwonlydefaults: Map<String, Value>,
}

impl ArgSpec {
    /// Check a call against the parameter list.
    ///
    /// Defaults are left for the server to fill in; this only rejects calls
    /// the server would reject anyway.
    pub fn check(&self, name: &str, args: &[Value], kwargs: &Kwargs) -> AppResult<()> {
        if args.len() > self.args.len() && self.varargs.is_none() {
            return Err(ScopeError::InvalidArguments(format!(
                "{name}() takes {} positional arguments but {} were given",
                self.args.len(),
                args.len()
            )));
        }

        let filled = args.len().min(self.args.len());
        for key in kwargs.keys() {
            if self.args[..filled].contains(key) {
                return Err(ScopeError::InvalidArguments(format!(
                    "{name}() got multiple values for argument '{key}'"
                )));
            }
            let known = self.args.contains(key) || self.kwonlyargs.contains(key);
            if !known && self.varkw.is_none() {
                return Err(ScopeError::InvalidArguments(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                )));
            }
        }

        let missing: Vec<&str> = self.args[filled..]
            .iter()
            .filter(|a| !kwargs.contains_key(*a) && !self.defaults.contains_key(*a))
            .chain(
                self.kwonlyargs
                    .iter()
                    .filter(|a| !kwargs.contains_key(*a) && !self.kwonlydefaults.contains_key(*a)),
            )
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ScopeError::InvalidArguments(format!(
                "{name}() missing required arguments: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Render as a parameter list, e.g. `x, y=1, *rest, fast=false, **opts`.
    pub fn render(&self) -> String {
        fn param(name: &str, default: Option<&Value>) -> String {
            match default {
                Some(v) => format!("{name}={v}"),
                None => name.to_string(),
            }
        }

        let mut parts: Vec<String> = self
            .args
            .iter()
            .map(|a| param(a, self.defaults.get(a)))
            .collect();
        if let Some(varargs) = &self.varargs {
            parts.push(format!("*{varargs}"));
        } else if !self.kwonlyargs.is_empty() {
            parts.push("*".into());
        }
        parts.extend(
            self.kwonlyargs
                .iter()
                .map(|a| param(a, self.kwonlydefaults.get(a))),
        );
        if let Some(varkw) = &self.varkw {
            parts.push(format!("**{varkw}"));
        }
        parts.join(", ")
    }
}

/// One entry of the server's catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureDescriptor {
    /// Dotted name, e.g. `stage.move_to`.
    pub qualified_name: String,
    /// Docstring, if the server has one.
    pub doc: Option<String>,
    /// Parameter description.
    pub arg_spec: ArgSpec,
}

impl ProcedureDescriptor {
    /// Descriptor from its parts.
    pub fn new(qualified_name: impl Into<String>, doc: Option<&str>, arg_spec: ArgSpec) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            doc: doc.map(str::to_string),
            arg_spec,
        }
    }

    /// Parse the reply of the describe command: a list of
    /// `[qualified_name, doc, arg_spec]` triples.
    pub fn parse_catalog(catalog: Value) -> AppResult<Vec<Self>> {
        let entries: Vec<(String, Option<String>, Option<ArgSpec>)> = serde_json::from_value(catalog)
            .map_err(|e| ScopeError::Protocol(format!("malformed procedure catalog: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|(qualified_name, doc, arg_spec)| Self {
                qualified_name,
                doc,
                arg_spec: arg_spec.unwrap_or_default(),
            })
            .collect())
    }

    /// Split `a.b.c` into (`["a", "b"]`, `"c"`).
    fn split(&self) -> (Vec<String>, String) {
        let mut segments: Vec<String> = self.qualified_name.split('.').map(str::to_string).collect();
        let name = segments.pop().unwrap_or_default();
        (segments, name)
    }
}

/// Client-side post-processing of a procedure's reply.
pub type ReplyWrapper = Arc<dyn Fn(Reply) -> AppResult<Reply> + Send + Sync>;

/// Callable bound to one remote procedure.
#[derive(Clone)]
pub struct ProxyFunction {
    client: SharedClient,
    qualified_name: String,
    doc: Option<String>,
    arg_spec: Option<ArgSpec>,
    wrapper: Option<ReplyWrapper>,
}

impl ProxyFunction {
    /// Proxy without a parameter list; every call is forwarded as is.
    pub fn permissive(client: SharedClient, qualified_name: impl Into<String>) -> Self {
        Self {
            client,
            qualified_name: qualified_name.into(),
            doc: None,
            arg_spec: None,
            wrapper: None,
        }
    }

    fn described(client: SharedClient, descriptor: ProcedureDescriptor, wrapper: Option<ReplyWrapper>) -> Self {
        Self {
            client,
            qualified_name: descriptor.qualified_name,
            doc: descriptor.doc,
            arg_spec: Some(descriptor.arg_spec),
            wrapper,
        }
    }

    /// Dotted name of the remote procedure.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Last segment of the qualified name.
    pub fn name(&self) -> &str {
        self.qualified_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.qualified_name)
    }

    /// Remote docstring.
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// Parameter description; `None` for permissive proxies.
    pub fn arg_spec(&self) -> Option<&ArgSpec> {
        self.arg_spec.as_ref()
    }

    /// Remote signature, e.g. `move_to(x, y, z=null)`.
    pub fn signature(&self) -> String {
        match &self.arg_spec {
            Some(spec) => format!("{}({})", self.name(), spec.render()),
            None => format!("{}(*args, **kwargs)", self.name()),
        }
    }

    /// Check the arguments against the signature, then invoke the procedure.
    pub async fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> AppResult<Reply> {
        if let Some(spec) = &self.arg_spec {
            spec.check(self.name(), &args, &kwargs)?;
        }
        let reply = self
            .client
            .lock()
            .await
            .call(&self.qualified_name, &args, &kwargs)
            .await?;
        match &self.wrapper {
            Some(wrap) => wrap(reply),
            None => Ok(reply),
        }
    }
}

impl fmt::Debug for ProxyFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyFunction")
            .field("qualified_name", &self.qualified_name)
            .field("wrapped", &self.wrapper.is_some())
            .finish()
    }
}

/// A property formed from a `get_X` / `set_X` pair; either half may be absent.
#[derive(Debug, Clone, Default)]
pub struct Property {
    getter: Option<ProxyFunction>,
    setter: Option<ProxyFunction>,
}

impl Property {
    /// Has a getter.
    pub fn is_readable(&self) -> bool {
        self.getter.is_some()
    }

    /// Has a setter.
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    /// Doc of the getter, else the setter.
    pub fn doc(&self) -> Option<&str> {
        self.getter
            .as_ref()
            .and_then(ProxyFunction::doc)
            .or_else(|| self.setter.as_ref().and_then(ProxyFunction::doc))
    }
}

/// One node of the client-side namespace tree.
#[derive(Debug, Clone)]
pub struct Namespace {
    path: String,
    functions: BTreeMap<String, ProxyFunction>,
    properties: BTreeMap<String, Property>,
    children: BTreeMap<String, Namespace>,
    functions_proxied: Arc<BTreeSet<String>>,
}

impl Namespace {
    fn empty(path: String, functions_proxied: Arc<BTreeSet<String>>) -> Self {
        Self {
            path,
            functions: BTreeMap::new(),
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
            functions_proxied,
        }
    }

    /// Dotted path of this node; empty for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Qualified names of every procedure in the catalog this tree was built from.
    pub fn functions_proxied(&self) -> &BTreeSet<String> {
        &self.functions_proxied
    }

    /// Direct child namespace `name`.
    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.children.get(name)
    }

    /// Follow a dotted path of child namespaces; `""` is this node.
    pub fn resolve(&self, dotted: &str) -> Option<&Namespace> {
        if dotted.is_empty() {
            return Some(self);
        }
        dotted
            .split('.')
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    /// Function `name` in this namespace.
    pub fn function(&self, name: &str) -> Option<&ProxyFunction> {
        self.functions.get(name)
    }

    /// Property `name` in this namespace.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Functions in this namespace, sorted.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Properties in this namespace, sorted.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Child namespaces, sorted.
    pub fn namespace_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    fn split_member<'a>(&self, dotted: &'a str) -> (Option<&Namespace>, &'a str) {
        match dotted.rsplit_once('.') {
            Some((parent, member)) => (self.resolve(parent), member),
            None => (Some(self), dotted),
        }
    }

    /// Call the procedure at `dotted` relative to this node.
    pub async fn call(&self, dotted: &str, args: Vec<Value>, kwargs: Kwargs) -> AppResult<Reply> {
        let (parent, member) = self.split_member(dotted);
        let function = parent
            .and_then(|ns| ns.functions.get(member))
            .ok_or_else(|| ScopeError::UnknownAttribute(dotted.to_string()))?;
        function.call(args, kwargs).await
    }

    /// Read the property at `dotted`.
    pub async fn get(&self, dotted: &str) -> AppResult<Value> {
        let (parent, member) = self.split_member(dotted);
        let property = parent
            .and_then(|ns| ns.properties.get(member))
            .ok_or_else(|| ScopeError::UnknownAttribute(dotted.to_string()))?;
        let getter = property
            .getter
            .as_ref()
            .ok_or_else(|| ScopeError::NotReadable(dotted.to_string()))?;
        getter.call(Vec::new(), Kwargs::new()).await?.into_value()
    }

    /// Write the property at `dotted`.
    ///
    /// Anything that is not a property with a setter is rejected without
    /// contacting the server.
    pub async fn set(&self, dotted: &str, value: Value) -> AppResult<()> {
        let setter = self.setter_for(dotted)?;
        setter.call(vec![value], Kwargs::new()).await?;
        Ok(())
    }

    fn setter_for(&self, dotted: &str) -> AppResult<&ProxyFunction> {
        let protected = |reason: &str| ScopeError::WriteProtected {
            name: dotted.to_string(),
            reason: reason.to_string(),
        };
        let (parent, member) = self.split_member(dotted);
        let parent = parent.ok_or_else(|| {
            protected("is not known, so its state cannot be communicated to the server")
        })?;

        if let Some(property) = parent.properties.get(member) {
            return property
                .setter
                .as_ref()
                .ok_or_else(|| protected("is a read-only property"));
        }
        if parent.functions.contains_key(member) || parent.children.contains_key(member) {
            return Err(protected(
                "is not a property value that can be communicated to the server",
            ));
        }
        Err(protected(
            "is not known, so its state cannot be communicated to the server",
        ))
    }

    /// Indented listing of the tree with signatures, for display.
    pub fn describe_tree(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0);
        out
    }

    fn write_tree(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        for (name, property) in &self.properties {
            let access = match (property.is_readable(), property.is_writable()) {
                (true, true) => "rw",
                (true, false) => "r",
                _ => "w",
            };
            let _ = writeln!(out, "{indent}{name} [{access}]");
        }
        for function in self.functions.values() {
            let _ = writeln!(out, "{indent}{}", function.signature());
        }
        for (name, child) in &self.children {
            let _ = writeln!(out, "{indent}{name}/");
            child.write_tree(out, depth + 1);
        }
    }
}

/// Builds a [`Namespace`] tree from catalog entries.
pub struct NamespaceBuilder {
    client: SharedClient,
    wrappers: HashMap<String, ReplyWrapper>,
}

impl NamespaceBuilder {
    /// Builder for proxies calling through `client`.
    pub fn new(client: SharedClient) -> Self {
        Self {
            client,
            wrappers: HashMap::new(),
        }
    }

    /// Post-process replies of `qualified_name` with `wrapper`.
    pub fn wrap<F>(mut self, qualified_name: impl Into<String>, wrapper: F) -> Self
    where
        F: Fn(Reply) -> AppResult<Reply> + Send + Sync + 'static,
    {
        self.wrappers.insert(qualified_name.into(), Arc::new(wrapper));
        self
    }

    /// Build the namespace tree; duplicate or malformed names are rejected.
    pub fn build(mut self, descriptors: Vec<ProcedureDescriptor>) -> AppResult<Namespace> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if descriptor.qualified_name.split('.').any(str::is_empty) {
                return Err(ScopeError::Configuration(format!(
                    "invalid procedure name {:?}",
                    descriptor.qualified_name
                )));
            }
            if !seen.insert(descriptor.qualified_name.as_str()) {
                return Err(ScopeError::Configuration(format!(
                    "procedure {} described more than once",
                    descriptor.qualified_name
                )));
            }
        }
        let functions_proxied: Arc<BTreeSet<String>> =
            Arc::new(descriptors.iter().map(|d| d.qualified_name.clone()).collect());

        // group by parent path, making sure every prefix has a node
        let mut groups: BTreeMap<Vec<String>, Vec<(String, ProcedureDescriptor)>> = BTreeMap::new();
        groups.entry(Vec::new()).or_default();
        for descriptor in descriptors {
            let (parents, name) = descriptor.split();
            for depth in 1..parents.len() {
                groups.entry(parents[..depth].to_vec()).or_default();
            }
            groups.entry(parents).or_default().push((name, descriptor));
        }

        let mut nodes = BTreeMap::new();
        for (parents, members) in groups {
            let node = self.build_node(parents.join("."), members, functions_proxied.clone());
            nodes.insert(parents, node);
        }
        if !self.wrappers.is_empty() {
            debug!(
                "Wrappers for unknown procedures ignored: {:?}",
                self.wrappers.keys().collect::<Vec<_>>()
            );
        }

        // lexicographic order puts every prefix before its extensions
        let mut nodes = nodes.into_iter();
        let mut root = match nodes.next() {
            Some((path, node)) if path.is_empty() => node,
            _ => Namespace::empty(String::new(), functions_proxied),
        };
        for (path, node) in nodes {
            let Some((last, parents)) = path.split_last() else {
                continue;
            };
            let mut parent = &mut root;
            for segment in parents {
                parent = match parent.children.get_mut(segment) {
                    Some(child) => child,
                    None => {
                        return Err(ScopeError::Configuration(format!(
                            "namespace {} attached before its parent",
                            path.join(".")
                        )))
                    }
                };
            }
            parent.children.insert(last.clone(), node);
        }
        Ok(root)
    }

    fn build_node(
        &mut self,
        path: String,
        members: Vec<(String, ProcedureDescriptor)>,
        functions_proxied: Arc<BTreeSet<String>>,
    ) -> Namespace {
        let mut node = Namespace::empty(path, functions_proxied);
        for (name, descriptor) in members {
            let wrapper = self.wrappers.remove(&descriptor.qualified_name);
            let function = ProxyFunction::described(self.client.clone(), descriptor, wrapper);
            if let Some(property) = name.strip_prefix("get_") {
                node.properties.entry(property.to_string()).or_default().getter = Some(function.clone());
            } else if let Some(property) = name.strip_prefix("set_") {
                node.properties.entry(property.to_string()).or_default().setter = Some(function.clone());
            }
            node.functions.insert(name, function);
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::rpc::client::RpcClient;
    use crate::rpc::mock::{MockResponse, MockServer};
    use parking_lot::Mutex;
    use serde_json::json;

    fn spec(args: &[&str]) -> ArgSpec {
        ArgSpec {
            args: args.iter().map(|a| a.to_string()).collect(),
            ..ArgSpec::default()
        }
    }

    /// Server with `a.b.get_x`/`a.b.set_x` backed by one stored value.
    fn stage_server() -> MockServer {
        let x = Mutex::new(json!(0));
        MockServer::new(move |command, args, _| match command {
            "a.b.get_x" => MockResponse::Value(x.lock().clone()),
            "a.b.set_x" => {
                *x.lock() = args.first().cloned().unwrap_or(Value::Null);
                MockResponse::Value(Value::Null)
            }
            "a.b.c.d.home" => MockResponse::Value(json!("homed")),
            "snap" => MockResponse::Value(json!([1, 2, 3])),
            _ => MockResponse::Error(json!(format!("no such procedure {command}"))),
        })
    }

    async fn shared(server: &MockServer) -> SharedClient {
        RpcClient::connect(Arc::new(server.connector()), "mock", &ClientConfig::default())
            .await
            .unwrap()
            .into_shared()
    }

    fn catalog() -> Vec<ProcedureDescriptor> {
        vec![
            ProcedureDescriptor::new("a.b.get_x", Some("Stage x position."), ArgSpec::default()),
            ProcedureDescriptor::new("a.b.set_x", Some("Move stage x."), spec(&["value"])),
            ProcedureDescriptor::new("a.b.c.d.home", None, ArgSpec::default()),
            ProcedureDescriptor::new("snap", None, ArgSpec::default()),
        ]
    }

    #[tokio::test]
    async fn test_get_set_pair_becomes_property() {
        let server = stage_server();
        let root = NamespaceBuilder::new(shared(&server).await)
            .build(catalog())
            .unwrap();

        root.set("a.b.x", json!(12)).await.unwrap();
        assert_eq!(root.get("a.b.x").await.unwrap(), json!(12));

        let b = root.resolve("a.b").unwrap();
        assert_eq!(b.path(), "a.b");
        assert_eq!(b.property("x").unwrap().doc(), Some("Stage x position."));
        assert_eq!(b.property_names().collect::<Vec<_>>(), vec!["x"]);
        // accessors stay callable under their own names
        assert_eq!(b.function_names().collect::<Vec<_>>(), vec!["get_x", "set_x"]);
    }

    #[tokio::test]
    async fn test_unknown_attribute_is_write_protected_without_io() {
        let server = stage_server();
        let root = NamespaceBuilder::new(shared(&server).await)
            .build(catalog())
            .unwrap();

        let err = root.set("a.b.y", json!(5)).await.unwrap_err();
        assert!(matches!(err, ScopeError::WriteProtected { ref name, .. } if name == "a.b.y"));
        // functions and namespaces are not assignable either
        assert!(matches!(
            root.set("snap", json!(1)).await,
            Err(ScopeError::WriteProtected { .. })
        ));
        assert!(matches!(
            root.set("a.b", json!(1)).await,
            Err(ScopeError::WriteProtected { .. })
        ));
        assert!(matches!(
            root.set("nowhere.x", json!(1)).await,
            Err(ScopeError::WriteProtected { .. })
        ));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_intermediate_namespaces_exist() {
        let server = stage_server();
        let root = NamespaceBuilder::new(shared(&server).await)
            .build(catalog())
            .unwrap();

        let c = root.resolve("a.b.c").unwrap();
        assert_eq!(c.function_names().count(), 0);
        assert_eq!(c.namespace_names().collect::<Vec<_>>(), vec!["d"]);
        let reply = root.call("a.b.c.d.home", vec![], Kwargs::new()).await.unwrap();
        assert_eq!(reply, Reply::Value(json!("homed")));
        assert_eq!(root.namespace_names().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_tree_independent_of_catalog_order() {
        let server = stage_server();
        let client = shared(&server).await;
        let mut reversed = catalog();
        reversed.reverse();

        let forward = NamespaceBuilder::new(client.clone()).build(catalog()).unwrap();
        let backward = NamespaceBuilder::new(client).build(reversed).unwrap();
        assert_eq!(forward.describe_tree(), backward.describe_tree());
        assert_eq!(forward.functions_proxied().len(), 4);
        assert!(backward.functions_proxied().contains("a.b.c.d.home"));
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let server = stage_server();
        let mut descriptors = catalog();
        descriptors.push(ProcedureDescriptor::new("snap", None, ArgSpec::default()));
        let result = NamespaceBuilder::new(shared(&server).await).build(descriptors);
        assert!(matches!(result, Err(ScopeError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_read_only_and_write_only_properties() {
        let server = stage_server();
        let descriptors = vec![
            ProcedureDescriptor::new("lamp.get_temperature", None, ArgSpec::default()),
            ProcedureDescriptor::new("lamp.set_shutter", None, spec(&["open"])),
        ];
        let root = NamespaceBuilder::new(shared(&server).await)
            .build(descriptors)
            .unwrap();

        assert!(matches!(
            root.set("lamp.temperature", json!(20)).await,
            Err(ScopeError::WriteProtected { .. })
        ));
        assert!(matches!(
            root.get("lamp.shutter").await,
            Err(ScopeError::NotReadable(_))
        ));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_wrapper_post_processes_reply() {
        let server = stage_server();
        let root = NamespaceBuilder::new(shared(&server).await)
            .wrap("snap", |reply| {
                let total: i64 = reply
                    .into_value()?
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(Reply::Value(json!(total)))
            })
            .build(catalog())
            .unwrap();

        let reply = root.call("snap", vec![], Kwargs::new()).await.unwrap();
        assert_eq!(reply, Reply::Value(json!(6)));
    }

    #[tokio::test]
    async fn test_bad_arguments_rejected_locally() {
        let server = stage_server();
        let root = NamespaceBuilder::new(shared(&server).await)
            .build(catalog())
            .unwrap();

        let too_many = root.call("snap", vec![json!(1)], Kwargs::new()).await;
        assert!(matches!(too_many, Err(ScopeError::InvalidArguments(_))));
        let missing = root.call("a.b.set_x", vec![], Kwargs::new()).await;
        assert!(matches!(missing, Err(ScopeError::InvalidArguments(_))));
        assert!(server.requests().is_empty());
    }

    #[test]
    fn test_arg_spec_check() {
        let mut spec = spec(&["x", "y"]);
        spec.defaults.insert("y".into(), json!(1));
        spec.kwonlyargs = vec!["fast".into()];
        spec.kwonlydefaults.insert("fast".into(), json!(false));

        let mut kwargs = Kwargs::new();
        assert!(spec.check("move", &[json!(0)], &kwargs).is_ok());
        assert!(spec.check("move", &[], &kwargs).is_err());

        kwargs.insert("x".into(), json!(3));
        assert!(spec.check("move", &[], &kwargs).is_ok());
        // x given twice
        assert!(spec.check("move", &[json!(0)], &kwargs).is_err());

        let mut unexpected = Kwargs::new();
        unexpected.insert("speed".into(), json!(9));
        assert!(spec.check("move", &[json!(0)], &unexpected).is_err());
        spec.varkw = Some("opts".into());
        assert!(spec.check("move", &[json!(0)], &unexpected).is_ok());
    }

    #[test]
    fn test_arg_spec_render() {
        let mut spec = spec(&["x", "y"]);
        spec.defaults.insert("y".into(), json!(1));
        spec.kwonlyargs = vec!["fast".into()];
        spec.kwonlydefaults.insert("fast".into(), json!(false));
        spec.varkw = Some("opts".into());
        assert_eq!(spec.render(), "x, y=1, *, fast=false, **opts");

        spec.varargs = Some("rest".into());
        assert_eq!(spec.render(), "x, y=1, *rest, fast=false, **opts");
    }

    #[test]
    fn test_parse_catalog_with_nulls() {
        let catalog = json!([
            ["stage.get_x", "Stage x.", {"args": [], "defaults": null, "varargs": null,
                "varkw": null, "kwonlyargs": [], "kwonlydefaults": null}],
            ["stage.move_to", null, {"args": ["x", "y"], "defaults": {"y": 0}}],
            ["snap", null, null]
        ]);
        let descriptors = ProcedureDescriptor::parse_catalog(catalog).unwrap();
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].doc.as_deref(), Some("Stage x."));
        assert_eq!(descriptors[1].arg_spec.defaults["y"], json!(0));
        assert_eq!(descriptors[2].arg_spec, ArgSpec::default());

        assert!(ProcedureDescriptor::parse_catalog(json!({"not": "a list"})).is_err());
    }
}
