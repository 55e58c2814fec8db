//! Turns a blueprint plus root parameters into an immutable [`Plan`].
//!
//! Planning walks the module tree top-down. For each scope it:
//!
//! 1. binds the scope's parameters ([`crate::params::bind`])
//! 2. evaluates conditions and prunes excluded nodes, including children of
//!    excluded parents and every node of an excluded module instance
//! 3. plans nested module instances, threading caller values into module
//!    parameters and inheriting `location` and `tags`
//! 4. computes resource names, substitutes parameters and rewrites
//!    `${nodes.ID.KEY}` placeholders to qualified node ids
//! 5. evaluates the scope's declared outputs
//!
//! Nodes inside module instances get qualified ids (`openai/account`). A
//! reference to a module instance output (`${nodes.openai.endpoint}`) is replaced
//! by the module's output expression, so after planning every placeholder points
//! at a concrete resource. The dependency graph is then built and ordered; any
//! binding, naming, reference or cycle error aborts before a single provisioning
//! call is made.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::blueprint::{Blueprint, ModuleDefinition, ModuleInstance, OutputBinding, ResourceDefinition};
use crate::condition::should_include;
use crate::constants::{ROOT_SCOPE, SCOPE_SEPARATOR};
use crate::core::{OutputRef, Placeholder, StackError, Value};
use crate::graph::{DeploymentGraph, EdgeKind};
use crate::naming::resolve_name_with_rule;
use crate::params::{InheritedContext, ResolvedParams, bind, substitute_params};
use crate::utils::did_you_mean;

/// Parameters a module instance inherits from its caller when it declares them.
const INHERITED_PARAMS: [&str; 2] = ["location", "tags"];

/// Caller-supplied inputs of a planning run.
#[derive(Debug, Clone, Default)]
pub struct PlanInput {
    /// Deployment scope, e.g. a resource group id; hashed into computed names
    pub scope_id: String,
    /// Root parameter values
    pub parameters: BTreeMap<String, Value>,
    /// Ambient values (`location`, `tags`) used when the root declares them
    pub context: InheritedContext,
}

impl PlanInput {
    /// Input for `scope_id` with no parameters.
    #[must_use]
    pub fn new(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            ..Self::default()
        }
    }

    /// Builder: set a root parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Builder: set an ambient value.
    #[must_use]
    pub fn with_context(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(name, value.into());
        self
    }
}

/// A resource that will be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedNode {
    /// Qualified id (`instance/child` inside modules)
    pub id: String,
    /// Qualified id of the enclosing module instance, `None` at the root
    pub module: Option<String>,
    /// Provider type and version
    pub resource_type: String,
    /// Computed or literal resource name
    pub name: String,
    /// Location; may still reference other nodes
    pub location: Option<Value>,
    /// Tags
    pub tags: Value,
    /// Property bag with parameters substituted and node references qualified
    pub properties: Value,
    /// Qualified id of the owning resource
    pub parent: Option<String>,
    /// Qualified explicit dependencies
    pub depends_on: BTreeSet<String>,
    /// Output aliases mapped to paths
    pub outputs: BTreeMap<String, String>,
}

impl PlannedNode {
    /// Minimal node, mostly for tests and fixtures.
    #[must_use]
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            module: None,
            resource_type: resource_type.into(),
            location: None,
            tags: Value::Map(BTreeMap::new()),
            properties: Value::Map(BTreeMap::new()),
            parent: None,
            depends_on: BTreeSet::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Output references of properties, location and tags.
    #[must_use]
    pub fn references(&self) -> BTreeSet<OutputRef> {
        let mut refs = self.properties.output_refs();
        refs.extend(self.tags.output_refs());
        if let Some(location) = &self.location {
            refs.extend(location.output_refs());
        }
        refs
    }

    /// Every node this one must wait for, with the reason.
    #[must_use]
    pub fn dependencies(&self) -> Vec<(String, EdgeKind)> {
        let mut deps: Vec<(String, EdgeKind)> =
            self.depends_on.iter().map(|d| (d.clone(), EdgeKind::Explicit)).collect();
        if let Some(parent) = &self.parent {
            deps.push((parent.clone(), EdgeKind::Parent));
        }
        deps.extend(self.references().into_iter().map(|r| (r.node, EdgeKind::Reference)));
        deps
    }

    /// Resolve an output key to the path it reads, following aliases.
    #[must_use]
    pub fn output_path<'a>(&'a self, key: &'a str) -> &'a str {
        self.outputs.get(key).map_or(key, String::as_str)
    }
}

/// A node left out of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedNode {
    /// Qualified id
    pub id: String,
    /// Human-readable reason
    pub reason: String,
}

/// A root output as planned.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOutput {
    /// Produced from this expression once its nodes are applied
    Bound {
        /// Expression over qualified node outputs
        value: Value,
        /// Never shown in plaintext
        secure: bool,
    },
    /// Not produced because a referenced node is excluded
    Excluded {
        /// Why
        reason: String,
    },
}

/// Immutable result of planning.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Deployment scope
    pub scope_id: String,
    /// Included nodes by qualified id
    pub nodes: BTreeMap<String, PlannedNode>,
    /// Excluded nodes in discovery order
    pub excluded: Vec<ExcludedNode>,
    /// Root outputs
    pub outputs: BTreeMap<String, PlannedOutput>,
    /// Dependency graph of `nodes`
    pub graph: DeploymentGraph,
    /// Apply order
    pub order: Vec<String>,
}

impl Plan {
    /// Build a plan from already planned nodes. Used by tests and by callers that
    /// construct nodes directly.
    pub fn from_nodes(
        scope_id: impl Into<String>,
        nodes: Vec<PlannedNode>,
        outputs: BTreeMap<String, PlannedOutput>,
    ) -> Result<Self, StackError> {
        let nodes: BTreeMap<String, PlannedNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        let graph = DeploymentGraph::build(nodes.values())?;
        let order = graph.topological_order()?;
        Ok(Self {
            scope_id: scope_id.into(),
            nodes,
            excluded: Vec::new(),
            outputs,
            graph,
            order,
        })
    }

    /// Look up a planned node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&PlannedNode> {
        self.nodes.get(id)
    }

    /// Whether `id` was excluded.
    #[must_use]
    pub fn is_excluded(&self, id: &str) -> bool {
        self.excluded.iter().any(|e| e.id == id)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan for scope '{}': {} node(s)", self.scope_id, self.order.len())?;
        for (i, id) in self.order.iter().enumerate() {
            if let Some(node) = self.nodes.get(id) {
                writeln!(f, "  {:>2}. {} ({}) name={}", i + 1, id, node.resource_type, node.name)?;
            }
        }
        for excluded in &self.excluded {
            writeln!(f, "   -  {} excluded: {}", excluded.id, excluded.reason)?;
        }
        Ok(())
    }
}

/// Plan a blueprint.
pub fn plan(blueprint: &Blueprint, input: &PlanInput) -> Result<Plan, StackError> {
    let root = blueprint.root_module();
    let params = bind(ROOT_SCOPE, &root.parameters, &input.parameters, &input.context)?;

    let mut planner = Planner {
        blueprint,
        scope_id: &input.scope_id,
        nodes: BTreeMap::new(),
        excluded: Vec::new(),
    };
    let root_result = planner.plan_scope(None, &root, &params)?;

    let mut outputs = BTreeMap::new();
    for (name, output) in root_result.outputs {
        let planned = match output {
            ScopeOutput::Present(value) => {
                let declared_secure = root.outputs.get(&name).is_some_and(|o| o.secure);
                let secure = declared_secure || value.contains_secret();
                if secure && !declared_secure {
                    tracing::warn!(output = %name, "Output carries a secure value; marking it secure");
                }
                PlannedOutput::Bound {
                    value,
                    secure,
                }
            }
            ScopeOutput::Absent(reason) => PlannedOutput::Excluded {
                reason,
            },
        };
        outputs.insert(name, planned);
    }

    check_name_collisions(&planner.nodes)?;

    let graph = DeploymentGraph::build(planner.nodes.values())?;
    let order = graph.topological_order()?;

    tracing::info!(
        scope = %input.scope_id,
        included = order.len(),
        excluded = planner.excluded.len(),
        "Planned deployment"
    );

    Ok(Plan {
        scope_id: input.scope_id.clone(),
        nodes: planner.nodes,
        excluded: planner.excluded,
        outputs,
        graph,
        order,
    })
}

/// Output of a module scope as seen by its caller.
#[derive(Debug, Clone)]
enum ScopeOutput {
    Present(Value),
    Absent(String),
}

/// What a planned scope exposes to its caller.
struct ScopeResult {
    outputs: BTreeMap<String, ScopeOutput>,
    members: BTreeSet<String>,
}

/// How a local id in a scope resolved.
enum LocalNode {
    Resource {
        qualified: String,
    },
    Instance {
        qualified: String,
        module: String,
        result: ScopeResult,
    },
    Excluded {
        qualified: String,
        reason: String,
    },
}

struct Planner<'a> {
    blueprint: &'a Blueprint,
    scope_id: &'a str,
    nodes: BTreeMap<String, PlannedNode>,
    excluded: Vec<ExcludedNode>,
}

fn qualify(prefix: Option<&str>, id: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{SCOPE_SEPARATOR}{id}"),
        None => id.to_string(),
    }
}

fn with_node(err: StackError, node: &str) -> StackError {
    match err {
        StackError::NonStaticCondition {
            parameter,
            ..
        } => StackError::NonStaticCondition {
            node: node.to_string(),
            parameter,
        },
        other => other,
    }
}

impl Planner<'_> {
    fn plan_scope(
        &mut self,
        prefix: Option<&str>,
        module: &ModuleDefinition,
        params: &ResolvedParams,
    ) -> Result<ScopeResult, StackError> {
        let scope = prefix.unwrap_or(ROOT_SCOPE);
        let mut locals: BTreeMap<String, LocalNode> = BTreeMap::new();

        // Conditions first: module instance conditions read the caller's params.
        let mut included_resources = Vec::new();
        for resource in &module.resources {
            let qualified = qualify(prefix, &resource.id);
            let include = should_include(resource.condition.as_ref(), params)
                .map_err(|e| with_node(e, &qualified))?;
            if include {
                included_resources.push(resource);
                locals.insert(resource.id.clone(), LocalNode::Resource {
                    qualified,
                });
            } else {
                let reason = format!(
                    "condition '{}' is false",
                    resource.condition.as_ref().map(ToString::to_string).unwrap_or_default()
                );
                self.exclude(&qualified, &reason);
                locals.insert(resource.id.clone(), LocalNode::Excluded {
                    qualified,
                    reason,
                });
            }
        }

        // Children of excluded parents are excluded, following parent chains.
        loop {
            let mut changed = false;
            for resource in &module.resources {
                let Some(parent) = &resource.parent else {
                    continue;
                };
                let parent_reason = match locals.get(parent) {
                    Some(LocalNode::Excluded {
                        ..
                    }) => format!("parent '{}' is excluded", qualify(prefix, parent)),
                    Some(_) => continue,
                    None => {
                        return Err(self.dangling(prefix, &resource.id, parent, &locals, "which is not defined"));
                    }
                };
                if matches!(locals.get(&resource.id), Some(LocalNode::Resource { .. })) {
                    let qualified = qualify(prefix, &resource.id);
                    self.exclude(&qualified, &parent_reason);
                    locals.insert(resource.id.clone(), LocalNode::Excluded {
                        qualified,
                        reason: parent_reason,
                    });
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        included_resources.retain(|r| matches!(locals.get(&r.id), Some(LocalNode::Resource { .. })));

        let mut included_instances = Vec::new();
        for instance in &module.instances {
            let qualified = qualify(prefix, &instance.id);
            let include = should_include(instance.condition.as_ref(), params)
                .map_err(|e| with_node(e, &qualified))?;
            if include {
                included_instances.push(instance);
            } else {
                let reason = format!(
                    "condition '{}' is false",
                    instance.condition.as_ref().map(ToString::to_string).unwrap_or_default()
                );
                self.exclude_instance(&qualified, &instance.module, &reason);
                locals.insert(instance.id.clone(), LocalNode::Excluded {
                    qualified,
                    reason,
                });
            }
        }

        // Instances may consume each other's outputs; plan them in dependency order.
        for instance in order_instances(scope, &included_instances)? {
            let qualified = qualify(prefix, &instance.id);
            let result = self.plan_instance(prefix, scope, instance, params, &locals)?;
            locals.insert(instance.id.clone(), LocalNode::Instance {
                qualified,
                module: instance.module.clone(),
                result,
            });
        }

        let mut members = BTreeSet::new();
        for resource in included_resources {
            let node = self.plan_resource(prefix, scope, resource, params, &locals)?;
            members.insert(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }
        for local in locals.values() {
            if let LocalNode::Instance {
                result,
                ..
            } = local
            {
                members.extend(result.members.iter().cloned());
            }
        }

        let mut outputs = BTreeMap::new();
        for (name, binding) in &module.outputs {
            let output = self.plan_output(prefix, scope, name, binding, params, &locals)?;
            outputs.insert(name.clone(), output);
        }

        Ok(ScopeResult {
            outputs,
            members,
        })
    }

    fn plan_instance(
        &mut self,
        prefix: Option<&str>,
        scope: &str,
        instance: &ModuleInstance,
        params: &ResolvedParams,
        locals: &BTreeMap<String, LocalNode>,
    ) -> Result<ScopeResult, StackError> {
        let qualified = qualify(prefix, &instance.id);
        let blueprint = self.blueprint;
        let module = blueprint.modules.get(&instance.module).ok_or_else(|| {
            StackError::UnknownModule {
                instance: qualified.clone(),
                module: instance.module.clone(),
            }
        })?;

        let mut supplied = BTreeMap::new();
        for (name, value) in &instance.inputs {
            let value = substitute_params(scope, value, params)?;
            let value = self.rewrite_strict(prefix, &instance.id, &value, locals)?;
            supplied.insert(name.clone(), value);
        }

        let mut inherited = InheritedContext::new();
        for name in INHERITED_PARAMS {
            if let Some(value) = params.get(name) {
                inherited.insert(name, value.clone());
            }
        }

        let module_params = bind(&qualified, &module.parameters, &supplied, &inherited)?;
        tracing::debug!(instance = %qualified, module = %instance.module, "Planning module instance");
        let mut result = self.plan_scope(Some(&qualified), module, &module_params)?;

        // depends_on on an instance means every resource inside it waits.
        let extra = self.explicit_dependencies(prefix, &instance.id, &instance.depends_on, locals)?;
        if !extra.is_empty() {
            for member in &result.members {
                if let Some(node) = self.nodes.get_mut(member) {
                    node.depends_on.extend(extra.iter().cloned());
                }
            }
        }
        Ok(result)
    }

    fn plan_resource(
        &self,
        prefix: Option<&str>,
        scope: &str,
        resource: &ResourceDefinition,
        params: &ResolvedParams,
        locals: &BTreeMap<String, LocalNode>,
    ) -> Result<PlannedNode, StackError> {
        let qualified = qualify(prefix, &resource.id);
        let local = &resource.id;

        let properties = substitute_params(scope, &resource.properties, params)?;
        let properties = self.rewrite_strict(prefix, local, &properties, locals)?;

        let location = match resource.location.as_ref().or_else(|| params.get("location")) {
            Some(location) => {
                let location = substitute_params(scope, location, params)?;
                Some(self.rewrite_strict(prefix, local, &location, locals)?)
            }
            None => None,
        };

        let tags = match resource.tags.as_ref().or_else(|| params.get("tags")) {
            Some(tags) => {
                let tags = substitute_params(scope, tags, params)?;
                self.rewrite_strict(prefix, local, &tags, locals)?
            }
            None => Value::Map(BTreeMap::new()),
        };
        if !matches!(tags, Value::Map(_)) {
            return Err(StackError::InvalidParameterValue {
                scope: scope.to_string(),
                name: format!("{}.tags", resource.id),
                reason: format!("tags must be a table, got {}", tags.type_name()),
            });
        }

        let name = self.compute_name(scope, &qualified, resource, params)?;
        let depends_on = self.explicit_dependencies(prefix, local, &resource.depends_on, locals)?;
        let parent = resource.parent.as_ref().map(|p| qualify(prefix, p));

        Ok(PlannedNode {
            id: qualified,
            module: prefix.map(ToString::to_string),
            resource_type: resource.resource_type.clone(),
            name,
            location,
            tags,
            properties,
            parent,
            depends_on,
            outputs: resource.outputs.clone(),
        })
    }

    fn compute_name(
        &self,
        scope: &str,
        qualified: &str,
        resource: &ResourceDefinition,
        params: &ResolvedParams,
    ) -> Result<String, StackError> {
        let Some(spec) = &resource.name else {
            return Ok(resource.id.clone());
        };

        let static_text = |value: &Value| -> Result<String, StackError> {
            let value = substitute_params(scope, value, params)?;
            if value.is_deferred() {
                return Err(StackError::InvalidName {
                    node: qualified.to_string(),
                    reason: "name parts must not depend on other nodes' outputs".to_string(),
                });
            }
            if value.contains_secret() {
                return Err(StackError::InvalidName {
                    node: qualified.to_string(),
                    reason: "name parts must not use secure parameters".to_string(),
                });
            }
            Ok(match value {
                Value::Null => String::new(),
                other => other.to_string(),
            })
        };

        let prefix = static_text(&spec.prefix)?;
        let suffix = spec.suffix.iter().map(static_text).collect::<Result<Vec<_>, _>>()?;
        resolve_name_with_rule(&prefix, &suffix, self.scope_id, &spec.rule()).map_err(|e| match e {
            StackError::InvalidName {
                reason,
                ..
            } => StackError::InvalidName {
                node: qualified.to_string(),
                reason,
            },
            other => other,
        })
    }

    fn plan_output(
        &self,
        prefix: Option<&str>,
        scope: &str,
        name: &str,
        binding: &OutputBinding,
        params: &ResolvedParams,
        locals: &BTreeMap<String, LocalNode>,
    ) -> Result<ScopeOutput, StackError> {
        let value = substitute_params(scope, &binding.value, params)?;
        let owner = format!("output '{name}'");
        let output = self.rewrite(prefix, &owner, &value, locals)?;
        Ok(match output {
            ScopeOutput::Present(value) if binding.secure => ScopeOutput::Present(Value::secret(value)),
            other => other,
        })
    }

    fn explicit_dependencies(
        &self,
        prefix: Option<&str>,
        from: &str,
        depends_on: &[String],
        locals: &BTreeMap<String, LocalNode>,
    ) -> Result<BTreeSet<String>, StackError> {
        let mut deps = BTreeSet::new();
        for target in depends_on {
            match locals.get(target) {
                Some(LocalNode::Resource {
                    qualified,
                }) => {
                    deps.insert(qualified.clone());
                }
                Some(LocalNode::Instance {
                    result,
                    ..
                }) => {
                    deps.extend(result.members.iter().cloned());
                }
                Some(LocalNode::Excluded {
                    reason,
                    ..
                }) => {
                    return Err(StackError::DanglingReference {
                        from: qualify(prefix, from),
                        target: qualify(prefix, target),
                        reason: format!("which is excluded ({reason})"),
                    });
                }
                None => {
                    return Err(self.dangling(prefix, from, target, locals, "which is not defined"));
                }
            }
        }
        Ok(deps)
    }

    /// Rewrite node references; references to excluded nodes are errors.
    fn rewrite_strict(
        &self,
        prefix: Option<&str>,
        from: &str,
        value: &Value,
        locals: &BTreeMap<String, LocalNode>,
    ) -> Result<Value, StackError> {
        match self.rewrite(prefix, from, value, locals)? {
            ScopeOutput::Present(value) => Ok(value),
            ScopeOutput::Absent(reason) => {
                let target = value
                    .output_refs()
                    .into_iter()
                    .find(|r| !matches!(locals.get(&r.node), Some(LocalNode::Resource { .. })))
                    .map_or_else(String::new, |r| qualify(prefix, &r.node));
                Err(StackError::DanglingReference {
                    from: qualify(prefix, from),
                    target,
                    reason,
                })
            }
        }
    }

    /// Rewrite `${nodes.LOCAL.KEY}` placeholders to qualified references.
    ///
    /// Instance outputs are spliced in. A reference to an excluded node, or to an
    /// instance output that is itself absent, makes the whole value absent.
    fn rewrite(
        &self,
        prefix: Option<&str>,
        from: &str,
        value: &Value,
        locals: &BTreeMap<String, LocalNode>,
    ) -> Result<ScopeOutput, StackError> {
        let mut absent: Option<String> = None;
        for output in value.output_refs() {
            match locals.get(&output.node) {
                Some(LocalNode::Resource {
                    ..
                }) => {}
                Some(LocalNode::Instance {
                    qualified,
                    module,
                    result,
                }) => match result.outputs.get(&output.key) {
                    Some(ScopeOutput::Present(_)) => {}
                    Some(ScopeOutput::Absent(reason)) => {
                        absent.get_or_insert_with(|| {
                            format!("output '{}' of '{qualified}' is absent: {reason}", output.key)
                        });
                    }
                    None => {
                        let hint = did_you_mean(&output.key, result.outputs.keys().map(String::as_str));
                        return Err(StackError::DanglingReference {
                            from: qualify(prefix, from),
                            target: format!("{qualified}.{}", output.key),
                            reason: format!("but module '{module}' declares no such output{hint}"),
                        });
                    }
                },
                Some(LocalNode::Excluded {
                    qualified,
                    reason,
                }) => {
                    absent.get_or_insert_with(|| format!("'{qualified}' is excluded ({reason})"));
                }
                None => {
                    return Err(self.dangling(prefix, from, &output.node, locals, "which is not defined"));
                }
            }
        }

        if let Some(reason) = absent {
            return Ok(ScopeOutput::Absent(reason));
        }

        let rewritten = value.resolve(&|placeholder: &Placeholder| -> Result<Option<Value>, StackError> {
            let Placeholder::Output(output) = placeholder else {
                return Ok(None);
            };
            Ok(match locals.get(&output.node) {
                Some(LocalNode::Resource {
                    qualified,
                }) => Some(Value::Template(vec![crate::core::Fragment::Placeholder(
                    Placeholder::Output(OutputRef {
                        node: qualified.clone(),
                        key: output.key.clone(),
                    }),
                )])),
                Some(LocalNode::Instance {
                    result,
                    ..
                }) => match result.outputs.get(&output.key) {
                    Some(ScopeOutput::Present(value)) => Some(value.clone()),
                    _ => None,
                },
                _ => None,
            })
        })?;
        Ok(ScopeOutput::Present(rewritten))
    }

    fn dangling(
        &self,
        prefix: Option<&str>,
        from: &str,
        target: &str,
        locals: &BTreeMap<String, LocalNode>,
        reason: &str,
    ) -> StackError {
        let hint = did_you_mean(target, locals.keys().map(String::as_str));
        StackError::DanglingReference {
            from: qualify(prefix, from),
            target: qualify(prefix, target),
            reason: format!("{reason}{hint}"),
        }
    }

    fn exclude(&mut self, id: &str, reason: &str) {
        tracing::debug!(node = %id, reason, "Excluding node");
        self.excluded.push(ExcludedNode {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Exclude an instance and, recursively, everything it would contain.
    fn exclude_instance(&mut self, qualified: &str, module: &str, reason: &str) {
        self.exclude(qualified, reason);
        let blueprint = self.blueprint;
        let Some(definition) = blueprint.modules.get(module) else {
            return;
        };
        let inner = format!("module instance '{qualified}' is excluded");
        for resource in &definition.resources {
            self.exclude(&qualify(Some(qualified), &resource.id), &inner);
        }
        for nested in &definition.instances {
            self.exclude_instance(&qualify(Some(qualified), &nested.id), &nested.module, &inner);
        }
    }
}

/// Order instances so that one consuming another's outputs, or depending on it,
/// is planned after it.
fn order_instances<'a>(
    scope: &str,
    instances: &[&'a ModuleInstance],
) -> Result<Vec<&'a ModuleInstance>, StackError> {
    let ids: BTreeSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
    let mut graph = DeploymentGraph::new();
    for instance in instances {
        graph.add_node(&instance.id);
        for target in &instance.depends_on {
            if ids.contains(target.as_str()) {
                graph.add_dependency(&instance.id, target, EdgeKind::Explicit);
            }
        }
        for value in instance.inputs.values() {
            for output in value.output_refs() {
                if ids.contains(output.node.as_str()) {
                    graph.add_dependency(&instance.id, &output.node, EdgeKind::Reference);
                }
            }
        }
    }
    let order = graph.topological_order().map_err(|e| match e {
        StackError::CyclicDependency {
            cycle,
        } => StackError::CyclicDependency {
            cycle: format!("{cycle} (module inputs in scope '{scope}')"),
        },
        other => other,
    })?;

    let by_id: BTreeMap<&str, &'a ModuleInstance> =
        instances.iter().map(|i| (i.id.as_str(), *i)).collect();
    Ok(order.iter().filter_map(|id| by_id.get(id.as_str()).copied()).collect())
}

/// Two included resources of the same type must not share a name.
fn check_name_collisions(nodes: &BTreeMap<String, PlannedNode>) -> Result<(), StackError> {
    let mut seen: BTreeMap<(&str, &str), &str> = BTreeMap::new();
    for node in nodes.values() {
        let resource_type = node.resource_type.split('@').next().unwrap_or(&node.resource_type);
        if let Some(other) = seen.insert((resource_type, node.name.as_str()), node.id.as_str()) {
            return Err(StackError::InvalidName {
                node: node.id.clone(),
                reason: format!("name '{}' is also used by '{other}'", node.name),
            });
        }
    }
    Ok(())
}
