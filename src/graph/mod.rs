//! # Resource Graph
//!
//! An explicit directed acyclic graph of typed resource specs.
//!
//! Nodes are declared through the provisioners ([`ResourceGraph::keys`],
//! [`ResourceGraph::buckets`], ...), which hand back typed [`Handle`]s. Every
//! handle a spec holds is a dependency edge; additional ordering-only edges are
//! added with [`ResourceGraph::add_dependency`]. [`ResourceGraph::plan`]
//! resolves the graph into dependency waves once, before anything is applied.

pub mod render;

pub use render::{Outputs, RenderContext, ResolvedResource};

use crate::error::{ProvisionError, Result};
use crate::model::{Environment, LogicalId, RemovalPolicy, ResourceType};
use crate::provision::bucket::{BucketPolicySpec, BucketSpec};
use crate::provision::catalog::CatalogEncryptionSpec;
use crate::provision::key::KmsKeySpec;
use crate::provision::permissions::{
    DataLakeSettingsSpec, Governance, GrantSpec, RegisteredLocationSpec,
};
use crate::provision::table::{DatabaseSpec, TableSpec};
use crate::provision::trail::{DeliveryRoleSpec, LogGroupSpec, TrailSpec};
use crate::provision::workgroup::WorkGroupSpec;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::LazyLock;

static LOGICAL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]{0,254}$").expect("logical id regex is valid"));

/// A typed resource declaration that can render its control-plane properties
pub trait ResourceDefinition {
    /// Cloud resource type this spec materializes as
    const RESOURCE_TYPE: ResourceType;

    /// Logical ids this spec reads identifiers from
    fn references(&self) -> Vec<LogicalId>;

    /// Render properties once every reference is resolved
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Value>;
}

/// Typed reference to a node in the graph
pub struct Handle<T> {
    id: LogicalId,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(id: LogicalId) -> Self {
        Self {
            id,
            _kind: PhantomData,
        }
    }

    /// Reference a resource by logical id without declaring it in this graph
    ///
    /// Applying a graph that depends on a detached handle whose node is
    /// absent fails with `UnresolvedDependency`.
    #[must_use]
    pub fn detached(id: impl Into<LogicalId>) -> Self {
        Self::new(id.into())
    }

    #[must_use]
    pub fn logical_id(&self) -> &LogicalId {
        &self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.id).finish()
    }
}

/// Every kind of node the graph can hold
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Key(KmsKeySpec),
    Bucket(BucketSpec),
    BucketPolicy(BucketPolicySpec),
    LogGroup(LogGroupSpec),
    DeliveryRole(DeliveryRoleSpec),
    Trail(TrailSpec),
    CatalogEncryption(CatalogEncryptionSpec),
    DataLakeSettings(DataLakeSettingsSpec),
    RegisteredLocation(RegisteredLocationSpec),
    Database(DatabaseSpec),
    Table(TableSpec),
    Grant(GrantSpec),
    WorkGroup(WorkGroupSpec),
}

impl ResourceSpec {
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceSpec::Key(_) => KmsKeySpec::RESOURCE_TYPE,
            ResourceSpec::Bucket(_) => BucketSpec::RESOURCE_TYPE,
            ResourceSpec::BucketPolicy(_) => BucketPolicySpec::RESOURCE_TYPE,
            ResourceSpec::LogGroup(_) => LogGroupSpec::RESOURCE_TYPE,
            ResourceSpec::DeliveryRole(_) => DeliveryRoleSpec::RESOURCE_TYPE,
            ResourceSpec::Trail(_) => TrailSpec::RESOURCE_TYPE,
            ResourceSpec::CatalogEncryption(_) => CatalogEncryptionSpec::RESOURCE_TYPE,
            ResourceSpec::DataLakeSettings(_) => DataLakeSettingsSpec::RESOURCE_TYPE,
            ResourceSpec::RegisteredLocation(_) => RegisteredLocationSpec::RESOURCE_TYPE,
            ResourceSpec::Database(_) => DatabaseSpec::RESOURCE_TYPE,
            ResourceSpec::Table(_) => TableSpec::RESOURCE_TYPE,
            ResourceSpec::Grant(_) => GrantSpec::RESOURCE_TYPE,
            ResourceSpec::WorkGroup(_) => WorkGroupSpec::RESOURCE_TYPE,
        }
    }

    #[must_use]
    pub fn references(&self) -> Vec<LogicalId> {
        match self {
            ResourceSpec::Key(s) => s.references(),
            ResourceSpec::Bucket(s) => s.references(),
            ResourceSpec::BucketPolicy(s) => s.references(),
            ResourceSpec::LogGroup(s) => s.references(),
            ResourceSpec::DeliveryRole(s) => s.references(),
            ResourceSpec::Trail(s) => s.references(),
            ResourceSpec::CatalogEncryption(s) => s.references(),
            ResourceSpec::DataLakeSettings(s) => s.references(),
            ResourceSpec::RegisteredLocation(s) => s.references(),
            ResourceSpec::Database(s) => s.references(),
            ResourceSpec::Table(s) => s.references(),
            ResourceSpec::Grant(s) => s.references(),
            ResourceSpec::WorkGroup(s) => s.references(),
        }
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<Value> {
        match self {
            ResourceSpec::Key(s) => s.render(ctx),
            ResourceSpec::Bucket(s) => s.render(ctx),
            ResourceSpec::BucketPolicy(s) => s.render(ctx),
            ResourceSpec::LogGroup(s) => s.render(ctx),
            ResourceSpec::DeliveryRole(s) => s.render(ctx),
            ResourceSpec::Trail(s) => s.render(ctx),
            ResourceSpec::CatalogEncryption(s) => s.render(ctx),
            ResourceSpec::DataLakeSettings(s) => s.render(ctx),
            ResourceSpec::RegisteredLocation(s) => s.render(ctx),
            ResourceSpec::Database(s) => s.render(ctx),
            ResourceSpec::Table(s) => s.render(ctx),
            ResourceSpec::Grant(s) => s.render(ctx),
            ResourceSpec::WorkGroup(s) => s.render(ctx),
        }
    }
}

/// A declared resource
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub logical_id: LogicalId,
    pub spec: ResourceSpec,
    pub removal_policy: RemovalPolicy,
    /// Ordering-only edges on top of the spec's own references
    pub depends_on: BTreeSet<LogicalId>,
}

impl Node {
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        self.spec.resource_type()
    }

    /// All edges: spec references plus explicit ordering edges
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<LogicalId> {
        let mut deps: BTreeSet<LogicalId> = self.spec.references().into_iter().collect();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }

    /// Render this node's properties against resolved outputs
    pub fn render(&self, env: &Environment, outputs: &Outputs) -> Result<Value> {
        let ctx = RenderContext::new(env, outputs, &self.logical_id, self.resource_type());
        self.spec.render(&ctx)
    }
}

/// Application order: every node in a wave depends only on earlier waves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub waves: Vec<Vec<LogicalId>>,
}

impl Plan {
    /// Flattened topological order
    pub fn order(&self) -> impl DoubleEndedIterator<Item = &LogicalId> {
        self.waves.iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of a node in the flattened order
    #[must_use]
    pub fn position(&self, id: &LogicalId) -> Option<usize> {
        self.order().position(|n| n == id)
    }
}

/// The declared resource graph of one stack
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    env: Environment,
    nodes: Vec<Node>,
    index: HashMap<LogicalId, usize>,
    pub(crate) governance: Governance,
}

impl ResourceGraph {
    #[must_use]
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            nodes: Vec::new(),
            index: HashMap::new(),
            governance: Governance::default(),
        }
    }

    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Declare a node
    pub(crate) fn add<T: ResourceDefinition>(
        &mut self,
        id: LogicalId,
        spec: ResourceSpec,
        removal_policy: RemovalPolicy,
    ) -> Result<Handle<T>> {
        debug_assert_eq!(spec.resource_type(), T::RESOURCE_TYPE);
        self.check_new_ids(&[&id])?;
        tracing::debug!(
            logical_id = %id,
            resource_type = %spec.resource_type(),
            "Declared resource"
        );
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(Node {
            logical_id: id.clone(),
            spec,
            removal_policy,
            depends_on: BTreeSet::new(),
        });
        Ok(Handle::new(id))
    }

    /// Check that every id is well formed, unused and distinct
    ///
    /// Provisioners that declare several nodes at once call this before
    /// touching the graph, so a rejected declaration leaves it unchanged.
    pub(crate) fn check_new_ids(&self, ids: &[&LogicalId]) -> Result<()> {
        for (i, id) in ids.iter().enumerate() {
            if !LOGICAL_ID.is_match(id.as_str()) {
                return Err(ProvisionError::invalid(
                    id,
                    "logical ids must be alphanumeric and start with a letter",
                ));
            }
            if self.index.contains_key(*id) || ids[..i].contains(id) {
                return Err(ProvisionError::invalid(id, "logical id is already declared"));
            }
        }
        Ok(())
    }

    /// Add an ordering-only edge: `node` is applied after `on`
    pub fn add_dependency(&mut self, node: &LogicalId, on: &LogicalId) -> Result<()> {
        if node == on {
            return Err(ProvisionError::invalid(node, "a resource cannot depend on itself"));
        }
        let entry = self
            .node_mut(node)
            .ok_or_else(|| ProvisionError::invalid(node, "resource is not declared"))?;
        entry.depends_on.insert(on.clone());
        Ok(())
    }

    #[must_use]
    pub fn node(&self, id: &LogicalId) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn node_mut(&mut self, id: &LogicalId) -> Option<&mut Node> {
        self.index.get(id).map(|&i| &mut self.nodes[i])
    }

    #[must_use]
    pub fn contains(&self, id: &LogicalId) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of declared nodes of a given type
    #[must_use]
    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.resource_type() == resource_type)
            .count()
    }

    /// Resolve the graph into dependency waves
    ///
    /// Fails with `UnresolvedDependency` when a node references an undeclared
    /// logical id and with `InvalidConfiguration` on cycles. Ties inside a
    /// wave keep declaration order so plans are deterministic.
    pub fn plan(&self) -> Result<Plan> {
        let n = self.nodes.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for (i, node) in self.nodes.iter().enumerate() {
            for dep in node.dependencies() {
                let Some(&j) = self.index.get(&dep) else {
                    return Err(ProvisionError::UnresolvedDependency {
                        logical_id: node.logical_id.clone(),
                        resource_type: node.resource_type(),
                        missing: dep,
                    });
                };
                if i == j {
                    return Err(ProvisionError::invalid(
                        &node.logical_id,
                        "a resource cannot depend on itself",
                    ));
                }
                dependents[j].push(i);
                in_degree[i] += 1;
            }
        }

        let mut level = vec![0usize; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &d in &dependents[i] {
                level[d] = level[d].max(level[i] + 1);
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if visited < n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.nodes[i].logical_id.as_str())
                .collect();
            let first = &self.nodes[(0..n).find(|&i| in_degree[i] > 0).unwrap_or(0)];
            return Err(ProvisionError::invalid(
                &first.logical_id,
                format!("dependency cycle among: {}", stuck.join(", ")),
            ));
        }

        let depth = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut waves: Vec<Vec<LogicalId>> = vec![Vec::new(); depth];
        for (i, node) in self.nodes.iter().enumerate() {
            waves[level[i]].push(node.logical_id.clone());
        }
        Ok(Plan { waves })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::bucket::{BucketEncryption, BucketProps, ObjectOwnership};
    use crate::provision::key::KeyCapability;
    use crate::model::Principal;

    fn graph() -> ResourceGraph {
        ResourceGraph::new(Environment::new("123456789012", "aws", "us-east-1").unwrap())
    }

    fn props(encryption: BucketEncryption) -> BucketProps {
        BucketProps {
            name: "data-lake-bucket-123456789012".to_string(),
            encryption,
            ownership: ObjectOwnership::BucketOwnerEnforced,
            access_logs: None,
            removal_policy: RemovalPolicy::Destroy,
            auto_delete_objects: true,
        }
    }

    #[test]
    fn plan_orders_keys_before_buckets() {
        let mut g = graph();
        let key = g.keys().create_key("DataKey", RemovalPolicy::Destroy).unwrap();
        let bucket = g
            .buckets()
            .create_bucket("DataBucket", props(BucketEncryption::KeyBacked(key.clone())))
            .unwrap();

        let plan = g.plan().unwrap();
        let key_pos = plan.position(key.logical_id()).unwrap();
        let bucket_pos = plan.position(bucket.logical_id()).unwrap();
        assert!(key_pos < bucket_pos);
        assert_eq!(plan.len(), g.len());
    }

    #[test]
    fn detached_references_are_unresolved_at_plan_time() {
        let mut g = graph();
        let bucket = g
            .buckets()
            .create_bucket(
                "DataBucket",
                props(BucketEncryption::KeyBacked(Handle::detached("ForeignKey"))),
            )
            .unwrap();

        match g.plan().unwrap_err() {
            ProvisionError::UnresolvedDependency {
                logical_id,
                missing,
                ..
            } => {
                assert_eq!(&logical_id, bucket.logical_id());
                assert_eq!(missing.as_str(), "ForeignKey");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let mut g = graph();
        let a = g.keys().create_key("KeyA", RemovalPolicy::Destroy).unwrap();
        let b = g.keys().create_key("KeyB", RemovalPolicy::Destroy).unwrap();
        g.add_dependency(a.logical_id(), b.logical_id()).unwrap();
        g.add_dependency(b.logical_id(), a.logical_id()).unwrap();
        let err = g.plan().unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
        assert!(g.add_dependency(a.logical_id(), a.logical_id()).is_err());
    }

    #[test]
    fn duplicate_and_malformed_ids_are_rejected() {
        let mut g = graph();
        g.keys().create_key("DataKey", RemovalPolicy::Destroy).unwrap();
        assert!(g.keys().create_key("DataKey", RemovalPolicy::Destroy).is_err());
        assert!(g.keys().create_key("data-key", RemovalPolicy::Destroy).is_err());
    }

    #[test]
    fn independent_nodes_share_a_wave() {
        let mut g = graph();
        let a = g.keys().create_key("KeyA", RemovalPolicy::Destroy).unwrap();
        let b = g.keys().create_key("KeyB", RemovalPolicy::Destroy).unwrap();
        g.keys()
            .grant(&a, Principal::user("rodrigo"), KeyCapability::Decrypt)
            .unwrap();
        let plan = g.plan().unwrap();
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(plan.waves[0], vec![a.logical_id().clone(), b.logical_id().clone()]);
    }
}
