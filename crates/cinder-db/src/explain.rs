use std::collections::BTreeMap;

use cinder_query::Expr;
use cinder_store::Store;
use serde::Serialize;

use crate::planner::plan::{
    ModificationStage, ModifyKind, Output, Pipeline, Plan, Routing, Source, Step,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeType {
    SingletonNode,
    EnumerateCollectionNode,
    IndexNode,
    EnumerateListNode,
    CalculationNode,
    FilterNode,
    LimitNode,
    DistributeNode,
    ScatterNode,
    RemoteNode,
    GatherNode,
    InsertNode,
    UpdateNode,
    ReplaceNode,
    RemoveNode,
    UpsertNode,
    SingleRemoteOperationNode,
    CollectNode,
    SubqueryStartNode,
    SubqueryEndNode,
    ReturnNode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionNode {
    pub id: u32,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Shard id the node is limited to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restricted_to: Option<String>,
}

/// The execution plan of a query as returned by `Database::explain`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explain {
    pub nodes: Vec<ExecutionNode>,
    /// Optimizer rules that changed the plan.
    pub rules: Vec<String>,
}

impl Explain {
    pub fn has_node(&self, node_type: NodeType) -> bool {
        self.nodes.iter().any(|n| n.node_type == node_type)
    }

    pub fn nodes_of(&self, node_type: NodeType) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.iter().any(|r| r == name)
    }

    pub(crate) fn of<S: Store>(plan: &Plan<S>) -> Self {
        let mut out = Nodes {
            nodes: Vec::new(),
            subqueries: &plan.subqueries,
        };
        out.pipeline(&plan.root, true);
        Explain {
            nodes: out.nodes,
            rules: plan.rules.iter().map(|r| r.to_string()).collect(),
        }
    }
}

struct Nodes<'a, S> {
    nodes: Vec<ExecutionNode>,
    subqueries: &'a BTreeMap<usize, Pipeline<S>>,
}

impl<S: Store> Nodes<'_, S> {
    fn push(&mut self, node_type: NodeType) {
        self.push_on(node_type, None, None);
    }

    fn push_on(&mut self, node_type: NodeType, collection: Option<&str>, shard: Option<String>) {
        self.nodes.push(ExecutionNode {
            id: self.nodes.len() as u32 + 1,
            node_type,
            collection: collection.map(str::to_string),
            restricted_to: shard,
        });
    }

    /// Subqueries an expression calls, each between its start and end node.
    fn subqueries_of(&mut self, expr: &Expr) {
        let subqueries = self.subqueries;
        for (id, _) in expr.subqueries() {
            if let Some(inner) = subqueries.get(&id) {
                self.push(NodeType::SubqueryStartNode);
                self.pipeline(inner, false);
                self.push(NodeType::SubqueryEndNode);
            }
        }
    }

    /// Calculates `expr`; a bare subquery needs no calculation of its own.
    fn calculation(&mut self, expr: &Expr) {
        self.subqueries_of(expr);
        if !matches!(expr, Expr::Subquery { .. }) {
            self.push(NodeType::CalculationNode);
        }
    }

    fn filters(&mut self, p: &Pipeline<S>) {
        for _ in &p.filters {
            self.push(NodeType::CalculationNode);
            self.push(NodeType::FilterNode);
        }
    }

    fn steps(&mut self, p: &Pipeline<S>) {
        for step in &p.steps {
            match step {
                Step::Let { value, .. } => self.calculation(value),
                Step::Filter(filter) => {
                    self.subqueries_of(filter);
                    self.push(NodeType::CalculationNode);
                    self.push(NodeType::FilterNode);
                }
            }
        }
    }

    fn pipeline(&mut self, p: &Pipeline<S>, top_level: bool) {
        if let Some(m) = &p.modification
            && let Routing::SingleOperation(shard) = m.routing
        {
            if top_level {
                self.push(NodeType::SingletonNode);
            }
            self.push_on(
                NodeType::SingleRemoteOperationNode,
                Some(m.collection.name()),
                Some(m.collection.shards()[shard].to_string()),
            );
            self.output(p);
            return;
        }

        if top_level {
            self.push(NodeType::SingletonNode);
        }
        let local = p
            .modification
            .as_ref()
            .is_some_and(|m| m.routing == Routing::Local);
        match &p.source {
            Source::Singleton => self.filters(p),
            Source::List { .. } => {
                self.push(NodeType::CalculationNode);
                self.push(NodeType::EnumerateListNode);
                self.filters(p);
            }
            Source::Collection(scan) => {
                self.push(NodeType::ScatterNode);
                self.push(NodeType::RemoteNode);
                let shard = scan
                    .restricted_to
                    .map(|i| scan.collection.shards()[i].to_string());
                let node_type = if scan.lookup.is_some() {
                    NodeType::IndexNode
                } else {
                    NodeType::EnumerateCollectionNode
                };
                self.push_on(node_type, Some(scan.collection.name()), shard);
                self.filters(p);
                if local && let Some(m) = &p.modification {
                    self.operation(m, None);
                }
                self.push(NodeType::RemoteNode);
                self.push(NodeType::GatherNode);
            }
        }
        self.steps(p);
        if p.limit.is_some() {
            self.push(NodeType::LimitNode);
        }
        if let Some(m) = &p.modification
            && !local
        {
            self.modification(m);
        }
        self.output(p);
    }

    fn modification(&mut self, m: &ModificationStage<S>) {
        for expr in m.op.expressions() {
            self.subqueries_of(expr);
        }
        if m.kind() == ModifyKind::Upsert {
            self.push(NodeType::CalculationNode);
            self.push_on(NodeType::UpsertNode, Some(m.collection.name()), None);
            return;
        }
        if m.kind() == ModifyKind::Insert || m.routing == Routing::Distribute {
            self.push(NodeType::CalculationNode);
        }
        let shard = match m.routing {
            Routing::Distribute => {
                self.push_on(NodeType::DistributeNode, Some(m.collection.name()), None);
                None
            }
            Routing::Restricted(i) => {
                self.push(NodeType::ScatterNode);
                Some(m.collection.shards()[i].to_string())
            }
            _ => {
                self.push(NodeType::ScatterNode);
                None
            }
        };
        self.push(NodeType::RemoteNode);
        self.operation(m, shard);
        self.push(NodeType::RemoteNode);
        self.push(NodeType::GatherNode);
    }

    fn operation(&mut self, m: &ModificationStage<S>, shard: Option<String>) {
        let node_type = match m.kind() {
            ModifyKind::Insert => NodeType::InsertNode,
            ModifyKind::Update => NodeType::UpdateNode,
            ModifyKind::Replace => NodeType::ReplaceNode,
            ModifyKind::Remove => NodeType::RemoveNode,
            ModifyKind::Upsert => NodeType::UpsertNode,
        };
        self.push_on(node_type, Some(m.collection.name()), shard);
    }

    fn output(&mut self, p: &Pipeline<S>) {
        match &p.output {
            Output::Discard => {}
            Output::Return(expr) => {
                self.calculation(expr);
                self.push(NodeType::ReturnNode);
            }
            Output::Count { ret, .. } => {
                self.push(NodeType::CollectNode);
                if let Some(ret) = ret {
                    self.calculation(ret);
                    self.push(NodeType::ReturnNode);
                }
            }
        }
    }
}
