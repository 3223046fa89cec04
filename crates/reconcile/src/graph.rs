//! Dependency graph construction
//!
//! An edge `A -> B` means "A must complete before B starts". Edges come from
//! explicit `depends_on` entries, from every deferred reference in a node's
//! inputs, and from provider scoping (a node handled by a provider that lives
//! inside another node depends on that node).

use crate::error::{Error, Result};
use crate::node::ResourceNode;
use crate::record::ProvisionRecord;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Directed acyclic graph over node ids
///
/// Nodes keep their insertion order, which makes [`Dag::topological_order`]
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning its index; adding an existing id is a no-op
    pub fn add_node(&mut self, id: impl Into<String>) -> usize {
        let id = id.into();
        if let Some(&i) = self.index.get(&id) {
            return i;
        }
        let i = self.ids.len();
        self.index.insert(id.clone(), i);
        self.ids.push(id);
        self.dependencies.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
        i
    }

    /// Record that `dependency` must complete before `dependent`
    ///
    /// Both nodes are added if missing.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) {
        let from = self.add_node(dependency);
        let to = self.add_node(dependent);
        self.dependencies[to].insert(from);
        self.dependents[from].insert(to);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Ids in insertion order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    pub(crate) fn dependency_indices(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependencies[index]
    }

    pub(crate) fn dependent_indices(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependents[index]
    }

    /// Direct dependencies of `id`
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| self.dependencies[i].iter().map(|&d| self.id(d)).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `id`
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| self.dependents[i].iter().map(|&d| self.id(d)).collect())
            .unwrap_or_default()
    }

    /// Every node that directly or indirectly depends on `id`
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let Some(start) = self.index_of(id) else {
            return BTreeSet::new();
        };
        let mut queue: VecDeque<usize> = self.dependents[start].iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            if seen.insert(i) {
                queue.extend(self.dependents[i].iter().copied());
            }
        }
        seen.into_iter().map(|i| self.id(i)).collect()
    }

    /// The same nodes with every edge flipped
    pub fn reversed(&self) -> Self {
        Self {
            ids: self.ids.clone(),
            index: self.index.clone(),
            dependencies: self.dependents.clone(),
            dependents: self.dependencies.clone(),
        }
    }

    /// A valid topological order, or the cycle preventing one
    ///
    /// Ties are broken by insertion order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: VecDeque<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(i) = ready.pop_front() {
            order.push(self.ids[i].clone());
            for &d in &self.dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() == self.len() {
            return Ok(order);
        }

        let path = self.find_cycle().unwrap_or_default();
        Err(Error::Cycle { path })
    }

    /// Depth-first search for a back edge
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut stack: Vec<usize> = Vec::new();

        for start in 0..self.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS over dependency edges: (node, remaining dependencies)
            let mut frames: Vec<(usize, Vec<usize>)> =
                vec![(start, self.dependencies[start].iter().copied().collect())];
            marks[start] = Mark::OnStack;
            stack.push(start);

            while let Some((node, pending)) = frames.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) => match marks[next] {
                        Mark::OnStack => {
                            let pos = stack.iter().position(|&n| n == next).unwrap_or(0);
                            // Stack runs against edge direction, so reverse it
                            let mut path: Vec<String> =
                                stack[pos..].iter().rev().map(|&n| self.ids[n].clone()).collect();
                            path.push(self.ids[stack[stack.len() - 1]].clone());
                            return Some(path);
                        }
                        Mark::Unvisited => {
                            marks[next] = Mark::OnStack;
                            stack.push(next);
                            frames.push((next, self.dependencies[next].iter().copied().collect()));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node] = Mark::Done;
                        stack.pop();
                        frames.pop();
                    }
                }
            }
        }
        None
    }

    /// Deletion ordering graph for records that left the declaration set
    ///
    /// Only dependencies between the given records produce edges.
    pub fn from_records(records: &[ProvisionRecord]) -> Result<Self> {
        let mut dag = Self::new();
        for record in records {
            dag.add_node(&record.id);
        }
        for record in records {
            for dependency in &record.dependencies {
                if dag.contains(dependency) {
                    dag.add_edge(dependency, &record.id);
                }
            }
        }
        dag.topological_order()?;
        Ok(dag)
    }
}

/// Builds and validates the graph for a declaration set
pub struct GraphBuilder<'a> {
    nodes: &'a [ResourceNode],
    provider_owners: HashMap<String, String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(nodes: &'a [ResourceNode]) -> Self {
        Self {
            nodes,
            provider_owners: HashMap::new(),
        }
    }

    /// Providers scoped to a node: provider name -> owner node id
    pub fn with_provider_owners(mut self, owners: HashMap<String, String>) -> Self {
        self.provider_owners = owners;
        self
    }

    pub fn build(self) -> Result<Dag> {
        let mut dag = Dag::new();
        for node in self.nodes {
            if dag.contains(&node.id) {
                return Err(Error::DuplicateNode {
                    id: node.id.clone(),
                });
            }
            dag.add_node(&node.id);
        }

        for node in self.nodes {
            for dependency in node.dependency_ids() {
                if !dag.contains(dependency) {
                    return Err(Error::UnknownReference {
                        node: node.id.clone(),
                        target: dependency.to_string(),
                    });
                }
                dag.add_edge(dependency, &node.id);
            }

            if let Some(owner) = self.provider_owners.get(&node.provider)
                && owner != &node.id
            {
                if !dag.contains(owner) {
                    return Err(Error::UnknownReference {
                        node: node.id.clone(),
                        target: owner.clone(),
                    });
                }
                dag.add_edge(owner, &node.id);
            }
        }

        let order = dag.topological_order()?;
        log::debug!("dependency graph: {} nodes, order {:?}", dag.len(), order);
        Ok(dag)
    }
}
