//! Foreign-key dependency graph
//!
//! Nodes are table names; an edge `a -> b` means `a` holds a foreign key
//! referencing `b`, so `b` must exist first. Self references are ignored:
//! a table can always reference itself from its own CREATE TABLE.

use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, table: &str) {
        self.deps.entry(table.to_string()).or_default();
    }

    /// Record that `from` depends on `to`. Edges to unknown nodes are kept
    /// out of ordering decisions.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.add_node(from);
        self.deps.entry(from.to_string()).or_default().insert(to.to_string());
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) {
        if let Some(targets) = self.deps.get_mut(from) {
            targets.remove(to);
        }
    }

    fn edges_within(&self, table: &str) -> impl Iterator<Item = &String> {
        self.deps
            .get(table)
            .into_iter()
            .flatten()
            .filter(|t| self.deps.contains_key(t.as_str()))
    }

    /// Dependencies first; ties broken by name. `None` if a cycle remains.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = self
            .deps
            .keys()
            .map(|t| (t.as_str(), self.edges_within(t).count()))
            .collect();

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for table in self.deps.keys() {
            for dep in self.edges_within(table) {
                dependents.entry(dep.as_str()).or_default().push(table.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(t, _)| *t)
            .collect();
        let mut order = Vec::with_capacity(self.deps.len());

        while let Some(table) = ready.iter().next().copied() {
            ready.remove(table);
            order.push(table.to_string());
            for dependent in dependents.get(table).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        (order.len() == self.deps.len()).then_some(order)
    }

    /// Strongly connected components with more than one table, each sorted
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut tarjan = Tarjan {
            graph: self,
            index: 0,
            indices: HashMap::new(),
            lowlink: HashMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        };
        for table in self.deps.keys() {
            if !tarjan.indices.contains_key(table.as_str()) {
                tarjan.visit(table);
            }
        }

        let mut cycles: Vec<Vec<String>> = tarjan
            .components
            .into_iter()
            .filter(|c| c.len() > 1)
            .map(|mut c| {
                c.sort();
                c
            })
            .collect();
        cycles.sort();
        cycles
    }
}

struct Tarjan<'a> {
    graph: &'a DependencyGraph,
    index: usize,
    indices: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: BTreeSet<&'a str>,
    components: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn visit(&mut self, table: &'a str) {
        self.indices.insert(table, self.index);
        self.lowlink.insert(table, self.index);
        self.index += 1;
        self.stack.push(table);
        self.on_stack.insert(table);

        let graph = self.graph;
        for dep in graph.edges_within(table) {
            let dep = dep.as_str();
            if !self.indices.contains_key(dep) {
                self.visit(dep);
                let low = self.lowlink[table].min(self.lowlink[dep]);
                self.lowlink.insert(table, low);
            } else if self.on_stack.contains(dep) {
                let low = self.lowlink[table].min(self.indices[dep]);
                self.lowlink.insert(table, low);
            }
        }

        if self.lowlink[table] == self.indices[table] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                component.push(member.to_string());
                if member == table {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
