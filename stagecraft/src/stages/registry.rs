//! Stage registry and dependency-ordered execution plans.

use super::Stage;
use crate::errors::RegistryError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// The set of stages known to an engine.
///
/// Populated once at start-up and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: Vec<Arc<dyn Stage>>,
    index: HashMap<String, usize>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage whose dependencies are already registered.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate ids, self edges or unknown dependencies.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<(), RegistryError> {
        let descriptor = stage.descriptor();
        let id = descriptor.id.clone();
        if self.index.contains_key(&id) {
            return Err(RegistryError::DuplicateStage { id });
        }
        if descriptor.dependencies.contains(&id) {
            return Err(RegistryError::SelfDependency { id });
        }
        let mut deps: Vec<&String> = descriptor.dependencies.iter().collect();
        deps.sort();
        if let Some(missing) = deps.into_iter().find(|d| !self.index.contains_key(*d)) {
            return Err(RegistryError::UnknownDependency {
                stage: id,
                dependency: missing.clone(),
            });
        }
        self.push(stage);
        Ok(())
    }

    /// Registers a batch of stages in any order.
    ///
    /// The batch is validated as a whole before anything is inserted; on
    /// error the registry is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate ids, self edges, unknown dependencies or
    /// a dependency cycle within the batch.
    pub fn register_all(
        &mut self,
        stages: impl IntoIterator<Item = Arc<dyn Stage>>,
    ) -> Result<(), RegistryError> {
        let batch: Vec<Arc<dyn Stage>> = stages.into_iter().collect();
        let mut batch_ids: HashMap<String, usize> = HashMap::new();

        for (pos, stage) in batch.iter().enumerate() {
            let id = stage.id().to_string();
            if self.index.contains_key(&id) || batch_ids.contains_key(&id) {
                return Err(RegistryError::DuplicateStage { id });
            }
            batch_ids.insert(id, pos);
        }

        for stage in &batch {
            let descriptor = stage.descriptor();
            if descriptor.dependencies.contains(&descriptor.id) {
                return Err(RegistryError::SelfDependency {
                    id: descriptor.id.clone(),
                });
            }
            let mut deps: Vec<&String> = descriptor.dependencies.iter().collect();
            deps.sort();
            for dep in deps {
                if !self.index.contains_key(dep) && !batch_ids.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        stage: descriptor.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Existing stages cannot depend on new ones, so a cycle lies inside the batch.
        let ordered: Vec<&str> = batch.iter().map(|s| s.id()).collect();
        let by_id: HashMap<&str, &Arc<dyn Stage>> = batch.iter().map(|s| (s.id(), s)).collect();
        if let Some(cycle) = find_cycle(&ordered, |id| {
            by_id
                .get(id)
                .map(|s| sorted_deps(&s.descriptor().dependencies))
                .unwrap_or_default()
        }) {
            return Err(RegistryError::CyclicDependency { cycle });
        }

        for stage in batch {
            self.push(stage);
        }
        Ok(())
    }

    fn push(&mut self, stage: Arc<dyn Stage>) {
        tracing::debug!(stage = %stage.id(), "Registered stage");
        self.index.insert(stage.id().to_string(), self.stages.len());
        self.stages.push(stage);
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Stage>> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Returns registered stage ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stages are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Builds the execution plan for a tool.
    ///
    /// The plan contains every stage serving `tool` plus the transitive
    /// closure of their dependencies, in a topological order whose ties are
    /// broken by registration order.
    ///
    /// # Errors
    ///
    /// Returns `NoStagesForTool` if nothing serves the tool, or
    /// `CyclicDependency` if the selected stages contain a cycle.
    pub fn build_plan(&self, tool: &str) -> Result<ExecutionPlan, RegistryError> {
        let mut selected: BTreeSet<usize> = self
            .stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.descriptor().serves(tool))
            .map(|(i, _)| i)
            .collect();
        if selected.is_empty() {
            return Err(RegistryError::NoStagesForTool {
                tool: tool.to_string(),
            });
        }

        let mut frontier: Vec<usize> = selected.iter().copied().collect();
        while let Some(i) = frontier.pop() {
            for dep in &self.stages[i].descriptor().dependencies {
                if let Some(&j) = self.index.get(dep) {
                    if selected.insert(j) {
                        frontier.push(j);
                    }
                }
            }
        }

        let mut in_degree: HashMap<usize, usize> = selected
            .iter()
            .map(|&i| (i, self.stages[i].descriptor().dependencies.len()))
            .collect();
        let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &selected {
            for dep in &self.stages[i].descriptor().dependencies {
                if let Some(&j) = self.index.get(dep) {
                    children.entry(j).or_default().push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(selected.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &child in children.get(&i).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = in_degree.get_mut(&child) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        if order.len() < selected.len() {
            let done: HashSet<usize> = order.iter().copied().collect();
            let remaining: Vec<&str> = selected
                .iter()
                .filter(|i| !done.contains(i))
                .map(|&i| self.stages[i].id())
                .collect();
            let cycle = find_cycle(&remaining, |id| {
                self.get(id)
                    .map(|s| sorted_deps(&s.descriptor().dependencies))
                    .unwrap_or_default()
            })
            .unwrap_or_else(|| remaining.iter().map(ToString::to_string).collect());
            return Err(RegistryError::CyclicDependency { cycle });
        }

        Ok(ExecutionPlan::new(
            order.into_iter().map(|i| self.stages[i].clone()).collect(),
        ))
    }
}

fn sorted_deps(deps: &HashSet<String>) -> Vec<String> {
    let mut deps: Vec<String> = deps.iter().cloned().collect();
    deps.sort();
    deps
}

/// Depth-first search returning the first cycle found, first node repeated
/// at the end.
fn find_cycle<F>(nodes: &[&str], deps_of: F) -> Option<Vec<String>>
where
    F: Fn(&str) -> Vec<String>,
{
    fn visit<F>(
        node: &str,
        deps_of: &F,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>>
    where
        F: Fn(&str) -> Vec<String>,
    {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        for dep in deps_of(node) {
            if !visited.contains(&dep) {
                if let Some(cycle) = visit(&dep, deps_of, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(&dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();
    for node in nodes {
        if !visited.contains(*node) {
            if let Some(cycle) = visit(node, &deps_of, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// A topologically ordered set of stages for one tool.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    stages: Vec<Arc<dyn Stage>>,
    order: Vec<String>,
    positions: HashMap<String, usize>,
    children: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        let order: Vec<String> = stages.iter().map(|s| s.id().to_string()).collect();
        let positions = order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for stage in &stages {
            for dep in &stage.descriptor().dependencies {
                children
                    .entry(dep.clone())
                    .or_default()
                    .push(stage.id().to_string());
            }
        }
        Self {
            stages,
            order,
            positions,
            children,
        }
    }

    /// Stage ids in execution order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Looks up a planned stage.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&Arc<dyn Stage>> {
        self.positions.get(id).map(|&i| &self.stages[i])
    }

    /// Returns the number of planned stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the plan is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns true if the stage is part of the plan.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Direct dependencies of a planned stage.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> Option<&HashSet<String>> {
        self.stage(id).map(|s| &s.descriptor().dependencies)
    }

    /// Direct dependents of a planned stage, in plan order.
    #[must_use]
    pub fn direct_dependents_of(&self, id: &str) -> Vec<String> {
        let mut direct = self.children.get(id).cloned().unwrap_or_default();
        direct.sort_by_key(|c| self.positions.get(c).copied().unwrap_or(usize::MAX));
        direct
    }

    /// Transitive dependents of a planned stage, in plan order.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for child in self.children.get(&current).into_iter().flatten() {
                if seen.insert(child.clone()) {
                    frontier.push(child.clone());
                }
            }
        }
        self.order
            .iter()
            .filter(|s| seen.contains(*s))
            .cloned()
            .collect()
    }

    /// Stages with no dependencies, in plan order.
    #[must_use]
    pub fn roots(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.descriptor().dependencies.is_empty())
            .map(|s| s.id())
            .collect()
    }
}
