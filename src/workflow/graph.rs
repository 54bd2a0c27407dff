//! Id-keyed adjacency view over a definition's steps.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{Step, StepKind, WorkflowDefinition, START_STEP_ID};

/// Steps stored once, edges resolved through an id index. Cycles are fine.
#[derive(Debug, Clone)]
pub struct StepGraph {
    definition: WorkflowDefinition,
    index: HashMap<String, usize>,
    duplicates: Vec<String>,
}

impl StepGraph {
    pub fn new(definition: WorkflowDefinition) -> Self {
        let mut index = HashMap::with_capacity(definition.steps.len());
        let mut duplicates = Vec::new();
        for (position, step) in definition.steps.iter().enumerate() {
            if index.contains_key(&step.id) {
                duplicates.push(step.id.clone());
            } else {
                index.insert(step.id.clone(), position);
            }
        }

        Self {
            definition,
            index,
            duplicates,
        }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.definition.steps[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Ids declared more than once; only the first declaration is indexed.
    pub fn duplicate_ids(&self) -> &[String] {
        &self.duplicates
    }

    /// Every step id a step may hand control to.
    pub fn successors<'a>(&self, step: &'a Step) -> Vec<&'a str> {
        let mut targets: Vec<&str> = Vec::with_capacity(3);
        targets.extend(step.next.default.as_deref());
        targets.extend(step.next.alternative.as_deref());
        if let StepKind::Conditional(payload) = &step.kind {
            targets.extend(payload.if_not_exists.as_deref());
        }
        targets
    }

    /// Steps reachable from `start`, in breadth-first order.
    pub fn reachable_from_start(&self) -> Vec<&Step> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&Step> = VecDeque::new();
        let mut order = Vec::new();

        if let Some(start) = self.step(START_STEP_ID) {
            seen.insert(START_STEP_ID);
            queue.push_back(start);
        }

        while let Some(step) = queue.pop_front() {
            order.push(step);
            for target in self.successors(step) {
                if seen.insert(target) {
                    if let Some(next) = self.step(target) {
                        queue.push_back(next);
                    }
                }
            }
        }

        order
    }
}
