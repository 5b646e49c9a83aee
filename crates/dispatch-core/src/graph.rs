//! Job dependency graph and topological execution planning.
//!
//! Jobs live in an arena (`Vec<Job>`) and edges are index adjacency lists in
//! both directions. An edge `A → B` means "B depends on A": A must succeed
//! before B may start.
//!
//! Topological ordering is computed via Kahn's algorithm with ready nodes
//! taken in arena order, so the result is deterministic.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::domain::error::GraphError;
use crate::domain::job::Job;

/// Convenience result alias.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Kahn's algorithm over index adjacency.
///
/// `upstream[i]` holds the nodes `i` depends on. Returns the order on
/// success, or the nodes left with unsatisfied dependencies on a cycle.
pub fn kahn_order(upstream: &[BTreeSet<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = upstream.len();
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree: Vec<usize> = vec![0; n];
    for (node, deps) in upstream.iter().enumerate() {
        in_degree[node] = deps.len();
        for &dep in deps {
            downstream[dep].push(node);
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        sorted.push(node);
        let mut next = Vec::new();
        for &dependent in &downstream[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                next.push(dependent);
            }
        }
        next.sort_unstable();
        queue.extend(next);
    }

    if sorted.len() == n {
        Ok(sorted)
    } else {
        Err((0..n).filter(|&i| in_degree[i] > 0).collect())
    }
}

/// Validated DAG of jobs.
#[derive(Debug, Clone)]
pub struct JobGraph {
    jobs: Vec<Job>,
    index: HashMap<String, usize>,
    upstream: Vec<BTreeSet<usize>>,
    downstream: Vec<BTreeSet<usize>>,
}

impl JobGraph {
    /// Build the graph from jobs and their `dependencies`.
    ///
    /// Fails on duplicate ids, dependencies on jobs outside the set, and
    /// cycles.
    pub fn build(jobs: Vec<Job>) -> GraphResult<Self> {
        let mut index = HashMap::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            if index.insert(job.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode { id: job.id.clone() });
            }
        }

        let mut upstream = vec![BTreeSet::new(); jobs.len()];
        let mut downstream = vec![BTreeSet::new(); jobs.len()];
        for (i, job) in jobs.iter().enumerate() {
            for dep in &job.dependencies {
                let d = *index
                    .get(dep)
                    .ok_or_else(|| GraphError::NodeNotFound { id: dep.clone() })?;
                upstream[i].insert(d);
                downstream[d].insert(i);
            }
        }

        let graph = Self {
            jobs,
            index,
            upstream,
            downstream,
        };
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, idx: usize) -> &Job {
        &self.jobs[idx]
    }

    pub fn job_mut(&mut self, idx: usize) -> &mut Job {
        &mut self.jobs[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.index_of(id).map(|i| &self.jobs[i])
    }

    /// Direct dependencies of `idx`.
    pub fn dependencies(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.upstream[idx].iter().copied()
    }

    /// Direct dependents of `idx`.
    pub fn dependents(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.downstream[idx].iter().copied()
    }

    /// All transitive dependents of `idx` (BFS over downstream edges).
    pub fn transitive_dependents(&self, idx: usize) -> BTreeSet<usize> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([idx]);
        while let Some(current) = queue.pop_front() {
            for &dep in &self.downstream[current] {
                if visited.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        visited
    }

    /// Jobs with no dependencies, in arena order.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.jobs.len())
            .filter(|&i| self.upstream[i].is_empty())
            .collect()
    }

    /// Dependencies before dependents.
    pub fn topological_order(&self) -> GraphResult<Vec<usize>> {
        kahn_order(&self.upstream).map_err(|stuck| GraphError::Cycle {
            nodes: stuck.into_iter().map(|i| self.jobs[i].id.clone()).collect(),
        })
    }

    /// Kahn waves: every job in level `n` depends only on levels `< n`.
    pub fn levels(&self) -> GraphResult<Vec<Vec<usize>>> {
        let order = self.topological_order()?;
        let mut level = vec![0usize; self.jobs.len()];
        for &node in &order {
            level[node] = self.upstream[node]
                .iter()
                .map(|&d| level[d] + 1)
                .max()
                .unwrap_or(0);
        }
        let depth = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut waves = vec![Vec::new(); depth];
        for node in order {
            waves[level[node]].push(node);
        }
        Ok(waves)
    }

    pub fn into_jobs(self) -> Vec<Job> {
        self.jobs
    }
}
