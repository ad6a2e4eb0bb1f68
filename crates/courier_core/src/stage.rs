use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::ConfigError;

/// Static description of one unit of pipeline work.
///
/// `executor` is a stable capability identifier resolved against the
/// engine's executor registry at startup; `config` is passed through to the
/// executor verbatim and participates in the idempotency fingerprint.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: String,
    pub depends_on: Vec<String>,
    pub executor: String,
    pub config: Value,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, executor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            executor: executor.into(),
            config: Value::Null,
        }
    }

    pub fn depends_on(mut self, upstream: impl Into<String>) -> Self {
        self.depends_on.push(upstream.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Validated dependency DAG over stage definitions.
///
/// Declaration order is significant: it breaks ties between independent
/// stages so a run order is deterministic for a fixed definition list.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
}

impl StageGraph {
    /// Validates names, dependencies and acyclicity.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(stages.len());
        for (pos, stage) in stages.iter().enumerate() {
            if index.insert(stage.name.clone(), pos).is_some() {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
        }
        for stage in &stages {
            for dep in &stage.depends_on {
                if !index.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        let graph = Self { stages, index };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.index.get(name).map(|&pos| &self.stages[pos])
    }

    /// All declared stage names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Transitive closure of `requested` over dependencies, topologically
    /// ordered with ties broken by declaration order.
    pub fn closure(&self, requested: &[&str]) -> Result<Vec<&StageDefinition>, ConfigError> {
        let mut wanted: BTreeSet<usize> = BTreeSet::new();
        let mut frontier: Vec<usize> = Vec::new();
        for name in requested {
            let &pos = self
                .index
                .get(*name)
                .ok_or_else(|| ConfigError::UnknownStage((*name).to_string()))?;
            frontier.push(pos);
        }
        while let Some(pos) = frontier.pop() {
            if !wanted.insert(pos) {
                continue;
            }
            for dep in &self.stages[pos].depends_on {
                frontier.push(self.index[dep]);
            }
        }

        // Kahn's algorithm restricted to the closure. Ready stages are taken
        // in declaration order, which the BTreeSet iteration gives us.
        let mut ordered = Vec::with_capacity(wanted.len());
        let mut done: HashSet<usize> = HashSet::new();
        while ordered.len() < wanted.len() {
            let next = wanted.iter().copied().find(|&pos| {
                !done.contains(&pos)
                    && self.stages[pos]
                        .depends_on
                        .iter()
                        .all(|dep| done.contains(&self.index[dep]))
            });
            match next {
                Some(pos) => {
                    done.insert(pos);
                    ordered.push(&self.stages[pos]);
                }
                // new() rejected cycles, so this cannot happen for a valid graph.
                None => {
                    let stuck = wanted
                        .iter()
                        .find(|pos| !done.contains(pos))
                        .map(|&pos| self.stages[pos].name.clone())
                        .unwrap_or_default();
                    return Err(ConfigError::CycleDetected(stuck));
                }
            }
        }
        Ok(ordered)
    }

    /// Names of all stages that depend, directly or transitively, on `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        let mut downstream: HashSet<&str> = HashSet::new();
        downstream.insert(name);
        // Fixpoint over the edge list; graphs here are a handful of stages.
        let mut changed = true;
        while changed {
            changed = false;
            for stage in &self.stages {
                if downstream.contains(stage.name.as_str()) {
                    continue;
                }
                if stage
                    .depends_on
                    .iter()
                    .any(|dep| downstream.contains(dep.as_str()))
                {
                    downstream.insert(stage.name.as_str());
                    changed = true;
                }
            }
        }
        downstream.remove(name);
        self.stages
            .iter()
            .map(|s| s.name.as_str())
            .filter(|n| downstream.contains(n))
            .collect()
    }

    fn check_acyclic(&self) -> Result<(), ConfigError> {
        // Depth-first search with a three-color marking.
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;
        let mut color = vec![WHITE; self.stages.len()];

        fn visit(
            graph: &StageGraph,
            pos: usize,
            color: &mut [u8],
        ) -> Result<(), ConfigError> {
            color[pos] = GRAY;
            for dep in &graph.stages[pos].depends_on {
                let dep_pos = graph.index[dep];
                match color[dep_pos] {
                    GRAY => {
                        return Err(ConfigError::CycleDetected(
                            graph.stages[dep_pos].name.clone(),
                        ))
                    }
                    WHITE => visit(graph, dep_pos, color)?,
                    _ => {}
                }
            }
            color[pos] = BLACK;
            Ok(())
        }

        for pos in 0..self.stages.len() {
            if color[pos] == WHITE {
                visit(self, pos, &mut color)?;
            }
        }
        Ok(())
    }
}

/// The default courier pipeline: fetch feeds translate, format and title fan
/// out from translate, publish joins both.
pub fn default_stage_graph() -> StageGraph {
    let stages = vec![
        StageDefinition::new("fetch", "fetch"),
        StageDefinition::new("translate", "translate").depends_on("fetch"),
        StageDefinition::new("format", "format").depends_on("translate"),
        StageDefinition::new("title", "title").depends_on("translate"),
        StageDefinition::new("publish", "publish")
            .depends_on("format")
            .depends_on("title"),
    ];
    StageGraph::new(stages).expect("default graph is statically acyclic")
}
