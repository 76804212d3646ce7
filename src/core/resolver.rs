//! AN-003: Dependency DAG construction and template resolution.
//!
//! Builds a DAG from explicit `depends_on` edges and computes topological order
//! using Kahn's algorithm. Ties between independent nodes go to the node that
//! appears first in the input, so output is deterministic.
//!
//! Resolves `{{params.key}}` and `{{resources.<id>.external_id}}` templates in
//! resource parameters.

use super::types::*;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::OnceLock;

/// Directed acyclic graph over a plan's resources.
///
/// Nodes are addressed by their position in the input; `dependencies[i]` are
/// the nodes `i` waits for, `dependents[i]` the nodes waiting for `i`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: FxHashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build and topologically sort the graph. Rejects duplicate ids, dangling
    /// references and cycles before anything else can look at the plan.
    pub fn build(specs: &[ResourceSpec]) -> Result<Self, PlanError> {
        let mut ids = Vec::with_capacity(specs.len());
        let mut index = FxHashMap::default();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateId(spec.id.clone()));
            }
            ids.push(spec.id.clone());
        }

        let mut dependencies = vec![Vec::new(); specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            let mut seen = FxHashSet::default();
            for dep in &spec.depends_on {
                let j = *index.get(dep).ok_or_else(|| PlanError::DanglingReference {
                    resource: spec.id.clone(),
                    missing: dep.clone(),
                })?;
                if seen.insert(j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        let order = kahn(&dependencies, &dependents)
            .map_err(|remaining| PlanError::Cycle {
                members: find_cycle(&dependencies, &remaining)
                    .into_iter()
                    .map(|i| ids[i].clone())
                    .collect(),
            })?;

        Ok(Self {
            ids,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in input order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Creation order: every node after everything it depends on.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Deletion order: every node before everything it depends on.
    pub fn teardown_order(&self) -> Vec<&str> {
        self.order.iter().rev().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Position-based creation order.
    pub fn order_indices(&self) -> &[usize] {
        &self.order
    }

    pub fn dependencies_of(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    pub fn dependents_of(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Direct dependencies of `id`, in declaration order.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| self.names(&self.dependencies[i]))
            .unwrap_or_default()
    }

    /// Direct dependents of `id`, in input order.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| self.names(&self.dependents[i]))
            .unwrap_or_default()
    }

    /// Everything that (transitively) depends on `idx`, in creation order.
    pub fn transitive_dependents_of(&self, idx: usize) -> Vec<usize> {
        self.reach(idx, &self.dependents)
    }

    /// Everything `idx` (transitively) depends on, in creation order.
    pub fn transitive_dependencies_of(&self, idx: usize) -> Vec<usize> {
        self.reach(idx, &self.dependencies)
    }

    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| self.names(&self.transitive_dependents_of(i)))
            .unwrap_or_default()
    }

    fn names(&self, idxs: &[usize]) -> Vec<&str> {
        idxs.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    fn reach(&self, start: usize, edges: &[Vec<usize>]) -> Vec<usize> {
        let mut seen = vec![false; self.ids.len()];
        let mut stack = edges[start].clone();
        while let Some(i) = stack.pop() {
            if !seen[i] {
                seen[i] = true;
                stack.extend_from_slice(&edges[i]);
            }
        }
        self.order.iter().copied().filter(|&i| seen[i]).collect()
    }
}

/// Kahn's algorithm with a min-heap on input position. On a cycle, returns the
/// nodes that could not be ordered.
fn kahn(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == dependencies.len() {
        Ok(order)
    } else {
        Err((0..dependencies.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}

/// Walk unordered dependencies from the earliest unordered node until a node
/// repeats. Every unordered node has an unordered dependency, so this always
/// closes a cycle. Members start at the earliest input position.
fn find_cycle(dependencies: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let unresolved: FxHashSet<usize> = remaining.iter().copied().collect();
    let mut path: Vec<usize> = Vec::new();
    let mut position: FxHashMap<usize, usize> = FxHashMap::default();
    let mut current = match remaining.first() {
        Some(&first) => first,
        None => return Vec::new(),
    };

    loop {
        if let Some(&start) = position.get(&current) {
            let mut cycle = path[start..].to_vec();
            if let Some(min_pos) = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, &i)| i)
                .map(|(p, _)| p)
            {
                cycle.rotate_left(min_pos);
            }
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);
        match dependencies[current].iter().find(|&&d| unresolved.contains(&d)) {
            Some(&next) => current = next,
            None => return path,
        }
    }
}

// ============================================================================
// Templates
// ============================================================================

/// A `{{...}}` reference inside a parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    Param(String),
    ResourceId(String),
    Unknown(String),
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("template regex"))
}

fn classify(key: &str) -> TemplateRef {
    if let Some(param) = key.strip_prefix("params.") {
        return TemplateRef::Param(param.to_string());
    }
    if let Some(rest) = key.strip_prefix("resources.") {
        if let Some((id, "external_id")) = rest.rsplit_once('.') {
            return TemplateRef::ResourceId(id.to_string());
        }
    }
    TemplateRef::Unknown(key.to_string())
}

/// All template references in a string.
pub fn template_references(template: &str) -> Vec<TemplateRef> {
    template_regex()
        .captures_iter(template)
        .map(|c| classify(&c[1]))
        .collect()
}

/// Resolve all template variables in a string.
pub fn resolve_template(
    template: &str,
    params: &HashMap<String, serde_yaml_ng::Value>,
    external_ids: &dyn Fn(&str) -> Option<String>,
) -> Result<String, String> {
    let mut result = String::with_capacity(template.len());
    let mut last = 0;
    for caps in template_regex().captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        result.push_str(&template[last..whole.start]);
        let value = match classify(&caps[1]) {
            TemplateRef::Param(key) => params
                .get(&key)
                .map(yaml_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", key))?,
            TemplateRef::ResourceId(id) => external_ids(&id)
                .ok_or_else(|| format!("resource '{}' has no external id", id))?,
            TemplateRef::Unknown(key) => {
                return Err(format!("unknown template variable: {}", key))
            }
        };
        result.push_str(&value);
        last = whole.end;
    }
    result.push_str(&template[last..]);
    Ok(result)
}

/// Resolve templates in every string of a parameter payload, recursively.
pub fn resolve_parameters(
    parameters: &Parameters,
    params: &HashMap<String, serde_yaml_ng::Value>,
    external_ids: &dyn Fn(&str) -> Option<String>,
) -> Result<Parameters, String> {
    parameters
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(v, params, external_ids)?)))
        .collect()
}

fn resolve_value(
    value: &serde_yaml_ng::Value,
    params: &HashMap<String, serde_yaml_ng::Value>,
    external_ids: &dyn Fn(&str) -> Option<String>,
) -> Result<serde_yaml_ng::Value, String> {
    use serde_yaml_ng::Value;
    Ok(match value {
        Value::String(s) => Value::String(resolve_template(s, params, external_ids)?),
        Value::Sequence(seq) => Value::Sequence(
            seq.iter()
                .map(|v| resolve_value(v, params, external_ids))
                .collect::<Result<_, _>>()?,
        ),
        Value::Mapping(map) => {
            let mut out = serde_yaml_ng::Mapping::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, params, external_ids)?);
            }
            Value::Mapping(out)
        }
        other => other.clone(),
    })
}

fn collect_strings<'a>(value: &'a serde_yaml_ng::Value, out: &mut Vec<&'a str>) {
    use serde_yaml_ng::Value;
    match value {
        Value::String(s) => out.push(s),
        Value::Sequence(seq) => seq.iter().for_each(|v| collect_strings(v, out)),
        Value::Mapping(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Check every template reference at build time: params must exist, and a
/// referenced resource must be a declared dependency.
pub fn validate_templates(
    specs: &[ResourceSpec],
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> Result<(), PlanError> {
    let known: FxHashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
    for spec in specs {
        let mut strings = Vec::new();
        spec.parameters
            .values()
            .for_each(|v| collect_strings(v, &mut strings));
        for s in strings {
            for reference in template_references(s) {
                match reference {
                    TemplateRef::Param(key) if !params.contains_key(&key) => {
                        return Err(PlanError::Template {
                            resource: spec.id.clone(),
                            message: format!("unknown param: {}", key),
                        });
                    }
                    TemplateRef::Param(_) => {}
                    TemplateRef::ResourceId(id) if !known.contains(id.as_str()) => {
                        return Err(PlanError::DanglingReference {
                            resource: spec.id.clone(),
                            missing: id,
                        });
                    }
                    TemplateRef::ResourceId(id) if !spec.depends_on.contains(&id) => {
                        return Err(PlanError::UndeclaredReference {
                            resource: spec.id.clone(),
                            referenced: id,
                        });
                    }
                    TemplateRef::ResourceId(_) => {}
                    TemplateRef::Unknown(key) => {
                        return Err(PlanError::Template {
                            resource: spec.id.clone(),
                            message: format!("unknown template variable: {}", key),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}
