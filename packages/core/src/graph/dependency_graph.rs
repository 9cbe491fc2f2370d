use super::GraphError;
use crate::expression::ExpressionEvaluator;
use crate::models::{Field, FieldConfig, FieldId};
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

// Matches `{Field Name}` or `{field-id}`; capture group 1 is the reference
const FIELD_REF_PATTERN: &str = r"\{([^{}]+)\}";

fn field_ref_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(FIELD_REF_PATTERN).expect("FIELD_REF_PATTERN is a valid regex"))
}

/// Scan an expression for `{ref}` tokens without parsing it
///
/// Used when the evaluator cannot enumerate references itself. Braces inside
/// string literals are picked up too, which can only add spurious edges.
pub(crate) fn scan_field_refs(expression: &str) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    for capture in field_ref_regex().captures_iter(expression) {
        let reference = capture[1].trim().to_string();
        if !reference.is_empty() && !refs.contains(&reference) {
            refs.push(reference);
        }
    }
    refs
}

/// Unit consumed and emitted by [`topological_sort`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologicalItem {
    pub id: FieldId,
    pub dependencies: Vec<FieldId>,
}

impl TopologicalItem {
    pub fn new(id: impl Into<FieldId>, dependencies: Vec<FieldId>) -> Self {
        Self {
            id: id.into(),
            dependencies,
        }
    }
}

/// Kahn's algorithm over `items`
///
/// Dependencies naming IDs outside `items` impose no ordering. Ties keep the
/// input order, so the output is deterministic. If any item is left with a
/// positive in-degree the whole sort fails.
pub fn topological_sort(items: &[TopologicalItem]) -> Result<Vec<FieldId>, GraphError> {
    let index: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; items.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];

    for (i, item) in items.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &item.dependencies {
            if let Some(&d) = index.get(dep.as_str()) {
                if seen.insert(d) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..items.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(items.len());

    while let Some(i) = queue.pop_front() {
        order.push(items[i].id.clone());
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() < items.len() {
        let fields = items
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, item)| item.id.clone())
            .collect();
        return Err(GraphError::CycleDetected { fields });
    }

    Ok(order)
}

/// Dependency graph of one table's fields
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Computed field IDs in field-definition order
    computed: Vec<FieldId>,
    computed_set: HashSet<FieldId>,

    /// computed field -> fields it reads
    dependencies: HashMap<FieldId, Vec<FieldId>>,

    /// field -> computed fields that read it
    dependents: HashMap<FieldId, Vec<FieldId>>,

    /// computed field -> references that matched no field
    unresolved: HashMap<FieldId, Vec<String>>,
}

impl DependencyGraph {
    /// Build using the `{ref}` token scan for formulas
    pub fn build(fields: &[Field]) -> Self {
        Self::build_with(fields, None)
    }

    /// Build, asking `evaluator` for formula references when it can provide them
    pub fn build_with(fields: &[Field], evaluator: Option<&dyn ExpressionEvaluator>) -> Self {
        let by_id: HashMap<&str, &Field> = fields.iter().map(|f| (f.id.as_str(), f)).collect();
        let by_name: HashMap<&str, &Field> = fields.iter().map(|f| (f.name.as_str(), f)).collect();
        let resolve = |reference: &str| -> Option<FieldId> {
            by_id
                .get(reference)
                .or_else(|| by_name.get(reference))
                .map(|f| f.id.clone())
        };

        let mut graph = DependencyGraph::default();

        for field in fields.iter().filter(|f| f.is_computed()) {
            graph.computed.push(field.id.clone());
            graph.computed_set.insert(field.id.clone());

            let mut deps: Vec<FieldId> = Vec::new();
            let mut unresolved: Vec<String> = Vec::new();
            let mut add = |dep: FieldId| {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            };

            match &field.config {
                FieldConfig::Formula(config) => {
                    for reference in formula_references(&config.expression, evaluator) {
                        match resolve(&reference) {
                            Some(dep) => add(dep),
                            None => unresolved.push(reference),
                        }
                    }
                }
                FieldConfig::Rollup(_) | FieldConfig::Lookup(_) | FieldConfig::Count(_) => {
                    if let Some(link) = field.config.link_field_id() {
                        match resolve(link) {
                            Some(dep) => add(dep),
                            None => unresolved.push(link.to_string()),
                        }
                    }
                    // The target usually lives in the linked table; it only
                    // becomes an edge for self-linking tables
                    if let Some(dep) = field.config.target_field_id().and_then(&resolve) {
                        add(dep);
                    }
                }
                _ => {}
            }

            for dep in &deps {
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(field.id.clone());
            }
            if !unresolved.is_empty() {
                tracing::debug!(
                    "Field '{}' has unresolved references: {:?}",
                    field.id,
                    unresolved
                );
                graph.unresolved.insert(field.id.clone(), unresolved);
            }
            graph.dependencies.insert(field.id.clone(), deps);
        }

        graph
    }

    pub fn computed_fields(&self) -> &[FieldId] {
        &self.computed
    }

    pub fn is_computed(&self, field_id: &str) -> bool {
        self.computed_set.contains(field_id)
    }

    pub fn dependencies_of(&self, field_id: &str) -> &[FieldId] {
        self.dependencies
            .get(field_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, field_id: &str) -> &[FieldId] {
        self.dependents
            .get(field_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn unresolved_references(&self, field_id: &str) -> &[String] {
        self.unresolved
            .get(field_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every edge as `(dependency, dependent)`
    pub fn edges(&self) -> Vec<(FieldId, FieldId)> {
        self.computed
            .iter()
            .flat_map(|to| {
                self.dependencies_of(to)
                    .iter()
                    .map(move |from| (from.clone(), to.clone()))
            })
            .collect()
    }

    /// One item per computed field, in field-definition order
    pub fn items(&self) -> Vec<TopologicalItem> {
        self.computed
            .iter()
            .map(|id| TopologicalItem::new(id.clone(), self.dependencies_of(id).to_vec()))
            .collect()
    }

    /// Order every computed field, including isolated ones
    pub fn topological_sort(&self) -> Result<Vec<FieldId>, GraphError> {
        topological_sort(&self.items())
    }

    pub fn has_cycle(&self) -> bool {
        self.detect_cycle().is_some()
    }

    /// Find one cycle among computed fields
    ///
    /// Returns the cycle as a path that starts and ends on the same field,
    /// e.g. `[x, y, x]`.
    pub fn detect_cycle(&self) -> Option<Vec<FieldId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in &self.computed {
            if marks.contains_key(start.as_str()) {
                continue;
            }

            // Iterative DFS: (node, index of next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Visiting);

            while let Some((node, next)) = stack.last().copied() {
                let deps = self.dependencies_of(node);
                if next >= deps.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let dep = deps[next].as_str();
                if !self.computed_set.contains(dep) {
                    continue;
                }
                match marks.get(dep) {
                    Some(Mark::Visiting) => {
                        let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<FieldId> =
                            stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, 0));
                    }
                }
            }
        }

        None
    }

    /// Computed fields reachable from `changed` along dependency edges, in evaluation order
    ///
    /// A changed field is only part of the result if another changed field
    /// reaches it. Fields without dependents contribute nothing.
    pub fn affected_fields(&self, changed: &[FieldId]) -> Result<Vec<FieldId>, GraphError> {
        let mut reached: HashSet<FieldId> = HashSet::new();
        let mut queue: VecDeque<&str> = changed.iter().map(String::as_str).collect();
        let mut expanded: HashSet<&str> = HashSet::new();

        while let Some(field_id) = queue.pop_front() {
            if !expanded.insert(field_id) {
                continue;
            }
            for dependent in self.dependents_of(field_id) {
                if self.computed_set.contains(dependent) {
                    reached.insert(dependent.clone());
                }
                queue.push_back(dependent.as_str());
            }
        }

        self.order_subset(&reached)
    }

    /// `roots` themselves plus everything they affect, in evaluation order
    pub fn closure_of(&self, roots: &[FieldId]) -> Result<Vec<FieldId>, GraphError> {
        let mut set: HashSet<FieldId> = self.affected_fields(roots)?.into_iter().collect();
        set.extend(
            roots
                .iter()
                .filter(|id| self.computed_set.contains(id.as_str()))
                .cloned(),
        );
        self.order_subset(&set)
    }

    /// Topologically order a subset of the computed fields
    pub fn order_subset(&self, subset: &HashSet<FieldId>) -> Result<Vec<FieldId>, GraphError> {
        if subset.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<TopologicalItem> = self
            .computed
            .iter()
            .filter(|id| subset.contains(*id))
            .map(|id| TopologicalItem::new(id.clone(), self.dependencies_of(id).to_vec()))
            .collect();
        topological_sort(&items)
    }

    /// Split an evaluation order into layers with no edges inside a layer
    ///
    /// A field lands one layer after the deepest of its dependencies that
    /// appear in `ordered`. `ordered` must already respect dependencies.
    pub fn evaluation_levels(&self, ordered: &[FieldId]) -> Vec<Vec<FieldId>> {
        let mut level_of: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<FieldId>> = Vec::new();

        for id in ordered {
            let level = self
                .dependencies_of(id)
                .iter()
                .filter_map(|dep| level_of.get(dep.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(id.as_str(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(id.clone());
        }

        levels
    }
}

fn formula_references(expression: &str, evaluator: Option<&dyn ExpressionEvaluator>) -> Vec<String> {
    match evaluator.and_then(|e| e.referenced_fields(expression)) {
        Some(Ok(refs)) => refs,
        // Unparseable formulas still get conservative edges; evaluation will flag them
        Some(Err(_)) | None => scan_field_refs(expression),
    }
}
