//! Dependency resolution.
//!
//! [`resolve`] turns a set of candidate descriptors into a load order. It is a
//! pure function: failures never surface as errors, they come back as data in
//! [`ResolutionResult`] keyed by plugin id.
//!
//! Checks, in order:
//!
//! 1. duplicate ids in the input (every copy is rejected)
//! 2. API major version against [`RUNTIME_API_VERSION`]
//! 3. conflicts, missing or mismatched dependencies, and dependencies that
//!    were themselves rejected, iterated until nothing changes
//! 4. cycles among required dependencies
//!
//! Survivors are ordered with Kahn's algorithm. Ready nodes are taken in
//! manifest-id order so the same input always produces the same order.

use crate::discovery::PluginDescriptor;
use crate::manifest::{DependencyKind, DependencySpec};
use crate::version::{is_api_compatible, satisfies, RUNTIME_API_VERSION};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::fmt;

/// Machine-readable reason a plugin was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticCode {
    #[serde(rename = "DEP_DUPLICATE_ID")]
    DuplicateId,
    #[serde(rename = "DEP_API_INCOMPATIBLE")]
    ApiIncompatible,
    #[serde(rename = "DEP_CONFLICT")]
    Conflict,
    #[serde(rename = "DEP_REQUIRED_MISSING")]
    RequiredMissing,
    #[serde(rename = "DEP_REQUIRED_VERSION_MISMATCH")]
    RequiredVersionMismatch,
    #[serde(rename = "DEP_OPTIONAL_VERSION_MISMATCH")]
    OptionalVersionMismatch,
    #[serde(rename = "DEP_REQUIRED_UNRESOLVED")]
    RequiredUnresolved,
    #[serde(rename = "DEP_REQUIRED_CYCLE")]
    RequiredCycle,
}

impl DiagnosticCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::DuplicateId => "DEP_DUPLICATE_ID",
            DiagnosticCode::ApiIncompatible => "DEP_API_INCOMPATIBLE",
            DiagnosticCode::Conflict => "DEP_CONFLICT",
            DiagnosticCode::RequiredMissing => "DEP_REQUIRED_MISSING",
            DiagnosticCode::RequiredVersionMismatch => "DEP_REQUIRED_VERSION_MISMATCH",
            DiagnosticCode::OptionalVersionMismatch => "DEP_OPTIONAL_VERSION_MISMATCH",
            DiagnosticCode::RequiredUnresolved => "DEP_REQUIRED_UNRESOLVED",
            DiagnosticCode::RequiredCycle => "DEP_REQUIRED_CYCLE",
        }
    }

    fn is_version_mismatch(&self) -> bool {
        matches!(
            self,
            DiagnosticCode::RequiredVersionMismatch | DiagnosticCode::OptionalVersionMismatch
        )
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one plugin was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyDiagnostic {
    pub code: DiagnosticCode,
    pub message: String,
    /// Edge chain leading to the root cause, outermost first.
    pub causes: Vec<String>,
}

impl DependencyDiagnostic {
    fn new(code: DiagnosticCode, message: String, causes: Vec<String>) -> Self {
        Self {
            code,
            message,
            causes,
        }
    }
}

/// Outcome of a resolution pass.
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    /// Accepted descriptors, dependencies before dependents.
    pub ordered: Vec<PluginDescriptor>,
    /// Rejection message per plugin id.
    pub rejected: BTreeMap<String, String>,
    /// Version mismatch messages per plugin id (also present in `rejected`).
    pub version_mismatches: BTreeMap<String, String>,
    /// `"compatible"` or `"incompatible (plugin=.., runtime=..)"` per plugin id.
    pub api_compatibility: BTreeMap<String, String>,
    /// Structured rejection detail per plugin id.
    pub diagnostics: BTreeMap<String, DependencyDiagnostic>,
}

impl ResolutionResult {
    /// Ids in load order.
    pub fn ordered_ids(&self) -> Vec<String> {
        self.ordered.iter().map(|d| d.id().to_string()).collect()
    }

    pub fn is_rejected(&self, id: &str) -> bool {
        self.rejected.contains_key(id)
    }
}

/// Resolve `descriptors` into a load order.
///
/// `externally_available` maps ids of plugins that are already running (and
/// not part of this call) to their versions. They satisfy dependencies but are
/// never ordered or re-checked.
pub fn resolve(
    descriptors: &[PluginDescriptor],
    externally_available: &HashMap<String, String>,
) -> ResolutionResult {
    let mut diagnostics: BTreeMap<String, DependencyDiagnostic> = BTreeMap::new();
    let mut api_compatibility = BTreeMap::new();

    let mut grouped: BTreeMap<&str, Vec<&PluginDescriptor>> = BTreeMap::new();
    for descriptor in descriptors {
        grouped.entry(descriptor.id()).or_default().push(descriptor);
    }

    let mut working: BTreeMap<String, &PluginDescriptor> = BTreeMap::new();
    for (id, copies) in grouped {
        if copies.len() > 1 {
            diagnostics.insert(
                id.to_string(),
                DependencyDiagnostic::new(
                    DiagnosticCode::DuplicateId,
                    format!("Duplicate plugin id '{id}'"),
                    Vec::new(),
                ),
            );
            continue;
        }
        working.insert(id.to_string(), copies[0]);
    }

    for (id, descriptor) in &working {
        let api = descriptor.manifest.api_version.as_str();
        if is_api_compatible(api) {
            api_compatibility.insert(id.clone(), "compatible".to_string());
        } else {
            api_compatibility.insert(
                id.clone(),
                format!("incompatible (plugin={api}, runtime={RUNTIME_API_VERSION})"),
            );
            diagnostics.insert(
                id.clone(),
                DependencyDiagnostic::new(
                    DiagnosticCode::ApiIncompatible,
                    format!("Incompatible apiVersion: plugin={api} runtime={RUNTIME_API_VERSION}"),
                    Vec::new(),
                ),
            );
        }
    }
    working.retain(|id, _| !diagnostics.contains_key(id));

    loop {
        let versions: HashMap<&str, &str> = working
            .iter()
            .map(|(id, d)| (id.as_str(), d.version()))
            .collect();

        let mut newly_rejected = Vec::new();
        for (id, descriptor) in &working {
            if let Some(issue) =
                check_descriptor(descriptor, &versions, externally_available, &diagnostics)
            {
                newly_rejected.push((id.clone(), issue));
            }
        }

        if newly_rejected.is_empty() {
            break;
        }
        for (id, issue) in newly_rejected {
            working.remove(&id);
            diagnostics.insert(id, issue);
        }
    }

    reject_cycles(&mut working, &mut diagnostics);

    let order = order_with_hints(&working);
    let ordered = order
        .iter()
        .filter_map(|id| working.get(id).map(|d| (*d).clone()))
        .collect();

    let version_mismatches = diagnostics
        .iter()
        .filter(|(_, d)| d.code.is_version_mismatch())
        .map(|(id, d)| (id.clone(), d.message.clone()))
        .collect();
    let rejected = diagnostics
        .iter()
        .map(|(id, d)| (id.clone(), d.message.clone()))
        .collect();

    ResolutionResult {
        ordered,
        rejected,
        version_mismatches,
        api_compatibility,
        diagnostics,
    }
}

fn check_descriptor(
    descriptor: &PluginDescriptor,
    versions: &HashMap<&str, &str>,
    externally_available: &HashMap<String, String>,
    diagnostics: &BTreeMap<String, DependencyDiagnostic>,
) -> Option<DependencyDiagnostic> {
    let manifest = &descriptor.manifest;
    let version_of = |id: &str| available_version(id, versions, externally_available);

    if let Some(conflict) = manifest
        .dependencies_of(DependencyKind::Conflicts)
        .find(|d| version_of(&d.id).is_some_and(|v| satisfies(v, d.version.as_deref())))
    {
        return Some(DependencyDiagnostic::new(
            DiagnosticCode::Conflict,
            format!(
                "Conflict detected: '{}' conflicts with '{}'",
                manifest.id, conflict.id
            ),
            vec![format!("{} conflicts {}", manifest.id, conflict.id)],
        ));
    }

    for dependency in manifest.dependencies_of(DependencyKind::Required) {
        if let Some(issue) = diagnostics.get(&dependency.id) {
            let mut causes = vec![format!("{} -> {} [{}]", manifest.id, dependency.id, issue.code)];
            causes.extend(issue.causes.iter().cloned());
            return Some(DependencyDiagnostic::new(
                DiagnosticCode::RequiredUnresolved,
                format!(
                    "Required dependency '{}' is unresolved: {}",
                    dependency.id,
                    root_cause(&dependency.id, diagnostics)
                ),
                causes,
            ));
        }

        let Some(found) = version_of(&dependency.id) else {
            return Some(DependencyDiagnostic::new(
                DiagnosticCode::RequiredMissing,
                format!("Missing required dependency '{}'", dependency.id),
                vec![format!("{} -> {}", manifest.id, dependency.id)],
            ));
        };

        if !satisfies(found, dependency.version.as_deref()) {
            return Some(mismatch(
                DiagnosticCode::RequiredVersionMismatch,
                &manifest.id,
                dependency,
                found,
            ));
        }
    }

    for dependency in manifest.dependencies_of(DependencyKind::Optional) {
        if let Some(found) = version_of(&dependency.id) {
            if !satisfies(found, dependency.version.as_deref()) {
                return Some(mismatch(
                    DiagnosticCode::OptionalVersionMismatch,
                    &manifest.id,
                    dependency,
                    found,
                ));
            }
        }
    }

    None
}

fn available_version<'a>(
    id: &str,
    versions: &HashMap<&str, &'a str>,
    externally_available: &'a HashMap<String, String>,
) -> Option<&'a str> {
    versions
        .get(id)
        .copied()
        .or_else(|| externally_available.get(id).map(String::as_str))
}

fn mismatch(
    code: DiagnosticCode,
    plugin: &str,
    dependency: &DependencySpec,
    found: &str,
) -> DependencyDiagnostic {
    let range = dependency.version.as_deref().unwrap_or("*");
    DependencyDiagnostic::new(
        code,
        format!(
            "Dependency version mismatch: {} requires '{}', found '{}'",
            dependency.id, range, found
        ),
        vec![format!("{} -> {}@{}", plugin, dependency.id, range)],
    )
}

/// Follow `DEP_REQUIRED_UNRESOLVED` links down to the plugin that actually failed.
fn root_cause(id: &str, diagnostics: &BTreeMap<String, DependencyDiagnostic>) -> String {
    let mut current = id.to_string();
    let mut visited = BTreeSet::new();
    while visited.insert(current.clone()) {
        let Some(issue) = diagnostics.get(&current) else {
            break;
        };
        if issue.code != DiagnosticCode::RequiredUnresolved {
            return format!("root cause '{}' ({})", current, issue.code);
        }
        let next = issue
            .causes
            .first()
            .and_then(|edge| edge.split(" -> ").nth(1))
            .and_then(|rest| rest.split_whitespace().next());
        match next {
            Some(next) => current = next.to_string(),
            None => break,
        }
    }
    format!("root cause '{current}'")
}

type Edges = BTreeMap<String, BTreeSet<String>>;

/// Edges run from dependency to dependent, restricted to `working`.
fn build_edges(working: &BTreeMap<String, &PluginDescriptor>, kinds: &[DependencyKind]) -> Edges {
    let mut outgoing: Edges = working.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
    for (id, descriptor) in working {
        for dependency in &descriptor.manifest.dependencies {
            if !kinds.contains(&dependency.kind) {
                continue;
            }
            if let Some(dependents) = outgoing.get_mut(&dependency.id) {
                dependents.insert(id.clone());
            }
        }
    }
    outgoing
}

/// Kahn's algorithm with a min-heap on id. Returns the order and the ids that
/// could not be ordered.
fn topological_sort(ids: &BTreeSet<String>, outgoing: &Edges) -> (Vec<String>, BTreeSet<String>) {
    let mut in_degree: BTreeMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    for dependents in outgoing.values() {
        for dependent in dependents {
            if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<&str>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut ordered = Vec::with_capacity(ids.len());
    while let Some(Reverse(id)) = ready.pop() {
        ordered.push(id.to_string());
        if let Some(dependents) = outgoing.get(id) {
            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(dependent.as_str()));
                    }
                }
            }
        }
    }

    let placed: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
    let unresolved = ids
        .iter()
        .filter(|id| !placed.contains(id.as_str()))
        .cloned()
        .collect();
    (ordered, unresolved)
}

/// Reject every plugin left over by a topological sort of required edges.
/// Nodes that sit on a cycle get `DEP_REQUIRED_CYCLE`; nodes that merely
/// depend on one get `DEP_REQUIRED_UNRESOLVED`.
fn reject_cycles(
    working: &mut BTreeMap<String, &PluginDescriptor>,
    diagnostics: &mut BTreeMap<String, DependencyDiagnostic>,
) {
    let ids: BTreeSet<String> = working.keys().cloned().collect();
    let edges = build_edges(working, &[DependencyKind::Required]);
    let (_, unresolved) = topological_sort(&ids, &edges);
    if unresolved.is_empty() {
        return;
    }

    let on_cycle: BTreeSet<String> = unresolved
        .iter()
        .filter(|id| reaches_itself(id, &edges, &unresolved))
        .cloned()
        .collect();

    for id in &on_cycle {
        let causes: Vec<String> = edges
            .iter()
            .filter(|(from, dependents)| dependents.contains(id) && on_cycle.contains(*from))
            .map(|(from, _)| format!("{from} -> {id}"))
            .collect();
        diagnostics.insert(
            id.clone(),
            DependencyDiagnostic::new(
                DiagnosticCode::RequiredCycle,
                "Dependency cycle detected among required dependencies".to_string(),
                causes,
            ),
        );
    }

    for id in unresolved.iter().filter(|id| !on_cycle.contains(*id)) {
        let blocker = edges
            .iter()
            .find(|(from, dependents)| dependents.contains(id) && unresolved.contains(*from))
            .map(|(from, _)| from.clone())
            .unwrap_or_default();
        diagnostics.insert(
            id.clone(),
            DependencyDiagnostic::new(
                DiagnosticCode::RequiredUnresolved,
                format!("Required dependency '{blocker}' is unresolved: it depends on a dependency cycle"),
                vec![format!("{id} -> {blocker} [{}]", DiagnosticCode::RequiredCycle)],
            ),
        );
    }

    working.retain(|id, _| !unresolved.contains(id));
}

fn reaches_itself(start: &str, edges: &Edges, within: &BTreeSet<String>) -> bool {
    let mut stack: Vec<&str> = vec![start];
    let mut visited = BTreeSet::new();
    while let Some(node) = stack.pop() {
        let Some(next) = edges.get(node) else { continue };
        for dependent in next.iter().filter(|d| within.contains(*d)) {
            if dependent == start {
                return true;
            }
            if visited.insert(dependent.as_str()) {
                stack.push(dependent.as_str());
            }
        }
    }
    false
}

/// Order acyclic survivors. Optional and soft-after edges are honoured when
/// they keep the graph acyclic, dropped otherwise (soft-after first).
fn order_with_hints(working: &BTreeMap<String, &PluginDescriptor>) -> Vec<String> {
    let ids: BTreeSet<String> = working.keys().cloned().collect();
    let attempts: [&[DependencyKind]; 3] = [
        &[
            DependencyKind::Required,
            DependencyKind::Optional,
            DependencyKind::SoftAfter,
        ],
        &[DependencyKind::Required, DependencyKind::Optional],
        &[DependencyKind::Required],
    ];

    for kinds in attempts {
        let (ordered, unresolved) = topological_sort(&ids, &build_edges(working, kinds));
        if unresolved.is_empty() {
            return ordered;
        }
    }
    // Required edges are acyclic once reject_cycles has run.
    topological_sort(&ids, &build_edges(working, &[DependencyKind::Required])).0
}
