//! Declared suite: unit descriptors plus the explicit sequential order.
//!
//! Order is configuration data. Nothing here derives position from unit
//! names; `010_clone` sorts first only if the suite says so.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{UnitDescriptor, UnitKind};
use crate::error::{Result, SeqstateError};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("name pattern compiles")
});

/// Check that `name` is safe to use as a file or directory name.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if NAME_RE.is_match(name) && !name.contains("..") {
        return Ok(());
    }
    Err(SeqstateError::InvalidName {
        what: what.to_string(),
        name: name.to_string(),
    })
}

/// Validated, immutable suite definition.
#[derive(Debug, Clone)]
pub struct Suite {
    sequential_environment: String,
    order: Vec<String>,
    positions: HashMap<String, usize>,
    units: BTreeMap<String, UnitDescriptor>,
}

impl Suite {
    /// Build a suite, checking every structural invariant up front.
    ///
    /// All violations are collected and returned together.
    pub fn new(
        sequential_environment: impl Into<String>,
        order: Vec<String>,
        units: Vec<UnitDescriptor>,
    ) -> Result<Self> {
        let sequential_environment = sequential_environment.into();
        let violations = validate_suite(&sequential_environment, &order, &units);
        if !violations.is_empty() {
            return Err(SeqstateError::InvalidSuite { violations });
        }
        let positions = order
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index))
            .collect();
        let units = units.into_iter().map(|u| (u.id.clone(), u)).collect();
        Ok(Self {
            sequential_environment,
            order,
            positions,
            units,
        })
    }

    pub fn sequential_environment(&self) -> &str {
        &self.sequential_environment
    }

    /// Sequential unit ids in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn unit(&self, id: &str) -> Option<&UnitDescriptor> {
        self.units.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&UnitDescriptor> {
        self.unit(id)
            .ok_or_else(|| SeqstateError::UnknownUnit(id.to_string()))
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitDescriptor> {
        self.units.values()
    }

    /// Position of a sequential unit in the declared order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Position used by the pollution check.
    ///
    /// Sequential units use their own position. Independent units use the
    /// highest position among their transitive sequential prerequisites, or
    /// `None` when they have no sequential ancestry.
    pub fn effective_position(&self, id: &str) -> Option<usize> {
        if let Some(position) = self.position(id) {
            return Some(position);
        }
        let mut best = None;
        let mut stack = vec![id];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(unit) = self.unit(current) else {
                continue;
            };
            for prerequisite in &unit.prerequisites {
                if let Some(position) = self.position(prerequisite) {
                    best = best.max(Some(position));
                }
                stack.push(prerequisite.as_str());
            }
        }
        best
    }

    /// Every environment name the suite declares.
    pub fn environments(&self) -> BTreeSet<&str> {
        self.units.values().map(|u| u.environment.as_str()).collect()
    }
}

/// Check semantic invariants of a suite definition:
/// - names are file-safe and unit ids unique
/// - `order` lists exactly the sequential units, once each
/// - sequential units share the sequential environment; independent units
///   each own a distinct one
/// - prerequisites exist, form no cycle, and sequential units only require
///   earlier sequential units
pub fn validate_suite(
    sequential_environment: &str,
    order: &[String],
    units: &[UnitDescriptor],
) -> Vec<String> {
    let mut errors = Vec::new();

    if validate_name("environment", sequential_environment).is_err() {
        errors.push(format!(
            "sequential environment '{sequential_environment}' is not a valid name"
        ));
    }

    let mut by_id: HashMap<&str, &UnitDescriptor> = HashMap::new();
    for unit in units {
        if validate_name("unit", &unit.id).is_err() {
            errors.push(format!("unit id '{}' is not a valid name", unit.id));
        }
        if by_id.insert(unit.id.as_str(), unit).is_some() {
            errors.push(format!("duplicate unit id '{}'", unit.id));
        }
    }

    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (index, id) in order.iter().enumerate() {
        if positions.insert(id.as_str(), index).is_some() {
            errors.push(format!("'{id}' appears more than once in the sequence order"));
        }
        match by_id.get(id.as_str()) {
            None => errors.push(format!("sequence order names unknown unit '{id}'")),
            Some(unit) if unit.kind != UnitKind::Sequential => {
                errors.push(format!("sequence order names independent unit '{id}'"));
            }
            Some(_) => {}
        }
    }

    let mut independent_envs: HashMap<&str, &str> = HashMap::new();
    for unit in units {
        match unit.kind {
            UnitKind::Sequential => {
                if !positions.contains_key(unit.id.as_str()) {
                    errors.push(format!(
                        "sequential unit '{}' is missing from the sequence order",
                        unit.id
                    ));
                }
                if unit.environment != sequential_environment {
                    errors.push(format!(
                        "sequential unit '{}' must use environment '{}' (got '{}')",
                        unit.id, sequential_environment, unit.environment
                    ));
                }
            }
            UnitKind::Independent => {
                if validate_name("environment", &unit.environment).is_err() {
                    errors.push(format!(
                        "unit '{}': environment '{}' is not a valid name",
                        unit.id, unit.environment
                    ));
                }
                if unit.environment == sequential_environment {
                    errors.push(format!(
                        "independent unit '{}' must not use the sequential environment",
                        unit.id
                    ));
                }
                if let Some(other) = independent_envs.insert(&unit.environment, &unit.id) {
                    errors.push(format!(
                        "independent units '{}' and '{}' share environment '{}'",
                        other, unit.id, unit.environment
                    ));
                }
            }
        }

        for prerequisite in &unit.prerequisites {
            let Some(required) = by_id.get(prerequisite.as_str()) else {
                errors.push(format!(
                    "unit '{}' requires unknown unit '{prerequisite}'",
                    unit.id
                ));
                continue;
            };
            if prerequisite == &unit.id {
                errors.push(format!("unit '{}' requires itself", unit.id));
                continue;
            }
            if unit.kind == UnitKind::Sequential {
                if required.kind != UnitKind::Sequential {
                    errors.push(format!(
                        "sequential unit '{}' cannot require independent unit '{prerequisite}'",
                        unit.id
                    ));
                    continue;
                }
                let own = positions.get(unit.id.as_str());
                let theirs = positions.get(prerequisite.as_str());
                if let (Some(own), Some(theirs)) = (own, theirs)
                    && theirs >= own
                {
                    errors.push(format!(
                        "sequential unit '{}' requires '{prerequisite}', which is not ordered before it",
                        unit.id
                    ));
                }
            }
        }
    }

    if let Some(cycle) = find_cycle(&by_id) {
        errors.push(format!("prerequisite cycle: {}", cycle.join(" -> ")));
    }

    errors
}

/// Depth-first search over prerequisite edges; returns the first cycle found.
fn find_cycle(units: &HashMap<&str, &UnitDescriptor>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        units: &HashMap<&'a str, &'a UnitDescriptor>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|p| p.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            None => {}
        }
        let unit: &'a UnitDescriptor = units.get(id).copied()?;
        marks.insert(id, Mark::Visiting);
        path.push(id);
        for prerequisite in &unit.prerequisites {
            if prerequisite == id {
                continue;
            }
            if let Some(cycle) = visit(prerequisite.as_str(), units, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut ids: Vec<&str> = units.keys().copied().collect();
    ids.sort_unstable();
    let mut marks = HashMap::new();
    for id in ids {
        let mut path = Vec::new();
        if let Some(cycle) = visit(id, units, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{independent, sequential, sequential_suite};

    #[test]
    fn builds_linear_suite() {
        let suite = sequential_suite(&["A", "B", "C"]);
        assert_eq!(suite.order(), ["A", "B", "C"]);
        assert_eq!(suite.position("C"), Some(2));
        assert_eq!(suite.unit("B").expect("B").prerequisites, vec!["A"]);
    }

    #[test]
    fn rejects_sequential_unit_missing_from_order() {
        let err = Suite::new(
            "seq",
            vec!["A".to_string()],
            vec![sequential("A", &[]), sequential("B", &["A"])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("'B' is missing from the sequence order"));
    }

    #[test]
    fn rejects_prerequisite_ordered_after_dependent() {
        let errors = validate_suite(
            "seq",
            &["A".to_string(), "B".to_string()],
            &[sequential("A", &["B"]), sequential("B", &[])],
        );
        assert!(errors.iter().any(|e| e.contains("not ordered before it")));
    }

    #[test]
    fn rejects_shared_independent_environment() {
        let errors = validate_suite(
            "seq",
            &[],
            &[independent("X", "docs", &[]), independent("Y", "docs", &[])],
        );
        assert!(errors.iter().any(|e| e.contains("share environment 'docs'")));
    }

    #[test]
    fn rejects_independent_unit_in_sequential_environment() {
        let errors = validate_suite("seq", &[], &[independent("X", "seq", &[])]);
        assert!(errors.iter().any(|e| e.contains("must not use the sequential environment")));
    }

    #[test]
    fn reports_independent_cycle() {
        let errors = validate_suite(
            "seq",
            &[],
            &[independent("X", "x", &["Y"]), independent("Y", "y", &["X"])],
        );
        assert!(errors.iter().any(|e| e.starts_with("prerequisite cycle: X -> Y -> X")));
    }

    #[test]
    fn rejects_unknown_prerequisite_and_bad_names() {
        let errors = validate_suite("seq", &[], &[independent("../x", "x", &["ghost"])]);
        assert!(errors.iter().any(|e| e.contains("not a valid name")));
        assert!(errors.iter().any(|e| e.contains("unknown unit 'ghost'")));
    }

    #[test]
    fn independent_position_follows_deepest_sequential_ancestor() {
        let suite = Suite::new(
            "seq",
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            vec![
                sequential("A", &[]),
                sequential("B", &["A"]),
                sequential("C", &["B"]),
                independent("X", "x", &["Y", "A"]),
                independent("Y", "y", &["B"]),
                independent("Z", "z", &[]),
            ],
        )
        .expect("suite");
        assert_eq!(suite.effective_position("X"), Some(1));
        assert_eq!(suite.effective_position("Z"), None);
        assert_eq!(suite.effective_position("C"), Some(2));
    }
}
