use crate::error::{FanoutError, FanoutResult};
use crate::target::TargetData;
use crate::util::deep_merge;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Valid group names
#[allow(clippy::unwrap_used)]
static GROUP_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\A[a-z0-9_]+\z").unwrap());

/// Target aliases: a single name or a list of names
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Aliases {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl Aliases {
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::One(alias) => vec![alias.clone()],
            Self::Many(aliases) => aliases.clone(),
        }
    }
}

/// Inline target definition inside a group
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TargetDefinition {
    pub name: Option<String>,
    pub uri: Option<String>,
    pub alias: Aliases,
    pub config: Map<String, Value>,
    pub vars: Map<String, Value>,
    pub facts: Map<String, Value>,
    pub features: Vec<String>,
}

impl TargetDefinition {
    /// Definition for a bare target name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Name the target is known by: its name, else its URI
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.name.as_deref().or(self.uri.as_deref())
    }

    pub(crate) fn data(&self) -> TargetData {
        TargetData {
            config: self.config.clone(),
            vars: self.vars.clone(),
            facts: self.facts.clone(),
            features: self.features.clone(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTarget {
    Name(String),
    Definition(TargetDefinition),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGroup {
    name: Option<String>,
    #[serde(alias = "nodes")]
    targets: Vec<RawTarget>,
    groups: Vec<RawGroup>,
    config: Map<String, Value>,
    vars: Map<String, Value>,
    facts: Map<String, Value>,
    features: Vec<String>,
}

/// A named node in the inventory tree
#[derive(Debug, Clone, Default)]
pub struct Group {
    name: Option<String>,
    targets: Vec<TargetDefinition>,
    groups: Vec<Group>,
    config: Map<String, Value>,
    vars: Map<String, Value>,
    facts: Map<String, Value>,
    features: Vec<String>,
}

impl Group {
    /// Build a group tree from inventory data
    ///
    /// # Errors
    ///
    /// Returns a validation error if the data does not have the group shape
    pub fn from_value(data: Value) -> FanoutResult<Self> {
        let raw: RawGroup = serde_json::from_value(data).map_err(|e| {
            FanoutError::validation(format!("Invalid inventory data: {e}"), None)
        })?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawGroup) -> Self {
        let mut targets: Vec<TargetDefinition> = Vec::with_capacity(raw.targets.len());
        for entry in raw.targets {
            let definition = match entry {
                RawTarget::Name(name) => TargetDefinition::named(name),
                RawTarget::Definition(definition) => definition,
            };
            let duplicate = definition.key().is_some()
                && targets.iter().any(|t| t.key() == definition.key());
            if duplicate {
                warn!(
                    "Ignoring duplicate target in {}: {:?}",
                    raw.name.as_deref().unwrap_or("<unnamed>"),
                    definition.key()
                );
            } else {
                targets.push(definition);
            }
        }

        Self {
            name: raw.name,
            targets,
            groups: raw.groups.into_iter().map(Self::from_raw).collect(),
            config: raw.config,
            vars: raw.vars,
            facts: raw.facts,
            features: raw.features,
        }
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    #[must_use]
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    #[must_use]
    pub fn local_targets(&self) -> &[TargetDefinition] {
        &self.targets
    }

    /// Check names across the tree
    ///
    /// # Errors
    ///
    /// Returns a validation error for unnamed, badly named or duplicated groups,
    /// target entries without a name, and group/target name clashes
    pub fn validate(
        &self,
        used_names: &mut HashSet<String>,
        target_names: &mut HashSet<String>,
    ) -> FanoutResult<()> {
        let name = self
            .name
            .as_deref()
            .ok_or_else(|| FanoutError::validation("Group does not have a name", None))?;

        if used_names.contains(name) {
            return Err(FanoutError::validation(
                format!("Tried to redefine group {name}"),
                Some(name),
            ));
        }
        if !GROUP_NAME.is_match(name) {
            return Err(FanoutError::validation(
                format!("Invalid group name {name}"),
                Some(name),
            ));
        }
        if target_names.contains(name) {
            return Err(FanoutError::validation(
                format!("Group {name} conflicts with target of the same name"),
                Some(name),
            ));
        }
        used_names.insert(name.to_string());

        for target in &self.targets {
            let target_name = target.key().ok_or_else(|| {
                FanoutError::validation("Target entry does not have a name or uri", Some(name))
            })?;
            if used_names.contains(target_name) {
                return Err(FanoutError::validation(
                    format!("Group {target_name} conflicts with target of the same name"),
                    Some(target_name),
                ));
            }
            target_names.insert(target_name.to_string());
        }

        for group in &self.groups {
            group
                .validate(used_names, target_names)
                .map_err(|e| e.add_parent(name))?;
        }

        Ok(())
    }

    /// Resolved data for a target: group data overlaid by target data
    #[must_use]
    pub fn data_for(&self, target_name: &str) -> Option<TargetData> {
        merge_data(
            self.group_collect(target_name),
            self.target_collect(target_name),
        )
    }

    /// Data from this group and every descendant group containing the target
    ///
    /// Children override this group; among siblings the first declared wins.
    #[must_use]
    pub fn group_collect(&self, target_name: &str) -> Option<TargetData> {
        let mut collected = None;
        for group in &self.groups {
            if let Some(data) = group.data_for(target_name) {
                collected = merge_data(Some(data), collected);
            }
        }

        match collected {
            Some(data) => merge_data(Some(self.group_data()), Some(data)),
            None if self.contains_local(target_name) => Some(self.group_data()),
            None => None,
        }
    }

    /// Data from the target's own inline definitions
    ///
    /// Deeper definitions override shallower ones; among siblings the first
    /// declared wins.
    #[must_use]
    pub fn target_collect(&self, target_name: &str) -> Option<TargetData> {
        let mut collected = None;
        for group in &self.groups {
            if let Some(data) = group.target_collect(target_name) {
                collected = merge_data(Some(data), collected);
            }
        }
        merge_data(self.local_target_data(target_name), collected)
    }

    fn local_target_data(&self, target_name: &str) -> Option<TargetData> {
        self.local_definition(target_name).map(TargetDefinition::data)
    }

    fn local_definition(&self, target_name: &str) -> Option<&TargetDefinition> {
        self.targets
            .iter()
            .find(|t| t.key() == Some(target_name))
    }

    fn contains_local(&self, target_name: &str) -> bool {
        self.local_definition(target_name).is_some()
    }

    pub(crate) fn group_data(&self) -> TargetData {
        TargetData {
            config: self.config.clone(),
            vars: self.vars.clone(),
            facts: self.facts.clone(),
            features: self.features.clone(),
            groups: vec![self.name().to_string()],
        }
    }

    /// First definition of a target anywhere in the tree
    #[must_use]
    pub fn find_definition(&self, target_name: &str) -> Option<&TargetDefinition> {
        self.local_definition(target_name).or_else(|| {
            self.groups
                .iter()
                .find_map(|g| g.find_definition(target_name))
        })
    }

    /// Every target name in this group and its subgroups, in declaration order
    #[must_use]
    pub fn all_target_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        self.collect_target_names(&mut names, &mut seen);
        names
    }

    fn collect_target_names(&self, names: &mut Vec<String>, seen: &mut HashSet<String>) {
        for key in self.targets.iter().filter_map(TargetDefinition::key) {
            if seen.insert(key.to_string()) {
                names.push(key.to_string());
            }
        }
        for group in &self.groups {
            group.collect_target_names(names, seen);
        }
    }

    /// Mapping of alias to target name across the tree
    #[must_use]
    pub fn target_aliases(&self) -> HashMap<String, String> {
        let mut aliases = HashMap::new();
        self.collect_aliases(&mut aliases);
        aliases
    }

    fn collect_aliases(&self, aliases: &mut HashMap<String, String>) {
        for target in &self.targets {
            if let Some(key) = target.key() {
                for alias in target.alias.to_vec() {
                    aliases.entry(alias).or_insert_with(|| key.to_string());
                }
            }
        }
        for group in &self.groups {
            group.collect_aliases(aliases);
        }
    }

    /// Names of this group and every descendant, pre-order
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        let mut names = vec![self.name().to_string()];
        for group in &self.groups {
            names.extend(group.group_names());
        }
        names
    }

    /// Find a group by name anywhere in the tree
    #[must_use]
    pub fn find_group(&self, name: &str) -> Option<&Group> {
        if self.name() == name {
            return Some(self);
        }
        self.groups.iter().find_map(|g| g.find_group(name))
    }

    pub(crate) fn find_group_mut(&mut self, name: &str) -> Option<&mut Group> {
        if self.name() == name {
            return Some(self);
        }
        self.groups.iter_mut().find_map(|g| g.find_group_mut(name))
    }

    /// Append a target definition unless the group already lists it
    pub(crate) fn add_target(&mut self, definition: TargetDefinition) -> bool {
        if definition.key().is_some_and(|key| self.contains_local(key)) {
            return false;
        }
        self.targets.push(definition);
        true
    }

    /// Replace the local definition of a target, appending it when absent
    pub(crate) fn replace_target(&mut self, definition: TargetDefinition) {
        match self
            .targets
            .iter_mut()
            .find(|t| t.key().is_some() && t.key() == definition.key())
        {
            Some(existing) => *existing = definition,
            None => self.targets.push(definition),
        }
    }
}

/// Merge two optional data sets, `overlay` wins
pub(crate) fn merge_data(base: Option<TargetData>, overlay: Option<TargetData>) -> Option<TargetData> {
    match (base, overlay) {
        (Some(base), Some(overlay)) => Some(merge(base, overlay)),
        (base, overlay) => overlay.or(base),
    }
}

fn merge(base: TargetData, overlay: TargetData) -> TargetData {
    // vars are replaced key by key, not deep-merged
    let mut vars = base.vars;
    vars.extend(overlay.vars);

    let mut features = base.features;
    for feature in overlay.features {
        if !features.contains(&feature) {
            features.push(feature);
        }
    }

    let mut groups = overlay.groups;
    groups.extend(base.groups);

    TargetData {
        config: deep_merge(&base.config, &overlay.config),
        vars,
        facts: deep_merge(&base.facts, &overlay.facts),
        features,
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group(data: Value) -> Group {
        Group::from_value(data).unwrap()
    }

    fn validate(group: &Group) -> FanoutResult<()> {
        group.validate(&mut HashSet::new(), &mut HashSet::new())
    }

    #[test]
    fn test_bare_string_target_has_empty_config() {
        let g = group(json!({"name": "all", "targets": ["node1"]}));
        let data = g.data_for("node1").unwrap();
        assert!(data.config.is_empty());
        assert_eq!(data.groups, vec!["all"]);
    }

    #[test]
    fn test_unknown_target_has_no_data() {
        let g = group(json!({"name": "all", "targets": ["node1"]}));
        assert!(g.data_for("node2").is_none());
    }

    #[test]
    fn test_nodes_key_is_accepted() {
        let g = group(json!({"name": "all", "nodes": ["node1", {"name": "node2"}]}));
        assert_eq!(g.all_target_names(), vec!["node1", "node2"]);
    }

    #[test]
    fn test_duplicate_targets_are_ignored() {
        let g = group(json!({"name": "all", "targets": ["node1", "node1"]}));
        assert_eq!(g.local_targets().len(), 1);
    }

    #[test]
    fn test_validate_unnamed_group() {
        let g = group(json!({"name": "all", "groups": [{"targets": ["a"]}]}));
        let err = validate(&g).unwrap_err();
        assert_eq!(err.to_string(), "Group does not have a name for group at [\"all\"]");
    }

    #[test]
    fn test_validate_duplicate_group() {
        let g = group(json!({
            "name": "all",
            "groups": [
                {"name": "web", "groups": [{"name": "db"}]},
                {"name": "db"}
            ]
        }));
        let err = validate(&g).unwrap_err();
        assert!(err.to_string().starts_with("Tried to redefine group db"));
    }

    #[test]
    fn test_validate_invalid_group_name() {
        let g = group(json!({"name": "all", "groups": [{"name": "Web-Servers"}]}));
        let err = validate(&g).unwrap_err();
        assert!(err.to_string().contains("Invalid group name Web-Servers"));
    }

    #[test]
    fn test_validate_group_target_conflict() {
        let g = group(json!({
            "name": "all",
            "targets": ["web"],
            "groups": [{"name": "web"}]
        }));
        let err = validate(&g).unwrap_err();
        assert!(err.to_string().contains("conflicts with target of the same name"));
    }

    #[test]
    fn test_features_union_and_vars_shallow() {
        let g = group(json!({
            "name": "all",
            "features": ["puppet-agent"],
            "vars": {"settings": {"a": 1, "b": 2}},
            "groups": [{
                "name": "web",
                "features": ["puppet-agent", "docker"],
                "vars": {"settings": {"a": 3}},
                "targets": ["node1"]
            }]
        }));
        let data = g.data_for("node1").unwrap();
        assert_eq!(data.features, vec!["puppet-agent", "docker"]);
        assert_eq!(Value::Object(data.vars), json!({"settings": {"a": 3}}));
        assert_eq!(data.groups, vec!["web", "all"]);
    }

    #[test]
    fn test_aliases() {
        let g = group(json!({
            "name": "all",
            "targets": [{"name": "node1", "alias": "one"}, {"uri": "ssh://node2", "alias": ["two", "deux"]}]
        }));
        let aliases = g.target_aliases();
        assert_eq!(aliases["one"], "node1");
        assert_eq!(aliases["deux"], "ssh://node2");
    }
}
