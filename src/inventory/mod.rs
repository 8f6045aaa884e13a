//! Group/target inventory and per-target config resolution

mod group;

pub use group::{Aliases, Group, TargetDefinition};

use crate::error::{FanoutError, FanoutResult};
use crate::target::{Target, TargetData, TransportKind};
use group::merge_data;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Name of the root group
pub const ROOT_GROUP: &str = "all";

/// Only inventory format understood
const INVENTORY_VERSION: u64 = 2;

/// Separators between names in a target spec
#[allow(clippy::unwrap_used)]
static TARGET_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s,]+").unwrap());

/// Inventory of groups and targets
///
/// Built once from static data. Targets are materialized on first lookup and
/// cached, so later plan-driven additions never change a target that has
/// already been handed out.
#[derive(Debug, Clone)]
pub struct Inventory {
    root: Group,
    targets: HashMap<String, Target>,
    default_transport: TransportKind,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::empty()
    }
}

impl Inventory {
    /// Inventory with only the empty `all` group
    #[must_use]
    pub fn empty() -> Self {
        let mut root = Group::default();
        root.set_name(ROOT_GROUP);
        Self {
            root,
            targets: HashMap::new(),
            default_transport: TransportKind::Ssh,
        }
    }

    /// Build an inventory from a structured document
    ///
    /// The document is the `all` group; its `name` key, if any, is ignored.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unsupported version or malformed data
    pub fn from_value(data: Value) -> FanoutResult<Self> {
        let data = match data {
            Value::Null => return Ok(Self::empty()),
            Value::Object(mut map) => {
                check_version(map.remove("version"))?;
                map.remove("name");
                Value::Object(map)
            }
            other => {
                return Err(FanoutError::validation(
                    format!("Inventory must be a mapping, got {other}"),
                    None,
                ))
            }
        };

        let mut root = Group::from_value(data)?;
        root.set_name(ROOT_GROUP);
        debug!(
            "Loaded inventory with {} groups and {} targets",
            root.group_names().len(),
            root.all_target_names().len()
        );

        Ok(Self {
            root,
            targets: HashMap::new(),
            default_transport: TransportKind::Ssh,
        })
    }

    /// Parse an inventory from YAML (or JSON) text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid YAML or not a valid inventory
    pub fn from_yaml_str(text: &str) -> FanoutResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::empty());
        }
        let data: Value = serde_yaml::from_str(text)?;
        Self::from_value(data)
    }

    /// Load an inventory file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> FanoutResult<Self> {
        let path = path.as_ref();
        debug!("Loading inventory from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Transport used by targets that do not pick one themselves
    #[must_use]
    pub fn with_default_transport(mut self, transport: TransportKind) -> Self {
        self.default_transport = transport;
        self
    }

    #[must_use]
    pub fn default_transport(&self) -> TransportKind {
        self.default_transport
    }

    #[must_use]
    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Check the structure of the group tree
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first problem found
    pub fn validate(&self) -> FanoutResult<()> {
        self.root
            .validate(&mut HashSet::new(), &mut HashSet::new())
    }

    /// Effective config for a target, `None` if the inventory does not know it
    #[must_use]
    pub fn config_for(&self, target_name: &str) -> Option<Map<String, Value>> {
        self.data_for(target_name).map(|data| data.config)
    }

    /// Effective config, vars, facts, features and groups for a target
    #[must_use]
    pub fn data_for(&self, target_name: &str) -> Option<TargetData> {
        self.root.data_for(target_name)
    }

    /// Every group name, root first
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        self.root.group_names()
    }

    /// Every target name in declaration order
    #[must_use]
    pub fn target_names(&self) -> Vec<String> {
        self.root.all_target_names()
    }

    /// Resolve a target spec into targets
    ///
    /// The spec is a comma or whitespace separated list of group names, target
    /// names, aliases and wildcard patterns. Names the inventory does not know
    /// become ad-hoc targets.
    ///
    /// # Errors
    ///
    /// Returns a wildcard error if a pattern matches nothing
    pub fn get_targets(&mut self, spec: &str) -> FanoutResult<Vec<Target>> {
        let mut names = Vec::new();
        for part in TARGET_SEPARATOR.split(spec).filter(|part| !part.is_empty()) {
            names.extend(self.resolve_name(part)?);
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let target = self.materialize(&name)?;
            if seen.insert(target.name().to_string()) {
                targets.push(target);
            }
        }
        Ok(targets)
    }

    /// Resolve a spec that must name exactly one target
    ///
    /// # Errors
    ///
    /// Returns a validation error if the spec refers to zero or several targets
    pub fn get_target(&mut self, spec: &str) -> FanoutResult<Target> {
        let mut targets = self.get_targets(spec)?;
        match targets.len() {
            1 => Ok(targets.remove(0)),
            0 => Err(FanoutError::validation(
                format!("'{spec}' does not refer to any targets"),
                None,
            )),
            n => Err(FanoutError::validation(
                format!("'{spec}' refers to {n} targets"),
                None,
            )),
        }
    }

    /// Add targets to an existing group
    ///
    /// Targets that were already materialized keep their resolved data.
    ///
    /// # Errors
    ///
    /// Returns an error if the group does not exist
    pub fn add_to_group(&mut self, targets: &[Target], group_name: &str) -> FanoutResult<()> {
        let group = self
            .root
            .find_group_mut(group_name)
            .ok_or_else(|| FanoutError::UnknownGroup(group_name.to_string()))?;

        for target in targets {
            let mut definition = TargetDefinition::named(target.name());
            if target.uri() != target.name() {
                definition.uri = Some(target.uri().to_string());
            }
            if group.add_target(definition) {
                debug!("Added {} to group {}", target.name(), group_name);
            }
            self.targets
                .entry(target.name().to_string())
                .or_insert_with(|| target.clone());
        }
        Ok(())
    }

    /// Create a target from a plan-supplied definition and add it to `all`
    ///
    /// The new target replaces any materialized target of the same name. Only
    /// group data applies to it, not other inline definitions of the name.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed data or name conflicts
    pub fn create_target(&mut self, data: Value) -> FanoutResult<Target> {
        let definition: TargetDefinition = serde_json::from_value(data).map_err(|e| {
            FanoutError::validation(format!("Invalid target definition: {e}"), None)
        })?;
        let name = definition
            .key()
            .ok_or_else(|| {
                FanoutError::validation("Target must have either a name or uri", None)
            })?
            .to_string();
        self.validate_new_target(&name, &definition.alias.to_vec())?;

        self.root.replace_target(definition.clone());

        let group_data = self.root.group_collect(&name);
        let data = merge_data(group_data, Some(definition.data())).unwrap_or_default();
        let target = Target::from_data(
            name.clone(),
            definition.uri.clone(),
            definition.alias.to_vec(),
            data,
            self.default_transport,
        )?;

        debug!("Created target {}", name);
        self.targets.insert(name, target.clone());
        Ok(target)
    }

    fn validate_new_target(&self, name: &str, aliases: &[String]) -> FanoutResult<()> {
        let groups: HashSet<String> = self.group_names().into_iter().collect();
        if groups.contains(name) {
            return Err(FanoutError::validation(
                format!("Target name {name} conflicts with group of the same name"),
                None,
            ));
        }

        let targets: HashSet<String> = self.target_names().into_iter().collect();
        let used_aliases = self.root.target_aliases();
        for alias in aliases {
            if groups.contains(alias) {
                return Err(FanoutError::validation(
                    format!("Alias {alias} conflicts with group of the same name"),
                    None,
                ));
            }
            if targets.contains(alias) {
                return Err(FanoutError::validation(
                    format!("Alias {alias} conflicts with target of the same name"),
                    None,
                ));
            }
            if let Some(existing) = used_aliases.get(alias).filter(|t| t.as_str() != name) {
                return Err(FanoutError::validation(
                    format!("Alias {alias} refers to multiple targets: {existing} and {name}"),
                    None,
                ));
            }
        }
        Ok(())
    }

    /// Expand one name: a group, a target name or alias, or a wildcard
    fn resolve_name(&self, name: &str) -> FanoutResult<Vec<String>> {
        if let Some(group) = self.root.find_group(name) {
            return Ok(group.all_target_names());
        }

        let pattern = wildcard_regex(name)?;
        let mut matches: Vec<String> = self
            .root
            .all_target_names()
            .into_iter()
            .filter(|target| pattern.is_match(target))
            .collect();

        let mut aliases: Vec<(String, String)> = self.root.target_aliases().into_iter().collect();
        aliases.sort();
        matches.extend(
            aliases
                .into_iter()
                .filter(|(alias, _)| pattern.is_match(alias))
                .map(|(_, target)| target),
        );

        if matches.is_empty() {
            if name.contains('*') {
                return Err(FanoutError::Wildcard(name.to_string()));
            }
            return Ok(vec![name.to_string()]);
        }
        Ok(matches)
    }

    /// Cached target for a name, resolving and caching it on first use
    fn materialize(&mut self, name: &str) -> FanoutResult<Target> {
        if let Some(target) = self.targets.get(name) {
            return Ok(target.clone());
        }

        let definition = match self.root.find_definition(name) {
            Some(definition) => definition.clone(),
            None => {
                let adhoc = TargetDefinition {
                    uri: Some(name.to_string()),
                    ..TargetDefinition::default()
                };
                self.root.add_target(adhoc.clone());
                adhoc
            }
        };

        let data = self.root.data_for(name).unwrap_or_default();
        let target = Target::from_data(
            name,
            definition.uri.clone(),
            definition.alias.to_vec(),
            data,
            self.default_transport,
        )?;
        self.targets.insert(name.to_string(), target.clone());
        Ok(target)
    }
}

fn check_version(version: Option<Value>) -> FanoutResult<()> {
    match version {
        None => Ok(()),
        Some(Value::Number(n)) if n.as_u64() == Some(INVENTORY_VERSION) => Ok(()),
        Some(other) => Err(FanoutError::validation(
            format!("Unsupported inventory version {other}"),
            None,
        )),
    }
}

/// Case-insensitive, anchored pattern where `*` matches anything
fn wildcard_regex(name: &str) -> FanoutResult<Regex> {
    let pattern = format!("(?i)^{}$", regex::escape(name).replace(r"\*", ".*?"));
    Regex::new(&pattern).map_err(|e| FanoutError::validation(e.to_string(), None))
}
