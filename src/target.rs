use crate::error::{FanoutError, FanoutResult};
use crate::util::object_at;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Transport protocol a target is reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ssh,
    Winrm,
    Local,
    Docker,
    Pcp,
}

impl TransportKind {
    /// Every known transport kind
    pub const ALL: [TransportKind; 5] = [
        TransportKind::Ssh,
        TransportKind::Winrm,
        TransportKind::Local,
        TransportKind::Docker,
        TransportKind::Pcp,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Winrm => "winrm",
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Pcp => "pcp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| FanoutError::UnknownTransport(s.to_string()))
    }
}

/// Inventory data resolved for one target
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetData {
    pub config: Map<String, Value>,
    pub vars: Map<String, Value>,
    pub facts: Map<String, Value>,
    pub features: Vec<String>,
    /// Names of the groups the target belongs to, innermost first
    pub groups: Vec<String>,
}

/// A single endpoint to run actions against
///
/// Targets are plain values: they carry the configuration resolved when they
/// were materialized and never hold a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    name: String,
    uri: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    aliases: Vec<String>,
    transport: TransportKind,
    config: Map<String, Value>,
    vars: Map<String, Value>,
    facts: Map<String, Value>,
    features: Vec<String>,
    groups: Vec<String>,
}

impl Target {
    /// Create an ad-hoc target from a name or URI with no inventory data
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let transport = scheme_transport(&uri)
            .or_else(|| is_localhost(&uri).then_some(TransportKind::Local))
            .unwrap_or(TransportKind::Ssh);
        Self {
            name: uri.clone(),
            uri,
            aliases: Vec::new(),
            transport,
            config: Map::new(),
            vars: Map::new(),
            facts: Map::new(),
            features: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Materialize a target from resolved inventory data
    ///
    /// # Errors
    ///
    /// Returns an error if the config names an unknown transport
    pub fn from_data(
        name: impl Into<String>,
        uri: Option<String>,
        aliases: Vec<String>,
        data: TargetData,
        default_transport: TransportKind,
    ) -> FanoutResult<Self> {
        let name = name.into();
        let uri = uri.unwrap_or_else(|| name.clone());
        let transport = resolve_transport(&name, &uri, &data.config, default_transport)?;
        Ok(Self {
            name,
            uri,
            aliases,
            transport,
            config: data.config,
            vars: data.vars,
            facts: data.facts,
            features: data.features,
            groups: data.groups,
        })
    }

    /// Replace the config map, re-resolving the transport
    ///
    /// # Errors
    ///
    /// Returns an error if the config names an unknown transport
    pub fn with_config(mut self, config: Map<String, Value>) -> FanoutResult<Self> {
        self.transport = resolve_transport(&self.name, &self.uri, &config, self.transport)?;
        self.config = config;
        Ok(self)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    #[must_use]
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    #[must_use]
    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    #[must_use]
    pub fn facts(&self) -> &Map<String, Value> {
        &self.facts
    }

    #[must_use]
    pub fn features(&self) -> &[String] {
        &self.features
    }

    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Options for this target's own transport (`config.<transport>`)
    #[must_use]
    pub fn options(&self) -> Map<String, Value> {
        object_at(&self.config, self.transport.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// A single transport option
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&Value> {
        object_at(&self.config, self.transport.as_str()).and_then(|opts| opts.get(key))
    }

    /// User the target escalates to, when configured on the target itself
    #[must_use]
    pub fn run_as(&self) -> Option<&str> {
        self.option("run-as").and_then(Value::as_str)
    }

    /// User from the URI, falling back to the transport options
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        split_authority(&self.uri)
            .0
            .or_else(|| self.option("user").and_then(Value::as_str))
    }

    /// Port from the transport options, falling back to the URI
    #[must_use]
    pub fn port(&self) -> Option<String> {
        match self.option("port") {
            Some(Value::String(port)) => Some(port.clone()),
            Some(Value::Number(port)) => Some(port.to_string()),
            _ => split_authority(&self.uri).2.map(str::to_string),
        }
    }

    /// Host part of the URI
    #[must_use]
    pub fn host(&self) -> &str {
        split_authority(&self.uri).1
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri && self.name == other.name
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn is_localhost(name: &str) -> bool {
    name == "localhost"
}

fn scheme_transport(uri: &str) -> Option<TransportKind> {
    let (scheme, _) = uri.split_once("://")?;
    scheme.parse().ok()
}

fn resolve_transport(
    name: &str,
    uri: &str,
    config: &Map<String, Value>,
    default_transport: TransportKind,
) -> FanoutResult<TransportKind> {
    if let Some(kind) = scheme_transport(uri) {
        return Ok(kind);
    }

    if let Some(configured) = config.get("transport") {
        let kind = configured.as_str().ok_or_else(|| {
            FanoutError::validation(format!("Transport for {name} must be a String"), None)
        })?;
        return kind.parse();
    }

    Ok(if is_localhost(name) || is_localhost(uri) {
        TransportKind::Local
    } else {
        default_transport
    })
}

/// Split `scheme://user@host:port/path` into (user, host, port)
fn split_authority(uri: &str) -> (Option<&str>, &str, Option<&str>) {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    let (user, hostport) = match authority.rsplit_once('@') {
        Some((user, hostport)) => (Some(user), hostport),
        None => (None, authority),
    };
    match hostport.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (user, host, Some(port))
        }
        _ => (user, hostport, None),
    }
}
