use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A Docker image config value that may be a single string or a list.
///
/// Old image manifests store `Entrypoint`/`Cmd` as a plain string; newer
/// ones use an argv list. A string entrypoint is split on spaces by the
/// execution layer, so both forms are preserved here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrOrList {
    Str(String),
    List(Vec<String>),
}

impl StrOrList {
    /// Flatten to an argv list, splitting the string form on whitespace.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Str(s) => s.split_whitespace().map(str::to_owned).collect(),
            Self::List(l) => l.clone(),
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::Str(_))
    }
}

/// The subset of the Docker image configuration consumed at run time.
///
/// `Volumes` and `ExposedPorts` are JSON objects whose keys carry the
/// information and whose values are empty objects; only the keys survive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "User", default)]
    pub user: Option<String>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
    #[serde(rename = "Hostname", default)]
    pub hostname: Option<String>,
    #[serde(rename = "Domainname", default)]
    pub domainname: Option<String>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<StrOrList>,
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<StrOrList>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Volumes", default)]
    pub volumes: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

impl ImageConfig {
    /// Declared volume mount points, sorted for deterministic iteration.
    pub fn volume_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .volumes
            .as_ref()
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// Declared exposed ports (`<port>[/proto]`), sorted.
    pub fn exposed_port_specs(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .exposed_ports
            .as_ref()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        ports.sort();
        ports
    }
}

/// Image metadata as persisted in `container.json`.
///
/// Registry v2 manifests carry the runtime settings under `config`;
/// some v1-era images only fill `container_config`. The effective config
/// prefers the former.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(rename = "config", alias = "Config", default)]
    pub config: Option<ImageConfig>,
    #[serde(rename = "container_config", alias = "ContainerConfig", default)]
    pub container_config: Option<ImageConfig>,
    #[serde(rename = "architecture", default)]
    pub architecture: Option<String>,
    #[serde(rename = "os", default)]
    pub os: Option<String>,
}

impl ContainerMetadata {
    pub fn effective_config(&self) -> Option<&ImageConfig> {
        self.config.as_ref().or(self.container_config.as_ref())
    }
}
