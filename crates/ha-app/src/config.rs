//! Configuration loading and validation.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use ha_common::{Ipv4Net, VrrpSession};

/// Where the config file is expected when running in the container.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ha_app/config.yaml";

const DEFAULT_PORT: u16 = 50051;
const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 10;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECONDS
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Direct typed representation of the app's config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    global: GlobalConfig,

    #[serde(default)]
    groups: Vec<GroupConfig>,
}

/// Corresponds to `global` in the config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Telemetry listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between consistency-check passes.
    #[serde(default = "default_check_interval")]
    pub consistency_check_interval_seconds: u64,

    #[serde(default)]
    pub aws: AwsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            consistency_check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
            aws: AwsConfig::default(),
        }
    }
}

/// Corresponds to `global->aws` in the config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsConfig {
    pub ec2_private_endpoint_url: Option<String>,
}

/// Corresponds to one `groups` entry in the config.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupConfig {
    xr_interface: String,
    vrid: u8,
    action: Action,
}

/// Corresponds to `groups->action` for `aws_activate_vip`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivateVipAction {
    pub device_index: u32,
    pub vip: Ipv4Addr,
}

/// Corresponds to `groups->action` for `aws_update_route_table`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRouteTableAction {
    pub route_table_id: String,
    pub destination: Ipv4Net,
    pub target_network_interface: String,
}

/// An action to perform on a go-active event, discriminated by the
/// `type` field. Exactly the fields of the tagged variant are accepted;
/// fields from the other variant are rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ActivateVip(ActivateVipAction),
    UpdateRouteTable(UpdateRouteTableAction),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::ActivateVip(_) => "aws_activate_vip",
            Action::UpdateRouteTable(_) => "aws_update_route_table",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut value = serde_yaml::Value::deserialize(deserializer)?;
        let mapping = value
            .as_mapping_mut()
            .ok_or_else(|| de::Error::custom("action must be a mapping"))?;
        let tag = mapping
            .remove(&serde_yaml::Value::from("type"))
            .ok_or_else(|| de::Error::missing_field("type"))?;
        let tag = tag
            .as_str()
            .ok_or_else(|| de::Error::custom("action `type` must be a string"))?
            .to_string();
        match tag.as_str() {
            "aws_activate_vip" => serde_yaml::from_value(value)
                .map(Action::ActivateVip)
                .map_err(de::Error::custom),
            "aws_update_route_table" => serde_yaml::from_value(value)
                .map(Action::UpdateRouteTable)
                .map_err(de::Error::custom),
            other => Err(de::Error::custom(format!(
                "unknown action type {other:?}, expected \
                 `aws_activate_vip` or `aws_update_route_table`"
            ))),
        }
    }
}

/// The registered actions, keyed by VRRP session. Built once at startup
/// and never mutated.
#[derive(Debug, Clone)]
pub struct ActionTable {
    order: Vec<VrrpSession>,
    actions: HashMap<VrrpSession, Action>,
}

impl ActionTable {
    fn from_groups(groups: &[GroupConfig]) -> Result<Self, ConfigError> {
        let mut order = Vec::with_capacity(groups.len());
        let mut actions = HashMap::with_capacity(groups.len());
        let mut duplicates: Vec<VrrpSession> = Vec::new();
        for group in groups {
            let session = VrrpSession::new(group.xr_interface.clone(), group.vrid);
            if actions
                .insert(session.clone(), group.action.clone())
                .is_some()
            {
                if !duplicates.contains(&session) {
                    duplicates.push(session);
                }
            } else {
                order.push(session);
            }
        }
        if !duplicates.is_empty() {
            let keys = duplicates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfigError::Invalid(format!(
                "only one action allowed per VRRP group, got multiple for {keys}"
            )));
        }
        Ok(Self { order, actions })
    }

    pub fn get(&self, session: &VrrpSession) -> Option<&Action> {
        self.actions.get(session)
    }

    /// Sessions in config order.
    pub fn sessions(&self) -> impl Iterator<Item = &VrrpSession> {
        self.order.iter()
    }

    /// (session, action) pairs in config order.
    pub fn iter(&self) -> impl Iterator<Item = (&VrrpSession, &Action)> {
        self.order
            .iter()
            .filter_map(|session| self.actions.get(session).map(|action| (session, action)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Load and validate the config file.
pub fn load(path: impl AsRef<Path>) -> Result<(GlobalConfig, ActionTable), ConfigError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Reading config from file");
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&contents)
}

/// Parse and validate config file contents.
pub fn parse(contents: &str) -> Result<(GlobalConfig, ActionTable), ConfigError> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate(&config)?;
    let table = ActionTable::from_groups(&config.groups)?;
    Ok((config.global, table))
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.global.port < 1024 {
        return Err(ConfigError::Invalid(format!(
            "global.port must be in 1024-65535, got {}",
            config.global.port
        )));
    }
    if config.global.consistency_check_interval_seconds == 0 {
        return Err(ConfigError::Invalid(
            "global.consistency_check_interval_seconds must be at least 1".to_string(),
        ));
    }

    if !config.groups.is_empty() {
        match config.global.aws.ec2_private_endpoint_url.as_deref() {
            None => {
                return Err(ConfigError::Invalid(
                    "global.aws.ec2_private_endpoint_url is required when groups \
                     are configured"
                        .to_string(),
                ))
            }
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                return Err(ConfigError::Invalid(format!(
                    "global.aws.ec2_private_endpoint_url must be an HTTP(S) URL, got {url:?}"
                )))
            }
            Some(_) => {}
        }
    }

    for group in &config.groups {
        let name = format!("<xr_interface={},vrid={}>", group.xr_interface, group.vrid);
        if group.xr_interface.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "group {name}: xr_interface must be non-empty"
            )));
        }
        if group.vrid == 0 {
            return Err(ConfigError::Invalid(format!(
                "group {name}: vrid must be in 1-255"
            )));
        }
        if let Action::UpdateRouteTable(action) = &group.action {
            if action.route_table_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: route_table_id must be non-empty"
                )));
            }
            if action.target_network_interface.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: target_network_interface must be non-empty"
                )));
            }
        }
    }

    Ok(())
}
