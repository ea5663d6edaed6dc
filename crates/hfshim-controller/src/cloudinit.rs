//! Bootstrap documents handed to instances on first boot

use crate::error::{ControllerError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";
const AUTHORIZED_KEYS: &str = "ssh_authorized_keys";

const INSTALLER_TOKEN: &str = "token4harvester";
const INSTALLER_PASSWORD: &str = "welcome2harvester";
const INSTALLER_DEVICE: &str = "/dev/sda";

/// A parsed cloud-config mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudConfig {
    document: Mapping,
}

impl CloudConfig {
    /// Parse a document given either as plain YAML or as base64-encoded YAML.
    ///
    /// Blank input yields an empty mapping.
    pub fn parse(input: &str) -> Result<Self> {
        let text = decode_document(input);
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        match serde_yaml::from_str::<Value>(&text) {
            Ok(Value::Mapping(document)) => Ok(Self { document }),
            Ok(Value::Null) => Ok(Self::default()),
            Ok(other) => Err(ControllerError::invalid_cloud_init(format!(
                "expected a mapping at the top level, found {}",
                value_kind(&other)
            ))),
            Err(e) => Err(ControllerError::invalid_cloud_init(e.to_string())),
        }
    }

    pub fn authorized_keys(&self) -> Vec<String> {
        match self.document.get(AUTHORIZED_KEYS) {
            Some(Value::Sequence(keys)) => keys
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Append `public_key` to `ssh_authorized_keys` unless it is already listed
    pub fn add_authorized_key(&mut self, public_key: &str) -> Result<()> {
        let key = public_key.trim();
        let entry = self
            .document
            .entry(Value::String(AUTHORIZED_KEYS.to_string()))
            .or_insert_with(|| Value::Sequence(Vec::new()));

        if entry.is_null() {
            *entry = Value::Sequence(Vec::new());
        }

        let keys = entry.as_sequence_mut().ok_or_else(|| {
            ControllerError::invalid_cloud_init(format!("{} must be a list", AUTHORIZED_KEYS))
        })?;
        if !keys.iter().any(|k| k.as_str().map(str::trim) == Some(key)) {
            keys.push(Value::String(key.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    /// Render with the `#cloud-config` header
    pub fn render(&self) -> Result<String> {
        let body = serde_yaml::to_string(&self.document)
            .map_err(|e| ControllerError::invalid_cloud_init(e.to_string()))?;
        Ok(format!("{}{}", CLOUD_CONFIG_HEADER, body))
    }
}

/// Merge an authorized key into an existing bootstrap document
pub fn merge_authorized_key(existing: &str, public_key: &str) -> Result<CloudConfig> {
    let mut config = CloudConfig::parse(existing)?;
    config.add_authorized_key(public_key)?;
    Ok(config)
}

pub fn encode_base64(document: &str) -> String {
    STANDARD.encode(document.as_bytes())
}

// Anything that already reads as YAML is taken as is. Otherwise try base64
// and fall back to the raw text if it does not decode to UTF-8.
fn decode_document(input: &str) -> String {
    let trimmed = input.trim();
    let looks_plain = trimmed.starts_with('#')
        || trimmed.contains(':')
        || trimmed.chars().any(char::is_whitespace);
    if looks_plain {
        return input.to_string();
    }

    STANDARD
        .decode(trimmed)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| input.to_string())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[derive(Serialize)]
struct InstallerConfig<'a> {
    token: &'a str,
    os: InstallerOs<'a>,
    install: InstallerInstall<'a>,
}

#[derive(Serialize)]
struct InstallerOs<'a> {
    hostname: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct InstallerInstall<'a> {
    mode: &'a str,
    device: &'a str,
    iso_url: &'a str,
    vip: &'a str,
    vip_mode: &'a str,
    debug: bool,
}

/// Installer document for a bare-metal node booting the Harvester ISO
pub fn installer_config(vip: &str, hostname: &str, iso_url: &str) -> Result<String> {
    let config = InstallerConfig {
        token: INSTALLER_TOKEN,
        os: InstallerOs {
            hostname,
            password: INSTALLER_PASSWORD,
        },
        install: InstallerInstall {
            mode: "create",
            device: INSTALLER_DEVICE,
            iso_url,
            vip,
            vip_mode: "static",
            debug: true,
        },
    };

    let body = serde_yaml::to_string(&config)
        .map_err(|e| ControllerError::invalid_cloud_init(e.to_string()))?;
    Ok(format!("{}{}", CLOUD_CONFIG_HEADER, body))
}
