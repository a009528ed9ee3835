//! Registry of installed app plugins and their setting schemas
//!
//! Plugins are registered explicitly at start-up. Lookups are by typed key
//! and fail closed: an unknown plugin or setting is simply `None`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name under which core settings are registered (`app_plugin: null` on the wire)
pub const CORE_APP: &str = "projectroles";

/// What a setting value is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettingScope {
    Project,
    User,
    ProjectUser,
    Site,
}

text_enum!(SettingScope {
    Project => "PROJECT",
    User => "USER",
    ProjectUser => "PROJECT_USER",
    Site => "SITE",
});

/// Declared value type of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettingType {
    String,
    Integer,
    Boolean,
    Json,
}

text_enum!(SettingType {
    String => "STRING",
    Integer => "INTEGER",
    Boolean => "BOOLEAN",
    Json => "JSON",
});

impl SettingType {
    /// Check a wire value against this type
    ///
    /// JSON settings carry their payload in `value_json`; the other types
    /// use the string `value`.
    pub fn validate(&self, value: &str, value_json: &Value) -> Result<(), String> {
        match self {
            SettingType::String => Ok(()),
            SettingType::Integer => value
                .trim()
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("\"{}\" is not an integer", value)),
            SettingType::Boolean => match value {
                "0" | "1" | "true" | "false" | "True" | "False" => Ok(()),
                other => Err(format!("\"{}\" is not a boolean", other)),
            },
            SettingType::Json => {
                if value_json.is_object() || value_json.is_array() {
                    Ok(())
                } else {
                    Err("JSON setting value must be an object or an array".to_string())
                }
            }
        }
    }
}

/// Typed key of a setting definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SettingKey {
    /// `None` for core settings
    pub plugin: Option<String>,
    pub name: String,
}

impl SettingKey {
    pub fn new(plugin: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            plugin: plugin.map(str::to_string),
            name: name.into(),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.plugin.as_deref().unwrap_or(CORE_APP), self.name)
    }
}

/// Declared schema of a setting
#[derive(Debug, Clone, PartialEq)]
pub struct SettingDef {
    pub name: String,
    pub scope: SettingScope,
    pub setting_type: SettingType,
    pub default: Value,
    /// Site-local settings are never overwritten by a remote sync
    pub local: bool,
    pub description: String,
}

impl SettingDef {
    pub fn new(name: impl Into<String>, scope: SettingScope, setting_type: SettingType) -> Self {
        Self {
            name: name.into(),
            scope,
            setting_type,
            default: Value::Null,
            local: false,
            description: String::new(),
        }
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// An installed app plugin
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub name: String,
    pub title: String,
    settings: BTreeMap<String, SettingDef>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, def: SettingDef) -> Self {
        self.settings.insert(def.name.clone(), def);
        self
    }

    pub fn setting(&self, name: &str) -> Option<&SettingDef> {
        self.settings.get(name)
    }

    pub fn settings(&self) -> impl Iterator<Item = &SettingDef> {
        self.settings.values()
    }
}

/// Active plugin registry
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    core: PluginDescriptor,
    plugins: BTreeMap<String, PluginDescriptor>,
}

impl PluginRegistry {
    /// Registry with only the given core descriptor
    pub fn new(core: PluginDescriptor) -> Self {
        Self {
            core,
            plugins: BTreeMap::new(),
        }
    }

    /// Registry with the built-in core settings and no plugins
    pub fn with_core_settings() -> Self {
        Self::new(core_descriptor())
    }

    /// Register a plugin, replacing any earlier registration of the same name
    pub fn register(&mut self, plugin: PluginDescriptor) {
        self.plugins.insert(plugin.name.clone(), plugin);
    }

    pub fn with_plugin(mut self, plugin: PluginDescriptor) -> Self {
        self.register(plugin);
        self
    }

    /// Resolve a plugin; `None` resolves to core
    pub fn get_plugin(&self, name: Option<&str>) -> Option<&PluginDescriptor> {
        match name {
            None => Some(&self.core),
            Some(name) => self.plugins.get(name),
        }
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Resolve a setting definition
    pub fn get_setting(&self, key: &SettingKey) -> Option<&SettingDef> {
        self.get_plugin(key.plugin.as_deref())?.setting(&key.name)
    }

    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_core_settings()
    }
}

/// Built-in settings of the project management core
fn core_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(CORE_APP, "Project Roles")
        .with_setting(
            SettingDef::new("ip_restrict", SettingScope::Project, SettingType::Boolean)
                .with_default(Value::Bool(false))
                .with_description("Restrict project access by IP address"),
        )
        .with_setting(
            SettingDef::new("ip_allowlist", SettingScope::Project, SettingType::Json)
                .with_default(Value::Array(vec![]))
                .with_description("Allowed IP addresses or networks"),
        )
        .with_setting(
            SettingDef::new("project_star", SettingScope::ProjectUser, SettingType::Boolean)
                .local()
                .with_default(Value::Bool(false)),
        )
        .with_setting(
            SettingDef::new("notify_email_project", SettingScope::User, SettingType::Boolean)
                .local()
                .with_default(Value::Bool(true)),
        )
        .with_setting(
            SettingDef::new("notify_email_role", SettingScope::User, SettingType::Boolean)
                .local()
                .with_default(Value::Bool(true)),
        )
        .with_setting(
            SettingDef::new("user_email_additional", SettingScope::User, SettingType::String)
                .with_default(Value::String(String::new()))
                .with_description("Additional email addresses for the user"),
        )
}
