use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How an engine variant receives its runtime parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChannel {
    Env,
    Cmd,
}

/// A named engine image profile: image, how it takes config, and the flag
/// templates for the ports the provisioner fills in at spec-construction
/// time (spec §4.5 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineVariant {
    pub name: String,
    pub image: String,
    pub config_channel: ConfigChannel,
    /// e.g. `"--http-port={port}"` or `"HTTP_PORT={port}"` depending on
    /// `config_channel`.
    pub http_port_template: String,
    pub https_port_template: Option<String>,
    pub p2p_port_template: Option<String>,
    pub default_params: HashMap<String, String>,
    /// Preserved across template reloads: see `apply_override`.
    pub enabled: bool,
}

impl EngineVariant {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            config_channel: ConfigChannel::Env,
            http_port_template: "HTTP_PORT={port}".to_string(),
            https_port_template: None,
            p2p_port_template: None,
            default_params: HashMap::new(),
            enabled: true,
        }
    }

    /// Merges a freshly loaded override template into this variant.
    ///
    /// Per spec §9 ("Dynamic config objects"), a template's own `enabled`
    /// flag must never overwrite the live value — an operator who disabled
    /// a variant at runtime should not have it silently re-enabled (or
    /// vice versa) just because a template file was reloaded.
    pub fn apply_override(&mut self, template: EngineVariantOverride) {
        let enabled = self.enabled;
        if let Some(image) = template.image {
            self.image = image;
        }
        if let Some(channel) = template.config_channel {
            self.config_channel = channel;
        }
        if let Some(t) = template.http_port_template {
            self.http_port_template = t;
        }
        if template.https_port_template.is_some() {
            self.https_port_template = template.https_port_template;
        }
        if template.p2p_port_template.is_some() {
            self.p2p_port_template = template.p2p_port_template;
        }
        for (k, v) in template.default_params {
            self.default_params.insert(k, v);
        }
        self.enabled = enabled;
    }

    pub fn render_http_flag(&self, port: u16) -> String {
        self.http_port_template.replace("{port}", &port.to_string())
    }

    pub fn render_https_flag(&self, port: u16) -> Option<String> {
        self.https_port_template
            .as_ref()
            .map(|t| t.replace("{port}", &port.to_string()))
    }

    pub fn render_p2p_flag(&self, port: u32) -> Option<String> {
        self.p2p_port_template
            .as_ref()
            .map(|t| t.replace("{port}", &port.to_string()))
    }

    #[cfg(test)]
    fn with_http_template(mut self, t: &str) -> Self {
        self.http_port_template = t.to_string();
        self
    }
}

/// A partial template loaded from disk/config at runtime to override a
/// subset of an `EngineVariant`'s fields. Its `enabled` field is
/// intentionally absent: callers who want to change `enabled` do so
/// directly on the live `EngineVariant`, never through a template load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineVariantOverride {
    pub image: Option<String>,
    pub config_channel: Option<ConfigChannel>,
    pub http_port_template: Option<String>,
    pub https_port_template: Option<String>,
    pub p2p_port_template: Option<String>,
    #[serde(default)]
    pub default_params: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_preserves_live_enabled_flag() {
        let mut variant = EngineVariant::new("acestream", "acestream/engine:latest");
        variant.enabled = false;

        let template = EngineVariantOverride {
            image: Some("acestream/engine:3.2".to_string()),
            ..Default::default()
        };
        variant.apply_override(template);

        assert_eq!(variant.image, "acestream/engine:3.2");
        assert!(!variant.enabled, "enabled flag must survive a template load");
    }

    #[test]
    fn renders_port_templates() {
        let variant = EngineVariant::new("acestream", "img").with_http_template("--port={port}");
        assert_eq!(variant.render_http_flag(6878), "--port=6878");
    }
}
