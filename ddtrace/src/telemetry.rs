// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration-change events. Emitted as structured tracing events so an
//! embedding application can forward them to its telemetry pipeline.

use std::fmt;

/// Where the currently effective value of a setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationOrigin {
    RemoteConfig,
    EnvVar,
    Code,
    Default,
}

impl ConfigurationOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationOrigin::RemoteConfig => "remote_config",
            ConfigurationOrigin::EnvVar => "env_var",
            ConfigurationOrigin::Code => "code",
            ConfigurationOrigin::Default => "default",
        }
    }
}

impl fmt::Display for ConfigurationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn configuration_changed(name: &str, value: &str, origin: ConfigurationOrigin) {
    tracing::info!(
        target: "ddtrace::telemetry",
        setting = name,
        value,
        origin = %origin,
        "Configuration changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_tag_values() {
        assert_eq!(ConfigurationOrigin::RemoteConfig.as_str(), "remote_config");
        assert_eq!(ConfigurationOrigin::EnvVar.as_str(), "env_var");
        assert_eq!(ConfigurationOrigin::Code.as_str(), "code");
        assert_eq!(ConfigurationOrigin::Default.as_str(), "default");
    }
}
