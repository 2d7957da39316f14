//! Adapter identity reported to clients.

/// Debuglet version from Cargo.toml
pub const DEBUGLET_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEBUGLET_NAME: &str = "debuglet";

/// Name and version the engine identifies itself with.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AdapterInfo {
    pub name: String,
    pub version: String,
}

impl Default for AdapterInfo {
    fn default() -> Self {
        Self {
            name: DEBUGLET_NAME.to_string(),
            version: DEBUGLET_VERSION.to_string(),
        }
    }
}

impl AdapterInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the reported adapter name (embedders shipping their own build).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_info_defaults_to_crate_identity() {
        let info = AdapterInfo::new();
        assert_eq!(info.name, "debuglet");
        assert_eq!(info.version, DEBUGLET_VERSION);
    }

    #[test]
    fn adapter_info_builder_pattern() {
        let info = AdapterInfo::new().with_name("spamdbg").with_version("9.9.9");
        assert_eq!(info.name, "spamdbg");
        assert_eq!(info.version, "9.9.9");
    }
}
