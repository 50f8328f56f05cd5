//! Linker configuration.

use crate::resources::MAX_RESOURCE_HANDLE;
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;

// wrapped so the file has a named section
#[derive(serde_derive::Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    linker: Config,
}

/// Settings shared by every component instantiated through one
/// [`ComponentLinker`](crate::ComponentLinker).
///
/// The defaults match what component toolchains emit, so most embeddings
/// never need to change anything.
#[derive(serde_derive::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_max_handles", rename = "max-handles")]
    max_handles: u32,
    #[serde(default = "default_memory_export", rename = "memory-export")]
    memory_export: String,
    #[serde(default = "default_realloc_export", rename = "realloc-export")]
    realloc_export: String,
    #[serde(default = "default_post_return_prefix", rename = "post-return-prefix")]
    post_return_prefix: String,
    #[serde(default = "default_shim_table_export", rename = "shim-table-export")]
    shim_table_export: String,
}

fn default_max_handles() -> u32 {
    MAX_RESOURCE_HANDLE
}

fn default_memory_export() -> String {
    "memory".to_string()
}

fn default_realloc_export() -> String {
    "cabi_realloc".to_string()
}

fn default_post_return_prefix() -> String {
    "cabi_post_".to_string()
}

fn default_shim_table_export() -> String {
    "$imports".to_string()
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl Config {
    /// Creates the default configuration.
    pub fn new() -> Config {
        Config {
            max_handles: default_max_handles(),
            memory_export: default_memory_export(),
            realloc_export: default_realloc_export(),
            post_return_prefix: default_post_return_prefix(),
            shim_table_export: default_shim_table_export(),
        }
    }

    /// Parses a configuration from TOML text.
    ///
    /// The settings live in a `[linker]` section; every key is optional:
    ///
    /// ```toml
    /// [linker]
    /// max-handles = 4096
    /// memory-export = "memory"
    /// realloc-export = "cabi_realloc"
    /// post-return-prefix = "cabi_post_"
    /// shim-table-export = "$imports"
    /// ```
    pub fn from_toml(contents: &str) -> Result<Config> {
        let file = toml::from_str::<ConfigFile>(contents).context("failed to parse config")?;
        let config = file.linker;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Config::from_toml(&contents)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.max_handles == 0 || self.max_handles > MAX_RESOURCE_HANDLE {
            bail!(
                "max-handles must be between 1 and {MAX_RESOURCE_HANDLE}, found {}",
                self.max_handles
            );
        }
        if self.memory_export.is_empty() || self.realloc_export.is_empty() {
            bail!("export names cannot be empty");
        }
        Ok(())
    }

    /// Caps the handles of every resource kind below `max`.
    ///
    /// Values above `1 << 30` are clamped.
    pub fn max_handles(&mut self, max: u32) -> &mut Self {
        self.max_handles = max.clamp(1, MAX_RESOURCE_HANDLE);
        self
    }

    /// Name of the linear memory export captured from the primary module.
    pub fn memory_export(&mut self, name: &str) -> &mut Self {
        self.memory_export = name.to_string();
        self
    }

    /// Name of the allocator export captured from the primary module.
    pub fn realloc_export(&mut self, name: &str) -> &mut Self {
        self.realloc_export = name.to_string();
        self
    }

    /// Prefix prepended to an entry point's name to find its post-return
    /// function.
    pub fn post_return_prefix(&mut self, prefix: &str) -> &mut Self {
        self.post_return_prefix = prefix.to_string();
        self
    }

    /// Name under which the indirection module exports its slot table.
    pub fn shim_table_export(&mut self, name: &str) -> &mut Self {
        self.shim_table_export = name.to_string();
        self
    }

    pub(crate) fn get_max_handles(&self) -> u32 {
        self.max_handles
    }

    pub(crate) fn get_memory_export(&self) -> &str {
        &self.memory_export
    }

    pub(crate) fn get_realloc_export(&self) -> &str {
        &self.realloc_export
    }

    pub(crate) fn get_post_return_prefix(&self) -> &str {
        &self.post_return_prefix
    }

    pub(crate) fn get_shim_table_export(&self) -> &str {
        &self.shim_table_export
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let config = Config::from_toml("[linker]\n").unwrap();
        assert_eq!(config, Config::new());
        assert_eq!(config.get_max_handles(), 1 << 30);
        assert_eq!(config.get_post_return_prefix(), "cabi_post_");
    }

    #[test]
    fn keys_are_kebab_case() {
        let config = Config::from_toml(
            r#"
                [linker]
                max-handles = 16
                realloc-export = "cabi_import_realloc"
                shim-table-export = "table"
            "#,
        )
        .unwrap();
        assert_eq!(config.get_max_handles(), 16);
        assert_eq!(config.get_realloc_export(), "cabi_import_realloc");
        assert_eq!(config.get_shim_table_export(), "table");
        assert_eq!(config.get_memory_export(), "memory");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(Config::from_toml("[linker]\nmax-handles = 0\n").is_err());
        assert!(Config::from_toml("[linker]\nmax-handles = 2147483648\n").is_err());
        assert!(Config::from_toml("[linker]\nunknown = 1\n").is_err());
        assert!(Config::from_toml("max-handles = 1\n").is_err());
    }

    #[test]
    fn builder_clamps_handles() {
        let mut config = Config::new();
        config.max_handles(u32::MAX).memory_export("mem");
        assert_eq!(config.get_max_handles(), MAX_RESOURCE_HANDLE);
        assert_eq!(config.get_memory_export(), "mem");
    }
}
