//! Environment variable loading and `env.VAR_NAME` indirection.
//!
//! Secret values in `config.json` may be written as `env.VAR_NAME` instead
//! of inline; the loader resolves them at startup. Variables referenced
//! this way must be set at launch.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};

use super::model::{GatewayConfig, McpConnectionConfig};

/// Prefix marking an environment-variable reference.
const ENV_PREFIX: &str = "env.";

/// Loads environment variables from a .env file and resolves `env.VAR`
/// references in config values.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLoader {
    env_file: Option<String>,
}

impl EnvironmentLoader {
    /// Initialize the loader. An explicit `.env` path is loaded eagerly;
    /// without one, only the process environment is consulted.
    pub fn new(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            if path.exists() {
                if let Err(e) = dotenv::from_path(path) {
                    tracing::warn!(target: "bifrost::config", "Failed to load .env file: {}", e);
                }
            }
        }
        Self {
            env_file: env_file.map(|p| p.to_string_lossy().to_string()),
        }
    }

    /// Resolve one config value: `env.VAR_NAME` becomes the variable's
    /// value, anything else passes through unchanged.
    pub fn resolve(&self, value: &str) -> Result<String> {
        match value.strip_prefix(ENV_PREFIX) {
            Some(var) => env::var(var)
                .with_context(|| format!("Environment variable '{}' is not set", var)),
            None => Ok(value.to_string()),
        }
    }

    /// Resolve every secret-bearing field in a config in place: provider
    /// key values, extra headers, MCP connection headers and child env,
    /// and virtual-key values.
    pub fn resolve_config(&self, config: &mut GatewayConfig) -> Result<()> {
        for provider in &mut config.providers {
            for key in &mut provider.keys {
                key.value = self
                    .resolve(&key.value)
                    .with_context(|| format!("Resolving key '{}' of provider '{}'", key.id, provider.name))?;
            }
            for value in provider.network.extra_headers.values_mut() {
                *value = self.resolve(value)?;
            }
        }
        if let Some(mcp) = &mut config.mcp {
            for client in &mut mcp.clients {
                match &mut client.connection {
                    McpConnectionConfig::Stdio { env, .. } => {
                        for value in env.values_mut() {
                            *value = self.resolve(value)?;
                        }
                    }
                    McpConnectionConfig::Http { headers, .. }
                    | McpConnectionConfig::Sse { headers, .. } => {
                        for value in headers.values_mut() {
                            *value = self.resolve(value)?;
                        }
                    }
                }
            }
        }
        if let Some(governance) = &mut config.governance {
            for vk in &mut governance.virtual_keys {
                if let Some(key) = &vk.key {
                    vk.key = Some(self.resolve(key)?);
                }
            }
        }
        Ok(())
    }

    /// Path of the loaded .env file, if any.
    pub fn env_file(&self) -> Option<&str> {
        self.env_file.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_passthrough() {
        let loader = EnvironmentLoader::default();
        assert_eq!(loader.resolve("sk-inline-key").unwrap(), "sk-inline-key");
    }

    #[test]
    fn test_resolve_env_reference() {
        env::set_var("BIFROST_TEST_SECRET", "resolved-value");
        let loader = EnvironmentLoader::default();
        assert_eq!(
            loader.resolve("env.BIFROST_TEST_SECRET").unwrap(),
            "resolved-value"
        );
        env::remove_var("BIFROST_TEST_SECRET");
    }

    #[test]
    fn test_resolve_missing_env_fails() {
        let loader = EnvironmentLoader::default();
        assert!(loader.resolve("env.BIFROST_TEST_MISSING_VAR").is_err());
    }
}
