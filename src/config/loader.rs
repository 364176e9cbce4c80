use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::{DynamicConfig, GantryConfig, RouterTableConfig};

/// Load the application configuration using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<GantryConfig> {
    load_config_sync(config_path)
}

fn format_for(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml, // Default to YAML
    }
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GantryConfig> {
    let config_path = Path::new(config_path);

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format_for(config_path),
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}

/// Decode a routing-table document (`router-tables.json`).
pub fn parse_router_table(payload: &str) -> Result<RouterTableConfig> {
    serde_json::from_str(payload).wrap_err("Failed to parse routing table document")
}

/// Decode the runtime-tunable YAML document (`dynamic-config.yaml`).
pub fn parse_dynamic_config(payload: &str) -> Result<DynamicConfig> {
    Config::builder()
        .add_source(File::from_str(payload, FileFormat::Yaml))
        .build()
        .wrap_err("Failed to build dynamic config")?
        .try_deserialize()
        .wrap_err("Failed to deserialize dynamic config")
}

/// Read and decode a routing-table file.
pub async fn load_router_table(path: impl AsRef<Path>) -> Result<RouterTableConfig> {
    let path = path.as_ref();
    let payload = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read routing table {}", path.display()))?;
    parse_router_table(&payload)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::Profile;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
app:
  name: "edge"
  profile: "prod"
  graceful_exit_timeout_mills: 5000
server:
  port: 9080
discovery:
  group_name: "DEFAULT_GROUP"
  services:
    orders:
      - ip: "10.0.0.1"
        port: 8081
routing_table: "/etc/gantry/router-tables.json"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.app.name, "edge");
        assert_eq!(config.app.profile, Profile::Prod);
        assert_eq!(config.server.port, 9080);
        assert_eq!(config.server.reload_shutdown_timeout_mills, 30_000);
        assert_eq!(config.discovery.services["orders"][0].port, 8081);
        assert_eq!(config.routing_table, "/etc/gantry/router-tables.json");
    }

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
routing_table = "tables.json"

[server]
host = "127.0.0.1"
port = 0

[log]
level = "debug"
json = true
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.server.listen_addr(), "127.0.0.1:0");
        assert!(config.log.json);
        assert_eq!(config.app.graceful_exit_timeout_mills, 30_000);
    }

    #[test]
    fn test_parse_dynamic_config() {
        let yaml = "log-level:\n  gantry: debug\n  hyper: warn\n";
        let dynamic = parse_dynamic_config(yaml).unwrap();
        assert_eq!(dynamic.log_level.get("hyper").map(String::as_str), Some("warn"));
        assert_eq!(dynamic.log_level.len(), 2);
    }

    #[test]
    fn test_parse_router_table_rejects_garbage() {
        assert!(parse_router_table("{not json").is_err());
        let empty = parse_router_table("{}").unwrap();
        assert!(empty.tables.is_empty());
    }
}
