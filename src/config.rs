//! Settings (C11): the simple INI configuration file described in §6, loaded once at
//! startup.

use std::path::{Path, PathBuf};

use crate::error::ServerError;

fn default_worker_pool_size() -> usize {
    16usize.min(num_cpus::get().max(1))
}

/// Parsed, validated server configuration. Construction (`Config::load`) is the only place
/// `ConfigInvalid` errors originate (§7); everything downstream assumes a valid `Config`.
#[derive(Debug, Clone)]
pub struct Config {
    pub resource_server_address: String,
    pub resource_server_port: u16,
    pub raw_resource_path: PathBuf,
    pub compiled_resource_path: PathBuf,
    pub worker_binary_path: Option<PathBuf>,
    pub max_simultaneous_compilation_tasks: usize,
    pub compiled_record_db_path: PathBuf,
}

impl Config {
    /// Loads and validates configuration from an INI file at `path`.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let ini = ini::Ini::load_from_file(path).map_err(|error| {
            ServerError::ConfigInvalid(format!("failed to read {}: {error}", path.display()))
        })?;
        let section = ini.general_section();

        let resource_server_address =
            section.get("resource_server_address").unwrap_or("0.0.0.0").to_string();

        let resource_server_port: u16 = match section.get("resource_server_port") {
            Some(value) => value.parse().map_err(|_| {
                ServerError::ConfigInvalid(format!("invalid resource_server_port {value:?}"))
            })?,
            None => {
                return Err(ServerError::ConfigInvalid(
                    "missing required key resource_server_port".to_string(),
                ))
            }
        };

        let raw_resource_path = require_path(section, "raw_resource_path")?;
        let compiled_resource_path = require_path(section, "compiled_resource_path")?;
        let compiled_record_db_path = require_path(section, "compiled_record_db_path")?;

        let worker_binary_path = section.get("worker_binary_path").map(PathBuf::from);

        let max_simultaneous_compilation_tasks = match section.get("max_simultaneous_compilation_tasks")
        {
            Some(value) => value.parse::<usize>().map_err(|_| {
                ServerError::ConfigInvalid(format!(
                    "invalid max_simultaneous_compilation_tasks {value:?}"
                ))
            })?,
            None => default_worker_pool_size(),
        }
        .clamp(1, num_cpus::get().max(1).max(1));

        Ok(Self {
            resource_server_address,
            resource_server_port,
            raw_resource_path,
            compiled_resource_path,
            worker_binary_path,
            max_simultaneous_compilation_tasks,
            compiled_record_db_path,
        })
    }
}

fn require_path(section: &ini::Properties, key: &str) -> Result<PathBuf, ServerError> {
    section
        .get(key)
        .map(PathBuf::from)
        .ok_or_else(|| ServerError::ConfigInvalid(format!("missing required key {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ini(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("ResourceServer.ini");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_a_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(
            dir.path(),
            "resource_server_address = 127.0.0.1\n\
             resource_server_port = 9001\n\
             raw_resource_path = /raw\n\
             compiled_resource_path = /compiled\n\
             worker_binary_path = /bin/compiler-worker\n\
             max_simultaneous_compilation_tasks = 4\n\
             compiled_record_db_path = /compiled/records.json\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.resource_server_port, 9001);
        assert_eq!(config.max_simultaneous_compilation_tasks, 4);
        assert_eq!(config.worker_binary_path, Some(PathBuf::from("/bin/compiler-worker")));
    }

    #[test]
    fn missing_port_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(
            dir.path(),
            "raw_resource_path = /raw\n\
             compiled_resource_path = /compiled\n\
             compiled_record_db_path = /compiled/records.json\n",
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn worker_pool_size_defaults_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(
            dir.path(),
            "resource_server_port = 9001\n\
             raw_resource_path = /raw\n\
             compiled_resource_path = /compiled\n\
             compiled_record_db_path = /compiled/records.json\n",
        );
        let config = Config::load(&path).unwrap();
        assert!(config.max_simultaneous_compilation_tasks >= 1);
    }
}
