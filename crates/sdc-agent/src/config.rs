//! Local agent configuration.
//!
//! Loaded once at startup from a YAML file; immutable afterwards. CLI flags
//! may override the rules file path and the tunnel server address.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AgentError;

fn default_socks_port() -> u16 {
    1080
}

fn default_health_check_port() -> u16 {
    8200
}

fn default_server_port() -> u16 {
    4443
}

/// The operator-authored agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConf {
    /// Stable identifier this agent registers under; resource rules bind to it.
    pub agent_id: String,

    /// Local part of the identity used for authorization.
    pub user: String,

    /// Domain part of the identity; doubles as the OAuth consumer key.
    pub domain: String,

    /// OAuth consumer secret shared with the tunnel server.
    pub oauth_key: String,

    /// Path to the resource rules XML file.
    pub rules_file: PathBuf,

    /// Port for the local SOCKS gate.
    #[serde(default = "default_socks_port")]
    pub socks_server_port: u16,

    /// Port advertised for the local health-check endpoint.
    #[serde(default = "default_health_check_port")]
    pub health_check_port: u16,

    /// Comma-separated identities allowed to view this agent's liveness in
    /// the server UI. Absent or blank means the field is omitted entirely.
    #[serde(default)]
    pub health_check_gadget_users: Option<String>,

    /// Tunnel server hostname.
    pub server_host: String,

    /// Tunnel server port.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Extra PEM root certificates for verifying the tunnel server.
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,

    /// Skip server certificate verification. Development only.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Command to launch the bundled SSH port-forwarder. The SOCKS port is
    /// appended to its argv. When unset, no child is spawned.
    #[serde(default)]
    pub ssh_forwarder: Option<PathBuf>,

    /// Reconnect attempts tolerated before the process gives up (exit 4).
    /// Unset retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<usize>,
}

impl LocalConf {
    /// Read and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let conf: LocalConf = serde_yaml::from_str(&contents).map_err(|e| {
            AgentError::Config(format!("cannot parse config file {}: {e}", path.display()))
        })?;
        conf.validate()?;
        Ok(conf)
    }

    /// Identity the agent authenticates as.
    pub fn email(&self) -> String {
        format!("{}@{}", self.user, self.domain)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        fn require(field: &str, value: &str) -> Result<(), AgentError> {
            if value.trim().is_empty() {
                return Err(AgentError::Config(format!("{field} must not be empty")));
            }
            Ok(())
        }

        require("agent_id", &self.agent_id)?;
        require("user", &self.user)?;
        require("domain", &self.domain)?;
        require("oauth_key", &self.oauth_key)?;
        require("server_host", &self.server_host)?;

        if self.socks_server_port == 0 {
            return Err(AgentError::Config(
                "socks_server_port must not be zero".to_string(),
            ));
        }
        if self.health_check_port == 0 {
            return Err(AgentError::Config(
                "health_check_port must not be zero".to_string(),
            ));
        }
        if self.server_port == 0 {
            return Err(AgentError::Config(
                "server_port must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
agent_id: agent-1
user: connector
domain: corp.example.com
oauth_key: sekrit
rules_file: /etc/sdc/rules.xml
server_host: tunnel.cloud.example.com
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let conf = LocalConf::load(file.path()).unwrap();
        assert_eq!(conf.email(), "connector@corp.example.com");
        assert_eq!(conf.socks_server_port, 1080);
        assert_eq!(conf.health_check_port, 8200);
        assert_eq!(conf.server_port, 4443);
        assert_eq!(conf.health_check_gadget_users, None);
        assert!(!conf.insecure_skip_verify);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = LocalConf::load(Path::new("/no/such/file.yaml")).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn blank_required_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.replace("connector", "  ").as_bytes())
            .unwrap();

        let err = LocalConf::load(file.path()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn zero_port_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(format!("{MINIMAL}socks_server_port: 0\n").as_bytes())
            .unwrap();

        let err = LocalConf::load(file.path()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
