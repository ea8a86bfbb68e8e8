//! Registration exchange.
//!
//! Sends the agent's capability surface (rules, per-resource keys, ports)
//! as one REGISTRATION frame and handles the server's single response. The
//! minted keys go into the session key store; server-supplied timing goes to
//! the health checker.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info};

use sdc_connection::{DispatchError, Dispatchable, FrameSender};
use sdc_proto::{decode_payload, encode_payload, FrameInfo, FrameType, RegistrationRequest,
    RegistrationResponse, RegistrationResult, ResourceKey};

use crate::config::LocalConf;
use crate::error::AgentError;
use crate::health::HealthCheckHandler;
use crate::keystore::KeyStore;
use crate::rules;

/// Outcome delivered to the session once the server has answered.
pub type RegistrationOutcome = Result<(), AgentError>;

/// REGISTRATION frame handler.
pub struct Registration {
    conf: Arc<LocalConf>,
    key_store: Arc<KeyStore>,
    health: Arc<HealthCheckHandler>,
    outcome_tx: Mutex<Option<oneshot::Sender<RegistrationOutcome>>>,
}

impl Registration {
    /// Build the handler and the channel the session awaits the verdict on.
    pub fn new(
        conf: Arc<LocalConf>,
        key_store: Arc<KeyStore>,
        health: Arc<HealthCheckHandler>,
    ) -> (Arc<Self>, oneshot::Receiver<RegistrationOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                conf,
                key_store,
                health,
                outcome_tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Send the registration frame and persist the minted keys.
    pub async fn send_registration_info(&self, sender: &FrameSender) -> Result<(), AgentError> {
        let rules_bytes = tokio::fs::read(&self.conf.rules_file).await.map_err(|e| {
            AgentError::Config(format!(
                "cannot read rules file {}: {e}",
                self.conf.rules_file.display()
            ))
        })?;
        let rules_text = String::from_utf8_lossy(&rules_bytes);

        let resource_keys = self.mint_resource_keys(&rules_text)?;

        let request = RegistrationRequest {
            agent_id: self.conf.agent_id.clone(),
            socks_server_port: self.conf.socks_server_port,
            health_check_port: self.conf.health_check_port,
            resources_xml: rules_bytes.clone(),
            resource_keys: resource_keys.clone(),
            health_check_gadget_users: parse_gadget_users(
                self.conf.health_check_gadget_users.as_deref(),
            ),
        };

        info!(
            agent_id = %request.agent_id,
            resource_keys = request.resource_keys.len(),
            "sending registration"
        );
        let payload = encode_payload(&request)?;
        sender.send(FrameType::Registration, payload).await?;

        self.key_store
            .store_keys(resource_keys)
            .map_err(|e| AgentError::Config(format!("key store rejected session keys: {e}")))?;
        Ok(())
    }

    /// Mint one key per rule URL bound to this agent, plus the local
    /// health-check endpoint.
    fn mint_resource_keys(&self, rules_text: &str) -> Result<Vec<ResourceKey>, AgentError> {
        let rules = rules::rules_for_agent(rules_text, &self.conf.agent_id)?;

        let mut keys = Vec::with_capacity(rules.len() + 1);
        for rule in &rules {
            let (host, port) = rules::resource_endpoint(&rule.url)?;
            keys.push(ResourceKey {
                host,
                port,
                key: OsRng.gen(),
            });
        }
        keys.push(ResourceKey {
            host: "localhost".to_string(),
            port: self.conf.health_check_port,
            key: OsRng.gen(),
        });
        Ok(keys)
    }

    fn resolve(&self, outcome: RegistrationOutcome) {
        if let Some(tx) = self
            .outcome_tx
            .lock()
            .expect("registration outcome lock poisoned")
            .take()
        {
            let _ = tx.send(outcome);
        }
    }
}

#[async_trait]
impl Dispatchable for Registration {
    async fn dispatch(&self, frame: FrameInfo) -> Result<(), DispatchError> {
        let response: RegistrationResponse = match decode_payload(&frame.payload) {
            Ok(response) => response,
            Err(e) => {
                // Malformed payload is a framing-level failure: the session
                // reconnects rather than giving up on registration.
                self.resolve(Err(AgentError::Codec(e)));
                return Err(DispatchError::new("bad registration payload"));
            }
        };

        if response.result != RegistrationResult::Ok {
            let message = response
                .status_message
                .unwrap_or_else(|| response.result.to_string());
            self.resolve(Err(AgentError::RegistrationDenied {
                message: message.clone(),
            }));
            return Err(DispatchError::new(format!("registration failed: {message}")));
        }

        if let Some(conf) = &response.server_supplied_conf {
            debug!("applying server-supplied configuration");
            self.health.set_server_supplied_conf(conf);
        }

        info!(agent_id = %self.conf.agent_id, "registration successful");
        self.resolve(Ok(()));
        Ok(())
    }
}

/// Parse the comma-separated gadget-users option. Whitespace-only input and
/// empty entries vanish; an effectively empty option yields `None`, never an
/// empty list.
pub fn parse_gadget_users(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?;
    let users: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if users.is_empty() {
        None
    } else {
        Some(users)
    }
}
