//! One session: dial, authorize, register, serve, tear down.
//!
//! A `Session` exclusively owns the transport, the framing halves, the key
//! store, and every handler for a single connection attempt. Nothing it
//! builds survives into the next attempt; keys are re-minted every time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use sdc_connection::{run_reader_loop, Connector, DispatchRegistry, FrameReader, ReaderError,
    TransportError};
use sdc_proto::FrameType;

use crate::auth::authorize;
use crate::config::LocalConf;
use crate::error::AgentError;
use crate::health::HealthCheckHandler;
use crate::keystore::KeyStore;
use crate::registration::Registration;
use crate::socks::{ConnectionControlHandler, SocketDataHandler, SocksGate, StreamTable};
use crate::ssh::SshForwarder;

/// How long to wait for the server's registration verdict.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// One connection attempt. Born on dial, dies on disconnect; never reused.
pub struct Session {
    conf: Arc<LocalConf>,
    connector: Arc<dyn Connector>,
    id: Uuid,
    registered: AtomicBool,
}

impl Session {
    pub fn new(conf: Arc<LocalConf>, connector: Arc<dyn Connector>) -> Self {
        Self {
            conf,
            connector,
            id: Uuid::new_v4(),
            registered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether this session got past registration. The reconnect loop resets
    /// its backoff on the strength of this.
    pub fn registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// Drive the session to completion.
    ///
    /// `Ok(())` means a graceful, operator-requested shutdown. Every error
    /// return means this session is dead; the caller decides between
    /// reconnect and exit from the error's classification.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        info!(session_id = %self.id, server = %self.conf.server_host, "session starting");

        let mut stream = self.connector.connect().await?;

        // Authorization precedes framing; nothing else may touch the wire.
        let _auth_request = authorize(&mut stream, &self.conf).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (sender, mut writer_task) = sdc_connection::spawn_writer(write_half);

        let key_store = Arc::new(KeyStore::new());
        let health = Arc::new(HealthCheckHandler::new(sender.clone()));
        let (registration, outcome_rx) =
            Registration::new(self.conf.clone(), key_store.clone(), health.clone());
        let table = Arc::new(StreamTable::new());

        let mut registry = DispatchRegistry::new();
        registry.register(FrameType::Registration, registration.clone());
        registry.register(FrameType::HealthCheck, health.clone());
        registry.register(
            FrameType::SocketData,
            Arc::new(SocketDataHandler::new(table.clone())),
        );
        registry.register(
            FrameType::ConnectionControl,
            Arc::new(ConnectionControlHandler::new(table.clone())),
        );

        let mut reader_task = tokio::spawn(run_reader_loop(FrameReader::new(read_half), registry));

        let result = self
            .registered_phase(
                &sender,
                &registration,
                outcome_rx,
                &key_store,
                &health,
                &table,
                &mut reader_task,
                &mut writer_task,
                &mut shutdown,
            )
            .await;

        // Single cancellation path: kill the tasks, which drops both halves
        // of the transport and releases every OS resource.
        reader_task.abort();
        writer_task.abort();
        drop(sender);

        debug!(session_id = %self.id, "session torn down");
        result
    }

    /// Registration exchange followed by the serving loop.
    #[allow(clippy::too_many_arguments)]
    async fn registered_phase(
        &self,
        sender: &sdc_connection::FrameSender,
        registration: &Arc<Registration>,
        outcome_rx: tokio::sync::oneshot::Receiver<crate::registration::RegistrationOutcome>,
        key_store: &Arc<KeyStore>,
        health: &Arc<HealthCheckHandler>,
        table: &Arc<StreamTable>,
        reader_task: &mut tokio::task::JoinHandle<Result<(), ReaderError>>,
        writer_task: &mut tokio::task::JoinHandle<Result<(), sdc_proto::FrameError>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        registration.send_registration_info(sender).await?;

        // The verdict arrives through the handler; the reader dying first
        // means the server hung up on us.
        tokio::select! {
            biased;
            outcome = outcome_rx => match outcome {
                Ok(verdict) => verdict?,
                // Handler dropped without a verdict: the reader is gone.
                Err(_) => return Err(AgentError::Transport(TransportError::PeerClosed)),
            },
            result = &mut *reader_task => return Err(reader_end_to_error(result)),
            _ = shutdown.changed() => return Ok(()),
            _ = sleep(REGISTRATION_TIMEOUT) => {
                return Err(AgentError::RegistrationTimeout(REGISTRATION_TIMEOUT));
            }
        }

        key_store.seal();
        health.mark_started();
        self.registered.store(true, Ordering::Relaxed);
        info!(
            session_id = %self.id,
            resource_keys = key_store.len(),
            "registration complete, session live"
        );

        let listener = TcpListener::bind(("127.0.0.1", self.conf.socks_server_port)).await?;
        let ssh = match &self.conf.ssh_forwarder {
            Some(command) => Some(SshForwarder::spawn(command, self.conf.socks_server_port)?),
            None => None,
        };

        let gate = Arc::new(SocksGate::new(
            key_store.clone(),
            sender.clone(),
            table.clone(),
        ));
        let socks_task = tokio::spawn(gate.run(listener));

        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => Ok(()),
            err = health.run_timer() => Err(err),
            result = &mut *reader_task => Err(reader_end_to_error(result)),
            result = &mut *writer_task => Err(writer_end_to_error(result)),
        };

        socks_task.abort();
        if let Some(ssh) = ssh {
            ssh.shutdown().await;
        }
        result
    }
}

fn reader_end_to_error(
    result: Result<Result<(), ReaderError>, tokio::task::JoinError>,
) -> AgentError {
    match result {
        Ok(Ok(())) => AgentError::Transport(TransportError::PeerClosed),
        Ok(Err(e)) => AgentError::Reader(e),
        Err(join) => AgentError::Io(std::io::Error::other(join)),
    }
}

fn writer_end_to_error(
    result: Result<Result<(), sdc_proto::FrameError>, tokio::task::JoinError>,
) -> AgentError {
    match result {
        Ok(Ok(())) => AgentError::Transport(TransportError::PeerClosed),
        Ok(Err(e)) => AgentError::Framing(e),
        Err(join) => AgentError::Io(std::io::Error::other(join)),
    }
}
