//! Bridge lifecycle: build the operation table, start the transport, and
//! tear everything down exactly once.

use std::io;
use std::process::{Child, Command};
use std::sync::Arc;

use crate::builtin;
use crate::config::{BridgeConfig, REQUEST_PIPE_ENV, RESPONSE_PIPE_ENV};
use crate::dispatcher::Dispatcher;
use crate::registry::{MethodRegistry, OperationProvider, RegistryError};
use crate::skip::SkipSignal;
use crate::status::TaskStatusStore;
use crate::transport::{PipeTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to register operations: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to start transport: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to start companion process: {0}")]
    Companion(#[source] io::Error),
}

/// A running bridge.
///
/// Dropping it shuts it down.
pub struct Bridge {
    config: BridgeConfig,
    status: Arc<TaskStatusStore>,
    skip: SkipSignal,
    transport: Option<PipeTransport>,
    companion: Option<Child>,
}

impl Bridge {
    /// Register builtins and the provider's operations, then start listening.
    ///
    /// Fails without a running listener if the FIFOs cannot be set up.
    pub fn initialize<P>(config: BridgeConfig, provider: &P) -> Result<Self, BridgeError>
    where
        P: OperationProvider + ?Sized,
    {
        let mut registry = MethodRegistry::new();
        builtin::register(&mut registry)?;
        provider.register(&mut registry)?;
        tracing::info!(operations = registry.len(), "Operations registered");

        let status = Arc::new(TaskStatusStore::new());
        let skip = SkipSignal::new();
        let dispatcher = Arc::new(Dispatcher::new(registry, Arc::clone(&status), skip.clone()));

        let transport = PipeTransport::start(&config, dispatcher)?;

        Ok(Self {
            config,
            status,
            skip,
            transport: Some(transport),
            companion: None,
        })
    }

    /// Spawn a process that talks to this bridge, typically the controller.
    ///
    /// The pipe paths are passed in `PIPESHIM_REQUEST_PIPE` and
    /// `PIPESHIM_RESPONSE_PIPE`. The process is killed on shutdown.
    pub fn spawn_companion(&mut self, mut command: Command) -> Result<(), BridgeError> {
        self.stop_companion();

        command
            .env(REQUEST_PIPE_ENV, &self.config.request_path)
            .env(RESPONSE_PIPE_ENV, &self.config.response_path);
        let child = command.spawn().map_err(BridgeError::Companion)?;

        tracing::info!(pid = child.id(), "Companion process started");
        self.companion = Some(child);
        Ok(())
    }

    /// Ask the running operation to skip, stop listening, remove the FIFOs,
    /// and kill the companion. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.transport.is_none() && self.companion.is_none() {
            return;
        }

        tracing::info!("Shutting down bridge");
        self.skip.request();
        if let Some(mut transport) = self.transport.take() {
            transport.stop();
        }
        self.stop_companion();
        self.skip.clear();
    }

    fn stop_companion(&mut self) {
        let Some(mut child) = self.companion.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = child.id(), %status, "Companion already exited");
            }
            _ => {
                tracing::info!(pid = child.id(), "Killing companion process");
                if let Err(e) = child.kill() {
                    tracing::warn!(error = %e, "Failed to kill companion process");
                }
                if let Err(e) = child.wait() {
                    tracing::warn!(error = %e, "Failed to reap companion process");
                }
            }
        }
    }

    pub fn status(&self) -> Arc<TaskStatusStore> {
        Arc::clone(&self.status)
    }

    pub fn skip_signal(&self) -> SkipSignal {
        self.skip.clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(PipeTransport::is_running)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
