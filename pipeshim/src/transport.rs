//! Named-pipe transport: two FIFOs and one listener thread.
//!
//! - **request FIFO**: controller -> bridge, read continuously by the listener
//! - **response FIFO**: bridge -> controller, opened fresh for every response
//!
//! The listener owns a current-thread tokio runtime. Requests are dispatched
//! one at a time on the blocking pool and answered before the next line is
//! read, so responses leave in arrival order.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use tokio::net::unix::pipe;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::protocol::{Request, Response};
use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;

const LISTENER_THREAD_NAME: &str = "pipeshim-listener";

/// Delay before reopening the request FIFO after its last writer left.
/// Linux opens the FIFO read-write and never sees end-of-stream.
#[cfg(not(target_os = "linux"))]
const IDLE_REOPEN_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{} exists and is not a FIFO", .path.display())]
    NotAFifo { path: PathBuf },

    #[error("failed to create FIFO {}: {source}", .path.display())]
    CreateFifo { path: PathBuf, source: io::Error },

    #[error("failed to inspect {}: {source}", .path.display())]
    Inspect { path: PathBuf, source: io::Error },

    #[error("failed to start listener: {0}")]
    Listener(#[source] io::Error),
}

/// Make sure `path` is a FIFO. Returns `true` if it had to be created.
///
/// An existing FIFO is reused; any other existing file is an error.
pub fn ensure_fifo(path: &Path) -> Result<bool, TransportError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            tracing::debug!(path = %path.display(), "Reusing existing FIFO");
            Ok(false)
        }
        Ok(_) => Err(TransportError::NotAFifo {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)).map_err(|errno| {
                TransportError::CreateFifo {
                    path: path.to_path_buf(),
                    source: io::Error::from(errno),
                }
            })?;
            tracing::debug!(path = %path.display(), "Created FIFO");
            Ok(true)
        }
        Err(e) => Err(TransportError::Inspect {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Remove `path` if it is a FIFO. Missing paths are fine.
pub fn remove_fifo(path: &Path) {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove FIFO");
            } else {
                tracing::debug!(path = %path.display(), "Removed FIFO");
            }
        }
        Ok(_) => {
            tracing::warn!(path = %path.display(), "Not a FIFO, leaving in place");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to inspect FIFO");
        }
    }
}

/// Open the read end of a FIFO. Must be called inside a tokio runtime.
pub(crate) fn open_receiver(path: &Path) -> io::Result<pipe::Receiver> {
    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_receiver(path)
}

/// Open the write end of a FIFO, waiting for a reader to show up.
///
/// Fails with `TimedOut` if nobody opens the read end within `timeout`, and
/// with `Interrupted` if `shutdown` fires first.
pub(crate) async fn open_sender(
    path: &Path,
    timeout: Duration,
    poll_interval: Duration,
    shutdown: &CancellationToken,
) -> io::Result<pipe::Sender> {
    let deadline = Instant::now() + timeout;
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            // ENXIO: no reader on the other end yet.
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reader on {}", path.display()),
                    ));
                }
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        return Err(io::Error::new(io::ErrorKind::Interrupted, "shutting down"));
                    }
                    _ = tokio::time::sleep(poll_interval.min(deadline - now)) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// The running listener and the FIFOs it owns.
pub struct PipeTransport {
    request_path: PathBuf,
    response_path: PathBuf,
    shutdown: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl PipeTransport {
    /// Create both FIFOs and start listening.
    ///
    /// On failure, FIFOs created by this call are removed again.
    pub fn start(config: &BridgeConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, TransportError> {
        let mut created = Vec::new();
        let cleanup = |created: &[PathBuf]| created.iter().for_each(|p| remove_fifo(p));

        for path in [&config.request_path, &config.response_path] {
            match ensure_fifo(path) {
                Ok(true) => created.push(path.clone()),
                Ok(false) => {}
                Err(e) => {
                    cleanup(&created);
                    return Err(e);
                }
            }
        }

        let shutdown = CancellationToken::new();
        let listener = Listener {
            config: config.clone(),
            dispatcher,
            shutdown: shutdown.clone(),
        };

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name(LISTENER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(listener.run());
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                cleanup(&created);
                return Err(TransportError::Listener(e));
            }
        };

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(io::Error::other("listener thread exited during startup"))
        });
        if let Err(e) = ready {
            let _ = handle.join();
            cleanup(&created);
            return Err(TransportError::Listener(e));
        }

        tracing::info!(
            request = %config.request_path.display(),
            response = %config.response_path.display(),
            "Pipe transport started"
        );

        Ok(Self {
            request_path: config.request_path.clone(),
            response_path: config.response_path.clone(),
            shutdown,
            listener: Some(handle),
        })
    }

    /// Stop the listener, wait for it, and remove both FIFOs.
    ///
    /// A request already being dispatched runs to completion first.
    /// Calling this again is a no-op.
    pub fn stop(&mut self) {
        let Some(handle) = self.listener.take() else {
            return;
        };

        tracing::info!("Stopping pipe transport");
        self.shutdown.cancel();
        if handle.join().is_err() {
            tracing::error!("Listener thread panicked");
        }

        remove_fifo(&self.request_path);
        remove_fifo(&self.response_path);
    }

    pub fn is_running(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn request_path(&self) -> &Path {
        &self.request_path
    }

    pub fn response_path(&self) -> &Path {
        &self.response_path
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Listener {
    config: BridgeConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl Listener {
    async fn run(self) {
        let path = self.config.request_path.clone();

        while !self.shutdown.is_cancelled() {
            let receiver = match open_receiver(&path) {
                Ok(receiver) => receiver,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to open request pipe");
                    self.pause(self.config.reopen_backoff).await;
                    continue;
                }
            };
            tracing::debug!(path = %path.display(), "Request pipe open");

            let mut reader = FramedRead::new(receiver, JsonLineCodec::<Request>::new());
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    next = reader.next() => next,
                };

                match next {
                    Some(Ok(Ok(request))) => self.handle(request).await,
                    Some(Ok(Err(e))) => {
                        tracing::warn!(line = %e.line, error = %e.reason, "Undecodable request");
                        self.respond(Response::undecodable(e.to_string())).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Request pipe read failed");
                        self.pause(self.config.reopen_backoff).await;
                        break;
                    }
                    None => {
                        tracing::debug!("Request pipe reached end of stream, reopening");
                        #[cfg(not(target_os = "linux"))]
                        self.pause(IDLE_REOPEN_DELAY).await;
                        break;
                    }
                }
            }
        }

        tracing::debug!("Listener exiting");
    }

    async fn handle(&self, request: Request) {
        let id = request.id.clone();
        let method = request.method.clone();
        tracing::debug!(method = %method, id = ?id, "Request received");

        let dispatcher = Arc::clone(&self.dispatcher);
        let response = match tokio::task::spawn_blocking(move || dispatcher.dispatch(request)).await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(method = %method, error = %e, "Dispatch task failed");
                Response::failure(id, method, format!("dispatch failed: {}", e))
            }
        };

        self.respond(response).await;
    }

    async fn respond(&self, response: Response) {
        let sender = match open_sender(
            &self.config.response_path,
            self.config.response_open_timeout,
            self.config.response_open_poll,
            &self.shutdown,
        )
        .await
        {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!(
                    method = %response.method,
                    id = ?response.id,
                    error = %e,
                    "Dropping response, response pipe unavailable"
                );
                return;
            }
        };

        let mut writer = FramedWrite::new(sender, JsonLineCodec::<Response>::new());
        if let Err(e) = writer.send(response).await {
            tracing::warn!(error = %e, "Failed to write response");
        }
    }

    /// Sleep for `duration` or until shutdown, whichever comes first.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Scalar;
    use crate::operation::ParamType;
    use crate::registry::MethodRegistry;
    use crate::skip::SkipSignal;
    use crate::status::TaskStatusStore;
    use tokio::io::AsyncWriteExt;

    fn echo_dispatcher() -> Arc<Dispatcher> {
        let mut registry = MethodRegistry::new();
        registry
            .register_fn("echo", &[ParamType::Str], |_, args| {
                Ok(Scalar::from(args.str(0)?))
            })
            .unwrap();
        Arc::new(Dispatcher::new(
            registry,
            Arc::new(TaskStatusStore::new()),
            SkipSignal::new(),
        ))
    }

    #[test]
    fn ensure_fifo_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req");

        assert!(ensure_fifo(&path).unwrap());
        assert!(std::fs::symlink_metadata(&path).unwrap().file_type().is_fifo());
        assert!(!ensure_fifo(&path).unwrap());

        remove_fifo(&path);
        assert!(!path.exists());
        remove_fifo(&path);
    }

    #[test]
    fn ensure_fifo_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req");
        std::fs::write(&path, b"not a pipe").unwrap();

        let err = ensure_fifo(&path).unwrap_err();
        assert!(matches!(err, TransportError::NotAFifo { .. }));

        // Only FIFOs are ever removed.
        remove_fifo(&path);
        assert!(path.exists());
    }

    #[test]
    fn failed_start_removes_what_it_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::in_dir(dir.path());
        std::fs::write(&config.response_path, b"").unwrap();

        let result = PipeTransport::start(&config, echo_dispatcher());
        assert!(matches!(result, Err(TransportError::NotAFifo { .. })));
        assert!(!config.request_path.exists());
    }

    #[test]
    fn stop_is_idempotent_and_removes_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::in_dir(dir.path());

        let mut transport = PipeTransport::start(&config, echo_dispatcher()).unwrap();
        assert!(transport.is_running());
        assert!(config.request_path.exists());

        transport.stop();
        transport.stop();
        assert!(!transport.is_running());
        assert!(!config.request_path.exists());
        assert!(!config.response_path.exists());
    }

    #[tokio::test]
    async fn answers_request_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::in_dir(dir.path());
        let mut transport = PipeTransport::start(&config, echo_dispatcher()).unwrap();

        let receiver = open_receiver(&config.response_path).unwrap();
        let mut responses = FramedRead::new(receiver, JsonLineCodec::<Response>::new());

        let mut sender = open_sender(
            &config.request_path,
            Duration::from_secs(5),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        sender
            .write_all(b"{\"method\":\"echo\",\"args\":[\"hi\"],\"id\":\"1\"}\n{oops\n")
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), responses.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first, Response::success(Some("1".into()), "echo", Scalar::from("hi")));

        let second = tokio::time::timeout(Duration::from_secs(5), responses.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.method, "unknown");
        assert!(second.error().unwrap().starts_with("invalid request: "));

        transport.stop();
    }

    #[tokio::test]
    async fn open_sender_times_out_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resp");
        ensure_fifo(&path).unwrap();

        let err = open_sender(
            &path,
            Duration::from_millis(50),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = open_sender(&path, Duration::from_secs(5), Duration::from_millis(10), &cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
