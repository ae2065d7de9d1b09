//! Controller side of the pipe protocol.
//!
//! Writes request lines to the bridge's request FIFO and reads answers from
//! its response FIFO. Used by the `pipeshim call` command and end-to-end tests.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{DecodeError, JsonLineCodec, encode_line};
use crate::bridge::protocol::{Request, RequestId, Response, Scalar};
use crate::config::BridgeConfig;
use crate::transport::{open_receiver, open_sender};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no bridge is reading {}", .path.display())]
    BridgeUnavailable { path: PathBuf },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("undecodable response: {}", .0.reason)]
    Decode(#[source] DecodeError),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Controller {
    request_path: PathBuf,
    response_path: PathBuf,
    responses: FramedRead<pipe::Receiver, JsonLineCodec<Response>>,
    timeout: Duration,
}

impl Controller {
    /// Attach to a bridge's FIFOs. Must be called inside a tokio runtime.
    ///
    /// The response FIFO is opened right away so the bridge always finds a
    /// reader when it answers.
    pub fn new(
        request_path: impl Into<PathBuf>,
        response_path: impl Into<PathBuf>,
    ) -> Result<Self, ClientError> {
        let request_path = request_path.into();
        let response_path = response_path.into();
        let responses = Self::open_responses(&response_path)?;

        Ok(Self {
            request_path,
            response_path,
            responses,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self, ClientError> {
        Self::new(&config.request_path, &config.response_path)
    }

    /// Bound on waiting for the bridge, both to accept a request and to answer it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn open_responses(
        path: &Path,
    ) -> io::Result<FramedRead<pipe::Receiver, JsonLineCodec<Response>>> {
        Ok(FramedRead::new(
            open_receiver(path)?,
            JsonLineCodec::<Response>::new(),
        ))
    }

    /// Call `method` with a fresh UUID id and wait for its answer.
    pub async fn call(&mut self, method: &str, args: Vec<Scalar>) -> Result<Response, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.call_with_id(id, method, args).await
    }

    /// Call `method` with a caller-chosen id. Responses carrying other ids
    /// are discarded.
    pub async fn call_with_id(
        &mut self,
        id: impl Into<RequestId>,
        method: &str,
        args: Vec<Scalar>,
    ) -> Result<Response, ClientError> {
        let id = id.into();
        let deadline = tokio::time::Instant::now() + self.timeout;

        self.send(&Request::new(method, args).with_id(id.clone()))
            .await?;

        loop {
            let response = tokio::time::timeout_at(deadline, self.recv())
                .await
                .map_err(|_| ClientError::Timeout(self.timeout))??;

            if response.id.as_ref() == Some(&id) {
                return Ok(response);
            }
            tracing::debug!(expected = %id, got = ?response.id, "Discarding unrelated response");
        }
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let line = encode_line(request)?;
        self.send_raw(line).await
    }

    /// Write `line` to the request FIFO byte for byte, adding the newline if
    /// missing. Bytes need not be valid UTF-8.
    pub async fn send_raw(&mut self, line: impl AsRef<[u8]>) -> Result<(), ClientError> {
        let line = line.as_ref();
        let mut sender = open_sender(
            &self.request_path,
            self.timeout,
            OPEN_POLL_INTERVAL,
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => ClientError::BridgeUnavailable {
                path: self.request_path.clone(),
            },
            _ => ClientError::Io(e),
        })?;

        let mut bytes = line.to_vec();
        if !line.ends_with(b"\n") {
            bytes.push(b'\n');
        }
        sender.write_all(&bytes).await?;
        sender.flush().await?;
        tracing::trace!(bytes = bytes.len(), "Request written");
        Ok(())
    }

    /// Next response line, whatever its id.
    pub async fn recv(&mut self) -> Result<Response, ClientError> {
        loop {
            match self.responses.next().await {
                Some(Ok(Ok(response))) => return Ok(response),
                Some(Ok(Err(e))) => return Err(ClientError::Decode(e)),
                Some(Err(e)) => return Err(ClientError::Io(e)),
                None => {
                    // Every writer went away; only seen where the FIFO is not
                    // held open read-write.
                    tokio::time::sleep(OPEN_POLL_INTERVAL).await;
                    self.responses = Self::open_responses(&self.response_path)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ensure_fifo;

    #[tokio::test]
    async fn send_without_bridge_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::in_dir(dir.path());
        ensure_fifo(&config.request_path).unwrap();
        ensure_fifo(&config.response_path).unwrap();

        let mut controller = Controller::from_config(&config)
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let err = controller.call("echo", vec![]).await.unwrap_err();

        assert!(matches!(err, ClientError::BridgeUnavailable { .. }));
        assert!(err.to_string().starts_with("no bridge is reading "));
    }

    #[tokio::test]
    async fn missing_response_fifo_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::in_dir(dir.path());

        let err = Controller::from_config(&config).err().unwrap();
        assert!(matches!(err, ClientError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn call_skips_stale_responses() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::in_dir(dir.path());
        ensure_fifo(&config.request_path).unwrap();
        ensure_fifo(&config.response_path).unwrap();

        let mut controller = Controller::from_config(&config)
            .unwrap()
            .with_timeout(Duration::from_secs(5));

        // Stand-in bridge: read the request, answer twice, stale first.
        let request_path = config.request_path.clone();
        let response_path = config.response_path.clone();
        let bridge = tokio::spawn(async move {
            let mut requests = FramedRead::new(
                open_receiver(&request_path).unwrap(),
                JsonLineCodec::<Request>::new(),
            );
            let request = requests.next().await.unwrap().unwrap().unwrap();

            let stale = Response::success(Some(RequestId::from("old")), "echo", Scalar::from("x"));
            let fresh = Response::success(request.id.clone(), "echo", Scalar::from("hi"));
            let mut sender = open_sender(
                &response_path,
                Duration::from_secs(5),
                OPEN_POLL_INTERVAL,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            for response in [stale, fresh] {
                sender
                    .write_all(encode_line(&response).unwrap().as_bytes())
                    .await
                    .unwrap();
            }
            request
        });

        let response = controller
            .call_with_id("mine", "echo", vec![Scalar::from("hi")])
            .await
            .unwrap();
        let request = bridge.await.unwrap();

        assert_eq!(request.id, Some(RequestId::from("mine")));
        assert_eq!(request.args, vec![Scalar::from("hi")]);
        assert_eq!(response.id, Some(RequestId::from("mine")));
        assert_eq!(response.result(), Some(&Scalar::from("hi")));
    }
}
