//! RPC client over the helper's Unix socket
//!
//! Length-delimited bincode frames, one request in flight per client.
//! The connection is dialed lazily and redialed after transport errors;
//! every call is bounded by a per-call timeout. Callers hand in an
//! [`NccRequest`] and get the helper's response back; helper-side
//! refusals surface as [`NccError::Helper`] with their transient flag
//! preserved for the retry policy.

use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::{NccError, Result};
use crate::types::{NccRequest, NccResponse};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type Transport = Framed<UnixStream, LengthDelimitedCodec>;

/// Client for the privileged network-control helper.
pub struct NccClient {
    socket_path: PathBuf,
    call_timeout: Duration,
    transport: Option<Transport>,
}

impl NccClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            transport: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn connect(&mut self) -> Result<&mut Transport> {
        if self.transport.is_none() {
            debug!(path = %self.socket_path.display(), "Dialing network-control helper");
            let stream = UnixStream::connect(&self.socket_path).await?;
            self.transport = Some(Framed::new(stream, LengthDelimitedCodec::new()));
        }
        Ok(self.transport.as_mut().unwrap())
    }

    /// Issue one request and wait for its response. Transport failures
    /// drop the cached connection so the next call redials.
    pub async fn call(&mut self, request: NccRequest) -> Result<NccResponse> {
        let timeout = self.call_timeout;
        let result = tokio::time::timeout(timeout, self.call_inner(&request)).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                self.transport = None;
                Err(err)
            }
            Err(_) => {
                self.transport = None;
                warn!(?request, ?timeout, "Network-control call timed out");
                Err(NccError::Timeout(timeout))
            }
        }
    }

    async fn call_inner(&mut self, request: &NccRequest) -> Result<NccResponse> {
        let frame = bincode::serialize(request)?;
        let transport = self.connect().await?;
        transport.send(frame.into()).await?;
        let reply = transport.next().await.ok_or(NccError::ConnectionClosed)??;
        let response: NccResponse = bincode::deserialize(&reply)?;
        match response {
            NccResponse::Error { message, transient } => {
                Err(NccError::Helper { message, transient })
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IpvsService, ServiceStats};
    use ballast_core::{AddressFamily, Protocol, Scheduler, ServiceKey};
    use tokio::net::UnixListener;

    fn sample_service() -> IpvsService {
        IpvsService {
            vip: "192.0.2.1".parse().unwrap(),
            key: ServiceKey::Inet {
                af: AddressFamily::V4,
                proto: Protocol::Tcp,
                port: 80,
            },
            scheduler: Scheduler::WeightedRoundRobin,
            persistence: None,
            one_packet: false,
            conn_threshold_upper: 0,
            conn_threshold_lower: 0,
        }
    }

    /// Minimal fake helper: answers every request with a canned response.
    async fn serve_one(listener: UnixListener, response: NccResponse) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        while let Some(Ok(frame)) = framed.next().await {
            let _request: NccRequest = bincode::deserialize(&frame).unwrap();
            let reply = bincode::serialize(&response).unwrap();
            framed.send(reply.into()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ncc");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_one(listener, NccResponse::Ok));

        let mut client = NccClient::new(&path);
        let response = client
            .call(NccRequest::AddService(sample_service()))
            .await
            .unwrap();
        assert_eq!(response, NccResponse::Ok);
        // The connection is reused across calls.
        let response = client.call(NccRequest::UpLb).await.unwrap();
        assert_eq!(response, NccResponse::Ok);
    }

    #[tokio::test]
    async fn test_helper_error_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ncc");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_one(
            listener,
            NccResponse::Error {
                message: "ipvs busy".to_string(),
                transient: true,
            },
        ));

        let mut client = NccClient::new(&path);
        let err = client
            .call(NccRequest::AddService(sample_service()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_call_times_out_when_helper_hangs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ncc");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            // Accept and then never answer.
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let mut client = NccClient::new(&path).with_timeout(Duration::from_millis(50));
        let err = client.call(NccRequest::UpLb).await.unwrap_err();
        assert!(matches!(err, NccError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_query_stats_returns_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ncc");
        let listener = UnixListener::bind(&path).unwrap();
        let mut stats = ServiceStats::default();
        stats.service.connections = 42;
        tokio::spawn(serve_one(listener, NccResponse::Stats(stats)));

        let mut client = NccClient::new(&path);
        match client
            .call(NccRequest::QueryStats(sample_service()))
            .await
            .unwrap()
        {
            NccResponse::Stats(stats) => assert_eq!(stats.service.connections, 42),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
