//! Network-control seam
//!
//! Vservers and the coordinator drive kernel state through this trait so
//! tests can substitute a recorder for the real helper client.

use async_trait::async_trait;
use ballast_ncc::{NccClient, NccRequest, NccResponse};

#[async_trait]
pub trait NetControl: Send {
    async fn call(&mut self, request: NccRequest) -> ballast_ncc::Result<NccResponse>;
}

#[async_trait]
impl NetControl for NccClient {
    async fn call(&mut self, request: NccRequest) -> ballast_ncc::Result<NccResponse> {
        NccClient::call(self, request).await
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording double used by vserver and coordinator tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    pub struct RecordingNetControl {
        pub calls: Vec<NccRequest>,
        /// Scripted failures: each entry answers one upcoming call.
        pub failures: VecDeque<NccResponse>,
    }

    impl RecordingNetControl {
        pub fn new() -> Self {
            Self {
                calls: Vec::new(),
                failures: VecDeque::new(),
            }
        }

        pub fn handle(&mut self, request: NccRequest) -> ballast_ncc::Result<NccResponse> {
            self.calls.push(request);
            match self.failures.pop_front() {
                Some(NccResponse::Error { message, transient }) => {
                    Err(ballast_ncc::NccError::Helper { message, transient })
                }
                Some(other) => Ok(other),
                None => Ok(NccResponse::Ok),
            }
        }

        /// Requests recorded so far, draining the log.
        pub fn take_calls(&mut self) -> Vec<NccRequest> {
            std::mem::take(&mut self.calls)
        }
    }

    #[async_trait]
    impl NetControl for RecordingNetControl {
        async fn call(&mut self, request: NccRequest) -> ballast_ncc::Result<NccResponse> {
            self.handle(request)
        }
    }

    /// Cloneable handle onto one recorder, shareable between a spawned
    /// task and the asserting test.
    #[derive(Clone)]
    pub struct SharedNetControl(pub Arc<Mutex<RecordingNetControl>>);

    impl SharedNetControl {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(RecordingNetControl::new())))
        }

        pub fn take_calls(&self) -> Vec<NccRequest> {
            self.0.lock().unwrap().take_calls()
        }

        pub fn push_failure(&self, response: NccResponse) {
            self.0.lock().unwrap().failures.push_back(response);
        }
    }

    #[async_trait]
    impl NetControl for SharedNetControl {
        async fn call(&mut self, request: NccRequest) -> ballast_ncc::Result<NccResponse> {
            self.0.lock().unwrap().handle(request)
        }
    }
}
