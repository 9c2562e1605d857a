//! Transport abstraction for the server API.
//!
//! The client only ever sees [`Transport::dispatch`]. Implementations may
//! speak HTTP, WebSockets, or call straight into an in-process server.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::messages::{ApiRequest, ApiResponse, RequestContext};

/// Request/response channel to the server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self, ctx: &RequestContext, request: ApiRequest) -> Result<ApiResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn dispatch(&self, ctx: &RequestContext, request: ApiRequest) -> Result<ApiResponse> {
        (**self).dispatch(ctx, request).await
    }
}

/// Wraps a transport and fails selected requests, for exercising retries.
pub struct FlakyTransport<T> {
    inner: T,
    /// Request name -> failures left to inject.
    failures: Mutex<HashMap<&'static str, usize>>,
}

impl<T: Transport> FlakyTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` requests named `name` (see [`ApiRequest::name`]).
    pub async fn fail_next(&self, name: &'static str, count: usize) {
        self.failures.lock().await.insert(name, count);
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for FlakyTransport<T> {
    async fn dispatch(&self, ctx: &RequestContext, request: ApiRequest) -> Result<ApiResponse> {
        {
            let mut failures = self.failures.lock().await;
            if let Some(left) = failures.get_mut(request.name()) {
                if *left > 0 {
                    *left -= 1;
                    return Err(SyncError::Transport(format!(
                        "injected failure for {}",
                        request.name()
                    )));
                }
            }
        }
        self.inner.dispatch(ctx, request).await
    }
}
