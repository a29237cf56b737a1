//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::turnstile::admission::v1::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{RateLimiterDescriptor, RateLimiters};

/// gRPC server for the admission service.
pub struct GrpcServer<D: RateLimiterDescriptor> {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter registry
    rate_limiters: Arc<RateLimiters<D>>,
}

impl<D: RateLimiterDescriptor> GrpcServer<D> {
    /// Create a new gRPC server over a rate limiter registry.
    pub fn new(addr: SocketAddr, rate_limiters: Arc<RateLimiters<D>>) -> Self {
        Self {
            addr,
            rate_limiters,
        }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.rate_limiters);

        info!(
            addr = %self.addr,
            "Starting gRPC server for AdmissionService"
        );

        Server::builder()
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TurnstileError::Grpc(e)
            })
    }
}
