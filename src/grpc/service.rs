//! Admission service implementation.

use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::turnstile::admission::v1::{
    admission_service_server::AdmissionService, validate_response::Code, CheckAvailableResponse,
    ClearRequest, ClearResponse, ValidateRequest, ValidateResponse,
};

use crate::ratelimit::{RateLimitError, RateLimiter, RateLimiterDescriptor, RateLimiters};

/// Implementation of the `AdmissionService` gRPC interface.
pub struct AdmissionServiceImpl<D: RateLimiterDescriptor> {
    /// The rate limiter registry
    rate_limiters: Arc<RateLimiters<D>>,
}

impl<D: RateLimiterDescriptor> AdmissionServiceImpl<D> {
    /// Create a new AdmissionServiceImpl over the given registry.
    pub fn new(rate_limiters: Arc<RateLimiters<D>>) -> Self {
        Self { rate_limiters }
    }

    /// Resolve the limiter and check the caller key.
    fn limiter(&self, descriptor_id: &str, caller_key: &str) -> Result<Arc<RateLimiter>, Status> {
        if caller_key.is_empty() {
            warn!(descriptor = %descriptor_id, "Received admission request with empty caller key");
            return Err(Status::invalid_argument("caller_key is required"));
        }

        self.rate_limiters.by_id(descriptor_id).ok_or_else(|| {
            warn!(descriptor = %descriptor_id, "Received admission request for unknown descriptor");
            Status::not_found(format!("unknown rate limiter: {}", descriptor_id))
        })
    }
}

/// Permits requested, defaulting to one.
fn requested_permits(permits: f64) -> f64 {
    if permits == 0.0 {
        1.0
    } else {
        permits
    }
}

fn to_proto_duration(duration: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

/// Map a limiter failure that is not a denial to a gRPC status.
fn to_status(error: RateLimitError) -> Status {
    match error {
        RateLimitError::InvalidPermits(_) => Status::invalid_argument(error.to_string()),
        RateLimitError::Unavailable { .. } => Status::unavailable(error.to_string()),
        RateLimitError::Exceeded { .. } => Status::resource_exhausted(error.to_string()),
    }
}

#[tonic::async_trait]
impl<D: RateLimiterDescriptor> AdmissionService for AdmissionServiceImpl<D> {
    /// Consume permits from the caller's bucket.
    #[instrument(
        skip(self, request),
        fields(
            descriptor = %request.get_ref().descriptor_id,
            permits = request.get_ref().permits
        )
    )]
    async fn validate(
        &self,
        request: Request<ValidateRequest>,
    ) -> Result<Response<ValidateResponse>, Status> {
        let req = request.into_inner();
        let limiter = self.limiter(&req.descriptor_id, &req.caller_key)?;
        let permits = requested_permits(req.permits);

        debug!(
            descriptor = %req.descriptor_id,
            permits = permits,
            "Processing admission request"
        );

        let response = match limiter.validate_permits(&req.caller_key, permits).await {
            Ok(()) => ValidateResponse {
                code: Code::Ok.into(),
                retry_after: None,
            },
            Err(RateLimitError::Exceeded { retry_after }) => ValidateResponse {
                code: Code::OverLimit.into(),
                retry_after: Some(to_proto_duration(retry_after)),
            },
            Err(e) => return Err(to_status(e)),
        };

        info!(
            descriptor = %req.descriptor_id,
            code = ?response.code(),
            "Admission decision made"
        );

        Ok(Response::new(response))
    }

    /// Report whether permits are available without consuming them.
    #[instrument(
        skip(self, request),
        fields(descriptor = %request.get_ref().descriptor_id)
    )]
    async fn check_available(
        &self,
        request: Request<ValidateRequest>,
    ) -> Result<Response<CheckAvailableResponse>, Status> {
        let req = request.into_inner();
        let limiter = self.limiter(&req.descriptor_id, &req.caller_key)?;

        let available = limiter
            .has_available_permits(&req.caller_key, requested_permits(req.permits))
            .await
            .map_err(to_status)?;

        Ok(Response::new(CheckAvailableResponse { available }))
    }

    /// Reset the caller's bucket.
    #[instrument(
        skip(self, request),
        fields(descriptor = %request.get_ref().descriptor_id)
    )]
    async fn clear(
        &self,
        request: Request<ClearRequest>,
    ) -> Result<Response<ClearResponse>, Status> {
        let req = request.into_inner();
        let limiter = self.limiter(&req.descriptor_id, &req.caller_key)?;

        limiter.clear(&req.caller_key).await.map_err(to_status)?;

        info!(descriptor = %req.descriptor_id, "Rate limit bucket cleared");
        Ok(Response::new(ClearResponse {}))
    }
}
