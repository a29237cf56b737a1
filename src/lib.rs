//! Turnstile - Leaky-Bucket Admission Control
//!
//! This crate implements per-caller rate limiting for a set of named
//! actions. Each limiter is a leaky bucket whose state lives in a shared
//! store (Redis, or an in-memory map for development), so every instance
//! that talks to the same store enforces the same quota.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
