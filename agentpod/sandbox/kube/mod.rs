//! Kubernetes implementation of [`PodBackend`](super::backend::PodBackend).

pub mod client;
mod exec;
pub mod models;

pub use client::KubeClient;
