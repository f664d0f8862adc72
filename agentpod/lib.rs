//! Isolated Kubernetes sandboxes for agent workloads.
//!
//! [`sandbox::SandboxProvider`] creates one pod per project, waits for it to
//! become ready and hands back a [`sandbox::Sandbox`] for running commands,
//! streaming output and driving tmux sessions inside it.

pub mod config;
pub mod sandbox;
