//! Sandbox module for isolated per-session working copies.
//!
//! This module provides the [`SandboxProvider`] trait for creating isolated
//! sandboxes and the [`CopySandbox`] implementation using directory copies
//! with a linked dependency directory.

mod copy;
mod provider;

pub use copy::{CopySandbox, CopySandboxInstance};
pub use provider::{
    PreviewHandle, PreviewLauncher, Sandbox, SandboxLayout, SandboxProvider,
};
