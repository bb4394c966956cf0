//! Tenant reconciler for kenv
//!
//! - [`client`] - cluster operations behind a mockable trait
//! - [`desired`] - the objects a Tenant declares for each namespace
//! - [`reconciler`] - the periodic converger

#![deny(missing_docs)]

pub mod client;
pub mod desired;
pub mod reconciler;

pub use client::{TenantKubeClient, TenantKubeClientImpl};
pub use reconciler::{ReconcilerConfig, TenantOutcome, TenantReconciler, TickReport};

pub use kenv_common::{Error, Result};
