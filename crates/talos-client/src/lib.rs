//! Talos Machine API Client
//!
//! A small client for the parts of the Talos `machine.MachineService` gRPC
//! API the provisioning controller needs: applying configuration,
//! bootstrapping etcd, reading the admin kubeconfig, resetting a node and
//! listing services.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use talos_client::{ApplyMode, ClientBundle, MachineClientTrait, TalosClient, Target};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // A fresh machine in maintenance mode accepts an unauthenticated channel
//! let target = Target::new("10.0.0.9", None);
//! let client = TalosClient::connect(&target, &ClientBundle::insecure(), Duration::from_secs(30)).await?;
//!
//! // Push the first configuration without rebooting
//! client.apply_configuration(b"version: v1alpha1\n", ApplyMode::NoReboot).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Maintenance mode**: `insecure` credentials skip server verification
//! - **Pinned identity**: authenticated connections expect the dialed IP in the server certificate
//! - **Proxying**: an endpoint different from the node routes through the `nodes` header
//! - **Mocking**: `test-util` exposes `MockTalosClient` and `MockConnector`

pub mod client;
pub mod error;
pub mod kubeconfig;
pub mod models;
#[path = "trait.rs"]
pub mod talos_trait;
pub mod tls;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{TalosClient, TalosConnector};
pub use error::TalosError;
pub use kubeconfig::{extract_kubeconfig, parse_kubeconfig};
pub use models::{ApplyMode, ApplyOutcome, ClientBundle, KubeconfigBundle, Target, DEFAULT_PORT};
pub use talos_trait::{MachineClientTrait, MachineConnector};
pub use tls::{SecurityMode, TlsSettings, client_tls_config, server_name};
#[cfg(feature = "test-util")]
pub use mock::{MockConnector, MockTalosClient, RecordedConnection};
