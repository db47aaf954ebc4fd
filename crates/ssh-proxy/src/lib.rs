/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

//! An authenticating SSH reverse proxy for container-hosted app instances.
//!
//! One inbound SSH connection, one realm-prefixed credential, one lookup in
//! the cluster control plane, one outbound SSH connection to the resolved
//! instance, and a bridge between the two until either side hangs up.

mod auth;
mod backend;
mod frontend;
mod metrics;
mod ssh_server;

// pub mods are the ones used by main.rs and integration tests
pub mod config;
pub mod routes;
pub mod shutdown_handle;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::{CfAuthenticator, DiegoAuthenticator, Registry};
use crate::config::Config;
use crate::metrics::MetricsState;
use crate::shutdown_handle::ShutdownHandle;

pub use crate::auth::CfBuildError;
pub use crate::metrics::SpawnError as MetricsSpawnError;
pub use crate::ssh_server::SpawnError as SshServerSpawnError;

/// Run an ssh-proxy in the background, returning a [`SpawnHandle`] once both
/// listeners are bound. When the handle is dropped, the proxy exits.
pub async fn spawn(config: Config) -> Result<SpawnHandle, SpawnError> {
    let settings = Arc::new(config.validate()?);
    let metrics = Arc::new(MetricsState::new());

    let bbs_client = Arc::new(
        bbs::BbsClient::new(settings.bbs_url.clone(), settings.api_timeout)
            .map_err(SpawnError::BbsClient)?,
    );

    let mut registry = Registry::new();
    if let Some(diego) = &settings.diego {
        registry.register(Box::new(DiegoAuthenticator::new(
            diego.credentials.clone(),
            bbs_client.clone(),
        )));
    }
    if let Some(cf) = &settings.cf {
        registry.register(Box::new(
            CfAuthenticator::new(
                cf.clone(),
                settings.skip_cert_verify,
                settings.api_timeout,
                bbs_client.clone(),
            )
            .map_err(SpawnError::CfRealm)?,
        ));
    }
    if registry.is_empty() {
        tracing::warn!("no authentication realms are enabled; every connection will be rejected");
    }

    let server = ssh_server::spawn(settings.clone(), Arc::new(registry), &metrics.meter).await?;
    let local_addr = server.local_addr;

    let metrics_server = metrics::spawn(settings.metrics_address, metrics.clone()).await?;
    let metrics_addr = metrics_server.local_addr;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(async move {
        shutdown_rx.await.ok();
        metrics_server.shutdown_and_wait().await;
        server.shutdown_and_wait().await;
    });

    Ok(SpawnHandle {
        local_addr,
        metrics_addr,
        shutdown_tx,
        join_handle,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("{0}")]
    Config(#[from] config::ConfigError),
    #[error("Error building BBS client: {0}")]
    BbsClient(bbs::BuildError),
    #[error("Error building cf realm: {0}")]
    CfRealm(CfBuildError),
    #[error("Error spawning SSH server: {0}")]
    SshServerSpawn(#[from] SshServerSpawnError),
    #[error("Error spawning metrics server: {0}")]
    MetricsSpawn(#[from] MetricsSpawnError),
}

pub struct SpawnHandle {
    /// Where the SSH listener actually bound (useful with port 0).
    pub local_addr: SocketAddr,
    /// Where the metrics listener actually bound.
    pub metrics_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ShutdownHandle<()> for SpawnHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}
