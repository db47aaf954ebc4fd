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

//! Outbound SSH connection to the resolved target instance.
//!
//! The instance's identity is pinned by the MD5 fingerprint carried in the
//! desired LRP's SSH route, not by a CA chain; the scheduler is the trust
//! root here. Authentication is public-key with the per-instance private key
//! from the same route.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect, server};
use tokio::sync::mpsc;

use crate::auth::Permission;
use crate::backend::bridge::{self, ChannelMap};
use crate::routes;

/// Username the instance-side SSH daemon accepts for proxied sessions.
const BACKEND_USER: &str = "diego";

static RUSSH_CLIENT_CONFIG: LazyLock<Arc<client::Config>> = LazyLock::new(|| {
    Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(60)),
        keepalive_max: 2,
        ..Default::default()
    })
});

/// Dial the target named by the permission and authenticate. Exactly one
/// dial is attempted per authenticated inbound connection.
pub(crate) async fn connect(
    permission: &Permission,
    server_handle: server::Handle,
    channels: ChannelMap,
) -> Result<client::Handle<BackendHandler>, ConnectError> {
    let addr = format!("{}:{}", permission.host, permission.port);

    let key = russh::keys::decode_secret_key(&permission.private_key_pem, None)
        .map_err(|error| ConnectError::LoadingKey { error })?;

    let mismatch = Arc::new(AtomicBool::new(false));
    let handler = BackendHandler {
        expected_fingerprint: permission.host_fingerprint.clone(),
        server_handle,
        channels,
        mismatch: mismatch.clone(),
        addr: addr.clone(),
    };

    let mut handle = client::connect(
        RUSSH_CLIENT_CONFIG.clone(),
        (permission.host.as_str(), permission.port),
        handler,
    )
    .await
    .map_err(|error| {
        if mismatch.load(Ordering::SeqCst) {
            ConnectError::HostKeyMismatch { addr: addr.clone() }
        } else {
            ConnectError::Connection {
                addr: addr.clone(),
                error,
            }
        }
    })?;

    let rsa_hash = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|error| ConnectError::Authentication {
            addr: addr.clone(),
            error,
        })?
        .flatten();

    let auth = handle
        .authenticate_publickey(
            BACKEND_USER,
            PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
        )
        .await
        .map_err(|error| ConnectError::Authentication {
            addr: addr.clone(),
            error,
        })?;

    match auth {
        AuthResult::Success => Ok(handle),
        AuthResult::Failure { .. } => Err(ConnectError::AuthenticationFailed { addr }),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("error loading the instance private key: {error}")]
    LoadingKey { error: russh::keys::Error },
    #[error("error connecting to {addr}: {error}")]
    Connection {
        addr: String,
        error: russh::Error,
    },
    #[error("host-key-fingerprint-mismatch for {addr}")]
    HostKeyMismatch { addr: String },
    #[error("error authenticating to {addr}: {error}")]
    Authentication {
        addr: String,
        error: russh::Error,
    },
    #[error("could not authenticate to {addr} as {BACKEND_USER}")]
    AuthenticationFailed { addr: String },
}

impl ConnectError {
    pub fn is_host_key_mismatch(&self) -> bool {
        matches!(self, ConnectError::HostKeyMismatch { .. })
    }
}

pub struct BackendHandler {
    expected_fingerprint: String,
    server_handle: server::Handle,
    channels: ChannelMap,
    mismatch: Arc<AtomicBool>,
    addr: String,
}

impl Drop for BackendHandler {
    // The backend session task owns this handler, so it is dropped exactly
    // when the outbound connection ends. The inbound connection must not
    // outlive it.
    fn drop(&mut self) {
        let server_handle = self.server_handle.clone();
        let addr = self.addr.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tracing::debug!(backend = %addr, "backend connection ended, disconnecting client");
                server_handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "target instance connection closed".into(),
                        "".into(),
                    )
                    .await
                    .ok();
            });
        }
    }
}

impl client::Handler for BackendHandler {
    type Error = russh::Error;

    /// The target is trusted iff its host key's MD5 fingerprint equals the
    /// one the scheduler put in the SSH route.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = routes::md5_fingerprint(server_public_key);
        if routes::fingerprints_match(&presented, &self.expected_fingerprint) {
            Ok(true)
        } else {
            self.mismatch.store(true, Ordering::SeqCst);
            tracing::warn!(
                backend = %self.addr,
                presented = %presented,
                expected = %self.expected_fingerprint,
                "host-key-fingerprint-mismatch"
            );
            Ok(false)
        }
    }

    /// The backend wants to open a channel toward the client (a remote
    /// forward it accepted on the client's behalf). Open the matching
    /// channel on the inbound connection and bridge the pair.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let inbound = self
            .server_handle
            .channel_open_forwarded_tcpip(
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            )
            .await?;
        let channel_id = inbound.id();

        let (events_tx, events_rx) = mpsc::channel(1);
        self.channels
            .lock()
            .expect("lock poisoned")
            .insert(channel_id, events_tx);
        bridge::spawn(
            channel,
            self.server_handle.clone(),
            channel_id,
            events_rx,
            self.channels.clone(),
        );

        Ok(())
    }
}
