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

pub mod fake_bbs;
pub mod fake_cf;
pub mod target_sshd;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use eyre::Context;
use russh::ChannelMsg;
use russh::client::AuthResult;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};

/// A fresh Ed25519 key and its OpenSSH PEM encoding.
pub fn generate_keypair() -> (PrivateKey, String) {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("generate key");
    let pem = key
        .to_openssh(LineEnding::LF)
        .expect("encode key")
        .to_string();
    (key, pem)
}

/// Client handler that records the host key the server presented. With
/// `accept = false` it aborts the handshake right after capturing it.
pub struct CapturingClient {
    pub captured: Arc<Mutex<Option<PublicKey>>>,
    pub accept: bool,
}

impl CapturingClient {
    pub fn permissive() -> Self {
        Self {
            captured: Arc::new(Mutex::new(None)),
            accept: true,
        }
    }

    pub fn capture_only(captured: Arc<Mutex<Option<PublicKey>>>) -> Self {
        Self {
            captured,
            accept: false,
        }
    }
}

impl russh::client::Handler for CapturingClient {
    type Error = eyre::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        *self.captured.lock().expect("lock poisoned") = Some(server_public_key.clone());
        Ok(self.accept)
    }
}

/// Dial the proxy and run password userauth. `Ok(Some(session))` means the
/// server accepted the credentials.
pub async fn connect_and_auth(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> eyre::Result<Option<russh::client::Handle<CapturingClient>>> {
    let mut session = russh::client::connect(
        Arc::new(russh::client::Config::default()),
        addr,
        CapturingClient::permissive(),
    )
    .await
    .context("connecting to proxy")?;

    match session
        .authenticate_password(user, password)
        .await
        .context("password userauth")?
    {
        AuthResult::Success => Ok(Some(session)),
        AuthResult::Failure { .. } => Ok(None),
    }
}

/// Authenticate, open a session channel, run `command`, and collect stdout
/// until the channel ends. Fails if the exec request is refused or the exit
/// status is nonzero.
pub async fn exec_output(
    addr: SocketAddr,
    user: &str,
    password: &str,
    command: &str,
) -> eyre::Result<String> {
    let session = connect_and_auth(addr, user, password)
        .await?
        .ok_or_else(|| eyre::format_err!("authentication failed"))?;

    let mut channel = session
        .channel_open_session()
        .await
        .context("opening session channel")?;
    channel.exec(true, command).await.context("exec request")?;

    let mut stdout = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    match exit_status {
        Some(0) => Ok(String::from_utf8(stdout).context("stdout was not utf-8")?),
        Some(code) => Err(eyre::format_err!("command exited with status {code}")),
        None => Err(eyre::format_err!("channel ended without an exit status")),
    }
}
