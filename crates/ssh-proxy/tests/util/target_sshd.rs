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

//! A minimal instance-side SSH daemon: public-key auth against a single
//! authorized key, session channels, and a canned `exec` implementation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use russh::server::{Auth, Handler, Msg, Session, run_stream};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct TargetSshd {
    pub addr: SocketAddr,
    auth_attempts: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TargetSshd {
    pub async fn spawn(host_key: PrivateKey, authorized_key: PublicKey) -> eyre::Result<Self> {
        let config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            methods: MethodSet::from([MethodKind::PublicKey].as_slice()),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let auth_attempts = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let auth_attempts = auth_attempts.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let handler = TargetHandler {
                        authorized_key: authorized_key.clone(),
                        auth_attempts: auth_attempts.clone(),
                        channels: HashMap::new(),
                    };
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Ok(session) = run_stream(config, stream, handler).await {
                            session.await.ok();
                        }
                    });
                }
            }
        });

        Ok(Self {
            addr,
            auth_attempts,
            task,
        })
    }

    pub fn auth_attempts(&self) -> usize {
        self.auth_attempts.load(Ordering::SeqCst)
    }
}

impl Drop for TargetSshd {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct TargetHandler {
    authorized_key: PublicKey,
    auth_attempts: Arc<AtomicUsize>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl Handler for TargetHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.auth_attempts.fetch_add(1, Ordering::SeqCst);
        if user == "diego"
            && public_key.public_key_base64() == self.authorized_key.public_key_base64()
        {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        // The only command the scenarios run. Anything else is a failed
        // request, which exercises the proxy's failure propagation.
        if data == b"echo -n hello" {
            session.channel_success(channel_id)?;
            channel.data(b"hello".as_slice()).await?;
            channel.exit_status(0).await?;
            channel.eof().await?;
            channel.close().await?;
        } else {
            session.channel_failure(channel_id)?;
            channel.close().await?;
        }
        Ok(())
    }
}
