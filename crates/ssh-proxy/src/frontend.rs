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

//! Per-connection handler for the inbound SSH server.
//!
//! `auth_password` is the single entry point into the authenticator
//! registry; a success leaves the resulting [`Permission`] on the handler,
//! and `auth_succeeded` consumes it to dial the backend. After that every
//! channel open becomes a bridged pair, and every callback here is a relay
//! into the pair's task.

use std::net::SocketAddr;
use std::sync::Arc;

use opentelemetry::KeyValue;
use russh::server::{Auth, Handler as RusshHandler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, Pty, Sig, client};
use tokio::sync::{mpsc, oneshot};

use crate::auth::{AuthFailure, Permission, Registry};
use crate::backend::{self, BackendHandler, ChannelEvent, ChannelMap};
use crate::ssh_server::ServerMetrics;

pub(crate) struct Handler {
    registry: Arc<Registry>,
    metrics: Arc<ServerMetrics>,
    peer_addr: String,
    /// Built by the password callback, consumed by `auth_succeeded`.
    permission: Option<Permission>,
    backend: Option<client::Handle<BackendHandler>>,
    channels: ChannelMap,
    /// Tells the accept loop that the handshake deadline no longer applies.
    authed_tx: Option<oneshot::Sender<()>>,
    /// Realm and reason of the most recent failed attempt, for the Drop-time
    /// log and metric. Auth can still succeed afterwards.
    last_auth_failure: Option<(String, AuthFailure)>,
    authenticated_user: Option<String>,
}

impl Handler {
    pub(crate) fn new(
        registry: Arc<Registry>,
        metrics: Arc<ServerMetrics>,
        peer_addr: Option<SocketAddr>,
        authed_tx: oneshot::Sender<()>,
    ) -> Self {
        tracing::debug!("spawning new frontend connection handler");
        metrics.total_clients.add(1, &[]);
        Self {
            registry,
            metrics,
            peer_addr: peer_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            permission: None,
            backend: None,
            channels: backend::new_channel_map(),
            authed_tx: Some(authed_tx),
            last_auth_failure: None,
            authenticated_user: None,
        }
    }

    /// Relay a client-side event to the channel's bridge task. Requests on a
    /// channel that is not bridged (or whose bridge already died) are
    /// answered with a failure; data-ish events racing teardown are dropped.
    async fn relay(&mut self, session: &mut Session, channel_id: ChannelId, event: ChannelEvent) {
        let expects_reply = event.expects_reply();
        let sender = {
            self.channels
                .lock()
                .expect("lock poisoned")
                .get(&channel_id)
                .cloned()
        };

        let delivered = match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        };

        if !delivered && expects_reply {
            tracing::debug!(
                peer_addr = self.peer_addr,
                %channel_id,
                "request on a channel that is not bridged"
            );
            session.channel_failure(channel_id).ok();
        }
    }

    async fn open_backend_channel(
        &mut self,
        session: &mut Session,
        channel_id: ChannelId,
        backend_channel: Result<Channel<client::Msg>, russh::Error>,
    ) -> bool {
        let backend_channel = match backend_channel {
            Ok(channel) => channel,
            Err(error) => {
                tracing::warn!(
                    peer_addr = self.peer_addr,
                    %error,
                    "backend refused channel open"
                );
                return false;
            }
        };

        let (events_tx, events_rx) = mpsc::channel(1);
        self.channels
            .lock()
            .expect("lock poisoned")
            .insert(channel_id, events_tx);
        backend::bridge::spawn(
            backend_channel,
            session.handle(),
            channel_id,
            events_rx,
            self.channels.clone(),
        );
        true
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        tracing::debug!(peer_addr = self.peer_addr, "end frontend connection");
        self.metrics.total_clients.add(-1, &[]);

        // Dropping the senders ends every bridge task for this session.
        self.channels.lock().expect("lock poisoned").clear();

        // All auth failure paths set last_auth_failure, but auth can still
        // succeed later in the same connection, so only report it if the
        // connection never authenticated.
        if self.authenticated_user.is_none()
            && let Some((realm, failure)) = &self.last_auth_failure
        {
            tracing::warn!(
                peer_addr = self.peer_addr,
                realm,
                reason = %failure,
                "authentication failed"
            );
            self.metrics
                .client_auth_failures_total
                .add(1, &[KeyValue::new("realm", realm.clone())]);
        }
    }
}

impl RusshHandler for Handler {
    type Error = HandlerError;

    /// The sole supported userauth method. The wire response never says why
    /// an attempt failed; the reason goes to the logs.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        tracing::trace!(peer_addr = self.peer_addr, "auth_password");
        match self.registry.authenticate(user, password).await {
            Ok(permission) => {
                tracing::info!(
                    peer_addr = self.peer_addr,
                    principal = %permission.log_message,
                    "authentication succeeded"
                );
                self.permission = Some(permission);
                self.authenticated_user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(failure) => {
                let realm = user.split_once(':').map(|(realm, _)| realm).unwrap_or("");
                tracing::debug!(
                    peer_addr = self.peer_addr,
                    realm,
                    reason = %failure,
                    "rejecting authentication"
                );
                self.last_auth_failure = Some((realm.to_string(), failure));
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    /// Userauth is done; open the single outbound connection this session is
    /// allowed. Failure to reach the target is a server fault, reported as
    /// an SSH disconnect rather than a handler error.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        if let Some(authed_tx) = self.authed_tx.take() {
            authed_tx.send(()).ok();
        }

        let Some(permission) = self.permission.clone() else {
            return Err(HandlerError::MissingPermission {
                method: "auth_succeeded",
            });
        };

        match backend::connect(&permission, session.handle(), self.channels.clone()).await {
            Ok(handle) => {
                tracing::info!(
                    peer_addr = self.peer_addr,
                    principal = %permission.log_message,
                    backend = %format_args!("{}:{}", permission.host, permission.port),
                    "backend session established"
                );
                self.backend = Some(handle);
                Ok(())
            }
            Err(error) => {
                self.metrics.backend_dial_failures_total.add(
                    1,
                    &[KeyValue::new(
                        "kind",
                        if error.is_host_key_mismatch() {
                            "host_key_mismatch"
                        } else {
                            "dial"
                        },
                    )],
                );
                tracing::warn!(
                    peer_addr = self.peer_addr,
                    backend = %format_args!("{}:{}", permission.host, permission.port),
                    %error,
                    "could not establish backend session"
                );
                session
                    .handle()
                    .disconnect(
                        Disconnect::ByApplication,
                        "proxy could not reach the target instance".into(),
                        "".into(),
                    )
                    .await
                    .ok();
                Ok(())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::trace!(peer_addr = self.peer_addr, "channel_open_session");
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };
        let backend_channel = backend.channel_open_session().await;
        Ok(self
            .open_backend_channel(session, channel.id(), backend_channel)
            .await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::trace!(
            peer_addr = self.peer_addr,
            host_to_connect,
            port_to_connect,
            "channel_open_direct_tcpip"
        );
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };
        let backend_channel = backend
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await;
        Ok(self
            .open_backend_channel(session, channel.id(), backend_channel)
            .await)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(session, channel, ChannelEvent::Data(data.to_vec()))
            .await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(
            session,
            channel,
            ChannelEvent::ExtendedData {
                ext: code,
                data: data.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(session, channel, ChannelEvent::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(session, channel, ChannelEvent::Close).await;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(
            session,
            channel,
            ChannelEvent::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(session, channel, ChannelEvent::Shell).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(session, channel, ChannelEvent::Exec(data.to_vec()))
            .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(session, channel, ChannelEvent::Subsystem(name.to_string()))
            .await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(
            session,
            channel,
            ChannelEvent::Env {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            },
        )
        .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(
            session,
            channel,
            ChannelEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.relay(session, channel, ChannelEvent::Signal(signal))
            .await;
        Ok(())
    }

    /// Global requests are relayed to the backend and answered with its
    /// verdict.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };
        match backend.tcpip_forward(address, *port).await {
            Ok(_) => Ok(true),
            Err(error) => {
                tracing::debug!(peer_addr = self.peer_addr, %error, "tcpip-forward relay failed");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };
        match backend.cancel_tcpip_forward(address, port).await {
            Ok(_) => Ok(true),
            Err(error) => {
                tracing::debug!(
                    peer_addr = self.peer_addr,
                    %error,
                    "cancel-tcpip-forward relay failed"
                );
                Ok(false)
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("BUG: {method} called but we don't have an authenticated permission")]
    MissingPermission { method: &'static str },
    #[error(transparent)]
    Russh(#[from] russh::Error),
}
