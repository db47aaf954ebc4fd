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

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use russh::server::run_stream;
use russh::{Disconnect, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::Registry;
use crate::config::Settings;
use crate::frontend::{Handler, HandlerError};
use crate::shutdown_handle::ShutdownHandle;

pub(crate) async fn spawn(
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    meter: &Meter,
) -> Result<Handle, SpawnError> {
    use SpawnError::*;

    let metrics = Arc::new(ServerMetrics::new(meter));

    let russh_config = Arc::new(russh::server::Config {
        keys: vec![settings.host_key.clone()],
        // The userauth callback is the only door; password is the only key.
        methods: MethodSet::from([MethodKind::Password].as_slice()),
        nodelay: true,
        auth_rejection_time: Duration::from_millis(30),
        ..Default::default()
    });

    let listener = TcpListener::bind(settings.listen_address)
        .await
        .map_err(|error| Listening {
            addr: settings.listen_address,
            error,
        })?;
    let local_addr = listener.local_addr().map_err(|error| Listening {
        addr: settings.listen_address,
        error,
    })?;
    tracing::info!("listening on {local_addr}");

    let server = SshServer {
        settings,
        registry,
        russh_config,
        metrics,
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(server.run(listener, shutdown_rx));

    Ok(Handle {
        local_addr,
        shutdown_tx,
        join_handle,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("Error listening on {addr}: {error}")]
    Listening {
        addr: SocketAddr,
        error: std::io::Error,
    },
}

pub struct Handle {
    pub local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ShutdownHandle<()> for Handle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}

struct SshServer {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    russh_config: Arc<russh::server::Config>,
    metrics: Arc<ServerMetrics>,
}

impl SshServer {
    /// Accept connections forever, until `shutdown` fires (or its sending
    /// end is dropped).
    async fn run(self, socket: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                accept_result = socket.accept() => {
                    match accept_result {
                        Ok((socket, peer_addr)) => {
                            self.serve_connection(socket, Some(peer_addr));
                        }
                        Err(error) => {
                            tracing::error!(%error, "Error accepting SSH connection from socket");
                            break;
                        }
                    }
                },

                _ = &mut shutdown => break,
            }
        }
    }

    fn serve_connection(&self, socket: TcpStream, peer_addr: Option<SocketAddr>) {
        let russh_config = self.russh_config.clone();
        let handshake_timeout = self.settings.handshake_timeout;
        let (authed_tx, authed_rx) = oneshot::channel();
        let handler = Handler::new(
            self.registry.clone(),
            self.metrics.clone(),
            peer_addr,
            authed_tx,
        );

        tokio::spawn(async move {
            if russh_config.nodelay
                && let Err(error) = socket.set_nodelay(true)
            {
                tracing::warn!(%error, "set_nodelay() failed");
            }

            let session = match run_stream(russh_config, socket, handler).await {
                Ok(s) => s,
                Err(HandlerError::Russh(russh::Error::Disconnect)) => {
                    // If it was a simple disconnect, don't log a scary
                    // looking error.
                    tracing::debug!("client disconnected");
                    return;
                }
                Err(HandlerError::Russh(russh::Error::ConnectionTimeout)) => {
                    tracing::debug!("client connection timeout");
                    return;
                }
                Err(HandlerError::Russh(error)) => {
                    tracing::warn!(%error, "Connection setup failed with internal russh error");
                    return;
                }
                Err(error) => {
                    tracing::warn!(%error, "Connection setup failed");
                    return;
                }
            };

            // The handler signals authed_rx once userauth completes. Until
            // then the handshake deadline applies; afterwards the session
            // lives as long as the peers keep it alive.
            let handle = session.handle();
            tokio::pin!(session);
            tokio::select! {
                result = &mut session => {
                    log_session_end(result);
                    return;
                }
                _ = authed_rx => {}
                _ = tokio::time::sleep(handshake_timeout) => {
                    tracing::info!("handshake did not complete in {handshake_timeout:?}, disconnecting");
                    handle
                        .disconnect(
                            Disconnect::ByApplication,
                            "handshake timed out".into(),
                            "".into(),
                        )
                        .await
                        .ok();
                }
            }

            log_session_end((&mut session).await);
        });
    }
}

fn log_session_end(result: Result<(), HandlerError>) {
    match result {
        Ok(_) => tracing::debug!("Connection closed"),
        Err(HandlerError::Russh(russh::Error::IO(io_error))) => match io_error.kind() {
            io::ErrorKind::UnexpectedEof => {
                tracing::debug!("eof from client");
            }
            error => {
                tracing::warn!(%error, "Connection closed with error");
            }
        },
        Err(error) => {
            tracing::warn!(%error, "Connection closed with error");
        }
    }
}

pub(crate) struct ServerMetrics {
    pub total_clients: UpDownCounter<i64>,
    pub client_auth_failures_total: Counter<u64>,
    pub backend_dial_failures_total: Counter<u64>,
}

impl ServerMetrics {
    fn new(meter: &Meter) -> ServerMetrics {
        Self {
            total_clients: meter
                .i64_up_down_counter("ssh_proxy_total_clients")
                .with_description("The number of SSH clients currently connected to the proxy")
                .build(),
            client_auth_failures_total: meter
                .u64_counter("ssh_proxy_client_auth_failures")
                .with_description("The number of SSH client authentication attempts denied")
                .build(),
            backend_dial_failures_total: meter
                .u64_counter("ssh_proxy_backend_dial_failures")
                .with_description(
                    "The number of sessions dropped because the target instance was unreachable",
                )
                .build(),
        }
    }
}
