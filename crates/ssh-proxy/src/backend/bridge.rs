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

//! Per-channel bridging between the inbound and backend SSH connections.
//!
//! Every bridged pair is owned by a single task. The frontend handler feeds
//! it client-side events through a bounded mpsc (bound 1, so a slow backend
//! window blocks the inbound reader instead of buffering), and the task
//! relays backend [`ChannelMsg`]s to the client through the server
//! [`Handle`]. One task per pair means nothing can outlive the session: the
//! frontend dropping its senders, or the backend channel closing, both end
//! the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use russh::server::Handle;
use russh::{Channel, ChannelId, ChannelMsg, ChannelWriteHalf, Pty, Sig, client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Live bridged channels for one session, keyed by the inbound-side channel
/// id. Shared between the frontend handler (which inserts forward pairs and
/// routes client events) and the backend handler (which inserts reverse
/// pairs for backend-opened channels).
pub(crate) type ChannelMap = Arc<Mutex<HashMap<ChannelId, mpsc::Sender<ChannelEvent>>>>;

pub(crate) fn new_channel_map() -> ChannelMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// A client-side event to relay to the backend side of a bridged pair.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Data(Vec<u8>),
    ExtendedData { ext: u32, data: Vec<u8> },
    Eof,
    Close,
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    Env { name: String, value: String },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
}

impl ChannelEvent {
    /// Whether the client may be waiting on a success/failure reply for this
    /// event. Requests are forwarded downstream with `want_reply` set, and
    /// the backend's answer is relayed back; everything else is
    /// fire-and-forget.
    pub(crate) fn expects_reply(&self) -> bool {
        matches!(
            self,
            ChannelEvent::Pty { .. }
                | ChannelEvent::Shell
                | ChannelEvent::Exec(_)
                | ChannelEvent::Subsystem(_)
                | ChannelEvent::Env { .. }
        )
    }
}

/// Bridge one channel pair until either side closes. `backend_channel` is
/// the backend-side channel; `channel_id` is the inbound-side id the relayed
/// messages are written to through `server_handle`.
pub(crate) fn spawn(
    backend_channel: Channel<client::Msg>,
    server_handle: Handle,
    channel_id: ChannelId,
    mut events_rx: mpsc::Receiver<ChannelEvent>,
    channels: ChannelMap,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut backend_rx, backend_tx) = backend_channel.split();
        // Requests forwarded to the backend whose replies have not come back
        // yet. Replies are FIFO per channel, which is exactly how SSH matches
        // them to requests.
        let mut pending_replies: usize = 0;

        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => {
                        let expects_reply = event.expects_reply();
                        let closing = matches!(event, ChannelEvent::Close);
                        if let Err(error) = relay_event(event, &backend_tx).await {
                            tracing::debug!(%channel_id, %error, "error relaying to backend channel");
                            fail_pending(&server_handle, channel_id, pending_replies).await;
                            server_handle.close(channel_id).await.ok();
                            break;
                        }
                        if expects_reply {
                            pending_replies += 1;
                        }
                        if closing {
                            break;
                        }
                    }
                    // The frontend connection is gone; close our half.
                    None => {
                        backend_tx.eof().await.ok();
                        backend_tx.close().await.ok();
                        break;
                    }
                },

                msg = backend_rx.wait() => match msg {
                    Some(msg) => {
                        if pending_replies > 0
                            && matches!(msg, ChannelMsg::Success | ChannelMsg::Failure)
                        {
                            pending_replies -= 1;
                        }
                        match relay_backend_msg(msg, &server_handle, channel_id).await {
                            Ok(BackendMsgOutcome::Continue) => {}
                            Ok(BackendMsgOutcome::Closed) => break,
                            Err(()) => {
                                tracing::debug!(%channel_id, "inbound connection gone, dropping backend channel");
                                backend_tx.close().await.ok();
                                break;
                            }
                        }
                    }
                    // Backend channel is gone. Any reply the client is still
                    // waiting for will never arrive; answer locally.
                    None => {
                        fail_pending(&server_handle, channel_id, pending_replies).await;
                        server_handle.close(channel_id).await.ok();
                        break;
                    }
                },
            }
        }

        channels
            .lock()
            .expect("lock poisoned")
            .remove(&channel_id);
    })
}

/// Relay a client-side event to the backend write half. Requests carry
/// `want_reply = true` so the backend's answer can be propagated back.
async fn relay_event(
    event: ChannelEvent,
    backend_tx: &ChannelWriteHalf<client::Msg>,
) -> Result<(), russh::Error> {
    match event {
        ChannelEvent::Data(data) => backend_tx.data(data.as_slice()).await,
        ChannelEvent::ExtendedData { ext, data } => {
            backend_tx.extended_data(ext, data.as_slice()).await
        }
        ChannelEvent::Eof => backend_tx.eof().await,
        ChannelEvent::Close => backend_tx.close().await,
        ChannelEvent::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            backend_tx
                .request_pty(
                    true, &term, col_width, row_height, pix_width, pix_height, &modes,
                )
                .await
        }
        ChannelEvent::Shell => backend_tx.request_shell(true).await,
        ChannelEvent::Exec(command) => backend_tx.exec(true, command).await,
        ChannelEvent::Subsystem(name) => backend_tx.request_subsystem(true, &name).await,
        ChannelEvent::Env { name, value } => backend_tx.set_env(true, &name, &value).await,
        ChannelEvent::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            backend_tx
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        ChannelEvent::Signal(signal) => backend_tx.signal(signal).await,
    }
}

enum BackendMsgOutcome {
    Continue,
    Closed,
}

/// Relay one backend message to the inbound side of the pair. `Err(())`
/// means the inbound connection is no longer writable.
async fn relay_backend_msg(
    msg: ChannelMsg,
    server_handle: &Handle,
    channel_id: ChannelId,
) -> Result<BackendMsgOutcome, ()> {
    match msg {
        ChannelMsg::Data { data } => {
            server_handle
                .data(channel_id, data)
                .await
                .map_err(|_| ())?;
        }
        ChannelMsg::ExtendedData { data, ext } => {
            server_handle
                .extended_data(channel_id, ext, data)
                .await
                .map_err(|_| ())?;
        }
        ChannelMsg::Eof => {
            server_handle.eof(channel_id).await.map_err(|_| ())?;
        }
        ChannelMsg::Close => {
            server_handle.close(channel_id).await.ok();
            return Ok(BackendMsgOutcome::Closed);
        }
        ChannelMsg::Success => {
            server_handle
                .channel_success(channel_id)
                .await
                .map_err(|_| ())?;
        }
        ChannelMsg::Failure => {
            server_handle
                .channel_failure(channel_id)
                .await
                .map_err(|_| ())?;
        }
        ChannelMsg::ExitStatus { exit_status } => {
            server_handle
                .exit_status_request(channel_id, exit_status)
                .await
                .map_err(|_| ())?;
        }
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => {
            server_handle
                .exit_signal_request(channel_id, signal_name, core_dumped, error_message, lang_tag)
                .await
                .map_err(|_| ())?;
        }
        // Window adjusts are flow control between us and the backend; russh
        // manages the inbound window separately.
        ChannelMsg::WindowAdjusted { .. } => {}
        msg => {
            tracing::trace!(%channel_id, "ignoring backend channel message {msg:?}");
        }
    }
    Ok(BackendMsgOutcome::Continue)
}

/// Locally answer requests whose replies will never arrive because the
/// backend went away.
async fn fail_pending(server_handle: &Handle, channel_id: ChannelId, pending: usize) {
    for _ in 0..pending {
        server_handle.channel_failure(channel_id).await.ok();
    }
}
