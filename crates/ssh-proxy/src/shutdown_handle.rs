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

use tokio::sync::oneshot;

/// Convenience trait for a task with a shutdown handle (in the form of a
/// [`oneshot::Sender<()>`]).
///
/// Dropping the handle means "shut down now": anything awaiting the channel
/// returns immediately whether a message was sent or the sender was dropped,
/// and by convention both mean the same thing.
pub trait ShutdownHandle<R> {
    fn into_parts(self) -> (oneshot::Sender<()>, tokio::task::JoinHandle<R>);

    fn shutdown_and_wait(self) -> impl std::future::Future<Output = R> + Send
    where
        Self: Send + Sized,
        R: Send,
    {
        async move {
            let (shutdown_tx, join_handle) = self.into_parts();
            std::mem::drop(shutdown_tx);
            join_handle.await.expect("task panicked")
        }
    }
}
