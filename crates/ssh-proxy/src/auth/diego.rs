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

//! The `diego` realm: shared cluster credential, direct process addressing.
//!
//! Username shape is `diego:<process-guid>/<index>`; the password must equal
//! the operator-configured cluster credential. The credential check runs
//! first so that a bad password never reaches the BBS.

use std::sync::{Arc, LazyLock};

use bbs::BbsClient;
use regex::Regex;
use subtle::ConstantTimeEq;

use crate::auth::{AuthFailure, Authenticator, Permission, resolve_process};

static PRINCIPAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-zA-Z_-]+)/(\d+)$").expect("BUG: static principal regex must compile")
});

pub struct DiegoAuthenticator {
    credentials: String,
    bbs: Arc<BbsClient>,
}

impl DiegoAuthenticator {
    pub fn new(credentials: String, bbs: Arc<BbsClient>) -> Self {
        Self { credentials, bbs }
    }
}

#[async_trait::async_trait]
impl Authenticator for DiegoAuthenticator {
    fn realm(&self) -> &'static str {
        "diego"
    }

    async fn authenticate(
        &self,
        principal: &str,
        password: &str,
    ) -> Result<Permission, AuthFailure> {
        if !bool::from(password.as_bytes().ct_eq(self.credentials.as_bytes())) {
            return Err(AuthFailure::BadCredentials);
        }

        let (process_guid, index) = parse_principal(principal)?;
        resolve_process(
            &self.bbs,
            &process_guid,
            index,
            format!("diego:{principal}"),
        )
        .await
    }
}

pub(crate) fn parse_principal(principal: &str) -> Result<(String, i32), AuthFailure> {
    let captures = PRINCIPAL_RE
        .captures(principal)
        .ok_or(AuthFailure::BadUserFormat)?;
    let process_guid = captures[1].to_string();
    let index = captures[2]
        .parse::<i32>()
        .map_err(|_| AuthFailure::BadUserFormat)?;
    Ok((process_guid, index))
}
