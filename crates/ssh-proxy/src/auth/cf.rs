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

//! The `cf` realm: application addressing with a one-time OAuth code.
//!
//! Username shape is `cf:<app-guid>/<index>`; the password is an
//! authorization code the UAA exchanges for a bearer token, which the Cloud
//! Controller then accepts as proof the caller may SSH to the app. The CC
//! answers with the process guid, and the rest of the flow is the diego one.

use std::sync::Arc;
use std::time::Duration;

use bbs::BbsClient;
use serde::Deserialize;
use url::Url;

use crate::auth::diego::parse_principal;
use crate::auth::{AuthFailure, Authenticator, Permission, resolve_process};
use crate::config::CfSettings;

pub struct CfAuthenticator {
    uaa: UaaClient,
    cc: CcClient,
    bbs: Arc<BbsClient>,
}

impl CfAuthenticator {
    /// `skip_cert_verify` disables TLS verification for the UAA and CC
    /// clients built here, and nothing else.
    pub fn new(
        settings: CfSettings,
        skip_cert_verify: bool,
        timeout: Duration,
        bbs: Arc<BbsClient>,
    ) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_cert_verify)
            .build()
            .map_err(|error| BuildError::HttpClient { error })?;

        Ok(Self {
            uaa: UaaClient {
                client: client.clone(),
                token_url: settings.uaa_token_url,
                client_id: settings.client_id,
                client_secret: settings.client_secret,
            },
            cc: CcClient {
                client,
                api_url: settings.cc_api_url,
            },
            bbs,
        })
    }
}

#[async_trait::async_trait]
impl Authenticator for CfAuthenticator {
    fn realm(&self) -> &'static str {
        "cf"
    }

    async fn authenticate(
        &self,
        principal: &str,
        password: &str,
    ) -> Result<Permission, AuthFailure> {
        let (app_guid, index) = parse_principal(principal)?;

        let token = self.uaa.exchange_code(password).await?;
        let process_guid = self.cc.ssh_access(&token, &app_guid, index).await?;

        resolve_process(&self.bbs, &process_guid, index, format!("cf:{principal}")).await
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("error building cf realm http client: {error}")]
    HttpClient { error: reqwest::Error },
}

struct UaaClient {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct UaaTokenResponse {
    access_token: String,
    token_type: String,
}

impl UaaClient {
    /// Exchange a one-time authorization code for a bearer token. Returns the
    /// full `Authorization` header value (`<token_type> <access_token>`).
    async fn exchange_code(&self, code: &str) -> Result<String, AuthFailure> {
        let response = self
            .client
            .post(self.token_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "authorization_code"), ("code", code)])
            .send()
            .await
            .map_err(|error| AuthFailure::Upstream {
                message: format!("uaa: {error}"),
            })?;

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "UAA rejected authorization code");
            return Err(AuthFailure::UaaDenied);
        }

        let token: UaaTokenResponse = response.json().await.map_err(|_| AuthFailure::UaaDenied)?;
        if token.access_token.is_empty() {
            return Err(AuthFailure::UaaDenied);
        }
        Ok(format!("{} {}", token.token_type, token.access_token))
    }
}

struct CcClient {
    client: reqwest::Client,
    api_url: Url,
}

#[derive(Deserialize)]
struct AppSshAccessResponse {
    process_guid: String,
}

impl CcClient {
    /// Ask the Cloud Controller whether the token's owner may SSH to
    /// instance `index` of the app, and for the process guid behind it.
    async fn ssh_access(
        &self,
        authorization: &str,
        app_guid: &str,
        index: i32,
    ) -> Result<String, AuthFailure> {
        let url = self
            .api_url
            .join(&format!("/internal/apps/{app_guid}/ssh_access/{index}"))
            .map_err(|error| AuthFailure::Upstream {
                message: format!("cc url: {error}"),
            })?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|error| AuthFailure::Upstream {
                message: format!("cc: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%status, app_guid, index, "CC denied ssh access");
            return Err(AuthFailure::CcDenied);
        }

        let access: AppSshAccessResponse =
            response.json().await.map_err(|_| AuthFailure::CcDenied)?;
        Ok(access.process_guid)
    }
}
