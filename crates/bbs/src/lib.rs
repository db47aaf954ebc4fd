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

//! Typed client for the cluster-state service (BBS).
//!
//! The BBS speaks HTTP POST with protobuf-encoded request and response
//! bodies; there is no gRPC framing involved. This crate owns the message
//! definitions ([`models`]) and a thin client that maps the structured
//! error in each response to a typed error, so callers can tell "no such
//! LRP" apart from "the BBS is on fire".

pub mod models;

use std::time::Duration;

use prost::Message;
use url::Url;

use crate::models::{
    ActualLrpGroup, ActualLrpGroupByProcessGuidAndIndexRequest, ActualLrpGroupResponse,
    DesiredLrp, DesiredLrpByProcessGuidRequest, DesiredLrpResponse, ErrorType,
};

const ACTUAL_LRP_GROUP_PATH: &str = "/v1/actual_lrp_groups/get_by_process_guid_and_index";
const DESIRED_LRP_PATH: &str = "/v1/desired_lrps/get_by_process_guid";
const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Clone)]
pub struct BbsClient {
    base_url: Url,
    client: reqwest::Client,
}

impl BbsClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| BuildError::HttpClient { error })?;
        Ok(Self { base_url, client })
    }

    /// Where is instance `index` of process `process_guid` running right now?
    pub async fn actual_lrp_group_by_process_guid_and_index(
        &self,
        process_guid: &str,
        index: i32,
    ) -> Result<ActualLrpGroup, Error> {
        let request = ActualLrpGroupByProcessGuidAndIndexRequest {
            process_guid: process_guid.to_string(),
            index,
        };
        let response: ActualLrpGroupResponse = self.post_proto(ACTUAL_LRP_GROUP_PATH, &request).await?;
        into_payload(response.error, response.actual_lrp_group, ACTUAL_LRP_GROUP_PATH)
    }

    /// What does the scheduler want process `process_guid` to look like?
    pub async fn desired_lrp_by_process_guid(
        &self,
        process_guid: &str,
    ) -> Result<DesiredLrp, Error> {
        let request = DesiredLrpByProcessGuidRequest {
            process_guid: process_guid.to_string(),
        };
        let response: DesiredLrpResponse = self.post_proto(DESIRED_LRP_PATH, &request).await?;
        into_payload(response.error, response.desired_lrp, DESIRED_LRP_PATH)
    }

    async fn post_proto<Req, Resp>(&self, path: &'static str, request: &Req) -> Result<Resp, Error>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|error| Error::Url { path, error })?;

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(request.encode_to_vec())
            .send()
            .await
            .map_err(|error| Error::Request { path, error })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status { path, status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|error| Error::Request { path, error })?;
        Resp::decode(body.as_ref()).map_err(|error| Error::Decode { path, error })
    }
}

/// Unwrap a BBS response envelope into its payload, mapping the structured
/// error field to a typed error first.
fn into_payload<T>(
    error: Option<models::Error>,
    payload: Option<T>,
    path: &'static str,
) -> Result<T, Error> {
    if let Some(error) = error {
        return Err(match error.kind() {
            ErrorType::ResourceNotFound => Error::ResourceNotFound {
                message: error.message,
            },
            _ => Error::Upstream {
                message: error.message,
            },
        });
    }
    payload.ok_or(Error::MissingPayload { path })
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("error building BBS http client: {error}")]
    HttpClient { error: reqwest::Error },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("resource not found: {message}")]
    ResourceNotFound { message: String },
    #[error("BBS reported an error: {message}")]
    Upstream { message: String },
    #[error("error building BBS url for {path}: {error}")]
    Url {
        path: &'static str,
        error: url::ParseError,
    },
    #[error("error requesting {path} from the BBS: {error}")]
    Request {
        path: &'static str,
        error: reqwest::Error,
    },
    #[error("BBS returned {status} for {path}")]
    Status {
        path: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("error decoding BBS response from {path}: {error}")]
    Decode {
        path: &'static str,
        error: prost::DecodeError,
    },
    #[error("BBS response from {path} carried neither an error nor a payload")]
    MissingPayload { path: &'static str },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }
}
