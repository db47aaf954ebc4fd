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

//! In-process stand-in for the BBS: answers the two LRP lookups with canned
//! protobuf responses and records every decoded request for assertions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bbs::models::{
    ActualLrp, ActualLrpGroup, ActualLrpGroupByProcessGuidAndIndexRequest, ActualLrpGroupResponse,
    ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo, DesiredLrp,
    DesiredLrpByProcessGuidRequest, DesiredLrpResponse, PortMapping,
};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use prost::Message;
use ssh_proxy::routes::{DIEGO_SSH_ROUTE_KEY, SshRoute};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct FakeBbs {
    pub addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    actual_response: Mutex<ActualLrpGroupResponse>,
    desired_response: Mutex<DesiredLrpResponse>,
    actual_requests: Mutex<Vec<ActualLrpGroupByProcessGuidAndIndexRequest>>,
    desired_requests: Mutex<Vec<DesiredLrpByProcessGuidRequest>>,
    violations: Mutex<Vec<String>>,
}

impl FakeBbs {
    pub async fn spawn(
        actual_response: ActualLrpGroupResponse,
        desired_response: DesiredLrpResponse,
    ) -> eyre::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State {
            actual_response: Mutex::new(actual_response),
            desired_response: Mutex::new(desired_response),
            ..Default::default()
        });

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let state = state.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        auto::Builder::new(TokioExecutor::new())
                            .serve_connection(
                                io,
                                hyper::service::service_fn(move |req| {
                                    let state = state.clone();
                                    async move { serve(req, state).await }
                                }),
                            )
                            .await
                            .ok();
                    });
                }
            }
        });

        Ok(Self { addr, state, task })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn request_count(&self) -> usize {
        self.actual_requests().len() + self.desired_requests().len()
    }

    pub fn actual_requests(&self) -> Vec<ActualLrpGroupByProcessGuidAndIndexRequest> {
        self.state
            .actual_requests
            .lock()
            .expect("lock poisoned")
            .clone()
    }

    pub fn desired_requests(&self) -> Vec<DesiredLrpByProcessGuidRequest> {
        self.state
            .desired_requests
            .lock()
            .expect("lock poisoned")
            .clone()
    }

    /// Wire-level expectations (content types, decodability) the handler
    /// could not fail the request for without masking the real assertion.
    pub fn violations(&self) -> Vec<String> {
        self.state.violations.lock().expect("lock poisoned").clone()
    }
}

impl Drop for FakeBbs {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    req: Request<Incoming>,
    state: Arc<State>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();

    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if content_type.as_deref() != Some("application/x-protobuf") {
        state
            .violations
            .lock()
            .expect("lock poisoned")
            .push(format!("{path}: content-type was {content_type:?}"));
    }

    let body = req.into_body().collect().await?.to_bytes();

    let response_bytes = match path.as_str() {
        "/v1/actual_lrp_groups/get_by_process_guid_and_index" => {
            match ActualLrpGroupByProcessGuidAndIndexRequest::decode(body.as_ref()) {
                Ok(request) => {
                    state
                        .actual_requests
                        .lock()
                        .expect("lock poisoned")
                        .push(request);
                }
                Err(error) => {
                    state
                        .violations
                        .lock()
                        .expect("lock poisoned")
                        .push(format!("{path}: undecodable request: {error}"));
                }
            }
            state
                .actual_response
                .lock()
                .expect("lock poisoned")
                .encode_to_vec()
        }
        "/v1/desired_lrps/get_by_process_guid" => {
            match DesiredLrpByProcessGuidRequest::decode(body.as_ref()) {
                Ok(request) => {
                    state
                        .desired_requests
                        .lock()
                        .expect("lock poisoned")
                        .push(request);
                }
                Err(error) => {
                    state
                        .violations
                        .lock()
                        .expect("lock poisoned")
                        .push(format!("{path}: undecodable request: {error}"));
                }
            }
            state
                .desired_response
                .lock()
                .expect("lock poisoned")
                .encode_to_vec()
        }
        _ => {
            state
                .violations
                .lock()
                .expect("lock poisoned")
                .push(format!("unexpected path {path}"));
            return Ok(Response::builder()
                .status(404)
                .body(Full::new(Bytes::new()))
                .expect("BUG: response builder"));
        }
    };

    Ok(Response::builder()
        .status(200)
        .header(http::header::CONTENT_TYPE, "application/x-protobuf")
        .body(Full::new(Bytes::from(response_bytes)))
        .expect("BUG: response builder"))
}

/// A healthy actual-LRP response: one running instance on `host` with a
/// single port mapping.
pub fn actual_lrp_group_response(
    process_guid: &str,
    index: i32,
    host: &str,
    container_port: u32,
    host_port: u16,
) -> ActualLrpGroupResponse {
    ActualLrpGroupResponse {
        error: None,
        actual_lrp_group: Some(ActualLrpGroup {
            instance: Some(ActualLrp {
                actual_lrp_key: Some(ActualLrpKey {
                    process_guid: process_guid.to_string(),
                    index,
                    domain: "some-domain".to_string(),
                }),
                actual_lrp_instance_key: Some(ActualLrpInstanceKey {
                    instance_guid: "some-instance-guid".to_string(),
                    cell_id: "some-cell-id".to_string(),
                }),
                actual_lrp_net_info: Some(ActualLrpNetInfo {
                    address: host.to_string(),
                    ports: vec![PortMapping {
                        container_port,
                        host_port: u32::from(host_port),
                    }],
                }),
            }),
            evacuating: None,
        }),
    }
}

/// A desired-LRP response carrying the given SSH route.
pub fn desired_lrp_response(
    process_guid: &str,
    instances: i32,
    route: &SshRoute,
) -> DesiredLrpResponse {
    let mut lrp = DesiredLrp {
        process_guid: process_guid.to_string(),
        instances,
        ..Default::default()
    };
    lrp.routes.insert(
        DIEGO_SSH_ROUTE_KEY.to_string(),
        serde_json::to_vec(route).expect("encode ssh route"),
    );
    DesiredLrpResponse {
        error: None,
        desired_lrp: Some(lrp),
    }
}
