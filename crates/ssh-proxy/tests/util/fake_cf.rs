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

//! In-process stand-ins for the UAA token endpoint and the Cloud
//! Controller's ssh-access check.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

struct HttpFake {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl Drop for HttpFake {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serve `response_body` as JSON for every request, recording each request.
async fn spawn_fake(response_body: String, status: u16) -> eyre::Result<HttpFake> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();

    let task = tokio::spawn({
        let requests = requests.clone();
        async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let requests = requests.clone();
                let response_body = response_body.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    auto::Builder::new(TokioExecutor::new())
                        .serve_connection(
                            io,
                            hyper::service::service_fn(move |req| {
                                let requests = requests.clone();
                                let response_body = response_body.clone();
                                async move { record(req, requests, response_body, status).await }
                            }),
                        )
                        .await
                        .ok();
                });
            }
        }
    });

    Ok(HttpFake {
        addr,
        requests,
        task,
    })
}

async fn record(
    req: Request<Incoming>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    response_body: String,
    status: u16,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let authorization = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = req.into_body().collect().await?.to_bytes();

    requests.lock().expect("lock poisoned").push(RecordedRequest {
        method,
        path,
        authorization,
        content_type,
        body: String::from_utf8_lossy(&body).to_string(),
    });

    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(response_body)))
        .expect("BUG: response builder"))
}

pub struct FakeUaa {
    fake: HttpFake,
}

impl FakeUaa {
    /// Answers every token request with the given access token.
    pub async fn spawn(access_token: &str) -> eyre::Result<Self> {
        let body = format!(r#"{{"access_token": "{access_token}", "token_type": "bearer"}}"#);
        Ok(Self {
            fake: spawn_fake(body, 200).await?,
        })
    }

    pub fn token_url(&self) -> String {
        format!("http://{}/oauth/token", self.fake.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.fake.requests.lock().expect("lock poisoned").clone()
    }
}

pub struct FakeCc {
    fake: HttpFake,
}

impl FakeCc {
    /// Answers every ssh-access request with the given process guid.
    pub async fn spawn(process_guid: &str) -> eyre::Result<Self> {
        let body = format!(r#"{{"process_guid": "{process_guid}"}}"#);
        Ok(Self {
            fake: spawn_fake(body, 200).await?,
        })
    }

    /// Denies every ssh-access request.
    pub async fn spawn_denying() -> eyre::Result<Self> {
        Ok(Self {
            fake: spawn_fake(String::new(), 403).await?,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.fake.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.fake.requests.lock().expect("lock poisoned").clone()
    }
}
