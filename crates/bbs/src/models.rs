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

//! Hand-maintained protobuf message definitions for the BBS wire contract.
//!
//! The BBS API is HTTP POST with protobuf-encoded bodies on both sides, so
//! these are plain prost messages rather than a tonic service. Field tags are
//! the stable wire contract; do not renumber.

use std::collections::BTreeMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActualLrpGroupByProcessGuidAndIndexRequest {
    #[prost(string, tag = "1")]
    pub process_guid: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub index: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActualLrpGroupResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<Error>,
    #[prost(message, optional, tag = "2")]
    pub actual_lrp_group: ::core::option::Option<ActualLrpGroup>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DesiredLrpByProcessGuidRequest {
    #[prost(string, tag = "1")]
    pub process_guid: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DesiredLrpResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<Error>,
    #[prost(message, optional, tag = "2")]
    pub desired_lrp: ::core::option::Option<DesiredLrp>,
}

/// An actual LRP group holds up to two records for the same (process, index)
/// pair: the running instance and, during cell evacuation, the copy being
/// drained off the old cell.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActualLrpGroup {
    #[prost(message, optional, tag = "1")]
    pub instance: ::core::option::Option<ActualLrp>,
    #[prost(message, optional, tag = "2")]
    pub evacuating: ::core::option::Option<ActualLrp>,
}

impl ActualLrpGroup {
    /// The record a new connection should be routed to. The evacuating copy
    /// is still the one serving traffic while the scheduler rebalances, so it
    /// wins over the (possibly not yet started) replacement instance.
    pub fn routable(&self) -> Option<&ActualLrp> {
        self.evacuating.as_ref().or(self.instance.as_ref())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActualLrp {
    #[prost(message, optional, tag = "1")]
    pub actual_lrp_key: ::core::option::Option<ActualLrpKey>,
    #[prost(message, optional, tag = "2")]
    pub actual_lrp_instance_key: ::core::option::Option<ActualLrpInstanceKey>,
    #[prost(message, optional, tag = "3")]
    pub actual_lrp_net_info: ::core::option::Option<ActualLrpNetInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActualLrpKey {
    #[prost(string, tag = "1")]
    pub process_guid: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub index: i32,
    #[prost(string, tag = "3")]
    pub domain: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActualLrpInstanceKey {
    #[prost(string, tag = "1")]
    pub instance_guid: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub cell_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActualLrpNetInfo {
    /// Address of the cell the instance runs on.
    #[prost(string, tag = "1")]
    pub address: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub ports: ::prost::alloc::vec::Vec<PortMapping>,
}

impl ActualLrpNetInfo {
    /// The host-side port the cell mapped onto the given container port.
    pub fn host_port_for(&self, container_port: u32) -> Option<u32> {
        self.ports
            .iter()
            .find(|mapping| mapping.container_port == container_port)
            .map(|mapping| mapping.host_port)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortMapping {
    #[prost(uint32, tag = "1")]
    pub container_port: u32,
    #[prost(uint32, tag = "2")]
    pub host_port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DesiredLrp {
    #[prost(string, tag = "1")]
    pub process_guid: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub instances: i32,
    /// Per-router route payloads, keyed by router name. The values are
    /// opaque JSON blobs owned by whichever router registered them.
    #[prost(btree_map = "string, bytes", tag = "3")]
    pub routes: BTreeMap<::prost::alloc::string::String, ::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(enumeration = "ErrorType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

impl Error {
    pub fn kind(&self) -> ErrorType {
        ErrorType::try_from(self.r#type).unwrap_or(ErrorType::UnknownError)
    }

    pub fn resource_not_found(message: impl Into<String>) -> Self {
        Self {
            r#type: ErrorType::ResourceNotFound as i32,
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorType {
    UnknownError = 0,
    InvalidRecord = 3,
    InvalidRequest = 5,
    InvalidResponse = 6,
    ResourceConflict = 11,
    ResourceExists = 12,
    ResourceNotFound = 13,
}
