// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Protobuf messages for catalog resources. The messages are hand-derived
//! with prost so the crate builds without a protoc toolchain; tags are part
//! of the stored-bytes contract and must never be renumbered.

/// A reference to a resource by name and variant.
#[derive(
    Clone, PartialEq, Eq, Hash, ::prost::Message, serde::Serialize, serde::Deserialize,
)]
pub struct NameVariant {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub variant: String,
}

impl NameVariant {
    pub fn new(name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variant: variant.into(),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceStatus {
    #[prost(enumeration = "resource_status::Status", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

pub mod resource_status {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Status {
        NoStatus = 0,
        Created = 1,
        Pending = 2,
        Ready = 3,
        Failed = 4,
    }
}

/// Source column bindings for a feature or label.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceColumns {
    #[prost(string, tag = "1")]
    pub entity: String,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(string, tag = "3")]
    pub ts: String,
}

/// Parent record grouping the variants of a feature.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Feature {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub default_variant: String,
    #[prost(string, repeated, tag = "3")]
    pub variants: Vec<String>,
    #[prost(message, optional, tag = "4")]
    pub status: Option<ResourceStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeatureVariant {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub variant: String,
    #[prost(message, optional, tag = "3")]
    pub source: Option<NameVariant>,
    #[prost(string, tag = "4")]
    pub entity: String,
    #[prost(string, tag = "5")]
    pub owner: String,
    #[prost(string, tag = "6")]
    pub provider: String,
    #[prost(string, tag = "7")]
    pub value_type: String,
    #[prost(message, optional, tag = "8")]
    pub status: Option<ResourceStatus>,
    #[prost(string, tag = "9")]
    pub schedule: String,
    #[prost(message, optional, tag = "10")]
    pub columns: Option<ResourceColumns>,
}

/// Parent record grouping the variants of a label.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub default_variant: String,
    #[prost(string, repeated, tag = "3")]
    pub variants: Vec<String>,
    #[prost(message, optional, tag = "4")]
    pub status: Option<ResourceStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelVariant {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub variant: String,
    #[prost(message, optional, tag = "3")]
    pub source: Option<NameVariant>,
    #[prost(string, tag = "4")]
    pub entity: String,
    #[prost(string, tag = "5")]
    pub owner: String,
    #[prost(string, tag = "6")]
    pub provider: String,
    #[prost(string, tag = "7")]
    pub value_type: String,
    #[prost(message, optional, tag = "8")]
    pub status: Option<ResourceStatus>,
    #[prost(message, optional, tag = "9")]
    pub columns: Option<ResourceColumns>,
}

/// Parent record grouping the variants of a source.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Source {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub default_variant: String,
    #[prost(string, repeated, tag = "3")]
    pub variants: Vec<String>,
    #[prost(message, optional, tag = "4")]
    pub status: Option<ResourceStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrimaryData {
    #[prost(string, tag = "1")]
    pub table_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlTransformation {
    #[prost(string, tag = "1")]
    pub query: String,
    #[prost(message, repeated, tag = "2")]
    pub sources: Vec<NameVariant>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SourceVariant {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub variant: String,
    #[prost(string, tag = "3")]
    pub owner: String,
    #[prost(string, tag = "4")]
    pub provider: String,
    #[prost(message, optional, tag = "5")]
    pub status: Option<ResourceStatus>,
    #[prost(string, tag = "6")]
    pub schedule: String,
    #[prost(oneof = "source_variant::Definition", tags = "10, 11")]
    pub definition: Option<source_variant::Definition>,
}

pub mod source_variant {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Definition {
        /// The source is a pre-existing table registered as-is.
        #[prost(message, tag = "10")]
        PrimaryData(super::PrimaryData),
        /// The source is computed by a transformation query.
        #[prost(message, tag = "11")]
        Transformation(super::SqlTransformation),
    }
}

/// Parent record grouping the variants of a training set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrainingSet {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub default_variant: String,
    #[prost(string, repeated, tag = "3")]
    pub variants: Vec<String>,
    #[prost(message, optional, tag = "4")]
    pub status: Option<ResourceStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrainingSetVariant {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub variant: String,
    #[prost(message, optional, tag = "3")]
    pub label: Option<NameVariant>,
    #[prost(message, repeated, tag = "4")]
    pub features: Vec<NameVariant>,
    #[prost(string, tag = "5")]
    pub owner: String,
    #[prost(string, tag = "6")]
    pub provider: String,
    #[prost(message, optional, tag = "7")]
    pub status: Option<ResourceStatus>,
    #[prost(string, tag = "8")]
    pub schedule: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Provider {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(string, tag = "3")]
    pub provider_type: String,
    #[prost(string, tag = "4")]
    pub software: String,
    #[prost(string, tag = "5")]
    pub team: String,
    #[prost(bytes = "vec", tag = "6")]
    pub serialized_config: Vec<u8>,
    #[prost(message, optional, tag = "7")]
    pub status: Option<ResourceStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entity {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, optional, tag = "3")]
    pub status: Option<ResourceStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub status: Option<ResourceStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Model {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, optional, tag = "3")]
    pub status: Option<ResourceStatus>,
}
