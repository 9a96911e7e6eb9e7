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

//! Typed view of catalog resources and their storage keys.

use crate::error::{FeatureformError, Result};
use crate::proto;
use crate::proto::resource_status::Status as ProtoStatus;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of a catalog resource. The pair `(name, variant)` is unique
/// within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "FEATURE")]
    Feature,
    #[serde(rename = "FEATURE_VARIANT")]
    FeatureVariant,
    #[serde(rename = "LABEL")]
    Label,
    #[serde(rename = "LABEL_VARIANT")]
    LabelVariant,
    #[serde(rename = "SOURCE")]
    Source,
    #[serde(rename = "SOURCE_VARIANT")]
    SourceVariant,
    #[serde(rename = "TRAINING_SET")]
    TrainingSet,
    #[serde(rename = "TRAINING_SET_VARIANT")]
    TrainingSetVariant,
    #[serde(rename = "PROVIDER")]
    Provider,
    #[serde(rename = "ENTITY")]
    Entity,
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "MODEL")]
    Model,
}

pub const RESOURCE_TYPES: [ResourceType; 12] = [
    ResourceType::Feature,
    ResourceType::FeatureVariant,
    ResourceType::Label,
    ResourceType::LabelVariant,
    ResourceType::Source,
    ResourceType::SourceVariant,
    ResourceType::TrainingSet,
    ResourceType::TrainingSetVariant,
    ResourceType::Provider,
    ResourceType::Entity,
    ResourceType::User,
    ResourceType::Model,
];

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Feature => "FEATURE",
            ResourceType::FeatureVariant => "FEATURE_VARIANT",
            ResourceType::Label => "LABEL",
            ResourceType::LabelVariant => "LABEL_VARIANT",
            ResourceType::Source => "SOURCE",
            ResourceType::SourceVariant => "SOURCE_VARIANT",
            ResourceType::TrainingSet => "TRAINING_SET",
            ResourceType::TrainingSetVariant => "TRAINING_SET_VARIANT",
            ResourceType::Provider => "PROVIDER",
            ResourceType::Entity => "ENTITY",
            ResourceType::User => "USER",
            ResourceType::Model => "MODEL",
        }
    }

    /// Whether resources of this kind carry a user-supplied variant.
    pub fn has_variant(&self) -> bool {
        !matches!(
            self,
            ResourceType::Provider
                | ResourceType::Entity
                | ResourceType::User
                | ResourceType::Model
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = FeatureformError;

    fn from_str(s: &str) -> Result<Self> {
        RESOURCE_TYPES
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| {
                FeatureformError::InvalidArgument(format!("unknown resource type `{s}`"))
            })
    }
}

/// The `(type, name, variant)` identity of a resource. Variantless kinds
/// carry an empty variant string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub name: String,
    pub variant: String,
}

impl ResourceId {
    pub fn new(
        resource_type: ResourceType,
        name: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            name: name.into(),
            variant: variant.into(),
        }
    }

    /// The storage key, `<Type>__<Name>__<Variant>`. Part of the on-disk
    /// contract.
    pub fn to_key(&self) -> String {
        format!("{}__{}__{}", self.resource_type, self.name, self.variant)
    }

    pub fn from_key(key: &str) -> Result<Self> {
        let mut parts = key.splitn(3, "__");
        let (rt, name, variant) = match (parts.next(), parts.next(), parts.next()) {
            (Some(rt), Some(name), Some(variant)) => (rt, name, variant),
            _ => {
                return Err(FeatureformError::InvalidArgument(format!(
                    "malformed resource key `{key}`"
                )))
            }
        };

        Ok(Self {
            resource_type: rt.parse()?,
            name: name.to_string(),
            variant: variant.to_string(),
        })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.variant.is_empty() {
            write!(f, "{} {}", self.resource_type, self.name)
        } else {
            write!(f, "{} {} ({})", self.resource_type, self.name, self.variant)
        }
    }
}

/// Lifecycle status of a resource. Only the status and its error message
/// mutate after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Created,
    Pending,
    Ready,
    Failed,
}

impl ResourceStatus {
    fn from_proto(status: i32) -> Self {
        match ProtoStatus::from_i32(status) {
            Some(ProtoStatus::Pending) => ResourceStatus::Pending,
            Some(ProtoStatus::Ready) => ResourceStatus::Ready,
            Some(ProtoStatus::Failed) => ResourceStatus::Failed,
            _ => ResourceStatus::Created,
        }
    }

    fn to_proto(self) -> ProtoStatus {
        match self {
            ResourceStatus::Created => ProtoStatus::Created,
            ResourceStatus::Pending => ProtoStatus::Pending,
            ResourceStatus::Ready => ProtoStatus::Ready,
            ResourceStatus::Failed => ProtoStatus::Failed,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ResourceStatus::Created => "CREATED",
            ResourceStatus::Pending => "PENDING",
            ResourceStatus::Ready => "READY",
            ResourceStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A decoded catalog resource. The wrapper dispatches encoding and status
/// access so that generic walkers never need to know the concrete message.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Feature(proto::Feature),
    FeatureVariant(proto::FeatureVariant),
    Label(proto::Label),
    LabelVariant(proto::LabelVariant),
    Source(proto::Source),
    SourceVariant(proto::SourceVariant),
    TrainingSet(proto::TrainingSet),
    TrainingSetVariant(proto::TrainingSetVariant),
    Provider(proto::Provider),
    Entity(proto::Entity),
    User(proto::User),
    Model(proto::Model),
}

macro_rules! for_each_resource {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Resource::Feature($inner) => $body,
            Resource::FeatureVariant($inner) => $body,
            Resource::Label($inner) => $body,
            Resource::LabelVariant($inner) => $body,
            Resource::Source($inner) => $body,
            Resource::SourceVariant($inner) => $body,
            Resource::TrainingSet($inner) => $body,
            Resource::TrainingSetVariant($inner) => $body,
            Resource::Provider($inner) => $body,
            Resource::Entity($inner) => $body,
            Resource::User($inner) => $body,
            Resource::Model($inner) => $body,
        }
    };
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Feature(_) => ResourceType::Feature,
            Resource::FeatureVariant(_) => ResourceType::FeatureVariant,
            Resource::Label(_) => ResourceType::Label,
            Resource::LabelVariant(_) => ResourceType::LabelVariant,
            Resource::Source(_) => ResourceType::Source,
            Resource::SourceVariant(_) => ResourceType::SourceVariant,
            Resource::TrainingSet(_) => ResourceType::TrainingSet,
            Resource::TrainingSetVariant(_) => ResourceType::TrainingSetVariant,
            Resource::Provider(_) => ResourceType::Provider,
            Resource::Entity(_) => ResourceType::Entity,
            Resource::User(_) => ResourceType::User,
            Resource::Model(_) => ResourceType::Model,
        }
    }

    pub fn name(&self) -> &str {
        for_each_resource!(self, inner => inner.name.as_str())
    }

    pub fn variant(&self) -> &str {
        match self {
            Resource::FeatureVariant(v) => v.variant.as_str(),
            Resource::LabelVariant(v) => v.variant.as_str(),
            Resource::SourceVariant(v) => v.variant.as_str(),
            Resource::TrainingSetVariant(v) => v.variant.as_str(),
            _ => "",
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.resource_type(), self.name(), self.variant())
    }

    pub fn status(&self) -> ResourceStatus {
        let status = for_each_resource!(self, inner => inner.status.as_ref());
        status
            .map(|s| ResourceStatus::from_proto(s.status))
            .unwrap_or(ResourceStatus::Created)
    }

    pub fn status_error(&self) -> &str {
        let status = for_each_resource!(self, inner => inner.status.as_ref());
        status.map(|s| s.error_message.as_str()).unwrap_or("")
    }

    pub fn set_status(&mut self, status: ResourceStatus, error_message: impl Into<String>) {
        let new = proto::ResourceStatus {
            status: status.to_proto() as i32,
            error_message: error_message.into(),
        };
        for_each_resource!(self, inner => inner.status = Some(new.clone()));
    }

    pub fn encode(&self) -> Vec<u8> {
        for_each_resource!(self, inner => inner.encode_to_vec())
    }

    pub fn decode(resource_type: ResourceType, bytes: &[u8]) -> Result<Self> {
        let resource = match resource_type {
            ResourceType::Feature => Resource::Feature(proto::Feature::decode(bytes)?),
            ResourceType::FeatureVariant => {
                Resource::FeatureVariant(proto::FeatureVariant::decode(bytes)?)
            }
            ResourceType::Label => Resource::Label(proto::Label::decode(bytes)?),
            ResourceType::LabelVariant => {
                Resource::LabelVariant(proto::LabelVariant::decode(bytes)?)
            }
            ResourceType::Source => Resource::Source(proto::Source::decode(bytes)?),
            ResourceType::SourceVariant => {
                Resource::SourceVariant(proto::SourceVariant::decode(bytes)?)
            }
            ResourceType::TrainingSet => {
                Resource::TrainingSet(proto::TrainingSet::decode(bytes)?)
            }
            ResourceType::TrainingSetVariant => {
                Resource::TrainingSetVariant(proto::TrainingSetVariant::decode(bytes)?)
            }
            ResourceType::Provider => Resource::Provider(proto::Provider::decode(bytes)?),
            ResourceType::Entity => Resource::Entity(proto::Entity::decode(bytes)?),
            ResourceType::User => Resource::User(proto::User::decode(bytes)?),
            ResourceType::Model => Resource::Model(proto::Model::decode(bytes)?),
        };
        Ok(resource)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::NameVariant;

    #[test]
    fn test_key_round_trip() {
        let id = ResourceId::new(ResourceType::FeatureVariant, "price", "v1");
        let key = id.to_key();
        assert_eq!(key, "FEATURE_VARIANT__price__v1");
        assert_eq!(ResourceId::from_key(&key).unwrap(), id);
    }

    #[test]
    fn test_variantless_key() {
        let id = ResourceId::new(ResourceType::Provider, "warehouse", "");
        let key = id.to_key();
        assert_eq!(key, "PROVIDER__warehouse__");
        assert_eq!(ResourceId::from_key(&key).unwrap(), id);
    }

    #[test]
    fn test_malformed_key_rejected() {
        assert!(ResourceId::from_key("FEATURE_VARIANT").is_err());
        assert!(ResourceId::from_key("NOT_A_TYPE__a__b").is_err());
    }

    #[test]
    fn test_status_defaults_to_created() {
        let resource = Resource::FeatureVariant(proto::FeatureVariant {
            name: "price".to_string(),
            variant: "v1".to_string(),
            ..Default::default()
        });
        assert_eq!(resource.status(), ResourceStatus::Created);
        assert_eq!(resource.status_error(), "");
    }

    #[test]
    fn test_set_status() {
        let mut resource = Resource::FeatureVariant(proto::FeatureVariant {
            name: "price".to_string(),
            variant: "v1".to_string(),
            ..Default::default()
        });

        resource.set_status(ResourceStatus::Failed, "provider unreachable");
        assert_eq!(resource.status(), ResourceStatus::Failed);
        assert_eq!(resource.status_error(), "provider unreachable");

        resource.set_status(ResourceStatus::Ready, "");
        assert_eq!(resource.status(), ResourceStatus::Ready);
        assert_eq!(resource.status_error(), "");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let resource = Resource::FeatureVariant(proto::FeatureVariant {
            name: "price".to_string(),
            variant: "v1".to_string(),
            source: Some(NameVariant::new("transactions", "v1")),
            entity: "user".to_string(),
            provider: "warehouse".to_string(),
            value_type: "float64".to_string(),
            ..Default::default()
        });

        let bytes = resource.encode();
        let decoded = Resource::decode(ResourceType::FeatureVariant, &bytes).unwrap();
        assert_eq!(decoded, resource);
        assert_eq!(decoded.id(), resource.id());
    }

    #[test]
    fn test_decode_wrong_type_fails_or_differs() {
        let resource = Resource::Provider(proto::Provider {
            name: "warehouse".to_string(),
            provider_type: "POSTGRES_OFFLINE".to_string(),
            ..Default::default()
        });

        // Decoding under a different type tag must not silently produce an
        // equivalent resource.
        let bytes = resource.encode();
        match Resource::decode(ResourceType::Entity, &bytes) {
            Ok(decoded) => assert_ne!(decoded.resource_type(), resource.resource_type()),
            Err(_) => {}
        }
    }
}
