//! Entity kinds and the parent/child layout of a service tree.
//!
//! The backing store owns the relational schema; this module only records
//! which array field of a record holds which kind of children, and which
//! foreign key on the child points back at its parent.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Every entity kind that can appear in a service tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Service,
    PlacementGroup,
    Placement,
    Campaign,
    AdGroup,
    Creative,
    AdSet,
    ContentType,
    Content,
    Customset,
    Provider,
    Integration,
    Segment,
    Job,
    Channel,
    CubeConfig,
    Cube,
}

impl EntityKind {
    pub const ALL: [EntityKind; 17] = [
        Self::Service,
        Self::PlacementGroup,
        Self::Placement,
        Self::Campaign,
        Self::AdGroup,
        Self::Creative,
        Self::AdSet,
        Self::ContentType,
        Self::Content,
        Self::Customset,
        Self::Provider,
        Self::Integration,
        Self::Segment,
        Self::Job,
        Self::Channel,
        Self::CubeConfig,
        Self::Cube,
    ];

    /// Wire name, as used in URLs and mutation payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::PlacementGroup => "placementGroup",
            Self::Placement => "placement",
            Self::Campaign => "campaign",
            Self::AdGroup => "adGroup",
            Self::Creative => "creative",
            Self::AdSet => "adSet",
            Self::ContentType => "contentType",
            Self::Content => "content",
            Self::Customset => "customset",
            Self::Provider => "provider",
            Self::Integration => "integration",
            Self::Segment => "segment",
            Self::Job => "job",
            Self::Channel => "channel",
            Self::CubeConfig => "cubeConfig",
            Self::Cube => "cube",
        }
    }

    /// Parse a path segment into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parent → children edge of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Array field on the parent record, e.g. `adGroups`.
    pub key: &'static str,
    pub parent: EntityKind,
    pub child: EntityKind,
    /// Field on the child holding the parent's id, e.g. `campaignId`.
    pub foreign_key: &'static str,
    /// Field on the child where the store puts an included parent, e.g. `campaign`.
    pub parent_field: &'static str,
    /// Siblings are keyed by `(parent id, name)` in the store.
    pub unique_name: bool,
}

const fn edge(
    key: &'static str,
    parent: EntityKind,
    child: EntityKind,
    foreign_key: &'static str,
    parent_field: &'static str,
    unique_name: bool,
) -> Collection {
    Collection {
        key,
        parent,
        child,
        foreign_key,
        parent_field,
        unique_name,
    }
}

const SERVICE_COLLECTIONS: [Collection; 16] = {
    use EntityKind::*;
    [
        edge("placementGroups", Service, PlacementGroup, "serviceId", "service", true),
        edge("placements", PlacementGroup, Placement, "placementGroupId", "placementGroup", true),
        edge("campaigns", Placement, Campaign, "placementId", "placement", true),
        edge("adGroups", Campaign, AdGroup, "campaignId", "campaign", true),
        edge("creatives", AdGroup, Creative, "adGroupId", "adGroup", true),
        edge("adSets", Placement, AdSet, "placementId", "placement", false),
        edge("contentTypes", Service, ContentType, "serviceId", "service", true),
        edge("contents", ContentType, Content, "contentTypeId", "contentType", true),
        edge("customsets", Service, Customset, "serviceId", "service", true),
        edge("providers", Service, Provider, "serviceId", "service", false),
        edge("integrations", Service, Integration, "serviceId", "service", false),
        edge("segments", Integration, Segment, "integrationId", "integration", false),
        edge("jobs", Integration, Job, "integrationId", "integration", false),
        edge("channels", Service, Channel, "serviceId", "service", false),
        edge("cubeConfigs", Service, CubeConfig, "serviceId", "service", true),
        edge("cubes", CubeConfig, Cube, "cubeConfigId", "cubeConfig", false),
    ]
};

/// Tree layout rooted at one kind. Every non-root kind has exactly one
/// incoming edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    root: EntityKind,
    collections: Vec<Collection>,
}

impl Schema {
    /// The full service configuration tree.
    pub fn service() -> Self {
        Self {
            root: EntityKind::Service,
            collections: SERVICE_COLLECTIONS.to_vec(),
        }
    }

    /// The sub-schema reachable from `kind`, e.g. a campaign with its ad
    /// groups and creatives.
    pub fn rooted_at(&self, kind: EntityKind) -> Self {
        let mut reached = HashSet::from([kind]);
        let mut collections = Vec::new();
        let mut frontier = vec![kind];

        while let Some(parent) = frontier.pop() {
            for collection in self.collections(parent) {
                if reached.insert(collection.child) {
                    frontier.push(collection.child);
                }
                collections.push(collection.clone());
            }
        }

        Self {
            root: kind,
            collections,
        }
    }

    pub fn root(&self) -> EntityKind {
        self.root
    }

    /// Child collections of `parent`.
    pub fn collections(&self, parent: EntityKind) -> impl Iterator<Item = &Collection> {
        self.collections.iter().filter(move |c| c.parent == parent)
    }

    /// The edge leading into `child`, if `child` is a non-root kind of this schema.
    pub fn edge_to(&self, child: EntityKind) -> Option<&Collection> {
        self.collections.iter().find(|c| c.child == child)
    }

    pub fn contains(&self, kind: EntityKind) -> bool {
        kind == self.root || self.edge_to(kind).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_string()));
        }
        assert_eq!(EntityKind::parse("adgroup"), None);
    }

    #[test]
    fn test_service_schema_is_a_tree() {
        let schema = Schema::service();
        for kind in EntityKind::ALL {
            assert!(schema.contains(kind), "{kind} missing");
            let incoming = schema.collections.iter().filter(|c| c.child == kind).count();
            let expected = if kind == EntityKind::Service { 0 } else { 1 };
            assert_eq!(incoming, expected, "{kind}");
        }
    }

    #[test]
    fn test_rooted_at_campaign() {
        let schema = Schema::service().rooted_at(EntityKind::Campaign);
        assert_eq!(schema.root(), EntityKind::Campaign);
        let keys: Vec<_> = schema.collections.iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["adGroups", "creatives"]);
        assert!(!schema.contains(EntityKind::Placement));
        assert!(schema.contains(EntityKind::Creative));
    }

    #[test]
    fn test_ad_hierarchy_edges() {
        let schema = Schema::service();
        let edge = schema.edge_to(EntityKind::Creative).unwrap();
        assert_eq!(edge.parent, EntityKind::AdGroup);
        assert_eq!(edge.key, "creatives");
        assert_eq!(edge.foreign_key, "adGroupId");
        assert_eq!(edge.parent_field, "adGroup");
    }

    #[test]
    fn test_name_keyed_edges() {
        let schema = Schema::service();
        let named: Vec<_> = schema
            .collections
            .iter()
            .filter(|c| c.unique_name)
            .map(|c| c.key)
            .collect();
        assert_eq!(
            named,
            vec![
                "placementGroups",
                "placements",
                "campaigns",
                "adGroups",
                "creatives",
                "contentTypes",
                "contents",
                "customsets",
                "cubeConfigs"
            ]
        );
        assert!(!schema.edge_to(EntityKind::Job).unwrap().unique_name);
    }
}
