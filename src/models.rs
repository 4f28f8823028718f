//! Core data models used throughout the catalog.
//!
//! These types represent the source rows, ads, and vector records that flow
//! through the refresh and search pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One spreadsheet row: lower-cased column name → cell text.
pub type SourceRow = HashMap<String, String>;

/// The two row sets returned by a source provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRows {
    #[serde(default)]
    pub ads: Vec<SourceRow>,
    #[serde(default)]
    pub formats: Vec<SourceRow>,
}

/// Format lookup entry merged into every ad of that format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatInfo {
    pub description: String,
    pub specs: String,
}

/// The comma-joined feature string and its split tokens.
///
/// Both views are produced by the same constructor, so `flags` is always
/// `joined` split on commas with empty tokens removed. Serialization writes
/// both `features` and `featureFlags`; deserialization reads `features` only
/// and re-derives the flags from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FeatureSetWire")]
pub struct FeatureSet {
    #[serde(rename = "features")]
    joined: String,
    #[serde(rename = "featureFlags")]
    flags: Vec<String>,
}

#[derive(Deserialize)]
struct FeatureSetWire {
    #[serde(default)]
    features: String,
}

impl From<FeatureSetWire> for FeatureSet {
    fn from(wire: FeatureSetWire) -> Self {
        FeatureSet::from_joined(wire.features)
    }
}

impl FeatureSet {
    pub fn from_joined(joined: impl Into<String>) -> Self {
        let joined = joined.into();
        let flags = joined
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Self { joined, flags }
    }

    pub fn from_flags<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = flags
            .into_iter()
            .map(|f| f.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self::from_joined(joined)
    }

    pub fn joined(&self) -> &str {
        &self.joined
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }
}

/// One campaign ad, fully materialized from a source row.
///
/// `id` is the 1-based position in the batch it was fetched with. A later
/// refresh may assign the same id to a different ad.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ad {
    pub id: u64,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub campaign: String,
    #[serde(default)]
    pub creative_id: String,
    #[serde(default)]
    pub creative_name: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub format: String,
    #[serde(rename = "formatDescription", default)]
    pub format_description: String,
    #[serde(default)]
    pub specs: String,
    #[serde(default)]
    pub template: String,
    #[serde(rename = "adLink", default)]
    pub ad_link: String,
    #[serde(default)]
    pub impressions: String,
    #[serde(default)]
    pub clicks: String,
    #[serde(default)]
    pub filtered_click: String,
    #[serde(default)]
    pub engagement: String,
    #[serde(default)]
    pub first_impression_date: String,
    #[serde(default)]
    pub universal_interaction_rate: String,
    #[serde(default)]
    pub filterctr: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(flatten)]
    pub features: FeatureSet,
}

/// Immutable result of one ingestion run, shared by reference.
pub type Snapshot = Arc<[Ad]>;

impl Ad {
    /// Text fed to the embedding model: the semantically meaningful fields
    /// joined by single spaces, empty ones skipped.
    pub fn embedding_text(&self) -> String {
        [
            self.account.as_str(),
            self.brand.as_str(),
            self.industry.as_str(),
            self.campaign.as_str(),
            self.creative_name.as_str(),
            self.format.as_str(),
            self.template.as_str(),
            self.features.joined(),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// Attribute subset copied into the vector index.
    pub fn attributes(&self) -> AdAttributes {
        AdAttributes {
            account: self.account.clone(),
            brand: self.brand.clone(),
            industry: self.industry.clone(),
            campaign: self.campaign.clone(),
            creative_id: self.creative_id.clone(),
            creative_name: self.creative_name.clone(),
            device: self.device.clone(),
            format: self.format.clone(),
            template: self.template.clone(),
            ad_link: self.ad_link.clone(),
            features: self.features.joined().to_string(),
            thumbnail: self.thumbnail.clone(),
        }
    }

    /// Rebuilds an ad view from index attributes alone. Metrics and format
    /// lookup fields are not stored in the index and come back empty.
    pub fn from_attributes(id: u64, attrs: AdAttributes) -> Self {
        Ad {
            id,
            account: attrs.account,
            brand: attrs.brand,
            industry: attrs.industry,
            campaign: attrs.campaign,
            creative_id: attrs.creative_id,
            creative_name: attrs.creative_name,
            device: attrs.device,
            format: attrs.format,
            template: attrs.template,
            ad_link: attrs.ad_link,
            thumbnail: attrs.thumbnail,
            features: FeatureSet::from_joined(attrs.features),
            ..Ad::default()
        }
    }
}

/// Denormalized fields carried by each vector record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdAttributes {
    pub account: String,
    pub brand: String,
    pub industry: String,
    pub campaign: String,
    pub creative_id: String,
    pub creative_name: String,
    pub device: String,
    pub format: String,
    pub template: String,
    pub ad_link: String,
    pub features: String,
    pub thumbnail: String,
}

/// An embedding plus attributes, keyed by the source ad's id.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: u64,
    pub embedding: Vec<f32>,
    pub attributes: AdAttributes,
}

/// One k-NN hit. `distance` is cosine distance: 0 means identical direction.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: u64,
    pub attributes: AdAttributes,
    pub distance: f32,
}
