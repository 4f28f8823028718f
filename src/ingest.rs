//! Row-to-ad mapping.
//!
//! Turns the raw ad rows and format lookup rows into a fully materialized
//! [`Snapshot`]. Ids are assigned from row order starting at 1.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::IngestConfig;
use crate::models::{Ad, FeatureSet, FormatInfo, Snapshot, SourceRow, SourceRows};

/// Boolean feature columns. A feature is active when its cell reads `yes`.
pub const FEATURE_COLUMNS: [&str; 33] = [
    "button",
    "hotspot",
    "fire",
    "objthreesixty",
    "photosphere",
    "feed_carousel",
    "fog",
    "puzzle",
    "cloud",
    "wipey",
    "group",
    "checkbox",
    "text",
    "feature",
    "nearbyele",
    "dd",
    "sun",
    "advanced_gallery",
    "gallery",
    "map",
    "confetti",
    "shape",
    "video",
    "countdown",
    "rain",
    "socialdisplay",
    "snow",
    "waterbubble",
    "image",
    "smoke",
    "nightstar",
    "textbox",
    "form",
];

/// Builds the format → {description, specs} lookup.
///
/// Later rows win when a format name repeats.
pub fn format_lookup(rows: &[SourceRow]) -> HashMap<String, FormatInfo> {
    rows.iter()
        .map(|row| {
            (
                cell(row, "format").to_string(),
                FormatInfo {
                    description: cell(row, "description").to_string(),
                    specs: cell(row, "specs").to_string(),
                },
            )
        })
        .collect()
}

/// Materializes every ad row into an [`Ad`].
pub fn build_snapshot(rows: &SourceRows, config: &IngestConfig) -> Snapshot {
    let formats = format_lookup(&rows.formats);
    let ads: Vec<Ad> = rows
        .ads
        .iter()
        .enumerate()
        .map(|(index, row)| build_ad(index as u64 + 1, row, &formats, &config.image_base_url))
        .collect();
    Arc::from(ads)
}

fn build_ad(
    id: u64,
    row: &SourceRow,
    formats: &HashMap<String, FormatInfo>,
    image_base_url: &str,
) -> Ad {
    let format = cell(row, "format").to_string();
    let format_info = formats.get(&format).cloned().unwrap_or_default();

    let screenshot_path = cell(row, "screenshot_path");
    let thumbnail = if screenshot_path.is_empty() {
        String::new()
    } else {
        format!("{}{}", image_base_url, screenshot_path)
    };

    Ad {
        id,
        account: cell(row, "account").to_string(),
        brand: cell(row, "brand").to_string(),
        industry: cell(row, "industry").to_string(),
        campaign: cell(row, "campaign").to_string(),
        creative_id: cell(row, "creative_id").to_string(),
        creative_name: cell(row, "creative_name").to_string(),
        device: cell(row, "device").to_string(),
        format,
        format_description: format_info.description,
        specs: format_info.specs,
        template: cell(row, "template").to_string(),
        ad_link: cell(row, "previewurl").to_string(),
        impressions: cell(row, "impressions").to_string(),
        clicks: cell(row, "clicks").to_string(),
        filtered_click: cell(row, "filtered click").to_string(),
        engagement: cell(row, "engagement").to_string(),
        first_impression_date: cell(row, "first impression date").to_string(),
        universal_interaction_rate: cell(row, "universal interaction rate").to_string(),
        filterctr: cell(row, "filterctr").to_string(),
        thumbnail,
        features: FeatureSet::from_flags(active_features(row)),
    }
}

/// Labels of the active feature columns, in column order.
///
/// The first underscore of a column name becomes a space
/// (`feed_carousel` → `feed carousel`).
pub fn active_features(row: &SourceRow) -> Vec<String> {
    FEATURE_COLUMNS
        .iter()
        .filter(|col| cell(row, col).eq_ignore_ascii_case("yes"))
        .map(|col| col.replacen('_', " ", 1))
        .collect()
}

fn cell<'a>(row: &'a SourceRow, column: &str) -> &'a str {
    row.get(column).map(String::as_str).unwrap_or("")
}
