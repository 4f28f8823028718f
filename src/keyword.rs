//! Keyword fallback scoring.
//!
//! Used when semantic search is unavailable or comes back empty. Scoring is a
//! pure function of the query and the corpus:
//!
//! | Field group | Weight | Counted |
//! |-------------|--------|---------|
//! | industry | 3 | once per ad |
//! | brand | 2 | once per ad |
//! | format | 2 | once per ad |
//! | feature flags | 1 | per distinct matching query token |
//!
//! A group matches when any query token is a substring of any of the field's
//! tokens. The feature group is the only one that grows with the number of
//! matching tokens.

use std::collections::BTreeSet;

use crate::models::Ad;

const INDUSTRY_WEIGHT: u32 = 3;
const BRAND_WEIGHT: u32 = 2;
const FORMAT_WEIGHT: u32 = 2;
const FEATURE_WEIGHT: u32 = 1;

/// Lowercase, keep ASCII word characters and whitespace, split, and drop
/// tokens of two characters or fewer.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    cleaned
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

fn group_matches(query_tokens: &[String], field: &str) -> bool {
    if field.is_empty() {
        return false;
    }
    let field_tokens = tokenize(field);
    query_tokens
        .iter()
        .any(|q| field_tokens.iter().any(|f| f.contains(q.as_str())))
}

/// Score one ad against pre-tokenized query tokens.
pub fn score(query_tokens: &[String], ad: &Ad) -> u32 {
    let mut total = 0;

    if group_matches(query_tokens, &ad.industry) {
        total += INDUSTRY_WEIGHT;
    }
    if group_matches(query_tokens, &ad.brand) {
        total += BRAND_WEIGHT;
    }
    if group_matches(query_tokens, &ad.format) {
        total += FORMAT_WEIGHT;
    }

    let feature_tokens: Vec<String> = ad
        .features
        .flags()
        .iter()
        .flat_map(|flag| tokenize(flag))
        .collect();
    if !feature_tokens.is_empty() {
        let distinct: BTreeSet<&str> = query_tokens.iter().map(String::as_str).collect();
        let matched = distinct
            .into_iter()
            .filter(|q| feature_tokens.iter().any(|f| f.contains(q)))
            .count() as u32;
        total += matched * FEATURE_WEIGHT;
    }

    total
}

/// Rank `ads` by keyword score, highest first.
///
/// Ties keep corpus order. Ads scoring zero are dropped, unless nothing
/// scores at all, in which case the corpus is returned unchanged.
pub fn fallback_search(query: &str, ads: &[Ad]) -> Vec<Ad> {
    let query_tokens = tokenize(query);

    let mut scored: Vec<(u32, &Ad)> = ads
        .iter()
        .map(|ad| (score(&query_tokens, ad), ad))
        .filter(|(s, _)| *s > 0)
        .collect();

    if scored.is_empty() {
        return ads.to_vec();
    }

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, ad)| ad.clone()).collect()
}
