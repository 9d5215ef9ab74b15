//! Multi-level mapping: tracks the variant representations of one resource.
//!
//! For every base key the store keeps a mapping record (stored under
//! [`MAPPING_KEY_PREFIX`] + base key) listing the variant keys written for it,
//! each with the request headers it varied on, its etag and its freshness
//! window. Writes merge into the record; lookups elect a fresh or a
//! stale-but-usable variant for an incoming request.
//!
//! The record format and the election rules live behind [`MappingPolicy`] so a
//! host can substitute its own. [`DefaultMappingPolicy`] stores JSON.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{AGE, ETAG, IF_NONE_MATCH};
use http::request::Parts;
use http::{HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Reserved prefix of mapping record keys.
pub const MAPPING_KEY_PREFIX: &str = "IDX_";

/// Index key of the mapping record for `base_key`.
pub fn mapping_key(base_key: &str) -> String {
    format!("{MAPPING_KEY_PREFIX}{base_key}")
}

pub fn is_mapping_key(key: &str) -> bool {
    key.starts_with(MAPPING_KEY_PREFIX)
}

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Mapping record is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("Mapping record cannot be encoded: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Cannot build response for variant {key}: {source}")]
    Response {
        key: String,
        #[source]
        source: http::Error,
    },
}

/// Metadata kept for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Request header values this variant was negotiated on (lowercase names).
    pub varied_headers: BTreeMap<String, Vec<String>>,
    pub etag: String,
    pub stored_at: SystemTime,
    pub fresh_until: SystemTime,
    pub stale_until: SystemTime,
    /// Canonical identity of the underlying resource.
    pub real_key: String,
}

impl Variant {
    /// Whether `headers` carry the same values this variant varied on.
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        self.varied_headers
            .iter()
            .all(|(name, stored)| header_values(headers, name) == *stored)
    }
}

/// The variants known for one base key, keyed by variant key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub variants: BTreeMap<String, Variant>,
}

impl Mapping {
    pub fn decode(bytes: &[u8]) -> Result<Self, MappingError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes).map_err(MappingError::Corrupt)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MappingError> {
        serde_json::to_vec(self).map_err(MappingError::Encode)
    }

    /// Insert a variant, replacing any previous metadata for the same key.
    pub fn upsert(&mut self, varied_key: &str, variant: Variant) {
        self.variants.insert(varied_key.to_string(), variant);
    }

    /// Variants ordered newest first.
    pub fn newest_first(&self) -> Vec<(&String, &Variant)> {
        let mut variants: Vec<_> = self.variants.iter().collect();
        variants.sort_by(|a, b| b.1.stored_at.cmp(&a.1.stored_at));
        variants
    }
}

/// One variant write, as handed to [`MappingPolicy::update`].
#[derive(Debug, Clone)]
pub struct VariantUpdate<'a> {
    pub varied_key: &'a str,
    pub varied_headers: &'a HeaderMap,
    pub etag: &'a str,
    pub stored_at: SystemTime,
    pub fresh_until: SystemTime,
    pub stale_until: SystemTime,
    pub real_key: &'a str,
}

/// Conditional request state for a multi-level lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revalidator {
    pub if_none_match: Vec<String>,
    pub if_none_match_present: bool,
    /// Set when the elected variant's etag satisfied `If-None-Match`.
    pub matched: bool,
    pub matched_etag: Option<String>,
}

impl Revalidator {
    pub fn from_request(parts: &Parts) -> Self {
        let if_none_match: Vec<String> = parts
            .headers
            .get_all(IF_NONE_MATCH)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();

        Self {
            if_none_match_present: !if_none_match.is_empty(),
            if_none_match,
            ..Default::default()
        }
    }

    /// Record whether `etag` satisfies the request's `If-None-Match`.
    pub fn check(&mut self, etag: &str) {
        if !self.if_none_match_present || etag.is_empty() {
            return;
        }
        let weak = |tag: &str| tag.trim_start_matches("W/").to_string();
        let matched = self
            .if_none_match
            .iter()
            .any(|tag| tag == "*" || weak(tag.as_str()) == weak(etag));
        if matched {
            self.matched = true;
            self.matched_etag = Some(etag.to_string());
        }
    }
}

/// Result of a multi-level lookup.
#[derive(Debug, Default)]
pub struct Election {
    pub fresh: Option<Response<Bytes>>,
    pub stale: Option<Response<Bytes>>,
}

impl Election {
    pub fn is_miss(&self) -> bool {
        self.fresh.is_none() && self.stale.is_none()
    }
}

/// Record format and election rules for multi-level entries.
pub trait MappingPolicy: Send + Sync {
    /// Merge one variant into the serialized record (`None` when absent).
    fn update(&self, current: Option<&[u8]>, update: &VariantUpdate<'_>) -> Result<Vec<u8>, MappingError>;

    /// Pick a fresh and/or stale variant for `request`. `fetch` loads a
    /// variant's body by key.
    fn elect(
        &self,
        mapping: &[u8],
        request: &Parts,
        validator: &mut Revalidator,
        fetch: &dyn Fn(&str) -> Option<Vec<u8>>,
    ) -> Result<Election, MappingError>;
}

/// JSON records, exact `Vary` matching, time-based freshness.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMappingPolicy;

impl MappingPolicy for DefaultMappingPolicy {
    fn update(&self, current: Option<&[u8]>, update: &VariantUpdate<'_>) -> Result<Vec<u8>, MappingError> {
        let mut mapping = match current {
            Some(bytes) => Mapping::decode(bytes)?,
            None => Mapping::default(),
        };

        let mut varied_headers = BTreeMap::new();
        for name in update.varied_headers.keys() {
            varied_headers.insert(
                name.as_str().to_string(),
                header_values(update.varied_headers, name.as_str()),
            );
        }

        mapping.upsert(
            update.varied_key,
            Variant {
                varied_headers,
                etag: update.etag.to_string(),
                stored_at: update.stored_at,
                fresh_until: update.fresh_until,
                stale_until: update.stale_until,
                real_key: update.real_key.to_string(),
            },
        );

        trace!(
            varied_key = update.varied_key,
            variants = mapping.variants.len(),
            "Merged variant into mapping"
        );
        mapping.encode()
    }

    fn elect(
        &self,
        mapping: &[u8],
        request: &Parts,
        validator: &mut Revalidator,
        fetch: &dyn Fn(&str) -> Option<Vec<u8>>,
    ) -> Result<Election, MappingError> {
        let mapping = Mapping::decode(mapping)?;
        let now = SystemTime::now();
        let mut election = Election::default();
        let mut elected_etag: Option<&str> = None;

        for (key, variant) in mapping.newest_first() {
            if !variant.matches(&request.headers) {
                trace!(key = %key, "Variant does not match request");
                continue;
            }

            if now < variant.fresh_until {
                let Some(body) = fetch(key.as_str()) else {
                    debug!(key = %key, "Fresh variant missing from store");
                    continue;
                };
                election.fresh = Some(variant_response(key, variant, body, now)?);
                elected_etag = Some(&variant.etag);
                break;
            }

            if election.stale.is_none() && now < variant.stale_until {
                if let Some(body) = fetch(key.as_str()) {
                    election.stale = Some(variant_response(key, variant, body, now)?);
                    elected_etag = Some(&variant.etag);
                }
            }
        }

        if let Some(etag) = elected_etag {
            validator.check(etag);
        }
        Ok(election)
    }
}

fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .collect()
}

fn variant_response(
    key: &str,
    variant: &Variant,
    body: Vec<u8>,
    now: SystemTime,
) -> Result<Response<Bytes>, MappingError> {
    let age = now
        .duration_since(variant.stored_at)
        .unwrap_or(Duration::ZERO)
        .as_secs();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(AGE, age.to_string());
    if !variant.etag.is_empty() {
        builder = builder.header(ETAG, variant.etag.as_str());
    }

    builder
        .body(Bytes::from(body))
        .map_err(|source| MappingError::Response {
            key: key.to_string(),
            source,
        })
}
