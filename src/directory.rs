// 🌐 Organisation directory lookups
// The directory is consumed, not reimplemented: one code in, zero or one commissioner out.

use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{IndexError, LookupFailure};

/// Relationship id for "commissioned by"
pub const COMMISSIONED_BY: &str = "RE4";

/// Narrow seam between the reconciliation cache and the outside world.
///
/// `Ok(None)` is a valid answer: the facility exists but has no active
/// commissioned-by relationship.
pub trait DirectoryClient: Send + Sync {
    fn resolve_one(&self, facility_code: &str) -> Result<Option<String>, LookupFailure>;
}

impl<T: DirectoryClient + ?Sized> DirectoryClient for Arc<T> {
    fn resolve_one(&self, facility_code: &str) -> Result<Option<String>, LookupFailure> {
        (**self).resolve_one(facility_code)
    }
}

/// Pull the active commissioned-by target out of an organisation document.
///
/// `Organisation.Rels.Rel` is normally a list but a single relationship may be
/// returned as a bare object.
pub fn commissioner_from_response(document: &Value) -> Result<Option<String>, LookupFailure> {
    let organisation = document
        .get("Organisation")
        .ok_or_else(|| LookupFailure::Malformed("missing Organisation".to_string()))?;

    let rels = match organisation.get("Rels").and_then(|r| r.get("Rel")) {
        Some(rels) => rels,
        None => return Ok(None),
    };

    let relationships: Vec<&Value> = match rels {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![rels],
        _ => return Err(LookupFailure::Malformed("Rels.Rel is neither list nor object".to_string())),
    };

    let commissioner = relationships
        .into_iter()
        .filter(|rel| rel.get("id").and_then(Value::as_str) == Some(COMMISSIONED_BY))
        .filter(|rel| rel.get("Status").and_then(Value::as_str) == Some("Active"))
        .find_map(|rel| {
            rel.get("Target")
                .and_then(|t| t.get("OrgId"))
                .and_then(|o| o.get("extension"))
                .and_then(Value::as_str)
                .map(|code| code.trim().to_string())
                .filter(|code| !code.is_empty())
        });

    Ok(commissioner)
}

/// HTTP client for the ODS organisation directory
pub struct OdsDirectoryClient {
    base_url: Url,
    client: reqwest::blocking::Client,
    rate_limit_backoff: Duration,
}

impl OdsDirectoryClient {
    pub fn new(base_url: &str, timeout: Duration, rate_limit_backoff: Duration) -> Result<Self, IndexError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexError::Config(format!("failed to create HTTP client: {}", e)))?;

        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| IndexError::Config(format!("invalid directory URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(IndexError::Config(format!("directory URL {} cannot take a path", base_url)));
        }

        Ok(Self {
            base_url,
            client,
            rate_limit_backoff,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, IndexError> {
        Self::new(
            &config.directory_base_url,
            config.lookup_timeout,
            config.rate_limit_backoff,
        )
    }

    /// Organisation endpoint for one code, with the code escaped as a single path segment
    fn organisation_url(&self, facility_code: &str) -> Result<Url, LookupFailure> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LookupFailure::Transport(format!("directory URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push(facility_code);
        Ok(url)
    }

    fn fetch(&self, url: &Url) -> Result<reqwest::blocking::Response, LookupFailure> {
        self.client
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    LookupFailure::Timeout
                } else {
                    LookupFailure::Transport(e.to_string())
                }
            })
    }
}

impl DirectoryClient for OdsDirectoryClient {
    fn resolve_one(&self, facility_code: &str) -> Result<Option<String>, LookupFailure> {
        let url = self.organisation_url(facility_code)?;

        let mut response = self.fetch(&url)?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            warn!(
                facility_code,
                backoff_ms = self.rate_limit_backoff.as_millis() as u64,
                "Directory rate limit hit, backing off once"
            );
            thread::sleep(self.rate_limit_backoff);
            response = self.fetch(&url)?;
        }

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(LookupFailure::NotFound),
            StatusCode::TOO_MANY_REQUESTS => return Err(LookupFailure::RateLimited),
            s if !s.is_success() => {
                return Err(LookupFailure::Transport(format!("HTTP {}", s.as_u16())))
            }
            _ => {}
        }

        let document: Value = response
            .json()
            .map_err(|e| LookupFailure::Malformed(e.to_string()))?;

        let commissioner = commissioner_from_response(&document)?;
        debug!(facility_code, commissioner = ?commissioner, "Directory answered");
        Ok(commissioner)
    }
}
