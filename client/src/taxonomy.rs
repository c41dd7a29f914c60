//! eBird taxonomy lookups used to put canonical names on detections.
//!
//! `GET {base}/ref/taxonomy/ebird?species=<code>&fmt=json` with the
//! `X-eBirdApiToken` header answers with a list; the first element's
//! `sciName`/`comName` are used.

use async_trait::async_trait;
use tracing::debug;

use birdlens_common::protocol::TaxonRecord;

use crate::error::ServiceError;

/// Canonical names for one species.  At least one field is set.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonName {
    pub scientific_name: Option<String>,
    pub common_name: Option<String>,
}

#[async_trait]
pub trait TaxonomyLookup: Send + Sync {
    async fn lookup(&self, species_code: &str) -> Result<TaxonName, ServiceError>;
}

/// Client for the public eBird API.
#[derive(Debug, Clone)]
pub struct EbirdTaxonomy {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl EbirdTaxonomy {
    pub fn new(client: reqwest::Client, base_url: &str, token: &str) -> Self {
        EbirdTaxonomy {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl TaxonomyLookup for EbirdTaxonomy {
    async fn lookup(&self, species_code: &str) -> Result<TaxonName, ServiceError> {
        let code = species_code.trim();
        if code.is_empty() {
            return Err(ServiceError::NotFound("empty species code".to_string()));
        }
        if self.token.is_empty() {
            return Err(ServiceError::MissingCredentials("eBird API token"));
        }

        let url = format!(
            "{}/ref/taxonomy/ebird?species={}&fmt=json",
            self.base_url,
            urlencoded(code)
        );
        let resp = self
            .client
            .get(&url)
            .header("X-eBirdApiToken", &self.token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ServiceError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }

        let records: Vec<TaxonRecord> = resp.json().await?;
        let first = records
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::NotFound(code.to_string()))?;

        let name = TaxonName {
            scientific_name: first.sci_name.filter(|s| !s.is_empty()),
            common_name: first.com_name.filter(|s| !s.is_empty()),
        };
        if name.scientific_name.is_none() && name.common_name.is_none() {
            return Err(ServiceError::NotFound(code.to_string()));
        }
        debug!("Taxonomy {code}: {name:?}");
        Ok(name)
    }
}

/// Percent-encode everything outside the unreserved set.
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencoded() {
        assert_eq!(urlencoded("amerob"), "amerob");
        assert_eq!(urlencoded("x&y=z"), "x%26y%3Dz");
        assert_eq!(urlencoded("a b"), "a%20b");
    }

    #[tokio::test]
    async fn test_lookup_without_token_makes_no_request() {
        // Unroutable base URL: reaching the network would error differently.
        let taxonomy = EbirdTaxonomy::new(reqwest::Client::new(), "http://127.0.0.1:9/", "");
        let err = taxonomy.lookup("amerob").await.unwrap_err();
        assert!(matches!(err, ServiceError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn test_lookup_empty_code() {
        let taxonomy = EbirdTaxonomy::new(reqwest::Client::new(), "http://127.0.0.1:9", "t");
        let err = taxonomy.lookup("  ").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
