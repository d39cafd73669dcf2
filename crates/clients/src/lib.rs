//! HTTP clients for the external collaborators: product catalog and
//! auth/session. Both are thin request/response contracts; a failure here
//! degrades the affected operation only.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Collaborator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Collaborator returned status {0}")]
    Status(u16),
}

/// A product variant as the catalog sees it right now.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VariantRecord {
    pub sku: String,
    pub price: i64,
    pub in_stock: bool,
}

/// Product catalog collaborator. Used for the add-to-cart price snapshot and
/// the price-drift check at review time.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Current variant record, or None if the variant no longer exists.
    async fn get_variant(
        &self,
        product_id: &str,
        variant_sku: &str,
    ) -> Result<Option<VariantRecord>, ClientError>;
}

/// Auth/session collaborator: resolves a bearer token to a user id. Absence
/// gates every mutating call.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// User id for a valid session token, None for an invalid/expired one.
    async fn current_user(&self, token: &str) -> Result<Option<String>, ClientError>;
}

/// HTTP implementation of [`CatalogClient`].
pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn get_variant(
        &self,
        product_id: &str,
        variant_sku: &str,
    ) -> Result<Option<VariantRecord>, ClientError> {
        let url = format!(
            "{}/products/{}/variants/{}",
            self.base_url, product_id, variant_sku
        );
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        let variant: VariantRecord = response.json().await?;
        Ok(Some(variant))
    }
}

#[derive(Debug, Deserialize)]
struct CurrentUserResponse {
    user_id: String,
}

/// HTTP implementation of [`AuthClient`].
pub struct HttpAuthClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn current_user(&self, token: &str) -> Result<Option<String>, ClientError> {
        let url = format!("{}/session/me", self.base_url);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        let user: CurrentUserResponse = response.json().await?;
        Ok(Some(user.user_id))
    }
}
