//! HTTP adapters for the upstream service clients.
//!
//! One thin adapter per service trait; all remote calls go through the retry
//! and token-renewal wrapper from the `retry` submodule.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::GenomeRelease;

use super::retry::{call_with_renewal, RetryPolicy};
use super::{
    ArchivedCase, BatchAnnotationClient, BatchAnnotationResult, CaseArchiveClient, CaseStatus,
    ClientError, InterpretationClient, InterpretationRequest, VariantClient, VariantWrapper,
};

/// Response payload of the token endpoint.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    token: String,
}

/// Shared HTTP plumbing for one service endpoint.
///
/// Holds the bearer token behind a lock so that a renewal triggered by one
/// in-flight call is observed by all later calls.
pub struct HttpService {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: tokio::sync::RwLock<Option<String>>,
    policy: RetryPolicy,
}

impl HttpService {
    /// Construct for the given base URL and credentials.
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        policy: RetryPolicy,
    ) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ClientError::Connect(anyhow::anyhow!("building HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            token: tokio::sync::RwLock::new(None),
            policy,
        })
    }

    /// Fetch a fresh access token from the service.
    async fn renew_token(&self) -> Result<(), ClientError> {
        let url = format!("{}/authenticate", &self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "username": &self.username,
                "password": &self.password,
            }))
            .send()
            .await
            .map_err(|e| ClientError::Connect(anyhow::anyhow!("{}", e)))?;
        if !response.status().is_success() {
            return Err(ClientError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(anyhow::anyhow!("{}", e)))?;
        *self.token.write().await = Some(token_response.token);
        Ok(())
    }

    /// Perform one request attempt and decode the JSON response.
    async fn attempt<T>(&self, request: reqwest::RequestBuilder) -> Result<T, ClientError>
    where
        T: serde::de::DeserializeOwned,
    {
        let request = if let Some(token) = self.token.read().await.as_deref() {
            request.bearer_auth(token)
        } else {
            request
        };
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Connect(anyhow::anyhow!("{}", e)))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ClientError::Auth(format!("service returned {}", status)));
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(anyhow::anyhow!("{}", e)))
    }

    /// GET the given path and decode the JSON response, with retry/renewal.
    pub async fn get_json<T>(&self, path_and_query: &str) -> Result<T, ClientError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", &self.base_url, path_and_query);
        call_with_renewal(
            &self.policy,
            || self.renew_token(),
            || self.attempt(self.client.get(&url)),
        )
        .await
    }

    /// POST a JSON body to the given path and decode the response, with
    /// retry/renewal.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: serde::Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", &self.base_url, path);
        call_with_renewal(
            &self.policy,
            || self.renew_token(),
            || self.attempt(self.client.post(&url).json(body)),
        )
        .await
    }
}

/// Default number of cases requested per archive page.
pub const DEFAULT_ARCHIVE_PAGE_SIZE: usize = 100;

/// Collect all pages of a paginated listing endpoint.
///
/// Pages are requested in order; a page shorter than `page_size` is the last
/// one.
async fn collect_pages<T, F, Fut>(page_size: usize, fetch: F) -> Result<Vec<T>, ClientError>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, ClientError>>,
{
    let mut all = Vec::new();
    let mut page = 0;
    loop {
        let mut items = fetch(page).await?;
        let is_last = items.len() < page_size;
        all.append(&mut items);
        if is_last {
            return Ok(all);
        }
        page += 1;
    }
}

/// HTTP adapter for the case archive service.
#[derive(derive_new::new)]
pub struct HttpCaseArchiveClient {
    service: HttpService,
    page_size: usize,
}

#[async_trait]
impl CaseArchiveClient for HttpCaseArchiveClient {
    async fn get_cases(
        &self,
        program: &str,
        assembly: GenomeRelease,
        statuses: &[CaseStatus],
    ) -> Result<Vec<ArchivedCase>, ClientError> {
        let statuses = statuses.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        collect_pages(self.page_size, |page| {
            let path = format!(
                "/cases?program={}&assembly={}&caseStatuses={}&pageSize={}&page={}",
                program,
                assembly.name(),
                statuses.join(","),
                self.page_size,
                page
            );
            async move { self.service.get_json(&path).await }
        })
        .await
    }
}

/// HTTP adapter for per-identifier variant lookups.
#[derive(derive_new::new)]
pub struct HttpVariantClient {
    service: HttpService,
}

#[async_trait]
impl VariantClient for HttpVariantClient {
    async fn get_variant_by_id(&self, id: &str) -> Result<Option<VariantWrapper>, ClientError> {
        let path = format!("/variants/{}", id);
        match self.service.get_json(&path).await {
            Ok(wrapper) => Ok(Some(wrapper)),
            Err(ClientError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// HTTP adapter for the clinical interpretation service.
#[derive(derive_new::new)]
pub struct HttpInterpretationClient {
    service: HttpService,
}

#[async_trait]
impl InterpretationClient for HttpInterpretationClient {
    async fn get_case(
        &self,
        case_id: &str,
        case_version: u32,
    ) -> Result<InterpretationRequest, ClientError> {
        let path = format!("/interpretation-request/{}/{}", case_id, case_version);
        self.service.get_json(&path).await
    }
}

/// Request payload of the batch annotation search endpoint.
#[derive(Debug, serde::Serialize)]
struct BatchSearchRequest<'a> {
    ids: &'a [String],
    include: Vec<String>,
}

/// HTTP adapter for batched variant annotation searches.
#[derive(derive_new::new)]
pub struct HttpBatchAnnotationClient {
    service: HttpService,
}

#[async_trait]
impl BatchAnnotationClient for HttpBatchAnnotationClient {
    async fn search(
        &self,
        ids: &[String],
        include: &[&str],
    ) -> Result<Vec<Option<BatchAnnotationResult>>, ClientError> {
        let body = BatchSearchRequest {
            ids,
            include: include.iter().map(|s| s.to_string()).collect(),
        };
        self.service.post_json("/annotation/search", &body).await
    }
}
