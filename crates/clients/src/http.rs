//! HTTP collaborator clients.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::collaborator::{
    DiscountCollaborator, DiscountRequest, DiscountResponse, TaxCollaborator, TaxRequest,
    TaxResponse,
};
use crate::ClientError;

/// Maps an HTTP status to a client error: server-side trouble and rate
/// limiting are transient, everything else 4xx is a rejection.
fn classify_status(status: StatusCode, body: String) -> ClientError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ClientError::Transient {
            message: format!("status {status}: {body}"),
        }
    } else {
        ClientError::Permanent {
            status: Some(status.as_u16()),
            message: body,
        }
    }
}

fn classify_send_error(err: reqwest::Error) -> ClientError {
    // Anything that failed before a response arrived is worth retrying.
    ClientError::Transient {
        message: err.to_string(),
    }
}

async fn post_json<Req, Resp>(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    request: &Req,
) -> Result<Resp, ClientError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let url = format!("{}{path}", base_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(request)
        .send()
        .await
        .map_err(classify_send_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, body));
    }

    response.json().await.map_err(|err| ClientError::Permanent {
        status: None,
        message: format!("malformed response body: {err}"),
    })
}

/// Tax collaborator reached over HTTP.
pub struct HttpTaxClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaxClient {
    /// Creates a client against the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TaxCollaborator for HttpTaxClient {
    #[tracing::instrument(skip_all, fields(jurisdiction = %request.jurisdiction))]
    async fn calculate_tax(&self, request: TaxRequest) -> Result<TaxResponse, ClientError> {
        post_json(&self.client, &self.base_url, "/tax/calculate", &request).await
    }
}

/// Discount collaborator reached over HTTP.
pub struct HttpDiscountClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDiscountClient {
    /// Creates a client against the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DiscountCollaborator for HttpDiscountClient {
    #[tracing::instrument(skip_all, fields(customer_id = %request.customer_id))]
    async fn apply_discount(
        &self,
        request: DiscountRequest,
    ) -> Result<DiscountResponse, ClientError> {
        post_json(&self.client, &self.base_url, "/discounts/apply", &request).await
    }
}
