//! HTTP agent service client.
//!
//! Routes (relative to the configured base URL):
//!
//! ```text
//! POST /connections/create-invitation
//! POST /connections/receive-invitation
//! GET  /connections/{id}
//! POST /schemas
//! POST /credential-definitions
//! POST /issue-credential/send-offer
//! GET  /issue-credential/records?connection_id={id}&state=offer-received
//! POST /issue-credential/records/{id}/send-request
//! GET  /issue-credential/records/{id}
//! POST /present-proof/send-request
//! GET  /present-proof/records?connection_id={id}&state=request-received
//! POST /present-proof/records/{id}/send-presentation
//! GET  /present-proof/records/{id}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ExchangeError, Result};
use crate::ids::{ExchangeId, HolderIdentifier};
use crate::invitation::InvitationArtifact;
use crate::state::ProofConstraint;

use super::messages::*;
use super::{AgentError, AgentResult, AgentService};

const USER_AGENT: &str = concat!("agentic-exchange/", env!("CARGO_PKG_VERSION"));

/// Agent service reached over HTTP with JSON bodies.
pub struct HttpAgentService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgentService {
    /// Create a client for the agent at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `ExchangeError::Config` if the URL is not http(s) or the HTTP
    /// client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ExchangeError::Config(format!(
                "agent URL must be http(s): {base_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ExchangeError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> AgentResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;
        decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> AgentResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;
        decode(response).await
    }
}

/// Turn a response into a typed body, keeping the agent's diagnostic text.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> AgentResult<T> {
    let status = response.status();
    if !status.is_success() {
        let diagnostic = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
        return Err(AgentError::Rejected {
            status: status.as_u16(),
            diagnostic: diagnostic.trim().to_string(),
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| AgentError::Malformed(e.to_string()))
}

#[async_trait]
impl AgentService for HttpAgentService {
    async fn create_invitation(&self, alias: &str) -> AgentResult<CreatedInvitation> {
        self.post(
            "/connections/create-invitation",
            &CreateInvitationRequest {
                alias: alias.to_string(),
            },
        )
        .await
    }

    async fn accept_invitation(
        &self,
        alias: &str,
        invitation: &InvitationArtifact,
    ) -> AgentResult<AcceptedInvitation> {
        self.post(
            "/connections/receive-invitation",
            &AcceptInvitationRequest {
                alias: alias.to_string(),
                invitation: invitation.clone(),
            },
        )
        .await
    }

    async fn connection_state(&self, connection_id: &ExchangeId) -> AgentResult<ConnectionStatus> {
        self.get(&format!("/connections/{connection_id}"), &[])
            .await
    }

    async fn publish_schema(&self, schema: &SchemaDefinition) -> AgentResult<PublishedSchema> {
        self.post("/schemas", schema).await
    }

    async fn publish_credential_definition(
        &self,
        schema_id: &str,
    ) -> AgentResult<PublishedCredentialDefinition> {
        self.post(
            "/credential-definitions",
            &PublishDefinitionRequest {
                schema_id: schema_id.to_string(),
            },
        )
        .await
    }

    async fn send_credential_offer(
        &self,
        offer: &CredentialOfferRequest,
    ) -> AgentResult<SentOffer> {
        self.post("/issue-credential/send-offer", offer).await
    }

    async fn credential_offers(
        &self,
        connection_id: &ExchangeId,
    ) -> AgentResult<Vec<OfferSummary>> {
        let listed: Results<OfferSummary> = self
            .get(
                "/issue-credential/records",
                &[
                    ("connection_id", connection_id.as_str()),
                    ("state", "offer-received"),
                ],
            )
            .await?;
        Ok(listed.results)
    }

    async fn accept_credential_offer(
        &self,
        exchange_id: &ExchangeId,
        holder_identifier: &HolderIdentifier,
    ) -> AgentResult<OfferAcceptance> {
        self.post(
            &format!("/issue-credential/records/{exchange_id}/send-request"),
            &AcceptOfferRequest {
                holder_identifier: holder_identifier.clone(),
            },
        )
        .await
    }

    async fn credential_exchange_state(
        &self,
        exchange_id: &ExchangeId,
    ) -> AgentResult<CredentialStatus> {
        self.get(&format!("/issue-credential/records/{exchange_id}"), &[])
            .await
    }

    async fn send_proof_request(
        &self,
        connection_id: &ExchangeId,
        constraint: &ProofConstraint,
    ) -> AgentResult<SentProofRequest> {
        self.post(
            "/present-proof/send-request",
            &ProofRequestBody {
                connection_id: connection_id.clone(),
                constraint: constraint.clone(),
            },
        )
        .await
    }

    async fn proof_requests(
        &self,
        connection_id: &ExchangeId,
    ) -> AgentResult<Vec<ProofRequestSummary>> {
        let listed: Results<ProofRequestSummary> = self
            .get(
                "/present-proof/records",
                &[
                    ("connection_id", connection_id.as_str()),
                    ("state", "request-received"),
                ],
            )
            .await?;
        Ok(listed.results)
    }

    async fn send_presentation(
        &self,
        exchange_id: &ExchangeId,
        credential_id: &str,
    ) -> AgentResult<PresentationSubmitted> {
        self.post(
            &format!("/present-proof/records/{exchange_id}/send-presentation"),
            &SendPresentationRequest {
                credential_id: credential_id.to_string(),
            },
        )
        .await
    }

    async fn presentation_exchange_state(
        &self,
        exchange_id: &ExchangeId,
    ) -> AgentResult<PresentationStatus> {
        self.get(&format!("/present-proof/records/{exchange_id}"), &[])
            .await
    }
}
