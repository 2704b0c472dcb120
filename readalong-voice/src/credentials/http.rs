use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
    routing::post,
    Router,
};
use tracing::debug;

use crate::credentials::error::{CredentialError, CredentialResult};
use crate::credentials::issuer::CredentialIssuer;
use crate::credentials::types::{CredentialRequest, EphemeralCredential};

/// Issuance routes: `POST /credentials`
pub fn credential_routes(issuer: Arc<dyn CredentialIssuer>) -> Router {
    Router::new()
        .route("/credentials", post(issue_credential))
        .with_state(issuer)
}

async fn issue_credential(
    State(issuer): State<Arc<dyn CredentialIssuer>>,
    payload: Result<Json<CredentialRequest>, JsonRejection>,
) -> CredentialResult<Json<EphemeralCredential>> {
    let Json(request) = payload.map_err(|e| {
        debug!(error = %e, "Rejected credential request body");
        CredentialError::InvalidRequest(e.body_text())
    })?;

    let credential = issuer.issue(request).await?;
    Ok(Json(credential))
}
