//! Admission webhook HTTPS server
//!
//! Serves the mutating and validating hooks for Rollout records. TLS comes
//! from a supplied cert/key pair; without one, a self-signed certificate is
//! generated so local clusters can exercise the hooks.

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Json, Router,
};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{error, info, warn};

use crate::crd::Rollout;
use crate::error::{Error, Result};
use crate::webhook::rollout::{defaulting_ops, denial_message};

/// Paths to a PEM certificate/key pair for the webhook listener.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

pub struct WebhookServer {
    addr: SocketAddr,
    tls: Option<TlsConfig>,
}

impl WebhookServer {
    pub fn new(addr: SocketAddr, tls: Option<TlsConfig>) -> Self {
        Self { addr, tls }
    }

    fn router() -> Router {
        Router::new()
            .route("/mutate-rollout", post(mutate_handler))
            .route("/validate-rollout", post(validate_handler))
            .route("/healthz", get(|| async { "ok" }))
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> Result<()> {
        let app = Self::router();

        let rustls = match &self.tls {
            Some(tls) => {
                info!(cert = %tls.cert_path, "loading webhook TLS certificate");
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    &tls.cert_path,
                    &tls.key_path,
                )
                .await
                .map_err(|e| Error::ConfigError(format!("webhook TLS: {e}")))?
            }
            None => {
                warn!("no webhook certificate configured, generating a self-signed one");
                let certified = rcgen::generate_simple_self_signed(vec![
                    "aiops-webhook".to_string(),
                    "aiops-webhook.default.svc".to_string(),
                ])
                .map_err(|e| Error::ConfigError(format!("self-signed certificate: {e}")))?;

                axum_server::tls_rustls::RustlsConfig::from_pem(
                    certified.cert.pem().into_bytes(),
                    certified.key_pair.serialize_pem().into_bytes(),
                )
                .await
                .map_err(|e| Error::ConfigError(format!("webhook TLS: {e}")))?
            }
        };

        info!(addr = %self.addr, "starting admission webhook server");
        axum_server::bind_rustls(self.addr, rustls)
            .serve(app.into_make_service())
            .await
            .map_err(|e| Error::ConfigError(format!("webhook server: {e}")))?;

        Ok(())
    }
}

/// Mutating hook: emit defaulting JSON-Patch operations.
async fn mutate_handler(
    Json(review): Json<AdmissionReview<Rollout>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Rollout> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("invalid mutating admission request: {e}");
            return Json(
                AdmissionResponse::invalid(format!("invalid admission request: {e}"))
                    .into_review(),
            );
        }
    };

    let mut response = AdmissionResponse::from(&request);

    if let Some(rollout) = &request.object {
        let ops = defaulting_ops(&rollout.spec);
        if !ops.is_empty() {
            info!(
                name = %request.name,
                operations = ops.len(),
                "defaulting rollout"
            );
            match serde_json::from_value::<json_patch::Patch>(serde_json::Value::Array(ops)) {
                Ok(patch) => match response.with_patch(patch) {
                    Ok(patched) => response = patched,
                    Err(e) => {
                        error!("failed to attach defaulting patch: {e}");
                        response =
                            AdmissionResponse::invalid(format!("defaulting failed: {e}"));
                    }
                },
                Err(e) => {
                    error!("failed to build defaulting patch: {e}");
                    response = AdmissionResponse::invalid(format!("defaulting failed: {e}"));
                }
            }
        }
    }

    Json(response.into_review())
}

/// Validating hook: deny on any invariant violation, all of them in one
/// message.
async fn validate_handler(
    Json(review): Json<AdmissionReview<Rollout>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Rollout> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("invalid validating admission request: {e}");
            return Json(
                AdmissionResponse::invalid(format!("invalid admission request: {e}"))
                    .into_review(),
            );
        }
    };

    let mut response = AdmissionResponse::from(&request);

    if let Some(rollout) = &request.object {
        if let Err(errors) = rollout.spec.validate() {
            let message = denial_message(&errors);
            warn!(name = %request.name, %message, "rejecting rollout");
            response = response.deny(message);
        }
    }

    Json(response.into_review())
}
