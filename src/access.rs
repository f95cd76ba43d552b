//! Frontera de acceso: traduce una petición al namespace del llamante.
//!
//! La autenticación la hace el proveedor de identidad que está delante del
//! servicio; aquí sólo se lee el identificador que deja en la cabecera
//! configurada (`NAMESPACE_HEADER`) y se convierte en un `Namespace`.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::{app_state::AppState, store::Namespace};

/// Namespace del usuario que hace la petición.
#[derive(Debug, Clone)]
pub struct CallerNamespace(pub Namespace);

#[async_trait]
impl FromRequestParts<AppState> for CallerNamespace {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = state.config.namespace_header.as_str();
        let token = parts
            .headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let Some(token) = token else {
            warn!("Petición sin cabecera de identidad '{}'.", header);
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Se requiere un usuario autenticado."})),
            )
                .into_response());
        };

        Namespace::new(token)
            .map(CallerNamespace)
            .map_err(IntoResponse::into_response)
    }
}
