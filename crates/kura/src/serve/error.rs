use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::{KuraError, NotServableReason};

/// Turns serving failures into plain-text HTTP answers.
pub struct ServeError(pub KuraError);

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            KuraError::NotServable { reason, .. } => match reason {
                NotServableReason::Unknown | NotServableReason::Missing => StatusCode::NOT_FOUND,
                NotServableReason::Incomplete => StatusCode::CONFLICT,
                NotServableReason::LicenseInvalid => StatusCode::FORBIDDEN,
                NotServableReason::Corrupt => StatusCode::INTERNAL_SERVER_ERROR,
            },
            KuraError::InvalidAssetId(_) | KuraError::UnknownAsset(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<KuraError> for ServeError {
    fn from(e: KuraError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Serving failed: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AssetId;

    #[test]
    fn test_status() {
        let asset = AssetId::new("a").unwrap();
        let status = |reason| {
            ServeError(KuraError::NotServable {
                asset: asset.clone(),
                reason,
            })
            .status()
        };
        assert_eq!(status(NotServableReason::Unknown), StatusCode::NOT_FOUND);
        assert_eq!(status(NotServableReason::Incomplete), StatusCode::CONFLICT);
        assert_eq!(status(NotServableReason::LicenseInvalid), StatusCode::FORBIDDEN);
        assert_eq!(
            ServeError(KuraError::StorageError("disk".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
