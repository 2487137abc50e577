use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::oai::{OaiRequest, OaiResponse};
use crate::xml::Element;

/// Sends OAI-PMH requests and returns parsed responses.
///
/// Implementations handle redirects, `503 Retry-After` and content decoding.
/// An OAI `<error>` in the body is not an error at this level; callers
/// inspect it through [`OaiResponse::check`].
pub trait OaiEndpoint: Send + Sync + Clone {
    fn invoke(
        &self,
        request: &OaiRequest,
    ) -> impl Future<Output = Result<OaiResponse, AppError>> + Send;

    /// Fetches a plain XML document, used for static repositories.
    fn fetch_document(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Element, AppError>> + Send;
}
