//! Harvesting variants behind one pagination contract.
//!
//! A variant is driven as `request` → `process_response` → `parse_response`
//! until `fully_parsed`, then `request_more` decides whether another page,
//! set or prefix follows. Listing variants share their cursor through
//! [`Paginator`].

mod identifiers;
mod paginator;
mod prefixes;
mod record;
mod records;
mod static_repo;

use std::future::Future;

pub use identifiers::ListIdentifiers;
pub use paginator::Paginator;
pub use prefixes::{ListPrefixes, match_formats};
pub use record::GetRecord;
pub use records::ListRecords;
pub use static_repo::{StaticPrefixes, StaticRecordList, fetch_repository};

use crate::error::AppError;
use crate::oai::OaiResponse;
use crate::xml::Element;

/// One harvesting variant.
pub trait Harvesting: Send {
    /// What `parse_response` yields.
    type Item: Send;

    /// Issues the request for the current position, with the provider's
    /// retry policy. Exhausted retries surface as the last error.
    fn request(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Last response received.
    fn response(&self) -> Result<OaiResponse, AppError>;

    /// Moves to the next page, set or prefix. `false` when nothing is left.
    fn request_more(&mut self) -> Result<bool, AppError>;

    /// Gives up on the current position after a failed request and moves
    /// past it. `false` when nothing is left.
    fn abandon_position(&mut self) -> Result<bool, AppError> {
        Ok(false)
    }

    /// Takes in a response; `false` when it holds nothing usable.
    fn process_response(&mut self, response: &OaiResponse) -> Result<bool, AppError>;

    /// Next item of the processed response. `None` when the item was
    /// skipped or the response is exhausted.
    fn parse_response(
        &mut self,
    ) -> impl Future<Output = Result<Option<Self::Item>, AppError>> + Send;

    fn fully_parsed(&self) -> Result<bool, AppError>;
}

/// Whether an OAI header marks its record as deleted.
pub(crate) fn is_deleted(header: &Element) -> bool {
    header.attr("status") == Some("deleted")
}

/// Identifier of a `<record>`, unless it is deleted or has none.
pub(crate) fn live_identifier(record: &Element) -> Option<String> {
    let header = record.child("header")?;
    if is_deleted(header) {
        return None;
    }
    header.child_text("identifier").filter(|id| !id.is_empty())
}

fn not_requested(what: &str) -> AppError {
    AppError::ProtocolError(format!("{what} before a response was received"))
}
