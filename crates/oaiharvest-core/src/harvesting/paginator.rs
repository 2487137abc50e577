use chrono::NaiveDate;

use crate::error::AppError;
use crate::models::Provider;
use crate::oai::{OaiRequest, Verb};

/// Cursor over prefixes × sets × resumption tokens.
///
/// Sets vary fastest; a pending token keeps the cursor where it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Paginator {
    prefixes: Vec<String>,
    sets: Vec<String>,
    prefix_index: usize,
    set_index: usize,
    token: Option<String>,
    from: Option<NaiveDate>,
}

impl Paginator {
    pub fn new(prefixes: Vec<String>, sets: Vec<String>, from: Option<NaiveDate>) -> Self {
        Self {
            prefixes,
            sets,
            prefix_index: 0,
            set_index: 0,
            token: None,
            from,
        }
    }

    /// Fails when the cursor has run past the last prefix or set.
    pub fn check(&self) -> Result<(), AppError> {
        if self.prefix_index >= self.prefixes.len() {
            return Err(AppError::ProtocolError(format!(
                "prefix index {} out of range ({} prefixes)",
                self.prefix_index,
                self.prefixes.len()
            )));
        }
        if !self.sets.is_empty() && self.set_index >= self.sets.len() {
            return Err(AppError::ProtocolError(format!(
                "set index {} out of range ({} sets)",
                self.set_index,
                self.sets.len()
            )));
        }
        Ok(())
    }

    pub fn prefix(&self) -> Result<&str, AppError> {
        self.check()?;
        Ok(&self.prefixes[self.prefix_index])
    }

    pub fn set(&self) -> Option<&str> {
        self.sets.get(self.set_index).map(String::as_str)
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn from_date(&self) -> Option<NaiveDate> {
        self.from
    }

    /// Request for the current position. A pending token replaces prefix,
    /// set and date.
    pub fn request(&self, provider: &Provider, verb: Verb) -> Result<OaiRequest, AppError> {
        let prefix = self.prefix()?;
        let request = provider.request(verb);
        Ok(match &self.token {
            Some(token) => request.resume(token.clone()),
            None => request
                .with_prefix(prefix)
                .with_set(self.set().map(str::to_string))
                .with_from(self.from),
        })
    }

    /// Next page if a token is pending, else the next set, else the next prefix.
    pub fn advance(&mut self) -> bool {
        if self.token.is_some() {
            return true;
        }
        if self.sets.is_empty() {
            self.prefix_index += 1;
        } else {
            self.set_index += 1;
            if self.set_index >= self.sets.len() {
                self.set_index = 0;
                self.prefix_index += 1;
            }
        }
        self.prefix_index < self.prefixes.len()
    }

    /// Drops any pending token and moves past the current set or prefix.
    pub fn skip(&mut self) -> bool {
        self.token = None;
        self.advance()
    }
}
