use std::io::{Cursor, Read};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use oaiharvest_core::error::AppError;
use oaiharvest_core::oai::{OaiRequest, OaiResponse};
use oaiharvest_core::traits::OaiEndpoint;
use oaiharvest_core::xml::Element;
use reqwest::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, HeaderMap, HeaderValue, LOCATION, RETRY_AFTER,
};
use reqwest::{Client, StatusCode, redirect};
use url::Url;

const USER_AGENT: &str = "OAIHarvester/2.0";
const ACCEPTED_ENCODINGS: &str = "compress, gzip, identity";

/// Upper bounds for the redirect and `503` loops of a single request.
const MAX_REDIRECTS: usize = 16;
const MAX_UNAVAILABLE: usize = 32;

/// OAI-PMH endpoint over HTTP using reqwest.
///
/// Redirects (301/302/303) are followed by hand so the request is re-sent
/// as-is to the new location. A `503` with a positive `Retry-After` is
/// waited out and re-sent, a `Retry-After` date already past is re-sent at
/// once, and a missing or zero one reports the URL as bad.
/// Bodies are decoded per `Content-Encoding` before parsing.
#[derive(Clone)]
pub struct ReqwestEndpoint {
    client: Client,
}

impl ReqwestEndpoint {
    pub fn new() -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self { client })
    }

    /// GETs `url` and returns the decoded body.
    pub async fn get(&self, url: &str, timeout: Option<Duration>) -> Result<Vec<u8>, AppError> {
        let mut target =
            Url::parse(url).map_err(|e| AppError::BadUrl(format!("{url}: {e}")))?;
        let mut redirects = 0;
        let mut unavailable = 0;

        loop {
            let mut request = self.client.get(target.clone());
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            let response = request
                .send()
                .await
                .map_err(|e| transport_error(e, timeout))?;

            let status = response.status();
            match status {
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(AppError::HttpError(format!(
                            "too many redirects starting at {url}"
                        )));
                    }
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| {
                            AppError::HttpError(format!(
                                "HTTP {} without Location for {target}",
                                status.as_u16()
                            ))
                        })?;
                    let next = target.join(location).map_err(|e| {
                        AppError::BadUrl(format!("bad redirect to {location}: {e}"))
                    })?;
                    tracing::debug!(from = %target, to = %next, "Following redirect");
                    target = next;
                }
                StatusCode::SERVICE_UNAVAILABLE => {
                    let delay = retry_after(response.headers(), Utc::now())
                        .filter(|d| !d.is_zero())
                        .ok_or_else(|| {
                            AppError::BadUrl(format!("{target} unavailable without Retry-After"))
                        })?;
                    unavailable += 1;
                    if unavailable > MAX_UNAVAILABLE {
                        return Err(AppError::HttpError(format!(
                            "{target} still unavailable after {MAX_UNAVAILABLE} waits"
                        )));
                    }
                    // negative deltas fail the conversion: resend without sleeping
                    match delay.to_std() {
                        Ok(wait) => {
                            tracing::info!(
                                url = %target,
                                delay_secs = wait.as_secs(),
                                "Service unavailable, waiting before resending"
                            );
                            tokio::time::sleep(wait).await;
                        }
                        Err(_) => {
                            tracing::info!(
                                url = %target,
                                "Service unavailable, Retry-After already passed"
                            );
                        }
                    }
                }
                StatusCode::NOT_FOUND => {
                    return Err(AppError::BadUrl(format!("HTTP 404 for {target}")));
                }
                status if !status.is_success() => {
                    return Err(AppError::HttpError(format!(
                        "HTTP {} for {}",
                        status.as_u16(),
                        target
                    )));
                }
                _ => {
                    let encoding = response
                        .headers()
                        .get(CONTENT_ENCODING)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.trim().to_ascii_lowercase());
                    let body = response.bytes().await.map_err(|e| {
                        AppError::NetworkError(format!("Failed to read response body: {e}"))
                    })?;
                    return decode(encoding.as_deref(), &body);
                }
            }
        }
    }
}

impl OaiEndpoint for ReqwestEndpoint {
    async fn invoke(&self, request: &OaiRequest) -> Result<OaiResponse, AppError> {
        let url = request.url()?;
        tracing::debug!(url = %url, "Sending OAI-PMH request");
        let body = self.get(url.as_str(), request.timeout).await?;
        OaiResponse::parse(&body)
    }

    async fn fetch_document(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<Element, AppError> {
        let body = self.get(url, timeout).await?;
        Element::parse(&body)
    }
}

fn transport_error(e: reqwest::Error, timeout: Option<Duration>) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.map(|t| t.as_secs()).unwrap_or_default())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// `Retry-After` as a delay from `now`: delta-seconds or an HTTP-date.
/// Dates in the past give a negative delay.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<TimeDelta> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u32>() {
        return Some(TimeDelta::seconds(secs.into()));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    Some(date.with_timezone(&Utc) - now)
}

/// Undoes the `Content-Encoding` of a body.
///
/// `compress` is served as a zip archive whose first entry is the document.
fn decode(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, AppError> {
    let mut out = Vec::new();
    match encoding {
        None | Some("") | Some("identity") => return Ok(body.to_vec()),
        Some("gzip") | Some("x-gzip") => {
            GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| AppError::DecodeError(format!("gzip: {e}")))?;
        }
        Some("deflate") => {
            ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| AppError::DecodeError(format!("deflate: {e}")))?;
        }
        Some("compress") | Some("x-compress") => {
            let mut archive = zip::ZipArchive::new(Cursor::new(body))
                .map_err(|e| AppError::DecodeError(format!("compress: {e}")))?;
            let mut entry = archive
                .by_index(0)
                .map_err(|e| AppError::DecodeError(format!("compress: {e}")))?;
            entry
                .read_to_end(&mut out)
                .map_err(|e| AppError::DecodeError(format!("compress: {e}")))?;
        }
        Some(other) => {
            return Err(AppError::DecodeError(format!(
                "unsupported content encoding '{other}'"
            )));
        }
    }
    Ok(out)
}
