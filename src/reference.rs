//! Client for the reference service, the authoritative owner of note text.
//!
//! Every call authenticates first with a cached bearer credential. Login
//! rejections fail immediately. Other login failures and rejected data
//! calls are retried with a fixed delay, up to `max_retries` extra attempts.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

use crate::config::ReferenceConfig;
use crate::credential::Credential;

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("reference service rejected credentials for {username} (status {status})")]
    AuthenticationFailure { username: String, status: u16 },

    #[error("reference service unavailable after {attempts} attempts: {reason}")]
    Transient { reason: String, attempts: u32 },

    #[error("reference service kept rejecting authorization after {attempts} attempts")]
    Unauthorized { attempts: u32 },

    #[error("note {0} not found in reference service")]
    NotFound(String),

    #[error("unexpected status {status} from reference service: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("invalid reference url: {0}")]
    InvalidUrl(String),

    #[error("reqwest error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Authoritative content of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteReferential {
    pub uri: String,
    #[serde(alias = "valeur")]
    pub value: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    /// Token lifetime in seconds, when the service reports one
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Where authoritative notes come from.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn fetch_note_by_uri(&self, uri: &str) -> Result<NoteReferential, ReferenceError>;

    async fn fetch_notes(&self, count: usize, offset: usize) -> Result<Vec<NoteReferential>, ReferenceError>;
}

pub struct ReferenceClient {
    base_url: Url,
    username: String,
    password: String,
    max_retries: u32,
    retry_delay: Duration,
    token_ttl: Duration,
    http: reqwest::Client,
    credential: Mutex<Option<Credential>>,
}

impl ReferenceClient {
    pub fn new(config: &ReferenceConfig) -> Result<Self, ReferenceError> {
        let raw = config.url.strip_suffix('/').unwrap_or(&config.url);
        let base_url = Url::parse(raw).map_err(|err| ReferenceError::InvalidUrl(format!("{raw}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ReferenceError::InvalidUrl(raw.to_string()));
        }

        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            token_ttl: config.token_ttl(),
            http,
            credential: Mutex::new(None),
        })
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        // checked in `new`
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Return a valid credential, logging in if forced or if the cached one
    /// is absent or expired.
    pub async fn authenticate(&self, force: bool) -> Result<Credential, ReferenceError> {
        let mut cached = self.credential.lock().await;

        if !force {
            if let Some(credential) = cached.as_ref() {
                if !credential.is_expired(Utc::now()) {
                    return Ok(credential.clone());
                }
            }
        }

        let url = self.endpoint(["api", "login"]);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let reason = match self
                .http
                .post(url.clone())
                .json(&LoginRequest {
                    username: &self.username,
                    password: &self.password,
                })
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    let login: LoginResponse = response.json().await?;
                    let credential = Credential::issue(
                        login.access_token,
                        login.expires_in,
                        self.token_ttl,
                        Utc::now(),
                    );
                    log::debug!(
                        "logged in to {} as {}, token valid until {}",
                        self.base_url,
                        self.username,
                        credential.expires_at()
                    );
                    *cached = Some(credential.clone());
                    return Ok(credential);
                }
                Ok(response)
                    if matches!(
                        response.status(),
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                    ) =>
                {
                    *cached = None;
                    let status = response.status().as_u16();
                    log::error!(
                        "reference service rejected login of {} at {} (status {status})",
                        self.username,
                        self.base_url
                    );
                    return Err(ReferenceError::AuthenticationFailure {
                        username: self.username.clone(),
                        status,
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    format!("login returned {status}: {body}")
                }
                Err(err) => format!("login failed: {err}"),
            };

            if attempts > self.max_retries {
                return Err(ReferenceError::Transient { reason, attempts });
            }

            log::warn!(
                "{reason} (attempt {attempts}/{}), retrying in {:?}",
                self.max_retries + 1,
                self.retry_delay
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Authenticated GET. A rejected authorization re-authenticates and
    /// retries within the same budget as logins.
    async fn get_json<T: DeserializeOwned>(&self, url: Url, uri: Option<&str>) -> Result<T, ReferenceError> {
        let mut attempts = 0;
        let mut force = false;

        loop {
            attempts += 1;
            let credential = self.authenticate(force).await?;

            log::debug!("GET {url}");
            let response = self
                .http
                .get(url.clone())
                .header(reqwest::header::AUTHORIZATION, credential.bearer())
                .send()
                .await?;

            match response.status() {
                status if status.is_success() => return Ok(response.json().await?),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    if attempts > self.max_retries {
                        return Err(ReferenceError::Unauthorized { attempts });
                    }
                    log::warn!(
                        "GET {url} was not authorized (attempt {attempts}/{}), logging in again",
                        self.max_retries + 1
                    );
                    force = true;
                    tokio::time::sleep(self.retry_delay).await;
                }
                StatusCode::NOT_FOUND => {
                    return Err(ReferenceError::NotFound(
                        uri.unwrap_or(url.path()).to_string(),
                    ))
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ReferenceError::UnexpectedStatus {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ReferenceSource for ReferenceClient {
    async fn fetch_note_by_uri(&self, uri: &str) -> Result<NoteReferential, ReferenceError> {
        let url = self.endpoint(["api", "notes"].into_iter().chain(uri.trim_matches('/').split('/')));
        self.get_json(url, Some(uri)).await
    }

    async fn fetch_notes(&self, count: usize, offset: usize) -> Result<Vec<NoteReferential>, ReferenceError> {
        let mut url = self.endpoint(["api", "notes"]);
        url.query_pairs_mut()
            .append_pair("count", &count.to_string())
            .append_pair("offset", &offset.to_string());

        self.get_json(url, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> ReferenceClient {
        ReferenceClient::new(&ReferenceConfig {
            url: url.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_building() {
        let client = client("http://notes.local/backend/");
        assert_eq!(
            client.endpoint(["api", "login"]).as_str(),
            "http://notes.local/backend/api/login"
        );
        assert_eq!(
            client
                .endpoint(["api", "notes"].into_iter().chain("kr/word one".split('/')))
                .as_str(),
            "http://notes.local/backend/api/notes/kr/word%20one"
        );
    }

    #[test]
    fn test_invalid_url() {
        let result = ReferenceClient::new(&ReferenceConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(ReferenceError::InvalidUrl(_))));
    }

    #[test]
    fn test_referential_accepts_both_field_names() {
        let english: NoteReferential = serde_json::from_str(r#"{"uri":"a","value":"x"}"#).unwrap();
        let french: NoteReferential = serde_json::from_str(r#"{"uri":"a","valeur":"x"}"#).unwrap();
        assert_eq!(english, french);
    }

    #[test]
    fn test_login_response() {
        let login: LoginResponse = serde_json::from_str(r#"{"accessToken":"t"}"#).unwrap();
        assert_eq!(login.access_token, "t");
        assert_eq!(login.expires_in, None);
    }
}
