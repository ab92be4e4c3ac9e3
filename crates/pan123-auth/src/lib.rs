#![deny(clippy::all)]

//! Access-token lifecycle for the 123Pan driver.
//!
//! A token moves through four phases: unset, fresh, expiring (inside the
//! 10 minute renewal window) and expired. Renewal happens lazily at call time
//! and eagerly from a background task; both paths serialize on one mutex so a
//! single exchange is in flight per process, and a waiter that finds the
//! token already fresh after taking the lock returns without exchanging.

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pan123_api_client::{Pan123ApiClient, TokenSource};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

mod error;
mod token_file;

pub use error::{Error, Result};
pub use token_file::{canonical_remote_name, PersistedToken, TokenFile};

/// Renewal starts this long before the server-reported expiry.
const REFRESH_WINDOW_MINS: i64 = 10;
/// Cadence of the background renewer's checks.
const RENEWER_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    Unset,
    Fresh,
    Expiring,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub expiry: DateTime<Utc>,
}

impl Credential {
    pub fn phase_at(&self, now: DateTime<Utc>) -> TokenPhase {
        let remaining = self.expiry - now;
        if remaining <= ChronoDuration::zero() {
            TokenPhase::Expired
        } else if remaining <= ChronoDuration::minutes(REFRESH_WINDOW_MINS) {
            TokenPhase::Expiring
        } else {
            TokenPhase::Fresh
        }
    }
}

/// Phase of an optional credential; no credential at all is `Unset`.
pub fn phase_of(credential: Option<&Credential>, now: DateTime<Utc>) -> TokenPhase {
    credential.map_or(TokenPhase::Unset, |c| c.phase_at(now))
}

/// Where refreshed tokens are written back to. Persistence failures are
/// logged, not surfaced; a token that only lives in memory still works until
/// the process exits.
#[derive(Debug, Clone)]
pub struct TokenPersistence {
    pub path: Utf8PathBuf,
    pub remote_name: String,
}

pub struct TokenManager {
    client: Arc<Pan123ApiClient>,
    client_id: String,
    client_secret: String,
    state: Mutex<Option<Credential>>,
    persistence: Option<TokenPersistence>,
    renewer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(
        client: Arc<Pan123ApiClient>,
        client_id: String,
        client_secret: String,
        persistence: Option<TokenPersistence>,
    ) -> Self {
        TokenManager {
            client,
            client_id,
            client_secret,
            state: Mutex::new(None),
            persistence,
            renewer: std::sync::Mutex::new(None),
        }
    }

    /// Seeds the in-memory token from the persisted config, if one is there.
    /// An expired persisted token is ignored; the first call exchanges fresh
    /// credentials instead.
    pub async fn load_persisted(&self) -> Result<bool> {
        let Some(persistence) = &self.persistence else {
            return Ok(false);
        };
        let file = TokenFile::read(&persistence.path)?;
        let Some(persisted) = file.get(&persistence.remote_name) else {
            return Ok(false);
        };
        let credential = Credential {
            access_token: persisted.access_token.clone(),
            expiry: persisted.expiry,
        };
        if credential.phase_at(Utc::now()) == TokenPhase::Expired {
            debug!("persisted token already expired, ignoring");
            return Ok(false);
        }
        *self.state.lock().await = Some(credential);
        Ok(true)
    }

    /// A token valid right now. Exchanges or renews first when needed.
    pub async fn current(&self) -> Result<Credential> {
        let mut state = self.state.lock().await;
        if let Some(credential) = state.as_ref() {
            if credential.phase_at(Utc::now()) == TokenPhase::Fresh {
                return Ok(credential.clone());
            }
        }
        let credential = self.exchange().await?;
        self.persist(&credential);
        *state = Some(credential.clone());
        Ok(credential)
    }

    /// Unconditional renewal, used when the server rejects the current token.
    /// The state lock makes concurrent forced refreshes collapse into one:
    /// a waiter whose token was already replaced returns the replacement.
    pub async fn force_refresh(&self, rejected: Option<&str>) -> Result<Credential> {
        let mut state = self.state.lock().await;
        if let (Some(rejected), Some(current)) = (rejected, state.as_ref()) {
            if current.access_token != rejected {
                return Ok(current.clone());
            }
        }
        let credential = self.exchange().await?;
        self.persist(&credential);
        *state = Some(credential.clone());
        Ok(credential)
    }

    async fn exchange(&self) -> Result<Credential> {
        let data = self
            .client
            .exchange_credentials(&self.client_id, &self.client_secret)
            .await?;
        let expiry = DateTime::parse_from_rfc3339(&data.expired_at)
            .map_err(|_| Error::InvalidExpiry {
                value: data.expired_at.clone(),
            })?
            .with_timezone(&Utc);
        debug!(%expiry, "exchanged credentials for a new token");
        Ok(Credential {
            access_token: data.access_token,
            expiry,
        })
    }

    fn persist(&self, credential: &Credential) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let result = TokenFile::read(&persistence.path).and_then(|mut file| {
            file.set(
                &persistence.remote_name,
                PersistedToken {
                    access_token: credential.access_token.clone(),
                    expiry: credential.expiry,
                },
            );
            file.write(&persistence.path)
        });
        if let Err(err) = result {
            warn!(?err, path = %persistence.path, "failed to persist refreshed token");
        }
    }

    /// Starts the background renewer. It wakes periodically and renews while
    /// the token sits inside the refresh window, so interactive calls almost
    /// never pay for an exchange.
    pub fn start_renewer(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(RENEWER_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let phase = {
                    let state = manager.state.lock().await;
                    phase_of(state.as_ref(), Utc::now())
                };
                if matches!(phase, TokenPhase::Expiring | TokenPhase::Expired) {
                    if let Err(err) = manager.current().await {
                        warn!(?err, "background token renewal failed");
                    }
                }
            }
        });
        let mut renewer = self.renewer.lock().unwrap();
        if let Some(previous) = renewer.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the background renewer. Part of driver shutdown.
    pub fn shutdown(&self) {
        if let Some(handle) = self.renewer.lock().unwrap().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    async fn set_for_test(&self, credential: Credential) {
        *self.state.lock().await = Some(credential);
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn current_token(&self) -> pan123_api_client::Result<String> {
        self.current()
            .await
            .map(|credential| credential.access_token)
            .map_err(into_client_error)
    }

    async fn refresh_token(&self) -> pan123_api_client::Result<String> {
        self.force_refresh(None)
            .await
            .map(|credential| credential.access_token)
            .map_err(into_client_error)
    }
}

fn into_client_error(err: Error) -> pan123_api_client::Error {
    match err {
        Error::ApiError(inner) => inner,
        other => {
            // IO and parse failures during exchange read as bad credentials
            // to the dispatch loop; the log line keeps the real cause.
            warn!(?other, "token acquisition failed");
            pan123_api_client::Error::InvalidCredentials
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use httpmock::MockServer;
    use pan123_api_client::{ClientOptions, PacerConfig};

    use super::*;

    fn manager_for(server: &MockServer, persistence: Option<TokenPersistence>) -> TokenManager {
        let client = Arc::new(
            Pan123ApiClient::new(ClientOptions {
                base_url: server.base_url(),
                pacers: PacerConfig {
                    list_min_sleep: std::time::Duration::from_millis(1),
                    strict_min_sleep: std::time::Duration::from_millis(1),
                    upload_min_sleep: std::time::Duration::from_millis(1),
                    download_min_sleep: std::time::Duration::from_millis(1),
                },
                ..ClientOptions::default()
            })
            .unwrap(),
        );
        TokenManager::new(client, "id".to_string(), "secret".to_string(), persistence)
    }

    async fn mock_exchange<'a>(server: &'a MockServer, token: &str) -> httpmock::Mock<'a> {
        let token = token.to_string();
        server
            .mock_async(move |when, then| {
                when.method(httpmock::Method::POST)
                    .path("/api/v1/access_token");
                then.status(200).json_body(serde_json::json!({
                    "code": 0, "message": "ok",
                    "data": {
                        "accessToken": token,
                        "expiredAt": (Utc::now() + ChronoDuration::hours(12)).to_rfc3339()
                    }
                }));
            })
            .await
    }

    #[test]
    fn phases_follow_the_refresh_window() {
        let now = Utc::now();
        let credential = Credential {
            access_token: "t".to_string(),
            expiry: now + ChronoDuration::hours(1),
        };
        assert_eq!(credential.phase_at(now), TokenPhase::Fresh);
        assert_eq!(
            credential.phase_at(now + ChronoDuration::minutes(51)),
            TokenPhase::Expiring
        );
        assert_eq!(
            credential.phase_at(now + ChronoDuration::minutes(61)),
            TokenPhase::Expired
        );
    }

    #[tokio::test]
    async fn exchange_happens_once_while_fresh() -> Result<()> {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server, "tok-1").await;

        let manager = manager_for(&server, None);
        let first = manager.current().await?;
        let second = manager.current().await?;
        assert_eq!(first.access_token, "tok-1");
        assert_eq!(first, second);
        exchange.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn expiring_token_is_renewed_lazily() -> Result<()> {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server, "tok-2").await;

        let manager = manager_for(&server, None);
        manager
            .set_for_test(Credential {
                access_token: "old".to_string(),
                expiry: Utc::now() + ChronoDuration::minutes(5),
            })
            .await;

        let credential = manager.current().await?;
        assert_eq!(credential.access_token, "tok-2");
        exchange.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn forced_refresh_collapses_when_token_already_replaced() -> Result<()> {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server, "tok-3").await;

        let manager = manager_for(&server, None);
        manager
            .set_for_test(Credential {
                access_token: "tok-3".to_string(),
                expiry: Utc::now() + ChronoDuration::hours(2),
            })
            .await;

        // The caller reports a token that is no longer current; no exchange.
        let credential = manager.force_refresh(Some("older-token")).await?;
        assert_eq!(credential.access_token, "tok-3");
        exchange.assert_hits_async(0).await;

        // Reporting the live token does force an exchange.
        let credential = manager.force_refresh(Some("tok-3")).await?;
        assert_eq!(credential.access_token, "tok-3");
        exchange.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn refreshed_token_is_persisted_under_original_name() -> Result<()> {
        let server = MockServer::start_async().await;
        mock_exchange(&server, "tok-4").await;

        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(dir.path().join("config.json"))?;
        let manager = manager_for(
            &server,
            Some(TokenPersistence {
                path: path.clone(),
                remote_name: "pan{strm}".to_string(),
            }),
        );

        manager.current().await?;

        let file = TokenFile::read(&path)?;
        assert!(file.tokens.contains_key("pan"));
        assert_eq!(file.get("pan").unwrap().access_token, "tok-4");
        Ok(())
    }

    #[tokio::test]
    async fn persisted_token_is_loaded_when_valid() -> Result<()> {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server, "never-used").await;

        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(dir.path().join("config.json"))?;
        let mut file = TokenFile::default();
        file.set(
            "pan",
            PersistedToken {
                access_token: "persisted".to_string(),
                expiry: Utc::now() + ChronoDuration::hours(6),
            },
        );
        file.write(&path)?;

        let manager = manager_for(
            &server,
            Some(TokenPersistence {
                path,
                remote_name: "pan".to_string(),
            }),
        );
        assert!(manager.load_persisted().await?);
        let credential = manager.current().await?;
        assert_eq!(credential.access_token, "persisted");
        exchange.assert_hits_async(0).await;
        Ok(())
    }
}
