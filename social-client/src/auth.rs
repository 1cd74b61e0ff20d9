//! App-only OAuth2 (client credentials) for the Reddit API.

use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, TokenResponse, TokenUrl};
use reqwest::Client;
use std::time::{Duration, Instant};
use tickerpulse_core::{CoreError, SocialApiError};
use tokio::sync::Mutex;
use tracing::{debug, info};

const REDDIT_AUTH_URL: &str = "https://www.reddit.com/api/v1/authorize";
const REDDIT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";

/// Tokens are refreshed this long before Reddit says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    secret: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct RedditAuth {
    oauth_client: BasicClient,
    http_client: Client,
    token: Mutex<Option<CachedToken>>,
}

impl RedditAuth {
    pub fn new(
        client_id: String,
        client_secret: String,
        http_client: Client,
    ) -> Result<Self, CoreError> {
        let auth_url = AuthUrl::new(REDDIT_AUTH_URL.to_string()).map_err(invalid_url)?;
        let token_url = TokenUrl::new(REDDIT_TOKEN_URL.to_string()).map_err(invalid_url)?;

        let oauth_client = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            auth_url,
            Some(token_url),
        );

        Ok(Self {
            oauth_client,
            http_client,
            token: Mutex::new(None),
        })
    }

    /// Returns a valid bearer token, exchanging credentials when the cached
    /// one is missing or about to expire.
    pub async fn access_token(&self) -> Result<String, CoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + EXPIRY_MARGIN < token.expires_at {
                return Ok(token.secret.clone());
            }
            debug!("Reddit access token expired, refreshing");
        }

        let http_client = self.http_client.clone();
        let response = self
            .oauth_client
            .exchange_client_credentials()
            .request_async(|request| send_oauth_request(http_client, request))
            .await
            .map_err(|e| SocialApiError::AuthenticationFailed {
                reason: e.to_string(),
            })?;

        let lifetime = response
            .expires_in()
            .unwrap_or_else(|| Duration::from_secs(3600));
        let token = CachedToken {
            secret: response.access_token().secret().clone(),
            expires_at: Instant::now() + lifetime,
        };
        info!("Obtained Reddit app token valid for {:?}", lifetime);

        let secret = token.secret.clone();
        *cached = Some(token);
        Ok(secret)
    }

    /// Drops the cached token so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
    }
}

// The token endpoint rejects requests without a descriptive User-Agent, so
// the exchange goes through the fetcher's configured client.
async fn send_oauth_request(
    client: Client,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let response = client
        .request(request.method, request.url.as_str())
        .headers(request.headers)
        .body(request.body)
        .send()
        .await?;
    let status_code = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn invalid_url(error: oauth2::url::ParseError) -> CoreError {
    CoreError::Internal {
        message: format!("invalid OAuth endpoint: {}", error),
    }
}
