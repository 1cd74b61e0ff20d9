use crate::auth::RedditAuth;
use crate::rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
use crate::PostFetcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tickerpulse_core::retry::{RetryConfig, RetryExecutor};
use tickerpulse_core::{
    CoreError, ErrorExt, RawPost, RedditConfig, SocialApiError, Source, SourceSettings,
};
use tracing::{debug, error, info, warn};

const REDDIT_PUBLIC_BASE: &str = "https://www.reddit.com";
const REDDIT_OAUTH_BASE: &str = "https://oauth.reddit.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListing<T> {
    pub kind: String,
    pub data: RedditListingData<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListingData<T> {
    pub children: Vec<RedditListingChild<T>>,
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListingChild<T> {
    pub kind: String,
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditPostData {
    pub id: String,
    /// Fullname, e.g. `t3_abc123`.
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    pub author: String,
    pub subreddit: String,
    pub permalink: String,
    pub created_utc: f64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditCommentData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub body: String,
    pub author: String,
    pub subreddit: String,
    #[serde(default)]
    pub permalink: String,
    pub created_utc: f64,
    #[serde(default)]
    pub score: i64,
    pub parent_id: String,
}

/// Collects hot posts and their top comments from configured subreddits.
///
/// Without client credentials the public `.json` listings are used; with
/// them, requests go to `oauth.reddit.com` under an app-only token.
#[derive(Debug)]
pub struct RedditFetcher {
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    auth: Option<RedditAuth>,
    base_url: String,
}

impl RedditFetcher {
    pub fn new(config: &RedditConfig) -> Result<Self, CoreError> {
        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let (auth, base_url, rate_config) = match (&config.client_id, &config.client_secret) {
            (Some(id), Some(secret)) => {
                info!("Reddit fetcher using app-only OAuth");
                let auth = RedditAuth::new(id.clone(), secret.clone(), http_client.clone())?;
                (
                    Some(auth),
                    REDDIT_OAUTH_BASE.to_string(),
                    RateLimitConfig::reddit_oauth(),
                )
            }
            _ => {
                info!("Reddit fetcher using public listings");
                (
                    None,
                    REDDIT_PUBLIC_BASE.to_string(),
                    RateLimitConfig::reddit_public(),
                )
            }
        };

        Ok(Self {
            http_client,
            rate_limiter: Arc::new(RateLimiter::new(rate_config)),
            retry: RetryExecutor::new(RetryConfig::social()),
            auth,
            base_url,
        })
    }

    /// Points the fetcher at another host serving Reddit-shaped listings.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limiter.get_rate_limit_status().await
    }

    pub async fn hot_posts(
        &self,
        subreddit: &str,
        limit: u32,
    ) -> Result<Vec<RedditPostData>, CoreError> {
        let path = format!("/r/{}/hot", subreddit);
        let params = [("limit", limit.to_string())];

        let listing: RedditListing<RedditPostData> = self
            .get_json(&path, &params)
            .await
            .map_err(|e| channel_error(e, subreddit))?;

        info!(
            "Retrieved {} posts from r/{}",
            listing.data.children.len(),
            subreddit
        );
        Ok(listing.data.children.into_iter().map(|c| c.data).collect())
    }

    pub async fn top_comments(
        &self,
        subreddit: &str,
        post_id: &str,
        limit: u32,
    ) -> Result<Vec<RedditCommentData>, CoreError> {
        let path = format!("/r/{}/comments/{}", subreddit, post_id);
        let params = [
            ("limit", limit.to_string()),
            ("sort", "top".to_string()),
            ("depth", "1".to_string()),
        ];

        let listings: Vec<RedditListing<serde_json::Value>> =
            self.get_json(&path, &params).await?;
        let comments = parse_comment_listings(listings, limit as usize);

        debug!("Retrieved {} comments for {}", comments.len(), post_id);
        Ok(comments)
    }

    async fn fetch_subreddit(
        &self,
        subreddit: &str,
        settings: &SourceSettings,
    ) -> Result<Vec<RawPost>, CoreError> {
        let listing = self.hot_posts(subreddit, settings.post_limit).await?;
        let mut posts = Vec::with_capacity(listing.len());

        for data in listing {
            let wants_comments = settings.comments_per_post > 0 && data.num_comments > 0;
            let post_id = data.id.clone();
            posts.push(post_to_raw(data));

            if !wants_comments {
                continue;
            }
            match self
                .top_comments(subreddit, &post_id, settings.comments_per_post)
                .await
            {
                Ok(comments) => posts.extend(comments.into_iter().map(comment_to_raw)),
                Err(e) => {
                    warn!("Skipping comments for {} in r/{}: {}", post_id, subreddit, e);
                }
            }
        }

        Ok(posts)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, CoreError> {
        self.retry
            .execute("reddit_request", || self.request_json(path, params))
            .await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, CoreError> {
        let _permit = self.rate_limiter.acquire_permit().await?;

        let mut request = match &self.auth {
            Some(auth) => {
                let token = auth.access_token().await?;
                self.http_client
                    .get(format!("{}{}", self.base_url, path))
                    .bearer_auth(token)
            }
            None => self
                .http_client
                .get(format!("{}{}.json", self.base_url, path)),
        };
        request = request.query(params).query(&[("raw_json", "1")]);

        debug!("Making Reddit request: GET {}", path);
        let response = request.send().await.map_err(|e| {
            error!("Network error for GET {}: {}", path, e);
            if e.is_timeout() {
                CoreError::SocialApi(SocialApiError::RequestTimeout)
            } else {
                CoreError::Network(e)
            }
        })?;

        let response = self.check_status(response, path).await?;
        response.json::<T>().await.map_err(|e| {
            error!("Failed to parse Reddit response for {}: {}", path, e);
            CoreError::SocialApi(SocialApiError::InvalidResponse {
                details: format!("unexpected payload from {}", path),
            })
        })
    }

    async fn check_status(&self, response: Response, path: &str) -> Result<Response, CoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        error!("Request failed with status: {} for {}", status, path);

        let error = match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                warn!("Rate limited, retry after {} seconds", retry_after);
                SocialApiError::RateLimitExceeded { retry_after }
            }
            StatusCode::UNAUTHORIZED => {
                if let Some(auth) = &self.auth {
                    auth.invalidate().await;
                }
                SocialApiError::InvalidToken
            }
            StatusCode::FORBIDDEN => SocialApiError::Forbidden {
                resource: path.to_string(),
            },
            StatusCode::NOT_FOUND => SocialApiError::ChannelNotFound {
                channel: path.to_string(),
            },
            s if s.is_server_error() => SocialApiError::ServerError {
                status_code: s.as_u16(),
            },
            s => SocialApiError::InvalidResponse {
                details: format!("unexpected status {}", s),
            },
        };
        Err(error.into())
    }
}

#[async_trait]
impl PostFetcher for RedditFetcher {
    fn source(&self) -> Source {
        Source::Reddit
    }

    /// A failing subreddit is logged and skipped. Only when every configured
    /// subreddit fails is the last error returned.
    async fn fetch(&self, settings: &SourceSettings) -> Result<Vec<RawPost>, CoreError> {
        let mut posts = Vec::new();
        let mut last_error = None;
        let mut any_succeeded = false;

        for subreddit in &settings.subreddits {
            match self.fetch_subreddit(subreddit, settings).await {
                Ok(batch) => {
                    any_succeeded = true;
                    posts.extend(batch);
                }
                Err(e) => {
                    e.log_warn();
                    warn!("Skipping r/{}: {}", subreddit, e.user_friendly_message());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_succeeded => Err(e),
            _ => Ok(posts),
        }
    }
}

fn channel_error(error: CoreError, subreddit: &str) -> CoreError {
    match error {
        CoreError::SocialApi(SocialApiError::ChannelNotFound { .. }) => {
            SocialApiError::ChannelNotFound {
                channel: subreddit.to_string(),
            }
            .into()
        }
        other => other,
    }
}

fn timestamp(created_utc: f64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(created_utc as i64, 0).unwrap_or_default()
}

fn absolute_permalink(permalink: &str) -> Option<String> {
    if permalink.is_empty() {
        None
    } else {
        Some(format!("{}{}", REDDIT_PUBLIC_BASE, permalink))
    }
}

pub fn post_to_raw(data: RedditPostData) -> RawPost {
    let selftext = data.selftext.trim();
    let body = if selftext.is_empty() {
        data.title
    } else {
        format!("{}\n\n{}", data.title, selftext)
    };

    RawPost {
        id: data.name,
        source: Source::Reddit,
        author: data.author,
        body,
        created_at: timestamp(data.created_utc),
        score: data.score,
        comment_count: data.num_comments,
        parent_id: None,
        channel: Some(data.subreddit),
        permalink: absolute_permalink(&data.permalink),
    }
}

pub fn comment_to_raw(data: RedditCommentData) -> RawPost {
    RawPost {
        id: data.name,
        source: Source::Reddit,
        author: data.author,
        body: data.body,
        created_at: timestamp(data.created_utc),
        score: data.score,
        comment_count: 0,
        parent_id: Some(data.parent_id),
        channel: Some(data.subreddit),
        permalink: absolute_permalink(&data.permalink),
    }
}

/// The comments endpoint answers with `[post_listing, comment_listing]`.
/// Only `t1` children carry comments; `more` stubs and removed bodies are
/// dropped.
pub fn parse_comment_listings(
    listings: Vec<RedditListing<serde_json::Value>>,
    limit: usize,
) -> Vec<RedditCommentData> {
    listings
        .into_iter()
        .nth(1)
        .map(|listing| listing.data.children)
        .unwrap_or_default()
        .into_iter()
        .filter(|child| child.kind == "t1")
        .filter_map(|child| serde_json::from_value::<RedditCommentData>(child.data).ok())
        .filter(|c| !matches!(c.body.trim(), "" | "[deleted]" | "[removed]"))
        .take(limit)
        .collect()
}
