use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use url::Url;

use courier_logging::{courier_debug, courier_warn};

use crate::decode::decode_text;
use crate::jar::CookieJar;
use crate::rate_limit::RateLimiter;
use crate::session::{SessionContext, SessionStore};
use crate::types::{RequestDescriptor, ResponseDescriptor, TransportError};

/// Named policy for the ambiguous 429 case: a threshold of consecutive
/// 429/403 responses per host at which the transport stops retrying and
/// reports the trusted identity as expired. Zero disables the guard and
/// leaves 429 an ordinary retryable status.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintPolicy {
    pub threshold: u32,
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        Self { threshold: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub redirect_limit: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub base_delay: Duration,
    /// Status codes worth another attempt; everything else in 4xx/5xx fails
    /// immediately.
    pub retry_statuses: Vec<u16>,
    pub fingerprint_guard: FingerprintPolicy,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            redirect_limit: 5,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 3,
            backoff_factor: 1.5,
            base_delay: Duration::from_secs(1),
            retry_statuses: vec![429, 500, 502, 503, 504],
            fingerprint_guard: FingerprintPolicy::default(),
        }
    }
}

/// HTTP transport that replays a previously-trusted browser session.
///
/// Exactly one request is in flight at a time; `send` takes `&mut self` so
/// the type system enforces it. Fanning requests out in parallel over one
/// trusted session is exactly the traffic shape the capture exists to avoid.
pub struct Transport {
    settings: TransportSettings,
    store: SessionStore,
    context: SessionContext,
    jar: CookieJar,
    limiter: RateLimiter,
    client: reqwest::Client,
    // Consecutive 429/403 responses per host, kept across send() calls.
    guard_counts: HashMap<String, u32>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(
        settings: TransportSettings,
        store: SessionStore,
        limiter: RateLimiter,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(settings.redirect_limit))
            .build()
            .map_err(|err| TransportError::Connection(err.to_string()))?;

        let context = store.load();
        let jar = context.jar();
        Ok(Self {
            settings,
            store,
            context,
            jar,
            limiter,
            client,
            guard_counts: HashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Installs a cooperative cancellation signal, checked between retry
    /// attempts. An in-flight request is allowed to complete or time out.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.jar
    }

    pub fn session_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.context
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sends one request with rate limiting, retry/backoff and cookie
    /// continuity. See `FingerprintPolicy` for the consecutive-429/403
    /// escape hatch.
    pub async fn send(
        &mut self,
        request: &RequestDescriptor,
    ) -> Result<ResponseDescriptor, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::InvalidUrl(format!("bad method '{}'", request.method)))?;

        let timeout = request.timeout.unwrap_or(self.settings.request_timeout);
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.settings.max_attempts)
            .max(1);
        let backoff_factor = request
            .backoff_factor
            .unwrap_or(self.settings.backoff_factor);
        // Per-request delay bounds get their own sampler; otherwise the
        // shared one is used.
        let mut override_limiter = match (request.min_delay, request.max_delay) {
            (None, None) => None,
            (min, max) => Some(RateLimiter::new(
                min.unwrap_or(self.settings.min_delay),
                max.unwrap_or(self.settings.max_delay),
            )),
        };

        let started = Instant::now();
        let mut retry_after: Option<Duration> = None;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if attempt >= 2 {
                if self.cancel.is_cancelled() {
                    return Err(TransportError::Cancelled);
                }
                let mut backoff =
                    backoff_delay(self.settings.base_delay, backoff_factor, attempt);
                if let Some(after) = retry_after.take() {
                    if after > backoff {
                        backoff = after;
                    }
                }
                let jitter = self.next_delay(&mut override_limiter);
                tokio::time::sleep(backoff + jitter).await;
            } else {
                let delay = self.next_delay(&mut override_limiter);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let mut builder = self.client.request(method.clone(), url.clone()).timeout(timeout);
            for (name, value) in self.merge_headers(request, &url) {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    let mapped = map_reqwest_error(err);
                    let transient = matches!(
                        mapped,
                        TransportError::Timeout | TransportError::Connection(_)
                    );
                    if transient && attempt < max_attempts {
                        courier_warn!(
                            "attempt {attempt}/{max_attempts} for {url} failed ({mapped}); retrying"
                        );
                        continue;
                    }
                    return Err(mapped);
                }
            };

            let status = response.status().as_u16();
            let success = response.status().is_success();
            let final_url = response.url().clone();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            // Cookie continuity after every response, error statuses included.
            self.absorb_cookies(&headers, &final_url);

            if success {
                self.guard_counts.remove(&host);
                let body = response.bytes().await.map_err(map_reqwest_error)?;
                let content_type = headers
                    .iter()
                    .find(|(k, _)| k == "content-type")
                    .map(|(_, v)| v.as_str());
                let decoded = decode_text(&body, content_type);
                return Ok(ResponseDescriptor {
                    url: final_url.to_string(),
                    status,
                    headers,
                    body,
                    text: decoded.text,
                    elapsed: started.elapsed(),
                });
            }

            if status == 429 || status == 403 {
                let count = self.guard_counts.entry(host.clone()).or_insert(0);
                *count += 1;
                let threshold = self.settings.fingerprint_guard.threshold;
                if threshold > 0 && *count >= threshold {
                    let consecutive = *count;
                    courier_warn!(
                        "{consecutive} consecutive {status} responses from {host}; \
                         trusted session needs a refresh"
                    );
                    return Err(TransportError::FingerprintExpired {
                        host,
                        consecutive,
                        status,
                    });
                }
            } else {
                self.guard_counts.remove(&host);
            }

            if self.settings.retry_statuses.contains(&status) && attempt < max_attempts {
                retry_after = headers
                    .iter()
                    .find(|(k, _)| k == "retry-after")
                    .and_then(|(_, v)| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                courier_debug!(
                    "attempt {attempt}/{max_attempts} for {url} got status {status}; retrying"
                );
                continue;
            }
            return Err(TransportError::HttpStatus(status));
        }
    }

    /// Precedence: request override > session headers > template (already
    /// folded in at load). `Cookie` always comes from the live jar and
    /// `accept-encoding` is left to the client, which advertises exactly
    /// the encodings it decodes.
    fn merge_headers(&self, request: &RequestDescriptor, url: &Url) -> Vec<(String, String)> {
        let mut merged = self.context.headers.clone();
        for (key, value) in &request.headers {
            let key = key.to_ascii_lowercase();
            if key == "cookie" {
                continue;
            }
            merged.insert(key, value.clone());
        }
        merged.remove("accept-encoding");
        if let Some(cookie) = self.jar.header_for(url) {
            merged.insert("cookie".to_string(), cookie);
        }
        merged.into_iter().collect()
    }

    fn absorb_cookies(&mut self, headers: &[(String, String)], final_url: &Url) {
        let set_cookies: Vec<&str> = headers
            .iter()
            .filter(|(k, _)| k == "set-cookie")
            .map(|(_, v)| v.as_str())
            .collect();
        let before = self.jar.len();
        let touched = !set_cookies.is_empty();
        if touched {
            self.jar.apply_set_cookie(set_cookies, final_url);
        }
        self.jar.purge_expired(Utc::now());
        // Only cookie-affecting responses rewrite the session file.
        if touched || self.jar.len() != before {
            if let Err(err) = self.store.save(&self.context, &self.jar) {
                courier_warn!("failed to persist session context: {err}");
            }
        }
    }

    fn next_delay(&mut self, override_limiter: &mut Option<RateLimiter>) -> Duration {
        match override_limiter {
            Some(limiter) => limiter.compute_delay(),
            None => self.limiter.compute_delay(),
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    TransportError::Connection(err.to_string())
}

/// Deterministic part of the delay before attempt `attempt` (1-based):
/// `base × factor^(attempt-2)`, zero before the first attempt. Jitter from
/// the rate limiter is added on top.
pub fn backoff_delay(base: Duration, factor: f64, attempt: u32) -> Duration {
    if attempt < 2 {
        return Duration::ZERO;
    }
    base.mul_f64(factor.powi(attempt as i32 - 2))
}
