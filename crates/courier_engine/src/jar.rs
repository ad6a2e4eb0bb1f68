use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// One cookie as stored in the session context file.
///
/// `expires` is unix seconds; `None` means a session cookie, kept until the
/// trusted capture is refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub secure: bool,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(epoch) => epoch <= now.timestamp(),
            None => false,
        }
    }

    fn matches(&self, host: &str, path: &str, https: bool) -> bool {
        domain_matches(host, &self.domain) && path_matches(path, &self.path) && (https || !self.secure)
    }
}

/// Live cookie jar: an ordered set keyed by (name, domain, path).
///
/// Insertion order is preserved so the emitted `Cookie` header is stable
/// across runs, matching what the trusted browser session sent.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new(cookies: Vec<Cookie>) -> Self {
        let mut jar = Self::default();
        for cookie in cookies {
            jar.store(cookie);
        }
        jar
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Inserts or replaces by (name, domain, path). Newer values win;
    /// a cookie that is already expired removes the stored entry instead.
    pub fn store(&mut self, cookie: Cookie) {
        let slot = self.cookies.iter().position(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        });
        if cookie.is_expired(Utc::now()) {
            if let Some(pos) = slot {
                self.cookies.remove(pos);
            }
            return;
        }
        match slot {
            Some(pos) => self.cookies[pos] = cookie,
            None => self.cookies.push(cookie),
        }
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.cookies.retain(|c| !c.is_expired(now));
    }

    /// Builds the `Cookie` request header for a URL, or `None` when no
    /// stored cookie matches.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let path = url.path();
        let https = url.scheme() == "https";
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| c.matches(host, path, https))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Applies `Set-Cookie` response header values per standard semantics.
    /// Unparseable values are ignored.
    pub fn apply_set_cookie<'a, I>(&mut self, values: I, request_url: &Url)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for value in values {
            if let Some(cookie) = parse_set_cookie(value, request_url) {
                self.store(cookie);
            }
        }
    }
}

fn domain_matches(host: &str, cookie_domain: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.');
    if domain.is_empty() {
        return false;
    }
    host.eq_ignore_ascii_case(domain)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if !request_path.starts_with(cookie_path) {
        return false;
    }
    cookie_path.ends_with('/')
        || request_path.len() == cookie_path.len()
        || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')
}

fn parse_set_cookie(value: &str, request_url: &Url) -> Option<Cookie> {
    let mut parts = value.split(';');
    let (name, val) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_string(),
        value: val.trim().to_string(),
        domain: request_url.host_str().unwrap_or_default().to_string(),
        path: "/".to_string(),
        expires: None,
        secure: false,
    };
    let mut max_age: Option<i64> = None;

    for attr in parts {
        let attr = attr.trim();
        let (key, attr_value) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (attr, None),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" => {
                if let Some(v) = attr_value {
                    cookie.domain = v.trim_start_matches('.').to_string();
                }
            }
            "path" => {
                if let Some(v) = attr_value {
                    if v.starts_with('/') {
                        cookie.path = v.to_string();
                    }
                }
            }
            "expires" => {
                if let Some(v) = attr_value {
                    if let Ok(when) = DateTime::parse_from_rfc2822(v) {
                        cookie.expires = Some(when.timestamp());
                    }
                }
            }
            "max-age" => {
                if let Some(v) = attr_value {
                    max_age = v.parse::<i64>().ok();
                }
            }
            "secure" => cookie.secure = true,
            _ => {}
        }
    }

    // Max-Age takes precedence over Expires.
    if let Some(seconds) = max_age {
        cookie.expires = Some(Utc::now().timestamp() + seconds);
    }
    Some(cookie)
}
