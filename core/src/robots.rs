//! Robots.txt cache and RFC 9309 checker (component D).
//!
//! Carried over near-verbatim from the teacher's own `webfetch::robots` module: most-specific
//! user-agent group wins, Allow ties beat Disallow, `*`/`$` pattern matching, BOM stripping, and
//! an origin-keyed TTL cache with a periodic sweep. The only structural change is that the cache
//! lives on a `RobotsCache` value owned by the fetcher context instead of a process-global
//! `OnceLock`, and the `allowed` entry point folds every failure mode (timeout, non-2xx, decode
//! error, cross-origin redirect) into allow-all per the fail-open contract.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use url::Url;

use fetchcore_config::ResolvedRobotsConfig;
use fetchcore_metrics::MetricsRegistry;
use fetchcore_types::{FetchConfig, Task, TaskId};

use crate::pool::PoolOptimiser;
use crate::transport::{self, TransportDeps};

/// Body cap for a robots.txt fetch; truncation happens on a UTF-8 boundary so the parser never
/// sees a split multi-byte sequence.
pub const MAX_ROBOTS_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone)]
enum CachedRobots {
    Parsed(Robots),
    AllowAll,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    entry: CachedRobots,
    expires_at: Instant,
}

pub struct RobotsCache {
    config: ResolvedRobotsConfig,
    entries: DashMap<String, CacheEntry>,
    client: reqwest::Client,
    pool: Arc<PoolOptimiser>,
    metrics: Arc<MetricsRegistry>,
    default_user_agent: String,
    default_proxy: Option<String>,
    default_verify_tls: bool,
}

impl RobotsCache {
    #[must_use]
    pub fn new(
        config: ResolvedRobotsConfig,
        client: reqwest::Client,
        pool: Arc<PoolOptimiser>,
        metrics: Arc<MetricsRegistry>,
        default_user_agent: String,
        default_proxy: Option<String>,
        default_verify_tls: bool,
    ) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            client,
            pool,
            metrics,
            default_user_agent,
            default_proxy,
            default_verify_tls,
        }
    }

    /// Whether `url` may be fetched by `user_agent`. Every failure mode — fetch timeout,
    /// non-success status other than 404/4xx, body decode failure, cross-origin redirect — folds
    /// into `true` (allow-all), matching this cache's fail-open contract.
    pub async fn allowed(&self, url: &Url, user_agent: &str) -> bool {
        let origin = compute_origin(url);

        if let Some(entry) = self.entries.get(&origin) {
            if entry.expires_at > Instant::now() {
                return evaluate_cached(&entry.entry, url.path(), user_agent);
            }
        }

        let robots = match self.fetch_robots(url).await {
            FetchOutcome::Content(body) => match parse(&body) {
                Ok(robots) => CachedRobots::Parsed(robots),
                Err(()) => CachedRobots::AllowAll,
            },
            FetchOutcome::AllowAll => CachedRobots::AllowAll,
        };

        let result = evaluate_cached(&robots, url.path(), user_agent);
        self.entries.insert(
            origin,
            CacheEntry {
                entry: robots,
                expires_at: Instant::now() + self.config.ttl,
            },
        );
        self.enforce_capacity();
        result
    }

    /// Evict every entry past its TTL. Called on the shell's periodic sweep tick.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.expires_at > now);
        before - self.entries.len()
    }

    fn enforce_capacity(&self) {
        if self.entries.len() <= self.config.max_cache_entries {
            return;
        }
        let excess = self.entries.len() - self.config.max_cache_entries;
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.expires_at))
            .collect();
        by_age.sort_by_key(|(_, exp)| *exp);
        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }

    /// Fetch `/robots.txt` for `url`'s origin through the same transport engine every ordinary
    /// task fetch uses, rather than a bespoke client/redirect loop — this is the one place that
    /// `fetch_timeout` and `request_window` both matter: `request_window` is the overall deadline
    /// for however many redirect hops it takes, `fetch_timeout` caps any single hop so one slow
    /// redirect target can't eat the whole window.
    async fn fetch_robots(&self, url: &Url) -> FetchOutcome {
        let Ok(robots_url) = build_robots_url(url) else {
            return FetchOutcome::AllowAll;
        };

        let task = Task::new(TaskId::new("robots-txt"), "robots-txt", robots_url.to_string()).with_fetch(FetchConfig {
            robots_txt: Some(false),
            timeout: Some(self.config.request_window.as_secs_f64()),
            ..FetchConfig::default()
        });

        let deps = TransportDeps {
            pool: &self.pool,
            robots: self,
            client: &self.client,
            metrics: Arc::clone(&self.metrics),
            default_user_agent: &self.default_user_agent,
            default_proxy: self.default_proxy.as_deref(),
            default_verify_tls: self.default_verify_tls,
        };

        let result = transport::http_fetch(&task, None, &deps, Some(self.config.fetch_timeout)).await;

        if result.error.is_some() {
            return FetchOutcome::AllowAll;
        }
        if result.status_code == 404 || (400..500).contains(&result.status_code) {
            return FetchOutcome::AllowAll;
        }
        if !(200..300).contains(&result.status_code) {
            return FetchOutcome::AllowAll;
        }
        // The transport engine follows redirects internally; a robots.txt that ultimately
        // resolved off the original host is rejected rather than trusted, since an attacker who
        // controls an intermediate hop could otherwise steer the check to a permissive file.
        if url::Url::parse(&result.url).is_ok_and(|final_url| final_url.host_str() != robots_url.host_str()) {
            return FetchOutcome::AllowAll;
        }

        let mut body = result.content.into_bytes();
        if body.len() > MAX_ROBOTS_SIZE {
            body.truncate(MAX_ROBOTS_SIZE);
            trim_incomplete_utf8(&mut body);
            trim_partial_line(&mut body);
        }
        if body.starts_with(&[0xEF, 0xBB, 0xBF]) {
            body.drain(0..3);
        }
        match String::from_utf8(body) {
            Ok(text) => FetchOutcome::Content(text),
            Err(_) => FetchOutcome::AllowAll,
        }
    }
}

impl crate::memory::Reclaimable for RobotsCache {
    fn evict_stale(&self) -> usize {
        self.sweep()
    }
}

enum FetchOutcome {
    Content(String),
    AllowAll,
}

fn evaluate_cached(robots: &CachedRobots, path: &str, user_agent: &str) -> bool {
    match robots {
        CachedRobots::Parsed(r) => r.check(path, user_agent),
        CachedRobots::AllowAll => true,
    }
}

fn compute_origin(url: &Url) -> String {
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or("");
    let default_port = if scheme == "https" { 443 } else { 80 };
    let port = url.port_or_known_default().unwrap_or(default_port);
    if port == default_port {
        format!("{scheme}://{host}")
    } else {
        format!("{scheme}://{host}:{port}")
    }
}

fn build_robots_url(url: &Url) -> Result<Url, url::ParseError> {
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or("");
    let default_port = if scheme == "https" { 443 } else { 80 };
    let port = url.port_or_known_default().unwrap_or(default_port);
    let port_part = if port == default_port {
        String::new()
    } else {
        format!(":{port}")
    };
    Url::parse(&format!("{scheme}://{host}{port_part}/robots.txt"))
}

/// A redirect followed while fetching `/robots.txt` must stay on the same host and not downgrade
/// scheme; an http→https upgrade on the same host is the one allowed crossing.
#[must_use]
pub fn is_valid_robots_redirect(original: &Url, redirect: &Url) -> bool {
    if original.host_str() != redirect.host_str() {
        return false;
    }
    match (original.scheme(), redirect.scheme()) {
        ("http", "http" | "https") | ("https", "https") => true,
        _ => false,
    }
}

fn trim_incomplete_utf8(bytes: &mut Vec<u8>) {
    while !bytes.is_empty() && std::str::from_utf8(bytes).is_err() {
        bytes.pop();
    }
}

fn trim_partial_line(bytes: &mut Vec<u8>) {
    if let Some(pos) = bytes.iter().rposition(|&b| b == b'\n') {
        bytes.truncate(pos + 1);
    } else {
        bytes.clear();
    }
}

#[derive(Debug, Clone, Default)]
struct Robots {
    groups: std::collections::HashMap<String, RobotsGroup>,
}

#[derive(Debug, Clone, Default)]
struct RobotsGroup {
    allow: Vec<String>,
    disallow: Vec<String>,
}

impl Robots {
    fn check(&self, path: &str, user_agent: &str) -> bool {
        let Some(group) = self.find_group(user_agent) else {
            return true;
        };
        group.is_disallowed(path).is_none()
    }

    fn find_group(&self, user_agent: &str) -> Option<&RobotsGroup> {
        let ua_lower = user_agent.to_lowercase();
        let mut best: Option<(&str, &RobotsGroup)> = None;
        let mut best_len = 0;

        for (group_ua, group) in &self.groups {
            if group_ua == "*" {
                continue;
            }
            if ua_lower.contains(group_ua.as_str()) && group_ua.len() > best_len {
                best = Some((group_ua, group));
                best_len = group_ua.len();
            }
        }

        best.map(|(_, g)| g).or_else(|| self.groups.get("*"))
    }
}

impl RobotsGroup {
    fn is_disallowed(&self, path: &str) -> Option<String> {
        let mut disallow_match: Option<(&str, usize)> = None;
        for disallow in &self.disallow {
            if disallow.is_empty() {
                continue;
            }
            if path_matches(path, disallow) {
                let len = effective_length(disallow);
                if disallow_match.is_none_or(|(_, best)| len > best) {
                    disallow_match = Some((disallow, len));
                }
            }
        }
        let (disallow_rule, disallow_len) = disallow_match?;

        for allow in &self.allow {
            if allow.is_empty() {
                continue;
            }
            if path_matches(path, allow) && effective_length(allow) >= disallow_len {
                return None;
            }
        }
        Some(disallow_rule.to_string())
    }
}

fn effective_length(pattern: &str) -> usize {
    pattern.chars().filter(|&c| c != '*' && c != '$').count()
}

fn path_matches(path: &str, pattern: &str) -> bool {
    let (pattern, anchored) = pattern.strip_suffix('$').map_or((pattern, false), |p| (p, true));

    if !pattern.contains('*') {
        return if anchored {
            path == pattern
        } else {
            path.starts_with(pattern)
        };
    }
    wildcard_match(path, pattern, anchored)
}

fn wildcard_match(path: &str, pattern: &str, anchored: bool) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.is_empty() {
        return true;
    }

    let mut pos = 0;
    if !parts[0].is_empty() {
        if !path.starts_with(parts[0]) {
            return false;
        }
        pos = parts[0].len();
    }

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match path[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }

    if parts.len() > 1 {
        let last = parts[parts.len() - 1];
        if last.is_empty() {
            return !anchored || true;
        }
        if anchored {
            if !path.ends_with(last) {
                return false;
            }
            if path.len() - last.len() < pos {
                return false;
            }
        } else if !path[pos..].contains(last) {
            return false;
        }
    } else if anchored {
        return path.len() == pattern.len();
    }

    true
}

fn parse(content: &str) -> Result<Robots, ()> {
    let content = content.strip_prefix('\u{FEFF}').unwrap_or(content);
    let mut robots = Robots::default();
    let mut current_agents: Vec<String> = Vec::new();
    let mut in_group = false;

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((directive, value)) = line.split_once(':') else {
            continue;
        };
        let directive = directive.trim().to_lowercase();
        let value = value.trim();

        match directive.as_str() {
            "user-agent" => {
                if in_group {
                    current_agents.clear();
                    in_group = false;
                }
                current_agents.push(value.to_lowercase());
            }
            "allow" => {
                in_group = true;
                for agent in &current_agents {
                    robots.groups.entry(agent.clone()).or_default().allow.push(value.to_string());
                }
            }
            "disallow" => {
                in_group = true;
                for agent in &current_agents {
                    robots.groups.entry(agent.clone()).or_default().disallow.push(value.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(robots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_disallow_allows_all() {
        let robots = parse("User-agent: *\nDisallow:").unwrap();
        assert!(robots.check("/any/path", "*"));
    }

    #[test]
    fn longer_allow_rule_wins_over_shorter_disallow() {
        let robots = parse("User-agent: *\nDisallow: /\nAllow: /public/").unwrap();
        assert!(robots.check("/public/page", "*"));
        assert!(!robots.check("/secret", "*"));
    }

    #[test]
    fn most_specific_user_agent_group_wins() {
        let robots =
            parse("User-agent: Googlebot\nDisallow: /\n\nUser-agent: Googlebot-Image\nAllow: /").unwrap();
        assert!(robots.check("/page", "Googlebot-Image"));
        assert!(!robots.check("/page", "Googlebot"));
    }

    #[test]
    fn wildcard_and_anchor_patterns_match() {
        assert!(path_matches("/images/photo.jpg", "/images/*"));
        assert!(path_matches("/foo.php", "/*.php$"));
        assert!(!path_matches("/foo.php/bar", "/*.php$"));
    }

    #[test]
    fn redirect_validation_allows_upgrade_rejects_downgrade_and_cross_host() {
        let http = Url::parse("http://example.com/robots.txt").unwrap();
        let https = Url::parse("https://example.com/robots.txt").unwrap();
        let other_host = Url::parse("http://other.com/robots.txt").unwrap();
        assert!(is_valid_robots_redirect(&http, &https));
        assert!(!is_valid_robots_redirect(&https, &http));
        assert!(!is_valid_robots_redirect(&http, &other_host));
    }

    #[test]
    fn compute_origin_omits_default_port() {
        let url = Url::parse("https://example.com:443/path").unwrap();
        assert_eq!(compute_origin(&url), "https://example.com");
        let url = Url::parse("http://example.com:8080/path").unwrap();
        assert_eq!(compute_origin(&url), "http://example.com:8080");
    }
}
