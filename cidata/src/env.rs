//! Proxy environment merging.
//!
//! Three precedence tiers, lowest first: host system proxy settings, the
//! instance config's env map, and (when propagation is enabled) the
//! current process environment. A proxy that points at the host's loopback
//! is rewritten to the guest-visible gateway address.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

const PROXY_BASES: [&str; 3] = ["ftp_proxy", "http_proxy", "https_proxy"];
const ALL_BASES: [&str; 4] = ["ftp_proxy", "http_proxy", "https_proxy", "no_proxy"];

/// Hostname resolution, injected so tests run offline.
pub trait Resolve {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok((host, 0u16)
            .to_socket_addrs()?
            .map(|a| a.ip())
            .collect())
    }
}

/// Host-reported system proxy settings. On macOS these come from the
/// system configuration; elsewhere there is no system-level notion beyond
/// the environment, so the map is empty.
pub fn host_proxy_settings() -> std::io::Result<BTreeMap<String, String>> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("scutil").arg("--proxy").output()?;
        Ok(parse_scutil_proxy(&String::from_utf8_lossy(&output.stdout)))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Ok(BTreeMap::new())
    }
}

#[cfg(target_os = "macos")]
fn parse_scutil_proxy(text: &str) -> BTreeMap<String, String> {
    let mut dict = BTreeMap::new();
    for line in text.lines() {
        if let Some((k, v)) = line.trim().split_once(" : ") {
            dict.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    let mut env = BTreeMap::new();
    for (enabled, host, port, var) in [
        ("HTTPEnable", "HTTPProxy", "HTTPPort", "http_proxy"),
        ("HTTPSEnable", "HTTPSProxy", "HTTPSPort", "https_proxy"),
        ("FTPEnable", "FTPProxy", "FTPPort", "ftp_proxy"),
    ] {
        if dict.get(enabled).map(String::as_str) == Some("1")
            && let (Some(host), Some(port)) = (dict.get(host), dict.get(port))
        {
            env.insert(var.to_string(), format!("http://{}:{}", host, port));
        }
    }
    env
}

/// Merge the three tiers and post-process proxy values. Malformed proxy
/// URLs are logged and left untouched; only the host-settings lookup
/// itself can fail, and that happens before this function is called.
pub fn merge_proxy_env(
    system: &BTreeMap<String, String>,
    instance_env: &BTreeMap<String, String>,
    propagate: bool,
    process_env: &BTreeMap<String, String>,
    gateway: Ipv4Addr,
    resolver: &dyn Resolve,
) -> BTreeMap<String, String> {
    let mut env = system.clone();

    for (key, value) in instance_env {
        if let Some(old) = env.get(key)
            && old != value
        {
            tracing::info!(key = %key, "instance env overrides system proxy setting");
        }
        env.insert(key.clone(), value.clone());
    }

    if propagate {
        for base in ALL_BASES {
            for key in [base.to_string(), base.to_uppercase()] {
                if let Some(value) = process_env.get(&key) {
                    env.insert(key, value.clone());
                }
            }
        }
    }

    // An explicitly empty value suppresses an inherited setting, for
    // no_proxy as much as for the proxy URLs.
    for base in ALL_BASES {
        for key in [base.to_string(), base.to_uppercase()] {
            if env.get(&key).is_some_and(String::is_empty) {
                env.remove(&key);
            }
        }
    }

    // URL post-processing applies to the proxy URLs only, never no_proxy.
    for base in PROXY_BASES {
        for key in [base.to_string(), base.to_uppercase()] {
            let Some(value) = env.get(&key).cloned() else {
                continue;
            };
            match rewrite_loopback(&value, gateway, resolver) {
                Ok(Some(rewritten)) => {
                    tracing::info!(key = %key, from = %value, to = %rewritten,
                        "rewrote loopback proxy to gateway");
                    env.insert(key, rewritten);
                }
                Ok(None) => {}
                Err(reason) => {
                    tracing::warn!(key = %key, value = %value, reason = %reason,
                        "cannot parse proxy URL, leaving untouched");
                }
            }
        }
    }

    // Case reconciliation: lowercase wins on disagreement; a single case is
    // mirrored onto the other.
    for base in ALL_BASES {
        let upper = base.to_uppercase();
        match (env.get(base).cloned(), env.get(&upper).cloned()) {
            (Some(lower_value), Some(upper_value)) if lower_value != upper_value => {
                tracing::warn!(var = base, "lowercase and uppercase disagree, lowercase wins");
                env.insert(upper, lower_value);
            }
            (Some(lower_value), None) => {
                env.insert(upper, lower_value);
            }
            (None, Some(upper_value)) => {
                env.insert(base.to_string(), upper_value);
            }
            _ => {}
        }
    }

    env
}

/// A proxy URL split into pieces. Only the shapes proxies actually take
/// are handled (scheme://[user@]host[:port][/path]).
struct ProxyUrl<'a> {
    prefix: &'a str,
    host: &'a str,
    port: Option<&'a str>,
    rest: &'a str,
}

fn split_proxy_url(url: &str) -> Result<ProxyUrl<'_>, String> {
    let scheme_end = url.find("://").ok_or("missing scheme")?;
    let after_scheme = scheme_end + 3;
    let authority_end = url[after_scheme..]
        .find('/')
        .map(|i| after_scheme + i)
        .unwrap_or(url.len());
    let authority = &url[after_scheme..authority_end];
    if authority.is_empty() {
        return Err("empty host".into());
    }
    // Userinfo stays part of the prefix so rewriting preserves it.
    let (prefix_end, host_port) = match authority.rfind('@') {
        Some(i) => (after_scheme + i + 1, &authority[i + 1..]),
        None => (after_scheme, authority),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => (h, Some(p)),
        _ => (host_port, None),
    };
    if host.is_empty() {
        return Err("empty host".into());
    }
    Ok(ProxyUrl {
        prefix: &url[..prefix_end],
        host,
        port,
        rest: &url[authority_end..],
    })
}

/// Returns the rewritten URL when the host resolves to a loopback address,
/// `None` when no rewrite is needed, or an error string when the value is
/// not parseable as a URL.
fn rewrite_loopback(
    url: &str,
    gateway: Ipv4Addr,
    resolver: &dyn Resolve,
) -> Result<Option<String>, String> {
    let parsed = split_proxy_url(url)?;
    let loopback = match parsed.host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => resolver
            .resolve(parsed.host)
            .map(|addrs| addrs.iter().any(|a| a.is_loopback()))
            .unwrap_or(false),
    };
    if !loopback {
        return Ok(None);
    }
    let mut rewritten = format!("{}{}", parsed.prefix, gateway);
    if let Some(port) = parsed.port {
        rewritten.push(':');
        rewritten.push_str(port);
    }
    rewritten.push_str(parsed.rest);
    Ok(Some(rewritten))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeResolver(BTreeMap<String, Vec<IpAddr>>);

    impl Resolve for FakeResolver {
        fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| std::io::Error::other("no such host"))
        }
    }

    fn gateway() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 5, 2)
    }

    fn resolver() -> FakeResolver {
        let mut map = BTreeMap::new();
        map.insert(
            "localhost".to_string(),
            vec!["127.0.0.1".parse::<IpAddr>().unwrap()],
        );
        map.insert(
            "proxy.example.com".to_string(),
            vec!["203.0.113.9".parse::<IpAddr>().unwrap()],
        );
        FakeResolver(map)
    }

    fn merge(
        system: &[(&str, &str)],
        instance: &[(&str, &str)],
    ) -> BTreeMap<String, String> {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        merge_proxy_env(
            &to_map(system),
            &to_map(instance),
            false,
            &BTreeMap::new(),
            gateway(),
            &resolver(),
        )
    }

    #[test]
    fn loopback_proxy_rewritten_with_port() {
        let env = merge(&[("http_proxy", "http://127.0.0.1:8080")], &[]);
        assert_eq!(env["http_proxy"], "http://192.168.5.2:8080");
        // Mirrored to the uppercase form.
        assert_eq!(env["HTTP_PROXY"], "http://192.168.5.2:8080");
    }

    #[test]
    fn loopback_hostname_rewritten_via_resolver() {
        let env = merge(&[("https_proxy", "http://localhost:3128")], &[]);
        assert_eq!(env["https_proxy"], "http://192.168.5.2:3128");
    }

    #[test]
    fn non_loopback_proxy_untouched() {
        let env = merge(&[("http_proxy", "http://proxy.example.com:3128")], &[]);
        assert_eq!(env["http_proxy"], "http://proxy.example.com:3128");
    }

    #[test]
    fn no_proxy_never_rewritten() {
        let env = merge(&[("no_proxy", "localhost,127.0.0.1,.internal")], &[]);
        assert_eq!(env["no_proxy"], "localhost,127.0.0.1,.internal");
        assert_eq!(env["NO_PROXY"], "localhost,127.0.0.1,.internal");
    }

    #[test]
    fn empty_value_deletes_key() {
        let env = merge(
            &[("http_proxy", "http://127.0.0.1:8080")],
            &[("http_proxy", "")],
        );
        assert!(!env.contains_key("http_proxy"));
        assert!(!env.contains_key("HTTP_PROXY"));
    }

    #[test]
    fn empty_no_proxy_deleted_too() {
        let env = merge(
            &[("no_proxy", "localhost,.internal")],
            &[("no_proxy", "")],
        );
        assert!(!env.contains_key("no_proxy"));
        assert!(!env.contains_key("NO_PROXY"));
    }

    #[test]
    fn malformed_url_left_untouched() {
        let env = merge(&[("http_proxy", "not a url")], &[]);
        assert_eq!(env["http_proxy"], "not a url");
    }

    #[test]
    fn lowercase_wins_on_disagreement() {
        let env = merge(
            &[
                ("http_proxy", "http://proxy.example.com:1"),
                ("HTTP_PROXY", "http://proxy.example.com:2"),
            ],
            &[],
        );
        assert_eq!(env["HTTP_PROXY"], "http://proxy.example.com:1");
    }

    #[test]
    fn propagation_respects_flag() {
        let mut process_env = BTreeMap::new();
        process_env.insert(
            "HTTPS_PROXY".to_string(),
            "http://proxy.example.com:9".to_string(),
        );
        let off = merge_proxy_env(
            &BTreeMap::new(),
            &BTreeMap::new(),
            false,
            &process_env,
            gateway(),
            &resolver(),
        );
        assert!(!off.contains_key("HTTPS_PROXY"));
        let on = merge_proxy_env(
            &BTreeMap::new(),
            &BTreeMap::new(),
            true,
            &process_env,
            gateway(),
            &resolver(),
        );
        assert_eq!(on["HTTPS_PROXY"], "http://proxy.example.com:9");
        assert_eq!(on["https_proxy"], "http://proxy.example.com:9");
    }

    #[test]
    fn userinfo_preserved_on_rewrite() {
        let env = merge(&[("http_proxy", "http://user:pw@127.0.0.1:8080/x")], &[]);
        assert_eq!(env["http_proxy"], "http://user:pw@192.168.5.2:8080/x");
    }
}
