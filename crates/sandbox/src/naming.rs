//! Resource names, labels and environment for backend objects.

use sha2::{Digest, Sha256};

use arena_core::types::ContainerConfig;

use crate::{labels, FLAG_ENV, TEAM_ID_ENV};

/// Longest DNS-1123 label Kubernetes accepts.
const DNS_LABEL_MAX: usize = 63;

/// Length of the hex suffix appended to every generated name.
pub const SUFFIX_LEN: usize = 16;

/// Prefix used when an image yields no usable name (Docker and Swarm only).
pub const FALLBACK_PREFIX: &str = "chal";

/// Repository name of an image reference, without registry, tag or digest.
///
/// `registry.local:5000/web/app:1.2@sha256:..` yields `app`.
pub fn image_name(image: &str) -> Option<&str> {
    let last = image.rsplit('/').next()?;
    let last = last.split('@').next()?;
    let name = last.split(':').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Lowercase `raw` into a DNS-1123 label fragment short enough to take a suffix.
pub fn dns_label(raw: &str) -> Option<String> {
    let mapped: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();

    let max = DNS_LABEL_MAX - SUFFIX_LEN - 1;
    let trimmed = mapped.trim_matches('-');
    // Service names must start with a letter.
    let trimmed = if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("c-{}", trimmed)
    } else {
        trimmed.to_string()
    };
    let truncated: String = trimmed.chars().take(max).collect();
    let label = truncated.trim_end_matches('-');

    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

/// 16 random hex characters.
pub fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..SUFFIX_LEN].to_string()
}

/// 16 hex characters derived from `seed`, stable across calls.
pub fn seeded_suffix(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(digest)[..SUFFIX_LEN].to_string()
}

/// `{prefix}-{suffix}` for `image`, or `None` when the image has no usable name.
pub fn resource_name(image: &str, suffix: &str) -> Option<String> {
    let prefix = dns_label(image_name(image)?)?;
    Some(format!("{}-{}", prefix, suffix))
}

/// Like `resource_name`, but falls back to `FALLBACK_PREFIX`.
pub fn resource_name_or_fallback(image: &str, suffix: &str) -> String {
    resource_name(image, suffix).unwrap_or_else(|| format!("{}-{}", FALLBACK_PREFIX, suffix))
}

/// Environment injected into every sandbox: the team id always, the flag when present.
pub fn sandbox_env(config: &ContainerConfig) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(2);
    if let Some(flag) = &config.flag {
        env.push((FLAG_ENV.to_string(), flag.clone()));
    }
    env.push((TEAM_ID_ENV.to_string(), config.team_id.clone()));
    env
}

/// `KEY=value` form used by the Docker engine and Swarm.
pub fn sandbox_env_strings(config: &ContainerConfig) -> Vec<String> {
    sandbox_env(config)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

/// Attribution labels shared by all backends.
pub fn owner_labels(config: &ContainerConfig) -> Vec<(String, String)> {
    vec![
        (labels::TEAM_ID.to_string(), config.team_id.clone()),
        (labels::USER_ID.to_string(), config.user_id.clone()),
        (labels::CHALLENGE_ID.to_string(), config.challenge_id.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name() {
        assert_eq!(image_name("echo:latest"), Some("echo"));
        assert_eq!(image_name("ghcr.io/org/web-chal:1.2"), Some("web-chal"));
        assert_eq!(
            image_name("registry.local:5000/app@sha256:abcd"),
            Some("app")
        );
        assert_eq!(image_name("registry.local/"), None);
        assert_eq!(image_name(":latest"), None);
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("Web_Chal.v2").as_deref(), Some("web-chal-v2"));
        assert_eq!(dns_label("__"), None);
        assert_eq!(dns_label("2048").as_deref(), Some("c-2048"));
        let long = "a".repeat(100);
        assert_eq!(dns_label(&long).unwrap().len(), DNS_LABEL_MAX - SUFFIX_LEN - 1);
    }

    #[test]
    fn test_resource_name_shape() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

        let name = resource_name("ghcr.io/org/Pwn_Me:1", &suffix).unwrap();
        assert_eq!(name, format!("pwn-me-{}", suffix));
        assert!(name.len() <= DNS_LABEL_MAX);

        assert!(resource_name("ghcr.io/org/:1", &suffix).is_none());
        assert_eq!(
            resource_name_or_fallback("ghcr.io/org/:1", &suffix),
            format!("chal-{}", suffix)
        );
    }

    #[test]
    fn test_seeded_suffix_is_stable() {
        assert_eq!(seeded_suffix("flag{a}"), seeded_suffix("flag{a}"));
        assert_ne!(seeded_suffix("flag{a}"), seeded_suffix("flag{b}"));
        assert_eq!(seeded_suffix("flag{a}").len(), SUFFIX_LEN);
    }

    #[test]
    fn test_env_injection() {
        let config = ContainerConfig::new("echo", 7).with_owner("team-1", "u", "c");
        let env = sandbox_env(&config);
        assert_eq!(env, vec![(TEAM_ID_ENV.to_string(), "team-1".to_string())]);

        let config = config.with_flag("flag{x=y}");
        let env = sandbox_env_strings(&config);
        let flags: Vec<_> = env.iter().filter(|e| e.starts_with(FLAG_ENV)).collect();
        assert_eq!(flags, vec!["GZCTF_FLAG=flag{x=y}"]);
    }
}
