use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use harvest_engine::{HarvestConfig, ProxyConfig, TlsPolicy};
use reqwest::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::cli::Args;
use crate::error::{AppError, Result};

/// Optional settings read from `--config`. Command-line flags win over
/// anything set here.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub concurrency: Option<usize>,
    pub insecure: Option<bool>,
    pub ffmpeg: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<ProxySection>,
    pub timeouts: TimeoutSection,
    pub live: LiveSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSection {
    pub manifest_secs: Option<u64>,
    pub segment_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveSection {
    pub poll_interval_secs: Option<u64>,
    pub max_idle_polls: Option<u32>,
}

impl FileConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Merges this file with the command-line flags into an engine config.
    pub fn merge_with(self, args: &Args) -> Result<HarvestConfig> {
        let mut builder = HarvestConfig::builder();

        if let Some(concurrency) = args.concurrency.or(self.concurrency) {
            if concurrency == 0 {
                return Err(AppError::InvalidInput(
                    "concurrency must be at least 1".to_string(),
                ));
            }
            builder = builder.concurrency(concurrency);
        }

        if args.insecure || self.insecure.unwrap_or(false) {
            builder = builder.tls_policy(TlsPolicy::AcceptInvalidCerts);
        }

        if let Some(program) = args.ffmpeg.clone().or(self.ffmpeg) {
            builder = builder.muxer_program(program);
        }

        if let Some(root) = args.workdir.clone().or(self.workdir) {
            builder = builder.workspace_root(root);
        }

        if let Some(user_agent) = args.user_agent.clone().or(self.user_agent) {
            builder = builder.user_agent(user_agent);
        }

        let file_headers = self
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()));
        let flag_headers = args
            .headers
            .iter()
            .map(|raw| split_header(raw))
            .collect::<Result<Vec<_>>>()?;
        for (name, value) in file_headers.chain(flag_headers) {
            let (name, value) = parse_header(name, value)?;
            builder = builder.header(name, value);
        }

        if let Some(proxy) = proxy_from(args, self.proxy) {
            builder = builder.proxy(proxy);
        }

        if let Some(secs) = self.timeouts.manifest_secs {
            builder = builder.manifest_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.timeouts.segment_secs {
            builder = builder.segment_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.live.poll_interval_secs {
            builder = builder.live_poll_interval(Duration::from_secs(secs));
        }
        if let Some(polls) = self.live.max_idle_polls {
            builder = builder.live_max_idle_polls(polls);
        }

        Ok(builder.build())
    }
}

fn proxy_from(args: &Args, section: Option<ProxySection>) -> Option<ProxyConfig> {
    if let Some(url) = &args.proxy {
        let proxy = ProxyConfig::from_url(url.clone());
        return Some(match (&args.proxy_username, &args.proxy_password) {
            (Some(user), password) => {
                proxy.with_auth(user.clone(), password.clone().unwrap_or_default())
            }
            (None, _) => proxy,
        });
    }

    let section = section?;
    let proxy = ProxyConfig::from_url(section.url);
    Some(match section.username {
        Some(user) => proxy.with_auth(user, section.password.unwrap_or_default()),
        None => proxy,
    })
}

fn split_header(raw: &str) -> Result<(&str, &str)> {
    raw.split_once(':')
        .map(|(name, value)| (name.trim(), value.trim()))
        .ok_or_else(|| AppError::InvalidInput(format!("header `{raw}` is not `Name: value`")))
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| AppError::InvalidInput(format!("invalid header name `{name}`: {e}")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| AppError::InvalidInput(format!("invalid value for header `{name}`: {e}")))?;
    Ok((header_name, header_value))
}
