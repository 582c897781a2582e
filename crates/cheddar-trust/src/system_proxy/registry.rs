//! Proxy configuration through the per-user Internet Settings registry key.

use std::sync::Arc;

use async_trait::async_trait;

use super::{StepRunner, SystemProxy};
use crate::error::Result;
use crate::process::ProcessInvoker;

const REG: &str = "reg";
const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// WinINet proxy settings of the current user.
pub struct RegistryProxy {
    invoker: Arc<dyn ProcessInvoker>,
}

impl std::fmt::Debug for RegistryProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryProxy").finish()
    }
}

impl RegistryProxy {
    /// Creates a new configurator.
    pub fn new(invoker: Arc<dyn ProcessInvoker>) -> Self {
        Self { invoker }
    }

    /// Reads one value; `None` when it does not exist.
    async fn query(&self, name: &str) -> Result<Option<String>> {
        let out = self
            .invoker
            .run(REG, &["query", INTERNET_SETTINGS, "/v", name])
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(parse_value(&out.stdout, name))
    }
}

#[async_trait]
impl SystemProxy for RegistryProxy {
    async fn is_configured(&self, host: &str, port: u16) -> Result<bool> {
        let enabled = self
            .query("ProxyEnable")
            .await?
            .and_then(|raw| parse_dword(&raw))
            .is_some_and(|value| value != 0);
        if !enabled {
            return Ok(false);
        }

        let Some(server) = self.query("ProxyServer").await? else {
            return Ok(false);
        };
        let expected = format!("{}:{}", host, port);
        let (http, https) = split_proxy_server(&server);
        Ok(http.as_deref() == Some(expected.as_str())
            && https.as_deref() == Some(expected.as_str()))
    }

    async fn enable(&self, host: &str, port: u16) -> Result<()> {
        let server = format!("http={host}:{port};https={host}:{port}");
        let mut steps = StepRunner::new(self.invoker.as_ref(), REG);

        steps.step(&add_value("ProxyServer", "REG_SZ", &server)).await;
        steps.step(&add_value("ProxyEnable", "REG_DWORD", "1")).await;
        steps.step(&add_value("ProxyOverride", "REG_SZ", "<local>")).await;
        steps.finish()
    }

    async fn disable(&self) -> Result<()> {
        let mut steps = StepRunner::new(self.invoker.as_ref(), REG);
        steps.step(&add_value("ProxyEnable", "REG_DWORD", "0")).await;
        steps.finish()
    }
}

/// `reg add` arguments overwriting one value under the settings key.
fn add_value<'a>(name: &'a str, kind: &'a str, data: &'a str) -> [&'a str; 9] {
    [
        "add",
        INTERNET_SETTINGS,
        "/v",
        name,
        "/t",
        kind,
        "/d",
        data,
        "/f",
    ]
}

/// Extracts the data column of `reg query` output for `name`.
fn parse_value(output: &str, name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if !parts.next()?.eq_ignore_ascii_case(name) {
            return None;
        }
        let _kind = parts.next()?;
        Some(parts.collect::<Vec<_>>().join(" "))
    })
}

fn parse_dword(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Resolves `ProxyServer` into its HTTP and HTTPS targets.
///
/// A bare `host:port` applies to every protocol; otherwise entries look
/// like `http=host:port;https=host:port`.
fn split_proxy_server(value: &str) -> (Option<String>, Option<String>) {
    let value = value.trim();
    if !value.contains('=') {
        let all = (!value.is_empty()).then(|| value.to_string());
        return (all.clone(), all);
    }

    let mut http = None;
    let mut https = None;
    for entry in value.split(';') {
        let Some((scheme, target)) = entry.split_once('=') else {
            continue;
        };
        let target = target.trim().to_string();
        match scheme.trim().to_ascii_lowercase().as_str() {
            "http" => http = Some(target),
            "https" => https = Some(target),
            _ => {}
        }
    }
    (http, https)
}
