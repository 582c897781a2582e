//! Proxy configuration through `networksetup`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{StepRunner, SystemProxy};
use crate::error::Result;
use crate::process::ProcessInvoker;

const NETWORKSETUP: &str = "networksetup";

/// Proxy settings of every enabled network service.
pub struct NetworkSetupProxy {
    invoker: Arc<dyn ProcessInvoker>,
}

impl std::fmt::Debug for NetworkSetupProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSetupProxy").finish()
    }
}

impl NetworkSetupProxy {
    /// Creates a new configurator.
    pub fn new(invoker: Arc<dyn ProcessInvoker>) -> Self {
        Self { invoker }
    }

    fn default_services() -> Vec<String> {
        vec!["Wi-Fi".to_string(), "Ethernet".to_string()]
    }

    async fn services(&self) -> Vec<String> {
        match self
            .invoker
            .run(NETWORKSETUP, &["-listallnetworkservices"])
            .await
            .and_then(|out| out.into_success(NETWORKSETUP))
        {
            Ok(out) => {
                let services = parse_services(&out.stdout);
                if services.is_empty() {
                    tracing::warn!("No network services reported; falling back to defaults");
                    Self::default_services()
                } else {
                    services
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to enumerate network services; falling back to defaults: {}",
                    e
                );
                Self::default_services()
            }
        }
    }

    async fn read(&self, flag: &str, service: &str, host: &str, port: u16) -> Result<bool> {
        let out = self
            .invoker
            .run(NETWORKSETUP, &[flag, service])
            .await?
            .into_success(NETWORKSETUP)?;
        Ok(proxy_matches(&out.stdout, host, port))
    }
}

#[async_trait]
impl SystemProxy for NetworkSetupProxy {
    async fn is_configured(&self, host: &str, port: u16) -> Result<bool> {
        for service in self.services().await {
            if !self.read("-getwebproxy", &service, host, port).await? {
                return Ok(false);
            }
            if !self.read("-getsecurewebproxy", &service, host, port).await? {
                tracing::debug!("HTTPS proxy on '{}' is not ours", service);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn enable(&self, host: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        let mut steps = StepRunner::new(self.invoker.as_ref(), NETWORKSETUP);

        for service in self.services().await {
            let service = service.as_str();
            steps.step(&["-setwebproxy", service, host, &port]).await;
            steps.step(&["-setwebproxystate", service, "on"]).await;
            steps.step(&["-setsecurewebproxy", service, host, &port]).await;
            steps.step(&["-setsecurewebproxystate", service, "on"]).await;
        }
        steps.finish()
    }

    async fn disable(&self) -> Result<()> {
        let mut steps = StepRunner::new(self.invoker.as_ref(), NETWORKSETUP);

        for service in self.services().await {
            let service = service.as_str();
            steps.step(&["-setwebproxystate", service, "off"]).await;
            steps.step(&["-setsecurewebproxystate", service, "off"]).await;
        }
        steps.finish()
    }
}

/// Parses `-listallnetworkservices`, skipping the header and disabled (`*`) services.
fn parse_services(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("An asterisk") && !line.starts_with('*')
        })
        .map(str::to_string)
        .collect()
}

/// Checks `-getwebproxy` style output for `Enabled: Yes`, server and port.
fn proxy_matches(output: &str, host: &str, port: u16) -> bool {
    let mut enabled = false;
    let mut server_ok = false;
    let mut port_ok = false;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Enabled" => enabled = value.eq_ignore_ascii_case("yes"),
            "Server" => server_ok = value == host,
            "Port" => port_ok = value.parse::<u16>().ok() == Some(port),
            _ => {}
        }
    }
    enabled && server_ok && port_ok
}
