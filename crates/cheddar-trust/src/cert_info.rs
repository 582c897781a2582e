//! Human-readable details of the CA certificate file.
//!
//! Details are read with `openssl x509` (OpenSSL or LibreSSL output) and, on
//! the certificate-store platform, `certutil -dump` when `openssl` is missing.

use std::path::Path;

use serde::Serialize;

use crate::error::{Result, TrustError};
use crate::fingerprint::{self, Fingerprint};
use crate::platform::Platform;
use crate::process::ProcessInvoker;
use crate::store::path_arg;

/// Parsed details of a certificate file. Built on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    /// Common name of the subject.
    pub subject: String,
    /// Common name of the issuer.
    pub issuer: String,
    /// Start of validity, as printed by the tool.
    pub not_before: String,
    /// End of validity, as printed by the tool.
    pub not_after: String,
    /// SHA-256 fingerprint.
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Default)]
struct PartialInfo {
    subject: Option<String>,
    issuer: Option<String>,
    not_before: Option<String>,
    not_after: Option<String>,
    fingerprint: Option<Fingerprint>,
}

impl PartialInfo {
    fn complete(self, fingerprint: Option<Fingerprint>) -> Option<CertificateInfo> {
        Some(CertificateInfo {
            subject: self.subject?,
            issuer: self.issuer?,
            not_before: self.not_before?,
            not_after: self.not_after?,
            fingerprint: self.fingerprint.or(fingerprint)?,
        })
    }

    fn has_fingerprint(&self) -> bool {
        self.fingerprint.is_some()
    }
}

/// Reads certificate details through the platform's tooling.
pub async fn read(
    invoker: &dyn ProcessInvoker,
    platform: Platform,
    path: &Path,
) -> Result<CertificateInfo> {
    if !path.exists() {
        return Err(TrustError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("certificate not found at {}", path.display()),
        )));
    }

    let path_str = path_arg(path);
    let openssl = invoker
        .run(
            "openssl",
            &[
                "x509",
                "-in",
                &path_str,
                "-noout",
                "-subject",
                "-issuer",
                "-startdate",
                "-enddate",
                "-fingerprint",
                "-sha256",
            ],
        )
        .await;

    let partial = match openssl {
        Ok(out) => parse_openssl(&out.into_success("openssl")?.stdout),
        Err(e @ TrustError::ToolUnavailable { .. }) if platform == Platform::Store => {
            tracing::debug!("{}; falling back to certutil -dump", e);
            let out = invoker.run("certutil", &["-dump", &path_str]).await?;
            parse_certutil_dump(&out.into_success("certutil")?.stdout)
        }
        Err(e) => return Err(e),
    };

    let fallback = if partial.has_fingerprint() {
        None
    } else {
        fingerprint::of_file(path).await.ok()
    };

    partial
        .complete(fallback)
        .ok_or_else(|| TrustError::ParseFailure("incomplete certificate details".into()))
}

fn parse_openssl(output: &str) -> PartialInfo {
    let mut info = PartialInfo {
        fingerprint: fingerprint::from_tool_output(output),
        ..PartialInfo::default()
    };

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "subject" => info.subject = common_name(value),
            "issuer" => info.issuer = common_name(value),
            "notBefore" => info.not_before = Some(value.to_string()),
            "notAfter" => info.not_after = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

fn parse_certutil_dump(output: &str) -> PartialInfo {
    let mut info = PartialInfo {
        fingerprint: fingerprint::of_store_entry(output),
        ..PartialInfo::default()
    };

    let lines: Vec<&str> = output.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("NotBefore:") {
            info.not_before = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("NotAfter:") {
            info.not_after = Some(value.trim().to_string());
        } else if trimmed == "Issuer:" && info.issuer.is_none() {
            info.issuer = name_block_cn(&lines[index + 1..]);
        } else if trimmed == "Subject:" && info.subject.is_none() {
            info.subject = name_block_cn(&lines[index + 1..]);
        }
    }
    info
}

/// Finds `CN=` in the indented block following an `Issuer:`/`Subject:` line.
fn name_block_cn(lines: &[&str]) -> Option<String> {
    lines
        .iter()
        .take_while(|line| !line.trim().is_empty() && line.starts_with(char::is_whitespace))
        .find_map(|line| line.trim().strip_prefix("CN=").map(|cn| cn.trim().to_string()))
}

/// Extracts the CN from a one-line distinguished name.
///
/// Handles `CN = X, O = Y` (OpenSSL, with optional quoting), `/CN=X/O=Y`
/// (LibreSSL) and CN values that themselves contain commas.
fn common_name(dn: &str) -> Option<String> {
    let start = ["CN = ", "CN="]
        .iter()
        .filter_map(|marker| dn.find(marker).map(|at| at + marker.len()))
        .min()?;
    let rest = &dn[start..];

    if let Some(quoted) = rest.strip_prefix('"') {
        return quoted.find('"').map(|end| quoted[..end].to_string());
    }

    let end = attribute_boundary(rest).unwrap_or(rest.len());
    let value = rest[..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Position of the next `, KEY =` or `/KEY=` separator.
fn attribute_boundary(rest: &str) -> Option<usize> {
    rest.char_indices().find_map(|(at, c)| {
        let tail = match c {
            ',' => rest[at + 1..].trim_start(),
            '/' => &rest[at + 1..],
            _ => return None,
        };
        let key_len = tail
            .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '.'))
            .unwrap_or(tail.len());
        if key_len == 0 {
            return None;
        }
        tail[key_len..].trim_start().starts_with('=').then_some(at)
    })
}
