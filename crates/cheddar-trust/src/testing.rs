//! Simulated OS shared by the unit tests.
//!
//! [`FakeOs`] answers the same command lines the adapters issue (`security`,
//! `certutil`, `openssl`, `networksetup`, `reg` and the helper runners) from
//! in-memory state, so whole flows can run without touching the machine.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::CA_CERT_FILENAME;
use crate::engine::{EngineConfig, EngineStatus, ProxyEngine};
use crate::error::{EngineError, Result, TrustError};
use crate::fingerprint::{self, Fingerprint};
use crate::install::HostTrustChannel;
use crate::process::{ProcessInvoker, ProcessOutput};

/// DER stand-in for the current CA certificate.
pub const SAMPLE_DER: &[u8] = b"\x30\x82\x01\x0a\x02\x01\x01cheddar-sample-ca-2024";

/// DER stand-in for an older, regenerated CA certificate.
pub const OTHER_DER: &[u8] = b"\x30\x82\x01\x0a\x02\x01\x02cheddar-previous-ca-2023";

const FAKE_CN: &str = "Cheddar Proxy CA";
const NOT_FOUND: &str =
    "security: SecKeychainSearchCopyNext: The specified item could not be found in the keychain.";

/// PEM encoding of `der`.
pub fn sample_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()))
}

/// Writes `der` as the CA file into `dir` and returns its path.
pub fn write_sample_cert(dir: &Path, der: &[u8]) -> PathBuf {
    let path = dir.join(CA_CERT_FILENAME);
    std::fs::write(&path, sample_pem(der)).unwrap();
    path
}

fn der_of(bytes: &[u8]) -> Vec<u8> {
    pem::parse_many(bytes)
        .ok()
        .and_then(|blocks| {
            blocks
                .into_iter()
                .find(|block| block.tag() == "CERTIFICATE")
                .map(|block| block.contents().to_vec())
        })
        .unwrap_or_else(|| bytes.to_vec())
}

fn colon_hex(fp: &Fingerprint) -> String {
    fp.as_str()
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

fn spaced_lower_hex(fp: &Fingerprint) -> String {
    colon_hex(fp).replace(':', " ").to_lowercase()
}

#[derive(Debug, Clone)]
struct FakeCert {
    common_name: String,
    der: Vec<u8>,
    trusted: bool,
}

impl FakeCert {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_der(&self.der)
    }
}

#[derive(Debug, Clone, Default)]
struct MacProxy {
    server: String,
    port: u16,
    enabled: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    certs: Vec<FakeCert>,
    calls: Vec<(String, Vec<String>)>,
    unavailable: HashSet<String>,
    failing_programs: HashSet<String>,
    failing_commands: Vec<(String, String)>,
    decline_elevation: bool,
    mac_proxies: HashMap<(String, bool), MacProxy>,
    registry: HashMap<String, (String, String)>,
}

/// In-memory OS answering trust store and proxy tool invocations.
#[derive(Debug, Default)]
pub struct FakeOs {
    state: Mutex<FakeState>,
}

impl FakeOs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Puts a certificate straight into the store.
    pub fn seed_certificate(&self, common_name: &str, der: &[u8], trusted: bool) {
        self.state.lock().certs.push(FakeCert {
            common_name: common_name.to_string(),
            der: der.to_vec(),
            trusted,
        });
    }

    /// Makes `program` fail to spawn.
    pub fn make_unavailable(&self, program: &str) {
        self.state.lock().unavailable.insert(program.to_string());
    }

    /// Makes every invocation of `program` exit non-zero.
    pub fn fail_program(&self, program: &str) {
        self.state.lock().failing_programs.insert(program.to_string());
    }

    /// Makes invocations of `program` that carry `arg` exit non-zero.
    pub fn fail_command(&self, program: &str, arg: &str) {
        self.state
            .lock()
            .failing_commands
            .push((program.to_string(), arg.to_string()));
    }

    /// Makes the helper tier report a declined elevation prompt.
    pub fn decline_elevation(&self) {
        self.state.lock().decline_elevation = true;
    }

    /// Every invocation so far as `(program, args)`.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().calls.clone()
    }

    /// Number of invocations of `program` with `arg` among the arguments.
    pub fn count_calls(&self, program: &str, arg: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(p, args)| p == program && args.iter().any(|a| a == arg))
            .count()
    }

    pub fn count_program(&self, program: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(p, _)| p == program)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// True if a stored certificate with these DER bytes is trusted.
    pub fn is_trusted_der(&self, der: &[u8]) -> bool {
        self.state
            .lock()
            .certs
            .iter()
            .any(|cert| cert.der == der && cert.trusted)
    }

    pub fn stored_fingerprints(&self) -> Vec<Fingerprint> {
        self.state
            .lock()
            .certs
            .iter()
            .map(FakeCert::fingerprint)
            .collect()
    }

    /// Drops trust from every stored certificate.
    pub fn revoke_trust(&self) {
        for cert in self.state.lock().certs.iter_mut() {
            cert.trusted = false;
        }
    }

    /// Adds (if needed) and trusts the certificate in `path`.
    pub fn trust_file(&self, path: &Path) -> Result<()> {
        let der = der_of(&std::fs::read(path)?);
        let mut state = self.state.lock();
        match state.certs.iter_mut().find(|cert| cert.der == der) {
            Some(cert) => cert.trusted = true,
            None => state.certs.push(FakeCert {
                common_name: FAKE_CN.to_string(),
                der,
                trusted: true,
            }),
        }
        Ok(())
    }

    /// Sets the HTTP (`secure == false`) or HTTPS proxy of a network service.
    pub fn set_mac_proxy(
        &self,
        service: &str,
        secure: bool,
        server: &str,
        port: u16,
        enabled: bool,
    ) {
        self.state.lock().mac_proxies.insert(
            (service.to_string(), secure),
            MacProxy {
                server: server.to_string(),
                port,
                enabled,
            },
        );
    }

    pub fn mac_proxy_enabled(&self, service: &str, secure: bool) -> bool {
        self.state
            .lock()
            .mac_proxies
            .get(&(service.to_string(), secure))
            .is_some_and(|proxy| proxy.enabled)
    }

    pub fn set_registry_value(&self, name: &str, kind: &str, data: &str) {
        self.state
            .lock()
            .registry
            .insert(name.to_string(), (kind.to_string(), data.to_string()));
    }

    pub fn registry_value(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .registry
            .get(name)
            .map(|(_, data)| data.clone())
    }

    fn read_der(path: &str) -> Option<Vec<u8>> {
        std::fs::read(path).ok().map(|bytes| der_of(&bytes))
    }

    fn security(&self, args: &[String]) -> ProcessOutput {
        let mut state = self.state.lock();
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or_default();

        match arg(0) {
            "find-certificate" => {
                let Some(cert) = state.certs.iter().find(|c| c.common_name.contains(arg(2))) else {
                    return ProcessOutput::failed(44, NOT_FOUND);
                };
                if args.iter().any(|a| a == "-p") {
                    return ProcessOutput::ok(sample_pem(&cert.der));
                }
                ProcessOutput::ok(format!(
                    "SHA-256 hash: {}\nSHA-1 hash: 0000000000000000000000000000000000000000\nkeychain: \"/Users/test/Library/Keychains/login.keychain-db\"\nversion: 512\nclass: 0x80001000\nattributes:\n    \"labl\"<blob>=\"{}\"\n",
                    cert.fingerprint(),
                    cert.common_name
                ))
            }
            "verify-cert" => {
                let trusted = Self::read_der(arg(2))
                    .is_some_and(|der| state.certs.iter().any(|c| c.der == der && c.trusted));
                if trusted {
                    ProcessOutput::ok("...certificate verification successful.")
                } else {
                    ProcessOutput::failed(1, "Cert Verify Result: CSSMERR_TP_NOT_TRUSTED")
                }
            }
            "add-certificates" => {
                let Some(der) = args.last().and_then(|p| Self::read_der(p)) else {
                    return ProcessOutput::failed(1, "security: Error reading infile");
                };
                if state.certs.iter().any(|c| c.der == der) {
                    return ProcessOutput::failed(
                        1,
                        "security: SecKeychainItemImport: The specified item already exists in the keychain.",
                    );
                }
                state.certs.push(FakeCert {
                    common_name: FAKE_CN.to_string(),
                    der,
                    trusted: false,
                });
                ProcessOutput::ok("1 certificate imported.")
            }
            "delete-certificate" => {
                match state.certs.iter().position(|c| c.common_name.contains(arg(2))) {
                    Some(index) => {
                        state.certs.remove(index);
                        ProcessOutput::ok("")
                    }
                    None => ProcessOutput::failed(44, "Unable to delete certificate matching \"\": The specified item could not be found in the keychain."),
                }
            }
            other => ProcessOutput::failed(2, format!("security: unknown command {other}")),
        }
    }

    fn certutil(&self, args: &[String]) -> ProcessOutput {
        let mut state = self.state.lock();
        let verb = args.iter().find(|a| a.starts_with('-') && *a != "-user");
        let target = args.last().map(String::as_str).unwrap_or_default();

        match verb.map(String::as_str) {
            Some("-store") => {
                let mut out = String::from("Root \"Trusted Root Certification Authorities\"\n");
                for (index, cert) in state
                    .certs
                    .iter()
                    .filter(|c| c.common_name.contains(target))
                    .enumerate()
                {
                    out.push_str(&format!(
                        "================ Certificate {index} ================\nSerial Number: 0{index}\nIssuer: CN={cn}, O=Cheddar Proxy\nSubject: CN={cn}, O=Cheddar Proxy\nCert Hash(sha256): {hash}\n",
                        cn = cert.common_name,
                        hash = spaced_lower_hex(&cert.fingerprint()),
                    ));
                }
                out.push_str("CertUtil: -store command completed successfully.\n");
                ProcessOutput::ok(out)
            }
            Some("-verifystore") => {
                if state
                    .certs
                    .iter()
                    .any(|c| c.common_name.contains(target) && c.trusted)
                {
                    ProcessOutput::ok("CertUtil: -verifystore command completed successfully.")
                } else {
                    ProcessOutput::failed(
                        -2146762487,
                        "CertUtil: -verifystore command FAILED: 0x800b0109 (CERT_E_UNTRUSTEDROOT)",
                    )
                }
            }
            Some("-addstore") => {
                let Some(der) = Self::read_der(target) else {
                    return ProcessOutput::failed(2, "CertUtil: -addstore command FAILED");
                };
                if state.certs.iter().any(|c| c.der == der) {
                    return ProcessOutput::ok(
                        "Certificate \"Cheddar Proxy CA\" already in store.\nCertUtil: -addstore command completed successfully.",
                    );
                }
                state.certs.push(FakeCert {
                    common_name: FAKE_CN.to_string(),
                    der,
                    trusted: false,
                });
                ProcessOutput::ok("Certificate \"Cheddar Proxy CA\" added to store.\nCertUtil: -addstore command completed successfully.")
            }
            Some("-delstore") => {
                let before = state.certs.len();
                state.certs.retain(|c| !c.common_name.contains(target));
                if state.certs.len() < before {
                    ProcessOutput::ok("CertUtil: -delstore command completed successfully.")
                } else {
                    ProcessOutput::failed(
                        -2146885628,
                        "CertUtil: -delstore command FAILED: 0x80092004 (-2146885628 CRYPT_E_NOT_FOUND)",
                    )
                }
            }
            Some("-dump") => match Self::read_der(target) {
                Some(der) => ProcessOutput::ok(format!(
                    "X509 Certificate:\nVersion: 3\nIssuer:\n    CN={FAKE_CN}\n    O=Cheddar Proxy\n\n NotBefore: 1/1/2024 12:00 AM\n NotAfter: 12/31/2033 12:00 AM\n\nSubject:\n    CN={FAKE_CN}\n    O=Cheddar Proxy\n\nCert Hash(sha256): {}\nCertUtil: -dump command completed successfully.\n",
                    spaced_lower_hex(&Fingerprint::of_der(&der))
                )),
                None => ProcessOutput::failed(2, "CertUtil: -dump command FAILED"),
            },
            _ => ProcessOutput::failed(87, "CertUtil: Unknown arg"),
        }
    }

    fn openssl(&self, args: &[String]) -> ProcessOutput {
        let path = args
            .iter()
            .position(|a| a == "-in")
            .and_then(|i| args.get(i + 1));
        match path.and_then(|p| Self::read_der(p)) {
            Some(der) => ProcessOutput::ok(format!(
                "subject=CN = {FAKE_CN}, O = Cheddar Proxy\nissuer=CN = {FAKE_CN}, O = Cheddar Proxy\nnotBefore=Jan  1 00:00:00 2024 GMT\nnotAfter=Dec 31 00:00:00 2033 GMT\nsha256 Fingerprint={}\n",
                colon_hex(&Fingerprint::of_der(&der))
            )),
            None => ProcessOutput::failed(1, "Could not open file or uri for loading certificate"),
        }
    }

    fn helper(&self, cert_path: Option<&String>) -> ProcessOutput {
        if self.state.lock().decline_elevation {
            return ProcessOutput::failed(1, "The operation was canceled by the user.");
        }
        match cert_path.map(|p| self.trust_file(Path::new(p))) {
            Some(Ok(())) => ProcessOutput::ok(""),
            _ => ProcessOutput::failed(1, "helper could not read certificate"),
        }
    }

    fn networksetup(&self, args: &[String]) -> ProcessOutput {
        let mut state = self.state.lock();
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or_default();
        let service = arg(1).to_string();

        match arg(0) {
            "-listallnetworkservices" => ProcessOutput::ok(
                "An asterisk (*) denotes that a network service is disabled.\nWi-Fi\n*Thunderbolt Bridge\nEthernet\n",
            ),
            flag @ ("-getwebproxy" | "-getsecurewebproxy") => {
                let secure = flag == "-getsecurewebproxy";
                let proxy = state
                    .mac_proxies
                    .get(&(service, secure))
                    .cloned()
                    .unwrap_or_default();
                ProcessOutput::ok(format!(
                    "Enabled: {}\nServer: {}\nPort: {}\nAuthenticated Proxy Enabled: 0\n",
                    if proxy.enabled { "Yes" } else { "No" },
                    proxy.server,
                    proxy.port
                ))
            }
            flag @ ("-setwebproxy" | "-setsecurewebproxy") => {
                let secure = flag == "-setsecurewebproxy";
                let Ok(port) = arg(3).parse() else {
                    return ProcessOutput::failed(4, "Invalid port");
                };
                let proxy = state.mac_proxies.entry((service, secure)).or_default();
                proxy.server = arg(2).to_string();
                proxy.port = port;
                ProcessOutput::ok("")
            }
            flag @ ("-setwebproxystate" | "-setsecurewebproxystate") => {
                let secure = flag == "-setsecurewebproxystate";
                let proxy = state.mac_proxies.entry((service, secure)).or_default();
                proxy.enabled = arg(2) == "on";
                ProcessOutput::ok("")
            }
            other => ProcessOutput::failed(4, format!("** Error: unknown flag {other}")),
        }
    }

    fn reg(&self, args: &[String]) -> ProcessOutput {
        let mut state = self.state.lock();
        let value_after = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
                .unwrap_or_default()
        };
        let name = value_after("/v");

        match args.first().map(String::as_str) {
            Some("query") => match state.registry.get(&name) {
                Some((kind, data)) => ProcessOutput::ok(format!(
                    "\r\nHKEY_CURRENT_USER\\Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings\r\n    {name}    {kind}    {data}\r\n\r\n"
                )),
                None => ProcessOutput::failed(
                    1,
                    "ERROR: The system was unable to find the specified registry key or value.",
                ),
            },
            Some("add") => {
                let kind = value_after("/t");
                let mut data = value_after("/d");
                if kind == "REG_DWORD" {
                    let Ok(value) = data.parse::<u32>() else {
                        return ProcessOutput::failed(1, "ERROR: Invalid syntax.");
                    };
                    data = format!("0x{value:x}");
                }
                state.registry.insert(name, (kind, data));
                ProcessOutput::ok("The operation completed successfully.")
            }
            _ => ProcessOutput::failed(1, "ERROR: Invalid syntax."),
        }
    }
}

#[async_trait]
impl ProcessInvoker for FakeOs {
    async fn run(&self, program: &str, args: &[&str]) -> Result<ProcessOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        {
            let mut state = self.state.lock();
            state.calls.push((program.to_string(), args.clone()));

            if state.unavailable.contains(program) {
                return Err(TrustError::ToolUnavailable {
                    program: program.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            let failing = state.failing_programs.contains(program)
                || state
                    .failing_commands
                    .iter()
                    .any(|(p, arg)| p == program && args.contains(arg));
            if failing {
                return Ok(ProcessOutput::failed(1, format!("{program}: simulated failure")));
            }
        }

        let out = match program {
            "security" => self.security(&args),
            "certutil" => self.certutil(&args),
            "openssl" => self.openssl(&args),
            "/bin/sh" => self.helper(args.get(1)),
            "powershell" => self.helper(args.last()),
            "open" | "rundll32.exe" => ProcessOutput::ok(""),
            "networksetup" => self.networksetup(&args),
            "reg" => self.reg(&args),
            _ => {
                return Err(TrustError::ToolUnavailable {
                    program: program.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
        };
        Ok(out)
    }
}

/// Host trust channel that is either not wired up or trusts through [`FakeOs`].
#[derive(Debug)]
pub struct FakeHostChannel {
    os: Option<Arc<FakeOs>>,
    calls: AtomicUsize,
}

impl FakeHostChannel {
    pub fn unavailable() -> Self {
        Self {
            os: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn trusting(os: Arc<FakeOs>) -> Self {
        Self {
            os: Some(os),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostTrustChannel for FakeHostChannel {
    async fn trust_certificate(&self, cert_path: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.os {
            Some(os) => os.trust_file(cert_path),
            None => Err(TrustError::HostIntegrationUnavailable),
        }
    }
}

/// Engine whose status and start/stop outcomes are scripted by the test.
#[derive(Debug)]
pub struct FakeEngine {
    status: Mutex<EngineStatus>,
    status_fails: AtomicBool,
    start_fails: AtomicBool,
    toggle_delay: Mutex<Duration>,
    starts: AtomicUsize,
}

impl FakeEngine {
    pub fn new(running: bool, port: u16) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(EngineStatus {
                is_running: running,
                bind_address: "127.0.0.1".to_string(),
                port,
            }),
            status_fails: AtomicBool::new(false),
            start_fails: AtomicBool::new(false),
            toggle_delay: Mutex::new(Duration::ZERO),
            starts: AtomicUsize::new(0),
        })
    }

    /// Changes the running flag behind the reconciler's back.
    pub fn set_running(&self, running: bool) {
        self.status.lock().is_running = running;
    }

    pub fn fail_status(&self, fail: bool) {
        self.status_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.start_fails.store(fail, Ordering::SeqCst);
    }

    /// Makes start/stop take `delay` before completing.
    pub fn slow_toggle(&self, delay: Duration) {
        *self.toggle_delay.lock() = delay;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyEngine for FakeEngine {
    fn status(&self) -> std::result::Result<EngineStatus, EngineError> {
        if self.status_fails.load(Ordering::SeqCst) {
            return Err(EngineError::Status("engine not reachable".into()));
        }
        Ok(self.status.lock().clone())
    }

    async fn start(&self, config: EngineConfig) -> std::result::Result<(), EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.toggle_delay.lock();
        tokio::time::sleep(delay).await;
        if self.start_fails.load(Ordering::SeqCst) {
            return Err(EngineError::Start(format!("port {} in use", config.port)));
        }
        let mut status = self.status.lock();
        status.is_running = true;
        status.port = config.port;
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), EngineError> {
        let delay = *self.toggle_delay.lock();
        tokio::time::sleep(delay).await;
        self.status.lock().is_running = false;
        Ok(())
    }
}

#[test]
fn fake_fingerprint_formats_parse_back() {
    let fp = Fingerprint::of_der(SAMPLE_DER);
    assert!(fp.matches(&colon_hex(&fp)));
    assert_eq!(
        fingerprint::of_store_entry(&format!("Cert Hash(sha256): {}", spaced_lower_hex(&fp))),
        Some(fp)
    );
}
