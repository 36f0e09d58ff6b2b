//! Certificate authority for TLS interception
//!
//! Maintains a long-lived root CA on disk and mints short-lived leaf
//! certificates for decrypted hostnames. Leaves are cached per host for
//! the lifetime of the process. Installing the root into the OS trust
//! store is best-effort: a failure is logged and interception continues,
//! clients that do not trust the root will see TLS errors.

use std::{path::Path, process::Command, sync::Arc};

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

use crate::core::{ProxyError, ProxyResult};

const ROOT_CERT_FILE: &str = "devproxy-ca.pem";
const ROOT_KEY_FILE: &str = "devproxy-ca.key.pem";
const ROOT_COMMON_NAME: &str = "Dev Proxy CA";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 90;

/// Root CA plus a per-host leaf cache.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    server_configs: DashMap<String, Arc<rustls::ServerConfig>>,
}

impl CertificateAuthority {
    /// Load the root CA from `dir`, generating and persisting one if
    /// missing. Idempotent: a second call returns the same root.
    pub fn ensure_root(dir: &Path) -> ProxyResult<Self> {
        let cert_path = dir.join(ROOT_CERT_FILE);
        let key_path = dir.join(ROOT_KEY_FILE);

        let (ca_cert, ca_key, ca_cert_pem) = if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let ca_key = KeyPair::from_pem(&key_pem)?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
            let ca_cert = params.self_signed(&ca_key)?;
            log::debug!("Loaded root certificate from {}", cert_path.display());
            (ca_cert, ca_key, cert_pem)
        } else {
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params
                .distinguished_name
                .push(DnType::CommonName, ROOT_COMMON_NAME);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            let now = OffsetDateTime::now_utc();
            params.not_before = now - Duration::days(1);
            params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

            let ca_key = KeyPair::generate()?;
            let ca_cert = params.self_signed(&ca_key)?;
            let cert_pem = ca_cert.pem();

            std::fs::create_dir_all(dir)?;
            std::fs::write(&cert_path, &cert_pem)?;
            std::fs::write(&key_path, ca_key.serialize_pem())?;
            log::info!("Generated root certificate at {}", cert_path.display());
            (ca_cert, ca_key, cert_pem)
        };

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            server_configs: DashMap::new(),
        })
    }

    pub fn root_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// TLS server config carrying a leaf for `host`, minted on first use.
    pub fn server_config(&self, host: &str) -> ProxyResult<Arc<rustls::ServerConfig>> {
        if let Some(config) = self.server_configs.get(host) {
            return Ok(config.value().clone());
        }

        let config = Arc::new(self.mint_server_config(host)?);
        self.server_configs
            .insert(host.to_string(), config.clone());
        Ok(config)
    }

    fn mint_server_config(&self, host: &str) -> ProxyResult<rustls::ServerConfig> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let chain: Vec<CertificateDer<'static>> = vec![
            leaf.der().clone(),
            self.ca_cert.der().clone(),
        ];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(format!("Cannot select TLS protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::Tls(format!("Cannot build server config for {host}: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        log::debug!("Minted leaf certificate for {host}");
        Ok(config)
    }

    /// Install the root into the OS trust store. Never fatal.
    pub fn install_os_trust(&self, dir: &Path) {
        let cert_path = dir.join(ROOT_CERT_FILE);
        let result = if cfg!(target_os = "linux") {
            install_trust_linux(&cert_path)
        } else if cfg!(target_os = "macos") {
            install_trust_macos(&cert_path)
        } else {
            Err(ProxyError::Certificate(
                "Trust store installation is not supported on this platform".to_string(),
            ))
        };

        match result {
            Ok(()) => log::info!("Root certificate installed into the OS trust store"),
            Err(e) => log::error!(
                "Cannot install root certificate; intercepted HTTPS will show TLS errors: {e}"
            ),
        }
    }
}

fn run_trust_command(mut command: Command) -> ProxyResult<()> {
    let output = command.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ProxyError::Certificate(format!(
            "{:?} exited with {}: {}",
            command.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn install_trust_linux(cert_path: &Path) -> ProxyResult<()> {
    std::fs::copy(
        cert_path,
        "/usr/local/share/ca-certificates/devproxy-ca.crt",
    )?;
    run_trust_command(Command::new("update-ca-certificates"))
}

fn install_trust_macos(cert_path: &Path) -> ProxyResult<()> {
    let mut command = Command::new("security");
    command
        .arg("add-trusted-cert")
        .arg("-d")
        .arg("-k")
        .arg("/Library/Keychains/System.keychain")
        .arg(cert_path);
    run_trust_command(command)
}
