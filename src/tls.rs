//! TLS policy engine.
//!
//! Holds the maximum TLS version, the optional explicit cipher-suite list and
//! the small state machine that downgrades from TLS 1.3 to TLS 1.2 (and back)
//! in response to handshake failures, or adopts the cipher a server was
//! observed to negotiate. Every policy change makes the transport rebuild its
//! HTTP clients from a freshly assembled `rustls::ClientConfig`.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rustls::client::ClientSessionMemoryCache;
use rustls::client::Resumption;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tracing::{info, warn};

use crate::error::{Result, TransportError};
use crate::TransportConfig;

/// Cipher suites (IANA ids) the transport is willing to offer at all.
pub const TLS_SECURE: [u16; 9] = [4865, 4866, 4868, 49195, 49196, 49199, 49200, 52392, 52393];

/// Cipher suites that only exist under TLS 1.3.
pub const TLS13_SUITES: [u16; 9] = [198, 199, 4865, 4866, 4867, 4868, 4869, 49332, 49333];

/// Suites accepted in a negotiated TLS 1.3 session.
pub const TLS13_SAFE: [u16; 3] = [4865, 4866, 4868];

/// Suites accepted in a negotiated TLS 1.2 session.
pub const TLS12_SAFE: [u16; 5] = [52393, 49200, 49199, 49196, 49195];

/// The default TLS 1.2 offer, in preference order:
/// ECDHE-ECDSA-CHACHA20-POLY1305, ECDHE-RSA-AES256-GCM-SHA384,
/// ECDHE-RSA-AES128-GCM-SHA256, ECDHE-ECDSA-AES256-GCM-SHA384,
/// ECDHE-ECDSA-AES128-GCM-SHA256.
pub fn default_tls12_cipher_suites() -> Vec<u16> {
    vec![52393, 49200, 49199, 49196, 49195]
}

// Some operating systems still ship without the ISRG Root X1 certificate;
// append it so Let's Encrypt chains validate everywhere.
const ISRG_ROOT_X1_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIFazCCA1OgAwIBAgIRAIIQz7DSQONZRGPgu2OCiwAwDQYJKoZIhvcNAQELBQAw
TzELMAkGA1UEBhMCVVMxKTAnBgNVBAoTIEludGVybmV0IFNlY3VyaXR5IFJlc2Vh
cmNoIEdyb3VwMRUwEwYDVQQDEwxJU1JHIFJvb3QgWDEwHhcNMTUwNjA0MTEwNDM4
WhcNMzUwNjA0MTEwNDM4WjBPMQswCQYDVQQGEwJVUzEpMCcGA1UEChMgSW50ZXJu
ZXQgU2VjdXJpdHkgUmVzZWFyY2ggR3JvdXAxFTATBgNVBAMTDElTUkcgUm9vdCBY
MTCCAiIwDQYJKoZIhvcNAQEBBQADggIPADCCAgoCggIBAK3oJHP0FDfzm54rVygc
h77ct984kIxuPOZXoHj3dcKi/vVqbvYATyjb3miGbESTtrFj/RQSa78f0uoxmyF+
0TM8ukj13Xnfs7j/EvEhmkvBioZxaUpmZmyPfjxwv60pIgbz5MDmgK7iS4+3mX6U
A5/TR5d8mUgjU+g4rk8Kb4Mu0UlXjIB0ttov0DiNewNwIRt18jA8+o+u3dpjq+sW
T8KOEUt+zwvo/7V3LvSye0rgTBIlDHCNAymg4VMk7BPZ7hm/ELNKjD+Jo2FR3qyH
B5T0Y3HsLuJvW5iB4YlcNHlsdu87kGJ55tukmi8mxdAQ4Q7e2RCOFvu396j3x+UC
B5iPNgiV5+I3lg02dZ77DnKxHZu8A/lJBdiB3QW0KtZB6awBdpUKD9jf1b0SHzUv
KBds0pjBqAlkd25HN7rOrFleaJ1/ctaJxQZBKT5ZPt0m9STJEadao0xAH0ahmbWn
OlFuhjuefXKnEgV4We0+UXgVCwOPjdAvBbI+e0ocS3MFEvzG6uBQE3xDk3SzynTn
jh8BCNAw1FtxNrQHusEwMFxIt4I7mKZ9YIqioymCzLq9gwQbooMDQaHWBfEbwrbw
qHyGO0aoSCqI3Haadr8faqU9GY/rOPNk3sgrDQoo//fb4hVC1CLQJ13hef4Y53CI
rU7m2Ys6xt0nUW7/vGT1M0NPAgMBAAGjQjBAMA4GA1UdDwEB/wQEAwIBBjAPBgNV
HRMBAf8EBTADAQH/MB0GA1UdDgQWBBR5tFnme7bl5AFzgAiIyBpY9umbbjANBgkq
hkiG9w0BAQsFAAOCAgEAVR9YqbyyqFDQDLHYGmkgJykIrGF1XIpu+ILlaS/V9lZL
ubhzEFnTIZd+50xx+7LSYK05qAvqFyFWhfFQDlnrzuBZ6brJFe+GnY+EgPbk6ZGQ
3BebYhtF8GaV0nxvwuo77x/Py9auJ/GpsMiu/X1+mvoiBOv/2X/qkSsisRcOj/KK
NFtY2PwByVS5uCbMiogziUwthDyC3+6WVwW6LLv3xLfHTjuCvjHIInNzktHCgKQ5
ORAzI4JMPJ+GslWYHb4phowim57iaztXOoJwTdwJx4nLCgdNbOhdjsnvzqvHu7Ur
TkXWStAmzOVyyghqpZXjFaH3pO3JLF+l+/+sKAIuvtd7u+Nxe5AW0wdeRlN8NwdC
jNPElpzVmbUq4JUagEiuTDkHzsxHpFKVK7q4+63SM1N95R1NbdWhscdCb+ZAJzVc
oyi3B43njTOQ5yOf+1CceWxG1bQVs5ZufpsMljq4Ui0/1lvh+wjChP4kqKOJ2qxq
4RgqsahDYVvTH9w7jXbyLeiNdd8XM2w9U/t7y0Ff/9yi0GE44Za4rF2LN9d11TPA
mRGunUHBcnWEvgJBQl9nJEiU0Zsnvgc/ubhPgXRR4Xq37Z0j4r7g1SgEEzwxA57d
emyPxgcYxn/eR44/KJ4EBs+lVDR3veyJm+kXQ99b21/+jh5Xos1AnX5iItreGCc=
-----END CERTIFICATE-----
";

/// TLS version the policy is capped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// What a client observed about a finished TLS session.
///
/// `cipher_suite` is `None` on the QUIC path, where the negotiated suite is
/// not surfaced; there the offer itself is restricted to [`TLS13_SAFE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSummary {
    pub version: TlsVersion,
    pub cipher_suite: Option<u16>,
}

/// Structured classification of a TLS-level request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureKind {
    /// Handshake alert, version or suite incompatibility.
    Handshake,
    /// The peer sent a message we could not decode or decrypt.
    Decode,
}

/// What a TLS 1.2 failure transition asks the transport to do besides
/// rebuilding.
pub(crate) struct FailureOutcome {
    pub rebuild: bool,
    pub reset_counter: bool,
}

pub struct TlsPolicy {
    pub(crate) max_version: TlsVersion,
    pub(crate) cipher_suites: Option<Vec<u16>>,
    pub(crate) keep_cipher_suite: bool,
    /// Position in the failure-handling state machine (0..=4).
    pub(crate) handle_error: u8,
    disable_session_tickets: bool,
    key_log_file: Option<PathBuf>,
    root_ca_file: Option<PathBuf>,
    client_cert_file: Option<PathBuf>,
    client_key_file: Option<PathBuf>,
}

impl TlsPolicy {
    pub fn new(config: &TransportConfig) -> Self {
        let cipher_suites = config
            .tls_cipher_suite
            .clone()
            .filter(|suites| !suites.is_empty());
        Self {
            max_version: TlsVersion::Tls13,
            keep_cipher_suite: cipher_suites.is_some(),
            // State 3 makes the next rebuild produce a TLS 1.2 policy and
            // arms server-cipher adoption; it only applies when no suite is
            // configured. An explicit list forces TLS 1.2 on its own and
            // must keep the state machine at 0 so failures can recover.
            handle_error: if config.force_tls12 && cipher_suites.is_none() {
                3
            } else {
                0
            },
            cipher_suites,
            disable_session_tickets: config.tls_disable_session_tickets,
            key_log_file: config.tls_key_log_file.clone(),
            root_ca_file: config.root_ca_file.clone(),
            client_cert_file: config.client_cert_file.clone(),
            client_key_file: config.client_key_file.clone(),
        }
    }

    /// Builds the client config for the HTTP/1.1+H2 client, applying the
    /// cipher-suite policy. May downgrade `max_version` and rewrite the
    /// configured suites as a side effect; the caller rebuilds its clients
    /// from the result.
    pub(crate) fn build_client_config(&mut self) -> Result<ClientConfig> {
        self.apply_cipher_policy();

        let offered = if self.keep_cipher_suite {
            self.cipher_suites.clone()
        } else {
            None
        };
        let mut provider = rustls::crypto::ring::default_provider();
        if let Some(offered) = &offered {
            provider
                .cipher_suites
                .retain(|suite| offered.contains(&u16::from(suite.suite())));
        }

        let versions: &[&rustls::SupportedProtocolVersion] = match self.max_version {
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
            TlsVersion::Tls12 => &[&rustls::version::TLS12],
        };

        let builder = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(versions)?
            .with_root_certificates(self.root_store()?);
        let mut config = match self.load_client_auth()? {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = vec![b"h2".to_vec()];
        self.apply_session_policy(&mut config)?;
        Ok(config)
    }

    /// Builds the client config for the QUIC client. QUIC is TLS 1.3 only;
    /// the offer is restricted to [`TLS13_SAFE`] so anything negotiated is
    /// acceptable by construction.
    pub(crate) fn build_h3_client_config(&self) -> Result<ClientConfig> {
        let mut provider = rustls::crypto::ring::default_provider();
        provider
            .cipher_suites
            .retain(|suite| TLS13_SAFE.contains(&u16::from(suite.suite())));

        let builder = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(self.root_store()?);
        let mut config = match self.load_client_auth()? {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = vec![b"h3".to_vec()];
        config.enable_early_data = true;
        self.apply_session_policy(&mut config)?;
        Ok(config)
    }

    /// Resolves the interactions between the configured suites and the
    /// version cap, mirroring what the next handshake will be allowed to do.
    fn apply_cipher_policy(&mut self) {
        self.max_version = if self.handle_error == 3 {
            TlsVersion::Tls12
        } else {
            TlsVersion::Tls13
        };
        if !self.keep_cipher_suite {
            return;
        }
        if let Some(suites) = self.cipher_suites.as_mut() {
            suites.retain(|id| {
                let secure = TLS_SECURE.contains(id);
                if !secure {
                    warn!("removing insecure cipher suite {id} from the configured list");
                }
                secure
            });
            let tls13_only = suites.iter().all(|id| TLS13_SUITES.contains(id));
            if !tls13_only {
                info!("explicit cipher suite configured, downgrading to TLS 1.2");
                self.max_version = TlsVersion::Tls12;
            } else {
                warn!("configured cipher suites are unsupported with TLS 1.2, using the default set");
                *suites = default_tls12_cipher_suites();
                self.handle_error = 2;
                self.max_version = TlsVersion::Tls12;
            }
        } else if self.handle_error == 0 {
            self.handle_error = 2;
            self.max_version = TlsVersion::Tls12;
        }
    }

    fn apply_session_policy(&self, config: &mut ClientConfig) -> Result<()> {
        if self.disable_session_tickets {
            config.resumption = Resumption::disabled();
        } else {
            config.resumption = Resumption::store(Arc::new(ClientSessionMemoryCache::new(10)));
        }
        if let Some(path) = &self.key_log_file {
            config.key_log = Arc::new(KeyLogWriter::open(path)?);
        }
        Ok(())
    }

    /// System roots, plus the embedded ISRG Root X1, plus the optional
    /// configured extra CA bundle.
    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();

        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!("native root store: {err}");
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        if ignored > 0 {
            warn!("failed to parse {ignored} certificate(s) from the native root store");
        }
        if added == 0 {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        for cert in rustls_pemfile::certs(&mut ISRG_ROOT_X1_PEM.as_bytes()) {
            roots.add(cert.map_err(TransportError::Io)?)?;
        }

        if let Some(path) = &self.root_ca_file {
            let pem = std::fs::read(path).map_err(|err| {
                TransportError::Config(format!("unable to read root CA file [{}]: {err}", path.display()))
            })?;
            let mut extra = 0;
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                roots.add(cert.map_err(TransportError::Io)?)?;
                extra += 1;
            }
            if extra == 0 {
                return Err(TransportError::Config(format!(
                    "no valid certificates found in root CA file [{}]",
                    path.display()
                )));
            }
        }
        Ok(roots)
    }

    #[allow(clippy::type_complexity)]
    fn load_client_auth(
        &self,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        let (Some(cert_path), Some(key_path)) = (&self.client_cert_file, &self.client_key_file)
        else {
            return Ok(None);
        };
        let cert_pem = std::fs::read(cert_path).map_err(|err| {
            TransportError::Config(format!(
                "unable to read client certificate [{}]: {err}",
                cert_path.display()
            ))
        })?;
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(TransportError::Io)?;
        let key_pem = std::fs::read(key_path).map_err(|err| {
            TransportError::Config(format!(
                "unable to read client key [{}]: {err}",
                key_path.display()
            ))
        })?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(TransportError::Io)?
            .ok_or_else(|| {
                TransportError::Config(format!(
                    "no private key found in [{}]",
                    key_path.display()
                ))
            })?;
        Ok(Some((certs, key)))
    }

    /// TLS 1.3 handshake failure: arm the TLS 1.2 downgrade. Without an
    /// explicit suite we move to adopt-server-suite mode (state 3), with one
    /// we fall back to filtering the configured list (state 4).
    ///
    /// Returns whether the transport must rebuild.
    pub(crate) fn note_tls13_failure(&mut self) -> bool {
        if self.handle_error != 0 {
            return false;
        }
        self.handle_error = if self.cipher_suites.is_none() { 3 } else { 4 };
        self.keep_cipher_suite = true;
        true
    }

    /// TLS 1.2 failure transitions, keyed on the current state.
    pub(crate) fn note_tls12_failure(&mut self, has_tls_connected: u8) -> FailureOutcome {
        let mut reset_counter = false;
        match self.handle_error {
            0 => {
                warn!("configured TLS 1.2 cipher suite failed, adding the default suites");
                self.handle_error = 1;
                self.cipher_suites = Some(default_tls12_cipher_suites());
                self.keep_cipher_suite = true;
            }
            1 => {
                if has_tls_connected < 3 {
                    info!("TLS 1.2 cipher suites failed, upgrading back to TLS 1.3");
                    self.handle_error = 0;
                    self.keep_cipher_suite = false;
                }
            }
            2 => {
                info!("adopted server cipher suite failed, adding the default TLS 1.2 suites");
                self.handle_error = 1;
                self.cipher_suites = Some(default_tls12_cipher_suites());
                self.keep_cipher_suite = true;
                reset_counter = true;
            }
            3 => {
                // Adoption needs an observed cipher, which a failed request
                // does not carry; the next safe response will adopt instead.
                warn!("no cipher suite configured and the server suite is not observable on a failed request");
            }
            4 => {
                warn!(
                    "TLS handshake failure with cipher suites {:?}, falling back to the default set",
                    self.cipher_suites
                );
                self.cipher_suites = Some(default_tls12_cipher_suites());
                self.keep_cipher_suite = true;
            }
            _ => {
                warn!(
                    "TLS handshake failure with cipher suites {:?}",
                    self.cipher_suites
                );
            }
        }
        FailureOutcome {
            rebuild: true,
            reset_counter,
        }
    }

    /// Success-path adoption: with no configured suite and state 3, pin the
    /// cipher the server actually negotiated as the sole offer.
    ///
    /// Returns whether the transport must rebuild.
    pub(crate) fn adopt_server_cipher(&mut self, cipher: u16) -> bool {
        if self.cipher_suites.is_some() || self.handle_error != 3 {
            return false;
        }
        self.cipher_suites = Some(vec![cipher]);
        self.keep_cipher_suite = true;
        self.handle_error = 2;
        info!("no cipher suite configured, adopting the server's suite [{cipher}]");
        true
    }
}

/// Classifies a request error as a TLS failure, looking through the IO
/// wrapping that `tokio-rustls` applies.
pub(crate) fn classify_failure(err: &TransportError) -> Option<TlsFailureKind> {
    match err {
        TransportError::TlsHandshake => Some(TlsFailureKind::Handshake),
        TransportError::Tls(err) => classify_rustls(err),
        TransportError::Io(err) => err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .and_then(classify_rustls),
        _ => None,
    }
}

fn classify_rustls(err: &rustls::Error) -> Option<TlsFailureKind> {
    use rustls::AlertDescription;
    match err {
        rustls::Error::AlertReceived(
            AlertDescription::HandshakeFailure
            | AlertDescription::ProtocolVersion
            | AlertDescription::InsufficientSecurity
            | AlertDescription::IllegalParameter,
        ) => Some(TlsFailureKind::Handshake),
        rustls::Error::PeerIncompatible(_) => Some(TlsFailureKind::Handshake),
        rustls::Error::NoApplicationProtocol => Some(TlsFailureKind::Handshake),
        rustls::Error::InvalidMessage(_) | rustls::Error::DecryptError => {
            Some(TlsFailureKind::Decode)
        }
        _ => None,
    }
}

/// NSS-format key log, for decrypting captures during debugging.
#[derive(Debug)]
struct KeyLogWriter {
    file: Mutex<File>,
}

impl KeyLogWriter {
    fn open(path: &PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                TransportError::Config(format!(
                    "unable to open key log file [{}]: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl rustls::KeyLog for KeyLogWriter {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "{label} {} {}",
                hex::encode(client_random),
                hex::encode(secret)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(config: &TransportConfig) -> TlsPolicy {
        TlsPolicy::new(config)
    }

    /// A fresh policy offers TLS 1.3 and no explicit suites.
    #[test]
    fn default_policy() {
        let mut p = policy(&TransportConfig::default());
        p.apply_cipher_policy();
        assert_eq!(p.max_version, TlsVersion::Tls13);
        assert!(p.cipher_suites.is_none());
        assert!(!p.keep_cipher_suite);
        assert_eq!(p.handle_error, 0);
    }

    /// An explicit list with any non-TLS1.3 entry forces TLS 1.2 and drops
    /// the insecure entries.
    #[test]
    fn mixed_explicit_suites_downgrade() {
        let mut p = policy(&TransportConfig {
            tls_cipher_suite: Some(vec![49200, 4865, 10]),
            ..TransportConfig::default()
        });
        p.apply_cipher_policy();
        assert_eq!(p.max_version, TlsVersion::Tls12);
        assert_eq!(p.cipher_suites, Some(vec![49200, 4865]));
        assert_eq!(p.handle_error, 0);
    }

    /// A TLS1.3-only explicit list cannot drive a TLS 1.2 handshake; the
    /// default TLS 1.2 set is substituted and state 2 recorded.
    #[test]
    fn tls13_only_suites_replaced_with_defaults() {
        let mut p = policy(&TransportConfig {
            tls_cipher_suite: Some(vec![4865, 4866]),
            ..TransportConfig::default()
        });
        p.apply_cipher_policy();
        assert_eq!(p.max_version, TlsVersion::Tls12);
        assert_eq!(p.cipher_suites, Some(default_tls12_cipher_suites()));
        assert_eq!(p.handle_error, 2);
    }

    /// `force_tls12` starts the policy in state 3, which rebuilds as TLS 1.2.
    #[test]
    fn force_tls12_starts_downgraded() {
        let mut p = policy(&TransportConfig {
            force_tls12: true,
            ..TransportConfig::default()
        });
        assert_eq!(p.handle_error, 3);
        p.apply_cipher_policy();
        assert_eq!(p.max_version, TlsVersion::Tls12);
    }

    /// With an explicit suite list, `force_tls12` leaves the state machine
    /// at 0: the list itself drives the TLS 1.2 downgrade, and state 0 is
    /// what lets a failing suite recover onto the default set.
    #[test]
    fn force_tls12_with_explicit_suites_keeps_state_zero() {
        let mut p = policy(&TransportConfig {
            force_tls12: true,
            tls_cipher_suite: Some(vec![49200]),
            ..TransportConfig::default()
        });
        assert_eq!(p.handle_error, 0);
        assert!(p.keep_cipher_suite);
        p.apply_cipher_policy();
        assert_eq!(p.max_version, TlsVersion::Tls12);
        assert_eq!(p.handle_error, 0);

        // A TLS 1.2 failure in state 0 swaps in the default suites.
        let outcome = p.note_tls12_failure(0);
        assert!(outcome.rebuild);
        assert_eq!(p.handle_error, 1);
        assert_eq!(p.cipher_suites, Some(default_tls12_cipher_suites()));
    }

    /// First TLS 1.3 failure without configured suites arms adoption mode.
    #[test]
    fn tls13_failure_without_suites() {
        let mut p = policy(&TransportConfig::default());
        assert!(p.note_tls13_failure());
        assert_eq!(p.handle_error, 3);
        assert!(p.keep_cipher_suite);
        p.apply_cipher_policy();
        assert_eq!(p.max_version, TlsVersion::Tls12);
        // A second failure in a non-zero state does not restart the machine.
        assert!(!p.note_tls13_failure());
    }

    /// First TLS 1.3 failure with configured suites moves to cipher fallback.
    #[test]
    fn tls13_failure_with_suites() {
        let mut p = policy(&TransportConfig {
            tls_cipher_suite: Some(vec![49200]),
            ..TransportConfig::default()
        });
        assert!(p.note_tls13_failure());
        assert_eq!(p.handle_error, 4);
    }

    /// State 1 upgrades back to TLS 1.3 only before three safe connections
    /// have been observed.
    #[test]
    fn tls12_failure_state_machine() {
        let mut p = policy(&TransportConfig::default());

        p.handle_error = 0;
        p.keep_cipher_suite = true;
        let outcome = p.note_tls12_failure(0);
        assert!(outcome.rebuild);
        assert_eq!(p.handle_error, 1);
        assert_eq!(p.cipher_suites, Some(default_tls12_cipher_suites()));

        // Few successes observed: upgrade back to 1.3.
        let _ = p.note_tls12_failure(1);
        assert_eq!(p.handle_error, 0);
        assert!(!p.keep_cipher_suite);

        // With an established track record the suites stay pinned.
        p.handle_error = 1;
        p.keep_cipher_suite = true;
        let _ = p.note_tls12_failure(5);
        assert_eq!(p.handle_error, 1);
        assert!(p.keep_cipher_suite);
    }

    /// A failed adopted cipher falls back to the default list and asks for
    /// the success counter to be reset.
    #[test]
    fn adopted_cipher_failure_resets_counter() {
        let mut p = policy(&TransportConfig::default());
        p.handle_error = 2;
        p.keep_cipher_suite = true;
        p.cipher_suites = Some(vec![49200]);
        let outcome = p.note_tls12_failure(5);
        assert!(outcome.reset_counter);
        assert_eq!(p.handle_error, 1);
        assert_eq!(p.cipher_suites, Some(default_tls12_cipher_suites()));
    }

    /// State 4 replaces the explicit list with the defaults.
    #[test]
    fn explicit_suite_failure_uses_defaults() {
        let mut p = policy(&TransportConfig {
            tls_cipher_suite: Some(vec![49195]),
            ..TransportConfig::default()
        });
        p.handle_error = 4;
        let _ = p.note_tls12_failure(0);
        assert_eq!(p.cipher_suites, Some(default_tls12_cipher_suites()));
        assert!(p.keep_cipher_suite);
    }

    /// Adoption only happens in state 3 with no configured suites.
    #[test]
    fn server_cipher_adoption() {
        let mut p = policy(&TransportConfig::default());
        p.handle_error = 3;
        assert!(p.adopt_server_cipher(49200));
        assert_eq!(p.cipher_suites, Some(vec![49200]));
        assert_eq!(p.handle_error, 2);
        assert!(p.keep_cipher_suite);
        // Already configured: no second adoption.
        assert!(!p.adopt_server_cipher(49199));
    }

    /// The built config advertises h2 and parses the embedded root.
    #[test]
    fn builds_h2_client_config() {
        let mut p = policy(&TransportConfig::default());
        let config = p.build_client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(p.max_version, TlsVersion::Tls13);
    }

    /// The QUIC config advertises h3 and enables early data.
    #[test]
    fn builds_h3_client_config() {
        let p = policy(&TransportConfig::default());
        let config = p.build_h3_client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec()]);
        assert!(config.enable_early_data);
    }

    /// Synthetic handshake errors and rustls alerts classify as handshake
    /// failures; decode problems classify separately.
    #[test]
    fn failure_classification() {
        assert_eq!(
            classify_failure(&TransportError::TlsHandshake),
            Some(TlsFailureKind::Handshake)
        );
        assert_eq!(
            classify_failure(&TransportError::Tls(rustls::Error::AlertReceived(
                rustls::AlertDescription::HandshakeFailure
            ))),
            Some(TlsFailureKind::Handshake)
        );
        assert_eq!(
            classify_failure(&TransportError::Tls(rustls::Error::DecryptError)),
            Some(TlsFailureKind::Decode)
        );
        let wrapped = TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::ProtocolVersion),
        ));
        assert_eq!(classify_failure(&wrapped), Some(TlsFailureKind::Handshake));
        assert_eq!(classify_failure(&TransportError::HttpStatus(502)), None);
    }
}
