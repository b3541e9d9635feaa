//! In-process fakes shared by the unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::ssh_key::certificate::{Builder as CertificateBuilder, CertType};
use russh::keys::signature::Signer as _;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Signature;
use russh::keys::{Algorithm, Certificate, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::DuplexStream;

use super::client_application::{ClientApplication, ClusterClient, SessionSshCert};
use super::dialer::{BoxedStream, ClusterDetails, ProxyClient, ProxyClientConfig, ProxyTransport};
use super::error::VnetError;
use super::provider::{parse_ssh_certificate, ClientTlsConfig, DigestSigner, SshProvider, UserSshConfig};
use super::remote_provider::ClientApplicationService;
use super::types::{ClusterConfig, DialOptions, SignOptions, SignRequest, SshInfo, SshKey};

pub const TEST_CIDR: &str = "100.64.0.0/10";

/// OpenSSH user certificate for `username` and the key it certifies
pub fn issue_user_cert(username: &str) -> (String, PrivateKey) {
    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();

    let mut builder = CertificateBuilder::new_with_random_nonce(
        &mut OsRng,
        key.public_key().key_data().clone(),
        0,
        // Certificate timestamps must fit in an i64
        4_000_000_000,
    )
    .unwrap();
    builder.serial(1).unwrap();
    builder.key_id(format!("{username}@test")).unwrap();
    builder.cert_type(CertType::User).unwrap();
    builder.valid_principal(username).unwrap();
    let cert = builder.sign(&ca).unwrap();

    (cert.to_openssh().unwrap(), key)
}

pub fn user_ssh_config(username: &str) -> UserSshConfig {
    let (cert, key) = issue_user_cert(username);
    let certificate = parse_ssh_certificate(cert.as_bytes()).unwrap();
    UserSshConfig::with_key(username, certificate, key)
}

pub fn sample_ssh_info() -> SshInfo {
    SshInfo {
        ssh_key: SshKey {
            profile: "example.com".to_string(),
            leaf_cluster: String::new(),
            hostname: "host".to_string(),
        },
        cluster: "example.com".to_string(),
        ipv4_cidr_range: TEST_CIDR.to_string(),
        dial_options: DialOptions {
            web_proxy_addr: "example.com:443".to_string(),
            ..Default::default()
        },
    }
}

struct NullSigner;

#[async_trait]
impl DigestSigner for NullSigner {
    async fn sign(&self, _digest: &[u8], _opts: SignOptions) -> Result<Vec<u8>, VnetError> {
        Ok(Vec::new())
    }
}

fn tls_config() -> ClientTlsConfig {
    ClientTlsConfig {
        certificate_der: vec![0x30],
        signer: Arc::new(NullSigner),
        server_name: None,
        insecure_skip_verify: false,
        root_cas_pem: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Cluster side
// ---------------------------------------------------------------------------

pub struct FakeClusterClient {
    name: String,
    root_name: String,
    leaves: Vec<String>,
    fail_leaf_list: bool,
    fail_vnet_config: AtomicBool,
    vnet_config_calls: AtomicUsize,
}

impl FakeClusterClient {
    pub fn root(name: &str, leaves: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            root_name: name.to_string(),
            leaves,
            fail_leaf_list: false,
            fail_vnet_config: AtomicBool::new(false),
            vnet_config_calls: AtomicUsize::new(0),
        }
    }

    pub fn leaf(name: &str, root_name: &str) -> Self {
        Self {
            root_name: root_name.to_string(),
            ..Self::root(name, Vec::new())
        }
    }

    pub fn failing_leaf_list(mut self) -> Self {
        self.fail_leaf_list = true;
        self
    }

    pub fn failing_vnet_config(self) -> Self {
        self.fail_vnet_config(true);
        self
    }

    pub fn fail_vnet_config(&self, fail: bool) {
        self.fail_vnet_config.store(fail, Ordering::SeqCst);
    }

    pub fn vnet_config_calls(&self) -> usize {
        self.vnet_config_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    fn cluster_name(&self) -> &str {
        &self.name
    }

    fn root_cluster_name(&self) -> &str {
        &self.root_name
    }

    async fn leaf_clusters(&self) -> Result<Vec<String>, VnetError> {
        if self.fail_leaf_list {
            return Err(VnetError::Rpc("listing leaf clusters: access denied".into()));
        }
        Ok(self.leaves.clone())
    }

    async fn vnet_config(&self) -> Result<ClusterConfig, VnetError> {
        self.vnet_config_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_vnet_config.load(Ordering::SeqCst) {
            return Err(VnetError::Rpc("cluster unreachable".into()));
        }
        Ok(ClusterConfig {
            cluster_name: self.name.clone(),
            ipv4_cidr_range: TEST_CIDR.to_string(),
            dns_zones: Vec::new(),
        })
    }
}

/// Profiles in insertion order. A broken profile has no usable client.
#[derive(Default)]
pub struct FakeClientApplication {
    profiles: Vec<String>,
    roots: HashMap<String, Arc<FakeClusterClient>>,
    invalid_ports: Mutex<Vec<u16>>,
}

impl FakeClientApplication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, name: &str, leaves: Vec<String>) -> Self {
        self.with_root_client(name, FakeClusterClient::root(name, leaves))
    }

    pub fn with_root_client(mut self, name: &str, client: FakeClusterClient) -> Self {
        self.profiles.push(name.to_string());
        self.roots.insert(name.to_string(), Arc::new(client));
        self
    }

    pub fn with_broken_profile(mut self, name: &str) -> Self {
        self.profiles.push(name.to_string());
        self
    }

    pub fn invalid_ports(&self) -> Vec<u16> {
        self.invalid_ports.lock().clone()
    }
}

#[async_trait]
impl ClientApplication for FakeClientApplication {
    fn list_profiles(&self) -> Result<Vec<String>, VnetError> {
        Ok(self.profiles.clone())
    }

    async fn get_cached_client(
        &self,
        profile: &str,
        leaf_cluster: &str,
    ) -> Result<Arc<dyn ClusterClient>, VnetError> {
        let root = self
            .roots
            .get(profile)
            .ok_or_else(|| VnetError::NotFound(format!("no credentials for profile {profile}")))?;
        if leaf_cluster.is_empty() {
            return Ok(root.clone());
        }
        if root.leaves.iter().any(|leaf| leaf == leaf_cluster) {
            return Ok(Arc::new(FakeClusterClient::leaf(leaf_cluster, &root.name)));
        }
        Err(VnetError::NotFound(format!("leaf cluster {leaf_cluster}")))
    }

    async fn get_dial_options(&self, profile: &str) -> Result<DialOptions, VnetError> {
        Ok(DialOptions {
            web_proxy_addr: format!("{profile}:443"),
            ..Default::default()
        })
    }

    async fn teleport_client_tls_config(
        &self,
        _profile: &str,
        _cluster: &str,
    ) -> Result<ClientTlsConfig, VnetError> {
        Ok(tls_config())
    }

    async fn session_ssh_cert(
        &self,
        _ssh_info: &SshInfo,
        username: &str,
    ) -> Result<SessionSshCert, VnetError> {
        let (cert, private_key) = issue_user_cert(username);
        Ok(SessionSshCert {
            certificate: cert.into_bytes(),
            private_key,
        })
    }

    async fn on_invalid_local_port(
        &self,
        _ssh_info: &SshInfo,
        local_port: u16,
    ) -> Result<(), VnetError> {
        self.invalid_ports.lock().push(local_port);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Resolves `*.example.com` and issues a fresh certificate on every call
#[derive(Default)]
pub struct FakeSshProvider {
    user_config_calls: AtomicUsize,
    fail_user_config: AtomicBool,
    tls_requests: Mutex<Vec<(String, String)>>,
    invalid_ports: Mutex<Vec<u16>>,
    fail_invalid_port_notification: AtomicBool,
}

impl FakeSshProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_config_calls(&self) -> usize {
        self.user_config_calls.load(Ordering::SeqCst)
    }

    pub fn fail_user_config(&self, fail: bool) {
        self.fail_user_config.store(fail, Ordering::SeqCst);
    }

    pub fn fail_invalid_port_notification(&self, fail: bool) {
        self.fail_invalid_port_notification.store(fail, Ordering::SeqCst);
    }

    pub fn tls_requests(&self) -> Vec<(String, String)> {
        self.tls_requests.lock().clone()
    }

    pub fn invalid_ports(&self) -> Vec<u16> {
        self.invalid_ports.lock().clone()
    }
}

#[async_trait]
impl SshProvider for FakeSshProvider {
    async fn resolve_ssh_info(&self, fqdn: &str) -> Result<SshInfo, VnetError> {
        let name = fqdn.trim_end_matches('.');
        let Some(hostname) = name.strip_suffix(".example.com") else {
            return Err(VnetError::NoTcpHandler);
        };
        let mut info = sample_ssh_info();
        info.ssh_key.hostname = hostname.to_string();
        Ok(info)
    }

    async fn teleport_client_tls_config(
        &self,
        profile: &str,
        cluster: &str,
    ) -> Result<ClientTlsConfig, VnetError> {
        self.tls_requests
            .lock()
            .push((profile.to_string(), cluster.to_string()));
        Ok(tls_config())
    }

    async fn user_ssh_config(
        &self,
        _ssh_info: &SshInfo,
        username: &str,
    ) -> Result<UserSshConfig, VnetError> {
        self.user_config_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_user_config.load(Ordering::SeqCst) {
            return Err(VnetError::CredentialIssuance("access denied".into()));
        }
        Ok(user_ssh_config(username))
    }

    async fn on_invalid_local_port(
        &self,
        _ssh_info: &SshInfo,
        local_port: u16,
    ) -> Result<(), VnetError> {
        self.invalid_ports.lock().push(local_port);
        if self.fail_invalid_port_notification.load(Ordering::SeqCst) {
            return Err(VnetError::Rpc("notification service unavailable".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote key holder
// ---------------------------------------------------------------------------

/// Client application service on the other side of the RPC boundary. It keeps
/// the key of the last certificate issued per username and signs with it.
#[derive(Default)]
pub struct FakeAppService {
    keys: Mutex<HashMap<String, PrivateKey>>,
    ssh_signs: Mutex<Vec<(SshKey, String, SignRequest)>>,
    mtls_signs: Mutex<Vec<(String, SignRequest)>>,
}

impl FakeAppService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ssh_signs(&self) -> Vec<(SshKey, String, SignRequest)> {
        self.ssh_signs.lock().clone()
    }

    pub fn mtls_signs(&self) -> Vec<(String, SignRequest)> {
        self.mtls_signs.lock().clone()
    }
}

#[async_trait]
impl ClientApplicationService for FakeAppService {
    /// `*.example.com` resolves, `*.gone.test` belongs to a profile that is
    /// no longer logged in, anything else is not ours.
    async fn resolve_ssh_info(&self, fqdn: &str) -> Result<SshInfo, VnetError> {
        if fqdn.ends_with(".example.com.") {
            Ok(sample_ssh_info())
        } else if fqdn.ends_with(".gone.test.") {
            Err(VnetError::NotFound("profile gone.test".into()))
        } else {
            Err(VnetError::NoTcpHandler)
        }
    }

    async fn reissue_ssh_cert(&self, _: &SshInfo, username: &str) -> Result<Vec<u8>, VnetError> {
        let (cert, key) = issue_user_cert(username);
        self.keys.lock().insert(username.to_string(), key);
        Ok(cert.into_bytes())
    }

    async fn sign_for_ssh(
        &self,
        ssh_key: &SshKey,
        username: &str,
        request: SignRequest,
    ) -> Result<Vec<u8>, VnetError> {
        self.ssh_signs
            .lock()
            .push((ssh_key.clone(), username.to_string(), request.clone()));
        let keys = self.keys.lock();
        let key = keys
            .get(username)
            .ok_or_else(|| VnetError::NotFound(format!("no key for {username}")))?;
        let signature: Signature = key
            .try_sign(&request.digest)
            .map_err(|e| VnetError::Rpc(e.to_string()))?;
        Ok(signature.as_bytes().to_vec())
    }

    async fn user_mtls_cert(&self, profile: &str) -> Result<Vec<u8>, VnetError> {
        if profile == "example.com" {
            Ok(vec![0x30, 0x82])
        } else {
            Err(VnetError::NotFound(format!("profile {profile}")))
        }
    }

    async fn sign_for_user_mtls(
        &self,
        profile: &str,
        request: SignRequest,
    ) -> Result<Vec<u8>, VnetError> {
        self.mtls_signs.lock().push((profile.to_string(), request));
        Ok(vec![1])
    }

    async fn on_invalid_local_port(&self, _: &SshInfo, _: u16) -> Result<(), VnetError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport and target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRecord {
    pub proxy_address: String,
    pub target_addr: String,
    pub cluster: String,
    pub insecure_skip_verify: bool,
}

type ServeFn = Arc<dyn Fn(DuplexStream) + Send + Sync>;

enum TransportMode {
    /// Hand out streams and keep the far ends open, unserved
    Accepting,
    Failing,
    /// Run a target on the far end of every stream
    Serving(ServeFn),
}

struct TransportState {
    mode: TransportMode,
    request_tls_config: bool,
    dead_dials: AtomicUsize,
    dials: Mutex<Vec<DialRecord>>,
    peers: Mutex<Vec<DuplexStream>>,
}

pub struct FakeTransport {
    state: Arc<TransportState>,
}

impl FakeTransport {
    fn with_mode(mode: TransportMode) -> Self {
        Self {
            state: Arc::new(TransportState {
                mode,
                request_tls_config: false,
                dead_dials: AtomicUsize::new(0),
                dials: Mutex::new(Vec::new()),
                peers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn accepting() -> Self {
        Self::with_mode(TransportMode::Accepting)
    }

    pub fn failing() -> Self {
        Self::with_mode(TransportMode::Failing)
    }

    pub fn serving<F>(serve: F) -> Self
    where
        F: Fn(DuplexStream) + Send + Sync + 'static,
    {
        Self::with_mode(TransportMode::Serving(Arc::new(serve)))
    }

    /// Every dial goes to the in-process test target
    pub fn to_target(target: TestTarget) -> Self {
        Self::serving(move |stream| target.spawn(stream))
    }

    /// Ask the dialer for the cluster's mTLS config on every dial
    pub fn requesting_tls_config(self) -> Self {
        self.rebuild(|state| state.request_tls_config = true)
    }

    /// The first `count` dials return streams whose far end is already gone
    pub fn with_dead_dials(self, count: usize) -> Self {
        self.rebuild(|state| state.dead_dials = AtomicUsize::new(count))
    }

    fn rebuild(self, f: impl FnOnce(&mut TransportState)) -> Self {
        let mut state = match Arc::try_unwrap(self.state) {
            Ok(state) => state,
            Err(_) => panic!("configure the transport before sharing it"),
        };
        f(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn dials(&self) -> Vec<DialRecord> {
        self.state.dials.lock().clone()
    }

    /// Far ends of the streams handed out in accepting mode
    pub fn take_peers(&self) -> Vec<DuplexStream> {
        std::mem::take(&mut *self.state.peers.lock())
    }
}

#[async_trait]
impl ProxyTransport for FakeTransport {
    async fn new_client(&self, config: ProxyClientConfig) -> Result<Box<dyn ProxyClient>, VnetError> {
        Ok(Box::new(FakeProxyClient {
            config,
            state: self.state.clone(),
        }))
    }
}

struct FakeProxyClient {
    config: ProxyClientConfig,
    state: Arc<TransportState>,
}

#[async_trait]
impl ProxyClient for FakeProxyClient {
    async fn dial_host(
        &self,
        target_addr: &str,
        cluster: &str,
    ) -> Result<(BoxedStream, ClusterDetails), VnetError> {
        self.state.dials.lock().push(DialRecord {
            proxy_address: self.config.proxy_address.clone(),
            target_addr: target_addr.to_string(),
            cluster: cluster.to_string(),
            insecure_skip_verify: self.config.insecure_skip_verify,
        });
        if self.state.request_tls_config {
            (self.config.tls_config)(cluster.to_string()).await?;
        }

        let (stream, peer) = tokio::io::duplex(64 * 1024);
        let dead = self
            .state
            .dead_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dead {
            drop(peer);
            return Ok((Box::new(stream), ClusterDetails::default()));
        }

        match &self.state.mode {
            TransportMode::Failing => {
                return Err(VnetError::DialFailed(format!("{target_addr}: connection refused")))
            }
            TransportMode::Accepting => self.state.peers.lock().push(peer),
            TransportMode::Serving(serve) => serve(peer),
        }
        Ok((Box::new(stream), ClusterDetails::default()))
    }
}

/// Port the target reports for a remote forward requested on port 0
pub const FORWARD_BOUND_PORT: u32 = 40000;

/// Minimal SSH node: accepts keys and certificates (or rejects everything),
/// echoes `exec` commands and channel data back. Direct-tcpip channels are
/// echo channels too. A remote forward is answered with one forwarded-tcpip
/// channel that starts with `ping`.
#[derive(Clone)]
pub struct TestTarget {
    config: Arc<server::Config>,
    accept: bool,
    auth_attempts: Arc<AtomicUsize>,
    usernames: Arc<Mutex<Vec<String>>>,
    direct_tcpip: Arc<Mutex<Vec<(String, u32)>>>,
    forwards: Arc<Mutex<Vec<(String, u32)>>>,
}

impl TestTarget {
    pub fn accepting() -> Self {
        Self::new(true)
    }

    pub fn rejecting() -> Self {
        Self::new(false)
    }

    fn new(accept: bool) -> Self {
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let config = server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::ZERO,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            accept,
            auth_attempts: Arc::new(AtomicUsize::new(0)),
            usernames: Arc::new(Mutex::new(Vec::new())),
            direct_tcpip: Arc::new(Mutex::new(Vec::new())),
            forwards: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn auth_attempts(&self) -> usize {
        self.auth_attempts.load(Ordering::SeqCst)
    }

    pub fn usernames(&self) -> Vec<String> {
        self.usernames.lock().clone()
    }

    /// Destinations of the direct-tcpip channels opened so far
    pub fn direct_tcpip(&self) -> Vec<(String, u32)> {
        self.direct_tcpip.lock().clone()
    }

    /// Remote forwards currently bound
    pub fn forwards(&self) -> Vec<(String, u32)> {
        self.forwards.lock().clone()
    }

    pub fn spawn(&self, stream: DuplexStream) {
        let config = self.config.clone();
        let handler = TestTargetHandler {
            target: self.clone(),
        };
        tokio::spawn(async move {
            if let Ok(session) = server::run_stream(config, stream, handler).await {
                let _ = session.await;
            }
        });
    }
}

struct TestTargetHandler {
    target: TestTarget,
}

impl TestTargetHandler {
    fn decide(&self, user: &str) -> Auth {
        self.target.auth_attempts.fetch_add(1, Ordering::SeqCst);
        if self.target.accept {
            self.target.usernames.lock().push(user.to_string());
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }
}

impl server::Handler for TestTargetHandler {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(self.decide(user))
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        _certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        Ok(self.decide(user))
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.target
            .direct_tcpip
            .lock()
            .push((host_to_connect.to_string(), port_to_connect));
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if *port == 0 {
            *port = FORWARD_BOUND_PORT;
        }
        self.target.forwards.lock().push((address.to_string(), *port));

        let handle = session.handle();
        let (address, port) = (address.to_string(), *port);
        tokio::spawn(async move {
            let Ok(mut channel) = handle
                .channel_open_forwarded_tcpip(address, port, "10.0.0.9", 5555)
                .await
            else {
                return;
            };
            if channel.data(&b"ping"[..]).await.is_err() {
                return;
            }
            while channel.wait().await.is_some() {}
        });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let mut forwards = self.target.forwards.lock();
        let before = forwards.len();
        forwards.retain(|(a, p)| !(a == address && *p == port));
        Ok(forwards.len() != before)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        let _ = session.data(channel, CryptoVec::from_slice(data));
        let _ = session.exit_status_request(channel, 0);
        let _ = session.eof(channel);
        let _ = session.close(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.data(channel, CryptoVec::from_slice(data));
        Ok(())
    }
}
