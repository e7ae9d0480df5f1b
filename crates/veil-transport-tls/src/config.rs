use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion,
    crypto::CryptoProvider,
    server::{VerifierBuilderError, WebPkiClientVerifier},
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CHANNEL_CAPACITY: usize = 18 * 1024;
const DEFAULT_READ_CHUNK: usize = 16 * 1024;

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// 会话在握手中扮演的角色。
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 主动发起协商。
    #[default]
    Client,
    /// 等待对端的 ClientHello。
    Server,
}

/// 允许协商的最低协议版本。
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum MinProtocolVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// 加密引擎的不可变配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 进程装配层从 TOML 描述角色、证书与协议策略，引擎在启动时一次性校验并构建 `rustls` 配置；
/// - 测试与嵌入式场景可跳过文件系统，直接以内存中的证书/私钥构造。
///
/// ## 契约（What）
/// - `role`：`client` 或 `server`；
/// - `server_name`：客户端用于 SNI 与证书校验的名称，客户端角色必填；
/// - `ca_file`：PEM 信任根。客户端用它校验服务端；服务端设置后会要求并校验客户端证书；
/// - `cert_file` + `key_file`：本端证书链与私钥（PEM），服务端必填，客户端可选（双向认证）；
/// - `alpn`：按优先级排列的应用层协议；
/// - `min_version`：`"1.2"` 或 `"1.3"`；
/// - `channel_capacity`：会话双工通道每一侧预留的字节数，预留失败会让建会话失败；
/// - `read_chunk_size`：单个解密步骤最多产出的明文字节数。
///
/// ## 注意事项（Trade-offs）
/// - 文件路径在 [`crate::RustlsEngine::create`] 时读取，之后修改文件不会影响已建的引擎；
/// - 私钥不参与 `Debug` 输出之外的任何日志。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsEngineConfig {
    pub role: Role,
    pub server_name: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub alpn: Vec<String>,
    pub min_version: MinProtocolVersion,
    pub channel_capacity: usize,
    pub read_chunk_size: usize,
    #[serde(skip)]
    identity: Option<Identity>,
    #[serde(skip)]
    roots: Vec<CertificateDer<'static>>,
}

impl Default for TlsEngineConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            server_name: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
            alpn: Vec::new(),
            min_version: MinProtocolVersion::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_chunk_size: DEFAULT_READ_CHUNK,
            identity: None,
            roots: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// 引擎配置校验或构建失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("解析 TLS 引擎配置失败: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("客户端角色必须设置 server_name")]
    MissingServerName,
    #[error("server_name `{0}` 不是合法的 DNS 名称或 IP 地址")]
    InvalidServerName(String),
    #[error("客户端角色至少需要一个信任根")]
    MissingTrustRoots,
    #[error("服务端角色必须提供证书链与私钥")]
    MissingIdentity,
    #[error("cert_file 与 key_file 必须同时设置")]
    IncompleteIdentity,
    #[error("读取 PEM 文件 {} 失败: {source}", .path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: rustls_pki_types::pem::Error,
    },
    #[error("PEM 文件 {} 中没有证书", .0.display())]
    EmptyCertificateFile(PathBuf),
    #[error("read_chunk_size 必须大于 0")]
    ZeroReadChunk,
    #[error("rustls 拒绝配置: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("构造客户端证书校验器失败: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

/// 构建完成、可直接创建连接的 `rustls` 配置。
pub(crate) enum BuiltConfig {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server(Arc<ServerConfig>),
}

impl TlsEngineConfig {
    /// 客户端配置，`server_name` 用于 SNI 与证书校验。
    pub fn client(server_name: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            server_name: Some(server_name.into()),
            ..Self::default()
        }
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 以内存中的证书链与私钥作为本端身份，优先于 `cert_file`/`key_file`。
    pub fn with_identity(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.identity = Some(Identity { chain, key });
        self
    }

    /// 追加一个内存中的信任根，与 `ca_file` 中的证书合并使用。
    pub fn with_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.roots.push(cert);
        self
    }

    pub fn with_alpn<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_version(mut self, version: MinProtocolVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_size == 0 {
            return Err(ConfigError::ZeroReadChunk);
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::IncompleteIdentity);
        }
        if self.role == Role::Client && self.server_name.is_none() {
            return Err(ConfigError::MissingServerName);
        }
        Ok(())
    }

    /// 校验并构建 `rustls` 配置，加密原语固定使用 `ring` 提供者。
    pub(crate) fn build(&self) -> Result<BuiltConfig, ConfigError> {
        self.validate()?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = match self.min_version {
            MinProtocolVersion::Tls12 => rustls::ALL_VERSIONS,
            MinProtocolVersion::Tls13 => TLS13_ONLY,
        };
        match self.role {
            Role::Client => self.build_client(provider, versions),
            Role::Server => self.build_server(provider, versions),
        }
    }

    fn build_client(
        &self,
        provider: Arc<CryptoProvider>,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Result<BuiltConfig, ConfigError> {
        let name = self
            .server_name
            .as_deref()
            .ok_or(ConfigError::MissingServerName)?;
        let server_name = ServerName::try_from(name.to_owned())
            .map_err(|_| ConfigError::InvalidServerName(name.to_owned()))?;
        let roots = self.root_store()?;
        if roots.is_empty() {
            return Err(ConfigError::MissingTrustRoots);
        }
        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)?
            .with_root_certificates(roots);
        let mut config = match self.load_identity()? {
            Some(identity) => builder.with_client_auth_cert(identity.chain, identity.key)?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn_wire();
        Ok(BuiltConfig::Client {
            config: Arc::new(config),
            server_name,
        })
    }

    fn build_server(
        &self,
        provider: Arc<CryptoProvider>,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Result<BuiltConfig, ConfigError> {
        let identity = self.load_identity()?.ok_or(ConfigError::MissingIdentity)?;
        let roots = self.root_store()?;
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(versions)?;
        let builder = if roots.is_empty() {
            builder.with_no_client_auth()
        } else {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
            builder.with_client_cert_verifier(verifier)
        };
        let mut config = builder.with_single_cert(identity.chain, identity.key)?;
        config.alpn_protocols = self.alpn_wire();
        Ok(BuiltConfig::Server(Arc::new(config)))
    }

    fn root_store(&self) -> Result<RootCertStore, ConfigError> {
        let mut roots = RootCertStore::empty();
        for cert in &self.roots {
            roots.add(cert.clone())?;
        }
        if let Some(path) = &self.ca_file {
            for cert in load_certificates(path)? {
                roots.add(cert)?;
            }
        }
        Ok(roots)
    }

    fn load_identity(&self) -> Result<Option<Identity>, ConfigError> {
        if let Some(identity) = &self.identity {
            return Ok(Some(identity.clone()));
        }
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                let chain = load_certificates(cert)?;
                let key = PrivateKeyDer::from_pem_file(key).map_err(|source| ConfigError::Pem {
                    path: key.clone(),
                    source,
                })?;
                Ok(Some(Identity { chain, key }))
            }
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteIdentity),
        }
    }

    fn alpn_wire(&self) -> Vec<Vec<u8>> {
        self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem_error = |source| ConfigError::Pem {
        path: path.to_path_buf(),
        source,
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)?;
    if certs.is_empty() {
        return Err(ConfigError::EmptyCertificateFile(path.to_path_buf()));
    }
    Ok(certs)
}
