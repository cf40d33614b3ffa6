use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::transmit::{MAX_SERVERS, Servers, TransmitPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// 缓存区字节数，缺省 1_000_000（初始化时会被限制在 100..=1e9）。
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// 上游服务器，最多16个。
    #[serde(default = "default_servers")]
    pub servers: Vec<Ipv4Addr>,
    /// 上游端口，缺省53。
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// 本地绑定地址，缺省 0.0.0.0。
    #[serde(default = "default_local_ip")]
    pub local_ip: Ipv4Addr,
    /// 四轮UDP超时（秒）。
    #[serde(default = "default_udp_timeouts_secs")]
    pub udp_timeouts_secs: [u64; 4],
    /// TCP连接与应答各自的超时（秒）。
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,
    /// 随机源端口的尝试次数，失败后改用系统分配的端口。
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,
    /// 合并池大小（同时进行的上游查询数）。
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// `lookup` 命令未指定文件时使用的数据库路径。
    #[serde(default)]
    pub data_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            servers: default_servers(),
            server_port: default_server_port(),
            local_ip: default_local_ip(),
            udp_timeouts_secs: default_udp_timeouts_secs(),
            tcp_timeout_secs: default_tcp_timeout_secs(),
            bind_attempts: default_bind_attempts(),
            max_inflight: default_max_inflight(),
            data_path: None,
        }
    }
}

impl Settings {
    pub fn transmit_policy(&self) -> TransmitPolicy {
        TransmitPolicy {
            port: self.server_port,
            local_ip: self.local_ip,
            udp_timeouts: self.udp_timeouts_secs.map(Duration::from_secs),
            tcp_timeout: Duration::from_secs(self.tcp_timeout_secs),
            bind_attempts: self.bind_attempts,
        }
    }

    pub fn server_list(&self) -> Servers {
        Servers::from_slice(&self.servers)
    }

    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("settings.servers is empty");
        }
        if self.servers.len() > MAX_SERVERS {
            anyhow::bail!(
                "settings.servers lists {} servers, at most {} are used",
                self.servers.len(),
                MAX_SERVERS
            );
        }
        if let Some(ip) = self.servers.iter().find(|ip| ip.is_unspecified()) {
            anyhow::bail!("settings.servers contains unspecified address {ip}");
        }
        if self.udp_timeouts_secs.contains(&0) || self.tcp_timeout_secs == 0 {
            anyhow::bail!("timeouts must be at least one second");
        }
        if self.max_inflight == 0 {
            anyhow::bail!("settings.max_inflight must be positive");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: EngineConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    cfg.settings
        .validate()
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(cfg)
}


fn default_cache_size() -> usize {
    1_000_000
}

fn default_servers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::LOCALHOST]
}

fn default_server_port() -> u16 {
    53
}

fn default_local_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_udp_timeouts_secs() -> [u64; 4] {
    [1, 3, 11, 45]
}

fn default_tcp_timeout_secs() -> u64 {
    10
}

fn default_bind_attempts() -> u32 {
    10
}

fn default_max_inflight() -> usize {
    220
}
