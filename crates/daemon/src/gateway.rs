//! WireGuard gateway client
//!
//! Typed vocabulary over the remote-execution channel: read the gateway's
//! identity, list the live peer table, add and remove peers. The peer table
//! on the gateway is the authoritative access-control list; mutations are
//! persisted with `wg-quick save` before they are acknowledged.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use wirevend_common::{keygen, Error, Result, ServerInfo};

use crate::config::WireguardConfig;
use crate::ssh::RemoteExecutor;

/// One row of the gateway's peer table
#[derive(Debug, Clone)]
pub struct GatewayPeer {
    pub public_key: String,
    pub address: Option<Ipv4Addr>,
}

/// Gateway operations used by the provisioner and the reaper.
///
/// An explicit seam (rather than ambient global state) so tests can
/// substitute a fake gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Recover the gateway's public key, listen port, and endpoint from its
    /// running configuration
    async fn read_server_info(&self) -> Result<ServerInfo>;

    /// The live peer table
    async fn list_peers(&self) -> Result<Vec<GatewayPeer>>;

    /// Register a peer and persist the gateway's running state.
    /// Re-adding an existing peer with the same key/address is a no-op
    /// success, which makes retries after ambiguous failures safe.
    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()>;

    /// Remove a peer and persist. Removing an absent peer succeeds silently;
    /// already-revoked is not an error.
    async fn remove_peer(&self, public_key: &str) -> Result<()>;

    /// Addresses currently bound to a peer
    async fn list_peer_addresses(&self) -> Result<BTreeSet<Ipv4Addr>> {
        Ok(self
            .list_peers()
            .await?
            .into_iter()
            .filter_map(|p| p.address)
            .collect())
    }
}

/// SSH-backed WireGuard gateway
pub struct WgGateway {
    exec: Arc<dyn RemoteExecutor>,
    config: WireguardConfig,
    endpoint_host: String,
    // One gateway mutation at a time: wg-quick save rewrites the config file
    // after every change, and interleaved saves can lose peers
    mutation_lock: Mutex<()>,
}

impl WgGateway {
    pub fn new(exec: Arc<dyn RemoteExecutor>, config: WireguardConfig, endpoint_host: String) -> Self {
        Self {
            exec,
            config,
            endpoint_host,
            mutation_lock: Mutex::new(()),
        }
    }

    async fn persist(&self) -> Result<()> {
        let save = self
            .exec
            .exec(&format!("sudo wg-quick save {}", self.config.interface()))
            .await?;
        if !save.success() {
            return Err(Error::GatewayRejected(format!(
                "wg-quick save failed: {}",
                save.stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for WgGateway {
    async fn read_server_info(&self) -> Result<ServerInfo> {
        let output = self
            .exec
            .exec(&format!("sudo cat {}", self.config.server_config_path))
            .await?;
        if !output.success() {
            return Err(Error::GatewayConfigMalformed(format!(
                "cannot read {}: {}",
                self.config.server_config_path, output.stderr
            )));
        }

        let (private_key, listen_port) = parse_server_config(&output.stdout)?;

        // The private key stays on this stack frame; only the derived public
        // key leaves it
        let public_key = keygen::derive_public_key(&private_key)
            .map_err(|e| Error::GatewayConfigMalformed(format!("bad PrivateKey: {}", e)))?;

        Ok(ServerInfo {
            public_key,
            listen_port,
            endpoint_host: self.endpoint_host.clone(),
        })
    }

    async fn list_peers(&self) -> Result<Vec<GatewayPeer>> {
        let output = self
            .exec
            .exec(&format!(
                "sudo wg show {} allowed-ips",
                self.config.interface()
            ))
            .await?;
        if !output.success() {
            return Err(Error::GatewayRejected(format!(
                "wg show failed: {}",
                output.stderr
            )));
        }
        Ok(parse_allowed_ips(&output.stdout))
    }

    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        // Keys are interpolated into a shell command; refuse anything that is
        // not a canonical base64 key before it gets near the wire
        if !keygen::is_valid_key(public_key) {
            return Err(Error::GatewayRejected(format!(
                "malformed public key: {:?}",
                public_key
            )));
        }

        let _guard = self.mutation_lock.lock().await;

        let output = self
            .exec
            .exec(&format!(
                "sudo wg set {} peer {} allowed-ips {}/32",
                self.config.interface(),
                public_key,
                address
            ))
            .await?;
        if !output.success() {
            return Err(Error::GatewayRejected(format!(
                "add peer failed: {}",
                output.stderr
            )));
        }

        self.persist().await
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        if !keygen::is_valid_key(public_key) {
            return Err(Error::GatewayRejected(format!(
                "malformed public key: {:?}",
                public_key
            )));
        }

        let _guard = self.mutation_lock.lock().await;

        let output = self
            .exec
            .exec(&format!(
                "sudo wg set {} peer {} remove",
                self.config.interface(),
                public_key
            ))
            .await?;
        if !output.success() {
            // Absent peer: treated as success, the desired state already holds
            if output.stderr.contains("No such peer") {
                warn!("remove_peer: peer already absent from gateway");
                return Ok(());
            }
            return Err(Error::GatewayRejected(format!(
                "remove peer failed: {}",
                output.stderr
            )));
        }

        self.persist().await
    }
}

/// Extract PrivateKey and ListenPort from a wg-quick config
fn parse_server_config(text: &str) -> Result<(String, u16)> {
    let mut private_key = None;
    let mut listen_port = None;

    for line in text.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        match name.trim() {
            "PrivateKey" => private_key = Some(value.trim().to_string()),
            "ListenPort" => {
                let value = value.trim();
                listen_port = Some(value.parse::<u16>().map_err(|_| {
                    Error::GatewayConfigMalformed(format!("bad ListenPort: {:?}", value))
                })?);
            }
            _ => {}
        }
    }

    let private_key = private_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::GatewayConfigMalformed("no PrivateKey in config".to_string()))?;
    let listen_port = listen_port
        .ok_or_else(|| Error::GatewayConfigMalformed("no ListenPort in config".to_string()))?;

    Ok((private_key, listen_port))
}

/// Parse `wg show <iface> allowed-ips` output: one peer per line,
/// `<public-key>\t<ip>/<mask>[ <ip>/<mask>...]` or `(none)`
fn parse_allowed_ips(text: &str) -> Vec<GatewayPeer> {
    let mut peers = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(public_key) = fields.next() else {
            continue;
        };
        let address = fields
            .filter_map(|f| f.split('/').next())
            .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
            .next();
        peers.push(GatewayPeer {
            public_key: public_key.to_string(),
            address,
        });
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::ExecOutput;
    use parking_lot::Mutex as SyncMutex;

    /// Scripted remote side: maps a command substring to a canned response
    struct ScriptedExecutor {
        responses: SyncMutex<Vec<(String, Result<ExecOutput>)>>,
    }

    impl ScriptedExecutor {
        fn new(responses: Vec<(&str, Result<ExecOutput>)>) -> Arc<Self> {
            Arc::new(Self {
                responses: SyncMutex::new(
                    responses
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                ),
            })
        }
    }

    fn ok(stdout: &str) -> Result<ExecOutput> {
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn failed(stderr: &str) -> Result<ExecOutput> {
        Ok(ExecOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn exec(&self, command: &str) -> Result<ExecOutput> {
            let mut responses = self.responses.lock();
            let idx = responses
                .iter()
                .position(|(k, _)| command.contains(k.as_str()))
                .unwrap_or_else(|| panic!("unscripted command: {}", command));
            responses.remove(idx).1
        }
    }

    fn gateway(exec: Arc<dyn RemoteExecutor>) -> WgGateway {
        WgGateway::new(exec, WireguardConfig::default(), "gw.example.com".to_string())
    }

    #[tokio::test]
    async fn test_read_server_info() {
        let kp = keygen::generate().unwrap();
        let conf = format!(
            "[Interface]\nAddress = 10.0.0.1/24\nListenPort = 51820\nPrivateKey = {}\n",
            kp.private_key
        );
        let gw = gateway(ScriptedExecutor::new(vec![("cat", ok(&conf))]));

        let info = gw.read_server_info().await.unwrap();
        assert_eq!(info.public_key, kp.public_key);
        assert_eq!(info.listen_port, 51820);
        assert_eq!(info.endpoint_host, "gw.example.com");
    }

    #[tokio::test]
    async fn test_malformed_config_is_typed() {
        let gw = gateway(ScriptedExecutor::new(vec![(
            "cat",
            ok("[Interface]\nAddress = 10.0.0.1/24\n"),
        )]));
        assert!(matches!(
            gw.read_server_info().await,
            Err(Error::GatewayConfigMalformed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_passes_through() {
        let gw = gateway(ScriptedExecutor::new(vec![(
            "cat",
            Err(Error::GatewayUnreachable("connection refused".to_string())),
        )]));
        assert!(matches!(
            gw.read_server_info().await,
            Err(Error::GatewayUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_add_peer_persists_before_ack() {
        let kp = keygen::generate().unwrap();
        let gw = gateway(ScriptedExecutor::new(vec![
            ("wg set", ok("")),
            ("wg-quick save", ok("")),
        ]));
        gw.add_peer(&kp.public_key, Ipv4Addr::new(10, 0, 0, 5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_peer_rejection_is_typed() {
        let kp = keygen::generate().unwrap();
        let gw = gateway(ScriptedExecutor::new(vec![(
            "wg set",
            failed("Unable to modify interface: Operation not permitted"),
        )]));
        assert!(matches!(
            gw.add_peer(&kp.public_key, Ipv4Addr::new(10, 0, 0, 5)).await,
            Err(Error::GatewayRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_add_peer_refuses_malformed_key() {
        let gw = gateway(ScriptedExecutor::new(vec![]));
        assert!(matches!(
            gw.add_peer("$(reboot)", Ipv4Addr::new(10, 0, 0, 5)).await,
            Err(Error::GatewayRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_absent_peer_is_silent_success() {
        let kp = keygen::generate().unwrap();
        let gw = gateway(ScriptedExecutor::new(vec![(
            "remove",
            failed("No such peer"),
        )]));
        gw.remove_peer(&kp.public_key).await.unwrap();
    }

    #[test]
    fn test_parse_allowed_ips() {
        let out = "abc123=\t10.0.0.2/32\ndef456=\t10.0.0.7/32 fd00::7/128\nghi789=\t(none)";
        let peers = parse_allowed_ips(out);
        assert_eq!(peers.len(), 3);
        assert_eq!(peers[0].address, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(peers[1].address, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(peers[2].address, None);
    }

    #[test]
    fn test_parse_server_config_tolerates_spacing() {
        let kp = keygen::generate().unwrap();
        let text = format!("PrivateKey={}\nListenPort=51820", kp.private_key);
        let (pk, port) = parse_server_config(&text).unwrap();
        assert_eq!(pk, kp.private_key);
        assert_eq!(port, 51820);
    }
}
