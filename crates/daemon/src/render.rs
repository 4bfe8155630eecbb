//! Client configuration rendering
//!
//! Pure function from peer parameters to a wg-quick profile. No I/O; output
//! is byte-stable for identical inputs so it can be golden-file tested.

use std::net::Ipv4Addr;
use wirevend_common::{keygen, Error, Result};

/// Everything a client profile needs
#[derive(Debug, Clone)]
pub struct ClientConfigParams<'a> {
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub dns_servers: &'a [Ipv4Addr],
    pub server_public_key: &'a str,
    pub endpoint_host: &'a str,
    pub listen_port: u16,
    pub keepalive_secs: u16,
}

/// Render a client profile
pub fn client_config(params: &ClientConfigParams<'_>) -> Result<String> {
    if !keygen::is_valid_key(params.private_key) {
        return Err(Error::InvalidInput("malformed client private key".to_string()));
    }
    if !keygen::is_valid_key(params.server_public_key) {
        return Err(Error::InvalidInput("malformed server public key".to_string()));
    }
    if params.dns_servers.is_empty() {
        return Err(Error::InvalidInput("no DNS servers configured".to_string()));
    }
    if params.endpoint_host.is_empty() {
        return Err(Error::InvalidInput("empty endpoint host".to_string()));
    }

    let dns = params
        .dns_servers
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        r#"[Interface]
PrivateKey = {private_key}
Address = {address}/24
DNS = {dns}

[Peer]
PublicKey = {server_public_key}
Endpoint = {endpoint_host}:{listen_port}
AllowedIPs = 0.0.0.0/0
PersistentKeepalive = {keepalive}
"#,
        private_key = params.private_key,
        address = params.address,
        dns = dns,
        server_public_key = params.server_public_key,
        endpoint_host = params.endpoint_host,
        listen_port = params.listen_port,
        keepalive = params.keepalive_secs,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(client_key: &'a str, server_key: &'a str, dns: &'a [Ipv4Addr]) -> ClientConfigParams<'a> {
        ClientConfigParams {
            private_key: client_key,
            address: Ipv4Addr::new(10, 0, 0, 17),
            dns_servers: dns,
            server_public_key: server_key,
            endpoint_host: "vpn.example.com",
            listen_port: 51820,
            keepalive_secs: 25,
        }
    }

    #[test]
    fn test_golden_output() {
        // Fixed keys so the expected document is literal
        let client = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
        let server = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
        let dns = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];

        let rendered = client_config(&params(client, server, &dns)).unwrap();
        let expected = "[Interface]\n\
                        PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
                        Address = 10.0.0.17/24\n\
                        DNS = 1.1.1.1, 8.8.8.8\n\
                        \n\
                        [Peer]\n\
                        PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\n\
                        Endpoint = vpn.example.com:51820\n\
                        AllowedIPs = 0.0.0.0/0\n\
                        PersistentKeepalive = 25\n";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_deterministic() {
        let client = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
        let server = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
        let dns = [Ipv4Addr::new(1, 1, 1, 1)];
        let p = params(client, server, &dns);
        assert_eq!(client_config(&p).unwrap(), client_config(&p).unwrap());
    }

    #[test]
    fn test_rejects_malformed_inputs() {
        let good = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
        let dns = [Ipv4Addr::new(1, 1, 1, 1)];
        assert!(client_config(&params("bogus", good, &dns)).is_err());
        assert!(client_config(&params(good, "bogus", &dns)).is_err());
        assert!(client_config(&params(good, good, &[])).is_err());
    }
}
