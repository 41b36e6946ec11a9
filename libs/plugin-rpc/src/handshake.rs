use base64::Engine;

/// Environment variable the parent sets before spawning a plugin,
/// carrying a fixed magic cookie the child must echo back validation
/// of before advertising its RPC endpoint (`spec.md` §4.3).
pub const MAGIC_COOKIE_KEY: &str = "INGEST_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "1d9f9b9e-ingest-plugin-handshake";
pub const PROTOCOL_VERSION_KEY: &str = "INGEST_PLUGIN_PROTOCOL_VERSION";
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable the host sets before spawn, carrying the
/// base64-encoded DER of the client identity it will present on
/// dial — the other half of the mutual handshake, announced in the
/// opposite direction from the plugin's stdout line since the host
/// generates its identity before the child even exists.
pub const CLIENT_CERT_KEY: &str = "INGEST_PLUGIN_CLIENT_CERT";

/// The single handshake line a plugin writes to stdout once its mTLS
/// listener is bound: `<protocol_version>|tcp|<addr>|tls|<cert_der_b64>`.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub protocol_version: u32,
    pub addr: std::net::SocketAddr,
    pub cert_der: Vec<u8>,
}

impl HandshakeInfo {
    pub fn to_line(&self) -> String {
        format!(
            "{}|tcp|{}|tls|{}\n",
            self.protocol_version,
            self.addr,
            base64::engine::general_purpose::STANDARD.encode(&self.cert_der),
        )
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [version, proto, addr, tls, cert] = parts.as_slice() else {
            return Err(format!("malformed handshake line: {line:?}"));
        };
        if *proto != "tcp" || *tls != "tls" {
            return Err(format!("unsupported handshake transport in line: {line:?}"));
        }
        let protocol_version: u32 = version.parse().map_err(|_| "bad protocol version".to_string())?;
        let addr: std::net::SocketAddr = addr.parse().map_err(|e| format!("bad address: {e}"))?;
        let cert_der = base64::engine::general_purpose::STANDARD
            .decode(cert.as_bytes())
            .map_err(|e| format!("bad certificate: {e}"))?;
        Ok(Self { protocol_version, addr, cert_der })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_line_round_trips() {
        let info = HandshakeInfo {
            protocol_version: PROTOCOL_VERSION,
            addr: "127.0.0.1:9000".parse().unwrap(),
            cert_der: vec![1, 2, 3, 4],
        };
        let parsed = HandshakeInfo::parse(&info.to_line()).unwrap();
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
        assert_eq!(parsed.addr, info.addr);
        assert_eq!(parsed.cert_der, info.cert_der);
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(HandshakeInfo::parse("garbage").is_err());
    }
}
