//! Connection phase: greeting, capability negotiation, TLS and the auth
//! exchange.

use std::sync::Arc;

use s2wire_core::error::ConnectionErrorKind;
use s2wire_core::{Error, Result};

use crate::auth::{AuthContext, AuthPlugin, auth_error, plugins};
use crate::config::Config;
use crate::ha::HostAddress;
use crate::protocol::{Framer, PacketReader, PacketWriter, capabilities, charset};
use crate::tls;

const PROTOCOL_VERSION: u8 = 10;

/// Response markers during authentication.
const AUTH_OK: u8 = 0x00;
const AUTH_MORE_DATA: u8 = 0x01;
const AUTH_SWITCH: u8 = 0xFE;
const AUTH_ERR: u8 = 0xFF;

/// Initial handshake packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Greeting {
    pub server_version: String,
    pub thread_id: u32,
    /// Scramble, trailing NUL removed
    pub seed: Vec<u8>,
    /// Full 64-bit set; the top half comes from the reserved bytes
    pub capabilities: u64,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

fn malformed(what: &str) -> Error {
    Error::malformed(format!("handshake: missing {}", what))
}

impl Greeting {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(data);

        let protocol_version = reader.read_u8().ok_or_else(|| malformed("protocol version"))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!("unsupported protocol version {}", protocol_version),
            ));
        }
        let server_version = reader
            .read_null_string()
            .ok_or_else(|| malformed("server version"))?;
        let thread_id = reader.read_u32_le().ok_or_else(|| malformed("thread id"))?;
        let mut seed = reader
            .read_bytes(8)
            .ok_or_else(|| malformed("scramble"))?
            .to_vec();
        reader.skip(1);

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| malformed("capability flags"))?;
        let charset = reader.read_u8().unwrap_or(charset::DEFAULT_CHARSET);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let mut caps = u64::from(caps_lower) | (u64::from(caps_upper) << 16);

        let seed_len = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            usize::from(reader.read_u8().unwrap_or(0))
        } else {
            reader.skip(1);
            0
        };

        // Ten reserved bytes; servers with extended capabilities put the
        // upper 32 bits in the last four.
        reader.skip(6);
        let extended = reader.read_u32_le().unwrap_or(0);
        caps |= u64::from(extended) << 32;

        if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len = seed_len.saturating_sub(8).max(13);
            if let Some(part) = reader.read_bytes(len.min(reader.remaining())) {
                let part = part.strip_suffix(&[0u8]).unwrap_or(part);
                seed.extend_from_slice(part);
            }
        }

        let auth_plugin = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string().unwrap_or_default()
        } else {
            String::new()
        };

        Ok(Self {
            server_version,
            thread_id,
            seed,
            capabilities: caps,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// Outcome of the connection phase.
#[derive(Debug)]
pub(crate) struct Negotiated {
    pub greeting: Greeting,
    /// Intersection of requested and offered capabilities
    pub capabilities: u64,
    pub secure: bool,
}

/// Capabilities to send: what the configuration asks for and the server
/// offers.
pub(crate) fn negotiate(config: &Config, server_caps: u64, use_tls: bool) -> Result<u64> {
    if server_caps & capabilities::CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::connection(
            ConnectionErrorKind::Connect,
            "server does not speak protocol 4.1",
        ));
    }
    let mut caps = config.capability_flags() & server_caps;
    if use_tls {
        caps |= capabilities::CLIENT_SSL;
    } else {
        caps &= !capabilities::CLIENT_SSL;
    }
    Ok(caps)
}

/// Handshake response (protocol 4.1).
///
/// The upper capability half travels in the last four bytes of the
/// 23-byte filler.
pub(crate) fn handshake_response(
    config: &Config,
    caps: u64,
    plugin: &str,
    auth_response: &[u8],
) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(128 + auth_response.len());
    w.write_u32_le(caps as u32);
    w.write_u32_le(config.max_packet_size.min(u32::MAX as usize) as u32);
    w.write_u8(config.charset);
    w.write_zeros(19);
    w.write_u32_le((caps >> 32) as u32);
    w.write_null_string(&config.user);

    if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        w.write_lenenc_bytes(auth_response);
    } else {
        w.write_u8(auth_response.len() as u8);
        w.write_bytes(auth_response);
    }

    if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        w.write_null_string(config.database.as_deref().unwrap_or(""));
    }
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        w.write_null_string(plugin);
    }
    if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        let mut attrs = PacketWriter::new();
        let mut pairs: Vec<_> = config.connection_attributes.iter().collect();
        pairs.sort();
        for (key, value) in pairs {
            attrs.write_lenenc_string(key);
            attrs.write_lenenc_string(value);
        }
        w.write_lenenc_bytes(attrs.as_bytes());
    }
    w.into_bytes()
}

/// Drive the connection phase to the final OK packet.
pub(crate) fn perform(framer: &mut Framer, config: &Config, host: &HostAddress) -> Result<Negotiated> {
    let payload = framer.read_payload()?;
    if payload.first() == Some(&AUTH_ERR) {
        let err = PacketReader::new(&payload)
            .parse_err_packet()
            .ok_or_else(|| Error::malformed("truncated error packet in greeting"))?;
        return Err(Error::connection(
            ConnectionErrorKind::Connect,
            format!("server refused connection: {} ({})", err.error_message, err.error_code),
        ));
    }
    let greeting = Greeting::parse(&payload)?;
    tracing::debug!(
        host = %host,
        server_version = %greeting.server_version,
        thread_id = greeting.thread_id,
        plugin = %greeting.auth_plugin,
        "server greeting"
    );

    tls::validate(config.ssl_mode, &config.tls)?;
    let secure = tls::should_upgrade(config.ssl_mode, greeting.capabilities)?;
    let caps = negotiate(config, greeting.capabilities, secure)?;
    tracing::debug!(capabilities = format_args!("{:#x}", caps), "negotiated capabilities");

    if secure {
        framer.write_payload(&tls::ssl_request_payload(
            caps,
            config.max_packet_size.min(u32::MAX as usize) as u32,
            config.charset,
        ))?;
        let server_name = config.tls.server_name.clone().unwrap_or_else(|| host.host.clone());
        framer.upgrade(|plain| tls::upgrade(plain, &config.tls, &server_name, config.ssl_mode))?;
    }

    let public_key = match &config.server_rsa_public_key {
        Some(path) => Some(std::fs::read(path).map_err(|e| {
            Error::Config(s2wire_core::ConfigError {
                message: format!("cannot read server public key {}: {}", path.display(), e),
                source: Some(Box::new(e)),
            })
        })?),
        None => None,
    };

    let mut auth = Authenticator {
        config,
        secure,
        public_key: public_key.as_deref(),
        seed: greeting.seed.clone(),
        plugin: config
            .auth
            .get(&greeting.auth_plugin)
            .or_else(|| config.auth.get(plugins::MYSQL_NATIVE_PASSWORD))
            .ok_or_else(|| auth_error("no authentication plugin available"))?,
    };

    let response = auth.plugin.initial_response(&auth.context())?;
    let packet = handshake_response(config, caps, auth.plugin.name(), &response);
    framer.write_payload(&packet)?;
    auth.run(framer, caps)?;

    Ok(Negotiated {
        greeting,
        capabilities: caps,
        secure,
    })
}

struct Authenticator<'a> {
    config: &'a Config,
    secure: bool,
    public_key: Option<&'a [u8]>,
    seed: Vec<u8>,
    plugin: Arc<dyn AuthPlugin>,
}

impl Authenticator<'_> {
    fn context(&self) -> AuthContext<'_> {
        AuthContext {
            user: &self.config.user,
            password: self.config.password.as_deref(),
            seed: &self.seed,
            secure: self.secure,
            allow_cleartext: self.config.allow_cleartext_password,
            allow_public_key_retrieval: self.config.allow_public_key_retrieval,
            server_public_key: self.public_key,
        }
    }

    /// Loop over server packets until OK or ERR.
    fn run(&mut self, framer: &mut Framer, caps: u64) -> Result<()> {
        loop {
            let payload = framer.read_payload()?;
            match payload.first().copied() {
                Some(AUTH_OK) => {
                    tracing::debug!(plugin = self.plugin.name(), "authenticated");
                    return PacketReader::new(&payload)
                        .parse_ok_packet(caps)
                        .map(|_| ())
                        .ok_or_else(|| Error::malformed("truncated OK packet after auth"));
                }
                Some(AUTH_ERR) => {
                    let err = PacketReader::new(&payload)
                        .parse_err_packet()
                        .ok_or_else(|| Error::malformed("truncated error packet during auth"))?;
                    return Err(auth_error(format!(
                        "access denied for user '{}': {} ({})",
                        self.config.user, err.error_message, err.error_code
                    )));
                }
                Some(AUTH_SWITCH) => {
                    let mut reader = PacketReader::new(&payload[1..]);
                    let name = reader.read_null_string().unwrap_or_default();
                    if name.is_empty() {
                        return Err(auth_error("server requested the pre-4.1 password protocol"));
                    }
                    self.plugin = self.config.auth.resolve(&name)?;
                    self.seed = reader.read_rest().to_vec();
                    tracing::debug!(plugin = %name, "auth switch");
                    let response = self.plugin.initial_response(&self.context())?;
                    framer.write_payload(&response)?;
                }
                Some(AUTH_MORE_DATA) => {
                    if let Some(response) = self.plugin.continue_auth(&payload[1..], &self.context())? {
                        framer.write_payload(&response)?;
                    }
                }
                Some(other) => {
                    return Err(Error::protocol(
                        s2wire_core::ProtocolErrorKind::UnexpectedPacket,
                        format!("unexpected packet 0x{:02x} during authentication", other),
                    ));
                }
                None => return Err(Error::malformed("empty packet during authentication")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::*;

    fn greeting_packet(caps: u64, plugin: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(PROTOCOL_VERSION);
        w.write_null_string("8.5.1");
        w.write_u32_le(42);
        w.write_bytes(b"abcdefgh");
        w.write_u8(0);
        w.write_u16_le(caps as u16);
        w.write_u8(45);
        w.write_u16_le(2);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(6);
        w.write_u32_le((caps >> 32) as u32);
        w.write_bytes(b"ijklmnopqrst");
        w.write_u8(0);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    const SERVER: u64 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_TRANSACTIONS
        | CLIENT_SSL
        | CACHE_METADATA;

    #[test]
    fn parse_greeting_with_extended_caps() {
        let g = Greeting::parse(&greeting_packet(SERVER, "caching_sha2_password")).unwrap();
        assert_eq!(g.server_version, "8.5.1");
        assert_eq!(g.thread_id, 42);
        assert_eq!(g.seed, b"abcdefghijklmnopqrst");
        assert_eq!(g.capabilities, SERVER);
        assert_ne!(g.capabilities & CACHE_METADATA, 0);
        assert_eq!(g.auth_plugin, "caching_sha2_password");
        assert_eq!(g.status_flags, 2);
    }

    #[test]
    fn rejects_old_protocol() {
        let mut packet = greeting_packet(SERVER, "");
        packet[0] = 9;
        assert!(Greeting::parse(&packet).is_err());
    }

    #[test]
    fn negotiation_intersects_and_respects_tls_choice() {
        let config = Config::new().database("db");
        let caps = negotiate(&config, SERVER, false).unwrap();
        assert_eq!(caps & CLIENT_SSL, 0);
        assert_ne!(caps & CLIENT_CONNECT_WITH_DB, 0);
        assert_ne!(caps & CACHE_METADATA, 0);
        assert_eq!(caps & EXTENDED_TYPE_INFO, 0);
        assert_eq!(caps & CLIENT_COMPRESS, 0);

        assert!(negotiate(&config, CLIENT_SECURE_CONNECTION, false).is_err());
    }

    #[test]
    fn response_layout() {
        let config = Config::new().user("app").database("shop");
        let caps = CLIENT_PROTOCOL_41
            | CLIENT_PLUGIN_AUTH
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CLIENT_CONNECT_WITH_DB
            | CACHE_METADATA;
        let packet = handshake_response(&config, caps, "mysql_native_password", &[1, 2, 3]);
        let mut r = PacketReader::new(&packet);
        assert_eq!(u64::from(r.read_u32_le().unwrap()), caps & 0xFFFF_FFFF);
        assert_eq!(r.read_u32_le(), Some(16 * 1024 * 1024));
        assert_eq!(r.read_u8(), Some(config.charset));
        r.skip(19);
        assert_eq!(u64::from(r.read_u32_le().unwrap()) << 32, CACHE_METADATA);
        assert_eq!(r.read_null_string().as_deref(), Some("app"));
        assert_eq!(r.read_lenenc_bytes(), Some(vec![1, 2, 3]));
        assert_eq!(r.read_null_string().as_deref(), Some("shop"));
        assert_eq!(r.read_null_string().as_deref(), Some("mysql_native_password"));
        assert!(r.is_empty());
    }

    #[test]
    fn connect_attributes_block() {
        let config = Config::new().user("u").attribute("_client_name", "s2wire");
        let caps = CLIENT_PROTOCOL_41 | CLIENT_CONNECT_ATTRS;
        let packet = handshake_response(&config, caps, "", &[]);
        let mut r = PacketReader::new(&packet);
        r.skip(32);
        r.read_null_string();
        assert_eq!(r.read_u8(), Some(0));
        let block = r.read_lenenc_bytes().unwrap();
        let mut attrs = PacketReader::new(&block);
        assert_eq!(attrs.read_lenenc_string().as_deref(), Some("_client_name"));
        assert_eq!(attrs.read_lenenc_string().as_deref(), Some("s2wire"));
    }
}
