//! Authentication plugins.
//!
//! Plugins are looked up by name in an [`AuthRegistry`] built once per
//! [`Config`](crate::Config). The handshake asks the plugin named by the
//! server greeting for an initial response, then feeds it every
//! AuthMoreData (`0x01`) payload until the server answers OK or ERR. An
//! auth-switch request (`0xFE`) restarts the exchange with another plugin
//! from the same registry.
//!
//! # Built-in plugins
//!
//! - `mysql_native_password`: `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`
//! - `caching_sha2_password`: fast path
//!   `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`; the full path sends
//!   the password in clear over TLS or RSA-encrypted otherwise
//! - `sha256_password`: clear over TLS, RSA-encrypted otherwise
//! - `mysql_clear_password`: clear text, TLS only unless explicitly allowed

use std::fmt;
use std::sync::Arc;

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use s2wire_core::error::{ConnectionError, ConnectionErrorKind};
use s2wire_core::{Error, Result};

/// Built-in plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes of the caching_sha2_password exchange.
mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// What a plugin may know about the connection.
#[derive(Clone, Copy)]
pub struct AuthContext<'a> {
    pub user: &'a str,
    pub password: Option<&'a str>,
    /// Scramble from the greeting or the auth-switch request
    pub seed: &'a [u8],
    /// Transport is TLS
    pub secure: bool,
    pub allow_cleartext: bool,
    pub allow_public_key_retrieval: bool,
    /// Server RSA public key (PEM) configured up front
    pub server_public_key: Option<&'a [u8]>,
}

impl fmt::Debug for AuthContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("user", &self.user)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

impl AuthContext<'_> {
    fn password(&self) -> &str {
        self.password.unwrap_or("")
    }

    /// Password followed by a NUL, for secure channels.
    fn cleartext(&self) -> Vec<u8> {
        let mut out = self.password().as_bytes().to_vec();
        out.push(0);
        out
    }
}

/// One authentication method.
pub trait AuthPlugin: Send + Sync {
    /// Plugin name as sent on the wire.
    fn name(&self) -> &str;

    /// Auth response for the handshake response or an auth-switch reply.
    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>>;

    /// React to an AuthMoreData payload (marker byte stripped).
    ///
    /// `Ok(Some(bytes))` sends a packet, `Ok(None)` waits for the next
    /// server packet.
    fn continue_auth(&self, data: &[u8], _ctx: &AuthContext<'_>) -> Result<Option<Vec<u8>>> {
        Err(auth_error(format!(
            "{} does not expect additional auth data ({} bytes)",
            self.name(),
            data.len()
        )))
    }
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: message.into(),
        source: None,
    })
}

/// Name-keyed set of authentication plugins.
#[derive(Clone)]
pub struct AuthRegistry {
    plugins: Vec<Arc<dyn AuthPlugin>>,
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self {
            plugins: vec![
                Arc::new(NativePassword),
                Arc::new(CachingSha2Password),
                Arc::new(Sha256Password),
                Arc::new(ClearPassword),
            ],
        }
    }
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

impl AuthRegistry {
    /// A registry without any plugin.
    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Add a plugin, replacing any plugin of the same name.
    pub fn register(&mut self, plugin: Arc<dyn AuthPlugin>) {
        self.plugins.retain(|p| p.name() != plugin.name());
        self.plugins.push(plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    /// Resolve a plugin or fail with an authentication error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AuthPlugin>> {
        self.get(name)
            .ok_or_else(|| auth_error(format!("unsupported authentication plugin '{}'", name)))
    }
}

/// Strip the NUL the server appends to its 20-byte scramble.
fn scramble(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ => seed,
    }
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`
pub fn scramble_native(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = &seed[..seed.len().min(20)];
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut h = Sha1::new();
    h.update(seed);
    h.update(stage2);
    xor(&stage1, &h.finalize())
}

/// `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`
pub fn scramble_sha256(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut h = Sha256::new();
    h.update(stage2);
    h.update(scramble(seed));
    xor(&stage1, &h.finalize())
}

/// RSA-OAEP encrypt `(password + NUL) XOR seed` with the server key.
pub fn encrypt_password(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    let seed = scramble(seed);
    if seed.is_empty() {
        return Err(auth_error("empty scramble for RSA password exchange"));
    }
    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|_| auth_error("server public key is not PEM text"))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("cannot parse server public key: {}", e)))?;
    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| auth_error(format!("RSA encryption failed: {}", e)))
}

fn is_pem(data: &[u8]) -> bool {
    data.starts_with(b"-----BEGIN")
}

/// Full-path response when the password has to leave the client.
fn full_auth(plugin: &str, ctx: &AuthContext<'_>, request_key: u8) -> Result<Vec<u8>> {
    if ctx.secure {
        return Ok(ctx.cleartext());
    }
    if let Some(pem) = ctx.server_public_key {
        return encrypt_password(ctx.password(), ctx.seed, pem);
    }
    if ctx.allow_public_key_retrieval {
        return Ok(vec![request_key]);
    }
    Err(auth_error(format!(
        "{} needs TLS, a configured server public key, or allow_public_key_retrieval",
        plugin
    )))
}

#[derive(Debug)]
pub struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(scramble_native(ctx.password(), ctx.seed))
    }
}

#[derive(Debug)]
pub struct CachingSha2Password;

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(scramble_sha256(ctx.password(), ctx.seed))
    }

    fn continue_auth(&self, data: &[u8], ctx: &AuthContext<'_>) -> Result<Option<Vec<u8>>> {
        if is_pem(data) {
            return encrypt_password(ctx.password(), ctx.seed, data).map(Some);
        }
        match data.first() {
            Some(&caching_sha2::FAST_AUTH_SUCCESS) => {
                tracing::debug!("caching_sha2_password fast auth");
                Ok(None)
            }
            Some(&caching_sha2::PERFORM_FULL_AUTH) => {
                tracing::debug!(secure = ctx.secure, "caching_sha2_password full auth");
                full_auth(self.name(), ctx, caching_sha2::REQUEST_PUBLIC_KEY).map(Some)
            }
            other => Err(auth_error(format!(
                "unexpected caching_sha2_password status {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Sha256Password;

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &str {
        plugins::SHA256_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if ctx.password().is_empty() {
            return Ok(vec![0]);
        }
        full_auth(self.name(), ctx, SHA256_REQUEST_PUBLIC_KEY)
    }

    fn continue_auth(&self, data: &[u8], ctx: &AuthContext<'_>) -> Result<Option<Vec<u8>>> {
        if !is_pem(data) {
            return Err(auth_error("sha256_password expected the server public key"));
        }
        encrypt_password(ctx.password(), ctx.seed, data).map(Some)
    }
}

#[derive(Debug)]
pub struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn initial_response(&self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if !ctx.secure && !ctx.allow_cleartext {
            return Err(auth_error(
                "mysql_clear_password over a plain connection requires allow_cleartext_password",
            ));
        }
        Ok(ctx.cleartext())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(password: &'a str, seed: &'a [u8]) -> AuthContext<'a> {
        AuthContext {
            user: "app",
            password: Some(password),
            seed,
            secure: false,
            allow_cleartext: false,
            allow_public_key_retrieval: false,
            server_public_key: None,
        }
    }

    #[test]
    fn native_scramble_shape() {
        assert!(scramble_native("", &[0; 20]).is_empty());
        let a = scramble_native("secret", &[7; 20]);
        assert_eq!(a.len(), 20);
        assert_eq!(a, scramble_native("secret", &[7; 20]));
        assert_ne!(a, scramble_native("secret", &[8; 20]));
        // Extra seed bytes past 20 are ignored.
        let mut long = vec![7u8; 20];
        long.push(0);
        assert_eq!(a, scramble_native("secret", &long));
    }

    #[test]
    fn native_scramble_is_invertible_with_stored_hash() {
        // The server checks SHA1(reply XOR SHA1(seed + stored)) == stored.
        let seed = [0x3du8; 20];
        let reply = scramble_native("pw", &seed);
        let stored = Sha1::digest(Sha1::digest(b"pw"));
        let mut h = Sha1::new();
        h.update(seed);
        h.update(stored);
        let stage1 = xor(&reply, &h.finalize());
        assert_eq!(Sha1::digest(&stage1).as_slice(), stored.as_slice());
    }

    #[test]
    fn sha256_scramble_strips_trailing_nul() {
        let mut seed = vec![1u8; 20];
        let plain = scramble_sha256("secret", &seed);
        seed.push(0);
        assert_eq!(plain.len(), 32);
        assert_eq!(plain, scramble_sha256("secret", &seed));
    }

    #[test]
    fn caching_sha2_states() {
        let seed = [2u8; 20];
        let plugin = CachingSha2Password;
        let plain = ctx("pw", &seed);
        assert_eq!(plugin.continue_auth(&[0x03], &plain).unwrap(), None);
        assert!(plugin.continue_auth(&[0x04], &plain).is_err());

        let secure = AuthContext {
            secure: true,
            ..plain
        };
        assert_eq!(
            plugin.continue_auth(&[0x04], &secure).unwrap(),
            Some(b"pw\0".to_vec())
        );

        let retrieve = AuthContext {
            allow_public_key_retrieval: true,
            ..plain
        };
        assert_eq!(
            plugin.continue_auth(&[0x04], &retrieve).unwrap(),
            Some(vec![0x02])
        );
        assert!(plugin.continue_auth(&[0x09], &plain).is_err());
    }

    #[test]
    fn clear_password_needs_tls_or_opt_in() {
        let seed = [0u8; 20];
        let plain = ctx("pw", &seed);
        assert!(ClearPassword.initial_response(&plain).is_err());
        let allowed = AuthContext {
            allow_cleartext: true,
            ..plain
        };
        assert_eq!(ClearPassword.initial_response(&allowed).unwrap(), b"pw\0");
    }

    #[test]
    fn registry_lookup_and_override() {
        #[derive(Debug)]
        struct Token;
        impl AuthPlugin for Token {
            fn name(&self) -> &str {
                plugins::MYSQL_CLEAR_PASSWORD
            }
            fn initial_response(&self, _ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
                Ok(b"token\0".to_vec())
            }
        }

        let mut registry = AuthRegistry::default();
        assert!(registry.get(plugins::CACHING_SHA2_PASSWORD).is_some());
        assert!(registry.resolve("auth_gssapi_client").is_err());

        registry.register(Arc::new(Token));
        let seed = [0u8; 20];
        let plugin = registry.resolve(plugins::MYSQL_CLEAR_PASSWORD).unwrap();
        assert_eq!(plugin.initial_response(&ctx("", &seed)).unwrap(), b"token\0");
        assert_eq!(format!("{:?}", registry).matches("mysql_clear_password").count(), 1);
    }

    #[test]
    fn rsa_needs_a_valid_key() {
        assert!(encrypt_password("pw", &[1; 20], b"not a key").is_err());
        assert!(encrypt_password("pw", &[], b"-----BEGIN PUBLIC KEY-----").is_err());
    }
}
