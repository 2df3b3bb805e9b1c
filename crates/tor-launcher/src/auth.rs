//! Where the control port is, and how we prove we may use it.
//!
//! By default we make up a random password, start Tor with its hash in
//! `HashedControlPassword`, and authenticate with the password itself.
//! The environment can instead point us at an existing control port, with
//! a password or a cookie file.

use std::fs::File;
use std::io::Read as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use rand::{CryptoRng, Rng};
use safelog::Sensitive;
use sha1::{Digest as _, Sha1};
use tor_ctlproto::ControlAuth;
use tracing::debug;

use crate::err::{LauncherError, Result};
use crate::host::Environment;

/// Overrides the control port host.
pub const ENV_CONTROL_HOST: &str = "TOR_CONTROL_HOST";
/// Overrides the control port number.
pub const ENV_CONTROL_PORT: &str = "TOR_CONTROL_PORT";
/// Supplies the control port password.
pub const ENV_CONTROL_PASSWD: &str = "TOR_CONTROL_PASSWD";
/// Supplies a cookie file to authenticate with.
pub const ENV_CONTROL_COOKIE_AUTH_FILE: &str = "TOR_CONTROL_COOKIE_AUTH_FILE";

/// Length of a generated password, in characters.
const PASSWORD_LEN: usize = 16;

/// Most bytes we read from a cookie file.
const MAX_COOKIE_LEN: u64 = 32;

/// The S2K coded count we use: 65536 bytes of hashing.
const S2K_CODED_COUNT: u8 = 96;

/// The secret we authenticate with.
#[derive(Clone, Debug)]
enum Secret {
    /// A password.
    Password(Sensitive<Vec<u8>>),
    /// The contents of a cookie file.
    Cookie(Sensitive<Vec<u8>>),
}

/// The address of a control port, and how to authenticate to it.
#[derive(Clone, Debug)]
pub struct ControlPortAccess {
    /// Where the control port is.
    address: SocketAddr,
    /// What we authenticate with.
    secret: Secret,
}

impl ControlPortAccess {
    /// Work out how to reach the control port.
    ///
    /// Environment overrides take priority over `default_address`.  A
    /// password from the environment takes priority over a cookie file;
    /// if there is neither, we generate a random password with `rng`.
    pub fn resolve<R: Rng + CryptoRng>(
        env: &dyn Environment,
        default_address: SocketAddr,
        rng: &mut R,
    ) -> Result<Self> {
        let ip = match env.var(ENV_CONTROL_HOST) {
            Some(host) => parse_host(&host)?,
            None => default_address.ip(),
        };
        let port = match env.var(ENV_CONTROL_PORT) {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|e| LauncherError::BadControlAddress {
                    value: port.clone(),
                    problem: e.to_string(),
                })?,
            None => default_address.port(),
        };
        let address = SocketAddr::new(ip, port);

        let secret = if let Some(pw) = env.var(ENV_CONTROL_PASSWD).filter(|p| !p.is_empty()) {
            debug!("Using control port password from the environment");
            Secret::Password(Sensitive::new(pw.into_bytes()))
        } else if let Some(path) = env
            .var(ENV_CONTROL_COOKIE_AUTH_FILE)
            .filter(|p| !p.is_empty())
        {
            debug!("Using control port cookie from {}", path);
            Secret::Cookie(Sensitive::new(read_cookie(PathBuf::from(path))?))
        } else {
            Secret::Password(Sensitive::new(random_password(rng)))
        };

        Ok(ControlPortAccess { address, secret })
    }

    /// Return the control port address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Return what to authenticate with.
    ///
    /// Passwords are always sent hex-encoded.
    pub fn control_auth(&self) -> ControlAuth {
        match &self.secret {
            Secret::Password(pw) => ControlAuth::Password(Sensitive::new(hex::encode(pw.as_inner()))),
            Secret::Cookie(c) => ControlAuth::Cookie(c.clone()),
        }
    }

    /// Return a value for Tor's `HashedControlPassword` option, with a salt
    /// from `rng`.
    ///
    /// Returns `None` when we authenticate with a cookie.
    pub fn hashed_password<R: Rng + CryptoRng>(&self, rng: &mut R) -> Option<String> {
        match &self.secret {
            Secret::Password(pw) => {
                let mut salt = [0_u8; 8];
                rng.fill(&mut salt);
                Some(hash_password(pw.as_inner(), salt))
            }
            Secret::Cookie(_) => None,
        }
    }
}

/// Parse a control port host.
fn parse_host(host: &str) -> Result<IpAddr> {
    let host = host.trim();
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|e: std::net::AddrParseError| LauncherError::BadControlAddress {
            value: host.to_owned(),
            problem: e.to_string(),
        })
}

/// Read up to [`MAX_COOKIE_LEN`] bytes from a cookie file.
fn read_cookie(path: PathBuf) -> Result<Vec<u8>> {
    let to_err = |e: std::io::Error| LauncherError::CookieFile {
        path: path.clone(),
        cause: Arc::new(e),
    };
    let mut cookie = Vec::new();
    File::open(&path)
        .map_err(to_err)?
        .take(MAX_COOKIE_LEN)
        .read_to_end(&mut cookie)
        .map_err(to_err)?;
    Ok(cookie)
}

/// Return a random password of printable ASCII characters.
fn random_password<R: Rng + CryptoRng>(rng: &mut R) -> Vec<u8> {
    (0..PASSWORD_LEN)
        .map(|_| rng.random_range(b'!'..=b'~'))
        .collect()
}

/// Hash `secret` with `salt` into Tor's `HashedControlPassword` format.
///
/// This is the iterated and salted S2K of RFC 2440, with SHA-1: the salt
/// and secret are repeated until [`S2K_CODED_COUNT`] says to stop, and
/// hashed.  The result is `16:` followed by the hex of the salt, the coded
/// count, and the hash.
pub fn hash_password(secret: &[u8], salt: [u8; 8]) -> String {
    let count = s2k_byte_count(S2K_CODED_COUNT);
    let mut block = Vec::with_capacity(salt.len() + secret.len());
    block.extend_from_slice(&salt);
    block.extend_from_slice(secret);

    let mut hasher = Sha1::new();
    let mut remaining = count;
    while remaining > 0 {
        let n = std::cmp::min(remaining, block.len());
        hasher.update(&block[..n]);
        remaining -= n;
    }
    let digest = hasher.finalize();

    let mut out = Vec::with_capacity(salt.len() + 1 + digest.len());
    out.extend_from_slice(&salt);
    out.push(S2K_CODED_COUNT);
    out.extend_from_slice(&digest);
    format!("16:{}", hex::encode(out))
}

/// Decode an S2K coded count into a number of bytes.
fn s2k_byte_count(c: u8) -> usize {
    /// Exponent bias from RFC 2440.
    const EXPBIAS: u32 = 6;
    (16_usize + usize::from(c & 15)) << (u32::from(c >> 4) + EXPBIAS)
}
