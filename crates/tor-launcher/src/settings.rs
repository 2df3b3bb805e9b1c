//! Network settings: proxy, firewall and bridges.
//!
//! Settings arrive from (and are reported to) the rest of the application
//! as a JSON [`SettingsBundle`], with the loosely-typed fields a settings
//! form has.  [`SettingsBundle::validate`] turns that into
//! [`NetworkSettings`], where every legal combination has its own variant,
//! before anything is sent to Tor.

use itertools::Itertools as _;
use safelog::Sensitive;
use serde::{Deserialize, Serialize};
use tor_ctlproto::{ConfValue, ProtocolClient, SetConf};
use tor_error::ErrorReport as _;
use tor_rtcompat::Runtime;
use tracing::{debug, info};

use crate::err::{LauncherError, Result};
use crate::prefs::Preferences;

/// Tor's option for a SOCKS4 proxy.
const SOCKS4_PROXY: &str = "Socks4Proxy";
/// Tor's option for a SOCKS5 proxy.
const SOCKS5_PROXY: &str = "Socks5Proxy";
/// Tor's option for a SOCKS5 proxy username.
const SOCKS5_PROXY_USERNAME: &str = "Socks5ProxyUsername";
/// Tor's option for a SOCKS5 proxy password.
const SOCKS5_PROXY_PASSWORD: &str = "Socks5ProxyPassword";
/// Tor's option for an HTTP(S) proxy.
const HTTPS_PROXY: &str = "HTTPSProxy";
/// Tor's option for HTTP(S) proxy credentials.
const HTTPS_PROXY_AUTHENTICATOR: &str = "HTTPSProxyAuthenticator";
/// Tor's option restricting which ports it may connect to.
const REACHABLE_ADDRESSES: &str = "ReachableAddresses";
/// Tor's option for using bridges.
const USE_BRIDGES: &str = "UseBridges";
/// Tor's option listing bridges.
const BRIDGE: &str = "Bridge";

/// A problem with user-supplied network settings.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// A proxy was requested without an address.
    #[error("You must specify a proxy address.")]
    ProxyAddrMissing,
    /// A proxy was requested without a type.
    #[error("You must select the proxy type.")]
    ProxyTypeMissing,
    /// Custom bridges were requested, but none were given.
    #[error("You must specify one or more bridges.")]
    BridgesMissing,
    /// Default bridges were requested without a type.
    #[error("You must select a transport type for the provided bridges.")]
    DefaultBridgesTypeMissing,
    /// Default bridges of a type we have none of were requested.
    #[error("No {0} bridges are available.")]
    DefaultBridgesUnavailable(String),
    /// A port number didn't parse.
    #[error("{0:?} is not a valid port number.")]
    InvalidPort(String),
}

impl ValidationError {
    /// Return the key of the localized message for this error.
    pub fn message_key(&self) -> &'static str {
        match self {
            ValidationError::ProxyAddrMissing => "error_proxy_addr_missing",
            ValidationError::ProxyTypeMissing => "error_proxy_type_missing",
            ValidationError::BridgesMissing => "error_bridges_missing",
            ValidationError::DefaultBridgesTypeMissing => "error_default_bridges_type_missing",
            ValidationError::DefaultBridgesUnavailable(_) => "error_bridge_bad_default_type",
            ValidationError::InvalidPort(_) => "error_invalid_port",
        }
    }
}

/// The kinds of proxy Tor can use.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ProxyType {
    /// SOCKS version 4.
    #[serde(rename = "SOCKS4")]
    Socks4,
    /// SOCKS version 5.
    #[serde(rename = "SOCKS5")]
    Socks5,
    /// HTTP or HTTPS `CONNECT`.
    #[serde(rename = "HTTP")]
    Http,
}

/// Proxy settings as they appear in a settings form.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::exhaustive_structs)]
pub struct ProxyForm {
    /// Whether to use a proxy at all.
    pub use_proxy: bool,
    /// What kind of proxy.
    pub proxy_type: Option<ProxyType>,
    /// The proxy's host.
    pub address: String,
    /// The proxy's port.
    pub port: String,
    /// Username for the proxy, if it needs one.
    pub username: String,
    /// Password for the proxy, if it needs one.
    pub password: String,
}

/// Firewall settings as they appear in a settings form.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::exhaustive_structs)]
pub struct FirewallForm {
    /// Whether only some ports are reachable.
    pub use_firewall_ports: bool,
    /// The reachable ports, comma-separated.
    pub allowed_ports: String,
}

/// Bridge settings as they appear in a settings form.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::exhaustive_structs)]
pub struct BridgeForm {
    /// Whether to use bridges at all.
    pub use_bridges: bool,
    /// Whether to use one of the default sets of bridges.
    pub use_default: bool,
    /// Which default set of bridges.
    pub default_bridge_type: String,
    /// Custom bridge lines, one per line.
    pub custom_bridges: String,
}

/// All network settings, as they appear in a settings form.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::exhaustive_structs)]
pub struct SettingsBundle {
    /// Proxy settings.
    pub proxy_settings: ProxyForm,
    /// Firewall settings.
    pub firewall_settings: FirewallForm,
    /// Bridge settings.
    pub bridge_settings: BridgeForm,
}

/// A proxy for Tor to connect through.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ProxySettings {
    /// Connect directly.
    #[default]
    None,
    /// A SOCKS4 proxy at `addr`.
    Socks4 {
        /// `host:port`.
        addr: String,
    },
    /// A SOCKS5 proxy at `addr`.
    Socks5 {
        /// `host:port`.
        addr: String,
        /// Username, if any.
        username: Option<String>,
        /// Password, if any.
        password: Option<Sensitive<String>>,
    },
    /// An HTTP(S) proxy at `addr`.
    Http {
        /// `host:port`.
        addr: String,
        /// Username, if any.
        username: Option<String>,
        /// Password, if any.
        password: Option<Sensitive<String>>,
    },
}

/// Which ports Tor may connect to.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct FirewallSettings {
    /// The allowed ports, or `None` if every port is allowed.
    pub allowed_ports: Option<Vec<u16>>,
}

/// Which bridges Tor should use.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum BridgeSettings {
    /// Connect to relays directly.
    #[default]
    Disabled,
    /// Use the default bridges of a type.
    Default {
        /// The transport type.
        bridge_type: String,
    },
    /// Use bridges the user supplied.
    Custom {
        /// Bridge lines, without any leading `bridge`.
        bridges: Vec<String>,
    },
}

/// Validated network settings.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct NetworkSettings {
    /// Proxy settings.
    pub proxy: ProxySettings,
    /// Firewall settings.
    pub firewall: FirewallSettings,
    /// Bridge settings.
    pub bridges: BridgeSettings,
}

/// Return `s` trimmed, or `None` if that leaves nothing.
fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

/// Parse a port number.
fn parse_port(s: &str) -> std::result::Result<u16, ValidationError> {
    s.trim()
        .parse()
        .map_err(|_| ValidationError::InvalidPort(s.trim().to_owned()))
}

/// Split `s` at its first colon.
///
/// Returns the whole of `s` as the first part if it has no colon.
fn split_colon(s: &str) -> (&str, &str) {
    s.split_once(':').unwrap_or((s, ""))
}

/// Return `first:second`, or just `first` if `second` is empty.
fn join_colon(first: &str, second: &str) -> String {
    if second.is_empty() {
        first.to_owned()
    } else {
        format!("{}:{}", first, second)
    }
}

/// Turn free-form bridge text into bridge lines.
///
/// Any word `bridge` is dropped (in any case), as are blank lines.
pub fn parse_bridge_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.split_whitespace()
                .filter(|w| !w.eq_ignore_ascii_case("bridge"))
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Prefix each bridge line with `bridge`, for display.
fn display_bridge_lines<'a>(lines: impl IntoIterator<Item = &'a String>) -> String {
    lines
        .into_iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| {
            if l.to_ascii_lowercase().starts_with("bridge") {
                l.to_owned()
            } else {
                format!("bridge {}", l)
            }
        })
        .join("\n")
}

impl SettingsBundle {
    /// Decode a settings bundle from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encode this settings bundle as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check these settings, and return them in typed form.
    pub fn validate(&self) -> std::result::Result<NetworkSettings, ValidationError> {
        Ok(NetworkSettings {
            proxy: self.proxy_settings.validate()?,
            firewall: self.firewall_settings.validate()?,
            bridges: self.bridge_settings.validate()?,
        })
    }
}

impl ProxyForm {
    /// Check the proxy settings.
    fn validate(&self) -> std::result::Result<ProxySettings, ValidationError> {
        if !self.use_proxy {
            return Ok(ProxySettings::None);
        }
        let address = non_empty(&self.address).ok_or(ValidationError::ProxyAddrMissing)?;
        let proxy_type = self.proxy_type.ok_or(ValidationError::ProxyTypeMissing)?;
        let addr = match non_empty(&self.port) {
            Some(port) => format!("{}:{}", address, parse_port(&port)?),
            None => address,
        };
        let username = non_empty(&self.username);
        let password = non_empty(&self.password).map(Sensitive::new);
        Ok(match proxy_type {
            ProxyType::Socks4 => ProxySettings::Socks4 { addr },
            ProxyType::Socks5 => ProxySettings::Socks5 {
                addr,
                username,
                password,
            },
            ProxyType::Http => ProxySettings::Http {
                addr,
                username,
                password,
            },
        })
    }
}

impl FirewallForm {
    /// Check the firewall settings.
    fn validate(&self) -> std::result::Result<FirewallSettings, ValidationError> {
        if !self.use_firewall_ports {
            return Ok(FirewallSettings::default());
        }
        let ports = self
            .allowed_ports
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(parse_port)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(FirewallSettings {
            allowed_ports: (!ports.is_empty()).then_some(ports),
        })
    }
}

impl BridgeForm {
    /// Check the bridge settings.
    fn validate(&self) -> std::result::Result<BridgeSettings, ValidationError> {
        if !self.use_bridges {
            return Ok(BridgeSettings::Disabled);
        }
        if self.use_default {
            let bridge_type = non_empty(&self.default_bridge_type)
                .ok_or(ValidationError::DefaultBridgesTypeMissing)?;
            return Ok(BridgeSettings::Default { bridge_type });
        }
        let bridges = parse_bridge_lines(&self.custom_bridges);
        if bridges.is_empty() {
            return Err(ValidationError::BridgesMissing);
        }
        Ok(BridgeSettings::Custom { bridges })
    }
}

impl NetworkSettings {
    /// Return these settings in the form a settings form uses.
    pub fn to_form(&self) -> SettingsBundle {
        let proxy_settings = match &self.proxy {
            ProxySettings::None => ProxyForm::default(),
            ProxySettings::Socks4 { addr } => proxy_form(ProxyType::Socks4, addr, &None, &None),
            ProxySettings::Socks5 {
                addr,
                username,
                password,
            } => proxy_form(ProxyType::Socks5, addr, username, password),
            ProxySettings::Http {
                addr,
                username,
                password,
            } => proxy_form(ProxyType::Http, addr, username, password),
        };
        let firewall_settings = match &self.firewall.allowed_ports {
            Some(ports) => FirewallForm {
                use_firewall_ports: true,
                allowed_ports: ports.iter().join(","),
            },
            None => FirewallForm::default(),
        };
        let bridge_settings = match &self.bridges {
            BridgeSettings::Disabled => BridgeForm::default(),
            BridgeSettings::Default { bridge_type } => BridgeForm {
                use_bridges: true,
                use_default: true,
                default_bridge_type: bridge_type.clone(),
                custom_bridges: String::new(),
            },
            BridgeSettings::Custom { bridges } => BridgeForm {
                use_bridges: true,
                use_default: false,
                default_bridge_type: String::new(),
                custom_bridges: display_bridge_lines(bridges),
            },
        };
        SettingsBundle {
            proxy_settings,
            firewall_settings,
            bridge_settings,
        }
    }

    /// Return the `SETCONF` changes for the proxy settings.
    ///
    /// Every proxy option is either set or cleared.
    fn proxy_changes(&self) -> SetConf {
        let mut changes = SetConf::new();
        for key in [
            SOCKS4_PROXY,
            SOCKS5_PROXY,
            SOCKS5_PROXY_USERNAME,
            SOCKS5_PROXY_PASSWORD,
            HTTPS_PROXY,
            HTTPS_PROXY_AUTHENTICATOR,
        ] {
            let value = match &self.proxy {
                ProxySettings::None => None,
                ProxySettings::Socks4 { addr } => (key == SOCKS4_PROXY).then(|| addr.clone()),
                ProxySettings::Socks5 {
                    addr,
                    username,
                    password,
                } => match key {
                    SOCKS5_PROXY => Some(addr.clone()),
                    SOCKS5_PROXY_USERNAME => username.clone(),
                    SOCKS5_PROXY_PASSWORD => password.as_ref().map(|p| p.as_inner().clone()),
                    _ => None,
                },
                ProxySettings::Http {
                    addr,
                    username,
                    password,
                } => match key {
                    HTTPS_PROXY => Some(addr.clone()),
                    HTTPS_PROXY_AUTHENTICATOR => {
                        http_authenticator(username.as_deref(), password.as_ref())
                    }
                    _ => None,
                },
            };
            changes.push(key, value);
        }
        changes
    }

    /// Return the `SETCONF` changes for the firewall settings.
    fn firewall_changes(&self) -> SetConf {
        let value = match &self.firewall.allowed_ports {
            Some(ports) => ConfValue::String(ports.iter().map(|p| format!("*:{}", p)).join(",")),
            None => ConfValue::Clear,
        };
        SetConf::new().set(REACHABLE_ADDRESSES, value)
    }
}

/// Build a [`ProxyForm`] for a configured proxy.
fn proxy_form(
    proxy_type: ProxyType,
    addr: &str,
    username: &Option<String>,
    password: &Option<Sensitive<String>>,
) -> ProxyForm {
    let (address, port) = addr.rsplit_once(':').unwrap_or((addr, ""));
    ProxyForm {
        use_proxy: true,
        proxy_type: Some(proxy_type),
        address: address.to_owned(),
        port: port.to_owned(),
        username: username.clone().unwrap_or_default(),
        password: password
            .as_ref()
            .map(|p| p.as_inner().clone())
            .unwrap_or_default(),
    }
}

/// Return the value for `HTTPSProxyAuthenticator`.
fn http_authenticator(username: Option<&str>, password: Option<&Sensitive<String>>) -> Option<String> {
    match (username, password) {
        (None, None) => None,
        (u, p) => Some(join_colon(
            u.unwrap_or_default(),
            p.map(|p| p.as_inner().as_str()).unwrap_or_default(),
        )),
    }
}

/// Read the current network settings from Tor and the preferences.
pub async fn read_settings<R: Runtime>(
    client: &ProtocolClient<R>,
    prefs: &Preferences,
) -> Result<NetworkSettings> {
    Ok(NetworkSettings {
        proxy: read_proxy(client).await?,
        firewall: read_firewall(client).await?,
        bridges: read_bridges(client, prefs).await?,
    })
}

/// Read the proxy settings from Tor.
async fn read_proxy<R: Runtime>(client: &ProtocolClient<R>) -> Result<ProxySettings> {
    let opt = |s: String| (!s.is_empty()).then_some(s);

    let addr = client.get_conf_string(SOCKS4_PROXY, "").await?;
    if !addr.is_empty() {
        return Ok(ProxySettings::Socks4 { addr });
    }

    let addr = client.get_conf_string(SOCKS5_PROXY, "").await?;
    if !addr.is_empty() {
        let username = opt(client.get_conf_string(SOCKS5_PROXY_USERNAME, "").await?);
        let password = opt(client.get_conf_string(SOCKS5_PROXY_PASSWORD, "").await?);
        return Ok(ProxySettings::Socks5 {
            addr,
            username,
            password: password.map(Sensitive::new),
        });
    }

    let addr = client.get_conf_string(HTTPS_PROXY, "").await?;
    if !addr.is_empty() {
        let auth = client
            .get_conf_string(HTTPS_PROXY_AUTHENTICATOR, "")
            .await?;
        let (username, password) = split_colon(&auth);
        return Ok(ProxySettings::Http {
            addr,
            username: opt(username.to_owned()),
            password: opt(password.to_owned()).map(Sensitive::new),
        });
    }

    Ok(ProxySettings::None)
}

/// Read the firewall settings from Tor.
async fn read_firewall<R: Runtime>(client: &ProtocolClient<R>) -> Result<FirewallSettings> {
    let values = client.get_conf(REACHABLE_ADDRESSES).await?;
    let ports: Vec<u16> = values
        .iter()
        .flat_map(|v| v.split(','))
        .filter_map(|entry| {
            let (_, port) = split_colon(entry.trim());
            port.parse().ok()
        })
        .collect();
    Ok(FirewallSettings {
        allowed_ports: (!ports.is_empty()).then_some(ports),
    })
}

/// Read the bridge settings from the preferences, or from Tor.
async fn read_bridges<R: Runtime>(
    client: &ProtocolClient<R>,
    prefs: &Preferences,
) -> Result<BridgeSettings> {
    let available = prefs.default_bridge_types();
    if let Some(bridge_type) = prefs.default_bridge_type() {
        if !available.is_empty() {
            return Ok(BridgeSettings::Default { bridge_type });
        }
    }

    if !client.get_conf_bool(USE_BRIDGES, false).await? {
        return Ok(BridgeSettings::Disabled);
    }
    let bridges: Vec<String> = client
        .get_conf(BRIDGE)
        .await?
        .into_iter()
        .filter_map(|b| non_empty(&b))
        .collect();
    if !bridges.is_empty() {
        return Ok(BridgeSettings::Custom { bridges });
    }
    // No custom bridges: fall back to a default set if there is one.
    Ok(match available.into_iter().next() {
        Some(bridge_type) => BridgeSettings::Default { bridge_type },
        None => BridgeSettings::Disabled,
    })
}

/// Send one batch of changes, describing any failure for the user.
async fn send_changes<R: Runtime>(client: &ProtocolClient<R>, changes: &SetConf) -> Result<()> {
    client
        .set_conf_with_reply(changes)
        .await
        .map_err(|e| LauncherError::SettingsRejected { details: e.details })
}

/// Give `settings` to Tor, enable the network, and save Tor's
/// configuration.
///
/// The default bridge type is stored in `prefs`.  Stops at the first change
/// Tor refuses.
pub async fn apply_settings<R: Runtime>(
    client: &ProtocolClient<R>,
    prefs: &Preferences,
    settings: &NetworkSettings,
) -> Result<()> {
    // Work out the bridges before changing anything.
    let (default_type, bridges) = match &settings.bridges {
        BridgeSettings::Disabled => (None, None),
        BridgeSettings::Default { bridge_type } => {
            let bridges = prefs.default_bridges_of_type(bridge_type);
            if bridges.is_empty() {
                return Err(ValidationError::DefaultBridgesUnavailable(bridge_type.clone()).into());
            }
            (Some(bridge_type.as_str()), Some(bridges))
        }
        BridgeSettings::Custom { bridges } => (None, Some(bridges.clone())),
    };

    send_changes(client, &settings.proxy_changes()).await?;
    send_changes(client, &settings.firewall_changes()).await?;

    prefs.set_default_bridge_type(default_type);
    let bridge_changes = match bridges {
        Some(bridges) => SetConf::new().set(USE_BRIDGES, true).set(BRIDGE, bridges),
        None => SetConf::new()
            .set(USE_BRIDGES, ConfValue::Clear)
            .set(BRIDGE, ConfValue::Clear),
    };
    send_changes(client, &bridge_changes).await?;

    send_changes(client, &SetConf::new().set("DisableNetwork", false)).await?;
    client.save_conf().await.map_err(|e| {
        debug!("SAVECONF failed: {}", e);
        LauncherError::SettingsRejected {
            details: e.report().to_string(),
        }
    })?;
    info!("Network settings applied");
    Ok(())
}
