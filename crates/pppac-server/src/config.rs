//! Configuration: a flat string-keyed property map with dotted keys
//! (`pool.<label>.pool`, `realm.<label>.*`, `interface.<name>.*`), and
//! the typed configuration derived from it.
//!
//! Reload parses a whole new map and derives everything again; only when
//! that succeeds does the daemon swap generations, so a malformed file
//! never disturbs the running configuration.

use crate::eap_auth::EapTimers;
use crate::iface::{Iface, IpAssign, DEFAULT_IFACE_MAX_SESSION};
use crate::pool::{AddressRange, PoolBuildError, RangeParseError};
use crate::realm::{Realm, RealmError};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_SESSION: usize = 512;
pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/pppacd.sock";
pub const DEFAULT_CONTROL_MAX_MSGSZ: usize = 8192;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    #[error("{key}: {reason}")]
    Value { key: String, reason: String },

    #[error(transparent)]
    Range(#[from] RangeParseError),

    #[error(transparent)]
    Realm(#[from] RealmError),

    #[error(transparent)]
    Pool(#[from] PoolBuildError),

    #[error("interface '{iface}' names unknown pool '{pool}'")]
    UnknownPool { iface: String, pool: String },
}

/// The raw property map. Keys are dotted paths, values opaque strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    map: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Properties::default()
    }

    /// Parse `key: value` lines; `#` starts a comment, blank lines are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or(ConfigError::Syntax {
                line: lineno + 1,
                reason: "expected 'key: value'".to_string(),
            })?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(ConfigError::Syntax {
                    line: lineno + 1,
                    reason: format!("malformed key '{key}'"),
                });
            }
            map.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Properties { map })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Properties::parse(&std::fs::read_to_string(path)?)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Comma/whitespace separated list value.
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split([',', ' ', '\t'])
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    pub fn usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        self.parsed(key)
    }

    pub fn u32(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        self.parsed(key)
    }

    pub fn ipv4(&self, key: &str) -> Result<Option<Ipv4Addr>, ConfigError> {
        self.parsed(key)
    }

    pub fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.u32(key)?.map(|v| Duration::from_secs(v as u64)))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::Value {
                key: key.to_string(),
                reason: format!("cannot parse '{raw}'"),
            }),
        }
    }

    /// Distinct `<label>` segments of keys shaped `<prefix>.<label>.<attr>`.
    /// A key shaped `<prefix>.<attr>` with `attr` in `flat_attrs`
    /// contributes the empty label.
    pub fn labels_under(&self, prefix: &str, flat_attrs: &[&str]) -> Vec<String> {
        let want = format!("{prefix}.");
        let mut labels: Vec<String> = Vec::new();
        for key in self.map.keys() {
            let rest = match key.strip_prefix(&want) {
                Some(rest) => rest,
                None => continue,
            };
            let label = match rest.split_once('.') {
                Some((label, _)) => label.to_string(),
                None if flat_attrs.contains(&rest) => String::new(),
                None => continue,
            };
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }
}

/// Pool specification lifted from the map; built into a live `PoolSet`
/// by the daemon so reload can carry sessions over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub label: String,
    pub static_ranges: Vec<AddressRange>,
    pub dynamic_ranges: Vec<AddressRange>,
}

/// Everything derived from one generation of the property map.
#[derive(Debug)]
pub struct DaemonConfig {
    pub max_session: usize,
    pub user_max_session: usize,
    pub log_level: Option<String>,
    pub realm_list: Option<Vec<String>>,
    pub pools: Vec<PoolConfig>,
    pub realms: Vec<Realm>,
    pub ifaces: Vec<Iface>,
    /// Local interface addresses; classifying one is always Reserved.
    pub local_addrs: Vec<Ipv4Addr>,
    pub control_socket: PathBuf,
    pub control_max_msgsz: usize,
    pub eap: EapTimers,
}

const REALM_FLAT_ATTRS: &[&str] = &[
    "type",
    "suffix",
    "prefix",
    "users_file",
    "server",
    "secret",
    "timeout",
];

impl DaemonConfig {
    pub fn derive(props: &Properties) -> Result<Self, ConfigError> {
        let mut pools = Vec::new();
        for label in props.labels_under("pool", &[]) {
            let static_ranges = match props.get(&format!("pool.{label}.pool")) {
                Some(spec) => AddressRange::parse_list(spec)?,
                None => Vec::new(),
            };
            let dynamic_ranges = match props.get(&format!("pool.{label}.dyna_pool")) {
                Some(spec) => AddressRange::parse_list(spec)?,
                None => Vec::new(),
            };
            pools.push(PoolConfig {
                label,
                static_ranges,
                dynamic_ranges,
            });
        }

        let mut realms = Vec::new();
        for label in props.labels_under("realm", REALM_FLAT_ATTRS) {
            // `concentrate` keys map realms to interfaces, they do not
            // declare one.
            if label == "concentrate" {
                continue;
            }
            realms.push(derive_realm(props, &label)?);
        }

        let user_max_session = props.usize("daemon.user_max_session")?.unwrap_or(0);
        let mut ifaces = Vec::new();
        let mut local_addrs = Vec::new();
        for name in props.labels_under("interface", &[]) {
            let ip_assign = match props.get(&format!("interface.{name}.ip_assign")) {
                Some(spec) => IpAssign::parse(spec).map_err(|reason| ConfigError::Value {
                    key: format!("interface.{name}.ip_assign"),
                    reason,
                })?,
                None => IpAssign::default(),
            };
            let pool_list = props
                .list(&format!("interface.{name}.pool_list"))
                .unwrap_or_default();
            for pool in &pool_list {
                if !pools.iter().any(|p| p.label == *pool) {
                    return Err(ConfigError::UnknownPool {
                        iface: name.clone(),
                        pool: pool.clone(),
                    });
                }
            }
            if let Some(addr) = props.ipv4(&format!("interface.{name}.address"))? {
                local_addrs.push(addr);
            }
            ifaces.push(Iface::new(
                &name,
                props
                    .usize(&format!("interface.{name}.max_session"))?
                    .unwrap_or(DEFAULT_IFACE_MAX_SESSION),
                props
                    .usize(&format!("interface.{name}.user_max_session"))?
                    .unwrap_or(user_max_session),
                ip_assign,
                pool_list,
            ));
        }

        Ok(DaemonConfig {
            max_session: props.usize("daemon.max_session")?.unwrap_or(DEFAULT_MAX_SESSION),
            user_max_session,
            log_level: props.get("log_level").map(str::to_string),
            realm_list: props.list("realm_list"),
            pools,
            realms,
            ifaces,
            local_addrs,
            control_socket: PathBuf::from(
                props.get_or("control.socket", DEFAULT_CONTROL_SOCKET),
            ),
            control_max_msgsz: props
                .usize("control.max_msgsz")?
                .unwrap_or(DEFAULT_CONTROL_MAX_MSGSZ),
            eap: EapTimers {
                restart_limit: props.u32("auth.eap.retry")?.unwrap_or(EapTimers::DEFAULT_RESTART_LIMIT),
                timeout: props
                    .secs("auth.eap.timeout")?
                    .unwrap_or(EapTimers::DEFAULT_TIMEOUT),
                timeout_cap: props
                    .secs("auth.eap.timeout_cap")?
                    .unwrap_or(EapTimers::DEFAULT_TIMEOUT_CAP),
            },
        })
    }

    /// Which `concentrate` mapping applies to a session, given whether
    /// the peer was authenticated and through which realm.
    pub fn concentrate_key(peer_auth: bool, realm_label: Option<&str>) -> String {
        if !peer_auth {
            return "no_auth.concentrate".to_string();
        }
        match realm_label {
            Some(label) if !label.is_empty() => format!("realm.{label}.concentrate"),
            _ => "realm.concentrate".to_string(),
        }
    }
}

fn derive_realm(props: &Properties, label: &str) -> Result<Realm, ConfigError> {
    let key = |attr: &str| {
        if label.is_empty() {
            format!("realm.{attr}")
        } else {
            format!("realm.{label}.{attr}")
        }
    };
    let suffix = props.get_or(&key("suffix"), "").to_string();
    let prefix = props.get_or(&key("prefix"), "").to_string();
    match props.get_or(&key("type"), "local") {
        "local" => {
            let users_key = key("users_file");
            match props.get(&users_key) {
                Some(path) => {
                    Ok(Realm::local_from_file(label, &suffix, &prefix, Path::new(path))?)
                }
                None => Ok(Realm::local(label, &suffix, &prefix, Vec::new())),
            }
        }
        "radius" => {
            let server_key = key("server");
            let server = props.get(&server_key).ok_or(ConfigError::Value {
                key: server_key,
                reason: "radius realm needs a server".to_string(),
            })?;
            let secret_key = key("secret");
            let secret = props.get(&secret_key).ok_or(ConfigError::Value {
                key: secret_key,
                reason: "radius realm needs a secret".to_string(),
            })?;
            Ok(Realm::radius(
                label,
                &suffix,
                &prefix,
                server,
                secret,
                props.secs(&key("timeout"))?,
            )?)
        }
        other => Err(ConfigError::Value {
            key: key("type"),
            reason: format!("unknown realm type '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# pools
pool.default.pool: 10.0.0.2/30
pool.default.dyna_pool: 10.0.0.4/30

realm_list: local radius
realm.local.type: local
realm.radius.type: radius
realm.radius.suffix: @example.com
realm.radius.server: 127.0.0.1:1812
realm.radius.secret: s3cr3t
realm.radius.concentrate: tun0
realm.local.concentrate: tun0
no_auth.concentrate: tun0

interface.tun0.address: 10.0.0.1
interface.tun0.pool_list: default
interface.tun0.ip_assign: user_select,nas_select,radius
interface.tun0.max_session: 10

daemon.max_session: 100
daemon.user_max_session: 2
control.max_msgsz: 2048
";

    #[test]
    fn parse_sample_properties() {
        let props = Properties::parse(SAMPLE).unwrap();
        assert_eq!(props.get("pool.default.pool"), Some("10.0.0.2/30"));
        assert_eq!(
            props.list("realm_list"),
            Some(vec!["local".to_string(), "radius".to_string()])
        );
        assert_eq!(props.get("missing"), None);
        assert_eq!(props.usize("daemon.max_session").unwrap(), Some(100));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = Properties::parse("ok: 1\nbroken line\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 2, .. }));
        let err = Properties::parse("two words: 1").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }

    #[test]
    fn derive_builds_full_config() {
        let props = Properties::parse(SAMPLE).unwrap();
        let config = DaemonConfig::derive(&props).unwrap();

        assert_eq!(config.max_session, 100);
        assert_eq!(config.user_max_session, 2);
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].label, "default");
        assert_eq!(config.pools[0].static_ranges.len(), 1);
        assert_eq!(config.pools[0].dynamic_ranges.len(), 1);

        assert_eq!(config.realms.len(), 2);
        let radius = config.realms.iter().find(|r| r.label() == "radius").unwrap();
        assert!(radius.is_radius());
        assert_eq!(radius.suffix(), "@example.com");

        assert_eq!(config.ifaces.len(), 1);
        let tun0 = &config.ifaces[0];
        assert_eq!(tun0.max_session(), 10);
        assert_eq!(tun0.user_max_session(), 2);
        assert!(tun0.ip_assign().radius);
        assert!(!tun0.ip_assign().fixed);
        assert_eq!(config.local_addrs, vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(config.control_max_msgsz, 2048);
    }

    #[test]
    fn unknown_pool_in_pool_list_rejected() {
        let props =
            Properties::parse("interface.tun0.pool_list: nosuch\n").unwrap();
        assert!(matches!(
            DaemonConfig::derive(&props),
            Err(ConfigError::UnknownPool { .. })
        ));
    }

    #[test]
    fn radius_realm_without_secret_rejected() {
        let props = Properties::parse(
            "realm.r.type: radius\nrealm.r.server: 127.0.0.1:1812\n",
        )
        .unwrap();
        assert!(matches!(
            DaemonConfig::derive(&props),
            Err(ConfigError::Value { .. })
        ));
    }

    #[test]
    fn malformed_pool_spec_rejected() {
        let props = Properties::parse("pool.p.pool: 10.0.0.0/40\n").unwrap();
        assert!(matches!(
            DaemonConfig::derive(&props),
            Err(ConfigError::Range(_))
        ));
    }

    #[test]
    fn empty_label_realm_uses_flat_keys() {
        let props = Properties::parse(
            "realm.type: radius\nrealm.server: 10.0.0.9:1812\nrealm.secret: x\n",
        )
        .unwrap();
        let config = DaemonConfig::derive(&props).unwrap();
        assert_eq!(config.realms.len(), 1);
        assert_eq!(config.realms[0].label(), "");
    }

    #[test]
    fn concentrate_key_shapes() {
        assert_eq!(
            DaemonConfig::concentrate_key(false, None),
            "no_auth.concentrate"
        );
        assert_eq!(
            DaemonConfig::concentrate_key(true, Some("radius")),
            "realm.radius.concentrate"
        );
        assert_eq!(
            DaemonConfig::concentrate_key(true, Some("")),
            "realm.concentrate"
        );
    }
}
