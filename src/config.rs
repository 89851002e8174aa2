//! The translator's configuration file.
//!
//! The format is line oriented: one `directive value...` per line, with
//! `#` comments and blank lines ignored. Unknown directives are fatal so a
//! typo cannot silently disable an option.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use ipnet::{Ipv4Net, Ipv6Net};

/// Minimum MTU the translator will operate with (the IPv6 minimum link MTU).
pub const MTU_MIN: u32 = 1280;

/// Default number of address-cache entries.
const DEFAULT_CACHE_SIZE: usize = 8192;

/// Default idle timeout for dynamic bindings, in seconds.
const DEFAULT_POOL_TIMEOUT: u64 = 7200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Validated configuration record. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the TUN interface to attach to
    pub tun_device: String,
    /// The translator's own IPv4 address (used as the source of ICMPv4
    /// errors, and answering pings)
    pub local4: Ipv4Addr,
    /// The translator's own IPv6 address
    pub local6: Ipv6Addr,
    /// Static 1:1 address pairs, in configuration order
    pub static_maps: Vec<(Ipv4Addr, Ipv6Addr)>,
    /// RFC6052 translation prefix
    pub prefix: Option<Ipv6Net>,
    /// IPv4 range leased out to unmapped IPv6 sources
    pub dynamic_pool: Option<Ipv4Net>,
    /// Directory holding the persistent binding table (none = no persistence)
    pub data_dir: Option<PathBuf>,
    /// Address cache entries; 0 disables the cache
    pub cache_size: usize,
    /// Reject fragment headers that appear out of canonical order
    pub strict_frag_hdr: bool,
    /// Refuse to translate private IPv4 space under 64:ff9b::/96
    pub wkpf_strict: bool,
    /// Egress MTU override; defaults to the TUN device MTU
    pub offlink_mtu: Option<u32>,
    /// Idle seconds before a dynamic binding is reclaimed
    pub pool_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tun_device: String::new(),
            local4: Ipv4Addr::UNSPECIFIED,
            local6: Ipv6Addr::UNSPECIFIED,
            static_maps: Vec::new(),
            prefix: None,
            dynamic_pool: None,
            data_dir: None,
            cache_size: DEFAULT_CACHE_SIZE,
            strict_frag_hdr: false,
            wkpf_strict: false,
            offlink_mtu: None,
            pool_timeout: DEFAULT_POOL_TIMEOUT,
        }
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parse and validate config text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut seen: Vec<&str> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let directive = fields.next().unwrap();
            let args: Vec<&str> = fields.collect();

            let fail = |message: String| ConfigError::Syntax {
                line: lineno + 1,
                message,
            };

            // `map` may repeat; everything else may appear only once
            if directive != "map" {
                if seen.contains(&directive) {
                    return Err(fail(format!("duplicate directive `{directive}`")));
                }
                seen.push(directive);
            }

            match directive {
                "tun-device" => config.tun_device = one(&args).map_err(&fail)?.to_string(),
                "ipv4-addr" => config.local4 = parse_arg(one(&args), "IPv4 address").map_err(&fail)?,
                "ipv6-addr" => config.local6 = parse_arg(one(&args), "IPv6 address").map_err(&fail)?,
                "prefix" => {
                    config.prefix = Some(parse_arg(one(&args), "IPv6 prefix").map_err(&fail)?);
                }
                "dynamic-pool" => {
                    config.dynamic_pool = Some(parse_arg(one(&args), "IPv4 prefix").map_err(&fail)?);
                }
                "map" => {
                    if args.len() != 2 {
                        return Err(fail("map takes an IPv4 and an IPv6 address".to_string()));
                    }
                    let v4 = parse_arg(Ok(args[0]), "IPv4 address").map_err(&fail)?;
                    let v6 = parse_arg(Ok(args[1]), "IPv6 address").map_err(&fail)?;
                    config.static_maps.push((v4, v6));
                }
                "data-dir" => {
                    let dir = one(&args).map_err(&fail)?;
                    if !dir.is_empty() {
                        config.data_dir = Some(PathBuf::from(dir));
                    }
                }
                "cache-size" => config.cache_size = parse_arg(one(&args), "number").map_err(&fail)?,
                "strict-frag-hdr" => config.strict_frag_hdr = parse_bool(one(&args)).map_err(&fail)?,
                "wkpf-strict" => config.wkpf_strict = parse_bool(one(&args)).map_err(&fail)?,
                "offlink-mtu" => {
                    config.offlink_mtu = Some(parse_arg(one(&args), "MTU").map_err(&fail)?);
                }
                "pool-timeout" => config.pool_timeout = parse_arg(one(&args), "seconds").map_err(&fail)?,
                other => return Err(fail(format!("unknown directive `{other}`"))),
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.tun_device.is_empty() {
            return invalid("tun-device is required".into());
        }
        if self.local4.is_unspecified() {
            return invalid("ipv4-addr is required".into());
        }
        if self.local6.is_unspecified() {
            return invalid("ipv6-addr is required".into());
        }
        if self.prefix.is_none() && self.static_maps.is_empty() {
            return invalid("nothing to translate: no prefix and no map entries".into());
        }

        if let Some(prefix) = self.prefix {
            if !prefix64::ALLOWED_PREFIX_LENS.contains(&prefix.prefix_len()) {
                return invalid(format!(
                    "prefix length /{} is not one of {:?}",
                    prefix.prefix_len(),
                    prefix64::ALLOWED_PREFIX_LENS
                ));
            }
            if prefix.addr() != prefix.network() {
                return invalid(format!("prefix {prefix} has host bits set"));
            }
            if prefix.prefix_len() == 96 && prefix.addr().octets()[8] != 0 {
                return invalid(format!("prefix {prefix} has nonzero bits 64..71"));
            }
            if prefix.contains(&self.local6) {
                return invalid(format!(
                    "ipv6-addr {} must not fall inside translation prefix {prefix}",
                    self.local6
                ));
            }
        }

        if let Some(pool) = self.dynamic_pool {
            if pool.addr() != pool.network() {
                return invalid(format!("dynamic-pool {pool} has host bits set"));
            }
        }

        for (i, (v4, v6)) in self.static_maps.iter().enumerate() {
            if *v4 == self.local4 {
                return invalid(format!("map {v4} collides with ipv4-addr"));
            }
            if *v6 == self.local6 {
                return invalid(format!("map {v6} collides with ipv6-addr"));
            }
            for (other4, other6) in &self.static_maps[..i] {
                if v4 == other4 || v6 == other6 {
                    return invalid(format!("map {v4} {v6} overlaps an earlier map entry"));
                }
            }
        }

        if let Some(mtu) = self.offlink_mtu {
            if mtu < MTU_MIN {
                return invalid(format!("offlink-mtu {mtu} is below the minimum of {MTU_MIN}"));
            }
        }

        Ok(())
    }
}

fn one<'a>(args: &[&'a str]) -> Result<&'a str, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err("expected exactly one argument".to_string()),
    }
}

fn parse_arg<T: std::str::FromStr>(arg: Result<&str, String>, what: &str) -> Result<T, String> {
    let arg = arg?;
    arg.parse().map_err(|_| format!("`{arg}` is not a valid {what}"))
}

fn parse_bool(arg: Result<&str, String>) -> Result<bool, String> {
    match arg? {
        "yes" | "on" | "true" => Ok(true),
        "no" | "off" | "false" => Ok(false),
        other => Err(format!("`{other}` is not a boolean (yes/no)")),
    }
}
