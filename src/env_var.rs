use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_ping_timeout() -> f64 {
    2.0
}

fn default_static_size() -> usize {
    64 * 1024
}

fn default_barrier_algorithm() -> String {
    "linear".to_owned()
}

fn default_broadcast_algorithm() -> String {
    "tree".to_owned()
}

fn default_collect_algorithm() -> String {
    "wavefront".to_owned()
}

fn default_fcollect_algorithm() -> String {
    "linear".to_owned()
}

fn default_alltoall_algorithm() -> String {
    "direct".to_owned()
}

fn default_lock_legacy_zero() -> bool {
    true
}

/// How a PE waits on a completion marker or a symmetric cell.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// busy poll, never yield the core
    Spin,
    /// yield/park between polls
    Block,
    /// spin for a short while, then fall back to yielding
    SpinBlock,
}

fn default_wait_mode() -> WaitMode {
    WaitMode::SpinBlock
}

/// How PEs learn each other's segment {base,size} at init.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentExchange {
    /// the transport publishes the segment table itself
    Transport,
    /// every PE sends its segment info to every other PE and waits for acks
    Handshake,
}

fn default_segment_exchange() -> SegmentExchange {
    SegmentExchange::Transport
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds for blocking waits which may indicate a deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// Deadline in seconds for the PE reachability probe, default: 2.0 seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: f64,

    /// Size of the symmetric heap, accepts k/m/g/t suffixes (e.g. "64m"). Defaults to the transport maximum.
    pub symmetric_size: Option<String>,

    /// Size in bytes of the statically symmetric segment, default: 64KiB
    #[serde(default = "default_static_size")]
    pub static_size: usize,

    /// barrier algorithm: linear, dissemination, transport
    #[serde(default = "default_barrier_algorithm")]
    pub barrier_algorithm: String,

    /// broadcast algorithm: linear, tree
    #[serde(default = "default_broadcast_algorithm")]
    pub broadcast_algorithm: String,

    /// collect algorithm: wavefront
    #[serde(default = "default_collect_algorithm")]
    pub collect_algorithm: String,

    /// fcollect algorithm: linear, wavefront
    #[serde(default = "default_fcollect_algorithm")]
    pub fcollect_algorithm: String,

    /// alltoall algorithm: direct, shifted
    #[serde(default = "default_alltoall_algorithm")]
    pub alltoall_algorithm: String,

    #[serde(default = "default_wait_mode")]
    pub wait_mode: WaitMode,

    #[serde(default = "default_segment_exchange")]
    pub segment_exchange: SegmentExchange,

    /// broadcast-and-compare the size of every symmetric allocation, default: on in debug builds
    pub symmetric_check: Option<bool>,

    /// treat an all zero lock word as a reset lock, default: true
    #[serde(default = "default_lock_legacy_zero")]
    pub lock_legacy_zero: bool,

    /// tracing filter directive, e.g. "debug" or "rshmem::atomic=trace"
    pub log_level: Option<String>,
    /// write log output to this file instead of stderr
    pub log_file: Option<String>,

    /// flag used to print warnings when a nonblocking handle is dropped without being waited on. Default: true
    pub dropped_handle_warning: Option<bool>,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("RSHMEM_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}

/// An error produced when a size string such as `"16m"` cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeParseError(pub String);

impl std::fmt::Display for SizeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "unable to parse size {:?}", self.0)
    }
}

impl std::error::Error for SizeParseError {}

/// Parse a byte count with an optional k/m/g/t suffix (binary multiples, case insensitive).
///
/// ```
/// assert_eq!(rshmem::parse_size("4k").unwrap(), 4096);
/// assert_eq!(rshmem::parse_size("2M").unwrap(), 2 * 1024 * 1024);
/// assert_eq!(rshmem::parse_size("100").unwrap(), 100);
/// ```
pub fn parse_size(size: &str) -> Result<usize, SizeParseError> {
    let trimmed = size.trim();
    let err = || SizeParseError(size.to_owned());
    let (digits, shift) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_lowercase() {
                'k' => 10,
                'm' => 20,
                'g' => 30,
                't' => 40,
                _ => return Err(err()),
            };
            (&trimmed[..trimmed.len() - 1], shift)
        }
        Some(_) => (trimmed, 0),
        None => return Err(err()),
    };
    let value = digits.trim().parse::<usize>().map_err(|_| err())?;
    value.checked_shl(shift).filter(|v| v >> shift == value).ok_or_else(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_suffixed_sizes() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("1k"), Ok(1024));
        assert_eq!(parse_size("3K"), Ok(3 * 1024));
        assert_eq!(parse_size("64m"), Ok(64 << 20));
        assert_eq!(parse_size("1g"), Ok(1 << 30));
        assert_eq!(parse_size(" 2t "), Ok(2 << 40));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("m").is_err());
        assert!(parse_size("12q").is_err());
        assert!(parse_size("-4k").is_err());
        assert!(parse_size("ten").is_err());
    }

    #[test]
    fn parse_rejects_overflow() {
        let too_big = format!("{}t", usize::MAX);
        assert!(parse_size(&too_big).is_err());
    }
}
