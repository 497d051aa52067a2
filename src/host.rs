use std::{net::Ipv4Addr, sync::LazyLock};

use regex::Regex;

// Direct form: ip<o1>-<o2>-<o3>-<o4>-<session>[-<port>][.<tld>][:<port>]
//
// The encoded-port group is matched before the tld capture, so a tld with
// embedded dashes ("foo-bar.tld") can never swallow the port: the port group
// must be 1-5 digits sitting immediately before the first dot, colon, or the
// end of the host.
static DIRECT_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^ip(\d{1,3})-(\d{1,3})-(\d{1,3})-(\d{1,3})-([0-9a-zA-Z]+)(?:-(\d{1,5}))?(?:\.([^:]*))?(?::(\d{1,5}))?$",
    )
    .unwrap()
});

// Alias form: pwd<alias>-<8-char session prefix>[-<port>][.<tld>]
// The alias itself may contain dashes; the session prefix is always the
// 8-character alphanumeric token right after it.
static ALIAS_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^pwd([0-9a-zA-Z-]+?)-([0-9a-zA-Z]{8})(?:-(\d{1,5}))?(?:\.([^:]*))?$").unwrap()
});

// SSH username variant: <o1>-<o2>-<o3>-<o4>-<session prefix>, with any
// further dash-separated fields ignored.
static SSH_USERNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3})-(\d{1,3})-(\d{1,3})-(\d{1,3})-([0-9a-zA-Z]+)(?:-.*)?$").unwrap()
});

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HostDecodeError {
    #[error("hostname doesn't match the direct form")]
    NoDirectMatch,
    #[error("hostname doesn't match the alias form")]
    NoAliasMatch,
    #[error("SSH username doesn't encode a relay target")]
    NoUsernameMatch,
    #[error("invalid octet in encoded address")]
    InvalidOctet,
}

/// The decoded meaning of a direct-form hostname.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostIdentity {
    /// Opaque session token.
    pub session_id: String,
    /// Dotted-quad instance address, reconstructed from the dash-encoded form.
    pub instance_address: String,
    /// Backend port to reach. Zero when absent.
    pub encoded_port: u16,
    /// Free-form domain suffix. Empty when absent.
    pub tld: String,
    /// Numeric suffix after a colon. Falls behind the encoded port when both
    /// are present.
    pub explicit_port: u16,
}

/// The decoded meaning of an alias-form hostname, resolved by
/// (alias, session prefix) instead of an embedded address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasIdentity {
    pub alias: String,
    pub session_prefix: String,
    pub encoded_port: u16,
    pub tld: String,
}

/// A relay target extracted from an SSH username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub instance_ip: Ipv4Addr,
    pub session_prefix: String,
}

/// Optional fields for [`encode_host`].
#[derive(Debug, Clone, Default)]
pub struct EncodeOpts {
    pub tld: String,
    pub encoded_port: u16,
    pub explicit_port: u16,
}

/// Build the direct-form hostname for an instance. Purely string
/// construction; malformed inputs produce malformed but harmless output.
pub fn encode_host(session_id: &str, instance_address: &str, opts: &EncodeOpts) -> String {
    let mut host = format!("ip{}-{}", instance_address.replace('.', "-"), session_id);
    if opts.encoded_port > 0 {
        host.push_str(&format!("-{}", opts.encoded_port));
    }
    if !opts.tld.is_empty() {
        host.push_str(&format!(".{}", opts.tld));
    }
    if opts.explicit_port > 0 {
        host.push_str(&format!(":{}", opts.explicit_port));
    }
    host
}

// Ports are best-effort: a numeric group too large for u16 decodes as absent.
fn parse_port(group: Option<regex::Match<'_>>) -> u16 {
    group
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .unwrap_or(0)
}

/// Decode a direct-form hostname into its identity. Only the literal `ip`,
/// the four octets, and the session token are load-bearing; every group
/// after them is optional and decodes to its zero value when absent.
pub fn decode_host(host: &str) -> Result<HostIdentity, HostDecodeError> {
    let captures = DIRECT_HOST
        .captures(host)
        .ok_or(HostDecodeError::NoDirectMatch)?;
    let instance_address = format!(
        "{}.{}.{}.{}",
        &captures[1], &captures[2], &captures[3], &captures[4]
    );
    Ok(HostIdentity {
        session_id: captures[5].into(),
        instance_address,
        encoded_port: parse_port(captures.get(6)),
        tld: captures
            .get(7)
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default(),
        explicit_port: parse_port(captures.get(8)),
    })
}

/// Decode an alias-form hostname. Tried by callers only after
/// [`decode_host`] fails; the two grammars are deliberately separate.
pub fn decode_alias_host(host: &str) -> Result<AliasIdentity, HostDecodeError> {
    let captures = ALIAS_HOST
        .captures(host)
        .ok_or(HostDecodeError::NoAliasMatch)?;
    Ok(AliasIdentity {
        alias: captures[1].into(),
        session_prefix: captures[2].into(),
        encoded_port: parse_port(captures.get(3)),
        tld: captures
            .get(4)
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default(),
    })
}

/// Decode the relay target embedded in an SSH username.
pub fn decode_ssh_username(user: &str) -> Result<SshTarget, HostDecodeError> {
    let captures = SSH_USERNAME
        .captures(user)
        .ok_or(HostDecodeError::NoUsernameMatch)?;
    let mut octets = [0u8; 4];
    for (index, octet) in octets.iter_mut().enumerate() {
        *octet = captures[index + 1]
            .parse()
            .map_err(|_| HostDecodeError::InvalidOctet)?;
    }
    Ok(SshTarget {
        instance_ip: Ipv4Addr::from(octets),
        session_prefix: captures[5].into(),
    })
}
