//! Structural validation of SMTP mailboxes (RFC 5321 Section 4.1.2).
//!
//! Only the shape of an address is checked: whether the domain exists or the
//! mailbox accepts mail is decided by the remote server at `RCPT TO` time.
//!
//! ```text
//! Mailbox         = Local-part "@" ( Domain / address-literal )
//! Local-part      = Dot-string / Quoted-string
//! Domain          = sub-domain *("." sub-domain)
//! address-literal = "[" ( IPv4-address-literal / IPv6-address-literal / General-address-literal ) "]"
//! ```

use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::Deref,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_PATH_LEN: usize = 256;
const MAX_LOCAL_PART_LEN: usize = 64;
const MAX_DOMAIN_LEN: usize = 255;

/// Errors produced while validating an address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Path exceeds {MAX_PATH_LEN} octets")]
    PathTooLong,

    #[error("Local-part exceeds {MAX_LOCAL_PART_LEN} octets")]
    LocalPartTooLong,

    #[error("Domain exceeds {MAX_DOMAIN_LEN} octets")]
    DomainTooLong,

    #[error("Unbalanced angle brackets in '{0}'")]
    UnbalancedBrackets(String),

    #[error("Missing '@' separator in '{0}'")]
    MissingAtSign(String),

    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid address literal: {0}")]
    InvalidAddressLiteral(String),

    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
}

type Result<T> = std::result::Result<T, AddressError>;

/// A validated `local-part@domain` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mailbox {
    /// The local part (before @), quotes preserved
    pub local_part: String,
    /// The domain or bracketed address literal (after @)
    pub domain: String,
}

impl Mailbox {
    /// Returns `true` when the domain is a bracketed address literal such as `[127.0.0.1]`.
    #[must_use]
    pub fn is_address_literal(&self) -> bool {
        self.domain.starts_with('[')
    }

    /// The IP address of an IPv4 or IPv6 address literal.
    ///
    /// General (tagged) literals other than `IPv6:` have no IP and return `None`.
    #[must_use]
    pub fn literal_ip(&self) -> Option<IpAddr> {
        let content = self.domain.strip_prefix('[')?.strip_suffix(']')?;

        if let Ok(v4) = content.parse::<Ipv4Addr>() {
            return Some(IpAddr::V4(v4));
        }

        content
            .strip_prefix("IPv6:")
            .and_then(|v6| v6.parse::<Ipv6Addr>().ok())
            .map(IpAddr::V6)
    }

    /// The domain in the form used to decide which recipients share a destination.
    ///
    /// Domain names compare case-insensitively; literals are kept verbatim.
    #[must_use]
    pub fn domain_key(&self) -> String {
        if self.is_address_literal() {
            self.domain.clone()
        } else {
            self.domain.to_ascii_lowercase()
        }
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// A mailbox as supplied by the caller.
///
/// Equality is on the exact string, so `User@example.com` and
/// `user@example.com` are distinct recipients even though they share a domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub Mailbox);

impl Address {
    /// Parses a mailbox written either bare (`user@example.com`) or as a path
    /// (`<user@example.com>`).
    ///
    /// # Errors
    ///
    /// Returns `AddressError` if the input is not a structurally valid mailbox.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        if trimmed.is_empty() || trimmed == "<>" {
            return Err(AddressError::Empty);
        }

        if trimmed.len() > MAX_PATH_LEN {
            return Err(AddressError::PathTooLong);
        }

        let inner = match (trimmed.starts_with('<'), trimmed.ends_with('>')) {
            (true, true) => &trimmed[1..trimmed.len() - 1],
            (false, false) => trimmed,
            _ => return Err(AddressError::UnbalancedBrackets(trimmed.to_string())),
        };

        parse_mailbox(inner).map(Self)
    }

    /// Parses a reverse-path, where `<>` (or an empty string) is the null sender.
    ///
    /// # Errors
    ///
    /// Returns `AddressError` if the input is neither null nor a valid mailbox.
    pub fn parse_reverse_path(input: &str) -> Result<Option<Self>> {
        match input.trim() {
            "" | "<>" => Ok(None),
            other => Self::parse(other).map(Some),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Deref for Address {
    type Target = Mailbox;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Mailbox> for Address {
    fn from(value: Mailbox) -> Self {
        Self(value)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let at = find_unquoted_at(input)?;
    let (local_part, domain) = (&input[..at], &input[at + 1..]);

    if local_part.len() > MAX_LOCAL_PART_LEN {
        return Err(AddressError::LocalPartTooLong);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(AddressError::DomainTooLong);
    }

    if local_part.starts_with('"') {
        validate_quoted_string(local_part)?;
    } else {
        validate_dot_string(local_part)?;
    }

    if domain.starts_with('[') {
        validate_address_literal(domain)?;
    } else {
        validate_domain(domain)?;
    }

    Ok(Mailbox {
        local_part: local_part.to_string(),
        domain: domain.to_string(),
    })
}

/// Byte offset of the last '@' outside a quoted string or address literal
fn find_unquoted_at(input: &str) -> Result<usize> {
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut escaped = false;
    let mut found = None;

    for (i, ch) in input.char_indices() {
        match ch {
            '"' if !escaped && !in_brackets => in_quotes = !in_quotes,
            '[' if !in_quotes => in_brackets = true,
            ']' if !in_quotes => in_brackets = false,
            '@' if !in_quotes && !in_brackets => found = Some(i),
            _ => {}
        }

        escaped = ch == '\\' && !escaped;
    }

    found.ok_or_else(|| AddressError::MissingAtSign(input.to_string()))
}

fn validate_dot_string(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidLocalPart("Empty local-part".to_string()));
    }

    for atom in input.split('.') {
        if atom.is_empty() {
            return Err(AddressError::InvalidLocalPart(format!(
                "Empty atom in '{input}'"
            )));
        }

        if let Some(ch) = atom.chars().find(|&ch| !is_atext(ch)) {
            return Err(AddressError::InvalidLocalPart(format!(
                "Invalid character '{ch}' in atom"
            )));
        }
    }

    Ok(())
}

fn validate_quoted_string(input: &str) -> Result<()> {
    if input.len() < 2 || !input.ends_with('"') {
        return Err(AddressError::InvalidQuotedString(
            "Unclosed quoted string".to_string(),
        ));
    }

    let mut chars = input[1..input.len() - 1].chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next) if next.is_ascii_graphic() || next == ' ' => {}
                Some(next) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "Invalid quoted-pair: \\{next}"
                    )));
                }
                None => {
                    return Err(AddressError::InvalidQuotedString(
                        "Backslash at end of quoted string".to_string(),
                    ));
                }
            }
        } else if !is_qtext_smtp(ch) {
            return Err(AddressError::InvalidQuotedString(format!(
                "Invalid character '{ch}' in quoted string"
            )));
        }
    }

    Ok(())
}

fn validate_domain(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidDomain("Empty domain".to_string()));
    }

    for label in input.split('.') {
        let (Some(first), Some(last)) = (label.chars().next(), label.chars().last()) else {
            return Err(AddressError::InvalidDomain(format!(
                "Empty label in '{input}'"
            )));
        };

        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(AddressError::InvalidDomain(format!(
                "Label '{label}' must start and end with a letter or digit"
            )));
        }

        if let Some(ch) = label
            .chars()
            .find(|&ch| !ch.is_ascii_alphanumeric() && ch != '-')
        {
            return Err(AddressError::InvalidDomain(format!(
                "Invalid character '{ch}' in label '{label}'"
            )));
        }
    }

    Ok(())
}

fn validate_address_literal(input: &str) -> Result<()> {
    let Some(content) = input.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
        return Err(AddressError::InvalidAddressLiteral(input.to_string()));
    };

    if content.parse::<Ipv4Addr>().is_ok() {
        return Ok(());
    }

    if let Some(v6) = content.strip_prefix("IPv6:") {
        return v6
            .parse::<Ipv6Addr>()
            .map(|_| ())
            .map_err(|_| AddressError::InvalidAddressLiteral(input.to_string()));
    }

    // General-address-literal: Standardized-tag ":" 1*dcontent
    match content.split_once(':') {
        Some((tag, value)) if !tag.is_empty() && !value.is_empty() => Ok(()),
        _ => Err(AddressError::InvalidAddressLiteral(input.to_string())),
    }
}

#[inline]
const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// qtextSMTP = %d32-33 / %d35-91 / %d93-126
#[inline]
const fn is_qtext_smtp(ch: char) -> bool {
    matches!(ch as u32, 32..=33 | 35..=91 | 93..=126)
}
