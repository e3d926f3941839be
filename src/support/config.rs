//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailprobe.
//
// Mailprobe is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mailprobe is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailprobe. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::fs;
use std::io;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::probe::prober::RetryPolicy;

pub const DEFAULT_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_SEND_RETRY_DELAY_SECS: u64 = 1;
/// One week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Error reading '{}': {}", path.display(), source)]
    Read { path: PathBuf, source: io::Error },
    #[error("Error in config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}; {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("at least one sender address must be configured")]
    NoSenders,
}

/// The configuration file exactly as written.
///
/// Everything is optional here so that a missing key can be reported by name
/// instead of as an opaque deserialisation error. `Settings::from_raw` turns
/// this into something the rest of the program can rely on.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Identifies this installation in the subject of each probe.
    pub identifier: Option<String>,
    /// Where probes are sent. These should all end up in `mailbox`.
    pub destinations: Option<Vec<String>>,
    /// How long to wait for all probes to arrive, in seconds.
    pub timeout: Option<u64>,
    /// How long to wait between mailbox polls, in seconds.
    pub poll_interval: Option<u64>,
    /// How long to wait before resending after the relay reset the
    /// connection, in seconds.
    pub send_retry_delay: Option<u64>,
    /// Give up on a probe after this many connection resets. Absent or 0
    /// means never give up.
    pub max_send_attempts: Option<u32>,
    /// The address server-generated mail (e.g. error reports) comes from.
    pub server_email: Option<String>,
    /// The address ordinary application mail comes from.
    pub default_from_email: Option<String>,
    /// Any further sender identities worth verifying.
    #[serde(default)]
    pub additional_from_addresses: Vec<String>,
    /// Skip certificate verification on every TLS connection.
    #[serde(default)]
    pub allow_insecure_tls_connections: bool,

    pub smtp: Option<RawSmtpConfig>,
    pub mailbox: Option<RawMailboxConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSmtpConfig {
    pub host: Option<String>,
    /// Defaults to 465, 587, or 25 depending on `security`.
    pub port: Option<u16>,
    /// One of `tls` (the default), `starttls`, or `none`.
    pub security: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// The name to announce in EHLO.
    pub local_host_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMailboxConfig {
    /// `IMAP4_SSL` or `IMAP4`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub host: Option<String>,
    /// Defaults to 993 for `IMAP4_SSL` and 143 for `IMAP4`.
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Validated settings for a complete run.
#[derive(Clone, Debug)]
pub struct Settings {
    pub identifier: String,
    pub destinations: Vec<String>,
    /// Distinct sender identities, in configuration order.
    pub senders: Vec<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub send_retry: RetryPolicy,
    pub allow_insecure_tls_connections: bool,
    pub smtp: SmtpSettings,
    pub mailbox: MailboxSettings,
}

#[derive(Clone, Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub credentials: Option<Credentials>,
    pub local_host_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS from the first byte ("SMTPS").
    Tls,
    /// Cleartext greeting, then STARTTLS before anything else.
    StartTls,
    /// Cleartext throughout.
    None,
}

impl SmtpSecurity {
    fn default_port(self) -> u16 {
        match self {
            SmtpSecurity::Tls => 465,
            SmtpSecurity::StartTls => 587,
            SmtpSecurity::None => 25,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MailboxSettings {
    pub kind: MailboxType,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxType {
    Imap4Ssl,
    Imap4,
}

impl MailboxType {
    pub fn use_tls(self) -> bool {
        MailboxType::Imap4Ssl == self
    }

    fn default_port(self) -> u16 {
        match self {
            MailboxType::Imap4Ssl => 993,
            MailboxType::Imap4 => 143,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawConfig = toml::from_slice(&data)?;
        Self::from_raw(raw)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(s)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let identifier = require(raw.identifier, "identifier")?;
        if identifier.chars().any(char::is_control) {
            return Err(ConfigError::Invalid {
                key: "identifier",
                reason: "must not contain control characters".to_owned(),
            });
        }

        let destinations = require(raw.destinations, "destinations")?;
        if destinations.is_empty() {
            return Err(ConfigError::Invalid {
                key: "destinations",
                reason: "at least one destination is required".to_owned(),
            });
        }

        let mut senders = Vec::<String>::new();
        for sender in raw
            .server_email
            .into_iter()
            .chain(raw.default_from_email)
            .chain(raw.additional_from_addresses)
        {
            if sender.is_empty() {
                continue;
            }

            if !senders.contains(&sender) {
                senders.push(sender);
            }
        }

        if senders.is_empty() {
            return Err(ConfigError::NoSenders);
        }

        let timeout = match raw.timeout {
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            Some(secs) if secs > MAX_TIMEOUT_SECS => {
                return Err(ConfigError::Invalid {
                    key: "timeout",
                    reason: format!("must be at most {}", MAX_TIMEOUT_SECS),
                })
            }
            Some(secs) => Duration::from_secs(secs),
        };
        let poll_interval = match raw.poll_interval {
            None => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: "poll_interval",
                    reason: "must be at least 1".to_owned(),
                })
            }
            Some(secs) => Duration::from_secs(secs),
        };
        let send_retry = RetryPolicy {
            delay: Duration::from_secs(
                raw.send_retry_delay
                    .unwrap_or(DEFAULT_SEND_RETRY_DELAY_SECS),
            ),
            max_attempts: raw.max_send_attempts.and_then(NonZeroU32::new),
        };

        let smtp = SmtpSettings::from_raw(require(raw.smtp, "smtp")?)?;
        let mailbox =
            MailboxSettings::from_raw(require(raw.mailbox, "mailbox")?)?;

        Ok(Settings {
            identifier,
            destinations,
            senders,
            timeout,
            poll_interval,
            send_retry,
            allow_insecure_tls_connections: raw
                .allow_insecure_tls_connections,
            smtp,
            mailbox,
        })
    }
}

impl SmtpSettings {
    fn from_raw(raw: RawSmtpConfig) -> Result<Self, ConfigError> {
        let host = require(raw.host, "smtp.host")?;
        let security = match raw.security.as_deref() {
            None => SmtpSecurity::Tls,
            Some(s) if s.eq_ignore_ascii_case("tls") => SmtpSecurity::Tls,
            Some(s) if s.eq_ignore_ascii_case("ssl") => SmtpSecurity::Tls,
            Some(s) if s.eq_ignore_ascii_case("starttls") => {
                SmtpSecurity::StartTls
            }
            Some(s) if s.eq_ignore_ascii_case("none") => SmtpSecurity::None,
            Some(s) => {
                return Err(ConfigError::Invalid {
                    key: "smtp.security",
                    reason: format!(
                        "expected tls, starttls, or none, got {:?}",
                        s
                    ),
                })
            }
        };

        let credentials = match (raw.user, raw.password) {
            (None, None) => None,
            (Some(user), Some(password)) => Some(Credentials { user, password }),
            (Some(_), None) => return Err(ConfigError::Missing("smtp.password")),
            (None, Some(_)) => return Err(ConfigError::Missing("smtp.user")),
        };

        Ok(SmtpSettings {
            host,
            port: raw.port.unwrap_or_else(|| security.default_port()),
            security,
            credentials,
            local_host_name: raw
                .local_host_name
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "localhost".to_owned()),
        })
    }
}

impl MailboxSettings {
    fn from_raw(raw: RawMailboxConfig) -> Result<Self, ConfigError> {
        let kind = match &*require(raw.kind, "mailbox.type")? {
            "IMAP4_SSL" => MailboxType::Imap4Ssl,
            "IMAP4" => MailboxType::Imap4,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "mailbox.type",
                    reason: "we only support IMAP4_SSL and IMAP4".to_owned(),
                })
            }
        };

        let host = require(raw.host, "mailbox.host")?;
        let user = require(raw.user, "mailbox.user")?;
        let password = require(raw.password, "mailbox.password")?;

        Ok(MailboxSettings {
            kind,
            host,
            port: raw.port.unwrap_or_else(|| kind.default_port()),
            credentials: Credentials { user, password },
        })
    }
}

fn require<T: IsBlank>(
    value: Option<T>,
    key: &'static str,
) -> Result<T, ConfigError> {
    value
        .filter(|v| !v.is_blank())
        .ok_or(ConfigError::Missing(key))
}

trait IsBlank {
    fn is_blank(&self) -> bool;
}

impl IsBlank for String {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl<T> IsBlank for Vec<T> {
    // An explicitly empty list is present; it gets its own message.
    fn is_blank(&self) -> bool {
        false
    }
}

impl IsBlank for RawSmtpConfig {
    fn is_blank(&self) -> bool {
        false
    }
}

impl IsBlank for RawMailboxConfig {
    fn is_blank(&self) -> bool {
        false
    }
}
