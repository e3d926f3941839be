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

use std::io;

use thiserror::Error;

use super::config::ConfigError;
use super::sysexits::*;
use crate::{imap, smtp};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("sending from {from} failed: {source}")]
    Send {
        from: String,
        #[source]
        source: smtp::Error,
    },
    #[error(
        "sending from {from} failed: connection lost {attempts} times in a row"
    )]
    SendRetriesExhausted { from: String, attempts: u32 },
    #[error(transparent)]
    Mailbox(#[from] imap::Error),
    /// The deadline passed with probes from these senders still missing.
    #[error("timeout; did not get answers for {}", .0.join(", "))]
    Timeout(Vec<String>),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The process exit status this error should produce.
    pub fn sysexit(&self) -> Sysexit {
        match *self {
            Error::Config(_) => EX_CONFIG,
            Error::Send { .. } => EX_UNAVAILABLE,
            Error::SendRetriesExhausted { .. } => EX_TEMPFAIL,
            Error::Mailbox(imap::Error::HostNotFound(_)) => EX_NOHOST,
            Error::Mailbox(imap::Error::Io(_)) => EX_IOERR,
            Error::Mailbox(_) => EX_PROTOCOL,
            Error::Timeout(_) => EX_TEMPFAIL,
            Error::Io(_) => EX_IOERR,
        }
    }
}
