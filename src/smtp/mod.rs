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

//! Outbound mail, as sent through the application's SMTP relay.

pub mod client;
pub mod transport;

use std::io;

use thiserror::Error;

use crate::support::net;

pub use self::transport::SmtpTransport;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Ssl2(#[from] openssl::ssl::Error),
    #[error("Host not found: {0}")]
    HostNotFound(String),
    #[error("Bad SMTP response: {0:?}")]
    BadResponse(String),
    /// The server answered a command with an unacceptable status.
    #[error("{what} failed with {code} {text}")]
    Rejected {
        what: String,
        code: u32,
        text: String,
    },
    #[error("Server does not support {0}")]
    Unsupported(&'static str),
    #[error("Invalid address {0:?}")]
    InvalidAddress(String),
    #[error("Unusable header text {0:?}")]
    BadHeader(String),
}

/// Why a message could not be sent.
#[derive(Error, Debug)]
pub enum SendError {
    /// The connection dropped mid-conversation. Sending again may well work.
    #[error("connection lost: {0}")]
    Transient(io::Error),
    #[error(transparent)]
    Fatal(Error),
}

impl From<Error> for SendError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) if net::is_connection_lost(&e) => {
                SendError::Transient(e)
            }
            Error::Ssl2(e)
                if e.io_error().map_or(false, net::is_connection_lost) =>
            {
                match e.into_io_error() {
                    Ok(e) => SendError::Transient(e),
                    Err(e) => SendError::Fatal(Error::Ssl2(e)),
                }
            }
            e => SendError::Fatal(e),
        }
    }
}

/// One message to send.
#[derive(Clone, Copy, Debug)]
pub struct Envelope<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub from: &'a str,
    pub to: &'a [String],
}

/// Something that can deliver a message to the outside world.
pub trait MailTransport {
    fn send(&mut self, envelope: &Envelope<'_>) -> Result<(), SendError>;
}
