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

//! The destination mailbox, as seen over IMAP.

pub mod client;
pub mod connect;

use std::io;

use thiserror::Error;

pub use self::connect::ImapConnector;

/// A message's UID within the selected mailbox.
pub type MessageUid = u32;

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
    #[error("Unexpected response from server: {0}")]
    Protocol(String),
    /// The server completed a command with something other than `OK`.
    #[error("{what} failed with {result}")]
    Status { what: String, result: String },
    #[error("Cannot send {0:?} to the server")]
    Unquotable(String),
}

/// The operations the reconciler needs from a mailbox session.
pub trait MailboxSession {
    fn login(&mut self, user: &str, password: &str) -> Result<(), Error>;
    fn select_inbox(&mut self) -> Result<(), Error>;
    /// Does nothing, but gives the server an opportunity to notice new mail.
    fn noop(&mut self) -> Result<(), Error>;
    /// Returns the UIDs of messages whose subject contains `subject` and
    /// which are from `from`. An empty result means nothing matched.
    fn search_by_subject_and_from(
        &mut self,
        subject: &str,
        from: &str,
    ) -> Result<Vec<MessageUid>, Error>;
    /// Marks the message `\Deleted \Seen`, returning the server's answer.
    fn flag_deleted_and_seen(
        &mut self,
        uid: MessageUid,
    ) -> Result<String, Error>;
    fn logout(&mut self) -> Result<(), Error>;
}

/// Opens sessions against one particular mailbox server.
pub trait MailboxConnector {
    type Session: MailboxSession;

    /// `host:port`, for messages.
    fn endpoint(&self) -> String;
    /// Connects and reads the greeting. The session is not yet logged in.
    fn connect(&self) -> Result<Self::Session, Error>;
}
