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

use std::io::{self, Read, Write};

use log::info;

use super::client::Client;
use super::{Error, MailboxConnector};
use crate::support::config::MailboxSettings;
use crate::support::net;

pub trait Stream: Read + Write {}
impl<T: Read + Write> Stream for T {}

pub type RemoteClient = Client<Box<dyn Stream>>;

/// Connects to a real IMAP server over TCP, with or without TLS.
#[derive(Clone, Debug)]
pub struct ImapConnector {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub allow_insecure_tls_connections: bool,
    /// Dump the conversation to standard error.
    pub trace: bool,
}

impl ImapConnector {
    pub fn new(
        settings: &MailboxSettings,
        allow_insecure_tls_connections: bool,
        trace: bool,
    ) -> Self {
        ImapConnector {
            host: settings.host.clone(),
            port: settings.port,
            use_tls: settings.kind.use_tls(),
            allow_insecure_tls_connections,
            trace,
        }
    }
}

impl MailboxConnector for ImapConnector {
    type Session = RemoteClient;

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&self) -> Result<RemoteClient, Error> {
        let tcp_stream =
            net::connect_tcp(&self.host, self.port).map_err(|e| {
                if io::ErrorKind::NotFound == e.kind() {
                    Error::HostNotFound(self.host.clone())
                } else {
                    Error::Io(e)
                }
            })?;

        let stream: Box<dyn Stream> = if self.use_tls {
            if self.trace {
                eprintln!("Starting TLS handshake");
            }
            Box::new(net::start_tls(
                &self.host,
                tcp_stream,
                self.allow_insecure_tls_connections,
            )?)
        } else {
            Box::new(tcp_stream)
        };

        let mut client: RemoteClient =
            Client::new(stream, if self.trace { Some("imap") } else { None });

        client.read_greeting()?;
        info!("Connected to IMAP server at {}", self.endpoint());
        Ok(client)
    }
}
