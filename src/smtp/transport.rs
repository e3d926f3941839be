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

use std::io::{Read, Write};

use chrono::prelude::*;
use log::{debug, info};
use uuid::Uuid;

use super::client::{render_message, Session};
use super::{Envelope, Error, MailTransport, SendError};
use crate::support::config::{SmtpSecurity, SmtpSettings};
use crate::support::net;

/// Sends each message over its own fresh connection to the configured relay.
#[derive(Clone, Debug)]
pub struct SmtpTransport {
    pub settings: SmtpSettings,
    pub allow_insecure_tls_connections: bool,
    /// Dump the conversation to standard error.
    pub trace: bool,
}

impl SmtpTransport {
    pub fn new(
        settings: SmtpSettings,
        allow_insecure_tls_connections: bool,
        trace: bool,
    ) -> Self {
        SmtpTransport {
            settings,
            allow_insecure_tls_connections,
            trace,
        }
    }

    fn send_once(&self, envelope: &Envelope<'_>) -> Result<(), Error> {
        let host = &self.settings.host;
        let tcp_stream =
            net::connect_tcp(host, self.settings.port).map_err(|e| {
                if std::io::ErrorKind::NotFound == e.kind() {
                    Error::HostNotFound(host.clone())
                } else {
                    Error::Io(e)
                }
            })?;
        debug!("Connected to SMTP relay {}:{}", host, self.settings.port);

        match self.settings.security {
            SmtpSecurity::Tls => {
                let stream = net::start_tls(
                    host,
                    tcp_stream,
                    self.allow_insecure_tls_connections,
                )?;
                let mut session = Session::new(stream, self.trace);
                session.read_greeting()?;
                self.transact(session, envelope)
            }

            SmtpSecurity::StartTls => {
                let mut session = Session::new(tcp_stream, self.trace);
                session.read_greeting()?;
                let capabilities =
                    session.hello(&self.settings.local_host_name)?;
                session.starttls(&capabilities)?;
                let stream = net::start_tls(
                    host,
                    session.into_inner()?,
                    self.allow_insecure_tls_connections,
                )?;
                self.transact(Session::new(stream, self.trace), envelope)
            }

            SmtpSecurity::None => {
                let mut session = Session::new(tcp_stream, self.trace);
                session.read_greeting()?;
                self.transact(session, envelope)
            }
        }
    }

    /// Everything after the greeting (and TLS, if any) has been taken care
    /// of.
    fn transact<S: Read + Write>(
        &self,
        mut session: Session<S>,
        envelope: &Envelope<'_>,
    ) -> Result<(), Error> {
        let capabilities = session.hello(&self.settings.local_host_name)?;
        if let Some(ref credentials) = self.settings.credentials {
            session.authenticate(&capabilities, credentials)?;
        }

        let message_id =
            format!("{}@{}", Uuid::now_v7(), self.settings.local_host_name);
        let message = render_message(envelope, &Local::now(), &message_id)?;
        session.send_mail(envelope.from, envelope.to, &message)?;
        session.quit();

        info!(
            "Relayed message <{}> from {} to {:?}",
            message_id, envelope.from, envelope.to
        );
        Ok(())
    }
}

impl MailTransport for SmtpTransport {
    fn send(&mut self, envelope: &Envelope<'_>) -> Result<(), SendError> {
        self.send_once(envelope).map_err(SendError::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::config::Credentials;
    use crate::test_support::ScriptStream;

    fn transport(credentials: Option<Credentials>) -> SmtpTransport {
        SmtpTransport::new(
            SmtpSettings {
                host: "smtp.example.com".to_owned(),
                port: 25,
                security: SmtpSecurity::None,
                credentials,
                local_host_name: "probe.example.com".to_owned(),
            },
            false,
            false,
        )
    }

    #[test]
    fn transaction_with_authentication() {
        let to = vec!["dest@y.com".to_owned()];
        let transport = transport(Some(Credentials {
            user: "relay".to_owned(),
            password: "hunter2".to_owned(),
        }));

        let session = Session::new(
            ScriptStream::new(
                b"250-smtp.example.com\r\n\
                  250 AUTH PLAIN\r\n\
                  235 ok\r\n\
                  250 ok\r\n\
                  250 ok\r\n\
                  354 go\r\n\
                  250 queued\r\n\
                  221 bye\r\n",
            ),
            false,
        );
        let output = session.stream().output.clone();
        transport
            .transact(
                session,
                &Envelope {
                    subject: "Server itest is testing",
                    body: "",
                    from: "a@x.com",
                    to: &to,
                },
            )
            .unwrap();

        let output = String::from_utf8(output.borrow().clone()).unwrap();
        assert!(output.starts_with("EHLO probe.example.com\r\nAUTH PLAIN "));
        assert!(output.contains("\r\nMAIL FROM:<a@x.com>\r\n"));
        assert!(output.contains("\r\nRCPT TO:<dest@y.com>\r\nDATA\r\n"));
        assert!(output.contains("@probe.example.com>\r\n"));
        assert!(output.contains("\r\nSubject: Server itest is testing\r\n"));
        assert!(output.ends_with("\r\n.\r\nQUIT\r\n"));
    }

    #[test]
    fn unreachable_relay_is_fatal() {
        let mut transport = transport(None);
        transport.settings.host = "nonexistent.invalid".to_owned();
        let to = vec!["dest@y.com".to_owned()];
        let result = transport.send(&Envelope {
            subject: "s",
            body: "",
            from: "a@x.com",
            to: &to,
        });
        assert_matches!(Err(SendError::Fatal(_)), result);
    }
}
