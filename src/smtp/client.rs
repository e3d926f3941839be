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

//! A blocking SMTP submission client.
//!
//! Only what is needed to hand a small text message to a relay: EHLO (or
//! HELO), STARTTLS, AUTH PLAIN/LOGIN, and a single DATA transaction.

use std::io::{self, BufRead, Read, Write};

use chrono::prelude::*;
use log::debug;

use super::{Envelope, Error};
use crate::support::config::Credentials;

const MAX_LINE: usize = 1024;
const MAX_REPLY_LINES: usize = 1000;

/// One complete, possibly multi-line, server reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: u32,
    /// The text of each line, without the code.
    pub lines: Vec<String>,
}

impl Reply {
    fn text(&self) -> String {
        self.lines.join(" / ")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub starttls: bool,
    pub auth_plain: bool,
    pub auth_login: bool,
}

pub struct Session<S> {
    io: io::BufReader<S>,
    trace: bool,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S, trace: bool) -> Self {
        Session {
            io: io::BufReader::new(stream),
            trace,
        }
    }

    #[cfg(test)]
    pub fn stream(&self) -> &S {
        self.io.get_ref()
    }

    /// Gives up the underlying stream so it can be wrapped in TLS.
    ///
    /// Fails if the server has already sent something, since that data
    /// would otherwise be (mis)taken as coming over the secure channel.
    pub fn into_inner(self) -> Result<S, Error> {
        if !self.io.buffer().is_empty() {
            return Err(Error::BadResponse(
                "data received before TLS handshake".to_owned(),
            ));
        }

        Ok(self.io.into_inner())
    }

    /// Sends the given command (which does not include the line ending) to
    /// the server.
    pub fn send_command(&mut self, command: &str) -> Result<(), Error> {
        self.send_command_censored(command, command)
    }

    /// Like `send_command`, but traces `shown` instead.
    pub fn send_command_censored(
        &mut self,
        command: &str,
        shown: &str,
    ) -> Result<(), Error> {
        if self.trace {
            eprintln!("smtp WIRE >> {}", shown);
        }

        let out = self.io.get_mut();
        out.write_all(command.as_bytes())?;
        out.write_all(b"\r\n")?;
        out.flush()?;
        Ok(())
    }

    /// Reads response lines up to and including the final one.
    pub fn read_reply(&mut self) -> Result<Reply, Error> {
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        for _ in 0..MAX_REPLY_LINES {
            buf.clear();
            let nread = (&mut self.io)
                .take(MAX_LINE as u64)
                .read_until(b'\n', &mut buf)?;
            if 0 == nread {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reading reply from server",
                )));
            }

            let line = String::from_utf8_lossy(&buf);
            if self.trace {
                eprintln!("smtp WIRE << {}", line.trim_end());
            }
            if !buf.ends_with(b"\n") {
                return Err(Error::BadResponse(format!(
                    "line too long: {}...",
                    line
                )));
            }

            let parsed = parse_line(&line)
                .ok_or_else(|| Error::BadResponse(line.trim_end().to_owned()))?;
            lines.push(parsed.comment.to_owned());
            if parsed.last {
                return Ok(Reply {
                    code: parsed.status,
                    lines,
                });
            }
        }

        Err(Error::BadResponse("too many reply lines".to_owned()))
    }

    /// Reads a reply, requiring `accept` to hold for its code.
    pub fn expect(
        &mut self,
        what: &str,
        accept: impl Fn(u32) -> bool,
    ) -> Result<Reply, Error> {
        let reply = self.read_reply()?;
        if accept(reply.code) {
            Ok(reply)
        } else {
            Err(Error::Rejected {
                what: what.to_owned(),
                code: reply.code,
                text: reply.text(),
            })
        }
    }

    /// Sends `command` and requires a 2xx reply.
    pub fn command(&mut self, command: &str, what: &str) -> Result<Reply, Error> {
        self.send_command(command)?;
        self.expect(what, is_success)
    }

    pub fn read_greeting(&mut self) -> Result<(), Error> {
        self.expect("greeting", |code| 220 == code)?;
        Ok(())
    }

    pub fn hello(&mut self, local_host_name: &str) -> Result<Capabilities, Error> {
        self.send_command(&format!("EHLO {}", local_host_name))?;
        let reply = self.read_reply()?;
        match reply.code {
            200..=299 => return Ok(parse_capabilities(&reply)),
            500..=504 | 550 => (), // Retry with HELO
            code => {
                return Err(Error::Rejected {
                    what: "EHLO".to_owned(),
                    code,
                    text: reply.text(),
                })
            }
        }

        // EHLO apparently not supported; retry legacy HELO
        self.command(&format!("HELO {}", local_host_name), "HELO")?;
        Ok(Capabilities::default())
    }

    /// Asks the server to start TLS. The caller must then take the stream
    /// with `into_inner` and perform the handshake.
    pub fn starttls(&mut self, capabilities: &Capabilities) -> Result<(), Error> {
        if !capabilities.starttls {
            return Err(Error::Unsupported("STARTTLS"));
        }

        self.send_command("STARTTLS")?;
        self.expect("STARTTLS", |code| 220 == code)?;
        Ok(())
    }

    pub fn authenticate(
        &mut self,
        capabilities: &Capabilities,
        credentials: &Credentials,
    ) -> Result<(), Error> {
        if capabilities.auth_plain || !capabilities.auth_login {
            let token = base64::encode(format!(
                "\0{}\0{}",
                credentials.user, credentials.password
            ));
            self.send_command_censored(
                &format!("AUTH PLAIN {}", token),
                "AUTH PLAIN <credentials>",
            )?;
            self.expect("AUTH PLAIN", |code| 235 == code)?;
        } else {
            self.send_command("AUTH LOGIN")?;
            self.expect("AUTH LOGIN", |code| 334 == code)?;
            self.send_command_censored(
                &base64::encode(&credentials.user),
                "<user>",
            )?;
            self.expect("AUTH LOGIN", |code| 334 == code)?;
            self.send_command_censored(
                &base64::encode(&credentials.password),
                "<password>",
            )?;
            self.expect("AUTH LOGIN", |code| 235 == code)?;
        }

        Ok(())
    }

    /// Runs one mail transaction delivering `content` from `from` to every
    /// address in `to`. Every recipient must be accepted.
    pub fn send_mail(
        &mut self,
        from: &str,
        to: &[String],
        content: &[u8],
    ) -> Result<(), Error> {
        self.command(&format!("MAIL FROM:<{}>", check_address(from)?), "MAIL FROM")?;
        for recipient in to {
            self.command(
                &format!("RCPT TO:<{}>", check_address(recipient)?),
                &format!("RCPT TO {}", recipient),
            )?;
        }

        self.send_command("DATA")?;
        // 2XX status codes are undefined here, but some servers use them in
        // place of 354.
        self.expect("DATA", |code| 354 == code || is_success(code))?;

        let mut src = content;
        let out = self.io.get_mut();
        copy_with_dot_stuffing(out, &mut src)?;
        if self.trace {
            eprintln!("smtp WIRE >> [{} bytes, dot-stuffed]", content.len());
        }
        self.expect("DATA", is_success)?;
        Ok(())
    }

    /// The mostly superfluous QUIT command. Failures are ignored.
    pub fn quit(&mut self) {
        if self.send_command("QUIT").is_ok() {
            if let Err(e) = self.read_reply() {
                debug!("Ignoring error after QUIT: {}", e);
            }
        }
    }
}

fn is_success(code: u32) -> bool {
    (200..=299).contains(&code)
}

fn check_address(address: &str) -> Result<&str, Error> {
    if address.is_empty()
        || address.contains(|c: char| c.is_control() || '<' == c || '>' == c)
    {
        Err(Error::InvalidAddress(address.to_owned()))
    } else {
        Ok(address)
    }
}

fn parse_capabilities(ehlo: &Reply) -> Capabilities {
    let mut capabilities = Capabilities::default();
    // The first line is the server's greeting, not a capability.
    for line in ehlo.lines.iter().skip(1) {
        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or("");
        if "STARTTLS".eq_ignore_ascii_case(keyword) {
            capabilities.starttls = true;
        } else if "AUTH".eq_ignore_ascii_case(keyword) {
            for mechanism in words {
                if "PLAIN".eq_ignore_ascii_case(mechanism) {
                    capabilities.auth_plain = true;
                } else if "LOGIN".eq_ignore_ascii_case(mechanism) {
                    capabilities.auth_login = true;
                }
            }
        }
    }

    capabilities
}

struct ParsedLine<'a> {
    status: u32,
    last: bool,
    comment: &'a str,
}

fn parse_line(s: &str) -> Option<ParsedLine<'_>> {
    let s = s.trim_end_matches(|c| '\r' == c || '\n' == c);
    let status = s.get(0..3)?;
    // A bare code with no text is a final line.
    let last = s.get(3..4).unwrap_or(" ");
    let comment = s.get(4..).unwrap_or("");

    if !status.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let status: u32 = status.parse().ok()?;
    let last = match last {
        " " => true,
        "-" => false,
        _ => return None,
    };

    Some(ParsedLine {
        status,
        last,
        comment,
    })
}

/// Renders the full RFC 5322 message for `envelope`.
pub fn render_message(
    envelope: &Envelope<'_>,
    date: &DateTime<Local>,
    message_id: &str,
) -> Result<Vec<u8>, Error> {
    check_address(envelope.from)?;
    for to in envelope.to {
        check_address(to)?;
    }
    if envelope.subject.contains(char::is_control) {
        return Err(Error::BadHeader(envelope.subject.to_owned()));
    }

    let mut message = format!(
        "Date: {}\r\n\
         From: {}\r\n\
         To: {}\r\n\
         Subject: {}\r\n\
         Message-ID: <{}>\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Transfer-Encoding: 8bit\r\n\
         \r\n",
        date.to_rfc2822(),
        envelope.from,
        envelope.to.join(", "),
        encode_header_text(envelope.subject),
        message_id,
    );

    for line in envelope.body.lines() {
        message.push_str(line);
        message.push_str("\r\n");
    }

    Ok(message.into_bytes())
}

/// The most UTF-8 bytes carried by one encoded-word, keeping it within the
/// 75 characters RFC 2047 allows.
const ENCODED_WORD_MAX_BYTES: usize = 45;

/// Makes `text` safe for an unstructured header.
///
/// ASCII words pass through untouched. Each run of words containing anything
/// else becomes one or more RFC 2047 encoded-words; the spaces within the run
/// are encoded too since decoders drop whitespace between encoded-words.
fn encode_header_text(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    let mut words = text.split(' ').peekable();
    let mut first = true;

    while let Some(word) = words.next() {
        if !first {
            encoded.push(' ');
        }
        first = false;

        if word.is_ascii() {
            encoded.push_str(word);
            continue;
        }

        let mut run = word.to_owned();
        while let Some(next) = words.peek() {
            if next.is_ascii() {
                break;
            }
            run.push(' ');
            run.push_str(next);
            words.next();
        }
        push_encoded_words(&mut encoded, &run);
    }

    encoded
}

fn push_encoded_words(dst: &mut String, text: &str) {
    let mut rest = text;
    while !rest.is_empty() {
        let mut split = rest.len().min(ENCODED_WORD_MAX_BYTES);
        while !rest.is_char_boundary(split) {
            split -= 1;
        }

        let (chunk, tail) = rest.split_at(split);
        if rest.len() != text.len() {
            dst.push(' ');
        }
        dst.push_str("=?utf-8?b?");
        dst.push_str(&base64::encode(chunk));
        dst.push_str("?=");
        rest = tail;
    }
}

/// Copy `src` into `dst`, applying CRLF-strict dot stuffing. The copy includes
/// the terminating ".\r\n".
fn copy_with_dot_stuffing(
    dst: &mut impl Write,
    src: &mut impl BufRead,
) -> io::Result<()> {
    let mut dst = io::BufWriter::new(dst);
    let mut start_of_line = true;
    let mut prev_end = 0u8;

    loop {
        let mut buffer = src.fill_buf()?;
        if buffer.is_empty() {
            break;
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..eol + 1];
        }

        if start_of_line && Some(b'.') == buffer.first().copied() {
            dst.write_all(b".")?;
        }
        dst.write_all(buffer)?;

        let last = buffer[buffer.len() - 1];
        let prev = buffer
            .get(buffer.len().wrapping_sub(2))
            .copied()
            .unwrap_or(prev_end);
        start_of_line = b'\r' == prev && b'\n' == last;
        prev_end = last;

        let buffer_len = buffer.len();
        src.consume(buffer_len);
    }

    if !start_of_line {
        dst.write_all(b"\r\n")?;
    }
    dst.write_all(b".\r\n")?;
    dst.flush()?;

    Ok(())
}
