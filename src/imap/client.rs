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

//! A minimal blocking IMAP client.
//!
//! **THIS IS NOT A GENERAL-PURPOSE IMAP CLIENT.** It speaks exactly the
//! handful of IMAP4rev1 commands needed to find and clean up probe messages,
//! one command at a time, and treats response lines as text rather than
//! parsing the full grammar.

use std::io::{self, BufRead, Read, Write};
use std::str;

use lazy_static::lazy_static;
use log::debug;
use regex::bytes::Regex;

use super::{Error, MailboxSession, MessageUid};

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"~?\{([0-9]+)\+?\}\r\n$"#).unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Ok,
    No,
    Bad,
}

/// Everything the server sent in reply to one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Untagged lines, without the leading `* ` or trailing CRLF.
    pub untagged: Vec<String>,
    pub cond: Cond,
    /// Whatever followed the condition on the tagged line.
    pub text: String,
}

impl Response {
    /// Converts anything but `OK` into `Error::Status`.
    pub fn into_ok(self, what: &str) -> Result<Self, Error> {
        if Cond::Ok == self.cond {
            return Ok(self);
        }

        let cond = match self.cond {
            Cond::Ok => "OK",
            Cond::No => "NO",
            Cond::Bad => "BAD",
        };
        Err(Error::Status {
            what: what.to_owned(),
            result: if self.text.is_empty() {
                cond.to_owned()
            } else {
                format!("{} {}", cond, self.text)
            },
        })
    }
}

/// An untagged command line under construction.
///
/// Strings which cannot be quoted are sent as synchronising literals, so the
/// line is kept as a series of chunks; every chunk but the last ends with a
/// literal header and must wait for the server's `+` before the next one is
/// sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandLine {
    sent_first: Vec<Vec<u8>>,
    current: Vec<u8>,
}

impl CommandLine {
    pub fn new(verb: &str) -> Self {
        CommandLine {
            sent_first: Vec::new(),
            current: verb.as_bytes().to_vec(),
        }
    }

    pub fn atom(mut self, atom: &str) -> Self {
        self.current.push(b' ');
        self.current.extend_from_slice(atom.as_bytes());
        self
    }

    /// Appends `s` as a quoted string if possible, and as a literal
    /// otherwise. NUL cannot be sent at all.
    pub fn string(mut self, s: &str) -> Result<Self, Error> {
        if s.contains('\0') {
            return Err(Error::Unquotable(s.to_owned()));
        }

        self.current.push(b' ');
        match quote(s) {
            Some(quoted) => self.current.extend_from_slice(quoted.as_bytes()),
            None => {
                self.current
                    .extend_from_slice(format!("{{{}}}\r\n", s.len()).as_bytes());
                let header = std::mem::replace(
                    &mut self.current,
                    s.as_bytes().to_vec(),
                );
                self.sent_first.push(header);
            }
        }

        Ok(self)
    }

    fn into_chunks(self) -> (Vec<Vec<u8>>, Vec<u8>) {
        (self.sent_first, self.current)
    }
}

pub struct Client<S> {
    io: io::BufReader<S>,
    trace_stderr: Option<&'static str>,
    next_tag: u64,
}

impl<S: Read + Write> Client<S> {
    pub fn new(stream: S, trace_stderr: Option<&'static str>) -> Self {
        Client {
            io: io::BufReader::new(stream),
            trace_stderr,
            next_tag: 1,
        }
    }

    pub fn read_line_raw(&mut self, dst: &mut Vec<u8>) -> Result<usize, Error> {
        let start = dst.len();
        let nread = self.io.read_until(b'\n', dst)?;
        self.trace(false, "<<[eol]", &dst[start..]);
        Ok(nread)
    }

    pub fn read_data_raw(
        &mut self,
        dst: &mut Vec<u8>,
        n: u32,
    ) -> Result<usize, Error> {
        let start = dst.len();
        let nread = self.io.by_ref().take(n.into()).read_to_end(dst)?;
        self.trace(true, "<<[lit]", &dst[start..]);
        if n > nread as u32 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Hit EOF before end of literal",
            )));
        }

        Ok(nread)
    }

    /// Reads one logical response line, including any literals it contains,
    /// into `dst`. The final CRLF is kept.
    pub fn read_logical_line(
        &mut self,
        dst: &mut Vec<u8>,
    ) -> Result<(), Error> {
        loop {
            let nread = self.read_line_raw(dst)?;
            if !dst.ends_with(b"\r\n") {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Line didn't end with CRLF",
                )));
            }

            let literal_len = LITERAL_AT_EOL
                .captures(&dst[dst.len() - nread..])
                .and_then(|cap| cap.get(1))
                .and_then(|len| str::from_utf8(len.as_bytes()).ok())
                .and_then(|len| len.parse::<u32>().ok());

            if let Some(literal_len) = literal_len {
                self.read_data_raw(dst, literal_len)?;
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Reads the server greeting, which must be `OK` or `PREAUTH`.
    pub fn read_greeting(&mut self) -> Result<(), Error> {
        let mut buffer = Vec::new();
        self.read_logical_line(&mut buffer)?;
        let line = text_of(&buffer);

        let status = line.strip_prefix("* ").unwrap_or("");
        let cond = status.split(' ').next().unwrap_or("");
        if cond.eq_ignore_ascii_case("OK") || cond.eq_ignore_ascii_case("PREAUTH")
        {
            Ok(())
        } else {
            Err(Error::Status {
                what: "greeting".to_owned(),
                result: line,
            })
        }
    }

    /// Sends the simple `command` (without tag or line ending) and collects
    /// the responses up to and including its tagged completion.
    pub fn command(&mut self, command: &str) -> Result<Response, Error> {
        self.send(CommandLine::new(command), None)
    }

    /// Sends `line`, tracing `censored` in place of its content if given.
    pub fn send(
        &mut self,
        line: CommandLine,
        censored: Option<&str>,
    ) -> Result<Response, Error> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        if let Some(censored) = censored {
            self.trace(
                false,
                ">>[cmd]",
                format!("{} {}\r\n", tag, censored).as_bytes(),
            );
        }

        let (literal_headers, mut last) = line.into_chunks();
        let mut untagged = Vec::new();
        let mut prefix = format!("{} ", tag).into_bytes();
        for mut chunk in literal_headers {
            prefix.append(&mut chunk);
            self.write_chunk(&prefix, censored.is_some())?;
            prefix.clear();

            if let Some(response) =
                self.await_continuation(&tag, &mut untagged)?
            {
                return Ok(response);
            }
        }

        prefix.append(&mut last);
        prefix.extend_from_slice(b"\r\n");
        self.write_chunk(&prefix, censored.is_some())?;

        self.read_responses_until_tagged(&tag, untagged)
    }

    fn write_chunk(&mut self, chunk: &[u8], censored: bool) -> Result<(), Error> {
        if !censored {
            self.trace(false, ">>[cmd]", chunk);
        }

        let out = self.io.get_mut();
        out.write_all(chunk)?;
        out.flush()?;
        Ok(())
    }

    /// Waits for the `+` allowing a literal to be sent. If the server
    /// instead completes the command, that response is returned.
    fn await_continuation(
        &mut self,
        tag: &str,
        untagged: &mut Vec<String>,
    ) -> Result<Option<Response>, Error> {
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            self.read_logical_line(&mut buffer)?;
            let line = text_of(&buffer);

            if line.starts_with('+') {
                return Ok(None);
            }

            if let Some(data) = line.strip_prefix("* ") {
                untagged.push(data.to_owned());
                continue;
            }

            return parse_tagged(tag, line, std::mem::take(untagged)).map(Some);
        }
    }

    fn read_responses_until_tagged(
        &mut self,
        tag: &str,
        mut untagged: Vec<String>,
    ) -> Result<Response, Error> {
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            self.read_logical_line(&mut buffer)?;
            let line = text_of(&buffer);

            if let Some(data) = line.strip_prefix("* ") {
                untagged.push(data.to_owned());
                continue;
            }

            return parse_tagged(tag, line, untagged);
        }
    }

    fn trace(&self, truncate: bool, what: &str, data: &[u8]) {
        if let Some(prefix) = self.trace_stderr {
            if data.is_empty() {
                eprintln!("{} WIRE {}<empty>", prefix, what);
                return;
            }

            let (data, truncated) = if truncate {
                data.split_at(data.len().min(128))
            } else {
                (data, &[] as &[u8])
            };

            let mut start = 0;
            for split in memchr::memchr_iter(b'\n', data)
                .chain(std::iter::once(data.len() - 1))
            {
                if split < start {
                    continue;
                }

                let data = &data[start..=split];
                start = split + 1;

                let mut vis = String::new();
                for &byte in data {
                    match byte {
                        b' '..=b'~' => vis.push(byte as char),
                        b'\n' => vis.push_str("\\n"),
                        b'\r' => vis.push_str("\\r"),
                        b => vis.push_str(&format!("\\x{:02X}", b)),
                    }
                }

                eprintln!("{} WIRE {} {}", prefix, what, vis);
            }

            if !truncated.is_empty() {
                eprintln!(
                    "{} WIRE {}<{} more bytes>",
                    prefix,
                    what,
                    truncated.len()
                );
            }
        }
    }
}

fn parse_tagged(
    tag: &str,
    line: String,
    untagged: Vec<String>,
) -> Result<Response, Error> {
    let rest = match line.strip_prefix(tag).and_then(|r| r.strip_prefix(' '))
    {
        Some(rest) => rest,
        None => return Err(Error::Protocol(line)),
    };

    let (cond, text) = match rest.find(' ') {
        Some(ix) => (&rest[..ix], &rest[ix + 1..]),
        None => (rest, ""),
    };
    let cond = if cond.eq_ignore_ascii_case("OK") {
        Cond::Ok
    } else if cond.eq_ignore_ascii_case("NO") {
        Cond::No
    } else if cond.eq_ignore_ascii_case("BAD") {
        Cond::Bad
    } else {
        return Err(Error::Protocol(line));
    };

    Ok(Response {
        untagged,
        cond,
        text: text.to_owned(),
    })
}

impl<S: Read + Write> MailboxSession for Client<S> {
    fn login(&mut self, user: &str, password: &str) -> Result<(), Error> {
        let line = CommandLine::new("LOGIN").string(user)?.string(password)?;
        self.send(line, Some(&format!("LOGIN {} <password>", user)))?
            .into_ok("login")?;
        Ok(())
    }

    fn select_inbox(&mut self) -> Result<(), Error> {
        self.command("SELECT INBOX")?.into_ok("select INBOX")?;
        Ok(())
    }

    fn noop(&mut self) -> Result<(), Error> {
        self.command("NOOP")?.into_ok("noop")?;
        Ok(())
    }

    fn search_by_subject_and_from(
        &mut self,
        subject: &str,
        from: &str,
    ) -> Result<Vec<MessageUid>, Error> {
        let mut line = CommandLine::new("UID SEARCH");
        if !subject.is_ascii() || !from.is_ascii() {
            line = line.atom("CHARSET UTF-8");
        }
        let line = line
            .atom("SUBJECT")
            .string(subject)?
            .atom("FROM")
            .string(from)?;
        let response = self.send(line, None)?.into_ok("search")?;

        let mut uids = Vec::new();
        for line in &response.untagged {
            let mut words = line.split(' ');
            if !words
                .next()
                .map_or(false, |w| w.eq_ignore_ascii_case("SEARCH"))
            {
                continue;
            }

            for word in words.filter(|w| !w.is_empty()) {
                uids.push(word.parse::<MessageUid>().map_err(|_| {
                    Error::Protocol(format!("* {}", line))
                })?);
            }
        }

        Ok(uids)
    }

    fn flag_deleted_and_seen(
        &mut self,
        uid: MessageUid,
    ) -> Result<String, Error> {
        let response = self
            .command(&format!("UID STORE {} +FLAGS (\\Deleted \\Seen)", uid))?
            .into_ok("store")?;
        debug!("STORE {} answered {:?}", uid, response);
        Ok(response.text)
    }

    fn logout(&mut self) -> Result<(), Error> {
        self.command("LOGOUT")?.into_ok("logout")?;
        Ok(())
    }
}

/// Renders `s` as an IMAP quoted string, or returns `None` if it must be
/// sent as a literal instead.
///
/// Quoted strings are 7-bit and cannot carry line breaks or NULs.
pub fn quote(s: &str) -> Option<String> {
    if !s.bytes().all(|b| (b' '..=b'~').contains(&b)) {
        return None;
    }

    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if '"' == c || '\\' == c {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Some(quoted)
}

fn text_of(line: &[u8]) -> String {
    String::from_utf8_lossy(line.strip_suffix(b"\r\n").unwrap_or(line))
        .into_owned()
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use proptest::prelude::*;

    use super::*;
    use crate::test_support::ScriptStream;

    fn client(script: &[u8]) -> (Client<ScriptStream>, Rc<RefCell<Vec<u8>>>) {
        let stream = ScriptStream::new(script);
        let written = Rc::clone(&stream.output);
        (Client::new(stream, Some("test")), written)
    }

    fn text(written: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8(written.borrow().clone()).unwrap()
    }

    #[test]
    fn greeting() {
        client(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
            .0
            .read_greeting()
            .unwrap();
        client(b"* PREAUTH hi\r\n").0.read_greeting().unwrap();

        let (mut bye, written) = client(b"* BYE go away\r\n");
        match bye.read_greeting() {
            Err(Error::Status { what, result }) => {
                assert_eq!("greeting", what);
                assert_eq!("* BYE go away", result);
            }
            r => panic!("Unexpected result: {:?}", r),
        }
        assert!(written.borrow().is_empty());

        assert_matches!(
            Err(Error::Io(_)),
            client(b"* OK truncated").0.read_greeting()
        );
    }

    #[test]
    fn login_quotes_and_succeeds() {
        let (mut client, written) = client(b"A1 OK LOGIN completed\r\n");
        client.login("dest", "hun\"ter\\2").unwrap();
        assert_eq!(
            "A1 LOGIN \"dest\" \"hun\\\"ter\\\\2\"\r\n",
            text(&written)
        );
    }

    #[test]
    fn login_failure_carries_server_result() {
        let (mut client, _) =
            client(b"A1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n");
        let err = client.login("dest", "wrong").unwrap_err();
        assert_eq!(
            "login failed with NO [AUTHENTICATIONFAILED] Invalid credentials",
            err.to_string()
        );
    }

    #[test]
    fn non_ascii_password_is_sent_as_literal() {
        let (mut client, written) = client(
            b"+ Ready for literal data\r\n\
              A1 OK LOGIN completed\r\n",
        );
        client.login("dest", "pässwörd").unwrap();
        assert_eq!(
            "A1 LOGIN \"dest\" {10}\r\npässwörd\r\n",
            text(&written)
        );
    }

    #[test]
    fn literal_refused_before_continuation() {
        let (mut client, written) =
            client(b"A1 NO [ALERT] literals not welcome\r\n");
        let err = client.login("dést", "x").unwrap_err();
        assert_eq!(
            "login failed with NO [ALERT] literals not welcome",
            err.to_string()
        );
        // The literal's data was never sent.
        assert_eq!("A1 LOGIN {5}\r\n", text(&written));
    }

    #[test]
    fn tags_increase_per_command() {
        let (mut client, written) = client(
            b"* 3 EXISTS\r\n\
              * 0 RECENT\r\n\
              A1 OK [READ-WRITE] SELECT completed\r\n\
              A2 OK NOOP completed\r\n\
              * BYE logging out\r\n\
              A3 OK LOGOUT completed\r\n",
        );
        client.select_inbox().unwrap();
        client.noop().unwrap();
        client.logout().unwrap();

        assert_eq!(
            "A1 SELECT INBOX\r\nA2 NOOP\r\nA3 LOGOUT\r\n",
            text(&written)
        );
    }

    #[test]
    fn search_parses_uids() {
        let (mut client, written) = client(
            b"* 4 EXISTS\r\n\
              * SEARCH 17 42\r\n\
              A1 OK SEARCH completed\r\n",
        );
        let uids = client
            .search_by_subject_and_from("0190a1b2-token", "a@x.com")
            .unwrap();
        assert_eq!(vec![17, 42], uids);
        assert_eq!(
            "A1 UID SEARCH SUBJECT \"0190a1b2-token\" FROM \"a@x.com\"\r\n",
            text(&written)
        );
    }

    #[test]
    fn non_ascii_sender_searches_with_charset_and_literal() {
        let (mut client, written) = client(
            b"+ go ahead\r\n\
              * SEARCH 5\r\n\
              A1 OK SEARCH completed\r\n",
        );
        let uids = client
            .search_by_subject_and_from("0190a1b2-token", "jörg@x.com")
            .unwrap();
        assert_eq!(vec![5], uids);
        assert_eq!(
            "A1 UID SEARCH CHARSET UTF-8 SUBJECT \"0190a1b2-token\" \
             FROM {11}\r\njörg@x.com\r\n",
            text(&written)
        );
    }

    #[test]
    fn search_with_no_hits() {
        let (mut client, _) =
            client(b"* SEARCH\r\nA1 OK SEARCH completed\r\n");
        let uids = client
            .search_by_subject_and_from("token", "a@x.com")
            .unwrap();
        assert!(uids.is_empty());
    }

    #[test]
    fn search_rejects_garbage() {
        let (mut client, _) = client(b"* SEARCH 1 x\r\nA1 OK done\r\n");
        assert_matches!(
            Err(Error::Protocol(_)),
            client.search_by_subject_and_from("token", "a@x.com")
        );
    }

    #[test]
    fn search_failure() {
        let (mut client, _) = client(b"A1 BAD no mailbox selected\r\n");
        let err = client
            .search_by_subject_and_from("token", "a@x.com")
            .unwrap_err();
        assert_eq!("search failed with BAD no mailbox selected", err.to_string());
    }

    #[test]
    fn store_flags_and_returns_answer() {
        let (mut client, written) = client(
            b"* 2 FETCH (UID 42 FLAGS (\\Deleted \\Seen))\r\n\
              A1 OK STORE completed\r\n",
        );
        let answer = client.flag_deleted_and_seen(42).unwrap();
        assert_eq!("STORE completed", answer);
        assert_eq!(
            "A1 UID STORE 42 +FLAGS (\\Deleted \\Seen)\r\n",
            text(&written)
        );
    }

    #[test]
    fn untagged_literals_are_consumed() {
        let (mut client, _) = client(
            b"* 1 FETCH (BODY[HEADER] {7}\r\nA1 OK\r\n)\r\n\
              A1 OK NOOP completed\r\n",
        );
        let response = client.command("NOOP").unwrap();
        assert_eq!(Cond::Ok, response.cond);
        assert_eq!(1, response.untagged.len());
        assert_eq!("NOOP completed", response.text);
    }

    #[test]
    fn foreign_tag_is_a_protocol_error() {
        assert_matches!(
            Err(Error::Protocol(_)),
            client(b"B7 OK what\r\n").0.command("NOOP")
        );
        assert_matches!(
            Err(Error::Protocol(_)),
            client(b"A1 MAYBE\r\n").0.command("NOOP")
        );
    }

    #[test]
    fn eof_mid_command() {
        assert_matches!(
            Err(Error::Io(_)),
            client(b"* 1 EXISTS\r\n").0.command("NOOP")
        );
    }

    #[test]
    fn strings_needing_literals() {
        assert_eq!(Some("\"\"".to_owned()), quote(""));
        assert_eq!(None, quote("a\r\nb"));
        assert_eq!(None, quote("café"));
        assert_matches!(
            Err(Error::Unquotable(_)),
            CommandLine::new("LOGIN").string("a\0")
        );
        assert_eq!(
            CommandLine {
                sent_first: vec![b"LOGIN {4}\r\n".to_vec()],
                current: b"a\r\nb \"c\"".to_vec(),
            },
            CommandLine::new("LOGIN")
                .string("a\r\nb")
                .unwrap()
                .string("c")
                .unwrap()
        );
    }

    fn unquote(s: &str) -> String {
        let inner = &s[1..s.len() - 1];
        let mut out = String::new();
        let mut escaped = false;
        for c in inner.chars() {
            if !escaped && '\\' == c {
                escaped = true;
                continue;
            }
            assert!(escaped || '"' != c, "unescaped quote in {:?}", s);
            escaped = false;
            out.push(c);
        }
        assert!(!escaped);
        out
    }

    proptest! {
        #[test]
        fn quoting_is_reversible(s in "[ -~]{0,40}") {
            let quoted = quote(&s).unwrap();
            prop_assert!(quoted.starts_with('"'));
            prop_assert!(quoted.ends_with('"'));
            prop_assert_eq!(s, unquote(&quoted));
        }
    }
}
