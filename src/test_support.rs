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

//! In-memory stand-ins for the network and the clock.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::imap::{self, MailboxConnector, MailboxSession, MessageUid};
use crate::smtp::{Envelope, MailTransport, SendError};
use crate::support::clock::Clock;

/// A clock which only advances when something sleeps on it.
#[derive(Debug)]
pub struct FakeClock {
    start: Instant,
    offset: Cell<Duration>,
    pub sleeps: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            start: Instant::now(),
            offset: Cell::new(Duration::from_secs(0)),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    /// Total virtual time slept so far.
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        self.offset.set(self.offset.get() + duration);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub subject: String,
    pub body: String,
    pub from: String,
    pub to: Vec<String>,
}

/// Records every message handed to it, after first failing with each queued
/// error in turn.
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub failures: VecDeque<SendError>,
    pub attempts: Cell<usize>,
    pub sent: Rc<RefCell<Vec<SentMessage>>>,
}

impl MailTransport for FakeTransport {
    fn send(&mut self, envelope: &Envelope<'_>) -> Result<(), SendError> {
        self.attempts.set(self.attempts.get() + 1);
        if let Some(failure) = self.failures.pop_front() {
            return Err(failure);
        }

        self.sent.borrow_mut().push(SentMessage {
            subject: envelope.subject.to_owned(),
            body: envelope.body.to_owned(),
            from: envelope.from.to_owned(),
            to: envelope.to.to_vec(),
        });
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct StoredMessage {
    uid: MessageUid,
    subject: String,
    from: String,
    /// The message is invisible until this many NOOPs have been issued.
    visible_from_round: u32,
    flagged: bool,
}

/// Everything a `FakeMailbox` has been asked to do, plus knobs to make it
/// misbehave.
#[derive(Debug, Default)]
pub struct MailboxState {
    messages: Vec<StoredMessage>,
    next_uid: MessageUid,

    pub logins: u32,
    pub selects: u32,
    pub noops: u32,
    pub searches: u32,
    pub flagged: Vec<MessageUid>,
    pub logouts: u32,

    /// Fail the NOOP of this (1-based) round.
    pub fail_noop_in_round: Option<u32>,
    pub fail_login: bool,
    pub fail_connect: bool,
    pub fail_logout: bool,
}

fn refused(what: &str) -> imap::Error {
    imap::Error::Status {
        what: what.to_owned(),
        result: "NO".to_owned(),
    }
}

/// A scripted mailbox. Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct FakeMailbox {
    pub state: Rc<RefCell<MailboxState>>,
    inbound: Option<(Rc<RefCell<Vec<SentMessage>>>, u32)>,
}

impl FakeMailbox {
    /// Places a message in the mailbox, to become visible in the given
    /// round.
    pub fn deliver(
        &self,
        subject: &str,
        from: &str,
        visible_from_round: u32,
    ) -> MessageUid {
        let mut state = self.state.borrow_mut();
        state.next_uid += 1;
        let uid = state.next_uid;
        state.messages.push(StoredMessage {
            uid,
            subject: subject.to_owned(),
            from: from.to_owned(),
            visible_from_round,
            flagged: false,
        });
        uid
    }

    /// Returns a connector sharing this mailbox which, upon connecting,
    /// delivers everything in `sent` to become visible in the given round.
    pub fn delivering_from(
        &self,
        sent: &Rc<RefCell<Vec<SentMessage>>>,
        visible_from_round: u32,
    ) -> Self {
        FakeMailbox {
            state: Rc::clone(&self.state),
            inbound: Some((Rc::clone(sent), visible_from_round)),
        }
    }
}

impl MailboxConnector for FakeMailbox {
    type Session = FakeSession;

    fn endpoint(&self) -> String {
        "fake.example.com:993".to_owned()
    }

    fn connect(&self) -> Result<FakeSession, imap::Error> {
        if self.state.borrow().fail_connect {
            return Err(imap::Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        if let Some((ref sent, round)) = self.inbound {
            for message in sent.borrow().iter() {
                self.deliver(&message.subject, &message.from, round);
            }
        }

        Ok(FakeSession {
            state: Rc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct FakeSession {
    state: Rc<RefCell<MailboxState>>,
}

impl MailboxSession for FakeSession {
    fn login(&mut self, _user: &str, _password: &str) -> Result<(), imap::Error> {
        let mut state = self.state.borrow_mut();
        state.logins += 1;
        if state.fail_login {
            Err(refused("login"))
        } else {
            Ok(())
        }
    }

    fn select_inbox(&mut self) -> Result<(), imap::Error> {
        self.state.borrow_mut().selects += 1;
        Ok(())
    }

    fn noop(&mut self) -> Result<(), imap::Error> {
        let mut state = self.state.borrow_mut();
        state.noops += 1;
        if Some(state.noops) == state.fail_noop_in_round {
            Err(refused("noop"))
        } else {
            Ok(())
        }
    }

    fn search_by_subject_and_from(
        &mut self,
        subject: &str,
        from: &str,
    ) -> Result<Vec<MessageUid>, imap::Error> {
        let mut state = self.state.borrow_mut();
        state.searches += 1;
        let round = state.noops;
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                !m.flagged
                    && m.visible_from_round <= round
                    && m.subject.contains(subject)
                    && m.from == from
            })
            .map(|m| m.uid)
            .collect())
    }

    fn flag_deleted_and_seen(
        &mut self,
        uid: MessageUid,
    ) -> Result<String, imap::Error> {
        let mut state = self.state.borrow_mut();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.uid == uid)
            .ok_or_else(|| refused("store"))?;
        message.flagged = true;
        state.flagged.push(uid);
        Ok("STORE completed".to_owned())
    }

    fn logout(&mut self) -> Result<(), imap::Error> {
        let mut state = self.state.borrow_mut();
        state.logouts += 1;
        if state.fail_logout {
            Err(refused("logout"))
        } else {
            Ok(())
        }
    }
}

/// A byte stream which replays a fixed script of server output and captures
/// everything written to it.
#[derive(Debug)]
pub struct ScriptStream {
    input: io::Cursor<Vec<u8>>,
    pub output: Rc<RefCell<Vec<u8>>>,
}

impl ScriptStream {
    pub fn new(script: impl AsRef<[u8]>) -> Self {
        ScriptStream {
            input: io::Cursor::new(script.as_ref().to_vec()),
            output: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl Read for ScriptStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
