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

//! The send-and-reconcile loop.
//!
//! A run happens in two strictly sequential stages. The prober sends one
//! uniquely-tagged message per sender identity and hands back the set of
//! probes it is waiting for; the reconciler then polls the destination
//! mailbox until that set is empty or the deadline passes.

pub mod prober;
pub mod reconciler;
pub mod token;

use std::collections::BTreeMap;

use chrono::prelude::*;

use self::reconciler::Reconciliation;
use self::token::Token;
use crate::imap::{MailboxConnector, MessageUid};
use crate::smtp::MailTransport;
use crate::support::{
    clock::Clock, config::Settings, error::Error, progress::Progress,
};

/// One sent probe message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    pub token: Token,
    pub sender: String,
    pub subject: String,
}

/// Builds the subject line of a probe.
///
/// The token is the only part the reconciler searches for; the rest is there
/// for whoever finds a straggler in the mailbox.
pub fn compose_subject(
    run_id: &str,
    sender: &str,
    sent_at: &NaiveDateTime,
    token: Token,
) -> String {
    format!(
        "Server {} is testing sending from {} at {} ({})",
        run_id,
        sender,
        sent_at.format("%Y-%m-%d %H:%M:%S%.6f"),
        token,
    )
}

/// The probes which have been sent but not yet seen in the mailbox.
///
/// Only the prober inserts; only the reconciler removes, and it removes each
/// token at most once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingSet {
    by_token: BTreeMap<Token, String>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, probe: &Probe) {
        let prev = self.by_token.insert(probe.token, probe.sender.clone());
        debug_assert!(prev.is_none(), "token {} minted twice", probe.token);
    }

    /// Removes `token`, returning the sender it was waiting on.
    pub fn remove(&mut self, token: Token) -> Option<String> {
        self.by_token.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.by_token.contains_key(&token)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, &str)> + '_ {
        self.by_token.iter().map(|(&t, s)| (t, &**s))
    }

    /// The senders still waited on, sorted.
    pub fn unanswered_senders(&self) -> Vec<String> {
        let mut senders = self.by_token.values().cloned().collect::<Vec<_>>();
        senders.sort();
        senders
    }
}

/// The outcome of searching for one pending probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchResult {
    Found(MessageUid),
    NotFound,
}

impl MatchResult {
    /// Interprets the UIDs returned by a search.
    ///
    /// More than one hit means the server delivered or indexed the probe
    /// twice; any of them confirms delivery, so the first is used.
    pub fn from_uids(uids: &[MessageUid]) -> Self {
        match uids.first() {
            Some(&uid) => MatchResult::Found(uid),
            None => MatchResult::NotFound,
        }
    }
}

/// Performs a complete run: sends every probe, then waits for all of them.
pub fn run<T, M, C>(
    settings: &Settings,
    transport: &mut T,
    connector: &M,
    clock: &C,
    progress: &mut Progress<'_>,
) -> Result<Reconciliation, Error>
where
    T: MailTransport + ?Sized,
    M: MailboxConnector + ?Sized,
    C: Clock + ?Sized,
{
    let pending = prober::send_probes(
        transport,
        clock,
        progress,
        settings.send_retry,
        &settings.identifier,
        &settings.senders,
        &settings.destinations,
    )?;

    reconciler::reconcile(
        connector,
        &settings.mailbox.credentials,
        settings.timeout,
        settings.poll_interval,
        pending,
        clock,
        progress,
    )
}
