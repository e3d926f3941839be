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

use std::time::Duration;

use log::{debug, info, warn};

use super::token::Token;
use super::{MatchResult, PendingSet};
use crate::imap::{MailboxConnector, MailboxSession};
use crate::support::{
    clock::Clock, config::Credentials, error::Error, progress::Progress,
};

/// Statistics about a successful reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    /// How many polling rounds it took for the last probe to show up.
    pub rounds: u32,
}

/// Waits for every probe in `pending` to arrive in the mailbox reached
/// through `connector`, flagging each one for deletion as it is found.
///
/// Fails with `Error::Timeout` if probes are still missing once `timeout` has
/// elapsed. Whatever happens after the connection is established, the session
/// is logged out before returning.
pub fn reconcile<M, C>(
    connector: &M,
    credentials: &Credentials,
    timeout: Duration,
    poll_interval: Duration,
    pending: PendingSet,
    clock: &C,
    progress: &mut Progress<'_>,
) -> Result<Reconciliation, Error>
where
    M: MailboxConnector + ?Sized,
    C: Clock + ?Sized,
{
    progress.line(format_args!(
        "Connecting to IMAP box at {}",
        connector.endpoint()
    ));
    let mut session = connector.connect()?;

    let result = Reconciler {
        session: &mut session,
        clock,
        progress,
        pending,
        poll_interval,
    }
    .run(credentials, timeout);

    // Logging out is a courtesy; its failure must not replace the real
    // outcome.
    if let Err(e) = session.logout() {
        warn!("Failed to log out of {}: {}", connector.endpoint(), e);
    }

    result
}

struct Reconciler<'a, 'p, S: ?Sized, C: ?Sized> {
    session: &'a mut S,
    clock: &'a C,
    progress: &'a mut Progress<'p>,
    pending: PendingSet,
    poll_interval: Duration,
}

impl<S: MailboxSession + ?Sized, C: Clock + ?Sized> Reconciler<'_, '_, S, C> {
    fn run(
        mut self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Reconciliation, Error> {
        self.session.login(&credentials.user, &credentials.password)?;
        self.session.select_inbox()?;

        // None when the deadline is past what `Instant` can represent.
        let deadline = self.clock.now().checked_add(timeout);
        let mut rounds = 0u32;
        loop {
            if deadline.map_or(false, |deadline| self.clock.now() > deadline) {
                let unanswered = self.pending.unanswered_senders();
                warn!(
                    "Gave up after {} rounds; still waiting on {}",
                    rounds,
                    unanswered.join(", "),
                );
                return Err(Error::Timeout(unanswered));
            }

            rounds += 1;
            self.round()?;

            if self.pending.is_empty() {
                info!("All probes arrived after {} round(s)", rounds);
                return Ok(Reconciliation { rounds });
            }

            debug!(
                "Round {} finished with {} probe(s) outstanding",
                rounds,
                self.pending.len()
            );
            self.clock.sleep(self.poll_interval);
        }
    }

    /// Checks once for every outstanding probe.
    fn round(&mut self) -> Result<(), Error> {
        // Some servers only notice newly delivered mail once prodded.
        self.session.noop()?;

        let outstanding = self
            .pending
            .iter()
            .map(|(token, sender)| (token, sender.to_owned()))
            .collect::<Vec<_>>();

        for (token, sender) in outstanding {
            if let MatchResult::Found(uid) = self.search(token, &sender)? {
                self.progress.line(format_args!("Found {}!", token));
                let answer = self.session.flag_deleted_and_seen(uid)?;
                self.progress.line(format_args!("{:?}", answer));

                let removed = self.pending.remove(token);
                debug_assert_eq!(Some(sender), removed);
            }
        }

        Ok(())
    }

    fn search(
        &mut self,
        token: Token,
        sender: &str,
    ) -> Result<MatchResult, Error> {
        self.progress.line(format_args!(
            "Searching for: {} from {}...",
            token, sender
        ));

        let uids = self
            .session
            .search_by_subject_and_from(&token.to_string(), sender)?;
        if uids.len() > 1 {
            debug!(
                "{} messages match {}; flagging only UID {}",
                uids.len(),
                token,
                uids[0],
            );
        }

        Ok(MatchResult::from_uids(&uids))
    }
}
