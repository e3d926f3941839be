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

use std::num::NonZeroU32;
use std::time::Duration;

use chrono::prelude::*;
use log::{debug, warn};

use super::token::Token;
use super::{compose_subject, PendingSet, Probe};
use crate::smtp::{Envelope, MailTransport, SendError};
use crate::support::{
    clock::Clock,
    config::ConfigError,
    error::Error,
    progress::Progress,
};

/// What to do when the relay resets the connection mid-send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait before sending again.
    pub delay: Duration,
    /// The most send attempts to make for one probe. `None` never gives up.
    pub max_attempts: Option<NonZeroU32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            delay: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Sends one probe from each distinct sender in `senders` to all of
/// `recipients`, returning the set of probes to look for.
///
/// Connection resets are retried according to `policy`; any other failure
/// aborts the whole batch.
pub fn send_probes<T, C>(
    transport: &mut T,
    clock: &C,
    progress: &mut Progress<'_>,
    policy: RetryPolicy,
    run_id: &str,
    senders: &[String],
    recipients: &[String],
) -> Result<PendingSet, Error>
where
    T: MailTransport + ?Sized,
    C: Clock + ?Sized,
{
    if senders.is_empty() {
        return Err(ConfigError::NoSenders.into());
    }
    if recipients.is_empty() {
        return Err(ConfigError::Invalid {
            key: "destinations",
            reason: "at least one destination is required".to_owned(),
        }
        .into());
    }

    let sent_at = Local::now().naive_local();
    let mut pending = PendingSet::new();
    let mut seen = Vec::<&str>::with_capacity(senders.len());

    for sender in senders {
        if seen.contains(&&**sender) {
            debug!("Skipping duplicate sender {}", sender);
            continue;
        }
        seen.push(sender);

        let token = Token::mint();
        let probe = Probe {
            token,
            sender: sender.clone(),
            subject: compose_subject(run_id, sender, &sent_at, token),
        };

        progress.line(format_args!(
            "Sending from {} to {:?} an email titled: {}",
            probe.sender, recipients, probe.subject,
        ));

        let attempts = send_with_retry(
            transport,
            clock,
            policy,
            &Envelope {
                subject: &probe.subject,
                body: "",
                from: &probe.sender,
                to: recipients,
            },
        )?;
        debug!("Probe {} sent after {} attempt(s)", probe.token, attempts);

        pending.insert(&probe);
    }

    Ok(pending)
}

/// Sends `envelope`, returning how many attempts it took.
fn send_with_retry<T, C>(
    transport: &mut T,
    clock: &C,
    policy: RetryPolicy,
    envelope: &Envelope<'_>,
) -> Result<u32, Error>
where
    T: MailTransport + ?Sized,
    C: Clock + ?Sized,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match transport.send(envelope) {
            Ok(()) => return Ok(attempts),

            Err(SendError::Transient(e)) => {
                if policy
                    .max_attempts
                    .map_or(false, |max| attempts >= max.get())
                {
                    return Err(Error::SendRetriesExhausted {
                        from: envelope.from.to_owned(),
                        attempts,
                    });
                }

                warn!(
                    "Connection lost sending from {} (attempt {}): {}; \
                     retrying in {:?}",
                    envelope.from, attempts, e, policy.delay,
                );
                clock.sleep(policy.delay);
            }

            Err(SendError::Fatal(source)) => {
                return Err(Error::Send {
                    from: envelope.from.to_owned(),
                    source,
                });
            }
        }
    }
}
