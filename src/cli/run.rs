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

use std::io;

use log::info;

use super::main::RunSubcommand;
use crate::imap::ImapConnector;
use crate::probe;
use crate::smtp::SmtpTransport;
use crate::support::clock::SystemClock;
use crate::support::progress::Progress;
use crate::support::sysexits::*;

pub(super) fn main(cmd: RunSubcommand) {
    init_log(&cmd);

    let mut settings = super::main::load_settings(&cmd.common.config);
    settings.allow_insecure_tls_connections |=
        cmd.allow_insecure_tls_connections;

    let mut transport = SmtpTransport::new(
        settings.smtp.clone(),
        settings.allow_insecure_tls_connections,
        cmd.trace,
    );
    let connector = ImapConnector::new(
        &settings.mailbox,
        settings.allow_insecure_tls_connections,
        cmd.trace,
    );
    let mut progress = if cmd.verbose {
        Progress::to(io::stdout())
    } else {
        Progress::quiet()
    };

    match probe::run(
        &settings,
        &mut transport,
        &connector,
        &SystemClock,
        &mut progress,
    ) {
        Ok(result) => {
            info!(
                "{}: all {} probe(s) arrived after {} round(s)",
                settings.identifier,
                settings.senders.len(),
                result.rounds
            );
            if cmd.verbose {
                println!("All probes arrived");
            }
        }
        Err(e) => {
            info!("{}: failed: {}", settings.identifier, e);
            die!(e.sysexit(), "{}", e)
        }
    }
}

fn init_log(cmd: &RunSubcommand) {
    if let Some(ref path) = cmd.log_config {
        if let Err(e) =
            log4rs::init_file(path, log4rs::file::Deserializers::default())
        {
            die!(
                EX_CONFIG,
                "Failed to load logging configuration from '{}': {}",
                path.display(),
                e
            );
        }
    } else {
        crate::init_simple_log(if cmd.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        });
    }
}
