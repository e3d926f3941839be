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

use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::config::Settings;
use crate::support::sysexits::*;

/// Checks that outbound email actually arrives.
///
/// Sends one uniquely tagged message from every configured sender address,
/// then watches the destination mailbox over IMAP until each one shows up,
/// deleting them as it goes.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Send the probes and wait for all of them to arrive.
    ///
    /// Exits 0 once every probe has been found. If some are still missing
    /// when the timeout expires, the senders they came from are listed and
    /// the exit status is EX_TEMPFAIL (75).
    Run(RunSubcommand),
    /// Validate the configuration file and show the resolved settings.
    ///
    /// Passwords are not shown. Nothing is sent and no connections are
    /// made.
    CheckConfig(CommonOptions),
}

#[derive(StructOpt)]
pub(super) struct CommonOptions {
    /// The configuration file to use.
    #[structopt(
        long,
        short,
        parse(from_os_str),
        default_value = "mailprobe.toml"
    )]
    pub(super) config: PathBuf,
}

#[derive(StructOpt)]
pub(super) struct RunSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Narrate each send and search on standard output.
    #[structopt(long, short)]
    pub(super) verbose: bool,

    /// Dump a trace of the SMTP and IMAP connections to standard error.
    #[structopt(long)]
    pub(super) trace: bool,

    /// Log debug messages to standard error.
    ///
    /// Ignored if --log-config is given.
    #[structopt(long)]
    pub(super) debug: bool,

    /// Allow insecure TLS connections
    #[structopt(long)]
    pub(super) allow_insecure_tls_connections: bool,

    /// A log4rs configuration file to use instead of logging to standard
    /// error.
    #[structopt(long, parse(from_os_str))]
    pub(super) log_config: Option<PathBuf>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    match cmd {
        Command::Run(cmd) => super::run::main(cmd),
        Command::CheckConfig(cmd) => check_config(&cmd.config),
    }
}

pub(super) fn load_settings(path: &Path) -> Settings {
    match Settings::load(path) {
        Ok(settings) => settings,
        Err(e) => die!(EX_CONFIG, "{}: {}", path.display(), e),
    }
}

fn check_config(path: &Path) {
    let settings = load_settings(path);
    println!("{:#?}", settings);
}
