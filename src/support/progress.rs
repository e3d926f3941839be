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

use std::fmt;
use std::io::Write;

use log::{info, warn};

/// Receives the human-readable progress lines printed in verbose mode.
///
/// Every line is also logged at `info` level regardless of whether the sink
/// is enabled, so a run under a log file still records what happened.
pub struct Progress<'a> {
    out: Option<Box<dyn Write + 'a>>,
}

impl<'a> Progress<'a> {
    /// A sink that only logs.
    pub fn quiet() -> Self {
        Progress { out: None }
    }

    /// A sink that writes each line to `out`.
    pub fn to(out: impl Write + 'a) -> Self {
        Progress {
            out: Some(Box::new(out)),
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.out.is_some()
    }

    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        info!("{}", args);
        if let Some(ref mut out) = self.out {
            if let Err(e) = writeln!(out, "{}", args).and_then(|_| out.flush())
            {
                warn!("Failed to write progress line: {}", e);
            }
        }
    }
}

impl fmt::Debug for Progress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Progress")
            .field("verbose", &self.is_verbose())
            .finish()
    }
}
