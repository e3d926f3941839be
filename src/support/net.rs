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

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use openssl::ssl::{HandshakeError, SslConnector, SslMethod, SslStream, SslVerifyMode};

/// How long any single read or write may block.
pub const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Opens a TCP connection to `host:port`, trying each resolved address in
/// turn.
///
/// Returns an error of kind `NotFound` if `host` does not resolve at all.
pub fn connect_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_error = None;
    for address in (host, port).to_socket_addrs()? {
        debug!("Connecting to {}", address);
        match TcpStream::connect_timeout(&address, IO_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", address, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "Host not found")
    }))
}

/// Performs a client TLS handshake over `stream`, verifying that the peer
/// is `host` unless `allow_insecure` is set.
pub fn start_tls<S: Read + Write>(
    host: &str,
    stream: S,
    allow_insecure: bool,
) -> Result<SslStream<S>, openssl::ssl::Error> {
    let mut connector = SslConnector::builder(SslMethod::tls())?;
    if allow_insecure {
        connector.set_verify(SslVerifyMode::NONE);
    }

    connector
        .build()
        .connect(host, stream)
        .map_err(|e| match e {
            HandshakeError::SetupFailure(es) => es.into(),
            HandshakeError::Failure(f) => f.into_error(),
            HandshakeError::WouldBlock(f) => f.into_error(),
        })
}

/// Whether `e` means the peer went away mid-conversation, as opposed to
/// refusing, timing out, or not existing.
pub fn is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
