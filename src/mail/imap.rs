//! Minimal blocking IMAP client over rustls. Run it on `spawn_blocking`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use secrecy::ExposeSecret;

use crate::mail::MailboxConfig;

pub(crate) type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Tagged response: untagged lines, any literals, and the final status line.
#[derive(Debug, Default)]
pub(crate) struct Response {
    pub lines: Vec<String>,
    pub literals: Vec<Vec<u8>>,
    pub status: String,
}

impl Response {
    fn is_ok(&self, tag: &str) -> bool {
        self.status
            .strip_prefix(tag)
            .is_some_and(|rest| rest.trim_start().starts_with("OK"))
    }
}

pub(crate) struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    /// Connect, log in and select INBOX.
    pub fn open(config: &MailboxConfig, timeout: Duration) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.imap_host.clone())?;
        let conn = ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            tls: StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let _greeting = session.read_line()?;

        let login = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        session.expect_ok(&login).map_err(|_| "IMAP login failed")?;
        session.expect_ok("SELECT \"INBOX\"")?;
        Ok(session)
    }

    /// UIDs of unseen messages, ascending.
    pub fn search_unseen(&mut self) -> Result<Vec<String>, ImapError> {
        let response = self.expect_ok("UID SEARCH UNSEEN")?;
        Ok(parse_search(&response.lines))
    }

    /// Full message by UID without setting `\Seen`.
    pub fn fetch(&mut self, uid: &str) -> Result<Option<Vec<u8>>, ImapError> {
        let mut response = self.expect_ok(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(response.literals.pop())
    }

    pub fn mark_seen(&mut self, uid: &str) -> Result<(), ImapError> {
        self.expect_ok(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
        Ok(())
    }

    pub fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }

    fn expect_ok(&mut self, cmd: &str) -> Result<Response, ImapError> {
        let (tag, response) = self.command(cmd)?;
        if response.is_ok(&tag) {
            Ok(response)
        } else {
            Err(format!("IMAP command failed: {}", response.status.trim()).into())
        }
    }

    fn command(&mut self, cmd: &str) -> Result<(String, Response), ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if line.starts_with(&format!("{tag} ")) {
                response.status = line;
                return Ok((tag, response));
            }
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.tls.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.tls.read(&mut byte)? {
                0 => return Err("IMAP connection closed".into()),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
            }
        }
    }
}

/// Byte count of a `{N}` literal announced at the end of a line.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let open = line.rfind('{')?;
    line.strip_suffix('}')?.get(open + 1..)?.parse().ok()
}

fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
