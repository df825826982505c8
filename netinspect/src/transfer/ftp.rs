//! Passive-mode FTP retrieval.
//!
//! Binary mode, one `RETR` per connection. The data connection goes to the
//! control connection's peer address; the address inside the `227` reply
//! is ignored because devices behind NAT routinely advertise a private one.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::{ArtifactTransport, RetrievalTask, TransportKind};
use crate::error::{RetrievalError, TransportError};
use crate::session::DeviceSession;

/// Fetches files over FTP.
pub struct FtpTransport {
    port: u16,
    connect_timeout: Duration,
    transfer_timeout: Duration,
    default_username: String,
    default_password: SecretString,
}

impl FtpTransport {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            transfer_timeout: Duration::from_secs(300),
            default_username: "admin".to_string(),
            default_password: SecretString::from("password".to_string()),
        }
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Login used when the task carries an empty username or password.
    pub fn with_default_login(mut self, username: &str, password: &str) -> Self {
        self.default_username = username.to_string();
        self.default_password = SecretString::from(password.to_string());
        self
    }

    async fn retrieve(&self, task: &RetrievalTask<'_>) -> Result<Vec<u8>, RetrievalError> {
        let username = if task.username.is_empty() {
            self.default_username.as_str()
        } else {
            task.username
        };
        let password = if task.password.expose_secret().is_empty() {
            &self.default_password
        } else {
            task.password
        };

        let mut control = Control::connect(task.address, self.port, self.connect_timeout).await?;
        control.expect(&[220]).await?;

        let reply = control.command(&format!("USER {username}")).await?;
        match reply.code {
            230 => {}
            331 | 332 => {
                control
                    .send(&format!("PASS {}", password.expose_secret()))
                    .await?;
                control.expect(&[230, 202]).await?;
            }
            _ => return Err(reply.into_error()),
        }

        control.command("TYPE I").await?.require(&[200])?;
        let reply = control.command("PASV").await?.require(&[227])?;
        let data_port = parse_pasv(&reply.text)?;
        let data_addr = SocketAddr::new(control.peer.ip(), data_port);
        trace!("FTP data connection to {}", data_addr);
        let mut data = TcpStream::connect(data_addr)
            .await
            .map_err(|source| TransportError::ConnectionFailed {
                host: task.address.to_string(),
                port: data_port,
                source,
            })?;

        control
            .command(&format!("RETR {}", task.filename))
            .await?
            .require(&[125, 150])?;

        let mut content = Vec::new();
        data.read_to_end(&mut content).await?;
        drop(data);

        control.expect(&[226, 250]).await?;
        let _ = control.command("QUIT").await;
        debug!(
            "{}: FTP transfer of {} complete ({} bytes)",
            task.address,
            task.filename,
            content.len()
        );
        Ok(content)
    }
}

#[async_trait]
impl ArtifactTransport for FtpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ftp
    }

    async fn fetch(
        &self,
        task: &RetrievalTask<'_>,
        _session: &mut dyn DeviceSession,
    ) -> Result<Vec<u8>, RetrievalError> {
        tokio::time::timeout(self.transfer_timeout, self.retrieve(task))
            .await
            .map_err(|_| RetrievalError::Timeout(self.transfer_timeout))?
    }
}

/// One complete server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn require(self, codes: &[u16]) -> Result<Self, RetrievalError> {
        if codes.contains(&self.code) {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    fn into_error(self) -> RetrievalError {
        if self.code >= 400 {
            RetrievalError::Remote {
                message: format!("{} {}", self.code, self.text),
            }
        } else {
            RetrievalError::Unexpected {
                message: format!("{} {}", self.code, self.text),
            }
        }
    }
}

struct Control {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl Control {
    async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, RetrievalError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|source| TransportError::ConnectionFailed {
                host: host.to_string(),
                port,
                source,
            })?;
        let peer = stream.peer_addr()?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            peer,
        })
    }

    async fn send(&mut self, line: &str) -> Result<(), RetrievalError> {
        if line.starts_with("PASS ") {
            trace!("FTP > PASS ****");
        } else {
            trace!("FTP > {}", line);
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<Reply, RetrievalError> {
        self.send(line).await?;
        self.read_reply().await
    }

    async fn expect(&mut self, codes: &[u16]) -> Result<Reply, RetrievalError> {
        self.read_reply().await?.require(codes)
    }

    /// Read a reply, following `123-` continuation lines to `123 `.
    async fn read_reply(&mut self) -> Result<Reply, RetrievalError> {
        let mut lines = Vec::new();
        let mut first: Option<u16> = None;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(TransportError::Disconnected.into());
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            trace!("FTP < {}", line);

            match (first, parse_reply_line(&line)) {
                (None, Some((code, last, text))) => {
                    lines.push(text.to_string());
                    if last {
                        return Ok(Reply {
                            code,
                            text: lines.join("\n"),
                        });
                    }
                    first = Some(code);
                }
                (None, None) => {
                    return Err(RetrievalError::Unexpected {
                        message: format!("malformed reply '{line}'"),
                    });
                }
                (Some(code), Some((line_code, true, text))) if line_code == code => {
                    lines.push(text.to_string());
                    return Ok(Reply {
                        code,
                        text: lines.join("\n"),
                    });
                }
                (Some(_), _) => lines.push(line.clone()),
            }
        }
    }
}

/// Split `"227 text"` or `"220-text"` into code, final-line flag and text.
fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let code = line.get(..3)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = code.parse().ok()?;
    match line.as_bytes().get(3) {
        None => Some((code, true, "")),
        Some(b' ') => Some((code, true, &line[4..])),
        Some(b'-') => Some((code, false, &line[4..])),
        Some(_) => None,
    }
}

/// Data port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv(text: &str) -> Result<u16, RetrievalError> {
    let malformed = || RetrievalError::Unexpected {
        message: format!("malformed PASV reply '{text}'"),
    };
    let start = text.find(|c: char| c.is_ascii_digit()).ok_or_else(malformed)?;
    let fields: Vec<u8> = text[start..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|f| !f.is_empty())
        .take(6)
        .map(|f| f.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed())?;
    if fields.len() != 6 {
        return Err(malformed());
    }
    Ok(u16::from(fields[4]) << 8 | u16::from(fields[5]))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::device::{Credentials, DeviceRecord};
    use crate::session::SessionConnector;
    use crate::session::mock::ScriptedConnector;

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("220 Service ready"), Some((220, true, "Service ready")));
        assert_eq!(parse_reply_line("220-Welcome"), Some((220, false, "Welcome")));
        assert_eq!(parse_reply_line("226"), Some((226, true, "")));
        assert_eq!(parse_reply_line(" banner"), None);
        assert_eq!(parse_reply_line("22x ok"), None);
    }

    #[test]
    fn test_parse_pasv() {
        assert_eq!(
            parse_pasv("Entering Passive Mode (192,168,1,10,19,137)").unwrap(),
            19 * 256 + 137
        );
        assert_eq!(parse_pasv("=127,0,0,1,4,1").unwrap(), 1025);
        assert!(parse_pasv("Entering Passive Mode").is_err());
        assert!(parse_pasv("(10,0,0,1,300,1)").is_err());
    }

    /// Loopback server for one passive RETR. Returns the commands it saw.
    async fn fake_server(
        content: &'static [u8],
        retr_reply: &'static str,
    ) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            let mut data_listener: Option<TcpListener> = None;

            write
                .write_all(b"220-Device FTP server\r\n220 ready\r\n")
                .await
                .unwrap();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line.clone());
                let verb = line.split(' ').next().unwrap_or_default().to_string();
                match verb.as_str() {
                    "USER" => write.write_all(b"331 Password required\r\n").await.unwrap(),
                    "PASS" => write.write_all(b"230 Logged in\r\n").await.unwrap(),
                    "TYPE" => write.write_all(b"200 Type set to I\r\n").await.unwrap(),
                    "PASV" => {
                        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                        let p = listener.local_addr().unwrap().port();
                        // Advertise an unreachable address; the client must use the peer's
                        let reply = format!(
                            "227 Entering Passive Mode (10,255,255,1,{},{})\r\n",
                            p >> 8,
                            p & 0xff
                        );
                        write.write_all(reply.as_bytes()).await.unwrap();
                        data_listener = Some(listener);
                    }
                    "RETR" => {
                        if retr_reply.starts_with("150") {
                            write.write_all(retr_reply.as_bytes()).await.unwrap();
                            let listener = data_listener.take().unwrap();
                            let (mut data, _) = listener.accept().await.unwrap();
                            data.write_all(content).await.unwrap();
                            data.shutdown().await.unwrap();
                            drop(data);
                            write.write_all(b"226 Transfer complete\r\n").await.unwrap();
                        } else {
                            write.write_all(retr_reply.as_bytes()).await.unwrap();
                        }
                    }
                    "QUIT" => {
                        write.write_all(b"221 Bye\r\n").await.unwrap();
                        break;
                    }
                    _ => write.write_all(b"502 Not implemented\r\n").await.unwrap(),
                }
            }
            seen
        });

        (port, handle)
    }

    async fn session() -> Box<dyn DeviceSession> {
        let device = DeviceRecord::new("127.0.0.1", "alcatel_aos", Credentials::new("admin", "pw"));
        ScriptedConnector::new().connect(&device).await.unwrap()
    }

    #[tokio::test]
    async fn test_passive_retrieve() {
        let (port, server) = fake_server(b"line one\nline two\n", "150 Opening BINARY\r\n").await;
        let transport = FtpTransport::new(port, Duration::from_secs(2))
            .with_transfer_timeout(Duration::from_secs(5));
        let password = SecretString::from("secret".to_string());
        let task = RetrievalTask {
            address: "127.0.0.1",
            filename: "tech_support.log",
            username: "operator",
            password: &password,
        };
        let mut session = session().await;

        let content = transport.fetch(&task, session.as_mut()).await.unwrap();
        assert_eq!(content, b"line one\nline two\n");

        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                "USER operator",
                "PASS secret",
                "TYPE I",
                "PASV",
                "RETR tech_support.log",
                "QUIT"
            ]
        );
    }

    #[tokio::test]
    async fn test_default_login_when_task_has_none() {
        let (port, server) = fake_server(b"x", "150 Opening\r\n").await;
        let transport = FtpTransport::new(port, Duration::from_secs(2))
            .with_default_login("ftpuser", "ftppass");
        let password = SecretString::from(String::new());
        let task = RetrievalTask {
            address: "127.0.0.1",
            filename: "a.log",
            username: "",
            password: &password,
        };
        let mut session = session().await;

        transport.fetch(&task, session.as_mut()).await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen[0], "USER ftpuser");
        assert_eq!(seen[1], "PASS ftppass");
    }

    #[tokio::test]
    async fn test_missing_file_is_remote_error() {
        let (port, _server) = fake_server(b"", "550 No such file\r\n").await;
        let transport = FtpTransport::new(port, Duration::from_secs(2));
        let password = SecretString::from("pw".to_string());
        let task = RetrievalTask {
            address: "127.0.0.1",
            filename: "missing.log",
            username: "admin",
            password: &password,
        };
        let mut session = session().await;

        let err = transport.fetch(&task, session.as_mut()).await.unwrap_err();
        match err {
            RetrievalError::Remote { message } => assert_eq!(message, "550 No such file"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = FtpTransport::new(port, Duration::from_secs(2));
        let password = SecretString::from("pw".to_string());
        let task = RetrievalTask {
            address: "127.0.0.1",
            filename: "a.log",
            username: "admin",
            password: &password,
        };
        let mut session = session().await;

        let err = transport.fetch(&task, session.as_mut()).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::Transport(TransportError::ConnectionFailed { .. })
        ));
    }
}
