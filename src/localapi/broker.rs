#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use glob::glob;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::utils::config::Config;
use crate::utils::errors::Errors;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// The sandboxed macOS app advertises its loopback port and auth token as the
// name of an otherwise empty file: sameuserproof-<port>-<token>.
const PROOF_FILE_PREFIX: &str = "sameuserproof-";

// ***************************************************************************
//                                 Types
// ***************************************************************************
/// Where the local API can be reached from this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    Unix(PathBuf),
    Tcp { port: u16, token: String },
}

impl BrokerEndpoint {
    /// Credential to send as the basic auth password, if any.
    pub fn token(&self) -> Option<&str> {
        match self {
            BrokerEndpoint::Unix(_) => None,
            BrokerEndpoint::Tcp { token, .. } => Some(token),
        }
    }
}

/// Any byte stream the local API can be spoken over.
pub trait LocalStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LocalStream for T {}

/// An open connection to the local API plus the credential to present on it.
pub struct Channel {
    pub stream: Box<dyn LocalStream>,
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Broker:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct Broker {
    socket_path: PathBuf,
    token_dir: Option<String>,
}

impl Broker {
    pub fn new(socket_path: impl Into<PathBuf>, token_dir: Option<String>) -> Self {
        Broker { socket_path: socket_path.into(), token_dir }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.socket_path, config.token_dir.clone())
    }

    // -----------------------------------------------------------------------
    // discover:
    // -----------------------------------------------------------------------
    /** Prefer a loopback port and token when one is advertised, otherwise use
     * the unix socket.  Discovery is repeated on every call.
     */
    pub fn discover(&self) -> BrokerEndpoint {
        match self.local_tcp_port_and_token() {
            Ok((port, token)) => BrokerEndpoint::Tcp { port, token },
            Err(e) => {
                debug!("{}; using unix socket {:?}", e, self.socket_path);
                BrokerEndpoint::Unix(self.socket_path.clone())
            }
        }
    }

    // -----------------------------------------------------------------------
    // connect:
    // -----------------------------------------------------------------------
    /** Open one connection to the endpoint found by discover(). */
    pub async fn connect(&self) -> Result<Channel, Errors> {
        let endpoint = self.discover();
        let token = endpoint.token().map(str::to_string);
        let stream: Box<dyn LocalStream> = match &endpoint {
            BrokerEndpoint::Unix(path) => Box::new(UnixStream::connect(path).await.map_err(|e| {
                Errors::Transport(format!("dial {}: {}", path.display(), e))
            })?),
            BrokerEndpoint::Tcp { port, .. } => {
                Box::new(TcpStream::connect(("localhost", *port)).await.map_err(|e| {
                    Errors::Transport(format!("dial localhost:{}: {}", port, e))
                })?)
            }
        };
        Ok(Channel { stream, token })
    }

    // -----------------------------------------------------------------------
    // local_tcp_port_and_token:
    // -----------------------------------------------------------------------
    pub fn local_tcp_port_and_token(&self) -> Result<(u16, String), Errors> {
        let dir = match &self.token_dir {
            Some(d) => d,
            None => return Err(Errors::Broker("no token directory configured".to_string())),
        };

        let pattern = format!("{}/{}*", dir.trim_end_matches('/'), PROOF_FILE_PREFIX);
        let paths = glob(&pattern).map_err(|e| Errors::Broker(format!("{}: {}", pattern, e)))?;
        for entry in paths.flatten() {
            if let Some(found) = parse_proof_file(&entry) {
                return Ok(found);
            }
        }
        Err(Errors::Broker(format!("nothing matches {}", pattern)))
    }
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
fn parse_proof_file(path: &Path) -> Option<(u16, String)> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(PROOF_FILE_PREFIX)?;
    let (port, token) = rest.split_once('-')?;
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    if token.is_empty() {
        return None;
    }
    Some((port, token.to_string()))
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn parses_proof_file_names() {
        assert_eq!(parse_proof_file(Path::new("/x/sameuserproof-41112-abc-def")),
                   Some((41112, "abc-def".to_string())));
        assert_eq!(parse_proof_file(Path::new("/x/sameuserproof-notaport-abc")), None);
        assert_eq!(parse_proof_file(Path::new("/x/sameuserproof-0-abc")), None);
        assert_eq!(parse_proof_file(Path::new("/x/sameuserproof-8080-")), None);
        assert_eq!(parse_proof_file(Path::new("/x/other-8080-abc")), None);
    }

    #[test]
    fn falls_back_to_unix_socket_without_token_dir() {
        let broker = Broker::new("/var/run/tailscale/tailscaled.sock", None);
        assert_eq!(broker.discover(), BrokerEndpoint::Unix("/var/run/tailscale/tailscaled.sock".into()));
        assert_eq!(broker.discover().token(), None);
    }

    #[test]
    fn falls_back_to_unix_socket_on_empty_token_dir() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new("/tmp/x.sock", Some(dir.path().to_string_lossy().into_owned()));
        assert!(matches!(broker.discover(), BrokerEndpoint::Unix(_)));
    }

    #[test]
    fn finds_advertised_port_and_token() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("sameuserproof-51234-s3cr3t")).unwrap();
        let broker = Broker::new("/tmp/x.sock", Some(dir.path().to_string_lossy().into_owned()));
        let endpoint = broker.discover();
        assert_eq!(endpoint, BrokerEndpoint::Tcp { port: 51234, token: "s3cr3t".to_string() });
        assert_eq!(endpoint.token(), Some("s3cr3t"));
    }

    #[test]
    fn token_dir_may_be_a_glob() {
        let dir = tempfile::tempdir().unwrap();
        let group = dir.path().join("ABC123.io.tailscale.ipn.macos");
        std::fs::create_dir(&group).unwrap();
        File::create(group.join("sameuserproof-40000-tok")).unwrap();
        let pattern = format!("{}/*.io.tailscale.ipn.macos", dir.path().display());
        let broker = Broker::new("/tmp/x.sock", Some(pattern));
        assert_eq!(broker.local_tcp_port_and_token().unwrap(), (40000, "tok".to_string()));
    }

    #[tokio::test]
    async fn connect_reports_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(dir.path().join("missing.sock"), None);
        match broker.connect().await {
            Err(Errors::Transport(msg)) => assert!(msg.contains("missing.sock")),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("connected to a missing socket"),
        }
    }
}
