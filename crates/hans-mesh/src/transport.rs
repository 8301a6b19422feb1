//! Socket plumbing behind an [`Endpoint`]

use std::io;
#[cfg(unix)]
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{MeshError, MeshResult};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A bound listener that has not been handed to a runtime yet
pub(crate) enum BoundListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Ipc(std::os::unix::net::UnixListener, PathBuf),
}

impl BoundListener {
    /// Bind synchronously so address errors surface to the caller at once
    pub(crate) fn bind(endpoint: &Endpoint) -> MeshResult<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = std::net::TcpListener::bind(addr.as_str()).map_err(|e| {
                    MeshError::ConnectionFailed(format!("cannot bind {endpoint}: {e}"))
                })?;
                listener.set_nonblocking(true)?;
                Ok(BoundListener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                if path.exists() {
                    debug!(path = %path.display(), "Removing stale socket file");
                    std::fs::remove_file(path)?;
                }
                let listener = std::os::unix::net::UnixListener::bind(path).map_err(|e| {
                    MeshError::ConnectionFailed(format!("cannot bind {endpoint}: {e}"))
                })?;
                listener.set_nonblocking(true)?;
                Ok(BoundListener::Ipc(listener, path.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(MeshError::InvalidEndpoint {
                address: endpoint.to_string(),
                reason: "ipc endpoints need Unix domain sockets".to_string(),
            }),
        }
    }

    /// The address peers should connect to, with an OS-assigned port filled in
    pub(crate) fn local_endpoint(&self) -> MeshResult<Endpoint> {
        match self {
            BoundListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            BoundListener::Ipc(_, path) => Ok(Endpoint::Ipc(path.clone())),
        }
    }

    /// Register with the current runtime; must run inside its context
    pub(crate) fn into_listener(self) -> io::Result<Listener> {
        match self {
            BoundListener::Tcp(listener) => Ok(Listener::Tcp(TcpListener::from_std(listener)?)),
            #[cfg(unix)]
            BoundListener::Ipc(listener, path) => Ok(Listener::Ipc(
                tokio::net::UnixListener::from_std(listener)?,
                path,
            )),
        }
    }
}

pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Ipc(tokio::net::UnixListener, PathBuf),
}

impl Listener {
    /// Wait for the next peer and split its stream
    pub(crate) async fn accept(&self) -> io::Result<(BoxedRead, BoxedWrite, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Ipc(listener, path) => {
                let (stream, _) = listener.accept().await?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write), path.display().to_string()))
            }
        }
    }
}

/// Open a connection to a leader
pub(crate) async fn connect(endpoint: &Endpoint) -> MeshResult<(BoxedRead, BoxedWrite)> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| MeshError::ConnectionFailed(format!("{endpoint}: {e}")))?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            Ok((Box::new(read), Box::new(write)))
        }
        #[cfg(unix)]
        Endpoint::Ipc(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(|e| MeshError::ConnectionFailed(format!("{endpoint}: {e}")))?;
            let (read, write) = stream.into_split();
            Ok((Box::new(read), Box::new(write)))
        }
        #[cfg(not(unix))]
        Endpoint::Ipc(_) => Err(MeshError::InvalidEndpoint {
            address: endpoint.to_string(),
            reason: "ipc endpoints need Unix domain sockets".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, read_frame, write_frames};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_tcp_port_zero_resolves_and_carries_frames() {
        let bound = BoundListener::bind(&Endpoint::tcp("127.0.0.1:0")).unwrap();
        let endpoint = bound.local_endpoint().unwrap();
        assert!(!endpoint.to_string().ends_with(":0"));
        let listener = bound.into_listener().unwrap();

        let server = tokio::spawn(async move {
            let (read, _write, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(read).lines();
            read_frame(&mut lines).await.unwrap()
        });

        let (_read, write) = connect(&endpoint).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Frame::Promoted).unwrap();
        drop(tx);
        write_frames(write, rx).await.unwrap();

        assert_eq!(server.await.unwrap(), Some(Frame::Promoted));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ipc_rebinds_over_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leader.ipc");
        std::fs::write(&path, b"stale").unwrap();

        let bound = BoundListener::bind(&Endpoint::ipc(&path)).unwrap();
        assert_eq!(bound.local_endpoint().unwrap(), Endpoint::ipc(&path));
        let listener = bound.into_listener().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        connect(&Endpoint::ipc(&path)).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failed() {
        let bound = BoundListener::bind(&Endpoint::tcp("127.0.0.1:0")).unwrap();
        let endpoint = bound.local_endpoint().unwrap();
        drop(bound);

        assert!(matches!(
            connect(&endpoint).await,
            Err(MeshError::ConnectionFailed(_))
        ));
    }
}
