use crate::policy;
use agentipc_core::{Error, Result, DEFAULT_MAX_MESSAGE_SIZE};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Blocking client for one request/response exchange with a named server.
#[derive(Debug)]
pub struct IpcClient {
    stream: UnixStream,
    path: PathBuf,
}

impl IpcClient {
    /// Connect to server `name` in socket directory `dir`.
    pub fn connect(dir: &Path, name: &str) -> Result<Self> {
        let path = policy::socket_path(dir, name)?;
        Self::connect_path(&path)
    }

    /// Connect to a socket file directly.
    pub fn connect_path(path: &Path) -> Result<Self> {
        policy::check_socket_path_len(path)?;
        let stream = UnixStream::connect(path)?;
        Ok(Self {
            stream,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `timeout` to both reads and writes. `None` blocks forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Write `bytes` without ending the request.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Signal the end of the request by shutting down the write half.
    pub fn finish(&self) -> Result<()> {
        self.stream.shutdown(Shutdown::Write)?;
        Ok(())
    }

    /// Read until the server closes the connection, at most `max` bytes.
    pub fn receive(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
        (&mut self.stream).take(limit).read_to_end(&mut buf)?;
        if buf.len() > max {
            return Err(Error::ResponseTooLarge {
                size: buf.len(),
                max,
            });
        }
        Ok(buf)
    }

    /// Send `request`, end it, and read the whole response.
    pub fn request(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.send(request)?;
        self.finish()?;
        self.receive(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use tempfile::tempdir;

    #[test]
    fn test_connect_validates_name() {
        let tmp = tempdir().unwrap();
        let err = IpcClient::connect(tmp.path(), "../etc").unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));
    }

    #[test]
    fn test_connect_missing_socket() {
        let tmp = tempdir().unwrap();
        let err = IpcClient::connect(tmp.path(), "svc").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_request_against_plain_listener() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sock-svc");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut req = Vec::new();
            stream.read_to_end(&mut req).unwrap();
            stream.write_all(&req.repeat(2)).unwrap();
        });

        let mut client = IpcClient::connect(tmp.path(), "svc").unwrap();
        client.set_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(client.path(), path);
        assert_eq!(client.request(b"ab").unwrap(), b"abab");
        server.join().unwrap();
    }

    #[test]
    fn test_receive_limit() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sock-big");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[0u8; 32]).unwrap();
        });

        let mut client = IpcClient::connect_path(&path).unwrap();
        let err = client.receive(16).unwrap_err();
        assert!(matches!(err, Error::ResponseTooLarge { max: 16, .. }));
        server.join().unwrap();
    }
}
