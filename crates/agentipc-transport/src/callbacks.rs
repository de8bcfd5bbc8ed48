use std::io;

/// Protocol hook invoked for every completed read on a connection.
///
/// Called from a worker thread, at most once per read. Returning `Ok(None)`
/// keeps the connection open without writing anything; `Ok(Some(bytes))`
/// queues `bytes` as the response. An `Err` closes the connection.
pub trait IpcCallbacks: Send + Sync {
    fn data_received(&self, request: &[u8]) -> io::Result<Option<Vec<u8>>>;
}

impl<F> IpcCallbacks for F
where
    F: Fn(&[u8]) -> io::Result<Option<Vec<u8>>> + Send + Sync,
{
    fn data_received(&self, request: &[u8]) -> io::Result<Option<Vec<u8>>> {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_closure_callbacks() {
        let echo: Arc<dyn IpcCallbacks> = Arc::new(|req: &[u8]| Ok(Some(req.to_vec())));
        assert_eq!(echo.data_received(b"ping").unwrap(), Some(b"ping".to_vec()));

        let silent: Arc<dyn IpcCallbacks> = Arc::new(|_: &[u8]| Ok(None));
        assert_eq!(silent.data_received(b"ping").unwrap(), None);
    }
}
