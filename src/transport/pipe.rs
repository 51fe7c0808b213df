//! Platform-specific pipe/socket implementation.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! Pipes are addressed by logical name. [`pipe_path`] maps a name to the
//! platform address:
//! - Unix: absolute names are used verbatim, bare names become
//!   `{temp_dir}/{name}.sock`
//! - Windows: `\\.\pipe\{name}`
//!
//! # Example
//!
//! ```ignore
//! use pipeplex::transport::{ListenOptions, PipeListener, PipeStream};
//!
//! let listener = PipeListener::bind("demo", &ListenOptions::default())?;
//! let stream = listener.accept().await?;
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{PipeplexError, Result};

/// Access-control options handed to the platform listener unmodified.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Unix: permission bits applied to the socket file after bind.
    pub mode: Option<u32>,
    /// Windows: refuse connections from remote machines.
    pub reject_remote_clients: bool,
}

impl ListenOptions {
    /// Options with the given Unix permission bits.
    pub fn with_mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }
}

/// Map a logical pipe name to its platform address.
pub fn pipe_path(name: &str) -> PathBuf {
    #[cfg(unix)]
    {
        let path = std::path::Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::temp_dir().join(format!("{}.sock", name))
        }
    }

    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\{}", name))
    }
}

/// Check whether a listener currently exists for `name`.
pub fn exists(name: &str) -> bool {
    pipe_path(name).exists()
}

/// Errors worth retrying while the peer listener is not ready yet.
pub(crate) fn is_not_ready(err: &std::io::Error) -> bool {
    #[cfg(windows)]
    {
        const ERROR_PIPE_BUSY: i32 = 231;
        if err.raw_os_error() == Some(ERROR_PIPE_BUSY) {
            return true;
        }
    }
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener.
    pub struct PipeListener {
        listener: UnixListener,
        path: PathBuf,
    }

    /// Unix Domain Socket stream (connected).
    pub struct PipeStream {
        stream: UnixStream,
    }

    impl PipeListener {
        /// Bind a listener for `name`.
        ///
        /// Removes any stale socket file at the path before binding.
        pub fn bind(name: &str, options: &ListenOptions) -> Result<Self> {
            let path = pipe_path(name);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }

            let listener = UnixListener::bind(&path)?;
            if let Some(mode) = options.mode {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
            }

            Ok(Self { listener, path })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        /// Get the socket path.
        pub fn path(&self) -> &std::path::Path {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            // Clean up socket file when listener is dropped
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl PipeStream {
        /// Connect once to the listener for `name`.
        pub async fn connect(name: &str) -> Result<Self> {
            let stream = UnixStream::connect(pipe_path(name)).await?;
            Ok(Self { stream })
        }

        /// Get a reference to the underlying stream.
        pub fn inner(&self) -> &UnixStream {
            &self.stream
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_write_vectored(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            bufs: &[std::io::IoSlice<'_>],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
        }

        fn is_write_vectored(&self) -> bool {
            self.stream.is_write_vectored()
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Windows Named Pipe listener.
    ///
    /// Keeps one idle server instance alive so that the name exists and a
    /// client can connect while the previous instance is being handed off.
    pub struct PipeListener {
        path: PathBuf,
        reject_remote_clients: bool,
        next: Mutex<Option<NamedPipeServer>>,
    }

    /// Windows Named Pipe stream (connected).
    pub enum PipeStream {
        /// Accepted by a listener.
        Server(NamedPipeServer),
        /// Opened by [`PipeStream::connect`].
        Client(NamedPipeClient),
    }

    impl PipeListener {
        /// Create the first Named Pipe instance for `name`.
        pub fn bind(name: &str, options: &ListenOptions) -> Result<Self> {
            let path = pipe_path(name);
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .reject_remote_clients(options.reject_remote_clients)
                .create(&path)?;

            Ok(Self {
                path,
                reject_remote_clients: options.reject_remote_clients,
                next: Mutex::new(Some(first)),
            })
        }

        fn create_instance(&self) -> Result<NamedPipeServer> {
            Ok(ServerOptions::new()
                .reject_remote_clients(self.reject_remote_clients)
                .create(&self.path)?)
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<PipeStream> {
            let idle = self.next.lock().ok().and_then(|mut slot| slot.take());
            let server = match idle {
                Some(server) => server,
                None => self.create_instance()?,
            };

            server.connect().await?;

            let replacement = self.create_instance()?;
            if let Ok(mut slot) = self.next.lock() {
                *slot = Some(replacement);
            }
            Ok(PipeStream::Server(server))
        }

        /// Get the pipe path.
        pub fn path(&self) -> &std::path::Path {
            &self.path
        }
    }

    impl PipeStream {
        /// Connect once to the listener for `name`.
        pub async fn connect(name: &str) -> Result<Self> {
            let client = ClientOptions::new().open(pipe_path(name))?;
            Ok(PipeStream::Client(client))
        }
    }

    macro_rules! delegate {
        ($self:ident, $inner:ident => $call:expr) => {
            match $self.get_mut() {
                PipeStream::Server($inner) => $call,
                PipeStream::Client($inner) => $call,
            }
        };
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            delegate!(self, pipe => std::pin::Pin::new(pipe).poll_read(cx, buf))
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            delegate!(self, pipe => std::pin::Pin::new(pipe).poll_write(cx, buf))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            delegate!(self, pipe => std::pin::Pin::new(pipe).poll_flush(cx))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            delegate!(self, pipe => std::pin::Pin::new(pipe).poll_shutdown(cx))
        }
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{PipeListener, PipeStream};

impl PipeStream {
    /// Connect to `name`, retrying while the listener is not ready yet.
    ///
    /// Gives up with [`PipeplexError::Timeout`] once `timeout` has elapsed.
    pub async fn connect_timeout(
        name: &str,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::connect(name).await {
                Ok(stream) => return Ok(stream),
                Err(PipeplexError::Io(e)) if is_not_ready(&e) => {
                    if Instant::now() >= deadline {
                        return Err(PipeplexError::Timeout("connect"));
                    }
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "pipeplex-pipe-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_path_format() {
        let path = pipe_path("demo");
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.to_string_lossy().ends_with("demo.sock"));

        assert_eq!(pipe_path("/run/x/demo_1"), PathBuf::from("/run/x/demo_1"));
    }

    #[cfg(windows)]
    #[test]
    fn test_pipe_path_format() {
        assert_eq!(pipe_path("demo"), PathBuf::from(r"\\.\pipe\demo"));
    }

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let name = unique_name("basic");
        assert!(!exists(&name));

        let listener = PipeListener::bind(&name, &ListenOptions::default()).unwrap();
        assert!(exists(&name));

        let (server, client) = tokio::join!(listener.accept(), PipeStream::connect(&name));
        let mut server = server.unwrap();
        let mut client = client.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!exists(&name));
    }

    #[tokio::test]
    async fn test_connect_timeout_without_listener() {
        let name = unique_name("missing");
        let start = Instant::now();

        let result = PipeStream::connect_timeout(
            &name,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
        .await;

        assert!(matches!(result, Err(PipeplexError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_connect_timeout_waits_for_late_listener() {
        let name = unique_name("late");
        let late = name.clone();

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let listener = PipeListener::bind(&late, &ListenOptions::default()).unwrap();
            let _stream = listener.accept().await.unwrap();
        });

        let stream =
            PipeStream::connect_timeout(&name, Duration::from_secs(2), Duration::from_millis(5))
                .await;
        assert!(stream.is_ok());
        server.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listen_mode_applied() {
        use std::os::unix::fs::PermissionsExt;

        let name = unique_name("mode");
        let listener = PipeListener::bind(&name, &ListenOptions::with_mode(0o600)).unwrap();

        let mode = std::fs::metadata(listener.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
