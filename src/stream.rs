//! Stream capability shared by the cleartext and TLS transports.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};

use openssl::ssl::{HandshakeError, SslAcceptor, SslStream};

use crate::config::{ResolvedAddr, Scheme, TlsOptions};
use crate::error::IstError;
use crate::tls;

/// Point-to-point IST transport, cleartext or TLS, with blocking reads and
/// writes.
pub(crate) enum IstStream {
    Tcp(TcpStream),
    Ssl(SslStream<TcpStream>),
}

impl IstStream {
    /// Connect to a resolved peer address, performing the TLS client
    /// handshake when the scheme asks for it.
    pub fn connect(addr: &ResolvedAddr, opts: Option<&TlsOptions>) -> Result<Self, IstError> {
        let tcp = TcpStream::connect((addr.host.as_str(), addr.port))?;
        tcp.set_nodelay(true)?;
        match addr.scheme {
            Scheme::Tcp => Ok(IstStream::Tcp(tcp)),
            Scheme::Ssl => {
                let opts = opts.ok_or_else(|| {
                    IstError::Config(format!("ssl peer '{addr}' but no TLS options configured"))
                })?;
                let connector = tls::connector(opts)?;
                let mut config = connector.configure().map_err(tls::tls_err)?;
                // Cluster nodes authenticate by trust anchor, not hostname.
                config.set_verify_hostname(false);
                let stream = config
                    .connect(&addr.host, tcp)
                    .map_err(handshake_err)?;
                Ok(IstStream::Ssl(stream))
            }
        }
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            IstStream::Tcp(stream) => stream,
            IstStream::Ssl(stream) => stream.get_ref(),
        }
    }

    /// Handle that can unblock this stream's I/O from another thread.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle(self.tcp().try_clone()?))
    }

    pub fn close(&mut self) {
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for IstStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            IstStream::Tcp(stream) => stream.read(buf),
            IstStream::Ssl(stream) => stream.read(buf),
        }
    }
}

impl Write for IstStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            IstStream::Tcp(stream) => stream.write(buf),
            IstStream::Ssl(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            IstStream::Tcp(stream) => stream.flush(),
            IstStream::Ssl(stream) => stream.flush(),
        }
    }
}

/// Cloned handle onto a stream's TCP socket; shutting it down fails any
/// in-flight read or write on the owning thread.
pub(crate) struct ShutdownHandle(TcpStream);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Listener for the receiver side. Accepts exactly one session stream.
pub(crate) struct IstListener {
    listener: TcpListener,
    acceptor: Option<SslAcceptor>,
}

impl IstListener {
    pub fn bind(
        bind: &ResolvedAddr,
        opts: Option<&TlsOptions>,
        version: u8,
    ) -> Result<Self, IstError> {
        let acceptor = match bind.scheme {
            Scheme::Tcp => None,
            Scheme::Ssl => {
                let opts = opts.ok_or_else(|| {
                    IstError::Config(format!("ssl bind '{bind}' but no TLS options configured"))
                })?;
                Some(tls::acceptor(opts, version)?)
            }
        };
        let listener = TcpListener::bind((bind.host.as_str(), bind.port))?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn accept(&self) -> Result<IstStream, IstError> {
        let (tcp, _peer) = self.listener.accept()?;
        tcp.set_nodelay(true)?;
        match &self.acceptor {
            None => Ok(IstStream::Tcp(tcp)),
            Some(acceptor) => acceptor
                .accept(tcp)
                .map(IstStream::Ssl)
                .map_err(handshake_err),
        }
    }
}

fn handshake_err(err: HandshakeError<TcpStream>) -> IstError {
    IstError::Tls(err.to_string())
}
