//! TCP listener for the pack store
//!
//! Accepts client connections and runs one `Session` per connection thread.

use super::{PackServer, Session};
use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

/// Pack store TCP listener
pub struct PackListener {
    listener: TcpListener,
    server: Arc<PackServer>,
}

impl PackListener {
    /// Bind to `addr`
    pub fn bind<A: ToSocketAddrs>(addr: A, server: Arc<PackServer>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, server })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop
    pub fn run(&self) -> io::Result<()> {
        log::info!("pack server listening on {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&self.server);
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, server) {
                            log::warn!("Client handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("Connection error: {}", e);
                }
            }
        }

        Ok(())
    }
}

/// Handle a client connection
fn handle_client(stream: TcpStream, server: Arc<PackServer>) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    log::info!("New connection from {}", peer);

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut session = Session::new(server);

    match session.serve(&mut reader, &mut writer) {
        Ok(()) => {
            log::info!("Client {} disconnected", peer);
            Ok(())
        }
        Err(e) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("session with {} ended: {}", peer, e),
        )),
    }
}
