//! Pack store client
//!
//! Speaks the wire protocol to a `PackServer` session and implements the same
//! remote store traits, so `StoreReader` and `StoreWriter` run unchanged over
//! a connection. Files and uploads share the connection through a mutex.

use crate::meta::RootRecord;
use crate::proto::{
    read_response, write_request, ProtoError, Request, Response, MIN_MESSAGE_SIZE,
    PROTOCOL_VERSION, READ_OVERHEAD, WRITE_OVERHEAD,
};
use crate::remote::{
    decode_listing, pack_path, validate_pack_name, PackSink, PackSource, PackStat, PackUpload,
    RemoteError, RemoteFile, RemoteResult, RootStore, PACK_DIR,
};
use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};

/// Buffered TCP connection
pub struct TcpTransport {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct Conn<T> {
    stream: T,
    max_message_size: usize,
    next_id: u32,
    /// first write failure reported for each upload
    pack_errors: HashMap<u32, String>,
}

impl<T: Read + Write> Conn<T> {
    fn alloc_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    fn send(&mut self, request: &Request) -> RemoteResult<()> {
        write_request(&mut self.stream, request)?;
        Ok(())
    }

    /// Next reply, recording any upload failures that arrive first
    fn recv(&mut self) -> RemoteResult<Response> {
        loop {
            match read_response(&mut self.stream, self.max_message_size)? {
                Response::PackError { pid, message } => {
                    log::debug!("upload {} failed remotely: {}", pid, message);
                    self.pack_errors.entry(pid).or_insert(message);
                }
                response => return Ok(response),
            }
        }
    }

    fn call(&mut self, request: &Request) -> RemoteResult<Response> {
        self.send(request)?;
        match self.recv()? {
            Response::Error { code, message } => Err(code.into_error(message)),
            response => Ok(response),
        }
    }
}

fn unexpected(response: Response) -> RemoteError {
    let name = format!("{:?}", response);
    let name = name.split([' ', '{', '(']).next().unwrap_or("").to_string();
    RemoteError::Proto(ProtoError::Malformed(format!("unexpected reply {}", name)))
}

/// Connection to a pack server
pub struct Client<T> {
    conn: Arc<Mutex<Conn<T>>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl Client<TcpTransport> {
    /// Connect over TCP and attach with `key_id`
    pub fn connect<A: ToSocketAddrs>(addr: A, key_id: &str, max_message_size: usize) -> RemoteResult<Self> {
        Self::attach(TcpTransport::connect(addr)?, key_id, max_message_size)
    }
}

impl<T: Read + Write + Send + 'static> Client<T> {
    /// Attach over an established stream. The frame size limit is the
    /// smaller of `max_message_size` and the server's.
    pub fn attach(stream: T, key_id: &str, max_message_size: usize) -> RemoteResult<Self> {
        if max_message_size < MIN_MESSAGE_SIZE || max_message_size > u32::MAX as usize {
            return Err(RemoteError::BadRequest(format!(
                "message size {} out of range",
                max_message_size
            )));
        }

        let mut conn = Conn {
            stream,
            max_message_size,
            next_id: 0,
            pack_errors: HashMap::new(),
        };
        let reply = conn.call(&Request::Attach {
            version: PROTOCOL_VERSION.to_string(),
            key_id: key_id.to_string(),
            max_message_size: max_message_size as u32,
        })?;
        match reply {
            Response::Attach { version, max_message_size } => {
                if version != PROTOCOL_VERSION {
                    return Err(RemoteError::Server(format!("server speaks {:?}", version)));
                }
                if (max_message_size as usize) < MIN_MESSAGE_SIZE {
                    return Err(RemoteError::Server(format!(
                        "server message size {} too small",
                        max_message_size
                    )));
                }
                conn.max_message_size = max_message_size as usize;
            }
            other => return Err(unexpected(other)),
        }
        log::info!("attached with message size {}", conn.max_message_size);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Negotiated frame size limit
    pub fn max_message_size(&self) -> usize {
        self.conn.lock().unwrap().max_message_size
    }

    fn open_path(&self, path: String) -> RemoteResult<ClientFile<T>> {
        let mut conn = self.conn.lock().unwrap();
        let fid = conn.alloc_id();
        match conn.call(&Request::Open { fid, path })? {
            Response::Open => Ok(ClientFile {
                conn: Arc::clone(&self.conn),
                fid,
                closed: false,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_generation(&self) -> RemoteResult<u64> {
        match self.conn.lock().unwrap().call(&Request::GetGeneration)? {
            Response::Generation { generation } => Ok(generation),
            other => Err(unexpected(other)),
        }
    }

    /// Begin a GC cycle. The returned id must accompany `remove_pack`.
    pub fn start_gc(&self) -> RemoteResult<u64> {
        match self.conn.lock().unwrap().call(&Request::StartGc)? {
            Response::StartGc { epoch } => Ok(epoch),
            other => Err(unexpected(other)),
        }
    }

    pub fn stop_gc(&self) -> RemoteResult<()> {
        match self.conn.lock().unwrap().call(&Request::StopGc)? {
            Response::StopGc => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn remove_pack(&self, name: &str, gc_id: u64) -> RemoteResult<bool> {
        validate_pack_name(name)?;
        let request = Request::Remove {
            path: pack_path(name),
            gc_id,
        };
        match self.conn.lock().unwrap().call(&request)? {
            Response::Remove { existed } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }
}

impl<T: Read + Write + Send + 'static> PackSource for Client<T> {
    fn list_packs(&self) -> RemoteResult<Vec<PackStat>> {
        let mut file = self.open_path(PACK_DIR.to_string())?;
        let mut listing = Vec::new();
        loop {
            let chunk = file.read_at(listing.len() as u64, 64 * 1024)?;
            if chunk.is_empty() {
                break;
            }
            listing.extend_from_slice(&chunk);
        }
        file.close()?;
        decode_listing(&listing)
    }

    fn open_pack(&self, name: &str) -> RemoteResult<Box<dyn RemoteFile>> {
        validate_pack_name(name)?;
        Ok(Box::new(self.open_path(pack_path(name))?))
    }
}

impl<T: Read + Write + Send + 'static> PackSink for Client<T> {
    fn new_pack(&self, name: &str) -> RemoteResult<Box<dyn PackUpload>> {
        validate_pack_name(name)?;
        let mut conn = self.conn.lock().unwrap();
        let pid = conn.alloc_id();
        match conn.call(&Request::NewPack { pid, path: pack_path(name) })? {
            Response::NewPack => Ok(Box::new(RemoteUpload {
                conn: Arc::clone(&self.conn),
                pid,
                done: false,
            })),
            other => Err(unexpected(other)),
        }
    }
}

impl<T: Read + Write + Send + 'static> RootStore for Client<T> {
    fn get_epoch(&self) -> RemoteResult<u64> {
        match self.conn.lock().unwrap().call(&Request::GetEpoch)? {
            Response::Epoch { epoch } => Ok(epoch),
            other => Err(unexpected(other)),
        }
    }

    fn get_root(&self) -> RemoteResult<RootRecord> {
        match self.conn.lock().unwrap().call(&Request::GetRoot)? {
            Response::Root { value, version, signature } => Ok(RootRecord {
                value,
                version,
                signature,
            }),
            other => Err(unexpected(other)),
        }
    }

    fn cas_root(&self, value: &str, version: u64, signature: &str, epoch: u64) -> RemoteResult<bool> {
        let request = Request::CasRoot {
            value: value.to_string(),
            version,
            signature: signature.to_string(),
            epoch,
        };
        match self.conn.lock().unwrap().call(&request)? {
            Response::CasRoot { ok } => Ok(ok),
            other => Err(unexpected(other)),
        }
    }
}

/// Remote file read through the connection
pub struct ClientFile<T: Read + Write> {
    conn: Arc<Mutex<Conn<T>>>,
    fid: u32,
    closed: bool,
}

impl<T: Read + Write + Send> RemoteFile for ClientFile<T> {
    fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        let mut conn = self.conn.lock().unwrap();
        let chunk = conn.max_message_size - READ_OVERHEAD;
        let mut out = Vec::with_capacity(len.min(conn.max_message_size));

        while out.len() < len {
            let want = (len - out.len()).min(chunk);
            let request = Request::ReadAt {
                fid: self.fid,
                offset: offset + out.len() as u64,
                size: want as u32,
            };
            match conn.call(&request)? {
                Response::ReadAt { data } => {
                    let got = data.len();
                    out.extend_from_slice(&data);
                    if got < want {
                        break;
                    }
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(out)
    }

    fn close(&mut self) -> RemoteResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.conn.lock().unwrap().call(&Request::Close { fid: self.fid })? {
            Response::Close => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl<T: Read + Write> Drop for ClientFile<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(mut conn) = self.conn.lock() {
            if let Err(e) = conn.call(&Request::Close { fid: self.fid }) {
                log::warn!("closing remote file {} failed: {}", self.fid, e);
            }
        }
    }
}

/// Upload streamed through the connection.
///
/// Writes are not acknowledged. A failure reported by the server is
/// returned by the next write or by `close`.
struct RemoteUpload<T: Read + Write> {
    conn: Arc<Mutex<Conn<T>>>,
    pid: u32,
    done: bool,
}

impl<T: Read + Write> RemoteUpload<T> {
    fn failed(conn: &mut Conn<T>, pid: u32) -> Option<RemoteError> {
        conn.pack_errors
            .remove(&pid)
            .map(|message| RemoteError::Server(format!("upload failed: {}", message)))
    }
}

impl<T: Read + Write + Send> PackUpload for RemoteUpload<T> {
    fn write(&mut self, data: &[u8]) -> RemoteResult<()> {
        let mut conn = self.conn.lock().unwrap();
        if let Some(message) = conn.pack_errors.get(&self.pid) {
            return Err(RemoteError::Server(format!("upload failed: {}", message)));
        }

        let chunk = conn.max_message_size - WRITE_OVERHEAD;
        for piece in data.chunks(chunk) {
            conn.send(&Request::WritePack {
                pid: self.pid,
                data: piece.to_vec(),
            })?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> RemoteResult<()> {
        self.done = true;
        let mut conn = self.conn.lock().unwrap();
        let reply = conn.call(&Request::ClosePack { pid: self.pid });
        if let Some(e) = Self::failed(&mut conn, self.pid) {
            return Err(e);
        }
        match reply? {
            Response::ClosePack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn cancel(mut self: Box<Self>) -> RemoteResult<()> {
        self.done = true;
        let mut conn = self.conn.lock().unwrap();
        let reply = conn.call(&Request::CancelPack { pid: self.pid });
        conn.pack_errors.remove(&self.pid);
        match reply? {
            Response::CancelPack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl<T: Read + Write> Drop for RemoteUpload<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut conn) = self.conn.lock() {
            let reply = conn.call(&Request::CancelPack { pid: self.pid });
            conn.pack_errors.remove(&self.pid);
            if let Err(e) = reply {
                log::warn!("cancelling upload {} failed: {}", self.pid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::cstore::{StoreReader, StoreWriter};
    use crate::htree::TreeReader;
    use crate::meta::MetaError;
    use crate::remote::update_root;
    use crate::server::{PackListener, PackServer};
    use std::thread;
    use tempfile::TempDir;

    /// Server on a loopback port, serving connections in the background
    fn serve(root: &std::path::Path) -> std::net::SocketAddr {
        let server = Arc::new(PackServer::open(root).unwrap());
        let listener = PackListener::bind("127.0.0.1:0", server).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || listener.run());
        addr
    }

    #[test]
    fn test_attach_negotiates() {
        let temp = TempDir::new().unwrap();
        let addr = serve(temp.path());

        let client = Client::connect(addr, "key1", 8192).unwrap();
        assert_eq!(client.max_message_size(), 8192);

        let err = Client::connect(addr, "key2", 8192).err().unwrap();
        assert!(matches!(err, RemoteError::WrongKey));
        assert!(Client::connect(addr, "key1", 16).is_err());
    }

    #[test]
    fn test_upload_and_list() {
        let temp = TempDir::new().unwrap();
        let addr = serve(temp.path());
        let client = Client::connect(addr, "key1", MIN_MESSAGE_SIZE).unwrap();

        let data: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let mut up = client.new_pack("a.pack").unwrap();
        up.write(&data).unwrap();
        up.close().unwrap();

        let packs = client.list_packs().unwrap();
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].size, 20_000);

        // reads larger than one frame are split
        let mut file = client.open_pack("a.pack").unwrap();
        assert_eq!(file.read_at(0, 20_000).unwrap(), data);
        assert_eq!(file.read_at(19_990, 100).unwrap(), &data[19_990..]);
        file.close().unwrap();

        assert!(client.new_pack("a.pack").is_err());
        assert!(client.open_pack("missing.pack").is_err());
    }

    #[test]
    fn test_root_updates() {
        let temp = TempDir::new().unwrap();
        let addr = serve(temp.path());
        let a = Client::connect(addr, "key1", 8192).unwrap();
        let b = Client::connect(addr, "key1", 8192).unwrap();

        let epoch = a.get_epoch().unwrap();
        assert!(a.cas_root("r1", 1, "s1", epoch).unwrap());
        assert!(!b.cas_root("r1b", 1, "s1b", epoch).unwrap());

        let root = update_root(&b, 3, |current| Ok((format!("{}+", current.value), "s2".to_string()))).unwrap();
        assert_eq!(root.version, 2);
        assert_eq!(a.get_root().unwrap().value, "r1+");

        // a GC boundary invalidates the old epoch
        let gc = a.start_gc().unwrap();
        assert!(matches!(
            b.get_generation(),
            Err(RemoteError::Meta(MetaError::GcInProgress))
        ));
        a.stop_gc().unwrap();
        assert!(gc > epoch);
        assert!(!b.cas_root("r3", 3, "s3", epoch).unwrap());
        assert_eq!(b.get_generation().unwrap(), 1);
    }

    #[test]
    fn test_store_over_connection() {
        let temp = TempDir::new().unwrap();
        let addr = serve(&temp.path().join("store"));
        let cache = temp.path().join("cache");
        let client = Client::connect(addr, "key1", 64 * 1024).unwrap();

        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 253) as u8).collect();
        let mut config = StoreConfig {
            cache_dir: cache,
            open_packs: 2,
            block_size: 4096,
            max_pack_size: 32 * 1024,
            compress: false,
        };
        config.validate().unwrap();

        let mut writer = StoreWriter::from_config(client.clone(), &config);
        let mut tree = writer.tree_writer().unwrap();
        tree.write_bytes(&data).unwrap();
        let root = tree.close().unwrap();
        let packs = writer.close().unwrap();
        assert!(packs.len() > 1);

        // cold cache: indices come over the wire
        config.cache_dir = temp.path().join("cold");
        let reader = StoreReader::from_config(client.clone(), &config).unwrap();
        assert_eq!(reader.pack_names().count(), packs.len());
        let mut tree = TreeReader::open(&reader, &root.hash).unwrap();
        let mut out = Vec::new();
        tree.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        reader.close().unwrap();

        // GC removes one pack; its blocks become unreachable
        let gc = client.start_gc().unwrap();
        assert!(client.remove_pack(&packs[0], gc).unwrap());
        client.stop_gc().unwrap();
        assert!(matches!(
            client.remove_pack(&packs[1], gc),
            Err(RemoteError::Meta(MetaError::GcNotRunning))
        ));

        let names: Vec<String> = client.list_packs().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names.len(), packs.len() - 1);
        assert!(!names.contains(&packs[0]));
    }

    #[test]
    fn test_gc_during_upload() {
        let temp = TempDir::new().unwrap();
        let addr = serve(temp.path());
        let writer_conn = Client::connect(addr, "key1", 8192).unwrap();
        let gc_conn = Client::connect(addr, "key1", 8192).unwrap();

        let mut up = writer_conn.new_pack("slow.pack").unwrap();
        up.write(b"partial").unwrap();
        gc_conn.start_gc().unwrap();
        gc_conn.stop_gc().unwrap();

        let err = up.close().unwrap_err();
        assert!(matches!(err, RemoteError::Meta(MetaError::GcOccurred)));
        assert!(writer_conn.list_packs().unwrap().is_empty());
    }

    #[test]
    fn test_write_failure_reported_later() {
        let temp = TempDir::new().unwrap();
        let addr = serve(temp.path());
        let client = Client::connect(addr, "key1", 8192).unwrap();

        let mut up = client.new_pack("a.pack").unwrap();
        // the server forgets the upload behind the client's back
        client
            .conn
            .lock()
            .unwrap()
            .call(&Request::CancelPack { pid: 1 })
            .unwrap();
        up.write(b"lost").unwrap();
        assert!(up.close().is_err());
    }
}
