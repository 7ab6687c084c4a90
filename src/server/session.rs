//! Per-connection request handling

use super::PackServer;
use crate::proto::{
    read_request, write_response, ProtoResult, Request, Response, MIN_MESSAGE_SIZE,
    PROTOCOL_VERSION, READ_OVERHEAD,
};
use crate::remote::{
    parse_pack_path, PackSink, PackSource, PackUpload, RemoteError, RemoteFile, RemoteResult,
    RootStore, PACK_DIR,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// State of one client connection: its open files and its uploads.
///
/// `Attach` must be the first request. Dropping the session closes every
/// file and cancels every upload still in progress.
pub struct Session {
    server: Arc<PackServer>,
    attached: bool,
    max_message_size: usize,
    fids: HashMap<u32, Box<dyn RemoteFile>>,
    pids: HashMap<u32, Box<dyn PackUpload>>,
}

impl Session {
    pub fn new(server: Arc<PackServer>) -> Self {
        let max_message_size = server.max_message_size();
        Self {
            server,
            attached: false,
            max_message_size,
            fids: HashMap::new(),
            pids: HashMap::new(),
        }
    }

    /// Frame size limit in force for this connection
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Serve requests until the peer disconnects
    pub fn serve<R: Read, W: Write>(&mut self, reader: &mut R, writer: &mut W) -> ProtoResult<()> {
        loop {
            let request = match read_request(reader, self.max_message_size) {
                Ok(r) => r,
                Err(e) if e.is_eof() => return Ok(()),
                Err(e) => return Err(e),
            };
            if let Some(response) = self.handle(request) {
                write_response(writer, &response)?;
            }
        }
    }

    /// Handle one request. Returns the reply to send, if any.
    pub fn handle(&mut self, request: Request) -> Option<Response> {
        match request {
            Request::WritePack { pid, data } => self.write_pack(pid, &data),
            request => match self.dispatch(request) {
                Ok(response) => Some(response),
                Err(e) => {
                    log::debug!("request failed: {}", e);
                    Some(Response::error(&e))
                }
            },
        }
    }

    fn dispatch(&mut self, request: Request) -> RemoteResult<Response> {
        if !self.attached && !matches!(request, Request::Attach { .. }) {
            return Err(RemoteError::BadRequest("attach first".to_string()));
        }

        match request {
            Request::Attach { version, key_id, max_message_size } => {
                self.attach(&version, &key_id, max_message_size)
            }
            Request::Open { fid, path } => {
                if self.fids.contains_key(&fid) {
                    return Err(RemoteError::BadRequest(format!("fid {} in use", fid)));
                }
                let file: Box<dyn RemoteFile> = if path == PACK_DIR {
                    Box::new(self.server.listing()?)
                } else {
                    self.server.open_pack(parse_pack_path(&path)?)?
                };
                self.fids.insert(fid, file);
                Ok(Response::Open)
            }
            Request::ReadAt { fid, offset, size } => {
                let file = self
                    .fids
                    .get(&fid)
                    .ok_or_else(|| RemoteError::BadRequest(format!("unknown fid {}", fid)))?;
                let size = (size as usize).min(self.max_message_size.saturating_sub(READ_OVERHEAD));
                Ok(Response::ReadAt { data: file.read_at(offset, size)? })
            }
            Request::Close { fid } => {
                let mut file = self
                    .fids
                    .remove(&fid)
                    .ok_or_else(|| RemoteError::BadRequest(format!("unknown fid {}", fid)))?;
                file.close()?;
                Ok(Response::Close)
            }
            Request::NewPack { pid, path } => {
                if self.pids.contains_key(&pid) {
                    return Err(RemoteError::BadRequest(format!("pid {} in use", pid)));
                }
                let upload = self.server.new_pack(parse_pack_path(&path)?)?;
                self.pids.insert(pid, upload);
                Ok(Response::NewPack)
            }
            Request::ClosePack { pid } => {
                self.take_upload(pid)?.close()?;
                Ok(Response::ClosePack)
            }
            Request::CancelPack { pid } => {
                self.take_upload(pid)?.cancel()?;
                Ok(Response::CancelPack)
            }
            Request::GetRoot => Ok(Response::root(self.server.get_root()?)),
            Request::CasRoot { value, version, signature, epoch } => Ok(Response::CasRoot {
                ok: self.server.cas_root(&value, version, &signature, epoch)?,
            }),
            Request::GetEpoch => Ok(Response::Epoch { epoch: self.server.get_epoch()? }),
            Request::GetGeneration => Ok(Response::Generation {
                generation: self.server.get_generation()?,
            }),
            Request::StartGc => Ok(Response::StartGc { epoch: self.server.start_gc()? }),
            Request::StopGc => {
                self.server.stop_gc()?;
                Ok(Response::StopGc)
            }
            Request::Remove { path, gc_id } => Ok(Response::Remove {
                existed: self.server.remove_pack(parse_pack_path(&path)?, gc_id)?,
            }),
            Request::WritePack { pid, .. } => Err(RemoteError::BadRequest(format!(
                "write to pid {} outside upload path",
                pid
            ))),
        }
    }

    fn attach(&mut self, version: &str, key_id: &str, requested: u32) -> RemoteResult<Response> {
        if self.attached {
            return Err(RemoteError::BadRequest("already attached".to_string()));
        }
        if version != PROTOCOL_VERSION {
            return Err(RemoteError::BadRequest(format!("unsupported protocol {:?}", version)));
        }
        if (requested as usize) < MIN_MESSAGE_SIZE {
            return Err(RemoteError::BadRequest(format!("message size {} too small", requested)));
        }
        if !self.server.attach(key_id)? {
            return Err(RemoteError::WrongKey);
        }

        self.attached = true;
        self.max_message_size = self.max_message_size.min(requested as usize);
        Ok(Response::Attach {
            version: PROTOCOL_VERSION.to_string(),
            max_message_size: self.max_message_size as u32,
        })
    }

    /// Writes are not acknowledged; only a failure produces a frame
    fn write_pack(&mut self, pid: u32, data: &[u8]) -> Option<Response> {
        let result = if !self.attached {
            Err(RemoteError::BadRequest("attach first".to_string()))
        } else {
            match self.pids.get_mut(&pid) {
                Some(upload) => upload.write(data),
                None => Err(RemoteError::BadRequest(format!("unknown pid {}", pid))),
            }
        };

        match result {
            Ok(()) => None,
            Err(e) => {
                log::warn!("write to upload {} failed: {}", pid, e);
                Some(Response::PackError { pid, message: e.to_string() })
            }
        }
    }

    fn take_upload(&mut self, pid: u32) -> RemoteResult<Box<dyn PackUpload>> {
        self.pids
            .remove(&pid)
            .ok_or_else(|| RemoteError::BadRequest(format!("unknown pid {}", pid)))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (fid, mut file) in self.fids.drain() {
            if let Err(e) = file.close() {
                log::warn!("closing fid {} failed: {}", fid, e);
            }
        }
        for (pid, upload) in self.pids.drain() {
            if let Err(e) = upload.cancel() {
                log::warn!("cancelling upload {} failed: {}", pid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ErrorCode, DEFAULT_MAX_MESSAGE_SIZE};
    use tempfile::TempDir;

    fn session() -> (TempDir, Session) {
        let temp = TempDir::new().unwrap();
        let server = Arc::new(PackServer::open(temp.path()).unwrap());
        let mut session = Session::new(server);
        let reply = session.handle(Request::Attach {
            version: PROTOCOL_VERSION.to_string(),
            key_id: "key1".to_string(),
            max_message_size: 8192,
        });
        assert_eq!(
            reply,
            Some(Response::Attach {
                version: PROTOCOL_VERSION.to_string(),
                max_message_size: 8192,
            })
        );
        (temp, session)
    }

    fn error_code(reply: Option<Response>) -> ErrorCode {
        match reply {
            Some(Response::Error { code, .. }) => code,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_required() {
        let temp = TempDir::new().unwrap();
        let server = Arc::new(PackServer::open(temp.path()).unwrap());
        let mut s = Session::new(server);
        assert_eq!(s.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(error_code(s.handle(Request::GetRoot)), ErrorCode::BadRequest);

        let reply = s.handle(Request::Attach {
            version: "other".to_string(),
            key_id: "key1".to_string(),
            max_message_size: 8192,
        });
        assert_eq!(error_code(reply), ErrorCode::BadRequest);
    }

    #[test]
    fn test_wrong_key() {
        let (temp, _s) = session();
        let server = Arc::new(PackServer::open(temp.path().join("other")).unwrap());
        assert!(server.attach("key1").unwrap());
        let mut s = Session::new(server);
        let reply = s.handle(Request::Attach {
            version: PROTOCOL_VERSION.to_string(),
            key_id: "key2".to_string(),
            max_message_size: 8192,
        });
        assert_eq!(error_code(reply), ErrorCode::WrongKey);
    }

    #[test]
    fn test_upload_then_read() {
        let (_temp, mut s) = session();
        let path = "packs/a.pack".to_string();
        assert_eq!(s.handle(Request::NewPack { pid: 1, path: path.clone() }), Some(Response::NewPack));
        assert_eq!(s.handle(Request::WritePack { pid: 1, data: b"hello".to_vec() }), None);
        assert_eq!(s.handle(Request::ClosePack { pid: 1 }), Some(Response::ClosePack));

        assert_eq!(s.handle(Request::Open { fid: 3, path }), Some(Response::Open));
        assert_eq!(
            s.handle(Request::ReadAt { fid: 3, offset: 1, size: 3 }),
            Some(Response::ReadAt { data: b"ell".to_vec() })
        );
        assert_eq!(s.handle(Request::Close { fid: 3 }), Some(Response::Close));
        assert_eq!(
            error_code(s.handle(Request::ReadAt { fid: 3, offset: 0, size: 1 })),
            ErrorCode::BadRequest
        );

        assert_eq!(s.handle(Request::Open { fid: 4, path: "packs".to_string() }), Some(Response::Open));
        match s.handle(Request::ReadAt { fid: 4, offset: 0, size: 4096 }) {
            Some(Response::ReadAt { data }) => assert!(data.starts_with(b"a.pack 5 ")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_read_bounded_by_message_size() {
        let (_temp, mut s) = session();
        s.handle(Request::NewPack { pid: 1, path: "packs/big.pack".to_string() });
        s.handle(Request::WritePack { pid: 1, data: vec![7; 20000] });
        s.handle(Request::ClosePack { pid: 1 });
        s.handle(Request::Open { fid: 1, path: "packs/big.pack".to_string() });

        match s.handle(Request::ReadAt { fid: 1, offset: 0, size: 20000 }) {
            Some(Response::ReadAt { data }) => assert_eq!(data.len(), 8192 - READ_OVERHEAD),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_write_errors_are_async() {
        let (_temp, mut s) = session();
        let reply = s.handle(Request::WritePack { pid: 9, data: vec![1] });
        assert!(matches!(reply, Some(Response::PackError { pid: 9, .. })));
    }

    #[test]
    fn test_bad_paths() {
        let (_temp, mut s) = session();
        for path in ["meta.db", "packs/../meta.db", "packs/a.tmp", "packs/"] {
            let reply = s.handle(Request::Open { fid: 1, path: path.to_string() });
            assert_eq!(error_code(reply), ErrorCode::BadRequest, "{}", path);
        }
        let reply = s.handle(Request::NewPack { pid: 1, path: "a.pack".to_string() });
        assert_eq!(error_code(reply), ErrorCode::BadRequest);
    }

    #[test]
    fn test_duplicate_ids() {
        let (_temp, mut s) = session();
        s.handle(Request::NewPack { pid: 1, path: "packs/a.pack".to_string() });
        let reply = s.handle(Request::NewPack { pid: 1, path: "packs/b.pack".to_string() });
        assert_eq!(error_code(reply), ErrorCode::BadRequest);

        s.handle(Request::CancelPack { pid: 1 });
        let reply = s.handle(Request::NewPack { pid: 1, path: "packs/a.pack".to_string() });
        assert_eq!(error_code(reply), ErrorCode::DuplicatePack);
    }

    #[test]
    fn test_gc_requests() {
        let (_temp, mut s) = session();
        assert_eq!(s.handle(Request::GetGeneration), Some(Response::Generation { generation: 0 }));
        let epoch = match s.handle(Request::StartGc) {
            Some(Response::StartGc { epoch }) => epoch,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(error_code(s.handle(Request::GetGeneration)), ErrorCode::GcInProgress);
        assert_eq!(error_code(s.handle(Request::StartGc)), ErrorCode::GcInProgress);
        assert_eq!(
            s.handle(Request::Remove { path: "packs/none.pack".to_string(), gc_id: epoch }),
            Some(Response::Remove { existed: false })
        );
        assert_eq!(s.handle(Request::StopGc), Some(Response::StopGc));
        assert_eq!(
            error_code(s.handle(Request::Remove { path: "packs/none.pack".to_string(), gc_id: epoch })),
            ErrorCode::GcNotRunning
        );
    }

    #[test]
    fn test_drop_cancels_uploads() {
        let (temp, mut s) = session();
        s.handle(Request::NewPack { pid: 1, path: "packs/a.pack".to_string() });
        s.handle(Request::WritePack { pid: 1, data: vec![1, 2, 3] });
        drop(s);
        assert!(!temp.path().join("packs/a.pack.tmp").exists());
        assert!(!temp.path().join("packs/a.pack").exists());
    }
}
