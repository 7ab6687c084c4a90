//! Seekable hash tree decoder

use super::{decode_node, Entry, Node};
use crate::blob::{BlobError, BlobReader, BlobResult, Hash};
use std::io;

struct Frame {
    depth: u8,
    entries: Vec<Entry>,
    index: usize,
}

struct Leaf {
    offset: u64,
    data: Vec<u8>,
}

impl Leaf {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    fn covers(&self, pos: u64) -> bool {
        pos >= self.offset && pos < self.end()
    }
}

/// Reads a stream back out of a hash tree.
///
/// Holds one frame per interior level between the root and the current leaf.
/// Sequential reads move sideways through the frames; seeks rebuild them with
/// a binary search per level.
pub struct TreeReader<R: BlobReader> {
    store: R,
    root: Hash,
    size: u64,
    pos: u64,
    frames: Vec<Frame>,
    leaf: Option<Leaf>,
}

impl<R: BlobReader> TreeReader<R> {
    /// Open the tree rooted at `root`
    pub fn open(store: R, root: &Hash) -> BlobResult<Self> {
        let node = decode_node(root, store.get(root)?)?;
        let size = stream_size(&store, node)?;
        Ok(Self {
            store,
            root: *root,
            size,
            pos: 0,
            frames: Vec::new(),
            leaf: None,
        })
    }

    /// Total length of the stream
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current read position
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Move to an absolute offset, clamped to the stream size.
    /// Returns the offset actually reached.
    pub fn seek_to(&mut self, offset: u64) -> BlobResult<u64> {
        self.pos = offset.min(self.size);
        let covered = self.leaf.as_ref().is_some_and(|l| l.covers(self.pos));
        if self.pos < self.size && !covered {
            self.locate(self.pos)?;
        }
        Ok(self.pos)
    }

    /// Read into `buf`, returning 0 at end of stream.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> BlobResult<usize> {
        if buf.is_empty() || self.pos >= self.size {
            return Ok(0);
        }

        let covered = self.leaf.as_ref().is_some_and(|l| l.covers(self.pos));
        if !covered {
            let sequential = self.leaf.as_ref().is_some_and(|l| l.end() == self.pos);
            if sequential && !self.frames.is_empty() {
                self.next_leaf()?;
            } else {
                self.locate(self.pos)?;
            }
        }

        let leaf = self
            .leaf
            .as_ref()
            .ok_or_else(|| BlobError::Corrupted(format!("no leaf at offset {}", self.pos)))?;
        if !leaf.covers(self.pos) {
            return Err(BlobError::Corrupted(format!(
                "tree {} has no leaf covering offset {}",
                self.root, self.pos
            )));
        }

        let start = (self.pos - leaf.offset) as usize;
        let n = (leaf.data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&leaf.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    /// Rebuild the frame stack down to the leaf covering `target`.
    fn locate(&mut self, target: u64) -> BlobResult<()> {
        self.frames.clear();
        self.leaf = None;

        let mut node = self.fetch(&self.root)?;
        let mut offset = 0;
        loop {
            match node {
                Node::Leaf(data) => {
                    self.leaf = Some(Leaf { offset, data });
                    return Ok(());
                }
                Node::Interior { depth, entries } => {
                    // last child whose first byte is at or before target
                    let index = entries
                        .partition_point(|e| e.offset <= target)
                        .saturating_sub(1);
                    let child = entries[index];
                    self.frames.push(Frame { depth, entries, index });
                    offset = child.offset;
                    node = self.fetch_child(depth, &child.hash)?;
                }
            }
        }
    }

    /// Step to the leaf right after the current one.
    fn next_leaf(&mut self) -> BlobResult<()> {
        while self
            .frames
            .last()
            .is_some_and(|f| f.index + 1 >= f.entries.len())
        {
            self.frames.pop();
        }

        let (depth, child) = match self.frames.last_mut() {
            Some(frame) => {
                frame.index += 1;
                (frame.depth, frame.entries[frame.index])
            }
            None => return self.locate(self.pos),
        };

        let mut offset = child.offset;
        let mut node = self.fetch_child(depth, &child.hash)?;
        loop {
            match node {
                Node::Leaf(data) => {
                    if offset != self.pos || data.is_empty() {
                        return Err(BlobError::Corrupted(format!(
                            "tree {} leaf at {} does not continue offset {}",
                            self.root, offset, self.pos
                        )));
                    }
                    self.leaf = Some(Leaf { offset, data });
                    return Ok(());
                }
                Node::Interior { depth, entries } => {
                    let first = entries[0];
                    self.frames.push(Frame { depth, entries, index: 0 });
                    offset = first.offset;
                    node = self.fetch_child(depth, &first.hash)?;
                }
            }
        }
    }

    fn fetch(&self, hash: &Hash) -> BlobResult<Node> {
        decode_node(hash, self.store.get(hash)?)
    }

    fn fetch_child(&self, parent_depth: u8, hash: &Hash) -> BlobResult<Node> {
        let node = self.fetch(hash)?;
        if node.depth() + 1 != parent_depth {
            return Err(BlobError::Corrupted(format!(
                "node {} has depth {} under a depth {} parent",
                hash,
                node.depth(),
                parent_depth
            )));
        }
        Ok(node)
    }
}

/// Total stream length: the last entry's offset plus the size of the
/// subtree under it, found by following last children down to a leaf.
fn stream_size<R: BlobReader>(store: &R, root: Node) -> BlobResult<u64> {
    let mut node = root;
    let mut base = 0;
    loop {
        match node {
            Node::Leaf(data) => return Ok(base + data.len() as u64),
            Node::Interior { depth, entries } => {
                // decode_node guarantees at least one entry
                let last = entries[entries.len() - 1];
                base = last.offset;
                let child = decode_node(&last.hash, store.get(&last.hash)?)?;
                if child.depth() + 1 != depth {
                    return Err(BlobError::Corrupted(format!(
                        "node {} has depth {} under a depth {} parent",
                        last.hash,
                        child.depth(),
                        depth
                    )));
                }
                node = child;
            }
        }
    }
}

impl<R: BlobReader> io::Read for TreeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(io::Error::other)
    }
}

impl<R: BlobReader> io::Seek for TreeReader<R> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(n) => Some(n),
            io::SeekFrom::End(d) => self.size.checked_add_signed(d),
            io::SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        self.seek_to(target).map_err(io::Error::other)
    }
}
