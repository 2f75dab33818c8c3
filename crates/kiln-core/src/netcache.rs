//! Remote Artifact Cache - client side of the cache server protocol
//!
//! Every message starts with a fixed 128-byte header of comma-joined fields,
//! padded with spaces:
//! - `GET,<key>,<index>` answered by `<size>` (or `-1`) and the bytes
//! - `PUT,<key>,<index>,<size>` followed by the bytes, no answer
//! - `LST` answered by `<len>,` and a newline-joined key listing
//! - `BYE` closes the connection
//!
//! Output files are addressed by their position in the task's output list.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::ArtifactCache;
use crate::hasher::Digest;

pub const HEADER_SIZE: usize = 128;
pub const DEFAULT_PORT: u16 = 51200;

/// One protocol request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get { key: String, index: usize },
    Put { key: String, index: usize, size: u64 },
    List,
    Bye,
}

/// Pad comma-joined fields to a full header
pub fn encode_header(fields: &[&str]) -> Result<[u8; HEADER_SIZE]> {
    let text = fields.join(",");
    if text.len() > HEADER_SIZE {
        bail!("header too long: {} bytes", text.len());
    }
    let mut header = [b' '; HEADER_SIZE];
    header[..text.len()].copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Fields of a header, padding removed
pub fn decode_header(header: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(header)
        .trim()
        .split(',')
        .map(|f| f.trim().to_string())
        .collect()
}

impl Request {
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        match self {
            Request::Get { key, index } => encode_header(&["GET", key, &index.to_string()]),
            Request::Put { key, index, size } => {
                encode_header(&["PUT", key, &index.to_string(), &size.to_string()])
            }
            Request::List => encode_header(&["LST"]),
            Request::Bye => encode_header(&["BYE"]),
        }
    }

    pub fn parse(header: &[u8]) -> Result<Self> {
        let fields = decode_header(header);
        let field = |i: usize| {
            fields
                .get(i)
                .map(String::as_str)
                .ok_or_else(|| anyhow!("truncated header {:?}", fields))
        };
        let request = match field(0)? {
            "GET" => Request::Get {
                key: valid_key(field(1)?)?,
                index: field(2)?.parse()?,
            },
            "PUT" => Request::Put {
                key: valid_key(field(1)?)?,
                index: field(2)?.parse()?,
                size: field(3)?.parse()?,
            },
            "LST" => Request::List,
            "BYE" => Request::Bye,
            other => bail!("unknown command {:?}", other),
        };
        Ok(request)
    }
}

/// Keys are hex signatures; anything else could escape the cache directory
fn valid_key(key: &str) -> Result<String> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid key {:?}", key);
    }
    Ok(key.to_string())
}

fn read_header(stream: &mut impl Read) -> Result<Vec<String>> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    Ok(decode_header(&header))
}

/// Client of a remote cache server, with a small connection pool
pub struct NetCache {
    addr: String,
    timeout: Duration,
    pool: Mutex<Vec<TcpStream>>,
    keys: Mutex<Option<HashSet<String>>>,
}

impl NetCache {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(30),
            pool: Mutex::new(Vec::new()),
            keys: Mutex::new(None),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .with_context(|| format!("cannot reach cache server {}", self.addr))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Run `f` on a pooled connection; connections that saw an error are dropped
    fn with_connection<T>(&self, f: impl FnOnce(&mut TcpStream) -> Result<T>) -> Result<T> {
        let pooled = self.pool.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut stream = match pooled {
            Some(stream) => stream,
            None => self.connect()?,
        };
        let result = f(&mut stream)?;
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stream);
        Ok(result)
    }

    /// Keys currently held by the server
    pub fn list(&self) -> Result<Vec<String>> {
        self.with_connection(|stream| {
            stream.write_all(&Request::List.encode()?)?;
            let fields = read_header(stream)?;
            let len: u64 = fields
                .first()
                .context("empty listing header")?
                .parse()?;
            let mut body = String::new();
            Read::by_ref(stream).take(len).read_to_string(&mut body)?;
            Ok(body
                .lines()
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect())
        })
    }

    /// The listing is fetched once; later misses are answered locally
    fn is_known(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if keys.is_none() {
            let listed = match self.list() {
                Ok(list) => list.into_iter().collect(),
                Err(e) => {
                    tracing::warn!("netcache: listing from {} failed: {:#}", self.addr, e);
                    HashSet::new()
                }
            };
            *keys = Some(listed);
        }
        keys.as_ref().is_some_and(|k| k.contains(key))
    }

    fn fetch(&self, key: &str, index: usize, output: &Path) -> Result<bool> {
        self.with_connection(|stream| {
            stream.write_all(
                &Request::Get {
                    key: key.to_string(),
                    index,
                }
                .encode()?,
            )?;
            let size: i64 = read_header(stream)?
                .first()
                .context("empty response header")?
                .parse()?;
            if size < 0 {
                return Ok(false);
            }

            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = output.with_extension(format!("kiln-net-{}", std::process::id()));
            let mut file = File::create(&tmp)?;
            let copied = io::copy(&mut Read::by_ref(stream).take(size as u64), &mut file)?;
            drop(file);
            if copied != size as u64 {
                let _ = std::fs::remove_file(&tmp);
                bail!("short read from cache server: {} of {} bytes", copied, size);
            }
            std::fs::rename(&tmp, output)?;
            Ok(true)
        })
    }

    fn send(&self, key: &str, index: usize, output: &Path) -> Result<()> {
        let mut file =
            File::open(output).with_context(|| format!("cannot read {}", output.display()))?;
        let size = file.metadata()?.len();
        self.with_connection(|stream| {
            stream.write_all(
                &Request::Put {
                    key: key.to_string(),
                    index,
                    size,
                }
                .encode()?,
            )?;
            io::copy(&mut file, stream)?;
            Ok(())
        })
    }

    /// Say goodbye on every pooled connection
    pub fn close(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        for mut stream in pool.drain(..) {
            if let Ok(header) = Request::Bye.encode() {
                let _ = stream.write_all(&header);
            }
        }
    }
}

impl ArtifactCache for NetCache {
    fn retrieve(&self, key: &Digest, outputs: &[PathBuf]) -> Result<bool> {
        let key = key.to_hex();
        if !self.is_known(&key) {
            return Ok(false);
        }
        for (index, output) in outputs.iter().enumerate() {
            if !self.fetch(&key, index, output)? {
                return Ok(false);
            }
        }
        tracing::debug!("netcache: restored {} from {}", key, self.addr);
        Ok(true)
    }

    fn store(&self, key: &Digest, outputs: &[PathBuf]) -> Result<()> {
        let key = key.to_hex();
        for (index, output) in outputs.iter().enumerate() {
            self.send(&key, index, output)?;
        }
        if let Some(keys) = self
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            keys.insert(key);
        }
        Ok(())
    }
}

impl Drop for NetCache {
    fn drop(&mut self) {
        self.close();
    }
}
