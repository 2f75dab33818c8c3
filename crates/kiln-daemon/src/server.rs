//! Cache Server - GET/PUT/LST/BYE over TCP
//!
//! Every connection is served by its own task and loops over fixed-size
//! request headers until BYE or end of stream.

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use kiln_core::netcache::{encode_header, Request, HEADER_SIZE};

use crate::state::{CacheIndex, ServerConfig};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Remote artifact cache server
pub struct CacheServer {
    config: ServerConfig,
    index: Arc<Mutex<CacheIndex>>,
}

impl CacheServer {
    /// Create the server and index the cache directory
    pub fn new(config: ServerConfig) -> Result<Self> {
        let index = CacheIndex::open(&config.dir, config.max_bytes, config.clean_ratio)?;
        Ok(Self {
            config,
            index: Arc::new(Mutex::new(index)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("cannot listen on {}", self.config.addr))
    }

    /// Bind the configured address and serve forever
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Cache server listening on {} ({:?})",
            listener.local_addr()?,
            self.config.dir
        );
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("connection from {}", peer);
                    let index = Arc::clone(&self.index);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, index).await {
                            error!("Connection error from {}: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }
}

fn lock(index: &Mutex<CacheIndex>) -> MutexGuard<'_, CacheIndex> {
    index.lock().unwrap_or_else(|e| e.into_inner())
}

async fn handle_connection(mut stream: TcpStream, index: Arc<Mutex<CacheIndex>>) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut header = [0u8; HEADER_SIZE];
    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let request = Request::parse(&header)?;
        debug!("request {:?}", request);
        match request {
            Request::Get { key, index: i } => get(&mut stream, &index, &key, i).await?,
            Request::Put { key, index: i, size } => put(&mut stream, &index, &key, i, size).await?,
            Request::List => list(&mut stream, &index).await?,
            Request::Bye => return Ok(()),
        }
    }
}

async fn get(stream: &mut TcpStream, index: &Mutex<CacheIndex>, key: &str, i: usize) -> Result<()> {
    let path = lock(index).path(key, i);
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(_) => {
            stream.write_all(&encode_header(&["-1"])?).await?;
            return Ok(());
        }
    };

    let size = file.metadata().await?.len();
    stream.write_all(&encode_header(&[&size.to_string()])?).await?;
    let sent = io::copy(&mut file.take(size), stream).await?;
    if sent != size {
        bail!("{} shrank while sending ({} of {} bytes)", path.display(), sent, size);
    }
    lock(index).touch(key);
    Ok(())
}

async fn put(
    stream: &mut TcpStream,
    index: &Mutex<CacheIndex>,
    key: &str,
    i: usize,
    size: u64,
) -> Result<()> {
    let path = lock(index).path(key, i);
    let dir = path
        .parent()
        .context("entry path without a parent")?
        .to_path_buf();
    tokio::fs::create_dir_all(&dir).await?;

    let tmp = dir.join(format!(
        ".tmp-{}-{}",
        i,
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let mut file = File::create(&tmp).await?;
    let received = io::copy(&mut (&mut *stream).take(size), &mut file).await?;
    file.flush().await?;
    drop(file);
    if received != size {
        let _ = tokio::fs::remove_file(&tmp).await;
        bail!("short upload for {}: {} of {} bytes", key, received, size);
    }

    let replaced = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    tokio::fs::rename(&tmp, &path).await?;

    let mut index = lock(index);
    index.add(key, size, replaced);
    index.trim();
    Ok(())
}

async fn list(stream: &mut TcpStream, index: &Mutex<CacheIndex>) -> Result<()> {
    let body = lock(index).keys().join("\n");
    stream
        .write_all(&encode_header(&[&body.len().to_string(), ""])?)
        .await?;
    stream.write_all(body.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{
        ActionKind, ActionOutput, ArtifactCache, Build, BuildState, Digest, FnAction, NetCache,
        Registry, Scheduler, TaskSpec,
    };
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    async fn start(dir: &std::path::Path, max_bytes: u64) -> String {
        let server = CacheServer::new(ServerConfig {
            addr: "127.0.0.1:0".into(),
            dir: dir.to_path_buf(),
            max_bytes,
            clean_ratio: 0.5,
        })
        .unwrap();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_client_round_trip() {
        let server_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let addr = start(server_dir.path(), 1 << 20).await;

        let key = Digest::of(b"task");
        let outputs = vec![work.path().join("a.o"), work.path().join("b.o")];
        fs::write(&outputs[0], "alpha").unwrap();
        fs::write(&outputs[1], "beta").unwrap();

        let served = server_dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let cache = NetCache::new(addr.clone());
            assert!(!cache.retrieve(&key, &outputs).unwrap());
            cache.store(&key, &outputs).unwrap();
            // answered after the uploads on the same connection
            assert_eq!(cache.list().unwrap(), vec![key.to_hex()]);
            cache.close();

            assert_eq!(
                fs::read_to_string(served.join(key.to_hex()).join("1")).unwrap(),
                "beta"
            );

            for output in &outputs {
                fs::remove_file(output).unwrap();
            }
            let fresh = NetCache::new(addr);
            assert_eq!(fresh.list().unwrap(), vec![key.to_hex()]);
            assert!(fresh.retrieve(&key, &outputs).unwrap());
            assert_eq!(fs::read_to_string(&outputs[0]).unwrap(), "alpha");
            assert_eq!(fs::read_to_string(&outputs[1]).unwrap(), "beta");
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduler_restores_from_server() {
        let server_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let addr = start(server_dir.path(), 1 << 20).await;
        fs::write(work.path().join("a.src"), "payload").unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut registry = Registry::new();
        registry.register(ActionKind::new(
            "copy",
            FnAction::new("copy-v1", move |cx| {
                counter.fetch_add(1, Ordering::SeqCst);
                fs::copy(&cx.inputs[0], &cx.outputs[0])?;
                Ok(ActionOutput::success())
            }),
        ));
        let registry = Arc::new(registry);
        let build = || {
            let mut build = Build::new(work.path(), Arc::clone(&registry), BuildState::in_memory());
            build
                .add_task(TaskSpec::new("copy").inputs(["a.src"]).outputs(["a.out"]))
                .unwrap();
            build
        };

        let net = Arc::new(NetCache::new(addr.clone()));
        let report = Scheduler::new(2)
            .cache(net.clone())
            .run(&mut build())
            .await
            .unwrap();
        assert_eq!((report.executed, report.cached), (1, 0));
        // answered after the upload on the same connection
        let listed = tokio::task::spawn_blocking(move || net.list().unwrap())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        fs::remove_file(work.path().join("a.out")).unwrap();
        let report = Scheduler::new(2)
            .cache(Arc::new(NetCache::new(addr)))
            .run(&mut build())
            .await
            .unwrap();
        assert_eq!((report.executed, report.cached), (0, 1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            fs::read_to_string(work.path().join("a.out")).unwrap(),
            "payload"
        );
    }

    #[tokio::test]
    async fn test_get_unknown_key() {
        let server_dir = tempfile::tempdir().unwrap();
        let addr = start(server_dir.path(), 1 << 20).await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let request = Request::Get {
            key: "abcd".into(),
            index: 0,
        };
        stream.write_all(&request.encode().unwrap()).await.unwrap();
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&header).trim(), "-1");

        stream.write_all(&Request::Bye.encode().unwrap()).await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_uploads_past_budget_evict_oldest() {
        let server_dir = tempfile::tempdir().unwrap();
        let addr = start(server_dir.path(), 100).await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();

        for key in ["aa", "bb", "cc"] {
            let request = Request::Put {
                key: key.into(),
                index: 0,
                size: 40,
            };
            stream.write_all(&request.encode().unwrap()).await.unwrap();
            stream.write_all(&[b'x'; 40]).await.unwrap();
        }

        stream.write_all(&Request::List.encode().unwrap()).await.unwrap();
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let len: usize = String::from_utf8_lossy(&header)
            .trim()
            .trim_end_matches(',')
            .parse()
            .unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();

        assert_eq!(String::from_utf8(body).unwrap(), "cc");
        assert!(!server_dir.path().join("aa").exists());
    }
}
