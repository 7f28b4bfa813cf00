//! Fstat cache service.
//!
//! Answers `(prefix, from, to]` queries from the write-once [`CacheStore`]
//! over TCP. The service may lag behind the depot but never leads it: a
//! redirect always points strictly inside the requested range.

pub mod protocol;
pub mod store;

use anyhow::{Context, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::streaming::codec::encode_all;
use protocol::{
    read_frame, write_frame, Credentials, Done, ErrorCode, Fatal, MessageType, Query, Records,
    Response, Status, PROTOCOL_VERSION, RECORDS_PER_FRAME,
};
use store::{CacheStore, Lookup};

pub struct CacheServer {
    store: CacheStore,
    credentials: Option<Credentials>,
}

impl CacheServer {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            credentials: None,
        }
    }

    /// Require every query to carry these credentials.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve_until(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("cache service shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("Failed to accept connection")?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            tracing::warn!(%peer, error = %format!("{:#}", e), "connection failed");
                        }
                    });
                }
            }
        }
    }

    /// Serve every exchange on one connection until the client hangs up.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let (msg_type, payload) = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(e) if is_hangup(&e) => return Ok(()),
                Err(e) => return Err(e),
            };

            if msg_type != MessageType::Query {
                let fatal = Fatal::new(
                    ErrorCode::BadRequest,
                    format!("expected QUERY, got {:?}", msg_type),
                );
                write_frame(&mut stream, &fatal.encode()).await?;
                stream.flush().await?;
                return Ok(());
            }

            let query = match Query::decode(payload) {
                Ok(q) => q,
                Err(e) => {
                    let fatal = Fatal::new(ErrorCode::BadRequest, format!("{:#}", e));
                    write_frame(&mut stream, &fatal.encode()).await?;
                    stream.flush().await?;
                    return Ok(());
                }
            };

            if !self.answer(&mut stream, &query, peer).await? {
                return Ok(());
            }
        }
    }

    /// Answer one query. Returns `false` if the connection should close.
    async fn answer<S>(&self, stream: &mut S, query: &Query, peer: SocketAddr) -> Result<bool>
    where
        S: AsyncWrite + Unpin,
    {
        let start = Instant::now();

        if let Some(rejection) = self.reject(query) {
            tracing::warn!(%peer, prefix = %query.prefix, reason = %rejection.message, "query rejected");
            write_frame(stream, &rejection.encode()).await?;
            stream.flush().await?;
            return Ok(false);
        }

        let store = self.store.clone();
        let (prefix, from, to) = (query.prefix.clone(), query.from, query.to);
        let lookup = tokio::task::spawn_blocking(move || store.lookup(&prefix, from, to))
            .await
            .context("cache lookup panicked")?;
        let lookup = match lookup {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(prefix = %query.prefix, error = %format!("{:#}", e), "cache lookup failed");
                let fatal = Fatal::new(ErrorCode::Internal, format!("{:#}", e));
                write_frame(stream, &fatal.encode()).await?;
                stream.flush().await?;
                return Ok(false);
            }
        };

        let (status, records) = match lookup {
            Lookup::Full(records) => (Status::Full, records),
            Lookup::Redirect {
                redirect_to,
                records,
            } => (Status::Redirect { redirect_to }, records),
            Lookup::Miss => (Status::Miss, Vec::new()),
        };

        let count = records.len() as u64;
        write_frame(stream, &Response { status, count }.encode()).await?;
        for chunk in records.chunks(RECORDS_PER_FRAME) {
            let lines = encode_all(chunk, None)?;
            write_frame(stream, &Records { lines }.encode()).await?;
        }
        write_frame(stream, &Done { count }.encode()).await?;
        stream.flush().await?;

        let redirect_to = match status {
            Status::Redirect { redirect_to } => redirect_to,
            _ => 0,
        };
        tracing::info!(
            op = "fstat",
            %peer,
            prefix = %query.prefix,
            from = query.from,
            to = query.to,
            status = status.as_str(),
            redirect_to,
            records = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "query"
        );
        Ok(true)
    }

    fn reject(&self, query: &Query) -> Option<Fatal> {
        if query.version != PROTOCOL_VERSION {
            return Some(Fatal::new(
                ErrorCode::UnsupportedVersion,
                format!(
                    "protocol version {} not supported (server speaks {})",
                    query.version, PROTOCOL_VERSION
                ),
            ));
        }
        if let Some(required) = &self.credentials {
            if query.credentials.as_ref() != Some(required) {
                return Some(Fatal::new(ErrorCode::Unauthorized, "invalid credentials"));
            }
        }
        if query.from >= query.to {
            return Some(Fatal::new(
                ErrorCode::BadRequest,
                format!("empty range ({}, {}]", query.from, query.to),
            ));
        }
        None
    }
}

fn is_hangup(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>().is_some_and(|e| {
        matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
        )
    })
}

/// Bind `listen` and serve `store_dir` until Ctrl-C.
pub async fn run_server(listen: &str, store_dir: &Path, credentials: Option<Credentials>) -> Result<()> {
    let store = CacheStore::open(store_dir)?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        store = %store_dir.display(),
        auth = credentials.is_some(),
        "cache service listening"
    );

    let server = Arc::new(CacheServer::new(store).with_credentials(credentials));
    server
        .serve_until(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Action, FileType, FstatRecord};
    use crate::streaming::codec::decode_all;
    use tempfile::TempDir;

    fn peer() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    fn server_with(entries: &[(u64, Vec<FstatRecord>)]) -> (TempDir, CacheServer) {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        for (cl, records) in entries {
            store.insert("//depot", *cl, records).unwrap();
        }
        (temp, CacheServer::new(store))
    }

    async fn exchange(server: &CacheServer, query: Query) -> Vec<(MessageType, bytes::Bytes)> {
        let (mut client, srv) = tokio::io::duplex(1 << 16);
        write_frame(&mut client, &query.encode().unwrap()).await.unwrap();
        client.shutdown().await.unwrap();

        server.handle_connection(srv, peer()).await.unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = read_frame(&mut client).await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_full_exchange() {
        let record = FstatRecord::new(5, "a.txt", 1, Action::Add, FileType::Text, 0, "");
        let (_temp, server) = server_with(&[(10, vec![record.clone()])]);

        let frames = exchange(&server, Query::new("//depot", 0, 10)).await;
        assert_eq!(frames.len(), 3);
        let response = Response::decode(frames[0].1.clone()).unwrap();
        assert_eq!(response.status, Status::Full);
        assert_eq!(response.count, 1);
        let lines = Records::decode(frames[1].1.clone()).unwrap().lines;
        assert_eq!(decode_all(&lines).unwrap(), vec![record]);
        assert_eq!(frames[2].0, MessageType::Done);
    }

    #[tokio::test]
    async fn test_credentials_required() {
        let (_temp, server) = server_with(&[]);
        let server = server.with_credentials(Some(Credentials {
            username: "u".to_string(),
            password: "p".to_string(),
        }));

        let frames = exchange(&server, Query::new("//depot", 0, 10)).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, MessageType::Fatal);
        let fatal = Fatal::decode(frames[0].1.clone()).unwrap();
        assert_eq!(fatal.code, ErrorCode::Unauthorized as u16);
    }

    #[tokio::test]
    async fn test_miss_has_no_records() {
        let (_temp, server) = server_with(&[(50, vec![])]);
        let frames = exchange(&server, Query::new("//depot", 50, 60)).await;
        let response = Response::decode(frames[0].1.clone()).unwrap();
        assert_eq!(response.status, Status::Miss);
        assert_eq!(frames.len(), 2);
    }
}
