//! Client session with the fstat cache service.
//!
//! Connection trouble (refused, reset, timeout) makes the service
//! unavailable and the caller falls back to the depot. Anything the service
//! says that breaks the protocol is fatal.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::SyncError;
use crate::record::FstatRecord;
use crate::server::protocol::{
    read_frame, write_frame, Credentials, Done, ErrorCode, Fatal, MessageType, Query, Records,
    Response, Status,
};
use crate::server::store::Lookup;
use crate::streaming::codec::decode_all;

/// Default time allowed for one whole exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts `host:port` or `tcp://host:port`.
pub fn parse_service_addr(url: &str) -> Result<String, SyncError> {
    let addr = url.trim();
    let addr = addr.strip_prefix("tcp://").unwrap_or(addr);
    let addr = addr.trim_end_matches('/');
    let valid = match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if !valid {
        return Err(SyncError::Config(format!(
            "service address {:?} is not [tcp://]host:port",
            url
        )));
    }
    Ok(addr.to_string())
}

#[derive(Debug, Clone)]
pub struct ServiceClient {
    addr: String,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl ServiceClient {
    pub fn new(url: &str) -> Result<Self, SyncError> {
        Ok(Self {
            addr: parse_service_addr(url)?,
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Ask the service for `(from, to]`. `Ok(None)` means the service could
    /// not be reached in time; the caller should ask the depot instead.
    pub async fn query(&self, prefix: &str, from: u64, to: u64) -> Result<Option<Lookup>> {
        match tokio::time::timeout(self.timeout, self.exchange(prefix, from, to)).await {
            Ok(Ok(lookup)) => Ok(Some(lookup)),
            Ok(Err(e)) if e.downcast_ref::<SyncError>().is_some() => Err(e),
            Ok(Err(e)) => {
                tracing::warn!(
                    addr = %self.addr,
                    error = %format!("{:#}", e),
                    "fstat service unavailable, using depot"
                );
                Ok(None)
            }
            Err(_) => {
                tracing::warn!(
                    addr = %self.addr,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "fstat service timed out, using depot"
                );
                Ok(None)
            }
        }
    }

    async fn exchange(&self, prefix: &str, from: u64, to: u64) -> Result<Lookup> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.addr))?;

        let query = Query::new(prefix, from, to).with_credentials(self.credentials.clone());
        write_frame(&mut stream, &query.encode()?).await?;
        stream.flush().await?;

        let (msg_type, payload) = read_frame(&mut stream).await?;
        let response = match msg_type {
            MessageType::Response => Response::decode(payload)?,
            MessageType::Fatal => return Err(fatal_error(Fatal::decode(payload)?)),
            other => {
                return Err(SyncError::Protocol(format!("expected RESPONSE, got {:?}", other)).into())
            }
        };

        let upper = match response.status {
            Status::Full => to,
            Status::Redirect { redirect_to } => {
                if !(from < redirect_to && redirect_to < to) {
                    return Err(SyncError::RedirectViolation {
                        from,
                        to,
                        redirect: redirect_to,
                    }
                    .into());
                }
                redirect_to
            }
            Status::Miss => from,
        };

        let mut records = Vec::with_capacity(response.count.min(1 << 20) as usize);
        loop {
            let (msg_type, payload) = read_frame(&mut stream).await?;
            match msg_type {
                MessageType::Records => {
                    let chunk = Records::decode(payload)?;
                    records.extend(decode_all(&chunk.lines)?);
                }
                MessageType::Done => {
                    let done = Done::decode(payload)?;
                    if done.count != records.len() as u64 || done.count != response.count {
                        return Err(SyncError::Protocol(format!(
                            "service announced {} records, sent {}",
                            response.count,
                            records.len()
                        ))
                        .into());
                    }
                    break;
                }
                MessageType::Fatal => return Err(fatal_error(Fatal::decode(payload)?)),
                other => {
                    return Err(SyncError::Protocol(format!("unexpected {:?} in response", other)).into())
                }
            }
        }

        check_range(&records, from, upper)?;
        tracing::debug!(
            prefix,
            from,
            to,
            status = response.status.as_str(),
            records = records.len(),
            "fstat service answered"
        );

        Ok(match response.status {
            Status::Full => Lookup::Full(records),
            Status::Redirect { redirect_to } => Lookup::Redirect {
                redirect_to,
                records,
            },
            Status::Miss => Lookup::Miss,
        })
    }
}

fn fatal_error(fatal: Fatal) -> anyhow::Error {
    if fatal.code == ErrorCode::Unauthorized as u16 {
        SyncError::Config(format!("fstat service rejected credentials: {}", fatal.message)).into()
    } else {
        SyncError::Protocol(format!("fstat service error {}: {}", fatal.code, fatal.message)).into()
    }
}

fn check_range(records: &[FstatRecord], from: u64, upper: u64) -> Result<(), SyncError> {
    match records.iter().find(|r| r.change <= from || r.change > upper) {
        Some(r) => Err(SyncError::Protocol(format!(
            "service returned {} at change {}, outside ({}, {}]",
            r.path, r.change, from, upper
        ))),
        None => Ok(()),
    }
}
