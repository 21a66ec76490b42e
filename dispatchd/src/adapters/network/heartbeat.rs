// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error as ThisError;
use tokio::net::{TcpStream, lookup_host};

use crate::app::types::Address;

#[derive(ThisError, Debug)]
pub enum HeartbeatError {
    #[error("instance address {host} does not resolve")]
    Unresolvable { host: String },

    #[error("resolving {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Socket candidates for the heartbeat port. IP addresses skip resolution.
async fn heartbeat_targets(address: &Address, port: u16) -> Result<Vec<SocketAddr>, HeartbeatError> {
    let host = match address {
        Address::Ip(ip) => return Ok(vec![SocketAddr::new(*ip, port)]),
        Address::Hostname(host) => host,
    };
    let targets: Vec<SocketAddr> = lookup_host((host.as_str(), port))
        .await
        .map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => HeartbeatError::Unresolvable { host: host.clone() },
            _ => HeartbeatError::Lookup {
                host: host.clone(),
                source,
            },
        })?
        .collect();
    if targets.is_empty() {
        return Err(HeartbeatError::Unresolvable { host: host.clone() });
    }
    Ok(targets)
}

/// One heartbeat: the instance beats when any resolved socket accepts a TCP
/// connection before `window` runs out. The window covers all candidates together.
pub async fn beat(address: &Address, port: u16, window: Duration) -> Result<bool, HeartbeatError> {
    let targets = heartbeat_targets(address, port).await?;
    let attempt = async {
        for target in targets {
            if TcpStream::connect(target).await.is_ok() {
                return true;
            }
        }
        false
    };
    Ok(tokio::time::timeout(window, attempt).await.unwrap_or(false))
}
