//! Level-II diagnostics.
//!
//! Every acnetd answers a small diagnostic protocol on its well-known
//! `ACNET` task. These helpers wrap [`Connection::request_reply`] with the
//! fixed request bytes and reply layouts of that protocol.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::connection::Connection;
use crate::rad50;
use crate::status::Status;
use crate::wire::{u16_le, u32_le};

/// The well-known diagnostic task on every node.
const ACNET_TASK: &str = "ACNET";

/// Traffic counters of one connected task, from the task-info query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: u16,
    /// Decoded RAD50 handle of the task.
    pub handle: String,
    pub usm_xmt: u16,
    pub req_xmt: u16,
    pub rpy_xmt: u16,
    pub usm_rcv: u16,
    pub req_rcv: u16,
    pub rpy_rcv: u16,
}

impl Connection {
    async fn level2(&self, node: &str, request: &[u8], timeout_ms: u64) -> crate::request::Reply {
        let task = format!("{ACNET_TASK}@{node}");
        self.request_reply(&task, request, Duration::from_millis(timeout_ms))
            .await
    }

    /// Liveness probe: true when the node answers the empty query.
    pub async fn ping(&self, node: &str) -> bool {
        let reply = self.level2(node, &[0x00, 0x00], 100).await;
        reply.status.is_good() && reply.payload.len() == 2
    }

    /// The three version numbers a node reports, each formatted `major.minor`.
    pub async fn get_versions(&self, node: &str) -> Result<[String; 3], Status> {
        let reply = self.level2(node, &[0x03, 0x00], 100).await;
        if !reply.status.is_good() {
            return Err(reply.status);
        }
        decode_versions(&reply.payload)
    }

    /// Numeric id of a named task on the node.
    pub async fn get_task_id(&self, task: &str, node: &str) -> Result<u16, Status> {
        let mut request = vec![0x01, 0x00];
        request.extend_from_slice(&rad50::encode(task).to_le_bytes());
        let reply = self.level2(node, &request, 200).await;
        if !reply.status.is_good() {
            return Err(reply.status);
        }
        if reply.payload.len() < 2 {
            return Err(Status::TRUNC_REPLY);
        }
        Ok(u16_le(&reply.payload, 0))
    }

    /// Name of the task with the given id on the node.
    pub async fn get_task_name(&self, id: u16, node: &str) -> Result<String, Status> {
        // ids below 256 fit the short query form
        let request: Vec<u8> = if id < 256 {
            vec![0x02, id as u8]
        } else {
            vec![0x12, 0x00, (id / 256) as u8, (id % 256) as u8]
        };
        let reply = self.level2(node, &request, 500).await;
        if !reply.status.is_good() {
            return Err(reply.status);
        }
        if reply.payload.len() < 4 {
            return Err(Status::TRUNC_REPLY);
        }
        Ok(rad50::decode(u32_le(&reply.payload, 0)))
    }

    /// IPv4 address of the client behind a task id. Only nodes running
    /// acnetd answer this; others yield [`Status::LEVEL2`].
    pub async fn get_task_ip(&self, id: u16, node: &str) -> Result<Ipv4Addr, Status> {
        let mut request = vec![0x13, 0x00];
        request.extend_from_slice(&id.to_le_bytes());
        let reply = self.level2(node, &request, 200).await;
        if !reply.status.is_good() {
            return Err(reply.status);
        }
        if reply.payload.len() != 4 {
            return Err(Status::LEVEL2);
        }
        let p = &reply.payload;
        Ok(Ipv4Addr::new(p[0], p[1], p[2], p[3]))
    }

    /// Traffic counters for every task connected at the node, keyed by
    /// task id. `reset` clears the node's counters after reading.
    pub async fn get_task_info(
        &self,
        node: &str,
        reset: bool,
    ) -> Result<HashMap<u16, TaskInfo>, Status> {
        let reply = self.level2(node, &[0x07, reset as u8], 500).await;
        if !reply.status.is_good() {
            return Err(reply.status);
        }
        decode_task_info(&reply.payload)
    }
}

fn decode_versions(payload: &[u8]) -> Result<[String; 3], Status> {
    if payload.len() < 6 {
        return Err(Status::TRUNC_REPLY);
    }
    Ok([0, 2, 4].map(|at| {
        let v = u16_le(payload, at);
        format!("{}.{}", v >> 8, v & 0xff)
    }))
}

fn decode_task_info(payload: &[u8]) -> Result<HashMap<u16, TaskInfo>, Status> {
    // 8-byte prefix, then 18-byte records
    let Some(records) = payload.get(8..) else {
        return Err(Status::TRUNC_REPLY);
    };
    if records.len() % 18 != 0 {
        return Err(Status::TRUNC_REPLY);
    }

    let mut out = HashMap::with_capacity(records.len() / 18);
    for record in records.chunks_exact(18) {
        let info = TaskInfo {
            id: u16_le(record, 0),
            handle: rad50::decode(u32_le(record, 2)),
            usm_xmt: u16_le(record, 6),
            req_xmt: u16_le(record, 8),
            rpy_xmt: u16_le(record, 10),
            usm_rcv: u16_le(record, 12),
            req_rcv: u16_le(record, 14),
            rpy_rcv: u16_le(record, 16),
        };
        out.insert(info.id, info);
    }
    Ok(out)
}
