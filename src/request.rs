//! Request/reply surface types.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::connection::CancelGuard;
use crate::status::Status;

/// One reply to a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Trunk/node address of the replier.
    pub sender: u16,
    /// Status word carried by the reply.
    pub status: Status,
    /// Reply payload.
    pub payload: Bytes,
}

impl Reply {
    /// A locally fabricated reply: no sender, no payload, just a status.
    pub(crate) fn synthetic(status: Status) -> Reply {
        Reply {
            sender: 0,
            status,
            payload: Bytes::new(),
        }
    }
}

/// Replies of a streaming request.
///
/// The stream ends after the terminal reply. Dropping it earlier cancels
/// the request at the gateway; replies still in flight are discarded.
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<Reply>,
    _guard: Option<CancelGuard>,
}

impl ReplyStream {
    pub(crate) fn live(rx: mpsc::UnboundedReceiver<Reply>, guard: CancelGuard) -> ReplyStream {
        ReplyStream {
            rx,
            _guard: Some(guard),
        }
    }

    /// A stream that yields one synthetic reply and ends; used when the
    /// request never reached the gateway.
    pub(crate) fn failed(status: Status) -> ReplyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Reply::synthetic(status));
        ReplyStream { rx, _guard: None }
    }
}

impl Stream for ReplyStream {
    type Item = Reply;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Reply>> {
        self.rx.poll_recv(cx)
    }
}

/// A parsed `TASK@NODE` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TaskAddress<'a> {
    pub task: &'a str,
    pub node: NodeSpec<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeSpec<'a> {
    /// `#<decimal>`: the numeric trunk/node address, no lookup needed.
    Address(u16),
    /// A symbolic node name for the gateway to resolve.
    Name(&'a str),
}

impl TaskAddress<'_> {
    pub fn parse(s: &str) -> Result<TaskAddress<'_>, Status> {
        let (task, node) = s.split_once('@').ok_or(Status::INVARG)?;
        if task.is_empty() || node.is_empty() {
            return Err(Status::INVARG);
        }
        let node = match node.strip_prefix('#') {
            Some(digits) => NodeSpec::Address(digits.parse().map_err(|_| Status::INVARG)?),
            None => NodeSpec::Name(node),
        };
        Ok(TaskAddress { task, node })
    }
}
