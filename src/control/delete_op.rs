//! The `Delete` operation (§4.8), grounded on `CFtpControlSocket::Delete`/
//! `delete.h`.
//!
//! Deletes a batch of files under one directory, one `DELE` per name.
//! Rather than emitting a `DirectoryListingChanged` notification per file
//! (which would flood the host during a large batch), the cache is updated
//! immediately but the notification is coalesced to at most once per second.

use std::time::{Duration, Instant};

use crate::control::change_dir::ChangeDirOp;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::notification::{MessageCategory, Notification};
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;

const NOTIFY_COALESCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Deleting,
}

/// Deletes `names` from `dir`, one `DELE` per name.
pub struct DeleteOp {
    state: State,
    dir: ServerPath,
    names: Vec<String>,
    next: usize,
    any_failed: bool,
    last_notify: Option<Instant>,
}

impl DeleteOp {
    /// Builds a `Delete` op targeting `names` under `dir`.
    pub fn new(dir: ServerPath, names: Vec<String>) -> Self {
        DeleteOp {
            state: State::Init,
            dir,
            names,
            next: 0,
            any_failed: false,
            last_notify: None,
        }
    }

    fn queue_listing_notification(&mut self, ctx: &mut OpContext, now: Instant) {
        let due = self.last_notify.is_none_or(|last| now.duration_since(last) >= NOTIFY_COALESCE_INTERVAL);
        if due {
            self.last_notify = Some(now);
            ctx.pending_notifications.push(Notification::DirectoryListingChanged {
                path: self.dir.clone(),
                listing: None,
            });
        }
    }
}

impl OpData for DeleteOp {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Init => OpOutcome::Push(Box::new(ChangeDirOp::to(self.dir.clone()))),
            State::Deleting => {
                let Some(name) = self.names.get(self.next) else {
                    return OpOutcome::Done(if self.any_failed { OpStatus::ERROR } else { OpStatus::OK });
                };
                OpOutcome::SendCommand(format!("DELE {name}"))
            }
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        let name = self.names[self.next].clone();
        if reply.class() == 2 {
            ctx.shared.directory_cache.remove_entry(&ctx.server, &self.dir, &name);
            self.queue_listing_notification(ctx, Instant::now());
        } else {
            self.any_failed = true;
            ctx.pending_notifications.push(Notification::Log {
                category: MessageCategory::Error,
                text: format!("DELE {name} failed: {}", reply.last_line()),
            });
        }
        self.next += 1;
        OpOutcome::Continue
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        if result.is_ok() {
            self.state = State::Deleting;
            OpOutcome::Continue
        } else {
            OpOutcome::Done(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::EngineShared;
    use crate::options::EngineOptions;
    use crate::server_info::{Credentials, Protocol, Server, ServerType};

    fn ctx() -> OpContext {
        OpContext::new(EngineShared::default(), Server::new("example.com", 21, Protocol::Ftp), Credentials::anonymous(), EngineOptions::default())
    }

    #[test]
    fn deletes_each_name_in_turn() {
        let dir = ServerPath::parse("/a", ServerType::Default).unwrap();
        let mut op = DeleteOp::new(dir, vec!["a.txt".to_string(), "b.txt".to_string()]);
        let mut c = ctx();
        op.subcommand_result(&mut c, OpStatus::OK);
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "DELE a.txt"));
        assert!(matches!(op.parse_response(&mut c, &Reply::single(250, "deleted")), OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "DELE b.txt"));
        op.parse_response(&mut c, &Reply::single(250, "deleted"));
        assert!(matches!(op.send(&mut c), OpOutcome::Done(status) if status.is_ok()));
    }

    #[test]
    fn one_failure_marks_aggregate_error_but_continues() {
        let dir = ServerPath::parse("/a", ServerType::Default).unwrap();
        let mut op = DeleteOp::new(dir, vec!["a.txt".to_string(), "b.txt".to_string()]);
        let mut c = ctx();
        op.subcommand_result(&mut c, OpStatus::OK);
        op.send(&mut c);
        op.parse_response(&mut c, &Reply::single(550, "no such file"));
        op.send(&mut c);
        op.parse_response(&mut c, &Reply::single(250, "deleted"));
        assert!(matches!(op.send(&mut c), OpOutcome::Done(status) if status.is_error()));
    }
}
