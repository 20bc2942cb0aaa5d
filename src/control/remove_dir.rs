//! The `RemoveDir` operation (§4.8), grounded on `rmd.h` and
//! `CFtpControlSocket::RemoveDir`.
//!
//! `CWD`s into the target's parent, then issues `RMD <name>`, invalidating
//! both the directory and path caches on success.

use crate::control::change_dir::ChangeDirOp;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::notification::Notification;
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Rmd,
}

/// Removes the directory at `target`.
pub struct RemoveDirOp {
    state: State,
    target: ServerPath,
    parent: ServerPath,
    name: String,
}

impl RemoveDirOp {
    /// Builds a `RemoveDir` op targeting `target`.
    pub fn new(target: ServerPath) -> Self {
        let parent = target.parent().unwrap_or_else(ServerPath::empty);
        let name = target.last_segment().unwrap_or_default().to_string();
        RemoveDirOp {
            state: State::Init,
            target,
            parent,
            name,
        }
    }
}

impl OpData for RemoveDirOp {
    fn name(&self) -> &'static str {
        "remove_dir"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Init => OpOutcome::Push(Box::new(ChangeDirOp::to(self.parent.clone()))),
            State::Rmd => OpOutcome::SendCommand(format!("RMD {}", self.name)),
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        if reply.class() == 2 {
            ctx.shared.directory_cache.remove_entry(&ctx.server, &self.parent, &self.name);
            ctx.shared.directory_cache.invalidate(&ctx.server, &self.target);
            ctx.shared.path_cache.invalidate_under(&ctx.server, &self.target);
            ctx.pending_notifications.push(Notification::DirectoryListingChanged {
                path: self.parent.clone(),
                listing: None,
            });
            OpOutcome::Done(OpStatus::OK)
        } else {
            OpOutcome::Done(OpStatus::ERROR)
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        if result.is_ok() {
            self.state = State::Rmd;
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
    fn removes_named_directory_and_invalidates_caches() {
        let target = ServerPath::parse("/a/b", ServerType::Default).unwrap();
        let mut op = RemoveDirOp::new(target);
        let mut c = ctx();
        op.subcommand_result(&mut c, OpStatus::OK);
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "RMD b"));
        let outcome = op.parse_response(&mut c, &Reply::single(250, "removed"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
    }

    #[test]
    fn failure_propagates_error() {
        let target = ServerPath::parse("/a/b", ServerType::Default).unwrap();
        let mut op = RemoveDirOp::new(target);
        let mut c = ctx();
        op.subcommand_result(&mut c, OpStatus::OK);
        op.send(&mut c);
        let outcome = op.parse_response(&mut c, &Reply::single(550, "not empty"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_error()));
    }
}
