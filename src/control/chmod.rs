//! The `Chmod` operation (§4.8), grounded on `ftpcontrolsocket.cpp`'s
//! Chmod state machine.
//!
//! `CWD`s into `dir` first (like `Delete`/`RemoveDir`) so `SITE CHMOD` can
//! use a bare name, then sends a single command. The cache entry is marked
//! unknown regardless of whether the server accepts it, since either outcome
//! means the entry's previously-cached attributes can no longer be trusted
//! as-is (a rejection may still have partially applied on some servers).

use crate::control::change_dir::ChangeDirOp;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Chmod,
}

/// Changes the permissions of `name` under `dir` to `permission`
/// (a raw octal-or-symbolic string, passed through verbatim to `SITE CHMOD`).
pub struct ChmodOp {
    state: State,
    dir: ServerPath,
    name: String,
    permission: String,
}

impl ChmodOp {
    /// Builds a `Chmod` op.
    pub fn new(dir: ServerPath, name: impl Into<String>, permission: impl Into<String>) -> Self {
        ChmodOp {
            state: State::Init,
            dir,
            name: name.into(),
            permission: permission.into(),
        }
    }
}

impl OpData for ChmodOp {
    fn name(&self) -> &'static str {
        "chmod"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Init => OpOutcome::Push(Box::new(ChangeDirOp::to(self.dir.clone()))),
            State::Chmod => OpOutcome::SendCommand(format!("SITE CHMOD {} {}", self.permission, self.name)),
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        ctx.shared.directory_cache.mark_unknown(&ctx.server, &self.dir, &self.name);
        if reply.class() == 2 {
            OpOutcome::Done(OpStatus::OK)
        } else {
            OpOutcome::Done(OpStatus::ERROR)
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        if result.is_ok() {
            self.state = State::Chmod;
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
    fn success_sets_ok_and_marks_unknown() {
        let dir = ServerPath::parse("/a", ServerType::Default).unwrap();
        let mut op = ChmodOp::new(dir.clone(), "f.txt", "644");
        let mut c = ctx();
        c.shared.directory_cache.record_created(&c.server, &dir, "f.txt", crate::caches::directory_cache::FileState::File, chrono::Utc::now());
        op.subcommand_result(&mut c, OpStatus::OK);
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "SITE CHMOD 644 f.txt"));
        let outcome = op.parse_response(&mut c, &Reply::single(200, "ok"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
        let listing = c.shared.directory_cache.lookup(&c.server, &dir).unwrap();
        assert!(listing.is_unsure());
    }

    #[test]
    fn failure_still_marks_unknown() {
        let dir = ServerPath::parse("/a", ServerType::Default).unwrap();
        let mut op = ChmodOp::new(dir.clone(), "f.txt", "644");
        let mut c = ctx();
        c.shared.directory_cache.record_created(&c.server, &dir, "f.txt", crate::caches::directory_cache::FileState::File, chrono::Utc::now());
        op.subcommand_result(&mut c, OpStatus::OK);
        op.send(&mut c);
        let outcome = op.parse_response(&mut c, &Reply::single(550, "not permitted"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_error()));
        let listing = c.shared.directory_cache.lookup(&c.server, &dir).unwrap();
        assert!(listing.is_unsure());
    }
}
