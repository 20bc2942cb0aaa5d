//! The `Rename` operation (§4.8), grounded on `ftpcontrolsocket.cpp`'s
//! rename state machine and `rename.h`.
//!
//! Both the source and destination directory-cache/path-cache entries are
//! invalidated up front, before `RNFR`/`RNTO` is ever sent (§10.5), so a
//! failure partway through never leaves a stale cache entry pointing at a
//! name that may no longer resolve. When `from` and `to` share a parent
//! directory, a `CWD` into that parent is pushed first so `RNFR`/`RNTO` can
//! use bare names instead of full paths, mirroring the original's
//! same-directory fast path.

use crate::control::change_dir::ChangeDirOp;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::notification::Notification;
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Rnfr,
    Rnto,
}

/// Renames `from` to `to`.
pub struct RenameOp {
    state: State,
    from: ServerPath,
    to: ServerPath,
    use_relative: bool,
}

impl RenameOp {
    /// Builds a `Rename` op moving `from` to `to`.
    pub fn new(from: ServerPath, to: ServerPath) -> Self {
        RenameOp {
            state: State::Init,
            from,
            to,
            use_relative: false,
        }
    }

    fn invalidate_caches(&self, ctx: &mut OpContext) {
        let (from_dir, from_name) = split(&self.from);
        let (to_dir, to_name) = split(&self.to);
        ctx.shared.directory_cache.rename(&ctx.server, &from_dir, &from_name, &to_dir, &to_name);
        ctx.shared.directory_cache.invalidate(&ctx.server, &self.from);
        ctx.shared.directory_cache.invalidate(&ctx.server, &self.to);
        ctx.shared.path_cache.invalidate_under(&ctx.server, &self.from);
        ctx.shared.path_cache.invalidate_under(&ctx.server, &self.to);
        ctx.pending_notifications.push(Notification::DirectoryListingChanged { path: from_dir.clone(), listing: None });
        if to_dir != from_dir {
            ctx.pending_notifications.push(Notification::DirectoryListingChanged { path: to_dir, listing: None });
        }
    }

    fn rnfr_arg(&self) -> String {
        if self.use_relative {
            self.from.last_segment().unwrap_or_default().to_string()
        } else {
            self.from.to_string_for_server()
        }
    }

    fn rnto_arg(&self) -> String {
        if self.use_relative {
            self.to.last_segment().unwrap_or_default().to_string()
        } else {
            self.to.to_string_for_server()
        }
    }
}

fn split(path: &ServerPath) -> (ServerPath, String) {
    let dir = path.parent().unwrap_or_else(ServerPath::empty);
    let name = path.last_segment().unwrap_or_default().to_string();
    (dir, name)
}

impl OpData for RenameOp {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Init => {
                self.invalidate_caches(ctx);
                match (self.from.parent(), self.to.parent()) {
                    (Some(a), Some(b)) if a == b => {
                        self.use_relative = true;
                        OpOutcome::Push(Box::new(ChangeDirOp::to(a)))
                    }
                    _ => {
                        self.state = State::Rnfr;
                        OpOutcome::Continue
                    }
                }
            }
            State::Rnfr => OpOutcome::SendCommand(format!("RNFR {}", self.rnfr_arg())),
            State::Rnto => OpOutcome::SendCommand(format!("RNTO {}", self.rnto_arg())),
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        match self.state {
            State::Rnfr => {
                if matches!(reply.class(), 2 | 3) {
                    self.state = State::Rnto;
                    OpOutcome::Continue
                } else {
                    OpOutcome::Done(OpStatus::ERROR)
                }
            }
            State::Rnto => {
                if reply.class() == 2 {
                    OpOutcome::Done(OpStatus::OK)
                } else {
                    OpOutcome::Done(OpStatus::ERROR)
                }
            }
            State::Init => OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL),
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        if result.is_ok() {
            self.state = State::Rnfr;
            OpOutcome::Continue
        } else {
            // The same-parent CWD failed; fall back to absolute paths.
            self.use_relative = false;
            self.state = State::Rnfr;
            OpOutcome::Continue
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
    fn same_directory_rename_uses_relative_names() {
        let from = ServerPath::parse("/a/old.txt", ServerType::Default).unwrap();
        let to = ServerPath::parse("/a/new.txt", ServerType::Default).unwrap();
        let mut op = RenameOp::new(from, to);
        let mut c = ctx();
        assert!(matches!(op.send(&mut c), OpOutcome::Push(_)));
        op.subcommand_result(&mut c, OpStatus::OK);
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "RNFR old.txt"));
        op.parse_response(&mut c, &Reply::single(350, "ok"));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "RNTO new.txt"));
        let outcome = op.parse_response(&mut c, &Reply::single(250, "renamed"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
    }

    #[test]
    fn cross_directory_rename_uses_absolute_paths() {
        let from = ServerPath::parse("/a/old.txt", ServerType::Default).unwrap();
        let to = ServerPath::parse("/b/new.txt", ServerType::Default).unwrap();
        let mut op = RenameOp::new(from, to);
        let mut c = ctx();
        assert!(matches!(op.send(&mut c), OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "RNFR /a/old.txt"));
    }
}
