//! The `ChangeDir` operation (§4.3).
//!
//! States: `Init -> [Pwd]? -> [Cwd -> (PwdCwd)?]? -> [CwdSub -> PwdSub]?`.
//! Every other operation that needs a confirmed remote working directory
//! pushes this as a child rather than issuing `CWD`/`PWD` itself, mirroring
//! `CFtpChangeDirOpData` being reused by `CFtpListOpData`,
//! `CFtpFileTransferOpData`, and friends in the original engine.

use crate::caches::directory_cache::FileState;
use crate::control::mkdir::MkdirOp;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PwdOnly,
    Cwd,
    PwdCwd,
    CwdSub,
    PwdSub,
}

/// Changes (or simply confirms) the remote working directory.
pub struct ChangeDirOp {
    state: State,
    target: Option<ServerPath>,
    subdir: Option<String>,
    try_mkd_on_fail: bool,
    link_discovery: bool,
    cdup_fallback_tried: bool,
    prev_current: Option<ServerPath>,
    prev_sub_current: Option<ServerPath>,
}

impl ChangeDirOp {
    /// Confirms the current remote directory via a bare `PWD`, without
    /// issuing `CWD` (the `path` unset, `subdir` empty case).
    pub fn confirm() -> Self {
        ChangeDirOp::new(None, None)
    }

    /// Changes to `path` via `CWD`, confirming the result with `PWD`.
    pub fn to(path: ServerPath) -> Self {
        ChangeDirOp::new(Some(path), None)
    }

    /// Changes to `path`, then a further `subdir` hop (or `CDUP`/`CWD ..`
    /// when `subdir == ".."`).
    pub fn to_with_subdir(path: ServerPath, subdir: impl Into<String>) -> Self {
        ChangeDirOp::new(Some(path), Some(subdir.into()))
    }

    fn new(target: Option<ServerPath>, subdir: Option<String>) -> Self {
        let state = if target.is_none() && subdir.is_none() { State::PwdOnly } else { State::Cwd };
        ChangeDirOp {
            state,
            target,
            subdir,
            try_mkd_on_fail: false,
            link_discovery: false,
            cdup_fallback_tried: false,
            prev_current: None,
            prev_sub_current: None,
        }
    }

    /// If `CWD` to the target fails, push a `Mkdir` for it and retry once
    /// (used by upload operations targeting a directory that may not exist
    /// yet).
    pub fn with_try_mkd_on_fail(mut self, enabled: bool) -> Self {
        self.try_mkd_on_fail = enabled;
        self
    }

    /// Turn a `5xy` on the `subdir` hop into [`OpStatus::LINK_NOT_DIR`]
    /// instead of a plain error, for callers distinguishing "not a
    /// directory" from "doesn't exist".
    pub fn with_link_discovery(mut self, enabled: bool) -> Self {
        self.link_discovery = enabled;
        self
    }
}

impl OpData for ChangeDirOp {
    fn name(&self) -> &'static str {
        "change_dir"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::PwdOnly | State::PwdCwd | State::PwdSub => OpOutcome::SendCommand("PWD".to_string()),
            State::Cwd => {
                let path = self.target.clone().expect("Cwd state implies a target path");
                OpOutcome::SendCommand(format!("CWD {}", path.to_string_for_server()))
            }
            State::CwdSub => {
                let subdir = self.subdir.clone().expect("CwdSub state implies a subdir");
                if subdir == ".." && !self.cdup_fallback_tried {
                    OpOutcome::SendCommand("CDUP".to_string())
                } else {
                    OpOutcome::SendCommand(format!("CWD {subdir}"))
                }
            }
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        match self.state {
            State::PwdOnly => match parse_pwd_reply(reply, ctx) {
                Some(path) => {
                    ctx.current_path = Some(path);
                    OpOutcome::Done(OpStatus::OK)
                }
                None => OpOutcome::Done(OpStatus::ERROR),
            },
            State::Cwd => {
                if reply.class() == 2 {
                    self.prev_current = ctx.current_path.clone();
                    self.state = State::PwdCwd;
                    OpOutcome::Continue
                } else if self.try_mkd_on_fail {
                    self.try_mkd_on_fail = false; // only retry once
                    let target = self.target.clone().expect("Cwd state implies a target path");
                    OpOutcome::Push(Box::new(MkdirOp::new(target)))
                } else {
                    OpOutcome::Done(OpStatus::ERROR)
                }
            }
            State::PwdCwd => {
                let Some(canonical) = parse_pwd_reply(reply, ctx) else {
                    return OpOutcome::Done(OpStatus::ERROR);
                };
                let path = self.target.clone().expect("PwdCwd state implies a target path");
                ctx.shared.path_cache.store(
                    &ctx.server,
                    self.prev_current.as_ref().unwrap_or(&ServerPath::empty()),
                    &path.to_string_for_server(),
                    canonical.clone(),
                );
                ctx.current_path = Some(canonical);
                if self.subdir.is_some() {
                    self.state = State::CwdSub;
                    OpOutcome::Continue
                } else {
                    OpOutcome::Done(OpStatus::OK)
                }
            }
            State::CwdSub => {
                if reply.class() == 2 {
                    self.prev_sub_current = ctx.current_path.clone();
                    self.state = State::PwdSub;
                    OpOutcome::Continue
                } else if reply.class() == 5 && self.subdir.as_deref() == Some("..") && !self.cdup_fallback_tried {
                    self.cdup_fallback_tried = true;
                    OpOutcome::Continue
                } else if self.link_discovery {
                    OpOutcome::Done(OpStatus::ERROR | OpStatus::LINK_NOT_DIR)
                } else {
                    OpOutcome::Done(OpStatus::ERROR)
                }
            }
            State::PwdSub => {
                let Some(canonical) = parse_pwd_reply(reply, ctx) else {
                    return OpOutcome::Done(OpStatus::ERROR);
                };
                let subdir = self.subdir.clone().expect("PwdSub state implies a subdir");
                ctx.shared
                    .path_cache
                    .store(&ctx.server, self.prev_sub_current.as_ref().unwrap_or(&ServerPath::empty()), &subdir, canonical.clone());
                ctx.current_path = Some(canonical);
                OpOutcome::Done(OpStatus::OK)
            }
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        if result.is_ok() {
            // The pushed Mkdir succeeded; retry the CWD that triggered it.
            self.state = State::Cwd;
            OpOutcome::Continue
        } else {
            OpOutcome::Done(result)
        }
    }
}

/// Parses a quoted path out of a `PWD`/`CWD` confirmation reply, e.g.
/// `257 "/pub/incoming" is current directory`, honoring the RFC 959
/// doubled-quote escape for a literal `"` inside the path.
fn parse_pwd_reply(reply: &Reply, ctx: &OpContext) -> Option<ServerPath> {
    let text = reply.last_line();
    let mut chars = text.chars();
    if chars.next()? != '"' {
        return None;
    }
    let mut out = String::new();
    loop {
        match chars.next()? {
            '"' => {
                let mut lookahead = chars.clone();
                if lookahead.next() == Some('"') {
                    out.push('"');
                    chars.next();
                } else {
                    break;
                }
            }
            c => out.push(c),
        }
    }
    ServerPath::parse(&out, ctx.server.server_type)
}

/// Marks a cache entry's state on success of a directory-affecting command,
/// shared by `Mkdir`/`RemoveDir`/`Rename` (kept here since `ChangeDir` is the
/// common ancestor for directory cache grounding); exposed for those
/// operations to call directly rather than reaching into `DirectoryCache`.
pub(crate) fn record_directory_created(ctx: &mut OpContext, dir: &ServerPath, name: &str, now: chrono::DateTime<chrono::Utc>) {
    ctx.shared.directory_cache.record_created(&ctx.server, dir, name, FileState::Dir, now);
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
    fn pwd_only_sets_current_path() {
        let mut op = ChangeDirOp::confirm();
        let mut c = ctx();
        let outcome = op.parse_response(&mut c, &Reply::single(257, "\"/pub\" is current directory"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
        assert_eq!(c.current_path.unwrap().to_string_for_server(), "/pub");
    }

    #[test]
    fn quoted_path_with_escaped_quote_parses() {
        let mut op = ChangeDirOp::confirm();
        let mut c = ctx();
        op.parse_response(&mut c, &Reply::single(257, "\"/a\"\"b\" is current directory"));
        assert_eq!(c.current_path.unwrap().to_string_for_server(), "/a\"b");
    }

    #[test]
    fn cwd_then_pwd_updates_current_path_and_caches() {
        let mut op = ChangeDirOp::to(ServerPath::parse("/pub", ServerType::Default).unwrap());
        let mut c = ctx();
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "CWD /pub"));
        assert!(matches!(op.parse_response(&mut c, &Reply::single(250, "ok")), OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "PWD"));
        let outcome = op.parse_response(&mut c, &Reply::single(257, "\"/pub\" is current directory"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
        assert_eq!(c.current_path.unwrap().to_string_for_server(), "/pub");
        assert_eq!(c.shared.path_cache.lookup(&c.server, &ServerPath::empty(), "/pub").unwrap().to_string_for_server(), "/pub");
    }

    #[test]
    fn cdup_falls_back_to_cwd_dotdot_on_50x() {
        let mut op = ChangeDirOp::to_with_subdir(ServerPath::parse("/a/b", ServerType::Default).unwrap(), "..");
        let mut c = ctx();
        op.send(&mut c);
        op.parse_response(&mut c, &Reply::single(250, "ok"));
        op.send(&mut c);
        op.parse_response(&mut c, &Reply::single(257, "\"/a/b\" is current directory"));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "CDUP"));
        assert!(matches!(op.parse_response(&mut c, &Reply::single(502, "not implemented")), OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "CWD .."));
    }

    #[test]
    fn link_discovery_turns_5xx_into_link_not_dir() {
        let mut op = ChangeDirOp::to_with_subdir(ServerPath::parse("/a", ServerType::Default).unwrap(), "b").with_link_discovery(true);
        let mut c = ctx();
        op.send(&mut c);
        op.parse_response(&mut c, &Reply::single(250, "ok"));
        op.send(&mut c);
        op.parse_response(&mut c, &Reply::single(257, "\"/a\" is current directory"));
        op.send(&mut c);
        let outcome = op.parse_response(&mut c, &Reply::single(550, "not a directory"));
        match outcome {
            OpOutcome::Done(status) => assert!(status.contains(OpStatus::LINK_NOT_DIR)),
            _ => panic!("expected Done"),
        }
    }
}
