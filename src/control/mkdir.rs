//! The `Mkdir` operation (§4.8), grounded on `CFtpMkdirOpData` (`mkd.cpp`).
//!
//! Walks up from the target path looking for an ancestor the server accepts
//! via `CWD`, then issues `MKD` once per segment back down to the target. If
//! the walk fails partway, falls back to a single `MKD <fullpath>` — unless
//! the server's error text indicates the path already exists, in which case
//! that original error is preserved (DESIGN.md Open Question 1).

use crate::caches::directory_cache::FileState;
use crate::caches::locks::LockKind;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    FindParent,
    Mkdsub,
    Cwdsub,
    Tryfull,
}

/// Creates `path`, creating any missing ancestor directories along the way.
pub struct MkdirOp {
    state: State,
    /// The directory ultimately being created.
    path: ServerPath,
    /// The deepest path known (from a prior `ChangeDir`) to already exist.
    current_path_hint: Option<ServerPath>,
    /// The shallowest ancestor the walk will stop probing at.
    common_parent: Option<ServerPath>,
    /// The ancestor currently being probed with `CWD`.
    walk_path: ServerPath,
    /// Segment names to `MKD`, in walk-up order (so `.last()` is the
    /// shallowest one still to create).
    segments: Vec<String>,
    lock_guard: Option<crate::caches::locks::LockGuard>,
}

impl MkdirOp {
    /// Builds a `Mkdir` op targeting `path`.
    pub fn new(path: ServerPath) -> Self {
        MkdirOp {
            state: State::Init,
            path,
            current_path_hint: None,
            common_parent: None,
            walk_path: ServerPath::empty(),
            segments: Vec::new(),
            lock_guard: None,
        }
    }
}

impl OpData for MkdirOp {
    fn name(&self) -> &'static str {
        "mkdir"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        if self.lock_guard.is_none() {
            if let Some(guard) = ctx.held_lock.take() {
                self.lock_guard = Some(guard);
            } else {
                ctx.pending_lock = Some((self.path.clone(), LockKind::Mkdir));
                return OpOutcome::Suspend;
            }
        }

        match self.state {
            State::Init => {
                self.current_path_hint = ctx.current_path.clone();
                if let Some(hint) = &self.current_path_hint {
                    if *hint == self.path || hint.is_subdir_of(&self.path) {
                        return OpOutcome::Done(OpStatus::OK);
                    }
                    self.common_parent = Some(if hint.is_parent_of(&self.path) {
                        hint.clone()
                    } else {
                        self.path.common_parent(hint)
                    });
                }

                if !self.path.has_parent() {
                    self.state = State::Tryfull;
                } else {
                    let parent = self.path.parent().expect("has_parent implies a parent");
                    self.segments.push(self.path.last_segment().expect("has_parent implies a last segment").to_string());
                    self.walk_path = parent;
                    self.state = if Some(&self.walk_path) == self.current_path_hint.as_ref() {
                        State::Mkdsub
                    } else {
                        State::FindParent
                    };
                }
                OpOutcome::Continue
            }
            State::FindParent | State::Cwdsub => {
                self.current_path_hint = None;
                OpOutcome::SendCommand(format!("CWD {}", self.walk_path.to_string_for_server()))
            }
            State::Mkdsub => {
                let name = self.segments.last().expect("Mkdsub state implies a pending segment");
                OpOutcome::SendCommand(format!("MKD {name}"))
            }
            State::Tryfull => OpOutcome::SendCommand(format!("MKD {}", self.path.to_string_for_server())),
        }
    }

    fn parse_response(&mut self, ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        let ok = matches!(reply.class(), 2 | 3);
        match self.state {
            State::FindParent => {
                if ok {
                    self.current_path_hint = Some(self.walk_path.clone());
                    self.state = State::Mkdsub;
                } else if Some(&self.walk_path) == self.common_parent.as_ref() {
                    self.state = State::Tryfull;
                } else if self.walk_path.has_parent() {
                    let parent = self.walk_path.parent().expect("has_parent implies a parent");
                    self.segments.push(self.walk_path.last_segment().expect("has_parent implies a last segment").to_string());
                    self.walk_path = parent;
                } else {
                    self.state = State::Tryfull;
                }
                OpOutcome::Continue
            }
            State::Mkdsub => {
                if !ok && response_indicates_already_exists(reply.last_line(), &self.path.to_string_for_server()) {
                    self.state = State::Tryfull;
                    return OpOutcome::Continue;
                }
                let Some(name) = self.segments.last().cloned() else {
                    return OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL);
                };
                let mut failed = false;
                if !ok {
                    if let Some(existing) = ctx.shared.directory_cache.lookup(&ctx.server, &self.walk_path).and_then(|l| l.find(&name).cloned()) {
                        if !existing.is_dir {
                            failed = true;
                        }
                    }
                }
                ctx.shared.directory_cache.record_created(&ctx.server, &self.walk_path, &name, FileState::Dir, chrono::Utc::now());
                self.walk_path = self.walk_path.add_segment(&name);
                self.segments.pop();
                if failed {
                    return OpOutcome::Done(OpStatus::ERROR);
                }
                if self.segments.is_empty() {
                    OpOutcome::Done(OpStatus::OK)
                } else {
                    self.state = State::Cwdsub;
                    OpOutcome::Continue
                }
            }
            State::Cwdsub => {
                if ok {
                    self.current_path_hint = Some(self.walk_path.clone());
                    self.state = State::Mkdsub;
                } else {
                    self.state = State::Tryfull;
                }
                OpOutcome::Continue
            }
            State::Tryfull => {
                if ok {
                    OpOutcome::Done(OpStatus::OK)
                } else {
                    OpOutcome::Done(OpStatus::ERROR)
                }
            }
            State::Init => OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL),
        }
    }

    fn subcommand_result(&mut self, _ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        OpOutcome::Done(result)
    }
}

/// True only when the reply clearly says the path already exists, and the
/// path's own text doesn't just happen to contain that phrase (DESIGN.md
/// Open Question 1).
fn response_indicates_already_exists(response: &str, path_text: &str) -> bool {
    let response = response.to_ascii_lowercase();
    let path_text = path_text.to_ascii_lowercase();
    let phrase_in_response = |phrase: &str| response.contains(phrase) && !path_text.contains(phrase);
    phrase_in_response("already exists") || phrase_in_response("file exists")
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

    async fn grant_lock(c: &mut OpContext, path: &ServerPath) {
        c.pending_lock = None;
        c.held_lock = Some(c.shared.locks.acquire(&c.server, path, LockKind::Mkdir).await);
    }

    #[tokio::test]
    async fn already_a_subdir_of_target_short_circuits_ok() {
        let path = ServerPath::parse("/a", ServerType::Default).unwrap();
        let mut c = ctx();
        c.current_path = Some(ServerPath::parse("/a/b", ServerType::Default).unwrap());
        grant_lock(&mut c, &path).await;
        let mut op = MkdirOp::new(path);
        assert!(matches!(op.send(&mut c), OpOutcome::Done(status) if status.is_ok()));
    }

    #[tokio::test]
    async fn single_segment_mkd_from_known_parent() {
        let path = ServerPath::parse("/a/new", ServerType::Default).unwrap();
        let mut c = ctx();
        c.current_path = Some(ServerPath::parse("/a", ServerType::Default).unwrap());
        grant_lock(&mut c, &path).await;
        let mut op = MkdirOp::new(path);
        assert!(matches!(op.send(&mut c), OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "MKD new"));
        let outcome = op.parse_response(&mut c, &Reply::single(257, "\"/a/new\" created"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_ok()));
    }

    #[tokio::test]
    async fn already_exists_response_blocks_tryfull_fallback() {
        let path = ServerPath::parse("/a/new", ServerType::Default).unwrap();
        let mut c = ctx();
        c.current_path = Some(ServerPath::parse("/a", ServerType::Default).unwrap());
        grant_lock(&mut c, &path).await;
        let mut op = MkdirOp::new(path);
        op.send(&mut c);
        op.send(&mut c);
        let outcome = op.parse_response(&mut c, &Reply::single(550, "Directory already exists"));
        // Falls through to tryfull, which then fails because "already
        // exists" suppressed the normal per-segment success path.
        assert!(matches!(outcome, OpOutcome::Continue));
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "MKD /a/new"));
    }

    #[tokio::test]
    async fn walk_up_then_down_creates_each_segment() {
        let path = ServerPath::parse("/a/b/c", ServerType::Default).unwrap();
        let mut c = ctx();
        // No current_path hint at all: must walk from the target's parent.
        grant_lock(&mut c, &path).await;
        let mut op = MkdirOp::new(path);
        assert!(matches!(op.send(&mut c), OpOutcome::Continue)); // Init
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "CWD /a/b")); // FindParent
        assert!(matches!(op.parse_response(&mut c, &Reply::single(250, "ok")), OpOutcome::Continue)); // -> Mkdsub
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd == "MKD c"));
        assert!(matches!(op.parse_response(&mut c, &Reply::single(257, "created")), OpOutcome::Done(s) if s.is_ok()));
    }
}
