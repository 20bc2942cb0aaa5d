//! The `FileTransfer` operation (§4.5), grounded on
//! `CFtpControlSocket::FileTransfer` / `filetransfer.h`.
//!
//! States: `Init -> WaitCwd -> [WaitList]? -> [Size]? -> [Mdtm]? ->
//! [FileExists]? -> [ResumeTest]? -> Transfer -> [Mfmt]?`. A directory
//! listing (cached or freshly fetched) supplies the remote entry's size and
//! mtime when available; a server that doesn't report either through its
//! listing format is probed directly with `SIZE`/`MDTM` instead. Once the
//! remote state is known and the local file already exists, the host is
//! asked how to proceed via `ctx.pending_file_exists_prompt`, the same
//! out-of-band handoff `Logon` uses for interactive-login challenges.

use std::path::PathBuf;

use crate::control::change_dir::ChangeDirOp;
use crate::control::list::ListOp;
use crate::control::raw_transfer::RawTransferOp;
use crate::control::{OpContext, OpData, OpOutcome};
use crate::notification::{FileExistsInfo, FileExistsReply};
use crate::reply::Reply;
use crate::server_info::ServerPath;
use crate::status::OpStatus;
use crate::transfer_socket::TransferMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    WaitList,
    Size,
    Mdtm,
    FileExists,
    ResumeTest,
    Transfer,
    Mfmt,
}

/// Per-transfer policy, supplied by the host alongside the local/remote
/// paths.
#[derive(Debug, Clone, Copy)]
pub struct FileTransferSettings {
    /// Transfer in binary (`TYPE I`) rather than ASCII (`TYPE A`) mode.
    pub binary: bool,
    /// Attempt to resume a partial local download, or append to a partial
    /// remote upload, rather than overwriting from byte zero.
    pub resume: bool,
    /// Issue `MFMT` after a successful upload to preserve the local file's
    /// mtime on the server.
    pub preserve_mtime: bool,
}

impl Default for FileTransferSettings {
    fn default() -> Self {
        FileTransferSettings { binary: true, resume: false, preserve_mtime: false }
    }
}

/// Transfers one file between `local_path` and `dir`/`remote_name`.
pub struct FileTransferOp {
    state: State,
    dir: ServerPath,
    remote_name: String,
    local_path: PathBuf,
    download: bool,
    settings: FileTransferSettings,
    listed: bool,
    remote_size: Option<u64>,
    remote_mtime: Option<chrono::DateTime<chrono::Utc>>,
    local_size: Option<u64>,
    resume_offset: u64,
    created_local_file: bool,
}

impl FileTransferOp {
    /// Builds a `FileTransfer` op. `download` selects `RETR` (true) vs.
    /// `STOR`/`APPE` (false, chosen by `settings.resume`).
    pub fn new(dir: ServerPath, remote_name: impl Into<String>, local_path: PathBuf, download: bool, settings: FileTransferSettings) -> Self {
        FileTransferOp {
            state: State::Init,
            dir,
            remote_name: remote_name.into(),
            local_path,
            download,
            settings,
            listed: false,
            remote_size: None,
            remote_mtime: None,
            local_size: None,
            resume_offset: 0,
            created_local_file: false,
        }
    }

    fn remote_arg(&self) -> String {
        self.dir.format_filename(&self.remote_name, true)
    }

    fn local_metadata(&self) -> Option<std::fs::Metadata> {
        std::fs::metadata(&self.local_path).ok()
    }

    fn decide_after_remote_lookup(&mut self) -> OpOutcome {
        self.local_size = self.local_metadata().map(|m| m.len());
        let remote_exists = self.remote_size.is_some();
        if self.download && !remote_exists {
            return OpOutcome::Done(OpStatus::ERROR);
        }
        let local_exists = self.local_size.is_some();
        if (self.download && local_exists) || (!self.download && remote_exists) {
            self.state = State::FileExists;
            OpOutcome::Continue
        } else if self.settings.resume && self.download {
            self.state = State::ResumeTest;
            OpOutcome::Continue
        } else {
            self.state = State::Transfer;
            OpOutcome::Continue
        }
    }
}

impl OpData for FileTransferOp {
    fn name(&self) -> &'static str {
        "file_transfer"
    }

    fn send(&mut self, ctx: &mut OpContext) -> OpOutcome {
        match self.state {
            State::Init => OpOutcome::Push(Box::new(ChangeDirOp::to(self.dir.clone()))),
            State::WaitList => {
                if let Some(listing) = ctx.shared.directory_cache.lookup(&ctx.server, &self.dir) {
                    if !listing.is_unsure() {
                        if let Some(entry) = listing.find(&self.remote_name) {
                            self.remote_size = Some(entry.size);
                            self.remote_mtime = entry.mtime;
                        }
                        self.state = State::Size;
                        return OpOutcome::Continue;
                    }
                }
                if self.listed {
                    self.state = State::Size;
                    return OpOutcome::Continue;
                }
                self.listed = true;
                OpOutcome::Push(Box::new(ListOp::new(self.dir.clone())))
            }
            State::Size => {
                if self.remote_size.is_some() {
                    self.state = State::Mdtm;
                    return OpOutcome::Continue;
                }
                OpOutcome::SendCommand(format!("SIZE {}", self.remote_arg()))
            }
            State::Mdtm => {
                if self.remote_mtime.is_some() || self.remote_size.is_none() {
                    return self.decide_after_remote_lookup();
                }
                OpOutcome::SendCommand(format!("MDTM {}", self.remote_arg()))
            }
            State::FileExists => {
                if ctx.pending_file_exists_prompt.is_some() {
                    return OpOutcome::Suspend;
                }
                let Some(reply) = ctx.file_exists_reply.take() else {
                    ctx.pending_file_exists_prompt = Some(FileExistsInfo {
                        local_path: self.local_path.clone(),
                        local_size: self.local_size,
                        remote_size: self.remote_size,
                        remote_mtime: self.remote_mtime,
                    });
                    return OpOutcome::Suspend;
                };
                match reply {
                    FileExistsReply::Skip => OpOutcome::Done(OpStatus::CANCELED),
                    FileExistsReply::Overwrite => {
                        self.resume_offset = 0;
                        self.state = State::Transfer;
                        OpOutcome::Continue
                    }
                    FileExistsReply::Resume => {
                        if self.download && self.settings.binary {
                            self.state = State::ResumeTest;
                        } else {
                            self.resume_offset = if self.download { self.local_size.unwrap_or(0) } else { self.remote_size.unwrap_or(0) };
                            self.state = State::Transfer;
                        }
                        OpOutcome::Continue
                    }
                }
            }
            State::ResumeTest => {
                let offset = if self.download {
                    self.local_size.unwrap_or(0).saturating_sub(1)
                } else {
                    self.remote_size.unwrap_or(0).saturating_sub(1)
                };
                OpOutcome::Push(Box::new(RawTransferOp::new("RETR".to_string(), TransferMode::ResumeTest, self.settings.binary, offset)))
            }
            State::Transfer => {
                let command = if self.download {
                    format!("RETR {}", self.remote_arg())
                } else if self.resume_offset > 0 {
                    format!("APPE {}", self.remote_arg())
                } else {
                    format!("STOR {}", self.remote_arg())
                };
                let mode = if self.download {
                    if self.resume_offset == 0 {
                        if let Some(parent) = self.local_path.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        self.created_local_file = true;
                    }
                    TransferMode::Download { local_path: self.local_path.clone(), resume_offset: self.resume_offset }
                } else {
                    TransferMode::Upload { local_path: self.local_path.clone(), resume_offset: self.resume_offset }
                };
                OpOutcome::Push(Box::new(RawTransferOp::new(command, mode, self.settings.binary, self.resume_offset)))
            }
            State::Mfmt => {
                let Some(mtime) = self.remote_mtime else {
                    return OpOutcome::Done(OpStatus::OK);
                };
                OpOutcome::SendCommand(format!("MFMT {} {}", mtime.format("%Y%m%d%H%M%S"), self.remote_arg()))
            }
        }
    }

    fn parse_response(&mut self, _ctx: &mut OpContext, reply: &Reply) -> OpOutcome {
        match self.state {
            State::Size => {
                if reply.class() == 2 {
                    self.remote_size = reply.last_line().split_whitespace().next().and_then(|s| s.parse().ok());
                }
                self.state = State::Mdtm;
                OpOutcome::Continue
            }
            State::Mdtm => {
                if reply.class() == 2 {
                    let digits: String = reply.last_line().chars().take_while(|c| c.is_ascii_digit()).collect();
                    if digits.len() >= 14 {
                        self.remote_mtime = chrono::NaiveDateTime::parse_from_str(&digits[..14], "%Y%m%d%H%M%S")
                            .ok()
                            .map(|ndt| chrono::DateTime::from_naive_utc_and_offset(ndt, chrono::Utc));
                    }
                }
                self.decide_after_remote_lookup()
            }
            State::Mfmt => OpOutcome::Done(OpStatus::OK),
            State::Init | State::WaitList | State::FileExists | State::ResumeTest | State::Transfer => {
                OpOutcome::Done(OpStatus::ERROR | OpStatus::INTERNAL)
            }
        }
    }

    fn subcommand_result(&mut self, ctx: &mut OpContext, result: OpStatus) -> OpOutcome {
        match self.state {
            State::Init => {
                if result.is_ok() {
                    self.state = State::WaitList;
                    OpOutcome::Continue
                } else {
                    OpOutcome::Done(result)
                }
            }
            State::WaitList => {
                self.state = State::Size;
                OpOutcome::Continue
            }
            State::ResumeTest => {
                if result.is_ok() {
                    self.state = State::Transfer;
                } else {
                    self.resume_offset = 0;
                    self.state = State::Transfer;
                }
                OpOutcome::Continue
            }
            State::Transfer => {
                let download_failed_with_no_bytes = self.download
                    && !result.is_ok()
                    && ctx.last_transfer_result.as_ref().is_none_or(|r| r.bytes_transferred == 0);
                if download_failed_with_no_bytes && self.created_local_file {
                    let _ = std::fs::remove_file(&self.local_path);
                }
                if !result.is_ok() {
                    return OpOutcome::Done(result);
                }
                ctx.shared.directory_cache.mark_unknown(&ctx.server, &self.dir, &self.remote_name);
                if !self.download && self.settings.preserve_mtime {
                    if let Ok(metadata) = std::fs::metadata(&self.local_path) {
                        if let Ok(modified) = metadata.modified() {
                            self.remote_mtime = Some(chrono::DateTime::<chrono::Utc>::from(modified));
                            self.state = State::Mfmt;
                            return OpOutcome::Continue;
                        }
                    }
                }
                OpOutcome::Done(OpStatus::OK)
            }
            _ => OpOutcome::Done(result),
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
    fn download_of_missing_remote_file_fails_fast() {
        let dir = ServerPath::parse("/pub", ServerType::Default).unwrap();
        let mut op = FileTransferOp::new(dir, "missing.bin", PathBuf::from("/tmp/missing.bin"), true, FileTransferSettings::default());
        let mut c = ctx();
        op.subcommand_result(&mut c, OpStatus::OK); // Init -> WaitList
        op.subcommand_result(&mut c, OpStatus::OK); // WaitList -> Size (no cache entry)
        assert!(matches!(op.send(&mut c), OpOutcome::SendCommand(cmd) if cmd.starts_with("SIZE")));
        let outcome = op.parse_response(&mut c, &Reply::single(550, "not found"));
        assert!(matches!(outcome, OpOutcome::Done(status) if status.is_error()));
    }

    #[test]
    fn upload_of_new_file_skips_file_exists_prompt() {
        let dir = ServerPath::parse("/pub", ServerType::Default).unwrap();
        let mut op = FileTransferOp::new(dir, "new.bin", PathBuf::from("/dev/null"), false, FileTransferSettings::default());
        let mut c = ctx();
        op.subcommand_result(&mut c, OpStatus::OK);
        op.subcommand_result(&mut c, OpStatus::OK);
        op.send(&mut c); // Size -> sends SIZE
        let outcome = op.parse_response(&mut c, &Reply::single(550, "not found"));
        assert!(matches!(outcome, OpOutcome::Continue)); // Size -> Mdtm
        let outcome = op.send(&mut c); // Mdtm short-circuits: SIZE already failed, no point probing MDTM
        assert!(matches!(outcome, OpOutcome::Continue)); // -> Transfer
        let outcome = op.send(&mut c);
        assert!(matches!(outcome, OpOutcome::Push(_)));
    }
}
